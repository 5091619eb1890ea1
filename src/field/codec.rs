//! Self-delimiting field encoding and the checksummed object frame.
//!
//! Field layout: `id:u16 shape:u8` then
//! - scalar: `present:u8 [value]`
//! - vector: `count:u32 value*`
//! - secret: `present:u8 [salt_len:u16 salt digest_len:u16 digest]`
//! - matrix: `count:u32 (type:u16 has_field:u8 [field:u16] bits:u8)*`
//!
//! Object frame: `body_len:u32 type:u16 num:u32 field_count:u16 field* crc32c:u32`,
//! all integers big-endian, crc over every preceding byte of the frame.

use super::{DbField, FieldValue, SecretHash, Value};
use crate::error::{DbError, DbResult};
use crate::invid::Invid;
use crate::perm::{PermEntry, PermKey, PermMatrix};
use compact_str::CompactString;
use crc32c::crc32c;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const SHAPE_SCALAR: u8 = 0;
const SHAPE_VECTOR: u8 = 1;
const SHAPE_SECRET: u8 = 2;
const SHAPE_MATRIX: u8 = 3;

const TAG_TEXT: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_BOOL: u8 = 4;
const TAG_DATE: u8 = 5;
const TAG_INVID: u8 = 6;
const TAG_IPV4: u8 = 7;
const TAG_IPV6: u8 = 8;

pub const MAX_FRAME_BODY_BYTES: usize = 16 * 1024 * 1024;

pub fn emit_field(field: &DbField, out: &mut Vec<u8>) -> DbResult<()> {
    out.extend_from_slice(&field.id().to_be_bytes());
    match field.value() {
        FieldValue::Scalar(v) => {
            out.push(SHAPE_SCALAR);
            match v {
                Some(v) => {
                    out.push(1);
                    emit_value(v, out)?;
                }
                None => out.push(0),
            }
        }
        FieldValue::Vector(vs) => {
            out.push(SHAPE_VECTOR);
            out.extend_from_slice(&len_u32(vs.len())?.to_be_bytes());
            for v in vs {
                emit_value(v, out)?;
            }
        }
        FieldValue::Secret(s) => {
            out.push(SHAPE_SECRET);
            match s {
                Some(hash) => {
                    out.push(1);
                    emit_short_bytes(hash.salt(), out)?;
                    emit_short_bytes(hash.digest().as_bytes(), out)?;
                }
                None => out.push(0),
            }
        }
        FieldValue::Matrix(m) => {
            out.push(SHAPE_MATRIX);
            out.extend_from_slice(&len_u32(m.len())?.to_be_bytes());
            for (key, entry) in m.iter() {
                out.extend_from_slice(&key.type_id.to_be_bytes());
                match key.field {
                    Some(f) => {
                        out.push(1);
                        out.extend_from_slice(&f.to_be_bytes());
                    }
                    None => out.push(0),
                }
                out.push(entry.bits());
            }
        }
    }
    Ok(())
}

pub fn receive_field(reader: &mut ByteReader<'_>) -> DbResult<DbField> {
    let id = reader.u16()?;
    let value = match reader.u8()? {
        SHAPE_SCALAR => FieldValue::Scalar(match reader.u8()? {
            0 => None,
            _ => Some(receive_value(reader)?),
        }),
        SHAPE_VECTOR => {
            let count = reader.u32()? as usize;
            let mut values = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                values.push(receive_value(reader)?);
            }
            FieldValue::Vector(values)
        }
        SHAPE_SECRET => FieldValue::Secret(match reader.u8()? {
            0 => None,
            _ => {
                let salt = reader.short_bytes()?.to_vec();
                let digest = std::str::from_utf8(reader.short_bytes()?)
                    .map_err(|e| DbError::Decode(format!("secret digest: {e}")))?
                    .to_string();
                Some(SecretHash::from_parts(salt, digest))
            }
        }),
        SHAPE_MATRIX => {
            let count = reader.u32()?;
            let mut matrix = PermMatrix::new();
            for _ in 0..count {
                let type_id = reader.u16()?;
                let field = match reader.u8()? {
                    0 => None,
                    _ => Some(reader.u16()?),
                };
                let bits = reader.u8()?;
                matrix.set_perm(PermKey { type_id, field }, PermEntry::from_bits(bits));
            }
            FieldValue::Matrix(matrix)
        }
        other => return Err(DbError::Decode(format!("unknown field shape {other}"))),
    };
    Ok(DbField::with_value(id, value))
}

fn emit_value(value: &Value, out: &mut Vec<u8>) -> DbResult<()> {
    match value {
        Value::Text(s) => {
            out.push(TAG_TEXT);
            out.extend_from_slice(&len_u32(s.len())?.to_be_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Int(v) => {
            out.push(TAG_INT);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Value::Float(v) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        Value::Bool(v) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*v));
        }
        Value::Date(v) => {
            out.push(TAG_DATE);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Value::Invid(invid) => {
            out.push(TAG_INVID);
            out.extend_from_slice(&invid.type_id().to_be_bytes());
            out.extend_from_slice(&invid.num().to_be_bytes());
        }
        Value::Ip(IpAddr::V4(ip)) => {
            out.push(TAG_IPV4);
            out.extend_from_slice(&ip.octets());
        }
        Value::Ip(IpAddr::V6(ip)) => {
            out.push(TAG_IPV6);
            out.extend_from_slice(&ip.octets());
        }
    }
    Ok(())
}

fn receive_value(reader: &mut ByteReader<'_>) -> DbResult<Value> {
    Ok(match reader.u8()? {
        TAG_TEXT => {
            let len = reader.u32()? as usize;
            let bytes = reader.take(len)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|e| DbError::Decode(format!("text value: {e}")))?;
            Value::Text(CompactString::from(s))
        }
        TAG_INT => Value::Int(i64::from_be_bytes(reader.array()?)),
        TAG_FLOAT => Value::Float(f64::from_bits(u64::from_be_bytes(reader.array()?))),
        TAG_BOOL => Value::Bool(reader.u8()? != 0),
        TAG_DATE => Value::Date(i64::from_be_bytes(reader.array()?)),
        TAG_INVID => {
            let type_id = reader.u16()?;
            let num = reader.u32()?;
            Value::Invid(Invid::new(type_id, num))
        }
        TAG_IPV4 => Value::Ip(IpAddr::V4(Ipv4Addr::from(reader.array::<4>()?))),
        TAG_IPV6 => Value::Ip(IpAddr::V6(Ipv6Addr::from(reader.array::<16>()?))),
        other => return Err(DbError::Decode(format!("unknown value tag {other}"))),
    })
}

fn emit_short_bytes(bytes: &[u8], out: &mut Vec<u8>) -> DbResult<()> {
    let len = u16::try_from(bytes.len())
        .map_err(|_| DbError::Encode(format!("{} bytes exceed u16 length", bytes.len())))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn len_u32(len: usize) -> DbResult<u32> {
    u32::try_from(len).map_err(|_| DbError::Encode(format!("length {len} exceeds u32")))
}

/// Writes one object as a checksummed frame.
pub fn emit_object<'a>(
    invid: Invid,
    fields: impl IntoIterator<Item = &'a DbField>,
    out: &mut Vec<u8>,
) -> DbResult<()> {
    let mut body = Vec::new();
    body.extend_from_slice(&invid.type_id().to_be_bytes());
    body.extend_from_slice(&invid.num().to_be_bytes());
    let count_at = body.len();
    body.extend_from_slice(&[0, 0]);
    let mut count: u16 = 0;
    for field in fields {
        if !field.is_defined() {
            continue;
        }
        emit_field(field, &mut body)?;
        count = count
            .checked_add(1)
            .ok_or_else(|| DbError::Encode("too many fields in object".into()))?;
    }
    body[count_at..count_at + 2].copy_from_slice(&count.to_be_bytes());
    if body.len() + 4 > MAX_FRAME_BODY_BYTES {
        return Err(DbError::Encode(format!(
            "object {invid} frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    let body_len = len_u32(body.len() + 4)?;
    let start = out.len();
    out.extend_from_slice(&body_len.to_be_bytes());
    out.extend_from_slice(&body);
    let crc = crc32c(&out[start..]);
    out.extend_from_slice(&crc.to_be_bytes());
    Ok(())
}

/// Reads one object frame, verifying its checksum.
pub fn receive_object(reader: &mut ByteReader<'_>) -> DbResult<(Invid, Vec<DbField>)> {
    let frame_start = reader.pos;
    let body_len = reader.u32()? as usize;
    if body_len < 4 || body_len > MAX_FRAME_BODY_BYTES {
        return Err(DbError::Decode(format!("bad frame length {body_len}")));
    }
    let body = reader.take(body_len - 4)?;
    let covered = &reader.buf[frame_start..reader.pos];
    let expected = crc32c(covered);
    let actual = reader.u32()?;
    if expected != actual {
        return Err(DbError::Decode("object frame checksum mismatch".into()));
    }
    let mut inner = ByteReader::new(body);
    let type_id = inner.u16()?;
    let num = inner.u32()?;
    let count = inner.u16()?;
    let mut fields = Vec::with_capacity(count as usize);
    for _ in 0..count {
        fields.push(receive_field(&mut inner)?);
    }
    if !inner.is_empty() {
        return Err(DbError::Decode("trailing bytes in object frame".into()));
    }
    Ok((Invid::new(type_id, num), fields))
}

pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, len: usize) -> DbResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| DbError::Decode("truncated input".into()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> DbResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> DbResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> DbResult<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> DbResult<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn short_bytes(&mut self) -> DbResult<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }
}

#[cfg(test)]
mod tests {
    use super::{ByteReader, emit_field, emit_object, receive_field, receive_object};
    use crate::field::{DbField, FieldValue, SecretHash, Value};
    use crate::invid::Invid;
    use crate::perm::{PermEntry, PermKey, PermMatrix};
    use proptest::prelude::*;
    use std::net::IpAddr;

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            "\\PC{0,24}".prop_map(|s| Value::Text(s.into())),
            any::<i64>().prop_map(Value::Int),
            any::<f64>().prop_map(Value::Float),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Date),
            (any::<u16>(), any::<u32>()).prop_map(|(t, n)| Value::Invid(Invid::new(t, n))),
            any::<[u8; 4]>().prop_map(|b| Value::Ip(IpAddr::from(b))),
            any::<[u8; 16]>().prop_map(|b| Value::Ip(IpAddr::from(b))),
        ]
    }

    fn arb_field_value() -> impl Strategy<Value = FieldValue> {
        prop_oneof![
            prop::option::of(arb_value()).prop_map(FieldValue::Scalar),
            prop::collection::vec(arb_value(), 0..8).prop_map(FieldValue::Vector),
            prop::collection::vec(((0u16..4, prop::option::of(0u16..200)), 0u8..16), 0..6).prop_map(
                |pairs| {
                    let mut m = PermMatrix::new();
                    for ((type_id, field), bits) in pairs {
                        m.set_perm(PermKey { type_id, field }, PermEntry::from_bits(bits));
                    }
                    FieldValue::Matrix(m)
                }
            ),
        ]
    }

    proptest! {
        #[test]
        fn receive_inverts_emit(id in any::<u16>(), value in arb_field_value()) {
            let field = DbField::with_value(id, value);
            let mut bytes = Vec::new();
            emit_field(&field, &mut bytes).expect("emit");
            let mut reader = ByteReader::new(&bytes);
            let back = receive_field(&mut reader).expect("receive");
            prop_assert!(reader.is_empty());
            prop_assert_eq!(back.id(), id);
            prop_assert_eq!(back, field);
        }
    }

    #[test]
    fn secret_fields_keep_their_hash() {
        let hash = SecretHash::new("pw");
        let field = DbField::with_value(101, FieldValue::Secret(Some(hash)));
        let mut bytes = Vec::new();
        emit_field(&field, &mut bytes).expect("emit");
        let back = receive_field(&mut ByteReader::new(&bytes)).expect("receive");
        assert!(back.value().as_secret().expect("secret").verify("pw"));
    }

    #[test]
    fn object_frame_skips_undefined_fields_and_detects_corruption() {
        let fields = vec![
            DbField::with_value(100, FieldValue::Scalar(Some(Value::from("alice")))),
            DbField::with_value(101, FieldValue::Vector(vec![])),
        ];
        let invid = Invid::new(3, 12);
        let mut bytes = Vec::new();
        emit_object(invid, &fields, &mut bytes).expect("emit");

        let (back_invid, back) = receive_object(&mut ByteReader::new(&bytes)).expect("receive");
        assert_eq!(back_invid, invid);
        assert_eq!(back.len(), 1);
        assert_eq!(back[0], fields[0]);

        let last = bytes.len() - 6;
        bytes[last] ^= 0xff;
        assert!(receive_object(&mut ByteReader::new(&bytes)).is_err());
    }

    #[test]
    fn truncated_input_is_a_decode_error() {
        let field = DbField::with_value(100, FieldValue::Scalar(Some(Value::from("abc"))));
        let mut bytes = Vec::new();
        emit_field(&field, &mut bytes).expect("emit");
        bytes.truncate(bytes.len() - 1);
        let err = receive_field(&mut ByteReader::new(&bytes)).expect_err("truncated");
        assert_eq!(err.code_str(), "decode");
    }
}
