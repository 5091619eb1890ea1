use crate::invid::Invid;
use crate::schema::FieldKind;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

/// A single field element.
///
/// Values are immutable once constructed; sequence checkpoints share them
/// between the live container and the saved copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Text(CompactString),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    Invid(Invid),
    Ip(IpAddr),
}

impl Value {
    pub fn text(s: impl Into<CompactString>) -> Self {
        Value::Text(s.into())
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            Value::Text(_) => FieldKind::Text,
            Value::Int(_) => FieldKind::Int,
            Value::Float(_) => FieldKind::Float,
            Value::Bool(_) => FieldKind::Bool,
            Value::Date(_) => FieldKind::Date,
            Value::Invid(_) => FieldKind::Invid,
            Value::Ip(_) => FieldKind::Ip,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_invid(&self) -> Option<Invid> {
        match self {
            Value::Invid(invid) => Some(*invid),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<i64> {
        match self {
            Value::Date(ms) => Some(*ms),
            _ => None,
        }
    }

    /// The key this value occupies in a namespace.
    pub fn namespace_key(&self, case_insensitive: bool) -> Value {
        match self {
            Value::Text(s) if case_insensitive => Value::Text(CompactString::from(s.to_lowercase())),
            other => other.clone(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Invid(a), Value::Invid(b)) => a == b,
            (Value::Ip(a), Value::Ip(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Text(s) => s.hash(state),
            Value::Int(v) | Value::Date(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Bool(v) => v.hash(state),
            Value::Invid(v) => v.hash(state),
            Value::Ip(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => write!(f, "{s}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Date(ms) => write!(f, "@{ms}"),
            Value::Invid(invid) => write!(f, "<{invid}>"),
            Value::Ip(ip) => write!(f, "{ip}"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(CompactString::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Invid> for Value {
    fn from(value: Invid) -> Self {
        Value::Invid(value)
    }
}

impl From<IpAddr> for Value {
    fn from(value: IpAddr) -> Self {
        Value::Ip(value)
    }
}

/// Salted SHA-256 of a secret. Plaintext is never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretHash {
    salt: Vec<u8>,
    digest: String,
}

impl SecretHash {
    pub fn new(plaintext: &str) -> Self {
        let salt = uuid::Uuid::new_v4().as_bytes().to_vec();
        let digest = digest_with_salt(&salt, plaintext);
        Self { salt, digest }
    }

    pub(crate) fn from_parts(salt: Vec<u8>, digest: String) -> Self {
        Self { salt, digest }
    }

    pub fn verify(&self, plaintext: &str) -> bool {
        digest_with_salt(&self.salt, plaintext) == self.digest
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

fn digest_with_salt(salt: &[u8], plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::{SecretHash, Value};
    use crate::schema::FieldKind;

    #[test]
    fn namespace_key_folds_only_text() {
        assert_eq!(
            Value::from("Alice").namespace_key(true),
            Value::from("alice")
        );
        assert_eq!(Value::from("Alice").namespace_key(false), Value::from("Alice"));
        assert_eq!(Value::Int(4).namespace_key(true), Value::Int(4));
    }

    #[test]
    fn float_equality_is_bitwise() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
        assert_eq!(Value::Float(1.5).kind(), FieldKind::Float);
    }

    #[test]
    fn secret_hash_verifies_and_salts() {
        let a = SecretHash::new("hunter2");
        let b = SecretHash::new("hunter2");
        assert!(a.verify("hunter2"));
        assert!(!a.verify("hunter3"));
        assert_ne!(a.digest(), b.digest());
    }
}
