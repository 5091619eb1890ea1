pub mod codec;
pub mod mutate;
pub mod value;

use crate::error::{DbError, DbResult};
use crate::invid::Invid;
use crate::perm::PermMatrix;
use crate::schema::{FieldDef, FieldKind};
use serde::{Deserialize, Serialize};

pub use mutate::{FieldOp, Prepared};
pub use value::{SecretHash, Value};

/// Contents of a field container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FieldValue {
    Scalar(Option<Value>),
    Vector(Vec<Value>),
    Secret(Option<SecretHash>),
    Matrix(PermMatrix),
}

impl FieldValue {
    pub fn empty_for(def: &FieldDef) -> Self {
        match def.kind {
            FieldKind::Secret => FieldValue::Secret(None),
            FieldKind::PermMatrix => FieldValue::Matrix(PermMatrix::new()),
            _ if def.vector => FieldValue::Vector(Vec::new()),
            _ => FieldValue::Scalar(None),
        }
    }

    pub fn is_defined(&self) -> bool {
        match self {
            FieldValue::Scalar(v) => v.is_some(),
            FieldValue::Vector(vs) => !vs.is_empty(),
            FieldValue::Secret(s) => s.is_some(),
            FieldValue::Matrix(m) => !m.is_empty(),
        }
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, FieldValue::Vector(_))
    }

    fn same_shape(&self, other: &FieldValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            FieldValue::Scalar(v) => v.as_ref(),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> &[Value] {
        match self {
            FieldValue::Vector(vs) => vs,
            _ => &[],
        }
    }

    pub fn as_matrix(&self) -> Option<&PermMatrix> {
        match self {
            FieldValue::Matrix(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_secret(&self) -> Option<&SecretHash> {
        match self {
            FieldValue::Secret(s) => s.as_ref(),
            _ => None,
        }
    }

    /// Every plain value held, in order.
    pub fn values(&self) -> Vec<&Value> {
        match self {
            FieldValue::Scalar(v) => v.iter().collect(),
            FieldValue::Vector(vs) => vs.iter().collect(),
            _ => Vec::new(),
        }
    }
}

/// Opaque saved state of one field, restorable with [`DbField::rollback`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldCheckpoint(FieldValue);

impl FieldCheckpoint {
    pub fn to_bytes(&self) -> DbResult<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| DbError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> DbResult<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| DbError::Decode(e.to_string()))
    }

    /// Rebuilds a container that no longer exists.
    pub(crate) fn into_field(self, id: u16) -> DbField {
        DbField::with_value(id, self.0)
    }
}

/// One field slot of an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbField {
    id: u16,
    value: FieldValue,
}

impl PartialEq for DbField {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl DbField {
    pub fn new(def: &FieldDef) -> Self {
        Self {
            id: def.id,
            value: FieldValue::empty_for(def),
        }
    }

    pub fn with_value(id: u16, value: FieldValue) -> Self {
        Self { id, value }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn value(&self) -> &FieldValue {
        &self.value
    }

    pub fn is_defined(&self) -> bool {
        self.value.is_defined()
    }

    pub fn is_vector(&self) -> bool {
        self.value.is_vector()
    }

    pub fn scalar(&self, owner: Invid) -> DbResult<Option<&Value>> {
        match &self.value {
            FieldValue::Scalar(v) => Ok(v.as_ref()),
            FieldValue::Vector(_) => Err(DbError::ScalarOnVector {
                invid: owner,
                field: self.id,
            }),
            _ => Ok(None),
        }
    }

    pub fn elements(&self, owner: Invid) -> DbResult<&[Value]> {
        match &self.value {
            FieldValue::Vector(vs) => Ok(vs),
            _ => Err(DbError::VectorOnScalar {
                invid: owner,
                field: self.id,
            }),
        }
    }

    pub fn contains(&self, value: &Value) -> bool {
        match &self.value {
            FieldValue::Scalar(v) => v.as_ref() == Some(value),
            FieldValue::Vector(vs) => vs.contains(value),
            _ => false,
        }
    }

    pub fn checkpoint(&self) -> FieldCheckpoint {
        FieldCheckpoint(self.value.clone())
    }

    /// Restores a checkpoint in place; the container itself is not replaced.
    pub fn rollback(&mut self, owner: Invid, token: FieldCheckpoint) -> DbResult<()> {
        if !self.value.same_shape(&token.0) {
            return Err(DbError::BadCheckpointToken {
                invid: owner,
                field: self.id,
            });
        }
        self.value = token.0;
        Ok(())
    }

    pub(crate) fn set_raw(&mut self, value: FieldValue) {
        self.value = value;
    }

    pub(crate) fn value_mut(&mut self) -> &mut FieldValue {
        &mut self.value
    }

    /// Resets to the empty value of the same shape.
    pub(crate) fn clear(&mut self) {
        self.value = match &self.value {
            FieldValue::Scalar(_) => FieldValue::Scalar(None),
            FieldValue::Vector(_) => FieldValue::Vector(Vec::new()),
            FieldValue::Secret(_) => FieldValue::Secret(None),
            FieldValue::Matrix(_) => FieldValue::Matrix(PermMatrix::new()),
        };
    }

    /// Audit text describing the change from `older` to `self`.
    pub fn diff(&self, older: Option<&DbField>) -> Option<String> {
        let empty = DbField {
            id: self.id,
            value: match &self.value {
                FieldValue::Scalar(_) => FieldValue::Scalar(None),
                FieldValue::Vector(_) => FieldValue::Vector(Vec::new()),
                FieldValue::Secret(_) => FieldValue::Secret(None),
                FieldValue::Matrix(_) => FieldValue::Matrix(PermMatrix::new()),
            },
        };
        let older = older.unwrap_or(&empty);
        if older.value == self.value {
            return None;
        }
        match (&older.value, &self.value) {
            (FieldValue::Vector(old), FieldValue::Vector(new)) => {
                let added: Vec<String> = new
                    .iter()
                    .filter(|v| !old.contains(v))
                    .map(ToString::to_string)
                    .collect();
                let removed: Vec<String> = old
                    .iter()
                    .filter(|v| !new.contains(v))
                    .map(ToString::to_string)
                    .collect();
                let mut parts = Vec::new();
                if !added.is_empty() {
                    parts.push(format!("added [{}]", added.join(", ")));
                }
                if !removed.is_empty() {
                    parts.push(format!("removed [{}]", removed.join(", ")));
                }
                if parts.is_empty() {
                    parts.push("reordered".to_string());
                }
                Some(parts.join("; "))
            }
            (FieldValue::Scalar(old), FieldValue::Scalar(new)) => Some(format!(
                "{} -> {}",
                old.as_ref().map_or("<none>".to_string(), ToString::to_string),
                new.as_ref().map_or("<none>".to_string(), ToString::to_string)
            )),
            (FieldValue::Secret(_), FieldValue::Secret(new)) => Some(if new.is_some() {
                "secret changed".to_string()
            } else {
                "secret cleared".to_string()
            }),
            (FieldValue::Matrix(old), FieldValue::Matrix(new)) => new.diff(old, |k| k.to_string()),
            _ => Some("value replaced".to_string()),
        }
    }
}
