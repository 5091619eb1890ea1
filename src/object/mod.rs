pub mod behavior;
pub mod builtin;
pub mod remove;

use crate::error::{DbError, DbResult};
use crate::field::codec::{self, ByteReader};
use crate::field::{DbField, FieldCheckpoint, FieldValue, Value};
use crate::invid::Invid;
use crate::schema::constants::{OWNER_LIST_FIELD, REMOVAL_FIELD};
use crate::schema::{FieldDef, ObjectTypeDef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub use behavior::{DefaultBehavior, HookContext, ObjectTypeBehavior, VerifyOutcome, WizardOutcome};

/// Lifecycle of an edit shadow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ObjectStatus {
    Creating,
    Editing,
    Deleting,
    /// Created and removed inside the same transaction.
    Dropping,
}

impl ObjectStatus {
    pub fn code(self) -> u8 {
        match self {
            ObjectStatus::Creating => 1,
            ObjectStatus::Editing => 2,
            ObjectStatus::Deleting => 3,
            ObjectStatus::Dropping => 4,
        }
    }

    pub fn from_code(code: u8) -> DbResult<Self> {
        match code {
            1 => Ok(ObjectStatus::Creating),
            2 => Ok(ObjectStatus::Editing),
            3 => Ok(ObjectStatus::Deleting),
            4 => Ok(ObjectStatus::Dropping),
            other => Err(DbError::UnknownStatus(other)),
        }
    }

    pub fn is_removal(self) -> bool {
        matches!(self, ObjectStatus::Deleting | ObjectStatus::Dropping)
    }
}

/// Read access shared by stored records and edit shadows.
pub trait ObjectView {
    fn invid(&self) -> Invid;

    fn field(&self, id: u16) -> Option<&DbField>;

    fn field_ids(&self) -> Vec<u16>;

    fn type_id(&self) -> u16 {
        self.invid().type_id()
    }

    fn field_value(&self, id: u16) -> Option<&FieldValue> {
        self.field(id).map(DbField::value)
    }

    fn is_defined(&self, id: u16) -> bool {
        self.field(id).is_some_and(DbField::is_defined)
    }

    fn scalar(&self, id: u16) -> Option<&Value> {
        self.field_value(id).and_then(FieldValue::as_scalar)
    }

    fn elements(&self, id: u16) -> &[Value] {
        self.field_value(id).map(FieldValue::as_vector).unwrap_or(&[])
    }

    /// Invids held in a scalar or vector invid field.
    fn invids(&self, id: u16) -> Vec<Invid> {
        self.field_value(id)
            .map(|v| v.values().into_iter().filter_map(Value::as_invid).collect())
            .unwrap_or_default()
    }

    fn owners(&self) -> Vec<Invid> {
        self.invids(OWNER_LIST_FIELD)
    }

    fn removal_date(&self) -> Option<i64> {
        self.scalar(REMOVAL_FIELD).and_then(Value::as_date)
    }

    fn label(&self, def: &ObjectTypeDef) -> String {
        def.label_field
            .and_then(|f| self.scalar(f))
            .and_then(Value::as_text)
            .map_or_else(|| self.invid().to_string(), str::to_string)
    }
}

/// A committed record, shared read-only between sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbObject {
    invid: Invid,
    fields: BTreeMap<u16, DbField>,
}

impl PartialEq for DbObject {
    fn eq(&self, other: &Self) -> bool {
        self.invid == other.invid && self.fields == other.fields
    }
}

impl DbObject {
    pub fn new(invid: Invid) -> Self {
        Self {
            invid,
            fields: BTreeMap::new(),
        }
    }

    /// Builds a record from fields, pruning undefined ones.
    pub fn from_fields(invid: Invid, fields: impl IntoIterator<Item = DbField>) -> Self {
        let fields = fields
            .into_iter()
            .filter(DbField::is_defined)
            .map(|f| (f.id(), f))
            .collect();
        Self { invid, fields }
    }

    pub fn fields(&self) -> impl Iterator<Item = &DbField> {
        self.fields.values()
    }

    pub(crate) fn drop_field(&mut self, id: u16) {
        self.fields.remove(&id);
    }

    pub fn emit(&self, out: &mut Vec<u8>) -> DbResult<()> {
        codec::emit_object(self.invid, self.fields.values(), out)
    }

    pub fn receive(reader: &mut ByteReader<'_>) -> DbResult<Self> {
        let (invid, fields) = codec::receive_object(reader)?;
        Ok(Self::from_fields(invid, fields))
    }

    pub fn to_snapshot_bytes(&self) -> DbResult<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| DbError::Encode(e.to_string()))
    }

    pub fn from_snapshot_bytes(bytes: &[u8]) -> DbResult<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| DbError::Decode(e.to_string()))
    }
}

impl ObjectView for DbObject {
    fn invid(&self) -> Invid {
        self.invid
    }

    fn field(&self, id: u16) -> Option<&DbField> {
        self.fields.get(&id)
    }

    fn field_ids(&self) -> Vec<u16> {
        self.fields.keys().copied().collect()
    }
}

/// Whole-object saved state: each present field's own checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectCheckpoint {
    fields: BTreeMap<u16, FieldCheckpoint>,
}

/// Transaction-private mutable copy of a record.
#[derive(Debug, Clone)]
pub struct EditObject {
    invid: Invid,
    original: Option<Arc<DbObject>>,
    status: ObjectStatus,
    committing: bool,
    deleting: bool,
    fields: BTreeMap<u16, DbField>,
}

impl EditObject {
    /// Shadow of a stored record. Fields present in the record are copied;
    /// schema fields it lacks get empty containers when `instantiate` allows.
    pub fn checkout(
        original: Arc<DbObject>,
        def: &ObjectTypeDef,
        mut instantiate: impl FnMut(&FieldDef) -> bool,
    ) -> Self {
        let mut fields: BTreeMap<u16, DbField> = original
            .fields
            .iter()
            .filter(|(id, _)| def.has_field(**id))
            .map(|(id, f)| (*id, f.clone()))
            .collect();
        for field_def in def.fields() {
            if !fields.contains_key(&field_def.id) && instantiate(field_def) {
                fields.insert(field_def.id, DbField::new(field_def));
            }
        }
        Self {
            invid: original.invid,
            original: Some(original),
            status: ObjectStatus::Editing,
            committing: false,
            deleting: false,
            fields,
        }
    }

    pub fn create(
        invid: Invid,
        def: &ObjectTypeDef,
        mut instantiate: impl FnMut(&FieldDef) -> bool,
    ) -> Self {
        let fields = def
            .fields()
            .filter(|f| instantiate(f))
            .map(|f| (f.id, DbField::new(f)))
            .collect();
        Self {
            invid,
            original: None,
            status: ObjectStatus::Creating,
            committing: false,
            deleting: false,
            fields,
        }
    }

    pub fn original(&self) -> Option<&Arc<DbObject>> {
        self.original.as_ref()
    }

    pub fn status(&self) -> ObjectStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: ObjectStatus) {
        self.status = status;
    }

    pub fn is_committing(&self) -> bool {
        self.committing
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting
    }

    pub(crate) fn set_deleting(&mut self, deleting: bool) {
        self.deleting = deleting;
    }

    /// Marks the shadow as committing; no field may change afterwards.
    pub(crate) fn begin_commit(&mut self) {
        self.committing = true;
    }

    /// Undoes [`Self::begin_commit`] when the transaction is not finished.
    pub(crate) fn release(&mut self) {
        self.committing = false;
    }

    pub fn field_mut(&mut self, id: u16) -> Option<&mut DbField> {
        self.fields.get_mut(&id)
    }

    /// Container for `def`, created empty if this shadow lacked it.
    pub(crate) fn ensure_field(&mut self, def: &FieldDef) -> &mut DbField {
        self.fields
            .entry(def.id)
            .or_insert_with(|| DbField::new(def))
    }

    pub fn checkpoint(&self) -> ObjectCheckpoint {
        ObjectCheckpoint {
            fields: self
                .fields
                .iter()
                .map(|(id, f)| (*id, f.checkpoint()))
                .collect(),
        }
    }

    /// Replays every field's checkpoint. Fields created after the checkpoint
    /// are dropped; fields dropped since are restored.
    pub fn rollback(&mut self, ckp: ObjectCheckpoint) -> DbResult<()> {
        let invid = self.invid;
        self.fields.retain(|id, _| ckp.fields.contains_key(id));
        for (id, token) in ckp.fields {
            match self.fields.get_mut(&id) {
                Some(field) => field.rollback(invid, token)?,
                None => {
                    self.fields.insert(id, token.into_field(id));
                }
            }
        }
        Ok(())
    }

    /// The committed form of this shadow, without undefined fields.
    pub fn to_stored(&self) -> DbObject {
        DbObject::from_fields(self.invid, self.fields.values().cloned())
    }

    /// Labels of required fields that are undefined.
    pub fn missing_required_fields(&self, def: &ObjectTypeDef, ctx: &HookContext<'_>) -> Vec<String> {
        let behavior = def.behavior();
        def.custom_fields()
            .filter(|f| behavior.field_required(ctx, self, f))
            .filter(|f| !self.is_defined(f.id))
            .map(|f| f.name.to_string())
            .collect()
    }
}

impl ObjectView for EditObject {
    fn invid(&self) -> Invid {
        self.invid
    }

    fn field(&self, id: u16) -> Option<&DbField> {
        self.fields.get(&id)
    }

    fn field_ids(&self) -> Vec<u16> {
        self.fields.keys().copied().collect()
    }
}
