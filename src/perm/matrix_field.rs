//! Edits to permission-matrix fields.
//!
//! A session may only hand out permissions it could delegate itself; the
//! supergash persona bypasses the check.

use super::{PermEntry, PermKey, PermMatrix};
use crate::error::{DbError, DbResult};
use crate::field::FieldValue;
use crate::object::{EditObject, ObjectView};
use crate::returnval::{FailureKind, ReturnVal};
use crate::schema::constants::{ROLE_DEFAULT_MATRIX, ROLE_MATRIX};
use crate::schema::{FieldDef, FieldKind, ObjectTypeDef, Schema};
use tracing::debug;

/// Which of a role's two matrices a field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatrixRole {
    /// Applied to objects the role holder owns.
    Owned,
    /// Applied to every other object.
    Default,
}

impl MatrixRole {
    pub fn for_field(field: u16) -> Self {
        if field == ROLE_DEFAULT_MATRIX {
            MatrixRole::Default
        } else {
            MatrixRole::Owned
        }
    }

    pub fn field_id(self) -> u16 {
        match self {
            MatrixRole::Owned => ROLE_MATRIX,
            MatrixRole::Default => ROLE_DEFAULT_MATRIX,
        }
    }
}

/// Checks that `entry` fits inside what the granting session can delegate
/// for `key`. On failure returns the bits that exceed it.
pub fn check_grant(
    supergash: bool,
    delegatable: &PermMatrix,
    key: PermKey,
    entry: PermEntry,
) -> Result<(), PermEntry> {
    if supergash {
        return Ok(());
    }
    let cap = delegatable.effective(key);
    if entry.is_subset_of(cap) {
        Ok(())
    } else {
        Err(PermEntry::from_bits(entry.bits() & !cap.bits()))
    }
}

/// Context for one matrix edit.
pub struct MatrixEnv<'a> {
    pub def: &'a FieldDef,
    pub schema: &'a Schema,
    pub writable: bool,
    pub supergash: bool,
    /// What the editing session may delegate for this matrix's role.
    pub delegatable: &'a PermMatrix,
}

impl MatrixEnv<'_> {
    fn refuse(&self, obj: &EditObject) -> Option<ReturnVal> {
        let title = format!("Cannot change {}", self.def.name);
        if obj.is_committing() {
            return Some(ReturnVal::failure(
                FailureKind::NotEditable,
                title,
                format!("{} is already committing", obj.invid()),
            ));
        }
        if !self.writable {
            return Some(ReturnVal::failure(
                FailureKind::PermissionDenied,
                title,
                format!("no write permission for {} on {}", self.def.name, obj.invid()),
            ));
        }
        None
    }
}

fn matrix_mut<'o>(obj: &'o mut EditObject, def: &FieldDef) -> DbResult<&'o mut PermMatrix> {
    let invid = obj.invid();
    if def.kind != FieldKind::PermMatrix {
        return Err(DbError::InvalidArgument(format!(
            "field {} of {invid} is not a permission matrix",
            def.name
        )));
    }
    match obj.ensure_field(def).value_mut() {
        FieldValue::Matrix(m) => Ok(m),
        _ => Err(DbError::ShadowInvariant {
            invid,
            message: format!("matrix field {} holds a non-matrix value", def.id),
        }),
    }
}

/// Entry stored in a matrix field for `key`, with object-level inheritance.
pub fn get_perm(obj: &dyn ObjectView, field: u16, key: PermKey) -> PermEntry {
    obj.field_value(field)
        .and_then(FieldValue::as_matrix)
        .map(|m| m.effective(key))
        .unwrap_or_default()
}

pub fn set_perm(env: &MatrixEnv<'_>, obj: &mut EditObject, key: PermKey, entry: PermEntry) -> DbResult<ReturnVal> {
    if let Some(refused) = env.refuse(obj) {
        return Ok(refused);
    }
    if !env.schema.perm_key_valid(key) {
        return Err(DbError::field_not_found(key.type_id, key.field.unwrap_or_default()));
    }
    if let Err(excess) = check_grant(env.supergash, env.delegatable, key, entry) {
        return Ok(ReturnVal::failure(
            FailureKind::PermissionDenied,
            "Permissions error",
            format!(
                "cannot grant {} on {}: exceeds delegatable permissions by {}",
                entry,
                env.schema.describe_key(key),
                excess
            ),
        ));
    }
    debug!(invid = %obj.invid(), key = %key, entry = %entry, "set permission entry");
    matrix_mut(obj, env.def)?.set_perm(key, entry);
    Ok(ReturnVal::success())
}

/// Sets `entry` on every field of `type_def`. Builtin fields are skipped
/// unless `include_builtins`. Refuses the whole batch if any entry exceeds
/// the session's delegatable permissions.
pub fn set_field_perms(
    env: &MatrixEnv<'_>,
    obj: &mut EditObject,
    type_def: &ObjectTypeDef,
    entry: PermEntry,
    include_builtins: bool,
) -> DbResult<ReturnVal> {
    if let Some(refused) = env.refuse(obj) {
        return Ok(refused);
    }
    let keys: Vec<PermKey> = type_def
        .fields()
        .filter(|f| include_builtins || !f.builtin)
        .map(|f| PermKey::field(type_def.id, f.id))
        .collect();
    for key in &keys {
        if let Err(excess) = check_grant(env.supergash, env.delegatable, *key, entry) {
            return Ok(ReturnVal::failure(
                FailureKind::PermissionDenied,
                "Permissions error",
                format!(
                    "cannot grant {} on {}: exceeds delegatable permissions by {}",
                    entry,
                    env.schema.describe_key(*key),
                    excess
                ),
            ));
        }
    }
    let matrix = matrix_mut(obj, env.def)?;
    for key in keys {
        matrix.set_perm(key, entry);
    }
    Ok(ReturnVal::success())
}

pub fn reset_perms(env: &MatrixEnv<'_>, obj: &mut EditObject) -> DbResult<ReturnVal> {
    if let Some(refused) = env.refuse(obj) {
        return Ok(refused);
    }
    matrix_mut(obj, env.def)?.reset();
    Ok(ReturnVal::success())
}

/// Drops entries orphaned by schema edits. Returns the number removed.
pub fn clean(matrix: &mut PermMatrix, schema: &Schema) -> usize {
    matrix.retain_valid(|key| schema.perm_key_valid(key))
}

/// Audit text for a matrix change, naming types and fields.
pub fn describe_diff(newer: &PermMatrix, older: &PermMatrix, schema: &Schema) -> Option<String> {
    newer.diff(older, |key| schema.describe_key(key))
}
