//! The standard removal sequence for an edit shadow.
//!
//! Fields are torn down through the same mutation paths clients use so that
//! namespace claims are released and back-references detached. The primary
//! field (the owner list, or the container on embedded types) goes last so
//! permission context survives while the others are cleared.

use super::{EditObject, ObjectStatus, ObjectView};
use crate::error::DbResult;
use crate::invid::Invid;
use crate::log::AuditEvent;
use crate::returnval::{FailureKind, ReturnVal};
use crate::schema::constants::OWNER_LIST_FIELD;
use crate::schema::{FieldDef, ObjectTypeDef};
use tracing::debug;

/// What [`finalize_remove`] needs from the transaction holding the shadow.
pub trait RemovalDriver {
    fn shadow(&self, invid: Invid) -> DbResult<&EditObject>;

    fn set_deleting(&mut self, invid: Invid, deleting: bool) -> DbResult<()>;

    fn set_status(&mut self, invid: Invid, status: ObjectStatus) -> DbResult<()>;

    /// Removes the element at `index`, with back-reference maintenance and
    /// without permission or interactive checks.
    fn delete_element(&mut self, invid: Invid, field: &FieldDef, index: usize) -> DbResult<ReturnVal>;

    /// Sets a scalar field to empty, same rules as [`Self::delete_element`].
    fn clear_scalar(&mut self, invid: Invid, field: &FieldDef) -> DbResult<ReturnVal>;

    /// Marks a secret or matrix field undefined.
    fn set_undefined(&mut self, invid: Invid, field: &FieldDef) -> DbResult<ReturnVal>;

    fn rollback(&mut self, checkpoint: &str) -> DbResult<()>;

    fn pop_checkpoint(&mut self, checkpoint: &str) -> DbResult<()>;

    fn log(&mut self, event: AuditEvent);
}

fn clear_field(driver: &mut dyn RemovalDriver, invid: Invid, def: &FieldDef) -> DbResult<ReturnVal> {
    if !def.kind.is_value_kind() {
        return driver.set_undefined(invid, def);
    }
    if !def.vector {
        if !driver.shadow(invid)?.is_defined(def.id) {
            return Ok(ReturnVal::success());
        }
        return driver.clear_scalar(invid, def);
    }
    let mut out = ReturnVal::success();
    loop {
        let len = driver.shadow(invid)?.elements(def.id).len();
        if len == 0 {
            return Ok(out);
        }
        let rv = driver.delete_element(invid, def, len - 1)?;
        if !rv.success {
            return Ok(out.merge(rv));
        }
        // A hook that reports success without shrinking the field would loop.
        if driver.shadow(invid)?.elements(def.id).len() >= len {
            return Ok(out.merge(ReturnVal::failure(
                FailureKind::HookRejected,
                "Removal failed",
                format!("{} on {invid} could not be cleared", def.name),
            )));
        }
        out = out.merge(rv);
    }
}

fn clear_all(driver: &mut dyn RemovalDriver, invid: Invid, type_def: &ObjectTypeDef) -> DbResult<ReturnVal> {
    let mut out = ReturnVal::success();
    let mut primary = None;
    for def in type_def.fields() {
        if def.id == OWNER_LIST_FIELD {
            primary = Some(def);
            continue;
        }
        let rv = clear_field(driver, invid, def)?;
        if !rv.success {
            return Ok(out.merge(rv));
        }
        out = out.merge(rv);
    }
    if let Some(def) = primary {
        let rv = clear_field(driver, invid, def)?;
        out = out.merge(rv);
    }
    Ok(out)
}

/// Completes a removal begun under `checkpoint`. With `success` false the
/// object is rolled back to the checkpoint. Otherwise every field is cleared,
/// the primary field last; any refusal rolls the whole removal back.
pub fn finalize_remove(
    driver: &mut dyn RemovalDriver,
    type_def: &ObjectTypeDef,
    invid: Invid,
    checkpoint: &str,
    success: bool,
) -> DbResult<ReturnVal> {
    if !success {
        driver.rollback(checkpoint)?;
        return Ok(ReturnVal::failure(
            FailureKind::NotRemovable,
            "Removal failed",
            format!("{invid} refused removal"),
        ));
    }

    let label = driver.shadow(invid)?.label(type_def);
    let status = match driver.shadow(invid)?.status() {
        ObjectStatus::Creating | ObjectStatus::Dropping => ObjectStatus::Dropping,
        ObjectStatus::Editing | ObjectStatus::Deleting => ObjectStatus::Deleting,
    };

    driver.set_deleting(invid, true)?;
    let cleared = clear_all(driver, invid, type_def);
    let reset = driver.set_deleting(invid, false);
    let cleared = cleared?;
    reset?;

    if !cleared.success {
        debug!(%invid, "removal rolled back");
        driver.rollback(checkpoint)?;
        let mut out = cleared;
        out.failure.get_or_insert(FailureKind::NotRemovable);
        return Ok(out);
    }

    driver.set_status(invid, status)?;
    driver.log(AuditEvent::ObjectRemoved { invid, label });
    driver.pop_checkpoint(checkpoint)?;
    let mut out = cleared;
    out.invid = Some(invid);
    Ok(out)
}
