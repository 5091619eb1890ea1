use super::{EditObject, ObjectView};
use crate::field::{FieldOp, FieldValue, Value};
use crate::invid::Invid;
use crate::namespace::TxnId;
use crate::perm::PermEntry;
use crate::returnval::{RescanHints, ReturnVal};
use crate::schema::FieldDef;
use crate::store::DbStore;

/// What a hook sees of the acting session.
pub struct HookContext<'a> {
    pub store: &'a DbStore,
    pub username: &'a str,
    pub persona: Option<Invid>,
    pub supergash: bool,
    /// False while a trusted bulk loader has oversight disabled.
    pub oversight: bool,
    pub txn: Option<TxnId>,
}

/// Verdict of [`ObjectTypeBehavior::verify_new_value`].
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyOutcome {
    Accept,
    /// Store this canonical form instead of the submitted value.
    Transform(Value),
    Reject(String),
}

/// Verdict of [`ObjectTypeBehavior::wizard_hook`].
#[derive(Debug, Clone, PartialEq)]
pub enum WizardOutcome {
    /// Proceed with default processing, also reporting these rescan hints.
    Continue(RescanHints),
    /// The hook dealt with the operation; this is the caller's result.
    Handled(ReturnVal),
    /// Perform these operations instead, atomically, with wizards off.
    Substitute(Vec<(Invid, FieldOp)>),
    /// Ask the client before proceeding.
    Confirm { title: String, text: String },
}

/// Per-type customization surface. Every hook has a permissive default.
pub trait ObjectTypeBehavior: Send + Sync {
    fn can_read(&self, _ctx: &HookContext<'_>, _obj: &dyn ObjectView) -> bool {
        true
    }

    fn can_write(&self, _ctx: &HookContext<'_>, _obj: &dyn ObjectView) -> bool {
        true
    }

    fn can_create(&self, _ctx: &HookContext<'_>) -> bool {
        true
    }

    fn can_remove(&self, _ctx: &HookContext<'_>, _obj: &dyn ObjectView) -> bool {
        true
    }

    /// Pre-removal step. A failure here rolls the removal back.
    fn remove(&self, _ctx: &HookContext<'_>, _obj: &EditObject) -> ReturnVal {
        ReturnVal::success()
    }

    fn can_inactivate(&self, _ctx: &HookContext<'_>, _obj: &dyn ObjectView) -> bool {
        false
    }

    fn inactivate(&self, _ctx: &HookContext<'_>, _obj: &EditObject) -> ReturnVal {
        ReturnVal::success()
    }

    fn reactivate(&self, _ctx: &HookContext<'_>, _obj: &EditObject) -> ReturnVal {
        ReturnVal::success()
    }

    fn can_clone(&self, _ctx: &HookContext<'_>, _obj: &dyn ObjectView) -> bool {
        true
    }

    fn can_clone_field(&self, _ctx: &HookContext<'_>, _obj: &dyn ObjectView, _field: &FieldDef) -> bool {
        true
    }

    /// Whether a new or checked-out object gets an empty container for
    /// `field`. `creatable` is the session's create permission on it.
    fn instantiate_new_field(&self, _ctx: &HookContext<'_>, field: &FieldDef, creatable: bool) -> bool {
        field.builtin || creatable
    }

    fn field_required(&self, _ctx: &HookContext<'_>, _obj: &dyn ObjectView, _field: &FieldDef) -> bool {
        false
    }

    fn verify_new_value(
        &self,
        _ctx: &HookContext<'_>,
        _obj: &EditObject,
        _field: &FieldDef,
        _value: &Value,
    ) -> VerifyOutcome {
        VerifyOutcome::Accept
    }

    fn wizard_hook(&self, _ctx: &HookContext<'_>, _obj: &EditObject, _op: &FieldOp) -> WizardOutcome {
        WizardOutcome::Continue(RescanHints::default())
    }

    fn finalize_set_value(
        &self,
        _ctx: &HookContext<'_>,
        _obj: &EditObject,
        _field: &FieldDef,
        _value: Option<&Value>,
    ) -> ReturnVal {
        ReturnVal::success()
    }

    fn finalize_set_element(
        &self,
        _ctx: &HookContext<'_>,
        _obj: &EditObject,
        _field: &FieldDef,
        _index: usize,
        _value: &Value,
    ) -> ReturnVal {
        ReturnVal::success()
    }

    fn finalize_add_element(
        &self,
        _ctx: &HookContext<'_>,
        _obj: &EditObject,
        _field: &FieldDef,
        _value: &Value,
    ) -> ReturnVal {
        ReturnVal::success()
    }

    fn finalize_add_elements(
        &self,
        _ctx: &HookContext<'_>,
        _obj: &EditObject,
        _field: &FieldDef,
        _values: &[Value],
    ) -> ReturnVal {
        ReturnVal::success()
    }

    fn finalize_delete_element(
        &self,
        _ctx: &HookContext<'_>,
        _obj: &EditObject,
        _field: &FieldDef,
        _index: usize,
    ) -> ReturnVal {
        ReturnVal::success()
    }

    fn finalize_delete_elements(
        &self,
        _ctx: &HookContext<'_>,
        _obj: &EditObject,
        _field: &FieldDef,
        _values: &[Value],
    ) -> ReturnVal {
        ReturnVal::success()
    }

    /// Synthesized value for fields declared virtualized.
    fn virtual_value(&self, _ctx: &HookContext<'_>, _obj: &dyn ObjectView, _field: &FieldDef) -> Option<FieldValue> {
        None
    }

    /// A non-`None` result is the final permission for the object or field,
    /// bypassing the role matrices.
    fn perm_override(&self, _ctx: &HookContext<'_>, _obj: &dyn ObjectView, _field: Option<u16>) -> Option<PermEntry> {
        None
    }

    /// Extra permission unioned into the role-derived one.
    fn perm_expand(&self, _ctx: &HookContext<'_>, _obj: &dyn ObjectView, _field: Option<u16>) -> Option<PermEntry> {
        None
    }

    fn grant_ownership(&self, _ctx: &HookContext<'_>, _obj: &dyn ObjectView) -> bool {
        false
    }

    /// May a session that cannot edit `target` still add a back-reference
    /// into its `field`?
    fn anonymous_link_ok(&self, _ctx: &HookContext<'_>, _target: &dyn ObjectView, _field: u16) -> bool {
        false
    }

    fn anonymous_unlink_ok(&self, _ctx: &HookContext<'_>, _target: &dyn ObjectView, _field: u16) -> bool {
        true
    }

    /// Commit phase 1 consistency check.
    fn consistency_check(&self, _ctx: &HookContext<'_>, _obj: &EditObject) -> ReturnVal {
        ReturnVal::success()
    }

    /// Runs after integration; failures are logged and ignored.
    fn commit_phase2(&self, _ctx: &HookContext<'_>, _obj: &EditObject) {}
}

/// Behavior for types that register none of their own.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBehavior;

impl ObjectTypeBehavior for DefaultBehavior {}
