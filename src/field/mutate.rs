//! The validate, claim, finalize, assign sequence shared by every setter.
//!
//! A mutation is split in two halves so the session can run the interactive
//! hook between them: [`prepare`] checks editability, shape, type, limits
//! and the type's value hook without touching anything; [`apply`] claims
//! namespace values, runs the finalize hook and assigns. Any failure in
//! [`apply`] unwinds the namespace claims before returning.

use super::{FieldValue, Value};
use crate::error::{DbError, DbResult};
use crate::invid::Invid;
use crate::namespace::{DbNameSpace, FieldRef, TxnId};
use crate::object::{EditObject, HookContext, ObjectView, VerifyOutcome};
use crate::returnval::{FailureKind, RescanHints, ReturnVal};
use crate::schema::FieldDef;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One requested change to a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldOp {
    Set { field: u16, value: Option<Value> },
    SetElement { field: u16, index: usize, value: Value },
    AddElement { field: u16, value: Value },
    AddElements { field: u16, values: Vec<Value> },
    DeleteElement { field: u16, index: usize },
    DeleteValue { field: u16, value: Value },
    DeleteElements { field: u16, values: Vec<Value> },
}

impl FieldOp {
    pub fn field(&self) -> u16 {
        match self {
            FieldOp::Set { field, .. }
            | FieldOp::SetElement { field, .. }
            | FieldOp::AddElement { field, .. }
            | FieldOp::AddElements { field, .. }
            | FieldOp::DeleteElement { field, .. }
            | FieldOp::DeleteValue { field, .. }
            | FieldOp::DeleteElements { field, .. } => *field,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldOp::Set { .. } => "set",
            FieldOp::SetElement { .. } => "set_element",
            FieldOp::AddElement { .. } => "add_element",
            FieldOp::AddElements { .. } => "add_elements",
            FieldOp::DeleteElement { .. } => "delete_element",
            FieldOp::DeleteValue { .. } => "delete_value",
            FieldOp::DeleteElements { .. } => "delete_elements",
        }
    }

    fn is_scalar_op(&self) -> bool {
        matches!(self, FieldOp::Set { .. })
    }

    /// Values this operation would newly place in the field.
    pub fn incoming(&self) -> Vec<&Value> {
        match self {
            FieldOp::Set { value, .. } => value.iter().collect(),
            FieldOp::SetElement { value, .. } | FieldOp::AddElement { value, .. } => vec![value],
            FieldOp::AddElements { values, .. } => values.iter().collect(),
            FieldOp::DeleteElement { .. } | FieldOp::DeleteValue { .. } | FieldOp::DeleteElements { .. } => {
                Vec::new()
            }
        }
    }

    fn incoming_mut(&mut self) -> Vec<&mut Value> {
        match self {
            FieldOp::Set { value, .. } => value.iter_mut().collect(),
            FieldOp::SetElement { value, .. } | FieldOp::AddElement { value, .. } => vec![value],
            FieldOp::AddElements { values, .. } => values.iter_mut().collect(),
            FieldOp::DeleteElement { .. } | FieldOp::DeleteValue { .. } | FieldOp::DeleteElements { .. } => {
                Vec::new()
            }
        }
    }
}

/// Everything a field mutation needs besides the shadow itself.
pub struct MutationEnv<'a> {
    pub ctx: &'a HookContext<'a>,
    pub def: &'a FieldDef,
    pub txn: TxnId,
    pub namespace: Option<&'a DbNameSpace>,
    /// The session's verdict on write permission for this field.
    pub writable: bool,
    pub default_max_len: usize,
    pub default_max_size: usize,
}

impl MutationEnv<'_> {
    fn max_len(&self) -> usize {
        self.def.max_len.unwrap_or(self.default_max_len)
    }

    fn max_size(&self) -> usize {
        self.def.max_size.unwrap_or(self.default_max_size)
    }

    fn holder(&self, invid: Invid) -> FieldRef {
        FieldRef::new(invid, self.def.id)
    }
}

/// Outcome of [`prepare`].
#[derive(Debug, Clone, PartialEq)]
pub enum Prepared {
    /// Validated; `op` carries any canonicalized values.
    Ready { op: FieldOp, rescan: RescanHints },
    Rejected(ReturnVal),
}

fn reject(kind: FailureKind, def: &FieldDef, text: impl Into<String>) -> Prepared {
    Prepared::Rejected(ReturnVal::failure(
        kind,
        format!("Cannot change {}", def.name),
        text,
    ))
}

fn current<'o>(obj: &'o EditObject, def: &FieldDef) -> &'o [Value] {
    obj.field_value(def.id).map(FieldValue::as_vector).unwrap_or(&[])
}

/// Steps 1 to 3 of the mutation protocol. Nothing is modified.
pub fn prepare(env: &MutationEnv<'_>, obj: &EditObject, mut op: FieldOp) -> DbResult<Prepared> {
    let def = env.def;
    let invid = obj.invid();

    if obj.is_committing() {
        return Ok(reject(
            FailureKind::NotEditable,
            def,
            format!("{invid} is already committing"),
        ));
    }
    if !env.writable {
        return Ok(reject(
            FailureKind::PermissionDenied,
            def,
            format!("no write permission for {} on {invid}", def.name),
        ));
    }
    if !def.kind.is_value_kind() {
        return Ok(reject(
            FailureKind::TypeMismatch,
            def,
            format!("{:?} fields are not changed through {}", def.kind, op.name()),
        ));
    }
    if def.vector && op.is_scalar_op() {
        return Err(DbError::ScalarOnVector {
            invid,
            field: def.id,
        });
    }
    if !def.vector && !op.is_scalar_op() {
        return Err(DbError::VectorOnScalar {
            invid,
            field: def.id,
        });
    }

    for value in op.incoming() {
        if value.kind() != def.kind {
            return Ok(reject(
                FailureKind::TypeMismatch,
                def,
                format!("expected {:?}, got {:?}", def.kind, value.kind()),
            ));
        }
        if let Value::Text(s) = value
            && s.chars().count() > env.max_len()
        {
            return Ok(reject(
                FailureKind::Overflow,
                def,
                format!("value longer than {} characters", env.max_len()),
            ));
        }
        if let (Value::Invid(target), Some(type_id)) = (value, def.target.and_then(|t| t.type_id))
            && target.type_id() != type_id
        {
            return Ok(reject(
                FailureKind::TypeMismatch,
                def,
                format!("{target} is not an object of type {type_id}"),
            ));
        }
    }

    if let FieldOp::Set { value: None, .. } = &op
        && env.ctx.oversight
        && !obj.is_deleting()
        && env.ctx.store.schema().object_type(obj.type_id()).is_ok_and(|t| {
            t.behavior().field_required(env.ctx, obj, def)
        })
    {
        return Ok(reject(
            FailureKind::RejectedValue,
            def,
            format!("{} is required and cannot be cleared", def.name),
        ));
    }

    let existing = current(obj, def);
    match &op {
        FieldOp::SetElement { index, .. } | FieldOp::DeleteElement { index, .. }
            if *index >= existing.len() =>
        {
            return Err(DbError::InvalidArgument(format!(
                "index {index} out of range for {} on {invid} ({} elements)",
                def.name,
                existing.len()
            )));
        }
        FieldOp::AddElement { .. } if existing.len() + 1 > env.max_size() => {
            return Ok(reject(
                FailureKind::Overflow,
                def,
                format!("{} holds at most {} elements", def.name, env.max_size()),
            ));
        }
        FieldOp::AddElements { values, .. } if existing.len() + values.len() > env.max_size() => {
            return Ok(reject(
                FailureKind::Overflow,
                def,
                format!("{} holds at most {} elements", def.name, env.max_size()),
            ));
        }
        FieldOp::DeleteValue { value, .. } if !existing.contains(value) => {
            return Ok(reject(
                FailureKind::NotFound,
                def,
                format!("'{value}' is not in {}", def.name),
            ));
        }
        FieldOp::DeleteElements { values, .. } => {
            if let Some(missing) = values.iter().find(|v| !existing.contains(v)) {
                return Ok(reject(
                    FailureKind::NotFound,
                    def,
                    format!("'{missing}' is not in {}", def.name),
                ));
            }
            // Each request entry removes one occurrence.
            let count = |vs: &[Value], v: &Value| vs.iter().filter(|x| *x == v).count();
            if let Some(dup) = values
                .iter()
                .find(|v| count(values.as_slice(), *v) > count(existing, *v))
            {
                return Ok(reject(
                    FailureKind::DuplicateValue,
                    def,
                    format!("'{dup}' appears more than once"),
                ));
            }
        }
        _ => {}
    }

    let mut rescan = RescanHints::new();
    let behavior = env
        .ctx
        .store
        .schema()
        .object_type(obj.type_id())
        .map(std::sync::Arc::clone)?;
    for value in op.incoming_mut() {
        match behavior.behavior().verify_new_value(env.ctx, obj, def, value) {
            VerifyOutcome::Accept => {}
            VerifyOutcome::Transform(canonical) => {
                if canonical.kind() != def.kind {
                    return Ok(reject(
                        FailureKind::TypeMismatch,
                        def,
                        format!("canonical form of '{value}' has the wrong type"),
                    ));
                }
                *value = canonical;
                rescan.add_field(invid, def.id);
            }
            VerifyOutcome::Reject(reason) => {
                return Ok(reject(FailureKind::RejectedValue, def, reason));
            }
        }
    }

    // Duplicate checks run on canonical values.
    match &op {
        FieldOp::AddElements { values, .. } => {
            let mut seen = HashSet::new();
            if let Some(dup) = values.iter().find(|v| !seen.insert(*v)) {
                return Ok(reject(
                    FailureKind::DuplicateValue,
                    def,
                    format!("'{dup}' appears more than once"),
                ));
            }
            if def.namespace.is_some()
                && let Some(dup) = values.iter().find(|v| existing.contains(v))
            {
                return Ok(reject(
                    FailureKind::DuplicateValue,
                    def,
                    format!("'{dup}' is already in {}", def.name),
                ));
            }
        }
        FieldOp::AddElement { value, .. } if def.namespace.is_some() && existing.contains(value) => {
            return Ok(reject(
                FailureKind::DuplicateValue,
                def,
                format!("'{value}' is already in {}", def.name),
            ));
        }
        FieldOp::SetElement { index, value, .. }
            if def.namespace.is_some()
                && existing
                    .iter()
                    .enumerate()
                    .any(|(i, v)| i != *index && v == value) =>
        {
            return Ok(reject(
                FailureKind::DuplicateValue,
                def,
                format!("'{value}' is already in {}", def.name),
            ));
        }
        _ => {}
    }

    Ok(Prepared::Ready { op, rescan })
}

/// Values an operation releases and claims, as `(outgoing, incoming)`.
fn exchange(obj: &EditObject, def: &FieldDef, op: &FieldOp) -> (Vec<Value>, Vec<Value>) {
    let existing = current(obj, def);
    match op {
        FieldOp::Set { value, .. } => (
            obj.scalar(def.id).cloned().into_iter().collect(),
            value.iter().cloned().collect(),
        ),
        FieldOp::SetElement { index, value, .. } => {
            (existing.get(*index).cloned().into_iter().collect(), vec![value.clone()])
        }
        FieldOp::AddElement { value, .. } => (Vec::new(), vec![value.clone()]),
        FieldOp::AddElements { values, .. } => (Vec::new(), values.clone()),
        FieldOp::DeleteElement { index, .. } => {
            (existing.get(*index).cloned().into_iter().collect(), Vec::new())
        }
        FieldOp::DeleteValue { value, .. } => (vec![value.clone()], Vec::new()),
        FieldOp::DeleteElements { values, .. } => (values.clone(), Vec::new()),
    }
}

/// Namespace changes made by one mutation, undoable until it completes.
struct Claims<'a> {
    ns: &'a DbNameSpace,
    txn: TxnId,
    holder: FieldRef,
    released: Vec<Value>,
    claimed: Vec<Value>,
}

impl Claims<'_> {
    /// Re-establishes released values and drops new claims.
    fn undo(self) -> DbResult<()> {
        for value in &self.claimed {
            self.ns.undo_mark(self.txn, value, self.holder)?;
        }
        for value in &self.released {
            if !self.ns.mark(self.txn, value, self.holder) {
                return Err(DbError::NamespaceInvariant {
                    namespace: self.ns.name().to_string(),
                    message: format!("could not restore '{value}' for {}", self.holder.invid),
                });
            }
        }
        Ok(())
    }
}

fn claim<'a>(
    env: &MutationEnv<'a>,
    invid: Invid,
    outgoing: Vec<Value>,
    incoming: Vec<Value>,
) -> DbResult<Result<Option<Claims<'a>>, ReturnVal>> {
    let Some(ns) = env.namespace else {
        return Ok(Ok(None));
    };
    let holder = env.holder(invid);
    // Values leaving and re-entering in the same operation keep their claim.
    let released: Vec<Value> = outgoing.into_iter().filter(|v| !incoming.contains(v)).collect();
    let fresh: Vec<Value> = incoming
        .into_iter()
        .filter(|v| !ns.lookup_in(env.txn, v).is_some_and(|h| h == holder))
        .collect();

    ns.unmark_all(env.txn, &released, holder)?;
    if let Err(taken) = ns.mark_all(env.txn, &fresh, holder) {
        for value in &released {
            ns.mark(env.txn, value, holder);
        }
        let text = match ns.lookup_in(env.txn, &taken) {
            Some(other) => format!(
                "'{taken}' is already in use in namespace {} by {}",
                ns.name(),
                other.invid
            ),
            None => format!("'{taken}' is already in use in namespace {}", ns.name()),
        };
        return Ok(Err(ReturnVal::failure(
            FailureKind::NamespaceConflict,
            format!("Cannot change {}", env.def.name),
            text,
        )));
    }
    Ok(Ok(Some(Claims {
        ns,
        txn: env.txn,
        holder,
        released,
        claimed: fresh,
    })))
}

fn finalize(env: &MutationEnv<'_>, obj: &EditObject, op: &FieldOp) -> DbResult<ReturnVal> {
    let schema = env.ctx.store.schema();
    let type_def = schema.object_type(obj.type_id())?;
    let hooks = type_def.behavior();
    let (ctx, def) = (env.ctx, env.def);
    Ok(match op {
        FieldOp::Set { value, .. } => hooks.finalize_set_value(ctx, obj, def, value.as_ref()),
        FieldOp::SetElement { index, value, .. } => {
            hooks.finalize_set_element(ctx, obj, def, *index, value)
        }
        FieldOp::AddElement { value, .. } => hooks.finalize_add_element(ctx, obj, def, value),
        FieldOp::AddElements { values, .. } => hooks.finalize_add_elements(ctx, obj, def, values),
        FieldOp::DeleteElement { index, .. } => hooks.finalize_delete_element(ctx, obj, def, *index),
        FieldOp::DeleteValue { value, .. } => {
            let index = current(obj, def).iter().position(|v| v == value).unwrap_or_default();
            hooks.finalize_delete_element(ctx, obj, def, index)
        }
        FieldOp::DeleteElements { values, .. } => {
            hooks.finalize_delete_elements(ctx, obj, def, values)
        }
    })
}

fn assign(obj: &mut EditObject, def: &FieldDef, op: FieldOp) -> DbResult<()> {
    let invid = obj.invid();
    let field = obj.ensure_field(def);
    match (field.value_mut(), op) {
        (FieldValue::Scalar(slot), FieldOp::Set { value, .. }) => *slot = value,
        (FieldValue::Vector(vs), FieldOp::SetElement { index, value, .. }) => {
            if let Some(slot) = vs.get_mut(index) {
                *slot = value;
            }
        }
        (FieldValue::Vector(vs), FieldOp::AddElement { value, .. }) => vs.push(value),
        (FieldValue::Vector(vs), FieldOp::AddElements { values, .. }) => vs.extend(values),
        (FieldValue::Vector(vs), FieldOp::DeleteElement { index, .. }) => {
            if index < vs.len() {
                vs.remove(index);
            }
        }
        (FieldValue::Vector(vs), FieldOp::DeleteValue { value, .. }) => {
            if let Some(pos) = vs.iter().position(|v| *v == value) {
                vs.remove(pos);
            }
        }
        (FieldValue::Vector(vs), FieldOp::DeleteElements { values, .. }) => {
            for value in values {
                if let Some(pos) = vs.iter().position(|v| *v == value) {
                    vs.remove(pos);
                }
            }
        }
        _ => {
            return Err(DbError::ShadowInvariant {
                invid,
                message: format!("container for field {} has the wrong shape", def.id),
            });
        }
    }
    Ok(())
}

/// Steps 5 to 7: claim namespace values, run the finalize hook, assign.
pub fn apply(
    env: &MutationEnv<'_>,
    obj: &mut EditObject,
    op: FieldOp,
    rescan: RescanHints,
) -> DbResult<ReturnVal> {
    let invid = obj.invid();
    let (outgoing, incoming) = exchange(obj, env.def, &op);
    let claims = match claim(env, invid, outgoing, incoming)? {
        Ok(claims) => claims,
        Err(mut failure) => {
            failure.rescan.union_rescan(&rescan);
            return Ok(failure);
        }
    };

    let hook = finalize(env, obj, &op)?;
    if !hook.success {
        if let Some(claims) = claims {
            claims.undo()?;
        }
        let mut failure = hook;
        failure.rescan.union_rescan(&rescan);
        if failure.failure.is_none() {
            failure.failure = Some(FailureKind::HookRejected);
        }
        return Ok(failure);
    }

    let transformed = match &op {
        FieldOp::Set { value, .. } if !rescan.is_empty() => value.clone(),
        FieldOp::SetElement { value, .. } | FieldOp::AddElement { value, .. } if !rescan.is_empty() => {
            Some(value.clone())
        }
        _ => None,
    };
    assign(obj, env.def, op)?;

    let mut out = ReturnVal::success();
    out.rescan = rescan;
    out.rescan.union_rescan(&hook.rescan);
    out.transformed = transformed;
    Ok(out)
}

/// Clears a field of any kind, releasing namespace claims. Secret and
/// matrix fields are cleared only this way.
pub fn set_undefined(env: &MutationEnv<'_>, obj: &mut EditObject) -> DbResult<ReturnVal> {
    let def = env.def;
    if obj.is_committing() {
        return Ok(ReturnVal::failure(
            FailureKind::NotEditable,
            format!("Cannot clear {}", def.name),
            format!("{} is already committing", obj.invid()),
        ));
    }
    if !env.writable {
        return Ok(ReturnVal::failure(
            FailureKind::PermissionDenied,
            format!("Cannot clear {}", def.name),
            format!("no write permission for {} on {}", def.name, obj.invid()),
        ));
    }
    let outgoing: Vec<Value> = obj
        .field_value(def.id)
        .map(|v| v.values().into_iter().cloned().collect())
        .unwrap_or_default();
    if let Some(ns) = env.namespace {
        ns.unmark_all(env.txn, &outgoing, env.holder(obj.invid()))?;
    }
    if let Some(field) = obj.field_mut(def.id) {
        field.clear();
    }
    Ok(ReturnVal::success())
}

/// Replaces a secret field's hash.
pub fn set_secret(env: &MutationEnv<'_>, obj: &mut EditObject, plaintext: &str) -> DbResult<ReturnVal> {
    let def = env.def;
    if def.kind != crate::schema::FieldKind::Secret {
        return Ok(ReturnVal::failure(
            FailureKind::TypeMismatch,
            format!("Cannot change {}", def.name),
            format!("{} is not a secret field", def.name),
        ));
    }
    if obj.is_committing() || !env.writable {
        return Ok(ReturnVal::failure(
            if env.writable {
                FailureKind::NotEditable
            } else {
                FailureKind::PermissionDenied
            },
            format!("Cannot change {}", def.name),
            format!("{} cannot be changed on {}", def.name, obj.invid()),
        ));
    }
    obj.ensure_field(def)
        .set_raw(FieldValue::Secret(Some(super::SecretHash::new(plaintext))));
    Ok(ReturnVal::success())
}
