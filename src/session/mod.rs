//! Per-client sessions: identity, permission cache, and the transaction that
//! edit shadows live in.

pub mod permissions;
pub mod query;
pub mod transaction;

pub use permissions::{PermStamp, PermissionManager};
pub use transaction::EditSet;

use crate::error::{DbError, DbResult};
use crate::field::mutate::{self, MutationEnv};
use crate::field::{DbField, FieldOp, FieldValue, Prepared, Value};
use crate::invid::Invid;
use crate::log::{AuditEvent, FieldChange};
use crate::namespace::{DbNameSpace, TxnId};
use crate::object::remove::{RemovalDriver, finalize_remove};
use crate::object::{DbObject, EditObject, HookContext, ObjectStatus, ObjectView, WizardOutcome};
use crate::perm::matrix_field::{self, MatrixEnv};
use crate::perm::{MatrixRole, PermEntry, PermKey};
use crate::returnval::{FailureKind, ReturnVal, WizardPrompt};
use crate::schema::constants::*;
use crate::schema::{FieldDef, FieldKind, ObjectTypeDef, Schema};
use crate::store::{DbStore, Integration, SessionControl, ShadowHolder, now_millis};
use compact_str::CompactString;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// A record as seen from a session: its own edit shadow if it has one,
/// otherwise the committed version.
#[derive(Debug, Clone)]
pub enum Found<'a> {
    Shadow(&'a EditObject),
    Stored(Arc<DbObject>),
}

impl ObjectView for Found<'_> {
    fn invid(&self) -> Invid {
        match self {
            Found::Shadow(obj) => obj.invid(),
            Found::Stored(obj) => obj.invid(),
        }
    }

    fn field(&self, id: u16) -> Option<&DbField> {
        match self {
            Found::Shadow(obj) => ObjectView::field(*obj, id),
            Found::Stored(obj) => ObjectView::field(&**obj, id),
        }
    }

    fn field_ids(&self) -> Vec<u16> {
        match self {
            Found::Shadow(obj) => obj.field_ids(),
            Found::Stored(obj) => obj.field_ids(),
        }
    }
}

/// How much of the client-facing checking a mutation goes through.
#[derive(Debug, Clone, Copy)]
struct Mode {
    check_perms: bool,
    interactive: bool,
}

impl Mode {
    const CLIENT: Mode = Mode {
        check_perms: true,
        interactive: true,
    };
    const QUIET: Mode = Mode {
        check_perms: true,
        interactive: false,
    };
    const INTERNAL: Mode = Mode {
        check_perms: false,
        interactive: false,
    };
}

#[derive(Debug, Clone)]
struct PendingWizard {
    invid: Invid,
    op: FieldOp,
}

fn context<'a>(
    store: &'a DbStore,
    username: &'a str,
    perms: &PermissionManager,
    oversight: bool,
    txn: Option<TxnId>,
) -> HookContext<'a> {
    HookContext {
        store,
        username,
        persona: perms.persona(),
        supergash: perms.is_supergash(),
        oversight,
        txn,
    }
}

fn no_transaction() -> ReturnVal {
    ReturnVal::failure(
        FailureKind::NoTransaction,
        "No transaction",
        "this operation requires an open transaction",
    )
}

fn not_found(invid: Invid) -> ReturnVal {
    ReturnVal::failure(FailureKind::NotFound, "Object not found", format!("{invid} does not exist"))
}

fn denied(text: impl Into<String>) -> ReturnVal {
    ReturnVal::failure(FailureKind::PermissionDenied, "Permissions error", text)
}

/// One logged-in client.
pub struct Session {
    id: Uuid,
    store: Arc<DbStore>,
    control: Arc<SessionControl>,
    username: CompactString,
    user: Invid,
    perms: PermissionManager,
    txn: Option<EditSet>,
    oversight: bool,
    wizards: bool,
    pending_wizards: BTreeMap<u64, PendingWizard>,
    next_token: u64,
    default_owners: Vec<Invid>,
    logged_out: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("persona", &self.perms.persona())
            .field("txn", &self.txn.as_ref().map(EditSet::txn))
            .finish()
    }
}

impl Session {
    /// Verifies `secret` against the user's stored hash and registers a new
    /// session with the store.
    pub(crate) fn login(store: Arc<DbStore>, username: &str, secret: &str) -> DbResult<Self> {
        let failed = || DbError::Authentication(username.to_string());
        let user = store
            .lookup_unique(USER_NAMESPACE, &Value::from(username))?
            .filter(|r| r.invid.type_id() == USER_BASE && r.field == USER_NAME)
            .and_then(|r| store.get(r.invid))
            .ok_or_else(failed)?;
        let verified = user
            .field_value(USER_SECRET)
            .and_then(FieldValue::as_secret)
            .is_some_and(|hash| hash.verify(secret));
        if !verified {
            warn!(username, "login refused");
            return Err(failed());
        }

        let id = Uuid::new_v4();
        let control = Arc::new(SessionControl::new(id, username));
        store.register_session(Arc::clone(&control))?;
        let mut perms = PermissionManager::default();
        perms.update_perms(&store, true);
        info!(session = %id, username, "login");
        Ok(Self {
            id,
            store,
            control,
            username: username.into(),
            user: user.invid(),
            perms,
            txn: None,
            oversight: true,
            wizards: true,
            pending_wizards: BTreeMap::new(),
            next_token: 1,
            default_owners: Vec::new(),
            logged_out: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn user(&self) -> Invid {
        self.user
    }

    pub fn persona(&self) -> Option<Invid> {
        self.perms.persona()
    }

    pub fn permissions(&self) -> &PermissionManager {
        &self.perms
    }

    pub fn transaction(&self) -> Option<&EditSet> {
        self.txn.as_ref()
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out
    }

    pub fn oversight(&self) -> bool {
        self.oversight
    }

    pub fn store(&self) -> &Arc<DbStore> {
        &self.store
    }

    fn txn_id(&self) -> Option<TxnId> {
        self.txn.as_ref().map(EditSet::txn)
    }

    pub(crate) fn hook_ctx(&self) -> HookContext<'_> {
        context(&self.store, &self.username, &self.perms, self.oversight, self.txn_id())
    }

    /// Entry check for every client call: honors a pending forced
    /// disconnect, records activity and refreshes stale permissions.
    fn enter(&mut self) -> DbResult<()> {
        if self.logged_out {
            return Err(DbError::NotLoggedIn);
        }
        if let Some(reason) = self.control.kill_reason() {
            warn!(session = %self.id, username = %self.username, %reason, "session disconnected");
            self.logout();
            return Err(DbError::NotLoggedIn);
        }
        self.control.touch();
        if self.perms.update_perms(&self.store, false) {
            info!(
                session = %self.id,
                persona = ?self.perms.persona(),
                supergash = self.perms.is_supergash(),
                "permissions refreshed"
            );
        }
        Ok(())
    }

    /// The session's own shadow of `invid`, if it is editing it.
    pub fn shadow(&self, invid: Invid) -> Option<&EditObject> {
        self.txn.as_ref().and_then(|set| set.get(invid))
    }

    fn shadow_mut(&mut self, invid: Invid) -> DbResult<&mut EditObject> {
        self.txn
            .as_mut()
            .ok_or(DbError::NotInEditContext(invid))?
            .shadow_mut(invid)
    }

    pub(crate) fn find(&self, invid: Invid) -> Option<Found<'_>> {
        if let Some(obj) = self.shadow(invid) {
            return Some(Found::Shadow(obj));
        }
        self.store.get(invid).map(Found::Stored)
    }

    // Identity

    /// Assumes the named persona, or drops back to the base account when
    /// `name` is empty.
    pub fn select_persona(&mut self, name: &str, secret: &str) -> DbResult<ReturnVal> {
        self.enter()?;
        if let Some(set) = &self.txn {
            return Ok(ReturnVal::failure(
                FailureKind::TransactionOpen,
                "Cannot change persona",
                format!("{} is still open", set.txn()),
            ));
        }
        if name.is_empty() {
            self.perms.set_persona(None);
            self.perms.update_perms(&self.store, true);
            self.default_owners.clear();
            info!(session = %self.id, username = %self.username, "persona dropped");
            return Ok(ReturnVal::success());
        }

        let refused = || {
            ReturnVal::failure(
                FailureKind::Authentication,
                "Persona refused",
                format!("cannot assume persona '{name}'"),
            )
        };
        let Some(persona) = self
            .store
            .lookup_unique(PERSONA_NAMESPACE, &Value::from(name))?
            .filter(|r| r.invid.type_id() == PERSONA_BASE)
            .and_then(|r| self.store.get(r.invid))
        else {
            return Ok(refused());
        };
        let belongs = persona.scalar(PERSONA_USER).and_then(Value::as_invid) == Some(self.user);
        let verified = persona
            .field_value(PERSONA_SECRET)
            .and_then(FieldValue::as_secret)
            .is_some_and(|hash| hash.verify(secret));
        if !belongs || !verified {
            warn!(session = %self.id, username = %self.username, persona = name, "persona refused");
            return Ok(refused());
        }

        self.perms.set_persona(Some(persona.invid()));
        self.perms.update_perms(&self.store, true);
        self.default_owners.clear();
        if self.perms.is_supergash() {
            warn!(session = %self.id, username = %self.username, persona = name, "supergash persona selected");
        } else {
            info!(session = %self.id, username = %self.username, persona = name, "persona selected");
        }
        Ok(ReturnVal::success())
    }

    /// Owner groups assigned to objects this session creates.
    pub fn set_default_owner(&mut self, owners: Vec<Invid>) -> DbResult<ReturnVal> {
        self.enter()?;
        for owner in &owners {
            let Some(group) = self.find(*owner).filter(|g| g.type_id() == OWNER_BASE) else {
                return Ok(not_found(*owner));
            };
            if !self.perms.is_supergash() && !self.persona_match(&group) {
                return Ok(denied(format!("not a member of owner group {owner}")));
            }
        }
        self.default_owners = owners;
        Ok(ReturnVal::success())
    }

    fn initial_owners(&self) -> Vec<Invid> {
        if !self.default_owners.is_empty() {
            return self.default_owners.clone();
        }
        self.perms
            .persona()
            .and_then(|p| self.find(p).map(|found| found.invids(PERSONA_GROUPS)))
            .unwrap_or_default()
    }

    /// Turns required-field enforcement and wizards off for trusted bulk
    /// loads. Only supergash may disable it.
    pub fn enable_oversight(&mut self, enabled: bool) -> DbResult<ReturnVal> {
        self.enter()?;
        if !enabled && !self.perms.is_supergash() {
            return Ok(denied("only supergash may disable oversight"));
        }
        self.oversight = enabled;
        info!(session = %self.id, oversight = enabled, "oversight changed");
        Ok(ReturnVal::success())
    }

    pub fn enable_wizards(&mut self, enabled: bool) -> DbResult<()> {
        self.enter()?;
        self.wizards = enabled;
        Ok(())
    }

    /// Aborts any open transaction and unregisters the session. Idempotent.
    pub fn logout(&mut self) {
        if self.logged_out {
            return;
        }
        self.abort_inner();
        self.pending_wizards.clear();
        self.store.unregister_session(self.id);
        self.logged_out = true;
        info!(session = %self.id, username = %self.username, "logout");
    }

    // Transactions

    pub fn open_transaction(&mut self, description: &str) -> DbResult<ReturnVal> {
        self.enter()?;
        if let Some(set) = &self.txn {
            return Ok(ReturnVal::failure(
                FailureKind::TransactionOpen,
                "Transaction already open",
                format!("{} ({}) is still open", set.txn(), set.description()),
            ));
        }
        let txn = self.store.next_txn();
        self.txn = Some(EditSet::new(
            txn,
            description,
            now_millis(),
            self.store.config().max_checkpoint_depth,
        ));
        self.control.begin_txn(txn, description);
        debug!(session = %self.id, %txn, description, "transaction opened");
        Ok(ReturnVal::success())
    }

    pub fn checkpoint(&mut self, name: &str) -> DbResult<ReturnVal> {
        self.enter()?;
        if self.txn.is_none() {
            return Ok(no_transaction());
        }
        self.push_checkpoint(name)?;
        debug!(session = %self.id, checkpoint = name, "checkpoint");
        Ok(ReturnVal::success())
    }

    /// Restores the transaction to the named checkpoint, discarding it and
    /// every newer one.
    pub fn rollback(&mut self, name: &str) -> DbResult<ReturnVal> {
        self.enter()?;
        if self.txn.is_none() {
            return Ok(no_transaction());
        }
        self.rollback_internal(name)?;
        debug!(session = %self.id, checkpoint = name, "rolled back");
        Ok(ReturnVal::success())
    }

    /// Forgets the named checkpoint, keeping the changes made since.
    pub fn pop_checkpoint(&mut self, name: &str) -> DbResult<ReturnVal> {
        self.enter()?;
        if self.txn.is_none() {
            return Ok(no_transaction());
        }
        self.pop_internal(name)?;
        Ok(ReturnVal::success())
    }

    fn push_checkpoint(&mut self, name: &str) -> DbResult<()> {
        let set = self.txn.as_mut().ok_or(DbError::UnknownCheckpoint(name.to_string()))?;
        set.checkpoint(name)?;
        self.store.namespaces().checkpoint(set.txn(), name);
        Ok(())
    }

    fn internal_checkpoint(&mut self, purpose: &str) -> DbResult<String> {
        let name = format!("{purpose}#{}", self.next_token);
        self.next_token += 1;
        self.push_checkpoint(&name)?;
        Ok(name)
    }

    fn rollback_internal(&mut self, name: &str) -> DbResult<()> {
        let set = self.txn.as_mut().ok_or(DbError::UnknownCheckpoint(name.to_string()))?;
        let txn = set.txn();
        let dropped = set.rollback(name)?;
        self.store.namespaces().rollback(txn, name);
        for invid in dropped {
            self.store.release_shadow(invid, txn);
        }
        Ok(())
    }

    fn pop_internal(&mut self, name: &str) -> DbResult<()> {
        let set = self.txn.as_mut().ok_or(DbError::UnknownCheckpoint(name.to_string()))?;
        set.pop_checkpoint(name)?;
        self.store.namespaces().pop_checkpoint(set.txn(), name)
    }

    pub fn abort_transaction(&mut self) -> DbResult<ReturnVal> {
        self.enter()?;
        if self.txn.is_none() {
            return Ok(no_transaction());
        }
        self.abort_inner();
        Ok(ReturnVal::success())
    }

    fn abort_inner(&mut self) {
        let Some(set) = self.txn.take() else {
            return;
        };
        let txn = set.txn();
        self.store.namespaces().abort(txn);
        for invid in set.invids() {
            self.store.release_shadow(invid, txn);
        }
        self.pending_wizards.clear();
        if !self.control.end_txn(txn) {
            debug!(session = %self.id, %txn, "transaction already revoked");
            return;
        }
        self.store.audit(
            &self.username,
            AuditEvent::TransactionAborted {
                txn: txn.0,
                description: set.description().to_string(),
            },
        );
        info!(session = %self.id, %txn, objects = set.len(), "transaction aborted");
    }

    fn commit_failed(&mut self, abort_on_fail: bool, rv: ReturnVal) -> ReturnVal {
        warn!(
            session = %self.id,
            txn = ?self.txn_id(),
            abort_on_fail,
            reason = rv.dialog_text().unwrap_or_default(),
            "commit refused"
        );
        if abort_on_fail {
            self.abort_inner();
        }
        rv
    }

    fn missing_fields(&self, schema: &Schema) -> DbResult<Vec<String>> {
        let Some(set) = &self.txn else {
            return Ok(Vec::new());
        };
        let ctx = self.hook_ctx();
        let mut missing = Vec::new();
        for obj in set.objects().filter(|o| !o.status().is_removal()) {
            let type_def = schema.object_type(obj.type_id())?;
            let fields = obj.missing_required_fields(type_def, &ctx);
            if !fields.is_empty() {
                missing.push(format!(
                    "{} '{}' is missing {}",
                    type_def.name,
                    obj.label(type_def),
                    fields.join(", ")
                ));
            }
        }
        Ok(missing)
    }

    fn release_commit(&mut self) {
        if let Some(set) = self.txn.as_mut() {
            for obj in set.objects_mut() {
                obj.release();
            }
        }
    }

    /// Checks required fields, runs phase 1 on every shadow, integrates the
    /// results into the store and runs phase 2. On a refused commit the
    /// transaction stays open unless `abort_on_fail`.
    pub fn commit_transaction(&mut self, abort_on_fail: bool) -> DbResult<ReturnVal> {
        self.enter()?;
        let Some(txn) = self.txn_id() else {
            return Ok(no_transaction());
        };
        let schema = self.store.schema();

        if self.oversight {
            let missing = self.missing_fields(&schema)?;
            if !missing.is_empty() {
                let rv = ReturnVal::failure(
                    FailureKind::MissingRequiredFields,
                    "Missing required fields",
                    missing.join("\n"),
                );
                return Ok(self.commit_failed(abort_on_fail, rv));
            }
        }

        let checked = {
            let ctx = context(&self.store, &self.username, &self.perms, self.oversight, Some(txn));
            let Some(set) = self.txn.as_mut() else {
                return Ok(no_transaction());
            };
            let mut refused = Ok(None);
            for obj in set.objects_mut() {
                obj.begin_commit();
                if obj.status().is_removal() {
                    continue;
                }
                let rv = match schema.object_type(obj.type_id()) {
                    Ok(type_def) => type_def.behavior().consistency_check(&ctx, obj),
                    Err(err) => {
                        refused = Err(err);
                        break;
                    }
                };
                if !rv.success {
                    refused = Ok(Some(rv));
                    break;
                }
            }
            refused
        };
        let refused = match checked {
            Ok(refused) => refused,
            Err(err) => {
                self.release_commit();
                return Err(err);
            }
        };
        if let Some(mut rv) = refused {
            self.release_commit();
            rv.failure.get_or_insert(FailureKind::CommitFailed);
            return Ok(self.commit_failed(abort_on_fail, rv));
        }
        if let Err(err) = self.store.namespaces().verify(txn) {
            self.release_commit();
            return Err(err);
        }

        let Some(mut set) = self.txn.take() else {
            return Ok(no_transaction());
        };
        if !self.control.end_txn(txn) {
            self.store.namespaces().abort(txn);
            for invid in set.invids() {
                self.store.release_shadow(invid, txn);
            }
            warn!(session = %self.id, %txn, "commit refused: transaction revoked");
            self.logout();
            return Err(DbError::NotLoggedIn);
        }
        let now = now_millis();
        let dropped: BTreeSet<Invid> = set
            .objects()
            .filter(|o| o.status() == ObjectStatus::Dropping)
            .map(|o| o.invid())
            .collect();
        let mut events: Vec<AuditEvent> = set
            .take_events()
            .into_iter()
            .filter(|e| e.invid().is_none_or(|invid| !dropped.contains(&invid)))
            .collect();
        let mut changes = Vec::with_capacity(set.len());
        let prepared = (|| -> DbResult<()> {
            for obj in set.objects_mut() {
                let type_def = schema.object_type(obj.type_id())?;
                match obj.status() {
                    ObjectStatus::Dropping => {}
                    ObjectStatus::Deleting => changes.push(Integration::Remove(obj.invid())),
                    ObjectStatus::Creating | ObjectStatus::Editing => {
                        clean_matrices(obj, type_def, &schema);
                        events.extend(describe_changes(obj, type_def, &schema));
                        stamp_history(obj, type_def, &self.username, now)?;
                        changes.push(Integration::Put(Arc::new(obj.to_stored())));
                    }
                }
            }
            Ok(())
        })();
        let integrated = prepared.and_then(|()| self.store.integrate(txn, changes));
        if let Err(err) = integrated {
            self.store.namespaces().abort(txn);
            for invid in set.invids() {
                self.store.release_shadow(invid, txn);
            }
            warn!(session = %self.id, %txn, error = %err, "commit failed during integration");
            return Err(err);
        }

        let ctx = context(&self.store, &self.username, &self.perms, self.oversight, Some(txn));
        for obj in set.objects().filter(|o| !o.status().is_removal()) {
            if let Ok(type_def) = schema.object_type(obj.type_id()) {
                type_def.behavior().commit_phase2(&ctx, obj);
            }
        }
        for invid in set.invids() {
            self.store.release_shadow(invid, txn);
        }
        let objects = set.len();
        for event in events {
            self.store.audit(&self.username, event);
        }
        self.store.audit(
            &self.username,
            AuditEvent::TransactionCommitted {
                txn: txn.0,
                description: set.description().to_string(),
                objects,
            },
        );
        self.pending_wizards.clear();
        info!(session = %self.id, %txn, objects, "transaction committed");
        Ok(ReturnVal::success())
    }

    // Objects

    /// Committed or in-transaction state of a visible object.
    pub fn view_object(&mut self, invid: Invid) -> DbResult<Arc<DbObject>> {
        self.enter()?;
        let found = self.visible(invid)?;
        Ok(match found {
            Found::Shadow(obj) => Arc::new(obj.to_stored()),
            Found::Stored(obj) => obj,
        })
    }

    fn visible(&self, invid: Invid) -> DbResult<Found<'_>> {
        let schema = self.store.schema();
        let type_def = schema.object_type(invid.type_id())?;
        let found = self
            .find(invid)
            .ok_or_else(|| DbError::object_not_found(invid))?;
        let readable = self.perms.is_supergash()
            || (self.object_perm(&found)?.is_visible()
                && type_def.behavior().can_read(&self.hook_ctx(), &found));
        if !readable {
            return Err(DbError::PermissionDenied(format!("cannot view {invid}")));
        }
        Ok(found)
    }

    /// Checks `invid` out into the open transaction.
    pub fn edit_object(&mut self, invid: Invid) -> DbResult<ReturnVal> {
        self.enter()?;
        if self.txn.is_none() {
            return Ok(no_transaction());
        }
        if self.shadow(invid).is_some() {
            return Ok(ReturnVal::with_invid(invid));
        }
        self.edit_inner(invid)
    }

    fn instantiable(&self, type_def: &ObjectTypeDef, obj: Option<&dyn ObjectView>) -> DbResult<BTreeSet<u16>> {
        let ctx = self.hook_ctx();
        let mut out = BTreeSet::new();
        for def in type_def.fields() {
            let creatable = match obj {
                Some(obj) => self.field_perm(obj, def.id)?.is_creatable(),
                None => self.type_field_perm(type_def.id, def.id).is_creatable(),
            };
            if type_def.behavior().instantiate_new_field(&ctx, def, creatable) {
                out.insert(def.id);
            }
        }
        Ok(out)
    }

    fn checkout(&mut self, stored: Arc<DbObject>) -> DbResult<ReturnVal> {
        let Some(txn) = self.txn_id() else {
            return Ok(no_transaction());
        };
        let invid = stored.invid();
        let holder = ShadowHolder {
            session: self.id,
            username: self.username.clone(),
            txn,
        };
        if let Err(other) = self.store.claim_shadow(invid, holder) {
            debug!(session = %self.id, %invid, holder = %other.username, "checkout refused");
            return Ok(ReturnVal::failure(
                FailureKind::AlreadyEditing,
                "Object busy",
                format!("{invid} is already being edited by {}", other.username),
            ));
        }
        let schema = self.store.schema();
        let prepared = schema.object_type(invid.type_id()).and_then(|type_def| {
            let fields = self.instantiable(type_def, Some(&*stored))?;
            Ok(EditObject::checkout(stored, type_def, |f| fields.contains(&f.id)))
        });
        let inserted = prepared.and_then(|shadow| {
            self.txn
                .as_mut()
                .ok_or(DbError::NotInEditContext(invid))?
                .insert(shadow)
        });
        if let Err(err) = inserted {
            self.store.release_shadow(invid, txn);
            return Err(err);
        }
        Ok(ReturnVal::with_invid(invid))
    }

    /// Creates a new object. Embedded types require the container they live
    /// in.
    pub fn create_object(&mut self, type_id: u16, embedded_in: Option<Invid>) -> DbResult<ReturnVal> {
        self.enter()?;
        let Some(txn) = self.txn_id() else {
            return Ok(no_transaction());
        };
        let schema = self.store.schema();
        let type_def = Arc::clone(schema.object_type(type_id)?);
        if type_def.embedded != embedded_in.is_some() {
            return Err(DbError::InvalidArgument(format!(
                "type {} {} a container",
                type_def.name,
                if type_def.embedded { "requires" } else { "does not take" }
            )));
        }
        let allowed = self.perms.is_supergash()
            || (self.type_perm(type_id).is_creatable()
                && type_def.behavior().can_create(&self.hook_ctx()));
        if !allowed {
            return Ok(denied(format!("no permission to create {}", type_def.name)));
        }

        let invid = self.store.allocate_invid(type_id)?;
        let holder = ShadowHolder {
            session: self.id,
            username: self.username.clone(),
            txn,
        };
        if self.store.claim_shadow(invid, holder).is_err() {
            return Err(DbError::ShadowInvariant {
                invid,
                message: "freshly allocated id is already checked out".into(),
            });
        }
        let fields = self.instantiable(&type_def, None)?;
        let shadow = EditObject::create(invid, &type_def, |f| fields.contains(&f.id));
        if let Err(err) = self
            .txn
            .as_mut()
            .ok_or(DbError::NotInEditContext(invid))
            .and_then(|set| set.insert(shadow))
        {
            self.store.release_shadow(invid, txn);
            return Err(err);
        }

        let mut out = ReturnVal::with_invid(invid);
        let placed = match embedded_in {
            Some(container) => self.mutate(
                invid,
                FieldOp::Set {
                    field: CONTAINER_FIELD,
                    value: Some(Value::Invid(container)),
                },
                Mode::INTERNAL,
            )?,
            None => {
                let owners: Vec<Value> = self.initial_owners().into_iter().map(Value::Invid).collect();
                if owners.is_empty() {
                    ReturnVal::success()
                } else {
                    self.mutate(
                        invid,
                        FieldOp::AddElements {
                            field: OWNER_LIST_FIELD,
                            values: owners,
                        },
                        Mode::INTERNAL,
                    )?
                }
            }
        };
        out = out.merge(placed);
        debug!(session = %self.id, %invid, success = out.success, "object created");
        Ok(out)
    }

    /// Removes an object through its type's removal hook and the standard
    /// field teardown.
    pub fn remove_object(&mut self, invid: Invid) -> DbResult<ReturnVal> {
        self.enter()?;
        if self.txn.is_none() {
            return Ok(no_transaction());
        }
        let schema = self.store.schema();
        let type_def = Arc::clone(schema.object_type(invid.type_id())?);
        let status = self.shadow(invid).map(EditObject::status);
        if status.is_some_and(ObjectStatus::is_removal) {
            return Ok(ReturnVal::with_invid(invid));
        }
        let (deletable, removable) = {
            let Some(found) = self.find(invid) else {
                return Ok(not_found(invid));
            };
            let perm = self.object_perm(&found)?;
            let deletable = self.perms.is_supergash()
                || perm.is_deletable()
                || (status == Some(ObjectStatus::Creating) && perm.is_creatable());
            let removable = type_def.behavior().can_remove(&self.hook_ctx(), &found);
            (deletable, removable)
        };
        if !deletable {
            return Ok(denied(format!("no permission to delete {invid}")));
        }
        if !removable {
            return Ok(ReturnVal::failure(
                FailureKind::NotRemovable,
                "Removal refused",
                format!("{invid} may not be removed"),
            ));
        }
        if status.is_none() {
            let Some(stored) = self.store.get(invid) else {
                return Ok(not_found(invid));
            };
            let rv = self.checkout(stored)?;
            if !rv.success {
                return Ok(rv);
            }
        }

        let checkpoint = self.internal_checkpoint("remove")?;
        let hook = {
            let shadow = self.shadow(invid).ok_or(DbError::NotInEditContext(invid))?;
            type_def.behavior().remove(&self.hook_ctx(), shadow)
        };
        let finalized = finalize_remove(&mut Remover { session: self }, &type_def, invid, &checkpoint, hook.success)?;
        let mut out = hook.merge(finalized);
        if !out.success {
            out.failure.get_or_insert(FailureKind::NotRemovable);
        }
        info!(session = %self.id, %invid, success = out.success, "remove");
        Ok(out)
    }

    /// Schedules an object for removal after the configured grace period.
    pub fn inactivate(&mut self, invid: Invid) -> DbResult<ReturnVal> {
        let rv = self.edit_object(invid)?;
        if !rv.success {
            return Ok(rv);
        }
        let schema = self.store.schema();
        let type_def = Arc::clone(schema.object_type(invid.type_id())?);
        let allowed = {
            let shadow = self.shadow(invid).ok_or(DbError::NotInEditContext(invid))?;
            type_def.behavior().can_inactivate(&self.hook_ctx(), shadow)
        };
        if !allowed {
            return Ok(ReturnVal::failure(
                FailureKind::NotInactivatable,
                "Inactivation refused",
                format!("{} objects cannot be inactivated", type_def.name),
            ));
        }

        let checkpoint = self.internal_checkpoint("inactivate")?;
        let hook = {
            let shadow = self.shadow(invid).ok_or(DbError::NotInEditContext(invid))?;
            type_def.behavior().inactivate(&self.hook_ctx(), shadow)
        };
        if !hook.success {
            self.rollback_internal(&checkpoint)?;
            return Ok(hook);
        }
        let grace = i64::from(self.store.config().inactivation_grace_days);
        let removal_date = now_millis().saturating_add(grace.saturating_mul(DAY_MS));
        let set = self.mutate(
            invid,
            FieldOp::Set {
                field: REMOVAL_FIELD,
                value: Some(Value::Date(removal_date)),
            },
            Mode::INTERNAL,
        )?;
        let out = hook.merge(set);
        if !out.success {
            self.rollback_internal(&checkpoint)?;
            return Ok(out);
        }
        self.pop_internal(&checkpoint)?;
        let label = self.label_of(&type_def, invid);
        if let Some(set) = self.txn.as_mut() {
            set.push_event(AuditEvent::ObjectInactivated {
                invid,
                label,
                removal_date,
            });
        }
        info!(session = %self.id, %invid, removal_date, "inactivated");
        Ok(out.rescan_field(invid, REMOVAL_FIELD))
    }

    pub fn reactivate(&mut self, invid: Invid) -> DbResult<ReturnVal> {
        let rv = self.edit_object(invid)?;
        if !rv.success {
            return Ok(rv);
        }
        let schema = self.store.schema();
        let type_def = Arc::clone(schema.object_type(invid.type_id())?);
        let inactive = self
            .shadow(invid)
            .is_some_and(|shadow| shadow.removal_date().is_some());
        if !inactive {
            return Ok(ReturnVal::failure(
                FailureKind::RejectedValue,
                "Reactivation refused",
                format!("{invid} is not inactivated"),
            ));
        }

        let checkpoint = self.internal_checkpoint("reactivate")?;
        let hook = {
            let shadow = self.shadow(invid).ok_or(DbError::NotInEditContext(invid))?;
            type_def.behavior().reactivate(&self.hook_ctx(), shadow)
        };
        if !hook.success {
            self.rollback_internal(&checkpoint)?;
            return Ok(hook);
        }
        let cleared = self.mutate(
            invid,
            FieldOp::Set {
                field: REMOVAL_FIELD,
                value: None,
            },
            Mode::INTERNAL,
        )?;
        let out = hook.merge(cleared);
        if !out.success {
            self.rollback_internal(&checkpoint)?;
            return Ok(out);
        }
        self.pop_internal(&checkpoint)?;
        let label = self.label_of(&type_def, invid);
        if let Some(set) = self.txn.as_mut() {
            set.push_event(AuditEvent::ObjectReactivated { invid, label });
        }
        info!(session = %self.id, %invid, "reactivated");
        Ok(out.rescan_field(invid, REMOVAL_FIELD))
    }

    fn label_of(&self, type_def: &ObjectTypeDef, invid: Invid) -> String {
        self.find(invid)
            .map(|found| found.label(type_def))
            .unwrap_or_else(|| invid.to_string())
    }

    /// Creates a copy of `invid`, carrying over every plain field the type
    /// lets through except namespace-bound ones.
    pub fn clone_object(&mut self, invid: Invid) -> DbResult<ReturnVal> {
        self.enter()?;
        if self.txn.is_none() {
            return Ok(no_transaction());
        }
        let schema = self.store.schema();
        let type_def = Arc::clone(schema.object_type(invid.type_id())?);
        if type_def.embedded {
            return Ok(ReturnVal::failure(
                FailureKind::NotEditable,
                "Clone refused",
                format!("embedded {} objects cannot be cloned", type_def.name),
            ));
        }
        let ops = {
            let source = self.visible(invid)?;
            let ctx = self.hook_ctx();
            let hooks = type_def.behavior();
            if !hooks.can_clone(&ctx, &source) {
                return Ok(ReturnVal::failure(
                    FailureKind::NotEditable,
                    "Clone refused",
                    format!("{invid} may not be cloned"),
                ));
            }
            let mut ops = Vec::new();
            for def in type_def.custom_fields() {
                if def.namespace.is_some()
                    || !def.kind.is_value_kind()
                    || !source.is_defined(def.id)
                    || !hooks.can_clone_field(&ctx, &source, def)
                {
                    continue;
                }
                ops.push(if def.vector {
                    FieldOp::AddElements {
                        field: def.id,
                        values: source.elements(def.id).to_vec(),
                    }
                } else {
                    FieldOp::Set {
                        field: def.id,
                        value: source.scalar(def.id).cloned(),
                    }
                });
            }
            ops
        };

        let mut out = self.create_object(type_def.id, None)?;
        let Some(copy) = out.invid.filter(|_| out.success) else {
            return Ok(out);
        };
        for op in ops {
            // Fields the session may not set are left for the caller.
            let rv = self.mutate(copy, op, Mode::QUIET)?;
            out = out.merge(rv);
        }
        out.invid = Some(copy);
        debug!(session = %self.id, source = %invid, %copy, "object cloned");
        Ok(out)
    }

    // Fields

    pub fn get_field(&mut self, invid: Invid, field: u16) -> DbResult<FieldValue> {
        self.enter()?;
        let schema = self.store.schema();
        let type_def = schema.object_type(invid.type_id())?;
        let def = type_def.field(field)?;
        let found = self.visible(invid)?;
        self.read_field(type_def, def, &found)
    }

    /// Every field of `invid` the session may see, in field id order.
    pub fn get_all_fields(&mut self, invid: Invid) -> DbResult<Vec<(u16, FieldValue)>> {
        self.enter()?;
        let schema = self.store.schema();
        let type_def = schema.object_type(invid.type_id())?;
        let found = self.visible(invid)?;
        let mut out = Vec::new();
        for def in type_def.fields() {
            if !self.field_perm(&found, def.id)?.is_visible() {
                continue;
            }
            let value = self.read_field(type_def, def, &found)?;
            if value.is_defined() {
                out.push((def.id, value));
            }
        }
        Ok(out)
    }

    fn read_field(&self, type_def: &ObjectTypeDef, def: &FieldDef, found: &Found<'_>) -> DbResult<FieldValue> {
        if !self.field_perm(found, def.id)?.is_visible() {
            return Err(DbError::PermissionDenied(format!(
                "cannot view {} of {}",
                def.name,
                found.invid()
            )));
        }
        if def.virtualized {
            return Ok(type_def
                .behavior()
                .virtual_value(&self.hook_ctx(), found, def)
                .unwrap_or_else(|| FieldValue::empty_for(def)));
        }
        Ok(found
            .field_value(def.id)
            .cloned()
            .unwrap_or_else(|| FieldValue::empty_for(def)))
    }

    pub fn set_field(&mut self, invid: Invid, field: u16, value: Option<Value>) -> DbResult<ReturnVal> {
        self.apply_op(invid, FieldOp::Set { field, value })
    }

    pub fn set_element(&mut self, invid: Invid, field: u16, index: usize, value: Value) -> DbResult<ReturnVal> {
        self.apply_op(invid, FieldOp::SetElement { field, index, value })
    }

    pub fn add_element(&mut self, invid: Invid, field: u16, value: Value) -> DbResult<ReturnVal> {
        self.apply_op(invid, FieldOp::AddElement { field, value })
    }

    pub fn add_elements(&mut self, invid: Invid, field: u16, values: Vec<Value>) -> DbResult<ReturnVal> {
        self.apply_op(invid, FieldOp::AddElements { field, values })
    }

    pub fn delete_element(&mut self, invid: Invid, field: u16, index: usize) -> DbResult<ReturnVal> {
        self.apply_op(invid, FieldOp::DeleteElement { field, index })
    }

    pub fn delete_value(&mut self, invid: Invid, field: u16, value: Value) -> DbResult<ReturnVal> {
        self.apply_op(invid, FieldOp::DeleteValue { field, value })
    }

    pub fn delete_elements(&mut self, invid: Invid, field: u16, values: Vec<Value>) -> DbResult<ReturnVal> {
        self.apply_op(invid, FieldOp::DeleteElements { field, values })
    }

    /// Runs one field operation with full permission and wizard processing.
    pub fn apply_op(&mut self, invid: Invid, op: FieldOp) -> DbResult<ReturnVal> {
        self.enter()?;
        self.mutate(invid, op, Mode::CLIENT)
    }

    /// Empties a field of any kind.
    pub fn clear_field(&mut self, invid: Invid, field: u16) -> DbResult<ReturnVal> {
        self.enter()?;
        self.undefine(invid, field, Mode::CLIENT)
    }

    pub fn set_secret(&mut self, invid: Invid, field: u16, plaintext: &str) -> DbResult<ReturnVal> {
        self.enter()?;
        if self.txn.is_none() {
            return Ok(no_transaction());
        }
        let schema = self.store.schema();
        let def = schema.field(invid.type_id(), field)?.clone();
        let writable = self.writable(invid, &def, Mode::CLIENT)?;
        self.with_env(invid, &def, writable, None, |env, obj| mutate::set_secret(env, obj, plaintext))
    }

    fn writable(&self, invid: Invid, def: &FieldDef, mode: Mode) -> DbResult<bool> {
        if !mode.check_perms || self.perms.is_supergash() {
            return Ok(true);
        }
        let schema = self.store.schema();
        let type_def = schema.object_type(invid.type_id())?;
        let shadow = self.shadow(invid).ok_or(DbError::NotInEditContext(invid))?;
        let perm = self.field_perm(shadow, def.id)?;
        let creating = shadow.status() == ObjectStatus::Creating;
        Ok((perm.is_editable() || (creating && perm.is_creatable()))
            && type_def.behavior().can_write(&self.hook_ctx(), shadow))
    }

    fn with_env<T>(
        &mut self,
        invid: Invid,
        def: &FieldDef,
        writable: bool,
        namespace: Option<&DbNameSpace>,
        run: impl FnOnce(&MutationEnv<'_>, &mut EditObject) -> DbResult<T>,
    ) -> DbResult<T> {
        let txn = self.txn_id().ok_or(DbError::NotInEditContext(invid))?;
        let ctx = context(&self.store, &self.username, &self.perms, self.oversight, Some(txn));
        let config = self.store.config();
        let env = MutationEnv {
            ctx: &ctx,
            def,
            txn,
            namespace,
            writable,
            default_max_len: config.default_max_string_len,
            default_max_size: config.default_max_vector_size,
        };
        let shadow = self
            .txn
            .as_mut()
            .ok_or(DbError::NotInEditContext(invid))?
            .shadow_mut(invid)?;
        run(&env, shadow)
    }

    fn undefine(&mut self, invid: Invid, field: u16, mode: Mode) -> DbResult<ReturnVal> {
        if self.txn.is_none() {
            return Ok(no_transaction());
        }
        let schema = self.store.schema();
        let def = schema.field(invid.type_id(), field)?.clone();
        if def.kind.is_value_kind() {
            let shadow = self.shadow(invid).ok_or(DbError::NotInEditContext(invid))?;
            let op = if def.vector {
                let values = shadow.elements(field).to_vec();
                if values.is_empty() {
                    return Ok(ReturnVal::success());
                }
                FieldOp::DeleteElements { field, values }
            } else {
                FieldOp::Set { field, value: None }
            };
            return self.mutate(invid, op, mode);
        }
        let writable = self.writable(invid, &def, mode)?;
        let rv = self.with_env(invid, &def, writable, None, |env, obj| mutate::set_undefined(env, obj))?;
        Ok(if rv.success { rv.rescan_field(invid, field) } else { rv })
    }

    /// The mutation protocol: validate, consult the wizard hook, then claim
    /// and assign, keeping symmetric references in step.
    fn mutate(&mut self, invid: Invid, op: FieldOp, mode: Mode) -> DbResult<ReturnVal> {
        if self.txn.is_none() {
            return Ok(no_transaction());
        }
        let schema = self.store.schema();
        let type_def = Arc::clone(schema.object_type(invid.type_id())?);
        let def = type_def.field(op.field())?.clone();
        let namespace = match &def.namespace {
            Some(name) => Some(self.store.namespaces().get(name)?),
            None => None,
        };
        let writable = self.writable(invid, &def, mode)?;
        let before = self
            .shadow(invid)
            .ok_or(DbError::NotInEditContext(invid))?
            .invids(def.id);

        let (op, mut rescan) = match self.with_env(invid, &def, writable, namespace.as_deref(), |env, obj| {
            mutate::prepare(env, obj, op)
        })? {
            Prepared::Rejected(rv) => return Ok(rv),
            Prepared::Ready { op, rescan } => (op, rescan),
        };

        if mode.interactive && self.wizards && self.oversight {
            let outcome = {
                let shadow = self.shadow(invid).ok_or(DbError::NotInEditContext(invid))?;
                type_def.behavior().wizard_hook(&self.hook_ctx(), shadow, &op)
            };
            match outcome {
                WizardOutcome::Continue(hints) => rescan.union_rescan(&hints),
                WizardOutcome::Handled(rv) => return Ok(rv),
                WizardOutcome::Substitute(ops) => return self.substitute(ops),
                WizardOutcome::Confirm { title, text } => {
                    let token = self.next_token;
                    self.next_token += 1;
                    self.pending_wizards.insert(token, PendingWizard { invid, op });
                    debug!(session = %self.id, %invid, token, "wizard awaiting confirmation");
                    return Ok(ReturnVal::pending(WizardPrompt { token, title, text }));
                }
            }
        }

        let Some((_, back_field)) = def.symmetric_link() else {
            return self.with_env(invid, &def, writable, namespace.as_deref(), |env, obj| {
                mutate::apply(env, obj, op, rescan)
            });
        };
        let checkpoint = self.internal_checkpoint("link")?;
        let mut out = self.with_env(invid, &def, writable, namespace.as_deref(), |env, obj| {
            mutate::apply(env, obj, op, rescan)
        })?;
        if out.success {
            let after = self
                .shadow(invid)
                .ok_or(DbError::NotInEditContext(invid))?
                .invids(def.id);
            let links = self.sync_links(invid, back_field, &before, &after)?;
            out = out.merge(links);
        }
        if out.success {
            self.pop_internal(&checkpoint)?;
        } else {
            self.rollback_internal(&checkpoint)?;
        }
        Ok(out)
    }

    fn substitute(&mut self, ops: Vec<(Invid, FieldOp)>) -> DbResult<ReturnVal> {
        let checkpoint = self.internal_checkpoint("wizard")?;
        let mut out = ReturnVal::success();
        for (target, op) in ops {
            let rv = if self.shadow(target).is_some() {
                self.mutate(target, op, Mode::QUIET)?
            } else {
                let checked_out = self.edit_inner(target)?;
                if checked_out.success {
                    self.mutate(target, op, Mode::QUIET)?
                } else {
                    checked_out
                }
            };
            out = out.merge(rv);
            if !out.success {
                self.rollback_internal(&checkpoint)?;
                return Ok(out);
            }
        }
        self.pop_internal(&checkpoint)?;
        Ok(out)
    }

    /// [`Self::edit_object`] without the session entry checks.
    fn edit_inner(&mut self, invid: Invid) -> DbResult<ReturnVal> {
        let Some(stored) = self.store.get(invid) else {
            return Ok(not_found(invid));
        };
        let schema = self.store.schema();
        let type_def = schema.object_type(invid.type_id())?;
        let perm = self.object_perm(&*stored)?;
        if !perm.is_visible() {
            return Ok(not_found(invid));
        }
        let writable = self.perms.is_supergash()
            || (perm.is_editable()
                && type_def.behavior().can_write(&self.hook_ctx(), &*stored));
        if !writable {
            return Ok(denied(format!("no permission to edit {invid}")));
        }
        self.checkout(stored)
    }

    /// Answers a pending wizard confirmation.
    pub fn respond_wizard(&mut self, token: u64, accept: bool) -> DbResult<ReturnVal> {
        self.enter()?;
        let Some(pending) = self.pending_wizards.remove(&token) else {
            return Ok(ReturnVal::failure(
                FailureKind::NotFound,
                "Unknown wizard",
                format!("no pending confirmation {token}"),
            ));
        };
        if !accept {
            debug!(session = %self.id, token, "wizard declined");
            return Ok(ReturnVal::failure(
                FailureKind::WizardDeclined,
                "Cancelled",
                format!("{} on {} was declined", pending.op.name(), pending.invid),
            ));
        }
        if self.shadow(pending.invid).is_none() {
            return Ok(not_found(pending.invid));
        }
        self.mutate(pending.invid, pending.op, Mode::QUIET)
    }

    pub fn pending_wizards(&self) -> Vec<u64> {
        self.pending_wizards.keys().copied().collect()
    }

    // Symmetric references

    fn sync_links(&mut self, owner: Invid, back_field: u16, before: &[Invid], after: &[Invid]) -> DbResult<ReturnVal> {
        let mut out = ReturnVal::success();
        for target in before.iter().filter(|t| !after.contains(t)) {
            out = out.merge(self.unlink(*target, back_field, owner)?);
            if !out.success {
                return Ok(out);
            }
        }
        for target in after.iter().filter(|t| !before.contains(t)) {
            out = out.merge(self.link(*target, back_field, owner)?);
            if !out.success {
                return Ok(out);
            }
        }
        Ok(out)
    }

    /// Checks out the far end of a reference. A session that cannot edit it
    /// may still proceed when the target type allows anonymous changes.
    fn checkout_for_link(&mut self, target: Invid, field: u16, linking: bool) -> DbResult<ReturnVal> {
        if self.shadow(target).is_some() {
            return Ok(ReturnVal::success());
        }
        let Some(stored) = self.store.get(target) else {
            return Ok(not_found(target));
        };
        let schema = self.store.schema();
        let type_def = schema.object_type(target.type_id())?;
        let ctx = self.hook_ctx();
        let editable = self.perms.is_supergash()
            || (self.field_perm(&*stored, field)?.is_editable()
                && type_def.behavior().can_write(&ctx, &*stored));
        if !editable {
            let anonymous = if linking {
                type_def.behavior().anonymous_link_ok(&ctx, &*stored, field)
            } else {
                type_def.behavior().anonymous_unlink_ok(&ctx, &*stored, field)
            };
            if !anonymous {
                return Ok(denied(format!(
                    "cannot {} {} of {target}",
                    if linking { "link into" } else { "unlink from" },
                    type_def.field(field).map_or("field", |d| d.name.as_str())
                )));
            }
        }
        self.checkout(stored)
    }

    fn link(&mut self, target: Invid, field: u16, back: Invid) -> DbResult<ReturnVal> {
        let rv = self.checkout_for_link(target, field, true)?;
        if !rv.success {
            return Ok(rv);
        }
        let schema = self.store.schema();
        let def = schema.field(target.type_id(), field)?;
        let shadow = self.shadow(target).ok_or(DbError::NotInEditContext(target))?;
        let value = Value::Invid(back);
        let op = if def.vector {
            if shadow.elements(field).contains(&value) {
                return Ok(ReturnVal::success());
            }
            FieldOp::AddElement { field, value }
        } else {
            if shadow.scalar(field) == Some(&value) {
                return Ok(ReturnVal::success());
            }
            FieldOp::Set {
                field,
                value: Some(value),
            }
        };
        let rv = self.mutate(target, op, Mode::INTERNAL)?;
        Ok(if rv.success { rv.rescan_field(target, field) } else { rv })
    }

    fn unlink(&mut self, target: Invid, field: u16, back: Invid) -> DbResult<ReturnVal> {
        if self.find(target).is_none() {
            return Ok(ReturnVal::success());
        }
        let rv = self.checkout_for_link(target, field, false)?;
        if !rv.success {
            return Ok(rv);
        }
        let schema = self.store.schema();
        let def = schema.field(target.type_id(), field)?;
        let shadow = self.shadow(target).ok_or(DbError::NotInEditContext(target))?;
        let value = Value::Invid(back);
        let op = if def.vector {
            if !shadow.elements(field).contains(&value) {
                return Ok(ReturnVal::success());
            }
            FieldOp::DeleteValue { field, value }
        } else {
            if shadow.scalar(field) != Some(&value) {
                return Ok(ReturnVal::success());
            }
            FieldOp::Set { field, value: None }
        };
        let rv = self.mutate(target, op, Mode::INTERNAL)?;
        Ok(if rv.success { rv.rescan_field(target, field) } else { rv })
    }

    // Permission matrices

    fn edit_matrix(
        &mut self,
        invid: Invid,
        field: u16,
        run: impl FnOnce(&MatrixEnv<'_>, &mut EditObject) -> DbResult<ReturnVal>,
    ) -> DbResult<ReturnVal> {
        self.enter()?;
        if self.txn.is_none() {
            return Ok(no_transaction());
        }
        let schema = self.store.schema();
        let def = schema.field(invid.type_id(), field)?.clone();
        let writable = self.writable(invid, &def, Mode::CLIENT)?;
        let env = MatrixEnv {
            def: &def,
            schema: &schema,
            writable,
            supergash: self.perms.is_supergash(),
            delegatable: self.perms.delegatable(MatrixRole::for_field(field)),
        };
        let shadow = self
            .txn
            .as_mut()
            .ok_or(DbError::NotInEditContext(invid))?
            .shadow_mut(invid)?;
        let rv = run(&env, shadow)?;
        Ok(if rv.success { rv.rescan_field(invid, field) } else { rv })
    }

    /// Sets one entry of a permission matrix field. The entry may not exceed
    /// what this session can itself delegate.
    pub fn set_perm(&mut self, invid: Invid, field: u16, key: PermKey, entry: PermEntry) -> DbResult<ReturnVal> {
        self.edit_matrix(invid, field, |env, obj| matrix_field::set_perm(env, obj, key, entry))
    }

    pub fn set_field_perms(
        &mut self,
        invid: Invid,
        field: u16,
        type_id: u16,
        entry: PermEntry,
        include_builtins: bool,
    ) -> DbResult<ReturnVal> {
        let schema = self.store.schema();
        let target = Arc::clone(schema.object_type(type_id)?);
        self.edit_matrix(invid, field, |env, obj| {
            matrix_field::set_field_perms(env, obj, &target, entry, include_builtins)
        })
    }

    pub fn reset_perms(&mut self, invid: Invid, field: u16) -> DbResult<ReturnVal> {
        self.edit_matrix(invid, field, matrix_field::reset_perms)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.logout();
    }
}

/// Removal callbacks, run with permission and wizard checks off.
struct Remover<'s> {
    session: &'s mut Session,
}

impl RemovalDriver for Remover<'_> {
    fn shadow(&self, invid: Invid) -> DbResult<&EditObject> {
        self.session
            .shadow(invid)
            .ok_or(DbError::NotInEditContext(invid))
    }

    fn set_deleting(&mut self, invid: Invid, deleting: bool) -> DbResult<()> {
        self.session.shadow_mut(invid)?.set_deleting(deleting);
        Ok(())
    }

    fn set_status(&mut self, invid: Invid, status: ObjectStatus) -> DbResult<()> {
        self.session.shadow_mut(invid)?.set_status(status);
        Ok(())
    }

    fn delete_element(&mut self, invid: Invid, field: &FieldDef, index: usize) -> DbResult<ReturnVal> {
        self.session.mutate(
            invid,
            FieldOp::DeleteElement {
                field: field.id,
                index,
            },
            Mode::INTERNAL,
        )
    }

    fn clear_scalar(&mut self, invid: Invid, field: &FieldDef) -> DbResult<ReturnVal> {
        self.session.mutate(
            invid,
            FieldOp::Set {
                field: field.id,
                value: None,
            },
            Mode::INTERNAL,
        )
    }

    fn set_undefined(&mut self, invid: Invid, field: &FieldDef) -> DbResult<ReturnVal> {
        self.session.undefine(invid, field.id, Mode::INTERNAL)
    }

    fn rollback(&mut self, checkpoint: &str) -> DbResult<()> {
        self.session.rollback_internal(checkpoint)
    }

    fn pop_checkpoint(&mut self, checkpoint: &str) -> DbResult<()> {
        self.session.pop_internal(checkpoint)
    }

    fn log(&mut self, event: AuditEvent) {
        if let Some(set) = self.session.txn.as_mut() {
            set.push_event(event);
        }
    }
}

fn clean_matrices(obj: &mut EditObject, type_def: &ObjectTypeDef, schema: &Schema) {
    let invid = obj.invid();
    for def in type_def.fields().filter(|f| f.kind == FieldKind::PermMatrix) {
        if let Some(field) = obj.field_mut(def.id)
            && let FieldValue::Matrix(matrix) = field.value_mut()
        {
            let removed = matrix_field::clean(matrix, schema);
            if removed > 0 {
                debug!(%invid, field = def.id, removed, "dropped orphaned permission entries");
            }
        }
    }
}

fn describe_changes(obj: &EditObject, type_def: &ObjectTypeDef, schema: &Schema) -> Vec<AuditEvent> {
    let invid = obj.invid();
    let label = obj.label(type_def);
    let original = obj.original();
    let mut events = Vec::new();
    let mut changes = Vec::new();
    for def in type_def.fields().filter(|f| !is_history_field(f.id)) {
        let older = original.and_then(|o| ObjectView::field(&**o, def.id));
        let newer = ObjectView::field(obj, def.id);
        if def.kind == FieldKind::PermMatrix {
            let as_matrix = |f: Option<&DbField>| f.and_then(|f| f.value().as_matrix()).cloned().unwrap_or_default();
            if let Some(diff) = matrix_field::describe_diff(&as_matrix(newer), &as_matrix(older), schema) {
                events.push(AuditEvent::PermissionsChanged {
                    invid,
                    field: def.id,
                    diff,
                });
            }
            continue;
        }
        let change = match newer {
            Some(field) => field.diff(older),
            None => older.filter(|f| f.is_defined()).map(|_| "cleared".to_string()),
        };
        if let Some(change) = change {
            changes.push(FieldChange {
                field: def.id,
                name: def.name.to_string(),
                change,
            });
        }
    }
    let headline = match obj.status() {
        ObjectStatus::Creating => Some(AuditEvent::ObjectCreated { invid, label }),
        _ if !changes.is_empty() => Some(AuditEvent::ObjectEdited {
            invid,
            label,
            changes,
        }),
        _ => None,
    };
    headline.into_iter().chain(events).collect()
}

fn stamp_history(obj: &mut EditObject, type_def: &ObjectTypeDef, username: &str, now: i64) -> DbResult<()> {
    let created = obj.status() == ObjectStatus::Creating;
    let mut stamp = |field: u16, value: Value| -> DbResult<()> {
        let def = type_def.field(field)?;
        obj.ensure_field(def).set_raw(FieldValue::Scalar(Some(value)));
        Ok(())
    };
    if created {
        stamp(CREATION_DATE_FIELD, Value::Date(now))?;
        stamp(CREATOR_FIELD, Value::from(username))?;
    }
    stamp(MODIFICATION_DATE_FIELD, Value::Date(now))?;
    stamp(MODIFIER_FIELD, Value::from(username))
}
