use crate::config::StoreConfig;
use crate::error::{DbError, DbResult, ResourceType};
use crate::field::codec::ByteReader;
use crate::field::Value;
use crate::invid::Invid;
use crate::log::{AuditEvent, AuditRecord, DbLog};
use crate::namespace::{FieldRef, NamespaceRegistry, TxnId};
use crate::object::{DbObject, ObjectView};
use crate::schema::{Schema, bootstrap};
use compact_str::CompactString;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(saturating_millis)
        .unwrap_or_default()
}

fn saturating_millis(elapsed: Duration) -> i64 {
    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
}

/// Committed records of one object type.
#[derive(Debug, Clone, Default)]
pub struct ObjectTable {
    objects: im::HashMap<u32, Arc<DbObject>>,
    next_num: u32,
    generation: u64,
}

impl ObjectTable {
    pub fn get(&self, num: u32) -> Option<&Arc<DbObject>> {
        self.objects.get(&num)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// O(1) persistent copy for readers.
    pub fn snapshot(&self) -> im::HashMap<u32, Arc<DbObject>> {
        self.objects.clone()
    }
}

/// The session and transaction holding an object checked out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowHolder {
    pub session: Uuid,
    pub username: CompactString,
    pub txn: TxnId,
}

/// Out-of-band controls for one session, reachable from other threads.
#[derive(Debug)]
pub struct SessionControl {
    id: Uuid,
    username: CompactString,
    kill_reason: Mutex<Option<String>>,
    last_activity_ms: AtomicI64,
    /// Open transaction and its description. Whoever takes it out owns the
    /// transaction's end.
    open_txn: Mutex<Option<(TxnId, String)>>,
}

impl SessionControl {
    pub(crate) fn new(id: Uuid, username: impl Into<CompactString>) -> Self {
        Self {
            id,
            username: username.into(),
            kill_reason: Mutex::new(None),
            last_activity_ms: AtomicI64::new(now_millis()),
            open_txn: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn kill(&self, reason: impl Into<String>) {
        let mut slot = self.kill_reason.lock();
        if slot.is_none() {
            *slot = Some(reason.into());
        }
    }

    pub fn kill_reason(&self) -> Option<String> {
        self.kill_reason.lock().clone()
    }

    pub(crate) fn touch(&self) {
        self.last_activity_ms.store(now_millis(), Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn begin_txn(&self, txn: TxnId, description: &str) {
        *self.open_txn.lock() = Some((txn, description.to_string()));
    }

    /// Claims the end of `txn`. False if it was already ended elsewhere.
    pub(crate) fn end_txn(&self, txn: TxnId) -> bool {
        let mut slot = self.open_txn.lock();
        if slot.as_ref().is_some_and(|(open, _)| *open == txn) {
            *slot = None;
            return true;
        }
        false
    }

    fn take_txn(&self) -> Option<(TxnId, String)> {
        self.open_txn.lock().take()
    }
}

/// A committed change produced by a transaction.
#[derive(Debug, Clone)]
pub(crate) enum Integration {
    Put(Arc<DbObject>),
    Remove(Invid),
}

impl Integration {
    fn type_id(&self) -> u16 {
        match self {
            Integration::Put(obj) => obj.type_id(),
            Integration::Remove(invid) => invid.type_id(),
        }
    }
}

/// Shared in-memory store.
pub struct DbStore {
    config: StoreConfig,
    schema: RwLock<Arc<Schema>>,
    tables: RwLock<BTreeMap<u16, Arc<RwLock<ObjectTable>>>>,
    namespaces: NamespaceRegistry,
    shadows: Mutex<HashMap<Invid, ShadowHolder>>,
    sessions: Mutex<HashMap<Uuid, Arc<SessionControl>>>,
    clock: AtomicU64,
    next_txn: AtomicU64,
    audit: Arc<dyn DbLog>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for DbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbStore")
            .field("schema_generation", &self.schema.read().generation())
            .field("tables", &self.tables.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DbStore {
    pub fn new(config: StoreConfig, audit: Arc<dyn DbLog>) -> DbResult<Self> {
        config.validate()?;
        let schema = bootstrap::builtin_schema(config.case_insensitive_namespaces)?;
        let store = Self {
            config,
            schema: RwLock::new(Arc::new(Schema::default())),
            tables: RwLock::new(BTreeMap::new()),
            namespaces: NamespaceRegistry::default(),
            shadows: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(1),
            next_txn: AtomicU64::new(1),
            audit,
            shutting_down: AtomicBool::new(false),
        };
        store.install_schema(schema);
        for obj in bootstrap::bootstrap_objects(store.config.root_secret(), now_millis()) {
            store.load_object(obj)?;
        }
        info!(
            idle_timeout_secs = store.config.idle_timeout_secs,
            max_checkpoint_depth = store.config.max_checkpoint_depth,
            case_insensitive_namespaces = store.config.case_insensitive_namespaces,
            audit_log = ?store.config.audit_log_path,
            "shadowstore opened"
        );
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema.read())
    }

    pub fn namespaces(&self) -> &NamespaceRegistry {
        &self.namespaces
    }

    pub(crate) fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn next_txn(&self) -> TxnId {
        TxnId(self.next_txn.fetch_add(1, Ordering::SeqCst))
    }

    fn install_schema(&self, schema: Schema) {
        {
            let mut tables = self.tables.write();
            for type_id in schema.type_ids() {
                tables.entry(type_id).or_insert_with(|| {
                    Arc::new(RwLock::new(ObjectTable {
                        next_num: 1,
                        ..ObjectTable::default()
                    }))
                });
            }
        }
        for (name, case_insensitive) in schema.namespaces() {
            self.namespaces.ensure(name, case_insensitive);
        }
        *self.schema.write() = Arc::new(schema);
    }

    /// Applies a schema edit. Cached permission state notices through the
    /// schema generation counter.
    pub fn update_schema<T>(&self, edit: impl FnOnce(&mut Schema) -> DbResult<T>) -> DbResult<T> {
        let mut next = (*self.schema()).clone();
        let out = edit(&mut next)?;
        let generation = next.generation();
        self.install_schema(next);
        debug!(generation, "schema updated");
        Ok(out)
    }

    pub fn table(&self, type_id: u16) -> DbResult<Arc<RwLock<ObjectTable>>> {
        self.tables
            .read()
            .get(&type_id)
            .cloned()
            .ok_or_else(|| DbError::type_not_found(type_id))
    }

    pub fn get(&self, invid: Invid) -> Option<Arc<DbObject>> {
        let table = self.table(invid.type_id()).ok()?;
        let guard = table.read();
        guard.get(invid.num()).cloned()
    }

    pub fn table_generation(&self, type_id: u16) -> u64 {
        self.table(type_id).map_or(0, |t| t.read().generation())
    }

    /// Consistent snapshots of several tables, read-locked together in
    /// ascending type order.
    pub fn snapshot_tables(
        &self,
        type_ids: &[u16],
    ) -> DbResult<BTreeMap<u16, im::HashMap<u32, Arc<DbObject>>>> {
        let ordered: BTreeSet<u16> = type_ids.iter().copied().collect();
        let tables = ordered
            .iter()
            .map(|t| Ok((*t, self.table(*t)?)))
            .collect::<DbResult<Vec<_>>>()?;
        let guards: Vec<_> = tables.iter().map(|(t, table)| (*t, table.read())).collect();
        Ok(guards
            .iter()
            .map(|(t, guard)| (*t, guard.snapshot()))
            .collect())
    }

    pub(crate) fn allocate_invid(&self, type_id: u16) -> DbResult<Invid> {
        let table = self.table(type_id)?;
        let mut guard = table.write();
        let num = guard.next_num;
        guard.next_num = num
            .checked_add(1)
            .ok_or_else(|| DbError::InvalidArgument(format!("type {type_id} ids exhausted")))?;
        Ok(Invid::new(type_id, num))
    }

    /// Claims exclusive edit rights. On conflict returns the current holder.
    pub(crate) fn claim_shadow(&self, invid: Invid, holder: ShadowHolder) -> Result<(), ShadowHolder> {
        let mut shadows = self.shadows.lock();
        if let Some(existing) = shadows.get(&invid) {
            return Err(existing.clone());
        }
        shadows.insert(invid, holder);
        Ok(())
    }

    pub(crate) fn release_shadow(&self, invid: Invid, txn: TxnId) {
        let mut shadows = self.shadows.lock();
        if shadows.get(&invid).is_some_and(|h| h.txn == txn) {
            shadows.remove(&invid);
        }
    }

    pub fn shadow_holder(&self, invid: Invid) -> Option<ShadowHolder> {
        self.shadows.lock().get(&invid).cloned()
    }

    /// Installs committed changes under write locks on every touched table,
    /// taken in ascending type order, then finalizes namespace claims.
    pub(crate) fn integrate(&self, txn: TxnId, changes: Vec<Integration>) -> DbResult<()> {
        let touched: BTreeSet<u16> = changes.iter().map(Integration::type_id).collect();
        let tables = touched
            .iter()
            .map(|t| Ok((*t, self.table(*t)?)))
            .collect::<DbResult<Vec<_>>>()?;
        let mut guards: BTreeMap<u16, RwLockWriteGuard<'_, ObjectTable>> =
            tables.iter().map(|(t, table)| (*t, table.write())).collect();
        let generation = self.tick();
        for change in changes {
            let Some(guard) = guards.get_mut(&change.type_id()) else {
                continue;
            };
            match change {
                Integration::Put(obj) => {
                    let num = obj.invid().num();
                    guard.next_num = guard.next_num.max(num.saturating_add(1));
                    guard.objects.insert(num, obj);
                }
                Integration::Remove(invid) => {
                    guard.objects.remove(&invid.num());
                }
            }
            guard.generation = generation;
        }
        self.namespaces.commit(txn);
        drop(guards);
        Ok(())
    }

    /// Inserts a committed record, replacing any record with the same invid
    /// and registering its namespace-bound values.
    pub fn load_object(&self, obj: DbObject) -> DbResult<()> {
        let schema = self.schema();
        let def = schema.object_type(obj.type_id())?;
        for field in def.fields() {
            let Some(ns_name) = &field.namespace else {
                continue;
            };
            let ns = self.namespaces.get(ns_name)?;
            let holder = FieldRef::new(obj.invid(), field.id);
            if let Some(previous) = self.get(obj.invid())
                && let Some(old) = previous.field_value(field.id)
            {
                for value in old.values() {
                    ns.drop_persistent(value, holder);
                }
            }
            if let Some(current) = obj.field_value(field.id) {
                for value in current.values() {
                    ns.claim_persistent(value, holder)?;
                }
            }
        }
        let table = self.table(obj.type_id())?;
        let mut guard = table.write();
        let num = obj.invid().num();
        guard.next_num = guard.next_num.max(num.saturating_add(1));
        guard.objects.insert(num, Arc::new(obj));
        guard.generation = self.tick();
        Ok(())
    }

    /// Every committed record as consecutive checksummed frames.
    pub fn export_objects(&self) -> DbResult<Vec<u8>> {
        let type_ids: Vec<u16> = self.schema().type_ids().collect();
        let snapshots = self.snapshot_tables(&type_ids)?;
        let mut out = Vec::new();
        for table in snapshots.values() {
            let mut nums: Vec<&u32> = table.keys().collect();
            nums.sort();
            for num in nums {
                if let Some(obj) = table.get(num) {
                    obj.emit(&mut out)?;
                }
            }
        }
        Ok(out)
    }

    /// Loads frames written by [`Self::export_objects`]. Returns the number
    /// of records loaded.
    pub fn import_objects(&self, bytes: &[u8]) -> DbResult<usize> {
        let mut reader = ByteReader::new(bytes);
        let mut count = 0;
        while !reader.is_empty() {
            self.load_object(DbObject::receive(&mut reader)?)?;
            count += 1;
        }
        Ok(count)
    }

    /// Committed holder of `value` in namespace `ns_name`.
    pub fn lookup_unique(&self, ns_name: &str, value: &Value) -> DbResult<Option<FieldRef>> {
        Ok(self.namespaces.get(ns_name)?.lookup(value))
    }

    pub(crate) fn audit(&self, username: &str, event: AuditEvent) {
        let record = AuditRecord {
            timestamp_ms: now_millis(),
            username: username.to_string(),
            event,
        };
        if let Err(err) = self.audit.record(record) {
            warn!(error = %err, "failed to write audit record");
        }
    }

    pub(crate) fn register_session(&self, control: Arc<SessionControl>) -> DbResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(DbError::InvalidArgument("store is shutting down".into()));
        }
        self.sessions.lock().insert(control.id(), control);
        Ok(())
    }

    pub(crate) fn unregister_session(&self, id: Uuid) {
        self.sessions.lock().remove(&id);
    }

    pub fn session_ids(&self) -> Vec<Uuid> {
        self.sessions.lock().keys().copied().collect()
    }

    pub fn kill_session(&self, id: Uuid, reason: &str) -> DbResult<()> {
        let control = self
            .sessions
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound {
                resource_type: ResourceType::Session,
                resource_id: id.to_string(),
            })?;
        warn!(session = %id, username = control.username(), reason, "forced disconnect");
        self.revoke(&control, reason);
        Ok(())
    }

    /// Disconnects a session from the store side: flags it, aborts its open
    /// transaction and releases every shadow it holds. The client learns of
    /// it on its next call.
    fn revoke(&self, control: &SessionControl, reason: &str) {
        control.kill(reason);
        self.unregister_session(control.id());
        let Some((txn, description)) = control.take_txn() else {
            return;
        };
        self.namespaces.abort(txn);
        let released = {
            let mut shadows = self.shadows.lock();
            let before = shadows.len();
            shadows.retain(|_, holder| holder.txn != txn);
            before - shadows.len()
        };
        self.audit(
            control.username(),
            AuditEvent::TransactionAborted {
                txn: txn.0,
                description,
            },
        );
        info!(session = %control.id(), %txn, released, reason, "transaction revoked");
    }

    /// Disconnects every session idle longer than the configured timeout.
    pub fn reap_idle_sessions(&self, now_ms: i64) -> Vec<Uuid> {
        let timeout = self.config.idle_timeout_secs;
        if timeout == 0 {
            return Vec::new();
        }
        let limit_ms = (timeout as i64).saturating_mul(1000);
        let sessions: Vec<_> = self.sessions.lock().values().cloned().collect();
        let mut reaped = Vec::new();
        for control in sessions {
            if control.kill_reason().is_none()
                && now_ms.saturating_sub(control.last_activity_ms()) > limit_ms
            {
                info!(session = %control.id(), username = control.username(), "idle session timed out");
                self.revoke(&control, "idle timeout");
                reaped.push(control.id());
            }
        }
        reaped
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let sessions: Vec<_> = self.sessions.lock().values().cloned().collect();
        info!(sessions = sessions.len(), "store shutting down");
        for control in sessions {
            self.revoke(&control, "server shutdown");
        }
        if let Err(err) = self.audit.flush() {
            warn!(error = %err, "failed to flush audit log");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}
