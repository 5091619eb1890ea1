pub mod config;
pub mod error;
pub mod field;
pub mod invid;
pub mod log;
pub mod namespace;
pub mod object;
pub mod perm;
pub mod returnval;
pub mod schema;
pub mod session;
pub mod store;

#[cfg(test)]
mod lib_tests;

pub use config::StoreConfig;
pub use error::{DbError, DbErrorCode, DbResult};
pub use field::{FieldOp, FieldValue, SecretHash, Value};
pub use invid::Invid;
pub use log::{AuditEvent, AuditRecord, DbLog, JsonLinesLog, MemoryLog};
pub use object::{DbObject, EditObject, HookContext, ObjectStatus, ObjectTypeBehavior, ObjectView, WizardOutcome};
pub use perm::{PermEntry, PermKey, PermMatrix};
pub use returnval::{FailureKind, Rescan, RescanHints, ReturnVal, WizardPrompt};
pub use schema::{FieldDef, FieldKind, ObjectTypeDef, Schema};
pub use session::Session;
pub use store::DbStore;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Handle to an open store. Cloning shares the same underlying database.
#[derive(Debug, Clone)]
pub struct Store {
    inner: Arc<DbStore>,
}

impl Store {
    /// Opens an empty store with the builtin schema and bootstrap objects.
    /// Audit records go to the configured JSON-lines file, or are kept in
    /// memory when no path is set.
    pub fn open(config: StoreConfig) -> DbResult<Self> {
        let audit: Arc<dyn DbLog> = match &config.audit_log_path {
            Some(path) => Arc::new(JsonLinesLog::open(path)?),
            None => Arc::new(MemoryLog::default()),
        };
        Self::open_with_log(config, audit)
    }

    pub fn open_with_log(config: StoreConfig, audit: Arc<dyn DbLog>) -> DbResult<Self> {
        Ok(Self {
            inner: Arc::new(DbStore::new(config, audit)?),
        })
    }

    pub fn db(&self) -> &Arc<DbStore> {
        &self.inner
    }

    pub fn login(&self, username: &str, secret: &str) -> DbResult<Session> {
        Session::login(Arc::clone(&self.inner), username, secret)
    }

    /// Adds an application object type. Existing sessions pick the change up
    /// through the schema generation.
    pub fn register_type(&self, def: ObjectTypeDef) -> DbResult<()> {
        let name = def.name.clone();
        let id = def.id;
        self.inner.update_schema(|schema| schema.register(def))?;
        info!(type_id = id, name = %name, "object type registered");
        Ok(())
    }

    pub fn declare_namespace(&self, name: &str, case_insensitive: bool) -> DbResult<()> {
        self.inner
            .update_schema(|schema| {
                schema.declare_namespace(name, case_insensitive);
                Ok(())
            })
    }

    pub fn kill_session(&self, id: Uuid, reason: &str) -> DbResult<()> {
        self.inner.kill_session(id, reason)
    }

    pub fn session_ids(&self) -> Vec<Uuid> {
        self.inner.session_ids()
    }

    /// Flags every session for disconnect and refuses new logins.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Spawns the idle-session reaper on the current tokio runtime. The task
    /// exits once the store shuts down.
    pub fn start_reaper(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.inner);
        let period = Duration::from_millis(store.config().reaper_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if store.is_shutting_down() {
                    debug!("reaper stopping");
                    return;
                }
                let reaped = store.reap_idle_sessions(store::now_millis());
                if !reaped.is_empty() {
                    debug!(count = reaped.len(), "reaper flagged idle sessions");
                }
            }
        })
    }
}
