use crate::error::{DbError, DbResult};
use std::path::PathBuf;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Runtime configuration for a shadowstore instance.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Sessions idle longer than this are flagged by the reaper. Zero disables
    /// idle reaping.
    pub idle_timeout_secs: u64,
    pub reaper_interval_ms: u64,
    /// Inactivated objects are scheduled for removal this many days out.
    pub inactivation_grace_days: u32,
    pub max_checkpoint_depth: usize,
    /// Applied to vector fields whose definition does not carry its own limit.
    pub default_max_vector_size: usize,
    pub default_max_string_len: usize,
    pub case_insensitive_namespaces: bool,
    /// Bootstrap secret for the `root` user and supergash persona. Wiped when
    /// the last copy drops.
    pub root_secret: Arc<Zeroizing<String>>,
    pub audit_log_path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 15 * 60,
            reaper_interval_ms: 1_000,
            inactivation_grace_days: 30,
            max_checkpoint_depth: 64,
            default_max_vector_size: 32_767,
            default_max_string_len: 4_096,
            case_insensitive_namespaces: true,
            root_secret: Arc::new(Zeroizing::new(String::new())),
            audit_log_path: None,
        }
    }
}

impl StoreConfig {
    pub fn production(root_secret: impl Into<String>) -> Self {
        Self {
            root_secret: Arc::new(Zeroizing::new(root_secret.into())),
            idle_timeout_secs: 15 * 60,
            reaper_interval_ms: 5_000,
            ..Self::default()
        }
    }

    pub fn development() -> Self {
        Self {
            root_secret: Arc::new(Zeroizing::new("root".to_string())),
            idle_timeout_secs: 0,
            reaper_interval_ms: 250,
            ..Self::default()
        }
    }

    pub fn with_audit_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.audit_log_path = Some(path.into());
        self
    }

    pub fn with_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.idle_timeout_secs = secs;
        self
    }

    pub fn root_secret(&self) -> &str {
        self.root_secret.as_str()
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.root_secret.is_empty() {
            return Err(DbError::InvalidConfig {
                message: "root_secret must not be empty".into(),
            });
        }
        if self.max_checkpoint_depth == 0 {
            return Err(DbError::InvalidConfig {
                message: "max_checkpoint_depth must be > 0".into(),
            });
        }
        if self.default_max_vector_size == 0 || self.default_max_string_len == 0 {
            return Err(DbError::InvalidConfig {
                message: "default size limits must be > 0".into(),
            });
        }
        if self.reaper_interval_ms == 0 {
            return Err(DbError::InvalidConfig {
                message: "reaper_interval_ms must be > 0".into(),
            });
        }
        Ok(())
    }
}
