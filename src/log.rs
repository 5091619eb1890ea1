use crate::error::{DbError, DbResult};
use crate::invid::Invid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldChange {
    pub field: u16,
    pub name: String,
    pub change: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    ObjectCreated {
        invid: Invid,
        label: String,
    },
    ObjectEdited {
        invid: Invid,
        label: String,
        changes: Vec<FieldChange>,
    },
    ObjectRemoved {
        invid: Invid,
        label: String,
    },
    ObjectInactivated {
        invid: Invid,
        label: String,
        removal_date: i64,
    },
    ObjectReactivated {
        invid: Invid,
        label: String,
    },
    PermissionsChanged {
        invid: Invid,
        field: u16,
        diff: String,
    },
    TransactionCommitted {
        txn: u64,
        description: String,
        objects: usize,
    },
    TransactionAborted {
        txn: u64,
        description: String,
    },
}

impl AuditEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::ObjectCreated { .. } => "object_created",
            AuditEvent::ObjectEdited { .. } => "object_edited",
            AuditEvent::ObjectRemoved { .. } => "object_removed",
            AuditEvent::ObjectInactivated { .. } => "object_inactivated",
            AuditEvent::ObjectReactivated { .. } => "object_reactivated",
            AuditEvent::PermissionsChanged { .. } => "permissions_changed",
            AuditEvent::TransactionCommitted { .. } => "transaction_committed",
            AuditEvent::TransactionAborted { .. } => "transaction_aborted",
        }
    }

    pub fn invid(&self) -> Option<Invid> {
        match self {
            AuditEvent::ObjectCreated { invid, .. }
            | AuditEvent::ObjectEdited { invid, .. }
            | AuditEvent::ObjectRemoved { invid, .. }
            | AuditEvent::ObjectInactivated { invid, .. }
            | AuditEvent::ObjectReactivated { invid, .. }
            | AuditEvent::PermissionsChanged { invid, .. } => Some(*invid),
            AuditEvent::TransactionCommitted { .. } | AuditEvent::TransactionAborted { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditRecord {
    pub timestamp_ms: i64,
    pub username: String,
    #[serde(flatten)]
    pub event: AuditEvent,
}

/// Destination for audit records.
pub trait DbLog: Send + Sync {
    fn record(&self, record: AuditRecord) -> DbResult<()>;

    fn flush(&self) -> DbResult<()> {
        Ok(())
    }
}

/// Keeps the most recent records in memory.
#[derive(Debug)]
pub struct MemoryLog {
    capacity: usize,
    records: Mutex<VecDeque<AuditRecord>>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::with_capacity(10_000)
    }
}

impl MemoryLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn events_for(&self, invid: Invid) -> Vec<AuditEvent> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.event.invid() == Some(invid))
            .map(|r| r.event.clone())
            .collect()
    }
}

impl DbLog for MemoryLog {
    fn record(&self, record: AuditRecord) -> DbResult<()> {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
        Ok(())
    }
}

/// Appends one JSON object per line.
pub struct JsonLinesLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl std::fmt::Debug for JsonLinesLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesLog").field("path", &self.path).finish()
    }
}

impl JsonLinesLog {
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_all(path: impl AsRef<Path>) -> DbResult<Vec<AuditRecord>> {
        let file = File::open(path)?;
        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(serde_json::from_str(&line).map_err(|e| DbError::Decode(e.to_string()))?);
        }
        Ok(out)
    }
}

impl DbLog for JsonLinesLog {
    fn record(&self, record: AuditRecord) -> DbResult<()> {
        let line = serde_json::to_string(&record).map_err(|e| DbError::Encode(e.to_string()))?;
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn flush(&self) -> DbResult<()> {
        self.writer.lock().flush()?;
        Ok(())
    }
}
