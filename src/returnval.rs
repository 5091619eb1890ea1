use crate::field::Value;
use crate::invid::Invid;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Business-level failure categories carried by a failed [`ReturnVal`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FailureKind {
    PermissionDenied,
    NotEditable,
    TypeMismatch,
    RejectedValue,
    NamespaceConflict,
    MissingRequiredFields,
    AlreadyEditing,
    NoTransaction,
    TransactionOpen,
    NotFound,
    Overflow,
    DuplicateValue,
    WizardDeclined,
    HookRejected,
    CommitFailed,
    NotRemovable,
    NotInactivatable,
    Authentication,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::PermissionDenied => "permission_denied",
            FailureKind::NotEditable => "not_editable",
            FailureKind::TypeMismatch => "type_mismatch",
            FailureKind::RejectedValue => "rejected_value",
            FailureKind::NamespaceConflict => "namespace_conflict",
            FailureKind::MissingRequiredFields => "missing_required_fields",
            FailureKind::AlreadyEditing => "already_editing",
            FailureKind::NoTransaction => "no_transaction",
            FailureKind::TransactionOpen => "transaction_open",
            FailureKind::NotFound => "not_found",
            FailureKind::Overflow => "overflow",
            FailureKind::DuplicateValue => "duplicate_value",
            FailureKind::WizardDeclined => "wizard_declined",
            FailureKind::HookRejected => "hook_rejected",
            FailureKind::CommitFailed => "commit_failed",
            FailureKind::NotRemovable => "not_removable",
            FailureKind::NotInactivatable => "not_inactivatable",
            FailureKind::Authentication => "authentication",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dialog {
    pub title: String,
    pub text: String,
}

/// A confirmation request raised by an interactive hook. The caller answers
/// it with `Session::respond_wizard(token, accept)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WizardPrompt {
    pub token: u64,
    pub title: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Rescan {
    All,
    Fields(BTreeSet<u16>),
}

/// Objects and fields a caller should re-fetch after a mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RescanHints {
    entries: BTreeMap<Invid, Rescan>,
}

impl RescanHints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add_field(&mut self, invid: Invid, field: u16) {
        match self.entries.get_mut(&invid) {
            Some(Rescan::All) => {}
            Some(Rescan::Fields(fields)) => {
                fields.insert(field);
            }
            None => {
                self.entries
                    .insert(invid, Rescan::Fields(BTreeSet::from([field])));
            }
        }
    }

    pub fn add_all(&mut self, invid: Invid) {
        self.entries.insert(invid, Rescan::All);
    }

    pub fn union_rescan(&mut self, other: &RescanHints) {
        for (invid, rescan) in &other.entries {
            match rescan {
                Rescan::All => self.add_all(*invid),
                Rescan::Fields(fields) => {
                    for field in fields {
                        self.add_field(*invid, *field);
                    }
                }
            }
        }
    }

    pub fn get(&self, invid: Invid) -> Option<&Rescan> {
        self.entries.get(&invid)
    }

    pub fn requires_field(&self, invid: Invid, field: u16) -> bool {
        match self.entries.get(&invid) {
            Some(Rescan::All) => true,
            Some(Rescan::Fields(fields)) => fields.contains(&field),
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Invid, &Rescan)> {
        self.entries.iter()
    }
}

/// Uniform outcome of a mutating operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReturnVal {
    pub success: bool,
    /// False when a hook already performed the work and the default
    /// processing must be skipped.
    pub do_normal_processing: bool,
    pub failure: Option<FailureKind>,
    pub dialog: Option<Dialog>,
    pub rescan: RescanHints,
    pub invid: Option<Invid>,
    pub transformed: Option<Value>,
    pub wizard: Option<WizardPrompt>,
}

impl Default for ReturnVal {
    fn default() -> Self {
        Self::success()
    }
}

impl ReturnVal {
    pub fn success() -> Self {
        Self {
            success: true,
            do_normal_processing: true,
            failure: None,
            dialog: None,
            rescan: RescanHints::default(),
            invid: None,
            transformed: None,
            wizard: None,
        }
    }

    pub fn failure(kind: FailureKind, title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            success: false,
            do_normal_processing: false,
            failure: Some(kind),
            dialog: Some(Dialog {
                title: title.into(),
                text: text.into(),
            }),
            ..Self::success()
        }
    }

    /// A success that tells the caller a hook already handled the operation.
    pub fn handled() -> Self {
        Self {
            do_normal_processing: false,
            ..Self::success()
        }
    }

    pub fn with_invid(invid: Invid) -> Self {
        Self {
            invid: Some(invid),
            ..Self::success()
        }
    }

    pub fn pending(prompt: WizardPrompt) -> Self {
        Self {
            success: false,
            do_normal_processing: false,
            wizard: Some(prompt),
            ..Self::success()
        }
    }

    pub fn is_failure_kind(&self, kind: FailureKind) -> bool {
        self.failure == Some(kind)
    }

    /// True while an interactive hook awaits confirmation.
    pub fn is_pending(&self) -> bool {
        self.wizard.is_some() && self.failure.is_none()
    }

    pub fn dialog_text(&self) -> Option<&str> {
        self.dialog.as_ref().map(|d| d.text.as_str())
    }

    pub fn rescan_field(mut self, invid: Invid, field: u16) -> Self {
        self.rescan.add_field(invid, field);
        self
    }

    pub fn union_rescan(&mut self, other: &ReturnVal) {
        self.rescan.union_rescan(&other.rescan);
    }

    /// Combines two results. The first failure wins and rescan hints are
    /// always unioned.
    pub fn merge(mut self, other: ReturnVal) -> ReturnVal {
        self.rescan.union_rescan(&other.rescan);
        if self.success && !other.success {
            let mut out = other;
            out.rescan = self.rescan;
            if out.invid.is_none() {
                out.invid = self.invid;
            }
            return out;
        }
        if self.invid.is_none() {
            self.invid = other.invid;
        }
        if self.transformed.is_none() {
            self.transformed = other.transformed;
        }
        self
    }
}
