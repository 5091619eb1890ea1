use crate::error::{DbError, DbResult, ResourceType};
use crate::field::Value;
use crate::invid::Invid;
use compact_str::CompactString;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Identifies one open transaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

/// A field slot on a specific object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldRef {
    pub invid: Invid,
    pub field: u16,
}

impl FieldRef {
    pub const fn new(invid: Invid, field: u16) -> Self {
        Self { invid, field }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NsHandle {
    /// Committed holder of the value, if any.
    persistent: Option<FieldRef>,
    /// Transaction currently holding the value checked out.
    editing: Option<TxnId>,
    /// Holder inside the editing transaction; `None` while released.
    shadow: Option<FieldRef>,
}

impl NsHandle {
    fn is_checked_out(&self) -> bool {
        self.editing.is_some()
    }

    fn edited_by_other(&self, txn: TxnId) -> bool {
        self.editing.is_some_and(|t| t != txn)
    }
}

#[derive(Debug, Clone)]
struct NsCheckpoint {
    name: String,
    reserved: Vec<Value>,
    handles: HashMap<Value, NsHandle>,
}

#[derive(Debug, Default)]
struct NsTxn {
    reserved: Vec<Value>,
    reserved_set: HashSet<Value>,
    checkpoints: Vec<NsCheckpoint>,
}

impl NsTxn {
    fn remember(&mut self, key: &Value) {
        if self.reserved_set.insert(key.clone()) {
            self.reserved.push(key.clone());
        }
    }
}

#[derive(Debug, Default)]
struct NsState {
    handles: HashMap<Value, NsHandle>,
    txns: HashMap<TxnId, NsTxn>,
}

impl NsState {
    fn can_mark(&self, txn: TxnId, key: &Value) -> bool {
        match self.handles.get(key) {
            None => true,
            Some(handle) => {
                !handle.edited_by_other(txn) && handle.is_checked_out() && handle.shadow.is_none()
            }
        }
    }

    fn mark(&mut self, txn: TxnId, key: &Value, field: FieldRef) -> bool {
        if !self.can_mark(txn, key) {
            return false;
        }
        match self.handles.get_mut(key) {
            Some(handle) => handle.shadow = Some(field),
            None => {
                self.handles.insert(
                    key.clone(),
                    NsHandle {
                        persistent: None,
                        editing: Some(txn),
                        shadow: Some(field),
                    },
                );
            }
        }
        self.txns.entry(txn).or_default().remember(key);
        true
    }

    fn can_unmark(&self, txn: TxnId, key: &Value, field: FieldRef) -> bool {
        match self.handles.get(key) {
            None => false,
            Some(handle) if handle.edited_by_other(txn) => false,
            Some(handle) if !handle.is_checked_out() => handle.persistent == Some(field),
            Some(handle) => handle.shadow == Some(field),
        }
    }

    fn revert(&mut self, key: &Value) {
        let keep = match self.handles.get_mut(key) {
            Some(handle) if handle.persistent.is_some() => {
                handle.editing = None;
                handle.shadow = None;
                true
            }
            _ => false,
        };
        if !keep {
            self.handles.remove(key);
        }
    }
}

/// One uniqueness domain.
///
/// Claims made inside a transaction are provisional: other transactions see
/// the value as taken, and the claim becomes the committed holder only when
/// the transaction commits.
#[derive(Debug)]
pub struct DbNameSpace {
    name: CompactString,
    case_insensitive: bool,
    state: Mutex<NsState>,
}

impl DbNameSpace {
    pub fn new(name: impl Into<CompactString>, case_insensitive: bool) -> Self {
        Self {
            name: name.into(),
            case_insensitive,
            state: Mutex::new(NsState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    fn key(&self, value: &Value) -> Value {
        value.namespace_key(self.case_insensitive)
    }

    fn invariant(&self, message: impl Into<String>) -> DbError {
        DbError::NamespaceInvariant {
            namespace: self.name.to_string(),
            message: message.into(),
        }
    }

    /// Provisionally claims `value` for `field`. False if another field holds
    /// or has claimed it.
    pub fn mark(&self, txn: TxnId, value: &Value, field: FieldRef) -> bool {
        let key = self.key(value);
        self.state.lock().mark(txn, &key, field)
    }

    /// Releases `field`'s claim on `value`. Releasing a value this
    /// transaction does not hold is a defect.
    pub fn unmark(&self, txn: TxnId, value: &Value, field: FieldRef) -> DbResult<()> {
        let key = self.key(value);
        let mut state = self.state.lock();
        if !state.can_unmark(txn, &key, field) {
            return Err(self.invariant(format!(
                "{txn} cannot release '{value}' for {}:{}",
                field.invid, field.field
            )));
        }
        if let Some(handle) = state.handles.get_mut(&key) {
            if handle.is_checked_out() {
                handle.shadow = None;
            } else {
                handle.editing = Some(txn);
                handle.shadow = None;
            }
        }
        state.txns.entry(txn).or_default().remember(&key);
        Ok(())
    }

    /// Withdraws a claim made by `mark` in the same operation. A value with
    /// no committed holder is freed for every transaction; a committed value
    /// this transaction had released stays released to it.
    pub fn undo_mark(&self, txn: TxnId, value: &Value, field: FieldRef) -> DbResult<()> {
        let key = self.key(value);
        let mut state = self.state.lock();
        let NsState { handles, txns } = &mut *state;
        let Some(handle) = handles
            .get_mut(&key)
            .filter(|h| h.editing == Some(txn) && h.shadow == Some(field))
        else {
            return Err(self.invariant(format!(
                "{txn} has no claim on '{value}' for {}:{}",
                field.invid, field.field
            )));
        };
        let pinned = txns
            .get(&txn)
            .is_some_and(|t| t.checkpoints.iter().any(|c| c.handles.contains_key(&key)));
        if handle.persistent.is_some() || pinned {
            handle.shadow = None;
            return Ok(());
        }
        handles.remove(&key);
        if let Some(t) = txns.get_mut(&txn)
            && t.reserved_set.remove(&key)
        {
            t.reserved.retain(|k| *k != key);
        }
        Ok(())
    }

    pub fn test_mark(&self, txn: TxnId, value: &Value) -> bool {
        let key = self.key(value);
        self.state.lock().can_mark(txn, &key)
    }

    pub fn test_unmark(&self, txn: TxnId, value: &Value, field: FieldRef) -> bool {
        let key = self.key(value);
        self.state.lock().can_unmark(txn, &key, field)
    }

    /// Claims every value or none. Returns the first value that could not be
    /// claimed.
    pub fn mark_all(&self, txn: TxnId, values: &[Value], field: FieldRef) -> Result<(), Value> {
        let keys: Vec<Value> = values.iter().map(|v| self.key(v)).collect();
        let mut state = self.state.lock();
        let mut seen = HashSet::new();
        for (key, value) in keys.iter().zip(values) {
            if !seen.insert(key) || !state.can_mark(txn, key) {
                return Err(value.clone());
            }
        }
        for key in &keys {
            state.mark(txn, key, field);
        }
        Ok(())
    }

    /// Releases every value or none.
    pub fn unmark_all(&self, txn: TxnId, values: &[Value], field: FieldRef) -> DbResult<()> {
        {
            let state = self.state.lock();
            for value in values {
                if !state.can_unmark(txn, &self.key(value), field) {
                    return Err(self.invariant(format!("{txn} cannot release '{value}'")));
                }
            }
        }
        for value in values {
            self.unmark(txn, value, field)?;
        }
        Ok(())
    }

    /// Records a committed holder while loading. Fails if the value is
    /// already held.
    pub fn claim_persistent(&self, value: &Value, field: FieldRef) -> DbResult<()> {
        let key = self.key(value);
        let mut state = self.state.lock();
        if state.handles.contains_key(&key) {
            return Err(self.invariant(format!("'{value}' is already held")));
        }
        state.handles.insert(
            key,
            NsHandle {
                persistent: Some(field),
                editing: None,
                shadow: None,
            },
        );
        Ok(())
    }

    /// Forgets a committed holder that is not checked out. Used when a
    /// record is replaced wholesale while loading.
    pub fn drop_persistent(&self, value: &Value, field: FieldRef) {
        let key = self.key(value);
        let mut state = self.state.lock();
        if state
            .handles
            .get(&key)
            .is_some_and(|h| h.persistent == Some(field) && !h.is_checked_out())
        {
            state.handles.remove(&key);
        }
    }

    /// Committed holder of `value`.
    pub fn lookup(&self, value: &Value) -> Option<FieldRef> {
        let key = self.key(value);
        self.state.lock().handles.get(&key).and_then(|h| h.persistent)
    }

    /// Holder of `value` as seen from inside `txn`.
    pub fn lookup_in(&self, txn: TxnId, value: &Value) -> Option<FieldRef> {
        let key = self.key(value);
        let state = self.state.lock();
        let handle = state.handles.get(&key)?;
        if handle.editing == Some(txn) {
            handle.shadow
        } else {
            handle.persistent
        }
    }

    /// Number of values with a committed or provisional holder.
    pub fn len(&self) -> usize {
        self.state.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks that every value reserved by `txn` is still checked out to it.
    pub fn verify(&self, txn: TxnId) -> DbResult<()> {
        let state = self.state.lock();
        let Some(t) = state.txns.get(&txn) else {
            return Ok(());
        };
        for key in &t.reserved {
            if state
                .handles
                .get(key)
                .is_some_and(|h| h.editing != Some(txn))
            {
                return Err(self.invariant(format!("'{key}' is not held by {txn}")));
            }
        }
        Ok(())
    }

    pub fn commit(&self, txn: TxnId) {
        let mut state = self.state.lock();
        let Some(t) = state.txns.remove(&txn) else {
            return;
        };
        for key in t.reserved {
            let keep = match state.handles.get_mut(&key) {
                Some(handle) if handle.editing == Some(txn) => match handle.shadow.take() {
                    Some(holder) => {
                        handle.persistent = Some(holder);
                        handle.editing = None;
                        true
                    }
                    None => false,
                },
                Some(_) => true,
                None => true,
            };
            if !keep {
                state.handles.remove(&key);
            }
        }
    }

    pub fn abort(&self, txn: TxnId) {
        let mut state = self.state.lock();
        let Some(t) = state.txns.remove(&txn) else {
            return;
        };
        for key in &t.reserved {
            if state.handles.get(key).is_some_and(|h| h.editing == Some(txn)) {
                state.revert(key);
            }
        }
    }

    pub fn checkpoint(&self, txn: TxnId, name: &str) {
        let mut state = self.state.lock();
        let NsState { handles, txns } = &mut *state;
        let t = txns.entry(txn).or_default();
        let snapshot = t
            .reserved
            .iter()
            .filter_map(|key| handles.get(key).map(|h| (key.clone(), h.clone())))
            .collect();
        t.checkpoints.push(NsCheckpoint {
            name: name.to_string(),
            reserved: t.reserved.clone(),
            handles: snapshot,
        });
    }

    /// Discards the named checkpoint and every newer one. A namespace that
    /// holds no checkpoints for `txn` was created after the checkpoint was
    /// taken and has nothing to pop.
    pub fn pop_checkpoint(&self, txn: TxnId, name: &str) -> DbResult<()> {
        let mut state = self.state.lock();
        let Some(t) = state.txns.get_mut(&txn).filter(|t| !t.checkpoints.is_empty()) else {
            return Ok(());
        };
        let idx = t
            .checkpoints
            .iter()
            .rposition(|c| c.name == name)
            .ok_or_else(|| DbError::UnknownCheckpoint(name.to_string()))?;
        t.checkpoints.truncate(idx);
        Ok(())
    }

    /// Restores claims to the named checkpoint and discards it and every
    /// newer one. If the checkpoint predates this namespace's involvement,
    /// every claim made by `txn` is released.
    pub fn rollback(&self, txn: TxnId, name: &str) {
        let mut state = self.state.lock();
        let Some(mut t) = state.txns.remove(&txn) else {
            return;
        };
        let Some(idx) = t.checkpoints.iter().rposition(|c| c.name == name) else {
            for key in &t.reserved {
                if state.handles.get(key).is_some_and(|h| h.editing == Some(txn)) {
                    state.revert(key);
                }
            }
            return;
        };
        let ckp = t.checkpoints.swap_remove(idx);
        t.checkpoints.truncate(idx);
        for key in &t.reserved {
            if !ckp.handles.contains_key(key) {
                state.revert(key);
            }
        }
        for (key, handle) in &ckp.handles {
            state.handles.insert(key.clone(), handle.clone());
        }
        t.reserved_set = ckp.reserved.iter().cloned().collect();
        t.reserved = ckp.reserved;
        state.txns.insert(txn, t);
    }
}

/// All namespaces of a store, by name.
#[derive(Debug, Default)]
pub struct NamespaceRegistry {
    spaces: RwLock<BTreeMap<CompactString, Arc<DbNameSpace>>>,
}

impl NamespaceRegistry {
    pub fn ensure(&self, name: &str, case_insensitive: bool) -> Arc<DbNameSpace> {
        let mut spaces = self.spaces.write();
        Arc::clone(
            spaces
                .entry(CompactString::from(name))
                .or_insert_with(|| Arc::new(DbNameSpace::new(name, case_insensitive))),
        )
    }

    pub fn get(&self, name: &str) -> DbResult<Arc<DbNameSpace>> {
        self.spaces
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::NotFound {
                resource_type: ResourceType::Namespace,
                resource_id: name.to_string(),
            })
    }

    pub fn all(&self) -> Vec<Arc<DbNameSpace>> {
        self.spaces.read().values().cloned().collect()
    }

    pub fn verify(&self, txn: TxnId) -> DbResult<()> {
        for ns in self.all() {
            ns.verify(txn)?;
        }
        Ok(())
    }

    pub fn commit(&self, txn: TxnId) {
        for ns in self.all() {
            ns.commit(txn);
        }
    }

    pub fn abort(&self, txn: TxnId) {
        for ns in self.all() {
            ns.abort(txn);
        }
    }

    pub fn checkpoint(&self, txn: TxnId, name: &str) {
        for ns in self.all() {
            ns.checkpoint(txn, name);
        }
    }

    /// Discards the named checkpoint in every namespace. Every namespace is
    /// visited; the first failure is returned.
    pub fn pop_checkpoint(&self, txn: TxnId, name: &str) -> DbResult<()> {
        let mut first = Ok(());
        for ns in self.all() {
            if let Err(err) = ns.pop_checkpoint(txn, name) {
                warn!(namespace = ns.name(), %txn, checkpoint = name, error = %err, "checkpoint pop failed");
                if first.is_ok() {
                    first = Err(err);
                }
            }
        }
        first
    }

    pub fn rollback(&self, txn: TxnId, name: &str) {
        for ns in self.all() {
            ns.rollback(txn, name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DbNameSpace, FieldRef, NamespaceRegistry, TxnId};
    use crate::field::Value;
    use crate::invid::Invid;

    const T1: TxnId = TxnId(1);
    const T2: TxnId = TxnId(2);

    fn field(num: u32) -> FieldRef {
        FieldRef::new(Invid::new(3, num), 100)
    }

    #[test]
    fn concurrent_claims_conflict_until_abort() {
        let ns = DbNameSpace::new("username", true);
        let alice = Value::from("alice");
        assert!(ns.mark(T1, &alice, field(1)));
        assert!(!ns.mark(T2, &Value::from("ALICE"), field(2)));
        assert!(!ns.test_mark(T2, &alice));
        ns.abort(T1);
        assert!(ns.is_empty());
        assert!(ns.mark(T2, &alice, field(2)));
        ns.commit(T2);
        assert_eq!(ns.lookup(&alice), Some(field(2)));
    }

    #[test]
    fn release_and_reclaim_within_one_transaction() {
        let ns = DbNameSpace::new("username", false);
        let bob = Value::from("bob");
        ns.claim_persistent(&bob, field(1)).expect("load");
        assert!(!ns.mark(T1, &bob, field(2)));

        ns.unmark(T1, &bob, field(1)).expect("release");
        assert!(!ns.mark(T2, &bob, field(3)));
        assert!(ns.mark(T1, &bob, field(2)));
        assert_eq!(ns.lookup_in(T1, &bob), Some(field(2)));
        assert_eq!(ns.lookup(&bob), Some(field(1)));

        ns.commit(T1);
        assert_eq!(ns.lookup(&bob), Some(field(2)));
    }

    #[test]
    fn abort_restores_released_persistent_claims() {
        let ns = DbNameSpace::new("username", false);
        let carol = Value::from("carol");
        ns.claim_persistent(&carol, field(1)).expect("load");
        ns.unmark(T1, &carol, field(1)).expect("release");
        ns.abort(T1);
        assert_eq!(ns.lookup(&carol), Some(field(1)));
        assert!(!ns.test_mark(T2, &carol));
    }

    #[test]
    fn committing_a_release_frees_the_value() {
        let ns = DbNameSpace::new("username", false);
        let dave = Value::from("dave");
        ns.claim_persistent(&dave, field(1)).expect("load");
        ns.unmark(T1, &dave, field(1)).expect("release");
        ns.commit(T1);
        assert_eq!(ns.lookup(&dave), None);
        assert!(ns.is_empty());
    }

    #[test]
    fn unmarking_an_unheld_value_is_a_defect() {
        let ns = DbNameSpace::new("username", false);
        let err = ns
            .unmark(T1, &Value::from("nobody"), field(1))
            .expect_err("defect");
        assert!(err.is_defect());
        assert!(ns.mark(T1, &Value::from("x"), field(1)));
        assert!(ns.unmark(T2, &Value::from("x"), field(1)).is_err());
    }

    #[test]
    fn batch_claims_are_all_or_nothing() {
        let ns = DbNameSpace::new("hosts", false);
        assert!(ns.mark(T2, &Value::from("b"), field(9)));
        let batch = vec![Value::from("a"), Value::from("b"), Value::from("c")];
        assert_eq!(ns.mark_all(T1, &batch, field(1)), Err(Value::from("b")));
        assert!(ns.test_mark(T1, &Value::from("a")));
        assert_eq!(ns.len(), 1);

        let dupes = vec![Value::from("d"), Value::from("d")];
        assert!(ns.mark_all(T1, &dupes, field(1)).is_err());
    }

    #[test]
    fn rollback_reverts_claims_made_after_the_checkpoint() {
        let ns = DbNameSpace::new("hosts", false);
        ns.claim_persistent(&Value::from("old"), field(1)).expect("load");
        assert!(ns.mark(T1, &Value::from("early"), field(2)));
        ns.checkpoint(T1, "ckp");
        assert!(ns.mark(T1, &Value::from("late"), field(2)));
        ns.unmark(T1, &Value::from("old"), field(1)).expect("release");
        ns.unmark(T1, &Value::from("early"), field(2)).expect("release");

        ns.rollback(T1, "ckp");
        assert!(ns.test_mark(T2, &Value::from("late")));
        assert!(!ns.test_mark(T2, &Value::from("old")));
        assert_eq!(ns.lookup_in(T1, &Value::from("early")), Some(field(2)));

        ns.commit(T1);
        assert_eq!(ns.lookup(&Value::from("early")), Some(field(2)));
        assert_eq!(ns.lookup(&Value::from("old")), Some(field(1)));
    }

    #[test]
    fn undone_claims_free_the_value_for_everyone() {
        let ns = DbNameSpace::new("hosts", false);
        let fresh = Value::from("fresh");
        assert!(ns.mark(T1, &fresh, field(1)));
        ns.undo_mark(T1, &fresh, field(1)).expect("undo");
        assert!(ns.test_mark(T2, &fresh));
        assert!(ns.is_empty());
        ns.verify(T1).expect("nothing left reserved");

        // A committed value released earlier in the txn stays released to it.
        let moved = Value::from("moved");
        ns.claim_persistent(&moved, field(1)).expect("load");
        ns.unmark(T1, &moved, field(1)).expect("release");
        assert!(ns.mark(T1, &moved, field(2)));
        ns.undo_mark(T1, &moved, field(2)).expect("undo");
        assert!(!ns.test_mark(T2, &moved));
        assert_eq!(ns.lookup_in(T1, &moved), None);
        ns.commit(T1);
        assert_eq!(ns.lookup(&moved), None);

        assert!(ns.undo_mark(T2, &Value::from("never"), field(3)).is_err());
    }

    #[test]
    fn undo_keeps_values_a_checkpoint_remembers() {
        let ns = DbNameSpace::new("hosts", false);
        let kept = Value::from("kept");
        assert!(ns.mark(T1, &kept, field(1)));
        ns.unmark(T1, &kept, field(1)).expect("release");
        ns.checkpoint(T1, "ckp");
        assert!(ns.mark(T1, &kept, field(2)));
        ns.undo_mark(T1, &kept, field(2)).expect("undo");
        assert!(!ns.test_mark(T2, &kept));
        ns.rollback(T1, "ckp");
        assert!(ns.test_mark(T1, &kept));
    }

    #[test]
    fn popping_checkpoints_across_the_registry() {
        let registry = NamespaceRegistry::default();
        let early = registry.ensure("early", false);
        registry.checkpoint(T1, "a");
        let late = registry.ensure("late", false);
        assert!(late.mark(T1, &Value::from("v"), field(1)));

        assert!(registry.pop_checkpoint(T1, "missing").is_err());
        registry.pop_checkpoint(T1, "a").expect("late namespace has nothing to pop");
        assert!(early.pop_checkpoint(T1, "a").is_ok());

        registry.checkpoint(T1, "b");
        registry.checkpoint(T1, "c");
        registry.pop_checkpoint(T1, "b").expect("pop");
        assert!(registry.pop_checkpoint(T1, "c").is_ok(), "b took c with it");
    }
}
