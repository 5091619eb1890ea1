use crate::error::{DbError, DbResult};
use crate::invid::Invid;
use crate::log::AuditEvent;
use crate::namespace::TxnId;
use crate::object::{EditObject, ObjectCheckpoint, ObjectStatus};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct SavedShadow {
    status: ObjectStatus,
    deleting: bool,
    fields: ObjectCheckpoint,
}

#[derive(Debug, Clone)]
struct SetCheckpoint {
    name: String,
    shadows: BTreeMap<Invid, SavedShadow>,
    events: usize,
}

/// The shadows and pending audit events of one open transaction.
///
/// Checkpoints nest: rolling back to one discards it and every newer one.
#[derive(Debug)]
pub struct EditSet {
    txn: TxnId,
    description: String,
    opened_ms: i64,
    objects: BTreeMap<Invid, EditObject>,
    checkpoints: Vec<SetCheckpoint>,
    events: Vec<AuditEvent>,
    max_depth: usize,
}

impl EditSet {
    pub(crate) fn new(txn: TxnId, description: impl Into<String>, opened_ms: i64, max_depth: usize) -> Self {
        Self {
            txn,
            description: description.into(),
            opened_ms,
            objects: BTreeMap::new(),
            checkpoints: Vec::new(),
            events: Vec::new(),
            max_depth,
        }
    }

    pub fn txn(&self) -> TxnId {
        self.txn
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn opened_ms(&self) -> i64 {
        self.opened_ms
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, invid: Invid) -> bool {
        self.objects.contains_key(&invid)
    }

    pub fn get(&self, invid: Invid) -> Option<&EditObject> {
        self.objects.get(&invid)
    }

    /// Shadow of `invid`, or the defect raised when the object is not part
    /// of this transaction.
    pub(crate) fn shadow_mut(&mut self, invid: Invid) -> DbResult<&mut EditObject> {
        self.objects
            .get_mut(&invid)
            .ok_or(DbError::NotInEditContext(invid))
    }

    pub fn objects(&self) -> impl Iterator<Item = &EditObject> {
        self.objects.values()
    }

    pub fn invids(&self) -> Vec<Invid> {
        self.objects.keys().copied().collect()
    }

    pub(crate) fn insert(&mut self, obj: EditObject) -> DbResult<()> {
        let invid = crate::object::ObjectView::invid(&obj);
        if self.objects.contains_key(&invid) {
            return Err(DbError::ShadowInvariant {
                invid,
                message: format!("{} already holds a shadow", self.txn),
            });
        }
        self.objects.insert(invid, obj);
        Ok(())
    }

    pub(crate) fn objects_mut(&mut self) -> impl Iterator<Item = &mut EditObject> {
        self.objects.values_mut()
    }

    pub(crate) fn push_event(&mut self, event: AuditEvent) {
        self.events.push(event);
    }

    pub fn pending_events(&self) -> &[AuditEvent] {
        &self.events
    }

    pub(crate) fn take_events(&mut self) -> Vec<AuditEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn checkpoint_names(&self) -> Vec<&str> {
        self.checkpoints.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn depth(&self) -> usize {
        self.checkpoints.len()
    }

    pub(crate) fn checkpoint(&mut self, name: &str) -> DbResult<()> {
        if self.checkpoints.len() >= self.max_depth {
            return Err(DbError::InvalidArgument(format!(
                "checkpoint depth limit {} reached in {}",
                self.max_depth, self.txn
            )));
        }
        let shadows = self
            .objects
            .iter()
            .map(|(invid, obj)| {
                (
                    *invid,
                    SavedShadow {
                        status: obj.status(),
                        deleting: obj.is_deleting(),
                        fields: obj.checkpoint(),
                    },
                )
            })
            .collect();
        self.checkpoints.push(SetCheckpoint {
            name: name.to_string(),
            shadows,
            events: self.events.len(),
        });
        Ok(())
    }

    fn position(&self, name: &str) -> DbResult<usize> {
        self.checkpoints
            .iter()
            .rposition(|c| c.name == name)
            .ok_or_else(|| DbError::UnknownCheckpoint(name.to_string()))
    }

    /// Forgets the named checkpoint and every newer one, keeping changes.
    pub(crate) fn pop_checkpoint(&mut self, name: &str) -> DbResult<()> {
        let idx = self.position(name)?;
        self.checkpoints.truncate(idx);
        Ok(())
    }

    /// Restores every shadow to the named checkpoint. Shadows created after
    /// it are dropped; their invids are returned so the caller can release
    /// them.
    pub(crate) fn rollback(&mut self, name: &str) -> DbResult<Vec<Invid>> {
        let idx = self.position(name)?;
        let ckp = self.checkpoints.swap_remove(idx);
        self.checkpoints.truncate(idx);

        let dropped: Vec<Invid> = self
            .objects
            .keys()
            .filter(|invid| !ckp.shadows.contains_key(invid))
            .copied()
            .collect();
        for invid in &dropped {
            self.objects.remove(invid);
        }
        for (invid, saved) in ckp.shadows {
            let obj = self.shadow_mut(invid)?;
            obj.rollback(saved.fields)?;
            obj.set_status(saved.status);
            obj.set_deleting(saved.deleting);
        }
        self.events.truncate(ckp.events);
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::EditSet;
    use crate::field::{FieldValue, Value};
    use crate::invid::Invid;
    use crate::log::AuditEvent;
    use crate::namespace::TxnId;
    use crate::object::{EditObject, ObjectStatus, ObjectView};
    use crate::schema::constants::FIRST_USER_TYPE;
    use crate::schema::{FieldDef, ObjectTypeDef};

    fn def() -> ObjectTypeDef {
        ObjectTypeDef::new(FIRST_USER_TYPE, "host").with_field(FieldDef::text(100, "name"))
    }

    fn shadow(num: u32) -> EditObject {
        EditObject::create(Invid::new(FIRST_USER_TYPE, num), &def(), |_| true)
    }

    fn set_name(set: &mut EditSet, num: u32, name: &str) {
        let obj = set
            .shadow_mut(Invid::new(FIRST_USER_TYPE, num))
            .expect("shadow");
        obj.field_mut(100)
            .expect("name")
            .set_raw(FieldValue::Scalar(Some(Value::from(name))));
    }

    fn name(set: &EditSet, num: u32) -> Option<Value> {
        set.get(Invid::new(FIRST_USER_TYPE, num))
            .and_then(|o| o.scalar(100).cloned())
    }

    #[test]
    fn rollback_discards_newer_checkpoints_and_shadows() {
        let mut set = EditSet::new(TxnId(1), "test", 0, 8);
        set.insert(shadow(1)).expect("insert");
        set_name(&mut set, 1, "a");
        set.checkpoint("outer").expect("outer");
        set_name(&mut set, 1, "b");
        set.insert(shadow(2)).expect("insert");
        set.checkpoint("inner").expect("inner");
        set_name(&mut set, 2, "c");
        set.push_event(AuditEvent::ObjectRemoved {
            invid: Invid::new(FIRST_USER_TYPE, 2),
            label: "c".into(),
        });

        let dropped = set.rollback("outer").expect("rollback");
        assert_eq!(dropped, vec![Invid::new(FIRST_USER_TYPE, 2)]);
        assert_eq!(name(&set, 1), Some(Value::from("a")));
        assert!(set.pending_events().is_empty());
        assert!(set.checkpoint_names().is_empty());
        assert!(set.rollback("inner").is_err());
    }

    #[test]
    fn pop_keeps_changes_and_status_is_restored() {
        let mut set = EditSet::new(TxnId(1), "test", 0, 8);
        set.insert(shadow(1)).expect("insert");
        set.checkpoint("a").expect("a");
        set.checkpoint("b").expect("b");
        set.shadow_mut(Invid::new(FIRST_USER_TYPE, 1))
            .expect("shadow")
            .set_status(ObjectStatus::Dropping);
        set.pop_checkpoint("b").expect("pop");
        assert_eq!(set.checkpoint_names(), vec!["a"]);
        set.rollback("a").expect("rollback");
        assert_eq!(
            set.get(Invid::new(FIRST_USER_TYPE, 1)).expect("shadow").status(),
            ObjectStatus::Creating
        );
    }

    #[test]
    fn depth_limit_and_duplicate_shadows_are_defects() {
        let mut set = EditSet::new(TxnId(1), "test", 0, 2);
        set.checkpoint("a").expect("a");
        set.checkpoint("b").expect("b");
        assert!(set.checkpoint("c").expect_err("limit").is_defect());
        set.insert(shadow(1)).expect("insert");
        assert!(set.insert(shadow(1)).is_err());
        assert!(set.shadow_mut(Invid::new(FIRST_USER_TYPE, 9)).is_err());
    }
}
