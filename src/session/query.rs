//! Read-side lookups over a consistent table snapshot, with the session's
//! own uncommitted shadows layered on top.

use super::{Found, Session};
use crate::error::DbResult;
use crate::field::Value;
use crate::invid::Invid;
use crate::object::ObjectView;
use std::collections::BTreeMap;
use tracing::debug;

impl Session {
    /// Finds an object of `type_id` by its label. Namespace-bound labels
    /// resolve through the namespace, which sees this transaction's claims.
    pub fn find_label(&mut self, type_id: u16, label: &str) -> DbResult<Option<Invid>> {
        self.enter()?;
        let schema = self.store.schema();
        let type_def = schema.object_type(type_id)?;
        let Some(label_field) = type_def.label_field else {
            return Ok(None);
        };
        let def = type_def.field(label_field)?;
        let value = Value::from(label);

        if let Some(ns_name) = &def.namespace {
            let ns = self.store.namespaces().get(ns_name)?;
            let holder = match self.txn_id() {
                Some(txn) => ns.lookup_in(txn, &value),
                None => ns.lookup(&value),
            };
            let Some(holder) = holder.filter(|h| h.invid.type_id() == type_id && h.field == label_field) else {
                return Ok(None);
            };
            return Ok(self.readable(holder.invid)?.then_some(holder.invid));
        }

        let hits = self.query(type_id, |obj| obj.scalar(label_field) == Some(&value))?;
        Ok(hits.into_iter().next())
    }

    fn readable(&self, invid: Invid) -> DbResult<bool> {
        let Some(found) = self.find(invid) else {
            return Ok(false);
        };
        if let Found::Shadow(obj) = &found
            && obj.status().is_removal()
        {
            return Ok(false);
        }
        self.can_read(&found)
    }

    fn can_read(&self, obj: &dyn ObjectView) -> DbResult<bool> {
        if self.perms.is_supergash() {
            return Ok(true);
        }
        let schema = self.store.schema();
        let type_def = schema.object_type(obj.type_id())?;
        Ok(self.object_perm(obj)?.is_visible() && type_def.behavior().can_read(&self.hook_ctx(), obj))
    }

    /// Every visible object of `type_id` matching `predicate`, in invid order.
    pub fn query(&mut self, type_id: u16, predicate: impl Fn(&dyn ObjectView) -> bool) -> DbResult<Vec<Invid>> {
        self.enter()?;
        let matched = self.internal_query(type_id, predicate)?;
        let mut out = Vec::with_capacity(matched.len());
        for invid in matched {
            let Some(found) = self.find(invid) else {
                continue;
            };
            if self.can_read(&found)? {
                out.push(invid);
            }
        }
        debug!(session = %self.id, type_id, hits = out.len(), "query");
        Ok(out)
    }

    /// [`Self::query`] without the permission filter.
    pub(crate) fn internal_query(
        &self,
        type_id: u16,
        predicate: impl Fn(&dyn ObjectView) -> bool,
    ) -> DbResult<Vec<Invid>> {
        let mut snapshot = self.store.snapshot_tables(&[type_id])?;
        let committed = snapshot.remove(&type_id).unwrap_or_default();

        let mut view: BTreeMap<Invid, Found<'_>> = committed
            .into_iter()
            .map(|(num, obj)| (Invid::new(type_id, num), Found::Stored(obj)))
            .collect();
        if let Some(set) = &self.txn {
            for obj in set.objects().filter(|o| o.type_id() == type_id) {
                if obj.status().is_removal() {
                    view.remove(&obj.invid());
                } else {
                    view.insert(obj.invid(), Found::Shadow(obj));
                }
            }
        }
        Ok(view
            .into_iter()
            .filter(|(_, obj)| predicate(obj))
            .map(|(invid, _)| invid)
            .collect())
    }
}
