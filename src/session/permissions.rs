//! Per-session permission cache and the ownership-aware lookup built on it.
//!
//! The cache is rebuilt from the role graph only when the schema, owner
//! group, role or persona tables have changed since the last computation.
//! Lookups only ever read from the store; nothing in the store calls back
//! into a session.

use super::Session;
use crate::error::{DbError, DbResult};
use crate::field::{FieldValue, Value};
use crate::invid::Invid;
use crate::object::{DbObject, ObjectView};
use crate::perm::{MatrixRole, PermEntry, PermMatrix};
use crate::schema::constants::*;
use crate::store::DbStore;
use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, warn};

/// Table generations a permission cache was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermStamp {
    pub schema: u64,
    pub owners: u64,
    pub roles: u64,
    pub personae: u64,
}

impl PermStamp {
    pub fn current(store: &DbStore) -> Self {
        Self {
            schema: store.schema().generation(),
            owners: store.table_generation(OWNER_BASE),
            roles: store.table_generation(ROLE_BASE),
            personae: store.table_generation(PERSONA_BASE),
        }
    }
}

/// Cached permission matrices for the session's active identity.
#[derive(Debug, Clone, Default)]
pub struct PermissionManager {
    persona: Option<Invid>,
    supergash: bool,
    persona_perms: PermMatrix,
    default_perms: PermMatrix,
    delegatable_persona_perms: PermMatrix,
    delegatable_default_perms: PermMatrix,
    stamp: Option<PermStamp>,
}

fn matrix_of(obj: &DbObject, field: u16) -> PermMatrix {
    obj.field_value(field)
        .and_then(FieldValue::as_matrix)
        .cloned()
        .unwrap_or_default()
}

impl PermissionManager {
    pub fn persona(&self) -> Option<Invid> {
        self.persona
    }

    pub fn is_supergash(&self) -> bool {
        self.supergash
    }

    /// Applied to objects owned by the active persona.
    pub fn persona_perms(&self) -> &PermMatrix {
        &self.persona_perms
    }

    /// Applied to every other object.
    pub fn default_perms(&self) -> &PermMatrix {
        &self.default_perms
    }

    pub fn delegatable_persona_perms(&self) -> &PermMatrix {
        &self.delegatable_persona_perms
    }

    pub fn delegatable_default_perms(&self) -> &PermMatrix {
        &self.delegatable_default_perms
    }

    pub fn delegatable(&self, role: MatrixRole) -> &PermMatrix {
        match role {
            MatrixRole::Owned => &self.delegatable_persona_perms,
            MatrixRole::Default => &self.delegatable_default_perms,
        }
    }

    pub(crate) fn applicable(&self, owned: bool) -> &PermMatrix {
        if owned {
            &self.persona_perms
        } else {
            &self.default_perms
        }
    }

    pub fn stamp(&self) -> Option<PermStamp> {
        self.stamp
    }

    /// Switches identity and drops the cache.
    pub(crate) fn set_persona(&mut self, persona: Option<Invid>) {
        self.persona = persona;
        self.supergash = false;
        self.stamp = None;
    }

    /// Recomputes the matrices if the role graph changed or `force` is set.
    /// Returns true when a recomputation happened.
    pub fn update_perms(&mut self, store: &DbStore, force: bool) -> bool {
        let stamp = PermStamp::current(store);
        if !force && self.stamp == Some(stamp) {
            return false;
        }

        self.supergash = false;
        self.persona_perms = PermMatrix::new();
        self.default_perms = PermMatrix::new();
        self.delegatable_persona_perms = PermMatrix::new();
        self.delegatable_default_perms = PermMatrix::new();

        let persona = self.persona.and_then(|p| store.get(p));
        if let Some(persona) = &persona
            && persona.invids(PERSONA_GROUPS).contains(&SUPERGASH_OWNER)
        {
            self.supergash = true;
            self.stamp = Some(stamp);
            debug!(persona = %persona.invid(), "supergash permissions in force");
            return true;
        }

        let mut roles = vec![DEFAULT_ROLE];
        if let Some(persona) = &persona {
            roles.extend(persona.invids(PERSONA_PRIVS));
        }
        let mut seen = BTreeSet::new();
        for role_invid in roles {
            if !seen.insert(role_invid) {
                continue;
            }
            let Some(role) = store.get(role_invid) else {
                warn!(role = %role_invid, "persona references a missing role");
                continue;
            };
            let owned = matrix_of(&role, ROLE_MATRIX);
            let default = matrix_of(&role, ROLE_DEFAULT_MATRIX);
            let granted = owned.union(&default);
            self.persona_perms = self.persona_perms.union(&granted);
            self.default_perms = self.default_perms.union(&default);
            if role.scalar(ROLE_DELEGATABLE).and_then(|v| v.as_bool()) == Some(true) {
                self.delegatable_persona_perms = self.delegatable_persona_perms.union(&granted);
                self.delegatable_default_perms = self.delegatable_default_perms.union(&default);
            }
        }
        // Owned objects always get at least what everything else gets.
        self.persona_perms = self.persona_perms.union(&self.default_perms);
        self.delegatable_persona_perms = self
            .delegatable_persona_perms
            .union(&self.delegatable_default_perms);

        self.stamp = Some(stamp);
        debug!(
            persona = ?self.persona,
            persona_entries = self.persona_perms.len(),
            default_entries = self.default_perms.len(),
            "permissions recomputed"
        );
        true
    }
}

/// Bound on container chains; deeper nesting means a corrupt graph.
const MAX_EMBEDDING_DEPTH: usize = 32;

impl Session {
    /// Permission for the object as a whole.
    pub fn object_perm(&self, obj: &dyn ObjectView) -> DbResult<PermEntry> {
        self.perm_for(obj, None)
    }

    /// Permission for one field of the object. Never exceeds the object
    /// permission except for the create bit granted on the field itself.
    pub fn field_perm(&self, obj: &dyn ObjectView, field: u16) -> DbResult<PermEntry> {
        self.perm_for(obj, Some(field))
    }

    fn perm_for(&self, obj: &dyn ObjectView, field: Option<u16>) -> DbResult<PermEntry> {
        if self.perms.is_supergash() {
            return Ok(PermEntry::full());
        }
        let schema = self.store.schema();
        let type_def = schema.object_type(obj.type_id())?;
        let hooks = type_def.behavior();
        let ctx = self.hook_ctx();
        if let Some(entry) = hooks.perm_override(&ctx, obj, field) {
            return Ok(entry);
        }
        let expand = hooks.perm_expand(&ctx, obj, field).unwrap_or_default();
        let owned = self.is_owned(obj)?;
        let matrix = self.perms.applicable(owned);
        let type_id = obj.type_id();

        let Some(field) = field else {
            return Ok(matrix
                .get_perm(type_id)
                .unwrap_or_default()
                .union(expand));
        };
        let object = self.perm_for(obj, None)?;
        let exact = matrix.get_field_perm(type_id, field);
        let base = if field == OWNER_LIST_FIELD || is_history_field(field) {
            object.intersection(PermEntry::view_only())
        } else {
            exact.unwrap_or(object)
        };
        let mut entry = base.union(expand).intersection(object);
        if exact.is_some_and(PermEntry::is_creatable) {
            entry = entry.with_create();
        }
        Ok(entry)
    }

    /// Permission for a field of a type when no object exists yet.
    pub(crate) fn type_field_perm(&self, type_id: u16, field: u16) -> PermEntry {
        if self.perms.is_supergash() {
            return PermEntry::full();
        }
        let matrix = self.perms.applicable(true);
        let object = matrix.get_perm(type_id).unwrap_or_default();
        let exact = matrix.get_field_perm(type_id, field);
        let mut entry = exact.unwrap_or(object).intersection(object);
        if exact.is_some_and(PermEntry::is_creatable) {
            entry = entry.with_create();
        }
        entry
    }

    pub(crate) fn type_perm(&self, type_id: u16) -> PermEntry {
        if self.perms.is_supergash() {
            return PermEntry::full();
        }
        self.perms.persona_perms().get_perm(type_id).unwrap_or_default()
    }

    /// True if the active identity owns `obj`, directly, through the type's
    /// ownership hook, or through owner-group membership. Embedded objects
    /// answer for their outermost container.
    pub fn is_owned(&self, obj: &dyn ObjectView) -> DbResult<bool> {
        let schema = self.store.schema();
        if !schema.object_type(obj.type_id())?.embedded {
            return self.owns(obj);
        }
        let mut parent = obj.scalar(CONTAINER_FIELD).and_then(Value::as_invid);
        for _ in 0..MAX_EMBEDDING_DEPTH {
            let Some(invid) = parent else {
                return Ok(false);
            };
            let Some(found) = self.find(invid) else {
                return Ok(false);
            };
            if !schema.object_type(invid.type_id())?.embedded {
                return self.owns(&found);
            }
            parent = found.scalar(CONTAINER_FIELD).and_then(Value::as_invid);
        }
        Err(DbError::ShadowInvariant {
            invid: obj.invid(),
            message: format!("container chain deeper than {MAX_EMBEDDING_DEPTH}"),
        })
    }

    fn owns(&self, obj: &dyn ObjectView) -> DbResult<bool> {
        let invid = obj.invid();
        if Some(invid) == self.perms.persona() || invid == self.user {
            return Ok(true);
        }
        let schema = self.store.schema();
        let type_def = schema.object_type(obj.type_id())?;
        if type_def.behavior().grant_ownership(&self.hook_ctx(), obj) {
            return Ok(true);
        }
        Ok(self.persona_match(obj))
    }

    /// Breadth-first walk from the object's owner groups through groups that
    /// own those groups, looking for the active persona among the members.
    pub fn persona_match(&self, obj: &dyn ObjectView) -> bool {
        let Some(persona) = self.perms.persona() else {
            return false;
        };
        let mut queue: VecDeque<Invid> = obj.owners().into();
        match obj.type_id() {
            OWNER_BASE => queue.push_back(obj.invid()),
            PERSONA_BASE => queue.extend(obj.invids(PERSONA_GROUPS)),
            _ => {}
        }
        let mut visited = BTreeSet::new();
        while let Some(group) = queue.pop_front() {
            if group.type_id() != OWNER_BASE || !visited.insert(group) {
                continue;
            }
            let Some(found) = self.find(group) else {
                continue;
            };
            if found.invids(OWNER_MEMBERS).contains(&persona) {
                return true;
            }
            queue.extend(found.owners());
        }
        false
    }
}
