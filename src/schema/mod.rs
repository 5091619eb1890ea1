pub mod bootstrap;
pub mod constants;

use crate::error::{DbError, DbResult};
use crate::object::behavior::{DefaultBehavior, ObjectTypeBehavior};
use crate::perm::PermKey;
use compact_str::CompactString;
use constants::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Text,
    Int,
    Float,
    Bool,
    Date,
    Invid,
    Ip,
    Secret,
    PermMatrix,
}

impl FieldKind {
    /// Kinds that hold plain [`crate::field::Value`] elements.
    pub const fn is_value_kind(self) -> bool {
        !matches!(self, FieldKind::Secret | FieldKind::PermMatrix)
    }
}

/// Where an invid field may point, and the field on the far side that keeps
/// the back-reference.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkTarget {
    pub type_id: Option<u16>,
    pub symmetric_field: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldDef {
    pub id: u16,
    pub name: CompactString,
    pub kind: FieldKind,
    pub vector: bool,
    pub namespace: Option<CompactString>,
    pub max_len: Option<usize>,
    pub max_size: Option<usize>,
    pub target: Option<LinkTarget>,
    pub builtin: bool,
    /// Reads are answered by the type's `virtual_value` hook.
    pub virtualized: bool,
}

impl FieldDef {
    pub fn new(id: u16, name: impl Into<CompactString>, kind: FieldKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            vector: false,
            namespace: None,
            max_len: None,
            max_size: None,
            target: None,
            builtin: false,
            virtualized: false,
        }
    }

    pub fn text(id: u16, name: impl Into<CompactString>) -> Self {
        Self::new(id, name, FieldKind::Text)
    }

    pub fn invid(id: u16, name: impl Into<CompactString>) -> Self {
        Self::new(id, name, FieldKind::Invid)
    }

    pub fn vector(mut self) -> Self {
        self.vector = true;
        self
    }

    pub fn namespace(mut self, name: impl Into<CompactString>) -> Self {
        self.namespace = Some(name.into());
        self
    }

    pub fn max_len(mut self, len: usize) -> Self {
        self.max_len = Some(len);
        self
    }

    pub fn max_size(mut self, size: usize) -> Self {
        self.max_size = Some(size);
        self
    }

    pub fn target_type(mut self, type_id: u16) -> Self {
        let target = self.target.get_or_insert(LinkTarget {
            type_id: None,
            symmetric_field: None,
        });
        target.type_id = Some(type_id);
        self
    }

    /// Makes this invid field one end of a bidirectional reference.
    pub fn symmetric(mut self, type_id: u16, field: u16) -> Self {
        self.target = Some(LinkTarget {
            type_id: Some(type_id),
            symmetric_field: Some(field),
        });
        self
    }

    pub fn virtualized(mut self) -> Self {
        self.virtualized = true;
        self
    }

    fn builtin(mut self) -> Self {
        self.builtin = true;
        self
    }

    pub fn symmetric_link(&self) -> Option<(u16, u16)> {
        let target = self.target?;
        Some((target.type_id?, target.symmetric_field?))
    }
}

/// Schema description of one record kind.
pub struct ObjectTypeDef {
    pub id: u16,
    pub name: CompactString,
    pub label_field: Option<u16>,
    pub embedded: bool,
    fields: BTreeMap<u16, FieldDef>,
    behavior: Arc<dyn ObjectTypeBehavior>,
}

impl fmt::Debug for ObjectTypeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectTypeDef")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("label_field", &self.label_field)
            .field("embedded", &self.embedded)
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ObjectTypeDef {
    /// A top-level type carrying the builtin owner-list and history fields.
    pub fn new(id: u16, name: impl Into<CompactString>) -> Self {
        let mut def = Self {
            id,
            name: name.into(),
            label_field: None,
            embedded: false,
            fields: BTreeMap::new(),
            behavior: Arc::new(DefaultBehavior),
        };
        def.insert_builtin(
            FieldDef::invid(OWNER_LIST_FIELD, "owner list")
                .vector()
                .target_type(OWNER_BASE),
        );
        def.insert_history_fields();
        def
    }

    /// A type whose records live inside a container record.
    pub fn embedded(id: u16, name: impl Into<CompactString>) -> Self {
        let mut def = Self {
            id,
            name: name.into(),
            label_field: None,
            embedded: true,
            fields: BTreeMap::new(),
            behavior: Arc::new(DefaultBehavior),
        };
        def.insert_builtin(FieldDef::invid(CONTAINER_FIELD, "container"));
        def.insert_history_fields();
        def
    }

    /// Pairs an embedded type's container field with the vector field on the
    /// container type that lists its children.
    pub fn contained_by(mut self, type_id: u16, field: u16) -> Self {
        self.insert_builtin(FieldDef::invid(CONTAINER_FIELD, "container").symmetric(type_id, field));
        self
    }

    fn insert_history_fields(&mut self) {
        self.insert_builtin(FieldDef::new(REMOVAL_FIELD, "removal date", FieldKind::Date));
        self.insert_builtin(FieldDef::text(NOTES_FIELD, "notes"));
        self.insert_builtin(FieldDef::new(
            CREATION_DATE_FIELD,
            "creation date",
            FieldKind::Date,
        ));
        self.insert_builtin(FieldDef::text(CREATOR_FIELD, "creator"));
        self.insert_builtin(FieldDef::new(
            MODIFICATION_DATE_FIELD,
            "modification date",
            FieldKind::Date,
        ));
        self.insert_builtin(FieldDef::text(MODIFIER_FIELD, "modifier"));
    }

    fn insert_builtin(&mut self, def: FieldDef) {
        let def = def.builtin();
        self.fields.insert(def.id, def);
    }

    pub fn with_field(mut self, def: FieldDef) -> Self {
        self.fields.insert(def.id, def);
        self
    }

    pub fn with_label(mut self, field: u16) -> Self {
        self.label_field = Some(field);
        self
    }

    pub fn with_behavior(mut self, behavior: Arc<dyn ObjectTypeBehavior>) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn behavior(&self) -> &dyn ObjectTypeBehavior {
        self.behavior.as_ref()
    }

    pub fn field(&self, id: u16) -> DbResult<&FieldDef> {
        self.fields
            .get(&id)
            .ok_or_else(|| DbError::field_not_found(self.id, id))
    }

    pub fn has_field(&self, id: u16) -> bool {
        self.fields.contains_key(&id)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.values()
    }

    /// Fields defined by the application, excluding builtins.
    pub fn custom_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.values().filter(|f| !f.builtin)
    }

    pub fn remove_field(&mut self, id: u16) -> Option<FieldDef> {
        self.fields.remove(&id)
    }

    fn validate(&self) -> DbResult<()> {
        if let Some(label) = self.label_field {
            let def = self.field(label)?;
            if def.vector || def.kind != FieldKind::Text {
                return Err(DbError::InvalidArgument(format!(
                    "label field {} of type {} must be a scalar text field",
                    label, self.name
                )));
            }
        }
        for def in self.fields.values() {
            if !def.builtin && def.id < FIRST_USER_FIELD {
                return Err(DbError::InvalidArgument(format!(
                    "field id {} of type {} is reserved for builtin fields",
                    def.id, self.name
                )));
            }
            if def.target.is_some() && def.kind != FieldKind::Invid {
                return Err(DbError::InvalidArgument(format!(
                    "field {} of type {} has a link target but is not an invid field",
                    def.name, self.name
                )));
            }
            if def.vector && !def.kind.is_value_kind() {
                return Err(DbError::InvalidArgument(format!(
                    "field {} of type {} cannot be a vector of {:?}",
                    def.name, self.name, def.kind
                )));
            }
        }
        Ok(())
    }
}

/// The set of object types, with a generation counter bumped on every edit.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    types: BTreeMap<u16, Arc<ObjectTypeDef>>,
    namespaces: BTreeMap<CompactString, bool>,
    generation: u64,
}

impl Schema {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn object_type(&self, type_id: u16) -> DbResult<&Arc<ObjectTypeDef>> {
        self.types
            .get(&type_id)
            .ok_or_else(|| DbError::type_not_found(type_id))
    }

    pub fn field(&self, type_id: u16, field: u16) -> DbResult<&FieldDef> {
        self.object_type(type_id)?.field(field)
    }

    pub fn types(&self) -> impl Iterator<Item = &Arc<ObjectTypeDef>> {
        self.types.values()
    }

    pub fn type_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.types.keys().copied()
    }

    /// Declared namespaces and whether each folds case.
    pub fn namespaces(&self) -> impl Iterator<Item = (&str, bool)> {
        self.namespaces.iter().map(|(name, ci)| (name.as_str(), *ci))
    }

    pub fn declare_namespace(&mut self, name: impl Into<CompactString>, case_insensitive: bool) {
        self.namespaces.insert(name.into(), case_insensitive);
        self.generation += 1;
    }

    /// Adds or replaces a type. Namespaces referenced by its fields must
    /// already be declared.
    pub fn register(&mut self, def: ObjectTypeDef) -> DbResult<()> {
        def.validate()?;
        for field in def.fields() {
            if let Some(ns) = &field.namespace
                && !self.namespaces.contains_key(ns)
            {
                return Err(DbError::NotFound {
                    resource_type: crate::error::ResourceType::Namespace,
                    resource_id: ns.to_string(),
                });
            }
        }
        self.types.insert(def.id, Arc::new(def));
        self.generation += 1;
        Ok(())
    }

    /// Removes a field definition. Existing values and matrix entries for it
    /// become orphans that are dropped when next written.
    pub fn drop_field(&mut self, type_id: u16, field: u16) -> DbResult<FieldDef> {
        let current = self.object_type(type_id)?;
        let def = current.field(field)?;
        if def.builtin {
            return Err(DbError::InvalidArgument(format!(
                "builtin field {field} cannot be dropped"
            )));
        }
        let mut edited = ObjectTypeDef {
            id: current.id,
            name: current.name.clone(),
            label_field: current.label_field.filter(|l| *l != field),
            embedded: current.embedded,
            fields: current.fields.clone(),
            behavior: Arc::clone(&current.behavior),
        };
        let removed = edited
            .remove_field(field)
            .ok_or_else(|| DbError::field_not_found(type_id, field))?;
        self.types.insert(type_id, Arc::new(edited));
        self.generation += 1;
        Ok(removed)
    }

    /// True if `key` names a live type and, when narrowed, a live field.
    pub fn perm_key_valid(&self, key: PermKey) -> bool {
        let Some(def) = self.types.get(&key.type_id) else {
            return false;
        };
        key.field.is_none_or(|f| def.has_field(f))
    }

    pub fn describe_key(&self, key: PermKey) -> String {
        let Some(def) = self.types.get(&key.type_id) else {
            return key.to_string();
        };
        match key.field {
            None => def.name.to_string(),
            Some(f) => match def.fields.get(&f) {
                Some(field) => format!("{}.{}", def.name, field.name),
                None => format!("{}.#{}", def.name, f),
            },
        }
    }
}
