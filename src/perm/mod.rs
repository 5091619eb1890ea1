pub mod matrix_field;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub use matrix_field::{MatrixRole, check_grant};

/// Visible/editable/creatable/deletable bit set.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PermEntry(u8);

impl PermEntry {
    pub const VISIBLE: u8 = 1;
    pub const EDITABLE: u8 = 2;
    pub const CREATABLE: u8 = 4;
    pub const DELETABLE: u8 = 8;
    const ALL: u8 = Self::VISIBLE | Self::EDITABLE | Self::CREATABLE | Self::DELETABLE;

    pub const fn new(visible: bool, editable: bool, create: bool, delete: bool) -> Self {
        let mut bits = 0;
        if visible {
            bits |= Self::VISIBLE;
        }
        if editable {
            bits |= Self::EDITABLE;
        }
        if create {
            bits |= Self::CREATABLE;
        }
        if delete {
            bits |= Self::DELETABLE;
        }
        Self(bits)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn none() -> Self {
        Self(0)
    }

    pub const fn full() -> Self {
        Self(Self::ALL)
    }

    pub const fn view_only() -> Self {
        Self(Self::VISIBLE)
    }

    pub const fn is_visible(self) -> bool {
        self.0 & Self::VISIBLE != 0
    }

    pub const fn is_editable(self) -> bool {
        self.0 & Self::EDITABLE != 0
    }

    pub const fn is_creatable(self) -> bool {
        self.0 & Self::CREATABLE != 0
    }

    pub const fn is_deletable(self) -> bool {
        self.0 & Self::DELETABLE != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn union(self, other: PermEntry) -> PermEntry {
        Self(self.0 | other.0)
    }

    pub const fn intersection(self, other: PermEntry) -> PermEntry {
        Self(self.0 & other.0)
    }

    pub const fn with_create(self) -> PermEntry {
        Self(self.0 | Self::CREATABLE)
    }

    pub const fn is_subset_of(self, other: PermEntry) -> bool {
        self.0 & !other.0 == 0
    }

    /// Human-readable change from `self` to `newer`, or `None` if identical.
    pub fn difference(self, newer: PermEntry) -> Option<String> {
        if self == newer {
            return None;
        }
        let mut parts = Vec::new();
        for (bit, name) in Self::NAMES {
            match (self.0 & bit != 0, newer.0 & bit != 0) {
                (false, true) => parts.push(format!("+{name}")),
                (true, false) => parts.push(format!("-{name}")),
                _ => {}
            }
        }
        Some(parts.join(" "))
    }

    const NAMES: [(u8, &'static str); 4] = [
        (Self::VISIBLE, "visible"),
        (Self::EDITABLE, "editable"),
        (Self::CREATABLE, "create"),
        (Self::DELETABLE, "delete"),
    ];
}

impl fmt::Display for PermEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "[{}]", names.join(" "))
    }
}

/// Matrix key: an object type, optionally narrowed to one field. A key with
/// no field is the object-level entry for the type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PermKey {
    pub type_id: u16,
    pub field: Option<u16>,
}

impl PermKey {
    pub const fn object(type_id: u16) -> Self {
        Self {
            type_id,
            field: None,
        }
    }

    pub const fn field(type_id: u16, field: u16) -> Self {
        Self {
            type_id,
            field: Some(field),
        }
    }

    pub const fn base(self) -> Self {
        Self::object(self.type_id)
    }
}

impl fmt::Display for PermKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.field {
            Some(field) => write!(f, "{}:{}", self.type_id, field),
            None => write!(f, "{}::", self.type_id),
        }
    }
}

/// Capability matrix: `(type, field-or-wildcard)` to [`PermEntry`].
///
/// A field key that is absent inherits the object-level entry of its type;
/// an absent object-level entry means no permission.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermMatrix {
    entries: BTreeMap<PermKey, PermEntry>,
}

impl PermMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact object-level entry for `type_id`.
    pub fn get_perm(&self, type_id: u16) -> Option<PermEntry> {
        self.entries.get(&PermKey::object(type_id)).copied()
    }

    /// Exact field-level entry, without inheritance.
    pub fn get_field_perm(&self, type_id: u16, field: u16) -> Option<PermEntry> {
        self.entries.get(&PermKey::field(type_id, field)).copied()
    }

    /// Entry in force for `key`: the exact entry, else the type's object-level
    /// entry, else none.
    pub fn effective(&self, key: PermKey) -> PermEntry {
        self.entries
            .get(&key)
            .or_else(|| self.entries.get(&key.base()))
            .copied()
            .unwrap_or_default()
    }

    pub fn set_perm(&mut self, key: PermKey, entry: PermEntry) {
        self.entries.insert(key, entry);
    }

    pub fn remove(&mut self, key: PermKey) -> Option<PermEntry> {
        self.entries.remove(&key)
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (PermKey, PermEntry)> + '_ {
        self.entries.iter().map(|(k, v)| (*k, *v))
    }

    pub fn keys(&self) -> impl Iterator<Item = PermKey> + '_ {
        self.entries.keys().copied()
    }

    /// Per-key OR with field-to-object inheritance: a field key present on
    /// one side only is combined with the other side's object-level entry, so
    /// `effective` distributes over the union.
    pub fn union(&self, other: &PermMatrix) -> PermMatrix {
        let mut out = BTreeMap::new();
        let keys: BTreeSet<PermKey> = self.entries.keys().chain(other.entries.keys()).copied().collect();
        for key in keys {
            let entry = match (self.entries.get(&key), other.entries.get(&key)) {
                (Some(a), Some(b)) => a.union(*b),
                (Some(a), None) => inherit_union(*a, key, other),
                (None, Some(b)) => inherit_union(*b, key, self),
                (None, None) => continue,
            };
            out.insert(key, entry);
        }
        PermMatrix { entries: out }
    }

    /// Per-key AND over the union of both key sets, using effective entries.
    pub fn intersection(&self, other: &PermMatrix) -> PermMatrix {
        let keys: BTreeSet<PermKey> = self.entries.keys().chain(other.entries.keys()).copied().collect();
        let entries = keys
            .into_iter()
            .map(|key| (key, self.effective(key).intersection(other.effective(key))))
            .collect();
        PermMatrix { entries }
    }

    /// True if every effective entry of `other` is contained in ours.
    pub fn is_superset_of(&self, other: &PermMatrix) -> bool {
        let keys: BTreeSet<PermKey> = self.entries.keys().chain(other.entries.keys()).copied().collect();
        keys.into_iter()
            .all(|key| other.effective(key).is_subset_of(self.effective(key)))
    }

    /// Drops entries whose key no longer resolves. Returns the number removed.
    pub fn retain_valid(&mut self, is_valid: impl Fn(PermKey) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| is_valid(*key));
        before - self.entries.len()
    }

    /// Human-readable delta from `older` to `self`, or `None` if unchanged.
    pub fn diff(&self, older: &PermMatrix, describe: impl Fn(PermKey) -> String) -> Option<String> {
        let mut lines = Vec::new();
        for (key, entry) in &self.entries {
            match older.entries.get(key) {
                None => lines.push(format!("added {}: {}", describe(*key), entry)),
                Some(prev) => {
                    if let Some(change) = prev.difference(*entry) {
                        lines.push(format!(
                            "changed {}: {} -> {} ({})",
                            describe(*key),
                            prev,
                            entry,
                            change
                        ));
                    }
                }
            }
        }
        for (key, entry) in &older.entries {
            if !self.entries.contains_key(key) {
                lines.push(format!("removed {}: {}", describe(*key), entry));
            }
        }
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}

fn inherit_union(entry: PermEntry, key: PermKey, other: &PermMatrix) -> PermEntry {
    match key.field {
        Some(_) => other
            .entries
            .get(&key.base())
            .map_or(entry, |base| entry.union(*base)),
        None => entry,
    }
}

#[cfg(test)]
mod tests {
    use super::{PermEntry, PermKey, PermMatrix};
    use proptest::prelude::*;

    const USER: u16 = 256;

    #[test]
    fn entry_algebra() {
        let view_create = PermEntry::new(true, false, true, false);
        let edit = PermEntry::new(false, true, false, false);
        assert_eq!(view_create.union(edit), PermEntry::new(true, true, true, false));
        assert_eq!(view_create.intersection(edit), PermEntry::none());
        assert!(PermEntry::view_only().is_subset_of(view_create));
        assert!(!PermEntry::full().is_subset_of(view_create));
        assert_eq!(PermEntry::from_bits(0xff), PermEntry::full());
    }

    #[test]
    fn entry_difference_names_changed_bits() {
        let before = PermEntry::new(true, true, false, false);
        let after = PermEntry::new(true, false, false, true);
        assert_eq!(before.difference(after).as_deref(), Some("-editable +delete"));
        assert_eq!(before.difference(before), None);
    }

    #[test]
    fn field_entries_inherit_the_object_entry() {
        let mut m = PermMatrix::new();
        m.set_perm(PermKey::object(USER), PermEntry::view_only());
        m.set_perm(PermKey::field(USER, 101), PermEntry::full());
        assert_eq!(m.effective(PermKey::field(USER, 100)), PermEntry::view_only());
        assert_eq!(m.effective(PermKey::field(USER, 101)), PermEntry::full());
        assert_eq!(m.effective(PermKey::object(USER + 1)), PermEntry::none());
    }

    #[test]
    fn union_folds_the_other_sides_object_entry_into_lone_field_keys() {
        let mut a = PermMatrix::new();
        a.set_perm(PermKey::field(USER, 101), PermEntry::new(false, true, false, false));
        let mut b = PermMatrix::new();
        b.set_perm(PermKey::object(USER), PermEntry::view_only());

        let u = a.union(&b);
        assert_eq!(
            u.get_field_perm(USER, 101),
            Some(PermEntry::new(true, true, false, false))
        );
        assert_eq!(u.get_perm(USER), Some(PermEntry::view_only()));
    }

    #[test]
    fn diff_reports_added_changed_and_removed() {
        let mut old = PermMatrix::new();
        old.set_perm(PermKey::object(USER), PermEntry::view_only());
        old.set_perm(PermKey::field(USER, 100), PermEntry::full());
        let mut new = PermMatrix::new();
        new.set_perm(PermKey::object(USER), PermEntry::new(true, true, false, false));
        new.set_perm(PermKey::object(USER + 1), PermEntry::view_only());

        let text = new.diff(&old, |k| k.to_string()).expect("changes");
        assert!(text.contains("changed 256::"));
        assert!(text.contains("added 257::"));
        assert!(text.contains("removed 256:100"));
        assert_eq!(new.diff(&new, |k| k.to_string()), None);
    }

    #[test]
    fn retain_valid_drops_orphans() {
        let mut m = PermMatrix::new();
        m.set_perm(PermKey::object(USER), PermEntry::full());
        m.set_perm(PermKey::field(USER, 150), PermEntry::full());
        let removed = m.retain_valid(|k| k.field != Some(150));
        assert_eq!(removed, 1);
        assert_eq!(m.len(), 1);
    }

    fn arb_matrix() -> impl Strategy<Value = PermMatrix> {
        let key = (256u16..259, prop::option::of(100u16..104));
        prop::collection::vec((key, 0u8..16), 0..12).prop_map(|pairs| {
            let mut m = PermMatrix::new();
            for ((type_id, field), bits) in pairs {
                m.set_perm(PermKey { type_id, field }, PermEntry::from_bits(bits));
            }
            m
        })
    }

    proptest! {
        #[test]
        fn union_distributes_over_effective(a in arb_matrix(), b in arb_matrix(), t in 256u16..259, f in prop::option::of(100u16..104)) {
            let key = PermKey { type_id: t, field: f };
            let u = a.union(&b);
            prop_assert_eq!(u.effective(key), a.effective(key).union(b.effective(key)));
            prop_assert!(u.is_superset_of(&a));
            prop_assert!(u.is_superset_of(&b));
        }

        #[test]
        fn intersection_is_contained_in_both(a in arb_matrix(), b in arb_matrix()) {
            let i = a.intersection(&b);
            prop_assert!(a.is_superset_of(&i));
            prop_assert!(b.is_superset_of(&i));
        }
    }
}
