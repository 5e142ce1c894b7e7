use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::ObjectId;

/// Attribute values of an object, keyed by attribute name.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// An object as materialized inside one session.
///
/// `version` identifies the content state of the object as that session
/// exposes it to its children. It changes every time the session's view of
/// the object changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManagedObject {
    pub id: ObjectId,
    pub entity: String,
    pub attributes: Attributes,
    pub version: u64,
}

impl ManagedObject {
    pub fn new(id: ObjectId, entity: impl Into<String>, attributes: Attributes, version: u64) -> Self {
        Self {
            id,
            entity: entity.into(),
            attributes,
            version,
        }
    }

    /// Read a single attribute.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    /// Overwrite the given attributes and return the keys whose value
    /// actually changed.
    pub fn apply(&mut self, values: &Attributes) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        for (key, value) in values {
            if self.attributes.get(key) != Some(value) {
                self.attributes.insert(key.clone(), value.clone());
                changed.insert(key.clone());
            }
        }
        changed
    }
}

/// Kind of a pending or committed change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// A pending change accumulated while a session is open.
///
/// Cleared on successful save or discard. `values` holds the full attribute
/// set after the change (empty for deletes); `dirty` names the attributes
/// the session touched. `base_version` is the version the session observed
/// in its backing before the first modification, `None` for inserts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub object: ObjectId,
    pub entity: String,
    pub kind: ChangeKind,
    pub dirty: BTreeSet<String>,
    pub values: Attributes,
    pub base_version: Option<u64>,
}

impl ChangeRecord {
    pub fn insert(object: &ManagedObject) -> Self {
        Self {
            object: object.id,
            entity: object.entity.clone(),
            kind: ChangeKind::Insert,
            dirty: object.attributes.keys().cloned().collect(),
            values: object.attributes.clone(),
            base_version: None,
        }
    }

    pub fn update(object: &ManagedObject, dirty: BTreeSet<String>, base_version: Option<u64>) -> Self {
        Self {
            object: object.id,
            entity: object.entity.clone(),
            kind: ChangeKind::Update,
            dirty,
            values: object.attributes.clone(),
            base_version,
        }
    }

    pub fn delete(object: &ManagedObject, base_version: Option<u64>) -> Self {
        Self {
            object: object.id,
            entity: object.entity.clone(),
            kind: ChangeKind::Delete,
            dirty: BTreeSet::new(),
            values: Attributes::new(),
            base_version,
        }
    }

    /// Fold a later change to the same object into this one.
    ///
    /// Returns `None` when the two cancel out (an insert followed by a
    /// delete never needs to reach the backing). The earlier record's
    /// `base_version` always wins: it is what the backing will be checked
    /// against.
    pub fn coalesce(self, next: ChangeRecord) -> Option<ChangeRecord> {
        debug_assert_eq!(self.object, next.object);
        let base_version = self.base_version;
        let merged = match (self.kind, next.kind) {
            (ChangeKind::Insert, ChangeKind::Delete) => return None,
            (ChangeKind::Insert, _) => ChangeRecord {
                kind: ChangeKind::Insert,
                dirty: next.values.keys().cloned().collect(),
                ..next
            },
            (ChangeKind::Update, ChangeKind::Delete) => ChangeRecord {
                base_version,
                ..next
            },
            (ChangeKind::Update, _) => {
                let mut dirty = self.dirty;
                dirty.extend(next.dirty);
                ChangeRecord {
                    kind: ChangeKind::Update,
                    dirty,
                    base_version,
                    ..next
                }
            }
            // Re-inserting a deleted identity becomes an update of the
            // original object.
            (ChangeKind::Delete, ChangeKind::Insert) => ChangeRecord {
                kind: ChangeKind::Update,
                dirty: next.values.keys().cloned().collect(),
                base_version,
                ..next
            },
            (ChangeKind::Delete, _) => ChangeRecord {
                base_version,
                ..next
            },
        };
        Some(merged)
    }
}
