use serde::{Deserialize, Serialize};

use crate::change::{Attributes, ChangeKind};
use crate::identity::{ObjectId, SessionId};
use crate::role::SessionRole;

/// One object's entry in a [`CommitEvent`].
///
/// `attributes` and `version` are the committing session's view right after
/// the save. For deletes `attributes` is empty and `version` is a fresh
/// tombstone version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommittedChange {
    pub object: ObjectId,
    pub entity: String,
    pub kind: ChangeKind,
    pub attributes: Attributes,
    pub version: u64,
}

/// Change set announced when a session saves successfully.
///
/// `sequence` counts the source's successful non-empty saves, starting at 1,
/// so subscribers can observe commit order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitEvent {
    pub source: SessionId,
    pub source_role: SessionRole,
    pub sequence: u64,
    pub changes: Vec<CommittedChange>,
}

impl CommitEvent {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn object_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.changes.iter().map(|c| c.object)
    }

    pub fn of_kind(&self, kind: ChangeKind) -> impl Iterator<Item = &CommittedChange> + '_ {
        self.changes.iter().filter(move |c| c.kind == kind)
    }

    pub fn inserted(&self) -> impl Iterator<Item = &CommittedChange> + '_ {
        self.of_kind(ChangeKind::Insert)
    }

    pub fn updated(&self) -> impl Iterator<Item = &CommittedChange> + '_ {
        self.of_kind(ChangeKind::Update)
    }

    pub fn deleted(&self) -> impl Iterator<Item = &CommittedChange> + '_ {
        self.of_kind(ChangeKind::Delete)
    }

    pub fn contains(&self, object: &ObjectId) -> bool {
        self.changes.iter().any(|c| &c.object == object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(kind: ChangeKind) -> CommittedChange {
        CommittedChange {
            object: ObjectId::new(),
            entity: "User".into(),
            kind,
            attributes: Attributes::new(),
            version: 1,
        }
    }

    #[test]
    fn partitions_by_kind() {
        let event = CommitEvent {
            source: SessionId::next(),
            source_role: SessionRole::Background,
            sequence: 1,
            changes: vec![
                change(ChangeKind::Insert),
                change(ChangeKind::Insert),
                change(ChangeKind::Update),
                change(ChangeKind::Delete),
            ],
        };
        assert_eq!(event.len(), 4);
        assert_eq!(event.inserted().count(), 2);
        assert_eq!(event.updated().count(), 1);
        assert_eq!(event.deleted().count(), 1);

        let first = event.changes[0].object;
        assert!(event.contains(&first));
        assert!(!event.contains(&ObjectId::new()));
        assert_eq!(event.object_ids().count(), 4);
    }

    #[test]
    fn serde_roundtrip() {
        let event = CommitEvent {
            source: SessionId::next(),
            source_role: SessionRole::Store,
            sequence: 7,
            changes: vec![change(ChangeKind::Update)],
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: CommitEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }
}
