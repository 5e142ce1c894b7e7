use cascade_types::ObjectId;

/// A change record that violates the object model.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("unknown attribute {entity}.{attribute}")]
    UnknownAttribute { entity: String, attribute: String },

    #[error("missing required attribute {entity}.{attribute}")]
    MissingAttribute { entity: String, attribute: String },

    #[error("attribute {entity}.{attribute} expects {expected}")]
    TypeMismatch {
        entity: String,
        attribute: String,
        expected: String,
    },

    #[error("entity of {object} cannot change from {from} to {to}")]
    EntityChanged {
        object: ObjectId,
        from: String,
        to: String,
    },
}

/// Errors from persistent store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store holds a different version than the change was based on.
    /// `found` is `None` when the object no longer exists.
    #[error("version conflict on {object}: expected {expected:?}, found {found:?}")]
    Conflict {
        object: ObjectId,
        expected: Option<u64>,
        found: Option<u64>,
    },

    /// An insert named an identity the store already holds.
    #[error("object already exists: {0}")]
    AlreadyExists(ObjectId),

    /// A change record was rejected by the model during commit.
    #[error("invalid change for {object}: {source}")]
    Invalid {
        object: ObjectId,
        #[source]
        source: ModelError,
    },

    /// Storage backend is read-only or otherwise unavailable.
    #[error("store is read-only")]
    ReadOnly,

    /// Internal lock was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    LockPoisoned,
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
