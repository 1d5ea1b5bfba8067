//! Caller-facing error taxonomy of the management layer.

use meshkv_engine::EngineError;
use thiserror::Error;

/// Result type for management-layer operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced across the store facade.
///
/// Every public operation resolves to one of these; expected failure modes
/// never panic across the facade boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Key, value or identifier rejected before any engine work.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Flow control denied the operation; no engine work was performed.
    #[error("access rate exceeded")]
    RateLimited,

    /// The handle has been force-closed and holds no engine delegate.
    #[error("store is not open")]
    NotOpen,

    /// A collaborator required for the operation is missing or in the
    /// wrong state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Key, device or metadata record not found.
    #[error("not found")]
    NotFound,

    /// The physical store does not exist and creation was not requested.
    #[error("store not found")]
    StoreNotFound,

    /// The remote device did not answer within the engine's deadline.
    #[error("timed out")]
    TimedOut,

    /// A write violated a schema constraint.
    #[error("constraint violation")]
    ConstraintViolation,

    /// Store exists with a different schema, or the schema is malformed.
    #[error("schema mismatch")]
    SchemaMismatch,

    /// Malformed query, or query field unknown to the schema.
    #[error("invalid query")]
    InvalidQuery,

    /// Operation not supported for this store type or engine.
    #[error("not supported")]
    NotSupported,

    /// Security option of the request does not match the store, or the
    /// protecting device credential is unavailable.
    #[error("security level mismatch")]
    SecurityLevel,

    /// Secret key unavailable, invalid or not recoverable.
    #[error("crypt error")]
    CryptError,

    /// Generic engine failure.
    #[error("db error: {0}")]
    DbError(String),

    /// The engine reported corruption and recovery from the last backup
    /// succeeded. The triggering operation was not retried.
    #[error("store recovered from backup")]
    RecoverSucceeded,

    /// The engine reported corruption and recovery from the last backup
    /// failed.
    #[error("store recovery failed")]
    RecoverFailed,

    /// The per-bundle open-store cap is reached.
    #[error("too many open stores")]
    ResourceExhausted,

    /// One or more stores failed to migrate to the new account identity.
    #[error("store migration failed")]
    MigrationFailed,

    /// An account migration is being processed; retry afterwards.
    #[error("account event processing")]
    MigrationInProgress,

    /// The observer is already subscribed on this store.
    #[error("already subscribed")]
    AlreadySubscribed,

    /// The observer has no subscription on this store.
    #[error("not subscribed")]
    NotSubscribed,

    /// The caller lacks a resolvable application identity.
    #[error("permission denied")]
    PermissionDenied,
}

impl StoreError {
    /// Translates an engine status into the facade taxonomy.
    ///
    /// [`EngineError::CorruptedOrBadKey`] is deliberately absent here: the
    /// facade intercepts it before translation and runs the recovery path.
    #[must_use]
    pub fn from_engine(err: EngineError) -> Self {
        match err {
            EngineError::NotFound => Self::NotFound,
            EngineError::InvalidArgs(reason) => Self::InvalidArgument(reason),
            EngineError::InvalidValueFields
            | EngineError::InvalidFieldType
            | EngineError::InvalidFormat => Self::InvalidArgument("invalid format".to_string()),
            EngineError::ConstraintViolation => Self::ConstraintViolation,
            EngineError::SchemaMismatch | EngineError::InvalidSchema => Self::SchemaMismatch,
            EngineError::InvalidQueryFormat | EngineError::InvalidQueryField => Self::InvalidQuery,
            EngineError::NotSupported => Self::NotSupported,
            EngineError::KeyRevoked | EngineError::SecurityOption => Self::SecurityLevel,
            EngineError::TimedOut => Self::TimedOut,
            EngineError::Busy => Self::DbError("engine busy".to_string()),
            EngineError::CorruptedOrBadKey => Self::CryptError,
            EngineError::Db(reason) => Self::DbError(reason),
        }
    }

    /// Translates an engine open failure, distinguishing a missing store
    /// from a generic failure the way the open path reports them.
    #[must_use]
    pub fn from_engine_open(err: EngineError, create_if_missing: bool) -> Self {
        match err {
            EngineError::CorruptedOrBadKey => Self::CryptError,
            EngineError::SchemaMismatch | EngineError::InvalidSchema => Self::SchemaMismatch,
            EngineError::NotSupported => Self::NotSupported,
            EngineError::KeyRevoked | EngineError::SecurityOption => Self::SecurityLevel,
            EngineError::NotFound if !create_if_missing => Self::StoreNotFound,
            _ if create_if_missing => Self::DbError(err.to_string()),
            _ => Self::StoreNotFound,
        }
    }
}
