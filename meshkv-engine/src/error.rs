//! Engine status codes.

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failure statuses reported by a storage engine.
///
/// The management layer translates these into its own caller-facing
/// taxonomy; the variants here mirror what an embedded synchronizing
/// engine can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The requested key, store or device does not exist.
    #[error("not found")]
    NotFound,

    /// Arguments rejected by the engine.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// The engine is busy; the operation may be retried later.
    #[error("busy")]
    Busy,

    /// Wrong password or corrupted database.
    ///
    /// This status is special: the management layer intercepts it
    /// everywhere and runs the backup recovery path instead of surfacing
    /// the raw error.
    #[error("invalid password or corrupted database")]
    CorruptedOrBadKey,

    /// The store exists with a different schema.
    #[error("schema mismatch")]
    SchemaMismatch,

    /// The supplied schema is malformed.
    #[error("invalid schema")]
    InvalidSchema,

    /// Value does not conform to the schema fields.
    #[error("invalid value fields")]
    InvalidValueFields,

    /// A schema field has the wrong type.
    #[error("invalid field type")]
    InvalidFieldType,

    /// A schema constraint was violated by the write.
    #[error("constraint violation")]
    ConstraintViolation,

    /// Malformed data or key format.
    #[error("invalid format")]
    InvalidFormat,

    /// Malformed query.
    #[error("invalid query format")]
    InvalidQueryFormat,

    /// Query references a field the schema does not define.
    #[error("invalid query field")]
    InvalidQueryField,

    /// Operation not supported by this engine or store type.
    #[error("not supported")]
    NotSupported,

    /// The device credential protecting the store has been revoked.
    #[error("encryption key revoked")]
    KeyRevoked,

    /// Security option of the request does not match the store.
    #[error("security option check failed")]
    SecurityOption,

    /// The remote device did not answer in time.
    #[error("timed out")]
    TimedOut,

    /// Generic engine failure.
    #[error("db error: {0}")]
    Db(String),
}
