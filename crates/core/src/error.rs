use hetu_lib::SchemaError;
use thiserror::Error;

/// Errors of the data layer.
///
/// `Race` is the only variant used for control flow: the retry driver catches
/// exactly it (and the upsert-anchor unique conflict, which is reclassified
/// to it) and re-runs the session body. Everything else propagates.
#[derive(Error, Debug)]
pub enum DbError {
    /// Optimistic-concurrency conflict detected at commit, recovered by the
    /// retry driver.
    #[error("race condition: {0}")]
    Race(String),

    /// Insert or update breaking a unique index. Caller-visible, except when
    /// raised against an upsert's anchor field.
    #[error("unique violation: {comp}.{field} already holds this value")]
    Unique { comp: String, field: String },

    /// Update/delete of a row the session never loaded.
    #[error("row {id} not present in session cache")]
    Lookup { id: i64 },

    #[error("permission denied")]
    PermissionDenied,

    /// Malformed input. A protocol violation when it came from a client.
    #[error("validation: {0}")]
    Validation(String),

    /// Component digest does not match the stored table meta and migration
    /// was not explicitly requested.
    #[error("schema drift on `{table}`: {detail}")]
    SchemaDrift { table: String, detail: String },

    #[error("worker id lease lost")]
    WorkerLeaseLost,

    #[error("no free worker id, all {0} leases taken")]
    WorkerIdsExhausted(u32),

    #[error("exceeded maximum retry attempts ({0})")]
    RetriesExceeded(u32),

    #[error("unknown system `{0}`")]
    UnknownSystem(String),

    #[error("unknown endpoint `{0}`")]
    UnknownEndpoint(String),

    #[error("subscription limit reached")]
    SubscriptionLimit,

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DbError {
    pub fn is_race(&self) -> bool {
        matches!(self, DbError::Race(_))
    }

    /// The taxonomy name reported to clients that opted into error replies.
    pub fn kind(&self) -> &'static str {
        match self {
            DbError::Race(_) => "RACE",
            DbError::Unique { .. } => "UNIQUE_VIOLATION",
            DbError::Lookup { .. } => "LOOKUP",
            DbError::PermissionDenied => "PERMISSION_DENIED",
            DbError::Validation(_) | DbError::UnknownSystem(_) | DbError::UnknownEndpoint(_) => {
                "VALIDATION"
            }
            DbError::SchemaDrift { .. } => "SCHEMA_DRIFT",
            DbError::WorkerLeaseLost | DbError::WorkerIdsExhausted(_) => "WORKER_LEASE_LOST",
            DbError::RetriesExceeded(_) => "RETRIES_EXCEEDED",
            DbError::SubscriptionLimit => "SUBSCRIPTION_LIMIT",
            DbError::Schema(_) => "SCHEMA",
            DbError::Other(_) => "INTERNAL",
        }
    }
}
