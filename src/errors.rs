pub type GraphResult<T> = Result<T, GraphError>;

#[derive(thiserror::Error, Debug)]
pub enum GraphError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("transient store error: {0}")]
    TransientStore(String),
    #[error("internal store error: {0}")]
    InternalStore(String),
    /// A compensating step failed or timed out; the graph may be partially mutated.
    #[error("rollback incomplete ({failed_steps} compensation(s) failed) after: {source}")]
    AmbiguousRollback {
        failed_steps: usize,
        #[source]
        source: Box<GraphError>,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GraphError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionFailed(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientStore(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalStore(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn ambiguous_rollback(failed_steps: usize, source: GraphError) -> Self {
        Self::AmbiguousRollback {
            failed_steps,
            source: Box::new(source),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, GraphError::TransientStore(_))
    }

    /// Stable machine-readable code, used by audit records.
    pub fn code(&self) -> &'static str {
        match self {
            GraphError::NotFound(_) => "not_found",
            GraphError::Conflict(_) => "conflict",
            GraphError::PreconditionFailed(_) => "precondition_failed",
            GraphError::TransientStore(_) => "transient_store",
            GraphError::InternalStore(_) => "internal_store",
            GraphError::AmbiguousRollback { .. } => "ambiguous_rollback",
            GraphError::Configuration(_) => "configuration",
        }
    }
}

// SQLite primary result codes for SQLITE_BUSY and SQLITE_LOCKED; extended codes
// keep the primary code in the low byte.
fn is_contention_code(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .map(|c| matches!(c & 0xff, 5 | 6))
        .unwrap_or(false)
}

impl From<sqlx::Error> for GraphError {
    fn from(value: sqlx::Error) -> Self {
        match &value {
            sqlx::Error::PoolTimedOut => Self::transient("timed out acquiring a database connection"),
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    Self::conflict(db_err.message().to_string())
                } else if db_err.is_foreign_key_violation() {
                    Self::conflict(format!("still referenced: {}", db_err.message()))
                } else if is_contention_code(db_err.code().as_deref()) {
                    Self::transient(db_err.message().to_string())
                } else {
                    Self::internal(format!("database error: {}", db_err.message()))
                }
            }
            _ => Self::internal(format!("database error: {value}")),
        }
    }
}

impl From<anyhow::Error> for GraphError {
    fn from(value: anyhow::Error) -> Self {
        Self::InternalStore(value.to_string())
    }
}
