use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            // Map "no rows" to NotFound
            sqlx::Error::RowNotFound => Self::NotFound("Resource not found".to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().unwrap_or_default();
                match code.as_ref() {
                    // PostgreSQL unique_violation: the partial index on
                    // non-terminal feedings lands here under concurrent starts
                    "23505" => {
                        let detail = db_err.message().to_string();
                        if detail.contains("feedings") {
                            Self::Conflict("Feeding already in progress".to_string())
                        } else {
                            Self::Conflict("Resource already exists".to_string())
                        }
                    }
                    // PostgreSQL foreign_key_violation
                    "23503" => Self::NotFound("Referenced resource not found".to_string()),
                    // PostgreSQL check_violation
                    "23514" => Self::Validation("Constraint check failed".to_string()),
                    // PostgreSQL not_null_violation
                    "23502" => Self::Validation("Required field is missing".to_string()),
                    _ => Self::Database(err),
                }
            }
            _ => Self::Database(err),
        }
    }
}

impl Error {
    /// Whether the error indicates malicious or invalid client usage.
    ///
    /// These drop the offending socket connection. Conflict and NotFound do
    /// not: a duplicate feeding request or a missing horse is an honest
    /// mistake, not abuse.
    #[must_use]
    pub const fn is_client_fault(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Forbidden(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
