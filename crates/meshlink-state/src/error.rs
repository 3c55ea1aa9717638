//! Error types for the persistence layer

use thiserror::Error;

/// Errors that can occur in store operations
#[derive(Error, Debug)]
pub enum StateError {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Record not found
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind (node, preference)
        entity: String,
        /// Key that was looked up
        id: String,
    },

    /// Stored value could not be interpreted
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),
}

impl From<sqlx::Error> for StateError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StateError::NotFound {
                entity: "record".to_string(),
                id: "unknown".to_string(),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StateError::Connection(err.to_string())
            }
            _ => StateError::Database(err.to_string()),
        }
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StateError>;
