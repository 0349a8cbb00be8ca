use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    /// A record carrying a store id no longer matches a stored row.
    #[error("Session record {id} no longer exists in the store")]
    Conflict { id: i64 },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// The backend refused the operation (used by test doubles and
    /// backends that can be taken offline).
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
