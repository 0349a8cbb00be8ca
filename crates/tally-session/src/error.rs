//! Error types for session tracking operations.

/// Error type for session tracking operations.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// No session history exists anywhere for this user.
    #[error("no last session end time found for user {user_key}")]
    NotFound { user_key: String },

    /// Error from the durable store.
    #[error("Store error: {0}")]
    Store(#[from] tally_store::StoreError),
}

impl TrackerError {
    /// The user key a [`TrackerError::NotFound`] refers to.
    pub fn user_key(&self) -> Option<&str> {
        match self {
            Self::NotFound { user_key } => Some(user_key),
            Self::Store(_) => None,
        }
    }
}

/// Result type for session tracking operations.
pub type Result<T> = std::result::Result<T, TrackerError>;
