use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("state store backend failed: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("failed to decode stored value for {key}: {reason}")]
    Decode { key: String, reason: String },
}

/// Error returned by the repository-style collaborators (users, verification codes).
///
/// `NotFound` is kept apart from backend failures so callers can tell a
/// missing row from a broken database.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{entity} not found")]
    NotFound { entity: &'static str },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl RepositoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound { .. })
    }
}

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("invalid email address: {0}")]
    InvalidAddress(String),
    #[error("failed to build email: {0}")]
    Build(String),
    #[error("SMTP delivery failed: {0}")]
    Transport(String),
    #[error("email template failed: {0}")]
    Template(String),
    #[error("email delivery timed out after {0}s")]
    Timeout(u64),
}

#[derive(Debug, Error)]
pub enum OtpError {
    #[error("secure random source failed: {0}")]
    Entropy(#[from] rand::Error),
}

/// Everything a dialog handler can fail with.
#[derive(Debug, Error)]
pub enum DialogError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Email(#[from] EmailError),
    #[error(transparent)]
    Otp(#[from] OtpError),
    #[error(transparent)]
    Telegram(#[from] teloxide::RequestError),
    #[error("conversation data is missing `{0}`")]
    MissingData(&'static str),
    #[error("no handler registered for state `{0}`")]
    NoHandler(String),
    #[error("dialog cancelled")]
    Cancelled,
}

/// What the router does with a conversation after a handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Keep state and data, ask the user to try again.
    Hold,
    /// Finish the dialog so the user can start over.
    Reset,
}

impl DialogError {
    pub fn recovery(&self) -> Recovery {
        match self {
            DialogError::MissingData(_) | DialogError::NoHandler(_) => Recovery::Reset,
            DialogError::Storage(StorageError::Decode { .. }) => Recovery::Reset,
            _ => Recovery::Hold,
        }
    }
}
