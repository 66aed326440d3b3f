use thiserror::Error;

pub type Result<T> = std::result::Result<T, CapsuleError>;

/// Failure categories used by the retry executor.
///
/// Retryability is decided by matching on the category, never on message
/// text. `Database` and `Transport` cover transient infrastructure faults;
/// `Backend` is a definitive rejection from the hypervisor and is not
/// retried by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Database,
    Transport,
    Backend,
    InvalidTransition,
    QuotaExceeded,
    NotFound,
    InvalidInput,
    Io,
    Serialization,
    Internal,
}

#[derive(Error, Debug)]
pub enum CapsuleError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Transport-level failure talking to the hypervisor backend
    /// (connection refused, timeout, broken pipe).
    #[error("Backend transport error: {0}")]
    Transport(String),

    /// Definitive rejection from the hypervisor backend: the call reached
    /// the backend and the backend said no.
    #[error("Backend rejected operation (code {code}): {detail}")]
    Backend { code: i32, detail: String },

    #[error("Illegal transition for VM {vm_id}: {from} -> {to} (current state: {current})")]
    InvalidTransition {
        vm_id: String,
        from: String,
        to: String,
        current: String,
    },

    #[error("Quota exceeded for user {0}")]
    QuotaExceeded(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CapsuleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CapsuleError::Database(_) | CapsuleError::Migration(_) => ErrorKind::Database,
            CapsuleError::Transport(_) => ErrorKind::Transport,
            CapsuleError::Backend { .. } => ErrorKind::Backend,
            CapsuleError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            CapsuleError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            CapsuleError::NotFound(_) => ErrorKind::NotFound,
            CapsuleError::InvalidInput(_) => ErrorKind::InvalidInput,
            CapsuleError::Io(_) => ErrorKind::Io,
            CapsuleError::Serialization(_) => ErrorKind::Serialization,
            CapsuleError::Internal(_) => ErrorKind::Internal,
        }
    }
}
