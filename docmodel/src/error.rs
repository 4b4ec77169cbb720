use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocModelError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Listener '{name}' is already registered")]
    DuplicateListener { name: String },

    #[error("Path mismatch: expected a path in collection '{expected}', got '{path}'")]
    PathMismatch { expected: String, path: String },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Document already exists: {path}")]
    AlreadyExists { path: String },

    #[error("Transaction contention on {path}")]
    Contention { path: String },

    #[error("Batch of {size} writes exceeds the limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl DocModelError {
    /// True for failures raised by the underlying document store rather than
    /// by schema, listener or path checks.
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            DocModelError::Store(_)
                | DocModelError::AlreadyExists { .. }
                | DocModelError::Contention { .. }
                | DocModelError::BatchTooLarge { .. }
                | DocModelError::Io(_)
                | DocModelError::Json(_)
                | DocModelError::Sqlite(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DocModelError>;
