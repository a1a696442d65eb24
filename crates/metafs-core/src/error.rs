use thiserror::Error;

/// Canonical error type for volume and checkpoint operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Entity was not found on the object-store back-end.
    #[error("{entity} `{id}` was not found")]
    NotFound {
        /// Entity type name (e.g. `"container"`).
        entity: &'static str,
        /// Identifier of the missing entity.
        id: String,
    },

    /// Entity already exists and cannot be created again.
    #[error("{entity} `{id}` already exists")]
    AlreadyExists {
        /// Entity type name (e.g. `"replay log"`).
        entity: &'static str,
        /// Identifier that conflicts.
        id: String,
    },

    /// A durable record could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// The checkpoint header carries a version this build does not speak.
    #[error("unsupported checkpoint version {found:#018x}")]
    UnsupportedVersion {
        /// Version word found in the header.
        found: u64,
    },

    /// Corruption detected by CRC or size validation.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Object-store back-end error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Operation violates current state machine rules.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Human-readable explanation of the invalid state.
        message: String,
    },

    /// The volume hit a fatal error and refuses further operations.
    #[error("volume halted after a fatal error")]
    Halted,

    /// Validation error for configuration or input data.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Unexpected internal error occurred.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable details for debugging purposes.
        message: String,
    },

    /// I/O error occurred during file or network operations.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error occurred.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error occurred.
    #[error("deserialization error: {0}")]
    DeserializationError(String),
}

impl Error {
    /// Creates a `NotFound` variant.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Creates an `AlreadyExists` variant.
    #[must_use]
    pub fn already_exists(entity: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity,
            id: id.into(),
        }
    }

    /// Creates an `InvalidState` variant.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates an `Internal` variant.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a `Corrupt` variant.
    #[must_use]
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt(message.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_eof() || err.is_syntax() {
            Self::DeserializationError(err.to_string())
        } else {
            Self::SerializationError(err.to_string())
        }
    }
}

/// Convenient result alias for volume operations.
pub type Result<T> = std::result::Result<T, Error>;
