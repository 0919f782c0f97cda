use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Policy error: {0}")]
    Policy(String),

    #[error("Policy validation failed at {field}: {reason}")]
    PolicyValidation { field: String, reason: String },

    #[error("Security engine error: {0}")]
    Security(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WardenError {
    /// Short error code, mirrored into admin-command / diagnostic surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            WardenError::Config(_) => "CONFIG_ERROR",
            WardenError::Policy(_) => "POLICY_ERROR",
            WardenError::PolicyValidation { .. } => "POLICY_VALIDATION_ERROR",
            WardenError::Security(_) => "SECURITY_ERROR",
            WardenError::Database(_) => "DATABASE_ERROR",
            WardenError::Serialization(_) => "SERIALIZATION_ERROR",
            WardenError::Io(_) => "IO_ERROR",
            WardenError::UnknownCommand(_) => "UNKNOWN_COMMAND",
            WardenError::InvalidCommand(_) => "INVALID_COMMAND",
            WardenError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;
