//! Error types for the admission service.

use thiserror::Error;

use crate::admission::EntityId;

/// Main error type for admission operations.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A message arrived while its principal's bucket was at capacity
    #[error("Message capacity of {capacity} exceeded for principal {}", .principal.as_deref().unwrap_or("<none>"))]
    CapacityExceeded {
        principal: Option<String>,
        capacity: u64,
    },

    /// The entity was deactivated after an earlier overflow
    #[error("Entity {0} is deactivated")]
    EntityDeactivated(EntityId),

    /// The entity is not registered
    #[error("Entity {0} is not registered")]
    UnknownEntity(EntityId),

    /// The entity is already registered
    #[error("Entity {0} is already registered")]
    DuplicateEntity(EntityId),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for AdmissionError {
    fn from(err: ::config::ConfigError) -> Self {
        AdmissionError::Config(err.to_string())
    }
}

/// Result type alias for admission operations.
pub type Result<T> = std::result::Result<T, AdmissionError>;
