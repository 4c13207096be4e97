//! Unified error handling for the collector-lease crate
//!
//! Domain errors stay where they are raised ([`LeaseError`], [`StoreError`],
//! [`ConfigError`], [`ModelError`]); this module folds them into one
//! [`Error`] for the command layer.
//!
//! # Architecture
//!
//! - [`LeaseErrorTrait`] - Common interface implemented by the unified error
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping the domain errors

use std::io;
use thiserror::Error;

pub use crate::api::ServerError;
pub use crate::claim::LeaseError;
pub use crate::config::ConfigError;
pub use crate::models::ModelError;
pub use crate::storage::StoreError;

/// Common interface for error handling across modules
pub trait LeaseErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The caller lost a unit it was working on
    Ownership,
    /// Store unreachable or rejecting requests
    Storage,
    /// Configuration and validation errors
    Config,
    /// Malformed input from the admin layer
    Input,
    /// HTTP server errors
    Server,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn description(&self) -> &'static str {
        match self {
            Self::Ownership => "ownership error",
            Self::Storage => "storage error",
            Self::Config => "configuration error",
            Self::Input => "input error",
            Self::Server => "server error",
            Self::Other => "other error",
        }
    }
}

/// Unified error type for the collector-lease crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Lease error: {0}")]
    Lease(#[from] LeaseError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid input: {0}")]
    Model(#[from] ModelError),

    #[error("API server error: {0}")]
    Server(#[from] ServerError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Entity not registered
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl LeaseErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Lease(e) => e.is_store_unavailable(),
            Self::Store(e) => e.is_unavailable(),
            Self::Io(_) => true,
            Self::Config(_)
            | Self::Model(_)
            | Self::Server(_)
            | Self::Json(_)
            | Self::EntityNotFound(_)
            | Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Lease(LeaseError::OwnershipLost { .. }) => ErrorCategory::Ownership,
            Self::Lease(LeaseError::UnitNotFound(_)) | Self::EntityNotFound(_) => {
                ErrorCategory::Input
            }
            Self::Lease(_) | Self::Store(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Config(_) => ErrorCategory::Config,
            Self::Model(_) | Self::Json(_) => ErrorCategory::Input,
            Self::Server(_) => ErrorCategory::Server,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: Some(err.into()),
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
