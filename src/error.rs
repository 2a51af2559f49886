//! Custom error types for slidegen.
//!
//! This module provides structured error types that enable better
//! error handling, reporting, and recovery throughout the orchestrator.

use std::path::PathBuf;
use thiserror::Error;

use crate::engine::EngineError;

/// Main error type for slidegen operations
#[derive(Error, Debug)]
pub enum SlidegenError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Input Errors
    // =========================================================================
    /// Required input was empty or malformed before any call was made
    #[error("Invalid input: {field} - {reason}")]
    InvalidInput { field: String, reason: String },

    /// Work item id not present in the batch
    #[error("Unknown work item: {id}")]
    UnknownItem { id: u32 },

    // =========================================================================
    // State Machine Errors
    // =========================================================================
    /// Batch status transition not allowed
    #[error("Illegal batch transition: {from} -> {to}")]
    BatchTransition { from: String, to: String },

    /// Work item status transition not allowed
    #[error("Illegal transition for item {id}: {from} -> {to}")]
    ItemTransition { id: u32, from: String, to: String },

    // =========================================================================
    // Generation Errors
    // =========================================================================
    /// Remote engine failure after retry/fallback handling
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// No engine can serve the request
    #[error("No engine available: {reason}")]
    NoEngine { reason: String },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// Key-value store failure
    #[error("Storage error for key '{key}': {message}")]
    Storage { key: String, message: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SlidegenError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an input validation error
    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a storage error
    pub fn storage(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            key: key.into(),
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error should halt a whole batch.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Engine(err) => err.class().is_fatal(),
            _ => false,
        }
    }

    /// Check if this error requires human intervention (credentials, billing).
    pub fn requires_human(&self) -> bool {
        self.is_fatal() || matches!(self, Self::Config { .. } | Self::InvalidConfig { .. })
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Engine(err) if err.class().is_fatal() => 3,
            Self::InvalidInput { .. } | Self::UnknownItem { .. } => 4,
            Self::BatchTransition { .. } | Self::ItemTransition { .. } => 5,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for slidegen results
pub type Result<T> = std::result::Result<T, SlidegenError>;
