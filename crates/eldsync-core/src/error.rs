//! Unified error types for the eldsync core library.
//!
//! This module provides a unified error type [`SyncError`] that covers all failure
//! modes of the synchronization pipeline. Modules that talk to the outside world
//! also have their own specific error types ([`LinkError`](crate::link::LinkError),
//! [`ConfigError`](crate::config::ConfigError)) which convert into it.
//!
//! # Taxonomy
//!
//! - **Connection**: link-level failures (connect/authenticate failure,
//!   unexpected disconnect, timeouts, radio unavailable)
//! - **Query**: a history chunk failed after exhausting its retries
//! - **Cancelled**: an operation stopped cooperatively; never a failure
//! - **Invalid request**: malformed fetch ranges, illegal state transitions
//!
//! # Example
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use eldsync_core::error::{Result, SyncError};
//!
//! fn check_range(start: chrono::DateTime<Utc>, end: chrono::DateTime<Utc>) -> Result<()> {
//!     if start >= end {
//!         return Err(SyncError::InvalidRange { start, end });
//!     }
//!     Ok(())
//! }
//!
//! let now = Utc::now();
//! assert!(check_range(now, now - Duration::minutes(5)).is_err());
//! ```

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// The unified error type for all eldsync operations.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    // =========================================================================
    // CONNECTION ERRORS
    // =========================================================================
    /// The device refused or dropped the connection attempt.
    #[error("Connection to ELD failed with status {status}. Power-cycle the device and retry.")]
    ConnectFailed {
        /// Driver-specific status code.
        status: i32,
    },

    /// The device rejected the authentication handshake.
    #[error("ELD authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A connection step did not finish within its time budget.
    #[error("{phase} timed out after {secs} seconds")]
    Timeout {
        /// Which step timed out (e.g. "connect", "authentication").
        phase: &'static str,
        /// The configured budget in seconds.
        secs: u64,
    },

    /// The link dropped while an operation depended on it.
    #[error("ELD disconnected unexpectedly")]
    UnexpectedDisconnect,

    /// Bluetooth is switched off on this host.
    #[error("Bluetooth is disabled. Enable Bluetooth and retry.")]
    BluetoothDisabled,

    /// This host has no BLE support.
    #[error("Bluetooth Low Energy is not supported on this device")]
    BleUnsupported,

    /// No device with the given address is known to the link.
    #[error("Device not found: '{0}'. Ensure the ELD is powered on and within range.")]
    DeviceNotFound(String),

    /// Any other driver-level failure.
    #[error("Device link error: {0}")]
    Link(String),

    // =========================================================================
    // QUERY ERRORS
    // =========================================================================
    /// A history chunk could not be retrieved after exhausting its retries.
    #[error("History query for chunk {chunk} failed: {reason}")]
    QueryFailed {
        /// Zero-based chunk index within its fetch.
        chunk: usize,
        /// Last failure observed for the chunk.
        reason: String,
    },

    // =========================================================================
    // CANCELLATION
    // =========================================================================
    /// The operation was stopped cooperatively.
    #[error("Operation cancelled")]
    Cancelled,

    // =========================================================================
    // INVALID REQUESTS
    // =========================================================================
    /// A history fetch was requested with `start >= end`.
    #[error("Invalid fetch range: start {start} is not before end {end}")]
    InvalidRange {
        /// Requested start (inclusive).
        start: DateTime<Utc>,
        /// Requested end (exclusive).
        end: DateTime<Utc>,
    },

    /// A history fetch was requested with a zero chunk size.
    #[error("Chunk size must be at least one minute")]
    InvalidChunkSize,

    /// The connection state machine refused an event in its current state.
    #[error("Cannot apply '{event}' while {state}")]
    InvalidTransition {
        /// Current state name.
        state: String,
        /// Rejected event name.
        event: String,
    },

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),
}

/// A specialized [`Result`] type for eldsync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Returns `true` if this error is a link-level connection failure.
    #[inline]
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed { .. }
                | Self::AuthenticationFailed(_)
                | Self::Timeout { .. }
                | Self::UnexpectedDisconnect
                | Self::BluetoothDisabled
                | Self::BleUnsupported
                | Self::DeviceNotFound(_)
                | Self::Link(_)
        )
    }

    /// Returns `true` if this error describes a failed history query.
    #[inline]
    #[must_use]
    pub const fn is_query_error(&self) -> bool {
        matches!(self, Self::QueryFailed { .. })
    }

    /// Returns `true` for cooperative cancellation.
    #[inline]
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if retrying the same operation later may succeed
    /// without user intervention.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed { .. }
                | Self::Timeout { .. }
                | Self::UnexpectedDisconnect
                | Self::DeviceNotFound(_)
                | Self::QueryFailed { .. }
        )
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::InvalidRange { .. } | Self::InvalidChunkSize => 400,
            Self::DeviceNotFound(_) | Self::ConfigNotFound(_) => 404,
            Self::InvalidTransition { .. } => 409,
            Self::ConfigParseError(_) | Self::ConfigValidationError(_) => 422,
            Self::Cancelled => 499,
            Self::ConnectFailed { .. }
            | Self::AuthenticationFailed(_)
            | Self::UnexpectedDisconnect
            | Self::QueryFailed { .. }
            | Self::Link(_) => 502,
            Self::BluetoothDisabled | Self::BleUnsupported => 503,
            Self::Timeout { .. } => 504,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectFailed { .. } => "CONNECT_FAILED",
            Self::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::UnexpectedDisconnect => "UNEXPECTED_DISCONNECT",
            Self::BluetoothDisabled => "BLUETOOTH_DISABLED",
            Self::BleUnsupported => "BLE_UNSUPPORTED",
            Self::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Self::Link(_) => "LINK_ERROR",
            Self::QueryFailed { .. } => "QUERY_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::InvalidRange { .. } => "INVALID_RANGE",
            Self::InvalidChunkSize => "INVALID_CHUNK_SIZE",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for SyncError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::Load(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::Serialize(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::Write { path, source } => Self::ConfigParseError(format!(
                "Failed to write {}: {}",
                path.display(),
                source
            )),
            ConfigError::Validation { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::link::LinkError> for SyncError {
    fn from(err: crate::link::LinkError) -> Self {
        use crate::link::LinkError;
        match err {
            LinkError::BluetoothDisabled => Self::BluetoothDisabled,
            LinkError::BleUnsupported => Self::BleUnsupported,
            LinkError::DeviceNotFound { address } => Self::DeviceNotFound(address),
            LinkError::NotConnected => Self::UnexpectedDisconnect,
            LinkError::CommandRejected { message }
            | LinkError::Transport { message }
            | LinkError::Internal { message } => Self::Link(message),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
