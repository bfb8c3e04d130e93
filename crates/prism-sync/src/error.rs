//! # Sync Error Types
//!
//! Error types for the synchronization engine.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  Decode (DecodeError)   │ │
//! │  │  InvalidUrl     │  │  SendFailed     │  │  UnexpectedMessageType  │ │
//! │  │  ConfigLoad/Save│  │  Timeout, TLS   │  │  SerializationFailed    │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │ Authentication  │  │  Command issue  │  │  Per-command outcome    │ │
//! │  │                 │  │                 │  │  (CommandError)         │ │
//! │  │  Authentication │  │  NotConnected   │  │  Rejected, TimedOut     │ │
//! │  │  Failed (final) │  │  UnknownEntity  │  │  ConnectionLost,        │ │
//! │  │                 │  │  Core           │  │  Cancelled, Superseded  │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use prism_core::CoreError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Engine-level failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// No access token was supplied by file or environment.
    #[error("Hub access token not configured. Set PRISM_HUB_TOKEN.")]
    MissingToken,

    #[error("Invalid hub URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// The hub could not be reached.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Writing a frame to the connection failed.
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessageType { expected: String, actual: String },

    // =========================================================================
    // Authentication Errors
    // =========================================================================
    /// The hub rejected the credential. Never retried.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    // =========================================================================
    // Command Issue Errors
    // =========================================================================
    /// Commands are only accepted while the mirror is synced.
    #[error("Not connected to hub")]
    NotConnected,

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Sync engine is already running")]
    AlreadyStarted,

    #[error("Gave up after {0} consecutive connection attempts")]
    RetriesExhausted(u32),

    #[error("Sync engine is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Decode Error
// =============================================================================

/// An inbound frame that could not be understood. The frame is dropped and
/// the session continues.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid {field}: {reason}")]
    InvalidField { field: String, reason: String },
}

impl DecodeError {
    pub(crate) fn invalid(field: &str, reason: impl ToString) -> Self {
        DecodeError::InvalidField {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}

// =============================================================================
// Command Error
// =============================================================================

/// Why a command did not complete successfully.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The hub answered with an error.
    #[error("Hub rejected command ({code}): {message}")]
    Rejected { code: String, message: String },

    /// No result arrived before the deadline.
    #[error("Command timed out after {after_ms} ms")]
    TimedOut { after_ms: u64 },

    /// The connection dropped while the command was in flight.
    #[error("Connection lost before the hub answered")]
    ConnectionLost,

    /// The engine was stopped while the command was in flight.
    #[error("Command cancelled")]
    Cancelled,

    /// A newer command for the same entity and attribute replaced this one.
    #[error("Command superseded by a newer one")]
    Superseded,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                SyncError::SendFailed("connection closed".into())
            }
            WsError::Protocol(p) => SyncError::WebSocketError(p.to_string()),
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            WsError::Tls(tls) => SyncError::TlsError(tls.to_string()),
            WsError::Url(url) => SyncError::InvalidUrl(url.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<prism_core::ValidationError> for SyncError {
    fn from(err: prism_core::ValidationError) -> Self {
        SyncError::Core(CoreError::Validation(err))
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if reconnecting may fix this. Authentication failures
    /// never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_)
                | SyncError::SendFailed(_)
                | SyncError::Timeout(_)
                | SyncError::WebSocketError(_)
                | SyncError::UnexpectedMessageType { .. }
        )
    }

    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingToken
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::Decode(_)
                | SyncError::SerializationFailed(_)
                | SyncError::UnexpectedMessageType { .. }
        )
    }
}
