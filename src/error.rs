//! Error types for the circuit engine
//!
//! Every failure the engine can surface is a [`TorError`]. Callers that need
//! to decide between "swap one relay and retry" and "give up" should look at
//! [`TorError::kind`] rather than matching individual variants.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Coarse failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Connect, send or receive failed, or the peer closed the link.
    Transport,
    /// Malformed cell, unexpected command, unrecognized relay cell.
    Protocol,
    /// Not enough relay candidates, or a queue was closed by its owner.
    ResourceExhausted,
    /// Key import failure, AUTH or MAC mismatch.
    Cryptographic,
    /// The caller asked for something the current state does not allow.
    Usage,
}

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Transport errors (1xx)
    ConnectionFailed = 100,
    ConnectionTimeout = 101,
    ConnectionClosed = 102,
    NetworkIo = 103,

    // Protocol errors (2xx)
    ProtocolViolation = 200,
    UnexpectedCell = 201,
    RelayCellNotRecognized = 202,
    HandshakeFailed = 203,
    CertificateError = 204,

    // Circuit errors (3xx)
    CircuitDestroyed = 301,
    CircuitClosed = 302,

    // Cryptographic errors (5xx)
    CryptoError = 500,
    KeyDerivationFailed = 501,
    AuthVerificationFailed = 502,

    // Resource errors (6xx)
    NoRelaysAvailable = 600,
    ResourceExhausted = 601,

    // Configuration / usage errors (8xx)
    ConfigError = 800,
    InvalidRelay = 801,
    InvalidState = 802,

    // Internal errors (9xx)
    InternalError = 900,
}

/// Main error type
#[derive(Error, Debug, Clone)]
pub enum TorError {
    // ===== Transport =====
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Network error: {0}")]
    Network(String),

    // ===== Protocol =====
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Unexpected cell: expected {expected}, got {got}")]
    UnexpectedCell { expected: String, got: String },

    #[error("Relay cell not recognized by any hop")]
    DigestMismatch,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Certificate verification failed: {0}")]
    CertificateError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ===== Circuit =====
    #[error("Circuit destroyed: reason={reason} ({reason_name})")]
    CircuitDestroyed { reason: u8, reason_name: String },

    #[error("Circuit closed: {0}")]
    CircuitClosed(String),

    // ===== Cryptographic =====
    #[error("Auth verification failed: {0}")]
    AuthVerificationFailed(String),

    #[error("Crypto: {0}")]
    Crypto(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    // ===== Resources =====
    #[error("No relays available: {0}")]
    NoRelaysAvailable(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    // ===== Usage =====
    #[error("Invalid relay: {0}")]
    InvalidRelay(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TorError {
    /// Failure class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TorError::ConnectionFailed(_)
            | TorError::Timeout(_)
            | TorError::ConnectionClosed(_)
            | TorError::Network(_) => ErrorKind::Transport,

            TorError::ProtocolError(_)
            | TorError::UnexpectedCell { .. }
            | TorError::DigestMismatch
            | TorError::HandshakeFailed(_)
            | TorError::CertificateError(_)
            | TorError::ParseError(_)
            | TorError::CircuitDestroyed { .. }
            | TorError::CircuitClosed(_) => ErrorKind::Protocol,

            TorError::AuthVerificationFailed(_)
            | TorError::Crypto(_)
            | TorError::KeyDerivationFailed(_) => ErrorKind::Cryptographic,

            TorError::NoRelaysAvailable(_) | TorError::ResourceExhausted(_) => {
                ErrorKind::ResourceExhausted
            }

            TorError::InvalidRelay(_)
            | TorError::Config(_)
            | TorError::InvalidState(_)
            | TorError::Internal(_) => ErrorKind::Usage,
        }
    }

    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            TorError::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            TorError::Timeout(_) => ErrorCode::ConnectionTimeout,
            TorError::ConnectionClosed(_) => ErrorCode::ConnectionClosed,
            TorError::Network(_) => ErrorCode::NetworkIo,

            TorError::ProtocolError(_) | TorError::ParseError(_) => ErrorCode::ProtocolViolation,
            TorError::UnexpectedCell { .. } => ErrorCode::UnexpectedCell,
            TorError::DigestMismatch => ErrorCode::RelayCellNotRecognized,
            TorError::HandshakeFailed(_) => ErrorCode::HandshakeFailed,
            TorError::CertificateError(_) => ErrorCode::CertificateError,

            TorError::CircuitDestroyed { .. } => ErrorCode::CircuitDestroyed,
            TorError::CircuitClosed(_) => ErrorCode::CircuitClosed,

            TorError::AuthVerificationFailed(_) => ErrorCode::AuthVerificationFailed,
            TorError::Crypto(_) => ErrorCode::CryptoError,
            TorError::KeyDerivationFailed(_) => ErrorCode::KeyDerivationFailed,

            TorError::NoRelaysAvailable(_) => ErrorCode::NoRelaysAvailable,
            TorError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,

            TorError::InvalidRelay(_) => ErrorCode::InvalidRelay,
            TorError::Config(_) => ErrorCode::ConfigError,
            TorError::InvalidState(_) => ErrorCode::InvalidState,
            TorError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Whether the circuit that produced this error must be torn down.
    ///
    /// Protocol and cryptographic failures leave digest or key state in an
    /// unknown condition; such a circuit is destroyed, never repaired.
    pub fn is_fatal_to_circuit(&self) -> bool {
        matches!(self.kind(), ErrorKind::Protocol | ErrorKind::Cryptographic)
    }

    /// Whether the caller may retry the same operation with a different relay
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::Transport => true,
            // A relay that refused or botched one handshake is worth swapping
            // out, the path as a whole is not poisoned.
            ErrorKind::Protocol | ErrorKind::Cryptographic => matches!(
                self,
                TorError::HandshakeFailed(_)
                    | TorError::CertificateError(_)
                    | TorError::AuthVerificationFailed(_)
                    | TorError::CircuitDestroyed { .. }
            ),
            ErrorKind::ResourceExhausted | ErrorKind::Usage => false,
        }
    }

    /// Create a CircuitDestroyed error with the reason name
    pub fn circuit_destroyed(reason: u8) -> Self {
        TorError::CircuitDestroyed {
            reason,
            reason_name: destroy_reason_name(reason).to_string(),
        }
    }
}

/// Name of a DESTROY / TRUNCATED reason code
pub fn destroy_reason_name(reason: u8) -> &'static str {
    match reason {
        0 => "NONE",
        1 => "PROTOCOL",
        2 => "INTERNAL",
        3 => "REQUESTED",
        4 => "HIBERNATING",
        5 => "RESOURCELIMIT",
        6 => "CONNECTFAILED",
        7 => "OR_IDENTITY",
        8 => "CHANNEL_CLOSED",
        9 => "FINISHED",
        10 => "TIMEOUT",
        11 => "DESTROYED",
        12 => "NOSUCHSERVICE",
        _ => "UNKNOWN",
    }
}

impl From<std::io::Error> for TorError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => TorError::ConnectionClosed(err.to_string()),
            std::io::ErrorKind::TimedOut => TorError::Timeout(err.to_string()),
            _ => TorError::Network(err.to_string()),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for TorError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        TorError::Internal(format!("lock poisoned: {}", err))
    }
}
