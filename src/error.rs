//! Error types for wgveil
//!
//! This module defines the error hierarchy for the relay. Errors are
//! categorized by subsystem: configuration errors are fatal at start,
//! handler errors are per-packet and always recovered locally, and relay
//! errors cover socket setup and lifecycle.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for wgveil
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors (file parsing, validation, mode selection)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Packet handler errors (per-packet codec failures)
    #[error("Packet handler error: {0}")]
    Handler(#[from] HandlerError),

    /// Relay socket and lifecycle errors
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(e) => e.is_recoverable(),
            Self::Handler(e) => e.is_recoverable(),
            Self::Relay(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
            ),
        }
    }
}

/// Configuration-related errors
///
/// All of these are fatal at start; none is recoverable at runtime.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// MTU below the IPv6 minimum of 1280
    #[error("MTU {mtu} is too small (minimum 1280)")]
    MtuTooSmall { mtu: usize },

    /// Proxy mode string does not name a known packet handler
    #[error("Unknown proxy mode: {mode}")]
    UnknownProxyMode { mode: String },

    /// PSK is missing, malformed, or has the wrong length for the mode
    #[error("Invalid proxy PSK: {reason}")]
    InvalidPsk { reason: String },

    /// Endpoint string did not resolve to a socket address
    #[error("Failed to resolve endpoint {endpoint}: {reason}")]
    EndpointUnresolvable { endpoint: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    /// Create an invalid-PSK error
    pub fn invalid_psk(reason: impl Into<String>) -> Self {
        Self::InvalidPsk {
            reason: reason.into(),
        }
    }

    /// Create an endpoint-unresolvable error
    pub fn unresolvable(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EndpointUnresolvable {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }
}

/// Packet handler errors
///
/// Both variants are per-packet: the offending datagram is dropped and the
/// relay loop continues.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Datagram failed decryption or is structurally invalid
    #[error("Bad packet: {0}")]
    BadPacket(String),

    /// In-place encryption failed (insufficient reserved space, cipher error)
    #[error("Encrypt failed: {0}")]
    EncryptFailed(String),
}

impl HandlerError {
    /// Handler errors only affect a single packet; the relay keeps running
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }

    /// Create a bad-packet error
    pub fn bad_packet(msg: impl Into<String>) -> Self {
        Self::BadPacket(msg.into())
    }

    /// Create an encrypt-failed error
    pub fn encrypt_failed(msg: impl Into<String>) -> Self {
        Self::EncryptFailed(msg.into())
    }
}

/// Relay socket and lifecycle errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// Failed to create a socket
    #[error("Failed to create socket: {0}")]
    SocketCreation(String),

    /// Failed to set a socket option (`IP_PKTINFO`, `SO_MARK`, ...)
    #[error("Failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// Failed to bind to an address
    #[error("Failed to bind to {addr}: {reason}")]
    BindError { addr: SocketAddr, reason: String },

    /// Start called on a server that is already running
    #[error("Server is already running")]
    AlreadyRunning,

    /// Permission denied (`SO_MARK` requires `CAP_NET_ADMIN`)
    #[error("Permission denied: fwmark requires CAP_NET_ADMIN capability")]
    PermissionDenied,

    /// I/O error
    #[error("Relay I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl RelayError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SocketCreation(_)
            | Self::SocketOption { .. }
            | Self::BindError { .. }
            | Self::PermissionDenied => false,
            Self::AlreadyRunning => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::BindError {
            addr,
            reason: reason.into(),
        }
    }
}

/// Type alias for Result with wgveil's Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recovery_classification() {
        let config_err = ConfigError::MtuTooSmall { mtu: 1279 };
        assert!(!config_err.is_recoverable());

        let handler_err = HandlerError::bad_packet("authentication failed");
        assert!(handler_err.is_recoverable());

        let relay_err = RelayError::PermissionDenied;
        assert!(!relay_err.is_recoverable());

        let relay_err = RelayError::AlreadyRunning;
        assert!(relay_err.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = ConfigError::MtuTooSmall { mtu: 1279 };
        assert!(err.to_string().contains("1279"));
        assert!(err.to_string().contains("1280"));

        let err = ConfigError::UnknownProxyMode {
            mode: "turbo".into(),
        };
        assert!(err.to_string().contains("turbo"));

        let err = RelayError::bind("127.0.0.1:20220".parse().unwrap(), "address in use");
        assert!(err.to_string().contains("127.0.0.1:20220"));
        assert!(err.to_string().contains("address in use"));
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        let err: Error = io_err.into();
        assert!(err.is_recoverable());

        let config_err = ConfigError::validation("no servers configured");
        let err: Error = config_err.into();
        assert!(!err.is_recoverable());
    }
}
