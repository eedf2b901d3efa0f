//! Packet handlers: the obfuscation codec seam
//!
//! A [`PacketHandler`] transforms one datagram in place inside the caller's
//! buffer. Decrypt turns an obfuscated proxy datagram into a native
//! WireGuard packet; encrypt does the reverse. Handlers are stateless and
//! shared across all sessions of a server.
//!
//! The buffer contract: `decrypt` returns a `(start, length)` window lying
//! entirely inside the input window; `encrypt` requires `front_overhead()`
//! bytes of headroom before the plaintext and `rear_overhead()` bytes after
//! it, and writes its codec bytes there.

use std::sync::Arc;

mod paranoid;
mod passthrough;

pub use paranoid::{ParanoidHandler, PSK_LENGTH};
pub use passthrough::PassthroughHandler;

use crate::error::{ConfigError, HandlerError};

/// Stateless, thread-safe datagram codec.
pub trait PacketHandler: Send + Sync {
    /// Bytes reserved ahead of the plaintext for codec output.
    fn front_overhead(&self) -> usize;

    /// Bytes reserved after the plaintext for codec output.
    fn rear_overhead(&self) -> usize;

    /// Unwrap one obfuscated datagram in place.
    ///
    /// Returns the `(start, length)` of the recovered WireGuard packet
    /// inside `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::BadPacket`] if the datagram is malformed or
    /// fails authentication.
    fn decrypt(
        &self,
        buf: &mut [u8],
        start: usize,
        len: usize,
    ) -> Result<(usize, usize), HandlerError>;

    /// Wrap one WireGuard packet in place.
    ///
    /// The caller guarantees `front_overhead()` bytes before `start` and
    /// `rear_overhead()` bytes after `start + len`. Returns the
    /// `(start, length)` of the obfuscated datagram inside `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::EncryptFailed`] if the reserved space is
    /// missing or the cipher fails.
    fn encrypt(
        &self,
        buf: &mut [u8],
        start: usize,
        len: usize,
    ) -> Result<(usize, usize), HandlerError>;
}

/// Build the packet handler for a configured proxy mode.
///
/// `zero-overhead` selects the passthrough handler; `paranoid` selects the
/// AEAD handler and requires a 32-byte PSK.
///
/// # Errors
///
/// Returns [`ConfigError::UnknownProxyMode`] for an unrecognized mode and
/// [`ConfigError::InvalidPsk`] when the mode needs a key the PSK cannot
/// provide.
pub fn handler_for_mode(mode: &str, psk: &[u8]) -> Result<Arc<dyn PacketHandler>, ConfigError> {
    match mode {
        "zero-overhead" => Ok(Arc::new(PassthroughHandler::new())),
        "paranoid" => Ok(Arc::new(ParanoidHandler::new(psk)?)),
        _ => Err(ConfigError::UnknownProxyMode { mode: mode.into() }),
    }
}
