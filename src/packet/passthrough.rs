//! Identity packet handler
//!
//! Selected by the `zero-overhead` proxy mode: datagrams travel unchanged,
//! no bytes are reserved, and both directions accept the input as-is.

use crate::error::HandlerError;

use super::PacketHandler;

/// Identity codec with zero overhead in both directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughHandler;

impl PassthroughHandler {
    /// Create a passthrough handler.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl PacketHandler for PassthroughHandler {
    fn front_overhead(&self) -> usize {
        0
    }

    fn rear_overhead(&self) -> usize {
        0
    }

    fn decrypt(
        &self,
        _buf: &mut [u8],
        start: usize,
        len: usize,
    ) -> Result<(usize, usize), HandlerError> {
        Ok((start, len))
    }

    fn encrypt(
        &self,
        _buf: &mut [u8],
        start: usize,
        len: usize,
    ) -> Result<(usize, usize), HandlerError> {
        Ok((start, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let handler = PassthroughHandler::new();
        assert_eq!(handler.front_overhead(), 0);
        assert_eq!(handler.rear_overhead(), 0);

        let mut buf = *b"\x04\x00\x00\x00WireGuard data";
        let original = buf;

        let (start, len) = handler.decrypt(&mut buf, 0, original.len()).unwrap();
        assert_eq!((start, len), (0, original.len()));
        assert_eq!(buf, original);

        let (start, len) = handler.encrypt(&mut buf, 0, original.len()).unwrap();
        assert_eq!((start, len), (0, original.len()));
        assert_eq!(buf, original);
    }
}
