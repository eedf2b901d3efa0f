//! AEAD packet handler
//!
//! Selected by the `paranoid` proxy mode. Every datagram is sealed with
//! XChaCha20-Poly1305 under the preshared key: a random 24-byte nonce is
//! written ahead of the ciphertext and the 16-byte authentication tag after
//! it, so the whole proxy-side datagram is indistinguishable from random
//! bytes. The extended nonce makes random generation per packet safe
//! without any counter state.

use chacha20poly1305::aead::{AeadCore, AeadInPlace, KeyInit, OsRng};
use chacha20poly1305::{Tag, XChaCha20Poly1305, XNonce};

use crate::error::{ConfigError, HandlerError};

use super::PacketHandler;

/// Required preshared key length in bytes
pub const PSK_LENGTH: usize = 32;

/// Nonce bytes written ahead of the ciphertext
const NONCE_LENGTH: usize = 24;

/// Authentication tag bytes written after the ciphertext
const TAG_LENGTH: usize = 16;

/// XChaCha20-Poly1305 codec keyed by the obfuscation PSK.
pub struct ParanoidHandler {
    cipher: XChaCha20Poly1305,
}

impl ParanoidHandler {
    /// Create a handler from a 32-byte preshared key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPsk`] if the key is not exactly
    /// 32 bytes.
    pub fn new(psk: &[u8]) -> Result<Self, ConfigError> {
        if psk.len() != PSK_LENGTH {
            return Err(ConfigError::invalid_psk(format!(
                "paranoid mode requires a {PSK_LENGTH}-byte PSK, got {} bytes",
                psk.len()
            )));
        }

        let cipher = XChaCha20Poly1305::new_from_slice(psk)
            .map_err(|e| ConfigError::invalid_psk(e.to_string()))?;

        Ok(Self { cipher })
    }
}

impl std::fmt::Debug for ParanoidHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParanoidHandler").finish_non_exhaustive()
    }
}

impl PacketHandler for ParanoidHandler {
    fn front_overhead(&self) -> usize {
        NONCE_LENGTH
    }

    fn rear_overhead(&self) -> usize {
        TAG_LENGTH
    }

    fn decrypt(
        &self,
        buf: &mut [u8],
        start: usize,
        len: usize,
    ) -> Result<(usize, usize), HandlerError> {
        if len < NONCE_LENGTH + TAG_LENGTH || start + len > buf.len() {
            return Err(HandlerError::bad_packet(format!(
                "datagram of {len} bytes cannot carry nonce and tag"
            )));
        }

        let plain_len = len - NONCE_LENGTH - TAG_LENGTH;
        let plain_start = start + NONCE_LENGTH;

        let nonce = XNonce::clone_from_slice(&buf[start..plain_start]);
        let tag = Tag::clone_from_slice(&buf[plain_start + plain_len..start + len]);

        self.cipher
            .decrypt_in_place_detached(
                &nonce,
                &[],
                &mut buf[plain_start..plain_start + plain_len],
                &tag,
            )
            .map_err(|_| HandlerError::bad_packet("authentication failed"))?;

        Ok((plain_start, plain_len))
    }

    fn encrypt(
        &self,
        buf: &mut [u8],
        start: usize,
        len: usize,
    ) -> Result<(usize, usize), HandlerError> {
        let Some(out_start) = start.checked_sub(NONCE_LENGTH) else {
            return Err(HandlerError::encrypt_failed(
                "buffer is missing nonce headroom",
            ));
        };
        if start + len + TAG_LENGTH > buf.len() {
            return Err(HandlerError::encrypt_failed("buffer is missing tag room"));
        }

        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

        let tag = self
            .cipher
            .encrypt_in_place_detached(&nonce, &[], &mut buf[start..start + len])
            .map_err(|e| HandlerError::encrypt_failed(e.to_string()))?;

        buf[out_start..start].copy_from_slice(&nonce);
        buf[start + len..start + len + TAG_LENGTH].copy_from_slice(&tag);

        Ok((out_start, len + NONCE_LENGTH + TAG_LENGTH))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> ParanoidHandler {
        ParanoidHandler::new(&[0x5a; PSK_LENGTH]).unwrap()
    }

    #[test]
    fn test_psk_length_validation() {
        assert!(ParanoidHandler::new(&[0; 32]).is_ok());
        assert!(ParanoidHandler::new(&[0; 31]).is_err());
        assert!(ParanoidHandler::new(&[0; 33]).is_err());
        assert!(ParanoidHandler::new(&[]).is_err());
    }

    #[test]
    fn test_round_trip_in_place() {
        let h = handler();
        let plaintext = b"\x01\x00\x00\x00handshake initiation body";

        let mut buf = vec![0u8; NONCE_LENGTH + plaintext.len() + TAG_LENGTH];
        buf[NONCE_LENGTH..NONCE_LENGTH + plaintext.len()].copy_from_slice(plaintext);

        let (start, len) = h.encrypt(&mut buf, NONCE_LENGTH, plaintext.len()).unwrap();
        assert_eq!(start, 0);
        assert_eq!(len, buf.len());
        assert_ne!(&buf[NONCE_LENGTH..NONCE_LENGTH + plaintext.len()], plaintext);

        let (start, len) = h.decrypt(&mut buf, 0, len).unwrap();
        assert_eq!(&buf[start..start + len], plaintext);
    }

    #[test]
    fn test_nonces_are_unique() {
        let h = handler();
        let mut a = vec![0u8; NONCE_LENGTH + 8 + TAG_LENGTH];
        let mut b = vec![0u8; NONCE_LENGTH + 8 + TAG_LENGTH];

        h.encrypt(&mut a, NONCE_LENGTH, 8).unwrap();
        h.encrypt(&mut b, NONCE_LENGTH, 8).unwrap();
        assert_ne!(a[..NONCE_LENGTH], b[..NONCE_LENGTH]);
    }

    #[test]
    fn test_tampered_packet_rejected() {
        let h = handler();
        let plaintext = b"\x04\x00\x00\x00data";
        let mut buf = vec![0u8; NONCE_LENGTH + plaintext.len() + TAG_LENGTH];
        buf[NONCE_LENGTH..NONCE_LENGTH + plaintext.len()].copy_from_slice(plaintext);

        let (_, len) = h.encrypt(&mut buf, NONCE_LENGTH, plaintext.len()).unwrap();
        buf[NONCE_LENGTH] ^= 0x80;

        assert!(matches!(
            h.decrypt(&mut buf, 0, len),
            Err(HandlerError::BadPacket(_))
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sender = handler();
        let receiver = ParanoidHandler::new(&[0xa5; PSK_LENGTH]).unwrap();

        let mut buf = vec![0u8; NONCE_LENGTH + 16 + TAG_LENGTH];
        let (_, len) = sender.encrypt(&mut buf, NONCE_LENGTH, 16).unwrap();

        assert!(receiver.decrypt(&mut buf, 0, len).is_err());
    }

    #[test]
    fn test_short_datagram_rejected() {
        let h = handler();
        let mut buf = [0u8; 64];
        assert!(h.decrypt(&mut buf, 0, NONCE_LENGTH + TAG_LENGTH - 1).is_err());
    }

    #[test]
    fn test_encrypt_requires_reserved_space() {
        let h = handler();
        let mut buf = [0u8; 64];

        // No nonce headroom before the plaintext.
        assert!(h.encrypt(&mut buf, 0, 8).is_err());
        // No tag room after the plaintext.
        assert!(h.encrypt(&mut buf, NONCE_LENGTH, 64 - NONCE_LENGTH).is_err());
    }

    #[test]
    fn test_empty_plaintext_round_trip() {
        let h = handler();
        let mut buf = vec![0u8; NONCE_LENGTH + TAG_LENGTH];
        let (start, len) = h.encrypt(&mut buf, NONCE_LENGTH, 0).unwrap();
        assert_eq!(len, NONCE_LENGTH + TAG_LENGTH);
        let (_, plain_len) = h.decrypt(&mut buf, start, len).unwrap();
        assert_eq!(plain_len, 0);
    }
}
