//! XChaCha20-Poly1305 sealing.
//!
//! Sealed layout: `nonce (24 bytes) || ciphertext || tag (16 bytes)`. A fresh
//! random nonce is drawn for every seal, which the 192-bit XChaCha nonce makes
//! safe without a counter.

use {
    chacha20poly1305::{
        Key, XChaCha20Poly1305, XNonce,
        aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    },
    mnemo_common::{Error, Result},
};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

/// Encrypt `plaintext`, binding `aad` into the authentication tag.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload {
            msg: plaintext,
            aad,
        })
        .map_err(|_| Error::InvalidInput("plaintext too large to seal".into()))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt and authenticate. Any tampering, truncation, wrong key or wrong
/// `aad` is reported as [`Error::Integrity`] for `subject`.
pub fn open(key: &[u8; KEY_LEN], sealed: &[u8], aad: &[u8], subject: &str) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(Error::integrity(subject, "sealed payload is truncated"));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload {
            msg: ciphertext,
            aad,
        })
        .map_err(|_| Error::integrity(subject, "authentication tag mismatch"))
}

/// Fresh random key from the OS RNG.
pub fn generate_key() -> [u8; KEY_LEN] {
    let generated = XChaCha20Poly1305::generate_key(&mut OsRng);
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&generated);
    key
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn round_trip() {
        let key = generate_key();
        for plaintext in [&b""[..], b"a", b"Order flow uses Stripe webhooks"] {
            let sealed = seal(&key, plaintext, b"doc-1").unwrap();
            assert_eq!(sealed.len(), NONCE_LEN + plaintext.len() + TAG_LEN);
            assert_eq!(open(&key, &sealed, b"doc-1", "doc-1").unwrap(), plaintext);
        }
    }

    #[test]
    fn every_single_bit_flip_is_detected() {
        let key = generate_key();
        let sealed = seal(&key, b"context memory", b"k").unwrap();
        for byte in 0..sealed.len() {
            for bit in 0..8 {
                let mut corrupted = sealed.clone();
                corrupted[byte] ^= 1 << bit;
                let err = open(&key, &corrupted, b"k", "k").unwrap_err();
                assert!(err.is_integrity(), "byte {byte} bit {bit} not detected");
            }
        }
    }

    #[test]
    fn wrong_key_or_aad_fails() {
        let key = generate_key();
        let sealed = seal(&key, b"secret", b"a").unwrap();
        assert!(open(&generate_key(), &sealed, b"a", "a").unwrap_err().is_integrity());
        assert!(open(&key, &sealed, b"b", "a").unwrap_err().is_integrity());
    }

    #[test]
    fn truncated_payload_fails() {
        let key = generate_key();
        let sealed = seal(&key, b"secret", b"a").unwrap();
        assert!(open(&key, &sealed[..NONCE_LEN], b"a", "a").unwrap_err().is_integrity());
    }

    #[test]
    fn nonces_are_fresh() {
        let key = generate_key();
        let a = seal(&key, b"same", b"").unwrap();
        let b = seal(&key, b"same", b"").unwrap();
        assert_ne!(a, b);
    }
}
