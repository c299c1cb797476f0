//! # UDP Payload Encryption
//!
//! AES-256-GCM with a random 96-bit nonce per datagram. The wire layout is
//! `nonce (12 bytes) | ciphertext+tag`. HANDSHAKE/PING/PONG payloads stay
//! in the clear; only DATA payloads pass through here.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;

/// Length of a per-session UDP secret.
pub const SECRET_LEN: usize = 32;

/// Length of the nonce prepended to each sealed datagram.
pub const NONCE_LEN: usize = 12;

/// Errors surfaced by the AEAD layer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("ciphertext too short")]
    Truncated,
    #[error("aead failure")]
    Aead,
}

/// Generates a fresh 32-byte session secret.
pub fn generate_secret() -> [u8; SECRET_LEN] {
    let mut secret = [0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

/// Encrypts `plaintext`, returning `nonce | ciphertext+tag`.
pub fn seal(secret: &[u8; SECRET_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(secret).map_err(|_| CryptoError::Aead)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher.encrypt(&nonce, plaintext).map_err(|_| CryptoError::Aead)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts a `nonce | ciphertext+tag` buffer produced by [`seal`].
pub fn open(secret: &[u8; SECRET_LEN], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::Truncated);
    }
    let cipher = Aes256Gcm::new_from_slice(secret).map_err(|_| CryptoError::Aead)?;
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Aead)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_returns_plaintext() {
        let secret = generate_secret();
        let sealed = seal(&secret, b"\xde\xad\xbe\xef").unwrap();
        assert_eq!(open(&secret, &sealed).unwrap(), b"\xde\xad\xbe\xef");
    }

    #[test]
    fn any_flipped_byte_fails_decryption() {
        let secret = generate_secret();
        let sealed = seal(&secret, b"payload").unwrap();
        for i in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[i] ^= 0x01;
            assert_eq!(open(&secret, &tampered), Err(CryptoError::Aead));
        }
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let sealed = seal(&generate_secret(), b"payload").unwrap();
        assert_eq!(open(&generate_secret(), &sealed), Err(CryptoError::Aead));
    }

    #[test]
    fn nonces_differ_per_datagram() {
        let secret = generate_secret();
        let a = seal(&secret, b"x").unwrap();
        let b = seal(&secret, b"x").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let secret = generate_secret();
        assert_eq!(open(&secret, &[0u8; 5]), Err(CryptoError::Truncated));
    }
}
