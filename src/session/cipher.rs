//! Sealed frame layout and AEAD sealing.
//!
//! ```text
//! ┌─────────────────┬──────────────────┬────────────┬──────────────────────┐
//! │ Session id (16) │ Expires ms (8)   │ Nonce (12) │ Ciphertext + tag     │
//! └─────────────────┴──────────────────┴────────────┴──────────────────────┘
//! ```
//!
//! The session id and expiry are authenticated as associated data. The nonce
//! is a direction byte, three zero bytes and a big-endian counter.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use secrecy::ExposeSecret;
use uuid::Uuid;

use crate::session::key::SessionKey;

pub(crate) const SESSION_ID_LEN: usize = 16;
pub(crate) const EXPIRY_LEN: usize = 8;
pub(crate) const NONCE_LEN: usize = 12;
pub(crate) const AAD_LEN: usize = SESSION_ID_LEN + EXPIRY_LEN;
pub(crate) const SEALED_HEADER_LEN: usize = AAD_LEN + NONCE_LEN;
/// Poly1305 tag.
pub(crate) const TAG_LEN: usize = 16;

/// Which way a sealed frame travels. Each direction has its own nonce space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Direction {
    ToMinion = 0,
    ToMaster = 1,
}

impl Direction {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Direction::ToMinion),
            1 => Some(Direction::ToMaster),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SealedHeader {
    pub session_id: Uuid,
    pub expires_at_ms: i64,
    pub direction: Direction,
    pub counter: u64,
}

impl SealedHeader {
    fn aad(&self) -> [u8; AAD_LEN] {
        let mut aad = [0u8; AAD_LEN];
        aad[..SESSION_ID_LEN].copy_from_slice(self.session_id.as_bytes());
        aad[SESSION_ID_LEN..].copy_from_slice(&self.expires_at_ms.to_be_bytes());
        aad
    }

    fn nonce(&self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[0] = self.direction as u8;
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        nonce
    }

    /// Splits a sealed frame into its header and ciphertext.
    pub(crate) fn parse(frame: &[u8]) -> Result<(Self, &[u8]), String> {
        if frame.len() < SEALED_HEADER_LEN + TAG_LEN {
            return Err(format!(
                "sealed frame too short: {} bytes (min {})",
                frame.len(),
                SEALED_HEADER_LEN + TAG_LEN
            ));
        }
        let mut sid = [0u8; SESSION_ID_LEN];
        sid.copy_from_slice(&frame[..SESSION_ID_LEN]);
        let mut expiry = [0u8; EXPIRY_LEN];
        expiry.copy_from_slice(&frame[SESSION_ID_LEN..AAD_LEN]);
        let nonce = &frame[AAD_LEN..SEALED_HEADER_LEN];

        let direction =
            Direction::from_u8(nonce[0]).ok_or_else(|| format!("bad nonce direction {}", nonce[0]))?;
        if nonce[1..4] != [0, 0, 0] {
            return Err("malformed nonce".to_string());
        }
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&nonce[4..]);

        let header = Self {
            session_id: Uuid::from_bytes(sid),
            expires_at_ms: i64::from_be_bytes(expiry),
            direction,
            counter: u64::from_be_bytes(counter),
        };
        Ok((header, &frame[SEALED_HEADER_LEN..]))
    }
}

pub(crate) fn seal(key: &SessionKey, header: &SealedHeader, plaintext: &[u8]) -> Result<Vec<u8>, String> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.expose_secret()));
    let aad = header.aad();
    let nonce = header.nonce();
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| e.to_string())?;

    let mut frame = Vec::with_capacity(SEALED_HEADER_LEN + ciphertext.len());
    frame.extend_from_slice(&aad);
    frame.extend_from_slice(&nonce);
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

pub(crate) fn open(key: &SessionKey, header: &SealedHeader, ciphertext: &[u8]) -> Result<Vec<u8>, String> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.expose_secret()));
    let aad = header.aad();
    let nonce = header.nonce();
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| "authentication failed".to_string())
}
