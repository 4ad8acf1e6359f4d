//! Session key derivation.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretBox};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

pub(crate) const KEY_LEN: usize = 32;

pub(crate) type Credential = SecretBox<Vec<u8>>;
pub(crate) type SessionKey = SecretBox<[u8; KEY_LEN]>;

const DERIVATION_CONTEXT: &[u8] = b"salt-dispatch/session";
const COMPARE_CONTEXT: &[u8] = b"salt-dispatch/compare";

pub(crate) fn credential(bytes: &[u8]) -> Credential {
    SecretBox::new(Box::new(bytes.to_vec()))
}

/// `HMAC-SHA256(credential, context || len(principal) || principal || session_id)`.
///
/// Master and minion both run this with the minion's credential, so the key
/// itself never crosses the wire.
pub(crate) fn derive_session_key(
    credential: &Credential,
    principal: &str,
    session_id: &Uuid,
) -> Result<SessionKey, AuthError> {
    let mut mac = HmacSha256::new_from_slice(credential.expose_secret())
        .map_err(|e| AuthError::Backend(format!("invalid credential: {e}")))?;
    mac.update(DERIVATION_CONTEXT);
    mac.update(&(principal.len() as u32).to_be_bytes());
    mac.update(principal.as_bytes());
    mac.update(session_id.as_bytes());

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&mac.finalize().into_bytes());
    Ok(SecretBox::new(Box::new(key)))
}

/// Constant-time byte comparison through HMAC tag verification.
pub(crate) fn constant_time_eq(expected: &[u8], given: &[u8]) -> bool {
    let tag = match HmacSha256::new_from_slice(COMPARE_CONTEXT) {
        Ok(mut mac) => {
            mac.update(expected);
            mac.finalize().into_bytes()
        }
        Err(_) => return false,
    };
    match HmacSha256::new_from_slice(COMPARE_CONTEXT) {
        Ok(mut mac) => {
            mac.update(given);
            mac.verify_slice(&tag).is_ok()
        }
        Err(_) => false,
    }
}
