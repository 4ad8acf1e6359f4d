//! Authentication backends consulted by the master when a minion presents
//! its credential.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::error::AuthError;
use crate::session::key::{constant_time_eq, credential, Credential};
use secrecy::ExposeSecret;

pub trait AuthBackend: Send + Sync + fmt::Debug {
    fn verify(&self, identity: &str, credential: &[u8]) -> Result<bool, AuthError>;
}

/// Per-identity pre-shared secrets.
#[derive(Debug, Default)]
pub struct SharedSecretBackend {
    secrets: HashMap<String, Credential>,
}

impl SharedSecretBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, identity: impl Into<String>, secret: &[u8]) -> Self {
        self.insert(identity, secret);
        self
    }

    pub fn insert(&mut self, identity: impl Into<String>, secret: &[u8]) {
        self.secrets.insert(identity.into(), credential(secret));
    }
}

impl AuthBackend for SharedSecretBackend {
    fn verify(&self, identity: &str, given: &[u8]) -> Result<bool, AuthError> {
        match self.secrets.get(identity) {
            Some(expected) => Ok(constant_time_eq(expected.expose_secret(), given)),
            None => Ok(false),
        }
    }
}

/// Accepts any credential from listed identities, or from anyone when
/// constructed with [`AllowList::open`].
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    identities: Option<HashSet<String>>,
}

impl AllowList {
    pub fn new<I, S>(identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            identities: Some(identities.into_iter().map(Into::into).collect()),
        }
    }

    pub fn open() -> Self {
        Self { identities: None }
    }
}

impl AuthBackend for AllowList {
    fn verify(&self, identity: &str, _credential: &[u8]) -> Result<bool, AuthError> {
        Ok(self
            .identities
            .as_ref()
            .map_or(true, |ids| ids.contains(identity)))
    }
}
