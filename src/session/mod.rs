//! Credential/session layer.
//!
//! The master authenticates minions through an [`AuthBackend`] and hands
//! back a [`SessionGrant`]. Both ends derive the session key from the
//! minion's credential and the grant's session id, so no key material is
//! ever sent. Sessions are owned here and looked up by peer identity; the
//! dispatcher and collector only ever pass identities and bytes.

mod auth;
mod cipher;
mod key;

pub use auth::{AllowList, AuthBackend, SharedSecretBackend};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{add_duration, Clock};
use crate::config::SessionConfig;
use crate::error::{AuthError, SessionError};
use cipher::{Direction, SealedHeader};
use key::{credential, derive_session_key, Credential, SessionKey};

/// What the master returns on successful authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionGrant {
    pub session_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Read-only view of an established session. Carries no key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub peer_identity: String,
    pub session_id: Uuid,
    pub established_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Master,
    Minion,
}

impl Role {
    fn outbound(self) -> Direction {
        match self {
            Role::Master => Direction::ToMinion,
            Role::Minion => Direction::ToMaster,
        }
    }

    fn inbound(self) -> Direction {
        match self {
            Role::Master => Direction::ToMaster,
            Role::Minion => Direction::ToMinion,
        }
    }
}

struct Session {
    peer_identity: String,
    session_id: Uuid,
    key: SessionKey,
    established_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    /// Next outbound nonce counter
    send_counter: u64,
    replay: ReplayWindow,
}

impl Session {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            peer_identity: self.peer_identity.clone(),
            session_id: self.session_id,
            established_at: self.established_at,
            expires_at: self.expires_at,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Inbound counters that may still arrive out of order behind the highest one.
const REPLAY_WINDOW: u64 = 64;

/// Session ids remembered per peer after they were replaced.
const RETIRED_SESSIONS: usize = 16;

/// Accepts each inbound nonce counter at most once. Counters may arrive out
/// of order as long as they are within [`REPLAY_WINDOW`] of the highest.
#[derive(Debug, Clone, Copy, Default)]
struct ReplayWindow {
    highest: Option<u64>,
    /// Bit `i` is set once `highest - i` has been accepted
    seen: u64,
}

impl ReplayWindow {
    fn check(&self, counter: u64) -> Result<(), String> {
        let Some(highest) = self.highest else {
            return Ok(());
        };
        if counter > highest {
            return Ok(());
        }
        let offset = highest - counter;
        if offset >= REPLAY_WINDOW {
            return Err(format!("nonce counter {counter} is behind the replay window"));
        }
        if self.seen & (1 << offset) != 0 {
            return Err(format!("replayed nonce counter {counter}"));
        }
        Ok(())
    }

    fn accept(&mut self, counter: u64) {
        match self.highest {
            Some(highest) if counter <= highest => self.seen |= 1 << (highest - counter),
            Some(highest) => {
                let shift = counter - highest;
                self.seen = if shift >= REPLAY_WINDOW {
                    1
                } else {
                    (self.seen << shift) | 1
                };
                self.highest = Some(counter);
            }
            None => {
                self.highest = Some(counter);
                self.seen = 1;
            }
        }
    }
}

/// Master side needs a way to verify identities; minion side needs its own
/// credential and the identity of its master.
enum Credentials {
    Master {
        backend: Arc<dyn AuthBackend>,
        remembered: DashMap<String, Credential>,
    },
    Minion {
        master_id: String,
        credential: Credential,
    },
}

/// Something that can authenticate a minion and return a grant. The master's
/// [`SessionLayer`] implements it; in a networked deployment this would be a
/// request to the master's auth endpoint.
pub trait Handshake: Send + Sync {
    fn handshake(&self, identity: &str, credential: &[u8]) -> Result<SessionGrant, AuthError>;
}

pub struct SessionLayer {
    identity: String,
    role: Role,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    credentials: Credentials,
    sessions: DashMap<String, Session>,
    /// Replaced session ids per peer, never adopted again
    retired: DashMap<String, Vec<Uuid>>,
}

impl std::fmt::Debug for SessionLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLayer")
            .field("identity", &self.identity)
            .field("role", &self.role)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl SessionLayer {
    pub fn master(
        identity: impl Into<String>,
        backend: Arc<dyn AuthBackend>,
        config: &SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identity: identity.into(),
            role: Role::Master,
            ttl: config.ttl(),
            clock,
            credentials: Credentials::Master {
                backend,
                remembered: DashMap::new(),
            },
            sessions: DashMap::new(),
            retired: DashMap::new(),
        }
    }

    pub fn minion(
        identity: impl Into<String>,
        master_id: impl Into<String>,
        secret: &[u8],
        config: &SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identity: identity.into(),
            role: Role::Minion,
            ttl: config.ttl(),
            clock,
            credentials: Credentials::Minion {
                master_id: master_id.into(),
                credential: credential(secret),
            },
            sessions: DashMap::new(),
            retired: DashMap::new(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Master role: verify `identity` and establish a fresh session with it,
    /// replacing any previous one.
    pub fn authenticate(&self, identity: &str, secret: &[u8]) -> Result<SessionGrant, AuthError> {
        let Credentials::Master {
            backend,
            remembered,
        } = &self.credentials
        else {
            return Err(AuthError::WrongRole("master"));
        };

        if !backend.verify(identity, secret)? {
            tracing::warn!(identity, "Authentication denied");
            return Err(AuthError::Denied(identity.to_string()));
        }

        let cred = credential(secret);
        let session_id = Uuid::new_v4();
        let now = self.clock.now();
        let expires_at = truncate_to_millis(add_duration(now, self.ttl))?;
        let key = derive_session_key(&cred, identity, &session_id)?;

        remembered.insert(identity.to_string(), cred);
        self.sessions.insert(
            identity.to_string(),
            Session {
                peer_identity: identity.to_string(),
                session_id,
                key,
                established_at: now,
                expires_at,
                send_counter: 0,
                replay: ReplayWindow::default(),
            },
        );
        tracing::info!(identity, session_id = %session_id, expires_at = %expires_at, "Session established");

        Ok(SessionGrant {
            session_id,
            expires_at,
        })
    }

    /// Master role: re-verify the credential `identity` last presented and
    /// rotate its session.
    pub fn reauthenticate(&self, identity: &str) -> Result<SessionGrant, AuthError> {
        let Credentials::Master { remembered, .. } = &self.credentials else {
            return Err(AuthError::WrongRole("master"));
        };
        let secret = remembered
            .get(identity)
            .map(|c| secrecy::ExposeSecret::expose_secret(c.value()).clone())
            .ok_or_else(|| AuthError::UnknownIdentity(identity.to_string()))?;
        tracing::debug!(identity, "Re-authenticating session");
        self.authenticate(identity, &secret)
    }

    /// Minion role: install a grant obtained from the master.
    pub fn install(&self, grant: &SessionGrant) -> Result<(), AuthError> {
        let Credentials::Minion {
            master_id,
            credential,
        } = &self.credentials
        else {
            return Err(AuthError::WrongRole("minion"));
        };
        let key = derive_session_key(credential, &self.identity, &grant.session_id)?;
        let previous = self.sessions.insert(
            master_id.clone(),
            Session {
                peer_identity: master_id.clone(),
                session_id: grant.session_id,
                key,
                established_at: self.clock.now(),
                expires_at: grant.expires_at,
                send_counter: 0,
                replay: ReplayWindow::default(),
            },
        );
        if let Some(previous) = previous.filter(|p| p.session_id != grant.session_id) {
            self.retire(master_id, previous.session_id);
        }
        tracing::debug!(master = %master_id, session_id = %grant.session_id, "Session installed");
        Ok(())
    }

    /// Minion role: authenticate against the master and install the grant.
    pub fn connect(&self, master: &dyn Handshake) -> Result<SessionGrant, AuthError> {
        let Credentials::Minion { credential, .. } = &self.credentials else {
            return Err(AuthError::WrongRole("minion"));
        };
        let grant = master.handshake(&self.identity, secrecy::ExposeSecret::expose_secret(credential))?;
        self.install(&grant)?;
        Ok(grant)
    }

    /// Seals `plaintext` for `peer` under the current session.
    pub fn encrypt(&self, peer: &str, plaintext: &[u8]) -> Result<Bytes, SessionError> {
        let now = self.clock.now();
        let mut session = self
            .sessions
            .get_mut(peer)
            .ok_or_else(|| SessionError::UnknownSession(peer.to_string()))?;
        if session.is_expired(now) {
            return Err(SessionError::SessionExpired(peer.to_string()));
        }

        let counter = session.send_counter;
        session.send_counter = counter.checked_add(1).ok_or_else(|| SessionError::Encrypt {
            peer: peer.to_string(),
            reason: "nonce counter exhausted".to_string(),
        })?;

        let header = SealedHeader {
            session_id: session.session_id,
            expires_at_ms: session.expires_at.timestamp_millis(),
            direction: self.role.outbound(),
            counter,
        };
        cipher::seal(&session.key, &header, plaintext)
            .map(Bytes::from)
            .map_err(|reason| SessionError::Encrypt {
                peer: peer.to_string(),
                reason,
            })
    }

    /// Opens a sealed frame received from `peer`.
    pub fn decrypt(&self, peer: &str, frame: &[u8]) -> Result<Vec<u8>, SessionError> {
        let decrypt_err = |reason: String| SessionError::Decrypt {
            peer: peer.to_string(),
            reason,
        };
        let (header, ciphertext) = SealedHeader::parse(frame).map_err(decrypt_err)?;
        if header.direction != self.role.inbound() {
            return Err(decrypt_err("frame sealed for the wrong direction".to_string()));
        }

        let now = self.clock.now();
        let mut session = self
            .sessions
            .get_mut(peer)
            .ok_or_else(|| SessionError::UnknownSession(peer.to_string()))?;

        if header.session_id != session.session_id {
            if self.role == Role::Master {
                return Err(decrypt_err("stale session id".to_string()));
            }
            // The master rotated the session; adopt it only if it is newer
            // than the one in use and the key derives.
            if self.is_retired(peer, &header.session_id)
                || header.expires_at_ms < session.expires_at.timestamp_millis()
            {
                return Err(decrypt_err("stale session id".to_string()));
            }
            let mut rotated = self.rotated_session(peer, &header)?;
            if rotated.is_expired(now) {
                return Err(SessionError::SessionExpired(peer.to_string()));
            }
            let plaintext = cipher::open(&rotated.key, &header, ciphertext).map_err(decrypt_err)?;
            tracing::debug!(peer, session_id = %rotated.session_id, "Adopted rotated session");
            rotated.replay.accept(header.counter);
            let previous = std::mem::replace(&mut *session, rotated);
            self.retire(peer, previous.session_id);
            return Ok(plaintext);
        }

        if session.is_expired(now) {
            return Err(SessionError::SessionExpired(peer.to_string()));
        }
        session.replay.check(header.counter).map_err(decrypt_err)?;

        let plaintext = cipher::open(&session.key, &header, ciphertext).map_err(decrypt_err)?;
        session.replay.accept(header.counter);
        Ok(plaintext)
    }

    fn retire(&self, peer: &str, session_id: Uuid) {
        let mut retired = self.retired.entry(peer.to_string()).or_default();
        if !retired.contains(&session_id) {
            retired.push(session_id);
        }
        if retired.len() > RETIRED_SESSIONS {
            let excess = retired.len() - RETIRED_SESSIONS;
            retired.drain(..excess);
        }
    }

    fn is_retired(&self, peer: &str, session_id: &Uuid) -> bool {
        self.retired
            .get(peer)
            .is_some_and(|ids| ids.contains(session_id))
    }

    fn rotated_session(&self, peer: &str, header: &SealedHeader) -> Result<Session, SessionError> {
        let Credentials::Minion { credential, .. } = &self.credentials else {
            return Err(SessionError::UnknownSession(peer.to_string()));
        };
        let key = derive_session_key(credential, &self.identity, &header.session_id).map_err(|e| {
            SessionError::Decrypt {
                peer: peer.to_string(),
                reason: e.to_string(),
            }
        })?;
        let expires_at =
            DateTime::from_timestamp_millis(header.expires_at_ms).ok_or_else(|| SessionError::Decrypt {
                peer: peer.to_string(),
                reason: "expiry out of range".to_string(),
            })?;
        Ok(Session {
            peer_identity: peer.to_string(),
            session_id: header.session_id,
            key,
            established_at: self.clock.now(),
            expires_at,
            send_counter: 0,
            replay: ReplayWindow::default(),
        })
    }

    pub fn session(&self, peer: &str) -> Option<SessionInfo> {
        self.sessions.get(peer).map(|s| s.info())
    }

    pub fn revoke(&self, peer: &str) -> bool {
        self.sessions.remove(peer).is_some()
    }

    pub fn peers(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}

impl Handshake for SessionLayer {
    fn handshake(&self, identity: &str, credential: &[u8]) -> Result<SessionGrant, AuthError> {
        self.authenticate(identity, credential)
    }
}

/// Expiry travels as milliseconds; keep the in-memory value identical.
fn truncate_to_millis(ts: DateTime<Utc>) -> Result<DateTime<Utc>, AuthError> {
    DateTime::from_timestamp_millis(ts.timestamp_millis())
        .ok_or_else(|| AuthError::Backend("session expiry out of range".to_string()))
}
