use thiserror::Error;

use crate::protocol::JobId;
use crate::targeting::TargetType;

/// Failures while framing or parsing a protocol message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("Unknown message kind: {0:#06x}")]
    UnknownKind(u16),

    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Frame has {0} trailing bytes after the body")]
    TrailingBytes(usize),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Envelope kind {envelope} does not match body kind {body}")]
    KindMismatch { envelope: String, body: String },

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

/// Authentication backend and handshake failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authentication denied for {0}")]
    Denied(String),

    #[error("No credential on record for {0}")]
    UnknownIdentity(String),

    #[error("Authentication backend error: {0}")]
    Backend(String),

    #[error("Operation requires the {0} role")]
    WrongRole(&'static str),
}

/// Failures sealing or opening a payload with a session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session expired for {0}")]
    SessionExpired(String),

    #[error("No session established with {0}")]
    UnknownSession(String),

    #[error("Decrypt failed for {peer}: {reason}")]
    Decrypt { peer: String, reason: String },

    #[error("Encrypt failed for {peer}: {reason}")]
    Encrypt { peer: String, reason: String },
}

impl SessionError {
    pub fn is_expired(&self) -> bool {
        matches!(self, SessionError::SessionExpired(_))
    }
}

/// Job Registry consistency failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Duplicate job id: {0}")]
    DuplicateJobId(JobId),

    #[error("Job not found: {0}")]
    UnknownJob(JobId),

    #[error("Duplicate result for job {job_id} from {minion_id}")]
    DuplicateResult { job_id: JobId, minion_id: String },

    #[error("Result for job {job_id} from untargeted minion {minion_id}")]
    UnexpectedMinion { job_id: JobId, minion_id: String },

    #[error("Job timeout must be greater than zero")]
    InvalidTimeout,

    #[error("Job registry at capacity ({0} jobs)")]
    RegistryFull(usize),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetResolutionError {
    #[error("Invalid glob {expr:?}: {reason}")]
    InvalidGlob { expr: String, reason: String },

    #[error("Invalid regular expression {expr:?}: {reason}")]
    InvalidRegex { expr: String, reason: String },

    #[error("Invalid compound target {expr:?}: {reason}")]
    InvalidCompound { expr: String, reason: String },

    #[error("Unknown nodegroup: {0}")]
    UnknownNodegroup(String),

    #[error("Target type {0} is not supported by this resolver")]
    Unsupported(TargetType),

    #[error("Empty target expression")]
    Empty,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Peer not connected: {0}")]
    NotConnected(String),

    #[error("Outbound queue full for {0}")]
    QueueFull(String),

    #[error("Channel closed")]
    Closed,
}

/// Returner Sink failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Returner error: {0}")]
    Backend(String),
}

/// Instrumentation sink failures. Never affect job handling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmitError {
    #[error("Event bus has no subscribers")]
    NoSubscribers,

    #[error("Event sink error: {0}")]
    Sink(String),
}

/// Capability invocation failures on the minion.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("'{function}' is not available.")]
    NotAvailable {
        function: String,
        reason: Option<String>,
    },

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    CommandFailed(String),
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Targeting(#[from] TargetResolutionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Targeting(#[from] TargetResolutionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
