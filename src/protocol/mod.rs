//! Wire protocol between master and minions.
//!
//! Every message is an [`Envelope`] (kind + protocol version) followed by a
//! MessagePack body. [`codec::encode`] / [`codec::decode`] are pure
//! transforms; encryption happens one layer up in [`crate::session`].

pub mod codec;
mod envelope;
mod jid;
mod message;

pub use codec::{decode, encode, encode_message, FrameHeader, FRAME_HEADER_SIZE, MAX_BODY_SIZE};
pub use envelope::{Envelope, MessageKind, CURRENT_VERSION, MIN_SUPPORTED_VERSION};
pub use jid::{JidGenerator, JobId};
pub use message::{
    AckKind, CancelNotice, ControlAck, Heartbeat, JobRequest, Message, MinionId, MinionResult,
};
