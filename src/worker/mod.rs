//! Minion side: running published jobs.
//!
//! - **Capabilities**: the functions a minion exposes, gated by availability
//! - **Agent**: receive loop that decrypts jobs, runs them and replies
//! - **Heartbeat**: "still running" notices that push the job deadline out
//!
//! # Execution Flow
//!
//! 1. [`MinionAgent`] receives a sealed job frame and opens it
//! 2. Duplicate job ids (within the recent-jid window) are ignored
//! 3. The capability runs on its own task; heartbeats go out meanwhile
//! 4. The result, with its derived retcode, is sealed and sent to the master
//!
//! `cmd.run` executes `<shell> -c <command>` via [`ShellExecutor`] without
//! sandboxing beyond the working directory and environment settings.

pub mod agent;
pub mod builtins;
pub mod capability;
pub mod executor;
pub mod heartbeat;

pub use agent::MinionAgent;
pub use builtins::register_builtins;
pub use capability::{
    Availability, CallContext, CallOutput, Capability, CapabilityRegistry, LoaderContext,
};
pub use executor::{CmdRun, CommandOutput, ShellExecutor};
pub use heartbeat::HeartbeatSender;
