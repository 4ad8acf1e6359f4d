//! Master/minion job publish, dispatch and collection.
//!
//! A [`master::Master`] resolves a target expression to a set of minions,
//! publishes a sealed job to them and collects their results into a
//! [`scheduler::JobRegistry`] until every target answered or the deadline
//! passed. Minions run the job through a [`worker::MinionAgent`].

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod master;
pub mod protocol;
pub mod returner;
pub mod scheduler;
pub mod session;
pub mod shutdown;
pub mod targeting;
pub mod transport;
pub mod worker;
