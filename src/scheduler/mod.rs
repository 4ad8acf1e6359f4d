//! Master-side job lifecycle: the registry of job records, the dispatcher
//! that issues jobs and the collector that gathers minion replies.
//!
//! ```text
//! Dispatched --(first result)--> Collecting --(all answered | deadline)--> Complete
//! Dispatched --(deadline, no results)--> TimedOut
//! any open state --(cancel)--> Cancelled
//! ```

pub mod collector;
pub mod dispatcher;
pub mod job;
pub mod registry;

pub use collector::{Collector, CollectorStats, Disposition, StatsSnapshot};
pub use dispatcher::{DispatchOutcome, Dispatcher, JobSpec};
pub use job::{JobRecord, JobState};
pub use registry::{JobRegistry, SweepReport, UpdatedState};
