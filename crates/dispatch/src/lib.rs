//! Campaign dispatch: the due-work scheduler, the send worker and the loops
//! that drive them.

pub mod recovery;
pub mod scheduler;
pub mod service;
pub mod worker;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test_support;

pub use recovery::{Recovery, RecoveryReport};
pub use scheduler::{ScheduleReport, Scheduler};
pub use service::{CycleReport, DispatchService};
pub use worker::{Worker, WorkerReport};
