//! Enrollment store: durable state of enrollments, jobs and the message log.

pub mod memory;
pub mod store;

pub use memory::MemoryStore;
pub use store::{ClaimOutcome, DispatchStore, DueKey, JobInsert, RecordedSend, SlotAdmission};
