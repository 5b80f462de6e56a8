//! Concurrency primitives shared by the dispatcher and the chat sessions.
//!
//! - Job slot: single-occupancy gate with fail-fast or bounded-wait acquisition

pub mod job_slot;

pub use job_slot::{JobSlot, SlotGuard};
