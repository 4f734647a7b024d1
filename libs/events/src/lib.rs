//! # firehose-events
//!
//! Data model shared by the allocation firehose.
//!
//! ## Inbound
//!
//! The orchestrator's allocation listing (`Allocation`, `TaskState`,
//! `TaskEvent`) and node records (`Node`), deserialized from the Nomad HTTP
//! API shapes. Task events keep every field the orchestrator sends, including
//! ones this crate does not model.
//!
//! ## Outbound
//!
//! `AllocationEvent` is one record per (allocation, task, task event). Records
//! are immutable once built and are encoded to JSON before being handed to a
//! sink. Field names follow the PascalCase layout downstream consumers already
//! parse.

mod allocation;
mod error;
mod event;

pub use allocation::*;
pub use error::EventError;
pub use event::*;
