//! Domain model and collaborator contracts for the plandiff worker.
//!
//! Pure types and functions only; no I/O. Persistence, object storage
//! and the queue are reached through the traits in [`store`],
//! [`storage`] and [`queue`].

pub mod casing;
pub mod envelope;
pub mod error;
pub mod job;
pub mod models;
pub mod payload;
pub mod queue;
pub mod storage;
pub mod store;
pub mod types;
pub mod usage;
