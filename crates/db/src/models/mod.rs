//! Row types for the worker's tables and their conversions into domain
//! values.

pub mod drawing;
pub mod job;
pub mod overlay;
pub mod queue;
