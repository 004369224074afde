//! Zero-sized repositories over the worker's tables.
//!
//! Every method takes any Postgres executor so the same query runs on
//! the pool (auto-commit reads) or inside a transaction.

pub mod drawing_repo;
pub mod job_repo;
pub mod overlay_repo;
pub mod queue_repo;

pub use drawing_repo::DrawingRepo;
pub use job_repo::JobRepo;
pub use overlay_repo::OverlayRepo;
pub use queue_repo::QueueRepo;
