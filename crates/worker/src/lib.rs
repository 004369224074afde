//! Queue-driven worker: pulls deliveries, parses envelopes, dispatches
//! typed payloads to handlers under the shared job lifecycle, and acks or
//! nacks according to the outcome.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod governor;
pub mod handlers;
pub mod lease;
pub mod lifecycle;
pub mod queue;
pub mod runner;
pub mod storage;

pub use config::WorkerConfig;
pub use dispatch::Dispatcher;
pub use error::JobError;
pub use governor::FlowControl;
pub use handlers::HandlerContext;
pub use lifecycle::{Disposition, LifecycleController};
pub use runner::Worker;
