//! Job-event fan-out.
//!
//! - [`JobEventBus`]: in-process publish/subscribe hub for every
//!   committed [`JobEvent`](plandiff_core::job::JobEvent), backed by
//!   `tokio::sync::broadcast`.
//! - [`JobEventBroker`]: per-job subscriber registry with explicit
//!   subscribe, unsubscribe and broadcast, fed from the bus.
//!
//! The worker itself only publishes. The broker is the attachment point for
//! anything that streams progress for a single job to a client, such as a
//! socket or SSE endpoint hosted next to the worker. Such a consumer takes
//! a [`JobEventBroker::subscribe`] handle per watched job, reads its
//! receiver, and calls [`JobEventBroker::unsubscribe`] when the client goes
//! away. Nothing in this workspace subscribes today.

pub mod broker;
pub mod bus;

pub use broker::{JobEventBroker, JobSubscription};
pub use bus::JobEventBus;
