//! Queue-driven run loop.
//!
//! Admission goes through [`FlowControl`]; each admitted delivery runs on
//! its own task with a [`LeaseKeeper`] renewing its lease from the moment
//! it is pulled until it is settled, including any wait for payload memory.

use std::sync::Arc;
use std::time::Duration;

use plandiff_core::envelope::JobEnvelope;
use plandiff_core::queue::{Delivery, Subscription};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::dispatch::Dispatcher;
use crate::governor::{FlowControl, FlowPermit};
use crate::lease::{LeaseKeeper, LeasePolicy};

#[derive(Debug, Clone, Copy)]
pub struct RunnerConfig {
    /// Sleep between pulls when the queue is empty.
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight deliveries.
    pub shutdown_timeout: Duration,
    pub lease_extension_secs: u64,
    pub max_lease_secs: u64,
}

/// What to tell the queue about a finished delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Nack,
}

#[derive(Clone)]
pub struct Worker {
    subscription: Arc<dyn Subscription>,
    dispatcher: Arc<Dispatcher>,
    flow: Arc<FlowControl>,
    config: RunnerConfig,
}

impl Worker {
    pub fn new(
        subscription: Arc<dyn Subscription>,
        dispatcher: Arc<Dispatcher>,
        flow: Arc<FlowControl>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            subscription,
            dispatcher,
            flow,
            config,
        }
    }

    /// Pull and process deliveries until `cancel` fires, then drain.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut tasks = JoinSet::new();
        tracing::info!(
            available_slots = self.flow.available_slots(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Worker started"
        );

        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Delivery task panicked");
                }
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.flow.acquire_slot() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        tracing::warn!(error = %e, "Flow control closed, stopping");
                        break;
                    }
                },
            };

            let pulled = tokio::select! {
                _ = cancel.cancelled() => break,
                pulled = self.subscription.pull() => pulled,
            };

            match pulled {
                Ok(Some(delivery)) => {
                    let worker = self.clone();
                    let cancel = cancel.clone();
                    tasks.spawn(async move { worker.process(delivery, permit, cancel).await });
                }
                Ok(None) => {
                    drop(permit);
                    if self.idle(&cancel).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::warn!(error = %e, "Queue pull failed");
                    if self.idle(&cancel).await {
                        break;
                    }
                }
            }
        }

        self.drain(tasks).await;
    }

    /// Sleep one poll interval. Returns `true` if cancelled meanwhile.
    async fn idle(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.config.poll_interval) => false,
        }
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            tracing::info!("Worker stopped");
            return;
        }
        tracing::info!(in_flight = tasks.len(), "Waiting for in-flight deliveries");
        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = tasks.len(),
                timeout_secs = self.config.shutdown_timeout.as_secs(),
                "Shutdown timeout reached, aborting in-flight deliveries"
            );
            tasks.abort_all();
        }
        tracing::info!("Worker stopped");
    }

    /// Reserve payload memory, then handle one delivery while holding its
    /// flow permit. The lease is renewed throughout. A delivery still
    /// waiting for memory when `cancel` fires is returned unprocessed.
    pub async fn process(&self, delivery: Delivery, mut permit: FlowPermit, cancel: CancellationToken) {
        let keeper = LeaseKeeper::spawn(
            Arc::clone(&self.subscription),
            delivery.clone(),
            LeasePolicy {
                extension_secs: self.config.lease_extension_secs,
                max_lease_secs: self.config.max_lease_secs,
            },
        );

        let reserved = tokio::select! {
            _ = cancel.cancelled() => Err("shutting down"),
            reserved = permit.reserve_payload(delivery.data.len()) => {
                reserved.map_err(|_| "flow control closed")
            }
        };
        let outcome = match reserved {
            Ok(()) => self.handle(&delivery).await,
            Err(reason) => {
                tracing::warn!(
                    message_id = %delivery.message_id,
                    reason,
                    "Returning delivery before processing"
                );
                Outcome::Nack
            }
        };

        keeper.stop().await;
        self.settle(&delivery, outcome).await;
        drop(permit);
    }

    /// Parse and dispatch a delivery, deciding its queue outcome.
    pub async fn handle(&self, delivery: &Delivery) -> Outcome {
        let envelope = match JobEnvelope::from_slice(&delivery.data, delivery.job_type_hint()) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(
                    message_id = %delivery.message_id,
                    error = %e,
                    error_type = e.error_type(),
                    "Discarding malformed envelope"
                );
                return Outcome::Ack;
            }
        };

        match self.dispatcher.dispatch(&envelope, &delivery.message_id).await {
            Ok(_) => Outcome::Ack,
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    message_id = %delivery.message_id,
                    job_id = %envelope.job_id,
                    delivery_attempt = delivery.delivery_attempt,
                    error = %e,
                    "Returning delivery for retry"
                );
                Outcome::Nack
            }
            Err(_) => Outcome::Ack,
        }
    }

    async fn settle(&self, delivery: &Delivery, outcome: Outcome) {
        let result = match outcome {
            Outcome::Ack => self.subscription.ack(delivery).await,
            Outcome::Nack => self.subscription.nack(delivery).await,
        };
        if let Err(e) = result {
            tracing::warn!(
                message_id = %delivery.message_id,
                outcome = ?outcome,
                error = %e,
                "Could not settle delivery"
            );
        }
    }
}
