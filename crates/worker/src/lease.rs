//! Periodic lease renewal for deliveries whose handler is still running.

use std::sync::Arc;
use std::time::Duration;

use plandiff_core::queue::{Delivery, QueueError, Subscription};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    /// Seconds granted per extension. Renewal runs every half of this.
    pub extension_secs: u64,
    /// Total lease time after which renewal stops.
    pub max_lease_secs: u64,
}

impl LeasePolicy {
    fn period(&self) -> Duration {
        Duration::from_secs((self.extension_secs / 2).max(1))
    }

    /// Seconds to request at `elapsed`, or `None` once the maximum is used up.
    fn next_extension(&self, elapsed: Duration) -> Option<u64> {
        let elapsed = elapsed.as_secs();
        let remaining = self.max_lease_secs.saturating_sub(elapsed);
        (remaining > 0).then(|| self.extension_secs.min(remaining))
    }
}

/// Background task that keeps one delivery leased until stopped.
pub struct LeaseKeeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl LeaseKeeper {
    pub fn spawn(subscription: Arc<dyn Subscription>, delivery: Delivery, policy: LeasePolicy) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(renew(subscription, delivery, policy, cancel.clone()));
        Self { cancel, handle }
    }

    /// Stop renewing and wait for the task to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Lease keeper task ended abnormally");
        }
    }
}

async fn renew(
    subscription: Arc<dyn Subscription>,
    delivery: Delivery,
    policy: LeasePolicy,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let period = policy.period();
    let mut ticker = tokio::time::interval_at(started + period, period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(seconds) = policy.next_extension(started.elapsed()) else {
            tracing::warn!(
                message_id = %delivery.message_id,
                max_lease_secs = policy.max_lease_secs,
                "Maximum lease reached, no further extensions"
            );
            break;
        };

        match subscription.extend_lease(&delivery, seconds).await {
            Ok(()) => {
                tracing::debug!(message_id = %delivery.message_id, seconds, "Lease extended");
            }
            Err(QueueError::LeaseExpired(id)) => {
                tracing::warn!(message_id = %id, "Lease already expired, stopping renewal");
                break;
            }
            Err(e) => {
                tracing::warn!(message_id = %delivery.message_id, error = %e, "Lease extension failed");
            }
        }

        if seconds < policy.extension_secs {
            tracing::warn!(
                message_id = %delivery.message_id,
                max_lease_secs = policy.max_lease_secs,
                "Final lease extension granted"
            );
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::queue::MemoryQueue;

    async fn leased(queue: &MemoryQueue) -> Delivery {
        queue.push(b"{}".to_vec(), HashMap::new());
        queue.pull().await.unwrap().unwrap()
    }

    fn seconds(queue: &MemoryQueue) -> Vec<u64> {
        queue.extensions().into_iter().map(|(_, s)| s).collect()
    }

    #[test]
    fn extension_is_capped_by_remaining_lease() {
        let policy = LeasePolicy { extension_secs: 60, max_lease_secs: 150 };
        assert_eq!(policy.next_extension(Duration::from_secs(30)), Some(60));
        assert_eq!(policy.next_extension(Duration::from_secs(120)), Some(30));
        assert_eq!(policy.next_extension(Duration::from_secs(150)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn renews_every_half_extension_until_max_lease() {
        let queue = Arc::new(MemoryQueue::new());
        let delivery = leased(&queue).await;
        let keeper = LeaseKeeper::spawn(
            queue.clone(),
            delivery,
            LeasePolicy { extension_secs: 60, max_lease_secs: 150 },
        );

        tokio::time::sleep(Duration::from_secs(400)).await;
        keeper.stop().await;

        assert_eq!(seconds(&queue), vec![60, 60, 60, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_renewal() {
        let queue = Arc::new(MemoryQueue::new());
        let delivery = leased(&queue).await;
        let keeper = LeaseKeeper::spawn(
            queue.clone(),
            delivery,
            LeasePolicy { extension_secs: 60, max_lease_secs: 1800 },
        );

        tokio::time::sleep(Duration::from_secs(45)).await;
        keeper.stop().await;
        tokio::time::sleep(Duration::from_secs(300)).await;

        assert_eq!(seconds(&queue), vec![60]);
    }
}
