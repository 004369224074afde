//! Per-job subscriber registry.
//!
//! Subscribers register interest in one job id and receive that job's
//! events on a bounded channel. Closed or full subscribers are pruned on
//! the next broadcast.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use plandiff_core::job::JobEvent;
use plandiff_core::types::EntityId;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Per-subscriber buffer.
const SUBSCRIBER_CAPACITY: usize = 64;

/// Receiving half of a job subscription.
pub struct JobSubscription {
    pub id: u64,
    pub job_id: EntityId,
    pub receiver: mpsc::Receiver<JobEvent>,
}

#[derive(Default)]
pub struct JobEventBroker {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<EntityId, Vec<(u64, mpsc::Sender<JobEvent>)>>>,
}

impl JobEventBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EntityId, Vec<(u64, mpsc::Sender<JobEvent>)>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self, job_id: impl Into<EntityId>) -> JobSubscription {
        let job_id = job_id.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.lock().entry(job_id.clone()).or_default().push((id, tx));
        tracing::debug!(job_id = %job_id, subscriber = id, "Job subscriber registered");
        JobSubscription {
            id,
            job_id,
            receiver: rx,
        }
    }

    /// Remove a subscriber. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, job_id: &str, subscriber_id: u64) -> bool {
        let mut subscribers = self.lock();
        let Some(list) = subscribers.get_mut(job_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != subscriber_id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(job_id);
        }
        removed
    }

    /// Deliver `event` to every subscriber of its job. Returns the number
    /// of subscribers reached.
    pub fn broadcast(&self, event: &JobEvent) -> usize {
        let mut subscribers = self.lock();
        let Some(list) = subscribers.get_mut(&event.job_id) else {
            return 0;
        };
        let mut delivered = 0;
        list.retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(job_id = %event.job_id, subscriber = id, "Subscriber lagging, dropping it");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if list.is_empty() {
            subscribers.remove(&event.job_id);
        }
        delivered
    }

    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.lock().get(job_id).map_or(0, Vec::len)
    }

    /// Forward bus events to per-job subscribers until cancelled or the
    /// bus closes.
    pub async fn run(&self, mut receiver: broadcast::Receiver<JobEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Job event broker shutting down");
                    break;
                }
                received = receiver.recv() => match received {
                    Ok(event) => {
                        self.broadcast(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Job event broker lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Job event bus closed, broker shutting down");
                        break;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use plandiff_core::job::JobEventType;

    use super::*;
    use crate::bus::JobEventBus;

    fn event(job_id: &str) -> JobEvent {
        JobEvent::new("overlay.change.detect", job_id, JobEventType::Started)
    }

    #[tokio::test]
    async fn only_subscribers_of_the_job_receive() {
        let broker = JobEventBroker::new();
        let mut a = broker.subscribe("job-a");
        let mut b = broker.subscribe("job-b");

        assert_eq!(broker.broadcast(&event("job-a")), 1);

        assert_eq!(a.receiver.recv().await.unwrap().job_id, "job-a");
        assert!(b.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let broker = JobEventBroker::new();
        let sub = broker.subscribe("job-a");
        assert!(broker.unsubscribe("job-a", sub.id));
        assert!(!broker.unsubscribe("job-a", sub.id));
        assert_eq!(broker.broadcast(&event("job-a")), 0);
        assert_eq!(broker.subscriber_count("job-a"), 0);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let broker = JobEventBroker::new();
        let sub = broker.subscribe("job-a");
        drop(sub);
        assert_eq!(broker.broadcast(&event("job-a")), 0);
        assert_eq!(broker.subscriber_count("job-a"), 0);
    }

    #[tokio::test]
    async fn late_subscriber_sees_only_later_events_of_its_job() {
        let bus = JobEventBus::default();
        let broker = Arc::new(JobEventBroker::new());
        let cancel = CancellationToken::new();
        let mut early = broker.subscribe("job-a");
        let task = {
            let broker = Arc::clone(&broker);
            let rx = bus.subscribe();
            let cancel = cancel.clone();
            tokio::spawn(async move { broker.run(rx, cancel).await })
        };

        bus.publish(event("job-a"));
        early.receiver.recv().await.unwrap();

        let mut late = broker.subscribe("job-a");
        let mut completed = event("job-a");
        completed.event_type = JobEventType::Completed;
        bus.publish(event("job-b"));
        bus.publish(completed);

        assert_eq!(late.receiver.recv().await.unwrap().event_type, JobEventType::Completed);
        assert!(late.receiver.try_recv().is_err());
        assert!(broker.unsubscribe("job-a", late.id));
        assert_eq!(broker.subscriber_count("job-a"), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn run_forwards_from_bus() {
        let bus = JobEventBus::default();
        let broker = Arc::new(JobEventBroker::new());
        let mut sub = broker.subscribe("job-a");
        let cancel = CancellationToken::new();

        let task = {
            let broker = Arc::clone(&broker);
            let rx = bus.subscribe();
            let cancel = cancel.clone();
            tokio::spawn(async move { broker.run(rx, cancel).await })
        };

        bus.publish(event("job-a"));
        assert_eq!(sub.receiver.recv().await.unwrap().job_id, "job-a");

        cancel.cancel();
        task.await.unwrap();
    }
}
