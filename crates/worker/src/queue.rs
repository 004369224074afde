//! In-process [`Subscription`] for local runs and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use plandiff_core::queue::{Delivery, QueueError, Subscription, ATTR_JOB_TYPE};

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    pending: VecDeque<Delivery>,
    acked: Vec<String>,
    nacked: Vec<String>,
    extensions: Vec<(String, u64)>,
}

/// FIFO queue that records every ack, nack and lease extension.
///
/// A nacked delivery goes to the back of the queue with its attempt
/// counter bumped.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a raw body. Returns the message id.
    pub fn push(&self, data: Vec<u8>, attributes: HashMap<String, String>) -> String {
        let mut state = self.lock();
        state.next_id += 1;
        let message_id = format!("msg-{}", state.next_id);
        state.pending.push_back(Delivery {
            ack_id: format!("{message_id}:1"),
            message_id: message_id.clone(),
            data,
            attributes,
            delivery_attempt: 1,
            received_at: chrono::Utc::now(),
        });
        message_id
    }

    /// Enqueue a JSON envelope, optionally tagged with a job-type hint.
    pub fn push_json(&self, envelope: &serde_json::Value, job_type_hint: Option<&str>) -> String {
        let mut attributes = HashMap::new();
        if let Some(hint) = job_type_hint {
            attributes.insert(ATTR_JOB_TYPE.to_string(), hint.to_string());
        }
        self.push(envelope.to_string().into_bytes(), attributes)
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Message ids acknowledged so far, in order.
    pub fn acked(&self) -> Vec<String> {
        self.lock().acked.clone()
    }

    pub fn nacked(&self) -> Vec<String> {
        self.lock().nacked.clone()
    }

    /// `(message_id, seconds)` for every lease extension.
    pub fn extensions(&self) -> Vec<(String, u64)> {
        self.lock().extensions.clone()
    }
}

#[async_trait]
impl Subscription for MemoryQueue {
    async fn pull(&self) -> Result<Option<Delivery>, QueueError> {
        Ok(self.lock().pending.pop_front())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.lock().acked.push(delivery.message_id.clone());
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.nacked.push(delivery.message_id.clone());
        let attempt = delivery.delivery_attempt + 1;
        state.pending.push_back(Delivery {
            ack_id: format!("{}:{attempt}", delivery.message_id),
            delivery_attempt: attempt,
            received_at: chrono::Utc::now(),
            ..delivery.clone()
        });
        Ok(())
    }

    async fn extend_lease(&self, delivery: &Delivery, seconds: u64) -> Result<(), QueueError> {
        self.lock()
            .extensions
            .push((delivery.message_id.clone(), seconds));
        Ok(())
    }
}
