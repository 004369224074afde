//! Queue subscription collaborator interface.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::ErrorKind;
use crate::types::Timestamp;

/// Message attribute carrying the producer's expected job type.
pub const ATTR_JOB_TYPE: &str = "job_type";

/// One leased message pulled from the subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: String,
    /// Opaque handle used for ack/nack/lease extension.
    pub ack_id: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_attempt: u32,
    pub received_at: Timestamp,
}

impl Delivery {
    pub fn job_type_hint(&self) -> Option<&str> {
        self.attributes.get(ATTR_JOB_TYPE).map(String::as_str)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Lease expired for {0}")]
    LeaseExpired(String),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Transient
    }
}

#[async_trait]
pub trait Subscription: Send + Sync {
    /// Lease the next available message, if any.
    async fn pull(&self) -> Result<Option<Delivery>, QueueError>;
    /// Remove the message permanently.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;
    /// Release the lease so the message is redelivered.
    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError>;
    /// Push the lease deadline `seconds` into the future.
    async fn extend_lease(&self, delivery: &Delivery, seconds: u64) -> Result<(), QueueError>;
}
