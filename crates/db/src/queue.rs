//! Postgres-backed lease queue implementing [`Subscription`].

use std::collections::HashMap;

use async_trait::async_trait;
use plandiff_core::queue::{Delivery, QueueError, Subscription};

use crate::error::queue_error;
use crate::models::queue::parse_ack_id;
use crate::repositories::QueueRepo;
use crate::DbPool;

#[derive(Debug, Clone)]
pub struct PgQueue {
    pool: DbPool,
    /// Lease granted on pull, before any extension.
    initial_lease_secs: u64,
}

impl PgQueue {
    pub fn new(pool: DbPool, initial_lease_secs: u64) -> Self {
        Self {
            pool,
            initial_lease_secs,
        }
    }

    /// Publish a message. Returns the generated message id.
    pub async fn publish(
        &self,
        body: &[u8],
        attributes: &HashMap<String, String>,
    ) -> Result<String, QueueError> {
        let message_id = uuid::Uuid::now_v7().to_string();
        QueueRepo::enqueue(&self.pool, &message_id, body, attributes)
            .await
            .map_err(queue_error)?;
        Ok(message_id)
    }

    fn lease_of(delivery: &Delivery) -> Result<(i64, uuid::Uuid), QueueError> {
        parse_ack_id(&delivery.ack_id).ok_or_else(|| QueueError::LeaseExpired(delivery.ack_id.clone()))
    }
}

#[async_trait]
impl Subscription for PgQueue {
    async fn pull(&self) -> Result<Option<Delivery>, QueueError> {
        let token = uuid::Uuid::new_v4();
        let row = QueueRepo::lease_next(&self.pool, token, self.initial_lease_secs as f64)
            .await
            .map_err(queue_error)?;
        Ok(row.map(|r| r.into_delivery(chrono::Utc::now())))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let (id, token) = Self::lease_of(delivery)?;
        if !QueueRepo::delete(&self.pool, id, token).await.map_err(queue_error)? {
            return Err(QueueError::LeaseExpired(delivery.message_id.clone()));
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let (id, token) = Self::lease_of(delivery)?;
        if !QueueRepo::release(&self.pool, id, token).await.map_err(queue_error)? {
            return Err(QueueError::LeaseExpired(delivery.message_id.clone()));
        }
        Ok(())
    }

    async fn extend_lease(&self, delivery: &Delivery, seconds: u64) -> Result<(), QueueError> {
        let (id, token) = Self::lease_of(delivery)?;
        if !QueueRepo::extend(&self.pool, id, token, seconds as f64)
            .await
            .map_err(queue_error)?
        {
            return Err(QueueError::LeaseExpired(delivery.message_id.clone()));
        }
        Ok(())
    }
}
