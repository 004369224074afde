//! Rows of `job_queue`.

use std::collections::HashMap;

use plandiff_core::queue::Delivery;
use plandiff_core::types::Timestamp;
use sqlx::types::Json;
use sqlx::FromRow;

/// A freshly leased queue row.
#[derive(Debug, Clone, FromRow)]
pub struct QueueRow {
    pub id: i64,
    pub message_id: String,
    pub body: Vec<u8>,
    pub attributes: Json<HashMap<String, String>>,
    pub delivery_attempt: i32,
    pub lease_token: uuid::Uuid,
}

impl QueueRow {
    /// The ack id pairs the row id with the lease token so a stale
    /// holder cannot ack a message re-leased to someone else.
    pub fn into_delivery(self, received_at: Timestamp) -> Delivery {
        Delivery {
            message_id: self.message_id,
            ack_id: format!("{}:{}", self.id, self.lease_token),
            data: self.body,
            attributes: self.attributes.0,
            delivery_attempt: self.delivery_attempt.max(1) as u32,
            received_at,
        }
    }
}

/// Split an ack id produced by [`QueueRow::into_delivery`].
pub fn parse_ack_id(ack_id: &str) -> Option<(i64, uuid::Uuid)> {
    let (id, token) = ack_id.split_once(':')?;
    Some((id.parse().ok()?, token.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_id_round_trips() {
        let token = uuid::Uuid::new_v4();
        let row = QueueRow {
            id: 17,
            message_id: "m-1".into(),
            body: b"{}".to_vec(),
            attributes: Json(HashMap::new()),
            delivery_attempt: 2,
            lease_token: token,
        };
        let delivery = row.into_delivery(chrono::Utc::now());
        assert_eq!(parse_ack_id(&delivery.ack_id), Some((17, token)));
        assert_eq!(delivery.delivery_attempt, 2);
    }

    #[test]
    fn malformed_ack_ids_are_rejected() {
        assert_eq!(parse_ack_id("17"), None);
        assert_eq!(parse_ack_id("x:y"), None);
    }
}
