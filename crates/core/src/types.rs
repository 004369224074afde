/// Entity identifiers are opaque strings assigned by the upstream producer.
pub type EntityId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Free-form JSON object used for payloads, context and event metadata.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;
