//! Inbound work envelope parsing.
//!
//! A queue message body has the wire shape
//! `{"type": "<job type>", "id": "<job id>", "payload": {...},
//!   "version"?: "v1", "context"?: {...}, "metadata"?: {...}}`.
//! [`JobEnvelope::parse`] validates it and normalises payload and context
//! keys to `snake_case`. Parsing is a pure transform.

use serde::Serialize;
use serde_json::Value;

use crate::casing::normalize_map;
use crate::error::CoreError;
use crate::types::JsonMap;

/// Envelope version assumed when the producer omits `version`.
pub const DEFAULT_ENVELOPE_VERSION: &str = "v1";

/// A validated, normalised unit of queued work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEnvelope {
    pub version: String,
    pub job_type: String,
    pub job_id: String,
    /// Job-type-specific payload with `snake_case` keys.
    pub payload: JsonMap,
    /// Optional producer context with `snake_case` keys.
    pub context: Option<JsonMap>,
    /// Optional transport metadata, passed through untouched.
    pub metadata: Option<JsonMap>,
}

impl JobEnvelope {
    /// Parse a raw JSON message body.
    pub fn from_slice(bytes: &[u8], expected_type: Option<&str>) -> Result<Self, CoreError> {
        let raw: Value = serde_json::from_slice(bytes)
            .map_err(|e| CoreError::MalformedEnvelope(format!("body is not valid JSON: {e}")))?;
        Self::parse(raw, expected_type)
    }

    /// Validate and normalise a raw message.
    ///
    /// Fails with [`CoreError::MalformedEnvelope`] when `type`, `id` or
    /// `payload` are missing or have the wrong shape, and with
    /// [`CoreError::JobTypeMismatch`] when `expected_type` is given and
    /// differs from the parsed type.
    pub fn parse(raw: Value, expected_type: Option<&str>) -> Result<Self, CoreError> {
        let Value::Object(mut raw) = raw else {
            return Err(CoreError::MalformedEnvelope(
                "envelope must be a JSON object".to_string(),
            ));
        };

        let job_type = match raw.remove("type") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(_) => {
                return Err(CoreError::MalformedEnvelope(
                    "`type` must be a non-empty string".to_string(),
                ))
            }
            None => {
                return Err(CoreError::MalformedEnvelope(
                    "missing required field `type`".to_string(),
                ))
            }
        };

        let job_id = match raw.remove("id") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            Some(_) => {
                return Err(CoreError::MalformedEnvelope(
                    "`id` must be a non-empty string or number".to_string(),
                ))
            }
            None => {
                return Err(CoreError::MalformedEnvelope(
                    "missing required field `id`".to_string(),
                ))
            }
        };

        if let Some(expected) = expected_type {
            if expected != job_type {
                return Err(CoreError::JobTypeMismatch {
                    expected: expected.to_string(),
                    actual: job_type,
                });
            }
        }

        let payload = match raw.remove("payload") {
            Some(Value::Object(map)) => normalize_map(map),
            Some(_) => {
                return Err(CoreError::MalformedEnvelope(
                    "`payload` must be a JSON object".to_string(),
                ))
            }
            None => {
                return Err(CoreError::MalformedEnvelope(
                    "missing required field `payload`".to_string(),
                ))
            }
        };

        let version = match raw.remove("version") {
            Some(Value::String(s)) if !s.is_empty() => s,
            None | Some(Value::Null) => DEFAULT_ENVELOPE_VERSION.to_string(),
            Some(_) => {
                return Err(CoreError::MalformedEnvelope(
                    "`version` must be a string".to_string(),
                ))
            }
        };

        let context = optional_object(&mut raw, "context")?.map(normalize_map);
        let metadata = optional_object(&mut raw, "metadata")?;

        Ok(Self {
            version,
            job_type,
            job_id,
            payload,
            context,
            metadata,
        })
    }
}

fn optional_object(raw: &mut JsonMap, field: &str) -> Result<Option<JsonMap>, CoreError> {
    match raw.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(CoreError::MalformedEnvelope(format!(
            "`{field}` must be a JSON object"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn parses_change_detect_envelope() {
        let raw = json!({"type": "overlay.change.detect", "id": "job-1", "payload": {"overlayId": "ov-1"}});
        let env = JobEnvelope::parse(raw, None).unwrap();
        assert_eq!(env.job_type, "overlay.change.detect");
        assert_eq!(env.job_id, "job-1");
        assert_eq!(env.version, DEFAULT_ENVELOPE_VERSION);
        assert_eq!(env.payload["overlay_id"], "ov-1");
        assert!(env.context.is_none());
    }

    #[test]
    fn context_keys_are_normalised_metadata_untouched() {
        let raw = json!({
            "type": "sheet.preprocess",
            "id": 42,
            "version": "v2",
            "payload": {"sheetId": "s-1"},
            "context": {"requestedBy": "u-1"},
            "metadata": {"traceId": "t"},
        });
        let env = JobEnvelope::parse(raw, Some("sheet.preprocess")).unwrap();
        assert_eq!(env.job_id, "42");
        assert_eq!(env.version, "v2");
        assert_eq!(env.context.unwrap()["requested_by"], "u-1");
        assert_eq!(env.metadata.unwrap()["traceId"], "t");
    }

    #[test]
    fn missing_type_or_id_is_malformed() {
        let no_type = json!({"id": "j", "payload": {}});
        assert_matches!(
            JobEnvelope::parse(no_type, None),
            Err(CoreError::MalformedEnvelope(_))
        );

        let no_id = json!({"type": "sheet.preprocess", "payload": {}});
        assert_matches!(
            JobEnvelope::parse(no_id, None),
            Err(CoreError::MalformedEnvelope(_))
        );
    }

    #[test]
    fn non_object_payload_is_malformed() {
        let raw = json!({"type": "sheet.preprocess", "id": "j", "payload": [1, 2]});
        assert_matches!(
            JobEnvelope::parse(raw, None),
            Err(CoreError::MalformedEnvelope(_))
        );
    }

    #[test]
    fn hint_mismatch_is_rejected() {
        let raw = json!({"type": "sheet.preprocess", "id": "j", "payload": {}});
        assert_matches!(
            JobEnvelope::parse(raw, Some("drawing.preprocess")),
            Err(CoreError::JobTypeMismatch { expected, actual })
                if expected == "drawing.preprocess" && actual == "sheet.preprocess"
        );
    }

    #[test]
    fn invalid_json_body_is_malformed() {
        assert_matches!(
            JobEnvelope::from_slice(b"not json", None),
            Err(CoreError::MalformedEnvelope(_))
        );
    }
}
