use serde::{Deserialize, Serialize};

/// Wire-format version of [`MessagePayload`].
pub const MESSAGE_VERSION: &str = "1";

/// The JSON body stored at `message:{messageId}`.
///
/// `queue` is the resolved child queue key and `parent_queue` the parent this
/// message is indexed under; together they let any holder of the payload
/// (consumers, the requeuer) rebuild every key the message participates in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub version: String,
    pub data: serde_json::Value,
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_key: Option<String>,
    /// Enqueue timestamp, epoch milliseconds.
    pub timestamp: i64,
    pub message_id: String,
    pub parent_queue: String,
}

impl MessagePayload {
    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn deserialize(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Current epoch time in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn payload_round_trips_in_camel_case() {
        let payload = MessagePayload {
            version: MESSAGE_VERSION.to_string(),
            data: serde_json::json!({"x": 1}),
            queue: "queue:e1:emails:o:org1".to_string(),
            concurrency_key: None,
            timestamp: 1234,
            message_id: "m1".to_string(),
            parent_queue: "sharedQueue".to_string(),
        };

        let raw = payload.serialize().unwrap();
        assert!(raw.contains("\"messageId\":\"m1\""));
        assert!(raw.contains("\"parentQueue\":\"sharedQueue\""));
        // Absent concurrency keys are omitted entirely.
        assert!(!raw.contains("concurrencyKey"));

        assert_eq!(MessagePayload::deserialize(&raw).unwrap(), payload);
    }
}
