use serde::{Deserialize, Serialize};

/// Provider event envelope, parsed only after the signature checks out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub data: TransferEventData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferEventData {
    pub transfer_id: Option<String>,
    /// Idempotency key the transfer was created with (our batch key)
    pub idempotency_key: Option<String>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    TransferSucceeded,
    TransferFailed,
    TransferReversed,
    Unknown,
}

impl ProviderEvent {
    pub fn kind(&self) -> EventKind {
        match self.event_type.as_str() {
            "transfer.succeeded" | "transfer.paid" => EventKind::TransferSucceeded,
            "transfer.failed" => EventKind::TransferFailed,
            "transfer.reversed" => EventKind::TransferReversed,
            _ => EventKind::Unknown,
        }
    }

    /// Human-readable reason recorded on the obligation
    pub fn failure_reason(&self) -> String {
        let data = &self.data;
        match (&data.failure_code, &data.failure_message, &data.reason) {
            (Some(code), Some(message), _) => format!("{}: {}", code, message),
            (Some(code), None, _) => code.clone(),
            (None, Some(message), _) => message.clone(),
            (None, None, Some(reason)) => reason.clone(),
            (None, None, None) => self.event_type.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event() {
        let event: ProviderEvent = serde_json::from_str(
            r#"{
                "id": "evt_1",
                "type": "transfer.failed",
                "created": 1717228800,
                "data": {
                    "transfer_id": "tr_1",
                    "failure_code": "account_closed",
                    "failure_message": "destination closed"
                }
            }"#,
        )
        .unwrap();

        assert_eq!(event.kind(), EventKind::TransferFailed);
        assert_eq!(event.data.transfer_id.as_deref(), Some("tr_1"));
        assert_eq!(event.failure_reason(), "account_closed: destination closed");
    }

    #[test]
    fn test_unknown_type_without_data() {
        let event: ProviderEvent =
            serde_json::from_str(r#"{"id":"evt_2","type":"account.updated"}"#).unwrap();
        assert_eq!(event.kind(), EventKind::Unknown);
        assert_eq!(event.data, TransferEventData::default());
    }
}
