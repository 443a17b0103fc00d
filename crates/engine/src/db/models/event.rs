//! Inbound event model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An inbound domain event (`order.created`, `cart.updated`, ...). Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    /// Dotted event type.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Emitting system (storefront, payments, ...).
    #[serde(default)]
    pub source: Option<String>,

    #[serde(default)]
    pub payload: serde_json::Value,

    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            source: None,
            payload,
            received_at: Utc::now(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_deserialize_defaults() {
        let event: Event = serde_json::from_value(serde_json::json!({
            "type": "order.created",
            "payload": {"order": {"id": "o-1"}}
        }))
        .unwrap();
        assert_eq!(event.event_type, "order.created");
        assert!(event.source.is_none());
        assert_eq!(event.payload["order"]["id"], "o-1");
    }
}
