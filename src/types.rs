use crate::constants::responses;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

/// The unit of gossip as it travels between peers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub event: String,
    pub payload: Map<String, Value>,
    pub event_id: String,
    pub source: String,
}

/// An event record as decoded from an inbound request body.
///
/// Every field is optional on the wire; the dispatcher decides what a missing
/// field means. Fields are read independently: one field of the wrong type
/// does not discard the others.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct InboundRecord {
    #[serde(deserialize_with = "lenient_string")]
    pub event: Option<String>,
    pub payload: Option<Value>,
    #[serde(deserialize_with = "lenient_string")]
    pub event_id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub source: Option<String>,
}

/// Strings pass through and numbers are rendered; any other JSON type reads
/// as absent.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

impl From<EventRecord> for InboundRecord {
    fn from(record: EventRecord) -> Self {
        Self {
            event: Some(record.event),
            payload: Some(Value::Object(record.payload)),
            event_id: Some(record.event_id),
            source: Some(record.source),
        }
    }
}

/// What a handler sees for one inbound delivery.
#[derive(Clone, Debug, PartialEq)]
pub struct HandlerInput {
    pub event: String,
    pub event_id: String,
    pub source: String,
    pub payload: Map<String, Value>,
    /// The caller's address tripped this handler's per-source limit
    pub ip_rate_limited: bool,
    /// This handler's global limit tripped
    pub rate_limited: bool,
    /// Caller address the flags refer to
    pub rate_limited_ip: String,
}

impl HandlerInput {
    /// Payload merged with the rate-limit flags. Flags win over payload keys of
    /// the same name.
    pub fn to_value(&self) -> Value {
        let mut merged = self.payload.clone();
        merged.insert("ipRateLimited".to_string(), Value::Bool(self.ip_rate_limited));
        merged.insert("rateLimited".to_string(), Value::Bool(self.rate_limited));
        merged.insert(
            "rateLimitedIP".to_string(),
            Value::String(self.rate_limited_ip.clone()),
        );
        Value::Object(merged)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.ip_rate_limited || self.rate_limited
    }
}

/// Result of one send attempt during fanout.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct PeerOutcome {
    pub peer: String,
    #[serde(flatten)]
    pub result: PeerResult,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(untagged)]
pub enum PeerResult {
    /// The peer answered. `data` is absent for an empty or non-JSON body.
    Delivered {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Failed { error: String },
}

impl PeerOutcome {
    pub fn delivered(peer: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            peer: peer.into(),
            result: PeerResult::Delivered { data },
        }
    }

    pub fn failed(peer: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            result: PeerResult::Failed {
                error: error.into(),
            },
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self.result, PeerResult::Delivered { .. })
    }

    pub fn data(&self) -> Option<&Value> {
        match &self.result {
            PeerResult::Delivered { data } => data.as_ref(),
            PeerResult::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.result {
            PeerResult::Delivered { .. } => None,
            PeerResult::Failed { error } => Some(error),
        }
    }
}

/// `{error: message}`, the shape of every protocol or handler failure.
pub fn error_response(message: impl Into<String>) -> Value {
    json!({ "error": message.into() })
}

pub fn rate_limit_response(ip_rate_limited: bool, rate_limited: bool, ip: &str) -> Value {
    json!({
        "error": responses::RATE_LIMIT_EXCEEDED,
        "ipRateLimited": ip_rate_limited,
        "rateLimited": rate_limited,
        "rateLimitedIP": ip,
    })
}
