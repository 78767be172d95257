use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Sender recorded for inbound messages that did not come wrapped in an envelope
pub const UNKNOWN_SENDER: &str = "unknown-sender";

const SYNTHETIC_ID_PREFIX: &str = "unknown-";

/// Wire wrapper around every payload: `{"requestId", "from", "payload"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub request_id: String,
    pub from: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Fresh envelope with a newly generated request id
    pub fn new(from: impl Into<String>, payload: Value) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            from: from.into(),
            payload,
        }
    }

    /// Reply to `request`, echoing its id
    pub fn reply_to(request: &Envelope, from: impl Into<String>, payload: Value) -> Self {
        Self {
            request_id: request.request_id.clone(),
            from: from.into(),
            payload,
        }
    }

    /// Interpret a decoded inbound value
    ///
    /// Values lacking a non-empty `requestId` or `from` come from publishers that
    /// do not speak the envelope format. They are wrapped whole as the payload,
    /// under a synthetic id and [`UNKNOWN_SENDER`].
    pub fn from_inbound(value: Value) -> Self {
        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        match (field("requestId"), field("from")) {
            (Some(request_id), Some(from)) => {
                let payload = value.get("payload").cloned().unwrap_or(Value::Null);
                Self {
                    request_id,
                    from,
                    payload,
                }
            }
            _ => Self {
                request_id: format!("{SYNTHETIC_ID_PREFIX}{}", short_id()),
                from: UNKNOWN_SENDER.to_string(),
                payload: value,
            },
        }
    }

    /// Whether a reply can be addressed back to the sender
    pub fn is_replyable(&self) -> bool {
        self.from != UNKNOWN_SENDER
    }
}

/// Error carried by a reply payload, if any
///
/// A payload signals failure with an `error` member that is not `null`,
/// `false`, `0` or `""`. String errors are returned as-is, anything else as
/// JSON.
pub fn error_message(payload: &Value) -> Option<String> {
    match payload.get("error")? {
        Value::Null | Value::Bool(false) => None,
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::String(message) if message.is_empty() => None,
        Value::String(message) => Some(message.clone()),
        other => Some(other.to_string()),
    }
}

/// Reply payload reporting a failure
pub fn error_payload(message: impl Into<String>) -> Value {
    serde_json::json!({ "error": message.into() })
}

/// First eight hex digits of a fresh v4 UUID
pub(crate) fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
