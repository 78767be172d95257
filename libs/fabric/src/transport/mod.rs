use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::qos::QoS;

pub mod memory;
pub mod tcp;

pub use self::memory::{MemoryBroker, MemoryTransport};
pub use self::tcp::{TcpTransport, TcpTransportBuilder};

/// A message delivered by the broker for one of the session's subscriptions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Stream of inbound messages for one session
///
/// Closes when the session ends for good.
pub type Inbound = mpsc::UnboundedReceiver<InboundMessage>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// What a transport does when its connection drops unexpectedly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub period_ms: u64,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            period_ms: 1000,
        }
    }
}

/// Parameters for opening a broker session
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub broker_url: String,
    pub session_id: String,
    pub credentials: Option<Credentials>,
    pub reconnect: ReconnectPolicy,
}

/// Publish/subscribe transport
///
/// Each transport instance represents at most one live broker session. All
/// methods take `&self` so the session can be shared between the code issuing
/// requests and the task routing inbound messages.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Open the session and return its inbound message stream
    async fn connect(&self, options: &ConnectOptions) -> Result<Inbound>;

    /// Subscribe to a topic filter, resolving once the broker acknowledges it
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()>;

    /// Queue a message for delivery without waiting on the broker
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<()>;

    /// Close the session; closing an idle transport is a no-op
    async fn disconnect(&self) -> Result<()>;

    /// Whether the session is currently usable
    fn is_connected(&self) -> bool;
}
