use std::time::Duration;

use courier_fabric::{ConnectOptions, Credentials, QoS, ReconnectPolicy};
use serde::{Deserialize, Serialize};

use crate::envelope::short_id;

pub const DEFAULT_BROKER_URL: &str = "tcp://127.0.0.1:1883";
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Settings for one endpoint
///
/// Deserializable with every field but `device_id` optional. A missing
/// `session_id` is generated per config, so two endpoints sharing a logical id
/// still get distinct transport sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub device_id: String,
    pub broker_url: String,
    pub session_id: String,
    pub credentials: Option<Credentials>,
    pub reconnect: ReconnectPolicy,
    pub qos: QoS,
    pub default_timeout_ms: u64,
}

impl EndpointConfig {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Self::default()
        }
    }

    pub fn builder(device_id: impl Into<String>) -> EndpointConfigBuilder {
        EndpointConfigBuilder {
            config: Self::new(device_id),
        }
    }

    /// Same settings for another device, with a fresh session id
    pub fn for_device(&self, device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            session_id: generate_session_id(),
            ..self.clone()
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            broker_url: self.broker_url.clone(),
            session_id: self.session_id.clone(),
            credentials: self.credentials.clone(),
            reconnect: self.reconnect,
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            broker_url: DEFAULT_BROKER_URL.to_string(),
            session_id: generate_session_id(),
            credentials: None,
            reconnect: ReconnectPolicy::default(),
            qos: QoS::AtMostOnce,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

/// Builder for [`EndpointConfig`]
pub struct EndpointConfigBuilder {
    config: EndpointConfig,
}

impl EndpointConfigBuilder {
    pub fn broker_url(mut self, url: impl Into<String>) -> Self {
        self.config.broker_url = url.into();
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.config.session_id = session_id.into();
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.config.qos = qos;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn build(self) -> EndpointConfig {
        self.config
    }
}

fn generate_session_id() -> String {
    format!("client-{}", short_id())
}
