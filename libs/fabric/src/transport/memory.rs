use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::broker::{authenticate, lock, SessionKey, SubscriptionTable};
use crate::error::{Error, Result};
use crate::qos::QoS;
use crate::topic;
use crate::transport::{ConnectOptions, Credentials, Inbound, Transport};

/// In-process broker shared by any number of [`MemoryTransport`]s
///
/// Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    credentials: Option<Arc<Credentials>>,
    table: Arc<Mutex<SubscriptionTable>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require every session to present these credentials
    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            credentials: Some(Arc::new(credentials)),
            ..Self::default()
        }
    }

    /// Create a transport attached to this broker
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport::new(self.clone())
    }

    /// Number of open sessions
    pub fn session_count(&self) -> usize {
        lock(&self.table).len()
    }

    /// Publish directly into the broker, bypassing any session
    ///
    /// Returns the number of sessions the message reached.
    pub fn inject(&self, topic_name: &str, payload: &[u8]) -> usize {
        lock(&self.table).route(topic_name, payload)
    }
}

/// Transport whose sessions live inside a [`MemoryBroker`]
pub struct MemoryTransport {
    broker: MemoryBroker,
    session: Mutex<Option<SessionKey>>,
}

impl MemoryTransport {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            session: Mutex::new(None),
        }
    }

    fn session(&self) -> Result<SessionKey> {
        let session = *self.session.lock().unwrap_or_else(PoisonError::into_inner);
        match session {
            Some(key) if lock(&self.broker.table).contains(key) => Ok(key),
            _ => Err(Error::NotConnected),
        }
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<Inbound> {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if session.is_some() {
            return Err(Error::custom("session already open"));
        }

        authenticate(
            self.broker.credentials.as_deref(),
            options.credentials.as_ref(),
        )?;

        let (sender, inbound) = mpsc::unbounded_channel();
        let key = lock(&self.broker.table).open(&options.session_id, sender);
        *session = Some(key);
        tracing::debug!(session_id = %options.session_id, "memory session opened");
        Ok(inbound)
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        let key = self.session()?;
        lock(&self.broker.table).subscribe(key, filter, qos)
    }

    fn publish(&self, topic_name: &str, payload: Vec<u8>, _qos: QoS) -> Result<()> {
        topic::validate_topic(topic_name)?;
        self.session()?;
        lock(&self.broker.table).route(topic_name, &payload);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let key = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(key) = key {
            lock(&self.broker.table).close(key);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session().is_ok()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let key = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(key) = key {
            lock(&self.broker.table).close(key);
        }
    }
}
