//! Named endpoints for a command surface
//!
//! Each operation takes a device id and forwards to that device's
//! [`Endpoint`]. Optional timeouts and QoS levels fall back to the registry's
//! base configuration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use courier_fabric::{MemoryBroker, QoS, TcpTransport, Transport};
use serde_json::Value;

use crate::config::EndpointConfig;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::handler::Handler;

/// Builds the transport for a newly created device
pub type TransportFactory = Arc<dyn Fn(&EndpointConfig) -> Arc<dyn Transport> + Send + Sync>;

/// Outcome of [`DeviceRegistry::create`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    /// A device with that id was already registered and is left untouched
    Existing,
}

pub struct DeviceRegistry {
    base: EndpointConfig,
    factory: TransportFactory,
    devices: Mutex<HashMap<String, Arc<Endpoint>>>,
}

impl DeviceRegistry {
    pub fn new<F>(base: EndpointConfig, factory: F) -> Self
    where
        F: Fn(&EndpointConfig) -> Arc<dyn Transport> + Send + Sync + 'static,
    {
        Self {
            base,
            factory: Arc::new(factory),
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Devices connect to `base.broker_url` over TCP
    pub fn tcp(base: EndpointConfig) -> Self {
        Self::new(base, |_| Arc::new(TcpTransport::new()))
    }

    /// Devices share an in-process broker
    pub fn memory(base: EndpointConfig, broker: MemoryBroker) -> Self {
        Self::new(base, move |_| Arc::new(broker.transport()))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Endpoint>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create and connect a device
    ///
    /// The device is only registered once connected, so a failed create leaves
    /// nothing behind.
    pub async fn create(&self, device_id: &str) -> Result<Registration> {
        if self.lock().contains_key(device_id) {
            return Ok(Registration::Existing);
        }

        let config = self.base.for_device(device_id);
        let transport = (self.factory)(&config);
        let endpoint = Arc::new(Endpoint::new(config, transport));
        endpoint.connect().await?;

        let raced = {
            let mut devices = self.lock();
            if devices.contains_key(device_id) {
                true
            } else {
                devices.insert(device_id.to_string(), Arc::clone(&endpoint));
                false
            }
        };
        if raced {
            // Another create won; drop our duplicate session
            let _ = endpoint.disconnect().await;
            return Ok(Registration::Existing);
        }

        tracing::info!(%device_id, session_id = %endpoint.session_id(), "device created");
        Ok(Registration::Created)
    }

    pub fn get(&self, device_id: &str) -> Result<Arc<Endpoint>> {
        self.lock()
            .get(device_id)
            .cloned()
            .ok_or_else(|| Error::UnknownDevice(device_id.to_string()))
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn publish(
        &self,
        device_id: &str,
        address: &str,
        payload: Value,
        qos: Option<QoS>,
    ) -> Result<()> {
        let endpoint = self.get(device_id)?;
        endpoint.publish(address, payload, qos.unwrap_or(self.base.qos));
        Ok(())
    }

    pub async fn publish_sync(
        &self,
        device_id: &str,
        address: &str,
        payload: Value,
        timeout: Option<Duration>,
        qos: Option<QoS>,
    ) -> Result<Value> {
        let endpoint = self.get(device_id)?;
        endpoint
            .publish_sync(
                address,
                payload,
                timeout.unwrap_or_else(|| self.base.default_timeout()),
                qos.unwrap_or(self.base.qos),
            )
            .await
    }

    pub fn register_handler(
        &self,
        device_id: &str,
        action: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<()> {
        self.get(device_id)?.register_handler(action, handler)
    }

    pub async fn subscribe_topic(
        &self,
        device_id: &str,
        topic: &str,
        qos: Option<QoS>,
    ) -> Result<()> {
        let endpoint = self.get(device_id)?;
        endpoint.subscribe(topic, qos.unwrap_or(self.base.qos)).await
    }

    /// Disconnect a device and forget it
    pub async fn remove(&self, device_id: &str) -> Result<()> {
        let endpoint = self
            .lock()
            .remove(device_id)
            .ok_or_else(|| Error::UnknownDevice(device_id.to_string()))?;
        endpoint.disconnect().await?;
        tracing::info!(%device_id, "device removed");
        Ok(())
    }
}
