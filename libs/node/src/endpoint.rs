use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use courier_fabric::{Codec, Inbound, InboundMessage, JsonCodec, QoS, Transport};
use futures::FutureExt;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::address::{self, is_topic_level, Address, REPLY_SEGMENT};
use crate::config::EndpointConfig;
use crate::envelope::{error_message, Envelope};
use crate::error::{Error, Result};
use crate::handler::{handler_fn, invoke, no_handler_payload, Handler, HandlerRegistry};
use crate::pending::PendingRequests;

/// Each connect attempt gets its own number so a stale router or a cancelled
/// attempt never touches a newer session
enum State {
    Disconnected,
    Connecting { attempt: u64 },
    Connected { attempt: u64, router: JoinHandle<()> },
}

struct Inner {
    config: EndpointConfig,
    transport: Arc<dyn Transport>,
    pending: PendingRequests,
    handlers: HandlerRegistry,
    state: Mutex<State>,
    attempts: AtomicU64,
}

/// One logical device on the bus
///
/// Serves registered actions on `{device_id}/{action}` and issues requests to
/// other devices, correlating their replies on `{device_id}/reply/{requestId}`.
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl Endpoint {
    pub fn new(config: EndpointConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: PendingRequests::new(&config.device_id),
                handlers: HandlerRegistry::default(),
                state: Mutex::new(State::Disconnected),
                attempts: AtomicU64::new(0),
                config,
                transport,
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.inner.config.device_id
    }

    pub fn session_id(&self) -> &str {
        &self.inner.config.session_id
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Number of calls still waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Registered action names, sorted
    pub fn actions(&self) -> Vec<String> {
        self.inner.handlers.actions()
    }

    /// Open the transport session and subscribe to this device's request and
    /// reply topics
    #[tracing::instrument(skip(self), fields(device_id = %self.device_id(), session_id = %self.session_id()))]
    pub async fn connect(&self) -> Result<()> {
        if !is_topic_level(self.device_id()) {
            return Err(Error::Connection(format!(
                "invalid device id {:?}",
                self.device_id()
            )));
        }

        let attempt = self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.inner.lock_state();
            match *state {
                State::Disconnected => *state = State::Connecting { attempt },
                State::Connecting { .. } => {
                    return Err(Error::Connection("connect already in progress".to_string()))
                }
                State::Connected { .. } => {
                    return Err(Error::Connection("already connected".to_string()))
                }
            }
        }

        let result = self.open_session(attempt).await;
        let cancelled = {
            let mut state = self.inner.lock_state();
            let current = matches!(*state, State::Connecting { attempt: a } if a == attempt);
            match result {
                Ok(router) if current => {
                    *state = State::Connected { attempt, router };
                    tracing::info!("connected");
                    return Ok(());
                }
                Ok(router) => router,
                Err(e) => {
                    if current {
                        *state = State::Disconnected;
                    }
                    tracing::warn!(error = %e, "connect failed");
                    return Err(e);
                }
            }
        };

        // disconnect() ran, or the session died, while it was being opened
        cancelled.abort();
        let _ = self.inner.transport.disconnect().await;
        tracing::info!("connect cancelled");
        Err(Error::ConnectionClosed)
    }

    async fn open_session(&self, attempt: u64) -> Result<JoinHandle<()>> {
        let transport = &self.inner.transport;
        let inbound = transport
            .connect(&self.inner.config.connect_options())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let filters = [
            address::request_filter(self.device_id()),
            address::reply_filter(self.device_id()),
        ];
        for filter in &filters {
            if let Err(e) = transport.subscribe(filter, self.inner.config.qos).await {
                let _ = transport.disconnect().await;
                return Err(Error::Connection(format!("subscribing to {filter}: {e}")));
            }
        }

        Ok(tokio::spawn(run_router(
            Arc::clone(&self.inner),
            inbound,
            attempt,
        )))
    }

    /// Close the session
    ///
    /// Calls still waiting for a reply fail with [`Error::ConnectionClosed`].
    /// A connect still in progress is cancelled and fails with the same error.
    /// Disconnecting an endpoint that is not connected does nothing.
    #[tracing::instrument(skip(self), fields(device_id = %self.device_id()))]
    pub async fn disconnect(&self) -> Result<()> {
        let router = {
            let mut state = self.inner.lock_state();
            match std::mem::replace(&mut *state, State::Disconnected) {
                State::Connected { router, .. } => router,
                State::Connecting { .. } => {
                    tracing::info!("cancelling connect in progress");
                    return Ok(());
                }
                State::Disconnected => return Ok(()),
            }
        };

        let result = self.inner.transport.disconnect().await;
        router.abort();
        let failed = self.inner.pending.fail_all(|| Error::ConnectionClosed);
        tracing::info!(failed, "disconnected");
        result.map_err(|e| Error::Connection(e.to_string()))
    }

    /// Subscribe to an additional topic filter
    #[tracing::instrument(skip(self), fields(device_id = %self.device_id()))]
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        let subscription_error = |source| Error::Subscription {
            topic: topic.to_string(),
            source,
        };

        if !self.is_connected() {
            return Err(subscription_error(courier_fabric::Error::NotConnected));
        }
        self.inner
            .transport
            .subscribe(topic, qos)
            .await
            .map_err(subscription_error)?;
        tracing::info!("subscribed");
        Ok(())
    }

    /// Fire-and-forget request to `target.action`
    ///
    /// There is no failure path: an invalid address, a disconnected endpoint
    /// or a transport error is logged and the message is dropped.
    pub fn publish(&self, address: &str, payload: Value, qos: QoS) {
        let address = match Address::parse(address) {
            Ok(address) => address,
            Err(e) => {
                tracing::warn!(device_id = %self.device_id(), error = %e, "not publishing");
                return;
            }
        };

        let envelope = Envelope::new(self.device_id(), payload);
        let topic = address.request_topic();
        match self.inner.send(&topic, &envelope, qos) {
            Ok(()) => tracing::debug!(
                device_id = %self.device_id(),
                %topic,
                request_id = %envelope.request_id,
                "published"
            ),
            Err(e) => tracing::warn!(
                device_id = %self.device_id(),
                %topic,
                error = %e,
                "publish failed"
            ),
        }
    }

    /// Request to `target.action`, resolving with the reply payload
    ///
    /// Fails with [`Error::Timeout`] when no reply arrives in time and with
    /// [`Error::Remote`] when the reply carries an error.
    #[tracing::instrument(skip(self, payload), fields(device_id = %self.device_id()))]
    pub async fn publish_sync(
        &self,
        address: &str,
        payload: Value,
        timeout: Duration,
        qos: QoS,
    ) -> Result<Value> {
        let address = Address::parse(address)?;
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let envelope = Envelope::new(self.device_id(), payload);
        let bytes = JsonCodec
            .encode(&envelope)
            .map_err(|e| Error::Encode(e.to_string()))?;
        let request_id = envelope.request_id;
        let topic = address.request_topic();

        let completion = self.inner.pending.register(&request_id, timeout);
        if let Err(e) = self.inner.transport.publish(&topic, bytes, qos) {
            self.inner.pending.discard(&request_id);
            return Err(e.into());
        }
        tracing::debug!(%topic, %request_id, "request published");

        completion.await.unwrap_or(Err(Error::ConnectionClosed))
    }

    /// Serve `action` with a closure, replacing any previous handler
    ///
    /// An invalid action name is logged and rejected without touching the
    /// registered handlers.
    pub fn proc<F, Fut>(&self, action: &str, handler: F) -> Result<()>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register_handler(action, handler_fn(handler))
    }

    /// Serve `action` with a [`Handler`], replacing any previous handler
    pub fn register_handler(&self, action: &str, handler: Arc<dyn Handler>) -> Result<()> {
        if !self.inner.handlers.insert(action, handler) {
            tracing::warn!(
                device_id = %self.device_id(),
                %action,
                "action must be a non-empty name without '/', '+' or '#'"
            );
            return Err(Error::InvalidAction(action.to_string()));
        }
        tracing::debug!(device_id = %self.device_id(), %action, "handler registered");
        Ok(())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let State::Connected { router, .. } = &*self.inner.lock_state() {
            router.abort();
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_connected(&self) -> bool {
        matches!(*self.lock_state(), State::Connected { .. }) && self.transport.is_connected()
    }

    /// The transport gave up on the session without a disconnect() call
    fn session_ended(&self, attempt: u64) {
        {
            let mut state = self.lock_state();
            match *state {
                State::Connecting { attempt: current } | State::Connected { attempt: current, .. }
                    if current == attempt =>
                {
                    *state = State::Disconnected;
                }
                _ => return,
            }
        }
        let failed = self.pending.fail_all(|| Error::ConnectionClosed);
        tracing::warn!(device_id = %self.config.device_id, failed, "session lost");
    }

    fn send(&self, topic: &str, envelope: &Envelope, qos: QoS) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let bytes = JsonCodec
            .encode(envelope)
            .map_err(|e| Error::Encode(e.to_string()))?;
        self.transport.publish(topic, bytes, qos)?;
        Ok(())
    }

    fn route(self: &Arc<Self>, message: InboundMessage) {
        let device_id = self.config.device_id.as_str();
        let topic = message.topic.as_str();

        let mut levels = topic.split('/');
        if levels.next() != Some(device_id) {
            tracing::trace!(%device_id, %topic, "not addressed to this device");
            return;
        }
        let second = levels.next();
        let third = levels.next();

        let value: Value = match JsonCodec.decode(&message.payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(%device_id, %topic, error = %e, "discarding undecodable message");
                return;
            }
        };

        match (second, third) {
            (Some(REPLY_SEGMENT), Some(id)) if !id.is_empty() => self.complete(value),
            (Some(action), _) if !action.is_empty() => self.dispatch(action, value),
            _ => tracing::debug!(%device_id, %topic, "no action in topic"),
        }
    }

    /// Replies are matched on `requestId` alone
    fn complete(&self, value: Value) {
        let device_id = self.config.device_id.as_str();
        let Value::Object(mut reply) = value else {
            tracing::warn!(%device_id, "discarding reply that is not an object");
            return;
        };
        let Some(Value::String(request_id)) = reply.remove("requestId") else {
            tracing::warn!(%device_id, "discarding reply without requestId");
            return;
        };
        let payload = reply.remove("payload").unwrap_or(Value::Null);

        let outcome = match error_message(&payload) {
            Some(message) => Err(Error::Remote(message)),
            None => Ok(payload),
        };
        if !self.pending.resolve(&request_id, outcome) {
            tracing::debug!(%device_id, %request_id, "no pending request for reply");
        }
    }

    /// Handlers are invoked on the router task in arrival order and run up to
    /// their first suspension point there; the remainder continues on its own
    /// task so a handler may await requests of its own
    fn dispatch(self: &Arc<Self>, action: &str, value: Value) {
        let envelope = Envelope::from_inbound(value);
        let handler = self.handlers.get(action);
        let inner = Arc::clone(self);
        let action = action.to_string();

        let mut serving = Box::pin(async move { inner.serve(action, handler, envelope).await });
        if (&mut serving).now_or_never().is_none() {
            tokio::spawn(serving);
        }
    }

    async fn serve(&self, action: String, handler: Option<Arc<dyn Handler>>, request: Envelope) {
        let device_id = self.config.device_id.as_str();
        let request_id = request.request_id.clone();
        let sender = request.from.clone();
        let replyable = request.is_replyable();

        let payload = match handler {
            Some(handler) => {
                tracing::debug!(%device_id, %action, %request_id, %sender, "dispatching");
                invoke(handler, request).await
            }
            None => {
                tracing::debug!(%device_id, %action, "no handler for action");
                no_handler_payload(&action)
            }
        };

        if !replyable {
            tracing::debug!(%device_id, %action, "message had no sender, not replying");
            return;
        }
        if !self.is_connected() {
            tracing::debug!(%device_id, %action, "disconnected before reply");
            return;
        }

        let reply = Envelope {
            request_id,
            from: self.config.device_id.clone(),
            payload,
        };
        let topic = address::reply_topic(&sender, &reply.request_id);
        if let Err(e) = self.send(&topic, &reply, self.config.qos) {
            tracing::warn!(%device_id, %topic, error = %e, "reply failed");
        }
    }
}

async fn run_router(inner: Arc<Inner>, mut inbound: Inbound, attempt: u64) {
    while let Some(message) = inbound.recv().await {
        inner.route(message);
    }
    tracing::debug!(device_id = %inner.config.device_id, "inbound stream closed");
    inner.session_ended(attempt);
}
