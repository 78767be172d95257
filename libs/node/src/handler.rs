use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt;
use serde_json::Value;

use crate::address::is_topic_level;
use crate::envelope::{error_payload, Envelope};

/// Serves one action
///
/// Implemented for any `Fn(Envelope) -> impl Future<Output = anyhow::Result<Value>>`;
/// [`handler_fn`] boxes such a closure.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<Value>;
}

#[async_trait::async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<Value> {
        (self)(envelope).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(f)
}

/// Action name to handler; registering an action again replaces its handler
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    /// Valid action names are single non-empty topic levels
    pub fn is_valid_action(action: &str) -> bool {
        is_topic_level(action)
    }

    /// Returns `false` (and registers nothing) for an invalid action name
    pub fn insert(&self, action: &str, handler: Arc<dyn Handler>) -> bool {
        if !Self::is_valid_action(action) {
            return false;
        }
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(action.to_string(), handler);
        true
    }

    pub fn get(&self, action: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(action)
            .cloned()
    }

    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        actions.sort();
        actions
    }
}

/// Run `handler`, turning a failure or panic into an `{"error": ...}` payload
pub async fn invoke(handler: Arc<dyn Handler>, envelope: Envelope) -> Value {
    match AssertUnwindSafe(handler.handle(envelope)).catch_unwind().await {
        Ok(Ok(payload)) => payload,
        Ok(Err(e)) => error_payload(e.to_string()),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            error_payload(message)
        }
    }
}

/// Reply payload for an action nobody registered
pub fn no_handler_payload(action: &str) -> Value {
    error_payload(format!("no handler for action: {action}"))
}
