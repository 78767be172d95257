//! Courier Node - request/reply endpoints over publish/subscribe
//!
//! An [`Endpoint`] owns one logical device id. It can fire-and-forget
//! messages to `target.action`, make calls that resolve with the target's
//! reply (or time out), and serve actions of its own through registered
//! handlers. The [`DeviceRegistry`] keeps endpoints by id for a command
//! surface.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use courier_fabric::{MemoryBroker, QoS};
//! use courier_node::{Endpoint, EndpointConfig};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = MemoryBroker::new();
//!
//! let bob = Endpoint::new(EndpointConfig::new("bob"), Arc::new(broker.transport()));
//! bob.connect().await?;
//! bob.proc("ping", |msg| async move { Ok(json!({ "pong": msg.payload["n"] })) })?;
//!
//! let alice = Endpoint::new(EndpointConfig::new("alice"), Arc::new(broker.transport()));
//! alice.connect().await?;
//! let reply = alice
//!     .publish_sync("bob.ping", json!({ "n": 1 }), Duration::from_secs(2), QoS::AtMostOnce)
//!     .await?;
//! assert_eq!(reply, json!({ "pong": 1 }));
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod config;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod pending;
pub mod registry;

// Re-exports for convenience
pub use address::Address;
pub use config::EndpointConfig;
pub use endpoint::Endpoint;
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use handler::{handler_fn, Handler};
pub use registry::{DeviceRegistry, Registration};
