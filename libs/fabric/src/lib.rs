//! Courier Fabric - publish/subscribe transport layer
//!
//! Provides the [`Transport`] abstraction consumed by request/reply endpoints,
//! MQTT-style topic filters, QoS levels, a JSON payload codec, and two
//! transports: an in-process broker and a framed-TCP client with a matching
//! broker.
//!
//! # Example
//!
//! ```no_run
//! use courier_fabric::{
//!     ConnectOptions, QoS, ReconnectPolicy, TcpBroker, TcpTransport, Transport,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = TcpBroker::bind("127.0.0.1:0".parse()?).await?;
//! let url = broker.url()?;
//! tokio::spawn(broker.run());
//!
//! let transport = TcpTransport::new();
//! let mut inbound = transport
//!     .connect(&ConnectOptions {
//!         broker_url: url,
//!         session_id: "client-1".to_string(),
//!         credentials: None,
//!         reconnect: ReconnectPolicy::default(),
//!     })
//!     .await?;
//! transport.subscribe("bob/+", QoS::AtMostOnce).await?;
//! transport.publish("bob/ping", b"{}".to_vec(), QoS::AtMostOnce)?;
//! let message = inbound.recv().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod codec;
pub mod error;
pub mod frame;
pub mod qos;
pub mod topic;
pub mod transport;

// Re-exports for convenience
pub use broker::TcpBroker;
pub use codec::{Codec, JsonCodec};
pub use error::{Error, Result};
pub use qos::QoS;
pub use transport::{
    ConnectOptions, Credentials, Inbound, InboundMessage, MemoryBroker, MemoryTransport,
    ReconnectPolicy, TcpTransport, Transport,
};
