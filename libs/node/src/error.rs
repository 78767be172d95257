use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid topic {0:?}: expected \"targetDeviceId.action\"")]
    InvalidTopic(String),

    #[error("Invalid action name {0:?}")]
    InvalidAction(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Subscription to {topic:?} failed: {source}")]
    Subscription {
        topic: String,
        #[source]
        source: courier_fabric::Error,
    },

    #[error("[{device_id}] Request timeout for {request_id}")]
    Timeout {
        device_id: String,
        request_id: String,
    },

    /// The remote handler failed, or its reply carried an error
    #[error("{0}")]
    Remote(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Transport error: {0}")]
    Transport(#[from] courier_fabric::Error),

    #[error("Device {0} does not exist, create it first")]
    UnknownDevice(String),
}

pub type Result<T> = std::result::Result<T, Error>;
