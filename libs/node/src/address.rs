//! Dot addresses and the topics they map to
//!
//! Callers name a remote action as `target.action`; on the wire requests go to
//! `{target}/{action}` and replies to `{sender}/reply/{requestId}`.

use std::fmt;

use crate::error::{Error, Result};

pub const REPLY_SEGMENT: &str = "reply";

/// A parsed `target.action` address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub target: String,
    pub action: String,
}

impl Address {
    /// Split at the first `.`; both halves must be non-empty topic levels
    pub fn parse(address: &str) -> Result<Self> {
        let invalid = || Error::InvalidTopic(address.to_string());

        let (target, action) = address.split_once('.').ok_or_else(invalid)?;
        if !is_topic_level(target) || !is_topic_level(action) {
            return Err(invalid());
        }

        Ok(Self {
            target: target.to_string(),
            action: action.to_string(),
        })
    }

    /// Topic a request for this address is published on
    pub fn request_topic(&self) -> String {
        format!("{}/{}", self.target, self.action)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.action)
    }
}

/// Non-empty and free of separators and wildcards
pub(crate) fn is_topic_level(level: &str) -> bool {
    !level.is_empty() && !level.contains(['/', '+', '#'])
}

pub fn reply_topic(sender: &str, request_id: &str) -> String {
    format!("{sender}/{REPLY_SEGMENT}/{request_id}")
}

/// Filter for requests addressed to `device_id`
pub fn request_filter(device_id: &str) -> String {
    format!("{device_id}/+")
}

/// Filter for replies addressed to `device_id`
pub fn reply_filter(device_id: &str) -> String {
    format!("{device_id}/{REPLY_SEGMENT}/+")
}
