//! MQTT-style topic filters
//!
//! Levels are separated by `/`. A `+` level matches exactly one level and a
//! trailing `#` level matches the rest of the topic, including nothing.

use crate::error::{Error, Result};

pub const LEVEL_SEPARATOR: char = '/';
pub const SINGLE_LEVEL_WILDCARD: &str = "+";
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Check that a subscription filter is well formed
pub fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(Error::InvalidFilter("filter is empty".to_string()));
    }

    let levels: Vec<&str> = filter.split(LEVEL_SEPARATOR).collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != MULTI_LEVEL_WILDCARD || i != last) {
            return Err(Error::InvalidFilter(format!(
                "'#' must be the whole final level in {filter:?}"
            )));
        }
        if level.contains('+') && *level != SINGLE_LEVEL_WILDCARD {
            return Err(Error::InvalidFilter(format!(
                "'+' must be a whole level in {filter:?}"
            )));
        }
    }
    Ok(())
}

/// Check that a concrete topic can be published to (no wildcards)
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::InvalidFilter("topic is empty".to_string()));
    }
    if topic.contains(['+', '#']) {
        return Err(Error::InvalidFilter(format!(
            "wildcards are not allowed in published topic {topic:?}"
        )));
    }
    Ok(())
}

/// Whether `topic` is matched by `filter`
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split(LEVEL_SEPARATOR);
    let mut topic_levels = topic.split(LEVEL_SEPARATOR);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_topics_match() {
        assert!(matches("bob/ping", "bob/ping"));
        assert!(!matches("bob/ping", "bob/pong"));
        assert!(!matches("bob/ping", "bob/ping/extra"));
        assert!(!matches("bob/ping/extra", "bob/ping"));
    }

    #[test]
    fn single_level_wildcard_matches_one_level() {
        assert!(matches("bob/+", "bob/ping"));
        assert!(matches("bob/reply/+", "bob/reply/1234"));
        assert!(!matches("bob/+", "bob/reply/1234"));
        assert!(!matches("bob/+", "alice/ping"));
        assert!(!matches("bob/+", "bob"));
    }

    #[test]
    fn multi_level_wildcard_matches_remainder() {
        assert!(matches("#", "anything/at/all"));
        assert!(matches("bob/#", "bob/reply/1234"));
        assert!(matches("bob/#", "bob"));
        assert!(!matches("bob/#", "alice/ping"));
    }

    #[test]
    fn filter_validation() {
        assert!(validate_filter("bob/+").is_ok());
        assert!(validate_filter("bob/reply/+").is_ok());
        assert!(validate_filter("#").is_ok());
        assert!(validate_filter("").is_err());
        assert!(validate_filter("bob/#/more").is_err());
        assert!(validate_filter("bob/ping#").is_err());
        assert!(validate_filter("bob/p+").is_err());
    }

    #[test]
    fn topic_validation_rejects_wildcards() {
        assert!(validate_topic("bob/ping").is_ok());
        assert!(validate_topic("bob/+").is_err());
        assert!(validate_topic("").is_err());
    }
}
