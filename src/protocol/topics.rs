//! Topic canonicalization, wildcard matching and agent name validation
//!
//! Topics are slash-separated names without leading or trailing slashes
//! (`timon`, `workflow/instances/42`). Subscriptions may use MQTT-style
//! wildcards: `+` matches exactly one level, `#` matches any remaining levels
//! and must be the last level of the filter.

use thiserror::Error;

pub fn canonicalize_topic(topic: &str) -> String {
    topic
        .split('/')
        .filter(|level| !level.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Check whether `topic` is matched by the subscription `filter`
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// True if the topic contains a wildcard level
pub fn is_wildcard(topic: &str) -> bool {
    topic.split('/').any(|level| level == "+" || level == "#")
}

pub fn validate_topic_filter(filter: &str) -> Result<(), ValidationError> {
    if filter.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != levels.len() - 1) {
            return Err(ValidationError::InvalidWildcard(filter.to_string()));
        }
        if level.contains('+') && *level != "+" {
            return Err(ValidationError::InvalidWildcard(filter.to_string()));
        }
    }

    Ok(())
}

/// Topics published to must be concrete
pub fn validate_publish_topic(topic: &str) -> Result<(), ValidationError> {
    validate_topic_filter(topic)?;
    if is_wildcard(topic) {
        return Err(ValidationError::WildcardPublish(topic.to_string()));
    }
    Ok(())
}

pub fn validate_agent_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::EmptyAgentName);
    }

    for ch in name.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidAgentNameChar(ch));
        }
    }

    Ok(())
}

/// Validation errors for bus names
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Agent name cannot be empty")]
    EmptyAgentName,
    #[error("Agent name contains invalid character: '{0}'")]
    InvalidAgentNameChar(char),
    #[error("Topic cannot be empty")]
    EmptyTopic,
    #[error("Invalid wildcard usage in topic filter: {0}")]
    InvalidWildcard(String),
    #[error("Cannot publish to a wildcard topic: {0}")]
    WildcardPublish(String),
}
