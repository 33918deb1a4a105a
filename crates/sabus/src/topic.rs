//! Topic filter matching and the `<prefix>/<module>/<category>` namespace.

use thiserror::Error;

/// Matches exactly one segment.
pub const SINGLE_LEVEL: &str = "+";
/// Matches the rest of the topic, including nothing.
pub const MULTI_LEVEL: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic filter is empty")]
    EmptyFilter,

    #[error("'#' must be the whole final segment of filter '{0}'")]
    MisplacedMultiLevel(String),

    #[error("'+' must be a whole segment in filter '{0}'")]
    MisplacedSingleLevel(String),

    #[error("topic is empty")]
    EmptyTopic,

    #[error("topic '{0}' contains a wildcard")]
    WildcardInTopic(String),
}

/// Match a concrete topic against a subscription filter.
///
/// Segments are compared in lock-step. `#` accepts whatever remains, `+`
/// accepts any single non-empty segment, anything else must be equal. Both
/// sides must run out together unless a `#` ended the walk.
pub fn matches(topic: &str, filter: &str) -> bool {
    let mut topic_segments = topic.split('/');

    for pattern in filter.split('/') {
        if pattern == MULTI_LEVEL {
            return true;
        }

        let Some(segment) = topic_segments.next() else {
            return false;
        };

        if pattern == SINGLE_LEVEL {
            if segment.is_empty() {
                return false;
            }
        } else if pattern != segment {
            return false;
        }
    }

    topic_segments.next().is_none()
}

/// Reject filters a broker would refuse.
pub fn validate_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::EmptyFilter);
    }

    let segments: Vec<&str> = filter.split('/').collect();
    let last = segments.len() - 1;
    for (i, segment) in segments.iter().enumerate() {
        if segment.contains('#') && (*segment != MULTI_LEVEL || i != last) {
            return Err(TopicError::MisplacedMultiLevel(filter.to_string()));
        }
        if segment.contains('+') && *segment != SINGLE_LEVEL {
            return Err(TopicError::MisplacedSingleLevel(filter.to_string()));
        }
    }
    Ok(())
}

/// Reject topics that cannot be published to.
pub fn validate_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInTopic(topic.to_string()));
    }
    Ok(())
}

/// `<prefix>/<module>/<category>`
pub fn module_topic(prefix: &str, module: &str, category: &str) -> String {
    format!("{}/{}/{}", prefix, module, category)
}

/// `<prefix>/sys/health`, where heartbeats go.
pub fn health_topic(prefix: &str) -> String {
    format!("{}/sys/health", prefix)
}

/// `<prefix>/<module>/cmd/#`, every command addressed to a module.
pub fn command_filter(prefix: &str, module: &str) -> String {
    format!("{}/{}/cmd/{}", prefix, module, MULTI_LEVEL)
}
