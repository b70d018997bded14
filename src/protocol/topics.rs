//! Topic construction and validation
//!
//! Topics are built as `<base_topic>/<segment>/<segment>...`. Publish targets
//! must be concrete topic names: no `+`/`#` wildcards and no `$`-prefixed
//! broker system topics. Subscription filters may use wildcards in the
//! positions MQTT allows.

use thiserror::Error;

/// Root of the canonical city topics shipped with the template
pub const CITY_ROOT_TOPIC: &str = "city";

/// MQTT limits topic names to a UTF-8 string of at most 65535 bytes
pub const MAX_TOPIC_BYTES: usize = 65_535;

/// Topic validation errors
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Topic segment {index} is empty")]
    EmptySegment { index: usize },
    #[error("Topic segment '{0}' must not contain '/'")]
    SegmentContainsSeparator(String),
    #[error("Publish topic '{0}' contains a wildcard ('+' or '#')")]
    Wildcard(String),
    #[error("Topic '{0}' is a broker system topic ('$' prefix)")]
    SystemTopic(String),
    #[error("Topic contains a NUL character")]
    NulCharacter,
    #[error("Topic is {0} bytes, maximum is 65535")]
    TooLong(usize),
    #[error("Invalid wildcard placement in filter '{0}'")]
    InvalidFilter(String),
}

/// Builds topics under a fixed base topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    base: String,
}

impl TopicBuilder {
    /// Trailing separators on the base are dropped
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Join the base with caller-supplied segments
    pub fn join<S: AsRef<str>>(&self, segments: &[S]) -> Result<String, TopicError> {
        build_topic(&self.base, segments)
    }

    /// Join and validate the result as a publish target
    pub fn publish_topic<S: AsRef<str>>(&self, segments: &[S]) -> Result<String, TopicError> {
        let topic = self.join(segments)?;
        validate_publish_topic(&topic)?;
        Ok(topic)
    }
}

/// Join `base` with `segments` using `/`
///
/// Every segment must be non-empty and a single topic level. An empty base
/// yields just the joined segments.
pub fn build_topic<S: AsRef<str>>(base: &str, segments: &[S]) -> Result<String, TopicError> {
    let mut topic = base.trim_end_matches('/').to_string();

    for (index, segment) in segments.iter().enumerate() {
        let segment = segment.as_ref();
        if segment.trim().is_empty() {
            return Err(TopicError::EmptySegment { index });
        }
        if segment.contains('/') {
            return Err(TopicError::SegmentContainsSeparator(segment.to_string()));
        }
        if !topic.is_empty() {
            topic.push('/');
        }
        topic.push_str(segment);
    }

    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    Ok(topic)
}

fn validate_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_BYTES {
        return Err(TopicError::TooLong(topic.len()));
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter);
    }
    Ok(())
}

/// Validate a concrete topic used as a publish (or checked-publish) target
pub fn validate_publish_topic(topic: &str) -> Result<(), TopicError> {
    validate_common(topic)?;
    if topic.contains('+') || topic.contains('#') {
        return Err(TopicError::Wildcard(topic.to_string()));
    }
    if topic.starts_with('$') {
        return Err(TopicError::SystemTopic(topic.to_string()));
    }
    Ok(())
}

/// Validate a subscription filter
///
/// `+` must occupy a whole level; `#` must occupy the last level.
pub fn validate_subscribe_filter(filter: &str) -> Result<(), TopicError> {
    validate_common(filter)?;
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;

    for (i, level) in levels.iter().enumerate() {
        let has_plus = level.contains('+');
        let has_hash = level.contains('#');
        if (has_plus && *level != "+") || (has_hash && (*level != "#" || i != last)) {
            return Err(TopicError::InvalidFilter(filter.to_string()));
        }
    }
    Ok(())
}

/// Canonical weather-state topic
pub fn weather_state_topic() -> String {
    format!("{CITY_ROOT_TOPIC}/weather/state")
}

/// Canonical weather-tick topic
pub fn weather_tick_topic() -> String {
    format!("{CITY_ROOT_TOPIC}/weather/tick")
}
