//! Topic name and filter validation
//!
//! - Topic names (PUBLISH) must not contain wildcards
//! - Topic filters (SUBSCRIBE/UNSUBSCRIBE) may contain wildcards
//! - `#` must be the last level and occupy it entirely
//! - `+` must occupy an entire level

/// Longest topic a two-byte length prefix can carry
const MAX_TOPIC_LEN: usize = 65535;

/// True when the topic contains `+` or `#`
pub fn has_wildcards(topic: &str) -> bool {
    topic.contains('+') || topic.contains('#')
}

/// Validate a topic name (used in PUBLISH and the will)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }

    if topic.len() > MAX_TOPIC_LEN {
        return Err("topic name exceeds maximum length");
    }

    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }

    if has_wildcards(topic) {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }

    if filter.len() > MAX_TOPIC_LEN {
        return Err("topic filter exceeds maximum length");
    }

    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if levels.peek().is_some() {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}
