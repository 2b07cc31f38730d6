//! Topic name and filter validation
//!
//! - Topic names (PUBLISH) must not contain wildcards
//! - Topic filters (SUBSCRIBE) may contain wildcards
//! - `#` must be the last level and occupy the whole level
//! - `+` must occupy the whole level

/// Validate a topic name used for publishing
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    validate_common(topic)?;

    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Validate a topic filter used for subscribing
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    validate_common(filter)?;

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;

    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') {
            if *level != "#" {
                return Err("multi-level wildcard must occupy an entire level");
            }
            if index != last {
                return Err("multi-level wildcard must be the last level");
            }
        }
        if level.contains('+') && *level != "+" {
            return Err("single-level wildcard must occupy an entire level");
        }
    }

    Ok(())
}

fn validate_common(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic cannot be empty");
    }

    if topic.len() > 65535 {
        return Err("topic exceeds maximum length");
    }

    if topic.contains('\0') {
        return Err("topic cannot contain null character");
    }

    Ok(())
}
