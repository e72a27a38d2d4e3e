//! Topic name and topic filter validation.

use crate::error::{ProtocolError, Result};

/// Topic level separator.
pub const SEPARATOR: char = '/';

/// Single-level wildcard.
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

/// Multi-level wildcard.
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Validate a topic name or filter against length and depth limits.
/// Zero-allocation on success, early-exits on depth violation.
#[inline]
pub fn validate_topic(topic: &[u8], max_length: usize, max_levels: usize) -> Result<()> {
    // Check length (0 = no limit)
    if max_length > 0 && topic.len() > max_length {
        return Err(ProtocolError::TopicTooLong {
            len: topic.len(),
            max: max_length,
        });
    }

    // Check levels with early exit (0 = no limit)
    if max_levels > 0 {
        let mut levels = 1usize;
        for &b in topic {
            if b == b'/' {
                levels += 1;
                if levels > max_levels {
                    return Err(ProtocolError::TopicTooDeep {
                        levels,
                        max: max_levels,
                    });
                }
            }
        }
    }

    Ok(())
}

/// Validate a PUBLISH topic name: non-empty, no wildcards, no NUL.
pub fn validate_topic_name(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.contains(['+', '#', '\0']) {
        return Err(ProtocolError::InvalidTopicName(topic.to_string()));
    }
    Ok(())
}

/// Validate a SUBSCRIBE topic filter.
///
/// `+` must occupy a whole level; `#` must occupy a whole level and be the
/// last one.
pub fn validate_topic_filter(filter: &str) -> Result<()> {
    if filter.is_empty() || filter.contains('\0') {
        return Err(ProtocolError::InvalidTopicFilter(filter.to_string()));
    }

    let mut levels = filter.split(SEPARATOR).peekable();
    while let Some(level) = levels.next() {
        let is_last = levels.peek().is_none();
        let valid = match level {
            MULTI_LEVEL_WILDCARD => is_last,
            SINGLE_LEVEL_WILDCARD => true,
            other => !other.contains(['+', '#']),
        };
        if !valid {
            return Err(ProtocolError::InvalidTopicFilter(filter.to_string()));
        }
    }
    Ok(())
}
