//! Topic pattern grammar and matching.
//!
//! Topics are `/`-separated segments.  Patterns may use two wildcards:
//! - `+` matches exactly one segment at its position;
//! - `#` matches one or more trailing segments and must be the last segment.
//!
//! The matcher is a free function so the rules are testable in isolation
//! from the broker's subscription tables.

use crate::BusError;

/// Does `pattern` match `topic` under the wildcard rules?
///
/// A pattern without wildcards matches only a segment-wise equal topic.
/// `#` requires at least one topic segment at its position.
pub fn pattern_matches(pattern: &str, topic: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();

    for (i, part) in pattern_parts.iter().enumerate() {
        match *part {
            "#" => return i < topic_parts.len(),
            "+" => {
                if i >= topic_parts.len() {
                    return false;
                }
            }
            literal => {
                if i >= topic_parts.len() || literal != topic_parts[i] {
                    return false;
                }
            }
        }
    }

    pattern_parts.len() == topic_parts.len()
}

/// Validate a pattern at subscription time.
///
/// Wildcards must occupy whole segments and `#` may only appear as the
/// final segment.
pub fn validate_pattern(pattern: &str) -> Result<(), BusError> {
    let invalid = |reason: &str| BusError::InvalidPattern {
        pattern: pattern.to_owned(),
        reason: reason.to_owned(),
    };

    if pattern.is_empty() {
        return Err(invalid("empty pattern"));
    }

    let parts: Vec<&str> = pattern.split('/').collect();
    for (i, part) in parts.iter().enumerate() {
        if *part == "#" && i != parts.len() - 1 {
            return Err(invalid("'#' must be the last segment"));
        }
        if part.len() > 1 && (part.contains('+') || part.contains('#')) {
            return Err(invalid("wildcards must occupy a whole segment"));
        }
    }

    Ok(())
}
