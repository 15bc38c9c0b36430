//! Topic conventions and wildcard pattern matching
//!
//! Patterns are compiled once into segments and matched segment by segment with
//! broker semantics:
//!
//! - `+` matches exactly one level
//! - `#` must be the last level and matches zero or more remaining levels, so
//!   `sensors/#` also matches the parent `sensors`
//! - wildcards in the first level never match topics that start with `$`
//!
//! Wildcards glued to other characters (`sensors#`, `a+/b`) are rejected when the
//! pattern is compiled instead of being matched loosely.

use std::fmt;

use thiserror::Error;

pub const COMMAND_PREFIX: &str = "comando";
pub const STATUS_ROOT: &str = "ac-control";
pub const LEGACY_DEVICE_PREFIX: &str = "dispositivos";

/// Pattern covering every device status topic
pub const STATUS_PATTERN: &str = "ac-control/+/+/status";

/// `comando/{device_id}`
pub fn command_topic(device_id: &str) -> String {
    format!("{}/{}", COMMAND_PREFIX, device_id)
}

/// `ac-control/{device_type}/{device_id}/status`
pub fn status_topic(device_type: &str, device_id: &str) -> String {
    format!("{}/{}/{}/status", STATUS_ROOT, device_type, device_id)
}

/// `dispositivos/{control_device_id}`, the older per-controller status topic
pub fn legacy_device_topic(control_device_id: &str) -> String {
    format!("{}/{}", LEGACY_DEVICE_PREFIX, control_device_id)
}

/// Device key `"{type}/{id}"` taken from the second and third topic levels
pub fn device_key(topic: &str) -> Option<String> {
    let mut levels = topic.split('/').skip(1);
    match (levels.next(), levels.next()) {
        (Some(kind), Some(id)) if !kind.is_empty() && !id.is_empty() => {
            Some(format!("{}/{}", kind, id))
        }
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic pattern is empty")]
    Empty,

    #[error("wildcard must occupy a whole level in '{pattern}' (level {level})")]
    EmbeddedWildcard { pattern: String, level: usize },

    #[error("'#' must be the last level in '{0}'")]
    HashNotLast(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    Literal(String),
    Single,
    Multi,
}

/// A compiled subscription pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    levels: Vec<Level>,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, TopicError> {
        if pattern.is_empty() {
            return Err(TopicError::Empty);
        }

        let parts: Vec<&str> = pattern.split('/').collect();
        let last = parts.len() - 1;
        let mut levels = Vec::with_capacity(parts.len());

        for (index, part) in parts.into_iter().enumerate() {
            let level = match part {
                "+" => Level::Single,
                "#" if index == last => Level::Multi,
                "#" => return Err(TopicError::HashNotLast(pattern.to_string())),
                literal if literal.contains(['+', '#']) => {
                    return Err(TopicError::EmbeddedWildcard {
                        pattern: pattern.to_string(),
                        level: index,
                    })
                }
                literal => Level::Literal(literal.to_string()),
            };
            levels.push(level);
        }

        Ok(Self {
            raw: pattern.to_string(),
            levels,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn has_wildcards(&self) -> bool {
        self.levels
            .iter()
            .any(|level| !matches!(level, Level::Literal(_)))
    }

    pub fn matches(&self, topic: &str) -> bool {
        if topic.starts_with('$') && !matches!(self.levels.first(), Some(Level::Literal(_))) {
            return false;
        }

        let mut parts = topic.split('/');
        for level in &self.levels {
            match level {
                Level::Multi => return true,
                Level::Single => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
                Level::Literal(expected) => match parts.next() {
                    Some(part) if part == expected => {}
                    _ => return false,
                },
            }
        }
        parts.next().is_none()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for TopicPattern {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
