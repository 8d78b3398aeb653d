//! Hierarchical topic pattern matching.
//!
//! Topics are dot-separated segment paths (`user.profile.updated`). A
//! pattern matches segment-wise: a literal segment matches itself, `*`
//! matches exactly one segment of any value, and `#` matches zero or more
//! trailing segments and must be the final token.

use serde::{Deserialize, Serialize};

use crate::error::{BusError, BusResult};

/// One parsed pattern segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Segment {
    Literal(String),
    Single,
    Rest,
}

/// A validated topic pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Parse and validate a pattern.
    ///
    /// Fails with `InvalidTopicPattern` on an empty pattern, an empty
    /// segment (`user..created`), or a `#` that is not the last token.
    pub fn parse(pattern: &str) -> BusResult<Self> {
        if pattern.is_empty() {
            return Err(BusError::InvalidTopicPattern("empty pattern".into()));
        }

        let raw_segments: Vec<&str> = pattern.split('.').collect();
        let mut segments = Vec::with_capacity(raw_segments.len());

        for (i, seg) in raw_segments.iter().enumerate() {
            match *seg {
                "" => {
                    return Err(BusError::InvalidTopicPattern(format!(
                        "empty segment in '{pattern}'"
                    )))
                }
                "#" => {
                    if i != raw_segments.len() - 1 {
                        return Err(BusError::InvalidTopicPattern(format!(
                            "'#' must be the last token in '{pattern}'"
                        )));
                    }
                    segments.push(Segment::Rest);
                }
                "*" => segments.push(Segment::Single),
                literal => segments.push(Segment::Literal(literal.to_string())),
            }
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// The pattern as originally written
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the pattern contains no wildcards
    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Match a topic against this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        if topic.is_empty() {
            return false;
        }
        let topic_segments: Vec<&str> = topic.split('.').collect();

        let mut ti = 0;
        for segment in &self.segments {
            match segment {
                Segment::Rest => return true,
                Segment::Single => {
                    if ti >= topic_segments.len() {
                        return false;
                    }
                    ti += 1;
                }
                Segment::Literal(lit) => {
                    if ti >= topic_segments.len() || topic_segments[ti] != lit {
                        return false;
                    }
                    ti += 1;
                }
            }
        }
        ti == topic_segments.len()
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Validate a concrete (wildcard-free) topic name.
///
/// Publishable topics must be non-empty, contain no empty segments and no
/// wildcard tokens.
pub fn validate_topic(topic: &str) -> BusResult<()> {
    if topic.is_empty() {
        return Err(BusError::InvalidTopicPattern("empty topic".into()));
    }
    for seg in topic.split('.') {
        match seg {
            "" => {
                return Err(BusError::InvalidTopicPattern(format!(
                    "empty segment in '{topic}'"
                )))
            }
            "*" | "#" => {
                return Err(BusError::InvalidTopicPattern(format!(
                    "wildcard in concrete topic '{topic}'"
                )))
            }
            _ => {}
        }
    }
    Ok(())
}
