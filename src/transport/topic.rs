//! Topic pattern matching
//!
//! Patterns use a single-level wildcard `+`: one `+` segment matches
//! exactly one topic segment. There is no multi-level wildcard; a pattern
//! and a topic must have the same segment count to match.

/// A subscription pattern split into segments at construction time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

impl TopicPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        let raw = pattern.into();
        let segments = raw
            .split('/')
            .map(|s| {
                if s == "+" {
                    Segment::Wildcard
                } else {
                    Segment::Literal(s.to_string())
                }
            })
            .collect();
        Self { raw, segments }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether a concrete topic matches this pattern
    pub fn matches(&self, topic: &str) -> bool {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() != self.segments.len() {
            return false;
        }
        self.segments.iter().zip(parts).all(|(seg, part)| match seg {
            Segment::Wildcard => true,
            Segment::Literal(lit) => lit == part,
        })
    }

    /// The topic segment captured by the first wildcard, or `None` when
    /// the topic does not match this pattern.
    ///
    /// Handlers use this to recover the device id from
    /// `{root}/{deviceId}/telemetry`-shaped topics.
    pub fn capture<'t>(&self, topic: &'t str) -> Option<&'t str> {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut captured = None;
        for (seg, part) in self.segments.iter().zip(parts) {
            match seg {
                Segment::Wildcard => {
                    if captured.is_none() {
                        captured = Some(part);
                    }
                }
                Segment::Literal(lit) => {
                    if lit.as_str() != part {
                        return None;
                    }
                }
            }
        }
        captured
    }
}
