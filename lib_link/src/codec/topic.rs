use std::fmt;

use crate::errors::LinkError;

const SINGLE_WILDCARD: &str = "*";
const TAIL_WILDCARD: &str = ">";

/// A validated topic name or wildcard pattern such as `sensors.*.temp` or `gps.>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPattern(String);

impl TopicPattern {
    pub fn parse(raw: &str) -> Result<Self, LinkError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(invalid(raw, "topic is empty"));
        }

        let tokens: Vec<&str> = raw.split('.').collect();
        for (index, token) in tokens.iter().enumerate() {
            if token.is_empty() {
                return Err(invalid(raw, "empty token"));
            }
            if *token == TAIL_WILDCARD && index + 1 != tokens.len() {
                return Err(invalid(raw, "'>' must be the last token"));
            }
            if token.len() > 1 && (token.contains('*') || token.contains('>')) {
                return Err(invalid(raw, "wildcards must occupy a whole token"));
            }
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.0
            .split('.')
            .any(|token| token == SINGLE_WILDCARD || token == TAIL_WILDCARD)
    }

    /// Returns true when the concrete `topic` falls under this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        let mut topic_tokens = topic.split('.');

        for pattern_token in self.0.split('.') {
            match pattern_token {
                TAIL_WILDCARD => return topic_tokens.next().is_some(),
                SINGLE_WILDCARD => {
                    if topic_tokens.next().is_none() {
                        return false;
                    }
                }
                literal => {
                    if topic_tokens.next() != Some(literal) {
                        return false;
                    }
                }
            }
        }

        topic_tokens.next().is_none()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn invalid(topic: &str, reason: &'static str) -> LinkError {
    LinkError::InvalidTopic {
        topic: topic.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_topics_match_only_themselves() {
        let pattern = TopicPattern::parse("compute.state.full").unwrap();
        assert!(pattern.matches("compute.state.full"));
        assert!(!pattern.matches("compute.state"));
        assert!(!pattern.matches("compute.state.full.extra"));
        assert!(!pattern.is_wildcard());
    }

    #[test]
    fn single_wildcard_spans_exactly_one_token() {
        let pattern = TopicPattern::parse("sensors.*.temp").unwrap();
        assert!(pattern.matches("sensors.boom.temp"));
        assert!(!pattern.matches("sensors.temp"));
        assert!(!pattern.matches("sensors.boom.arm.temp"));
    }

    #[test]
    fn tail_wildcard_needs_at_least_one_token() {
        let pattern = TopicPattern::parse("gps.>").unwrap();
        assert!(pattern.matches("gps.position"));
        assert!(pattern.matches("gps.position.raw"));
        assert!(!pattern.matches("gps"));
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        for raw in ["", "a..b", "a.>.b", "a.b*", ".a"] {
            assert!(
                matches!(TopicPattern::parse(raw), Err(LinkError::InvalidTopic { .. })),
                "{raw:?} should be rejected"
            );
        }
    }
}
