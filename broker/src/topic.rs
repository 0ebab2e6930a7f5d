//! Topic-exchange routing patterns.
//!
//! Routing keys are dot-separated words (`inventory.reserved`). A binding
//! pattern uses the same shape plus two wildcards:
//!
//! - `*` matches exactly one word
//! - `#` matches zero or more words

use std::fmt;

/// A parsed binding pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    words: Vec<String>,
}

impl TopicPattern {
    /// Parse a binding pattern.
    #[must_use]
    pub fn new(pattern: &str) -> Self {
        Self {
            raw: pattern.to_string(),
            words: pattern.split('.').map(str::to_string).collect(),
        }
    }

    /// The pattern as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether a routing key is matched by this pattern.
    #[must_use]
    pub fn matches(&self, routing_key: &str) -> bool {
        let key: Vec<&str> = routing_key.split('.').collect();
        match_words(&self.words, &key)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn match_words(pattern: &[String], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((first, rest)) if first == "#" => {
            (0..=key.len()).any(|skip| match_words(rest, &key[skip..]))
        },
        Some((first, rest)) => match key.split_first() {
            Some((word, key_rest)) if first == "*" || first == word => match_words(rest, key_rest),
            _ => false,
        },
    }
}
