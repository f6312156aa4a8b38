//! Data model shared between the gateway and the shard backends
//!
//! A series is identified by its label set: a lexicographically sorted
//! sequence of `(name, value)` pairs, unique by name. Points are
//! `(timestamp, value)` pairs, strictly time-ordered within a series.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Label name carrying the metric name
pub const METRIC_NAME_LABEL: &str = "__name__";

/// A single `(name, value)` label pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A sorted label set, the identity of a series.
///
/// Construction sorts by name and drops duplicate names (first wins), so
/// two label sets compare equal iff they denote the same series. The
/// derived ordering is the lexicographic pair ordering the merge layer
/// relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.sort();
        labels.dedup_by(|a, b| a.name == b.name);
        Self(labels)
    }

    /// Build from `(name, value)` pairs, mostly for tests and examples
    pub fn from_pairs<N: Into<String>, V: Into<String>>(pairs: Vec<(N, V)>) -> Self {
        Self::new(
            pairs
                .into_iter()
                .map(|(n, v)| Label::new(n, v))
                .collect(),
        )
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    /// Value of the `__name__` label, if present
    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable in-process hash of the label set, used to spread samples
    /// of one day over the day's shard group
    pub fn hash_value(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.0.hash(&mut hasher);
        hasher.finish()
    }
}

/// A single sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub t: i64,
    pub v: f64,
}

impl Point {
    pub fn new(t: i64, v: f64) -> Self {
        Self { t, v }
    }
}

/// A labeled series of time-ordered points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub labels: Labels,
    pub points: Vec<Point>,
}

/// Matcher type for label selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchType {
    Equal,
    NotEqual,
    Regexp,
    NotRegexp,
}

/// A label matcher as carried in select requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Matcher {
    pub match_type: MatchType,
    pub name: String,
    pub value: String,
}

impl Matcher {
    pub fn new(match_type: MatchType, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            match_type,
            name: name.into(),
            value: value.into(),
        }
    }

    /// Equality matcher, the common case
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(MatchType::Equal, name, value)
    }

    /// Whether a label value satisfies this matcher.
    ///
    /// Regexp matchers are anchored to the full value, as the backends
    /// anchor them. Evaluation happens on the shard side; the gateway
    /// only inspects equality matchers for routing.
    pub fn matches(&self, value: &str) -> bool {
        match self.match_type {
            MatchType::Equal => self.value == value,
            MatchType::NotEqual => self.value != value,
            MatchType::Regexp => Self::regex_matches(&self.value, value),
            MatchType::NotRegexp => !Self::regex_matches(&self.value, value),
        }
    }

    fn regex_matches(pattern: &str, value: &str) -> bool {
        regex::Regex::new(&format!("^(?:{pattern})$"))
            .map(|re| re.is_match(value))
            .unwrap_or(false)
    }
}

/// Metric name from the first `__name__` equality matcher, if any
pub fn metric_name_from_matchers(matchers: &[Matcher]) -> Option<&str> {
    matchers
        .iter()
        .find(|m| m.match_type == MatchType::Equal && m.name == METRIC_NAME_LABEL)
        .map(|m| m.value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_sorted_and_unique() {
        let labels = Labels::from_pairs(vec![
            ("instance", "a"),
            ("__name__", "cpu"),
            ("instance", "b"),
        ]);
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get("instance"), Some("a"));
        assert_eq!(labels.metric_name(), Some("cpu"));
    }

    #[test]
    fn test_labels_ordering_is_lexicographic() {
        let a = Labels::from_pairs(vec![("__name__", "cpu"), ("host", "a")]);
        let b = Labels::from_pairs(vec![("__name__", "cpu"), ("host", "b")]);
        let c = Labels::from_pairs(vec![("__name__", "mem")]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_labels_hash_is_identity_stable() {
        let a = Labels::from_pairs(vec![("host", "a"), ("__name__", "cpu")]);
        let b = Labels::from_pairs(vec![("__name__", "cpu"), ("host", "a")]);
        assert_eq!(a.hash_value(), b.hash_value());
    }

    #[test]
    fn test_matcher_semantics() {
        assert!(Matcher::equal("job", "api").matches("api"));
        assert!(!Matcher::equal("job", "api").matches("web"));
        assert!(Matcher::new(MatchType::NotEqual, "job", "api").matches("web"));
        assert!(Matcher::new(MatchType::Regexp, "job", "api|web").matches("web"));
        assert!(!Matcher::new(MatchType::Regexp, "job", "api|web").matches("webs"));
        assert!(Matcher::new(MatchType::NotRegexp, "job", "api.*").matches("web"));
    }

    #[test]
    fn test_metric_name_from_matchers() {
        let matchers = vec![
            Matcher::new(MatchType::Regexp, "host", ".*"),
            Matcher::equal("__name__", "cpu"),
        ];
        assert_eq!(metric_name_from_matchers(&matchers), Some("cpu"));
        assert_eq!(metric_name_from_matchers(&matchers[..1]), None);
    }
}
