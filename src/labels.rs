//! Label sets and series identity.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;

/// A set of label name/value pairs. Identity is order-independent: two sets
/// with the same pairs are equal no matter the insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Fill in pairs from `defaults` without overwriting existing values.
    pub fn merge_defaults(&mut self, defaults: &Labels) {
        for (name, value) in defaults.iter() {
            self.0
                .entry(name.to_owned())
                .or_insert_with(|| value.to_owned());
        }
    }

    /// Overlay `other` on top of this set, overwriting on conflict.
    pub fn merge_over(&mut self, other: &Labels) {
        for (name, value) in other.iter() {
            self.0.insert(name.to_owned(), value.to_owned());
        }
    }

    /// Project this set onto the given label names. Names this set lacks map
    /// to the empty string, so grouping treats "missing" consistently.
    pub fn project(&self, names: &[String]) -> Labels {
        names
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    self.get(name).unwrap_or_default().to_owned(),
                )
            })
            .collect()
    }

    /// Stable 64-bit hash of the sorted pairs.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for (name, value) in self.iter() {
            name.hash(&mut hasher);
            value.hash(&mut hasher);
        }
        hasher.finish()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={:?}", name, value)?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
        )
    }
}

/// Identity of one time series: metric name plus its label set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesId {
    pub metric: String,
    pub labels: Labels,
}

impl SeriesId {
    pub fn new(metric: impl Into<String>, labels: Labels) -> Self {
        Self {
            metric: metric.into(),
            labels,
        }
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.metric, self.labels)
    }
}
