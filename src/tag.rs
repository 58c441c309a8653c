//! Contains [`Tag`] and [`Tags`], the searchable key-value labels
//! attached to every event in the store.
//!
//! Tags are what [Queries][crate::query::EventQuery] use to carve a
//! consistency boundary out of the global log: an event matches a query item
//! when its tag-set is a superset of the item's tags.

use std::collections::btree_set;
use std::collections::BTreeSet;
use std::fmt;

use serde::de::{self, Deserializer, Unexpected};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

/// A key-value label attached to an event, searchable via superset
/// containment.
///
/// Either component may be absent, but never both: a [`Tag`] with no key and
/// no value is not materialized, which is why all parsing constructors
/// return an [`Option`].
///
/// The canonical text form is `key:value`; a missing key omits the leading
/// part and the colon (`value` becomes `:value`), a missing value omits the
/// trailing colon (`key:` becomes `key`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag {
    key: Option<String>,
    value: Option<String>,
}

impl Tag {
    /// Creates a new [`Tag`] with both key and value specified.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            value: Some(value.into()),
        }
    }

    /// Creates a [`Tag`] carrying only a key.
    pub fn key_only(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            value: None,
        }
    }

    /// Creates a [`Tag`] carrying only a value.
    pub fn value_only(value: impl Into<String>) -> Self {
        Self {
            key: None,
            value: Some(value.into()),
        }
    }

    /// Parses a [`Tag`] from its canonical text form.
    ///
    /// The empty string, `":"` and whitespace-only strings denote absence
    /// and yield [`None`]. Everything up to the first colon is the key,
    /// everything after it the value; an empty component is absent.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();

        let (key, value) = match input.split_once(':') {
            Some((key, value)) => (not_empty(key), not_empty(value)),
            None => (not_empty(input), None),
        };

        if key.is_none() && value.is_none() {
            return None;
        }

        Some(Self { key, value })
    }

    /// The key component, if present.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// The value component, if present.
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

fn not_empty(component: &str) -> Option<String> {
    if component.is_empty() {
        None
    } else {
        Some(component.to_owned())
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.key, &self.value) {
            (Some(key), Some(value)) => write!(f, "{}:{}", key, value),
            (Some(key), None) => write!(f, "{}", key),
            (None, Some(value)) => write!(f, ":{}", value),
            // Invariant: a Tag with both components absent is never materialized.
            (None, None) => unreachable!("tag with both components absent"),
        }
    }
}

impl Serialize for Tag {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let input = String::deserialize(deserializer)?;

        Tag::parse(&input)
            .ok_or_else(|| de::Error::invalid_value(Unexpected::Str(&input), &"a non-empty tag"))
    }
}

/// A mathematical set of [`Tag`]s: duplicates collapse, insertion order is
/// irrelevant.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tags(BTreeSet<Tag>);

impl Tags {
    /// Returns the empty tag-set.
    pub fn none() -> Self {
        Self::default()
    }

    /// Returns a tag-set containing the single specified [`Tag`].
    pub fn single(tag: Tag) -> Self {
        Self(BTreeSet::from([tag]))
    }

    /// Parses a sequence of canonical tag strings, dropping absent ones.
    pub fn parse<I, S>(input: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        input
            .into_iter()
            .filter_map(|tag| Tag::parse(tag.as_ref()))
            .collect()
    }

    /// Adds a [`Tag`] to the set, returning the updated set.
    #[must_use]
    pub fn with(mut self, tag: Tag) -> Self {
        self.0.insert(tag);
        self
    }

    /// Subset test: whether every [`Tag`] in `other` is contained in this set.
    pub fn contains_all(&self, other: &Tags) -> bool {
        self.0.is_superset(&other.0)
    }

    /// Whether the specified [`Tag`] is contained in this set.
    pub fn contains(&self, tag: &Tag) -> bool {
        self.0.contains(tag)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_set::Iter<'_, Tag> {
        self.0.iter()
    }
}

impl FromIterator<Tag> for Tags {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Tags {
    type Item = &'a Tag;
    type IntoIter = btree_set::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl IntoIterator for Tags {
    type Item = Tag;
    type IntoIter = btree_set::IntoIter<Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl Serialize for Tags {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for tag in &self.0 {
            seq.serialize_element(tag)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Tags {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Absent entries are dropped rather than rejected, matching the
        // parser contract.
        let input = Vec::<String>::deserialize(deserializer)?;
        Ok(Tags::parse(input))
    }
}
