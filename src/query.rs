//! Contains the query model: the filters an [`EventQuery`] is made of, and
//! the [`AppendCriteria`] that bind a query to an append as its optimistic
//! concurrency precondition.
//!
//! A query is the unit a Dynamic Consistency Boundary is expressed in:
//! instead of locking a statically-partitioned aggregate, a writer states
//! *which events would have invalidated my decision* as a query, and the
//! [storage engine][crate::store] admits the append only if the last event
//! matching that query is still the one the writer saw.

use std::collections::btree_set;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::event::{EventReference, EventType};
use crate::tag::Tags;

/// An optional cap on the number of events a read returns.
///
/// When present, the cap is strictly positive; [`Limit::at_most`] enforces
/// this at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limit(Option<u64>);

/// Error returned by [`Limit::at_most`] when the requested cap is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("a limit must be strictly positive")]
pub struct LimitError;

impl Limit {
    /// No cap: the read returns every matching event.
    pub fn unlimited() -> Self {
        Self(None)
    }

    /// Caps the read at `max` events.
    pub fn at_most(max: u64) -> Result<Self, LimitError> {
        if max == 0 {
            return Err(LimitError);
        }

        Ok(Self(Some(max)))
    }

    pub fn get(&self) -> Option<u64> {
        self.0
    }
}

/// A filter over [`EventType`]s: an event matches when its type is one of
/// the filtered set, and the *empty* filter is a wildcard matching every
/// type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventTypesFilter(BTreeSet<EventType>);

impl EventTypesFilter {
    /// The wildcard filter, matching any event type.
    pub fn any() -> Self {
        Self::default()
    }

    /// A filter matching exactly the specified types.
    pub fn of<I, T>(types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EventType>,
    {
        Self(types.into_iter().map(Into::into).collect())
    }

    /// Whether this filter is the wildcard.
    pub fn is_any(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, event_type: &EventType) -> bool {
        self.0.is_empty() || self.0.contains(event_type)
    }

    /// Returns this filter widened with the additional types.
    ///
    /// The wildcard stays a wildcard: it already covers every type, so
    /// widening it would only narrow its meaning.
    #[must_use]
    pub fn expand_with<I>(&self, additional: I) -> Self
    where
        I: IntoIterator<Item = EventType>,
    {
        if self.is_any() {
            return self.clone();
        }

        let mut types = self.0.clone();
        types.extend(additional);
        Self(types)
    }

    pub fn iter(&self) -> btree_set::Iter<'_, EventType> {
        self.0.iter()
    }
}

impl FromIterator<EventType> for EventTypesFilter {
    fn from_iter<I: IntoIterator<Item = EventType>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One disjunct of an [`EventQuery`].
///
/// Matches an event iff the event's type matches
/// [`event_types`](EventQueryItem::event_types) *and* the event's tag-set is
/// a superset of [`tags`](EventQueryItem::tags).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQueryItem {
    pub event_types: EventTypesFilter,
    pub tags: Tags,
}

impl EventQueryItem {
    pub fn new(event_types: EventTypesFilter, tags: Tags) -> Self {
        Self { event_types, tags }
    }

    pub fn matches(&self, event_type: &EventType, tags: &Tags) -> bool {
        self.event_types.matches(event_type) && tags.contains_all(&self.tags)
    }
}

/// Error returned by [`EventQuery::combine_with`] when the two queries carry
/// incompatible positional bounds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CombineError {
    /// Both queries carry an `until` bound, but they differ.
    #[error("cannot combine queries with different until references: {left} != {right}")]
    UntilMismatch {
        left: EventReference,
        right: EventReference,
    },

    /// Exactly one of the two queries carries an `until` bound.
    #[error("cannot combine a query with an until reference with one without")]
    UntilMissing,
}

/// A query over the event log.
///
/// The item list has three distinct states, and implementations must keep
/// them distinct (conflating them breaks criteria round-tripping):
///
/// - `items: None` is **match-all**: every event matches;
/// - `items: Some([])` is **match-none**: no event matches;
/// - `items: Some([..])` matches an event iff *any* item matches (OR).
///
/// `until` is an *inclusive* upper bound by position: when present, only
/// events at or before that reference match.
#[derive(Debug, Clone, PartialEq)]
pub struct EventQuery {
    pub items: Option<Vec<EventQueryItem>>,
    pub until: Option<EventReference>,
}

impl EventQuery {
    /// The query matching every event in the store.
    pub fn match_all() -> Self {
        Self {
            items: None,
            until: None,
        }
    }

    /// The query matching no event at all.
    ///
    /// This is the query of an unconditional [`AppendCriteria`]: its match
    /// set is always empty, so the precondition always holds.
    pub fn match_none() -> Self {
        Self {
            items: Some(Vec::new()),
            until: None,
        }
    }

    /// A single-item query matching events whose type passes `event_types`
    /// and whose tags contain all of `tags`.
    pub fn for_events(event_types: EventTypesFilter, tags: Tags) -> Self {
        Self {
            items: Some(vec![EventQueryItem::new(event_types, tags)]),
            until: None,
        }
    }

    /// Adds a disjunct to the query. Turns match-all into a single-item
    /// query.
    #[must_use]
    pub fn with_item(mut self, item: EventQueryItem) -> Self {
        self.items.get_or_insert_with(Vec::new).push(item);
        self
    }

    /// Sets the inclusive positional upper bound.
    #[must_use]
    pub fn until(mut self, reference: EventReference) -> Self {
        self.until = Some(reference);
        self
    }

    /// Whether an event with the specified type, tags and reference matches
    /// this query.
    pub fn matches(&self, event_type: &EventType, tags: &Tags, reference: &EventReference) -> bool {
        if let Some(until) = &self.until {
            if reference.position > until.position {
                return false;
            }
        }

        match &self.items {
            None => true,
            Some(items) => items.iter().any(|item| item.matches(event_type, tags)),
        }
    }

    /// Combines two queries into one matching the union of their match sets.
    ///
    /// Item lists are concatenated; combining with match-all yields
    /// match-all. The `until` bounds must be equal or both absent.
    pub fn combine_with(self, other: EventQuery) -> Result<EventQuery, CombineError> {
        let until = match (self.until, other.until) {
            (None, None) => None,
            (Some(left), Some(right)) if left == right => Some(left),
            (Some(left), Some(right)) => return Err(CombineError::UntilMismatch { left, right }),
            _ => return Err(CombineError::UntilMissing),
        };

        let items = match (self.items, other.items) {
            (Some(mut left), Some(right)) => {
                left.extend(right);
                Some(left)
            }
            // Match-all absorbs anything it is combined with.
            _ => None,
        };

        Ok(EventQuery { items, until })
    }

    /// Tightens the positional bound to whichever is earlier.
    #[must_use]
    pub fn until_if_earlier(mut self, reference: EventReference) -> Self {
        self.until = match self.until {
            Some(current) if current.position <= reference.position => Some(current),
            _ => Some(reference),
        };
        self
    }
}

// The DCB-on-the-wire representation:
// `{ items?: [{ eventTypes: [string], tags: [string] }], until?: {id, position} }`.
// `items` absent is match-all, `items: []` is match-none; serde must keep
// the two apart.

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireQueryItem {
    event_types: EventTypesFilter,
    tags: Tags,
}

#[derive(Serialize, Deserialize)]
struct WireQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    items: Option<Vec<WireQueryItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    until: Option<EventReference>,
}

impl Serialize for EventQuery {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        WireQuery {
            items: self.items.as_ref().map(|items| {
                items
                    .iter()
                    .map(|item| WireQueryItem {
                        event_types: item.event_types.clone(),
                        tags: item.tags.clone(),
                    })
                    .collect()
            }),
            until: self.until,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EventQuery {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = WireQuery::deserialize(deserializer)?;

        Ok(EventQuery {
            items: wire.items.map(|items| {
                items
                    .into_iter()
                    .map(|item| EventQueryItem::new(item.event_types, item.tags))
                    .collect()
            }),
            until: wire.until,
        })
    }
}

/// The precondition of an append: the append is admitted iff the last stored
/// event matching `query` is exactly `expected_last_reference` (both absent
/// counts as equal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendCriteria {
    pub query: EventQuery,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_last_reference: Option<EventReference>,
}

impl AppendCriteria {
    /// The unconditional criteria: a match-none query with no expected
    /// reference always validates.
    pub fn none() -> Self {
        Self {
            query: EventQuery::match_none(),
            expected_last_reference: None,
        }
    }

    /// Requires that no stored event matches `query`.
    pub fn no_events_matching(query: EventQuery) -> Self {
        Self {
            query,
            expected_last_reference: None,
        }
    }

    /// Requires that the last stored event matching `query` is `last`.
    pub fn after(query: EventQuery, last: EventReference) -> Self {
        Self {
            query,
            expected_last_reference: Some(last),
        }
    }
}
