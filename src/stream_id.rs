//! Contains [`EventStreamId`], the two-axis identifier of a logical event
//! stream.
//!
//! Streams are a *view* onto the store; the log itself is global. An id
//! whose axes are both specified addresses one concrete stream and may be
//! written to; an id with a wildcard axis addresses a family of streams and
//! is read-only.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The purpose denoted by the literal `"default"`.
pub const DEFAULT_PURPOSE: &str = "default";

/// Identifies an event stream by `(context, purpose)`.
///
/// [`None`] on an axis means *wildcard* on that axis. The canonical text
/// form is `""` (both wildcard), `"ctx"` (purpose wildcard) or
/// `"ctx#purpose"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventStreamId {
    context: Option<String>,
    purpose: Option<String>,
}

impl EventStreamId {
    /// The id that is wildcard on both axes, reading every stream.
    pub fn any() -> Self {
        Self::default()
    }

    /// A fully-specified stream id.
    pub fn new(context: impl Into<String>, purpose: impl Into<String>) -> Self {
        Self {
            context: Some(context.into()),
            purpose: Some(purpose.into()),
        }
    }

    /// A stream id with the specified context and the `"default"` purpose.
    pub fn with_default_purpose(context: impl Into<String>) -> Self {
        Self::new(context, DEFAULT_PURPOSE)
    }

    /// A stream id matching every purpose within the specified context.
    pub fn for_context(context: impl Into<String>) -> Self {
        Self {
            context: Some(context.into()),
            purpose: None,
        }
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn purpose(&self) -> Option<&str> {
        self.purpose.as_deref()
    }

    /// Whether events of the `target` stream are visible through this id.
    ///
    /// Holds when, on each axis, this id's component is either absent
    /// (wildcard) or equal to the target's.
    pub fn can_read(&self, target: &EventStreamId) -> bool {
        let axis_matches = |ours: &Option<String>, theirs: &Option<String>| match ours {
            None => true,
            Some(_) => ours == theirs,
        };

        axis_matches(&self.context, &target.context) && axis_matches(&self.purpose, &target.purpose)
    }

    /// Whether this id may be written to: neither axis is a wildcard.
    pub fn is_writable(&self) -> bool {
        self.context.is_some() && self.purpose.is_some()
    }
}

impl fmt::Display for EventStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.context, &self.purpose) {
            (Some(context), Some(purpose)) => write!(f, "{}#{}", context, purpose),
            (Some(context), None) => f.write_str(context),
            (None, _) => Ok(()),
        }
    }
}

/// Error returned when parsing an [`EventStreamId`] from its canonical text
/// form fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed event stream id: {input:?}")]
pub struct ParseStreamIdError {
    pub input: String,
}

impl FromStr for EventStreamId {
    type Err = ParseStreamIdError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.is_empty() {
            return Ok(Self::any());
        }

        match input.split_once('#') {
            None => Ok(Self::for_context(input)),
            // A dangling "#" or an empty context are not canonical forms.
            Some(("", _)) | Some((_, "")) => Err(ParseStreamIdError {
                input: input.to_owned(),
            }),
            Some((context, purpose)) => Ok(Self::new(context, purpose)),
        }
    }
}
