//! Identifiers shared by every component.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a page context, assigned by the host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub u64);

/// Opaque identifier of a frame inside a page context.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SubSourceId(pub u64);

impl SubSourceId {
    /// The top-level frame of a page context.
    pub const TOP: SubSourceId = SubSourceId(0);

    pub fn is_top(self) -> bool {
        self == Self::TOP
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SubSourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One possible media producer: a frame within a page context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub source: SourceId,
    pub sub_source: SubSourceId,
}

impl SessionKey {
    pub fn new(source: SourceId, sub_source: SubSourceId) -> Self {
        Self { source, sub_source }
    }

    pub fn top(source: SourceId) -> Self {
        Self::new(source, SubSourceId::TOP)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.sub_source)
    }
}

/// Comparable quality of a capture candidate; higher is better.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct QualityScore(pub i64);

impl fmt::Display for QualityScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
