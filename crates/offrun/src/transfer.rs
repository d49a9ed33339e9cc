//! # Transfer Detection
//!
//! Picks which outgoing values may move across a channel by ownership
//! transfer instead of by copy.
//!
//! ## Invariants
//!
//! - Detection never mutates or reorders the payload it scans.
//! - A `TransferSet` is a set of positions into that payload; it carries no
//!   order of its own.
//! - A disabled detector always yields the empty set, so everything is copied.

use std::collections::BTreeSet;

use offrpc::Value;

/// Positions in a payload whose values are transferred rather than copied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferSet(BTreeSet<usize>);

impl TransferSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.0.contains(&index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    /// Resolves the set against the payload it was selected from.
    pub fn values<'a>(&self, payload: &'a [Value]) -> Vec<&'a Value> {
        self.indices().filter_map(|i| payload.get(i)).collect()
    }
}

impl FromIterator<usize> for TransferSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Selects the transferable subset of an outgoing value list.
#[derive(Copy, Clone, Debug)]
pub struct TransferDetector {
    enabled: bool,
}

impl TransferDetector {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the positions of top-level buffers, ports and bitmaps.
    pub fn select(&self, values: &[Value]) -> TransferSet {
        if !self.enabled {
            return TransferSet::empty();
        }
        values
            .iter()
            .enumerate()
            .filter(|(_, value)| value.kind().is_transferable())
            .map(|(i, _)| i)
            .collect()
    }
}

impl Default for TransferDetector {
    fn default() -> Self {
        Self::new(true)
    }
}
