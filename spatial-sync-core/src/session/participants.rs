//! Participant Registry

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique participant identifier (transport peer id)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Snapshot of the current roster. Always replaced as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantSet {
    ids: BTreeSet<ParticipantId>,
}

impl ParticipantSet {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.ids.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParticipantId> {
        self.ids.iter()
    }
}

impl FromIterator<ParticipantId> for ParticipantSet {
    fn from_iter<I: IntoIterator<Item = ParticipantId>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

/// Result of applying a roster snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterDiff {
    pub joined: Vec<ParticipantId>,
    pub left: Vec<ParticipantId>,
}

impl RosterDiff {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

/// Tracks the roster of the current session and its peak size
#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    current: ParticipantSet,
    peak: usize,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the roster and report who joined and who left
    pub fn apply(&mut self, snapshot: ParticipantSet) -> RosterDiff {
        let joined = snapshot.ids.difference(&self.current.ids).cloned().collect();
        let left = self.current.ids.difference(&snapshot.ids).cloned().collect();

        self.peak = self.peak.max(snapshot.len());
        self.current = snapshot;

        RosterDiff { joined, left }
    }

    pub fn current(&self) -> &ParticipantSet {
        &self.current
    }

    /// Largest roster seen since the session began
    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Drop the roster but keep the peak (session invalidated)
    pub fn clear(&mut self) {
        self.current = ParticipantSet::default();
    }

    /// Fresh state for a new session
    pub fn reset(&mut self) {
        self.current = ParticipantSet::default();
        self.peak = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> ParticipantSet {
        ids.iter().map(|s| ParticipantId::from(*s)).collect()
    }

    #[test]
    fn test_diff_reports_joins_and_leaves() {
        let mut registry = ParticipantRegistry::new();
        registry.apply(set(&["a", "b"]));

        let diff = registry.apply(set(&["b", "c", "d"]));
        assert_eq!(diff.joined, vec![ParticipantId::from("c"), ParticipantId::from("d")]);
        assert_eq!(diff.left, vec![ParticipantId::from("a")]);
        assert_eq!(registry.current(), &set(&["b", "c", "d"]));
    }

    #[test]
    fn test_same_snapshot_twice_is_quiet() {
        let mut registry = ParticipantRegistry::new();
        let first = registry.apply(set(&["a", "b"]));
        assert_eq!(first.joined.len(), 2);

        let second = registry.apply(set(&["a", "b"]));
        assert!(second.is_empty());
    }

    #[test]
    fn test_peak_survives_clear_until_reset() {
        let mut registry = ParticipantRegistry::new();
        registry.apply(set(&["a", "b", "c"]));
        registry.apply(set(&["a"]));
        assert_eq!(registry.peak(), 3);

        registry.clear();
        assert!(registry.current().is_empty());
        assert_eq!(registry.peak(), 3);

        registry.reset();
        assert_eq!(registry.peak(), 0);
    }
}
