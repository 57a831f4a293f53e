//! Deterministic conflict resolution between two copies of an item.
//!
//! Copies are ordered first causally by their version vectors. Only when
//! the vectors are concurrent does the tie-break apply:
//!
//! 1. the copy written in the master region wins (if only one was);
//! 2. otherwise the copy with the later writer timestamp wins;
//! 3. equal timestamps fall back to the larger origin name, then to the
//!    item ordering, so exactly one side always wins.
//!
//! Every replica can apply this order on its own and reach the same winner.

use crate::item::Item;
use crate::region::RegionId;
use std::cmp::Ordering;

/// Which of the two compared copies won.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    First,
    Second,
}

/// Why a side won.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolutionKind {
    /// The winner's version dominates; not a conflict.
    Dominates,
    /// Concurrent; the winner was written in the master region.
    MasterPreferred,
    /// Concurrent; the winner has the later timestamp.
    LatestTimestamp,
    /// Concurrent with equal timestamps; broken on origin then content.
    TieBreak,
}

/// Outcome of comparing two copies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub winner: Side,
    pub kind: ResolutionKind,
}

/// Conflict detection and resolution for item copies.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        ConflictResolver
    }

    /// Returns true if both copies exist and their versions are concurrent.
    ///
    /// A copy is never in conflict with a missing item.
    pub fn is_conflict(&self, one: Option<&Item>, two: Option<&Item>) -> bool {
        match (one, two) {
            (Some(one), Some(two)) => one.version().is_concurrent_with(&two.version()),
            _ => false,
        }
    }

    /// Returns true if `one` should be kept over `two`.
    pub fn is_winner(&self, one: &Item, two: &Item, master: &RegionId) -> bool {
        self.resolve(one, two, master).winner == Side::First
    }

    /// Compare two copies and report the winner with the rule that decided.
    pub fn resolve(&self, one: &Item, two: &Item, master: &RegionId) -> Resolution {
        let one_version = one.version();
        let two_version = two.version();

        if one_version.dominates(&two_version) {
            return Resolution {
                winner: Side::First,
                kind: ResolutionKind::Dominates,
            };
        }
        if two_version.dominates(&one_version) {
            return Resolution {
                winner: Side::Second,
                kind: ResolutionKind::Dominates,
            };
        }

        let one_origin = one.origin();
        let two_origin = two.origin();
        let one_is_master = one_origin.as_ref() == Some(master);
        let two_is_master = two_origin.as_ref() == Some(master);
        if one_is_master && !two_is_master {
            return Resolution {
                winner: Side::First,
                kind: ResolutionKind::MasterPreferred,
            };
        }
        if two_is_master && !one_is_master {
            return Resolution {
                winner: Side::Second,
                kind: ResolutionKind::MasterPreferred,
            };
        }

        match one.timestamp().cmp(&two.timestamp()) {
            Ordering::Greater => Resolution {
                winner: Side::First,
                kind: ResolutionKind::LatestTimestamp,
            },
            Ordering::Less => Resolution {
                winner: Side::Second,
                kind: ResolutionKind::LatestTimestamp,
            },
            Ordering::Equal => {
                let first_wins = match one_origin.cmp(&two_origin) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => one >= two,
                };
                Resolution {
                    winner: if first_wins { Side::First } else { Side::Second },
                    kind: ResolutionKind::TieBreak,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version_vector::VersionVector;

    fn r(name: &str) -> RegionId {
        RegionId::new(name)
    }

    fn stamped(value: &str, origin: &str, timestamp: u64, version: &[(&str, u64)]) -> Item {
        let version = VersionVector::from_map(
            version.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        );
        let mut item = Item::new().with("name", "x").with("value", value);
        item.stamp(&r(origin), timestamp, &version);
        item
    }

    #[test]
    fn test_no_conflict_with_missing_item() {
        let resolver = ConflictResolver::new();
        let item = stamped("v", "a", 1, &[("a", 1)]);
        assert!(!resolver.is_conflict(Some(&item), None));
        assert!(!resolver.is_conflict(None, Some(&item)));
        assert!(!resolver.is_conflict(None, None));
    }

    #[test]
    fn test_dominating_version_wins_regardless_of_master() {
        let resolver = ConflictResolver::new();
        let old = stamped("old", "a", 500, &[("a", 1)]);
        let new = stamped("new", "b", 100, &[("a", 1), ("b", 1)]);

        assert!(!resolver.is_conflict(Some(&old), Some(&new)));
        assert!(resolver.is_winner(&new, &old, &r("a")));
        assert!(!resolver.is_winner(&old, &new, &r("a")));
        assert_eq!(resolver.resolve(&new, &old, &r("a")).kind, ResolutionKind::Dominates);
    }

    #[test]
    fn test_master_origin_wins_concurrent_writes() {
        let resolver = ConflictResolver::new();
        let at_a = stamped("a", "a", 100, &[("a", 1)]);
        let at_b = stamped("b", "b", 999, &[("b", 1)]);

        assert!(resolver.is_conflict(Some(&at_a), Some(&at_b)));
        assert!(resolver.is_winner(&at_a, &at_b, &r("a")));
        assert!(!resolver.is_winner(&at_b, &at_a, &r("a")));
        assert_eq!(
            resolver.resolve(&at_b, &at_a, &r("a")).kind,
            ResolutionKind::MasterPreferred
        );
    }

    #[test]
    fn test_latest_timestamp_wins_without_master() {
        let resolver = ConflictResolver::new();
        let at_a = stamped("a", "a", 100, &[("a", 1)]);
        let at_b = stamped("b", "b", 200, &[("b", 1)]);

        assert!(resolver.is_winner(&at_b, &at_a, &r("m")));
        assert!(!resolver.is_winner(&at_a, &at_b, &r("m")));
    }

    #[test]
    fn test_equal_timestamps_pick_exactly_one() {
        let resolver = ConflictResolver::new();
        let at_a = stamped("a", "a", 100, &[("a", 1)]);
        let at_b = stamped("b", "b", 100, &[("b", 1)]);

        let ab = resolver.is_winner(&at_a, &at_b, &r("m"));
        let ba = resolver.is_winner(&at_b, &at_a, &r("m"));
        assert_ne!(ab, ba);
        assert_eq!(resolver.resolve(&at_a, &at_b, &r("m")).kind, ResolutionKind::TieBreak);
    }
}
