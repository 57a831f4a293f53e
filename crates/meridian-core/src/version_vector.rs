//! Version vectors for causal tracking of item writes.
//!
//! A version vector counts, per region, how many writes that region has made
//! to an item. Comparing two vectors tells apart a genuine conflict
//! (concurrent writes) from a copy that is simply stale.

use crate::item::AttributeValue;
use crate::region::RegionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A mapping from region to write count. A missing region counts as zero.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    /// Map from region name to number of writes performed there.
    entries: BTreeMap<String, u64>,
}

impl VersionVector {
    /// Create an empty version vector.
    pub fn new() -> Self {
        VersionVector {
            entries: BTreeMap::new(),
        }
    }

    /// Create a vector recording a single write by `region`.
    pub fn for_region(region: &RegionId) -> Self {
        let mut vv = VersionVector::new();
        vv.bump(region);
        vv
    }

    /// Number of writes recorded for a region.
    pub fn count(&self, region: &RegionId) -> u64 {
        self.entries.get(region.as_str()).copied().unwrap_or(0)
    }

    /// Record one more write by `region`, inserting it at 1 if absent.
    pub fn bump(&mut self, region: &RegionId) -> &mut Self {
        *self.entries.entry(region.as_str().to_string()).or_insert(0) += 1;
        self
    }

    /// Returns true if for every region in `other`, self's count is at least
    /// as large.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other
            .entries
            .iter()
            .all(|(region, &count)| self.entries.get(region).copied().unwrap_or(0) >= count)
    }

    /// Dominates `other` and is not dominated back.
    pub fn strictly_dominates(&self, other: &VersionVector) -> bool {
        self.dominates(other) && !other.dominates(self)
    }

    /// Neither vector dominates the other: the writes were concurrent.
    pub fn is_concurrent_with(&self, other: &VersionVector) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    /// Component-wise max.
    pub fn merge(&mut self, other: &VersionVector) {
        for (region, &count) in &other.entries {
            let current = self.entries.entry(region.clone()).or_insert(0);
            *current = (*current).max(count);
        }
    }

    /// Regions with a recorded entry.
    pub fn regions(&self) -> impl Iterator<Item = RegionId> + '_ {
        self.entries.keys().map(|name| RegionId::new(name.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Plain map view for serialization.
    pub fn to_map(&self) -> BTreeMap<String, u64> {
        self.entries.clone()
    }

    /// Rebuild a vector from its map view.
    pub fn from_map(map: BTreeMap<String, u64>) -> Self {
        VersionVector { entries: map }
    }

    /// Encode as a map-of-numbers attribute.
    pub fn to_attribute(&self) -> AttributeValue {
        AttributeValue::M(
            self.entries
                .iter()
                .map(|(region, &count)| {
                    (
                        region.clone(),
                        AttributeValue::N(i64::try_from(count).unwrap_or(i64::MAX)),
                    )
                })
                .collect(),
        )
    }

    /// Decode from a map-of-numbers attribute. Returns `None` for any other
    /// shape or for negative counts.
    pub fn from_attribute(value: &AttributeValue) -> Option<Self> {
        let map = value.as_map()?;
        let mut entries = BTreeMap::new();
        for (region, count) in map {
            let count = u64::try_from(count.as_number()?).ok()?;
            entries.insert(region.clone(), count);
        }
        Some(VersionVector { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(name: &str) -> RegionId {
        RegionId::new(name)
    }

    fn vv(entries: &[(&str, u64)]) -> VersionVector {
        VersionVector::from_map(entries.iter().map(|(k, v)| (k.to_string(), *v)).collect())
    }

    #[test]
    fn test_version_vector_bump() {
        let mut v = VersionVector::new();
        assert_eq!(v.count(&r("a")), 0);

        v.bump(&r("a")).bump(&r("a")).bump(&r("b"));
        assert_eq!(v.count(&r("a")), 2);
        assert_eq!(v.count(&r("b")), 1);
        assert_eq!(v.len(), 2);
    }

    #[test]
    fn test_version_vector_dominates() {
        let v1 = vv(&[("a", 5), ("b", 3)]);
        let v2 = vv(&[("a", 3), ("b", 3)]);
        let v3 = vv(&[("a", 5), ("b", 5)]);

        assert!(v1.dominates(&v2));
        assert!(!v2.dominates(&v1));
        assert!(v3.dominates(&v1));
        assert!(!v1.dominates(&v3));
        assert!(v1.dominates(&VersionVector::new()));
    }

    #[test]
    fn test_version_vector_concurrent() {
        let a = VersionVector::for_region(&r("a"));
        let b = VersionVector::for_region(&r("b"));

        assert!(a.is_concurrent_with(&b));
        assert!(b.is_concurrent_with(&a));
        assert!(!a.is_concurrent_with(&a.clone()));
    }

    #[test]
    fn test_strict_domination_ignores_zero_entries() {
        let with_zero = vv(&[("a", 1), ("b", 0)]);
        let without = vv(&[("a", 1)]);
        assert!(with_zero.dominates(&without));
        assert!(without.dominates(&with_zero));
        assert!(!with_zero.strictly_dominates(&without));
    }

    #[test]
    fn test_version_vector_merge() {
        let mut v1 = vv(&[("a", 5), ("b", 3)]);
        v1.merge(&vv(&[("a", 3), ("b", 7)]));
        assert_eq!(v1.count(&r("a")), 5);
        assert_eq!(v1.count(&r("b")), 7);
    }

    #[test]
    fn test_attribute_encoding() {
        let v = vv(&[("a", 2), ("b", 9)]);
        let decoded = VersionVector::from_attribute(&v.to_attribute()).unwrap();
        assert_eq!(v, decoded);

        assert!(VersionVector::from_attribute(&AttributeValue::S("x".into())).is_none());
        let negative = AttributeValue::M(BTreeMap::from([("a".to_string(), AttributeValue::N(-1))]));
        assert!(VersionVector::from_attribute(&negative).is_none());
    }

    #[test]
    fn test_version_vector_serialization() {
        let v = vv(&[("a", 5), ("b", 10)]);
        let json = serde_json::to_string(&v).unwrap();
        let deserialized: VersionVector = serde_json::from_str(&json).unwrap();
        assert_eq!(v, deserialized);
    }
}
