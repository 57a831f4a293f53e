//! Items, attribute values and the reserved system attributes.
//!
//! An [`Item`] is an unordered mapping from attribute name to
//! [`AttributeValue`]. Every item committed through a global request router
//! additionally carries three system attributes:
//!
//! - [`system::ORIGIN`]: the region that performed the write
//! - [`system::TIMESTAMP`]: writer wall-clock time in milliseconds
//! - [`system::VERSION`]: the item's [`VersionVector`]
//!
//! Clients never set these directly.

use crate::region::RegionId;
use crate::version_vector::VersionVector;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Names of the reserved system attributes.
pub mod system {
    /// Region where the item was last written.
    pub const ORIGIN: &str = "mrd:origin";
    /// Time of the last write (milliseconds since the epoch, writer's clock).
    pub const TIMESTAMP: &str = "mrd:timestamp";
    /// Version vector of the item.
    pub const VERSION: &str = "mrd:version";

    /// All reserved attribute names.
    pub const ALL: [&str; 3] = [ORIGIN, TIMESTAMP, VERSION];

    /// Returns true if `name` is reserved for the replication layer.
    pub fn is_reserved(name: &str) -> bool {
        ALL.contains(&name)
    }
}

/// A scalar or set-valued attribute.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AttributeValue {
    /// String.
    S(String),
    /// Integer number.
    N(i64),
    /// Boolean.
    Bool(bool),
    /// Explicit null.
    Null,
    /// String set.
    SS(BTreeSet<String>),
    /// Number set.
    NS(BTreeSet<i64>),
    /// Nested map.
    M(BTreeMap<String, AttributeValue>),
    /// List.
    L(Vec<AttributeValue>),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::S(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            AttributeValue::N(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_string_set(&self) -> Option<&BTreeSet<String>> {
        match self {
            AttributeValue::SS(set) => Some(set),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, AttributeValue>> {
        match self {
            AttributeValue::M(map) => Some(map),
            _ => None,
        }
    }

    /// Build a string set from any iterator of strings.
    pub fn string_set<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AttributeValue::SS(values.into_iter().map(Into::into).collect())
    }

    /// Short type tag, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            AttributeValue::S(_) => "S",
            AttributeValue::N(_) => "N",
            AttributeValue::Bool(_) => "BOOL",
            AttributeValue::Null => "NULL",
            AttributeValue::SS(_) => "SS",
            AttributeValue::NS(_) => "NS",
            AttributeValue::M(_) => "M",
            AttributeValue::L(_) => "L",
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::S(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::S(s)
    }
}

impl From<i64> for AttributeValue {
    fn from(n: i64) -> Self {
        AttributeValue::N(n)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Bool(b)
    }
}

/// A record in a table: attribute name to value.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Item {
    attributes: BTreeMap<String, AttributeValue>,
}

impl Item {
    /// Create an empty item.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Builder-style string set setter.
    pub fn with_string_set<I, S>(self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with(name, AttributeValue::string_set(values))
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(AttributeValue::as_str)
    }

    pub fn get_number(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(AttributeValue::as_number)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<AttributeValue> {
        self.attributes.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.attributes.iter()
    }

    /// Mutable access to a single attribute.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut AttributeValue> {
        self.attributes.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Names of client attributes that collide with reserved system attributes.
    pub fn reserved_attributes(&self) -> Vec<&str> {
        self.attributes
            .keys()
            .map(String::as_str)
            .filter(|name| system::is_reserved(name))
            .collect()
    }

    // --- system attributes ---

    /// Region that performed the last write, if stamped.
    pub fn origin(&self) -> Option<RegionId> {
        self.get_string(system::ORIGIN).map(RegionId::new)
    }

    /// Writer timestamp of the last write; 0 if not stamped.
    pub fn timestamp(&self) -> u64 {
        self.get_number(system::TIMESTAMP)
            .and_then(|ts| u64::try_from(ts).ok())
            .unwrap_or(0)
    }

    /// Version vector of the item; empty if not stamped or malformed.
    pub fn version(&self) -> VersionVector {
        self.get(system::VERSION)
            .and_then(VersionVector::from_attribute)
            .unwrap_or_default()
    }

    /// Returns true if all three system attributes are present.
    pub fn is_stamped(&self) -> bool {
        system::ALL.iter().all(|name| self.contains(name))
    }

    pub fn set_origin(&mut self, region: &RegionId) {
        self.set(system::ORIGIN, region.as_str());
    }

    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.set(system::TIMESTAMP, clamp_timestamp(timestamp));
    }

    pub fn set_version(&mut self, version: &VersionVector) {
        self.set(system::VERSION, version.to_attribute());
    }

    /// Stamp all three system attributes at once.
    pub fn stamp(&mut self, origin: &RegionId, timestamp: u64, version: &VersionVector) {
        self.set_origin(origin);
        self.set_timestamp(timestamp);
        self.set_version(version);
    }
}

impl FromIterator<(String, AttributeValue)> for Item {
    fn from_iter<T: IntoIterator<Item = (String, AttributeValue)>>(iter: T) -> Self {
        Self {
            attributes: iter.into_iter().collect(),
        }
    }
}

/// Encode a millisecond timestamp as a number attribute value.
pub fn clamp_timestamp(timestamp: u64) -> i64 {
    i64::try_from(timestamp).unwrap_or(i64::MAX)
}
