//! Region identifiers.

use serde::{Deserialize, Serialize};

/// Identifier of an independent replica location (e.g. `"eu-central-1"`).
///
/// Regions are always compared by value.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionId(pub String);

impl RegionId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The region name as stored in system attributes.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RegionId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for RegionId {
    fn from(name: String) -> Self {
        Self(name)
    }
}
