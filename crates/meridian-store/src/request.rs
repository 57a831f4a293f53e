//! Request shapes shared by every item store: read consistency, scan
//! filters and partial attribute updates.

use crate::error::{Result, StoreError};
use meridian_core::{AttributeValue, Item};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Read/write consistency requested by a caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    /// Served by the nearest replica; may be stale.
    #[default]
    Eventual,
    /// Served by the authoritative replica.
    Strong,
}

impl Consistency {
    pub fn is_strong(self) -> bool {
        self == Consistency::Strong
    }
}

/// One condition of a scan filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Condition {
    /// Attribute exists and is strictly greater than the value.
    Gt(String, AttributeValue),
    /// Attribute exists and equals the value.
    Eq(String, AttributeValue),
}

impl Condition {
    pub fn matches(&self, item: &Item) -> bool {
        match self {
            Condition::Gt(name, value) => item
                .get(name)
                .and_then(|actual| compare_scalar(actual, value))
                .is_some_and(|ord| ord == Ordering::Greater),
            Condition::Eq(name, value) => item.get(name) == Some(value),
        }
    }
}

/// A conjunction of conditions. The empty filter matches every item.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanFilter {
    conditions: Vec<Condition>,
}

impl ScanFilter {
    /// Matches everything.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn gt(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.conditions.push(Condition::Gt(name.into(), value.into()));
        self
    }

    pub fn eq(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.conditions.push(Condition::Eq(name.into(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn matches(&self, item: &Item) -> bool {
        self.conditions.iter().all(|c| c.matches(item))
    }
}

/// Order two scalars of the same type; other combinations are incomparable.
fn compare_scalar(a: &AttributeValue, b: &AttributeValue) -> Option<Ordering> {
    match (a, b) {
        (AttributeValue::N(a), AttributeValue::N(b)) => Some(a.cmp(b)),
        (AttributeValue::S(a), AttributeValue::S(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// What a partial update does to one attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateAction {
    /// Replace the attribute.
    Put(AttributeValue),
    /// Add to a number or union into a set, creating the attribute if absent.
    Add(AttributeValue),
    /// Remove the attribute, or with a set value remove those elements.
    Delete(Option<AttributeValue>),
}

/// A partial update of one attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttributeUpdate {
    pub name: String,
    pub action: UpdateAction,
}

impl AttributeUpdate {
    pub fn put(name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self {
            name: name.into(),
            action: UpdateAction::Put(value.into()),
        }
    }

    pub fn add(name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self {
            name: name.into(),
            action: UpdateAction::Add(value.into()),
        }
    }

    pub fn remove(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: UpdateAction::Delete(None),
        }
    }

    pub fn delete_elements(name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self {
            name: name.into(),
            action: UpdateAction::Delete(Some(value.into())),
        }
    }

    /// Apply this update to `item` in place.
    pub fn apply(&self, item: &mut Item) -> Result<()> {
        match &self.action {
            UpdateAction::Put(value) => {
                item.set(self.name.clone(), value.clone());
                Ok(())
            }
            UpdateAction::Add(value) => self.apply_add(item, value),
            UpdateAction::Delete(None) => {
                item.remove(&self.name);
                Ok(())
            }
            UpdateAction::Delete(Some(value)) => self.apply_delete(item, value),
        }
    }

    fn apply_add(&self, item: &mut Item, value: &AttributeValue) -> Result<()> {
        let Some(current) = item.get_mut(&self.name) else {
            item.set(self.name.clone(), value.clone());
            return Ok(());
        };
        match (current, value) {
            (AttributeValue::N(current), AttributeValue::N(delta)) => {
                *current = current.saturating_add(*delta);
                Ok(())
            }
            (AttributeValue::SS(current), AttributeValue::SS(extra)) => {
                current.extend(extra.iter().cloned());
                Ok(())
            }
            (AttributeValue::NS(current), AttributeValue::NS(extra)) => {
                current.extend(extra.iter().copied());
                Ok(())
            }
            (current, value) => Err(self.invalid(format!(
                "cannot add {} to {}",
                value.type_name(),
                current.type_name()
            ))),
        }
    }

    fn apply_delete(&self, item: &mut Item, value: &AttributeValue) -> Result<()> {
        let Some(current) = item.get_mut(&self.name) else {
            return Ok(());
        };
        let now_empty = match (current, value) {
            (AttributeValue::SS(current), AttributeValue::SS(gone)) => {
                current.retain(|v| !gone.contains(v));
                current.is_empty()
            }
            (AttributeValue::NS(current), AttributeValue::NS(gone)) => {
                current.retain(|v| !gone.contains(v));
                current.is_empty()
            }
            (current, value) => {
                return Err(self.invalid(format!(
                    "cannot delete {} elements from {}",
                    value.type_name(),
                    current.type_name()
                )))
            }
        };
        if now_empty {
            item.remove(&self.name);
        }
        Ok(())
    }

    fn invalid(&self, reason: String) -> StoreError {
        StoreError::InvalidUpdate {
            attribute: self.name.clone(),
            reason,
        }
    }
}

/// Apply a batch of updates; stops at the first invalid one.
pub fn apply_updates(item: &mut Item, updates: &[AttributeUpdate]) -> Result<()> {
    for update in updates {
        update.apply(item)?;
    }
    Ok(())
}
