//! Mastership leases.
//!
//! A [`Lease`] grants one region mastership of a table for a bounded time.
//! Expiry checks are deliberately asymmetric around the nominal expiration
//! by `clock_bound_ms`, the assumed maximum clock skew between regions:
//!
//! - [`Lease::is_expired`] only reports expiry `clock_bound_ms` *after* the
//!   nominal expiration, so no region takes over a lease that its holder may
//!   still consider valid.
//! - [`Lease::maybe_expired`] reports expiry `clock_bound_ms` *before* the
//!   nominal expiration, so routers rediscover the master early.
//!
//! Between the two there is a short window where nobody trusts the lease.
//!
//! A lease can carry a pending transition to a next owner, scheduled by
//! [`Lease::take`] while the current lease is still valid. The next owner
//! activates it with [`Lease::renew`] once the current lease has expired.

use crate::clock::SharedClock;
use crate::region::RegionId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Timing parameters for leases (milliseconds).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Length of a grant or renewal.
    pub duration_ms: u64,
    /// Bound on clock asynchrony between regions.
    pub clock_bound_ms: u64,
    /// How long before expiration a holder should renew.
    pub renew_lead_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_ms: 5 * 60 * 1000,
            clock_bound_ms: 2 * 1000,
            renew_lead_ms: 60 * 1000,
        }
    }
}

/// Coarse lease state, derived from ownership fields only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseState {
    /// No owner.
    Unheld,
    /// Owned, no transition scheduled.
    Held,
    /// Owned, with a transition to a next owner scheduled.
    HeldWithPendingTransition,
}

/// Point-in-time copy of a lease's fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseSnapshot {
    pub owner: Option<RegionId>,
    pub expiration: u64,
    pub next_owner: Option<RegionId>,
    pub next_expiration: u64,
}

impl LeaseSnapshot {
    fn unheld() -> Self {
        Self {
            owner: None,
            expiration: 0,
            next_owner: None,
            next_expiration: 0,
        }
    }
}

/// Mastership lease for one table.
///
/// All operations run under a single lock and never block on the lease
/// becoming available: contention is reported by returning `false`.
#[derive(Debug)]
pub struct Lease {
    config: LeaseConfig,
    clock: SharedClock,
    inner: Mutex<LeaseSnapshot>,
}

impl Lease {
    /// A new lease that is already expired and has no owner.
    pub fn new(config: LeaseConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(LeaseSnapshot::unheld()),
        }
    }

    /// A new lease held by `owner` for one full duration.
    pub fn held_by(owner: RegionId, config: LeaseConfig, clock: SharedClock) -> Self {
        let expiration = clock.now_millis().saturating_add(config.duration_ms);
        Self {
            config,
            clock,
            inner: Mutex::new(LeaseSnapshot {
                owner: Some(owner),
                expiration,
                next_owner: None,
                next_expiration: 0,
            }),
        }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    pub fn owner(&self) -> Option<RegionId> {
        self.inner.lock().owner.clone()
    }

    pub fn expiration(&self) -> u64 {
        self.inner.lock().expiration
    }

    pub fn next_owner(&self) -> Option<RegionId> {
        self.inner.lock().next_owner.clone()
    }

    pub fn next_expiration(&self) -> u64 {
        self.inner.lock().next_expiration
    }

    pub fn snapshot(&self) -> LeaseSnapshot {
        self.inner.lock().clone()
    }

    /// Ownership state. Does not consider expiry.
    pub fn state(&self) -> LeaseState {
        let inner = self.inner.lock();
        match (&inner.owner, &inner.next_owner) {
            (None, _) => LeaseState::Unheld,
            (Some(_), None) => LeaseState::Held,
            (Some(_), Some(_)) => LeaseState::HeldWithPendingTransition,
        }
    }

    // --- predicates ---

    /// Expired even allowing for the holder's clock running behind.
    pub fn is_expired(&self) -> bool {
        let inner = self.inner.lock();
        self.past(inner.expiration)
    }

    /// Possibly expired given clock skew. Used to trigger master rediscovery.
    pub fn maybe_expired(&self) -> bool {
        let inner = self.inner.lock();
        self.clock.now_millis().saturating_add(self.config.clock_bound_ms) > inner.expiration
    }

    /// Within the renewal lead of expiring.
    pub fn almost_expired(&self) -> bool {
        let inner = self.inner.lock();
        self.clock.now_millis().saturating_add(self.config.renew_lead_ms) > inner.expiration
    }

    /// The pending transition lease is expired, allowing for skew.
    pub fn is_next_expired(&self) -> bool {
        let inner = self.inner.lock();
        self.past(inner.next_expiration)
    }

    /// The pending transition lease is possibly expired.
    pub fn maybe_next_expired(&self) -> bool {
        let inner = self.inner.lock();
        self.clock.now_millis().saturating_add(self.config.clock_bound_ms) > inner.next_expiration
    }

    // --- transitions ---

    /// Take the lease if nobody holds it and no live transition is pending.
    pub fn acquire(&self, region: &RegionId) -> bool {
        let mut inner = self.inner.lock();
        if !self.past(inner.expiration) {
            return false;
        }
        if inner.next_owner.is_some() && !self.past(inner.next_expiration) {
            return false;
        }
        self.grant(&mut inner, region);
        debug!(region = %region, expiration = inner.expiration, "lease acquired");
        true
    }

    /// Extend the lease.
    ///
    /// Without a pending transition only the owner may renew. With one, only
    /// the next owner may renew, and only after the current lease expired,
    /// which activates the transition.
    pub fn renew(&self, region: &RegionId) -> bool {
        let mut inner = self.inner.lock();
        match inner.next_owner.clone() {
            Some(next) => {
                if &next != region || !self.past(inner.expiration) {
                    return false;
                }
                self.grant(&mut inner, region);
                debug!(region = %region, "pending lease transition activated");
            }
            None => {
                if inner.owner.as_ref() != Some(region) {
                    return false;
                }
                inner.expiration = self.clock.now_millis().saturating_add(self.config.duration_ms);
                debug!(region = %region, expiration = inner.expiration, "lease renewed");
            }
        }
        true
    }

    /// Give the lease up. Only the owner may release.
    pub fn release(&self, region: &RegionId) -> bool {
        let mut inner = self.inner.lock();
        if inner.owner.as_ref() != Some(region) {
            return false;
        }
        inner.owner = None;
        inner.expiration = 0;
        debug!(region = %region, "lease released");
        true
    }

    /// Forcefully take over the lease.
    ///
    /// If the current lease is still valid the takeover is deferred: a
    /// transition starting when it ends is scheduled and `false` is returned.
    pub fn take(&self, region: &RegionId) -> bool {
        let mut inner = self.inner.lock();
        if !self.past(inner.expiration) {
            inner.next_owner = Some(region.clone());
            inner.next_expiration = inner.expiration.saturating_add(self.config.duration_ms);
            debug!(
                region = %region,
                starts_after = inner.expiration,
                "lease takeover deferred until current lease expires"
            );
            return false;
        }
        self.grant(&mut inner, region);
        debug!(region = %region, "lease taken over");
        true
    }

    fn past(&self, deadline: u64) -> bool {
        self.clock.now_millis() > deadline.saturating_add(self.config.clock_bound_ms)
    }

    fn grant(&self, inner: &mut LeaseSnapshot, region: &RegionId) {
        inner.owner = Some(region.clone());
        inner.expiration = self.clock.now_millis().saturating_add(self.config.duration_ms);
        inner.next_owner = None;
        inner.next_expiration = 0;
    }
}
