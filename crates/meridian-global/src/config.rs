//! Configuration for global tables.

use crate::error::{GlobalError, Result};
use meridian_core::{LeaseConfig, RegionId};
use meridian_store::Consistency;
use serde::{Deserialize, Serialize};

const DEFAULT_REGION: &str = "us-west-1";

/// Where the metadata table lives and how it is read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Master region of the metadata table. All metadata writes go here.
    pub home_region: RegionId,
    /// Regions holding a replica of the metadata table.
    pub replica_regions: Vec<RegionId>,
    /// Consistency of metadata reads. Writes are always strong.
    pub read_consistency: Consistency,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            home_region: RegionId::new(DEFAULT_REGION),
            replica_regions: vec![RegionId::new(DEFAULT_REGION)],
            read_consistency: Consistency::Eventual,
        }
    }
}

/// What to do with a scanned item whose version does not conflict with the
/// target's copy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyPolicy {
    /// Apply only if the target has no copy or the source strictly dominates.
    #[default]
    SourceDominates,
    /// Always overwrite the target, even with an older copy.
    Always,
}

/// Replication engine settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub apply_policy: ApplyPolicy,
    /// Consistency of source scans.
    pub scan_consistency: Consistency,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            apply_policy: ApplyPolicy::SourceDominates,
            scan_consistency: Consistency::Strong,
        }
    }
}

/// Process-wide configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Region this process runs in.
    pub local_region: RegionId,
    pub metadata: MetadataConfig,
    pub lease: LeaseConfig,
    pub replication: ReplicationConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            local_region: RegionId::new(DEFAULT_REGION),
            metadata: MetadataConfig::default(),
            lease: LeaseConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: GlobalConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the lease protocol or metadata layout cannot work with.
    pub fn validate(&self) -> Result<()> {
        let lease = &self.lease;
        if lease.duration_ms == 0 {
            return Err(GlobalError::Config("lease duration must be positive".into()));
        }
        if lease.clock_bound_ms >= lease.duration_ms {
            return Err(GlobalError::Config(format!(
                "clock bound ({} ms) must be shorter than the lease duration ({} ms)",
                lease.clock_bound_ms, lease.duration_ms
            )));
        }
        if lease.renew_lead_ms >= lease.duration_ms {
            return Err(GlobalError::Config(format!(
                "renew lead ({} ms) must be shorter than the lease duration ({} ms)",
                lease.renew_lead_ms, lease.duration_ms
            )));
        }
        if !self
            .metadata
            .replica_regions
            .contains(&self.metadata.home_region)
        {
            return Err(GlobalError::Config(format!(
                "metadata home region {} is not one of the metadata replicas",
                self.metadata.home_region
            )));
        }
        Ok(())
    }
}

/// Builder for global configuration.
pub struct GlobalConfigBuilder {
    config: GlobalConfig,
}

impl GlobalConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: GlobalConfig::default(),
        }
    }

    pub fn local_region(mut self, region: impl Into<RegionId>) -> Self {
        self.config.local_region = region.into();
        self
    }

    /// Set the metadata home region, adding it to the metadata replicas.
    pub fn metadata_home(mut self, region: impl Into<RegionId>) -> Self {
        let region = region.into();
        if !self.config.metadata.replica_regions.contains(&region) {
            self.config.metadata.replica_regions.push(region.clone());
        }
        self.config.metadata.home_region = region;
        self
    }

    /// Replace the metadata replica set. The home region is kept in it.
    pub fn metadata_replicas<I, R>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<RegionId>,
    {
        let mut regions: Vec<RegionId> = regions.into_iter().map(Into::into).collect();
        if !regions.contains(&self.config.metadata.home_region) {
            regions.insert(0, self.config.metadata.home_region.clone());
        }
        self.config.metadata.replica_regions = regions;
        self
    }

    pub fn metadata_read_consistency(mut self, consistency: Consistency) -> Self {
        self.config.metadata.read_consistency = consistency;
        self
    }

    pub fn lease_duration(mut self, ms: u64) -> Self {
        self.config.lease.duration_ms = ms;
        self
    }

    pub fn clock_bound(mut self, ms: u64) -> Self {
        self.config.lease.clock_bound_ms = ms;
        self
    }

    pub fn renew_lead(mut self, ms: u64) -> Self {
        self.config.lease.renew_lead_ms = ms;
        self
    }

    pub fn apply_policy(mut self, policy: ApplyPolicy) -> Self {
        self.config.replication.apply_policy = policy;
        self
    }

    pub fn scan_consistency(mut self, consistency: Consistency) -> Self {
        self.config.replication.scan_consistency = consistency;
        self
    }

    pub fn build(self) -> GlobalConfig {
        self.config
    }
}

impl Default for GlobalConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
