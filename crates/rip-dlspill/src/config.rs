use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::container::PurgeLevel;
use crate::error::{Result, SpillError};

/// Byte count that deserializes from either an integer or a human string
/// such as `"4MiB"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(pub u64);

impl Serialize for ByteSize {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bytes(u64),
            Human(String),
        }

        let repr = Repr::deserialize(deserializer)?;
        match repr {
            Repr::Bytes(value) => Ok(ByteSize(value)),
            Repr::Human(value) => rip_memory::parse_byte_size(&value)
                .map(ByteSize)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Tuning for display-list spilling.
///
/// Loaded from a TOML table; every key is optional:
/// ```toml
/// enabled = true
/// max_purge_level = "aggregated" # "none" | "payloads" | "aggregated"
/// aggregate_cap = 256
/// load_buffer_limit = "4MiB"
/// node_pool_capacity = 64
/// scratch_dir = "/var/tmp/rip"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpillConfig {
    pub enabled: bool,

    /// Highest purge phase the store will run.
    pub max_purge_level: PurgeLevel,

    /// Maximum number of objects packed into one aggregate record.
    pub aggregate_cap: usize,

    /// Upper bound for the scratch load buffer. Payloads whose record would
    /// not fit stay resident.
    pub load_buffer_limit: ByteSize,

    /// Number of spare container nodes kept back for aggregation.
    pub node_pool_capacity: usize,

    /// Directory for the per-page scratch file; the system temp dir if unset.
    pub scratch_dir: Option<PathBuf>,

    /// Per-chain guess of what a payload purge frees, used when soliciting.
    pub payload_estimate_per_chain: ByteSize,

    /// Per-chain guess of what a header aggregation frees.
    pub header_estimate_per_chain: ByteSize,

    pub payload_cost: f32,
    pub aggregate_cost: f32,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_purge_level: PurgeLevel::Aggregated,
            aggregate_cap: 256,
            load_buffer_limit: ByteSize(4 * rip_memory::MB),
            node_pool_capacity: 64,
            scratch_dir: None,
            payload_estimate_per_chain: ByteSize(16 * rip_memory::KB),
            header_estimate_per_chain: ByteSize(4 * rip_memory::KB),
            payload_cost: 2.0,
            aggregate_cost: 8.0,
        }
    }
}

impl SpillConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SpillConfig =
            toml::from_str(text).map_err(|err| SpillError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.aggregate_cap == 0 {
            return Err(SpillError::Config(
                "aggregate_cap must be at least 1".to_string(),
            ));
        }
        if !(self.payload_cost.is_finite() && self.aggregate_cost.is_finite()) {
            return Err(SpillError::Config("costs must be finite".to_string()));
        }
        Ok(())
    }

    /// Run-length cap actually used by aggregation.
    pub fn effective_aggregate_cap(&self) -> usize {
        self.aggregate_cap.clamp(1, u16::MAX as usize)
    }

    pub(crate) fn load_buffer_limit_bytes(&self) -> usize {
        usize::try_from(self.load_buffer_limit.0).unwrap_or(usize::MAX)
    }
}
