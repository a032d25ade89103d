//! Shuffle configuration
//!
//! Deployment knobs arrive through `SHUFFLE_*` environment variables;
//! everything else is a construction-time parameter with a documented
//! default. An environment value that is empty or the literal `"0"`
//! counts as unset.

use std::time::Duration;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

use crate::envelope::MAX_FRAME;
use crate::error::{Error, Result};

/// Default virtual nodes per rank for ring placement
pub const DEFAULT_VIRTUAL_FACTOR: usize = 1024;

/// Default ring construction protocol
pub const DEFAULT_PLACEMENT_PROTO: &str = "ring";

/// Default subnet prefix for peer address synthesis
pub const DEFAULT_SUBNET: &str = "127.0.0.1";

/// Default transport protocol descriptor
pub const DEFAULT_TRANSPORT_PROTO: &str = "bmi+tcp";

/// Default per-queue depth bound (`D_max`)
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Default rank-wide enqueued-byte budget (`B_max`)
pub const DEFAULT_BYTE_BUDGET: usize = 1 << 20;

/// Default maximum frames coalesced into one transport call
pub const DEFAULT_BATCH_FRAMES: usize = 4;

/// Default maximum bytes coalesced into one transport call
pub const DEFAULT_BATCH_BYTES: usize = 32 << 10;

/// Default network progress thread count
pub const DEFAULT_PROGRESS_THREADS: usize = 4;

/// Shuffle configuration
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct ShuffleConfig {
    /// Directory prefixed onto filenames at delivery time
    pub store_dir: String,

    /// Route through per-node leaders instead of sending direct
    pub three_hop: bool,

    /// Use `xxh32(fname) mod N` instead of the consistent-hash ring
    pub bypass_placement: bool,

    /// Virtual nodes per rank for ring placement
    pub virtual_factor: usize,

    /// Ring construction protocol name
    pub placement_proto: String,

    /// Subnet prefix used when synthesizing peer addresses
    pub subnet: String,

    /// Transport protocol descriptor (e.g. a BMI-over-TCP identifier)
    pub transport_proto: String,

    /// Per-queue depth bound for writer admission (`D_max`)
    pub queue_depth: usize,

    /// Rank-wide enqueued-byte budget for writer admission (`B_max`)
    pub byte_budget: usize,

    /// Maximum frames per batched transport call
    pub batch_frames: usize,

    /// Maximum bytes per batched transport call
    pub batch_bytes: usize,

    /// Number of network progress threads
    pub progress_threads: usize,

    /// Pin progress threads to cores
    pub cpu_affinity: bool,

    /// Return `Busy` instead of blocking when admission fails
    pub nonblocking: bool,

    /// Enable extra init-time and epoch-boundary consistency checks
    pub paranoid: bool,

    /// World size known to the host bootstrap, cross-checked against
    /// the nexus under paranoid checks
    pub expected_world: Option<u32>,

    /// Hard deadline for `epoch_end` drains (`None` = wait forever)
    pub epoch_deadline: Option<Duration>,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            store_dir: ".".to_string(),
            three_hop: false,
            bypass_placement: false,
            virtual_factor: DEFAULT_VIRTUAL_FACTOR,
            placement_proto: DEFAULT_PLACEMENT_PROTO.to_string(),
            subnet: DEFAULT_SUBNET.to_string(),
            transport_proto: DEFAULT_TRANSPORT_PROTO.to_string(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            byte_budget: DEFAULT_BYTE_BUDGET,
            batch_frames: DEFAULT_BATCH_FRAMES,
            batch_bytes: DEFAULT_BATCH_BYTES,
            progress_threads: DEFAULT_PROGRESS_THREADS,
            cpu_affinity: false,
            nonblocking: false,
            paranoid: false,
            expected_world: None,
            epoch_deadline: None,
        }
    }
}

impl ShuffleConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration from the `SHUFFLE_*` environment
    ///
    /// Unset, empty, or `"0"` values fall back to defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        cfg.three_hop = env_set("SHUFFLE_Use_3hop");
        cfg.bypass_placement = env_set("SHUFFLE_Bypass_placement");

        if let Some(vf) = env_get("SHUFFLE_Virtual_factor") {
            if let Ok(vf) = vf.parse::<usize>() {
                cfg.virtual_factor = vf;
            }
        }
        if let Some(proto) = env_get("SHUFFLE_Placement_protocol") {
            cfg.placement_proto = proto;
        }
        if let Some(subnet) = env_get("SHUFFLE_Subnet") {
            cfg.subnet = subnet;
        }
        if let Some(proto) = env_get("SHUFFLE_Mercury_proto") {
            cfg.transport_proto = proto;
        }

        cfg
    }

    /// Set the delivery directory prefix
    pub fn with_store_dir(mut self, dir: impl Into<String>) -> Self {
        self.store_dir = dir.into();
        self
    }

    /// Select the three-hop forwarder
    pub fn with_three_hop(mut self, enable: bool) -> Self {
        self.three_hop = enable;
        self
    }

    /// Bypass ring placement with `xxh32 mod N`
    pub fn with_bypass_placement(mut self, enable: bool) -> Self {
        self.bypass_placement = enable;
        self
    }

    /// Set the virtual factor
    pub fn with_virtual_factor(mut self, vf: usize) -> Self {
        self.virtual_factor = vf;
        self
    }

    /// Set the per-queue depth bound
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Set the rank-wide byte budget
    pub fn with_byte_budget(mut self, bytes: usize) -> Self {
        self.byte_budget = bytes;
        self
    }

    /// Set the per-call batch limits
    pub fn with_batch_limits(mut self, frames: usize, bytes: usize) -> Self {
        self.batch_frames = frames;
        self.batch_bytes = bytes;
        self
    }

    /// Set the progress thread count
    pub fn with_progress_threads(mut self, n: usize) -> Self {
        self.progress_threads = n;
        self
    }

    /// Enable core pinning for progress threads
    pub fn with_cpu_affinity(mut self, enable: bool) -> Self {
        self.cpu_affinity = enable;
        self
    }

    /// Return `Busy` instead of blocking on saturated queues
    pub fn with_nonblocking(mut self, enable: bool) -> Self {
        self.nonblocking = enable;
        self
    }

    /// Enable paranoid consistency checks
    pub fn with_paranoid(mut self, enable: bool) -> Self {
        self.paranoid = enable;
        self
    }

    /// Record the world size the host bootstrap reported
    pub fn with_expected_world(mut self, world: u32) -> Self {
        self.expected_world = Some(world);
        self
    }

    /// Set a hard deadline for epoch drains
    pub fn with_epoch_deadline(mut self, deadline: Duration) -> Self {
        self.epoch_deadline = Some(deadline);
        self
    }

    /// Validate construction-time parameters
    pub fn validate(&self) -> Result<()> {
        if self.virtual_factor == 0 {
            return Err(Error::InvalidConfig("virtual_factor must be > 0".into()));
        }
        if self.queue_depth == 0 {
            return Err(Error::InvalidConfig("queue_depth must be > 0".into()));
        }
        if self.byte_budget < MAX_FRAME {
            return Err(Error::InvalidConfig(format!(
                "byte_budget must hold at least one full frame ({} bytes)",
                MAX_FRAME
            )));
        }
        if self.batch_frames == 0 || self.batch_bytes == 0 {
            return Err(Error::InvalidConfig("batch limits must be > 0".into()));
        }
        if self.progress_threads == 0 {
            return Err(Error::InvalidConfig(
                "progress_threads must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Whether an environment knob counts as set.
///
/// Empty values and the literal `"0"` count as unset.
pub fn env_set(key: &str) -> bool {
    match std::env::var(key) {
        Ok(val) => !val.is_empty() && val != "0",
        Err(_) => false,
    }
}

/// Read an environment knob, treating empty and `"0"` as unset.
pub fn env_get(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(val) if !val.is_empty() && val != "0" => Some(val),
        _ => None,
    }
}
