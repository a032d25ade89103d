//! Deterministic record placement
//!
//! Maps a logical filename to the rank that owns its hash bucket. The
//! table is built once at init from `(protocol, world size, virtual
//! factor, seed 0)` and is read-only afterwards, so every rank computes
//! identical placements without coordination.
//!
//! Two modes: the default consistent-hash ring (virtual nodes, xxh64
//! keys), and a bypass that folds `xxh32(fname)` over the world size.
//! The two are NOT placement-compatible with each other; a job picks one
//! at init and keeps it.

use std::collections::BTreeMap;

use xxhash_rust::xxh32::xxh32;
use xxhash_rust::xxh64::xxh64;

use crate::config::ShuffleConfig;
use crate::error::{Error, Result};
use crate::nexus::Rank;

/// Hash seed shared by every rank
const PLACEMENT_SEED: u64 = 0;

/// Placement table, immutable once constructed
#[derive(Debug, Clone)]
pub enum Placement {
    /// Single-rank world: everything is local, nothing is hashed
    Single,

    /// `xxh32(fname) mod N`
    Bypass {
        /// World size
        world: u32,
    },

    /// Consistent-hash ring of `N * virtual_factor` slots
    Ring {
        /// Virtual node hash -> owning rank
        ring: BTreeMap<u64, Rank>,

        /// World size
        world: u32,
    },
}

impl Placement {
    /// Build the placement table for a world of `world` ranks.
    ///
    /// Fails on an unknown protocol name or a zero virtual factor.
    pub fn from_config(cfg: &ShuffleConfig, world: u32) -> Result<Self> {
        if world == 0 {
            return Err(Error::InvalidConfig("world size must be > 0".into()));
        }
        if world == 1 {
            return Ok(Placement::Single);
        }
        if cfg.bypass_placement {
            return Ok(Placement::Bypass { world });
        }
        if cfg.placement_proto != "ring" {
            return Err(Error::InvalidConfig(format!(
                "unknown placement protocol {:?}",
                cfg.placement_proto
            )));
        }
        if cfg.virtual_factor == 0 {
            return Err(Error::InvalidConfig("virtual_factor must be > 0".into()));
        }

        let mut ring = BTreeMap::new();
        for rank in 0..world {
            for vnode in 0..cfg.virtual_factor as u32 {
                ring.insert(vnode_hash(rank, vnode), rank);
            }
        }

        Ok(Placement::Ring { ring, world })
    }

    /// The rank that owns `fname`'s bucket.
    ///
    /// Pure and deterministic: identical on every rank for identical
    /// construction parameters.
    pub fn place(&self, fname: &str) -> Rank {
        match self {
            Placement::Single => 0,
            Placement::Bypass { world } => {
                xxh32(fname.as_bytes(), PLACEMENT_SEED as u32) % world
            }
            Placement::Ring { ring, .. } => {
                let key = xxh64(fname.as_bytes(), PLACEMENT_SEED);

                // Ring successor: first virtual node at or after the key,
                // wrapping to the lowest node.
                match ring.range(key..).next() {
                    Some((_, rank)) => *rank,
                    None => *ring.values().next().expect("ring is never empty"),
                }
            }
        }
    }

    /// World size the table was built for
    pub fn world_size(&self) -> u32 {
        match self {
            Placement::Single => 1,
            Placement::Bypass { world } => *world,
            Placement::Ring { world, .. } => *world,
        }
    }
}

/// Position of one virtual node on the ring.
///
/// Hashes the little-endian `(rank, vnode)` pair so the ring layout is a
/// pure function of the construction parameters.
fn vnode_hash(rank: Rank, vnode: u32) -> u64 {
    let mut key = [0u8; 8];
    key[..4].copy_from_slice(&rank.to_le_bytes());
    key[4..].copy_from_slice(&vnode.to_le_bytes());
    xxh64(&key, PLACEMENT_SEED)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(world: u32, vf: usize) -> Placement {
        let cfg = ShuffleConfig::new().with_virtual_factor(vf);
        Placement::from_config(&cfg, world).unwrap()
    }

    #[test]
    fn test_single_rank_never_hashes() {
        let p = Placement::from_config(&ShuffleConfig::new(), 1).unwrap();
        assert!(matches!(p, Placement::Single));
        assert_eq!(p.place("anything"), 0);
        assert_eq!(p.place(""), 0);
    }

    #[test]
    fn test_ring_is_deterministic() {
        // Two independently built tables agree on every query, the way
        // two ranks of the same job must.
        let a = ring(16, 64);
        let b = ring(16, 64);
        for i in 0..500 {
            let fname = format!("particle-{}", i);
            assert_eq!(a.place(&fname), b.place(&fname));
        }
    }

    #[test]
    fn test_ring_stays_in_range() {
        let p = ring(7, 32);
        for i in 0..1000 {
            let fname = format!("p{}", i);
            assert!(p.place(&fname) < 7);
        }
    }

    #[test]
    fn test_ring_spreads_load() {
        let p = ring(8, 256);
        let mut hits = [0usize; 8];
        for i in 0..4000 {
            hits[p.place(&format!("electron.{}", i)) as usize] += 1;
        }
        // Every rank owns a share; no rank owns everything.
        for (rank, count) in hits.iter().enumerate() {
            assert!(*count > 0, "rank {} owns no buckets", rank);
            assert!(*count < 4000, "rank {} owns every bucket", rank);
        }
    }

    #[test]
    fn test_bypass_is_mod_n() {
        let cfg = ShuffleConfig::new().with_bypass_placement(true);
        let p = Placement::from_config(&cfg, 5).unwrap();
        for i in 0..100 {
            let fname = format!("p{}", i);
            let expect = xxh32(fname.as_bytes(), 0) % 5;
            assert_eq!(p.place(&fname), expect);
        }
    }

    #[test]
    fn test_bypass_and_ring_diverge() {
        // The two modes hash differently (xxh32 vs xxh64) and are not
        // placement-compatible. Verify they disagree somewhere so the
        // incompatibility stays observable.
        let bypass = Placement::from_config(
            &ShuffleConfig::new().with_bypass_placement(true),
            16,
        )
        .unwrap();
        let ring = ring(16, 128);
        let disagree = (0..200)
            .map(|i| format!("ion-{}", i))
            .any(|f| bypass.place(&f) != ring.place(&f));
        assert!(disagree);
    }

    #[test]
    fn test_unknown_protocol_is_rejected() {
        let mut cfg = ShuffleConfig::new();
        cfg.placement_proto = "hash_lookup3".to_string();
        assert!(matches!(
            Placement::from_config(&cfg, 4),
            Err(Error::InvalidConfig(_))
        ));
    }
}
