//! Forwarding routes
//!
//! Computes the next transport-level peer for a frame. The three-hop
//! policy funnels all inter-node traffic through per-node leaders
//! (`src -> my leader -> destination's leader -> dst`), eliding any hop
//! whose endpoints coincide; it caps the all-to-all connection count at
//! the node count squared rather than the rank count squared. The
//! direct policy sends straight to the destination and is acceptable
//! for small worlds and testing.
//!
//! Either way the envelope is immutable across hops: only the peer
//! address changes, never the frame's `src`/`dst` fields.

use crate::nexus::{Locality, Nexus, Rank};

/// Which forwarder variant the job selected at init
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutePolicy {
    /// Origin sends straight to the destination
    Direct,

    /// Relay through at most two node leaders
    ThreeHop,
}

/// The next peer for a frame sitting on `nx.my_rank()` bound for `dst`.
///
/// `None` means the frame is home: deliver locally. Applied again on
/// every intermediate rank, this walks the full route one hop at a time.
pub fn next_hop(policy: RoutePolicy, nx: &dyn Nexus, dst: Rank) -> Option<Rank> {
    match policy {
        RoutePolicy::Direct => match nx.classify(dst) {
            Locality::Local => None,
            _ => Some(dst),
        },
        RoutePolicy::ThreeHop => {
            let me = nx.my_rank();
            match nx.classify(dst) {
                Locality::Local => None,
                Locality::SameNode => {
                    if me == nx.my_leader() {
                        Some(dst)
                    } else {
                        Some(nx.my_leader())
                    }
                }
                Locality::Remote => {
                    if me == nx.my_leader() {
                        Some(nx.leader_of(dst))
                    } else {
                        Some(nx.my_leader())
                    }
                }
            }
        }
    }
}

/// Every peer this rank can ever address under `policy`.
///
/// Sender queues are created once at init for exactly this set, keeping
/// the queue table read-only afterwards.
pub fn possible_peers(policy: RoutePolicy, nx: &dyn Nexus) -> Vec<Rank> {
    let mut peers: Vec<Rank> = (0..nx.world_size())
        .filter_map(|dst| next_hop(policy, nx, dst))
        .collect();
    peers.sort_unstable();
    peers.dedup();
    peers
}
