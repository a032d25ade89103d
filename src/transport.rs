//! Transport capability
//!
//! The core never talks to the network directly. It sees an opaque
//! point-to-point fabric that delivers batches reliably and in order
//! between two ranks and fires a completion once the peer has accepted
//! (or rejected) the batch. Alongside each frame the fabric carries the
//! logical `(src, dst)` pair out-of-band, which is what receiver-side
//! validation checks the envelope against.
//!
//! [`Mesh`] is the in-process implementation: a registry of per-rank
//! inbound handlers wired directly together. It backs the test
//! scenarios and the demo programs, and records every transport-level
//! hop so routes can be asserted on.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use ahash::AHashMap;

use crate::error::{Error, Result};
use crate::nexus::Rank;

/// Completion callback for a forwarded batch
pub type Completion = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// One transport message: an encoded frame plus the out-of-band pair
#[derive(Debug, Clone)]
pub struct WireMsg {
    /// Logical source rank, carried by the fabric
    pub src: Rank,

    /// Logical destination rank, carried by the fabric
    pub dst: Rank,

    /// The encoded envelope
    pub bytes: Vec<u8>,
}

/// Receiver side of the fabric
pub trait InboundHandler: Send + Sync {
    /// Handle a batch arriving from `peer`.
    ///
    /// An error return is reported to the sending side through its
    /// completion. Invoked from progress threads; must be
    /// reentrant-safe with respect to enqueue operations.
    fn on_batch(&self, peer: Rank, batch: &[WireMsg]) -> Result<()>;
}

/// Sender side of the fabric, bound to one local rank
pub trait Transport: Send + Sync {
    /// Register the local inbound handler
    fn register(&self, handler: Arc<dyn InboundHandler>);

    /// Drop the local inbound handler (finalize)
    fn unregister(&self);

    /// Ship a batch to `peer`; `done` fires exactly once
    fn forward(&self, peer: Rank, batch: Vec<WireMsg>, done: Completion);
}

/// One observed transport-level transfer of a single frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopRecord {
    /// Sending endpoint
    pub from: Rank,

    /// Receiving endpoint
    pub to: Rank,

    /// Logical source the fabric carried alongside the frame
    pub src: Rank,

    /// Logical destination the fabric carried alongside the frame
    pub dst: Rank,
}

struct MeshInner {
    handlers: RwLock<AHashMap<Rank, Arc<dyn InboundHandler>>>,
    hops: Mutex<Vec<HopRecord>>,
}

/// In-process fabric connecting many rank endpoints in one process
#[derive(Clone)]
pub struct Mesh {
    inner: Arc<MeshInner>,
}

impl Mesh {
    /// Create an empty fabric
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MeshInner {
                handlers: RwLock::new(AHashMap::new()),
                hops: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The endpoint for one rank
    pub fn endpoint(&self, rank: Rank) -> MeshEndpoint {
        MeshEndpoint {
            rank,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Transport-level hops observed so far, one per frame, in send order
    pub fn hops(&self) -> Vec<HopRecord> {
        self.inner.hops.lock().clone()
    }

    /// Clear the hop trace
    pub fn clear_hops(&self) {
        self.inner.hops.lock().clear();
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}

/// One rank's view of a [`Mesh`]
pub struct MeshEndpoint {
    rank: Rank,
    inner: Arc<MeshInner>,
}

impl Transport for MeshEndpoint {
    fn register(&self, handler: Arc<dyn InboundHandler>) {
        self.inner.handlers.write().insert(self.rank, handler);
    }

    fn unregister(&self) {
        self.inner.handlers.write().remove(&self.rank);
    }

    fn forward(&self, peer: Rank, batch: Vec<WireMsg>, done: Completion) {
        let handler = self.inner.handlers.read().get(&peer).cloned();
        let handler = match handler {
            Some(h) => h,
            None => {
                done(Err(Error::TransportFatal(format!(
                    "no route r{} >> r{}",
                    self.rank, peer
                ))));
                return;
            }
        };

        {
            let mut hops = self.inner.hops.lock();
            for msg in &batch {
                hops.push(HopRecord {
                    from: self.rank,
                    to: peer,
                    src: msg.src,
                    dst: msg.dst,
                });
            }
        }

        // Direct invocation: delivery is synchronous and therefore
        // trivially ordered per (sender, peer).
        done(handler.on_batch(self.rank, &batch));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        seen: Mutex<Vec<(Rank, Vec<u8>)>>,
    }

    impl InboundHandler for Recorder {
        fn on_batch(&self, peer: Rank, batch: &[WireMsg]) -> Result<()> {
            let mut seen = self.seen.lock();
            for msg in batch {
                seen.push((peer, msg.bytes.clone()));
            }
            Ok(())
        }
    }

    fn msg(src: Rank, dst: Rank, byte: u8) -> WireMsg {
        WireMsg {
            src,
            dst,
            bytes: vec![byte],
        }
    }

    #[test]
    fn test_forward_reaches_handler_in_order() {
        let mesh = Mesh::new();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        mesh.endpoint(1).register(recorder.clone());

        let ep0 = mesh.endpoint(0);
        for i in 0..10 {
            ep0.forward(1, vec![msg(0, 1, i)], Box::new(|r| r.unwrap()));
        }

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 10);
        for (i, (peer, bytes)) in seen.iter().enumerate() {
            assert_eq!(*peer, 0);
            assert_eq!(bytes, &vec![i as u8]);
        }
        assert_eq!(mesh.hops().len(), 10);
        assert!(mesh
            .hops()
            .iter()
            .all(|h| (h.from, h.to, h.src, h.dst) == (0, 1, 0, 1)));
    }

    #[test]
    fn test_unknown_peer_fails_completion() {
        let mesh = Mesh::new();
        let failed = Arc::new(AtomicUsize::new(0));
        let failed2 = Arc::clone(&failed);
        mesh.endpoint(0).forward(
            9,
            vec![msg(0, 9, 1)],
            Box::new(move |r| {
                assert!(matches!(r, Err(Error::TransportFatal(_))));
                failed2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        // A failed forward is not a hop.
        assert!(mesh.hops().is_empty());
    }

    #[test]
    fn test_handler_error_reaches_sender() {
        struct Rejecting;
        impl InboundHandler for Rejecting {
            fn on_batch(&self, _peer: Rank, _batch: &[WireMsg]) -> Result<()> {
                Err(Error::CorruptFrame("bad dst".into()))
            }
        }

        let mesh = Mesh::new();
        mesh.endpoint(2).register(Arc::new(Rejecting));
        let got = Arc::new(Mutex::new(None));
        let got2 = Arc::clone(&got);
        mesh.endpoint(0).forward(
            2,
            vec![msg(0, 2, 0)],
            Box::new(move |r| *got2.lock() = Some(r)),
        );
        assert!(matches!(
            got.lock().take(),
            Some(Err(Error::CorruptFrame(_)))
        ));
    }

    #[test]
    fn test_unregister_breaks_route() {
        let mesh = Mesh::new();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        mesh.endpoint(1).register(recorder);
        mesh.endpoint(1).unregister();
        let ok = Arc::new(AtomicUsize::new(0));
        let ok2 = Arc::clone(&ok);
        mesh.endpoint(0).forward(
            1,
            vec![msg(0, 1, 0)],
            Box::new(move |r| {
                if r.is_err() {
                    ok2.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        assert_eq!(ok.load(Ordering::SeqCst), 1);
    }
}
