//! The shuffle engine
//!
//! Ties placement, routing, queues and epochs into the four-operation
//! library surface: construct, `write`, `epoch_start`/`epoch_end`,
//! `finalize`. A [`Shuffle`] value owns all run-time state — there are
//! no hidden globals — and is handed the topology, transport and
//! delivery collaborators at construction.
//!
//! Writer threads call `write`; a fixed pool of progress threads drains
//! the sender queues, coalesces frames into batched transport calls and
//! runs receiver dispatch. Peer-to-worker assignment is static so each
//! queue has a single consumer and per-(src, dst) order survives.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use crossbeam::channel;
use parking_lot::Mutex;
use tracing::{info, warn};

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

use crate::config::ShuffleConfig;
use crate::envelope::{self, MAX_FRAME};
use crate::epoch::EpochLedger;
use crate::error::{Error, Result};
use crate::nexus::{Nexus, Rank};
use crate::placement::Placement;
use crate::queue::{BudgetGate, QueueSlot, SendQueue};
use crate::route::{self, RoutePolicy};
use crate::transport::{Completion, InboundHandler, Transport, WireMsg};

/// Local store callback, the external collaborator that persists a
/// delivered record.
///
/// Invoked from progress threads, possibly several at once; the
/// implementation's serialization is its own concern. An error return
/// is job-fatal: the record cannot be retried.
pub trait Delivery: Send + Sync {
    /// Persist one record under its fully qualified path
    fn deliver(&self, path: &str, payload: &[u8], epoch: u16)
        -> std::result::Result<(), String>;
}

impl<F> Delivery for F
where
    F: Fn(&str, &[u8], u16) -> std::result::Result<(), String> + Send + Sync,
{
    fn deliver(
        &self,
        path: &str,
        payload: &[u8],
        epoch: u16,
    ) -> std::result::Result<(), String> {
        self(path, payload, epoch)
    }
}

/// Per-rank statistics snapshot taken at finalize.
///
/// `merge` folds snapshots from many ranks, giving the host the same
/// job-wide reduction the deployed form performs before logging.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct ShuffleStats {
    /// Records this rank originated
    pub sent: u64,

    /// Frames that arrived over the wire
    pub received: u64,

    /// Records handed to the local store
    pub delivered: u64,

    /// Frames forwarded onward at an intermediate hop
    pub relayed: u64,

    /// Transport completions observed
    pub completed: u64,

    /// Deepest any sender queue has been
    pub max_queue_depth: u64,

    /// Sum of queue-depth samples taken at each enqueue
    pub acc_queue_depth: u64,

    /// Number of depth samples
    pub depth_samples: u64,
}

impl ShuffleStats {
    /// Fold another rank's snapshot into this one
    pub fn merge(&mut self, other: &ShuffleStats) {
        self.sent += other.sent;
        self.received += other.received;
        self.delivered += other.delivered;
        self.relayed += other.relayed;
        self.completed += other.completed;
        self.max_queue_depth = self.max_queue_depth.max(other.max_queue_depth);
        self.acc_queue_depth += other.acc_queue_depth;
        self.depth_samples += other.depth_samples;
    }

    /// Mean sender-queue depth over all enqueue samples
    pub fn mean_queue_depth(&self) -> f64 {
        if self.depth_samples == 0 {
            0.0
        } else {
            self.acc_queue_depth as f64 / self.depth_samples as f64
        }
    }
}

enum Control {
    Stop,
}

struct Core {
    cfg: ShuffleConfig,
    nexus: Arc<dyn Nexus>,
    transport: Arc<dyn Transport>,
    delivery: Arc<dyn Delivery>,
    placement: Placement,
    policy: RoutePolicy,
    queues: AHashMap<Rank, Arc<SendQueue>>,
    gate: BudgetGate,
    ledger: EpochLedger,
    fatal: Mutex<Option<Error>>,
    running: AtomicBool,
    sent: AtomicU64,
    received: AtomicU64,
    delivered: AtomicU64,
    relayed: AtomicU64,
    completed: AtomicU64,
}

impl Core {
    fn my_rank(&self) -> Rank {
        self.nexus.my_rank()
    }

    fn fatal_check(&self) -> Result<()> {
        match &*self.fatal.lock() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Latch the first fatal and close the gate so parked writers
    /// surface it instead of waiting on queues nothing will drain.
    fn latch_fatal(&self, err: Error) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            warn!(rank = self.my_rank(), %err, "shuffle fatal");
            *fatal = Some(err);
        }
        drop(fatal);
        self.gate.close();
    }

    /// Hand one decoded frame to the local store.
    fn deliver_frame(&self, frame: &envelope::Frame<'_>) -> Result<()> {
        let path = format!("{}/{}", self.cfg.store_dir, frame.fname);
        match self.delivery.deliver(&path, frame.payload, frame.epoch) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(msg) => {
                let err = Error::DeliveryFailure(format!(
                    "{} (src r{}, dst r{}, epoch {}): {}",
                    path, frame.src, frame.dst, frame.epoch, msg
                ));
                self.latch_fatal(err.clone());
                Err(err)
            }
        }
    }

    /// Receiver dispatch for one inbound frame: validate, then deliver
    /// or relay with `dst` unchanged.
    fn dispatch_one(&self, msg: &WireMsg) -> Result<()> {
        self.received.fetch_add(1, Ordering::Relaxed);

        let frame = match envelope::decode(&msg.bytes, msg.src, msg.dst) {
            Ok(frame) => frame,
            Err(err) => {
                self.latch_fatal(err.clone());
                return Err(err);
            }
        };

        if frame.dst == self.my_rank() {
            return self.deliver_frame(&frame);
        }

        // Intermediate hop. Relay enqueues are charged but never
        // parked: a progress thread must not wait on the gate it is
        // responsible for draining.
        let peer = match route::next_hop(self.policy, self.nexus.as_ref(), frame.dst) {
            Some(peer) => peer,
            None => {
                let err = Error::Other(format!(
                    "no route for relayed frame r{} >> r{}",
                    frame.src, frame.dst
                ));
                self.latch_fatal(err.clone());
                return Err(err);
            }
        };
        let queue = match self.queues.get(&peer) {
            Some(queue) => queue,
            None => {
                let err =
                    Error::Other(format!("no sender queue toward peer r{}", peer));
                self.latch_fatal(err.clone());
                return Err(err);
            }
        };

        self.gate.charge(msg.bytes.len());
        self.ledger.charge(frame.epoch);
        queue.push(QueueSlot {
            src: frame.src,
            dst: frame.dst,
            epoch: frame.epoch,
            bytes: msg.bytes.clone(),
            submitted: Instant::now(),
        })?;
        self.relayed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stats_snapshot(&self) -> ShuffleStats {
        let mut stats = ShuffleStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            ..ShuffleStats::default()
        };
        for queue in self.queues.values() {
            stats.max_queue_depth = stats
                .max_queue_depth
                .max(queue.stats.max_depth.load(Ordering::Relaxed));
            stats.acc_queue_depth += queue.stats.acc_depth.load(Ordering::Relaxed);
            stats.depth_samples += queue.stats.samples.load(Ordering::Relaxed);
        }
        stats
    }
}

struct Dispatcher {
    core: Arc<Core>,
}

impl InboundHandler for Dispatcher {
    fn on_batch(&self, _peer: Rank, batch: &[WireMsg]) -> Result<()> {
        for msg in batch {
            self.core.dispatch_one(msg)?;
        }
        Ok(())
    }
}

/// Drain one queue into at most one batched transport call.
fn pump(core: &Arc<Core>, queue: &Arc<SendQueue>) -> bool {
    let mut batch = Vec::new();
    let mut costs: Vec<(u16, usize)> = Vec::new();
    let mut total = 0usize;

    while batch.len() < core.cfg.batch_frames {
        let slot = match queue.try_pop() {
            Some(slot) => slot,
            None => break,
        };
        // Hard per-call byte cap: a slot that would overshoot goes back
        // for the next batch. A lone frame above the cap still ships by
        // itself or it could never leave the queue.
        if !batch.is_empty() && total + slot.bytes.len() > core.cfg.batch_bytes {
            queue.unpop(slot);
            break;
        }
        total += slot.bytes.len();
        costs.push((slot.epoch, slot.bytes.len()));
        batch.push(WireMsg {
            src: slot.src,
            dst: slot.dst,
            bytes: slot.bytes,
        });
    }
    if batch.is_empty() {
        return false;
    }

    let peer = queue.peer;
    let me = core.my_rank();
    let done_core = Arc::clone(core);
    let done: Completion = Box::new(move |result| {
        match result {
            Ok(()) => {
                done_core
                    .completed
                    .fetch_add(costs.len() as u64, Ordering::Relaxed);
            }
            Err(err) => {
                // Latch before discharging: a drain waiter woken by the
                // discharge must already see the fatal.
                done_core.latch_fatal(Error::TransportFatal(format!(
                    "hop r{} >> r{}: {}",
                    me, peer, err
                )));
            }
        }
        // Discharge even on failure so epoch_end surfaces the fatal
        // instead of hanging on a count that can no longer drain.
        for (epoch, len) in &costs {
            done_core.ledger.discharge(*epoch);
            done_core.gate.release(*len);
        }
    });
    core.transport.forward(peer, batch, done);
    true
}

fn progress_loop(
    core: Arc<Core>,
    queues: Vec<Arc<SendQueue>>,
    control_rx: channel::Receiver<Control>,
) {
    while core.running.load(Ordering::Acquire) {
        if let Ok(Control::Stop) = control_rx.try_recv() {
            break;
        }

        let mut progressed = false;
        for queue in &queues {
            if pump(&core, queue) {
                progressed = true;
            }
        }
        if !progressed {
            // Idle; avoid busy waiting.
            thread::sleep(Duration::from_micros(100));
        }
    }
}

/// The shuffle engine: one value per rank, owned by the host
pub struct Shuffle {
    core: Arc<Core>,
    workers: Vec<JoinHandle<()>>,
    control_txs: Vec<channel::Sender<Control>>,
}

impl Shuffle {
    /// Construct the engine, build the placement table, register the
    /// inbound dispatcher and start the progress pool.
    pub fn new(
        cfg: ShuffleConfig,
        nexus: Arc<dyn Nexus>,
        transport: Arc<dyn Transport>,
        delivery: Arc<dyn Delivery>,
    ) -> Result<Self> {
        cfg.validate()?;

        let world = nexus.world_size();
        if cfg.paranoid {
            if let Some(expected) = cfg.expected_world {
                if expected != world {
                    return Err(Error::PlacementInconsistency(format!(
                        "nexus reports {} ranks, bootstrap reported {}",
                        world, expected
                    )));
                }
            }
        }

        let placement = Placement::from_config(&cfg, world)?;
        let policy = if cfg.three_hop {
            RoutePolicy::ThreeHop
        } else {
            RoutePolicy::Direct
        };

        if nexus.my_rank() == 0 {
            if cfg.three_hop {
                info!("using the scalable 3-hop shuffler");
            } else {
                warn!("using the direct shuffler: may not scale past small worlds");
            }
            if cfg.bypass_placement {
                warn!("ring placement bypassed");
            } else {
                info!(
                    world,
                    virtual_factor = cfg.virtual_factor,
                    "placement ring ready"
                );
            }
            if cfg.subnet == "127.0.0.1" {
                warn!(subnet = %cfg.subnet, "using loopback subnet");
            } else {
                info!(subnet = %cfg.subnet, "using subnet");
            }
            if cfg.transport_proto.contains("tcp") {
                warn!(proto = %cfg.transport_proto, "using tcp transport");
            } else {
                info!(proto = %cfg.transport_proto, "transport ready");
            }
            info!(addr = %nexus.addr_of(nexus.my_rank()), "local endpoint");
        }

        let peers = route::possible_peers(policy, nexus.as_ref());
        let queues: AHashMap<Rank, Arc<SendQueue>> = peers
            .iter()
            .map(|peer| (*peer, Arc::new(SendQueue::new(*peer))))
            .collect();
        let gate = BudgetGate::new(cfg.byte_budget, cfg.queue_depth);

        // No point running more progress threads than queues or cores.
        let num_workers = cfg
            .progress_threads
            .min(peers.len())
            .min(num_cpus::get().max(1));
        let pin_cores = cfg.cpu_affinity;

        let core = Arc::new(Core {
            cfg,
            nexus,
            transport,
            delivery,
            placement,
            policy,
            queues,
            gate,
            ledger: EpochLedger::new(),
            fatal: Mutex::new(None),
            running: AtomicBool::new(true),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            relayed: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        });

        core.transport.register(Arc::new(Dispatcher {
            core: Arc::clone(&core),
        }));

        // Static peer-to-worker assignment: each queue gets exactly one
        // consumer, preserving per-(src, dst) order.
        let mut workers = Vec::with_capacity(num_workers);
        let mut control_txs = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let mine: Vec<Arc<SendQueue>> = peers
                .iter()
                .enumerate()
                .filter(|(idx, _)| idx % num_workers == i)
                .map(|(_, peer)| Arc::clone(&core.queues[peer]))
                .collect();
            let (control_tx, control_rx) = channel::unbounded();
            let worker_core = Arc::clone(&core);

            let handle = thread::Builder::new()
                .name(format!("shuffle-progress-{}", i))
                .spawn(move || {
                    if pin_cores {
                        if let Some(core_ids) = core_affinity::get_core_ids() {
                            core_affinity::set_for_current(
                                core_ids[i % core_ids.len()],
                            );
                        }
                    }
                    progress_loop(worker_core, mine, control_rx);
                })
                .map_err(|e| {
                    Error::Other(format!("failed to spawn progress thread: {}", e))
                })?;

            workers.push(handle);
            control_txs.push(control_tx);
        }

        Ok(Self {
            core,
            workers,
            control_txs,
        })
    }

    /// The local rank
    pub fn my_rank(&self) -> Rank {
        self.core.my_rank()
    }

    /// Redirect one record to the rank owning its filename's bucket.
    ///
    /// Suspends only when a sender queue is full; with the non-blocking
    /// flag set, returns [`Error::Busy`] instead and the caller retries
    /// later. A destination of the local rank delivers in-process with
    /// zero hops.
    pub fn write(&self, fname: &str, payload: &[u8], epoch: u16) -> Result<()> {
        self.core.fatal_check()?;

        let src = self.core.my_rank();
        let dst = self.core.placement.place(fname);

        let mut buf = [0u8; MAX_FRAME];
        let len = envelope::encode(&mut buf, src, dst, fname, payload, epoch)?;

        if dst == src {
            // Loop-back still crosses the codec, so a single-rank job
            // exercises the same wire path as a large one.
            let frame = envelope::decode(&buf[..len], src, dst)?;
            return self.core.deliver_frame(&frame);
        }

        let peer = route::next_hop(self.core.policy, self.core.nexus.as_ref(), dst)
            .expect("non-local destination always has a next hop");
        let queue = &self.core.queues[&peer];

        let admitted = if self.core.cfg.nonblocking {
            self.core.gate.try_admit(queue, len)
        } else {
            self.core.gate.admit(queue, len)
        };
        if let Err(admit_err) = admitted {
            // A fatal closes the gate; report the fatal, not the
            // shutdown it caused.
            self.core.fatal_check()?;
            return Err(admit_err);
        }

        self.core.ledger.charge(epoch);
        queue.push(QueueSlot {
            src,
            dst,
            epoch,
            bytes: buf[..len].to_vec(),
            submitted: Instant::now(),
        })?;
        self.core.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Open epoch `e`.
    ///
    /// The surrounding application barriers before calling this on
    /// every rank. Wakes senders that were back-pressured with a stale
    /// epoch.
    pub fn epoch_start(&self, epoch: u16) -> Result<()> {
        self.core.fatal_check()?;
        let leftover = self.core.ledger.begin_epoch(epoch);
        if leftover != 0 {
            let err = Error::Other(format!(
                "epoch {} started with {} frames in flight",
                epoch, leftover
            ));
            if self.core.cfg.paranoid {
                self.core.latch_fatal(err.clone());
                return Err(err);
            }
            debug_assert!(false, "{}", err);
        }
        self.core.gate.wake_all();
        Ok(())
    }

    /// Close epoch `e`: drain every in-flight frame of the epoch.
    ///
    /// On return no frame of epoch `e` exists anywhere in this rank's
    /// core. Idempotent once drained. With a configured deadline,
    /// expiry is fatal and the diagnostic carries per-queue depths.
    pub fn epoch_end(&self, epoch: u16) -> Result<()> {
        let started = Instant::now();
        loop {
            self.core.fatal_check()?;
            // Short waits so a fatal latched mid-drain surfaces instead
            // of hanging on a counter that can no longer move.
            if self.core.ledger.wait_drained(epoch, Duration::from_millis(20)) {
                // A failed completion discharges too; don't let the
                // drained count mask the fatal it latched.
                self.core.fatal_check()?;
                return Ok(());
            }
            if let Some(deadline) = self.core.cfg.epoch_deadline {
                if started.elapsed() >= deadline {
                    let err = Error::EpochTimeout {
                        epoch,
                        depths: self.queue_depths(),
                    };
                    self.core.latch_fatal(err.clone());
                    return Err(err);
                }
            }
        }
    }

    /// Per-peer sender queue depths, sorted by peer
    pub fn queue_depths(&self) -> Vec<(Rank, usize)> {
        let mut depths: Vec<(Rank, usize)> = self
            .core
            .queues
            .values()
            .map(|queue| (queue.peer, queue.len()))
            .collect();
        depths.sort_unstable_by_key(|(peer, _)| *peer);
        depths
    }

    /// Stop the progress pool, unregister from the transport and return
    /// this rank's statistics snapshot.
    ///
    /// Surfaces any latched fatal after teardown. The host reduces the
    /// snapshots across ranks with [`ShuffleStats::merge`].
    pub fn finalize(mut self) -> Result<ShuffleStats> {
        self.shutdown();
        let stats = self.core.stats_snapshot();
        if self.core.my_rank() == 0 && stats.depth_samples != 0 {
            info!(
                mean_queue_depth = format!("{:.3}", stats.mean_queue_depth()),
                max_queue_depth = stats.max_queue_depth,
                sent = stats.sent,
                delivered = stats.delivered,
                "shuffle finalized"
            );
        }
        self.core.fatal_check()?;
        Ok(stats)
    }

    fn shutdown(&mut self) {
        self.core.running.store(false, Ordering::Release);
        self.core.gate.close();
        for control_tx in &self.control_txs {
            let _ = control_tx.send(Control::Stop);
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        self.core.transport.unregister();
    }
}

impl Drop for Shuffle {
    fn drop(&mut self) {
        // Best effort for hosts that drop without finalizing.
        self.shutdown();
    }
}
