//! # Record Shuffle Library
//!
//! A transparent write-redirection core for parallel jobs that emit
//! small per-particle records. Every record is addressed by a logical
//! filename; a deterministic placement function names the single rank
//! that owns the filename's hash bucket, and the shuffle ships the
//! record there over an opaque point-to-point transport before handing
//! it to the local store.
//!
//! ## Key Features
//!
//! - **Deterministic placement**: consistent-hash ring (or an xxh32
//!   bypass) computed identically on every rank, no coordination
//! - **Compact wire envelope**: fixed-layout frames bounded at 523
//!   bytes, validated on receipt
//! - **Three-hop forwarding**: inter-node traffic funneled through
//!   per-node leaders, with a direct single-hop variant for small worlds
//! - **Epoch lifecycle**: flush-and-drain barriers with per-epoch
//!   in-flight accounting
//! - **Back-pressure**: bounded sender queues and a rank-wide byte
//!   budget gate writer threads
//!
//! ## Architecture
//!
//! ```text
//! writer threads                    progress pool
//!      │                                 │
//!      ▼                                 ▼
//! ┌───────────┐   ┌─────────────┐   ┌─────────┐   ┌───────────┐
//! │ placement │──>│ envelope    │──>│ sender  │──>│ transport │
//! │ (ring)    │   │ (encode)    │   │ queues  │   │ (forward) │
//! └───────────┘   └─────────────┘   └─────────┘   └─────┬─────┘
//!                                                       │
//!                ┌─────────────┐   ┌──────────┐         │
//!    local store │<── deliver ─│<──│ dispatch │<────────┘
//!                └─────────────┘   │ (decode) │ ──> relay onward
//!                                  └──────────┘
//! ```

#![warn(missing_docs, rust_2018_idioms)]
#![allow(dead_code)]

pub mod config;
pub mod envelope;
pub mod epoch;
pub mod error;
pub mod nexus;
pub mod placement;
pub mod queue;
pub mod route;
pub mod shuffler;
pub mod transport;

// Re-exports
pub use config::ShuffleConfig;
pub use envelope::{Frame, MAX_FNAME, MAX_FRAME, MAX_PAYLOAD, MIN_FRAME};
pub use error::{Error, Result};
pub use nexus::{Locality, Nexus, Rank, StaticNexus};
pub use placement::Placement;
pub use route::RoutePolicy;
pub use shuffler::{Delivery, Shuffle, ShuffleStats};
pub use transport::{Mesh, Transport, WireMsg};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::ShuffleConfig;
    pub use crate::error::{Error, Result};
    pub use crate::nexus::{Locality, Nexus, Rank, StaticNexus};
    pub use crate::shuffler::{Delivery, Shuffle, ShuffleStats};
    pub use crate::transport::{Mesh, Transport};
}
