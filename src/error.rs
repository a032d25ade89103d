//! Error types for the shuffle core

use std::fmt;

use crate::nexus::Rank;

/// Result type alias for shuffle operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in shuffle operations
///
/// Every variant except [`Error::Busy`] is fatal to the job: the core
/// latches the first fatal it observes and returns it from every
/// subsequent operation, so a top-level handler can print the one-line
/// diagnostic and exit. Nothing is retried.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A sender queue is saturated (non-blocking mode only)
    Busy,

    /// Caller handed us a record the wire format cannot carry
    InvalidRecord(String),

    /// An inbound frame failed validation
    CorruptFrame(String),

    /// Topology disagrees with the configured world
    PlacementInconsistency(String),

    /// The transport reported a failed completion
    TransportFatal(String),

    /// The local store callback rejected a delivered record
    DeliveryFailure(String),

    /// An epoch drain exceeded its configured deadline
    EpochTimeout {
        /// The epoch that failed to drain
        epoch: u16,

        /// Per-peer queue depths at expiry, for diagnosing the stuck hop
        depths: Vec<(Rank, usize)>,
    },

    /// Invalid configuration
    InvalidConfig(String),

    /// The core is shutting down
    Shutdown,

    /// Other error
    Other(String),
}

impl Error {
    /// Whether this error is job-fatal.
    ///
    /// `Busy` is the only recoverable condition; callers retry it after
    /// an application-defined interval. Everything else aborts the job.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Busy)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Busy => write!(f, "Sender queue saturated"),
            Error::InvalidRecord(msg) => write!(f, "Invalid record: {}", msg),
            Error::CorruptFrame(msg) => write!(f, "Corrupt frame: {}", msg),
            Error::PlacementInconsistency(msg) => {
                write!(f, "Placement inconsistency: {}", msg)
            }
            Error::TransportFatal(msg) => write!(f, "Transport failure: {}", msg),
            Error::DeliveryFailure(msg) => write!(f, "Delivery failure: {}", msg),
            Error::EpochTimeout { epoch, depths } => {
                write!(f, "Epoch {} drain timed out; queue depths:", epoch)?;
                for (peer, depth) in depths {
                    write!(f, " r{}={}", peer, depth)?;
                }
                Ok(())
            }
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::Shutdown => write!(f, "Shuffle core is shut down"),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl<T> From<flume::SendError<T>> for Error {
    fn from(_: flume::SendError<T>) -> Self {
        Error::Shutdown
    }
}

impl From<flume::RecvError> for Error {
    fn from(_: flume::RecvError) -> Self {
        Error::Shutdown
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(_: crossbeam::channel::SendError<T>) -> Self {
        Error::Shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_is_recoverable() {
        assert!(!Error::Busy.is_fatal());
        assert!(Error::CorruptFrame("bad src".into()).is_fatal());
        assert!(Error::TransportFatal("hop r0 >> r3".into()).is_fatal());
        assert!(Error::Shutdown.is_fatal());
    }

    #[test]
    fn test_epoch_timeout_diagnostic_names_queues() {
        let err = Error::EpochTimeout {
            epoch: 7,
            depths: vec![(1, 12), (3, 0)],
        };
        let msg = err.to_string();
        assert!(msg.contains("Epoch 7"));
        assert!(msg.contains("r1=12"));
        assert!(msg.contains("r3=0"));
    }
}
