/// Failure classification for pool and session hygiene
use std::fmt;

use crate::error::ShardisError;

/// What kind of failure a protocol call produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultClass {
    /// The transport is gone; the connection cannot be used again
    ConnectionFatal,
    /// The server rejected the command; the connection is fine
    DataLevel,
    /// Anything else, handled like a fatal fault
    Generic,
}

/// What to do with the connection that produced a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Release,
    Evict,
}

pub struct FaultClassifier;

impl FaultClassifier {
    pub fn classify(error: &ShardisError) -> FaultClass {
        match error {
            ShardisError::ConnectionFatal { .. } | ShardisError::Timeout { .. } => {
                FaultClass::ConnectionFatal
            }
            ShardisError::Data { .. } => FaultClass::DataLevel,
            _ => FaultClass::Generic,
        }
    }
}

impl FaultClass {
    pub fn disposition(self) -> Disposition {
        match self {
            FaultClass::DataLevel => Disposition::Release,
            FaultClass::ConnectionFatal | FaultClass::Generic => Disposition::Evict,
        }
    }

    /// Whether a session bound to the failing connection must end
    pub fn clears_affinity(self) -> bool {
        self.disposition() == Disposition::Evict
    }
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultClass::ConnectionFatal => write!(f, "connection-fatal"),
            FaultClass::DataLevel => write!(f, "data-level"),
            FaultClass::Generic => write!(f, "generic"),
        }
    }
}
