//! Error types for the mqnic control plane

use thiserror::Error;

use crate::{FlowId, NumaNode, QueueId};

/// Control plane error type
#[derive(Error, Debug)]
pub enum NicError {
    /// Queue id beyond the registry's fixed capacity
    #[error("queue {id} exceeds registry capacity {max}")]
    CapacityExceeded {
        /// Requested id
        id: QueueId,
        /// Configured maximum
        max: usize,
    },

    /// Queue id registered twice
    #[error("queue {0} already registered")]
    QueueExists(QueueId),

    /// Queue not registered
    #[error("queue {0} not found")]
    QueueNotFound(QueueId),

    /// Flow absent from the queue it was looked up on
    #[error("flow {flow_id} not found on queue {queue_id}")]
    FlowNotFound {
        /// Flow id
        flow_id: FlowId,
        /// Queue searched
        queue_id: QueueId,
    },

    /// Flow lives on another queue; nothing was recorded
    #[error("flow {flow_id} is owned by queue {owner}")]
    FlowMigrated {
        /// Flow id
        flow_id: FlowId,
        /// Current owner
        owner: QueueId,
    },

    /// Per-queue flow table at capacity
    #[error("flow table full on queue {0}")]
    FlowTableFull(QueueId),

    /// Queue is in Failed status and accepts no new flows
    #[error("queue {0} has failed")]
    QueueFailed(QueueId),

    /// Source and destination of a move are the same queue
    #[error("source and destination are both queue {0}")]
    SameQueue(QueueId),

    /// No healthy queue available as failover target
    #[error("no replacement queue available for queue {0}")]
    NoReplacement(QueueId),

    /// More completions reported than work submitted
    #[error("queue {queue_id}: completing {completed} with only {pending} pending")]
    PendingUnderflow {
        /// Queue id
        queue_id: QueueId,
        /// Outstanding work
        pending: u64,
        /// Completions reported
        completed: u64,
    },

    /// Device rejected a submission
    #[error("device busy on queue {0}")]
    DeviceBusy(QueueId),

    /// Buffer pool of a NUMA domain has no free buffers
    #[error("buffer pool exhausted on NUMA node {0}")]
    PoolExhausted(NumaNode),

    /// Pin/map for device access failed
    #[error("map error: {0}")]
    Map(String),

    /// Interrupt vector request failed
    #[error("interrupt vector error on queue {queue_id}: {reason}")]
    Vector {
        /// Queue id
        queue_id: QueueId,
        /// Collaborator message
        reason: String,
    },

    /// Configuration rejected
    #[error("config error: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse error class, used to decide how callers react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Registry full, pool exhausted, table full: drop or back off
    Capacity,
    /// Flow/queue absent: caller bug or a race already resolved
    NotFound,
    /// Submission rejected by the device
    DeviceBusy,
    /// Pin/map or vector setup failure for one operation
    Map,
    /// Bookkeeping invariant would be violated
    Invariant,
    /// Configuration or (de)serialization problem
    Config,
}

impl NicError {
    /// Class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            NicError::CapacityExceeded { .. }
            | NicError::FlowTableFull(_)
            | NicError::PoolExhausted(_) => ErrorClass::Capacity,
            NicError::QueueNotFound(_)
            | NicError::FlowNotFound { .. }
            | NicError::FlowMigrated { .. } => ErrorClass::NotFound,
            NicError::DeviceBusy(_) => ErrorClass::DeviceBusy,
            NicError::Map(_) | NicError::Vector { .. } => ErrorClass::Map,
            NicError::QueueExists(_)
            | NicError::QueueFailed(_)
            | NicError::SameQueue(_)
            | NicError::NoReplacement(_)
            | NicError::PendingUnderflow { .. } => ErrorClass::Invariant,
            NicError::InvalidConfig(_) | NicError::Io(_) | NicError::Json(_) => {
                ErrorClass::Config
            }
        }
    }

    /// Not-found errors are logged and otherwise ignored.
    pub fn is_benign(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }
}

/// Result type for the control plane
pub type NicResult<T> = Result<T, NicError>;
