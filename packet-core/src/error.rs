//! Error types for the packet engine

use crate::types::{AccountId, PacketId, PacketStatus};
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classes used for retries and HTTP mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input, caller's fault, never retried
    Validation,
    /// Referenced record does not exist
    NotFound,
    /// Terminal for this attempt, surfaced to the caller
    Conflict,
    /// Lock contention or store back-pressure, retried internally
    Transient,
    /// Needs operator review
    Anomaly,
    /// Storage or invariant failure
    Internal,
}

/// Engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request
    #[error("Validation error: {0}")]
    Validation(String),

    /// Total cannot give every share at least one unit
    #[error("Invalid allocation: cannot split {total} into {shares} shares of at least one unit")]
    InvalidAllocation { total: u64, shares: u32 },

    /// Idempotency key already bound to another account
    #[error("Idempotency key {key:?} is already bound to another account")]
    IdempotencyConflict { key: String },

    /// Packet not found
    #[error("Packet not found: {0}")]
    PacketNotFound(PacketId),

    /// Packet is not claimable
    #[error("Packet {packet_id} is not active (status: {status})")]
    PacketNotActive {
        packet_id: PacketId,
        status: PacketStatus,
    },

    /// Account already holds a share
    #[error("Account {account_id} already claimed a share of packet {packet_id}")]
    AlreadyClaimed {
        packet_id: PacketId,
        account_id: AccountId,
    },

    /// All shares taken
    #[error("No shares remaining in packet {0}")]
    NoSharesRemaining(PacketId),

    /// Invitee already registered under another inviter
    #[error("Account {invitee_id} was already invited by another account")]
    AlreadyInvited { invitee_id: AccountId },

    /// Funding event for a packet that is no longer pending
    #[error("Packet {packet_id} is not awaiting funding (status: {status})")]
    PacketNotPending {
        packet_id: PacketId,
        status: PacketStatus,
    },

    /// Lifecycle edge not allowed
    #[error("Invalid transition for packet {packet_id}: {from} -> {to}")]
    InvalidTransition {
        packet_id: PacketId,
        from: PacketStatus,
        to: PacketStatus,
    },

    /// Callback amount differs from the packet total
    #[error("Amount mismatch for {gateway_tx_id}: expected {expected}, got {actual}")]
    AmountMismatch {
        gateway_tx_id: String,
        expected: u64,
        actual: u64,
    },

    /// Lock contention or store back-pressure
    #[error("Transient store error: {0}")]
    TransientStore(String),

    /// Transient errors persisted past the retry budget
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Invariant violation (money conservation, write-once, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Classify the error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Validation(_)
            | Error::InvalidAllocation { .. }
            | Error::IdempotencyConflict { .. } => ErrorCategory::Validation,
            Error::PacketNotFound(_) => ErrorCategory::NotFound,
            Error::PacketNotActive { .. }
            | Error::AlreadyClaimed { .. }
            | Error::NoSharesRemaining(_)
            | Error::AlreadyInvited { .. }
            | Error::PacketNotPending { .. }
            | Error::InvalidTransition { .. } => ErrorCategory::Conflict,
            Error::TransientStore(_) | Error::ServiceUnavailable(_) => ErrorCategory::Transient,
            Error::AmountMismatch { .. } => ErrorCategory::Anomaly,
            Error::Storage(_)
            | Error::Serialization(_)
            | Error::InvariantViolation(_)
            | Error::Config(_)
            | Error::Io(_)
            | Error::Metrics(_) => ErrorCategory::Internal,
        }
    }

    /// Only store contention is retried; `ServiceUnavailable` is the
    /// exhausted form and is not retried again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientStore(_))
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::InvalidAllocation { .. } => "INVALID_ALLOCATION",
            Error::IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",
            Error::PacketNotFound(_) => "PACKET_NOT_FOUND",
            Error::PacketNotActive { .. } => "PACKET_NOT_ACTIVE",
            Error::AlreadyClaimed { .. } => "ALREADY_CLAIMED",
            Error::NoSharesRemaining(_) => "NO_SHARES_REMAINING",
            Error::AlreadyInvited { .. } => "ALREADY_INVITED",
            Error::PacketNotPending { .. } => "PACKET_NOT_PENDING",
            Error::InvalidTransition { .. } => "INVALID_TRANSITION",
            Error::AmountMismatch { .. } => "AMOUNT_MISMATCH",
            Error::TransientStore(_) => "TRANSIENT_STORE_ERROR",
            Error::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::InvariantViolation(_) => "INVARIANT_VIOLATION",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Metrics(_) => "METRICS_ERROR",
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        use rocksdb::ErrorKind;

        match err.kind() {
            ErrorKind::Busy | ErrorKind::TimedOut | ErrorKind::TryAgain => {
                Error::TransientStore(err.to_string())
            }
            _ => Error::Storage(err.to_string()),
        }
    }
}
