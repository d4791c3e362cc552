//! Red packet engine
//!
//! Splits a funded amount into shares, hands them out to concurrent
//! claimers exactly once, reconciles gateway callbacks and refunds what is
//! left when a packet expires.
//!
//! # Architecture
//!
//! - **Single writer per packet**: claims, sweeps and reconciliation hold the
//!   packet's lock for their whole read-modify-write cycle
//! - **Atomic batches**: every state change lands in one RocksDB `WriteBatch`
//! - **Derived state**: remaining shares and balances are computed from
//!   write-once rows, never from counters
//!
//! # Invariants
//!
//! - Σ share amounts == packet total, from creation on
//! - A share is claimed at most once, by at most one claim per account
//! - Status only moves forward along the lifecycle graph
//! - Each gateway transaction id is applied at most once

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod allocator;
pub mod claims;
pub mod config;
pub mod engine;
pub mod error;
pub mod locks;
pub mod metrics;
pub mod reconciler;
pub mod retry;
pub mod rewards;
pub mod storage;
pub mod sweeper;
pub mod types;

// Re-exports
pub use claims::ClaimRequest;
pub use config::Config;
pub use engine::{CreatePacket, PacketEngine};
pub use error::{Error, ErrorCategory, Result};
pub use reconciler::{CallbackAck, CallbackOutcome, PaymentCallback};
pub use sweeper::SweepReport;
pub use types::{
    AccountBalance, AccountId, Anomaly, AnomalyKind, ClaimReceipt, CouponGrant, Invitation,
    InvitationCredit, LedgerEntry, Notification, PacketId, PacketStatus, PacketView,
    PaymentStatus, SplitPolicy,
};
