//! Core types for the packet engine
//!
//! All types are designed for:
//! - Deterministic serialization (bincode on disk, JSON at the edge)
//! - Exact arithmetic (integer minor units, never floating point)
//! - Write-once history (shares, ledger entries, side-ledger grants)

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum account identifier length
pub const MAX_ACCOUNT_ID_LEN: usize = 64;

/// Packet identifier (UUIDv7 for time-ordering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PacketId(Uuid);

impl PacketId {
    /// Generate a fresh id
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for PacketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque account identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accounts are `[A-Za-z0-9._@-]{1,64}`; storage keys rely on the
    /// absence of 0x00 and routes rely on the absence of `/`.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() || self.0.len() > MAX_ACCOUNT_ID_LEN {
            return Err(Error::Validation(format!(
                "account id must be 1..={} characters",
                MAX_ACCOUNT_ID_LEN
            )));
        }
        let valid = self
            .0
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'@' | b'-'));
        if !valid {
            return Err(Error::Validation(format!(
                "account id {:?} contains unsupported characters",
                self.0
            )));
        }
        Ok(())
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a packet's total is split into shares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitPolicy {
    /// Equal shares, remainder spread over the first shares
    Even,
    /// Randomized shares bounded by twice the running fair share
    Random,
}

impl fmt::Display for SplitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitPolicy::Even => write!(f, "even"),
            SplitPolicy::Random => write!(f, "random"),
        }
    }
}

/// Packet lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PacketStatus {
    /// Created, waiting for the gateway to confirm funding
    Pending = 1,
    /// Funded and claimable
    Active = 2,
    /// Deadline observed, waiting for the sweeper
    Expired = 3,
    /// Sweeper is returning unclaimed funds
    Refunding = 4,
    /// Unclaimed funds returned, or funding never arrived (terminal)
    Refunded = 5,
    /// Every share claimed (terminal)
    Exhausted = 6,
}

impl PacketStatus {
    /// Index key tag
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Check if packet is in terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, PacketStatus::Refunded | PacketStatus::Exhausted)
    }

    /// Allowed edges of the lifecycle graph
    pub fn can_transition_to(self, next: PacketStatus) -> bool {
        use PacketStatus::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Refunded)
                | (Active, Exhausted)
                | (Active, Expired)
                | (Active, Refunding)
                | (Expired, Refunding)
                | (Expired, Exhausted)
                | (Refunding, Refunded)
        )
    }
}

impl fmt::Display for PacketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PacketStatus::Pending => "pending",
            PacketStatus::Active => "active",
            PacketStatus::Expired => "expired",
            PacketStatus::Refunding => "refunding",
            PacketStatus::Refunded => "refunded",
            PacketStatus::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

/// A red packet: a fixed total divided into claimable shares
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Unique packet ID
    pub packet_id: PacketId,

    /// Account that funded the packet and receives refunds
    pub owner_id: AccountId,

    /// Total amount in minor units
    pub total_amount: u64,

    /// Number of shares
    pub share_count: u32,

    /// Split policy used at creation
    pub policy: SplitPolicy,

    /// Current status
    pub status: PacketStatus,

    /// Greeting shown to claimers
    pub greeting: String,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Claims stop at this instant
    pub expires_at: DateTime<Utc>,

    /// Pending packets are abandoned after this instant
    pub funding_deadline: DateTime<Utc>,

    /// Gateway transaction that funded the packet
    pub funding_reference: Option<String>,

    /// Gateway transaction parked for operator review
    pub review_hold: Option<String>,

    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl Packet {
    /// Move to `next`, rejecting edges outside the lifecycle graph
    pub fn transition(&mut self, next: PacketStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                packet_id: self.packet_id,
                from: self.status,
                to: next,
            });
        }
        tracing::debug!(
            packet_id = %self.packet_id,
            from = %self.status,
            to = %next,
            "Packet transition"
        );
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Check whether the claim deadline has passed
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// When a background task next needs to look at this packet.
    ///
    /// `None` keeps the packet out of the due index entirely.
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            PacketStatus::Pending if self.review_hold.is_none() => Some(self.funding_deadline),
            PacketStatus::Pending => None,
            PacketStatus::Active | PacketStatus::Expired => Some(self.expires_at),
            PacketStatus::Refunding => Some(self.updated_at),
            PacketStatus::Refunded | PacketStatus::Exhausted => None,
        }
    }
}

/// One indivisible claimable portion of a packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Share {
    /// Owning packet
    pub packet_id: PacketId,

    /// Position in the allocation
    pub index: u32,

    /// Amount in minor units (>= 1)
    pub amount: u64,

    /// Claimer (write-once)
    pub claimed_by: Option<AccountId>,

    /// Claim timestamp
    pub claimed_at: Option<DateTime<Utc>>,

    /// Claim that took this share
    pub claim_id: Option<Uuid>,
}

impl Share {
    /// Unclaimed share
    pub fn new(packet_id: PacketId, index: u32, amount: u64) -> Self {
        Self {
            packet_id,
            index,
            amount,
            claimed_by: None,
            claimed_at: None,
            claim_id: None,
        }
    }

    /// Check whether someone holds this share
    pub fn is_claimed(&self) -> bool {
        self.claimed_by.is_some()
    }

    /// Assign the share; a second assignment is an invariant violation
    pub fn mark_claimed(
        &mut self,
        account_id: &AccountId,
        claim_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(holder) = &self.claimed_by {
            return Err(Error::InvariantViolation(format!(
                "share {} of packet {} already claimed by {}",
                self.index, self.packet_id, holder
            )));
        }
        self.claimed_by = Some(account_id.clone());
        self.claimed_at = Some(at);
        self.claim_id = Some(claim_id);
        Ok(())
    }
}

/// Outcome of one claim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOutcome {
    /// Share granted
    Granted,
    /// Account already holds a share of this packet
    AlreadyClaimed,
    /// Every share was taken
    NoSharesRemaining,
    /// Packet not claimable
    PacketNotActive,
}

/// Record of a claim attempt, used for replay detection and audit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimAttempt {
    /// Attempt ID; for granted attempts this is the claim id
    pub attempt_id: Uuid,

    /// Target packet
    pub packet_id: PacketId,

    /// Claiming account
    pub account_id: AccountId,

    /// Caller supplied retry token
    pub idempotency_key: String,

    /// Result
    pub outcome: ClaimOutcome,

    /// Share granted (if any)
    pub share_index: Option<u32>,

    /// Amount granted (if any)
    pub amount: Option<u64>,

    /// Attempt timestamp
    pub attempted_at: DateTime<Utc>,
}

/// Successful claim as returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimReceipt {
    /// Claim ID
    pub claim_id: Uuid,

    /// Packet claimed from
    pub packet_id: PacketId,

    /// Claimer
    pub account_id: AccountId,

    /// Amount credited
    pub share_amount: u64,

    /// When the share was taken
    pub claimed_at: DateTime<Utc>,

    /// True when served from the idempotency record
    pub replayed: bool,
}

impl ClaimReceipt {
    /// Build from a granted attempt
    pub fn from_attempt(attempt: &ClaimAttempt, replayed: bool) -> Result<Self> {
        let share_amount = match (attempt.outcome, attempt.amount) {
            (ClaimOutcome::Granted, Some(amount)) => amount,
            _ => {
                return Err(Error::InvariantViolation(format!(
                    "attempt {} is not a granted claim",
                    attempt.attempt_id
                )))
            }
        };
        Ok(Self {
            claim_id: attempt.attempt_id,
            packet_id: attempt.packet_id,
            account_id: attempt.account_id.clone(),
            share_amount,
            claimed_at: attempt.attempted_at,
            replayed,
        })
    }
}

/// Gateway payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// Received but not applied
    Initiated,
    /// Funding applied
    Confirmed,
    /// Gateway reported failure
    Failed,
}

/// Payment received from the gateway, unique by transaction id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    /// Gateway transaction ID
    pub gateway_tx_id: String,

    /// Packet being funded
    pub packet_id: PacketId,

    /// Amount reported by the gateway
    pub amount: u64,

    /// Status
    pub status: PaymentStatus,

    /// SHA-256 of the raw callback payload (hex)
    pub payload_hash: String,

    /// First delivery timestamp
    pub received_at: DateTime<Utc>,

    /// Anomaly raised while processing, if any
    pub anomaly: Option<AnomalyKind>,
}

/// Kind of balance ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Share claimed from a packet
    ClaimCredit,
    /// Unclaimed funds returned to the owner
    RefundCredit,
}

/// Append-only balance ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Credited account
    pub account_id: AccountId,

    /// Global monotonic sequence
    pub sequence: u64,

    /// Entry kind
    pub kind: EntryKind,

    /// Amount in minor units
    pub amount: u64,

    /// Packet that produced the entry
    pub packet_id: PacketId,

    /// Claim id or refund reference
    pub reference: Uuid,

    /// Recorded timestamp
    pub recorded_at: DateTime<Utc>,
}

/// Derived account balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalance {
    /// Account
    pub account_id: AccountId,

    /// Sum of all ledger entries
    pub balance: u64,

    /// Number of entries summed
    pub entry_count: usize,
}

/// Coupon issued for a claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponGrant {
    pub coupon_id: Uuid,
    pub account_id: AccountId,
    pub source_claim_id: Uuid,
    pub packet_id: PacketId,
    pub value: u64,
    pub issued_at: DateTime<Utc>,
}

/// Invitee -> inviter relation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    pub invitee_id: AccountId,
    pub inviter_id: AccountId,
    pub created_at: DateTime<Utc>,
}

/// Referral points credited to an inviter when their invitee claims
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationCredit {
    pub inviter_id: AccountId,
    pub invitee_id: AccountId,
    pub source_claim_id: Uuid,
    pub points: u64,
    pub credited_at: DateTime<Utc>,
}

/// Owner-facing notification kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PacketFunded,
    ShareClaimed,
    FundingFailed,
    PacketRefunded,
}

/// Outbox notification, written with the change it reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub notification_id: Uuid,
    pub account_id: AccountId,
    pub packet_id: PacketId,
    pub kind: NotificationKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// New notification stamped with a time-ordered id
    pub fn new(
        account_id: AccountId,
        packet_id: PacketId,
        kind: NotificationKind,
        message: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            notification_id: Uuid::now_v7(),
            account_id,
            packet_id,
            kind,
            message,
            created_at,
        }
    }
}

/// Reconciliation anomaly kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Callback amount differs from the packet total
    AmountMismatch,
    /// Same transaction id redelivered with a different payload
    ConflictingRedelivery,
    /// Second successful payment for an already funded packet
    DuplicateFunding,
    /// Successful payment for a packet already refunded
    FundingAfterClose,
    /// Successful payment naming a packet that does not exist
    UnknownPacket,
    /// Sweeper hit a non-transient error and quarantined the packet
    SweepFailed,
}

impl AnomalyKind {
    /// Metric label
    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyKind::AmountMismatch => "amount_mismatch",
            AnomalyKind::ConflictingRedelivery => "conflicting_redelivery",
            AnomalyKind::DuplicateFunding => "duplicate_funding",
            AnomalyKind::FundingAfterClose => "funding_after_close",
            AnomalyKind::UnknownPacket => "unknown_packet",
            AnomalyKind::SweepFailed => "sweep_failed",
        }
    }
}

/// Record on the operator review channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub anomaly_id: Uuid,
    pub kind: AnomalyKind,
    /// Empty when no payment is involved
    pub gateway_tx_id: String,
    pub packet_id: PacketId,
    pub detail: String,
    pub detected_at: DateTime<Utc>,
}

impl Anomaly {
    /// New anomaly stamped with a time-ordered id
    pub fn new(
        kind: AnomalyKind,
        gateway_tx_id: impl Into<String>,
        packet_id: PacketId,
        detail: String,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            anomaly_id: Uuid::now_v7(),
            kind,
            gateway_tx_id: gateway_tx_id.into(),
            packet_id,
            detail,
            detected_at,
        }
    }
}

/// Claimed share as shown on the packet page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub account_id: AccountId,
    pub amount: u64,
    pub claimed_at: DateTime<Utc>,
}

/// Read model of a packet with derived claim counts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketView {
    pub packet_id: PacketId,
    pub owner_id: AccountId,
    pub status: PacketStatus,
    pub policy: SplitPolicy,
    pub total_amount: u64,
    pub share_count: u32,
    pub claimed_count: u32,
    pub claimed_amount: u64,
    pub greeting: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub participants: Vec<Participant>,
}

impl PacketView {
    /// Derive counts from the packet's share rows
    pub fn build(packet: &Packet, shares: &[Share]) -> Self {
        let mut participants: Vec<Participant> = shares
            .iter()
            .filter_map(|share| match (&share.claimed_by, share.claimed_at) {
                (Some(account_id), Some(claimed_at)) => Some(Participant {
                    account_id: account_id.clone(),
                    amount: share.amount,
                    claimed_at,
                }),
                _ => None,
            })
            .collect();
        participants.sort_by_key(|p| p.claimed_at);

        Self {
            packet_id: packet.packet_id,
            owner_id: packet.owner_id.clone(),
            status: packet.status,
            policy: packet.policy,
            total_amount: packet.total_amount,
            share_count: packet.share_count,
            claimed_count: participants.len() as u32,
            claimed_amount: participants.iter().map(|p| p.amount).sum(),
            greeting: packet.greeting.clone(),
            created_at: packet.created_at,
            expires_at: packet.expires_at,
            participants,
        }
    }
}
