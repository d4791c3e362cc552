//! Claim coordinator
//!
//! Serializes claims per packet and commits each granted claim, its ledger
//! credit, reward entries, owner notification and the possible `exhausted`
//! transition in one batch.

use crate::{
    locks::KeyLocks,
    metrics::Metrics,
    retry::RetryPolicy,
    rewards::Rewards,
    storage::Storage,
    types::{
        AccountId, ClaimAttempt, ClaimOutcome, ClaimReceipt, EntryKind, Notification,
        NotificationKind, PacketId, PacketStatus,
    },
    Error, Result,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Longest accepted idempotency key
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// Claim request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub packet_id: PacketId,
    pub account_id: AccountId,
    pub idempotency_key: String,
}

impl ClaimRequest {
    fn validate(&self) -> Result<()> {
        self.account_id.validate()?;
        if self.idempotency_key.is_empty() || self.idempotency_key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(Error::Validation(format!(
                "idempotency key must be 1..={} bytes",
                MAX_IDEMPOTENCY_KEY_LEN
            )));
        }
        Ok(())
    }
}

/// Claim coordinator
pub struct ClaimCoordinator {
    storage: Arc<Storage>,
    packet_locks: Arc<KeyLocks<PacketId>>,
    rewards: Arc<Rewards>,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl ClaimCoordinator {
    pub fn new(
        storage: Arc<Storage>,
        packet_locks: Arc<KeyLocks<PacketId>>,
        rewards: Arc<Rewards>,
        retry: RetryPolicy,
        metrics: Metrics,
    ) -> Self {
        Self {
            storage,
            packet_locks,
            rewards,
            retry,
            metrics,
        }
    }

    /// Claim one share of a packet for an account.
    ///
    /// Replaying an idempotency key returns the original receipt with
    /// `replayed` set. Transient store errors are retried; everything else is
    /// terminal for this attempt.
    pub async fn claim(&self, request: ClaimRequest) -> Result<ClaimReceipt> {
        request.validate()?;

        let started = Instant::now();
        let result = self.retry.run("claim", || self.try_claim(&request)).await;

        let amount = match &result {
            Ok(receipt) if !receipt.replayed => receipt.share_amount,
            _ => 0,
        };
        self.metrics
            .record_claim(outcome_label(&result), amount, started.elapsed().as_secs_f64());

        result
    }

    async fn try_claim(&self, request: &ClaimRequest) -> Result<ClaimReceipt> {
        let packet_id = request.packet_id;
        let _guard = self.packet_locks.acquire(packet_id).await?;
        let now = Utc::now();

        let mut packet = self.storage.load_packet(packet_id)?;

        if let Some(prior) = self
            .storage
            .get_idempotent_claim(packet_id, &request.idempotency_key)?
        {
            if prior.account_id != request.account_id {
                return Err(Error::IdempotencyConflict {
                    key: request.idempotency_key.clone(),
                });
            }
            debug!(packet_id = %packet_id, claim_id = %prior.attempt_id, "Claim replayed");
            return ClaimReceipt::from_attempt(&prior, true);
        }

        match packet.status {
            PacketStatus::Active if packet.is_expired_at(now) => {
                let previous = packet.clone();
                packet.transition(PacketStatus::Expired, now)?;

                let mut batch = self.storage.batch();
                batch.put_packet(&packet, Some(&previous))?;
                batch.put_attempt(&rejected(request, ClaimOutcome::PacketNotActive, now))?;
                self.storage.commit(batch)?;

                info!(packet_id = %packet_id, "Packet expired on claim");
                return Err(Error::PacketNotActive {
                    packet_id,
                    status: packet.status,
                });
            }
            PacketStatus::Active => {}
            PacketStatus::Exhausted => {
                self.record_rejection(request, ClaimOutcome::NoSharesRemaining, now)?;
                return Err(Error::NoSharesRemaining(packet_id));
            }
            status => {
                self.record_rejection(request, ClaimOutcome::PacketNotActive, now)?;
                return Err(Error::PacketNotActive { packet_id, status });
            }
        }

        if self
            .storage
            .get_claim(packet_id, &request.account_id)?
            .is_some()
        {
            self.record_rejection(request, ClaimOutcome::AlreadyClaimed, now)?;
            return Err(Error::AlreadyClaimed {
                packet_id,
                account_id: request.account_id.clone(),
            });
        }

        let mut shares = self.storage.get_shares(packet_id)?;
        let unclaimed: Vec<usize> = shares
            .iter()
            .enumerate()
            .filter(|(_, share)| !share.is_claimed())
            .map(|(pos, _)| pos)
            .collect();

        if unclaimed.is_empty() {
            self.record_rejection(request, ClaimOutcome::NoSharesRemaining, now)?;
            return Err(Error::NoSharesRemaining(packet_id));
        }

        let pick = unclaimed[random_index(unclaimed.len())];
        let claim_id = Uuid::now_v7();
        let share = &mut shares[pick];
        share.mark_claimed(&request.account_id, claim_id, now)?;

        let attempt = ClaimAttempt {
            attempt_id: claim_id,
            packet_id,
            account_id: request.account_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            outcome: ClaimOutcome::Granted,
            share_index: Some(share.index),
            amount: Some(share.amount),
            attempted_at: now,
        };

        let mut batch = self.storage.batch();
        batch.put_share(share)?;
        batch.put_granted_claim(&attempt)?;
        batch.credit(
            &request.account_id,
            EntryKind::ClaimCredit,
            share.amount,
            packet_id,
            claim_id,
            now,
        )?;
        self.rewards.stage(&mut batch, &attempt, share.amount, now)?;
        batch.put_notification(&Notification::new(
            packet.owner_id.clone(),
            packet_id,
            NotificationKind::ShareClaimed,
            format!("{} claimed {} from your packet", request.account_id, share.amount),
            now,
        ))?;

        let last_share = unclaimed.len() == 1;
        if last_share {
            let previous = packet.clone();
            packet.transition(PacketStatus::Exhausted, now)?;
            batch.put_packet(&packet, Some(&previous))?;
        }

        self.storage.commit(batch)?;

        info!(
            packet_id = %packet_id,
            account_id = %request.account_id,
            claim_id = %claim_id,
            amount = share.amount,
            remaining = unclaimed.len() - 1,
            "Share claimed"
        );

        ClaimReceipt::from_attempt(&attempt, false)
    }

    fn record_rejection(
        &self,
        request: &ClaimRequest,
        outcome: ClaimOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut batch = self.storage.batch();
        batch.put_attempt(&rejected(request, outcome, now))?;
        self.storage.commit(batch)?;
        debug!(packet_id = %request.packet_id, account_id = %request.account_id, ?outcome, "Claim rejected");
        Ok(())
    }
}

fn rejected(request: &ClaimRequest, outcome: ClaimOutcome, now: DateTime<Utc>) -> ClaimAttempt {
    ClaimAttempt {
        attempt_id: Uuid::now_v7(),
        packet_id: request.packet_id,
        account_id: request.account_id.clone(),
        idempotency_key: request.idempotency_key.clone(),
        outcome,
        share_index: None,
        amount: None,
        attempted_at: now,
    }
}

fn random_index(len: usize) -> usize {
    rand::thread_rng().gen_range(0..len)
}

fn outcome_label(result: &Result<ClaimReceipt>) -> &'static str {
    match result {
        Ok(receipt) if receipt.replayed => "replayed",
        Ok(_) => "granted",
        Err(Error::AlreadyClaimed { .. }) => "already_claimed",
        Err(Error::NoSharesRemaining(_)) => "no_shares_remaining",
        Err(Error::PacketNotActive { .. }) => "packet_not_active",
        Err(Error::PacketNotFound(_)) => "packet_not_found",
        Err(Error::IdempotencyConflict { .. }) => "idempotency_conflict",
        Err(Error::ServiceUnavailable(_)) => "unavailable",
        Err(_) => "error",
    }
}
