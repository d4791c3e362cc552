//! Packet engine - wires storage, locks and the engine components together

use crate::{
    allocator,
    claims::{ClaimCoordinator, ClaimRequest},
    locks::KeyLocks,
    metrics::Metrics,
    reconciler::{CallbackAck, PaymentCallback, PaymentReconciler},
    retry::RetryPolicy,
    rewards::Rewards,
    storage::Storage,
    sweeper::{SweepReport, Sweeper},
    types::{
        AccountBalance, AccountId, Anomaly, ClaimAttempt, ClaimReceipt, CouponGrant, Invitation,
        InvitationCredit, LedgerEntry, Notification, Packet, PacketId, PacketStatus, PacketView,
        Share, SplitPolicy,
    },
    Config, Error, Result,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Packet creation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePacket {
    pub owner_id: AccountId,
    pub total_amount: u64,
    pub share_count: u32,
    pub policy: SplitPolicy,
    pub greeting: Option<String>,
}

/// Red packet engine
pub struct PacketEngine {
    config: Config,
    storage: Arc<Storage>,
    claims: ClaimCoordinator,
    reconciler: Arc<PaymentReconciler>,
    sweeper: Arc<Sweeper>,
    rewards: Arc<Rewards>,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl PacketEngine {
    /// Open engine, creating the database if needed
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        info!(
            service = %config.service_name,
            version = %config.service_version,
            data_dir = ?config.data_dir,
            "Opening packet engine"
        );

        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Metrics::new()?;
        let retry = RetryPolicy::new(config.retry.clone());
        let lock_timeout = Duration::from_millis(config.claims.lock_timeout_ms);
        let packet_locks = Arc::new(KeyLocks::new(lock_timeout));

        let rewards = Arc::new(Rewards::new(
            storage.clone(),
            config.rewards.clone(),
            lock_timeout,
        ));
        let claims = ClaimCoordinator::new(
            storage.clone(),
            packet_locks.clone(),
            rewards.clone(),
            retry.clone(),
            metrics.clone(),
        );
        let reconciler = Arc::new(PaymentReconciler::new(
            storage.clone(),
            packet_locks.clone(),
            lock_timeout,
            retry.clone(),
            metrics.clone(),
            config.reconciler.clone(),
        ));
        let sweeper = Arc::new(Sweeper::new(
            storage.clone(),
            packet_locks,
            retry.clone(),
            metrics.clone(),
            config.sweeper.clone(),
        ));

        Ok(Self {
            config,
            storage,
            claims,
            reconciler,
            sweeper,
            rewards,
            retry,
            metrics,
        })
    }

    /// Create a pending packet and its shares.
    ///
    /// The packet becomes claimable once the gateway confirms funding.
    pub async fn create_packet(&self, request: CreatePacket) -> Result<Packet> {
        let limits = &self.config.packets;

        request.owner_id.validate()?;
        if request.share_count == 0 || request.share_count > limits.max_share_count {
            return Err(Error::Validation(format!(
                "share count must be 1..={}",
                limits.max_share_count
            )));
        }
        if request.total_amount > limits.max_total_amount {
            return Err(Error::Validation(format!(
                "total amount exceeds {}",
                limits.max_total_amount
            )));
        }
        let greeting = request.greeting.unwrap_or_default();
        if greeting.chars().count() > limits.max_greeting_chars {
            return Err(Error::Validation(format!(
                "greeting longer than {} characters",
                limits.max_greeting_chars
            )));
        }

        let amounts = allocator::allocate(request.total_amount, request.share_count, request.policy)?;

        let now = Utc::now();
        let packet = Packet {
            packet_id: PacketId::new(),
            owner_id: request.owner_id,
            total_amount: request.total_amount,
            share_count: request.share_count,
            policy: request.policy,
            status: PacketStatus::Pending,
            greeting,
            created_at: now,
            expires_at: now + seconds(limits.ttl_secs),
            funding_deadline: now + seconds(self.config.reconciler.funding_timeout_secs),
            funding_reference: None,
            review_hold: None,
            updated_at: now,
        };
        let shares: Vec<Share> = amounts
            .iter()
            .enumerate()
            .map(|(index, amount)| Share::new(packet.packet_id, index as u32, *amount))
            .collect();

        self.retry
            .run("create_packet", || async {
                let mut batch = self.storage.batch();
                batch.put_packet(&packet, None)?;
                for share in &shares {
                    batch.put_share(share)?;
                }
                self.storage.commit(batch)
            })
            .await?;

        self.metrics.record_packet_created();
        info!(
            packet_id = %packet.packet_id,
            owner_id = %packet.owner_id,
            total_amount = packet.total_amount,
            share_count = packet.share_count,
            policy = %packet.policy,
            "Packet created"
        );

        Ok(packet)
    }

    /// Packet with derived claim counts
    pub fn packet(&self, packet_id: PacketId) -> Result<PacketView> {
        let packet = self.storage.load_packet(packet_id)?;
        let shares = self.storage.get_shares(packet_id)?;
        Ok(PacketView::build(&packet, &shares))
    }

    /// Claim audit trail, oldest first
    pub fn claim_attempts(&self, packet_id: PacketId) -> Result<Vec<ClaimAttempt>> {
        self.storage.load_packet(packet_id)?;
        self.storage.get_attempts(packet_id)
    }

    /// Claim one share
    pub async fn claim(&self, request: ClaimRequest) -> Result<ClaimReceipt> {
        self.claims.claim(request).await
    }

    /// Apply a verified gateway callback
    pub async fn handle_callback(&self, callback: PaymentCallback) -> Result<CallbackAck> {
        self.reconciler.handle_callback(callback).await
    }

    /// Refund pending packets past their funding deadline
    pub async fn expire_unfunded(&self, now: DateTime<Utc>) -> Result<usize> {
        self.reconciler.expire_unfunded(now).await
    }

    /// Run one expiry sweep
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        self.sweeper.sweep(now).await
    }

    /// Report of the most recent sweep
    pub fn last_sweep(&self) -> Option<SweepReport> {
        self.sweeper.last_report()
    }

    /// Balance derived from the account's ledger entries
    pub fn balance(&self, account_id: &AccountId) -> Result<AccountBalance> {
        let entries = self.ledger_entries(account_id)?;
        let balance = entries.iter().try_fold(0u64, |acc, entry| {
            acc.checked_add(entry.amount).ok_or_else(|| {
                Error::InvariantViolation(format!("balance of {} overflows", account_id))
            })
        })?;
        Ok(AccountBalance {
            account_id: account_id.clone(),
            balance,
            entry_count: entries.len(),
        })
    }

    /// Ledger entries of an account, in sequence order
    pub fn ledger_entries(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>> {
        account_id.validate()?;
        self.storage.get_ledger_entries(account_id)
    }

    /// Coupons issued to an account
    pub fn coupons(&self, account_id: &AccountId) -> Result<Vec<CouponGrant>> {
        account_id.validate()?;
        self.rewards.coupons(account_id)
    }

    /// Invitation credits earned by an account
    pub fn invitation_credits(&self, account_id: &AccountId) -> Result<Vec<InvitationCredit>> {
        account_id.validate()?;
        self.rewards.invitation_credits(account_id)
    }

    /// Register who invited `invitee_id`
    pub async fn register_invitation(
        &self,
        inviter_id: &AccountId,
        invitee_id: &AccountId,
    ) -> Result<Invitation> {
        self.retry
            .run("register_invitation", || {
                self.rewards
                    .register_invitation(inviter_id, invitee_id, Utc::now())
            })
            .await
    }

    /// Notification outbox of an account
    pub fn notifications(&self, account_id: &AccountId) -> Result<Vec<Notification>> {
        account_id.validate()?;
        self.storage.get_notifications(account_id)
    }

    /// Most recent anomalies, newest first
    pub fn anomalies(&self, limit: usize) -> Result<Vec<Anomaly>> {
        self.storage.get_anomalies(limit)
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start the funding watchdog and, if enabled, the expiry sweeper.
    ///
    /// Tasks finish their current pass and exit when `token` is cancelled.
    pub fn spawn_background(&self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = vec![tokio::spawn(self.reconciler.clone().run(token.clone()))];
        if self.config.sweeper.enabled {
            handles.push(tokio::spawn(self.sweeper.clone().run(token)));
        } else {
            info!("Expiry sweeper disabled");
        }
        handles
    }

    /// Flush and close storage
    pub fn shutdown(self) -> Result<()> {
        let PacketEngine {
            storage,
            claims,
            reconciler,
            sweeper,
            rewards,
            ..
        } = self;
        drop((claims, reconciler, sweeper, rewards));

        match Arc::try_unwrap(storage) {
            Ok(storage) => storage.close(),
            Err(_) => {
                warn!("Storage still referenced by a background task, skipping close");
                Ok(())
            }
        }
    }
}

// Bounded by `MAX_WINDOW_SECS` in `Config::validate`
fn seconds(secs: u64) -> ChronoDuration {
    ChronoDuration::seconds(secs as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::CallbackOutcome;
    use crate::types::{EntryKind, PaymentStatus};
    use tempfile::TempDir;

    fn test_engine() -> (PacketEngine, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        (PacketEngine::open(config).unwrap(), temp_dir)
    }

    fn create(owner: &str, total: u64, shares: u32, policy: SplitPolicy) -> CreatePacket {
        CreatePacket {
            owner_id: AccountId::new(owner),
            total_amount: total,
            share_count: shares,
            policy,
            greeting: Some("Happy new year".into()),
        }
    }

    async fn fund(engine: &PacketEngine, packet: &Packet) {
        let ack = engine
            .handle_callback(PaymentCallback {
                gateway_tx_id: format!("tx-{}", packet.packet_id),
                packet_id: packet.packet_id,
                amount: packet.total_amount,
                raw_payload: "{}".into(),
                outcome: CallbackOutcome::Succeeded,
            })
            .await
            .unwrap();
        assert_eq!(ack, CallbackAck::Applied(PaymentStatus::Confirmed));
    }

    #[tokio::test]
    async fn test_create_packet_is_pending_with_shares() {
        let (engine, _temp) = test_engine();
        let packet = engine
            .create_packet(create("alice", 1000, 3, SplitPolicy::Even))
            .await
            .unwrap();

        assert_eq!(packet.status, PacketStatus::Pending);
        let view = engine.packet(packet.packet_id).unwrap();
        assert_eq!(view.share_count, 3);
        assert_eq!(view.claimed_count, 0);
        assert_eq!(engine.metrics().packets_created.get(), 1);
    }

    #[tokio::test]
    async fn test_create_packet_validation() {
        let (engine, _temp) = test_engine();

        let too_small = engine
            .create_packet(create("alice", 2, 3, SplitPolicy::Random))
            .await
            .unwrap_err();
        assert!(matches!(too_small, Error::InvalidAllocation { .. }));

        let no_shares = engine
            .create_packet(create("alice", 10, 0, SplitPolicy::Even))
            .await
            .unwrap_err();
        assert!(matches!(no_shares, Error::Validation(_)));

        let mut long_greeting = create("alice", 10, 1, SplitPolicy::Even);
        long_greeting.greeting = Some("x".repeat(37));
        assert!(matches!(
            engine.create_packet(long_greeting).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_even_packet_claims_sum_to_total() {
        let (engine, _temp) = test_engine();
        let packet = engine
            .create_packet(create("owner", 1000, 3, SplitPolicy::Even))
            .await
            .unwrap();
        fund(&engine, &packet).await;

        let mut amounts = Vec::new();
        for account in ["a", "b", "c"] {
            let receipt = engine
                .claim(ClaimRequest {
                    packet_id: packet.packet_id,
                    account_id: AccountId::new(account),
                    idempotency_key: format!("{}-1", account),
                })
                .await
                .unwrap();
            amounts.push(receipt.share_amount);
        }
        amounts.sort_unstable();

        assert_eq!(amounts, vec![333, 333, 334]);
        assert_eq!(
            engine.packet(packet.packet_id).unwrap().status,
            PacketStatus::Exhausted
        );
        assert_eq!(engine.balance(&AccountId::new("a")).unwrap().entry_count, 1);
    }

    #[tokio::test]
    async fn test_expired_packet_refund_reaches_owner_balance() {
        let (engine, _temp) = test_engine();
        let packet = engine
            .create_packet(create("owner", 250, 5, SplitPolicy::Even))
            .await
            .unwrap();
        fund(&engine, &packet).await;

        for account in ["a", "b", "c"] {
            engine
                .claim(ClaimRequest {
                    packet_id: packet.packet_id,
                    account_id: AccountId::new(account),
                    idempotency_key: format!("{}-1", account),
                })
                .await
                .unwrap();
        }

        let report = engine
            .sweep(packet.expires_at + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.refunded_amount, 100);

        let balance = engine.balance(&AccountId::new("owner")).unwrap();
        assert_eq!(balance.balance, 100);
        let entries = engine.ledger_entries(&AccountId::new("owner")).unwrap();
        assert_eq!(entries[0].kind, EntryKind::RefundCredit);

        let late = engine
            .claim(ClaimRequest {
                packet_id: packet.packet_id,
                account_id: AccountId::new("d"),
                idempotency_key: "d-1".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(late, Error::PacketNotActive { .. }));
        assert_eq!(engine.last_sweep(), Some(report));
    }

    #[tokio::test]
    async fn test_claim_attempts_for_unknown_packet() {
        let (engine, _temp) = test_engine();
        assert!(matches!(
            engine.claim_attempts(PacketId::new()),
            Err(Error::PacketNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_background_tasks_stop_on_cancel() {
        let (engine, _temp) = test_engine();
        let token = CancellationToken::new();
        let handles = engine.spawn_background(token.clone());
        assert_eq!(handles.len(), 2);

        token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        engine.shutdown().unwrap();
    }
}
