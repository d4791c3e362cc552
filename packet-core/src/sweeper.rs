//! Expiry and refund sweeper
//!
//! Periodically walks the due index and closes packets whose claim window
//! has ended:
//!
//! 1. nothing left to claim: `exhausted`
//! 2. otherwise `refunding` is committed first, which stops claims
//! 3. the owner credit, notification and `refunded` status land together
//!
//! A packet found in `refunding` (crash between 2 and 3) only gets step 3.
//!
//! A packet that fails with a non-transient error is moved out of the due
//! index into quarantine and reported as an anomaly, so it cannot hold the
//! head of the index on every pass.

use crate::{
    config::SweeperConfig,
    locks::KeyLocks,
    metrics::Metrics,
    retry::RetryPolicy,
    storage::{DueEntry, Storage},
    types::{
        Anomaly, AnomalyKind, EntryKind, Notification, NotificationKind, Packet, PacketId,
        PacketStatus, Share,
    },
    Error, ErrorCategory, Result,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Summary of one sweep pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub scanned: usize,
    pub refunded_packets: usize,
    pub refunded_amount: u64,
    pub exhausted: usize,
    pub failed: usize,
    #[serde(default)]
    pub quarantined: usize,
    pub at: DateTime<Utc>,
}

impl SweepReport {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            scanned: 0,
            refunded_packets: 0,
            refunded_amount: 0,
            exhausted: 0,
            failed: 0,
            quarantined: 0,
            at,
        }
    }
}

/// What the sweeper did with one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Unclaimed amount returned to the owner
    Refunded(u64),
    /// No unclaimed share was left
    Exhausted,
    /// Not due, or already closed
    Skipped,
}

/// Expiry/refund sweeper
pub struct Sweeper {
    storage: Arc<Storage>,
    packet_locks: Arc<KeyLocks<PacketId>>,
    retry: RetryPolicy,
    metrics: Metrics,
    config: SweeperConfig,
    last_report: Mutex<Option<SweepReport>>,
}

impl Sweeper {
    pub fn new(
        storage: Arc<Storage>,
        packet_locks: Arc<KeyLocks<PacketId>>,
        retry: RetryPolicy,
        metrics: Metrics,
        config: SweeperConfig,
    ) -> Self {
        Self {
            storage,
            packet_locks,
            retry,
            metrics,
            config,
            last_report: Mutex::new(None),
        }
    }

    /// Close every packet due at `now`, up to `batch_limit` per status
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::new(now);

        // Unfinished refunds first
        for status in [PacketStatus::Refunding, PacketStatus::Expired, PacketStatus::Active] {
            let due = self
                .storage
                .due_entries(status, now, self.config.batch_limit)?;

            for entry in due {
                let packet_id = entry.packet_id;
                report.scanned += 1;
                match self
                    .retry
                    .run("sweep", || self.sweep_packet(packet_id, now))
                    .await
                {
                    Ok(SweepOutcome::Refunded(amount)) => {
                        report.refunded_packets += 1;
                        report.refunded_amount += amount;
                    }
                    Ok(SweepOutcome::Exhausted) => report.exhausted += 1,
                    Ok(SweepOutcome::Skipped) => {}
                    Err(e) => {
                        report.failed += 1;
                        warn!(packet_id = %packet_id, error = %e, "Sweep of packet failed");
                        if e.category() != ErrorCategory::Transient {
                            match self.quarantine(&entry, &e, now).await {
                                Ok(true) => report.quarantined += 1,
                                Ok(false) => {}
                                Err(qe) => {
                                    warn!(packet_id = %packet_id, error = %qe, "Quarantine failed")
                                }
                            }
                        }
                    }
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                refunded_packets = report.refunded_packets,
                refunded_amount = report.refunded_amount,
                exhausted = report.exhausted,
                failed = report.failed,
                quarantined = report.quarantined,
                "Sweep completed"
            );
        }

        *self.last_report.lock() = Some(report.clone());
        Ok(report)
    }

    /// Close one packet if it is due at `now`
    pub async fn sweep_packet(&self, packet_id: PacketId, now: DateTime<Utc>) -> Result<SweepOutcome> {
        let _guard = self.packet_locks.acquire(packet_id).await?;
        let mut packet = self.storage.load_packet(packet_id)?;

        match packet.status {
            PacketStatus::Active | PacketStatus::Expired => {
                if !packet.is_expired_at(now) {
                    return Ok(SweepOutcome::Skipped);
                }

                let shares = self.storage.get_shares(packet_id)?;
                let previous = packet.clone();

                if shares.iter().all(Share::is_claimed) {
                    packet.transition(PacketStatus::Exhausted, now)?;
                    let mut batch = self.storage.batch();
                    batch.put_packet(&packet, Some(&previous))?;
                    self.storage.commit(batch)?;
                    debug!(packet_id = %packet_id, "Expired packet had no unclaimed shares");
                    return Ok(SweepOutcome::Exhausted);
                }

                packet.transition(PacketStatus::Refunding, now)?;
                let mut batch = self.storage.batch();
                batch.put_packet(&packet, Some(&previous))?;
                self.storage.commit(batch)?;

                self.settle_refund(packet, &shares, now).map(SweepOutcome::Refunded)
            }
            PacketStatus::Refunding => {
                let shares = self.storage.get_shares(packet_id)?;
                info!(packet_id = %packet_id, "Resuming interrupted refund");
                self.settle_refund(packet, &shares, now).map(SweepOutcome::Refunded)
            }
            _ => Ok(SweepOutcome::Skipped),
        }
    }

    /// Take a failing packet off the due index; false if it moved meanwhile
    async fn quarantine(&self, entry: &DueEntry, cause: &Error, now: DateTime<Utc>) -> Result<bool> {
        let _guard = self.packet_locks.acquire(entry.packet_id).await?;
        if !self.storage.due_entry_exists(entry)? {
            return Ok(false);
        }

        let anomaly = Anomaly::new(
            AnomalyKind::SweepFailed,
            "",
            entry.packet_id,
            format!("{}: {}", cause.code(), cause),
            now,
        );
        let mut batch = self.storage.batch();
        batch.quarantine_due(entry)?;
        batch.put_anomaly(&anomaly)?;
        self.storage.commit(batch)?;

        self.metrics.record_anomaly(anomaly.kind.as_str());
        error!(
            anomaly_id = %anomaly.anomaly_id,
            packet_id = %entry.packet_id,
            detail = %anomaly.detail,
            "Packet quarantined by sweeper"
        );
        Ok(true)
    }

    fn settle_refund(&self, mut packet: Packet, shares: &[Share], now: DateTime<Utc>) -> Result<u64> {
        let amount: u64 = shares
            .iter()
            .filter(|share| !share.is_claimed())
            .map(|share| share.amount)
            .sum();

        let previous = packet.clone();
        packet.transition(PacketStatus::Refunded, now)?;

        let mut batch = self.storage.batch();
        batch.put_packet(&packet, Some(&previous))?;
        if amount > 0 {
            batch.credit(
                &packet.owner_id,
                EntryKind::RefundCredit,
                amount,
                packet.packet_id,
                refund_reference(packet.packet_id),
                now,
            )?;
        }
        batch.put_notification(&Notification::new(
            packet.owner_id.clone(),
            packet.packet_id,
            NotificationKind::PacketRefunded,
            format!("{} unclaimed from your packet was returned", amount),
            now,
        ))?;
        self.storage.commit(batch)?;

        self.metrics.record_refund(amount);
        info!(
            packet_id = %packet.packet_id,
            owner_id = %packet.owner_id,
            amount,
            "Packet refunded"
        );
        Ok(amount)
    }

    /// Report of the most recent pass
    pub fn last_report(&self) -> Option<SweepReport> {
        self.last_report.lock().clone()
    }

    /// Sweep loop; returns once `token` is cancelled
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(interval_secs = self.config.interval_secs, "Starting expiry sweeper");

        let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval_secs));

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        warn!("Sweep failed: {}", e);
                    }
                }
            }
        }

        info!("Expiry sweeper stopped");
    }
}

/// Deterministic reference of a packet's refund credit
pub fn refund_reference(packet_id: PacketId) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, packet_id.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::types::{AccountId, SplitPolicy};
    use crate::Config;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    struct Fixture {
        sweeper: Sweeper,
        storage: Arc<Storage>,
        _temp: TempDir,
    }

    fn fixture() -> Fixture {
        fixture_with(SweeperConfig::default())
    }

    fn fixture_with(sweeper_config: SweeperConfig) -> Fixture {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        config.rocksdb.sync_writes = false;

        let storage = Arc::new(Storage::open(&config).unwrap());
        let sweeper = Sweeper::new(
            storage.clone(),
            Arc::new(KeyLocks::new(Duration::from_millis(500))),
            RetryPolicy::new(RetryConfig::default()),
            Metrics::new().unwrap(),
            sweeper_config,
        );
        Fixture {
            sweeper,
            storage,
            _temp: temp,
        }
    }

    /// Packet whose deadline passed a second ago, first `claimed` shares taken
    fn seed(storage: &Storage, status: PacketStatus, amounts: &[u64], claimed: usize) -> Packet {
        seed_expiring(storage, status, amounts, claimed, Utc::now() - ChronoDuration::seconds(1))
    }

    fn seed_expiring(
        storage: &Storage,
        status: PacketStatus,
        amounts: &[u64],
        claimed: usize,
        expires_at: DateTime<Utc>,
    ) -> Packet {
        let now = Utc::now();
        let packet = Packet {
            packet_id: PacketId::new(),
            owner_id: AccountId::new("owner"),
            total_amount: amounts.iter().sum(),
            share_count: amounts.len() as u32,
            policy: SplitPolicy::Even,
            status,
            greeting: String::new(),
            created_at: now - ChronoDuration::hours(25),
            expires_at,
            funding_deadline: now - ChronoDuration::hours(24),
            funding_reference: Some("tx".into()),
            review_hold: None,
            updated_at: now - ChronoDuration::seconds(1),
        };
        let mut batch = storage.batch();
        batch.put_packet(&packet, None).unwrap();
        for (index, amount) in amounts.iter().enumerate() {
            let mut share = Share::new(packet.packet_id, index as u32, *amount);
            if index < claimed {
                share
                    .mark_claimed(&AccountId::new(format!("user-{}", index)), Uuid::now_v7(), now)
                    .unwrap();
            }
            batch.put_share(&share).unwrap();
        }
        storage.commit(batch).unwrap();
        packet
    }

    #[tokio::test]
    async fn test_refunds_unclaimed_remainder() {
        let fx = fixture();
        let packet = seed(&fx.storage, PacketStatus::Active, &[50; 5], 3);

        let report = fx.sweeper.sweep(Utc::now()).await.unwrap();

        assert_eq!(report.refunded_packets, 1);
        assert_eq!(report.refunded_amount, 100);
        let stored = fx.storage.load_packet(packet.packet_id).unwrap();
        assert_eq!(stored.status, PacketStatus::Refunded);

        let entries = fx.storage.get_ledger_entries(&packet.owner_id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::RefundCredit);
        assert_eq!(entries[0].amount, 100);
        assert_eq!(entries[0].reference, refund_reference(packet.packet_id));

        let notes = fx.storage.get_notifications(&packet.owner_id).unwrap();
        assert_eq!(notes[0].kind, NotificationKind::PacketRefunded);
    }

    #[tokio::test]
    async fn test_fully_claimed_expired_packet_is_exhausted() {
        let fx = fixture();
        let packet = seed(&fx.storage, PacketStatus::Expired, &[10, 10], 2);

        let report = fx.sweeper.sweep(Utc::now()).await.unwrap();

        assert_eq!(report.exhausted, 1);
        assert_eq!(report.refunded_packets, 0);
        assert_eq!(
            fx.storage.load_packet(packet.packet_id).unwrap().status,
            PacketStatus::Exhausted
        );
        assert!(fx.storage.get_ledger_entries(&packet.owner_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_refund_finishes_exactly_once() {
        let fx = fixture();
        let packet = seed(&fx.storage, PacketStatus::Refunding, &[30, 40], 1);

        let first = fx.sweeper.sweep(Utc::now()).await.unwrap();
        let second = fx.sweeper.sweep(Utc::now()).await.unwrap();

        assert_eq!(first.refunded_amount, 40);
        assert_eq!(second.scanned, 0);
        let entries = fx.storage.get_ledger_entries(&packet.owner_id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, 40);
    }

    #[tokio::test]
    async fn test_packet_before_deadline_untouched() {
        let fx = fixture();
        let packet = seed(&fx.storage, PacketStatus::Active, &[10], 0);

        let early = packet.expires_at - ChronoDuration::minutes(1);
        let report = fx.sweeper.sweep(early).await.unwrap();

        assert_eq!(report.scanned, 0);
        assert_eq!(
            fx.storage.load_packet(packet.packet_id).unwrap().status,
            PacketStatus::Active
        );
    }

    #[tokio::test]
    async fn test_last_report_is_kept() {
        let fx = fixture();
        assert!(fx.sweeper.last_report().is_none());

        seed(&fx.storage, PacketStatus::Active, &[5, 5], 0);
        let report = fx.sweeper.sweep(Utc::now()).await.unwrap();

        assert_eq!(fx.sweeper.last_report(), Some(report));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let fx = fixture();
        let sweeper = Arc::new(fx.sweeper);
        let token = CancellationToken::new();
        let handle = tokio::spawn(sweeper.clone().run(token.clone()));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_unreadable_packet_is_quarantined_and_stops_blocking() {
        let fx = fixture_with(SweeperConfig {
            batch_limit: 1,
            ..SweeperConfig::default()
        });
        let broken = seed_expiring(
            &fx.storage,
            PacketStatus::Active,
            &[10, 10],
            0,
            Utc::now() - ChronoDuration::hours(1),
        );
        let mut batch = fx.storage.batch();
        batch.put_unreadable_packet(broken.packet_id).unwrap();
        fx.storage.commit(batch).unwrap();
        let healthy = seed(&fx.storage, PacketStatus::Active, &[25, 25], 1);

        let first = fx.sweeper.sweep(Utc::now()).await.unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(first.quarantined, 1);
        assert_eq!(fx.storage.quarantined_packets().unwrap(), vec![broken.packet_id]);

        let anomalies = fx.storage.get_anomalies(10).unwrap();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::SweepFailed);
        assert_eq!(anomalies[0].packet_id, broken.packet_id);

        let second = fx.sweeper.sweep(Utc::now()).await.unwrap();
        assert_eq!(second.failed, 0);
        assert_eq!(second.refunded_amount, 25);
        assert_eq!(
            fx.storage.load_packet(healthy.packet_id).unwrap().status,
            PacketStatus::Refunded
        );
        assert_eq!(fx.storage.get_anomalies(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_is_not_quarantined() {
        let fx = fixture();
        let packet = seed(&fx.storage, PacketStatus::Active, &[10], 0);
        let entry = fx
            .storage
            .due_entries(PacketStatus::Active, Utc::now(), 10)
            .unwrap()
            .remove(0);

        fx.sweeper.sweep(Utc::now()).await.unwrap();
        let cause = Error::InvariantViolation("test".into());
        assert!(!fx.sweeper.quarantine(&entry, &cause, Utc::now()).await.unwrap());
        assert!(fx.storage.quarantined_packets().unwrap().is_empty());
        assert_eq!(
            fx.storage.load_packet(packet.packet_id).unwrap().status,
            PacketStatus::Refunded
        );
    }

    #[test]
    fn test_refund_reference_is_deterministic() {
        let id = PacketId::new();
        assert_eq!(refund_reference(id), refund_reference(id));
        assert_ne!(refund_reference(id), refund_reference(PacketId::new()));
    }
}
