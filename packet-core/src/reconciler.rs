//! Payment reconciler
//!
//! Applies gateway callbacks to pending packets. Callbacks are keyed by the
//! gateway transaction id: the first delivery decides the outcome, every
//! redelivery is acknowledged as a duplicate so the gateway stops retrying.
//! Terminal problems go to the anomaly channel instead of the response.
//!
//! Lock order is gateway transaction, then packet. Claims and sweeps only
//! take the packet lock.

use crate::{
    config::ReconcilerConfig,
    locks::KeyLocks,
    metrics::Metrics,
    retry::RetryPolicy,
    storage::Storage,
    types::{
        Anomaly, AnomalyKind, Notification, NotificationKind, Packet, PacketId, PacketStatus,
        PaymentRecord, PaymentStatus,
    },
    Error, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Longest accepted gateway transaction id
pub const MAX_GATEWAY_TX_ID_LEN: usize = 128;

/// What the gateway reports for a transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackOutcome {
    #[default]
    Succeeded,
    Failed,
}

/// Verified gateway callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCallback {
    pub gateway_tx_id: String,
    pub packet_id: PacketId,
    pub amount: u64,
    /// Payload as delivered; hashed to detect conflicting redeliveries
    pub raw_payload: String,
    pub outcome: CallbackOutcome,
}

/// Successful callback handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAck {
    /// First delivery, recorded with this status
    Applied(PaymentStatus),
    /// Transaction id seen before; nothing changed
    Duplicate,
}

/// Payment reconciler
pub struct PaymentReconciler {
    storage: Arc<Storage>,
    tx_locks: KeyLocks<String>,
    packet_locks: Arc<KeyLocks<PacketId>>,
    retry: RetryPolicy,
    metrics: Metrics,
    config: ReconcilerConfig,
}

impl PaymentReconciler {
    pub fn new(
        storage: Arc<Storage>,
        packet_locks: Arc<KeyLocks<PacketId>>,
        lock_timeout: Duration,
        retry: RetryPolicy,
        metrics: Metrics,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            storage,
            tx_locks: KeyLocks::new(lock_timeout),
            packet_locks,
            retry,
            metrics,
            config,
        }
    }

    /// Apply a gateway callback
    pub async fn handle_callback(&self, callback: PaymentCallback) -> Result<CallbackAck> {
        if callback.gateway_tx_id.is_empty() || callback.gateway_tx_id.len() > MAX_GATEWAY_TX_ID_LEN
        {
            return Err(Error::Validation(format!(
                "gateway transaction id must be 1..={} bytes",
                MAX_GATEWAY_TX_ID_LEN
            )));
        }

        let payload_hash = payload_hash(&callback.raw_payload);
        let result = self
            .retry
            .run("payment_callback", || self.try_handle(&callback, &payload_hash))
            .await;

        let label = match &result {
            Ok(CallbackAck::Applied(PaymentStatus::Confirmed)) => "confirmed",
            Ok(CallbackAck::Applied(PaymentStatus::Failed)) => "failed",
            Ok(CallbackAck::Applied(PaymentStatus::Initiated)) => "initiated",
            Ok(CallbackAck::Duplicate) => "duplicate",
            Err(Error::AmountMismatch { .. }) => "amount_mismatch",
            Err(Error::PacketNotPending { .. }) => "not_pending",
            Err(Error::PacketNotFound(_)) => "packet_not_found",
            Err(_) => "error",
        };
        self.metrics.record_callback(label);

        result
    }

    async fn try_handle(&self, callback: &PaymentCallback, payload_hash: &str) -> Result<CallbackAck> {
        let tx_id = &callback.gateway_tx_id;
        let _tx_guard = self.tx_locks.acquire(tx_id.clone()).await?;
        let now = Utc::now();

        if let Some(existing) = self.storage.get_payment(tx_id)? {
            if existing.payload_hash != payload_hash || existing.packet_id != callback.packet_id {
                self.record_anomaly(Anomaly::new(
                    AnomalyKind::ConflictingRedelivery,
                    tx_id.as_str(),
                    callback.packet_id,
                    format!(
                        "redelivery differs from first delivery (packet {} -> {})",
                        existing.packet_id, callback.packet_id
                    ),
                    now,
                ))?;
            }
            info!(gateway_tx_id = %tx_id, "Duplicate callback acknowledged");
            return Ok(CallbackAck::Duplicate);
        }

        let _packet_guard = self.packet_locks.acquire(callback.packet_id).await?;

        let record = |status: PaymentStatus, anomaly: Option<AnomalyKind>| PaymentRecord {
            gateway_tx_id: tx_id.clone(),
            packet_id: callback.packet_id,
            amount: callback.amount,
            status,
            payload_hash: payload_hash.to_string(),
            received_at: now,
            anomaly,
        };

        let mut packet = match self.storage.get_packet(callback.packet_id)? {
            Some(packet) => packet,
            None => {
                // Recorded so that redeliveries are acknowledged as duplicates
                let anomaly = match callback.outcome {
                    CallbackOutcome::Succeeded => Some(Anomaly::new(
                        AnomalyKind::UnknownPacket,
                        tx_id.as_str(),
                        callback.packet_id,
                        format!("payment of {} for unknown packet", callback.amount),
                        now,
                    )),
                    CallbackOutcome::Failed => None,
                };
                let status = match anomaly {
                    Some(_) => PaymentStatus::Initiated,
                    None => PaymentStatus::Failed,
                };

                let mut batch = self.storage.batch();
                batch.put_payment(&record(status, anomaly.as_ref().map(|a| a.kind)))?;
                if let Some(anomaly) = &anomaly {
                    batch.put_anomaly(anomaly)?;
                }
                self.storage.commit(batch)?;
                if let Some(anomaly) = &anomaly {
                    self.report_anomaly(anomaly);
                }

                return Err(Error::PacketNotFound(callback.packet_id));
            }
        };

        match callback.outcome {
            CallbackOutcome::Failed => {
                let mut batch = self.storage.batch();
                if packet.status == PacketStatus::Pending {
                    let previous = packet.clone();
                    packet.review_hold = None;
                    packet.transition(PacketStatus::Refunded, now)?;
                    batch.put_packet(&packet, Some(&previous))?;
                    batch.put_notification(&funding_failed(&packet, "the payment failed", now))?;
                }
                batch.put_payment(&record(PaymentStatus::Failed, None))?;
                self.storage.commit(batch)?;

                info!(
                    gateway_tx_id = %tx_id,
                    packet_id = %packet.packet_id,
                    status = %packet.status,
                    "Funding failure recorded"
                );
                Ok(CallbackAck::Applied(PaymentStatus::Failed))
            }
            CallbackOutcome::Succeeded if packet.status != PacketStatus::Pending => {
                let kind = if packet.status == PacketStatus::Refunded {
                    AnomalyKind::FundingAfterClose
                } else {
                    AnomalyKind::DuplicateFunding
                };
                let anomaly = Anomaly::new(
                    kind,
                    tx_id.as_str(),
                    packet.packet_id,
                    format!("payment of {} for packet in status {}", callback.amount, packet.status),
                    now,
                );

                let mut batch = self.storage.batch();
                batch.put_payment(&record(PaymentStatus::Confirmed, Some(kind)))?;
                batch.put_anomaly(&anomaly)?;
                self.storage.commit(batch)?;
                self.report_anomaly(&anomaly);

                Err(Error::PacketNotPending {
                    packet_id: packet.packet_id,
                    status: packet.status,
                })
            }
            CallbackOutcome::Succeeded if callback.amount != packet.total_amount => {
                let anomaly = Anomaly::new(
                    AnomalyKind::AmountMismatch,
                    tx_id.as_str(),
                    packet.packet_id,
                    format!("expected {}, got {}", packet.total_amount, callback.amount),
                    now,
                );

                let previous = packet.clone();
                packet.review_hold = Some(tx_id.clone());
                packet.updated_at = now;

                let mut batch = self.storage.batch();
                batch.put_packet(&packet, Some(&previous))?;
                batch.put_payment(&record(PaymentStatus::Initiated, Some(AnomalyKind::AmountMismatch)))?;
                batch.put_anomaly(&anomaly)?;
                self.storage.commit(batch)?;
                self.report_anomaly(&anomaly);

                Err(Error::AmountMismatch {
                    gateway_tx_id: tx_id.clone(),
                    expected: packet.total_amount,
                    actual: callback.amount,
                })
            }
            CallbackOutcome::Succeeded => {
                let previous = packet.clone();
                packet.review_hold = None;
                packet.funding_reference = Some(tx_id.clone());
                packet.transition(PacketStatus::Active, now)?;

                let mut batch = self.storage.batch();
                batch.put_packet(&packet, Some(&previous))?;
                batch.put_payment(&record(PaymentStatus::Confirmed, None))?;
                batch.put_notification(&Notification::new(
                    packet.owner_id.clone(),
                    packet.packet_id,
                    NotificationKind::PacketFunded,
                    format!("Your packet of {} is live", packet.total_amount),
                    now,
                ))?;
                self.storage.commit(batch)?;

                info!(
                    gateway_tx_id = %tx_id,
                    packet_id = %packet.packet_id,
                    amount = packet.total_amount,
                    "Packet funded"
                );
                Ok(CallbackAck::Applied(PaymentStatus::Confirmed))
            }
        }
    }

    /// Refund pending packets whose funding deadline has passed.
    ///
    /// Packets held for operator review are not in the due index and are
    /// never touched here.
    pub async fn expire_unfunded(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self
            .storage
            .due_packets(PacketStatus::Pending, now, self.config.batch_limit)?;

        let mut expired = 0;
        for packet_id in due {
            match self
                .retry
                .run("funding_timeout", || self.expire_one(packet_id, now))
                .await
            {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => warn!(packet_id = %packet_id, error = %e, "Funding timeout failed"),
            }
        }

        if expired > 0 {
            info!(expired, "Unfunded packets refunded");
        }
        Ok(expired)
    }

    async fn expire_one(&self, packet_id: PacketId, now: DateTime<Utc>) -> Result<bool> {
        let _guard = self.packet_locks.acquire(packet_id).await?;
        let mut packet = self.storage.load_packet(packet_id)?;

        if packet.status != PacketStatus::Pending
            || packet.review_hold.is_some()
            || now < packet.funding_deadline
        {
            return Ok(false);
        }

        let previous = packet.clone();
        packet.transition(PacketStatus::Refunded, now)?;

        let mut batch = self.storage.batch();
        batch.put_packet(&packet, Some(&previous))?;
        batch.put_notification(&funding_failed(
            &packet,
            "no payment arrived before the deadline",
            now,
        ))?;
        self.storage.commit(batch)?;

        self.metrics.record_funding_timeout();
        info!(packet_id = %packet_id, "Funding deadline passed, packet refunded");
        Ok(true)
    }

    /// Funding watchdog loop; returns once `token` is cancelled
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(
            interval_secs = self.config.watchdog_interval_secs,
            "Starting funding watchdog"
        );

        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.watchdog_interval_secs));

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.expire_unfunded(Utc::now()).await {
                        warn!("Funding watchdog pass failed: {}", e);
                    }
                }
            }
        }

        info!("Funding watchdog stopped");
    }

    fn record_anomaly(&self, anomaly: Anomaly) -> Result<()> {
        let mut batch = self.storage.batch();
        batch.put_anomaly(&anomaly)?;
        self.storage.commit(batch)?;
        self.report_anomaly(&anomaly);
        Ok(())
    }

    fn report_anomaly(&self, anomaly: &Anomaly) {
        self.metrics.record_anomaly(anomaly.kind.as_str());
        error!(
            anomaly_id = %anomaly.anomaly_id,
            kind = anomaly.kind.as_str(),
            gateway_tx_id = %anomaly.gateway_tx_id,
            packet_id = %anomaly.packet_id,
            detail = %anomaly.detail,
            "Reconciliation anomaly"
        );
    }
}

fn funding_failed(packet: &Packet, reason: &str, now: DateTime<Utc>) -> Notification {
    Notification::new(
        packet.owner_id.clone(),
        packet.packet_id,
        NotificationKind::FundingFailed,
        format!("Your packet was not funded: {}", reason),
        now,
    )
}

/// Hex SHA-256 of a callback payload
pub fn payload_hash(raw_payload: &str) -> String {
    hex::encode(Sha256::digest(raw_payload.as_bytes()))
}
