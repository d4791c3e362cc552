//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `packets` - Packet records (key: packet_id)
//! - `shares` - Shares (key: packet_id || index)
//! - `claims` - Granted claims (key: packet_id || account_id)
//! - `idempotency` - Granted claims by retry token (key: packet_id || idempotency_key)
//! - `attempts` - Claim audit trail (key: packet_id || attempt_id)
//! - `payments` - Gateway payments (key: gateway_tx_id)
//! - `ledger` - Balance entries (key: account_id || 0x00 || sequence)
//! - `rewards` - Coupons and invitation credits (key: tag || account_id || 0x00 || claim_id)
//! - `invitations` - Invitee -> inviter (key: invitee_id)
//! - `notifications` - Owner outbox (key: account_id || 0x00 || notification_id)
//! - `anomalies` - Operator review channel (key: anomaly_id)
//! - `indices` - Due index for background tasks (key: status || due_millis || packet_id),
//!   plus quarantined entries the sweeper gave up on (key: 0xFF || packet_id)
//! - `meta` - Counters merged with a max operator (key: name)
//!
//! Every state change goes through a [`StoreBatch`] and lands in one atomic
//! `WriteBatch`; callers serialize read-modify-write cycles per key with
//! [`crate::locks::KeyLocks`].

use crate::{
    error::{Error, Result},
    types::{
        AccountId, Anomaly, ClaimAttempt, CouponGrant, EntryKind, Invitation, InvitationCredit,
        LedgerEntry, Notification, Packet, PacketId, PacketStatus, PaymentRecord, Share,
    },
    Config,
};
use chrono::{DateTime, Utc};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompressionType, Direction, IteratorMode,
    MergeOperands, Options, WriteBatch, WriteOptions, DB,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Column family names
const CF_PACKETS: &str = "packets";
const CF_SHARES: &str = "shares";
const CF_CLAIMS: &str = "claims";
const CF_IDEMPOTENCY: &str = "idempotency";
const CF_ATTEMPTS: &str = "attempts";
const CF_PAYMENTS: &str = "payments";
const CF_LEDGER: &str = "ledger";
const CF_REWARDS: &str = "rewards";
const CF_INVITATIONS: &str = "invitations";
const CF_NOTIFICATIONS: &str = "notifications";
const CF_ANOMALIES: &str = "anomalies";
const CF_INDICES: &str = "indices";
const CF_META: &str = "meta";

/// Highest ledger sequence ever committed
const META_LEDGER_HIGH_WATER: &[u8] = b"ledger_high_water";

/// Quarantine tag in `indices`, above every status byte
const QUARANTINE_TAG: u8 = 0xFF;

const REWARD_TAG_COUPON: u8 = b'c';
const REWARD_TAG_INVITATION: u8 = b'i';

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,

    /// Next balance ledger sequence
    ledger_seq: AtomicU64,

    write_opts: WriteOptions,
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_PACKETS, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_SHARES, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_CLAIMS, Self::cf_options_lookup()),
            ColumnFamilyDescriptor::new(CF_IDEMPOTENCY, Self::cf_options_lookup()),
            ColumnFamilyDescriptor::new(CF_ATTEMPTS, Self::cf_options_history()),
            ColumnFamilyDescriptor::new(CF_PAYMENTS, Self::cf_options_lookup()),
            ColumnFamilyDescriptor::new(CF_LEDGER, Self::cf_options_history()),
            ColumnFamilyDescriptor::new(CF_REWARDS, Self::cf_options_history()),
            ColumnFamilyDescriptor::new(CF_INVITATIONS, Self::cf_options_lookup()),
            ColumnFamilyDescriptor::new(CF_NOTIFICATIONS, Self::cf_options_history()),
            ColumnFamilyDescriptor::new(CF_ANOMALIES, Self::cf_options_history()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_lookup()),
            ColumnFamilyDescriptor::new(CF_META, Self::cf_options_meta()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(config.rocksdb.sync_writes);

        let storage = Self {
            db,
            ledger_seq: AtomicU64::new(0),
            write_opts,
        };

        let next_seq = storage.max_ledger_sequence()?.map_or(0, |seq| seq + 1);
        storage.ledger_seq.store(next_seq, Ordering::SeqCst);

        tracing::info!(
            path = ?path,
            next_ledger_sequence = next_seq,
            "Opened RocksDB"
        );

        Ok(storage)
    }

    // Column family options

    fn cf_options_hot() -> Options {
        let mut opts = Options::default();
        // Read on every claim, use LZ4 for speed
        opts.set_compression_type(DBCompressionType::Lz4);
        opts
    }

    fn cf_options_lookup() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false); // 10 bits per key
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_options_history() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(DBCompressionType::Zstd);
        opts
    }

    fn cf_options_meta() -> Options {
        let mut opts = Options::default();
        // Batches commit out of sequence order; keep the largest value
        opts.set_merge_operator_associative("max_u64", max_u64_merge);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn exists(&self, cf_name: &str, key: &[u8]) -> Result<bool> {
        let cf = self.cf_handle(cf_name)?;
        Ok(self.db.get_pinned_cf(cf, key)?.is_some())
    }

    /// Values under `prefix`, in key order. The CFs have no prefix
    /// extractor, so iteration stops at the first foreign key.
    fn scan_prefix<T: DeserializeOwned>(
        &self,
        cf_name: &str,
        prefix: &[u8],
    ) -> Result<Vec<T>> {
        let cf = self.cf_handle(cf_name)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut values = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(bincode::deserialize(&value)?);
        }
        Ok(values)
    }

    fn max_ledger_sequence(&self) -> Result<Option<u64>> {
        let cf = self.cf_handle(CF_META)?;
        match self.db.get_cf(cf, META_LEDGER_HIGH_WATER)? {
            Some(bytes) => Ok(Some(decode_u64(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Reserve the next ledger sequence number
    pub fn next_ledger_sequence(&self) -> u64 {
        self.ledger_seq.fetch_add(1, Ordering::SeqCst)
    }

    // Packet operations

    /// Get packet by ID
    pub fn get_packet(&self, packet_id: PacketId) -> Result<Option<Packet>> {
        self.get(CF_PACKETS, packet_id.as_bytes())
    }

    /// Get packet by ID, failing when absent
    pub fn load_packet(&self, packet_id: PacketId) -> Result<Packet> {
        self.get_packet(packet_id)?
            .ok_or(Error::PacketNotFound(packet_id))
    }

    /// All shares of a packet, ordered by index
    pub fn get_shares(&self, packet_id: PacketId) -> Result<Vec<Share>> {
        self.scan_prefix(CF_SHARES, packet_id.as_bytes())
    }

    /// Packets in `status` whose due time is at or before `now`
    pub fn due_packets(
        &self,
        status: PacketStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PacketId>> {
        Ok(self
            .due_entries(status, now, limit)?
            .into_iter()
            .map(|entry| entry.packet_id)
            .collect())
    }

    /// Due-index entries in `status` whose due time is at or before `now`
    pub fn due_entries(
        &self,
        status: PacketStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DueEntry>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let prefix = [status.as_byte()];
        let now_ms = millis(now);

        let mut entries = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            if entries.len() >= limit {
                break;
            }
            let (key, _) = item?;
            if key.len() != 25 || key[0] != status.as_byte() {
                break;
            }
            let due = decode_u64(&key[1..9])?;
            if due > now_ms {
                break;
            }
            let id = Uuid::from_slice(&key[9..25])
                .map_err(|e| Error::Storage(format!("Corrupt index key: {}", e)))?;
            entries.push(DueEntry {
                packet_id: PacketId::from_uuid(id),
                key: key.to_vec(),
            });
        }
        Ok(entries)
    }

    /// Whether a due-index entry is still present
    pub fn due_entry_exists(&self, entry: &DueEntry) -> Result<bool> {
        let cf = self.cf_handle(CF_INDICES)?;
        Ok(self.db.get_pinned_cf(cf, &entry.key)?.is_some())
    }

    /// Packets taken out of the due index after a permanent sweep failure
    pub fn quarantined_packets(&self) -> Result<Vec<PacketId>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let prefix = [QUARANTINE_TAG];

        let mut ids = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if key.len() != 17 || key[0] != QUARANTINE_TAG {
                break;
            }
            let id = Uuid::from_slice(&key[1..17])
                .map_err(|e| Error::Storage(format!("Corrupt quarantine key: {}", e)))?;
            ids.push(PacketId::from_uuid(id));
        }
        Ok(ids)
    }

    // Claim operations

    /// Granted claim for (packet, account)
    pub fn get_claim(&self, packet_id: PacketId, account_id: &AccountId) -> Result<Option<ClaimAttempt>> {
        self.get(CF_CLAIMS, &packet_suffix_key(packet_id, account_id.as_str().as_bytes()))
    }

    /// Granted claim for (packet, idempotency key)
    pub fn get_idempotent_claim(&self, packet_id: PacketId, key: &str) -> Result<Option<ClaimAttempt>> {
        self.get(CF_IDEMPOTENCY, &packet_suffix_key(packet_id, key.as_bytes()))
    }

    /// Audit trail of a packet's claim attempts, oldest first
    pub fn get_attempts(&self, packet_id: PacketId) -> Result<Vec<ClaimAttempt>> {
        self.scan_prefix(CF_ATTEMPTS, packet_id.as_bytes())
    }

    // Payment operations

    /// Payment by gateway transaction ID
    pub fn get_payment(&self, gateway_tx_id: &str) -> Result<Option<PaymentRecord>> {
        self.get(CF_PAYMENTS, gateway_tx_id.as_bytes())
    }

    // Account operations

    /// Balance ledger entries of an account, in sequence order
    pub fn get_ledger_entries(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>> {
        self.scan_prefix(CF_LEDGER, &account_prefix(account_id))
    }

    /// Coupons issued to an account
    pub fn get_coupons(&self, account_id: &AccountId) -> Result<Vec<CouponGrant>> {
        self.scan_prefix(CF_REWARDS, &reward_prefix(REWARD_TAG_COUPON, account_id))
    }

    /// Check whether a coupon for this claim exists
    pub fn coupon_exists(&self, account_id: &AccountId, claim_id: Uuid) -> Result<bool> {
        self.exists(CF_REWARDS, &reward_key(REWARD_TAG_COUPON, account_id, claim_id))
    }

    /// Invitation credits earned by an inviter
    pub fn get_invitation_credits(&self, inviter_id: &AccountId) -> Result<Vec<InvitationCredit>> {
        self.scan_prefix(CF_REWARDS, &reward_prefix(REWARD_TAG_INVITATION, inviter_id))
    }

    /// Check whether an invitation credit for this claim exists
    pub fn invitation_credit_exists(&self, inviter_id: &AccountId, claim_id: Uuid) -> Result<bool> {
        self.exists(CF_REWARDS, &reward_key(REWARD_TAG_INVITATION, inviter_id, claim_id))
    }

    /// Who invited `invitee_id`
    pub fn get_invitation(&self, invitee_id: &AccountId) -> Result<Option<Invitation>> {
        self.get(CF_INVITATIONS, invitee_id.as_str().as_bytes())
    }

    /// Outbox of an account, oldest first
    pub fn get_notifications(&self, account_id: &AccountId) -> Result<Vec<Notification>> {
        self.scan_prefix(CF_NOTIFICATIONS, &account_prefix(account_id))
    }

    /// Most recent anomalies, newest first
    pub fn get_anomalies(&self, limit: usize) -> Result<Vec<Anomaly>> {
        let cf = self.cf_handle(CF_ANOMALIES)?;
        let mut anomalies = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::End).take(limit) {
            let (_, value) = item?;
            anomalies.push(bincode::deserialize(&value)?);
        }
        Ok(anomalies)
    }

    // Batch operations (atomic)

    /// Start an atomic batch
    pub fn batch(&self) -> StoreBatch<'_> {
        StoreBatch {
            storage: self,
            batch: WriteBatch::default(),
        }
    }

    /// Commit a batch; either every write lands or none does
    pub fn commit(&self, batch: StoreBatch<'_>) -> Result<()> {
        let ops = batch.batch.len();
        self.db.write_opt(batch.batch, &self.write_opts)?;
        tracing::trace!(ops, "Batch committed");
        Ok(())
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        self.db.flush()?;
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}

/// One row of the due index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueEntry {
    pub packet_id: PacketId,
    key: Vec<u8>,
}

/// Pending writes for one atomic commit
pub struct StoreBatch<'a> {
    storage: &'a Storage,
    batch: WriteBatch,
}

impl StoreBatch<'_> {
    fn put<T: Serialize>(&mut self, cf_name: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.storage.cf_handle(cf_name)?;
        let bytes = bincode::serialize(value)?;
        self.batch.put_cf(cf, key, bytes);
        Ok(())
    }

    /// Write the packet and move its due-index entry from `previous`
    pub fn put_packet(&mut self, packet: &Packet, previous: Option<&Packet>) -> Result<()> {
        let cf_indices = self.storage.cf_handle(CF_INDICES)?;
        if let Some(old_key) = previous.and_then(index_key) {
            self.batch.delete_cf(cf_indices, old_key);
        }
        self.put(CF_PACKETS, packet.packet_id.as_bytes(), packet)?;
        if let Some(new_key) = index_key(packet) {
            self.batch.put_cf(cf_indices, new_key, b"");
        }
        Ok(())
    }

    /// Write a share row
    pub fn put_share(&mut self, share: &Share) -> Result<()> {
        let mut key = share.packet_id.as_bytes().to_vec();
        key.extend_from_slice(&share.index.to_be_bytes());
        self.put(CF_SHARES, &key, share)
    }

    /// Record a granted claim under account, idempotency key and audit trail
    pub fn put_granted_claim(&mut self, attempt: &ClaimAttempt) -> Result<()> {
        let packet_id = attempt.packet_id;
        self.put(
            CF_CLAIMS,
            &packet_suffix_key(packet_id, attempt.account_id.as_str().as_bytes()),
            attempt,
        )?;
        self.put(
            CF_IDEMPOTENCY,
            &packet_suffix_key(packet_id, attempt.idempotency_key.as_bytes()),
            attempt,
        )?;
        self.put_attempt(attempt)
    }

    /// Append to the claim audit trail
    pub fn put_attempt(&mut self, attempt: &ClaimAttempt) -> Result<()> {
        self.put(
            CF_ATTEMPTS,
            &packet_suffix_key(attempt.packet_id, attempt.attempt_id.as_bytes()),
            attempt,
        )
    }

    /// Write a payment record
    pub fn put_payment(&mut self, record: &PaymentRecord) -> Result<()> {
        self.put(CF_PAYMENTS, record.gateway_tx_id.as_bytes(), record)
    }

    /// Append a balance credit with a freshly reserved sequence
    pub fn credit(
        &mut self,
        account_id: &AccountId,
        kind: EntryKind,
        amount: u64,
        packet_id: PacketId,
        reference: Uuid,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        let entry = LedgerEntry {
            account_id: account_id.clone(),
            sequence: self.storage.next_ledger_sequence(),
            kind,
            amount,
            packet_id,
            reference,
            recorded_at: now,
        };
        let mut key = account_prefix(account_id);
        key.extend_from_slice(&entry.sequence.to_be_bytes());
        self.put(CF_LEDGER, &key, &entry)?;

        let cf_meta = self.storage.cf_handle(CF_META)?;
        self.batch
            .merge_cf(cf_meta, META_LEDGER_HIGH_WATER, entry.sequence.to_be_bytes());
        Ok(entry)
    }

    /// Write a coupon grant
    pub fn put_coupon(&mut self, grant: &CouponGrant) -> Result<()> {
        let key = reward_key(REWARD_TAG_COUPON, &grant.account_id, grant.source_claim_id);
        self.put(CF_REWARDS, &key, grant)
    }

    /// Write an invitation credit
    pub fn put_invitation_credit(&mut self, credit: &InvitationCredit) -> Result<()> {
        let key = reward_key(REWARD_TAG_INVITATION, &credit.inviter_id, credit.source_claim_id);
        self.put(CF_REWARDS, &key, credit)
    }

    /// Write an invitee -> inviter relation
    pub fn put_invitation(&mut self, invitation: &Invitation) -> Result<()> {
        self.put(CF_INVITATIONS, invitation.invitee_id.as_str().as_bytes(), invitation)
    }

    /// Queue a notification
    pub fn put_notification(&mut self, notification: &Notification) -> Result<()> {
        let mut key = account_prefix(&notification.account_id);
        key.extend_from_slice(notification.notification_id.as_bytes());
        self.put(CF_NOTIFICATIONS, &key, notification)
    }

    /// Record an anomaly for operator review
    pub fn put_anomaly(&mut self, anomaly: &Anomaly) -> Result<()> {
        self.put(CF_ANOMALIES, anomaly.anomaly_id.as_bytes(), anomaly)
    }

    /// Move a due-index entry to quarantine; the original key is kept as the value
    pub fn quarantine_due(&mut self, entry: &DueEntry) -> Result<()> {
        let cf = self.storage.cf_handle(CF_INDICES)?;
        let mut key = Vec::with_capacity(17);
        key.push(QUARANTINE_TAG);
        key.extend_from_slice(entry.packet_id.as_bytes());
        self.batch.delete_cf(cf, &entry.key);
        self.batch.put_cf(cf, key, &entry.key);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn put_unreadable_packet(&mut self, packet_id: PacketId) -> Result<()> {
        let cf = self.storage.cf_handle(CF_PACKETS)?;
        self.batch.put_cf(cf, packet_id.as_bytes(), [0xFFu8]);
        Ok(())
    }
}

// Key helpers

fn millis(at: DateTime<Utc>) -> u64 {
    at.timestamp_millis().max(0) as u64
}

fn index_key(packet: &Packet) -> Option<Vec<u8>> {
    let due = packet.due_at()?;
    let mut key = Vec::with_capacity(25);
    key.push(packet.status.as_byte());
    key.extend_from_slice(&millis(due).to_be_bytes());
    key.extend_from_slice(packet.packet_id.as_bytes());
    Some(key)
}

fn packet_suffix_key(packet_id: PacketId, suffix: &[u8]) -> Vec<u8> {
    let mut key = packet_id.as_bytes().to_vec();
    key.extend_from_slice(suffix);
    key
}

fn account_prefix(account_id: &AccountId) -> Vec<u8> {
    let mut key = account_id.as_str().as_bytes().to_vec();
    key.push(0); // Separator
    key
}

fn reward_prefix(tag: u8, account_id: &AccountId) -> Vec<u8> {
    let mut key = vec![tag];
    key.extend_from_slice(&account_prefix(account_id));
    key
}

fn reward_key(tag: u8, account_id: &AccountId, claim_id: Uuid) -> Vec<u8> {
    let mut key = reward_prefix(tag, account_id);
    key.extend_from_slice(claim_id.as_bytes());
    key
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Storage(format!("Expected 8 bytes, found {}", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

fn max_u64_merge(
    _key: &[u8],
    existing: Option<&[u8]>,
    operands: &MergeOperands,
) -> Option<Vec<u8>> {
    existing
        .into_iter()
        .chain(operands.iter())
        .filter_map(|bytes| <[u8; 8]>::try_from(bytes).ok())
        .map(u64::from_be_bytes)
        .max()
        .map(|max| max.to_be_bytes().to_vec())
}
