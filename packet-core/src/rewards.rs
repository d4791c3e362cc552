//! Coupon and invitation side ledgers
//!
//! Claims stage their reward entries into the same batch as the claim, so a
//! reward exists exactly when its claim does. Rewards are points and coupons;
//! they never touch the balance ledger.

use crate::{
    config::RewardsConfig,
    locks::KeyLocks,
    storage::{Storage, StoreBatch},
    types::{AccountId, ClaimAttempt, CouponGrant, Invitation, InvitationCredit},
    Error, Result,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Reward entries staged for one claim
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StagedRewards {
    pub coupon: Option<CouponGrant>,
    pub invitation_credit: Option<InvitationCredit>,
}

/// Coupon/invitation side ledger
pub struct Rewards {
    storage: Arc<Storage>,
    invitee_locks: KeyLocks<AccountId>,
    config: RewardsConfig,
}

impl Rewards {
    pub fn new(storage: Arc<Storage>, config: RewardsConfig, lock_timeout: Duration) -> Self {
        Self {
            storage,
            invitee_locks: KeyLocks::new(lock_timeout),
            config,
        }
    }

    /// Stage the rewards earned by a granted claim into `batch`.
    ///
    /// Called under the packet lock with a not yet committed claim; existing
    /// grants for the same claim are left alone.
    pub fn stage(
        &self,
        batch: &mut StoreBatch<'_>,
        claim: &ClaimAttempt,
        share_amount: u64,
        now: DateTime<Utc>,
    ) -> Result<StagedRewards> {
        let mut staged = StagedRewards::default();
        let claim_id = claim.attempt_id;

        if self.config.coupons_enabled
            && share_amount >= self.config.coupon_min_share_amount
            && !self.storage.coupon_exists(&claim.account_id, claim_id)?
        {
            let grant = CouponGrant {
                coupon_id: Uuid::now_v7(),
                account_id: claim.account_id.clone(),
                source_claim_id: claim_id,
                packet_id: claim.packet_id,
                value: self.config.coupon_value,
                issued_at: now,
            };
            batch.put_coupon(&grant)?;
            staged.coupon = Some(grant);
        }

        if self.config.invitations_enabled {
            if let Some(invitation) = self.storage.get_invitation(&claim.account_id)? {
                if !self
                    .storage
                    .invitation_credit_exists(&invitation.inviter_id, claim_id)?
                {
                    let credit = InvitationCredit {
                        inviter_id: invitation.inviter_id,
                        invitee_id: claim.account_id.clone(),
                        source_claim_id: claim_id,
                        points: self.config.invitation_points_per_claim,
                        credited_at: now,
                    };
                    batch.put_invitation_credit(&credit)?;
                    staged.invitation_credit = Some(credit);
                }
            }
        }

        if staged != StagedRewards::default() {
            debug!(
                claim_id = %claim_id,
                coupon = staged.coupon.is_some(),
                invitation_credit = staged.invitation_credit.is_some(),
                "Rewards staged"
            );
        }
        Ok(staged)
    }

    /// Record that `inviter_id` invited `invitee_id`.
    ///
    /// Write-once per invitee. Registering the same pair again returns the
    /// stored invitation.
    pub async fn register_invitation(
        &self,
        inviter_id: &AccountId,
        invitee_id: &AccountId,
        now: DateTime<Utc>,
    ) -> Result<Invitation> {
        inviter_id.validate()?;
        invitee_id.validate()?;
        if inviter_id == invitee_id {
            return Err(Error::Validation("an account cannot invite itself".into()));
        }

        let _guard = self.invitee_locks.acquire(invitee_id.clone()).await?;

        if let Some(existing) = self.storage.get_invitation(invitee_id)? {
            if &existing.inviter_id == inviter_id {
                return Ok(existing);
            }
            return Err(Error::AlreadyInvited {
                invitee_id: invitee_id.clone(),
            });
        }

        let invitation = Invitation {
            invitee_id: invitee_id.clone(),
            inviter_id: inviter_id.clone(),
            created_at: now,
        };
        let mut batch = self.storage.batch();
        batch.put_invitation(&invitation)?;
        self.storage.commit(batch)?;

        info!(inviter = %inviter_id, invitee = %invitee_id, "Invitation registered");
        Ok(invitation)
    }

    /// Coupons issued to an account
    pub fn coupons(&self, account_id: &AccountId) -> Result<Vec<CouponGrant>> {
        self.storage.get_coupons(account_id)
    }

    /// Invitation credits earned by an inviter
    pub fn invitation_credits(&self, inviter_id: &AccountId) -> Result<Vec<InvitationCredit>> {
        self.storage.get_invitation_credits(inviter_id)
    }
}
