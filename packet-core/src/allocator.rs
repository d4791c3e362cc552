//! Packet allocator
//!
//! Splits a total amount into `n` shares at creation time. All arithmetic is
//! integer minor units; every share gets at least one unit and the shares
//! always sum to the total.
//!
//! - `even`: `total / n` each, the first `total % n` shares get one extra unit
//! - `random`: each share but the last is drawn from
//!   `[1, min(remaining - (left - 1), max(1, 2 * remaining / left))]`,
//!   the last share takes what remains

use crate::{types::SplitPolicy, Error, Result};
use rand::Rng;

/// Split `total` into `shares` amounts using the thread RNG
pub fn allocate(total: u64, shares: u32, policy: SplitPolicy) -> Result<Vec<u64>> {
    allocate_with_rng(total, shares, policy, &mut rand::thread_rng())
}

/// Split `total` into `shares` amounts with a caller supplied RNG
pub fn allocate_with_rng<R: Rng + ?Sized>(
    total: u64,
    shares: u32,
    policy: SplitPolicy,
    rng: &mut R,
) -> Result<Vec<u64>> {
    if shares == 0 || total < u64::from(shares) {
        return Err(Error::InvalidAllocation { total, shares });
    }

    let amounts = match policy {
        SplitPolicy::Even => split_even(total, shares),
        SplitPolicy::Random => split_random(total, shares, rng)?,
    };

    debug_assert_eq!(amounts.iter().sum::<u64>(), total);
    Ok(amounts)
}

/// Upper bound for the next random share given what is left.
///
/// Fails unless every remaining share can still get one unit.
pub fn random_share_cap(remaining: u64, remaining_shares: u32) -> Result<u64> {
    let left = u64::from(remaining_shares);
    if left == 0 || remaining < left {
        return Err(Error::InvalidAllocation {
            total: remaining,
            shares: remaining_shares,
        });
    }
    let floor_bound = remaining - (left - 1);
    let fair_bound = (remaining.saturating_mul(2) / left).max(1);
    Ok(floor_bound.min(fair_bound))
}

fn split_even(total: u64, shares: u32) -> Vec<u64> {
    let n = u64::from(shares);
    let base = total / n;
    let remainder = total % n;

    (0..n)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

fn split_random<R: Rng + ?Sized>(total: u64, shares: u32, rng: &mut R) -> Result<Vec<u64>> {
    let mut amounts = Vec::with_capacity(shares as usize);
    let mut remaining = total;

    for left in (2..=shares).rev() {
        let cap = random_share_cap(remaining, left)?;
        let amount = rng.gen_range(1..=cap);
        amounts.push(amount);
        remaining -= amount;
    }
    amounts.push(remaining);

    Ok(amounts)
}
