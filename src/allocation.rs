//! Turning a score snapshot into a per-player share of a fixed reward pool.
//!
//! Allocation is a pure function of a [Snapshot] and [AllocationParams]: it
//! performs no I/O and yields bit-identical output for identical input. All
//! arithmetic is exact integer arithmetic over smallest token units, and
//! every [RoundingPolicy] guarantees that the sum of rewards never exceeds
//! the pool.

use std::num::NonZeroUsize;

#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    player::{Address, PlayerScore, Score, Snapshot},
    units::{mul_div_ceil, mul_div_floor, TokenAmount},
};

/// Determines how fractional shares of the pool are rounded to whole units.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RoundingPolicy {
    /// Round every share down. Any remainder is left unallocated.
    #[default]
    Floor,
    /// Round every share up, then scale all shares down proportionally
    /// (rounding down) if their sum exceeds the pool.
    CeilingScaled,
}

/// Fixed parameters of a reward cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationParams {
    /// Total reward pool in smallest token units.
    pub pool: TokenAmount,
    pub rounding: RoundingPolicy,
    /// Only the highest-ranked `n` players share the pool, if set.
    pub max_recipients: Option<NonZeroUsize>,
}

impl AllocationParams {
    pub fn new(pool: TokenAmount) -> Self {
        AllocationParams {
            pool,
            rounding: RoundingPolicy::default(),
            max_recipients: None,
        }
    }

    pub fn with_rounding(mut self, rounding: RoundingPolicy) -> Self {
        self.rounding = rounding;

        self
    }

    pub fn with_max_recipients(mut self, max: Option<NonZeroUsize>) -> Self {
        self.max_recipients = max;

        self
    }
}

/// One player's reward within an [Allocation].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationEntry {
    pub address: Address,
    /// The snapshotted score this reward settles.
    pub score: Score,
    /// Reward in smallest token units.
    pub reward: TokenAmount,
}

/// Per-player rewards for one cycle, ordered by score descending and then by
/// address ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub pool: TokenAmount,
    pub rounding: RoundingPolicy,
    entries: Vec<AllocationEntry>,
}

impl Allocation {
    /// An allocation that pays nobody.
    pub fn empty(pool: TokenAmount, rounding: RoundingPolicy) -> Self {
        Allocation {
            pool,
            rounding,
            entries: vec![],
        }
    }

    #[inline]
    pub fn entries(&self) -> &[AllocationEntry] {
        &self.entries
    }

    #[inline]
    pub fn into_entries(self) -> Vec<AllocationEntry> {
        self.entries
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, address: &Address) -> Option<&AllocationEntry> {
        self.entries.iter().find(|e| &e.address == address)
    }

    /// Sum of all rewards. Never exceeds [Allocation::pool].
    pub fn total(&self) -> TokenAmount {
        self.entries.iter().map(|e| e.reward).sum()
    }

    /// Part of the pool left over by rounding.
    pub fn unallocated(&self) -> TokenAmount {
        self.pool.saturating_sub(self.total())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    #[error("reward for {0} overflows a token amount")]
    Overflow(Address),
}

/// Computes each player's share of `params.pool`, proportional to their
/// score.
///
/// Returns an empty allocation if the snapshot is empty or every score is
/// zero.
pub fn allocate(
    snapshot: &Snapshot,
    params: &AllocationParams,
) -> Result<Allocation, AllocationError> {
    let mut ranked: Vec<PlayerScore> = snapshot.players().to_vec();
    ranked.sort_unstable_by(|a, b| {
        b.score.cmp(&a.score).then_with(|| a.address.cmp(&b.address))
    });

    if let Some(max) = params.max_recipients {
        ranked.truncate(max.get());
    }

    let total: u128 = ranked.iter().map(|p| p.score as u128).sum();
    if total == 0 {
        return Ok(Allocation::empty(params.pool, params.rounding));
    }

    let pool = params.pool;
    let rewards = match params.rounding {
        RoundingPolicy::Floor => per_player(&ranked, |p| {
            mul_div_floor(p.score as u128, pool, total)
        })?,
        RoundingPolicy::CeilingScaled => {
            let ceiled = per_player(&ranked, |p| {
                mul_div_ceil(p.score as u128, pool, total)
            })?;
            scale_down(&ranked, ceiled, pool)?
        }
    };

    let entries = ranked
        .iter()
        .zip(rewards)
        .map(|(p, reward)| AllocationEntry {
            address: p.address,
            score: p.score,
            reward,
        })
        .collect();

    Ok(Allocation {
        pool,
        rounding: params.rounding,
        entries,
    })
}

/// Applies `share` to every ranked player, preserving order.
fn per_player<F>(
    ranked: &[PlayerScore],
    share: F,
) -> Result<Vec<TokenAmount>, AllocationError>
where
    F: Fn(&PlayerScore) -> Option<TokenAmount> + Send + Sync,
{
    let compute =
        |p: &PlayerScore| share(p).ok_or(AllocationError::Overflow(p.address));

    #[cfg(feature = "rayon")]
    let rewards = ranked.par_iter().map(compute).collect();
    #[cfg(not(feature = "rayon"))]
    let rewards = ranked.iter().map(compute).collect();

    rewards
}

/// Second pass of [RoundingPolicy::CeilingScaled].
fn scale_down(
    ranked: &[PlayerScore],
    ceiled: Vec<TokenAmount>,
    pool: TokenAmount,
) -> Result<Vec<TokenAmount>, AllocationError> {
    let mut sum: TokenAmount = 0;
    for (p, &reward) in ranked.iter().zip(&ceiled) {
        sum = sum
            .checked_add(reward)
            .ok_or(AllocationError::Overflow(p.address))?;
    }

    if sum <= pool {
        return Ok(ceiled);
    }

    ranked
        .iter()
        .zip(ceiled)
        .map(|(p, reward)| {
            mul_div_floor(reward, pool, sum)
                .ok_or(AllocationError::Overflow(p.address))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::player::tests::addr;

    fn snapshot(scores: &[(u8, Score)]) -> Snapshot {
        Snapshot::new(
            scores
                .iter()
                .map(|&(a, s)| PlayerScore::new(addr(a), s))
                .collect(),
        )
        .unwrap()
    }

    fn random_snapshot(rng: &mut StdRng) -> Snapshot {
        let n = rng.gen_range(1..=40u8);
        let scores: Vec<_> =
            (1..=n).map(|a| (a, rng.gen_range(0..10_000))).collect();
        snapshot(&scores)
    }

    fn rewards(allocation: &Allocation) -> Vec<(Address, TokenAmount)> {
        allocation
            .entries()
            .iter()
            .map(|e| (e.address, e.reward))
            .collect()
    }

    #[test]
    fn exact_divisors_exhaust_pool() {
        let snap = snapshot(&[(0xa, 100), (0xb, 300), (0xc, 600)]);
        let alloc = allocate(&snap, &AllocationParams::new(1000)).unwrap();

        assert_eq!(
            rewards(&alloc),
            vec![(addr(0xc), 600), (addr(0xb), 300), (addr(0xa), 100)]
        );
        assert_eq!(alloc.total(), 1000);
        assert_eq!(alloc.unallocated(), 0);
    }

    #[test]
    fn floor_leaves_remainder_unallocated() {
        let snap = snapshot(&[(0xa, 1), (0xb, 1), (0xc, 1)]);
        let alloc = allocate(&snap, &AllocationParams::new(10)).unwrap();

        assert_eq!(
            rewards(&alloc),
            vec![(addr(0xa), 3), (addr(0xb), 3), (addr(0xc), 3)]
        );
        assert_eq!(alloc.total(), 9);
        assert_eq!(alloc.unallocated(), 1);
    }

    #[test]
    fn ceiling_scaled_never_exceeds_pool() {
        let snap = snapshot(&[(0xa, 1), (0xb, 1), (0xc, 1)]);
        let params = AllocationParams::new(10)
            .with_rounding(RoundingPolicy::CeilingScaled);
        let alloc = allocate(&snap, &params).unwrap();

        // ceil gives 4 each (12 > 10), scaled down to floor(4 * 10 / 12).
        assert_eq!(
            rewards(&alloc),
            vec![(addr(0xa), 3), (addr(0xb), 3), (addr(0xc), 3)]
        );

        let snap = snapshot(&[(0xa, 1), (0xb, 2)]);
        let alloc = allocate(&snap, &params).unwrap();
        // 10/3 -> 4, 20/3 -> 7; 11 > 10 so both are scaled.
        assert_eq!(rewards(&alloc), vec![(addr(0xb), 6), (addr(0xa), 3)]);
    }

    #[test]
    fn ceiling_scaled_keeps_exact_shares() {
        let snap = snapshot(&[(0xa, 100), (0xb, 300), (0xc, 600)]);
        let params = AllocationParams::new(1000)
            .with_rounding(RoundingPolicy::CeilingScaled);
        let alloc = allocate(&snap, &params).unwrap();

        assert_eq!(alloc.total(), 1000);
    }

    #[test]
    fn empty_and_zero_total_yield_empty_allocation() {
        let params = AllocationParams::new(1000);

        let alloc = allocate(&Snapshot::default(), &params).unwrap();
        assert!(alloc.is_empty());

        let alloc =
            allocate(&snapshot(&[(1, 0), (2, 0)]), &params).unwrap();
        assert!(alloc.is_empty());
        assert_eq!(alloc.unallocated(), 1000);
    }

    #[test]
    fn ties_break_by_address() {
        let snap = snapshot(&[(0x30, 5), (0x10, 5), (0x20, 9)]);
        let alloc = allocate(&snap, &AllocationParams::new(19)).unwrap();

        let order: Vec<_> =
            alloc.entries().iter().map(|e| e.address).collect();
        assert_eq!(order, vec![addr(0x20), addr(0x10), addr(0x30)]);
    }

    #[test]
    fn max_recipients_keeps_top_players() {
        let snap = snapshot(&[(1, 10), (2, 30), (3, 20), (4, 40)]);
        let params = AllocationParams::new(700)
            .with_max_recipients(NonZeroUsize::new(2));
        let alloc = allocate(&snap, &params).unwrap();

        assert_eq!(rewards(&alloc), vec![(addr(4), 400), (addr(2), 300)]);
    }

    #[test]
    fn scales_with_token_decimals() {
        let pool = 1000 * 10u128.pow(18);
        let snap = snapshot(&[(1, u64::MAX), (2, u64::MAX)]);
        let alloc = allocate(&snap, &AllocationParams::new(pool)).unwrap();

        assert_eq!(
            rewards(&alloc),
            vec![(addr(1), pool / 2), (addr(2), pool / 2)]
        );
    }

    #[test]
    fn never_over_allocates() {
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..200 {
            let snap = random_snapshot(&mut rng);
            let pool = rng.gen_range(0..1_000_000_000u128);

            for rounding in
                [RoundingPolicy::Floor, RoundingPolicy::CeilingScaled]
            {
                let params =
                    AllocationParams::new(pool).with_rounding(rounding);
                let alloc = allocate(&snap, &params).unwrap();
                assert!(alloc.total() <= pool, "{:?} over-allocated", rounding);
            }
        }
    }

    #[test]
    fn deterministic_for_identical_input() {
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..50 {
            let snap = random_snapshot(&mut rng);
            let params = AllocationParams::new(rng.gen_range(1..1_000_000));

            let mut shuffled = snap.players().to_vec();
            shuffled.reverse();
            let shuffled = Snapshot::new(shuffled).unwrap();

            let first = allocate(&snap, &params).unwrap();
            assert_eq!(first, allocate(&snap, &params).unwrap());
            assert_eq!(first, allocate(&shuffled, &params).unwrap());
        }
    }

    #[test]
    fn raising_a_score_never_lowers_its_reward() {
        let mut rng = StdRng::seed_from_u64(23);

        for i in 0..400 {
            let rounding = if i % 2 == 0 {
                RoundingPolicy::Floor
            } else {
                RoundingPolicy::CeilingScaled
            };
            let snap = random_snapshot(&mut rng);
            let params = AllocationParams::new(rng.gen_range(1..10_000_000))
                .with_rounding(rounding);
            let before = allocate(&snap, &params).unwrap();

            let mut players = snap.players().to_vec();
            let raised = rng.gen_range(0..players.len());
            players[raised].score += rng.gen_range(1..5_000);
            let target = players[raised].address;
            let after = allocate(&Snapshot::new(players).unwrap(), &params)
                .unwrap();

            let reward_of =
                |a: &Allocation| a.get(&target).map_or(0, |e| e.reward);
            assert!(
                reward_of(&after) >= reward_of(&before),
                "{:?} lowered the reward of {}",
                rounding,
                target
            );
        }
    }

    #[test]
    fn small_ceiling_scaled_cases_are_monotonic() {
        for pool in 1..40 {
            let params = AllocationParams::new(pool)
                .with_rounding(RoundingPolicy::CeilingScaled);

            for a in 0..7 {
                for b in 0..=7 {
                    for c in 0..=7 {
                        let reward = |score| {
                            let snap =
                                snapshot(&[(1, score), (2, b), (3, c)]);
                            let alloc = allocate(&snap, &params).unwrap();
                            alloc.get(&addr(1)).map_or(0, |e| e.reward)
                        };
                        assert!(reward(a + 1) >= reward(a));
                    }
                }
            }
        }
    }
}
