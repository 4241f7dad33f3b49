//! Vote collection, tallying, and fork decisions.
//!
//! A period opens at a deterministic height (`height / VOTING_PERIOD_BLOCKS`)
//! and closes at the first block past its end height or when its wall-clock
//! window elapses, whichever comes first. Completed periods are immutable;
//! an emergency cancellation is the only other exit from `Active`.
//!
//! A voter's balance is the one recorded at `vote.height`; spending later in
//! the period does not retroactively change a tally.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use primitive_types::U256;
use tracing::{debug, info, warn};

use tally_core::constants::{
    MAX_VOTE_SIZE_BYTES, MIN_ACCOUNT_AGE, PARTICIPATION_REWARD, VOTING_PERIOD_BLOCKS,
    VOTING_PERIOD_MS,
};
use tally_core::crypto::Crypto;
use tally_core::difficulty::VoterTurnout;
use tally_core::error::VotingError;
use tally_core::merkle::IncrementalRoot;
use tally_core::store::{keys, Store};
use tally_core::types::{
    Amount, Hash256, PeriodKind, PeriodStatus, Transaction, TxKind, Vote, VotingPeriod,
};

use crate::power;

/// Result of tallying one period.
#[derive(Clone, Debug, PartialEq)]
pub struct TallyResult {
    pub total_power: Amount,
    pub approve_power: Amount,
    /// `voter_count / eligible_voter_count`, in `[0, 1]`. Statistical only;
    /// never feeds monetary arithmetic.
    pub participation_rate: f64,
    pub voter_count: usize,
}

/// One side of a contested fork.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForkCandidate {
    pub tip_hash: Hash256,
    pub cumulative_work: U256,
}

/// The direct-voting engine.
///
/// Owns the period map; votes are persisted under `vote:<period>:<voter>`
/// so a restart can rebuild periods from the store.
pub struct DirectVoting {
    store: Arc<dyn Store>,
    crypto: Arc<dyn Crypto>,
    periods: RwLock<HashMap<u64, VotingPeriod>>,
    roots: RwLock<HashMap<u64, IncrementalRoot>>,
}

impl DirectVoting {
    pub fn new(store: Arc<dyn Store>, crypto: Arc<dyn Crypto>) -> Self {
        Self {
            store,
            crypto,
            periods: RwLock::new(HashMap::new()),
            roots: RwLock::new(HashMap::new()),
        }
    }

    /// The period id covering a height.
    pub fn period_for_height(height: u64) -> u64 {
        height / VOTING_PERIOD_BLOCKS
    }

    /// Open (or return) the period covering `height`. Periods are
    /// contiguous and non-overlapping by construction.
    pub fn open_period(&self, height: u64, now_ms: u64, kind: PeriodKind) -> u64 {
        let period_id = Self::period_for_height(height);
        let mut periods = self.periods.write();
        periods.entry(period_id).or_insert_with(|| {
            let start_height = period_id * VOTING_PERIOD_BLOCKS;
            info!(period_id, start_height, "voting: period opened");
            VotingPeriod {
                period_id,
                start_height,
                end_height: start_height + VOTING_PERIOD_BLOCKS - 1,
                start_time_ms: now_ms,
                end_time_ms: now_ms + VOTING_PERIOD_MS,
                status: PeriodStatus::Active,
                kind,
                votes: Vec::new(),
                votes_merkle_root: Hash256::ZERO,
                fork_decision: None,
            }
        });
        period_id
    }

    /// Advance period state for a newly committed block: any active period
    /// whose height window or wall-clock window has passed becomes
    /// `Completed`. Returns the ids of periods closed by this call.
    pub fn on_block_committed(&self, height: u64, now_ms: u64) -> Vec<u64> {
        let mut closed = Vec::new();
        let mut periods = self.periods.write();
        for period in periods.values_mut() {
            if period.status == PeriodStatus::Active
                && (height > period.end_height || now_ms >= period.end_time_ms)
            {
                period.status = PeriodStatus::Completed;
                info!(period_id = period.period_id, votes = period.votes.len(),
                    "voting: period completed");
                closed.push(period.period_id);
            }
        }
        closed
    }

    /// Emergency cancellation. Only an `Active` period can be cancelled;
    /// the audit trail lives outside the core.
    pub fn cancel_period(&self, period_id: u64) -> Result<(), VotingError> {
        let mut periods = self.periods.write();
        let period = periods
            .get_mut(&period_id)
            .ok_or(VotingError::UnknownPeriod(period_id))?;
        if period.status != PeriodStatus::Active {
            return Err(VotingError::PeriodClosed(period_id));
        }
        warn!(period_id, "voting: period cancelled");
        period.status = PeriodStatus::Cancelled;
        Ok(())
    }

    /// Admit a vote into its period.
    ///
    /// Checks, in order: period active; size; signature and voter identity;
    /// one vote per `(voter, period)`; account age; quadratic power.
    /// On success the period's merkle root is updated incrementally and the
    /// vote is persisted.
    pub fn submit(&self, vote: Vote, account_age_blocks: u64) -> Result<(), VotingError> {
        let mut periods = self.periods.write();
        let period = periods
            .get_mut(&vote.period_id)
            .ok_or(VotingError::UnknownPeriod(vote.period_id))?;
        if period.status != PeriodStatus::Active {
            return Err(VotingError::PeriodClosed(vote.period_id));
        }

        let size = vote.serialized_size()?;
        if size > MAX_VOTE_SIZE_BYTES {
            return Err(VotingError::Oversized { size, max: MAX_VOTE_SIZE_BYTES });
        }

        let payload = vote.signing_payload()?;
        if !self.crypto.verify(&payload, &vote.signature, &vote.public_key) {
            return Err(VotingError::BadSignature);
        }
        let owner = self.crypto.public_key_hash(&vote.public_key);
        if vote.voter.pubkey_hash().ok() != Some(owner) {
            return Err(VotingError::BadSignature);
        }

        if period.votes.iter().any(|v| v.voter == vote.voter) {
            return Err(VotingError::DuplicateVote {
                period: vote.period_id,
                voter: vote.voter.to_string(),
            });
        }

        if account_age_blocks < MIN_ACCOUNT_AGE {
            return Err(VotingError::AccountTooYoung {
                age: account_age_blocks,
                required: MIN_ACCOUNT_AGE,
            });
        }

        if !power::power_matches(vote.balance, vote.voting_power) {
            return Err(VotingError::PowerMismatch {
                claimed: vote.voting_power.to_string(),
                computed: power::voting_power(vote.balance).to_string(),
            });
        }

        let encoded = bincode::encode_to_vec(&vote, bincode::config::standard())
            .map_err(|e| VotingError::Serialization(e.to_string()))?;
        self.store
            .put(&keys::vote(vote.period_id, &vote.voter), &encoded)
            .map_err(|e| VotingError::Store(e.to_string()))?;

        let mut roots = self.roots.write();
        let root = roots.entry(vote.period_id).or_default().push(vote.vote_id);
        period.votes_merkle_root = root;
        debug!(period_id = vote.period_id, voter = %vote.voter, "voting: vote accepted");
        period.votes.push(vote);
        Ok(())
    }

    /// Tally a period.
    pub fn tally(&self, period_id: u64, eligible_voters: usize) -> Result<TallyResult, VotingError> {
        let periods = self.periods.read();
        let period = periods
            .get(&period_id)
            .ok_or(VotingError::UnknownPeriod(period_id))?;

        let mut total_power = Amount::ZERO;
        let mut approve_power = Amount::ZERO;
        for vote in &period.votes {
            total_power = total_power
                .checked_add(vote.voting_power)
                .ok_or_else(|| VotingError::Serialization("power overflow".into()))?;
            if vote.approve {
                approve_power = approve_power
                    .checked_add(vote.voting_power)
                    .ok_or_else(|| VotingError::Serialization("power overflow".into()))?;
            }
        }

        let participation_rate = if eligible_voters == 0 {
            0.0
        } else {
            period.votes.len() as f64 / eligible_voters as f64
        };

        Ok(TallyResult {
            total_power,
            approve_power,
            participation_rate,
            voter_count: period.votes.len(),
        })
    }

    /// Voter statistics for the difficulty adjuster.
    pub fn turnout(&self, period_id: u64, eligible_voters: usize) -> Option<VoterTurnout> {
        let tally = self.tally(period_id, eligible_voters).ok()?;
        if tally.total_power.is_zero() {
            return None;
        }
        // Ratio of two powers; statistical output only.
        let approval_rate = amount_ratio(tally.approve_power, tally.total_power);
        Some(VoterTurnout {
            participation: tally.participation_rate,
            approval_rate,
        })
    }

    /// Whether any non-cancelled period holds a chain vote for either tip.
    ///
    /// The consensus engine uses this to distinguish a contested fork from
    /// a plain work race.
    pub fn has_chain_votes(&self, a: &Hash256, b: &Hash256) -> bool {
        let periods = self.periods.read();
        periods.values().any(|period| {
            period.status != PeriodStatus::Cancelled
                && period.votes.iter().any(|v| {
                    v.chain_vote
                        .as_ref()
                        .is_some_and(|cv| cv.target_chain_id == *a || cv.target_chain_id == *b)
                })
        })
    }

    /// Decide a contested fork.
    ///
    /// Sums the chain-vote power cast for each candidate tip across active
    /// and completed periods; the greater power wins. Ties break to the
    /// greater cumulative work, then to the lexicographically smaller hash.
    pub fn decide_fork(&self, a: &ForkCandidate, b: &ForkCandidate) -> Hash256 {
        let (power_a, power_b) = {
            let periods = self.periods.read();
            let mut pa = Amount::ZERO;
            let mut pb = Amount::ZERO;
            for period in periods.values() {
                if period.status == PeriodStatus::Cancelled {
                    continue;
                }
                for vote in &period.votes {
                    let Some(cv) = &vote.chain_vote else { continue };
                    if cv.target_chain_id == a.tip_hash {
                        pa = pa.checked_add(vote.voting_power).unwrap_or(pa);
                    } else if cv.target_chain_id == b.tip_hash {
                        pb = pb.checked_add(vote.voting_power).unwrap_or(pb);
                    }
                }
            }
            (pa, pb)
        };

        let winner = if power_a != power_b {
            if power_a > power_b { a } else { b }
        } else if a.cumulative_work != b.cumulative_work {
            if a.cumulative_work > b.cumulative_work { a } else { b }
        } else if a.tip_hash <= b.tip_hash {
            a
        } else {
            b
        };

        debug!(winner = %winner.tip_hash, %power_a, %power_b, "voting: fork decided");

        // Record the decision on every period that contributed votes.
        let mut periods = self.periods.write();
        for period in periods.values_mut() {
            if period.status == PeriodStatus::Active
                && period.votes.iter().any(|v| v.chain_vote.is_some())
            {
                period.fork_decision = Some(winner.tip_hash);
            }
        }

        winner.tip_hash
    }

    /// Validate a `VoteReward` transaction at `height`.
    ///
    /// The recipient must have voted in the most recently completed period
    /// and the payout must equal the fixed per-voter reward.
    pub fn validate_participation_reward(
        &self,
        tx: &Transaction,
        height: u64,
    ) -> Result<(), VotingError> {
        if tx.kind != TxKind::VoteReward {
            return Err(VotingError::RewardMismatch {
                got: "non-reward kind".into(),
                expected: "VoteReward".into(),
            });
        }
        let recipient = &tx
            .outputs
            .first()
            .ok_or_else(|| VotingError::RewardMismatch {
                got: "no outputs".into(),
                expected: "one recipient".into(),
            })?
            .address;

        let periods = self.periods.read();
        let latest_closed = periods
            .values()
            .filter(|p| p.status == PeriodStatus::Completed && p.end_height < height)
            .max_by_key(|p| p.period_id)
            .ok_or_else(|| VotingError::NotAVoter(recipient.to_string()))?;

        if !latest_closed.votes.iter().any(|v| &v.voter == recipient) {
            return Err(VotingError::NotAVoter(recipient.to_string()));
        }

        let expected = Amount::from_units(PARTICIPATION_REWARD);
        let got = tx
            .total_output_amount()
            .ok_or_else(|| VotingError::Serialization("amount overflow".into()))?;
        if got != expected {
            return Err(VotingError::RewardMismatch {
                got: got.to_string(),
                expected: expected.to_string(),
            });
        }
        Ok(())
    }

    /// A snapshot of a period, if known.
    pub fn period(&self, period_id: u64) -> Option<VotingPeriod> {
        self.periods.read().get(&period_id).cloned()
    }
}

/// Ratio of two amounts as an f64 in `[0, 1]`. Statistical use only.
fn amount_ratio(numerator: Amount, denominator: Amount) -> f64 {
    if denominator.is_zero() {
        return 0.0;
    }
    // Scale into u64 range before converting; powers fit comfortably.
    let n = numerator.0.min(U256::from(u64::MAX)).as_u64() as f64;
    let d = denominator.0.min(U256::from(u64::MAX)).as_u64() as f64;
    (n / d).clamp(0.0, 1.0)
}
