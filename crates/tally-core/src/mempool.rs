//! Bounded pool of validated, unconfirmed transactions.
//!
//! Indexes:
//! - by txid for O(1) lookup
//! - by spent outpoint for O(1) conflict detection
//! - by fee rate for block-template selection
//! - by arrival time for eviction and expiry
//!
//! Admission re-validates the transaction against the current UTXO view and
//! enforces the per-sender monotonic sequence rule, the blacklist, and a
//! fee floor that scales with pool utilization (1x at 75 % full, 2x at
//! 100 %). When the pool is full the **oldest** entries are evicted to make
//! room; fee rate never protects an old entry from eviction.
//!
//! Not thread-safe; the owning node serializes access behind its own lock
//! and holds it only briefly while applying block removals at the end of a
//! commit.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::address::Address;
use crate::constants::{MAX_MEMPOOL_SIZE, MEMPOOL_EXPIRY_MS, MIN_FEE};
use crate::crypto::Crypto;
use crate::error::{MempoolError, TransactionError};
use crate::traits::UtxoView;
use crate::types::{Amount, Block, Hash256, OutPoint, Transaction};

/// Fee-rate precision multiplier (milli-units per byte).
const FEE_RATE_PRECISION: u128 = 1_000;

fn fee_rate(fee: Amount, size: usize) -> u64 {
    if size == 0 {
        return u64::MAX;
    }
    // Fees are bounded by MAX_FEE, far below u64::MAX units.
    let fee_units = fee.0.min(primitive_types::U256::from(u64::MAX)).as_u64();
    let rate = (fee_units as u128) * FEE_RATE_PRECISION / (size as u128);
    rate.min(u64::MAX as u128) as u64
}

/// A pooled transaction with precomputed metadata.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub txid: Hash256,
    pub fee: Amount,
    pub size: usize,
    pub sender: Address,
    /// Arrival time in Unix milliseconds; drives eviction and expiry.
    pub received_ms: u64,
    fee_rate: u64,
}

impl MempoolEntry {
    pub fn fee_rate(&self) -> u64 {
        self.fee_rate
    }
}

/// Bounded set of unconfirmed transactions.
pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    by_outpoint: HashMap<OutPoint, Hash256>,
    by_fee_rate: BTreeSet<(u64, Hash256)>,
    by_age: BTreeSet<(u64, Hash256)>,
    /// Highest sequence number ever admitted per sender. A watermark: it
    /// survives removal so replays of old sequences stay rejected.
    sender_sequence: HashMap<Address, u32>,
    blacklist: HashSet<Address>,
    max_count: usize,
    total_bytes: usize,
}

impl Mempool {
    pub fn new(max_count: usize) -> Self {
        Self {
            entries: HashMap::new(),
            by_outpoint: HashMap::new(),
            by_fee_rate: BTreeSet::new(),
            by_age: BTreeSet::new(),
            sender_sequence: HashMap::new(),
            blacklist: HashSet::new(),
            max_count,
            total_bytes: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(MAX_MEMPOOL_SIZE)
    }

    /// The fee floor at current utilization.
    ///
    /// Below 75 % utilization this is [`MIN_FEE`]; above, it scales
    /// linearly to 2x at a full pool. Integer arithmetic only.
    pub fn effective_min_fee(&self) -> Amount {
        let len = self.entries.len() as u128;
        let max = self.max_count.max(1) as u128;
        let over = (4 * len).saturating_sub(3 * max);
        Amount(primitive_types::U256::from(
            (MIN_FEE as u128 * (max + over) / max) as u64,
        ))
    }

    /// Validate and admit a transaction.
    ///
    /// `view` is the current confirmed UTXO state; `height` the current
    /// chain height (for maturity); `now_ms` stamps arrival time.
    pub fn add(
        &mut self,
        tx: Transaction,
        view: &dyn UtxoView,
        crypto: &dyn Crypto,
        height: u64,
        now_ms: u64,
    ) -> Result<Hash256, MempoolError> {
        self.add_inner(tx, view, crypto, height, now_ms, true)
    }

    /// Re-admit a transaction whose block was reverted in a reorganization.
    ///
    /// Identical to [`add`](Self::add) except the per-sender sequence
    /// watermark is not enforced: the sequence was legitimately consumed by
    /// the now-reverted block.
    pub fn readmit(
        &mut self,
        tx: Transaction,
        view: &dyn UtxoView,
        crypto: &dyn Crypto,
        height: u64,
        now_ms: u64,
    ) -> Result<Hash256, MempoolError> {
        self.add_inner(tx, view, crypto, height, now_ms, false)
    }

    fn add_inner(
        &mut self,
        tx: Transaction,
        view: &dyn UtxoView,
        crypto: &dyn Crypto,
        height: u64,
        now_ms: u64,
        enforce_sequence: bool,
    ) -> Result<Hash256, MempoolError> {
        if tx.kind.is_reward() {
            return Err(MempoolError::Invalid(TransactionError::InvalidCoinbase(
                "reward transactions are block-only".into(),
            )));
        }

        let txid = tx.id().map_err(|e| MempoolError::Internal(e.to_string()))?;
        if self.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyExists(txid.to_string()));
        }

        let first_key = tx
            .inputs
            .first()
            .map(|i| i.public_key.clone())
            .ok_or(MempoolError::Invalid(TransactionError::EmptyInputs))?;
        let sender = crypto
            .derive_address(&first_key)
            .map_err(|_| MempoolError::BadSignature)?;

        if self.blacklist.contains(&sender) {
            return Err(MempoolError::Blacklisted(sender.to_string()));
        }

        // Per-sender monotonic sequence.
        let sequence = tx.inputs[0].sequence;
        if enforce_sequence {
            if let Some(&last) = self.sender_sequence.get(&sender) {
                if sequence <= last {
                    return Err(MempoolError::NonceInvalid {
                        sender: sender.to_string(),
                        got: sequence,
                        last,
                    });
                }
            }
        }

        // Conflicts with pool entries.
        for input in &tx.inputs {
            let outpoint = input.outpoint();
            if let Some(existing) = self.by_outpoint.get(&outpoint) {
                return Err(MempoolError::DoubleSpend {
                    outpoint: outpoint.to_string(),
                    existing: existing.to_string(),
                });
            }
        }

        // Full validation against the confirmed UTXO state.
        let validated = crate::validation::validate_transaction(
            &tx,
            |op| view.utxo(op).ok().flatten().filter(|u| !u.spent),
            crypto,
            height,
        )
        .map_err(map_validation_error)?;

        // Utilization-scaled fee floor.
        let floor = self.effective_min_fee();
        if validated.fee < floor {
            return Err(MempoolError::FeeBelowMin {
                fee: validated.fee.to_string(),
                minimum: floor.to_string(),
            });
        }

        let size = tx
            .serialized_size()
            .map_err(|e| MempoolError::Internal(e.to_string()))?;

        // Make room by dropping the oldest entries.
        while self.entries.len() >= self.max_count {
            let Some(&(_, oldest)) = self.by_age.iter().next() else {
                return Err(MempoolError::PoolFull);
            };
            self.remove_entry(oldest);
        }

        let rate = fee_rate(validated.fee, size);
        for input in &tx.inputs {
            self.by_outpoint.insert(input.outpoint(), txid);
        }
        self.by_fee_rate.insert((rate, txid));
        self.by_age.insert((now_ms, txid));
        // Watermark only ever rises; a readmitted old sequence must not lower it.
        let watermark = self.sender_sequence.entry(sender.clone()).or_insert(sequence);
        *watermark = (*watermark).max(sequence);
        self.total_bytes += size;
        self.entries.insert(
            txid,
            MempoolEntry {
                tx,
                txid,
                fee: validated.fee,
                size,
                sender,
                received_ms: now_ms,
                fee_rate: rate,
            },
        );

        Ok(txid)
    }

    /// Remove by txid. Idempotent.
    pub fn remove(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        self.remove_entry(*txid)
    }

    fn remove_entry(&mut self, txid: Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(&txid)?;
        for input in &entry.tx.inputs {
            self.by_outpoint.remove(&input.outpoint());
        }
        self.by_fee_rate.remove(&(entry.fee_rate, txid));
        self.by_age.remove(&(entry.received_ms, txid));
        self.total_bytes -= entry.size;
        Some(entry)
    }

    /// Remove every transaction included in `block`, plus any pool entry
    /// that now conflicts with an outpoint the block spent.
    pub fn remove_included(&mut self, block: &Block) {
        let mut spent: HashSet<OutPoint> = HashSet::new();
        for tx in &block.transactions {
            if let Ok(txid) = tx.id() {
                self.remove_entry(txid);
            }
            spent.extend(tx.outpoints());
        }
        let conflicting: Vec<Hash256> = spent
            .iter()
            .filter_map(|op| self.by_outpoint.get(op).copied())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        for txid in conflicting {
            self.remove_entry(txid);
        }
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    /// Lazy view of the current pool contents, in arbitrary order.
    /// Not restartable: it borrows the pool.
    pub fn snapshot(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    /// Drop entries older than [`MEMPOOL_EXPIRY_MS`] and entries from
    /// blacklisted senders. Returns the number removed.
    pub fn expire(&mut self, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(MEMPOOL_EXPIRY_MS);
        let stale: Vec<Hash256> = self
            .entries
            .values()
            .filter(|e| e.received_ms < cutoff || self.blacklist.contains(&e.sender))
            .map(|e| e.txid)
            .collect();
        let removed = stale.len();
        for txid in stale {
            self.remove_entry(txid);
        }
        removed
    }

    /// Blacklist a sender. Their existing entries are removed on the next
    /// [`expire`](Self::expire) sweep; new submissions are refused at once.
    pub fn blacklist_sender(&mut self, sender: Address) {
        self.blacklist.insert(sender);
    }

    /// Greedy fee-rate-descending selection under a byte budget, for block
    /// templates.
    pub fn select_transactions(&self, max_bytes: usize) -> Vec<&MempoolEntry> {
        let mut selected = Vec::new();
        let mut remaining = max_bytes;
        for (_, txid) in self.by_fee_rate.iter().rev() {
            if remaining == 0 {
                break;
            }
            if let Some(entry) = self.entries.get(txid) {
                if entry.size <= remaining {
                    selected.push(entry);
                    remaining -= entry.size;
                }
            }
        }
        selected
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }
}

fn map_validation_error(e: TransactionError) -> MempoolError {
    match e {
        TransactionError::UnknownUtxo(op) => MempoolError::DoubleSpend {
            outpoint: op,
            existing: "spent or unknown".into(),
        },
        TransactionError::InvalidSignature { .. } | TransactionError::KeyMismatch { .. } => {
            MempoolError::BadSignature
        }
        TransactionError::Oversized { size, max } => MempoolError::SizeExceeded { size, max },
        TransactionError::FeeTooLow { fee, minimum } => MempoolError::FeeBelowMin { fee, minimum },
        other => MempoolError::Invalid(other),
    }
}
