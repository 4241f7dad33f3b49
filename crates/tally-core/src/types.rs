//! Core protocol types: amounts, transactions, blocks, UTXOs, votes, tips.
//!
//! All monetary values are 256-bit unsigned integers in base units
//! (1 TLY = 10^8 units); the protocol never represents value as floating
//! point. Transaction ids use BLAKE3, block header hashes use double
//! SHA-256 over a fixed byte layout.

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::address::Address;
use crate::error::TransactionError;

/// A 32-byte hash value.
///
/// Used for transaction ids (BLAKE3), block header hashes (double SHA-256),
/// and merkle roots (BLAKE3). Rendered as lowercase hex.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash. Used as the genesis parent.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Interpret the hash as a big-endian 256-bit integer (for target checks
    /// and lexicographic tie-breaks).
    pub fn to_u256(&self) -> U256 {
        U256::from_big_endian(&self.0)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A 256-bit monetary amount in base units.
///
/// Wraps [`U256`] with checked arithmetic. Serialized as 32 little-endian
/// bytes on the wire and in the store.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(pub U256);

impl Amount {
    pub const ZERO: Self = Self(U256::zero());

    /// An amount from a base-unit count.
    pub fn from_units(units: u64) -> Self {
        Self(U256::from(units))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn checked_add(&self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(&self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn saturating_sub(&self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    /// Sum an iterator of amounts. Returns `None` on overflow.
    pub fn checked_sum<I: IntoIterator<Item = Amount>>(iter: I) -> Option<Amount> {
        iter.into_iter()
            .try_fold(Amount::ZERO, |acc, a| acc.checked_add(a))
    }
}

impl From<u64> for Amount {
    fn from(units: u64) -> Self {
        Self::from_units(units)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl bincode::Encode for Amount {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> Result<(), bincode::error::EncodeError> {
        let mut bytes = [0u8; 32];
        self.0.to_little_endian(&mut bytes);
        bytes.encode(encoder)
    }
}

impl<Context> bincode::Decode<Context> for Amount {
    fn decode<D: bincode::de::Decoder<Context = Context>>(
        decoder: &mut D,
    ) -> Result<Self, bincode::error::DecodeError> {
        let bytes = <[u8; 32]>::decode(decoder)?;
        Ok(Amount(U256::from_little_endian(&bytes)))
    }
}

bincode::impl_borrow_decode!(Amount);

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Id of the transaction containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within that transaction.
    pub index: u32,
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// Transaction kind tag.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default,
    bincode::Encode, bincode::Decode,
)]
pub enum TxKind {
    /// Ordinary value transfer.
    #[default]
    Standard,
    /// Block subsidy transaction. No inputs; first in every block.
    Coinbase,
    /// Mining-reward adjustment transaction. No inputs.
    PowReward,
    /// Voting participation reward. No inputs; validated against the
    /// just-closed voting period.
    VoteReward,
}

impl TxKind {
    /// Reward kinds are minted by the protocol and carry no inputs.
    pub fn is_reward(&self) -> bool {
        matches!(self, TxKind::Coinbase | TxKind::PowReward | TxKind::VoteReward)
    }
}

/// A transaction input, spending a previous output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    /// Id of the transaction whose output is being spent.
    pub previous_tx: Hash256,
    /// Index of the spent output.
    pub previous_index: u32,
    /// Ed25519 signature over the transaction's signing payload.
    pub script_sig: Vec<u8>,
    /// Public key authorizing the spend.
    pub public_key: Vec<u8>,
    /// Per-sender sequence number; mempool admission requires it to be
    /// strictly monotonic.
    pub sequence: u32,
    /// Claimed value of the spent output. Advisory only: the UTXO set's
    /// recorded amount is authoritative.
    pub claimed_amount: Amount,
}

impl TxInput {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.previous_tx,
            index: self.previous_index,
        }
    }
}

/// A transaction output, creating a new UTXO. Immutable once in a block.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    /// Recipient address.
    pub address: Address,
    /// Value in base units.
    pub amount: Amount,
    /// Locking script (opaque to the core).
    pub script: Vec<u8>,
    /// Position of this output within its transaction.
    pub index: u32,
}

/// A transaction transferring value between addresses.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    /// Protocol version.
    pub version: u32,
    /// Kind tag. Reward kinds carry no inputs.
    pub kind: TxKind,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Block height or timestamp before which this tx is invalid.
    pub lock_time: u64,
    /// Creation time in Unix milliseconds.
    pub timestamp_ms: u64,
    /// Sender signature over [`signing_payload`](Self::signing_payload).
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Compute the transaction id: BLAKE3 over the canonical encoding.
    pub fn id(&self) -> Result<Hash256, TransactionError> {
        let encoded = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TransactionError::Serialization(e.to_string()))?;
        Ok(Hash256(blake3::hash(&encoded).into()))
    }

    /// The canonical encoding with the signature fields cleared. This is
    /// what input owners and the sender sign.
    pub fn signing_payload(&self) -> Result<Vec<u8>, TransactionError> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        for input in &mut unsigned.inputs {
            input.script_sig.clear();
        }
        bincode::encode_to_vec(&unsigned, bincode::config::standard())
            .map_err(|e| TransactionError::Serialization(e.to_string()))
    }

    /// Whether this is the block subsidy transaction.
    pub fn is_coinbase(&self) -> bool {
        self.kind == TxKind::Coinbase && self.inputs.is_empty()
    }

    /// Sum of all output amounts. Returns `None` on overflow.
    pub fn total_output_amount(&self) -> Option<Amount> {
        Amount::checked_sum(self.outputs.iter().map(|o| o.amount))
    }

    /// Serialized size in bytes.
    pub fn serialized_size(&self) -> Result<usize, TransactionError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map(|v| v.len())
            .map_err(|e| TransactionError::Serialization(e.to_string()))
    }

    /// Outpoints consumed by this transaction.
    pub fn outpoints(&self) -> impl Iterator<Item = OutPoint> + '_ {
        self.inputs.iter().map(TxInput::outpoint)
    }
}

/// Block header containing the proof-of-work puzzle and miner attestation.
///
/// The hash is double SHA-256 over [`header_base`](Self::header_base), the
/// canonical pre-signature byte layout. The `difficulty` field is the
/// compact work requirement; the 256-bit target is derived from it.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    pub version: u32,
    /// Hash of the previous block header. Zero for genesis.
    pub previous_hash: Hash256,
    /// BLAKE3 merkle root of the block's transaction ids.
    pub merkle_root: Hash256,
    /// BLAKE3 merkle root committing to the block's validator set.
    pub validator_root: Hash256,
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// Compact difficulty. The target is `U256::MAX / difficulty`;
    /// higher difficulty means a smaller target.
    pub difficulty: u64,
    pub nonce: u64,
    pub height: u64,
    /// Address credited by the coinbase.
    pub miner_address: Address,
    /// Key that signs the header.
    pub miner_public_key: Vec<u8>,
    /// Miner signature over [`header_base`](Self::header_base).
    pub signature: Vec<u8>,
}

impl BlockHeader {
    /// Canonical pre-signature byte layout, hashed and signed by the miner.
    ///
    /// Fixed-width little-endian integers, then length-prefixed variable
    /// fields: version || previous_hash || merkle_root || validator_root ||
    /// timestamp_ms || difficulty || nonce || height || miner_address ||
    /// miner_public_key.
    pub fn header_base(&self) -> Vec<u8> {
        let addr = self.miner_address.as_str().as_bytes();
        let mut data = Vec::with_capacity(4 + 32 * 3 + 8 * 4 + 8 + addr.len() + self.miner_public_key.len());
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(self.previous_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(self.validator_root.as_bytes());
        data.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        data.extend_from_slice(&self.difficulty.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        data.extend_from_slice(&self.height.to_le_bytes());
        data.extend_from_slice(&(addr.len() as u32).to_le_bytes());
        data.extend_from_slice(addr);
        data.extend_from_slice(&(self.miner_public_key.len() as u32).to_le_bytes());
        data.extend_from_slice(&self.miner_public_key);
        data
    }

    /// Block header hash: double SHA-256 of the pre-signature encoding.
    pub fn hash(&self) -> Hash256 {
        let first = Sha256::digest(self.header_base());
        Hash256(Sha256::digest(first).into())
    }

    /// The 256-bit proof-of-work target decoded from `difficulty`.
    pub fn target(&self) -> U256 {
        U256::MAX / U256::from(self.difficulty.max(1))
    }

    /// Whether the header hash satisfies its own difficulty target.
    pub fn meets_target(&self) -> bool {
        self.hash().to_u256() <= self.target()
    }

    /// Work contributed by this header toward cumulative chain work.
    pub fn work(&self) -> U256 {
        U256::from(self.difficulty.max(1))
    }
}

/// A complete block: header, transactions, votes cast during its window,
/// and the validator set the header's `validator_root` commits to.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    pub header: BlockHeader,
    /// Ordered transactions. The first must be coinbase.
    pub transactions: Vec<Transaction>,
    pub votes: Vec<Vote>,
    pub validators: Vec<Address>,
}

impl Block {
    /// The coinbase transaction, if the block is non-empty.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    pub fn serialized_size(&self) -> Result<usize, TransactionError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map(|v| v.len())
            .map_err(|e| TransactionError::Serialization(e.to_string()))
    }
}

/// An entry in the unspent transaction output set, keyed by
/// `(tx_id, output_index)`.
///
/// `spent` is a tombstone used only while a block application is in flight
/// inside a store batch; committed entries are always unspent.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Utxo {
    pub tx_id: Hash256,
    pub output_index: u32,
    pub amount: Amount,
    pub address: Address,
    pub script: Vec<u8>,
    /// Creation time in Unix milliseconds.
    pub timestamp_ms: u64,
    /// Height of the block that created this output.
    pub block_height: u64,
    /// Whether the creating transaction was a reward transaction.
    pub coinbase: bool,
    pub spent: bool,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.tx_id,
            index: self.output_index,
        }
    }

    /// Coinbase outputs require [`COINBASE_MATURITY`](crate::constants::COINBASE_MATURITY)
    /// confirmations before they may be spent.
    pub fn is_mature(&self, current_height: u64) -> bool {
        if !self.coinbase {
            return true;
        }
        current_height.saturating_sub(self.block_height) >= crate::constants::COINBASE_MATURITY
    }
}

/// Fork preference data attached to a vote during a contested fork.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct ChainVote {
    /// Tip hash of the chain this voter endorses.
    pub target_chain_id: Hash256,
    /// Height at which the fork diverged.
    pub fork_height: u64,
}

/// A single direct vote. At most one per voter per period.
///
/// `voting_power` must equal `floor(sqrt(balance))` (quadratic voting).
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Vote {
    pub vote_id: Hash256,
    pub period_id: u64,
    /// Block hash the vote approves or rejects.
    pub block_hash: Hash256,
    pub voter: Address,
    pub approve: bool,
    pub voting_power: Amount,
    /// Chain height at the time of voting. The balance recorded here is
    /// final for this period even if the voter later spends.
    pub height: u64,
    pub balance: Amount,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
    pub timestamp_ms: u64,
    pub chain_vote: Option<ChainVote>,
}

impl Vote {
    /// The canonical encoding with the signature cleared; this is what the
    /// voter signs.
    pub fn signing_payload(&self) -> Result<Vec<u8>, crate::error::VotingError> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        bincode::encode_to_vec(&unsigned, bincode::config::standard())
            .map_err(|e| crate::error::VotingError::Serialization(e.to_string()))
    }

    pub fn serialized_size(&self) -> Result<usize, crate::error::VotingError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map(|v| v.len())
            .map_err(|e| crate::error::VotingError::Serialization(e.to_string()))
    }
}

/// Lifecycle state of a voting period.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum PeriodStatus {
    Active,
    Completed,
    Cancelled,
}

/// What a voting period decides.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum PeriodKind {
    NodeSelection,
    ParameterChange,
}

/// A contiguous voting window bounded by both height and wall clock.
///
/// Periods are contiguous and non-overlapping; a `Completed` period is
/// immutable.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct VotingPeriod {
    pub period_id: u64,
    pub start_height: u64,
    pub end_height: u64,
    pub start_time_ms: u64,
    pub end_time_ms: u64,
    pub status: PeriodStatus,
    pub kind: PeriodKind,
    pub votes: Vec<Vote>,
    /// Incrementally maintained merkle root over the period's vote ids.
    pub votes_merkle_root: Hash256,
    /// Tip selected by this period's fork decision, if one was contested.
    pub fork_decision: Option<Hash256>,
}

/// Status of a known chain tip.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum TipStatus {
    /// The tip of the active chain.
    Active,
    /// A fully validated competing branch.
    ValidFork,
    /// Headers validated, bodies not yet.
    ValidHeaders,
    /// Rejected; never reconsidered.
    Invalid,
}

/// A known chain tip: the active one or a competing branch head.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct ChainTip {
    pub height: u64,
    pub hash: Hash256,
    /// Number of blocks on this branch since it diverged from the active chain.
    pub branch_len: u64,
    pub status: TipStatus,
    /// First block of the branch, if known.
    pub first_block_hash: Option<Hash256>,
    /// When this tip was last validated, in Unix milliseconds.
    pub last_validated_ms: u64,
}
