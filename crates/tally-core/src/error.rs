//! Error types for the Tally protocol.
//!
//! Each domain has its own enum; [`TallyError`] is the transparent top-level
//! wrapper. Peer-facing errors carry a ban-score weight via `ban_score()`:
//! structural problems cost 20, signature failures 50, consensus violations
//! 100 (immediate ban). Nothing outside the sync retry policy is allowed to
//! classify errors by message text.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("unknown network prefix: {0}")] UnknownPrefix(String),
    #[error("invalid base58 payload")] InvalidPayload,
    #[error("invalid checksum")] InvalidChecksum,
    #[error("invalid length: {0}")] InvalidLength(usize),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key bytes")] InvalidPublicKey,
    #[error("invalid private key bytes")] InvalidPrivateKey,
    #[error("invalid signature bytes")] InvalidSignature,
    #[error("signature verification failed")] VerificationFailed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("empty inputs")] EmptyInputs,
    #[error("empty outputs")] EmptyOutputs,
    #[error("coinbase must have no inputs")] CoinbaseHasInputs,
    #[error("duplicate outpoint within transaction: {0}")] DuplicateOutpoint(String),
    #[error("output index mismatch at position {position}: got {got}")] OutputIndexMismatch { position: usize, got: u32 },
    #[error("oversized: {size} > {max}")] Oversized { size: usize, max: usize },
    #[error("unknown UTXO: {0}")] UnknownUtxo(String),
    #[error("amount mismatch on {outpoint}: claimed {claimed}, recorded {recorded}")] AmountMismatch { outpoint: String, claimed: String, recorded: String },
    #[error("immature coinbase spend at input {index}")] ImmatureCoinbase { index: usize },
    #[error("outputs exceed inputs: in {inputs}, out {outputs}")] OutputsExceedInputs { inputs: String, outputs: String },
    #[error("fee {fee} below minimum {minimum}")] FeeTooLow { fee: String, minimum: String },
    #[error("fee {fee} above maximum {maximum}")] FeeTooHigh { fee: String, maximum: String },
    #[error("value overflow")] ValueOverflow,
    #[error("invalid signature on input {index}")] InvalidSignature { index: usize },
    #[error("input {index} key does not own the spent output")] KeyMismatch { index: usize },
    #[error("invalid coinbase: {0}")] InvalidCoinbase(String),
    #[error("serialization: {0}")] Serialization(String),
}

impl TransactionError {
    /// Ban score contributed by a peer that relayed a transaction failing
    /// with this error.
    pub fn ban_score(&self) -> u32 {
        match self {
            Self::InvalidSignature { .. } | Self::KeyMismatch { .. } => 50,
            Self::UnknownUtxo(_) | Self::AmountMismatch { .. } => 50,
            _ => 20,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("no coinbase")] NoCoinbase,
    #[error("first transaction is not coinbase")] FirstTxNotCoinbase,
    #[error("multiple coinbase transactions")] MultipleCoinbase,
    #[error("duplicate txid: {0}")] DuplicateTxid(String),
    #[error("invalid merkle root")] InvalidMerkleRoot,
    #[error("invalid validator root")] InvalidValidatorRoot,
    #[error("invalid proof of work")] InvalidPoW,
    #[error("invalid difficulty: got {got}, expected {expected}")] InvalidDifficulty { got: u64, expected: u64 },
    #[error("invalid block version: {0}")] InvalidVersion(u32),
    #[error("unknown parent: {0}")] UnknownParent(String),
    #[error("height mismatch: got {got}, expected {expected}")] HeightMismatch { got: u64, expected: u64 },
    #[error("timestamp not after median past")] TimestampBeforeMedian,
    #[error("timestamp too far in the future by {0} ms")] TimestampTooFar(i64),
    #[error("oversized: {size} > {max}")] Oversized { size: usize, max: usize },
    #[error("invalid miner signature")] BadMinerSignature,
    #[error("miner address does not match public key")] MinerAddressMismatch,
    #[error("invalid reward: got {got}, expected {expected}")] InvalidReward { got: String, expected: String },
    #[error("double spend across transactions: {0}")] DoubleSpend(String),
    #[error("tx error at index {index}: {source}")] Transaction { index: usize, source: TransactionError },
    #[error("vote reward violation: {0}")] VoteReward(String),
}

impl BlockError {
    /// Ban score contributed by the peer that relayed a block failing with
    /// this error.
    pub fn ban_score(&self) -> u32 {
        match self {
            Self::InvalidPoW
            | Self::InvalidDifficulty { .. }
            | Self::InvalidMerkleRoot
            | Self::InvalidValidatorRoot
            | Self::InvalidReward { .. }
            | Self::VoteReward(_) => 100,
            Self::BadMinerSignature | Self::MinerAddressMismatch => 50,
            Self::DoubleSpend(_) => 50,
            Self::Transaction { source, .. } => source.ban_score(),
            _ => 20,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction already in pool: {0}")] AlreadyExists(String),
    #[error("size exceeded: {size} > {max}")] SizeExceeded { size: usize, max: usize },
    #[error("bad signature")] BadSignature,
    #[error("sequence {got} not above {last} for sender {sender}")] NonceInvalid { sender: String, got: u32, last: u32 },
    #[error("double spend: {outpoint} already consumed by {existing}")] DoubleSpend { outpoint: String, existing: String },
    #[error("fee {fee} below effective minimum {minimum}")] FeeBelowMin { fee: String, minimum: String },
    #[error("pool full")] PoolFull,
    #[error("sender blacklisted: {0}")] Blacklisted(String),
    #[error("invalid: {0}")] Invalid(TransactionError),
    #[error("internal: {0}")] Internal(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UtxoError {
    #[error("double spend: missing UTXO {0}")] DoubleSpend(String),
    #[error("amount mismatch on {outpoint}: claimed {claimed}, recorded {recorded}")] AmountMismatch { outpoint: String, claimed: String, recorded: String },
    #[error("supply {total} exceeds cap {cap}")] SupplyExceeded { total: String, cap: String },
    #[error("spent tombstone leaked into committed state: {0}")] SpentTombstone(String),
    #[error("undo data missing for block: {0}")] UndoMissing(String),
    #[error("serialization: {0}")] Serialization(String),
    #[error("store: {0}")] Store(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VotingError {
    #[error("unknown period: {0}")] UnknownPeriod(u64),
    #[error("period {0} is not active")] PeriodClosed(u64),
    #[error("duplicate vote by {voter} in period {period}")] DuplicateVote { period: u64, voter: String },
    #[error("account too young: {age} < {required} blocks")] AccountTooYoung { age: u64, required: u64 },
    #[error("oversized vote: {size} > {max}")] Oversized { size: usize, max: usize },
    #[error("bad vote signature")] BadSignature,
    #[error("voting power mismatch: claimed {claimed}, computed {computed}")] PowerMismatch { claimed: String, computed: String },
    #[error("reward recipient {0} did not vote in the closed period")] NotAVoter(String),
    #[error("reward amount {got} does not match schedule {expected}")] RewardMismatch { got: String, expected: String },
    #[error("serialization: {0}")] Serialization(String),
    #[error("store: {0}")] Store(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("empty chain")] EmptyChain,
    #[error("block not found: {0}")] BlockNotFound(String),
    #[error("duplicate block: {0}")] DuplicateBlock(String),
    #[error("height mismatch: expected {expected}, got {got}")] HeightMismatch { expected: u64, got: u64 },
    #[error("no common ancestor within {0} blocks")] NoCommonAncestor(u64),
    #[error("reorg depth {depth} exceeds limit {max}")] ReorgDepthExceeded { depth: u64, max: u64 },
    #[error("store: {0}")] Store(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("timeout")] Timeout,
    #[error("peer unavailable: {0}")] PeerUnavailable(String),
    #[error("message too large: {size} > {max}")] MessageTooLarge { size: usize, max: usize },
    #[error("bad frame magic")] BadMagic,
    #[error("bad payload checksum")] BadChecksum,
    #[error("unknown message kind: {0}")] UnknownMessageKind(u8),
    #[error("protocol version {got} below minimum {min}")] ProtocolVersion { got: u32, min: u32 },
    #[error("rate limited")] RateLimited,
    #[error("peer banned")] Banned,
    #[error("connection closed")] Closed,
    #[error("serialization: {0}")] Serialization(String),
    #[error("io: {0}")] Io(String),
}

impl NetworkError {
    /// Whether the sync retry policy may retry an operation that failed with
    /// this error. This predicate is the only sanctioned error classifier.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Io(_) | Self::PeerUnavailable(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("no suitable peer")] NoSuitablePeer,
    #[error("header linkage broken at index {0}")] HeaderLinkage(usize),
    #[error("header heights not sequential at index {0}")] HeaderHeight(usize),
    #[error("header timestamps not increasing at index {0}")] HeaderTimestamp(usize),
    #[error("block hash mismatch at height {height}")] HashMismatch { height: u64 },
    #[error("peer demoted after {0} consecutive failures")] PeerDemoted(u32),
    #[error("rewind limit exceeded")] MaxRewindExceeded,
    #[error("cancelled")] Cancelled,
    #[error(transparent)] Network(#[from] NetworkError),
    #[error("consensus rejected block: {0}")] Consensus(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")] Unavailable(String),
    #[error("corruption: {0}")] Corruption(String),
    #[error("no such snapshot: {0}")] UnknownSnapshot(u64),
    #[error("serialization: {0}")] Serialization(String),
}

#[derive(Error, Debug)]
pub enum TallyError {
    #[error(transparent)] Address(#[from] AddressError),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] Mempool(#[from] MempoolError),
    #[error(transparent)] Utxo(#[from] UtxoError),
    #[error(transparent)] Voting(#[from] VotingError),
    #[error(transparent)] Chain(#[from] ChainError),
    #[error(transparent)] Network(#[from] NetworkError),
    #[error(transparent)] Sync(#[from] SyncError),
    #[error(transparent)] Store(#[from] StoreError),
}
