//! Protocol constants. All monetary values are in base units (1 TLY = 10^8 units).

/// Base units per coin.
pub const COIN: u64 = 100_000_000;

/// Maximum total supply in base units. The UTXO set total must never exceed this.
pub const MAX_SUPPLY_UNITS: u64 = 50_000_000 * COIN;

/// Initial block reward before any halving.
pub const INITIAL_REWARD: u64 = 50 * COIN;

/// Reward floor. The schedule never pays less than this per block.
pub const MIN_REWARD: u64 = 1;

/// Blocks between reward halvings.
pub const HALVING_INTERVAL: u64 = 210_000;

/// Cap on the number of halvings applied to the reward shift.
pub const MAX_HALVINGS: u64 = 64;

/// Target spacing between blocks, in milliseconds.
pub const TARGET_BLOCK_TIME_MS: u64 = 60_000;

/// Blocks between difficulty retargets.
pub const DIFFICULTY_ADJUSTMENT_INTERVAL: u64 = 2016;

/// Block-time window consulted by the difficulty adjuster.
pub const WINDOW_SIZE: usize = 2016;

/// Hashrate samples consulted by the difficulty adjuster.
pub const HASH_RATE_WINDOW: usize = 72;

/// Weight of the vote signal in the combined difficulty adjustment.
pub const VOTE_INFLUENCE: f64 = 0.4;

/// Per-retarget clamp on the combined adjustment: `[1 - x, 1 + x]`.
pub const ADJUSTMENT_FACTOR: f64 = 0.25;

/// Minimum voter participation for the vote signal to apply.
pub const MIN_VOTES_WEIGHT: f64 = 0.1;

/// Cap on the participation share feeding the vote adjustment.
pub const VOTE_POWER_CAP: f64 = 0.1;

/// Minimum difficulty (easiest). `difficulty = 1` accepts any hash.
pub const MIN_DIFFICULTY: u64 = 1;

/// Maximum difficulty (hardest representable).
pub const MAX_DIFFICULTY: u64 = 1 << 62;

/// Median window for the past-timestamp rule.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Maximum allowed clock drift for future block timestamps, in milliseconds.
pub const MAX_CLOCK_DRIFT_MS: u64 = 300_000;

/// Deepest reorganization the node will ever perform.
pub const MAX_REORG_DEPTH: u64 = 100;

/// Base block size limit in bytes.
pub const MAX_BLOCK_SIZE_BASE: usize = 1_048_576;

/// Height after which the dynamic block size limit doubles.
pub const BLOCK_SIZE_MATURITY_HEIGHT: u64 = 50_000;

/// Maximum serialized transaction size in bytes.
pub const MAX_TX_SIZE: usize = 100_000;

/// Minimum transaction fee in base units.
pub const MIN_FEE: u64 = 1_000;

/// Maximum transaction fee in base units.
pub const MAX_FEE: u64 = 10 * COIN;

/// Maximum number of transactions held in the mempool.
pub const MAX_MEMPOOL_SIZE: usize = 50_000;

/// Mempool entries older than this are expired, in milliseconds (24 h).
pub const MEMPOOL_EXPIRY_MS: u64 = 24 * 60 * 60 * 1000;

/// Mempool utilization at which the fee floor starts scaling up.
pub const FEE_SCALING_START: f64 = 0.75;

/// Confirmations before a coinbase output may be spent.
pub const COINBASE_MATURITY: u64 = 100;

/// Blocks per voting period.
pub const VOTING_PERIOD_BLOCKS: u64 = 1440;

/// Wall-clock bound on a voting period, in milliseconds (24 h).
pub const VOTING_PERIOD_MS: u64 = 24 * 60 * 60 * 1000;

/// Minimum account age (in blocks) to cast a vote.
pub const MIN_ACCOUNT_AGE: u64 = 1_000;

/// Maximum serialized vote size in bytes.
pub const MAX_VOTE_SIZE_BYTES: usize = 4096;

/// Per-voter participation reward paid after a period closes.
pub const PARTICIPATION_REWARD: u64 = COIN / 10;

/// Current protocol version advertised in Version messages.
pub const PROTOCOL_VERSION: u32 = 70_001;

/// Oldest protocol version this node will talk to.
pub const MIN_PROTOCOL_VERSION: u32 = 70_000;

/// Currency symbol advertised to and required of sync peers.
pub const CURRENCY_SYMBOL: &str = "TLY";

/// Ban score at which a peer is banned.
pub const MAX_BAN_SCORE: u32 = 100;

/// Ban duration in milliseconds (24 h).
pub const BAN_DURATION_MS: u64 = 24 * 60 * 60 * 1000;

/// Per-peer message count limit per rate window.
pub const RATE_LIMIT_MESSAGES: usize = 100;

/// Per-peer byte volume limit per rate window (5 MB).
pub const RATE_LIMIT_BYTES: usize = 5 * 1024 * 1024;

/// Rate-limit sliding window, in milliseconds.
pub const RATE_WINDOW_MS: u64 = 60_000;

/// Timeout for an outbound request awaiting its response, in milliseconds.
pub const MESSAGE_TIMEOUT_MS: u64 = 30_000;

/// Headers requested per batch during sync.
pub const HEADERS_BATCH_SIZE: u64 = 2000;

/// Maximum headers discarded when rewinding a failed header batch.
pub const MAX_HEADERS_REWIND: u64 = 100;

/// Parallel block downloads per sync batch.
pub const MAX_PARALLEL_BLOCKS: usize = 10;

/// A sync peer must be at least this many blocks ahead of us.
pub const MIN_PEER_HEIGHT_DIFF: u64 = 3;

/// Minimum acceptable sync-peer bandwidth in bytes per second (1 MB/s).
pub const MIN_PEER_BANDWIDTH_BPS: u64 = 1_000_000;

/// Block download retries before giving up on a block.
pub const BLOCK_RETRY_ATTEMPTS: u32 = 3;

/// Base backoff for block download retries, in milliseconds. Doubles per attempt.
pub const BLOCK_RETRY_BACKOFF_MS: u64 = 1_000;

/// Maximum jitter fraction applied to retry backoff.
pub const RETRY_JITTER_FRACTION: f64 = 0.25;

/// Dynamic block size limit for a block at the given height.
pub const fn max_block_size(height: u64) -> usize {
    if height >= BLOCK_SIZE_MATURITY_HEIGHT {
        MAX_BLOCK_SIZE_BASE * 2
    } else {
        MAX_BLOCK_SIZE_BASE
    }
}
