//! # tally-network — the peer-to-peer layer.
//!
//! Length-prefixed, checksummed frames over TCP carry a closed set of
//! typed messages. Each peer gets a [`PeerSession`] state machine
//! (handshake, rate limits, ban scores, request correlation); the
//! [`Synchronizer`] drives headers-first chain sync through one selected
//! peer at a time.

pub mod config;
pub mod frame;
pub mod message;
pub mod peer_score;
pub mod rate_limiter;
pub mod service;
pub mod session;
pub mod sync;

pub use config::NetworkConfig;
pub use frame::{read_frame, write_frame};
pub use message::{Message, MessageKind, VersionPayload, MAX_MESSAGE_SIZE};
pub use peer_score::BanScoreBoard;
pub use rate_limiter::{RateLimiter, RateWindow};
pub use service::NetworkService;
pub use session::{BanCause, PeerSession, SessionEvent, SessionState};
pub use sync::{select_peer, PeerSnapshot, SyncClient, SyncConfig, SyncProgress, Synchronizer};
