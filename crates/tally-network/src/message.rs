//! Typed wire messages.
//!
//! Every message is one variant of the closed [`Message`] enumeration with
//! its own payload shape; decoding an unknown kind byte or a malformed
//! payload fails rather than producing an untyped value. Payloads are
//! canonically encoded with bincode (fixed-width little-endian integers,
//! length-prefixed byte strings).

use serde::{Deserialize, Serialize};

use tally_core::constants::{max_block_size, BLOCK_SIZE_MATURITY_HEIGHT, HEADERS_BATCH_SIZE};
use tally_core::error::NetworkError;
use tally_core::types::{Block, BlockHeader, Hash256, Transaction, Vote};

/// Hard cap on a frame payload: a grown block plus framing slack.
pub const MAX_MESSAGE_SIZE: usize = max_block_size(BLOCK_SIZE_MATURITY_HEIGHT) + 4096;

/// Maximum locator entries in a `GetBlocks` request.
pub const MAX_LOCATOR_SIZE: usize = 64;

/// Maximum length of an advertised user agent.
pub const MAX_USER_AGENT_LEN: usize = 256;

/// Wire tag for each message variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Version = 0,
    Verack = 1,
    Ping = 2,
    Pong = 3,
    Addr = 4,
    Inv = 5,
    GetData = 6,
    GetBlocks = 7,
    GetHeaders = 8,
    Block = 9,
    Tx = 10,
    Headers = 11,
    GetAddr = 12,
    Mempool = 13,
    Reject = 14,
    GetNodeInfo = 15,
    GetVotes = 16,
    Votes = 17,
}

impl MessageKind {
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::Version,
            1 => Self::Verack,
            2 => Self::Ping,
            3 => Self::Pong,
            4 => Self::Addr,
            5 => Self::Inv,
            6 => Self::GetData,
            7 => Self::GetBlocks,
            8 => Self::GetHeaders,
            9 => Self::Block,
            10 => Self::Tx,
            11 => Self::Headers,
            12 => Self::GetAddr,
            13 => Self::Mempool,
            14 => Self::Reject,
            15 => Self::GetNodeInfo,
            16 => Self::GetVotes,
            17 => Self::Votes,
            _ => return None,
        })
    }
}

/// Handshake advertisement.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct VersionPayload {
    pub protocol_version: u32,
    pub services: u64,
    pub timestamp_ms: i64,
    pub height: u64,
    pub user_agent: String,
    /// Currency ticker; sync refuses peers on a different currency.
    pub currency_symbol: String,
}

/// A known peer address, relayed in `Addr` messages.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct PeerAddr {
    pub addr: String,
    pub last_seen_ms: u64,
}

/// What an inventory entry refers to.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum InvKind {
    Block,
    Tx,
    Vote,
}

/// One inventory announcement.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct InvItem {
    pub kind: InvKind,
    pub hash: Hash256,
}

#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct GetBlocksPayload {
    /// Block locator, newest first.
    pub locator: Vec<Hash256>,
    /// Stop hash, or zero for "as many as allowed".
    pub stop: Hash256,
}

#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct GetHeadersPayload {
    pub start_height: u64,
    pub count: u64,
}

/// Why a message or item was rejected, echoed to the sender.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct RejectPayload {
    pub message_kind: u8,
    pub code: u8,
    pub reason: String,
    pub hash: Hash256,
}

/// A peer-to-peer protocol message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Version(VersionPayload),
    Verack,
    Ping(u64),
    Pong(u64),
    Addr(Vec<PeerAddr>),
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    GetBlocks(GetBlocksPayload),
    GetHeaders(GetHeadersPayload),
    Block(Box<Block>),
    Tx(Box<Transaction>),
    Headers(Vec<BlockHeader>),
    GetAddr,
    Mempool,
    Reject(RejectPayload),
    GetNodeInfo,
    GetVotes { period_id: u64 },
    Votes(Vec<Vote>),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Version(_) => MessageKind::Version,
            Message::Verack => MessageKind::Verack,
            Message::Ping(_) => MessageKind::Ping,
            Message::Pong(_) => MessageKind::Pong,
            Message::Addr(_) => MessageKind::Addr,
            Message::Inv(_) => MessageKind::Inv,
            Message::GetData(_) => MessageKind::GetData,
            Message::GetBlocks(_) => MessageKind::GetBlocks,
            Message::GetHeaders(_) => MessageKind::GetHeaders,
            Message::Block(_) => MessageKind::Block,
            Message::Tx(_) => MessageKind::Tx,
            Message::Headers(_) => MessageKind::Headers,
            Message::GetAddr => MessageKind::GetAddr,
            Message::Mempool => MessageKind::Mempool,
            Message::Reject(_) => MessageKind::Reject,
            Message::GetNodeInfo => MessageKind::GetNodeInfo,
            Message::GetVotes { .. } => MessageKind::GetVotes,
            Message::Votes(_) => MessageKind::Votes,
        }
    }

    /// Critical messages are never dropped by queue back-pressure;
    /// announcements (`Inv`, `Addr`) are.
    pub fn is_critical(&self) -> bool {
        !matches!(self, Message::Inv(_) | Message::Addr(_))
    }

    /// Size and count constraints checked before encode and after decode.
    pub fn validate(&self) -> Result<(), NetworkError> {
        match self {
            Message::Version(v) => {
                if v.user_agent.len() > MAX_USER_AGENT_LEN {
                    return Err(NetworkError::Serialization(format!(
                        "user agent too long: {}",
                        v.user_agent.len()
                    )));
                }
            }
            Message::GetBlocks(p) => {
                if p.locator.len() > MAX_LOCATOR_SIZE {
                    return Err(NetworkError::Serialization(format!(
                        "locator too large: {}",
                        p.locator.len()
                    )));
                }
            }
            Message::GetHeaders(p) => {
                if p.count > HEADERS_BATCH_SIZE {
                    return Err(NetworkError::Serialization(format!(
                        "headers request too large: {}",
                        p.count
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Encode this message's payload (without the frame header).
    pub fn encode_payload(&self) -> Result<Vec<u8>, NetworkError> {
        self.validate()?;
        let config = bincode::config::standard();
        let encoded = match self {
            Message::Version(p) => bincode::encode_to_vec(p, config),
            Message::Verack | Message::GetAddr | Message::Mempool | Message::GetNodeInfo => {
                Ok(Vec::new())
            }
            Message::Ping(nonce) | Message::Pong(nonce) => bincode::encode_to_vec(nonce, config),
            Message::Addr(addrs) => bincode::encode_to_vec(addrs, config),
            Message::Inv(items) | Message::GetData(items) => {
                bincode::encode_to_vec(items, config)
            }
            Message::GetBlocks(p) => bincode::encode_to_vec(p, config),
            Message::GetHeaders(p) => bincode::encode_to_vec(p, config),
            Message::Block(block) => bincode::encode_to_vec(block.as_ref(), config),
            Message::Tx(tx) => bincode::encode_to_vec(tx.as_ref(), config),
            Message::Headers(headers) => bincode::encode_to_vec(headers, config),
            Message::Reject(p) => bincode::encode_to_vec(p, config),
            Message::GetVotes { period_id } => bincode::encode_to_vec(period_id, config),
            Message::Votes(votes) => bincode::encode_to_vec(votes, config),
        }
        .map_err(|e| NetworkError::Serialization(e.to_string()))?;

        if encoded.len() > MAX_MESSAGE_SIZE {
            return Err(NetworkError::MessageTooLarge {
                size: encoded.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(encoded)
    }

    /// Decode a payload for a known kind. Unknown kinds are rejected by the
    /// caller via [`MessageKind::from_u8`].
    pub fn decode_payload(kind: MessageKind, payload: &[u8]) -> Result<Self, NetworkError> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(NetworkError::MessageTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let config = bincode::config::standard();
        let err = |e: bincode::error::DecodeError| NetworkError::Serialization(e.to_string());

        let message = match kind {
            MessageKind::Version => {
                Message::Version(bincode::decode_from_slice(payload, config).map_err(err)?.0)
            }
            MessageKind::Verack => Message::Verack,
            MessageKind::Ping => {
                Message::Ping(bincode::decode_from_slice(payload, config).map_err(err)?.0)
            }
            MessageKind::Pong => {
                Message::Pong(bincode::decode_from_slice(payload, config).map_err(err)?.0)
            }
            MessageKind::Addr => {
                Message::Addr(bincode::decode_from_slice(payload, config).map_err(err)?.0)
            }
            MessageKind::Inv => {
                Message::Inv(bincode::decode_from_slice(payload, config).map_err(err)?.0)
            }
            MessageKind::GetData => {
                Message::GetData(bincode::decode_from_slice(payload, config).map_err(err)?.0)
            }
            MessageKind::GetBlocks => {
                Message::GetBlocks(bincode::decode_from_slice(payload, config).map_err(err)?.0)
            }
            MessageKind::GetHeaders => {
                Message::GetHeaders(bincode::decode_from_slice(payload, config).map_err(err)?.0)
            }
            MessageKind::Block => Message::Block(Box::new(
                bincode::decode_from_slice(payload, config).map_err(err)?.0,
            )),
            MessageKind::Tx => Message::Tx(Box::new(
                bincode::decode_from_slice(payload, config).map_err(err)?.0,
            )),
            MessageKind::Headers => {
                Message::Headers(bincode::decode_from_slice(payload, config).map_err(err)?.0)
            }
            MessageKind::GetAddr => Message::GetAddr,
            MessageKind::Mempool => Message::Mempool,
            MessageKind::Reject => {
                Message::Reject(bincode::decode_from_slice(payload, config).map_err(err)?.0)
            }
            MessageKind::GetNodeInfo => Message::GetNodeInfo,
            MessageKind::GetVotes => Message::GetVotes {
                period_id: bincode::decode_from_slice(payload, config).map_err(err)?.0,
            },
            MessageKind::Votes => {
                Message::Votes(bincode::decode_from_slice(payload, config).map_err(err)?.0)
            }
        };
        message.validate()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::address::Network;
    use tally_core::constants::{CURRENCY_SYMBOL, PROTOCOL_VERSION};

    fn version() -> VersionPayload {
        VersionPayload {
            protocol_version: PROTOCOL_VERSION,
            services: 1,
            timestamp_ms: 1_700_000_000_000,
            height: 42,
            user_agent: "/tally:0.1.0/".into(),
            currency_symbol: CURRENCY_SYMBOL.into(),
        }
    }

    fn round_trip(message: Message) -> Message {
        let payload = message.encode_payload().unwrap();
        Message::decode_payload(message.kind(), &payload).unwrap()
    }

    #[test]
    fn kind_tags_round_trip() {
        for tag in 0..=17u8 {
            let kind = MessageKind::from_u8(tag).unwrap();
            assert_eq!(kind as u8, tag);
        }
        assert_eq!(MessageKind::from_u8(18), None);
        assert_eq!(MessageKind::from_u8(255), None);
    }

    #[test]
    fn version_round_trip() {
        let msg = Message::Version(version());
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn empty_payload_messages() {
        for msg in [Message::Verack, Message::GetAddr, Message::Mempool, Message::GetNodeInfo] {
            assert!(msg.encode_payload().unwrap().is_empty());
            assert_eq!(round_trip(msg.clone()), msg);
        }
    }

    #[test]
    fn ping_pong_round_trip() {
        assert_eq!(round_trip(Message::Ping(7)), Message::Ping(7));
        assert_eq!(round_trip(Message::Pong(9)), Message::Pong(9));
    }

    #[test]
    fn inventory_round_trip() {
        let items = vec![
            InvItem { kind: InvKind::Block, hash: Hash256([1; 32]) },
            InvItem { kind: InvKind::Tx, hash: Hash256([2; 32]) },
            InvItem { kind: InvKind::Vote, hash: Hash256([3; 32]) },
        ];
        let msg = Message::Inv(items);
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn block_round_trip() {
        let block = tally_core::genesis::genesis_block(Network::Devnet);
        let msg = Message::Block(Box::new(block));
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn headers_round_trip() {
        let header = tally_core::genesis::genesis_block(Network::Devnet).header;
        let msg = Message::Headers(vec![header.clone(), header]);
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn oversized_user_agent_rejected() {
        let mut v = version();
        v.user_agent = "x".repeat(MAX_USER_AGENT_LEN + 1);
        assert!(Message::Version(v).encode_payload().is_err());
    }

    #[test]
    fn oversized_locator_rejected() {
        let msg = Message::GetBlocks(GetBlocksPayload {
            locator: vec![Hash256::ZERO; MAX_LOCATOR_SIZE + 1],
            stop: Hash256::ZERO,
        });
        assert!(msg.encode_payload().is_err());
    }

    #[test]
    fn oversized_header_request_rejected() {
        let msg = Message::GetHeaders(GetHeadersPayload {
            start_height: 0,
            count: HEADERS_BATCH_SIZE + 1,
        });
        assert!(msg.encode_payload().is_err());
    }

    #[test]
    fn garbage_payload_rejected() {
        assert!(Message::decode_payload(MessageKind::Version, &[0xFF; 3]).is_err());
        assert!(Message::decode_payload(MessageKind::Block, b"junk").is_err());
    }

    #[test]
    fn criticality_policy() {
        assert!(!Message::Inv(vec![]).is_critical());
        assert!(!Message::Addr(vec![]).is_critical());
        assert!(Message::Ping(1).is_critical());
        assert!(Message::Verack.is_critical());
    }
}
