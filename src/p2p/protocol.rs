//! Name channel wire messages
//!
//! Every message is a one byte type tag followed by the bincode encoding of
//! its body. The tag values and the field order of each body are fixed;
//! new kinds of message get new tags.

use crate::consensus::{NameBlock, NameHeader, NameTrx};
use crate::constants::{MAX_HEADERS_PER_MESSAGE, MAX_INV_ENTRIES, MAX_LOCATOR_ENTRIES};
use crate::crypto::MiniPow;
use crate::error::NameError;
use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Stable message tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    NameInv = 1,
    BlockInv = 2,
    NameTrx = 3,
    NameBlock = 4,
    BlockHeaders = 5,
    GetHeaders = 6,
    GetTrx = 7,
    GetBlock = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = NameError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            1 => MessageType::NameInv,
            2 => MessageType::BlockInv,
            3 => MessageType::NameTrx,
            4 => MessageType::NameBlock,
            5 => MessageType::BlockHeaders,
            6 => MessageType::GetHeaders,
            7 => MessageType::GetTrx,
            8 => MessageType::GetBlock,
            other => {
                return Err(NameError::MalformedMessage(format!(
                    "unknown message type {}",
                    other
                )))
            }
        })
    }
}

/// Announces pending trx ids
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameInvMsg {
    pub names: Vec<u64>,
}

/// Announces block ids
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInvMsg {
    pub blocks: Vec<MiniPow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameTrxMsg {
    pub trx: NameTrx,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameBlockMsg {
    pub block: NameBlock,
}

/// Consecutive best chain headers, the first at height `start_index`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeadersMsg {
    pub start_index: u32,
    pub headers: Vec<NameHeader>,
}

/// Most recent first, then exponentially sparser, ending at genesis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetHeadersMsg {
    pub locator_hashes: Vec<MiniPow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTrxMsg {
    pub names: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlockMsg {
    pub block_id: MiniPow,
}

/// The closed set of messages exchanged on the name channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameMessage {
    NameInv(NameInvMsg),
    BlockInv(BlockInvMsg),
    NameTrx(NameTrxMsg),
    NameBlock(NameBlockMsg),
    BlockHeaders(BlockHeadersMsg),
    GetHeaders(GetHeadersMsg),
    GetTrx(GetTrxMsg),
    GetBlock(GetBlockMsg),
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

fn decode_body<T: DeserializeOwned>(body: &[u8], limit: usize) -> Result<T, NameError> {
    wire_options()
        .with_limit(limit as u64)
        .deserialize(body)
        .map_err(|e| NameError::MalformedMessage(e.to_string()))
}

fn check_count(what: &str, count: usize, max: usize) -> Result<(), NameError> {
    if count > max {
        return Err(NameError::MalformedMessage(format!(
            "{} {} entries exceeds limit of {}",
            count, what, max
        )));
    }
    Ok(())
}

impl NameMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            NameMessage::NameInv(_) => MessageType::NameInv,
            NameMessage::BlockInv(_) => MessageType::BlockInv,
            NameMessage::NameTrx(_) => MessageType::NameTrx,
            NameMessage::NameBlock(_) => MessageType::NameBlock,
            NameMessage::BlockHeaders(_) => MessageType::BlockHeaders,
            NameMessage::GetHeaders(_) => MessageType::GetHeaders,
            NameMessage::GetTrx(_) => MessageType::GetTrx,
            NameMessage::GetBlock(_) => MessageType::GetBlock,
        }
    }

    /// Name used in logs
    pub fn command(&self) -> &'static str {
        match self {
            NameMessage::NameInv(_) => "name_inv",
            NameMessage::BlockInv(_) => "block_inv",
            NameMessage::NameTrx(_) => "name_trx",
            NameMessage::NameBlock(_) => "name_block",
            NameMessage::BlockHeaders(_) => "block_headers",
            NameMessage::GetHeaders(_) => "get_headers",
            NameMessage::GetTrx(_) => "get_trx",
            NameMessage::GetBlock(_) => "get_block",
        }
    }

    /// Tag byte followed by the body
    pub fn encode(&self) -> Result<Vec<u8>, NameError> {
        let body = match self {
            NameMessage::NameInv(m) => wire_options().serialize(m),
            NameMessage::BlockInv(m) => wire_options().serialize(m),
            NameMessage::NameTrx(m) => wire_options().serialize(m),
            NameMessage::NameBlock(m) => wire_options().serialize(m),
            NameMessage::BlockHeaders(m) => wire_options().serialize(m),
            NameMessage::GetHeaders(m) => wire_options().serialize(m),
            NameMessage::GetTrx(m) => wire_options().serialize(m),
            NameMessage::GetBlock(m) => wire_options().serialize(m),
        }
        .map_err(|e| NameError::MalformedMessage(e.to_string()))?;

        let mut bytes = Vec::with_capacity(1 + body.len());
        bytes.push(self.message_type() as u8);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Decode a message no larger than `max_size` bytes
    pub fn decode(bytes: &[u8], max_size: usize) -> Result<Self, NameError> {
        if bytes.len() > max_size {
            return Err(NameError::MalformedMessage(format!(
                "message of {} bytes exceeds limit of {}",
                bytes.len(),
                max_size
            )));
        }
        let (&tag, body) = bytes
            .split_first()
            .ok_or_else(|| NameError::MalformedMessage("empty message".to_string()))?;

        let message = match MessageType::try_from(tag)? {
            MessageType::NameInv => NameMessage::NameInv(decode_body(body, max_size)?),
            MessageType::BlockInv => NameMessage::BlockInv(decode_body(body, max_size)?),
            MessageType::NameTrx => NameMessage::NameTrx(decode_body(body, max_size)?),
            MessageType::NameBlock => NameMessage::NameBlock(decode_body(body, max_size)?),
            MessageType::BlockHeaders => NameMessage::BlockHeaders(decode_body(body, max_size)?),
            MessageType::GetHeaders => NameMessage::GetHeaders(decode_body(body, max_size)?),
            MessageType::GetTrx => NameMessage::GetTrx(decode_body(body, max_size)?),
            MessageType::GetBlock => NameMessage::GetBlock(decode_body(body, max_size)?),
        };
        message.check_limits()?;
        Ok(message)
    }

    fn check_limits(&self) -> Result<(), NameError> {
        match self {
            NameMessage::NameInv(m) => check_count("name inventory", m.names.len(), MAX_INV_ENTRIES),
            NameMessage::BlockInv(m) => check_count("block inventory", m.blocks.len(), MAX_INV_ENTRIES),
            NameMessage::BlockHeaders(m) => {
                check_count("header", m.headers.len(), MAX_HEADERS_PER_MESSAGE)
            }
            NameMessage::GetHeaders(m) => {
                check_count("locator", m.locator_hashes.len(), MAX_LOCATOR_ENTRIES)
            }
            NameMessage::GetTrx(m) => check_count("trx request", m.names.len(), MAX_INV_ENTRIES),
            NameMessage::NameTrx(_) | NameMessage::NameBlock(_) | NameMessage::GetBlock(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::OwnerKey;

    const LIMIT: usize = crate::constants::MAX_MESSAGE_SIZE;

    #[test]
    fn test_tag_is_first_byte() {
        let msg = NameMessage::GetBlock(GetBlockMsg { block_id: MiniPow::hash(b"b") });
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes[0], MessageType::GetBlock as u8);
        assert_eq!(NameMessage::decode(&bytes, LIMIT).unwrap(), msg);
    }

    #[test]
    fn test_headers_message_keeps_order() {
        let headers = vec![
            NameBlock::genesis().header,
            NameBlock::new(NameBlock::genesis().id(), 1, 5, vec![]).header,
        ];
        let msg = NameMessage::BlockHeaders(BlockHeadersMsg { start_index: 3, headers });
        let decoded = NameMessage::decode(&msg.encode().unwrap(), LIMIT).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_trx_message() {
        let trx = NameTrx::new("alice", OwnerKey([1u8; 32]), 7);
        let msg = NameMessage::NameTrx(NameTrxMsg { trx });
        assert_eq!(NameMessage::decode(&msg.encode().unwrap(), LIMIT).unwrap(), msg);
    }

    #[test]
    fn test_oversize_rejected() {
        let msg = NameMessage::NameInv(NameInvMsg { names: vec![1; 100] });
        let bytes = msg.encode().unwrap();
        assert!(matches!(
            NameMessage::decode(&bytes, bytes.len() - 1),
            Err(NameError::MalformedMessage(_))
        ));
        assert!(NameMessage::decode(&bytes, bytes.len()).is_ok());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(NameMessage::decode(&[], LIMIT).is_err());
        assert!(NameMessage::decode(&[0], LIMIT).is_err());
        assert!(NameMessage::decode(&[9, 1, 2], LIMIT).is_err());
        // truncated block id
        assert!(NameMessage::decode(&[8, 64, 0, 0, 0, 0, 0, 0, 0, 1, 2], LIMIT).is_err());

        let mut bytes = NameMessage::GetTrx(GetTrxMsg { names: vec![1] }).encode().unwrap();
        bytes.push(0);
        assert!(NameMessage::decode(&bytes, LIMIT).is_err());
    }

    #[test]
    fn test_length_prefix_cannot_force_allocation() {
        let mut bytes = vec![MessageType::NameInv as u8];
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(
            NameMessage::decode(&bytes, LIMIT),
            Err(NameError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_locator_entry_limit() {
        let msg = NameMessage::GetHeaders(GetHeadersMsg {
            locator_hashes: vec![MiniPow::zero(); MAX_LOCATOR_ENTRIES + 1],
        });
        assert!(NameMessage::decode(&msg.encode().unwrap(), LIMIT).is_err());
    }
}
