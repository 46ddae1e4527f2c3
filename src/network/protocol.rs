//! Bitcoin P2P wire messages for block propagation.
//!
//! Covers exactly the message set the block-propagation core needs:
//! inventory/header sync, the three block encodings and their re-request
//! protocols, and `sendcmpct`/`reject`. Payment, filter, package-relay and
//! ban-list-sharing extensions are a different node surface and do not
//! belong here.

use crate::domain::{Block, BlockHeader, Hash, Transaction};
use crate::network::compact_blocks::{CompactBlock, XThinBlock};
use anyhow::Result;
use serde::{Deserialize, Serialize};

pub const BITCOIN_MAGIC_MAINNET: [u8; 4] = [0xf9, 0xbe, 0xb4, 0xd9];
pub const BITCOIN_MAGIC_TESTNET: [u8; 4] = [0x0b, 0x11, 0x09, 0x07];
pub const BITCOIN_MAGIC_REGTEST: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

/// `MAX_PROTOCOL_MESSAGE_LENGTH` (2 MiB).
pub const MAX_PROTOCOL_MESSAGE_LENGTH: usize = 2 * 1024 * 1024;

/// `MAX_INV_SZ`.
pub const MAX_INV_SZ: usize = 50_000;

pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;
pub const MSG_FILTERED_BLOCK: u32 = 3;
pub const MSG_CMPCT_BLOCK: u32 = 4;
/// Not a standard Bitcoin inventory type; used between peers that have
/// negotiated xthin support.
pub const MSG_XTHINBLOCK: u32 = 5;

pub const ALLOWED_COMMANDS: &[&str] = &[
    "inv",
    "getheaders",
    "headers",
    "getdata",
    "block",
    "cmpctblock",
    "getblocktxn",
    "blocktxn",
    "get_xthin",
    "xthinblock",
    "get_xblocktx",
    "xblocktx",
    "sendcmpct",
    "reject",
];

/// A wire-level protocol message, as handled by the block-propagation core
///.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProtocolMessage {
    Inv(InvMessage),
    GetHeaders(GetHeadersMessage),
    Headers(HeadersMessage),
    GetData(GetDataMessage),
    Block(BlockMessage),
    CmpctBlock(CompactBlockMessage),
    GetBlockTxn(GetBlockTxnMessage),
    BlockTxn(BlockTxnMessage),
    GetXThin(GetXThinMessage),
    XThinBlock(XThinBlockMessage),
    GetXBlockTx(GetXBlockTxMessage),
    XBlockTx(XBlockTxMessage),
    SendCmpct(SendCmpctMessage),
    Reject(RejectMessage),
}

/// Inventory item: `(type, hash)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub inv_type: u32,
    pub hash: Hash,
}

impl InventoryItem {
    pub fn block(hash: Hash) -> Self {
        InventoryItem { inv_type: MSG_BLOCK, hash }
    }

    pub fn tx(hash: Hash) -> Self {
        InventoryItem { inv_type: MSG_TX, hash }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvMessage {
    pub inventory: Vec<InventoryItem>,
}

/// Locator + stop hash; reply is capped at `MAX_HEADERS_RESULTS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetHeadersMessage {
    pub version: i32,
    pub block_locator_hashes: Vec<Hash>,
    pub hash_stop: Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadersMessage {
    pub headers: Vec<BlockHeader>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDataMessage {
    pub inventory: Vec<InventoryItem>,
}

/// Full-block response to `getdata(MSG_BLOCK)` (the request can also be
/// fulfilled by `merkleblock+tx`, `cmpctblock`, or `xthinblock`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMessage {
    pub block: Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactBlockMessage {
    pub compact_block: CompactBlock,
}

/// Block hash + differentially-encoded ascending indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBlockTxnMessage {
    pub block_hash: Hash,
    pub indices: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockTxnMessage {
    pub block_hash: Hash,
    pub transactions: Vec<Transaction>,
}

/// inv + Bloom filter of mempool hashes the sender already has.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetXThinMessage {
    pub inventory: InventoryItem,
    pub bloom_filter: Vec<u8>,
    pub bloom_hash_funcs: u32,
    pub bloom_tweak: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XThinBlockMessage {
    pub xthin_block: XThinBlock,
}

/// Block hash + set of 8-byte cheap hashes to re-request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetXBlockTxMessage {
    pub block_hash: Hash,
    pub cheap_hashes: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XBlockTxMessage {
    pub block_hash: Hash,
    pub transactions: Vec<Transaction>,
}

/// 1-byte announce-preference + u64 version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SendCmpctMessage {
    pub version: u64,
    /// Non-zero: peer prefers `cmpctblock` announcements over `headers`/`inv`.
    pub prefer_cmpct: u8,
}

impl SendCmpctMessage {
    pub fn new(prefer_cmpct: bool) -> Self {
        SendCmpctMessage {
            version: 1,
            prefer_cmpct: if prefer_cmpct { 1 } else { 0 },
        }
    }

    pub fn prefers_compact(&self) -> bool {
        self.prefer_cmpct != 0
    }
}

/// command + 1-byte code + ≤111-char reason + optional hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectMessage {
    pub command: String,
    pub code: u8,
    pub reason: String,
    pub hash: Option<Hash>,
}

impl RejectMessage {
    pub fn new(command: impl Into<String>, code: u8, reason: &str, hash: Option<Hash>) -> Self {
        RejectMessage {
            command: command.into(),
            code,
            reason: crate::network::errors::truncate_reject_reason(reason),
            hash,
        }
    }
}

pub struct ProtocolParser;

impl ProtocolParser {
    pub fn parse_message(data: &[u8]) -> Result<ProtocolMessage> {
        if data.len() < 24 {
            return Err(anyhow::anyhow!("message too short"));
        }
        if data.len() > MAX_PROTOCOL_MESSAGE_LENGTH {
            return Err(anyhow::anyhow!("message too large"));
        }

        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != u32::from_le_bytes(BITCOIN_MAGIC_MAINNET) {
            return Err(anyhow::anyhow!("invalid magic number"));
        }

        let command = String::from_utf8_lossy(&data[4..12])
            .trim_end_matches('\0')
            .to_string();
        if !ALLOWED_COMMANDS.contains(&command.as_str()) {
            return Err(anyhow::anyhow!("unknown command: {}", command));
        }

        let payload_length = u32::from_le_bytes([data[16], data[17], data[18], data[19]]) as usize;
        let checksum = &data[20..24];
        if payload_length > MAX_PROTOCOL_MESSAGE_LENGTH - 24 {
            return Err(anyhow::anyhow!("payload too large"));
        }
        if data.len() < 24 + payload_length {
            return Err(anyhow::anyhow!("incomplete message"));
        }

        let payload = &data[24..24 + payload_length];
        if Self::calculate_checksum(payload) != checksum {
            return Err(anyhow::anyhow!("invalid checksum"));
        }

        Ok(match command.as_str() {
            "inv" => ProtocolMessage::Inv(bincode::deserialize(payload)?),
            "getheaders" => ProtocolMessage::GetHeaders(bincode::deserialize(payload)?),
            "headers" => ProtocolMessage::Headers(bincode::deserialize(payload)?),
            "getdata" => ProtocolMessage::GetData(bincode::deserialize(payload)?),
            "block" => ProtocolMessage::Block(bincode::deserialize(payload)?),
            "cmpctblock" => ProtocolMessage::CmpctBlock(bincode::deserialize(payload)?),
            "getblocktxn" => ProtocolMessage::GetBlockTxn(bincode::deserialize(payload)?),
            "blocktxn" => ProtocolMessage::BlockTxn(bincode::deserialize(payload)?),
            "get_xthin" => ProtocolMessage::GetXThin(bincode::deserialize(payload)?),
            "xthinblock" => ProtocolMessage::XThinBlock(bincode::deserialize(payload)?),
            "get_xblocktx" => ProtocolMessage::GetXBlockTx(bincode::deserialize(payload)?),
            "xblocktx" => ProtocolMessage::XBlockTx(bincode::deserialize(payload)?),
            "sendcmpct" => ProtocolMessage::SendCmpct(bincode::deserialize(payload)?),
            "reject" => ProtocolMessage::Reject(bincode::deserialize(payload)?),
            _ => return Err(anyhow::anyhow!("unknown command: {}", command)),
        })
    }

    pub fn serialize_message(message: &ProtocolMessage) -> Result<Vec<u8>> {
        let (command, payload) = match message {
            ProtocolMessage::Inv(msg) => ("inv", bincode::serialize(msg)?),
            ProtocolMessage::GetHeaders(msg) => ("getheaders", bincode::serialize(msg)?),
            ProtocolMessage::Headers(msg) => ("headers", bincode::serialize(msg)?),
            ProtocolMessage::GetData(msg) => ("getdata", bincode::serialize(msg)?),
            ProtocolMessage::Block(msg) => ("block", bincode::serialize(msg)?),
            ProtocolMessage::CmpctBlock(msg) => ("cmpctblock", bincode::serialize(msg)?),
            ProtocolMessage::GetBlockTxn(msg) => ("getblocktxn", bincode::serialize(msg)?),
            ProtocolMessage::BlockTxn(msg) => ("blocktxn", bincode::serialize(msg)?),
            ProtocolMessage::GetXThin(msg) => ("get_xthin", bincode::serialize(msg)?),
            ProtocolMessage::XThinBlock(msg) => ("xthinblock", bincode::serialize(msg)?),
            ProtocolMessage::GetXBlockTx(msg) => ("get_xblocktx", bincode::serialize(msg)?),
            ProtocolMessage::XBlockTx(msg) => ("xblocktx", bincode::serialize(msg)?),
            ProtocolMessage::SendCmpct(msg) => ("sendcmpct", bincode::serialize(msg)?),
            ProtocolMessage::Reject(msg) => ("reject", bincode::serialize(msg)?),
        };

        let mut out = Vec::with_capacity(24 + payload.len());
        out.extend_from_slice(&u32::from_le_bytes(BITCOIN_MAGIC_MAINNET).to_le_bytes());
        let mut command_bytes = [0u8; 12];
        command_bytes[..command.len()].copy_from_slice(command.as_bytes());
        out.extend_from_slice(&command_bytes);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&Self::calculate_checksum(&payload));
        out.extend_from_slice(&payload);
        Ok(out)
    }

    fn calculate_checksum(payload: &[u8]) -> [u8; 4] {
        use sha2::{Digest, Sha256};
        let hash1 = Sha256::digest(payload);
        let hash2 = Sha256::digest(hash1);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&hash2[..4]);
        checksum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NULL_HASH;

    #[test]
    fn inv_message_round_trips_through_wire_framing() {
        let msg = ProtocolMessage::Inv(InvMessage {
            inventory: vec![InventoryItem::block([7u8; 32])],
        });
        let bytes = ProtocolParser::serialize_message(&msg).unwrap();
        let parsed = ProtocolParser::parse_message(&bytes).unwrap();
        match parsed {
            ProtocolMessage::Inv(inv) => assert_eq!(inv.inventory[0].hash, [7u8; 32]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rejects_bad_checksum() {
        let msg = ProtocolMessage::GetHeaders(GetHeadersMessage {
            version: 1,
            block_locator_hashes: vec![NULL_HASH],
            hash_stop: NULL_HASH,
        });
        let mut bytes = ProtocolParser::serialize_message(&msg).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(ProtocolParser::parse_message(&bytes).is_err());
    }

    #[test]
    fn rejects_unknown_command() {
        let mut bytes = vec![0u8; 24];
        bytes[0..4].copy_from_slice(&BITCOIN_MAGIC_MAINNET);
        bytes[4..11].copy_from_slice(b"bogus\0\0");
        assert!(ProtocolParser::parse_message(&bytes).is_err());
    }

    #[test]
    fn sendcmpct_prefers_compact_round_trip() {
        let msg = SendCmpctMessage::new(true);
        assert!(msg.prefers_compact());
        assert!(!SendCmpctMessage::new(false).prefers_compact());
    }
}
