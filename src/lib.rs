//! Bitname Core Library
//!
//! A public, append-only registry of name → owner bindings secured by
//! proof-of-work. Nodes gossip name registrations and blocks, resolve
//! chain splits and serve point lookups against the best chain.

pub mod config;
pub mod consensus;
pub mod crypto;
pub mod error;
pub mod mining;
pub mod p2p;
pub mod rpc;
pub mod storage;
pub mod sync;

pub use error::{NameError, ObjectId};

/// Protocol constants
pub mod constants {
    /// Protocol version carried in headers and transactions
    pub const PROTOCOL_VERSION: u32 = 1;

    /// Network magic bytes framing every message on the wire ("BTNM")
    pub const NETWORK_MAGIC: [u8; 4] = [0x42, 0x54, 0x4E, 0x4D];

    pub const DEFAULT_SERVER_PORT: u16 = 9876;
    pub const DEFAULT_RPC_PORT: u16 = 9877;

    /// Number of peers the node tries to stay connected to
    pub const DESIRED_PEER_COUNT: usize = 8;

    /// Largest message accepted from a peer (8 MiB)
    pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

    /// Seconds an inventory item or in-flight request is remembered
    pub const INVENTORY_WINDOW_SECS: u64 = 60;

    /// Leading zero bits in the double SHA-512 required to register a name
    pub const MIN_NAME_DIFFICULTY: u8 = 24;

    /// Leading zero bits required of a block header
    pub const MIN_BLOCK_DIFFICULTY: u8 = 24;

    /// Headers returned per get-headers request
    pub const MAX_HEADERS_PER_MESSAGE: usize = 2000;

    /// Name transactions committed by a single block
    pub const MAX_BLOCK_TRXS: usize = 1000;

    /// Entries accepted in a single inventory or get-trx message
    pub const MAX_INV_ENTRIES: usize = 50_000;

    /// Entries accepted in a locator
    pub const MAX_LOCATOR_ENTRIES: usize = 128;

    /// Longest registrable name in bytes
    pub const MAX_NAME_LENGTH: usize = 63;

    /// How far a header timestamp may run ahead of the local clock
    pub const MAX_FUTURE_DRIFT_SECS: u64 = 2 * 60 * 60;

    /// Genesis timestamp (Unix seconds)
    pub const GENESIS_TIMESTAMP: u64 = 1_383_000_000;

    pub const DEFAULT_MINING_THREADS: usize = 4;

    /// Misbehavior points charged per malformed message (100 = ban)
    pub const MALFORMED_MESSAGE_PENALTY: u32 = 10;
}
