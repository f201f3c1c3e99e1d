//! Cryptography module - MiniPow proof-of-work digests, BLAKE3 content
//! hashes and transaction Merkle roots

mod hash;
mod merkle;
mod mini_pow;

pub use hash::*;
pub use merkle::*;
pub use mini_pow::*;
