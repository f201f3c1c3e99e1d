//! MiniPow: the chain's proof-of-work digest
//!
//! A MiniPow is the double SHA-512 of some payload, normalized so that the
//! most significant set bit sits at bit 511. Byte 0 is then overwritten with
//! `255 - leading_zero_bits` of the raw digest. Because more leading zeros
//! give a smaller first byte, a plain byte-wise comparison orders digests by
//! proof of work: the lower value carries more work.

use primitive_types::U512;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};
use std::fmt;

/// Size of an encoded MiniPow in bytes
pub const MINI_POW_SIZE: usize = 64;

/// Encoded proof-of-work digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MiniPow(pub [u8; MINI_POW_SIZE]);

impl MiniPow {
    /// The null reference (parent of genesis)
    pub const fn zero() -> Self {
        MiniPow([0u8; MINI_POW_SIZE])
    }

    /// Compute the MiniPow of arbitrary bytes
    pub fn hash(data: &[u8]) -> Self {
        let first = Sha512::digest(data);
        let second = Sha512::digest(first.as_slice());

        let value = U512::from_big_endian(second.as_slice());
        // An all-zero digest saturates at 255 leading zeros.
        let shift = value.leading_zeros().min(255);

        let mut bytes = (value << shift).to_big_endian();
        bytes[0] = 255 - shift as u8;
        MiniPow(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Leading zero bits of the digest this value was derived from
    pub fn leading_zeros(&self) -> u8 {
        255 - self.0[0]
    }

    /// Whether this digest meets a leading-zero-bit threshold
    pub fn meets_difficulty(&self, min_leading_zeros: u8) -> bool {
        self.leading_zeros() >= min_leading_zeros
    }

    /// Expected number of hashes needed to find this digest (2^leading_zeros)
    pub fn work(&self) -> U512 {
        U512::one() << u32::from(self.leading_zeros())
    }

    /// Numeric value of the encoded bytes (big-endian)
    pub fn to_integer(&self) -> U512 {
        U512::from_big_endian(&self.0)
    }

    /// Encode an integer into the fixed 64-byte field.
    ///
    /// Byte 0 is taken from the integer as-is and is not re-derived, so only
    /// integers produced by [`MiniPow::to_integer`] round-trip to the same
    /// leading-zero count.
    pub fn from_integer(value: &U512) -> Self {
        MiniPow(value.to_big_endian())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; MINI_POW_SIZE] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(MiniPow(arr))
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl Default for MiniPow {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Debug for MiniPow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MiniPow({})", self.short())
    }
}

impl fmt::Display for MiniPow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for MiniPow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for MiniPow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            MiniPow::from_hex(&s).map_err(de::Error::custom)
        } else {
            deserializer.deserialize_bytes(MiniPowVisitor)
        }
    }
}

struct MiniPowVisitor;

impl<'de> Visitor<'de> for MiniPowVisitor {
    type Value = MiniPow;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", MINI_POW_SIZE)
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<MiniPow, E> {
        let bytes: [u8; MINI_POW_SIZE] = v
            .try_into()
            .map_err(|_| E::invalid_length(v.len(), &self))?;
        Ok(MiniPow(bytes))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<MiniPow, A::Error> {
        let mut bytes = [0u8; MINI_POW_SIZE];
        for (i, slot) in bytes.iter_mut().enumerate() {
            *slot = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        Ok(MiniPow(bytes))
    }
}
