//! Membership filter for reference rows
//!
//! Each `lsif_references` row carries a serialized bloom filter over the
//! moniker identifiers the importing dump actually uses, so a cross-repo
//! reference query can skip opening dumps that cannot contain the symbol.
//! Sized at ~10 bits per key for a ~1% false-positive rate; the k hash
//! positions derive from one 256-bit blake3 digest via double hashing.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

const BITS_PER_KEY: usize = 10;
const NUM_HASHES: u32 = 7;
const MIN_BITS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    num_bits: u64,
    num_hashes: u32,
    bits: Vec<u8>,
}

impl BloomFilter {
    /// Build a filter holding every identifier in `keys`.
    pub fn from_keys<S: AsRef<str>>(keys: &[S]) -> Self {
        let num_bits = (keys.len() * BITS_PER_KEY).max(MIN_BITS) as u64;
        let mut filter = Self {
            num_bits,
            num_hashes: NUM_HASHES,
            bits: vec![0; num_bits.div_ceil(8) as usize],
        };
        for key in keys {
            filter.insert(key.as_ref());
        }
        filter
    }

    fn insert(&mut self, key: &str) {
        let positions: Vec<u64> = self.positions(key).collect();
        for position in positions {
            self.bits[(position / 8) as usize] |= 1 << (position % 8);
        }
    }

    /// Whether `key` may be in the set. False means definitely absent.
    pub fn may_contain(&self, key: &str) -> bool {
        self.positions(key)
            .all(|position| self.bits[(position / 8) as usize] & (1 << (position % 8)) != 0)
    }

    /// Double hashing: bit position i = h1 + i * h2 (mod m), with h1 and
    /// h2 drawn from one digest.
    fn positions(&self, key: &str) -> impl Iterator<Item = u64> + '_ {
        let digest = blake3::hash(key.as_bytes());
        let bytes = digest.as_bytes();
        let h1 = u64::from_le_bytes(bytes[0..8].try_into().expect("digest is 32 bytes"));
        let h2 = u64::from_le_bytes(bytes[8..16].try_into().expect("digest is 32 bytes"))
            | 1; // force odd so the stride visits every bit
        let num_bits = self.num_bits;
        (0..self.num_hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % num_bits)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|err| Error::Fatal(format!("undecodable bloom filter: {err}")))
    }
}
