//! Per-partition bloom filter.
//!
//! In full-eviction mode a GET that misses the hash table cannot tell "not
//! stored anywhere" from "on disk only" without I/O. The filter tracks every
//! key the partition may have persisted; a clean miss is definitive and
//! skips the background fetch.

use crc::{Crc, CRC_64_ECMA_182, CRC_64_XZ};

use crate::item::DocKey;

const CRC_A: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);
const CRC_B: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Double-hashed bloom filter: bit positions are h1 + i*h2 for i in 0..k.
#[derive(Debug)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    num_keys: u64,
}

impl BloomFilter {
    pub fn new(num_bits: usize, num_hashes: u32) -> Self {
        let num_bits = num_bits.max(64) as u64;
        Self {
            bits: vec![0; num_bits.div_ceil(64) as usize],
            num_bits,
            num_hashes: num_hashes.max(1),
            num_keys: 0,
        }
    }

    /// Sized for the default per-partition key estimate.
    pub fn with_default_size() -> Self {
        // ~10 bits per key at 10k keys, 7 probes
        Self::new(100_000, 7)
    }

    fn hashes(&self, key: &DocKey) -> (u64, u64) {
        let mut digest_a = CRC_A.digest();
        digest_a.update(&key.collection.to_be_bytes());
        digest_a.update(&key.key);
        let mut digest_b = CRC_B.digest();
        digest_b.update(&key.collection.to_be_bytes());
        digest_b.update(&key.key);
        (digest_a.finalize(), digest_b.finalize() | 1)
    }

    pub fn add(&mut self, key: &DocKey) {
        let (h1, h2) = self.hashes(key);
        for i in 0..self.num_hashes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
        self.num_keys += 1;
    }

    pub fn maybe_contains(&self, key: &DocKey) -> bool {
        let (h1, h2) = self.hashes(key);
        (0..self.num_hashes as u64).all(|i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0
        })
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
        self.num_keys = 0;
    }

    pub fn num_keys(&self) -> u64 {
        self.num_keys
    }
}
