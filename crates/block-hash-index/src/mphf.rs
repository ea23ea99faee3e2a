//! Minimal perfect hashing for one range.
//!
//! The index only needs "build over a fixed key set, then evaluate a key to
//! a dense slot", so the algorithm sits behind [`PerfectHashBuilder`] and
//! [`PerfectHash`]. [`BbHashBuilder`] is the default: a multi level
//! construction where each level hashes the remaining keys into
//! `gamma * remaining` bins and keeps the keys that landed alone. The bins
//! of all levels form one bit vector; the rank of a key's bin is its slot.

use bytes::{BufMut, Bytes};
use block_hash_common::{BlockHashError, BlockHashResult};
use xxhash_rust::xxh64::xxh64;

use crate::utils::{get_u32_le, get_u64_le};

pub trait PerfectHash: Send + Sync + Sized + 'static {
    /// Slot of `key` in `[0, len())`. Keys outside the build set still map
    /// into the range, to an arbitrary slot.
    fn eval(&self, key: &[u8]) -> usize;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn encode(&self, buf: &mut Vec<u8>);
    fn decode(bytes: &[u8]) -> BlockHashResult<Self>;
    fn heap_size(&self) -> usize;
}

pub trait PerfectHashBuilder: Send + Sync + 'static {
    type Hash: PerfectHash;
    /// Build over distinct `keys`. Callers guarantee at least two keys.
    fn build(&self, keys: &[Bytes]) -> BlockHashResult<Self::Hash>;
}

const LEVEL_SEED: u64 = u64::from_le_bytes(*b"BHIXLEVL");
const WORD_BITS: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct BbHashBuilder {
    gamma: f64,
    max_levels: usize,
    max_attempts: usize,
}

impl Default for BbHashBuilder {
    fn default() -> Self {
        Self {
            gamma: 2.0,
            max_levels: 64,
            max_attempts: 32,
        }
    }
}

impl BbHashBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bins per remaining key on every level. Larger is faster to build and
    /// bigger on disk.
    pub fn gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma.max(1.0);
        self
    }

    pub fn max_levels(mut self, max_levels: usize) -> Self {
        self.max_levels = max_levels.max(1);
        self
    }

    /// How many reseeds a level may try before the build gives up. A level
    /// that separates nothing usually means the input has duplicate keys.
    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

#[inline]
fn level_seed(level: usize, attempt: usize) -> u64 {
    let mut raw = [0u8; 16];
    raw[..8].copy_from_slice(&(level as u64).to_le_bytes());
    raw[8..].copy_from_slice(&(attempt as u64).to_le_bytes());
    xxh64(&raw, LEVEL_SEED)
}

#[inline]
fn bin(key: &[u8], seed: u64, bins: usize) -> usize {
    (xxh64(key, seed) % bins as u64) as usize
}

#[inline]
fn get_bit(words: &[u64], idx: usize) -> bool {
    (words[idx / WORD_BITS] >> (idx % WORD_BITS)) & 1 == 1
}

#[inline]
fn set_bit(words: &mut [u64], idx: usize) {
    words[idx / WORD_BITS] |= 1u64 << (idx % WORD_BITS);
}

#[inline]
fn clear_bit(words: &mut [u64], idx: usize) {
    words[idx / WORD_BITS] &= !(1u64 << (idx % WORD_BITS));
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Level {
    seed: u64,
    /// First word of this level in [`BbHash::bits`].
    word_offset: usize,
    word_len: usize,
}

impl Level {
    fn bins(&self) -> usize {
        self.word_len * WORD_BITS
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BbHash {
    len: usize,
    levels: Vec<Level>,
    /// Set bit = bin owned by exactly one key.
    bits: Vec<u64>,
    /// Set bits before each word, so a bin's rank is one popcount away.
    ranks: Vec<u32>,
}

impl BbHash {
    fn from_parts(len: usize, levels: Vec<Level>, bits: Vec<u64>) -> Self {
        let mut ranks = Vec::with_capacity(bits.len());
        let mut acc = 0u32;
        for w in &bits {
            ranks.push(acc);
            acc += w.count_ones();
        }
        Self {
            len,
            levels,
            bits,
            ranks,
        }
    }

    fn rank(&self, flat: usize) -> usize {
        let word = flat / WORD_BITS;
        let below = self.bits[word] & ((1u64 << (flat % WORD_BITS)) - 1);
        self.ranks[word] as usize + below.count_ones() as usize
    }

    fn total_ones(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }
}

impl PerfectHash for BbHash {
    fn eval(&self, key: &[u8]) -> usize {
        for level in &self.levels {
            let b = bin(key, level.seed, level.bins());
            let flat = level.word_offset * WORD_BITS + b;
            if get_bit(&self.bits, flat) {
                return self.rank(flat);
            }
        }
        // not a member; still stay in range
        if self.len == 0 {
            return 0;
        }
        (xxh64(key, LEVEL_SEED) % self.len as u64) as usize
    }

    fn len(&self) -> usize {
        self.len
    }

    /// ┌───────────────────────────────────────────────────────────────────┐
    /// │ BBHash                                                            │
    /// │┌ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ┬ ─ ─ ─ ─ ┐│
    /// │  key num   level num    seed   word num   words     ...            │
    /// ││   u32   │    u32     │  u64  │  u32   │ u64 ... │       │        ││
    /// │ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ┘│
    /// └───────────────────────────────────────────────────────────────────┘
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.reserve(8 + self.levels.len() * 12 + self.bits.len() * 8);
        buf.put_u32_le(self.len as u32);
        buf.put_u32_le(self.levels.len() as u32);
        for level in &self.levels {
            buf.put_u64_le(level.seed);
            buf.put_u32_le(level.word_len as u32);
            for w in &self.bits[level.word_offset..level.word_offset + level.word_len] {
                buf.put_u64_le(*w);
            }
        }
    }

    fn decode(bytes: &[u8]) -> BlockHashResult<Self> {
        let (len, bytes) = get_u32_le(bytes)?;
        let (level_num, mut bytes) = get_u32_le(bytes)?;
        let mut levels = Vec::with_capacity(level_num as usize);
        let mut bits = Vec::new();
        for _ in 0..level_num {
            let (seed, rest) = get_u64_le(bytes)?;
            let (word_len, mut rest) = get_u32_le(rest)?;
            if word_len == 0 || rest.len() < word_len as usize * 8 {
                return Err(BlockHashError::Decode("Invalid perfect hash level".into()));
            }
            levels.push(Level {
                seed,
                word_offset: bits.len(),
                word_len: word_len as usize,
            });
            for _ in 0..word_len {
                let (w, r) = get_u64_le(rest)?;
                bits.push(w);
                rest = r;
            }
            bytes = rest;
        }
        if !bytes.is_empty() {
            return Err(BlockHashError::Decode(
                "Trailing bytes after perfect hash".into(),
            ));
        }
        let ans = Self::from_parts(len as usize, levels, bits);
        if ans.total_ones() != ans.len {
            return Err(BlockHashError::Decode(
                format!(
                    "Perfect hash claims {} keys but owns {} bins",
                    ans.len,
                    ans.total_ones()
                )
                .into(),
            ));
        }
        Ok(ans)
    }

    fn heap_size(&self) -> usize {
        self.bits.len() * 12 + self.levels.len() * std::mem::size_of::<Level>()
    }
}

impl PerfectHashBuilder for BbHashBuilder {
    type Hash = BbHash;

    fn build(&self, keys: &[Bytes]) -> BlockHashResult<BbHash> {
        let mut remaining: Vec<usize> = (0..keys.len()).collect();
        let mut levels: Vec<Level> = Vec::new();
        let mut bits: Vec<u64> = Vec::new();
        let mut attempt = 0;
        while !remaining.is_empty() {
            if levels.len() >= self.max_levels {
                return Err(BlockHashError::HashConstruction(
                    format!(
                        "{} keys left after {} levels",
                        remaining.len(),
                        levels.len()
                    )
                    .into(),
                ));
            }

            let wanted = ((remaining.len() as f64) * self.gamma).ceil() as usize;
            let word_len = wanted.max(1).div_ceil(WORD_BITS);
            let bins = word_len * WORD_BITS;
            let seed = level_seed(levels.len(), attempt);
            let mut seen = vec![0u64; word_len];
            let mut alone = vec![0u64; word_len];
            for &ix in &remaining {
                let b = bin(&keys[ix], seed, bins);
                if get_bit(&seen, b) {
                    clear_bit(&mut alone, b);
                } else {
                    set_bit(&mut seen, b);
                    set_bit(&mut alone, b);
                }
            }

            let next: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&ix| !get_bit(&alone, bin(&keys[ix], seed, bins)))
                .collect();
            if next.len() == remaining.len() {
                attempt += 1;
                if attempt >= self.max_attempts {
                    return Err(BlockHashError::HashConstruction(
                        format!(
                            "cannot separate {} keys, the input may contain duplicates",
                            remaining.len()
                        )
                        .into(),
                    ));
                }
                continue;
            }

            levels.push(Level {
                seed,
                word_offset: bits.len(),
                word_len,
            });
            bits.extend_from_slice(&alone);
            remaining = next;
            attempt = 0;
        }

        Ok(BbHash::from_parts(keys.len(), levels, bits))
    }
}
