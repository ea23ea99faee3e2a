//! Fixed-width unsigned fields packed back to back into `u64` words.
//!
//! A field may straddle two words. Widths go up to 64 bits; a width of zero
//! stores nothing and always reads back as zero.

use bytes::BufMut;
use block_hash_common::{BlockHashError, BlockHashResult};

use crate::utils::{get_u32_le, get_u64_le};

const WORD_BITS: usize = u64::BITS as usize;

#[inline]
pub(crate) fn low_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedArray {
    width: u32,
    len: usize,
    words: Vec<u64>,
}

impl PackedArray {
    pub fn new(len: usize, width: u32) -> Self {
        assert!(width <= 64, "field width {} exceeds 64 bits", width);
        Self {
            width,
            len,
            words: vec![0; Self::word_count(len, width)],
        }
    }

    fn word_count(len: usize, width: u32) -> usize {
        (len * width as usize).div_ceil(WORD_BITS)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn get(&self, index: usize) -> u64 {
        assert!(index < self.len, "index {} out of {}", index, self.len);
        if self.width == 0 {
            return 0;
        }
        let bit = index * self.width as usize;
        let word = bit / WORD_BITS;
        let offset = bit % WORD_BITS;
        let mut value = self.words[word] >> offset;
        if offset + self.width as usize > WORD_BITS {
            value |= self.words[word + 1] << (WORD_BITS - offset);
        }
        value & low_mask(self.width)
    }

    /// Store `value`, truncated to the field width.
    pub fn set(&mut self, index: usize, value: u64) {
        assert!(index < self.len, "index {} out of {}", index, self.len);
        if self.width == 0 {
            return;
        }
        let mask = low_mask(self.width);
        let value = value & mask;
        let bit = index * self.width as usize;
        let word = bit / WORD_BITS;
        let offset = bit % WORD_BITS;
        self.words[word] = (self.words[word] & !(mask << offset)) | (value << offset);
        let end = offset + self.width as usize;
        if end > WORD_BITS {
            let spill = (end - WORD_BITS) as u32;
            let high = low_mask(spill);
            self.words[word + 1] =
                (self.words[word + 1] & !high) | (value >> (WORD_BITS - offset));
        }
    }

    /// ┌───────────────────────────────────────────┐
    /// │ Packed Array                              │
    /// │┌ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ─ ─ ┐ │
    /// │  field len   word count      words        │
    /// ││    u32    │     u32     │    u64 ...   │ │
    /// │ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ┘ │
    /// └───────────────────────────────────────────┘
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.reserve(8 + self.words.len() * 8);
        buf.put_u32_le(self.len as u32);
        buf.put_u32_le(self.words.len() as u32);
        for w in &self.words {
            buf.put_u64_le(*w);
        }
    }

    pub fn decode(bytes: &[u8], width: u32) -> BlockHashResult<(Self, &[u8])> {
        let (len, bytes) = get_u32_le(bytes)?;
        let (word_count, mut bytes) = get_u32_le(bytes)?;
        let len = len as usize;
        if word_count as usize != Self::word_count(len, width) {
            return Err(BlockHashError::Decode(
                format!(
                    "Packed array of {} fields of {} bits cannot have {} words",
                    len, width, word_count
                )
                .into(),
            ));
        }
        let mut words = Vec::with_capacity(word_count as usize);
        for _ in 0..word_count {
            let (w, rest) = get_u64_le(bytes)?;
            words.push(w);
            bytes = rest;
        }
        Ok((Self { width, len, words }, bytes))
    }

    pub fn heap_size(&self) -> usize {
        self.words.len() * std::mem::size_of::<u64>()
    }
}

/// One `(order, fingerprint)` pair per slot, packed as a single
/// `order_bits + fingerprint_bits` wide field with the order in the low bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedPackedArray {
    order_bits: u32,
    fingerprint_bits: u32,
    inner: PackedArray,
}

impl PairedPackedArray {
    pub fn new(len: usize, order_bits: u32, fingerprint_bits: u32) -> Self {
        Self {
            order_bits,
            fingerprint_bits,
            inner: PackedArray::new(len, order_bits + fingerprint_bits),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn get(&self, index: usize) -> (u64, u64) {
        let field = self.inner.get(index);
        let order = field & low_mask(self.order_bits);
        let fingerprint = if self.fingerprint_bits == 0 {
            0
        } else {
            field >> self.order_bits
        };
        (order, fingerprint)
    }

    pub fn set(&mut self, index: usize, order: u64, fingerprint: u64) {
        let order = order & low_mask(self.order_bits);
        let fingerprint = fingerprint & low_mask(self.fingerprint_bits);
        let field = if self.fingerprint_bits == 0 {
            order
        } else {
            order | (fingerprint << self.order_bits)
        };
        self.inner.set(index, field);
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        self.inner.encode(buf)
    }

    pub fn decode(
        bytes: &[u8],
        order_bits: u32,
        fingerprint_bits: u32,
    ) -> BlockHashResult<(Self, &[u8])> {
        let (inner, rest) = PackedArray::decode(bytes, order_bits + fingerprint_bits)?;
        Ok((
            Self {
                order_bits,
                fingerprint_bits,
                inner,
            },
            rest,
        ))
    }

    pub fn heap_size(&self) -> usize {
        self.inner.heap_size()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fields_straddle_words() {
        let mut arr = PackedArray::new(100, 13);
        for i in 0..100 {
            arr.set(i, (i as u64 * 977) & low_mask(13));
        }
        for i in 0..100 {
            assert_eq!(arr.get(i), (i as u64 * 977) & low_mask(13), "index {}", i);
        }
        // overwrite in the middle and check neighbours survive
        arr.set(4, 0);
        assert_eq!(arr.get(3), (3 * 977) & low_mask(13));
        assert_eq!(arr.get(4), 0);
        assert_eq!(arr.get(5), (5 * 977) & low_mask(13));
    }

    #[test]
    fn full_width_and_zero_width() {
        let mut arr = PackedArray::new(3, 64);
        arr.set(1, u64::MAX);
        assert_eq!(arr.get(0), 0);
        assert_eq!(arr.get(1), u64::MAX);
        assert_eq!(arr.get(2), 0);

        let mut empty = PackedArray::new(10, 0);
        empty.set(5, 123);
        assert_eq!(empty.get(5), 0);
        assert_eq!(empty.heap_size(), 0);
    }

    #[test]
    fn set_truncates_to_width() {
        let mut arr = PackedArray::new(2, 4);
        arr.set(0, 0xff);
        assert_eq!(arr.get(0), 0xf);
        assert_eq!(arr.get(1), 0);
    }

    #[test]
    fn paired_fields() {
        let mut arr = PairedPackedArray::new(50, 10, 8);
        for i in 0..50 {
            arr.set(i, i as u64, (i as u64 * 31) & 0xff);
        }
        for i in 0..50 {
            assert_eq!(arr.get(i), (i as u64, (i as u64 * 31) & 0xff));
        }

        let mut no_print = PairedPackedArray::new(4, 6, 0);
        no_print.set(2, 33, 0xdead);
        assert_eq!(no_print.get(2), (33, 0));
    }

    #[test]
    fn decode_rejects_wrong_word_count() {
        let arr = PackedArray::new(10, 7);
        let mut buf = Vec::new();
        arr.encode(&mut buf);
        // claim 20 fields so the word count no longer fits
        buf[0] = 20;
        assert!(PackedArray::decode(&buf, 7).is_err());

        let mut buf = Vec::new();
        arr.encode(&mut buf);
        let (decoded, rest) = PackedArray::decode(&buf, 7).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, arr);
    }
}
