use bytes::{BufMut, Bytes};
use block_hash_common::{BlockHashError, BlockHashResult};

use crate::{
    fingerprint::fingerprint,
    mphf::{PerfectHash, PerfectHashBuilder},
    packed::PairedPackedArray,
    utils::{get_slice, get_u32_le, get_u8_le, verify_checksum},
    XXH_SEED,
};

/// Bit budget shared by every range of one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotLayout {
    pub order_bits: u32,
    pub fingerprint_bits: u32,
}

impl SlotLayout {
    pub fn capacity(&self) -> usize {
        1usize << self.order_bits
    }
}

/// The keys of one range, ready for hashing: main keys first, then the
/// prefix keys that are not also main keys, then the filler if any.
#[derive(Debug, Clone)]
pub(crate) struct RangeKeys {
    pub keys: Vec<Bytes>,
    pub main_count: usize,
    pub prefix_count: usize,
    pub has_filler: bool,
}

impl RangeKeys {
    pub fn slot_count(&self) -> usize {
        self.keys.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotHit {
    /// Position of the key among the range's main keys.
    Main(u64),
    Prefix,
    Miss,
}

/// One resident range: its perfect hash plus `(position, fingerprint)` per slot.
#[derive(Debug)]
pub(crate) struct Block<H> {
    hash: H,
    slots: PairedPackedArray,
    main_count: u32,
    prefix_count: u32,
    has_filler: bool,
}

impl<H: PerfectHash> Block<H> {
    pub fn build<B>(builder: &B, layout: SlotLayout, range: &RangeKeys) -> BlockHashResult<Self>
    where
        B: PerfectHashBuilder<Hash = H>,
    {
        let hash = builder.build(&range.keys)?;
        let n = range.slot_count();
        if hash.len() != n {
            return Err(BlockHashError::HashConstruction(
                format!("perfect hash covers {} slots, expected {}", hash.len(), n).into(),
            ));
        }
        let mut slots = PairedPackedArray::new(n, layout.order_bits, layout.fingerprint_bits);
        for (pos, key) in range.keys.iter().enumerate() {
            let slot = hash.eval(key);
            if slot >= n {
                return Err(BlockHashError::HashConstruction(
                    format!("slot {} out of {}", slot, n).into(),
                ));
            }
            slots.set(
                slot,
                pos as u64,
                fingerprint(key, layout.fingerprint_bits),
            );
        }
        Ok(Self {
            hash,
            slots,
            main_count: range.main_count as u32,
            prefix_count: range.prefix_count as u32,
            has_filler: range.has_filler,
        })
    }

    pub fn get(&self, key: &[u8], layout: SlotLayout) -> SlotHit {
        let slot = self.hash.eval(key);
        if slot >= self.slots.len() {
            return SlotHit::Miss;
        }
        let (pos, print) = self.slots.get(slot);
        if print != fingerprint(key, layout.fingerprint_bits) {
            return SlotHit::Miss;
        }
        if pos < self.main_count as u64 {
            SlotHit::Main(pos)
        } else if pos < (self.main_count + self.prefix_count) as u64 {
            SlotHit::Prefix
        } else {
            // the filler
            SlotHit::Miss
        }
    }

    pub fn main_count(&self) -> usize {
        self.main_count as usize
    }

    pub fn heap_size(&self) -> usize {
        self.hash.heap_size() + self.slots.heap_size()
    }

    /// ┌───────────────────────────────────────────────────────────────────────────────────────┐
    /// │ Range Body                                                                            │
    /// │┌ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ┐ │
    /// │  main num   prefix num    filler    hash len    hash        packed slots    checksum  │
    /// ││    u32    │    u32     │   u8    │    u32    │  bytes    │     bytes     │   u32   │ │
    /// │ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ┘ │
    /// └───────────────────────────────────────────────────────────────────────────────────────┘
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        buf.put_u32_le(self.main_count);
        buf.put_u32_le(self.prefix_count);
        buf.put_u8(self.has_filler as u8);
        let len_pos = buf.len();
        buf.put_u32_le(0);
        self.hash.encode(buf);
        let hash_len = (buf.len() - len_pos - 4) as u32;
        buf[len_pos..len_pos + 4].copy_from_slice(&hash_len.to_le_bytes());
        self.slots.encode(buf);
        let checksum = xxhash_rust::xxh32::xxh32(&buf[start..], XXH_SEED);
        buf.put_u32_le(checksum);
    }

    pub fn decode(raw: &[u8], layout: SlotLayout) -> BlockHashResult<Self> {
        let body = verify_checksum(raw, XXH_SEED)?;
        let (main_count, body) = get_u32_le(body)?;
        let (prefix_count, body) = get_u32_le(body)?;
        let (has_filler, body) = get_u8_le(body)?;
        let (hash_len, body) = get_u32_le(body)?;
        let (hash_bytes, body) = get_slice(body, hash_len as usize)?;
        let hash = H::decode(hash_bytes)?;
        let (slots, rest) =
            PairedPackedArray::decode(body, layout.order_bits, layout.fingerprint_bits)?;
        if !rest.is_empty() {
            return Err(BlockHashError::Decode("Trailing bytes in range body".into()));
        }
        let expected = main_count as usize + prefix_count as usize + has_filler as usize;
        if slots.len() != expected || hash.len() != expected {
            return Err(BlockHashError::Decode(
                format!(
                    "Range body has {} slots and a hash over {} keys, expected {}",
                    slots.len(),
                    hash.len(),
                    expected
                )
                .into(),
            ));
        }
        Ok(Self {
            hash,
            slots,
            main_count,
            prefix_count,
            has_filler: has_filler != 0,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mphf::{BbHash, BbHashBuilder};

    const LAYOUT: SlotLayout = SlotLayout {
        order_bits: 8,
        fingerprint_bits: 16,
    };

    fn range(main: &[&str], prefixes: &[&str], filler: Option<&str>) -> RangeKeys {
        let mut keys: Vec<Bytes> = main.iter().map(|k| Bytes::copy_from_slice(k.as_bytes())).collect();
        keys.extend(prefixes.iter().map(|k| Bytes::copy_from_slice(k.as_bytes())));
        keys.extend(filler.map(|k| Bytes::copy_from_slice(k.as_bytes())));
        RangeKeys {
            keys,
            main_count: main.len(),
            prefix_count: prefixes.len(),
            has_filler: filler.is_some(),
        }
    }

    #[test]
    fn main_prefix_and_filler_slots() {
        let r = range(&["b", "c", "d"], &["a"], None);
        let block: Block<BbHash> = Block::build(&BbHashBuilder::default(), LAYOUT, &r).unwrap();
        assert_eq!(block.get(b"b", LAYOUT), SlotHit::Main(0));
        assert_eq!(block.get(b"c", LAYOUT), SlotHit::Main(1));
        assert_eq!(block.get(b"d", LAYOUT), SlotHit::Main(2));
        assert_eq!(block.get(b"a", LAYOUT), SlotHit::Prefix);
        assert_eq!(block.main_count(), 3);

        let r = range(&["only"], &[], Some("\u{1}filler"));
        let block: Block<BbHash> = Block::build(&BbHashBuilder::default(), LAYOUT, &r).unwrap();
        assert_eq!(block.get(b"only", LAYOUT), SlotHit::Main(0));
        assert_eq!(block.get(b"\x01filler", LAYOUT), SlotHit::Miss);
    }

    #[test]
    fn body_round_trip_and_corruption() {
        let r = range(&["k1", "k2", "k3", "k4"], &["k0"], None);
        let block: Block<BbHash> = Block::build(&BbHashBuilder::default(), LAYOUT, &r).unwrap();
        let mut buf = Vec::new();
        block.encode(&mut buf);
        let decoded: Block<BbHash> = Block::decode(&buf, LAYOUT).unwrap();
        for (i, k) in ["k1", "k2", "k3", "k4"].iter().enumerate() {
            assert_eq!(decoded.get(k.as_bytes(), LAYOUT), SlotHit::Main(i as u64));
        }
        assert_eq!(decoded.get(b"k0", LAYOUT), SlotHit::Prefix);

        buf[5] ^= 0xff;
        assert!(matches!(
            Block::<BbHash>::decode(&buf, LAYOUT),
            Err(BlockHashError::ChecksumMismatch)
        ));
    }
}
