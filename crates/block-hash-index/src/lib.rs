//! # Block Hash Index
//!
//! A string to integer index over lexicographically sorted keys. Keys arrive
//! in ranges; each range gets its own minimal perfect hash plus one packed
//! `(position, fingerprint)` slot per member. A lookup binary searches the
//! first key of every range (its landmark) and evaluates one hash, so only
//! the ranges actually touched need to be in memory.
//!
//! The value of a key is `(range << order_bits) + position`, where `position`
//! is the key's rank among the main keys of its range. Missing keys resolve to
//! [`NOT_FOUND_VALUE`]; prefix keys resolve to [`PREFIX_VALUE`].
//!
//! ## Section Layout
//!
//! A saved index is one self-contained section that may start anywhere in a
//! larger file. All offsets are relative to the start of the section.
//!
//! ┌───────────────────────────────────────────────────────────────────────────────────────────────┐
//! │ Block Hash Section                                                                            │
//! │┌ ─ ─ ─ ─ ─ ─┌ ─ ─ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ─┌ ─ ─ ─ ─ ─ ─ ─ ─ ┐│
//! │  Magic Number│ Schema Version  order bits    fp bits     index offset  index len │Range Bodies ... ││
//! ││     u32     │       u8      │     u8      │    u8     │    u64    │    u64     │     bytes       ││
//! │ ─ ─ ─ ─ ─ ─ ┘─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ┘─ ─ ─ ─ ─ ─ ─ ─ ─ ┘│
//! │┌ ─ ─ ─ ─ ─ ─ ─ ┐                                                                              │
//! │  Range Index                                                                                  │
//! ││     bytes     │                                                                              │
//! │ ─ ─ ─ ─ ─ ─ ─ ┘                                                                               │
//! └───────────────────────────────────────────────────────────────────────────────────────────────┘
//!
//! 1. Magic Number (4 bytes): "BHIX".
//! 2. Schema Version (1 byte).
//! 3. Order and fingerprint bits (1 byte each): the slot widths of every range.
//! 4. Index offset and length (8 bytes each): where the Range Index lives. They
//!    are written as zero first and patched when the save is finalized, so a
//!    zero offset marks an unfinished section.
//! 5. Range Bodies: one per range, in range order.
//! 6. Range Index: landmark, body offset and body length of every range, then
//!    the number of keys, then a checksum.
//!
//! ## Range Body
//!
//! ┌───────────────────────────────────────────────────────────────────────────────────────┐
//! │ Range Body                                                                            │
//! │┌ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ┐ │
//! │  main num   prefix num    filler    hash len    hash        packed slots    checksum  │
//! ││    u32    │    u32     │   u8    │    u32    │  bytes    │     bytes     │   u32   │ │
//! │ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ┘ │
//! └───────────────────────────────────────────────────────────────────────────────────────┘
//!
//! The hash covers the main keys, then the prefix keys, then the filler key
//! that pads single-key ranges. Packed slots hold `order_bits + fp_bits` bits
//! each, indexed by the hash value.
//!
//! Decoding:
//! 1. Verify the xxhash_32 checksum.
//! 2. Decode the hash from its length-prefixed bytes.
//! 3. Decode the packed slots and check both agree on the member count.
//!
//! ## Residency
//!
//! A freshly built range is resident. It can be released once it has been
//! saved ([`BlockHashIndex::drop_range`], [`BlockHashIndex::drop_last_range`],
//! [`BlockHashIndex::keep_n_last_ranges`]). A released range of a loaded
//! index is read back from the attached reader on its next lookup; results
//! do not depend on what is resident.
pub mod config;
pub mod fingerprint;
pub mod landmark;
pub mod mphf;
pub mod packed;

mod block;
mod index;
mod persist;
mod pool;
mod ranges;
mod utils;

pub use block_hash_common::{
    BlockHashError, BlockHashResult, Lookup, Value, NOT_FOUND_VALUE, PREFIX_VALUE,
};
pub use config::IndexConfig;
pub use index::{BlockHashIndex, DEFAULT_KEEP_RATIO, DEFAULT_KEEP_TOLERANCE};
pub use ranges::{BlockSource, SeekEntry};

pub(crate) const XXH_SEED: u32 = u32::from_le_bytes(*b"BHIX");
