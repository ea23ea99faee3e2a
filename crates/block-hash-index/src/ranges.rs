//! Residency bookkeeping for every range of an index.
//!
//! All of this sits behind the index-wide mutex: worker threads install
//! finished ranges here while the owning thread loads, drops and evicts.

use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    io::{Read, Seek, SeekFrom},
};

use block_hash_common::{BlockHashError, BlockHashResult};
use tracing::{debug, trace};

use crate::{
    block::{Block, SlotHit, SlotLayout},
    mphf::PerfectHash,
};

/// Anything a persisted index can be lazily read back from.
pub trait BlockSource: Read + Seek + Send {}
impl<T: Read + Seek + Send> BlockSource for T {}

/// Where a range body lives, relative to the start of the index section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeekEntry {
    pub offset: u64,
    pub len: u64,
}

pub(crate) struct Source {
    reader: Box<dyn BlockSource>,
    start: u64,
    entries: Vec<SeekEntry>,
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("start", &self.start)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl Source {
    pub fn new(reader: Box<dyn BlockSource>, start: u64, entries: Vec<SeekEntry>) -> Self {
        Self {
            reader,
            start,
            entries,
        }
    }

    fn contains(&self, index: usize) -> bool {
        index < self.entries.len()
    }

    fn read_body(&mut self, index: usize) -> BlockHashResult<Vec<u8>> {
        let entry = self.entries[index];
        self.reader.seek(SeekFrom::Start(self.start + entry.offset))?;
        let mut buf = vec![0; entry.len as usize];
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }
}

#[derive(Debug)]
struct RangeSlot<H> {
    block: Option<Block<H>>,
    last_access: Option<u64>,
    /// Construction finished at least once.
    built: bool,
    /// A copy exists on disk, so the in-memory one may be released.
    persisted: bool,
    /// Why construction failed, if it did.
    failed: Option<Box<str>>,
}

impl<H> RangeSlot<H> {
    fn pending() -> Self {
        Self {
            block: None,
            last_access: None,
            built: false,
            persisted: false,
            failed: None,
        }
    }

    fn on_disk() -> Self {
        Self {
            block: None,
            last_access: None,
            built: true,
            persisted: true,
            failed: None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct RangeTable<H> {
    slots: Vec<RangeSlot<H>>,
    layout: SlotLayout,
    clock: u64,
    resident: usize,
    /// Finished ranges not yet taken by an ordered save, smallest first.
    finished: BinaryHeap<Reverse<usize>>,
    source: Option<Source>,
}

impl<H: PerfectHash> RangeTable<H> {
    pub fn new(layout: SlotLayout) -> Self {
        Self {
            slots: Vec::new(),
            layout,
            clock: 0,
            resident: 0,
            finished: BinaryHeap::new(),
            source: None,
        }
    }

    pub fn push_pending(&mut self) -> usize {
        self.slots.push(RangeSlot::pending());
        self.slots.len() - 1
    }

    /// Replace every range with the ones described by `source`, none resident.
    pub fn attach_source(&mut self, layout: SlotLayout, source: Source) {
        self.slots = (0..source.entries.len())
            .map(|_| RangeSlot::on_disk())
            .collect();
        self.layout = layout;
        self.resident = 0;
        self.finished.clear();
        self.source = Some(source);
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Called when construction of range `index` completes.
    pub fn install(&mut self, index: usize, block: Block<H>) {
        let now = self.tick();
        let slot = &mut self.slots[index];
        if slot.block.is_none() {
            self.resident += 1;
        }
        slot.block = Some(block);
        slot.built = true;
        slot.last_access = Some(now);
        self.finished.push(Reverse(index));
        trace!("range {} built", index);
    }

    /// Called when construction of range `index` fails.
    pub fn fail(&mut self, index: usize, reason: Box<str>) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.failed = Some(reason);
        }
    }

    /// Make range `index` resident, reading it from the source if needed,
    /// and record the access.
    pub fn ensure_loaded(&mut self, index: usize) -> BlockHashResult<&Block<H>> {
        if index >= self.slots.len() {
            return Err(BlockHashError::OutOfBound {
                pos: index,
                len: self.slots.len(),
            });
        }
        if self.slots[index].block.is_none() {
            let raw = match self.source.as_mut() {
                Some(source) if source.contains(index) => source.read_body(index)?,
                _ => {
                    let slot = &self.slots[index];
                    return Err(match &slot.failed {
                        Some(reason) => BlockHashError::RangeBuildFailed {
                            index,
                            reason: reason.clone(),
                        },
                        None if !slot.built => BlockHashError::RangeNotReady(index),
                        None => BlockHashError::NoSource(index),
                    });
                }
            };
            let block = Block::decode(&raw, self.layout)?;
            trace!(
                "range {} loaded, {} keys in {} bytes",
                index,
                block.main_count(),
                raw.len()
            );
            self.slots[index].block = Some(block);
            self.resident += 1;
        }
        let now = self.tick();
        let slot = &mut self.slots[index];
        slot.last_access = Some(now);
        match slot.block.as_ref() {
            Some(block) => Ok(block),
            None => Err(BlockHashError::RangeNotReady(index)),
        }
    }

    pub fn lookup(&mut self, index: usize, key: &[u8]) -> BlockHashResult<SlotHit> {
        let layout = self.layout;
        let block = self.ensure_loaded(index)?;
        Ok(block.get(key, layout))
    }

    pub fn mark_persisted(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.persisted = true;
        }
    }

    /// Release range `index`. Returns whether it was resident.
    pub fn drop_range(&mut self, index: usize) -> BlockHashResult<bool> {
        let len = self.slots.len();
        let Some(slot) = self.slots.get_mut(index) else {
            return Err(BlockHashError::OutOfBound { pos: index, len });
        };
        if slot.block.is_none() {
            return Ok(false);
        }
        if !slot.persisted {
            return Err(BlockHashError::NotPersisted(index));
        }
        slot.block = None;
        slot.last_access = None;
        self.resident -= 1;
        trace!("range {} dropped", index);
        Ok(true)
    }

    /// Keep roughly the `ratio` most recently used ranges resident.
    ///
    /// Nothing happens until the resident count exceeds the target by more
    /// than `tolerance * len`; then the least recently used ranges are
    /// released until exactly the target remains. Ranges without a persisted
    /// copy are never released.
    pub fn keep_n_last_ranges(&mut self, ratio: f64, tolerance: f64) -> usize {
        let n = self.slots.len();
        if n == 0 {
            return 0;
        }
        let target = ((ratio.clamp(0.0, 1.0) * n as f64).ceil() as usize).min(n);
        let allowed = target as f64 + tolerance.max(0.0) * n as f64;
        if self.resident as f64 <= allowed {
            return 0;
        }

        let mut oldest: BinaryHeap<Reverse<(u64, usize)>> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.block.is_some() && s.persisted)
            .map(|(i, s)| Reverse((s.last_access.unwrap_or(0), i)))
            .collect();
        let mut evicted = 0;
        while self.resident > target {
            let Some(Reverse((_, index))) = oldest.pop() else {
                break;
            };
            let slot = &mut self.slots[index];
            slot.block = None;
            slot.last_access = None;
            self.resident -= 1;
            evicted += 1;
        }
        debug!(
            "evicted {} of {} ranges, {} resident (target {})",
            evicted, n, self.resident, target
        );
        evicted
    }

    pub fn peek_finished(&self) -> Option<usize> {
        self.finished.peek().map(|r| r.0)
    }

    pub fn pop_finished(&mut self) -> Option<usize> {
        self.finished.pop().map(|r| r.0)
    }

    pub fn is_resident(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .map_or(false, |slot| slot.block.is_some())
    }

    pub fn last_access(&self, index: usize) -> Option<u64> {
        self.slots.get(index).and_then(|slot| slot.last_access)
    }

    pub fn resident_count(&self) -> usize {
        self.resident
    }

    pub fn resident_heap_size(&self) -> usize {
        self.slots
            .iter()
            .filter_map(|slot| slot.block.as_ref())
            .map(|block| block.heap_size())
            .sum()
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;
    use crate::{
        block::RangeKeys,
        mphf::{BbHash, BbHashBuilder},
    };

    const LAYOUT: SlotLayout = SlotLayout {
        order_bits: 8,
        fingerprint_bits: 8,
    };

    fn block(tag: usize) -> Block<BbHash> {
        let keys: Vec<Bytes> = (0..4)
            .map(|i| Bytes::from(format!("{}-{}", tag, i)))
            .collect();
        let range = RangeKeys {
            keys,
            main_count: 4,
            prefix_count: 0,
            has_filler: false,
        };
        Block::build(&BbHashBuilder::default(), LAYOUT, &range).unwrap()
    }

    fn table(n: usize) -> RangeTable<BbHash> {
        let mut table = RangeTable::new(LAYOUT);
        for i in 0..n {
            table.push_pending();
            table.install(i, block(i));
            table.mark_persisted(i);
        }
        table
    }

    #[test]
    fn pending_range_is_not_ready() {
        let mut table: RangeTable<BbHash> = RangeTable::new(LAYOUT);
        table.push_pending();
        assert!(matches!(
            table.ensure_loaded(0),
            Err(BlockHashError::RangeNotReady(0))
        ));
        assert!(matches!(
            table.ensure_loaded(1),
            Err(BlockHashError::OutOfBound { pos: 1, len: 1 })
        ));
    }

    #[test]
    fn failed_range_reports_its_error() {
        let mut table: RangeTable<BbHash> = RangeTable::new(LAYOUT);
        table.push_pending();
        table.fail(0, "duplicate keys".into());
        match table.ensure_loaded(0) {
            Err(BlockHashError::RangeBuildFailed { index, reason }) => {
                assert_eq!(index, 0);
                assert_eq!(&*reason, "duplicate keys");
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn unsaved_range_cannot_be_dropped() {
        let mut table: RangeTable<BbHash> = RangeTable::new(LAYOUT);
        table.push_pending();
        table.install(0, block(0));
        assert!(matches!(
            table.drop_range(0),
            Err(BlockHashError::NotPersisted(0))
        ));
        table.mark_persisted(0);
        assert!(table.drop_range(0).unwrap());
        assert!(!table.drop_range(0).unwrap());
        assert_eq!(table.resident_count(), 0);
        // no source to come back from
        assert!(matches!(
            table.ensure_loaded(0),
            Err(BlockHashError::NoSource(0))
        ));
    }

    #[test]
    fn keeps_most_recently_used() {
        let mut table = table(10);
        for i in [3, 7, 1, 9] {
            table.ensure_loaded(i).unwrap();
        }
        let evicted = table.keep_n_last_ranges(0.2, 0.05);
        assert_eq!(evicted, 8);
        assert_eq!(table.resident_count(), 2);
        assert!(table.is_resident(1));
        assert!(table.is_resident(9));
        assert_eq!(table.last_access(3), None);
    }

    #[test]
    fn tolerance_band_prevents_eviction() {
        let mut table = table(10);
        table.keep_n_last_ranges(0.5, 0.0);
        assert_eq!(table.resident_count(), 5);
        // 5 resident, target 3, allowed 3 + 2 = 5: nothing to do
        assert_eq!(table.keep_n_last_ranges(0.3, 0.2), 0);
        assert_eq!(table.resident_count(), 5);
        assert_eq!(table.keep_n_last_ranges(0.3, 0.1), 2);
        assert_eq!(table.resident_count(), 3);
    }

    #[test]
    fn finished_queue_is_ordered() {
        let mut table: RangeTable<BbHash> = RangeTable::new(LAYOUT);
        for _ in 0..3 {
            table.push_pending();
        }
        table.install(2, block(2));
        table.install(0, block(0));
        table.install(1, block(1));
        assert_eq!(table.pop_finished(), Some(0));
        assert_eq!(table.peek_finished(), Some(1));
        assert_eq!(table.pop_finished(), Some(1));
        assert_eq!(table.pop_finished(), Some(2));
        assert_eq!(table.pop_finished(), None);
    }
}
