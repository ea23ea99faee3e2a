use std::sync::Arc;

use block_hash_common::{BlockHashError, BlockHashResult, Lookup, Value};
use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::{debug, trace};

use crate::{
    block::{Block, RangeKeys, SlotHit},
    config::IndexConfig,
    landmark::Landmarks,
    mphf::{BbHashBuilder, PerfectHashBuilder},
    persist::SaveState,
    pool::WorkerPool,
    ranges::RangeTable,
};

/// Default share of ranges [`BlockHashIndex::keep_n_last_ranges`] keeps.
pub const DEFAULT_KEEP_RATIO: f64 = 0.1;
/// Default slack before [`BlockHashIndex::keep_n_last_ranges`] evicts anything.
pub const DEFAULT_KEEP_TOLERANCE: f64 = 0.1;

/// Key padded into a single-key range so its hash has two members. If the
/// range already holds it, a counter is appended until the key is unused.
const FILLER_KEY: &[u8] = b"\xff\xfe###BLOCK_HASH_FILLER###";

/// A string to integer index over sorted keys, split into ranges that each
/// carry their own minimal perfect hash.
///
/// Keys are committed in ascending byte order, one range at a time with
/// [`BlockHashIndex::add_range`]. The value of a key is
/// `(range << order_bits) + position`, where `position` is the key's slot in
/// its range's hash. Positions are dense within a range, not across ranges.
///
/// Lookups take `&self`; all residency state sits behind one mutex shared
/// with the construction workers.
pub struct BlockHashIndex<B: PerfectHashBuilder = BbHashBuilder> {
    pub(crate) config: IndexConfig,
    builder: Arc<B>,
    pub(crate) landmarks: Landmarks,
    pub(crate) last_key: Option<Bytes>,
    pub(crate) size: u64,
    pub(crate) ranges: Arc<Mutex<RangeTable<B::Hash>>>,
    pool: Option<WorkerPool>,
    pub(crate) save: Option<SaveState>,
    pub(crate) last_saved: Option<usize>,
    pub(crate) last_dropped: Option<usize>,
    pub(crate) sealed: bool,
    pub(crate) section_len: Option<u64>,
}

impl<B: PerfectHashBuilder> std::fmt::Debug for BlockHashIndex<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockHashIndex")
            .field("config", &self.config)
            .field("ranges", &self.landmarks.len())
            .field("size", &self.size)
            .field("resident", &self.resident_count())
            .field("sealed", &self.sealed)
            .finish()
    }
}

impl BlockHashIndex<BbHashBuilder> {
    pub fn new(config: IndexConfig) -> BlockHashResult<Self> {
        Self::with_builder(config, BbHashBuilder::default())
    }
}

impl<B: PerfectHashBuilder> BlockHashIndex<B> {
    pub fn with_builder(config: IndexConfig, builder: B) -> BlockHashResult<Self> {
        config.validate()?;
        let pool = match config.worker_count {
            0 => None,
            n => Some(WorkerPool::new(n)?),
        };
        let layout = config.layout();
        Ok(Self {
            config,
            builder: Arc::new(builder),
            landmarks: Landmarks::new(),
            last_key: None,
            size: 0,
            ranges: Arc::new(Mutex::new(RangeTable::new(layout))),
            pool,
            save: None,
            last_saved: None,
            last_dropped: None,
            sealed: false,
            section_len: None,
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Number of main keys committed (or loaded).
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn range_count(&self) -> usize {
        self.landmarks.len()
    }

    pub fn landmarks(&self) -> &Landmarks {
        &self.landmarks
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Byte length of the section written by the last save or read by the
    /// last load.
    pub fn section_len(&self) -> Option<u64> {
        self.section_len
    }

    /// The range that would hold `key`, if any.
    pub fn route(&self, key: impl AsRef<[u8]>) -> Option<usize> {
        self.landmarks.route(key.as_ref())
    }

    /// Commit one range of sorted, distinct main keys.
    pub fn add_range<K: AsRef<[u8]>>(&mut self, keys: &[K]) -> BlockHashResult<()> {
        self.add_range_with_prefixes(keys, &[] as &[K])
    }

    /// Commit one range together with its prefix keys.
    ///
    /// Prefix keys get slots in the range's hash but resolve to
    /// [`Lookup::PrefixOnly`]. A prefix key equal to a main key is ignored.
    /// The range's landmark is the smaller of the first main key and the
    /// first prefix key.
    ///
    /// With a worker pool, the hash is built in the background and the range
    /// answers [`BlockHashError::RangeNotReady`] until it completes. If that
    /// build fails, [`BlockHashIndex::wait_all`] reports the error once and the
    /// range answers [`BlockHashError::RangeBuildFailed`] from then on.
    pub fn add_range_with_prefixes<K, P>(
        &mut self,
        keys: &[K],
        prefix_keys: &[P],
    ) -> BlockHashResult<()>
    where
        K: AsRef<[u8]>,
        P: AsRef<[u8]>,
    {
        if self.sealed {
            return Err(BlockHashError::Sealed);
        }
        let Some(first) = keys.first().map(|k| k.as_ref()) else {
            return Err(BlockHashError::InvalidArgument(
                "a range needs at least one key".into(),
            ));
        };
        let landmark = match prefix_keys.first().map(|p| p.as_ref()) {
            Some(prefix) if prefix < first => prefix,
            _ => first,
        };
        if self.config.check_sort_order {
            self.check_order(keys, prefix_keys, landmark)?;
        }

        let index = self.landmarks.len();
        let layout = self.config.layout();
        let range = collect_range(keys, prefix_keys);
        if range.slot_count() > layout.capacity() {
            return Err(BlockHashError::BlockOverflow {
                index,
                slots: range.slot_count(),
                capacity: layout.capacity(),
            });
        }

        let landmark = Bytes::copy_from_slice(landmark);
        let last_key = keys.last().map(|k| Bytes::copy_from_slice(k.as_ref()));
        if self.pool.is_none() {
            let block = Block::build(self.builder.as_ref(), layout, &range)?;
            self.commit(landmark, last_key, keys.len());
            self.ranges.lock().install(index, block);
        } else {
            // the slot must exist before a worker can install into it
            self.commit(landmark, last_key, keys.len());
            let builder = self.builder.clone();
            let ranges = self.ranges.clone();
            if let Some(pool) = &self.pool {
                pool.submit(move || match Block::build(builder.as_ref(), layout, &range) {
                    Ok(block) => {
                        ranges.lock().install(index, block);
                        Ok(())
                    }
                    Err(e) => {
                        ranges.lock().fail(index, e.to_string().into());
                        Err(e)
                    }
                });
            }
        }
        trace!("range {} committed with {} keys", index, keys.len());
        Ok(())
    }

    fn commit(&mut self, landmark: Bytes, last_key: Option<Bytes>, key_num: usize) {
        self.landmarks.push(landmark);
        self.last_key = last_key;
        self.size += key_num as u64;
        self.ranges.lock().push_pending();
    }

    fn check_order<K, P>(&self, keys: &[K], prefix_keys: &[P], landmark: &[u8]) -> BlockHashResult<()>
    where
        K: AsRef<[u8]>,
        P: AsRef<[u8]>,
    {
        if let Some(previous) = self.landmarks.last() {
            if previous.as_ref() >= landmark {
                return Err(BlockHashError::out_of_order(previous, landmark));
            }
        }
        // landmark <= first key, so this also orders the first key
        if let Some(previous) = &self.last_key {
            if previous.as_ref() >= landmark {
                return Err(BlockHashError::out_of_order(previous, landmark));
            }
        }
        for pair in keys.windows(2) {
            let (a, b) = (pair[0].as_ref(), pair[1].as_ref());
            if a >= b {
                return Err(BlockHashError::out_of_order(a, b));
            }
        }
        for pair in prefix_keys.windows(2) {
            let (a, b) = (pair[0].as_ref(), pair[1].as_ref());
            if a > b {
                return Err(BlockHashError::out_of_order(a, b));
            }
        }
        Ok(())
    }

    /// Block until every range handed to the workers has been built.
    ///
    /// Returns the first construction failure, if any.
    pub fn wait_all(&self) -> BlockHashResult<()> {
        match &self.pool {
            Some(pool) => pool.wait_all(),
            None => Ok(()),
        }
    }

    /// Ranges still being built in the background.
    pub fn pending_ranges(&self) -> usize {
        self.pool.as_ref().map_or(0, |pool| pool.pending())
    }

    pub fn lookup(&self, key: impl AsRef<[u8]>) -> BlockHashResult<Lookup> {
        let key = key.as_ref();
        let Some(index) = self.landmarks.route(key) else {
            return Ok(Lookup::NotFound);
        };
        let hit = self.ranges.lock().lookup(index, key)?;
        Ok(match hit {
            SlotHit::Main(position) => {
                Lookup::Found(((index as Value) << self.config.order_bits) + position)
            }
            SlotHit::Prefix => Lookup::PrefixOnly,
            SlotHit::Miss => Lookup::NotFound,
        })
    }

    /// [`BlockHashIndex::lookup`] in raw form, with
    /// [`NOT_FOUND_VALUE`](crate::NOT_FOUND_VALUE) and
    /// [`PREFIX_VALUE`](crate::PREFIX_VALUE) as sentinels.
    pub fn get(&self, key: impl AsRef<[u8]>) -> BlockHashResult<Value> {
        self.lookup(key).map(Lookup::into_raw)
    }

    /// Split a found value into its range and position.
    pub fn split_value(&self, value: Value) -> (usize, u64) {
        let order_bits = self.config.order_bits as u32;
        ((value >> order_bits) as usize, value & ((1 << order_bits) - 1))
    }

    pub fn is_resident(&self, index: usize) -> bool {
        self.ranges.lock().is_resident(index)
    }

    pub fn resident_count(&self) -> usize {
        self.ranges.lock().resident_count()
    }

    /// Heap bytes held by resident ranges.
    pub fn resident_heap_size(&self) -> usize {
        self.ranges.lock().resident_heap_size()
    }

    /// Logical time of the last access to range `index`, `None` when it is
    /// not resident.
    pub fn last_access(&self, index: usize) -> Option<u64> {
        self.ranges.lock().last_access(index)
    }

    /// Make range `index` resident.
    pub fn load_range(&self, index: usize) -> BlockHashResult<()> {
        self.ranges.lock().ensure_loaded(index).map(|_| ())
    }

    /// Release range `index` from memory. Returns whether it was resident.
    ///
    /// Fails with [`BlockHashError::NotPersisted`] if the range was never
    /// saved, since it could not be reloaded.
    pub fn drop_range(&self, index: usize) -> BlockHashResult<bool> {
        self.ranges.lock().drop_range(index)
    }

    /// Release the most recently committed range.
    pub fn drop_last(&self) -> BlockHashResult<bool> {
        match self.range_count().checked_sub(1) {
            Some(index) => self.drop_range(index),
            None => Ok(false),
        }
    }

    /// Release every range saved since the previous call.
    ///
    /// Pairs with [`BlockHashIndex::save_last_range`] to keep the memory of a
    /// streaming build bounded. Returns how many ranges were visited.
    pub fn drop_last_range(&mut self) -> BlockHashResult<usize> {
        let mut dropped = 0;
        while self.last_dropped != self.last_saved {
            let next = self.last_dropped.map_or(0, |i| i + 1);
            self.drop_range(next)?;
            self.last_dropped = Some(next);
            dropped += 1;
        }
        if dropped > 0 {
            debug!("dropped {} saved ranges", dropped);
        }
        Ok(dropped)
    }

    /// Evict least recently used ranges until about `ratio` of them stay
    /// resident. See [`DEFAULT_KEEP_RATIO`] and [`DEFAULT_KEEP_TOLERANCE`].
    ///
    /// Only persisted ranges are evicted. Returns how many were released.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn keep_n_last_ranges(&self, ratio: f64, tolerance: f64) -> usize {
        self.ranges.lock().keep_n_last_ranges(ratio, tolerance)
    }
}

/// Lay out a range's hash members: main keys, then new prefix keys, then a
/// filler if there is only one main key.
fn collect_range<K, P>(keys: &[K], prefix_keys: &[P]) -> RangeKeys
where
    K: AsRef<[u8]>,
    P: AsRef<[u8]>,
{
    let mut seen: FxHashSet<&[u8]> = keys.iter().map(|k| k.as_ref()).collect();
    let mut members: Vec<Bytes> = keys
        .iter()
        .map(|k| Bytes::copy_from_slice(k.as_ref()))
        .collect();
    let mut prefix_count = 0;
    for prefix in prefix_keys {
        let prefix = prefix.as_ref();
        if seen.insert(prefix) {
            members.push(Bytes::copy_from_slice(prefix));
            prefix_count += 1;
        }
    }
    let has_filler = keys.len() == 1;
    if has_filler {
        members.push(pick_filler(&seen));
    }
    RangeKeys {
        keys: members,
        main_count: keys.len(),
        prefix_count,
        has_filler,
    }
}

fn pick_filler(taken: &FxHashSet<&[u8]>) -> Bytes {
    if !taken.contains(FILLER_KEY) {
        return Bytes::from_static(FILLER_KEY);
    }
    let mut counter: u32 = 0;
    loop {
        let mut candidate = FILLER_KEY.to_vec();
        candidate.extend_from_slice(&counter.to_le_bytes());
        if !taken.contains(candidate.as_slice()) {
            return Bytes::from(candidate);
        }
        counter += 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn index(config: IndexConfig) -> BlockHashIndex {
        BlockHashIndex::new(config).unwrap()
    }

    #[test]
    fn values_are_range_shifted_positions() {
        let mut index = index(IndexConfig::new().order_bits(4));
        index.add_range(&["a", "b", "c"]).unwrap();
        index.add_range(&["d", "e"]).unwrap();
        let mut seen = Vec::new();
        for key in ["a", "b", "c", "d", "e"] {
            let value = index.get(key).unwrap();
            let (range, position) = index.split_value(value);
            assert_eq!(range, if key < "d" { 0 } else { 1 });
            assert!(position < 3);
            seen.push(value);
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 5);
        assert_eq!(index.size(), 5);
    }

    #[test]
    fn keys_before_first_landmark_are_absent() {
        let mut index = index(IndexConfig::default());
        index.add_range(&["m", "n"]).unwrap();
        assert_eq!(index.lookup("a").unwrap(), Lookup::NotFound);
        assert_eq!(index.get("").unwrap(), crate::NOT_FOUND_VALUE);
    }

    #[test]
    fn empty_range_is_rejected() {
        let mut index = index(IndexConfig::default());
        let keys: [&str; 0] = [];
        assert!(matches!(
            index.add_range(&keys),
            Err(BlockHashError::InvalidArgument(_))
        ));
        assert_eq!(index.range_count(), 0);
    }

    #[test]
    fn overflow_is_rejected() {
        let mut index = index(IndexConfig::new().order_bits(2));
        assert!(matches!(
            index.add_range(&["a", "b", "c", "d", "e"]),
            Err(BlockHashError::BlockOverflow {
                index: 0,
                slots: 5,
                capacity: 4
            })
        ));
        index.add_range(&["a", "b", "c", "d"]).unwrap();
        // one key plus the filler
        index.add_range(&["e"]).unwrap();
    }

    #[test]
    fn unsorted_keys_inside_a_range() {
        let mut index = index(IndexConfig::default());
        assert!(matches!(
            index.add_range(&["b", "a"]),
            Err(BlockHashError::OutOfOrderInput { .. })
        ));
        assert!(matches!(
            index.add_range(&["a", "a"]),
            Err(BlockHashError::OutOfOrderInput { .. })
        ));
    }

    #[test]
    fn prefix_keys_are_deduplicated() {
        let range = collect_range(&["ab", "ac"], &["a", "ab"]);
        assert_eq!(range.main_count, 2);
        assert_eq!(range.prefix_count, 1);
        assert!(!range.has_filler);
        assert_eq!(range.slot_count(), 3);
    }

    fn filler_with_counter(counter: u32) -> Vec<u8> {
        let mut key = FILLER_KEY.to_vec();
        key.extend_from_slice(&counter.to_le_bytes());
        key
    }

    #[test]
    fn filler_avoids_committed_keys() {
        let range = collect_range(&[FILLER_KEY], &[] as &[&[u8]]);
        assert!(range.has_filler);
        assert_eq!(range.keys[1].as_ref(), filler_with_counter(0).as_slice());

        let taken = filler_with_counter(0);
        let range = collect_range(&[FILLER_KEY], &[taken.as_slice()]);
        assert_eq!(range.prefix_count, 1);
        assert_eq!(range.keys[2].as_ref(), filler_with_counter(1).as_slice());
    }

    #[test]
    fn single_filler_key_is_found() {
        let mut index = index(IndexConfig::default());
        index.add_range(&[FILLER_KEY]).unwrap();
        assert!(index.lookup(FILLER_KEY).unwrap().is_found());
        assert_eq!(
            index.lookup(filler_with_counter(0)).unwrap(),
            Lookup::NotFound
        );
    }

    #[test]
    fn every_filler_candidate_taken_by_the_range() {
        let mut index = index(IndexConfig::default());
        let first = filler_with_counter(0);
        let second = filler_with_counter(1);
        index
            .add_range_with_prefixes(&[FILLER_KEY], &[first.as_slice(), second.as_slice()])
            .unwrap();
        assert_eq!(index.lookup(FILLER_KEY).unwrap(), Lookup::Found(0));
        assert_eq!(index.lookup(&first).unwrap(), Lookup::PrefixOnly);
        assert_eq!(index.lookup(&second).unwrap(), Lookup::PrefixOnly);
        assert_eq!(
            index.lookup(filler_with_counter(2)).unwrap(),
            Lookup::NotFound
        );
    }

    #[test]
    fn failed_background_build_is_reported_per_range() {
        let mut index = index(IndexConfig::new().check_sort_order(false).worker_count(1));
        index.add_range(&["a", "b"]).unwrap();
        // duplicates cannot be perfectly hashed
        index.add_range(&["c", "c"]).unwrap();
        assert!(matches!(
            index.wait_all(),
            Err(BlockHashError::HashConstruction(_))
        ));
        assert!(index.lookup("a").unwrap().is_found());
        assert!(matches!(
            index.lookup("c"),
            Err(BlockHashError::RangeBuildFailed { index: 1, .. })
        ));
        let mut buf = std::io::Cursor::new(Vec::new());
        index.begin_save(&mut buf).unwrap();
        assert!(matches!(
            index.save_range(&mut buf, 1),
            Err(BlockHashError::RangeBuildFailed { index: 1, .. })
        ));
    }

    #[test]
    fn many_small_ranges_with_workers() {
        for round in 0..20 {
            let mut index = index(IndexConfig::new().worker_count(8));
            let keys: Vec<String> = (0..500).map(|i| format!("{:03}-{:05}", round, i)).collect();
            for key in &keys {
                index.add_range(&[key]).unwrap();
            }
            index.wait_all().unwrap();
            assert_eq!(index.pending_ranges(), 0);
            assert_eq!(index.resident_count(), keys.len());
            for (i, key) in keys.iter().enumerate() {
                assert_eq!(
                    index.lookup(key).unwrap(),
                    Lookup::Found((i as u64) << index.config().get_order_bits())
                );
            }
        }
    }
}
