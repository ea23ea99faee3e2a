use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::Path,
};

use block_hash_common::{BlockHashError, BlockHashResult};
use bytes::{BufMut, Bytes};
use tracing::{debug, instrument, warn};

use crate::{
    config::IndexConfig,
    index::BlockHashIndex,
    landmark::Landmarks,
    mphf::PerfectHashBuilder,
    ranges::{SeekEntry, Source},
    utils::{get_slice, get_u32_le, get_u64_le, get_u8_le, verify_checksum},
    XXH_SEED,
};

const MAGIC_BYTES: [u8; 4] = *b"BHIX";
const CURRENT_SCHEMA_VERSION: u8 = 0;
/// magic + version + order bits + fingerprint bits + index offset + index len
pub(crate) const HEADER_LEN: usize = 4 + 1 + 1 + 1 + 8 + 8;
const INDEX_POINTER_POS: u64 = 7;
/// Smallest possible encoded range body, used to bound the range count.
const MIN_BODY_LEN: u64 = 4 + 4 + 1 + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    order_bits: u8,
    fingerprint_bits: u8,
    index_offset: u64,
    index_len: u64,
}

impl Header {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u8(CURRENT_SCHEMA_VERSION);
        buf.put_u8(self.order_bits);
        buf.put_u8(self.fingerprint_bits);
        buf.put_u64_le(self.index_offset);
        buf.put_u64_le(self.index_len);
    }

    fn decode(bytes: &[u8]) -> BlockHashResult<Self> {
        let (magic, bytes) = get_slice(bytes, MAGIC_BYTES.len())?;
        if magic != MAGIC_BYTES {
            return Err(BlockHashError::Decode("Invalid magic number".into()));
        }
        let (schema_version, bytes) = get_u8_le(bytes)?;
        if schema_version != CURRENT_SCHEMA_VERSION {
            return Err(BlockHashError::Decode(
                format!(
                    "Invalid schema version {}, current version {}",
                    schema_version, CURRENT_SCHEMA_VERSION
                )
                .into(),
            ));
        }
        let (order_bits, bytes) = get_u8_le(bytes)?;
        let (fingerprint_bits, bytes) = get_u8_le(bytes)?;
        let (index_offset, bytes) = get_u64_le(bytes)?;
        let (index_len, _) = get_u64_le(bytes)?;
        Ok(Self {
            order_bits,
            fingerprint_bits,
            index_offset,
            index_len,
        })
    }
}

/// ┌──────────────────────────────────────────────────────────────────────────────────────────┐
/// │ Range Index                                                                              │
/// │┌ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ─ ─ ┬ ─ ─ ─ ─ ┐ │
/// │  range num    landmark len     landmark    body offset   body len   ...  size     checksum  │
/// ││    u32    │      u32       │   bytes    │     u64     │    u64    │     u64     │   u32   │ │
/// │ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ┘ │
/// └──────────────────────────────────────────────────────────────────────────────────────────┘
fn encode_index(landmarks: &Landmarks, entries: &[SeekEntry], size: u64, buf: &mut Vec<u8>) {
    let start = buf.len();
    buf.put_u32_le(entries.len() as u32);
    for (landmark, entry) in landmarks.iter().zip(entries) {
        buf.put_u32_le(landmark.len() as u32);
        buf.put_slice(landmark);
        buf.put_u64_le(entry.offset);
        buf.put_u64_le(entry.len);
    }
    buf.put_u64_le(size);
    let checksum = xxhash_rust::xxh32::xxh32(&buf[start..], XXH_SEED);
    buf.put_u32_le(checksum);
}

fn decode_index(raw: &[u8], index_offset: u64) -> BlockHashResult<(Landmarks, Vec<SeekEntry>, u64)> {
    let bytes = verify_checksum(raw, XXH_SEED)?;
    let (num, mut bytes) = get_u32_le(bytes)?;
    if num as u64 > index_offset / MIN_BODY_LEN {
        return Err(BlockHashError::Decode(
            format!("Range index claims {} ranges", num).into(),
        ));
    }
    let mut landmarks = Vec::with_capacity(num as usize);
    let mut entries = Vec::with_capacity(num as usize);
    for _ in 0..num {
        let (len, rest) = get_u32_le(bytes)?;
        let (landmark, rest) = get_slice(rest, len as usize)?;
        let (offset, rest) = get_u64_le(rest)?;
        let (body_len, rest) = get_u64_le(rest)?;
        bytes = rest;
        if offset < HEADER_LEN as u64 || offset.saturating_add(body_len) > index_offset {
            return Err(BlockHashError::Decode(
                format!(
                    "Range body at {}..+{} lies outside the body region",
                    offset, body_len
                )
                .into(),
            ));
        }
        landmarks.push(Bytes::copy_from_slice(landmark));
        entries.push(SeekEntry {
            offset,
            len: body_len,
        });
    }
    let (size, rest) = get_u64_le(bytes)?;
    if !rest.is_empty() {
        return Err(BlockHashError::Decode("Trailing bytes in range index".into()));
    }
    Ok((Landmarks::from_keys(landmarks), entries, size))
}

/// Where the ranges of an in-progress save went.
#[derive(Debug)]
pub(crate) struct SaveState {
    start: u64,
    entries: Vec<Option<SeekEntry>>,
}

impl SaveState {
    fn is_saved(&self, index: usize) -> bool {
        matches!(self.entries.get(index), Some(Some(_)))
    }

    fn record(&mut self, index: usize, entry: SeekEntry) {
        if self.entries.len() <= index {
            self.entries.resize(index + 1, None);
        }
        self.entries[index] = Some(entry);
    }
}

impl<B: PerfectHashBuilder> BlockHashIndex<B> {
    /// Start writing a section at the writer's current position.
    ///
    /// Writes a placeholder header; [`BlockHashIndex::finalize_save`] patches
    /// it once the range index has been appended.
    pub fn begin_save<W: Write + Seek>(&mut self, writer: &mut W) -> BlockHashResult<()> {
        let start = writer.stream_position()?;
        let header = Header {
            order_bits: self.config.order_bits,
            fingerprint_bits: self.config.fingerprint_bits,
            index_offset: 0,
            index_len: 0,
        };
        let mut buf = Vec::with_capacity(HEADER_LEN);
        header.encode(&mut buf);
        writer.write_all(&buf)?;
        self.save = Some(SaveState {
            start,
            entries: Vec::new(),
        });
        self.last_saved = None;
        self.last_dropped = None;
        debug!("save started at {}", start);
        Ok(())
    }

    /// Append range `index` to the section being written.
    ///
    /// A range that is not resident is loaded for the write and released
    /// again afterwards.
    pub fn save_range<W: Write + Seek>(&mut self, writer: &mut W, index: usize) -> BlockHashResult<()> {
        let Some(save) = self.save.as_mut() else {
            return Err(BlockHashError::NoSaveInProgress);
        };
        let mut buf = Vec::new();
        let was_resident = {
            let mut ranges = self.ranges.lock();
            let was_resident = ranges.is_resident(index);
            ranges.ensure_loaded(index)?.encode(&mut buf);
            was_resident
        };
        let offset = writer.stream_position()? - save.start;
        writer.write_all(&buf)?;
        save.record(
            index,
            SeekEntry {
                offset,
                len: buf.len() as u64,
            },
        );
        let mut ranges = self.ranges.lock();
        ranges.mark_persisted(index);
        if !was_resident {
            ranges.drop_range(index)?;
        }
        Ok(())
    }

    /// Save every finished range that directly follows the last saved one.
    ///
    /// Ranges finish out of order when built by workers; this only writes the
    /// contiguous prefix that is ready. Returns how many ranges were written.
    pub fn save_last_range<W: Write + Seek>(&mut self, writer: &mut W) -> BlockHashResult<usize> {
        let mut saved = 0;
        loop {
            let next = self.last_saved.map_or(0, |i| i + 1);
            let Some(save) = self.save.as_ref() else {
                return Err(BlockHashError::NoSaveInProgress);
            };
            if save.is_saved(next) {
                self.last_saved = Some(next);
                continue;
            }
            let top = self.ranges.lock().peek_finished();
            match top {
                Some(top) if top < next => {
                    self.ranges.lock().pop_finished();
                }
                Some(top) if top == next => {
                    self.ranges.lock().pop_finished();
                    self.save_range(writer, next)?;
                    self.last_saved = Some(next);
                    saved += 1;
                }
                _ => break,
            }
        }
        Ok(saved)
    }

    /// Wait for construction, write whatever is still unsaved and append the
    /// range index. Returns the byte length of the whole section.
    ///
    /// The index is sealed afterwards.
    #[instrument(level = "debug", skip_all)]
    pub fn finalize_save<W: Write + Seek>(&mut self, writer: &mut W) -> BlockHashResult<u64> {
        if self.save.is_none() {
            return Err(BlockHashError::NoSaveInProgress);
        }
        self.wait_all()?;
        self.save_last_range(writer)?;
        let range_num = self.range_count();
        for index in 0..range_num {
            let saved = self.save.as_ref().map_or(false, |save| save.is_saved(index));
            if !saved {
                self.save_range(writer, index)?;
            }
        }

        let Some(save) = self.save.take() else {
            return Err(BlockHashError::NoSaveInProgress);
        };
        let mut entries = Vec::with_capacity(range_num);
        for index in 0..range_num {
            match save.entries.get(index).copied().flatten() {
                Some(entry) => entries.push(entry),
                None => return Err(BlockHashError::NotPersisted(index)),
            }
        }
        let index_offset = writer.stream_position()? - save.start;
        let mut buf = Vec::new();
        encode_index(&self.landmarks, &entries, self.size, &mut buf);
        writer.write_all(&buf)?;
        let end = writer.stream_position()?;

        writer.seek(SeekFrom::Start(save.start + INDEX_POINTER_POS))?;
        writer.write_all(&index_offset.to_le_bytes())?;
        writer.write_all(&(buf.len() as u64).to_le_bytes())?;
        writer.seek(SeekFrom::Start(end))?;
        writer.flush()?;

        let section_len = end - save.start;
        self.last_saved = range_num.checked_sub(1);
        self.sealed = true;
        self.section_len = Some(section_len);
        debug!(
            "saved {} ranges with {} keys in {} bytes",
            range_num, self.size, section_len
        );
        Ok(section_len)
    }

    /// Write the whole index in one go. Returns the section's byte length.
    pub fn save<W: Write + Seek>(&mut self, writer: &mut W) -> BlockHashResult<u64> {
        self.begin_save(writer)?;
        self.finalize_save(writer)
    }

    pub fn save_to_path(&mut self, path: impl AsRef<Path>) -> BlockHashResult<u64> {
        let mut writer = BufWriter::new(File::create(path)?);
        let len = self.save(&mut writer)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(len)
    }

    /// Read the header and range index of a section at the reader's current
    /// position. No range body is read until a lookup needs it.
    ///
    /// The reader is kept for lazy loading. The order and fingerprint widths
    /// stored in the section replace the configured ones. Returns the number
    /// of keys in the section.
    #[instrument(level = "debug", skip_all)]
    pub fn load_index<R: Read + Seek + Send + 'static>(&mut self, mut reader: R) -> BlockHashResult<u64> {
        if self.range_count() > 0 || self.sealed {
            return Err(BlockHashError::InvalidArgument(
                "only an empty index can be loaded into".into(),
            ));
        }
        let start = reader.stream_position()?;
        let mut raw = [0; HEADER_LEN];
        reader.read_exact(&mut raw)?;
        let header = Header::decode(&raw)?;
        if header.index_offset < HEADER_LEN as u64 {
            return Err(BlockHashError::Decode(
                "Section was never finalized".into(),
            ));
        }
        let config = self
            .config
            .clone()
            .order_bits(header.order_bits)
            .fingerprint_bits(header.fingerprint_bits);
        config.validate()?;
        if config != self.config {
            warn!(
                "section uses {} order bits and {} fingerprint bits, configured {} and {}",
                header.order_bits,
                header.fingerprint_bits,
                self.config.order_bits,
                self.config.fingerprint_bits
            );
        }

        reader.seek(SeekFrom::Start(start + header.index_offset))?;
        let mut raw = Vec::new();
        (&mut reader).take(header.index_len).read_to_end(&mut raw)?;
        if raw.len() as u64 != header.index_len {
            return Err(BlockHashError::Decode("Range index is truncated".into()));
        }
        let (landmarks, entries, size) = decode_index(&raw, header.index_offset)?;

        let range_num = entries.len();
        self.ranges.lock().attach_source(
            config.layout(),
            Source::new(Box::new(reader), start, entries),
        );
        self.config = config;
        self.last_key = None;
        self.landmarks = landmarks;
        self.size = size;
        self.sealed = true;
        self.section_len = Some(header.index_offset + header.index_len);
        debug!("loaded index of {} ranges with {} keys", range_num, size);
        Ok(size)
    }

    /// Read the whole section and make every range resident.
    pub fn load<R: Read + Seek + Send + 'static>(&mut self, reader: R) -> BlockHashResult<u64> {
        let size = self.load_index(reader)?;
        for index in 0..self.range_count() {
            self.load_range(index)?;
        }
        Ok(size)
    }

    pub fn load_from_path(&mut self, path: impl AsRef<Path>) -> BlockHashResult<u64> {
        self.load(BufReader::new(File::open(path)?))
    }

    pub fn load_index_from_path(&mut self, path: impl AsRef<Path>) -> BlockHashResult<u64> {
        self.load_index(BufReader::new(File::open(path)?))
    }
}

impl BlockHashIndex {
    /// Open a persisted section with lazily loaded ranges.
    pub fn open(path: impl AsRef<Path>, config: IndexConfig) -> BlockHashResult<Self> {
        let mut index = Self::new(config)?;
        index.load_index_from_path(path)?;
        Ok(index)
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use block_hash_common::Lookup;

    use super::*;

    fn sample() -> BlockHashIndex {
        let mut index = BlockHashIndex::new(IndexConfig::new().order_bits(6)).unwrap();
        index.add_range(&["alpha", "beta", "gamma"]).unwrap();
        index.add_range(&["kappa", "lambda"]).unwrap();
        index.add_range(&["omega"]).unwrap();
        index
    }

    #[test]
    fn header_layout() {
        let header = Header {
            order_bits: 10,
            fingerprint_bits: 16,
            index_offset: 1234,
            index_len: 56,
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(&buf[..4], b"BHIX");
        assert_eq!(
            &buf[INDEX_POINTER_POS as usize..INDEX_POINTER_POS as usize + 8],
            &1234u64.to_le_bytes()
        );
        assert_eq!(Header::decode(&buf).unwrap(), header);
        buf[0] = b'X';
        assert!(Header::decode(&buf).is_err());
    }

    #[test]
    fn lazy_load_from_memory() {
        let mut index = sample();
        let expected: Vec<_> = ["alpha", "beta", "gamma", "kappa", "lambda", "omega"]
            .iter()
            .map(|k| index.get(k).unwrap())
            .collect();
        let mut cursor = Cursor::new(Vec::new());
        let len = index.save(&mut cursor).unwrap();
        assert_eq!(len, cursor.get_ref().len() as u64);
        assert_eq!(index.section_len(), Some(len));

        let bytes = cursor.into_inner();
        let mut loaded = BlockHashIndex::new(IndexConfig::new().order_bits(6)).unwrap();
        assert_eq!(loaded.load_index(Cursor::new(bytes)).unwrap(), 6);
        assert_eq!(loaded.resident_count(), 0);
        assert_eq!(loaded.range_count(), 3);
        for (key, value) in ["alpha", "beta", "gamma", "kappa", "lambda", "omega"]
            .iter()
            .zip(&expected)
        {
            assert_eq!(loaded.get(key).unwrap(), *value);
        }
        assert_eq!(loaded.resident_count(), 3);
        assert_eq!(loaded.lookup("delta").unwrap(), Lookup::NotFound);
        assert!(matches!(
            loaded.add_range(&["zeta"]),
            Err(BlockHashError::Sealed)
        ));
    }

    #[test]
    fn saved_widths_replace_configured_ones() {
        let mut index = sample();
        let mut cursor = Cursor::new(Vec::new());
        index.save(&mut cursor).unwrap();
        let mut loaded = BlockHashIndex::new(IndexConfig::default()).unwrap();
        loaded.load(Cursor::new(cursor.into_inner())).unwrap();
        assert_eq!(loaded.config().get_order_bits(), 6);
        assert_eq!(loaded.split_value(loaded.get("omega").unwrap()).0, 2);
    }

    #[test]
    fn corrupted_index_is_rejected() {
        let mut index = sample();
        let mut cursor = Cursor::new(Vec::new());
        index.save(&mut cursor).unwrap();
        let mut bytes = cursor.into_inner();
        let last = bytes.len() - 6;
        bytes[last] ^= 0xff;
        let mut loaded = BlockHashIndex::new(IndexConfig::default()).unwrap();
        assert!(matches!(
            loaded.load_index(Cursor::new(bytes)),
            Err(BlockHashError::ChecksumMismatch)
        ));
    }

    #[test]
    fn corrupted_body_fails_on_first_touch() {
        let mut index = sample();
        let mut cursor = Cursor::new(Vec::new());
        index.save(&mut cursor).unwrap();
        let mut bytes = cursor.into_inner();
        bytes[HEADER_LEN + 2] ^= 0xff;
        let mut loaded = BlockHashIndex::new(IndexConfig::default()).unwrap();
        loaded.load_index(Cursor::new(bytes)).unwrap();
        assert!(loaded.get("alpha").is_err());
        assert!(loaded.get("kappa").is_ok());
    }

    #[test]
    fn unfinished_section_is_rejected() {
        let mut index = sample();
        let mut cursor = Cursor::new(Vec::new());
        index.begin_save(&mut cursor).unwrap();
        index.save_last_range(&mut cursor).unwrap();
        let mut loaded = BlockHashIndex::new(IndexConfig::default()).unwrap();
        assert!(matches!(
            loaded.load_index(Cursor::new(cursor.into_inner())),
            Err(BlockHashError::Decode(_))
        ));
    }

    #[test]
    fn unchecked_build_round_trips() {
        let config = IndexConfig::new().order_bits(6).check_sort_order(false);
        let mut index = BlockHashIndex::new(config.clone()).unwrap();
        index.add_range(&["a", "b"]).unwrap();
        index.add_range(&["a", "c"]).unwrap();
        index.add_range(&["0"]).unwrap();
        let mut cursor = Cursor::new(Vec::new());
        index.save(&mut cursor).unwrap();

        let mut loaded = BlockHashIndex::new(config).unwrap();
        assert_eq!(loaded.load_index(Cursor::new(cursor.into_inner())).unwrap(), 5);
        assert_eq!(loaded.range_count(), 3);
        assert_eq!(loaded.landmarks().get(2).unwrap().as_ref(), b"0");
        for i in 0..loaded.range_count() {
            loaded.load_range(i).unwrap();
        }
        assert_eq!(loaded.resident_count(), 3);
        // routing is unspecified for such input, but lookups still answer
        for key in ["a", "b", "c", "0", "zz"] {
            loaded.lookup(key).unwrap();
        }
    }

    #[test]
    fn save_needs_begin() {
        let mut index = sample();
        let mut cursor = Cursor::new(Vec::new());
        assert!(matches!(
            index.save_range(&mut cursor, 0),
            Err(BlockHashError::NoSaveInProgress)
        ));
        assert!(matches!(
            index.finalize_save(&mut cursor),
            Err(BlockHashError::NoSaveInProgress)
        ));
    }
}
