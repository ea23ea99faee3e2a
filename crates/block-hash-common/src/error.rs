use thiserror::Error;

pub type BlockHashResult<T> = Result<T, BlockHashError>;

#[derive(Error, Debug)]
pub enum BlockHashError {
    #[error("Input does not appear to be sorted with LC_ALL=C sort: {previous:?} >= {next:?}")]
    OutOfOrderInput { previous: Box<str>, next: Box<str> },
    #[error("IO error ({0})")]
    Io(#[from] std::io::Error),
    #[error("Decode error ({0})")]
    Decode(Box<str>),
    #[error("Checksum mismatch. The data is corrupted.")]
    ChecksumMismatch,
    #[error("Invalid config ({0})")]
    InvalidConfig(Box<str>),
    #[error("Invalid argument ({0})")]
    InvalidArgument(Box<str>),
    #[error("Range {index} has {slots} slots but the order bits only allow {capacity}")]
    BlockOverflow {
        index: usize,
        slots: usize,
        capacity: usize,
    },
    #[error("Failed to build the perfect hash ({0})")]
    HashConstruction(Box<str>),
    #[error("Index out of bound. The given range is {pos}, but the length is {len}")]
    OutOfBound { pos: usize, len: usize },
    #[error("Range {0} is still being built")]
    RangeNotReady(usize),
    #[error("Range {index} failed to build ({reason})")]
    RangeBuildFailed { index: usize, reason: Box<str> },
    #[error("Range {0} has no persisted copy, dropping it would lose it")]
    NotPersisted(usize),
    #[error("Range {0} is not resident and there is no attached source to reload it from")]
    NoSource(usize),
    #[error("Cannot append ranges once the index is sealed by a save or a load")]
    Sealed,
    #[error("No save is in progress. Call begin_save first")]
    NoSaveInProgress,
    #[error("Worker pool error ({0})")]
    WorkerPool(Box<str>),
}

impl BlockHashError {
    pub(crate) fn key_repr(key: &[u8]) -> Box<str> {
        String::from_utf8_lossy(key).into()
    }

    pub fn out_of_order(previous: &[u8], next: &[u8]) -> Self {
        BlockHashError::OutOfOrderInput {
            previous: Self::key_repr(previous),
            next: Self::key_repr(next),
        }
    }
}
