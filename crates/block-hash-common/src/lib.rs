mod error;

pub use error::{BlockHashError, BlockHashResult};

/// The integer a key resolves to.
pub type Value = u64;

/// Returned by raw lookups when the key is not in the index.
pub const NOT_FOUND_VALUE: Value = Value::MAX;

/// Returned by raw lookups when the key only exists as a prefix key.
pub const PREFIX_VALUE: Value = Value::MAX - 1;

/// The outcome of a lookup.
///
/// Neither `NotFound` nor `PrefixOnly` is an error: they are the normal answers
/// for keys that were never committed as main keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lookup {
    Found(Value),
    PrefixOnly,
    NotFound,
}

impl Lookup {
    /// Convert to the raw integer form, using the reserved sentinels.
    pub fn into_raw(self) -> Value {
        match self {
            Lookup::Found(v) => v,
            Lookup::PrefixOnly => PREFIX_VALUE,
            Lookup::NotFound => NOT_FOUND_VALUE,
        }
    }

    pub fn from_raw(value: Value) -> Self {
        match value {
            NOT_FOUND_VALUE => Lookup::NotFound,
            PREFIX_VALUE => Lookup::PrefixOnly,
            v => Lookup::Found(v),
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn value(&self) -> Option<Value> {
        match self {
            Lookup::Found(v) => Some(*v),
            _ => None,
        }
    }
}
