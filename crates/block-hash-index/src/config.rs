use block_hash_common::{BlockHashError, BlockHashResult};

use crate::block::SlotLayout;

pub const MAX_ORDER_BITS: u8 = 32;
pub const MAX_FINGERPRINT_BITS: u8 = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    pub(crate) order_bits: u8,
    pub(crate) fingerprint_bits: u8,
    pub(crate) check_sort_order: bool,
    pub(crate) worker_count: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            order_bits: 10,
            fingerprint_bits: 16,
            check_sort_order: true,
            worker_count: 0,
        }
    }
}

impl IndexConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// log2 of the largest number of slots one range may hold.
    pub fn order_bits(mut self, order_bits: u8) -> Self {
        self.order_bits = order_bits;
        self
    }

    /// Width of the per-slot fingerprint. Absent keys are reported as present
    /// with probability about `2^-fingerprint_bits`; zero disables rejection.
    pub fn fingerprint_bits(mut self, fingerprint_bits: u8) -> Self {
        self.fingerprint_bits = fingerprint_bits;
        self
    }

    pub fn check_sort_order(mut self, check_sort_order: bool) -> Self {
        self.check_sort_order = check_sort_order;
        self
    }

    /// Threads building range hashes. Zero builds on the caller's thread.
    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn get_order_bits(&self) -> u8 {
        self.order_bits
    }

    pub fn get_fingerprint_bits(&self) -> u8 {
        self.fingerprint_bits
    }

    pub fn get_check_sort_order(&self) -> bool {
        self.check_sort_order
    }

    pub fn get_worker_count(&self) -> usize {
        self.worker_count
    }

    pub(crate) fn validate(&self) -> BlockHashResult<()> {
        if self.order_bits == 0 || self.order_bits > MAX_ORDER_BITS {
            return Err(BlockHashError::InvalidConfig(
                format!(
                    "order bits must be within 1..={}, got {}",
                    MAX_ORDER_BITS, self.order_bits
                )
                .into(),
            ));
        }
        if self.fingerprint_bits > MAX_FINGERPRINT_BITS {
            return Err(BlockHashError::InvalidConfig(
                format!(
                    "fingerprint bits must be within 0..={}, got {}",
                    MAX_FINGERPRINT_BITS, self.fingerprint_bits
                )
                .into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn layout(&self) -> SlotLayout {
        SlotLayout {
            order_bits: self.order_bits as u32,
            fingerprint_bits: self.fingerprint_bits as u32,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn validate_bounds() {
        assert!(IndexConfig::default().validate().is_ok());
        assert!(IndexConfig::new().order_bits(0).validate().is_err());
        assert!(IndexConfig::new().order_bits(33).validate().is_err());
        assert!(IndexConfig::new().fingerprint_bits(0).validate().is_ok());
        assert!(IndexConfig::new().fingerprint_bits(40).validate().is_err());
    }
}
