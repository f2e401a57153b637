//! Per-transaction scratch memory
//!
//! Everything a transaction allocates for itself (statements, read trackers,
//! conflict edges where it is the victim, journal entries, user slots) is
//! charged here. Exhausting the budget is the out-of-memory condition callers
//! see; nothing is charged on a failed reservation.

use crate::{Result, TxnError};

/// Handle to a user allocation inside a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSlot(usize);

#[derive(Debug)]
pub struct Region {
    limit: usize,
    used: usize,
    slots: Vec<Box<[u8]>>,
}

impl Region {
    pub fn new(limit: usize) -> Self {
        Self { limit, used: 0, slots: Vec::new() }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn reserve(&mut self, size: usize, what: &'static str) -> Result<()> {
        match self.used.checked_add(size) {
            Some(total) if total <= self.limit => {
                self.used = total;
                Ok(())
            }
            _ => Err(TxnError::oom(size, what)),
        }
    }

    pub fn release(&mut self, size: usize) {
        self.used = self.used.saturating_sub(size);
    }

    /// Zeroed buffer of `size` bytes living as long as the transaction.
    pub fn alloc(&mut self, size: usize) -> Result<RegionSlot> {
        self.reserve(size, "region")?;
        let mut buf = Vec::new();
        if buf.try_reserve_exact(size).is_err() || self.slots.try_reserve(1).is_err() {
            self.release(size);
            return Err(TxnError::oom(size, "region"));
        }
        buf.resize(size, 0u8);
        self.slots.push(buf.into_boxed_slice());
        Ok(RegionSlot(self.slots.len() - 1))
    }

    pub fn get(&self, slot: RegionSlot) -> Option<&[u8]> {
        self.slots.get(slot.0).map(|b| &b[..])
    }

    pub fn get_mut(&mut self, slot: RegionSlot) -> Option<&mut [u8]> {
        self.slots.get_mut(slot.0).map(|b| &mut b[..])
    }

    /// Drop everything; used when a transaction object is recycled.
    pub fn reset(&mut self, limit: usize) {
        self.limit = limit;
        self.used = 0;
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_within_limit() {
        let mut region = Region::new(100);
        region.reserve(60, "stmt").unwrap();
        region.reserve(40, "stmt").unwrap();
        assert_eq!(region.used(), 100);
        let err = region.reserve(1, "edge").unwrap_err();
        assert_eq!(err, TxnError::oom(1, "edge"));
        assert_eq!(region.used(), 100);
    }

    #[test]
    fn test_alloc_slots() {
        let mut region = Region::new(64);
        let a = region.alloc(16).unwrap();
        let b = region.alloc(16).unwrap();
        region.get_mut(a).unwrap()[0] = 7;
        assert_eq!(region.get(a).unwrap()[0], 7);
        assert_eq!(region.get(b).unwrap(), &[0u8; 16]);
        assert!(region.alloc(64).is_err());
        assert_eq!(region.used(), 32);

        region.reset(64);
        assert_eq!(region.used(), 0);
        assert!(region.get(a).is_none());
    }
}
