//! [`AllocMap`]: per-filesystem free/used bitmap layered over
//! [`crate::usage::VolumeUsage`] (spec.md §4.2).

use crate::error::{Error, Result};
use crate::usage::{Owner, VolumeUsage};

/// Distinguishes why a block was marked used, so conflicting claims can be
/// attributed to "the scanner found two files referencing it" versus "a
/// runtime allocation collided with an existing claim".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkSource {
    /// Marked during the initial directory/catalog scan.
    Scan,
    /// Marked by a live `allocate()`/`mark_used()` call during a mutation.
    Runtime,
}

/// Bitmap of `total_alloc_blocks` bits (0 = free, 1 = used), with bits past
/// `total_alloc_blocks` pre-marked used so `allocate` can never return a
/// padding block.
pub struct AllocMap {
    bits: Vec<bool>,
    total_alloc_blocks: usize,
    next_hint: usize,
    /// Blocks allocated since the last `begin_update`, so `abort_update` can
    /// roll them back.
    pending: Vec<Vec<usize>>,
}

impl AllocMap {
    pub fn new(total_alloc_blocks: usize, bitmap_bits: usize) -> Self {
        let mut bits = vec![false; bitmap_bits.max(total_alloc_blocks)];
        for bit in bits.iter_mut().skip(total_alloc_blocks) {
            *bit = true;
        }
        Self {
            bits,
            total_alloc_blocks,
            next_hint: 0,
            pending: Vec::new(),
        }
    }

    pub fn total_alloc_blocks(&self) -> usize {
        self.total_alloc_blocks
    }

    pub fn free_count(&self) -> usize {
        self.bits[..self.total_alloc_blocks]
            .iter()
            .filter(|b| !**b)
            .count()
    }

    pub fn is_used(&self, n: usize) -> bool {
        self.bits.get(n).copied().unwrap_or(true)
    }

    /// Marks `n` used at scan time and reflects the claim into `usage`,
    /// distinguishing scan-discovered conflicts from runtime ones.
    pub fn mark_by_scan(&mut self, n: usize, owner: Owner, usage: &mut VolumeUsage) {
        self.set_bit(n, true);
        usage.mark_in_use(n);
        usage.mark_natively_used(n);
        usage.set_usage(n, owner);
    }

    pub fn mark_used(&mut self, n: usize, owner: Owner, usage: &mut VolumeUsage) {
        self.set_bit(n, true);
        usage.mark_in_use(n);
        usage.set_usage(n, owner);
    }

    pub fn mark_unused(&mut self, n: usize) {
        self.set_bit(n, false);
    }

    fn set_bit(&mut self, n: usize, used: bool) {
        if let Some(bit) = self.bits.get_mut(n) {
            *bit = used;
        }
    }

    /// Scans from the remembered hint for the first free bit, marks it
    /// used, and returns it. Fails with [`Error::DiskFull`] when no free
    /// bit exists. It is a design error to call this when `ensure_space`
    /// for the pending operation has not already verified room; callers
    /// needing multiple blocks must call `ensure_space` first.
    pub fn allocate(&mut self, owner: Owner, usage: &mut VolumeUsage) -> Result<usize> {
        let len = self.bits.len();
        for offset in 0..len {
            let n = (self.next_hint + offset) % len;
            if !self.bits[n] {
                self.mark_used(n, owner, usage);
                self.next_hint = (n + 1) % len;
                if let Some(batch) = self.pending.last_mut() {
                    batch.push(n);
                }
                return Ok(n);
            }
        }
        Err(Error::DiskFull)
    }

    /// Fails fast with [`Error::DiskFull`] unless at least `count` blocks
    /// are free, before any of them are actually claimed.
    pub fn ensure_space(&self, count: usize) -> Result<()> {
        if self.free_count() >= count {
            Ok(())
        } else {
            Err(Error::DiskFull)
        }
    }

    /// Opens a bracket for a multi-block allocation that might need to be
    /// rolled back (ProDOS-style); pairs with `end_update`/`abort_update`.
    pub fn begin_update(&mut self) {
        self.pending.push(Vec::new());
    }

    pub fn end_update(&mut self) {
        self.pending.pop();
    }

    /// Frees every block allocated since the matching `begin_update`.
    pub fn abort_update(&mut self, usage: &mut VolumeUsage) {
        if let Some(batch) = self.pending.pop() {
            for block in batch {
                self.mark_unused(block);
                usage.mark_in_use(block);
            }
        }
    }

    /// Explicit single-block release (HFS-style, no update bracket).
    pub fn release(&mut self, n: usize) {
        self.mark_unused(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::FileRef;

    #[test]
    fn allocate_finds_first_free_bit() {
        let mut usage = VolumeUsage::new(4);
        let mut map = AllocMap::new(4, 4);
        let owner = Owner::File(FileRef(0));
        let n = map.allocate(owner, &mut usage).unwrap();
        assert_eq!(n, 0);
        assert!(map.is_used(0));
        assert_eq!(map.free_count(), 3);
    }

    #[test]
    fn padding_bits_never_allocated() {
        let mut usage = VolumeUsage::new(3);
        let mut map = AllocMap::new(3, 8); // 5 padding bits
        let owner = Owner::File(FileRef(0));
        for _ in 0..3 {
            map.allocate(owner, &mut usage).unwrap();
        }
        assert!(matches!(map.allocate(owner, &mut usage), Err(Error::DiskFull)));
    }

    #[test]
    fn abort_update_rolls_back() {
        let mut usage = VolumeUsage::new(4);
        let mut map = AllocMap::new(4, 4);
        let owner = Owner::File(FileRef(0));
        map.begin_update();
        map.allocate(owner, &mut usage).unwrap();
        map.allocate(owner, &mut usage).unwrap();
        assert_eq!(map.free_count(), 2);
        map.abort_update(&mut usage);
        assert_eq!(map.free_count(), 4);
    }

    #[test]
    fn ensure_space_fails_before_claiming_anything() {
        let map = AllocMap::new(2, 2);
        assert!(map.ensure_space(3).is_err());
        assert_eq!(map.free_count(), 2);
    }
}
