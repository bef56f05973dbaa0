//! Bitmap-backed IPv4 address allocator
//!
//! One bit per address in an inclusive range. The allocator itself is not
//! synchronized; [`crate::lease::LeasePool`] owns it behind a mutex.

use crate::error::LeaseError;
use std::net::Ipv4Addr;

const WORD_BITS: u32 = u64::BITS;

/// Tracks which addresses of `first..=last` are taken
#[derive(Debug, Clone)]
pub struct BitmapAllocator {
    first: u32,
    size: u32,
    words: Vec<u64>,
    free: u32,
    /// Next slot to probe, so freed addresses are not immediately reused
    /// while untouched ones remain.
    cursor: u32,
}

impl BitmapAllocator {
    /// Create an allocator covering `first..=last`
    pub fn new(first: Ipv4Addr, last: Ipv4Addr) -> Result<Self, LeaseError> {
        let (lo, hi) = (u32::from(first), u32::from(last));
        if lo > hi {
            return Err(LeaseError::InvalidRange { first, last });
        }

        // A full /0 does not fit in u32 slots; nobody leases that.
        let size = (hi - lo).checked_add(1).ok_or(LeaseError::InvalidRange { first, last })?;
        let words = vec![0u64; size.div_ceil(WORD_BITS) as usize];

        Ok(Self {
            first: lo,
            size,
            words,
            free: size,
            cursor: 0,
        })
    }

    /// Number of addresses covered
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Number of addresses not taken
    pub fn available(&self) -> u32 {
        self.free
    }

    /// Whether `ip` is inside the covered range
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.slot(ip).is_some()
    }

    /// Whether `ip` is inside the range and taken
    pub fn is_taken(&self, ip: Ipv4Addr) -> bool {
        self.slot(ip).map(|slot| self.test(slot)).unwrap_or(false)
    }

    /// Take `ip` if it is in range and free
    pub fn allocate_specific(&mut self, ip: Ipv4Addr) -> bool {
        match self.slot(ip) {
            Some(slot) if !self.test(slot) => {
                self.set(slot);
                true
            }
            _ => false,
        }
    }

    /// Take the preferred address when possible, otherwise the next free one
    pub fn allocate(&mut self, preferred: Option<Ipv4Addr>) -> Option<Ipv4Addr> {
        if let Some(ip) = preferred {
            if self.allocate_specific(ip) {
                return Some(ip);
            }
        }

        if self.free == 0 {
            return None;
        }

        for step in 0..self.size {
            let slot = (self.cursor + step) % self.size;
            if !self.test(slot) {
                self.set(slot);
                self.cursor = (slot + 1) % self.size;
                return Some(Ipv4Addr::from(self.first + slot));
            }
        }

        None
    }

    /// Return `ip` to the pool. Returns false if it was not taken.
    pub fn free(&mut self, ip: Ipv4Addr) -> bool {
        match self.slot(ip) {
            Some(slot) if self.test(slot) => {
                self.words[(slot / WORD_BITS) as usize] &= !(1u64 << (slot % WORD_BITS));
                self.free += 1;
                true
            }
            _ => false,
        }
    }

    fn slot(&self, ip: Ipv4Addr) -> Option<u32> {
        let offset = u32::from(ip).checked_sub(self.first)?;
        (offset < self.size).then_some(offset)
    }

    fn test(&self, slot: u32) -> bool {
        self.words[(slot / WORD_BITS) as usize] & (1u64 << (slot % WORD_BITS)) != 0
    }

    fn set(&mut self, slot: u32) {
        self.words[(slot / WORD_BITS) as usize] |= 1u64 << (slot % WORD_BITS);
        self.free -= 1;
    }
}
