//! Split virtqueue memory layout for the legacy transport.
//!
//! Starting at `pfn * PAGE_SIZE` the guest places, back to back:
//!
//! ```text
//! desc        [16 * size]          addr u64, len u32, flags u16, next u16
//! avail       [4 + 2 * size]       flags u16, idx u16, ring[size] u16
//! used_event  [2]
//! ---- pad up to the next page boundary ----
//! used        [4 + 8 * size]       flags u16, idx u16, ring[size] {id u32, len u32}
//! avail_event [2]
//! ```

use crate::memory::{GuestMemory, PAGE_SIZE};

pub const DESC_SIZE: u64 = 16;
pub const AVAIL_HEADER_SIZE: u64 = 4;
pub const AVAIL_ELEM_SIZE: u64 = 2;
pub const USED_HEADER_SIZE: u64 = 4;
pub const USED_ELEM_SIZE: u64 = 8;
pub const EVENT_SIZE: u64 = 2;

/// Circular index into a ring of `size` entries.
#[inline]
pub fn ring_index(index: u16, size: u16) -> u16 {
    if size == 0 { 0 } else { index % size }
}

#[inline]
fn align_up(value: u64, align: u64) -> Option<u64> {
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// Guest physical addresses of the five ring areas of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub size: u16,
    pub desc: u64,
    pub avail: u64,
    pub used_event: u64,
    pub used: u64,
    pub avail_event: u64,
}

impl RingLayout {
    /// Lay out a ring of `size` entries at page frame `pfn`.
    ///
    /// Returns `None` if any address overflows 64 bits.
    pub fn compute(pfn: u32, size: u16) -> Option<Self> {
        let n = size as u64;
        let desc = (pfn as u64).checked_mul(PAGE_SIZE)?;
        let avail = desc.checked_add(DESC_SIZE * n)?;
        let used_event = avail.checked_add(AVAIL_HEADER_SIZE + AVAIL_ELEM_SIZE * n)?;
        let used = align_up(used_event.checked_add(EVENT_SIZE)?, PAGE_SIZE)?;
        let avail_event = used.checked_add(USED_HEADER_SIZE + USED_ELEM_SIZE * n)?;
        // end() must be representable too
        avail_event.checked_add(EVENT_SIZE)?;

        Some(Self {
            size,
            desc,
            avail,
            used_event,
            used,
            avail_event,
        })
    }

    /// Lay out the ring and check it lies entirely inside `mem`.
    pub fn compute_within(pfn: u32, size: u16, mem: &GuestMemory) -> Option<Self> {
        Self::compute(pfn, size).filter(|layout| layout.fits(mem))
    }

    /// One past the last byte of the ring (end of the avail-event cell).
    pub fn end(&self) -> u64 {
        self.avail_event + EVENT_SIZE
    }

    /// The areas are laid out in increasing address order, so the whole ring
    /// is inside guest memory iff its first and last byte are.
    pub fn fits(&self, mem: &GuestMemory) -> bool {
        mem.contains(self.desc, self.end() - self.desc)
    }

    #[inline]
    pub fn desc_addr(&self, index: u16) -> u64 {
        self.desc + DESC_SIZE * index as u64
    }

    #[inline]
    pub fn avail_idx_addr(&self) -> u64 {
        self.avail + 2
    }

    /// Address of avail ring entry for the free-running index `index`.
    #[inline]
    pub fn avail_elem_addr(&self, index: u16) -> u64 {
        self.avail + AVAIL_HEADER_SIZE + AVAIL_ELEM_SIZE * ring_index(index, self.size) as u64
    }

    #[inline]
    pub fn used_idx_addr(&self) -> u64 {
        self.used + 2
    }

    /// Address of used ring entry for the free-running index `index`.
    #[inline]
    pub fn used_elem_addr(&self, index: u16) -> u64 {
        self.used + USED_HEADER_SIZE + USED_ELEM_SIZE * ring_index(index, self.size) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_index_wraps() {
        for size in [1u16, 2, 4, 16, 256, 32768] {
            for i in [0u16, 1, size - 1, size, size.wrapping_add(1), u16::MAX] {
                assert_eq!(ring_index(i, size), i % size);
            }
        }
        assert_eq!(ring_index(7, 0), 0);
    }

    #[test]
    fn test_layout_size_4() {
        let layout = RingLayout::compute(2, 4).unwrap();
        let base = 2 * PAGE_SIZE;
        assert_eq!(layout.desc, base);
        assert_eq!(layout.avail, base + 64);
        assert_eq!(layout.used_event, base + 64 + 4 + 8);
        assert_eq!(layout.used, base + PAGE_SIZE);
        assert_eq!(layout.avail_event, base + PAGE_SIZE + 4 + 32);
        assert_eq!(layout.end(), base + PAGE_SIZE + 38);
    }

    #[test]
    fn test_layout_used_ring_page_aligned() {
        // 256 entries: desc 4096 bytes + avail 516 + used_event 2 -> used at +2 pages
        let layout = RingLayout::compute(0, 256).unwrap();
        assert_eq!(layout.avail, 4096);
        assert_eq!(layout.used_event, 4096 + 4 + 512);
        assert_eq!(layout.used, 2 * PAGE_SIZE);
        assert_eq!(layout.used % PAGE_SIZE, 0);
        assert_eq!(layout.avail_event, 2 * PAGE_SIZE + 4 + 8 * 256);
    }

    #[test]
    fn test_layout_exactly_page_sized_avail() {
        // Avail ring ending on a page boundary still pushes used to the next page
        // because the used_event cell sits in between.
        let layout = RingLayout::compute(0, 255).unwrap();
        let avail_end = layout.used_event;
        assert!(layout.used >= avail_end + EVENT_SIZE);
        assert_eq!(layout.used % PAGE_SIZE, 0);
    }

    #[test]
    fn test_layout_bounds() {
        let mem = GuestMemory::new(0, 1 << 20);
        assert!(RingLayout::compute_within(0, 4, &mem).is_some());

        // Last two pages fit exactly: desc page + used page
        let last = ((1 << 20) / PAGE_SIZE - 2) as u32;
        assert!(RingLayout::compute_within(last, 4, &mem).is_some());
        assert!(RingLayout::compute_within(last + 1, 4, &mem).is_none());
        assert!(RingLayout::compute_within(u32::MAX, 4, &mem).is_none());
    }

    #[test]
    fn test_layout_respects_memory_base() {
        let mem = GuestMemory::new(0x10_0000, 0x10_0000);
        assert!(RingLayout::compute_within(0, 4, &mem).is_none());
        assert!(RingLayout::compute_within(0x100, 4, &mem).is_some());
    }

    #[test]
    fn test_element_addresses() {
        let layout = RingLayout::compute(1, 8).unwrap();
        assert_eq!(layout.desc_addr(3), layout.desc + 48);
        assert_eq!(layout.avail_idx_addr(), layout.avail + 2);
        assert_eq!(layout.avail_elem_addr(9), layout.avail + 4 + 2);
        assert_eq!(layout.used_idx_addr(), layout.used + 2);
        assert_eq!(layout.used_elem_addr(10), layout.used + 4 + 16);
    }
}
