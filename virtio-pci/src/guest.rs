//! Guest-side view of a split virtqueue.
//!
//! Plays the driver half of the ring protocol: fills descriptors, publishes
//! heads on the avail ring and reaps the used ring, laying everything out
//! byte-for-byte as a legacy guest driver would. The exerciser binary uses
//! it to feed the transport, and the tests use it to build rings.

use crate::memory::{GuestMemory, MemoryError};
use crate::virtio::consts::{VRING_DESC_F_NEXT, VRING_DESC_F_WRITE};
use crate::virtio::ring::RingLayout;
use std::sync::atomic::{Ordering, fence};

/// One used ring element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedElem {
    pub id: u32,
    pub len: u32,
}

pub struct GuestQueue<'a> {
    mem: &'a GuestMemory,
    layout: RingLayout,
    next_desc: u16,
    avail_idx: u16,
    last_used: u16,
}

impl<'a> GuestQueue<'a> {
    /// Attach to a ring the device already knows about (same pfn and size).
    pub fn new(mem: &'a GuestMemory, layout: RingLayout) -> Self {
        Self {
            mem,
            layout,
            next_desc: 0,
            avail_idx: 0,
            last_used: 0,
        }
    }

    pub fn layout(&self) -> &RingLayout {
        &self.layout
    }

    /// Write descriptor `index` without publishing it.
    pub fn write_desc(
        &self,
        index: u16,
        addr: u64,
        len: u32,
        flags: u16,
        next: u16,
    ) -> Result<(), MemoryError> {
        let at = self.layout.desc_addr(index);
        self.mem.write_u64(at, addr)?;
        self.mem.write_u32(at + 8, len)?;
        self.mem.write_u16(at + 12, flags)?;
        self.mem.write_u16(at + 14, next)
    }

    /// Build a chain from `(addr, len, device_writable)` segments and
    /// publish its head. Descriptors are handed out round-robin, so callers
    /// must not keep more than `size` descriptors in flight.
    pub fn add_chain(&mut self, segments: &[(u64, u32, bool)]) -> Result<u16, MemoryError> {
        let size = self.layout.size;
        let head = self.next_desc;
        for (i, &(addr, len, writable)) in segments.iter().enumerate() {
            let index = self.next_desc;
            let next = (index + 1) % size;
            let mut flags = if writable { VRING_DESC_F_WRITE } else { 0 };
            if i + 1 < segments.len() {
                flags |= VRING_DESC_F_NEXT;
            }
            self.write_desc(index, addr, len, flags, next)?;
            self.next_desc = next;
        }
        self.publish(head)?;
        Ok(head)
    }

    /// Place `head` in the next avail slot and bump `avail.idx`.
    pub fn publish(&mut self, head: u16) -> Result<(), MemoryError> {
        self.mem
            .write_u16(self.layout.avail_elem_addr(self.avail_idx), head)?;
        self.avail_idx = self.avail_idx.wrapping_add(1);
        // Ring entry must be visible before the index that covers it.
        fence(Ordering::Release);
        self.mem.write_u16(self.layout.avail_idx_addr(), self.avail_idx)
    }

    pub fn avail_idx(&self) -> u16 {
        self.avail_idx
    }

    /// Overwrite `avail.idx` directly, as a misbehaving guest might.
    pub fn set_avail_idx(&mut self, idx: u16) -> Result<(), MemoryError> {
        self.avail_idx = idx;
        self.mem.write_u16(self.layout.avail_idx_addr(), idx)
    }

    pub fn used_idx(&self) -> Result<u16, MemoryError> {
        self.mem.read_u16(self.layout.used_idx_addr())
    }

    /// Reap the next used element, if the device has returned one.
    pub fn pop_used(&mut self) -> Result<Option<UsedElem>, MemoryError> {
        if self.used_idx()? == self.last_used {
            return Ok(None);
        }
        fence(Ordering::Acquire);
        let at = self.layout.used_elem_addr(self.last_used);
        let elem = UsedElem {
            id: self.mem.read_u32(at)?,
            len: self.mem.read_u32(at + 4)?,
        };
        self.last_used = self.last_used.wrapping_add(1);
        Ok(Some(elem))
    }
}
