use super::VirtioError;
use super::consts::{VRING_DESC_F_NEXT, VRING_DESC_F_WRITE};
use super::ring::RingLayout;
use crate::memory::{GuestMemory, GuestRegion};

/// One descriptor as read from the guest's descriptor table.
///
/// The buffer it names has already been checked against guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub index: u16,
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl Descriptor {
    /// Read descriptor `index` from the table described by `layout`.
    ///
    /// Fails if the index is outside the ring or if `addr + len` escapes
    /// guest memory.
    pub fn read(mem: &GuestMemory, layout: &RingLayout, index: u16) -> Result<Self, VirtioError> {
        if index >= layout.size {
            return Err(VirtioError::DescriptorIndex {
                index,
                size: layout.size,
            });
        }
        let at = layout.desc_addr(index);
        let desc = Self {
            index,
            addr: mem.read_u64(at)?,
            len: mem.read_u32(at + 8)?,
            flags: mem.read_u16(at + 12)?,
            next: mem.read_u16(at + 14)?,
        };
        mem.check_range(desc.addr, desc.len as u64)?;
        Ok(desc)
    }

    #[inline]
    pub fn has_next(&self) -> bool {
        self.flags & VRING_DESC_F_NEXT != 0
    }

    /// Device writes into this buffer (guest reads it back).
    #[inline]
    pub fn is_write_only(&self) -> bool {
        self.flags & VRING_DESC_F_WRITE != 0
    }
}

/// Walks a descriptor chain straight out of guest memory.
///
/// Each link is re-read and re-validated as it is reached, so a guest
/// rewriting the table underneath us can at worst produce a different (but
/// still in-bounds) chain. The walk is capped at `size` links, which is the
/// longest chain a well-formed ring can hold; anything longer is a loop.
pub struct DescriptorChain<'a> {
    mem: &'a GuestMemory,
    layout: RingLayout,
    head: u16,
    next: Option<u16>,
    hops: u16,
}

impl<'a> DescriptorChain<'a> {
    pub fn new(mem: &'a GuestMemory, layout: RingLayout, head: u16) -> Self {
        Self {
            mem,
            layout,
            head,
            next: Some(head),
            hops: 0,
        }
    }

    /// Index of the first descriptor, which is also the id returned to the
    /// used ring.
    pub fn head(&self) -> u16 {
        self.head
    }

    /// Read the next link, or `None` once the chain has ended.
    pub fn next_descriptor(&mut self) -> Result<Option<Descriptor>, VirtioError> {
        let Some(index) = self.next.take() else {
            return Ok(None);
        };
        if self.hops >= self.layout.size {
            log::warn!(
                "[DescriptorChain] Chain from head {} exceeds {} links",
                self.head,
                self.layout.size
            );
            return Err(VirtioError::ChainTooLong {
                head: self.head,
                limit: self.layout.size,
            });
        }
        self.hops += 1;

        let desc = Descriptor::read(self.mem, &self.layout, index).inspect_err(|e| {
            log::warn!("[DescriptorChain] Bad descriptor {} in chain {}: {}", index, self.head, e);
        })?;
        if desc.has_next() {
            self.next = Some(desc.next);
        }
        Ok(Some(desc))
    }

    /// Hand every buffer in the chain to `handler` in link order.
    ///
    /// `handler` returns how many bytes it used from (or wrote into) each
    /// buffer; the sum is returned as the chain's used length. The walk
    /// stops at the first invalid descriptor or handler error, before the
    /// handler sees that descriptor.
    pub fn walk<F>(mut self, mut handler: F) -> Result<u32, VirtioError>
    where
        F: FnMut(&Descriptor, GuestRegion<'a>) -> Result<u32, VirtioError>,
    {
        let mut used: u32 = 0;
        while let Some(desc) = self.next_descriptor()? {
            let buffer = self.mem.region(desc.addr, desc.len)?;
            let n = handler(&desc, buffer).inspect_err(|e| {
                log::warn!(
                    "[DescriptorChain] Request ({:#x}, {}) failed: {}",
                    desc.addr,
                    desc.len,
                    e
                );
            })?;
            used = used.saturating_add(n);
        }
        Ok(used)
    }
}

impl Iterator for DescriptorChain<'_> {
    type Item = Result<Descriptor, VirtioError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_descriptor().transpose()
    }
}
