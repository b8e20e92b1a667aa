use std::cell::UnsafeCell;
use thiserror::Error;

/// Page size assumed by the legacy transport for page frame numbers and
/// used-ring alignment.
pub const PAGE_SIZE: u64 = 4096;

/// Guest memory access errors.
///
/// These are surfaced to the transport as `VirtioError::Memory` and, from
/// there, as a failed I/O exit to the guest.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Out-of-bounds guest access at {addr:#x} (len {len:#x})")]
    OutOfBounds { addr: u64, len: u64 },

    #[error("Invalid or misaligned access at {0:#x}")]
    InvalidAlignment(u64),
}

/// Contiguous guest physical memory `[base, base + size)`.
///
/// Every access takes a full guest physical address and is validated against
/// the window before it is dereferenced; nothing handed out by this type can
/// reach outside the backing buffer, whatever the guest writes into its rings.
///
/// # Safety
///
/// The guest owns this memory and mutates it concurrently with the host, so
/// the bytes live in an `UnsafeCell` and are accessed without a lock, the same
/// way real hardware sees DRAM. Callers must treat every value read here as
/// untrusted and re-validate it on each use.
pub struct GuestMemory {
    base: u64,
    size: usize,
    data: UnsafeCell<Vec<u8>>,
}

// SAFETY: all accesses are bounds checked and performed with unaligned
// pointer reads/writes of plain integers; torn reads of guest-controlled data
// are tolerated by the callers, which validate every value independently.
unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

impl GuestMemory {
    /// Create a zero-initialised guest memory region of `size` bytes at `base`.
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            size,
            data: UnsafeCell::new(vec![0; size]),
        }
    }

    #[inline(always)]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size of the region in bytes.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last valid guest physical address.
    #[inline(always)]
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size as u64)
    }

    #[inline(always)]
    unsafe fn mem_ptr(&self) -> *mut u8 {
        // SAFETY: the Vec lives as long as `self` and is never resized.
        unsafe { (*self.data.get()).as_mut_ptr() }
    }

    /// Validate `[addr, addr + len)` and return the offset of `addr` inside
    /// the backing buffer.
    pub fn check_range(&self, addr: u64, len: u64) -> Result<usize, MemoryError> {
        let oob = MemoryError::OutOfBounds { addr, len };
        let end = addr.checked_add(len).ok_or(oob.clone())?;
        if addr < self.base || end > self.end() {
            return Err(oob);
        }
        Ok((addr - self.base) as usize)
    }

    /// Whether `[addr, addr + len)` lies entirely inside guest memory.
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        self.check_range(addr, len).is_ok()
    }

    /// A bounds-checked view of `[addr, addr + len)`.
    pub fn region(&self, addr: u64, len: u32) -> Result<GuestRegion<'_>, MemoryError> {
        self.check_range(addr, len as u64)?;
        Ok(GuestRegion {
            mem: self,
            addr,
            len,
        })
    }

    fn aligned(&self, addr: u64, align: u64) -> Result<(), MemoryError> {
        if addr % align != 0 {
            return Err(MemoryError::InvalidAlignment(addr));
        }
        Ok(())
    }

    // ========== READ METHODS ==========

    pub fn read_u8(&self, addr: u64) -> Result<u8, MemoryError> {
        let off = self.check_range(addr, 1)?;
        // SAFETY: bounds checked
        unsafe { Ok(self.mem_ptr().add(off).read_volatile()) }
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16, MemoryError> {
        self.aligned(addr, 2)?;
        let off = self.check_range(addr, 2)?;
        // SAFETY: alignment and bounds checked
        unsafe {
            let ptr = self.mem_ptr().add(off) as *const u16;
            Ok(u16::from_le(ptr.read_unaligned()))
        }
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        self.aligned(addr, 4)?;
        let off = self.check_range(addr, 4)?;
        // SAFETY: alignment and bounds checked
        unsafe {
            let ptr = self.mem_ptr().add(off) as *const u32;
            Ok(u32::from_le(ptr.read_unaligned()))
        }
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        self.aligned(addr, 8)?;
        let off = self.check_range(addr, 8)?;
        // SAFETY: alignment and bounds checked
        unsafe {
            let ptr = self.mem_ptr().add(off) as *const u64;
            Ok(u64::from_le(ptr.read_unaligned()))
        }
    }

    /// Copy `buf.len()` bytes starting at `addr` into `buf`.
    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let off = self.check_range(addr, buf.len() as u64)?;
        // SAFETY: bounds checked
        unsafe {
            let src = self.mem_ptr().add(off);
            std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    // ========== WRITE METHODS ==========

    pub fn write_u8(&self, addr: u64, value: u8) -> Result<(), MemoryError> {
        let off = self.check_range(addr, 1)?;
        // SAFETY: bounds checked
        unsafe { self.mem_ptr().add(off).write_volatile(value) };
        Ok(())
    }

    pub fn write_u16(&self, addr: u64, value: u16) -> Result<(), MemoryError> {
        self.aligned(addr, 2)?;
        let off = self.check_range(addr, 2)?;
        // SAFETY: alignment and bounds checked
        unsafe {
            let ptr = self.mem_ptr().add(off) as *mut u16;
            ptr.write_unaligned(value.to_le());
        }
        Ok(())
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.aligned(addr, 4)?;
        let off = self.check_range(addr, 4)?;
        // SAFETY: alignment and bounds checked
        unsafe {
            let ptr = self.mem_ptr().add(off) as *mut u32;
            ptr.write_unaligned(value.to_le());
        }
        Ok(())
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.aligned(addr, 8)?;
        let off = self.check_range(addr, 8)?;
        // SAFETY: alignment and bounds checked
        unsafe {
            let ptr = self.mem_ptr().add(off) as *mut u64;
            ptr.write_unaligned(value.to_le());
        }
        Ok(())
    }

    /// Write an arbitrary slice into guest memory starting at `addr`.
    pub fn write_bytes(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        let off = self.check_range(addr, data.len() as u64)?;
        // SAFETY: bounds checked
        unsafe {
            let dst = self.mem_ptr().add(off);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }
}

/// A window of guest memory whose bounds were validated when it was created.
///
/// Offsets passed to the accessors are relative to the start of the window
/// and are checked against its length, so a handler holding a region cannot
/// touch bytes outside the descriptor buffer it was given.
#[derive(Clone, Copy)]
pub struct GuestRegion<'a> {
    mem: &'a GuestMemory,
    addr: u64,
    len: u32,
}

impl<'a> GuestRegion<'a> {
    /// Guest physical address of the first byte.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn sub(&self, offset: u32, len: usize) -> Result<u64, MemoryError> {
        let end = (offset as u64).checked_add(len as u64);
        match end {
            Some(end) if end <= self.len as u64 => Ok(self.addr + offset as u64),
            _ => Err(MemoryError::OutOfBounds {
                addr: self.addr.saturating_add(offset as u64),
                len: len as u64,
            }),
        }
    }

    /// Copy bytes out of the window starting at `offset`.
    pub fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), MemoryError> {
        let addr = self.sub(offset, buf.len())?;
        self.mem.read_bytes(addr, buf)
    }

    /// Copy bytes into the window starting at `offset`.
    pub fn write(&self, offset: u32, data: &[u8]) -> Result<(), MemoryError> {
        let addr = self.sub(offset, data.len())?;
        self.mem.write_bytes(addr, data)
    }

    /// Snapshot the whole window.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = vec![0; self.len as usize];
        // The window was validated at construction and guest memory never shrinks.
        if self.mem.read_bytes(self.addr, &mut buf).is_err() {
            buf.clear();
        }
        buf
    }

    pub fn fill(&self, byte: u8) -> Result<(), MemoryError> {
        let data = vec![byte; self.len as usize];
        self.mem.write_bytes(self.addr, &data)
    }
}

impl std::fmt::Debug for GuestRegion<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestRegion")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len)
            .finish()
    }
}
