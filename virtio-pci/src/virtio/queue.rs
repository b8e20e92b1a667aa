use super::VirtioError;
use super::chain::{Descriptor, DescriptorChain};
use super::consts::{MAX_QUEUE_SIZE, VIRTIO_ISR_QUEUE};
use super::device::DeviceLock;
use super::ring::RingLayout;
use crate::memory::{GuestMemory, GuestRegion};
use crate::snapshot::QueueSnapshot;
use std::sync::atomic::{AtomicBool, Ordering, fence};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Result of processing at most one chain with [`VirtioQueue::handle_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueProgress {
    /// The avail ring was empty.
    NoWork,
    /// One chain was processed and the ring is now empty.
    Done,
    /// One chain was processed and more are waiting; call again.
    More,
}

/// Free-running u16 indices only stay contiguous modulo a power of two.
fn valid_size(size: u16) -> bool {
    size.is_power_of_two() && size <= MAX_QUEUE_SIZE
}

/// Queue registers and ring views, guarded by the queue lock.
#[derive(Debug, Default)]
struct QueueState {
    size: u16,
    pfn: u32,
    ring: Option<RingLayout>,
    /// Free-running index of the next avail entry to consume.
    next_avail: u16,
}

/// One virtqueue of a device.
///
/// The guest is the only producer on the avail ring and this queue the only
/// consumer; the roles are swapped on the used ring. Both indices are
/// free-running 16-bit counters, so `avail.idx - next_avail` is the number
/// of outstanding chains even across wraparound.
pub struct VirtioQueue {
    id: u16,
    mem: Arc<GuestMemory>,
    device: Arc<DeviceLock>,
    state: Mutex<QueueState>,
    avail_ring_cnd: Condvar,
}

impl VirtioQueue {
    pub(crate) fn new(id: u16, mem: Arc<GuestMemory>, device: Arc<DeviceLock>) -> Self {
        Self {
            id,
            mem,
            device,
            state: Mutex::new(QueueState::default()),
            avail_ring_cnd: Condvar::new(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.mem
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn size(&self) -> u16 {
        self.lock().size
    }

    /// Set the ring capacity. Takes effect at the next [`set_pfn`](Self::set_pfn);
    /// an already mapped ring keeps the size it was laid out with.
    pub fn set_size(&self, size: u16) {
        let mut state = self.lock();
        if state.ring.is_some_and(|ring| ring.size != size) {
            log::debug!(
                "[VirtioQueue] Queue {} size set to {} while mapped with {}",
                self.id,
                size,
                state.size
            );
        }
        state.size = size;
    }

    pub fn pfn(&self) -> u32 {
        self.lock().pfn
    }

    /// Current ring views, if a ring is mapped.
    pub fn layout(&self) -> Option<RingLayout> {
        self.lock().ring
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ring.is_some()
    }

    /// Map the ring at page frame `pfn`.
    ///
    /// All views are swapped in a single update under the queue lock. If the
    /// ring would not fit in guest memory the queue is wiped back to its
    /// reset state (size included) and stays unusable until a valid ring is
    /// set. The same happens if the size is not a power of two in
    /// `1..=32768`. A pfn of 0 unmaps the ring.
    pub fn set_pfn(&self, pfn: u32) -> Result<(), VirtioError> {
        let mut state = self.lock();
        if pfn == 0 {
            log::debug!("[VirtioQueue] Queue {} ring unmapped", self.id);
            state.pfn = 0;
            state.ring = None;
            state.next_avail = 0;
            return Ok(());
        }

        let size = state.size;
        if !valid_size(size) {
            log::warn!("[VirtioQueue] Queue {} has invalid size {}", self.id, size);
            *state = QueueState::default();
            return Err(VirtioError::InvalidQueueSize {
                queue: self.id,
                size,
            });
        }

        match RingLayout::compute_within(pfn, size, &self.mem) {
            Some(layout) => {
                log::debug!(
                    "[VirtioQueue] Queue {} mapped: size={} desc={:#x} avail={:#x} used={:#x}",
                    self.id,
                    size,
                    layout.desc,
                    layout.avail,
                    layout.used
                );
                state.pfn = pfn;
                state.ring = Some(layout);
                Ok(())
            }
            None => {
                log::warn!(
                    "[VirtioQueue] Queue {} ring at pfn {:#x} is outside of guest memory",
                    self.id,
                    pfn
                );
                *state = QueueState::default();
                Err(VirtioError::RingOutOfRange {
                    queue: self.id,
                    pfn,
                })
            }
        }
    }

    fn avail_count_locked(&self, state: &QueueState) -> Result<u16, VirtioError> {
        let Some(ring) = state.ring else {
            return Ok(0);
        };
        let avail_idx = self.mem.read_u16(ring.avail_idx_addr())?;
        Ok(avail_idx.wrapping_sub(state.next_avail))
    }

    fn next_avail_locked(&self, state: &mut QueueState) -> Result<Option<u16>, VirtioError> {
        if self.avail_count_locked(state)? == 0 {
            return Ok(None);
        }
        let Some(ring) = state.ring else {
            return Ok(None);
        };
        // Entry contents are only meaningful after we have observed avail.idx.
        fence(Ordering::Acquire);
        let head = self.mem.read_u16(ring.avail_elem_addr(state.next_avail))?;
        state.next_avail = state.next_avail.wrapping_add(1);
        Ok(Some(head))
    }

    /// Number of chains the guest has published that we have not consumed.
    pub fn available_count(&self) -> Result<u16, VirtioError> {
        let state = self.lock();
        self.avail_count_locked(&state)
    }

    /// Free-running index of the next avail entry to consume.
    pub fn next_avail_index(&self) -> u16 {
        self.lock().next_avail
    }

    /// Pop the next descriptor head from the avail ring, or `None` if the
    /// guest has not published anything new.
    pub fn next_available(&self) -> Result<Option<u16>, VirtioError> {
        let mut state = self.lock();
        self.next_avail_locked(&mut state)
    }

    /// Block until a descriptor head is available and pop it.
    pub fn wait_next_available(&self) -> Result<u16, VirtioError> {
        let mut state = self.lock();
        loop {
            if let Some(head) = self.next_avail_locked(&mut state)? {
                return Ok(head);
            }
            state = self
                .avail_ring_cnd
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait_next_available`](Self::wait_next_available) but gives up
    /// after `timeout`, returning `None`. A timeout too large to represent
    /// waits without a deadline.
    pub fn wait_next_available_timeout(&self, timeout: Duration) -> Result<Option<u16>, VirtioError> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.wait_next_available().map(Some);
        };
        let mut state = self.lock();
        loop {
            if let Some(head) = self.next_avail_locked(&mut state)? {
                return Ok(Some(head));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .avail_ring_cnd
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Blocking pop that also returns `None` once `cancel` is set and the
    /// waiter is woken with [`wake_all`](Self::wake_all).
    pub(crate) fn wait_next_available_or_cancel(
        &self,
        cancel: &AtomicBool,
    ) -> Result<Option<u16>, VirtioError> {
        let mut state = self.lock();
        loop {
            if cancel.load(Ordering::Acquire) {
                return Ok(None);
            }
            if let Some(head) = self.next_avail_locked(&mut state)? {
                return Ok(Some(head));
            }
            state = self
                .avail_ring_cnd
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wake every waiter regardless of ring state.
    pub(crate) fn wake_all(&self) {
        let _state = self.lock();
        self.avail_ring_cnd.notify_all();
    }

    /// Wake one waiter if there is work for it. Called on guest notify.
    ///
    /// Returns whether a wakeup was sent.
    pub fn signal_if_nonempty(&self) -> Result<bool, VirtioError> {
        let state = self.lock();
        if self.avail_count_locked(&state)? > 0 {
            self.avail_ring_cnd.notify_one();
            return Ok(true);
        }
        Ok(false)
    }

    /// Place chain `index` on the used ring with `len` bytes written, then
    /// flag a queue interrupt in the device ISR.
    pub fn return_buffer(&self, index: u16, len: u32) -> Result<(), VirtioError> {
        {
            let state = self.lock();
            let ring = state.ring.ok_or(VirtioError::QueueNotReady(self.id))?;
            let used_idx = self.mem.read_u16(ring.used_idx_addr())?;
            let elem = ring.used_elem_addr(used_idx);
            self.mem.write_u32(elem, index as u32)?;
            self.mem.write_u32(elem + 4, len)?;
            // Element must be visible before the index that publishes it.
            fence(Ordering::Release);
            self.mem.write_u16(ring.used_idx_addr(), used_idx.wrapping_add(1))?;
        }

        // Queue lock released before taking the device lock.
        self.device.raise_isr(VIRTIO_ISR_QUEUE);
        Ok(())
    }

    /// Start walking the chain at `head`.
    ///
    /// The chain works on a copy of the current ring views, so the queue
    /// lock is not held while the caller processes buffers.
    pub fn chain(&self, head: u16) -> Result<DescriptorChain<'_>, VirtioError> {
        let ring = self.lock().ring.ok_or(VirtioError::QueueNotReady(self.id))?;
        Ok(DescriptorChain::new(&self.mem, ring, head))
    }

    /// Read and validate a single descriptor.
    pub fn read_desc(&self, index: u16) -> Result<Descriptor, VirtioError> {
        let ring = self.lock().ring.ok_or(VirtioError::QueueNotReady(self.id))?;
        Descriptor::read(&self.mem, &ring, index)
    }

    /// Process at most one chain synchronously.
    ///
    /// Pops the next head, hands each buffer of its chain to `handler`,
    /// and returns the chain with the summed used length. If the walk fails
    /// nothing is written to the used ring and the error is returned.
    pub fn handle_next<F>(&self, handler: F) -> Result<QueueProgress, VirtioError>
    where
        F: FnMut(&Descriptor, GuestRegion<'_>) -> Result<u32, VirtioError>,
    {
        let Some(head) = self.next_available()? else {
            return Ok(QueueProgress::NoWork);
        };
        let used = self.chain(head)?.walk(handler)?;
        self.return_buffer(head, used)?;

        if self.available_count()? > 0 {
            Ok(QueueProgress::More)
        } else {
            Ok(QueueProgress::Done)
        }
    }

    pub(crate) fn save(&self) -> QueueSnapshot {
        let state = self.lock();
        QueueSnapshot {
            // A size written after mapping has not been applied yet
            size: state.ring.map_or(state.size, |ring| ring.size),
            pfn: state.pfn,
            next_avail: state.next_avail,
        }
    }

    /// Check that `snapshot` would map on this queue without touching it.
    pub(crate) fn check_restore(&self, snapshot: &QueueSnapshot) -> Result<(), VirtioError> {
        if snapshot.pfn == 0 {
            return Ok(());
        }
        if !valid_size(snapshot.size) {
            return Err(VirtioError::InvalidQueueSize {
                queue: self.id,
                size: snapshot.size,
            });
        }
        match RingLayout::compute_within(snapshot.pfn, snapshot.size, &self.mem) {
            Some(_) => Ok(()),
            None => Err(VirtioError::RingOutOfRange {
                queue: self.id,
                pfn: snapshot.pfn,
            }),
        }
    }

    pub(crate) fn restore(&self, snapshot: &QueueSnapshot) -> Result<(), VirtioError> {
        self.set_size(snapshot.size);
        self.set_pfn(snapshot.pfn)?;
        self.lock().next_avail = snapshot.next_avail;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::{GuestQueue, UsedElem};
    use crate::memory::PAGE_SIZE;
    use std::thread;

    const MIB: usize = 1 << 20;

    fn queue_with_mem(mem_size: usize) -> (Arc<VirtioQueue>, Arc<DeviceLock>) {
        let mem = Arc::new(GuestMemory::new(0, mem_size));
        let device = Arc::new(DeviceLock::default());
        (Arc::new(VirtioQueue::new(0, mem, device.clone())), device)
    }

    fn mapped_queue(size: u16) -> (Arc<VirtioQueue>, Arc<DeviceLock>) {
        let (queue, device) = queue_with_mem(MIB);
        queue.set_size(size);
        queue.set_pfn(1).unwrap();
        (queue, device)
    }

    #[test]
    fn test_set_pfn_computes_views() {
        let (queue, _) = mapped_queue(4);
        let layout = queue.layout().unwrap();
        assert_eq!(queue.pfn(), 1);
        assert_eq!(layout.desc, PAGE_SIZE);
        assert_eq!(layout.avail, PAGE_SIZE + 4 * 16);
        assert_eq!(layout.used_event, PAGE_SIZE + 64 + 4 + 4 * 2);
        assert_eq!(layout.used, 2 * PAGE_SIZE);
        assert_eq!(layout.avail_event, 2 * PAGE_SIZE + 4 + 4 * 8);
    }

    #[test]
    fn test_set_pfn_out_of_range_zeroes_queue() {
        let (queue, _) = mapped_queue(4);

        let err = queue.set_pfn((MIB as u64 / PAGE_SIZE) as u32).unwrap_err();
        assert!(matches!(err, VirtioError::RingOutOfRange { queue: 0, .. }));
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.pfn(), 0);
        assert!(queue.layout().is_none());
        assert_eq!(queue.next_avail_index(), 0);
        assert_eq!(queue.next_available().unwrap(), None);

        queue.set_size(4);
        queue.set_pfn(3).unwrap();
        let layout = queue.layout().unwrap();
        assert_eq!(layout.desc, 3 * PAGE_SIZE);
        assert_eq!(layout.used, 4 * PAGE_SIZE);
    }

    #[test]
    fn test_set_pfn_requires_size() {
        let (queue, _) = queue_with_mem(MIB);
        assert!(matches!(
            queue.set_pfn(1),
            Err(VirtioError::InvalidQueueSize { queue: 0, size: 0 })
        ));
        assert!(!queue.is_ready());
    }

    #[test]
    fn test_set_pfn_rejects_non_power_of_two_size() {
        let (queue, _) = queue_with_mem(MIB);
        queue.set_size(3);
        assert!(matches!(
            queue.set_pfn(1),
            Err(VirtioError::InvalidQueueSize { queue: 0, size: 3 })
        ));
        assert!(!queue.is_ready());
        assert_eq!(queue.size(), 0);

        queue.set_size(MAX_QUEUE_SIZE);
        queue.set_pfn(1).unwrap();
        assert_eq!(queue.layout().unwrap().size, MAX_QUEUE_SIZE);
    }

    #[test]
    fn test_zero_pfn_unmaps_ring() {
        let (queue, _) = mapped_queue(4);
        queue.set_pfn(0).unwrap();
        assert!(!queue.is_ready());
        assert_eq!(queue.size(), 4);
        assert!(matches!(
            queue.return_buffer(0, 0),
            Err(VirtioError::QueueNotReady(0))
        ));
    }

    #[test]
    fn test_next_available_pops_head() {
        let (queue, _) = mapped_queue(4);
        let mut guest = GuestQueue::new(queue.memory(), queue.layout().unwrap());
        guest.publish(2).unwrap();

        assert_eq!(queue.available_count().unwrap(), 1);
        assert_eq!(queue.next_available().unwrap(), Some(2));
        assert_eq!(queue.next_avail_index(), 1);
        assert_eq!(queue.next_available().unwrap(), None);
    }

    #[test]
    fn test_available_count_across_wraparound() {
        let (queue, _) = mapped_queue(4);
        let mut guest = GuestQueue::new(queue.memory(), queue.layout().unwrap());

        // Park both counters just below the u16 wrap point
        guest.set_avail_idx(u16::MAX - 1).unwrap();
        while queue.next_available().unwrap().is_some() {}
        assert_eq!(queue.next_avail_index(), u16::MAX - 1);

        for head in 0..3 {
            guest.publish(head).unwrap();
        }
        assert_eq!(guest.avail_idx(), 1);
        assert_eq!(queue.available_count().unwrap(), 3);

        assert_eq!(queue.next_available().unwrap(), Some(0));
        assert_eq!(queue.next_available().unwrap(), Some(1));
        assert_eq!(queue.next_available().unwrap(), Some(2));
        assert_eq!(queue.available_count().unwrap(), 0);
        assert_eq!(queue.next_avail_index(), 1);
    }

    #[test]
    fn test_return_buffer_sets_isr_queue_bit() {
        let (queue, device) = mapped_queue(4);
        let mut guest = GuestQueue::new(queue.memory(), queue.layout().unwrap());

        queue.return_buffer(3, 128).unwrap();
        assert_eq!(guest.used_idx().unwrap(), 1);
        assert_eq!(guest.pop_used().unwrap(), Some(UsedElem { id: 3, len: 128 }));

        let isr = device.read_and_clear_isr();
        assert_ne!(isr & VIRTIO_ISR_QUEUE, 0);
        assert_eq!(device.read_and_clear_isr(), 0);
    }

    #[test]
    fn test_wait_next_available_wakes_on_signal() {
        let (queue, _) = mapped_queue(4);
        let layout = queue.layout().unwrap();

        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.wait_next_available_timeout(Duration::from_secs(5)))
        };

        // Give the waiter a chance to block on the empty ring
        thread::sleep(Duration::from_millis(20));
        assert!(!queue.signal_if_nonempty().unwrap());

        let mut guest = GuestQueue::new(queue.memory(), layout);
        guest.publish(2).unwrap();
        assert!(queue.signal_if_nonempty().unwrap());

        assert_eq!(waiter.join().unwrap().unwrap(), Some(2));
        assert_eq!(queue.next_avail_index(), 1);
    }

    #[test]
    fn test_wait_timeout_on_empty_ring() {
        let (queue, _) = mapped_queue(4);
        let started = Instant::now();
        assert_eq!(
            queue.wait_next_available_timeout(Duration::from_millis(10)).unwrap(),
            None
        );
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_wait_with_unbounded_timeout() {
        let (queue, _) = mapped_queue(4);
        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.wait_next_available_timeout(Duration::MAX))
        };

        thread::sleep(Duration::from_millis(20));
        let mut guest = GuestQueue::new(queue.memory(), queue.layout().unwrap());
        guest.publish(1).unwrap();
        queue.signal_if_nonempty().unwrap();

        assert_eq!(waiter.join().unwrap().unwrap(), Some(1));
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let (queue, _) = mapped_queue(4);
        let cancel = Arc::new(AtomicBool::new(false));

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            thread::spawn(move || queue.wait_next_available_or_cancel(&cancel))
        };

        thread::sleep(Duration::from_millis(20));
        cancel.store(true, Ordering::Release);
        queue.wake_all();
        assert_eq!(waiter.join().unwrap().unwrap(), None);
    }

    #[test]
    fn test_handle_next_reports_progress() {
        let (queue, device) = mapped_queue(8);
        let mut guest = GuestQueue::new(queue.memory(), queue.layout().unwrap());
        let data = 16 * PAGE_SIZE;

        assert_eq!(queue.handle_next(|_, _| Ok(0)).unwrap(), QueueProgress::NoWork);

        let first = guest.add_chain(&[(data, 8, false), (data + 8, 24, true)]).unwrap();
        let second = guest.add_chain(&[(data + 64, 4, true)]).unwrap();

        let handler = |desc: &Descriptor, buf: GuestRegion<'_>| -> Result<u32, VirtioError> {
            if desc.is_write_only() {
                buf.fill(0x5a)?;
                Ok(buf.len())
            } else {
                Ok(0)
            }
        };
        assert_eq!(queue.handle_next(handler).unwrap(), QueueProgress::More);
        assert_eq!(queue.handle_next(handler).unwrap(), QueueProgress::Done);

        assert_eq!(
            guest.pop_used().unwrap(),
            Some(UsedElem { id: first as u32, len: 24 })
        );
        assert_eq!(
            guest.pop_used().unwrap(),
            Some(UsedElem { id: second as u32, len: 4 })
        );
        assert_eq!(queue.memory().read_u8(data + 8).unwrap(), 0x5a);
        assert_eq!(queue.memory().read_u8(data).unwrap(), 0);
        assert_eq!(device.read_and_clear_isr(), VIRTIO_ISR_QUEUE);
    }

    #[test]
    fn test_handle_next_bad_descriptor_skips_used_ring() {
        let (queue, device) = mapped_queue(4);
        let mut guest = GuestQueue::new(queue.memory(), queue.layout().unwrap());
        guest.add_chain(&[(MIB as u64 - 8, 16, true)]).unwrap();

        let mut calls = 0;
        let result = queue.handle_next(|_, _| {
            calls += 1;
            Ok(0)
        });
        assert!(matches!(result, Err(VirtioError::Memory(_))));
        assert_eq!(calls, 0);
        assert_eq!(guest.used_idx().unwrap(), 0);
        assert_eq!(device.read_and_clear_isr(), 0);
    }

    #[test]
    fn test_read_desc() {
        let (queue, _) = mapped_queue(4);
        let mut guest = GuestQueue::new(queue.memory(), queue.layout().unwrap());
        guest.add_chain(&[(0x8000, 32, false), (0x9000, 64, true)]).unwrap();

        let desc = queue.read_desc(0).unwrap();
        assert_eq!((desc.addr, desc.len, desc.next), (0x8000, 32, 1));
        assert!(desc.has_next());
        assert!(!desc.is_write_only());

        let desc = queue.read_desc(1).unwrap();
        assert!(!desc.has_next());
        assert!(desc.is_write_only());

        assert!(matches!(
            queue.read_desc(4),
            Err(VirtioError::DescriptorIndex { index: 4, size: 4 })
        ));
    }

    #[test]
    fn test_isr_bits_not_lost_under_concurrent_clear() {
        const N: u32 = 2000;
        let (queue, device) = mapped_queue(256);

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..N {
                    queue.return_buffer((i % 256) as u16, i).unwrap();
                }
            })
        };

        let mut seen = 0u8;
        while !producer.is_finished() {
            seen |= device.read_and_clear_isr();
        }
        producer.join().unwrap();
        seen |= device.read_and_clear_isr();

        assert_eq!(seen & VIRTIO_ISR_QUEUE, VIRTIO_ISR_QUEUE);
        let guest = GuestQueue::new(queue.memory(), queue.layout().unwrap());
        assert_eq!(guest.used_idx().unwrap(), N as u16);
        assert_eq!(device.read_and_clear_isr(), 0);
    }

    #[test]
    fn test_remap_is_atomic_for_readers() {
        let (queue, _) = mapped_queue(8);
        let small = queue.layout().unwrap();
        queue.set_size(16);
        queue.set_pfn(8).unwrap();
        let large = queue.layout().unwrap();
        assert_ne!(small, large);

        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let queue = queue.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut reads = 0u32;
                loop {
                    let layout = queue.layout().unwrap();
                    assert!(layout == small || layout == large, "torn layout {:?}", layout);
                    reads += 1;
                    if stop.load(Ordering::Acquire) {
                        return reads;
                    }
                }
            })
        };

        for i in 0..1000 {
            if i % 2 == 0 {
                queue.set_size(8);
                queue.set_pfn(1).unwrap();
            } else {
                queue.set_size(16);
                queue.set_pfn(8).unwrap();
            }
        }
        stop.store(true, Ordering::Release);
        assert!(reader.join().unwrap() > 0);
    }

    #[test]
    fn test_save_records_mapped_size() {
        let (queue, _) = mapped_queue(8);
        queue.set_size(16);

        let snap = queue.save();
        assert_eq!(snap.size, 8);
        assert_eq!(snap.pfn, 1);

        queue.set_pfn(0).unwrap();
        assert_eq!(queue.save().size, 16);
    }
}
