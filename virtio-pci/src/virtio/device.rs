use super::VirtioError;
use super::consts::{VIRTIO_STATUS_FAILED, VIRTIO_ISR_CONFIG};
use super::pci::{AccessWidth, InterruptLine, IoValue, PciIdentity};
use super::poll::{self, Completion, PollHandle};
use super::queue::VirtioQueue;
use crate::memory::GuestMemory;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Device-specific emulation plugged into the transport.
///
/// Implementations are shared between vCPU threads and queue workers, so
/// methods take `&self` and must use interior mutability for their state.
/// The transport never holds any of its own locks while calling these.
pub trait DeviceOps: Send + Sync {
    /// Read from device config space; `offset` is relative to its start.
    fn read_config(
        &self,
        device: &VirtioDevice,
        offset: u16,
        width: AccessWidth,
    ) -> Result<IoValue, VirtioError>;

    /// Write to device config space; `offset` is relative to its start.
    fn write_config(
        &self,
        device: &VirtioDevice,
        offset: u16,
        value: IoValue,
    ) -> Result<(), VirtioError>;

    /// The guest kicked `queue`.
    fn queue_notify(&self, _device: &VirtioDevice, _queue: u16) -> Result<(), VirtioError> {
        Ok(())
    }
}

/// Static description of a device, fixed at VM setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// VirtIO device type (net = 1, block = 2, ...).
    pub device_id: u16,
    /// Feature bits offered to the driver.
    pub features: u32,
    pub num_queues: u16,
    /// Bytes of device-specific config space after the legacy header.
    pub config_size: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            features: 0,
            num_queues: 1,
            config_size: 0,
        }
    }
}

impl DeviceConfig {
    pub fn new(device_id: u16) -> Self {
        Self {
            device_id,
            ..Self::default()
        }
    }

    pub fn with_features(mut self, features: u32) -> Self {
        self.features = features;
        self
    }

    pub fn with_queues(mut self, num_queues: u16) -> Self {
        self.num_queues = num_queues;
        self
    }

    pub fn with_config_size(mut self, config_size: u16) -> Self {
        self.config_size = config_size;
        self
    }
}

/// Device-wide registers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeviceRegisters {
    pub status: u8,
    pub isr_status: u8,
    pub driver_features: u32,
    pub queue_sel: u16,
}

/// The device lock. Shared with every queue of the device so that
/// returning a buffer can flag the ISR.
#[derive(Debug, Default)]
pub(crate) struct DeviceLock {
    regs: Mutex<DeviceRegisters>,
}

impl DeviceLock {
    pub fn lock(&self) -> MutexGuard<'_, DeviceRegisters> {
        self.regs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn raise_isr(&self, bits: u8) {
        self.lock().isr_status |= bits;
    }

    /// Reading ISR de-asserts the interrupt: the value is returned and the
    /// register cleared in one critical section.
    pub fn read_and_clear_isr(&self) -> u8 {
        let mut regs = self.lock();
        std::mem::take(&mut regs.isr_status)
    }
}

/// A paravirtualized device as seen by the legacy transport.
pub struct VirtioDevice {
    config: DeviceConfig,
    mem: Arc<GuestMemory>,
    regs: Arc<DeviceLock>,
    queues: Vec<Arc<VirtioQueue>>,
    ops: Box<dyn DeviceOps>,
    interrupt: Arc<dyn InterruptLine>,
}

impl VirtioDevice {
    pub fn new(
        config: DeviceConfig,
        mem: Arc<GuestMemory>,
        ops: Box<dyn DeviceOps>,
        interrupt: Arc<dyn InterruptLine>,
    ) -> Self {
        let regs = Arc::new(DeviceLock::default());
        let queues = (0..config.num_queues)
            .map(|id| Arc::new(VirtioQueue::new(id, mem.clone(), regs.clone())))
            .collect();
        Self {
            config,
            mem,
            regs,
            queues,
            ops,
            interrupt,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn device_id(&self) -> u16 {
        self.config.device_id
    }

    /// Feature bits offered to the driver.
    pub fn features(&self) -> u32 {
        self.config.features
    }

    pub fn memory(&self) -> &Arc<GuestMemory> {
        &self.mem
    }

    pub fn pci_identity(&self) -> PciIdentity {
        PciIdentity::for_device(&self.config)
    }

    pub fn num_queues(&self) -> u16 {
        self.queues.len() as u16
    }

    pub fn queues(&self) -> &[Arc<VirtioQueue>] {
        &self.queues
    }

    pub fn queue(&self, index: u16) -> Option<&Arc<VirtioQueue>> {
        self.queues.get(index as usize)
    }

    pub fn queue_sel(&self) -> u16 {
        self.regs.lock().queue_sel
    }

    /// The queue addressed by QUEUE_SELECT, if it exists.
    pub fn selected_queue(&self) -> Option<&Arc<VirtioQueue>> {
        self.queue(self.queue_sel())
    }

    pub fn select_queue(&self, index: u16) -> Result<(), VirtioError> {
        if index >= self.num_queues() {
            log::warn!("[VirtioDevice] Selected queue {} does not exist", index);
            return Err(VirtioError::InvalidQueue(index));
        }
        self.regs.lock().queue_sel = index;
        Ok(())
    }

    /// Feature bits acknowledged by the driver.
    pub fn driver_features(&self) -> u32 {
        self.regs.lock().driver_features
    }

    /// Accept the driver's feature selection. Only an exact echo of the
    /// offered bits is accepted; anything else leaves state untouched.
    pub fn negotiate_features(&self, driver: u32) -> Result<(), VirtioError> {
        if driver != self.config.features {
            log::warn!(
                "[VirtioDevice] Driver features {:#x} do not match offered {:#x}",
                driver,
                self.config.features
            );
            return Err(VirtioError::FeatureMismatch {
                device: self.config.features,
                driver,
            });
        }
        self.regs.lock().driver_features = driver;
        Ok(())
    }

    pub fn status(&self) -> u8 {
        self.regs.lock().status
    }

    /// Store the guest-written status byte verbatim.
    pub fn set_status(&self, status: u8) {
        if status & VIRTIO_STATUS_FAILED != 0 {
            log::warn!("[VirtioDevice] Driver reported failure (status {:#x})", status);
        }
        self.regs.lock().status = status;
    }

    /// Current ISR value without clearing it.
    pub fn isr_status(&self) -> u8 {
        self.regs.lock().isr_status
    }

    pub fn raise_isr(&self, bits: u8) {
        self.regs.raise_isr(bits);
    }

    /// Flag a configuration change and interrupt the guest.
    pub fn config_changed(&self) -> Result<(), VirtioError> {
        self.raise_isr(VIRTIO_ISR_CONFIG);
        self.interrupt()
    }

    pub fn read_and_clear_isr(&self) -> u8 {
        self.regs.read_and_clear_isr()
    }

    /// Raise the device's PCI interrupt.
    pub fn interrupt(&self) -> Result<(), VirtioError> {
        self.interrupt.raise_interrupt()
    }

    /// Guest kicked `queue`: run the device hook, wake a worker waiting on
    /// the ring, and interrupt the guest if any ISR bit is now pending.
    pub fn notify(&self, queue: u16) -> Result<(), VirtioError> {
        let Some(q) = self.queue(queue) else {
            log::warn!("[VirtioDevice] Notify queue {} does not exist", queue);
            return Err(VirtioError::InvalidQueue(queue));
        };

        self.ops.queue_notify(self, queue).inspect_err(|e| {
            log::error!("[VirtioDevice] Failed to handle notify on queue {}: {}", queue, e);
        })?;

        q.signal_if_nonempty()?;

        if self.isr_status() != 0 {
            self.interrupt()?;
        }
        Ok(())
    }

    pub fn read_config(&self, offset: u16, width: AccessWidth) -> Result<IoValue, VirtioError> {
        self.ops.read_config(self, offset, width)
    }

    pub fn write_config(&self, offset: u16, value: IoValue) -> Result<(), VirtioError> {
        self.ops.write_config(self, offset, value)
    }

    /// Start a worker that services `queue` until `handler` stops it or the
    /// returned handle cancels it.
    pub fn poll_queue<F>(&self, queue: u16, handler: F) -> Result<PollHandle, VirtioError>
    where
        F: FnMut(&VirtioQueue, u16) -> Result<Completion, VirtioError> + Send + 'static,
    {
        let q = self.queue(queue).ok_or(VirtioError::InvalidQueue(queue))?;
        poll::spawn(q.clone(), self.interrupt.clone(), handler)
    }

    pub(crate) fn registers(&self) -> DeviceRegisters {
        *self.regs.lock()
    }

    pub(crate) fn restore_registers(&self, regs: DeviceRegisters) {
        *self.regs.lock() = regs;
    }
}
