use super::VirtioError;
use super::consts::*;
use super::device::{DeviceConfig, VirtioDevice};
use super::queue::VirtioQueue;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Width of a guest port I/O access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    Byte = 1,
    Word = 2,
    Dword = 4,
}

impl AccessWidth {
    pub fn bytes(self) -> u8 {
        self as u8
    }

    pub fn from_bytes(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::Byte),
            2 => Some(Self::Word),
            4 => Some(Self::Dword),
            _ => None,
        }
    }
}

/// Value carried by a port I/O access; the variant encodes the width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoValue {
    U8(u8),
    U16(u16),
    U32(u32),
}

impl IoValue {
    /// Truncate `value` to `width`.
    pub fn from_u32(width: AccessWidth, value: u32) -> Self {
        match width {
            AccessWidth::Byte => Self::U8(value as u8),
            AccessWidth::Word => Self::U16(value as u16),
            AccessWidth::Dword => Self::U32(value),
        }
    }

    pub fn width(self) -> AccessWidth {
        match self {
            Self::U8(_) => AccessWidth::Byte,
            Self::U16(_) => AccessWidth::Word,
            Self::U32(_) => AccessWidth::Dword,
        }
    }

    /// Zero-extended value.
    pub fn as_u32(self) -> u32 {
        match self {
            Self::U8(v) => v as u32,
            Self::U16(v) => v as u32,
            Self::U32(v) => v,
        }
    }
}

/// The device's interrupt pin on the PCI bus.
pub trait InterruptLine: Send + Sync {
    fn raise_interrupt(&self) -> Result<(), VirtioError>;
}

/// Interrupt line that only counts how often it was raised.
#[derive(Debug, Default)]
pub struct CountingInterrupt {
    count: AtomicU64,
}

impl CountingInterrupt {
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}

impl InterruptLine for CountingInterrupt {
    fn raise_interrupt(&self) -> Result<(), VirtioError> {
        self.count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// PCI config space identity of a legacy VirtIO device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciIdentity {
    pub vendor_id: u16,
    pub device_id: u16,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    pub class_code: u32,
    /// Size of the I/O BAR: legacy register block plus device config.
    pub bar0_size: u16,
}

impl PciIdentity {
    pub fn for_device(config: &DeviceConfig) -> Self {
        Self {
            vendor_id: PCI_VENDOR_ID_VIRTIO,
            device_id: VIRTIO_PCI_LEGACY_DEVICE_ID_BASE.wrapping_add(config.device_id),
            subsystem_vendor_id: 0,
            subsystem_id: config.device_id,
            class_code: 0,
            bar0_size: VIRTIO_PCI_LEGACY_CONFIG_SIZE.saturating_add(config.config_size),
        }
    }
}

/// Fixed registers of the legacy header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegacyRegister {
    DeviceFeatures,
    DriverFeatures,
    QueuePfn,
    QueueSize,
    QueueSelect,
    QueueNotify,
    DeviceStatus,
    IsrStatus,
}

impl LegacyRegister {
    fn decode(port: u16) -> Option<Self> {
        let reg = match port {
            VIRTIO_PCI_DEVICE_FEATURES => Self::DeviceFeatures,
            VIRTIO_PCI_DRIVER_FEATURES => Self::DriverFeatures,
            VIRTIO_PCI_QUEUE_PFN => Self::QueuePfn,
            VIRTIO_PCI_QUEUE_SIZE => Self::QueueSize,
            VIRTIO_PCI_QUEUE_SELECT => Self::QueueSelect,
            VIRTIO_PCI_QUEUE_NOTIFY => Self::QueueNotify,
            VIRTIO_PCI_DEVICE_STATUS => Self::DeviceStatus,
            VIRTIO_PCI_ISR_STATUS => Self::IsrStatus,
            _ => return None,
        };
        Some(reg)
    }

    fn width(self) -> AccessWidth {
        match self {
            Self::DeviceFeatures | Self::DriverFeatures | Self::QueuePfn => AccessWidth::Dword,
            Self::QueueSize | Self::QueueSelect | Self::QueueNotify => AccessWidth::Word,
            Self::DeviceStatus | Self::IsrStatus => AccessWidth::Byte,
        }
    }

    fn readable(self) -> bool {
        !matches!(self, Self::DriverFeatures | Self::QueueSelect | Self::QueueNotify)
    }

    fn writable(self) -> bool {
        !matches!(self, Self::DeviceFeatures | Self::IsrStatus)
    }
}

/// Legacy VirtIO PCI transport: decodes guest port I/O on BAR0 into device
/// and queue register operations.
///
/// Every access is checked for BAR, port and width before anything is
/// touched, so a rejected access has no side effects.
pub struct LegacyPciTransport {
    device: Arc<VirtioDevice>,
}

impl LegacyPciTransport {
    pub fn new(device: Arc<VirtioDevice>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Arc<VirtioDevice> {
        &self.device
    }

    pub fn identity(&self) -> PciIdentity {
        self.device.pci_identity()
    }

    fn check_width(port: u16, reg: LegacyRegister, actual: AccessWidth) -> Result<(), VirtioError> {
        let expected = reg.width();
        if actual != expected {
            log::warn!(
                "[LegacyPci] {}-byte access to port {:#x}, expected {}",
                actual.bytes(),
                port,
                expected.bytes()
            );
            return Err(VirtioError::AccessWidth {
                port,
                expected: expected.bytes(),
                actual: actual.bytes(),
            });
        }
        Ok(())
    }

    fn selected_queue(&self) -> Result<&Arc<VirtioQueue>, VirtioError> {
        let sel = self.device.queue_sel();
        self.device.queue(sel).ok_or(VirtioError::InvalidQueue(sel))
    }

    /// Guest read of `width` bytes at `port` of `bar`.
    pub fn read(&self, bar: u8, port: u16, width: AccessWidth) -> Result<IoValue, VirtioError> {
        if bar != 0 {
            return Err(VirtioError::Unsupported { bar, port });
        }

        let reg = match LegacyRegister::decode(port) {
            Some(reg) if reg.readable() => reg,
            None if port >= VIRTIO_PCI_DEVICE_CFG_BASE => {
                return self
                    .device
                    .read_config(port - VIRTIO_PCI_DEVICE_CFG_BASE, width);
            }
            _ => {
                log::warn!("[LegacyPci] Unhandled virtio device read {:#x}", port);
                return Err(VirtioError::Unsupported { bar, port });
            }
        };
        Self::check_width(port, reg, width)?;

        let value = match reg {
            LegacyRegister::DeviceFeatures => IoValue::U32(self.device.features()),
            LegacyRegister::QueuePfn => IoValue::U32(self.selected_queue()?.pfn()),
            LegacyRegister::QueueSize => IoValue::U16(self.selected_queue()?.size()),
            LegacyRegister::DeviceStatus => IoValue::U8(self.device.status()),
            LegacyRegister::IsrStatus => IoValue::U8(self.device.read_and_clear_isr()),
            LegacyRegister::DriverFeatures
            | LegacyRegister::QueueSelect
            | LegacyRegister::QueueNotify => return Err(VirtioError::Unsupported { bar, port }),
        };
        log::trace!("[LegacyPci] read {:#x} -> {:?}", port, value);
        Ok(value)
    }

    /// Guest write of `value` at `port` of `bar`.
    pub fn write(&self, bar: u8, port: u16, value: IoValue) -> Result<(), VirtioError> {
        if bar != 0 {
            return Err(VirtioError::Unsupported { bar, port });
        }

        let reg = match LegacyRegister::decode(port) {
            Some(reg) if reg.writable() => reg,
            None if port >= VIRTIO_PCI_DEVICE_CFG_BASE => {
                return self
                    .device
                    .write_config(port - VIRTIO_PCI_DEVICE_CFG_BASE, value);
            }
            _ => {
                log::warn!("[LegacyPci] Unhandled virtio device write {:#x}", port);
                return Err(VirtioError::Unsupported { bar, port });
            }
        };
        Self::check_width(port, reg, value.width())?;
        log::trace!("[LegacyPci] write {:#x} <- {:?}", port, value);

        let v = value.as_u32();
        match reg {
            LegacyRegister::DriverFeatures => self.device.negotiate_features(v),
            LegacyRegister::DeviceStatus => {
                self.device.set_status(v as u8);
                Ok(())
            }
            LegacyRegister::QueuePfn => self.selected_queue()?.set_pfn(v),
            LegacyRegister::QueueSize => {
                self.selected_queue()?.set_size(v as u16);
                Ok(())
            }
            LegacyRegister::QueueSelect => self.device.select_queue(v as u16),
            LegacyRegister::QueueNotify => self.device.notify(v as u16),
            LegacyRegister::DeviceFeatures | LegacyRegister::IsrStatus => {
                Err(VirtioError::Unsupported { bar, port })
            }
        }
    }
}
