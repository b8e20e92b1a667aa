// Legacy VirtIO PCI register offsets within BAR0 (I/O space), no MSI-X.
pub const VIRTIO_PCI_DEVICE_FEATURES: u16 = 0x00;
pub const VIRTIO_PCI_DRIVER_FEATURES: u16 = 0x04;
pub const VIRTIO_PCI_QUEUE_PFN: u16 = 0x08;
pub const VIRTIO_PCI_QUEUE_SIZE: u16 = 0x0c;
pub const VIRTIO_PCI_QUEUE_SELECT: u16 = 0x0e;
pub const VIRTIO_PCI_QUEUE_NOTIFY: u16 = 0x10;
pub const VIRTIO_PCI_DEVICE_STATUS: u16 = 0x12;
pub const VIRTIO_PCI_ISR_STATUS: u16 = 0x13;
pub const VIRTIO_PCI_DEVICE_CFG_BASE: u16 = 0x14;

/// Size of the fixed legacy register block preceding device config space.
pub const VIRTIO_PCI_LEGACY_CONFIG_SIZE: u16 = VIRTIO_PCI_DEVICE_CFG_BASE;

// ISR status bits
pub const VIRTIO_ISR_QUEUE: u8 = 0x1;
pub const VIRTIO_ISR_CONFIG: u8 = 0x2;

// Device status bits written by the guest driver
pub const VIRTIO_STATUS_ACKNOWLEDGE: u8 = 0x01;
pub const VIRTIO_STATUS_DRIVER: u8 = 0x02;
pub const VIRTIO_STATUS_DRIVER_OK: u8 = 0x04;
pub const VIRTIO_STATUS_FEATURES_OK: u8 = 0x08;
pub const VIRTIO_STATUS_FAILED: u8 = 0x80;

// Descriptor flags
pub const VRING_DESC_F_NEXT: u16 = 1;
pub const VRING_DESC_F_WRITE: u16 = 2;
#[allow(dead_code)]
pub const VRING_DESC_F_INDIRECT: u16 = 4;

/// Largest ring the legacy transport can describe.
pub const MAX_QUEUE_SIZE: u16 = 32768;

// PCI identity
pub const PCI_VENDOR_ID_VIRTIO: u16 = 0x1af4;
pub const VIRTIO_PCI_LEGACY_DEVICE_ID_BASE: u16 = 0x0fff;

// Device IDs
pub const VIRTIO_NET_DEVICE_ID: u16 = 1;
pub const VIRTIO_BLK_DEVICE_ID: u16 = 2;
pub const VIRTIO_CONSOLE_DEVICE_ID: u16 = 3;
pub const VIRTIO_RNG_DEVICE_ID: u16 = 4;
pub const VIRTIO_GPU_DEVICE_ID: u16 = 16;
pub const VIRTIO_INPUT_DEVICE_ID: u16 = 18;
