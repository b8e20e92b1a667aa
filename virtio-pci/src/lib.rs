pub mod guest;
pub mod memory;
pub mod snapshot;
pub mod virtio;

pub use memory::{GuestMemory, GuestRegion, MemoryError, PAGE_SIZE};
pub use snapshot::{DeviceSnapshot, QueueSnapshot, SNAPSHOT_VERSION};
pub use virtio::{
    DeviceConfig, DeviceOps, LegacyPciTransport, VirtioDevice, VirtioError, VirtioQueue,
};
