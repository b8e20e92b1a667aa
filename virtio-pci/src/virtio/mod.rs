//! Legacy VirtIO-over-PCI transport.
//!
//! The guest drives a device through port I/O on BAR0 (`pci`), which updates
//! device and queue registers (`device`, `queue`). Queue notifications wake
//! background workers (`poll`) that pull descriptor chains (`chain`) out of
//! the shared rings (`ring`), hand the guest buffers to device logic and
//! return them on the used ring.
//!
//! ## Locking
//!
//! Each device has one device lock (status, ISR, negotiated features,
//! selected queue) and each queue has its own queue lock (size, pfn, ring
//! views, cursor). A queue lock is never held while the device lock is taken
//! or the other way around, and no lock is held while device-specific
//! callbacks run.

pub mod chain;
pub mod consts;
pub mod device;
pub mod pci;
pub mod poll;
pub mod queue;
pub mod ring;

pub use chain::{Descriptor, DescriptorChain};
pub use device::{DeviceConfig, DeviceOps, VirtioDevice};
pub use pci::{AccessWidth, CountingInterrupt, InterruptLine, IoValue, LegacyPciTransport, PciIdentity};
pub use poll::{Completion, PollControl, PollHandle};
pub use queue::{QueueProgress, VirtioQueue};
pub use ring::{RingLayout, ring_index};

use crate::memory::MemoryError;
use thiserror::Error;

/// Transport errors.
///
/// All of these are reported synchronously to whoever triggered the
/// operation (a vCPU exit or a queue worker); none are retried.
#[derive(Debug, Error)]
pub enum VirtioError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("queue {queue}: ring at pfn {pfn:#x} is outside of guest memory")]
    RingOutOfRange { queue: u16, pfn: u32 },

    #[error("queue {queue}: invalid size {size}")]
    InvalidQueueSize { queue: u16, size: u16 },

    #[error("queue {0} has no ring mapped")]
    QueueNotReady(u16),

    #[error("port {port:#x}: {actual}-byte access, register is {expected} bytes wide")]
    AccessWidth { port: u16, expected: u8, actual: u8 },

    #[error("driver features {driver:#x} do not match device features {device:#x}")]
    FeatureMismatch { device: u32, driver: u32 },

    #[error("queue {0} does not exist")]
    InvalidQueue(u16),

    #[error("unsupported access to BAR {bar} port {port:#x}")]
    Unsupported { bar: u8, port: u16 },

    #[error("descriptor index {index} out of range for queue size {size}")]
    DescriptorIndex { index: u16, size: u16 },

    #[error("descriptor chain from head {head} exceeds {limit} links")]
    ChainTooLong { head: u16, limit: u16 },

    #[error("device error: {0}")]
    Device(String),

    #[error("interrupt delivery failed: {0}")]
    Interrupt(String),

    #[error("failed to spawn queue worker: {0}")]
    Worker(#[source] std::io::Error),

    #[error("queue worker panicked")]
    WorkerPanicked,

    #[error("snapshot error: {0}")]
    Snapshot(String),
}
