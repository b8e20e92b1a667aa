use crate::virtio::VirtioDevice;
use crate::virtio::VirtioError;
use crate::virtio::device::DeviceRegisters;
use serde::{Deserialize, Serialize};

/// Version identifier for snapshot compatibility checks.
pub const SNAPSHOT_VERSION: &str = "1.0";

/// Serializable transport state of one device. Guest memory (and with it
/// the rings themselves) is not included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub version: String,
    pub device_id: u16,
    pub status: u8,
    pub isr_status: u8,
    pub driver_features: u32,
    pub queue_sel: u16,
    pub queues: Vec<QueueSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub size: u16,
    pub pfn: u32,
    pub next_avail: u16,
}

impl DeviceSnapshot {
    pub fn capture(device: &VirtioDevice) -> Self {
        let regs = device.registers();
        Self {
            version: SNAPSHOT_VERSION.to_string(),
            device_id: device.device_id(),
            status: regs.status,
            isr_status: regs.isr_status,
            driver_features: regs.driver_features,
            queue_sel: regs.queue_sel,
            queues: device.queues().iter().map(|q| q.save()).collect(),
        }
    }

    /// Load this state into `device`, which must have the same device id and
    /// queue count as the one captured. Rings are re-derived from each
    /// queue's pfn against the device's guest memory; if any of them would
    /// not map, the device is left untouched.
    pub fn restore(&self, device: &VirtioDevice) -> Result<(), VirtioError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(VirtioError::Snapshot(format!(
                "Snapshot version mismatch: expected {}, got {}",
                SNAPSHOT_VERSION, self.version
            )));
        }
        if self.device_id != device.device_id() {
            return Err(VirtioError::Snapshot(format!(
                "Snapshot is for device id {}, not {}",
                self.device_id,
                device.device_id()
            )));
        }
        if self.queues.len() != device.queues().len() {
            return Err(VirtioError::Snapshot(format!(
                "Snapshot has {} queues, device has {}",
                self.queues.len(),
                device.queues().len()
            )));
        }

        // Validate every ring before changing anything, so a failed restore
        // leaves the device as it was.
        for (queue, snap) in device.queues().iter().zip(&self.queues) {
            queue.check_restore(snap).map_err(|e| {
                VirtioError::Snapshot(format!("Queue {} cannot be restored: {}", queue.id(), e))
            })?;
        }

        device.restore_registers(DeviceRegisters {
            status: self.status,
            isr_status: self.isr_status,
            driver_features: self.driver_features,
            queue_sel: self.queue_sel,
        });
        for (queue, snap) in device.queues().iter().zip(&self.queues) {
            queue.restore(snap)?;
        }
        log::info!(
            "[Snapshot] Restored device {} with {} queues",
            self.device_id,
            self.queues.len()
        );
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, VirtioError> {
        bincode::serialize(self).map_err(|e| VirtioError::Snapshot(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VirtioError> {
        bincode::deserialize(bytes).map_err(|e| VirtioError::Snapshot(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::{GuestQueue, UsedElem};
    use crate::virtio::consts::{VIRTIO_ISR_QUEUE, VIRTIO_STATUS_ACKNOWLEDGE, VIRTIO_STATUS_DRIVER};
    use crate::virtio::device::tests::{ScratchOps, test_device};

    #[test]
    fn test_snapshot_restores_into_fresh_device() {
        let (device, _) = test_device(2, ScratchOps::new(8));
        device.set_status(VIRTIO_STATUS_ACKNOWLEDGE | VIRTIO_STATUS_DRIVER);
        device.negotiate_features(0x21).unwrap();
        device.select_queue(1).unwrap();
        let queue = device.queue(1).unwrap();
        queue.set_size(8);
        queue.set_pfn(2).unwrap();

        // Consume one chain so the cursor is non-zero
        let mut guest = GuestQueue::new(queue.memory(), queue.layout().unwrap());
        let head = guest.add_chain(&[(0x10000, 4, true)]).unwrap();
        assert_eq!(queue.next_available().unwrap(), Some(head));
        queue.return_buffer(head, 4).unwrap();

        let snap = DeviceSnapshot::capture(&device);
        assert_eq!(snap.queues[1], QueueSnapshot { size: 8, pfn: 2, next_avail: 1 });
        assert_eq!(snap.isr_status, VIRTIO_ISR_QUEUE);

        let bytes = snap.to_bytes().unwrap();
        let loaded = DeviceSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(loaded, snap);

        // A fresh device over the same guest memory picks up where the
        // first left off.
        let (fresh, _) = test_device(2, ScratchOps::new(8));
        fresh.memory().write_bytes(0, &{
            let mut buf = vec![0; 0x20000];
            device.memory().read_bytes(0, &mut buf).unwrap();
            buf
        }).unwrap();
        loaded.restore(&fresh).unwrap();

        assert_eq!(fresh.status(), VIRTIO_STATUS_ACKNOWLEDGE | VIRTIO_STATUS_DRIVER);
        assert_eq!(fresh.driver_features(), 0x21);
        assert_eq!(fresh.queue_sel(), 1);
        assert_eq!(fresh.read_and_clear_isr(), VIRTIO_ISR_QUEUE);

        let restored = fresh.queue(1).unwrap();
        assert_eq!(restored.layout(), queue.layout());
        assert_eq!(restored.next_avail_index(), 1);
        assert_eq!(restored.next_available().unwrap(), None);
        assert!(!fresh.queue(0).unwrap().is_ready());

        let mut guest = GuestQueue::new(restored.memory(), restored.layout().unwrap());
        guest.set_avail_idx(1).unwrap();
        guest.pop_used().unwrap();
        let next = guest.add_chain(&[(0x10000, 4, true)]).unwrap();
        assert_eq!(restored.next_available().unwrap(), Some(next));
        restored.return_buffer(next, 2).unwrap();
        assert_eq!(guest.pop_used().unwrap(), Some(UsedElem { id: next as u32, len: 2 }));
    }

    #[test]
    fn test_snapshot_rejects_mismatches() {
        let (device, _) = test_device(1, ScratchOps::new(8));
        let snap = DeviceSnapshot::capture(&device);

        let (other, _) = test_device(2, ScratchOps::new(8));
        assert!(matches!(snap.restore(&other), Err(VirtioError::Snapshot(_))));

        let mut stale = snap.clone();
        stale.version = "0.1".to_string();
        assert!(matches!(stale.restore(&device), Err(VirtioError::Snapshot(_))));

        let mut foreign = snap.clone();
        foreign.device_id += 1;
        assert!(matches!(foreign.restore(&device), Err(VirtioError::Snapshot(_))));

        assert!(matches!(
            DeviceSnapshot::from_bytes(&[1, 2, 3]),
            Err(VirtioError::Snapshot(_))
        ));
    }

    #[test]
    fn test_failed_restore_leaves_device_untouched() {
        let (device, _) = test_device(2, ScratchOps::new(8));
        let mut snap = DeviceSnapshot::capture(&device);
        snap.status = 0x07;
        snap.driver_features = 0x21;
        snap.queues[0] = QueueSnapshot { size: 4, pfn: 1, next_avail: 0 };
        snap.queues[1] = QueueSnapshot { size: 4, pfn: 0x10_0000, next_avail: 0 };

        assert!(matches!(snap.restore(&device), Err(VirtioError::Snapshot(_))));
        assert_eq!(device.status(), 0);
        assert_eq!(device.driver_features(), 0);
        assert!(!device.queue(0).unwrap().is_ready());

        // A size the transport would never accept is refused the same way
        snap.queues[1] = QueueSnapshot { size: 6, pfn: 4, next_avail: 0 };
        assert!(matches!(snap.restore(&device), Err(VirtioError::Snapshot(_))));
        assert!(!device.queue(0).unwrap().is_ready());

        snap.queues[1] = QueueSnapshot { size: 8, pfn: 4, next_avail: 0 };
        snap.restore(&device).unwrap();
        assert_eq!(device.status(), 0x07);
        assert!(device.queue(0).unwrap().is_ready());
        assert!(device.queue(1).unwrap().is_ready());
    }
}
