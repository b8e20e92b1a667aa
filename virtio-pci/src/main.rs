use clap::Parser;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use virtio_pci::guest::GuestQueue;
use virtio_pci::virtio::consts::*;
use virtio_pci::virtio::{AccessWidth, Completion, CountingInterrupt, IoValue};
use virtio_pci::{
    DeviceConfig, DeviceOps, DeviceSnapshot, GuestMemory, LegacyPciTransport, PAGE_SIZE,
    VirtioDevice, VirtioError,
};

/// Drives a legacy VirtIO PCI device the way a guest driver would and
/// reports what the transport did.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Guest memory size in MiB
    #[arg(long, default_value_t = 16)]
    mem_mib: usize,

    /// Guest physical address of the first byte of memory
    #[arg(long, default_value_t = 0)]
    mem_base: u64,

    /// VirtIO device id to advertise (4 = entropy source)
    #[arg(long, default_value_t = VIRTIO_RNG_DEVICE_ID)]
    device_id: u16,

    /// Feature bits offered by the device
    #[arg(long, default_value_t = 0)]
    features: u32,

    /// Ring capacity written to QUEUE_SIZE
    #[arg(long, default_value_t = 256)]
    queue_size: u16,

    /// Page frame of the ring (default: second page of guest memory)
    #[arg(long)]
    pfn: Option<u32>,

    /// Number of requests to post
    #[arg(long, default_value_t = 16)]
    requests: u32,

    /// Device-writable buffers per request
    #[arg(long, default_value_t = 2)]
    segments: u32,

    /// Bytes per buffer
    #[arg(long, default_value_t = 512)]
    buffer_len: u32,

    /// Write a bincode snapshot of the device to this path on exit
    #[arg(long)]
    snapshot: Option<std::path::PathBuf>,
}

/// Config space backed by a byte array. Requests are served by the queue
/// worker, so notifies need no device-side work.
struct ScratchConfig {
    bytes: Mutex<Vec<u8>>,
}

impl DeviceOps for ScratchConfig {
    fn read_config(
        &self,
        _device: &VirtioDevice,
        offset: u16,
        width: AccessWidth,
    ) -> Result<IoValue, VirtioError> {
        let bytes = self.bytes.lock().map_err(|e| VirtioError::Device(e.to_string()))?;
        let start = offset as usize;
        let src = bytes
            .get(start..start + width.bytes() as usize)
            .ok_or_else(|| VirtioError::Device(format!("config read past end at {}", offset)))?;
        let mut word = [0u8; 4];
        word[..src.len()].copy_from_slice(src);
        Ok(IoValue::from_u32(width, u32::from_le_bytes(word)))
    }

    fn write_config(
        &self,
        _device: &VirtioDevice,
        offset: u16,
        value: IoValue,
    ) -> Result<(), VirtioError> {
        let mut bytes = self.bytes.lock().map_err(|e| VirtioError::Device(e.to_string()))?;
        let start = offset as usize;
        let n = value.width().bytes() as usize;
        bytes
            .get_mut(start..start + n)
            .ok_or_else(|| VirtioError::Device(format!("config write past end at {}", offset)))?
            .copy_from_slice(&value.as_u32().to_le_bytes()[..n]);
        Ok(())
    }
}

fn print_banner() {
    const BANNER: &str = r#"
    ┌─────────────────────────────────────────────────────────────────────────┐
    │                                                                         │
    │   VirtIO Legacy PCI Transport v0.1.0                                    │
    │   Split virtqueues over port I/O                                        │
    │                                                                         │
    └─────────────────────────────────────────────────────────────────────────┘
"#;
    println!("{}", BANNER);
}

fn print_section(title: &str) {
    println!("\n\x1b[1;36m━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\x1b[0m");
    println!("\x1b[1;33m  ▸ {}\x1b[0m", title);
    println!("\x1b[1;36m━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\x1b[0m");
}

fn print_status(component: &str, status: &str, ok: bool) {
    let status_color = if ok { "\x1b[1;32m" } else { "\x1b[1;31m" };
    let check = if ok { "✓" } else { "✗" };
    println!("    \x1b[0;37m{:<40}\x1b[0m {}[{}] {}\x1b[0m", component, status_color, check, status);
}

fn print_info(key: &str, value: &str) {
    println!("    \x1b[0;90m├─\x1b[0m \x1b[0;37m{:<20}\x1b[0m \x1b[1;97m{}\x1b[0m", key, value);
}

/// Each request takes one descriptor per segment, so a chain must fit the ring.
fn check_segments(segments: u32, queue_size: u16) -> Result<(), String> {
    if segments == 0 || segments > u32::from(queue_size) {
        return Err(format!("--segments must be between 1 and {}", queue_size));
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    print_banner();

    let args = Args::parse();

    // ─── GUEST MEMORY ─────────────────────────────────────────────────────────
    print_section("GUEST MEMORY");
    let mem_size = args
        .mem_mib
        .checked_mul(1024 * 1024)
        .ok_or("Requested memory size is too large")?;
    let mem = Arc::new(GuestMemory::new(args.mem_base, mem_size));
    print_info("Base", &format!("0x{:08X}", mem.base()));
    print_info("Size", &format!("{} MiB ({} bytes)", args.mem_mib, mem_size));
    print_info("Address Range", &format!("0x{:08X} - 0x{:08X}", mem.base(), mem.end()));
    print_status("Guest Memory", "ONLINE", true);

    // ─── PCI FUNCTION ─────────────────────────────────────────────────────────
    print_section("PCI FUNCTION");
    let config = DeviceConfig::new(args.device_id)
        .with_features(args.features)
        .with_queues(1)
        .with_config_size(8);
    let ops = ScratchConfig {
        bytes: Mutex::new(vec![0; config.config_size as usize]),
    };
    let irq = Arc::new(CountingInterrupt::default());
    let device = Arc::new(VirtioDevice::new(config, mem.clone(), Box::new(ops), irq.clone()));
    let pci = LegacyPciTransport::new(device.clone());

    let id = pci.identity();
    print_info("Vendor / Device", &format!("{:04x}:{:04x}", id.vendor_id, id.device_id));
    print_info("Subsystem", &format!("{:04x}:{:04x}", id.subsystem_vendor_id, id.subsystem_id));
    print_info("BAR0", &format!("I/O, {} bytes", id.bar0_size));
    print_info("Queues", &device.num_queues().to_string());
    print_status("Legacy Transport", "ATTACHED", true);

    // ─── DRIVER HANDSHAKE ─────────────────────────────────────────────────────
    print_section("DRIVER HANDSHAKE");
    pci.write(0, VIRTIO_PCI_DEVICE_STATUS, IoValue::U8(0))?;
    pci.write(0, VIRTIO_PCI_DEVICE_STATUS, IoValue::U8(VIRTIO_STATUS_ACKNOWLEDGE))?;
    pci.write(
        0,
        VIRTIO_PCI_DEVICE_STATUS,
        IoValue::U8(VIRTIO_STATUS_ACKNOWLEDGE | VIRTIO_STATUS_DRIVER),
    )?;
    let features = pci.read(0, VIRTIO_PCI_DEVICE_FEATURES, AccessWidth::Dword)?.as_u32();
    pci.write(0, VIRTIO_PCI_DRIVER_FEATURES, IoValue::U32(features))?;
    print_info("Features", &format!("0x{:08x}", features));

    let pfn = match args.pfn {
        Some(pfn) => pfn,
        None => u32::try_from(mem.base() / PAGE_SIZE + 1)?,
    };
    pci.write(0, VIRTIO_PCI_QUEUE_SELECT, IoValue::U16(0))?;
    pci.write(0, VIRTIO_PCI_QUEUE_SIZE, IoValue::U16(args.queue_size))?;
    if let Err(e) = pci.write(0, VIRTIO_PCI_QUEUE_PFN, IoValue::U32(pfn)) {
        print_status("Queue 0", "REJECTED", false);
        return Err(e.into());
    }
    let queue = device.queue(0).ok_or("Device has no queue 0")?.clone();
    let layout = queue.layout().ok_or("Queue 0 has no ring")?;
    print_info("Queue Size", &layout.size.to_string());
    print_info("Descriptors", &format!("0x{:08X}", layout.desc));
    print_info("Avail Ring", &format!("0x{:08X}", layout.avail));
    print_info("Used Ring", &format!("0x{:08X}", layout.used));

    pci.write(
        0,
        VIRTIO_PCI_DEVICE_STATUS,
        IoValue::U8(VIRTIO_STATUS_ACKNOWLEDGE | VIRTIO_STATUS_DRIVER | VIRTIO_STATUS_DRIVER_OK),
    )?;
    let status = pci.read(0, VIRTIO_PCI_DEVICE_STATUS, AccessWidth::Byte)?.as_u32();
    print_info("Status", &format!("0x{:02x}", status));
    print_status("Driver", "OK", true);

    // ─── REQUESTS ─────────────────────────────────────────────────────────────
    print_section("REQUESTS");
    if let Err(e) = check_segments(args.segments, layout.size) {
        print_status("Segments", "INVALID", false);
        return Err(e.into());
    }
    let worker = device.poll_queue(0, |q, head| {
        let mut fill = head as u8;
        let used = q.chain(head)?.walk(|desc, buf| {
            if !desc.is_write_only() {
                return Ok(0);
            }
            fill = fill.wrapping_add(1);
            buf.fill(fill)?;
            Ok(buf.len())
        })?;
        Ok(Completion::done(used))
    })?;

    let data_base = layout.end().div_ceil(PAGE_SIZE) * PAGE_SIZE;
    let per_request = args.segments as u64 * args.buffer_len as u64;
    if !mem.contains(data_base, per_request) {
        print_status("Buffers", "DO NOT FIT", false);
        worker.shutdown()?;
        return Err("Request buffers do not fit in guest memory".into());
    }
    let segments: Vec<(u64, u32, bool)> = (0..args.segments as u64)
        .map(|i| (data_base + i * args.buffer_len as u64, args.buffer_len, true))
        .collect();

    let mut guest = GuestQueue::new(&mem, layout);
    let started = Instant::now();
    let mut bytes = 0u64;
    for n in 0..args.requests {
        let head = guest.add_chain(&segments)?;
        pci.write(0, VIRTIO_PCI_QUEUE_NOTIFY, IoValue::U16(0))?;

        let deadline = Instant::now() + Duration::from_secs(5);
        let elem = loop {
            if let Some(elem) = guest.pop_used()? {
                break elem;
            }
            if Instant::now() >= deadline {
                print_status("Request", "TIMED OUT", false);
                worker.shutdown()?;
                return Err(format!("Request {} was never completed", n).into());
            }
            std::thread::sleep(Duration::from_micros(100));
        };
        log::debug!("Request {} head {} completed with {} bytes", n, head, elem.len);
        bytes += elem.len as u64;
    }
    let elapsed = started.elapsed();

    let isr = pci.read(0, VIRTIO_PCI_ISR_STATUS, AccessWidth::Byte)?.as_u32();
    worker.shutdown()?;

    print_info("Requests", &args.requests.to_string());
    print_info("Bytes Written", &bytes.to_string());
    print_info("Interrupts", &irq.count().to_string());
    print_info("ISR", &format!("0x{:02x}", isr));
    print_info("Elapsed", &format!("{:.2?}", elapsed));
    print_status("Queue 0", "DRAINED", true);

    // ─── SNAPSHOT ─────────────────────────────────────────────────────────────
    if let Some(path) = &args.snapshot {
        print_section("SNAPSHOT");
        let bytes = DeviceSnapshot::capture(&device).to_bytes()?;
        std::fs::write(path, &bytes)?;
        print_info("Path", &path.display().to_string());
        print_info("Size", &format!("{} bytes", bytes.len()));
        print_status("Snapshot", "SAVED", true);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_segments() {
        assert!(check_segments(0, 256).is_err());
        assert!(check_segments(1, 256).is_ok());
        assert!(check_segments(256, 256).is_ok());
        assert!(check_segments(257, 256).is_err());
        assert!(check_segments(u32::MAX, 4).is_err());
    }
}
