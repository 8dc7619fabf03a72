use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use serde::Serialize;
use tether::{
    error::AllocationError,
    ra::{
        memory::{MemoryAllocation, MemoryAllocator},
        multi_fence::MultiFenceHolder,
        slots::{SlotPool, SlotState},
        tracked::{SlotDependant, TrackedResource},
    },
    rhi::{
        resources::{MemoryLocation, MemoryRequirements},
        soft::{SoftDevice, SoftDeviceDesc, SoftFence},
    },
    settings::{TrackerSettings, read_settings},
};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;

const UNIFORM_SIZE: u64 = 64 * 1024;
const STAGING_SIZE: u64 = 16 * 1024;
const GPU_LATENCY: Duration = Duration::from_millis(2);

struct Buffer {
    allocation: MemoryAllocation<SoftDevice>,
    released: Arc<AtomicUsize>,
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

type TrackedBuffer = TrackedResource<Buffer, SoftDevice>;

#[derive(Debug, Serialize)]
struct Report {
    frames: usize,
    slots: usize,
    discipline: String,
    released_buffers: usize,
    clamped_ranges: u64,
    open_blocks: usize,
    allocated_bytes: u64,
    total_block_bytes: u64,
    live_fences: usize,
    live_allocations: usize,
}

struct Frames {
    device: Arc<SoftDevice>,
    pool: SlotPool<SoftDevice>,
    allocator: MemoryAllocator<SoftDevice>,
    released: Arc<AtomicUsize>,
    granularity: u64,
}

impl Frames {
    fn buffer(
        &self,
        size: u64,
        location: MemoryLocation,
    ) -> Result<TrackedBuffer, AllocationError> {
        let allocation = self
            .allocator
            .allocate(MemoryRequirements::new(size, 256), location)?;

        let slots = self.pool.slot_count();
        let waitable = MultiFenceHolder::with_usage(slots, size, self.granularity);

        Ok(TrackedResource::new(
            Buffer {
                allocation,
                released: Arc::clone(&self.released),
            },
            slots,
        )
        .with_waitable(Arc::new(waitable)))
    }

    fn run(&self, frames: usize) -> Result<u64, Box<dyn std::error::Error>> {
        let (gpu_tx, gpu_rx) = mpsc::channel::<SoftFence>();

        let gpu = thread::spawn(move || {
            for fence in gpu_rx {
                thread::sleep(GPU_LATENCY);
                fence.signal();
            }
        });

        let uniforms = Arc::new(self.buffer(UNIFORM_SIZE, MemoryLocation::CpuToGpu)?);
        let mut clamped = 0;
        let stride = UNIFORM_SIZE / self.pool.slot_count() as u64;

        for frame in 0..frames {
            let slot = frame % self.pool.slot_count();

            if self.pool.state(slot) == SlotState::Submitted {
                self.pool.retire(slot)?;
            }

            let scope = self.pool.begin(slot)?;

            let offset = stride * slot as u64;
            let uniform_ptr = uniforms
                .get_range(&scope, offset, stride, true)
                .allocation
                .host_ptr();
            if let Some(ptr) = uniform_ptr {
                unsafe {
                    std::ptr::write_bytes(ptr.add(offset).as_ptr(), frame as u8, stride as usize);
                }
            }

            // Transient data lives exactly as long as the slot that reads it.
            let staging = Arc::new(self.buffer(STAGING_SIZE, MemoryLocation::CpuToGpu)?);
            let vertices = Arc::new(
                self.buffer(STAGING_SIZE * 4, MemoryLocation::GpuToGpu)?
                    .with_children([Arc::clone(&staging) as Arc<dyn SlotDependant<SoftDevice>>]),
            );

            // Overruns the buffer on purpose, like a driver fetching past the bound range.
            drop(vertices.get_range(&scope, STAGING_SIZE * 3, STAGING_SIZE * 2, false));
            clamped += vertices
                .waitable()
                .and_then(|w| w.usage())
                .map_or(0, |usage| usage.clamped_ranges());
            vertices.dispose();

            let fence = self.pool.submit(slot);
            if let Some(native) = fence.get_unsafe() {
                gpu_tx.send(native.clone())?;
            }

            if frame % 16 == 15 {
                let waitable = uniforms.waitable().expect("uniform buffer has a waitable");
                waitable.wait_for_range(offset, stride)?;

                info!(
                    "Frame {}: {} blocks, {} bytes allocated",
                    frame,
                    self.allocator.block_count(),
                    self.allocator.allocated_bytes()
                );
            }
        }

        drop(gpu_tx);
        self.pool.retire_all()?;

        if gpu.join().is_err() {
            error!("Simulated GPU thread panicked");
        }

        uniforms.dispose();

        Ok(clamped)
    }

    fn report(&self, frames: usize, clamped_ranges: u64) -> Report {
        Report {
            frames,
            slots: self.pool.slot_count(),
            discipline: format!("{:?}", self.pool.discipline()),
            released_buffers: self.released.load(Ordering::Relaxed),
            clamped_ranges,
            open_blocks: self.allocator.block_count(),
            allocated_bytes: self.allocator.allocated_bytes(),
            total_block_bytes: self.allocator.total_block_bytes(),
            live_fences: self.device.live_fences(),
            live_allocations: self.device.live_allocations(),
        }
    }
}

fn run(settings: &TrackerSettings) -> Result<Report, Box<dyn std::error::Error>> {
    settings.validate()?;

    let device = Arc::new(SoftDevice::new(
        SoftDeviceDesc::default()
            .with_concurrent_wait_unsupported(settings.concurrent_wait_unsupported.unwrap_or(false)),
    ));

    let frames = Frames {
        pool: SlotPool::new(Arc::clone(&device), settings),
        allocator: MemoryAllocator::new(Arc::clone(&device), settings),
        device,
        released: Arc::new(AtomicUsize::new(0)),
        granularity: settings.granularity,
    };

    let clamped = frames.run(settings.frames)?;

    Ok(frames.report(settings.frames, clamped))
}

fn main() {
    let console_log = tracing_subscriber::fmt::Layer::new()
        .with_ansi(true)
        .with_writer(std::io::stdout);
    let subscriber = tracing_subscriber::registry().with(console_log);
    let _ = tracing::subscriber::set_global_default(subscriber);

    let settings = read_settings();

    match run(&settings) {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(err) => error!("Failed to serialize report: {}", err),
        },
        Err(err) => {
            error!("Simulation failed: {}", err);
            std::process::exit(1);
        }
    }
}
