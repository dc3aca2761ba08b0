// =============================================================================
// GPU STATE TRACKER DEMO - frame loop over a tracked mip chain
// =============================================================================
//
// Drives a DeviceSession for a fixed number of frames on either the simulated or the
// Vulkan backend. Each frame uploads constants, renders into mip 0, downsamples the
// chain mip by mip and samples the result; the tracker works out every transition.
//
// FRAME FLOW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  upload-constants   constants  -> COPY_DEST                     │
// │  draw               mip 0 -> RENDER_TARGET, depth -> DEPTH_WRITE│
// │  downsample         mip n-1 -> PIXEL_SR, mip n -> RENDER_TARGET │
// │  composite          whole chain -> SHADER_RESOURCE              │
// │  Flush              signal, reclaim, reset next slot            │
// └─────────────────────────────────────────────────────────────────┘
//
// A lost device tears the session down and builds a new one, up to
// demo.max_device_rebuilds times.
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_state_tracker::backend::{UploadHeap, VulkanBuffer, VulkanDevice, VulkanImage, VulkanQueue};
use gpu_state_tracker::config::{BackendKind, Config, DemoConfig};
use gpu_state_tracker::frame::{CommandQueue, Retired};
use gpu_state_tracker::sim::{SimGpu, SimQueue};
use gpu_state_tracker::state::REMAINING;
use gpu_state_tracker::{
    is_device_lost, AllocationError, DeviceError, DeviceSession, ResourceDesc, ResourceStateTracker, Scope,
    Subresource, SubresourceLayout, UploadAllocation, UploadRing, UsageState, ViewDesc,
};
use std::fs::OpenOptions;
use std::io::Write;
use std::time::Instant;

const CONSTANTS_SIZE: u64 = 256;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    // Initialize logging
    init_logging(&config);
    log::info!("Starting state tracker demo ({:?} backend)", config.demo.backend);
    log::info!(
        "{} frames, {}x{} texture, {} mips x {} layers",
        config.demo.frames,
        config.demo.texture_size,
        config.demo.texture_size,
        config.demo.mip_levels,
        config.demo.array_layers
    );

    let start = Instant::now();
    let mut next_frame = 0;
    let mut rebuilds = 0;
    loop {
        let result = match config.demo.backend {
            BackendKind::Simulated => run_simulated(&config, &mut next_frame, rebuilds == 0),
            BackendKind::Vulkan => run_vulkan(&config, &mut next_frame),
        };

        match result {
            Ok(()) => break,
            Err(e) if is_device_lost(&e) && rebuilds < config.demo.max_device_rebuilds => {
                rebuilds += 1;
                log::error!(
                    "{:#} at frame {}; rebuilding device session ({}/{})",
                    e,
                    next_frame,
                    rebuilds,
                    config.demo.max_device_rebuilds
                );
            }
            Err(e) => return Err(e),
        }
    }

    log::info!(
        "Rendered {} frames in {:.2?} ({} device rebuilds)",
        next_frame,
        start.elapsed(),
        rebuilds
    );
    Ok(())
}

fn init_logging(config: &Config) {
    use env_logger::Builder;

    let mut builder = Builder::from_default_env();
    builder.filter_level(config.log_level());
    builder.init();

    // Create/clear log file if enabled
    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== GPU State Tracker Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

// =============================================================================
// SCENE
// =============================================================================

/// The tracked resources one session renders with.
struct Scene {
    color: ResourceStateTracker,
    depth: ResourceStateTracker,
    constants: ResourceStateTracker,
    /// GPU objects behind color, depth and constants, in that order
    objects: Vec<Retired>,
}

impl Scene {
    fn trackers<Q: CommandQueue>(
        session: &DeviceSession<Q>,
        color: ResourceDesc,
        depth: ResourceDesc,
        constants: ResourceDesc,
        objects: Vec<Retired>,
    ) -> Self {
        Self {
            color: session.create_tracker(color, UsageState::COMMON),
            depth: session.create_tracker(depth, UsageState::COMMON),
            constants: session.create_tracker(constants, UsageState::COMMON),
            objects,
        }
    }

    /// Hand every resource to the session for destruction after the current frame.
    fn retire<Q: CommandQueue>(self, session: &DeviceSession<Q>) {
        let trackers = [self.color, self.depth, self.constants];
        for (tracker, object) in trackers.into_iter().zip(self.objects) {
            session.destroy_resource(tracker, object);
        }
    }
}

type Uploader<'a> = &'a dyn Fn(&[u8]) -> Result<UploadAllocation, AllocationError>;

// =============================================================================
// BACKENDS
// =============================================================================

fn run_simulated(config: &Config, next_frame: &mut u64, inject_loss: bool) -> Result<()> {
    // The "GPU" stays one frame behind, like a real one that keeps up
    let gpu = SimGpu::with_lag(1);
    if inject_loss {
        if let Some(value) = config.demo.device_loss_at_frame {
            log::warn!("Simulated device will be lost at fence value {}", value);
            gpu.lose_at(value);
        }
    }

    let ring = UploadRing::new(config.upload.ring_size, config.upload.alignment);
    let mut session = DeviceSession::new(SimQueue::new(gpu.clone()), &config.frame)?;
    session.add_listener(Box::new(ring.clone()));

    let demo = &config.demo;
    let scene = Scene::trackers(
        &session,
        ResourceDesc::texture(
            "color",
            SubresourceLayout::new(demo.mip_levels, demo.array_layers, 1),
            gpu.next_handle(),
        ),
        ResourceDesc::depth_stencil("depth", 1, demo.array_layers, gpu.next_handle()),
        ResourceDesc::buffer("constants", gpu.next_handle()),
        vec![
            Box::new(gpu.object("color")) as Retired,
            Box::new(gpu.object("depth")),
            Box::new(gpu.object("constants")),
        ],
    );

    let upload = |data: &[u8]| ring.allocate(data.len() as u64);
    let result = run_frames(&mut session, &scene, &upload, demo, next_frame);
    finish(session, scene, result)?;

    log::info!("Simulated GPU recorded {} barriers", gpu.barriers().len());
    Ok(())
}

fn run_vulkan(config: &Config, next_frame: &mut u64) -> Result<()> {
    let device = VulkanDevice::new("gpu-state-tracker", config.debug.validation_layers)?;
    let demo = &config.demo;

    // Outlives the session: the GPU may read it until the final sync
    let heap = UploadHeap::new(device.clone(), config.upload.ring_size, config.upload.alignment)?;

    let mut session = DeviceSession::new(VulkanQueue::new(device.clone()), &config.frame)?;
    session.add_listener(Box::new(heap.ring()));

    let extent = vk::Extent2D {
        width: demo.texture_size,
        height: demo.texture_size,
    };
    let color = VulkanImage::new(
        device.clone(),
        "color",
        vk::Format::R8G8B8A8_UNORM,
        extent,
        SubresourceLayout::new(demo.mip_levels, demo.array_layers, 1),
        vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
    )?;
    let depth = VulkanImage::new(
        device.clone(),
        "depth",
        vk::Format::D32_SFLOAT_S8_UINT,
        extent,
        SubresourceLayout::new(1, demo.array_layers, 2),
        vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
    )?;
    let constants = VulkanBuffer::new(
        device.clone(),
        "constants",
        CONSTANTS_SIZE,
        vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuOnly,
    )?;

    let scene = Scene::trackers(
        &session,
        color.desc(),
        depth.desc(),
        constants.desc(),
        vec![Box::new(color) as Retired, Box::new(depth), Box::new(constants)],
    );

    let upload = |data: &[u8]| heap.write(data);
    let result = run_frames(&mut session, &scene, &upload, demo, next_frame);
    finish(session, scene, result)
}

/// Shut a session down after its frame loop, however that loop ended.
fn finish<Q: CommandQueue>(
    mut session: DeviceSession<Q>,
    scene: Scene,
    result: Result<(), DeviceError>,
) -> Result<()> {
    match result {
        Ok(()) => {
            scene.retire(&session);
            session.flush().context("Flushing the final frame")?;
            session.sync().context("Waiting for the GPU at shutdown")?;
            log::info!("Session finished at fence value {}", session.counters().submitted());
            Ok(())
        }
        Err(err) if err.is_lost() => {
            session.abandon();
            drop(scene);
            Err(err).context("Device lost")
        }
        Err(err) => {
            // Session first: its Drop waits for the GPU before the objects go
            drop(session);
            drop(scene);
            Err(err.into())
        }
    }
}

// =============================================================================
// FRAME LOOP
// =============================================================================

fn run_frames<Q: CommandQueue>(
    session: &mut DeviceSession<Q>,
    scene: &Scene,
    upload: Uploader<'_>,
    demo: &DemoConfig,
    next_frame: &mut u64,
) -> Result<(), DeviceError> {
    while *next_frame < demo.frames {
        let frame = *next_frame;
        record_frame(session, scene, upload, frame)?;
        let value = session.flush()?;
        *next_frame += 1;

        if frame % 30 == 0 {
            let counters = session.counters();
            log::info!(
                "Frame {} signaled as {} (completed {}, {} in flight)",
                frame,
                value,
                counters.completed(),
                counters.in_flight()
            );
        }
    }
    Ok(())
}

fn record_frame<Q: CommandQueue>(
    session: &mut DeviceSession<Q>,
    scene: &Scene,
    upload: Uploader<'_>,
    frame: u64,
) -> Result<(), DeviceError> {
    let mip_levels = scene.color.layout().mip_levels;

    session.run_operation("upload-constants", |s| {
        let constants = frame.to_le_bytes().repeat(CONSTANTS_SIZE as usize / 8);
        let staging = upload(&constants)?;
        let _dst = s.enter_state(&scene.constants, UsageState::COPY_DEST, Scope::All)?;
        s.commit_resource_barriers();
        log::trace!("Frame {}: constants staged at offset {}", frame, staging.offset);
        Ok(())
    })?;

    session.run_operation("draw", |s| {
        let _constants = s.enter_state(
            &scene.constants,
            UsageState::VERTEX_AND_CONSTANT_BUFFER,
            ViewDesc::ConstantBuffer,
        )?;
        let _depth = s.enter_state(
            &scene.depth,
            UsageState::DEPTH_WRITE,
            ViewDesc::DepthStencil {
                mip_slice: 0,
                first_array_slice: 0,
                array_size: REMAINING,
            },
        )?;
        let _target = s.enter_state(&scene.color, UsageState::RENDER_TARGET, ViewDesc::render_target(0))?;
        s.commit_resource_barriers();
        Ok(())
    })?;

    session.run_operation("downsample", |s| {
        for mip in 1..mip_levels {
            let _src = s.enter_state(
                &scene.color,
                UsageState::PIXEL_SHADER_RESOURCE,
                Subresource::new(mip - 1, 0, 0),
            )?;
            let _dst = s.enter_state(&scene.color, UsageState::RENDER_TARGET, ViewDesc::render_target(mip))?;
            s.commit_resource_barriers();
        }
        Ok(())
    })?;

    if frame == 1 {
        // Sampling a texture that is still bound as a target: reported and skipped
        session.run_operation("read-while-writing", |s| {
            let _target = s.enter_state(&scene.color, UsageState::RENDER_TARGET, ViewDesc::render_target(0))?;
            let _read = s.enter_state(&scene.color, UsageState::PIXEL_SHADER_RESOURCE, ViewDesc::whole_texture())?;
            Ok(())
        })?;
    }

    session.run_operation("composite", |s| {
        let _color = s.enter_state(&scene.color, UsageState::ALL_SHADER_RESOURCE, ViewDesc::whole_texture())?;
        let _depth = s.enter_state(&scene.depth, UsageState::DEPTH_READ, None::<ViewDesc>)?;
        s.commit_resource_barriers();
        Ok(())
    })?;

    Ok(())
}
