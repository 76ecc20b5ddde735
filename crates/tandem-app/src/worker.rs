// SPDX-License-Identifier: CEPL-1.0
//! One render thread per window.
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _, Result};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use tandem_core::StopFlag;
use tandem_vk::{
    ash, find_memory_type, vk, Context, FrameStatus, SwapchainConfig, Swapchain, SyncQueue,
};
use tracing::{debug, error, info, warn};

/// Offset granularity for per-slot regions of the uniform buffer.
const UNIFORM_STRIDE: vk::DeviceSize = 256;
const UNIFORM_SLOTS: usize = 8;
const SUSPENDED_POLL: Duration = Duration::from_millis(16);

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct FrameUniforms {
    transform: [[f32; 4]; 4],
    tint: [f32; 4],
}

impl FrameUniforms {
    fn at(seconds: f32, base: [f32; 4]) -> Self {
        let pulse = 0.5 + 0.5 * (seconds * 0.5).sin();
        let tint = Vec4::from_array(base) * pulse;
        Self {
            transform: Mat4::from_rotation_z(seconds).to_cols_array_2d(),
            tint: tint.with_w(1.0).to_array(),
        }
    }
}

pub struct WorkerCfg {
    pub name: String,
    pub clear_color: [f32; 4],
    pub frame_interval: Duration,
}

/// Takes ownership of `surface`; it is destroyed with the thread's swapchain.
pub fn spawn(
    ctx: Arc<Context>,
    surface: vk::SurfaceKHR,
    cfg: WorkerCfg,
    stop: StopFlag,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(cfg.name.clone())
        .spawn(move || {
            if let Err(e) = run(&ctx, surface, &cfg, &stop) {
                error!("{}: {e:#}", cfg.name);
            }
            ctx.descriptor_pools().release_current_thread();
        })
        .context("spawn render thread")
}

fn run(ctx: &Context, surface: vk::SurfaceKHR, cfg: &WorkerCfg, stop: &StopFlag) -> Result<()> {
    let device = ctx.device().clone();
    let mut sc = ctx.create_swapchain(
        surface,
        SwapchainConfig {
            clear_color: cfg.clear_color,
            ..Default::default()
        },
    )?;
    if let Some(err) = sc.init_error() {
        bail!("swapchain not ready: {err}");
    }

    let mut ring = UniformRing::empty();
    let res = unsafe { ring.init(ctx) }.and_then(|()| {
        let static_device = device.clone();
        sc.set_static_commands(move |cmd, _slot, begin| unsafe {
            record_static(&static_device, cmd, &begin.info())
        })?;
        frame_loop(&mut sc, &ctx.graphics_queue(), &device, &ring, cfg, stop)
    });

    // STRICT TEARDOWN: the swapchain waits out its in-flight frames before
    // the buffer they read goes away.
    drop(sc);
    unsafe { ring.destroy(&device) };
    res
}

fn frame_loop(
    sc: &mut Swapchain,
    queue: &SyncQueue,
    device: &ash::Device,
    ring: &UniformRing,
    cfg: &WorkerCfg,
    stop: &StopFlag,
) -> Result<()> {
    let started = Instant::now();
    let mut presented = 0u64;

    while !stop.is_stopped() {
        let uniforms = FrameUniforms::at(started.elapsed().as_secs_f32(), cfg.clear_color);
        let status = sc.draw(queue, |cmd, slot, _| unsafe {
            ring.record_update(device, cmd, slot, &uniforms)
        })?;

        match status {
            FrameStatus::Presented { .. } => presented += 1,
            FrameStatus::Recreated => debug!("{}: swapchain rebuilt", cfg.name),
            FrameStatus::Suspended => {
                thread::sleep(SUSPENDED_POLL);
                continue;
            }
        }
        if !cfg.frame_interval.is_zero() {
            thread::sleep(cfg.frame_interval);
        }
    }

    info!(
        "{}: stopped after {} frames, {} recreations",
        cfg.name,
        presented,
        sc.recreations()
    );
    Ok(())
}

unsafe fn record_static(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    begin: &vk::RenderPassBeginInfo<'_>,
) -> ash::prelude::VkResult<()> {
    let cb_begin = vk::CommandBufferBeginInfo::default();
    unsafe {
        device.begin_command_buffer(cmd, &cb_begin)?;
        device.cmd_begin_render_pass(cmd, begin, vk::SubpassContents::INLINE);
        device.cmd_end_render_pass(cmd);
        device.end_command_buffer(cmd)
    }
}

/// Uniform buffer split into per-slot regions, each with its own
/// descriptor set from the thread's pool.
struct UniformRing {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
}

impl UniformRing {
    fn empty() -> Self {
        Self {
            buffer: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
            layout: vk::DescriptorSetLayout::null(),
            pool: vk::DescriptorPool::null(),
            sets: Vec::new(),
        }
    }

    /// On error whatever was created stays in `self` for `destroy`.
    unsafe fn init(&mut self, ctx: &Context) -> Result<()> {
        let device = ctx.device();
        let size = UNIFORM_STRIDE * UNIFORM_SLOTS as vk::DeviceSize;

        let buffer_ci = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        self.buffer = unsafe { device.create_buffer(&buffer_ci, None) }.context("create_buffer")?;

        let req = unsafe { device.get_buffer_memory_requirements(self.buffer) };
        let mem = ctx.memory_properties();
        let type_index = find_memory_type(
            mem,
            req.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .or_else(|| find_memory_type(mem, req.memory_type_bits, vk::MemoryPropertyFlags::empty()))
        .context("no memory type for uniform buffer")?;
        let alloc = vk::MemoryAllocateInfo::default()
            .allocation_size(req.size)
            .memory_type_index(type_index);
        self.memory = unsafe { device.allocate_memory(&alloc, None) }.context("allocate_memory")?;
        unsafe { device.bind_buffer_memory(self.buffer, self.memory, 0) }
            .context("bind_buffer_memory")?;

        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)];
        let layout_ci = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        self.layout = unsafe { device.create_descriptor_set_layout(&layout_ci, None) }
            .context("create_descriptor_set_layout")?;

        self.pool = ctx.descriptor_pools().pool_for_current_thread()?;
        let layouts = [self.layout; UNIFORM_SLOTS];
        let set_ai = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        self.sets = unsafe { device.allocate_descriptor_sets(&set_ai) }
            .context("allocate_descriptor_sets")?;

        let infos: Vec<[vk::DescriptorBufferInfo; 1]> = (0..UNIFORM_SLOTS)
            .map(|i| {
                [vk::DescriptorBufferInfo::default()
                    .buffer(self.buffer)
                    .offset(UNIFORM_STRIDE * i as vk::DeviceSize)
                    .range(std::mem::size_of::<FrameUniforms>() as vk::DeviceSize)]
            })
            .collect();
        let writes: Vec<vk::WriteDescriptorSet<'_>> = self
            .sets
            .iter()
            .zip(&infos)
            .map(|(&set, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(info)
            })
            .collect();
        unsafe { device.update_descriptor_sets(&writes, &[]) };

        debug!(
            "uniform ring: {} slots, memory type {}, pool {:?}",
            UNIFORM_SLOTS, type_index, self.pool
        );
        Ok(())
    }

    /// Dynamic half of a frame: copy this frame's uniforms into the slot's
    /// region and make them visible to the shaders of the static half.
    unsafe fn record_update(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        slot: usize,
        uniforms: &FrameUniforms,
    ) -> ash::prelude::VkResult<()> {
        let offset = UNIFORM_STRIDE * (slot % UNIFORM_SLOTS) as vk::DeviceSize;
        let barrier = vk::BufferMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::UNIFORM_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(self.buffer)
            .offset(offset)
            .size(UNIFORM_STRIDE);
        let cb_begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device.begin_command_buffer(cmd, &cb_begin)?;
            device.cmd_update_buffer(cmd, self.buffer, offset, bytemuck::bytes_of(uniforms));
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
            device.end_command_buffer(cmd)
        }
    }

    unsafe fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            if !self.sets.is_empty() {
                if let Err(e) = device.free_descriptor_sets(self.pool, &self.sets) {
                    warn!("free_descriptor_sets: {e}");
                }
                self.sets.clear();
            }
            device.destroy_descriptor_set_layout(self.layout, None);
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
        *self = Self::empty();
    }
}
