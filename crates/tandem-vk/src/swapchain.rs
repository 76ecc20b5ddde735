// SPDX-License-Identifier: CEPL-1.0
//! Swapchain lifecycle for one surface.
//!
//! A [`Swapchain`] owns everything tied to its surface: the surface itself,
//! the swapchain images and views, a depth buffer, the render pass, one
//! framebuffer per image, the command pool with one static and one dynamic
//! buffer per image slot, one fence per slot and the three frame semaphores.
//! The per-frame path lives in [`crate::frame`].
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;
use tracing::{debug, error, info, warn};

use crate::device::{DepthBuffer, GpuDevice, RenderPassBegin, SubmitBatch, SwapchainDesc};
use crate::error::{InitError, PresentError, Result, ResultExt};
use crate::frame::{FrameStage, SubmitStats};
use crate::queue::{QueueRegistry, SyncQueue};

/// Records the fixed part of a frame into one slot's static buffer. Called
/// once per slot on registration and again after every recreation, so it
/// must not assume a particular image count.
pub type StaticCommands =
    Box<dyn FnMut(vk::CommandBuffer, usize, &RenderPassBegin) -> VkResult<()> + Send>;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SwapchainConfig {
    /// Used only when the surface lets the swapchain pick its size.
    pub extent_hint: vk::Extent2D,
    pub clear_color: [f32; 4],
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            extent_hint: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

pub struct Swapchain {
    pub(crate) device: Arc<dyn GpuDevice>,
    pub(crate) config: SwapchainConfig,
    pub(crate) init_error: Option<InitError>,

    pub(crate) surface: vk::SurfaceKHR,
    pub(crate) graphics_family: u32,
    pub(crate) present_family: u32,
    pub(crate) present_queue: Option<SyncQueue>,

    pub(crate) swapchain: vk::SwapchainKHR,
    pub(crate) surface_format: vk::SurfaceFormatKHR,
    pub(crate) present_mode: vk::PresentModeKHR,
    pub(crate) extent: vk::Extent2D,
    pub(crate) images: Vec<vk::Image>,
    pub(crate) image_views: Vec<vk::ImageView>,
    pub(crate) depth: Option<DepthBuffer>,
    pub(crate) render_pass: vk::RenderPass,
    pub(crate) framebuffers: Vec<vk::Framebuffer>,

    pub(crate) command_pool: vk::CommandPool,
    pub(crate) static_cbs: Vec<vk::CommandBuffer>,
    pub(crate) dynamic_cbs: Vec<vk::CommandBuffer>,
    pub(crate) fences: Vec<vk::Fence>,
    pub(crate) image_acquired: vk::Semaphore,
    pub(crate) dynamic_complete: vk::Semaphore,
    pub(crate) frame_complete: vk::Semaphore,

    pub(crate) static_commands: Option<StaticCommands>,

    pub(crate) stage: FrameStage,
    /// `image_acquired` was signaled by an acquire whose frame never got
    /// submitted.
    pub(crate) acquire_pending: bool,
    pub(crate) suspended: bool,
    pub(crate) recreations: u64,
    pub(crate) stats: SubmitStats,
}

impl Swapchain {
    /// Brings up a swapchain for `surface`, taking ownership of it.
    ///
    /// Surfaces that cannot be used (no present-capable family, no FIFO, no
    /// formats) are not an `Err`: the swapchain is returned in a not-ready
    /// state, see [`Swapchain::ok`]. Device failures are returned as `Err`.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        registry: &QueueRegistry,
        surface: vk::SurfaceKHR,
        graphics_family: u32,
        config: SwapchainConfig,
    ) -> Result<Self> {
        let mut sc = Self {
            device,
            config,
            init_error: None,
            surface,
            graphics_family,
            present_family: graphics_family,
            present_queue: None,
            swapchain: vk::SwapchainKHR::null(),
            surface_format: vk::SurfaceFormatKHR::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D::default(),
            images: Vec::new(),
            image_views: Vec::new(),
            depth: None,
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            command_pool: vk::CommandPool::null(),
            static_cbs: Vec::new(),
            dynamic_cbs: Vec::new(),
            fences: Vec::new(),
            image_acquired: vk::Semaphore::null(),
            dynamic_complete: vk::Semaphore::null(),
            frame_complete: vk::Semaphore::null(),
            static_commands: None,
            stage: FrameStage::Idle,
            acquire_pending: false,
            suspended: false,
            recreations: 0,
            stats: SubmitStats::default(),
        };

        // STRICT ORDER:
        // 1) present family  2) present mode  3) surface format
        // 4) command pool + semaphores (generation independent)
        // 5) swapchain, views, depth, render pass, framebuffers
        // 6) command buffers + fences per slot, default static pass
        let Some(present_family) = sc.find_present_family()? else {
            return Ok(sc.not_ready(InitError::NoPresentFamily));
        };
        sc.present_family = present_family;

        let modes = sc
            .device
            .surface_present_modes(surface)
            .during("get_physical_device_surface_present_modes")?;
        sc.present_mode = match select_present_mode(&modes) {
            Ok(mode) => mode,
            Err(e) => return Ok(sc.not_ready(e)),
        };

        let formats = sc
            .device
            .surface_formats(surface)
            .during("get_physical_device_surface_formats")?;
        sc.surface_format = match select_surface_format(&formats) {
            Ok(format) => format,
            Err(e) => return Ok(sc.not_ready(e)),
        };

        sc.present_queue = Some(registry.acquire(&*sc.device, present_family, 0));

        sc.command_pool = sc
            .device
            .create_command_pool(graphics_family)
            .during("create_command_pool")?;
        sc.image_acquired = sc.device.create_semaphore().during("create_semaphore")?;
        sc.dynamic_complete = sc.device.create_semaphore().during("create_semaphore")?;
        sc.frame_complete = sc.device.create_semaphore().during("create_semaphore")?;

        let caps = sc
            .device
            .surface_capabilities(surface)
            .during("get_physical_device_surface_capabilities")?;
        if is_zero_extent(&caps) {
            info!("surface has no area yet; swapchain suspended until it does");
            sc.suspended = true;
            return Ok(sc);
        }
        sc.build(&caps)?;

        info!(
            "swapchain ready: {} / {}, {}, {}x{}, {} images, present family {}",
            fmt_name(sc.surface_format.format),
            cs_name(sc.surface_format.color_space),
            pm_name(sc.present_mode),
            sc.extent.width,
            sc.extent.height,
            sc.images.len(),
            sc.present_family
        );
        Ok(sc)
    }

    fn not_ready(mut self, e: InitError) -> Self {
        error!("swapchain not ready: {e}");
        self.init_error = Some(e);
        self
    }

    /// First graphics family that can present to the surface, preferring the
    /// graphics family itself so the images stay exclusively owned.
    fn find_present_family(&self) -> Result<Option<u32>> {
        let families = self.device.queue_family_properties();
        let graphics = |i: u32| {
            families
                .get(i as usize)
                .is_some_and(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        };
        if graphics(self.graphics_family)
            && self
                .device
                .surface_support(self.graphics_family, self.surface)
                .during("get_physical_device_surface_support")?
        {
            return Ok(Some(self.graphics_family));
        }
        for i in 0..families.len() as u32 {
            if i == self.graphics_family || !graphics(i) {
                continue;
            }
            if self
                .device
                .surface_support(i, self.surface)
                .during("get_physical_device_surface_support")?
            {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Builds one generation and its slots from `caps`.
    fn build(&mut self, caps: &vk::SurfaceCapabilitiesKHR) -> Result<()> {
        self.build_attachments(caps)?;
        self.build_slots()?;
        self.record_static()?;
        self.suspended = false;
        Ok(())
    }

    fn build_attachments(&mut self, caps: &vk::SurfaceCapabilitiesKHR) -> Result<()> {
        let extent = extent_from_caps(caps, self.config.extent_hint);
        let queue_families = if self.graphics_family == self.present_family {
            Vec::new()
        } else {
            vec![self.graphics_family, self.present_family]
        };
        let old_swapchain = self.swapchain;
        let desc = SwapchainDesc {
            surface: self.surface,
            min_image_count: image_count(caps),
            surface_format: self.surface_format,
            extent,
            present_mode: self.present_mode,
            pre_transform: pre_transform(caps),
            queue_families,
            old_swapchain,
        };
        let swapchain = self
            .device
            .create_swapchain(&desc)
            .during("create_swapchain")?;
        if old_swapchain != vk::SwapchainKHR::null() {
            self.device.destroy_swapchain(old_swapchain);
        }
        self.swapchain = swapchain;
        self.extent = extent;
        self.images = self
            .device
            .swapchain_images(swapchain)
            .during("get_swapchain_images")?;

        for &image in &self.images {
            let view = self
                .device
                .create_image_view(
                    image,
                    self.surface_format.format,
                    vk::ImageAspectFlags::COLOR,
                )
                .during("create_image_view")?;
            self.image_views.push(view);
        }

        let depth = self
            .device
            .create_depth_buffer(extent)
            .during("create_depth_buffer")?;
        self.depth = Some(depth);

        // Format never changes after `new`, so the pass survives recreation.
        if self.render_pass == vk::RenderPass::null() {
            self.render_pass = self
                .device
                .create_render_pass(self.surface_format.format, depth.format)
                .during("create_render_pass")?;
        }

        for &view in &self.image_views {
            let fb = self
                .device
                .create_framebuffer(self.render_pass, &[view, depth.view], extent)
                .during("create_framebuffer")?;
            self.framebuffers.push(fb);
        }
        Ok(())
    }

    fn build_slots(&mut self) -> Result<()> {
        let count = self.images.len() as u32;
        self.static_cbs = self
            .device
            .allocate_command_buffers(self.command_pool, count)
            .during("allocate_command_buffers")?;
        self.dynamic_cbs = self
            .device
            .allocate_command_buffers(self.command_pool, count)
            .during("allocate_command_buffers")?;
        for _ in 0..count {
            let fence = self.device.create_fence(true).during("create_fence")?;
            self.fences.push(fence);
        }
        Ok(())
    }

    fn destroy_slots(&mut self) {
        for fence in self.fences.drain(..) {
            self.device.destroy_fence(fence);
        }
        if !self.static_cbs.is_empty() {
            self.device
                .free_command_buffers(self.command_pool, &self.static_cbs);
            self.static_cbs.clear();
        }
        if !self.dynamic_cbs.is_empty() {
            self.device
                .free_command_buffers(self.command_pool, &self.dynamic_cbs);
            self.dynamic_cbs.clear();
        }
    }

    fn destroy_attachments(&mut self) {
        for fb in self.framebuffers.drain(..) {
            self.device.destroy_framebuffer(fb);
        }
        if let Some(depth) = self.depth.take() {
            self.device.destroy_depth_buffer(&depth);
        }
        for view in self.image_views.drain(..) {
            self.device.destroy_image_view(view);
        }
        self.images.clear();
    }

    pub(crate) fn render_pass_begin(&self, slot: usize) -> RenderPassBegin {
        RenderPassBegin::new(
            self.render_pass,
            self.framebuffers[slot],
            self.extent,
            self.config.clear_color,
        )
    }

    fn record_static(&mut self) -> Result<()> {
        for slot in 0..self.static_cbs.len() {
            let cmd = self.static_cbs[slot];
            let begin = self.render_pass_begin(slot);
            match self.static_commands.as_mut() {
                Some(record) => {
                    record(cmd, slot, &begin).map_err(|result| PresentError::Callback {
                        op: "static commands",
                        result,
                    })?
                }
                None => self
                    .device
                    .record_clear(cmd, &begin)
                    .during("record_clear")?,
            }
        }
        Ok(())
    }

    pub(crate) fn wait_all_slots(&self) -> Result<()> {
        if self.fences.is_empty() {
            return Ok(());
        }
        self.device
            .wait_for_fences(&self.fences, u64::MAX)
            .during("wait_for_fences")
    }

    /// Swaps the slot's fence for a fresh signaled one.
    pub(crate) fn restore_slot_fence(&mut self, slot: usize) {
        let fresh = match self.device.create_fence(true) {
            Ok(fence) => fence,
            Err(e) => {
                warn!("create_fence failed while restoring slot {slot}: {e}");
                return;
            }
        };
        if let Some(stale) = self.fences.get_mut(slot) {
            let stale = std::mem::replace(stale, fresh);
            self.device.destroy_fence(stale);
        } else {
            self.device.destroy_fence(fresh);
        }
    }

    /// Unsignals `image_acquired` when an acquire left it signaled with no
    /// submission to wait on it.
    fn consume_pending_acquire(&mut self) -> Result<()> {
        if !self.acquire_pending {
            return Ok(());
        }
        if let Some(queue) = &self.present_queue {
            let batch = SubmitBatch {
                wait_semaphore: Some(self.image_acquired),
                wait_stage: vk::PipelineStageFlags::ALL_COMMANDS,
                ..Default::default()
            };
            queue
                .submit(&*self.device, &[batch], vk::Fence::null())
                .during("queue_submit")?;
            queue.wait_idle(&*self.device).during("queue_wait_idle")?;
            debug!("pending acquire semaphore consumed");
        }
        self.acquire_pending = false;
        Ok(())
    }

    pub(crate) fn surface_has_area(&self) -> Result<bool> {
        let caps = self
            .device
            .surface_capabilities(self.surface)
            .during("get_physical_device_surface_capabilities")?;
        Ok(!is_zero_extent(&caps))
    }

    // STRICT ORDER (recreate):
    // 1) Wait every slot fence (no work may still use the old generation)
    // 2) Consume a pending acquire, then idle the present queue
    // 3) Zero extent: suspend, keep the old generation
    // 4) Destroy framebuffers, depth, views; new swapchain from the old one
    // 5) Free + reallocate command buffers, recreate fences signaled
    // 6) Re-record every static buffer
    /// Rebuilds every image-dependent resource against the surface's current
    /// state. Format, present mode and render pass are kept.
    pub fn recreate(&mut self) -> Result<()> {
        if let Some(e) = self.init_error {
            return Err(e.into());
        }
        self.set_stage(FrameStage::Invalidated);

        self.wait_all_slots()?;
        self.consume_pending_acquire()?;

        let caps = self
            .device
            .surface_capabilities(self.surface)
            .during("get_physical_device_surface_capabilities")?;
        if is_zero_extent(&caps) {
            if !self.suspended {
                info!("surface extent is 0x0; swapchain suspended");
            }
            self.suspended = true;
            self.set_stage(FrameStage::Idle);
            return Ok(());
        }

        self.destroy_slots();
        self.destroy_attachments();
        if let Err(e) = self.build(&caps) {
            // No slots means the next draw retries the rebuild.
            self.destroy_slots();
            error!("swapchain rebuild failed: {e}");
            return Err(e);
        }

        self.recreations += 1;
        self.set_stage(FrameStage::Idle);
        info!(
            "swapchain recreated: {}x{}, {} images (generation {})",
            self.extent.width,
            self.extent.height,
            self.images.len(),
            self.recreations
        );
        Ok(())
    }

    /// Registers the static recording callback and records every slot with
    /// it right away.
    pub fn set_static_commands<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(vk::CommandBuffer, usize, &RenderPassBegin) -> VkResult<()> + Send + 'static,
    {
        if let Some(e) = self.init_error {
            return Err(e.into());
        }
        self.wait_all_slots()?;
        self.static_commands = Some(Box::new(callback));
        self.record_static()
    }

    pub fn ok(&self) -> bool {
        self.init_error.is_none()
    }

    pub fn init_error(&self) -> Option<InitError> {
        self.init_error
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn framebuffers(&self) -> &[vk::Framebuffer] {
        &self.framebuffers
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    pub fn depth_buffer(&self) -> Option<&DepthBuffer> {
        self.depth.as_ref()
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    pub fn static_command_buffers(&self) -> &[vk::CommandBuffer] {
        &self.static_cbs
    }

    pub fn dynamic_command_buffers(&self) -> &[vk::CommandBuffer] {
        &self.dynamic_cbs
    }

    pub fn fences(&self) -> &[vk::Fence] {
        &self.fences
    }

    pub fn image_acquired_semaphore(&self) -> vk::Semaphore {
        self.image_acquired
    }

    pub fn dynamic_complete_semaphore(&self) -> vk::Semaphore {
        self.dynamic_complete
    }

    pub fn frame_complete_semaphore(&self) -> vk::Semaphore {
        self.frame_complete
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.surface_format.format
    }

    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.surface_format.color_space
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn present_family(&self) -> u32 {
        self.present_family
    }

    pub fn present_queue(&self) -> Option<&SyncQueue> {
        self.present_queue.as_ref()
    }

    pub fn stage(&self) -> FrameStage {
        self.stage
    }

    /// Completed recreations since construction.
    pub fn recreations(&self) -> u64 {
        self.recreations
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }
}

// STRICT TEARDOWN ORDER:
// 1) Wait slot fences, then idle the present queue under its lock
// 2) Fences, command buffers
// 3) Framebuffers, render pass, depth, views
// 4) Swapchain, semaphores, command pool
// 5) Surface
impl Drop for Swapchain {
    fn drop(&mut self) {
        if let Err(e) = self.wait_all_slots() {
            warn!("swapchain teardown: {e}");
        }
        if let Some(queue) = &self.present_queue {
            if let Err(e) = queue.wait_idle(&*self.device) {
                warn!("swapchain teardown: queue_wait_idle failed: {e}");
            }
        }

        self.destroy_slots();
        for fb in self.framebuffers.drain(..) {
            self.device.destroy_framebuffer(fb);
        }
        if self.render_pass != vk::RenderPass::null() {
            self.device.destroy_render_pass(self.render_pass);
        }
        self.destroy_attachments();

        if self.swapchain != vk::SwapchainKHR::null() {
            self.device.destroy_swapchain(self.swapchain);
        }
        for sem in [
            self.frame_complete,
            self.dynamic_complete,
            self.image_acquired,
        ] {
            if sem != vk::Semaphore::null() {
                self.device.destroy_semaphore(sem);
            }
        }
        if self.command_pool != vk::CommandPool::null() {
            self.device.destroy_command_pool(self.command_pool);
        }
        if self.surface != vk::SurfaceKHR::null() {
            self.device.destroy_surface(self.surface);
        }
        debug!("swapchain destroyed");
    }
}

fn is_zero_extent(caps: &vk::SurfaceCapabilitiesKHR) -> bool {
    caps.current_extent.width == 0 || caps.current_extent.height == 0
}

/// FIFO is the only mode every driver must offer, and the only one accepted.
pub(crate) fn select_present_mode(
    modes: &[vk::PresentModeKHR],
) -> std::result::Result<vk::PresentModeKHR, InitError> {
    modes
        .iter()
        .copied()
        .find(|&m| m == vk::PresentModeKHR::FIFO)
        .ok_or(InitError::NoFifoPresentMode)
}

pub(crate) fn select_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> std::result::Result<vk::SurfaceFormatKHR, InitError> {
    let bgra_unorm = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };
    match formats {
        [] => Err(InitError::NoSurfaceFormats),
        // The surface has no preference.
        [only] if only.format == vk::Format::UNDEFINED => Ok(bgra_unorm),
        _ => Ok(formats
            .iter()
            .copied()
            .find(|f| f.format == vk::Format::B8G8R8A8_UNORM)
            .unwrap_or(formats[0])),
    }
}

pub(crate) fn extent_from_caps(
    caps: &vk::SurfaceCapabilitiesKHR,
    want: vk::Extent2D,
) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, capped by the maximum (0 == no maximum).
pub(crate) fn image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    if caps.max_image_count == 0 {
        caps.min_image_count + 1
    } else {
        (caps.min_image_count + 1).min(caps.max_image_count)
    }
}

fn pre_transform(caps: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    }
}

// Info only
pub(crate) fn fmt_name(f: vk::Format) -> &'static str {
    match f {
        vk::Format::B8G8R8A8_UNORM => "B8G8R8A8_UNORM",
        vk::Format::B8G8R8A8_SRGB => "B8G8R8A8_SRGB",
        vk::Format::R8G8B8A8_SRGB => "R8G8B8A8_SRGB",
        vk::Format::R8G8B8A8_UNORM => "R8G8B8A8_UNORM",
        vk::Format::A2B10G10R10_UNORM_PACK32 => "A2B10G10R10_UNORM",
        _ => "OTHER",
    }
}
pub(crate) fn cs_name(cs: vk::ColorSpaceKHR) -> &'static str {
    match cs {
        vk::ColorSpaceKHR::SRGB_NONLINEAR => "SRGB_NONLINEAR",
        vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT => "EXTENDED_SRGB_LINEAR",
        _ => "OTHER",
    }
}
pub(crate) fn pm_name(m: vk::PresentModeKHR) -> &'static str {
    match m {
        vk::PresentModeKHR::FIFO => "FIFO",
        vk::PresentModeKHR::MAILBOX => "MAILBOX",
        vk::PresentModeKHR::IMMEDIATE => "IMMEDIATE",
        vk::PresentModeKHR::FIFO_RELAXED => "FIFO_RELAXED",
        _ => "OTHER",
    }
}
