// SPDX-License-Identifier: CEPL-1.0
//! In-process `GpuDevice` for driving the presentation code without a GPU.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::{Condvar, Mutex};
use tandem_vk::{
    DepthBuffer, GpuDevice, PoolSizes, QueueRegistry, RenderPassBegin, SubmitBatch, Swapchain,
    SwapchainConfig, SwapchainDesc,
};

#[derive(Clone, Debug)]
pub struct MockConfig {
    pub families: Vec<vk::QueueFlags>,
    /// Per family; missing entries mean no present support.
    pub present_support: Vec<bool>,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
    pub min_image_count: u32,
    pub extent: vk::Extent2D,
    /// Time spent inside every `queue_submit`.
    pub submit_delay: Duration,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            families: vec![vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE],
            present_support: vec![true],
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::R8G8B8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            present_modes: vec![vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO],
            min_image_count: 2,
            extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            submit_delay: Duration::ZERO,
        }
    }
}

#[derive(Default)]
struct State {
    min_image_count: u32,
    extent: vk::Extent2D,
    acquire_script: VecDeque<VkResult<(u32, bool)>>,
    present_script: VecDeque<VkResult<bool>>,
    swapchain_images: HashMap<u64, u32>,
    next_image: HashMap<u64, u32>,
    last_desc: Option<SwapchainDesc>,
    /// Fence handle -> signaled.
    fences: HashMap<u64, bool>,
    hold_gpu: bool,
    held: Vec<u64>,
    max_outstanding: usize,
    blocked_waits: usize,
    submits: Vec<Vec<SubmitBatch>>,
    presents: Vec<u32>,
    counters: HashMap<&'static str, usize>,
    /// Acquire semaphores signaled and not yet waited on.
    acquired: HashSet<u64>,
    /// One-shot failures keyed by counter name.
    fail_next: HashMap<&'static str, vk::Result>,
}

#[derive(Default)]
struct Overlap {
    active: HashMap<u64, usize>,
    max: HashMap<u64, usize>,
}

pub struct MockDevice {
    id: u64,
    cfg: MockConfig,
    next_handle: AtomicU64,
    state: Mutex<State>,
    fence_cv: Condvar,
    overlap: Mutex<Overlap>,
}

static NEXT_DEVICE: AtomicU64 = AtomicU64::new(0xD000);

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Self::with_config(MockConfig::default())
    }

    pub fn with_config(cfg: MockConfig) -> Arc<Self> {
        let state = State {
            min_image_count: cfg.min_image_count,
            extent: cfg.extent,
            ..Default::default()
        };
        Arc::new(Self {
            id: NEXT_DEVICE.fetch_add(1, Ordering::Relaxed),
            cfg,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(state),
            fence_cv: Condvar::new(),
            overlap: Mutex::new(Overlap::default()),
        })
    }

    fn handle<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn bump(&self, name: &'static str, by: usize) {
        *self.state.lock().counters.entry(name).or_default() += by;
    }

    pub fn count(&self, name: &str) -> usize {
        self.state.lock().counters.get(name).copied().unwrap_or(0)
    }

    pub fn new_surface(&self) -> vk::SurfaceKHR {
        self.handle()
    }

    pub fn set_extent(&self, width: u32, height: u32) {
        self.state.lock().extent = vk::Extent2D { width, height };
    }

    pub fn set_min_image_count(&self, count: u32) {
        self.state.lock().min_image_count = count;
    }

    pub fn script_acquire(&self, result: VkResult<(u32, bool)>) {
        self.state.lock().acquire_script.push_back(result);
    }

    pub fn script_present(&self, result: VkResult<bool>) {
        self.state.lock().present_script.push_back(result);
    }

    /// Makes the next `op` ("submit", "swapchain.create") fail with
    /// `result` without touching any state.
    pub fn fail_next(&self, op: &'static str, result: vk::Result) {
        self.state.lock().fail_next.insert(op, result);
    }

    /// While held, submitted fences stay unsignaled.
    pub fn hold_gpu(&self) {
        self.state.lock().hold_gpu = true;
    }

    /// Signals every fence submitted while held and stops holding.
    pub fn release_gpu(&self) {
        let mut st = self.state.lock();
        st.hold_gpu = false;
        for raw in std::mem::take(&mut st.held) {
            if let Some(signaled) = st.fences.get_mut(&raw) {
                *signaled = true;
            }
        }
        drop(st);
        self.fence_cv.notify_all();
    }

    pub fn outstanding_fences(&self) -> usize {
        self.state.lock().fences.values().filter(|s| !**s).count()
    }

    pub fn max_outstanding_fences(&self) -> usize {
        self.state.lock().max_outstanding
    }

    /// Fence waits that had to block at least once.
    pub fn blocked_waits(&self) -> usize {
        self.state.lock().blocked_waits
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn submits(&self) -> Vec<Vec<SubmitBatch>> {
        self.state.lock().submits.clone()
    }

    pub fn presents(&self) -> Vec<u32> {
        self.state.lock().presents.clone()
    }

    pub fn last_swapchain_desc(&self) -> Option<SwapchainDesc> {
        self.state.lock().last_desc.clone()
    }

    pub fn max_concurrent_submits(&self, queue: vk::Queue) -> usize {
        self.overlap
            .lock()
            .max
            .get(&queue.as_raw())
            .copied()
            .unwrap_or(0)
    }

    pub fn swapchain(self: &Arc<Self>, registry: &QueueRegistry) -> Swapchain {
        self.swapchain_with(registry, SwapchainConfig::default())
    }

    pub fn swapchain_with(self: &Arc<Self>, registry: &QueueRegistry, cfg: SwapchainConfig) -> Swapchain {
        let device: Arc<dyn GpuDevice> = self.clone();
        Swapchain::new(device, registry, self.new_surface(), 0, cfg)
            .expect("mock swapchain creation")
    }

    fn caps(&self) -> vk::SurfaceCapabilitiesKHR {
        let st = self.state.lock();
        vk::SurfaceCapabilitiesKHR {
            min_image_count: st.min_image_count,
            max_image_count: 0,
            current_extent: st.extent,
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 16384,
                height: 16384,
            },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        }
    }
}

impl GpuDevice for MockDevice {
    fn id(&self) -> u64 {
        self.id
    }

    fn queue_family_properties(&self) -> Vec<vk::QueueFamilyProperties> {
        self.cfg
            .families
            .iter()
            .map(|&queue_flags| vk::QueueFamilyProperties {
                queue_flags,
                queue_count: 2,
                ..Default::default()
            })
            .collect()
    }

    fn get_queue(&self, family: u32, index: u32) -> vk::Queue {
        self.bump("queue.get", 1);
        vk::Queue::from_raw(0x1000 + u64::from(family) * 16 + u64::from(index))
    }

    fn surface_support(&self, family: u32, _surface: vk::SurfaceKHR) -> VkResult<bool> {
        Ok(self
            .cfg
            .present_support
            .get(family as usize)
            .copied()
            .unwrap_or(false))
    }

    fn surface_capabilities(&self, _surface: vk::SurfaceKHR) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        Ok(self.caps())
    }

    fn surface_formats(&self, _surface: vk::SurfaceKHR) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        Ok(self.cfg.formats.clone())
    }

    fn surface_present_modes(&self, _surface: vk::SurfaceKHR) -> VkResult<Vec<vk::PresentModeKHR>> {
        Ok(self.cfg.present_modes.clone())
    }

    fn destroy_surface(&self, _surface: vk::SurfaceKHR) {
        self.bump("surface.destroy", 1);
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        let mut st = self.state.lock();
        if let Some(result) = st.fail_next.remove("swapchain.create") {
            return Err(result);
        }
        let sc: vk::SwapchainKHR = self.handle();
        st.swapchain_images.insert(sc.as_raw(), desc.min_image_count);
        st.last_desc = Some(desc.clone());
        *st.counters.entry("swapchain.create").or_default() += 1;
        Ok(sc)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        let count = self
            .state
            .lock()
            .swapchain_images
            .get(&swapchain.as_raw())
            .copied()
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        Ok((0..count).map(|_| self.handle()).collect())
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut st = self.state.lock();
        st.swapchain_images.remove(&swapchain.as_raw());
        *st.counters.entry("swapchain.destroy").or_default() += 1;
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout: u64,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut st = self.state.lock();
        *st.counters.entry("acquire").or_default() += 1;
        // Signaling a semaphore that is already signaled is invalid usage.
        if st.acquired.contains(&signal.as_raw()) {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        if let Some(scripted) = st.acquire_script.pop_front() {
            if scripted.is_ok() {
                st.acquired.insert(signal.as_raw());
            }
            return scripted;
        }
        st.acquired.insert(signal.as_raw());
        let count = st
            .swapchain_images
            .get(&swapchain.as_raw())
            .copied()
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        let next = st.next_image.entry(swapchain.as_raw()).or_default();
        let index = *next % count;
        *next = next.wrapping_add(1);
        Ok((index, false))
    }

    fn create_image_view(
        &self,
        _image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView> {
        self.bump("view.create", 1);
        Ok(self.handle())
    }

    fn destroy_image_view(&self, _view: vk::ImageView) {
        self.bump("view.destroy", 1);
    }

    fn create_depth_buffer(&self, _extent: vk::Extent2D) -> VkResult<DepthBuffer> {
        self.bump("depth.create", 1);
        Ok(DepthBuffer {
            image: self.handle(),
            memory: self.handle(),
            view: self.handle(),
            format: vk::Format::D24_UNORM_S8_UINT,
        })
    }

    fn destroy_depth_buffer(&self, _depth: &DepthBuffer) {
        self.bump("depth.destroy", 1);
    }

    fn create_render_pass(
        &self,
        _color_format: vk::Format,
        _depth_format: vk::Format,
    ) -> VkResult<vk::RenderPass> {
        self.bump("render_pass.create", 1);
        Ok(self.handle())
    }

    fn destroy_render_pass(&self, _render_pass: vk::RenderPass) {
        self.bump("render_pass.destroy", 1);
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _attachments: &[vk::ImageView],
        _extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        self.bump("framebuffer.create", 1);
        Ok(self.handle())
    }

    fn destroy_framebuffer(&self, _framebuffer: vk::Framebuffer) {
        self.bump("framebuffer.destroy", 1);
    }

    fn create_command_pool(&self, _family: u32) -> VkResult<vk::CommandPool> {
        self.bump("command_pool.create", 1);
        Ok(self.handle())
    }

    fn destroy_command_pool(&self, _pool: vk::CommandPool) {
        self.bump("command_pool.destroy", 1);
    }

    fn allocate_command_buffers(
        &self,
        _pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        self.bump("command_buffer.allocate", count as usize);
        Ok((0..count).map(|_| self.handle()).collect())
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        self.bump("command_buffer.free", buffers.len());
    }

    fn record_empty(&self, _cmd: vk::CommandBuffer) -> VkResult<()> {
        self.bump("record_empty", 1);
        Ok(())
    }

    fn record_clear(&self, _cmd: vk::CommandBuffer, _begin: &RenderPassBegin) -> VkResult<()> {
        self.bump("record_clear", 1);
        Ok(())
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        self.bump("semaphore.create", 1);
        Ok(self.handle())
    }

    fn destroy_semaphore(&self, _semaphore: vk::Semaphore) {
        self.bump("semaphore.destroy", 1);
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let fence: vk::Fence = self.handle();
        let mut st = self.state.lock();
        st.fences.insert(fence.as_raw(), signaled);
        *st.counters.entry("fence.create").or_default() += 1;
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut st = self.state.lock();
        st.fences.remove(&fence.as_raw());
        *st.counters.entry("fence.destroy").or_default() += 1;
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], _timeout: u64) -> VkResult<()> {
        let mut st = self.state.lock();
        let mut blocked = false;
        loop {
            let mut all = true;
            for f in fences {
                match st.fences.get(&f.as_raw()) {
                    Some(true) => {}
                    Some(false) => all = false,
                    None => return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT),
                }
            }
            if all {
                return Ok(());
            }
            if !blocked {
                blocked = true;
                st.blocked_waits += 1;
            }
            self.fence_cv.wait(&mut st);
        }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        let mut st = self.state.lock();
        for f in fences {
            match st.fences.get_mut(&f.as_raw()) {
                Some(signaled) => *signaled = false,
                None => return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT),
            }
        }
        Ok(())
    }

    fn create_descriptor_pool(&self, _sizes: &PoolSizes) -> VkResult<vk::DescriptorPool> {
        self.bump("descriptor_pool.create", 1);
        Ok(self.handle())
    }

    fn destroy_descriptor_pool(&self, _pool: vk::DescriptorPool) {
        self.bump("descriptor_pool.destroy", 1);
    }

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        batches: &[SubmitBatch],
        fence: vk::Fence,
    ) -> VkResult<()> {
        {
            let mut ov = self.overlap.lock();
            let active = ov.active.entry(queue.as_raw()).or_default();
            *active += 1;
            let now = *active;
            let max = ov.max.entry(queue.as_raw()).or_default();
            *max = (*max).max(now);
        }
        if !self.cfg.submit_delay.is_zero() {
            std::thread::sleep(self.cfg.submit_delay);
        }
        let result = self.finish_submit(batches, fence);
        if let Some(active) = self.overlap.lock().active.get_mut(&queue.as_raw()) {
            *active -= 1;
        }
        result
    }

    unsafe fn queue_present(
        &self,
        _queue: vk::Queue,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        _wait: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut st = self.state.lock();
        *st.counters.entry("present").or_default() += 1;
        if let Some(scripted) = st.present_script.pop_front() {
            return scripted;
        }
        st.presents.push(image_index);
        Ok(false)
    }

    unsafe fn queue_wait_idle(&self, _queue: vk::Queue) -> VkResult<()> {
        self.bump("queue.wait_idle", 1);
        Ok(())
    }

    fn wait_idle(&self) -> VkResult<()> {
        self.bump("device.wait_idle", 1);
        Ok(())
    }
}

impl MockDevice {
    fn finish_submit(&self, batches: &[SubmitBatch], fence: vk::Fence) -> VkResult<()> {
        let mut st = self.state.lock();
        if let Some(result) = st.fail_next.remove("submit") {
            return Err(result);
        }
        if fence != vk::Fence::null() {
            match st.fences.get(&fence.as_raw()) {
                // Submitting with a signaled fence is invalid usage.
                Some(true) | None => return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT),
                Some(false) => {}
            }
        }
        *st.counters.entry("submit").or_default() += 1;
        st.submits.push(batches.to_vec());
        for batch in batches {
            if let Some(wait) = batch.wait_semaphore {
                st.acquired.remove(&wait.as_raw());
            }
        }
        if fence == vk::Fence::null() {
            return Ok(());
        }
        let outstanding = st.fences.values().filter(|s| !**s).count();
        st.max_outstanding = st.max_outstanding.max(outstanding);
        if st.hold_gpu {
            st.held.push(fence.as_raw());
        } else {
            st.fences.insert(fence.as_raw(), true);
            drop(st);
            self.fence_cv.notify_all();
        }
        Ok(())
    }
}
