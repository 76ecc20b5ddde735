// SPDX-License-Identifier: CEPL-1.0
//! The device calls the presentation subsystem depends on.
//!
//! Everything above this trait (queue registry, descriptor pool cache,
//! swapchain manager, frame pipeline) is written against [`GpuDevice`] so it
//! can run on [`AshDevice`](crate::AshDevice) or on an in-process stand-in.
use ash::prelude::VkResult;
use ash::vk;

use crate::descriptor_pools::PoolSizes;

/// Depth/stencil attachment shared by every framebuffer of a swapchain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DepthBuffer {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
}

/// Everything needed to create (or re-create) a swapchain.
#[derive(Clone, Debug)]
pub struct SwapchainDesc {
    pub surface: vk::SurfaceKHR,
    pub min_image_count: u32,
    pub surface_format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    /// Empty for exclusive sharing; graphics + present families otherwise.
    pub queue_families: Vec<u32>,
    pub old_swapchain: vk::SwapchainKHR,
}

/// One batch of a queue submission. Absent fields become empty arrays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubmitBatch {
    pub wait_semaphore: Option<vk::Semaphore>,
    pub wait_stage: vk::PipelineStageFlags,
    pub command_buffer: Option<vk::CommandBuffer>,
    pub signal_semaphore: Option<vk::Semaphore>,
}

/// Render pass begin parameters for one image slot. Owns its clear values so
/// the borrowed `vk::RenderPassBeginInfo` can be built on demand.
#[derive(Clone, Copy)]
pub struct RenderPassBegin {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub render_area: vk::Rect2D,
    pub clear_values: [vk::ClearValue; 2],
}

impl RenderPassBegin {
    pub fn new(
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    ) -> Self {
        Self {
            render_pass,
            framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            clear_values: [
                vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: clear_color,
                    },
                },
                vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                },
            ],
        }
    }

    pub fn info(&self) -> vk::RenderPassBeginInfo<'_> {
        vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass)
            .framebuffer(self.framebuffer)
            .render_area(self.render_area)
            .clear_values(&self.clear_values)
    }
}

pub trait GpuDevice: Send + Sync {
    /// Identity of the logical device, used to key shared queues.
    fn id(&self) -> u64;
    fn queue_family_properties(&self) -> Vec<vk::QueueFamilyProperties>;
    fn get_queue(&self, family: u32, index: u32) -> vk::Queue;

    fn surface_support(&self, family: u32, surface: vk::SurfaceKHR) -> VkResult<bool>;
    fn surface_capabilities(&self, surface: vk::SurfaceKHR)
        -> VkResult<vk::SurfaceCapabilitiesKHR>;
    fn surface_formats(&self, surface: vk::SurfaceKHR) -> VkResult<Vec<vk::SurfaceFormatKHR>>;
    fn surface_present_modes(&self, surface: vk::SurfaceKHR)
        -> VkResult<Vec<vk::PresentModeKHR>>;
    fn destroy_surface(&self, surface: vk::SurfaceKHR);

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR>;
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    /// Returns `(image_index, suboptimal)`.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_depth_buffer(&self, extent: vk::Extent2D) -> VkResult<DepthBuffer>;
    fn destroy_depth_buffer(&self, depth: &DepthBuffer);
    fn create_render_pass(
        &self,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> VkResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    fn create_command_pool(&self, family: u32) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);
    /// Records a buffer that does nothing.
    fn record_empty(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    /// Records a buffer that only runs the render pass, clearing both
    /// attachments and leaving the colour image ready to present.
    fn record_clear(&self, cmd: vk::CommandBuffer, begin: &RenderPassBegin) -> VkResult<()>;

    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Waits until every fence is signaled.
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> VkResult<()>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()>;

    fn create_descriptor_pool(&self, sizes: &PoolSizes) -> VkResult<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// # Safety
    /// `queue` must be externally synchronized: no other thread may use it
    /// until this returns. [`SyncQueue`](crate::SyncQueue) guarantees this.
    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        batches: &[SubmitBatch],
        fence: vk::Fence,
    ) -> VkResult<()>;
    /// Returns `true` when the swapchain is suboptimal.
    ///
    /// # Safety
    /// Same external synchronization contract as [`GpuDevice::queue_submit`].
    unsafe fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool>;
    /// # Safety
    /// Same external synchronization contract as [`GpuDevice::queue_submit`].
    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;

    /// Waits for every queue of the device. Only valid once no other thread
    /// can touch any queue (after all workers were joined).
    fn wait_idle(&self) -> VkResult<()>;
}
