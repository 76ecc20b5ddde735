// SPDX-License-Identifier: CEPL-1.0
//! [`GpuDevice`] on top of a real `ash` device.
//!
//! `AshDevice` does not own the instance or the device; the [`Context`]
//! that built it destroys both once every swapchain is gone.
//!
//! [`Context`]: crate::Context
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use ash::{khr, Entry};

use crate::descriptor_pools::PoolSizes;
use crate::device::{DepthBuffer, GpuDevice, RenderPassBegin, SubmitBatch, SwapchainDesc};

pub struct AshDevice {
    instance: ash::Instance,
    phys: vk::PhysicalDevice,
    device: ash::Device,
    surface_i: khr::surface::Instance,
    swap_d: khr::swapchain::Device,
    mem_props: vk::PhysicalDeviceMemoryProperties,
    depth_format: vk::Format,
}

impl AshDevice {
    /// # Safety
    /// `device` must have been created from `phys` of `instance` with the
    /// swapchain extension enabled, and must outlive every use of `self`.
    pub unsafe fn new(
        entry: &Entry,
        instance: &ash::Instance,
        phys: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Self {
        let mem_props = unsafe { instance.get_physical_device_memory_properties(phys) };
        let depth_format = unsafe { pick_depth_format(instance, phys) };
        Self {
            instance: instance.clone(),
            phys,
            device: device.clone(),
            surface_i: khr::surface::Instance::new(entry, instance),
            swap_d: khr::swapchain::Device::new(instance, device),
            mem_props,
            depth_format,
        }
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.phys
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.mem_props
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    pub fn surface_loader(&self) -> &khr::surface::Instance {
        &self.surface_i
    }
}

/// Prefers formats with a stencil aspect, the render pass clears both.
unsafe fn pick_depth_format(instance: &ash::Instance, phys: vk::PhysicalDevice) -> vk::Format {
    let candidates = [
        vk::Format::D24_UNORM_S8_UINT,
        vk::Format::D32_SFLOAT_S8_UINT,
        vk::Format::D32_SFLOAT,
        vk::Format::D16_UNORM,
    ];
    for &fmt in &candidates {
        let props = unsafe { instance.get_physical_device_format_properties(phys, fmt) };
        if props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        {
            return fmt;
        }
    }
    vk::Format::D32_SFLOAT // fallback; most desktop GPUs support it
}

pub fn aspects_for_format(fmt: vk::Format) -> vk::ImageAspectFlags {
    match fmt {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Index of the first memory type allowed by `type_bits` that has `req`.
pub fn find_memory_type(
    mem: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    req: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..mem.memory_type_count).find(|&i| {
        (type_bits & (1 << i)) != 0 && mem.memory_types[i as usize].property_flags.contains(req)
    })
}

impl GpuDevice for AshDevice {
    fn id(&self) -> u64 {
        self.device.handle().as_raw()
    }

    fn queue_family_properties(&self) -> Vec<vk::QueueFamilyProperties> {
        unsafe {
            self.instance
                .get_physical_device_queue_family_properties(self.phys)
        }
    }

    fn get_queue(&self, family: u32, index: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(family, index) }
    }

    fn surface_support(&self, family: u32, surface: vk::SurfaceKHR) -> VkResult<bool> {
        unsafe {
            self.surface_i
                .get_physical_device_surface_support(self.phys, family, surface)
        }
    }

    fn surface_capabilities(
        &self,
        surface: vk::SurfaceKHR,
    ) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_i
                .get_physical_device_surface_capabilities(self.phys, surface)
        }
    }

    fn surface_formats(&self, surface: vk::SurfaceKHR) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.surface_i
                .get_physical_device_surface_formats(self.phys, surface)
        }
    }

    fn surface_present_modes(
        &self,
        surface: vk::SurfaceKHR,
    ) -> VkResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.surface_i
                .get_physical_device_surface_present_modes(self.phys, surface)
        }
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        unsafe { self.surface_i.destroy_surface(surface, None) }
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        let sharing = if desc.queue_families.is_empty() {
            vk::SharingMode::EXCLUSIVE
        } else {
            vk::SharingMode::CONCURRENT
        };
        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(desc.surface)
            .min_image_count(desc.min_image_count)
            .image_format(desc.surface_format.format)
            .image_color_space(desc.surface_format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing)
            .queue_family_indices(&desc.queue_families)
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(desc.old_swapchain);
        unsafe { self.swap_d.create_swapchain(&info, None) }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        unsafe { self.swap_d.get_swapchain_images(swapchain) }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swap_d.destroy_swapchain(swapchain, None) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swap_d
                .acquire_next_image(swapchain, timeout, signal, vk::Fence::null())
        }
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView> {
        let iv_info = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        unsafe { self.device.create_image_view(&iv_info, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn create_depth_buffer(&self, extent: vk::Extent2D) -> VkResult<DepthBuffer> {
        let format = self.depth_format;
        let img_ci = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let image = unsafe { self.device.create_image(&img_ci, None)? };

        let mem_req = unsafe { self.device.get_image_memory_requirements(image) };
        let Some(memory_type_index) = find_memory_type(
            &self.mem_props,
            mem_req.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) else {
            unsafe { self.device.destroy_image(image, None) };
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        };
        let alloc = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: mem_req.size,
            memory_type_index,
            ..Default::default()
        };
        let memory = match unsafe { self.device.allocate_memory(&alloc, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };
        let mut depth = DepthBuffer {
            image,
            memory,
            view: vk::ImageView::null(),
            format,
        };
        let bound = unsafe { self.device.bind_image_memory(image, memory, 0) }
            .and_then(|()| self.create_image_view(image, format, aspects_for_format(format)));
        match bound {
            Ok(view) => {
                depth.view = view;
                Ok(depth)
            }
            Err(e) => {
                self.destroy_depth_buffer(&depth);
                Err(e)
            }
        }
    }

    fn destroy_depth_buffer(&self, depth: &DepthBuffer) {
        unsafe {
            if depth.view != vk::ImageView::null() {
                self.device.destroy_image_view(depth.view, None);
            }
            self.device.destroy_image(depth.image, None);
            self.device.free_memory(depth.memory, None);
        }
    }

    fn create_render_pass(
        &self,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> VkResult<vk::RenderPass> {
        let attachments = [
            vk::AttachmentDescription {
                format: color_format,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                ..Default::default()
            },
            vk::AttachmentDescription {
                format: depth_format,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::DONT_CARE,
                stencil_load_op: vk::AttachmentLoadOp::CLEAR,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                ..Default::default()
            },
        ];
        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .depth_stencil_attachment(&depth_ref)];
        // The colour image comes out of the acquire semaphore wait at this stage.
        let dependencies = [vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags::empty(),
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::empty(),
        }];
        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        unsafe { self.device.create_render_pass(&info, None) }
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) }
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        unsafe { self.device.create_framebuffer(&info, None) }
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) }
    }

    fn create_command_pool(&self, family: u32) -> VkResult<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: family,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ..Default::default()
        };
        unsafe { self.device.create_command_pool(&pool_info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: count,
            ..Default::default()
        };
        unsafe { self.device.allocate_command_buffers(&alloc_info) }
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        unsafe { self.device.free_command_buffers(pool, buffers) }
    }

    fn record_empty(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let begin = vk::CommandBufferBeginInfo::default();
        unsafe {
            self.device.begin_command_buffer(cmd, &begin)?;
            self.device.end_command_buffer(cmd)
        }
    }

    fn record_clear(&self, cmd: vk::CommandBuffer, begin: &RenderPassBegin) -> VkResult<()> {
        let cb_begin = vk::CommandBufferBeginInfo::default();
        unsafe {
            self.device.begin_command_buffer(cmd, &cb_begin)?;
            self.device
                .cmd_begin_render_pass(cmd, &begin.info(), vk::SubpassContents::INLINE);
            self.device.cmd_end_render_pass(cmd);
            self.device.end_command_buffer(cmd)
        }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let sem_ci = vk::SemaphoreCreateInfo::default();
        unsafe { self.device.create_semaphore(&sem_ci, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let fence_ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: if signaled {
                vk::FenceCreateFlags::SIGNALED
            } else {
                vk::FenceCreateFlags::empty()
            },
            ..Default::default()
        };
        unsafe { self.device.create_fence(&fence_ci, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(fences, true, timeout) }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        unsafe { self.device.reset_fences(fences) }
    }

    fn create_descriptor_pool(&self, sizes: &PoolSizes) -> VkResult<vk::DescriptorPool> {
        let pool_sizes = sizes.to_vk();
        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(sizes.max_sets)
            .pool_sizes(&pool_sizes);
        unsafe { self.device.create_descriptor_pool(&info, None) }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) }
    }

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        batches: &[SubmitBatch],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let infos: Vec<vk::SubmitInfo<'_>> = batches
            .iter()
            .map(|b| {
                let stages: &[vk::PipelineStageFlags] = if b.wait_semaphore.is_some() {
                    std::slice::from_ref(&b.wait_stage)
                } else {
                    &[]
                };
                vk::SubmitInfo::default()
                    .wait_semaphores(b.wait_semaphore.as_slice())
                    .wait_dst_stage_mask(stages)
                    .command_buffers(b.command_buffer.as_slice())
                    .signal_semaphores(b.signal_semaphore.as_slice())
            })
            .collect();
        unsafe { self.device.queue_submit(queue, &infos, fence) }
    }

    unsafe fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool> {
        let waits = [wait];
        let swapchains = [swapchain];
        let indices = [image_index];
        let present = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);
        unsafe { self.swap_d.queue_present(queue, &present) }
    }

    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        unsafe { self.device.queue_wait_idle(queue) }
    }

    fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_formats_get_both_aspects() {
        assert_eq!(
            aspects_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspects_for_format(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspects_for_format(vk::Format::B8G8R8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn memory_type_respects_bits_and_flags() {
        let mut mem = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            ..Default::default()
        };
        mem.memory_types[0].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;
        mem.memory_types[1].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        mem.memory_types[2].property_flags =
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE;

        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        assert_eq!(find_memory_type(&mem, 0b111, local), Some(1));
        assert_eq!(find_memory_type(&mem, 0b101, local), Some(2));
        assert_eq!(find_memory_type(&mem, 0b001, local), None);
    }
}
