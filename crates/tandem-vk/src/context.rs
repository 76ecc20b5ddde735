// SPDX-License-Identifier: CEPL-1.0
//! Instance, device and the state every surface of one device shares.
use std::ffi::{c_void, CStr, CString};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use ash::ext::debug_utils as ext_debug;
use ash::khr::swapchain;
use ash::{vk, Entry};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, error, info, trace, warn};

use crate::ash_device::AshDevice;
use crate::descriptor_pools::{DescriptorPools, PoolSizes};
use crate::device::GpuDevice;
use crate::error::InitError;
use crate::queue::{QueueRegistry, SyncQueue};
use crate::swapchain::{cs_name, fmt_name, pm_name, Swapchain, SwapchainConfig};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

#[derive(Clone, Debug)]
pub struct ContextConfig {
    pub app_name: String,
    /// Enables the Khronos validation layer and forwards its messages to
    /// `tracing`. Ignored with a warning when the layer is not installed.
    pub validation: bool,
    pub pool_sizes: PoolSizes,
    /// Where the pipeline cache is loaded from and saved to. `None` keeps
    /// the cache in memory only.
    pub pipeline_cache_path: Option<PathBuf>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            app_name: "tandem".to_owned(),
            validation: cfg!(debug_assertions),
            pool_sizes: PoolSizes::default(),
            pipeline_cache_path: None,
        }
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || unsafe { (*data).p_message.is_null() } {
        return vk::FALSE;
    }
    let msg = unsafe { CStr::from_ptr((*data).p_message) }.to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", ?types, "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", ?types, "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        debug!(target: "vulkan", ?types, "{msg}");
    } else {
        trace!(target: "vulkan", ?types, "{msg}");
    }
    vk::FALSE
}

struct DebugState {
    loader: ext_debug::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

unsafe fn create_debug_messenger(entry: &Entry, instance: &ash::Instance) -> Result<DebugState> {
    let loader = ext_debug::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));
    let messenger = unsafe { loader.create_debug_utils_messenger(&ci, None) }
        .context("create_debug_utils_messenger")?;
    Ok(DebugState { loader, messenger })
}

unsafe fn has_validation_layer(entry: &Entry) -> bool {
    unsafe { entry.enumerate_instance_layer_properties() }
        .unwrap_or_default()
        .iter()
        .any(|l| l.layer_name_as_c_str().is_ok_and(|n| n == VALIDATION_LAYER))
}

unsafe fn create_instance(
    entry: &Entry,
    display: &dyn HasDisplayHandle,
    app_name: &CStr,
    validation: bool,
) -> Result<ash::Instance> {
    let display_raw = display
        .display_handle()
        .map_err(|e| anyhow!("{e}"))?
        .as_raw();

    let app_info = vk::ApplicationInfo::default()
        .application_name(app_name)
        .engine_name(c"tandem")
        .api_version(vk::API_VERSION_1_1);

    let mut ext_vec = ash_window::enumerate_required_extensions(display_raw)
        .context("enumerate_required_extensions")?
        .to_vec();
    if validation {
        ext_vec.push(ext_debug::NAME.as_ptr());
    }
    let layers: Vec<*const std::ffi::c_char> = if validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&ext_vec)
        .enabled_layer_names(&layers);
    Ok(unsafe { entry.create_instance(&create_info, None) }?)
}

/// First physical device with a family that does both graphics and compute.
unsafe fn pick_device_and_family(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .context("enumerate_physical_devices")?;
    let wanted = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
    for phys in devices {
        let families = unsafe { instance.get_physical_device_queue_family_properties(phys) };
        if let Some(idx) = families.iter().position(|f| f.queue_flags.contains(wanted)) {
            return Ok((phys, idx as u32));
        }
    }
    error!("{}", InitError::NoGraphicsComputeFamily);
    Err(InitError::NoGraphicsComputeFamily.into())
}

unsafe fn create_device(
    instance: &ash::Instance,
    phys: vk::PhysicalDevice,
    queue_family: u32,
) -> Result<ash::Device> {
    let priorities = [1.0_f32];
    let qinfo = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&priorities)];
    let device_exts = [swapchain::NAME.as_ptr()];
    let dinfo = vk::DeviceCreateInfo::default()
        .queue_create_infos(&qinfo)
        .enabled_extension_names(&device_exts);
    Ok(unsafe { instance.create_device(phys, &dinfo, None) }.context("create_device")?)
}

unsafe fn create_or_load_pipeline_cache(
    device: &ash::Device,
    path: Option<&Path>,
) -> Result<vk::PipelineCache> {
    let data = path.and_then(|p| fs::read(p).ok()).unwrap_or_default();
    if !data.is_empty() {
        debug!("pipeline cache: loaded {} bytes", data.len());
    }
    let ci = vk::PipelineCacheCreateInfo::default().initial_data(&data);
    match unsafe { device.create_pipeline_cache(&ci, None) } {
        Ok(cache) => Ok(cache),
        // Stale or foreign blob; start empty.
        Err(e) if !data.is_empty() => {
            warn!("pipeline cache rejected ({e}); starting empty");
            let empty = vk::PipelineCacheCreateInfo::default();
            Ok(unsafe { device.create_pipeline_cache(&empty, None) }
                .context("create_pipeline_cache")?)
        }
        Err(e) => Err(e).context("create_pipeline_cache"),
    }
}

unsafe fn save_pipeline_cache(
    device: &ash::Device,
    cache: vk::PipelineCache,
    path: &Path,
) -> Result<()> {
    match unsafe { device.get_pipeline_cache_data(cache) } {
        Ok(bytes) => {
            if let Some(parent) = path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            fs::write(path, &bytes)
                .with_context(|| format!("write pipeline cache {}", path.display()))?;
            debug!("pipeline cache: saved {} bytes", bytes.len());
        }
        Err(_) => {
            // benign; some drivers may fail if cache is empty or device lost
        }
    }
    Ok(())
}

fn log_memory_caps(mem: &vk::PhysicalDeviceMemoryProperties) {
    for i in 0..mem.memory_heap_count as usize {
        let heap = mem.memory_heaps[i];
        debug!(
            "memory heap {i}: {} MiB {:?}",
            heap.size / (1024 * 1024),
            heap.flags
        );
    }
    for i in 0..mem.memory_type_count as usize {
        let ty = mem.memory_types[i];
        debug!(
            "memory type {i}: heap {} {:?}",
            ty.heap_index, ty.property_flags
        );
    }
}

/// One instance, one device, and the queue registry and descriptor pool
/// cache shared by every worker rendering through that device.
///
/// Workers must be joined, and their swapchains dropped, before the context
/// is dropped.
pub struct Context {
    entry: Entry,
    instance: ash::Instance,
    debug: Option<DebugState>,
    phys: vk::PhysicalDevice,
    device: ash::Device,
    gpu: Arc<AshDevice>,
    graphics_family: u32,
    registry: QueueRegistry,
    pools: DescriptorPools,
    pipeline_cache: vk::PipelineCache,
    pipeline_cache_path: Option<PathBuf>,
}

impl Context {
    // STRICT ORDER:
    // 1) Instance (WSI extensions + optional validation)
    // 2) Debug messenger (instance-scoped)
    // 3) Physical device + graphics/compute family
    // 4) Device, then the shared queue registry + descriptor pools
    // 5) Pipeline cache
    pub fn new(config: &ContextConfig, display: &dyn HasDisplayHandle) -> Result<Self> {
        let entry = Entry::linked();
        let app_name = CString::new(config.app_name.as_str()).context("app_name")?;

        unsafe {
            let validation = config.validation && has_validation_layer(&entry);
            if config.validation && !validation {
                warn!("validation requested but VK_LAYER_KHRONOS_validation is not installed");
            }

            let instance = create_instance(&entry, display, &app_name, validation)
                .context("create_instance (WSI + optional validation)")?;

            let debug = if validation {
                match create_debug_messenger(&entry, &instance) {
                    Ok(state) => Some(state),
                    Err(e) => {
                        warn!("{e:#}");
                        None
                    }
                }
            } else {
                None
            };

            let (phys, graphics_family) = match pick_device_and_family(&instance) {
                Ok(picked) => picked,
                Err(e) => {
                    Self::destroy_instance(&instance, debug);
                    return Err(e);
                }
            };
            let device = match create_device(&instance, phys, graphics_family) {
                Ok(device) => device,
                Err(e) => {
                    Self::destroy_instance(&instance, debug);
                    return Err(e);
                }
            };

            let props = instance.get_physical_device_properties(phys);
            let name = props
                .device_name_as_c_str()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let gpu = Arc::new(AshDevice::new(&entry, &instance, phys, &device));
            log_memory_caps(gpu.memory_properties());
            let pools = DescriptorPools::new(gpu.clone(), config.pool_sizes);

            let pipeline_cache =
                match create_or_load_pipeline_cache(&device, config.pipeline_cache_path.as_deref())
                {
                    Ok(cache) => cache,
                    Err(e) => {
                        drop(pools);
                        device.destroy_device(None);
                        Self::destroy_instance(&instance, debug);
                        return Err(e);
                    }
                };

            let validation_on = debug.is_some();
            info!(
                "vulkan context ready: {name}, graphics/compute family {graphics_family}, validation={validation_on}"
            );

            Ok(Self {
                entry,
                instance,
                debug,
                phys,
                device,
                gpu,
                graphics_family,
                registry: QueueRegistry::new(),
                pools,
                pipeline_cache,
                pipeline_cache_path: config.pipeline_cache_path.clone(),
            })
        }
    }

    unsafe fn destroy_instance(instance: &ash::Instance, debug: Option<DebugState>) {
        unsafe {
            if let Some(dbg) = debug {
                dbg.loader.destroy_debug_utils_messenger(dbg.messenger, None);
            }
            instance.destroy_instance(None);
        }
    }

    /// Creates a surface for `window`. Ownership passes to the [`Swapchain`]
    /// built from it.
    pub fn create_surface(
        &self,
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
    ) -> Result<vk::SurfaceKHR> {
        let dh = display
            .display_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();
        unsafe { ash_window::create_surface(&self.entry, &self.instance, dh, wh, None) }
            .context("ash_window::create_surface")
    }

    /// Builds a swapchain for `surface` on the graphics family.
    pub fn create_swapchain(
        &self,
        surface: vk::SurfaceKHR,
        config: SwapchainConfig,
    ) -> crate::error::Result<Swapchain> {
        self.log_surface_caps(surface);
        Swapchain::new(
            self.gpu.clone(),
            &self.registry,
            surface,
            self.graphics_family,
            config,
        )
    }

    fn log_surface_caps(&self, surface: vk::SurfaceKHR) {
        if let Ok(formats) = self.gpu.surface_formats(surface) {
            for f in formats {
                debug!(
                    "surface format: {} / {}",
                    fmt_name(f.format),
                    cs_name(f.color_space)
                );
            }
        }
        if let Ok(modes) = self.gpu.surface_present_modes(surface) {
            for m in modes {
                debug!("present mode: {}", pm_name(m));
            }
        }
    }

    pub fn gpu(&self) -> Arc<dyn GpuDevice> {
        self.gpu.clone()
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.phys
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        self.gpu.memory_properties()
    }

    pub fn graphics_family(&self) -> u32 {
        self.graphics_family
    }

    /// Graphics and compute share one family.
    pub fn compute_family(&self) -> u32 {
        self.graphics_family
    }

    pub fn graphics_queue(&self) -> SyncQueue {
        self.registry.acquire(&*self.gpu, self.graphics_family, 0)
    }

    pub fn compute_queue(&self) -> SyncQueue {
        self.registry.acquire(&*self.gpu, self.compute_family(), 0)
    }

    pub fn queue_registry(&self) -> &QueueRegistry {
        &self.registry
    }

    pub fn descriptor_pools(&self) -> &DescriptorPools {
        &self.pools
    }

    pub fn pipeline_cache(&self) -> vk::PipelineCache {
        self.pipeline_cache
    }
}

// STRICT TEARDOWN ORDER:
// - device_wait_idle()
// - Per-thread descriptor pools
// - Pipeline cache (saved first)
// - Queue registry, device
// - Debug messenger, instance last.
impl Drop for Context {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("context teardown: device_wait_idle failed: {e}");
            }
            self.pools.clear();

            if let Some(path) = &self.pipeline_cache_path {
                if let Err(e) = save_pipeline_cache(&self.device, self.pipeline_cache, path) {
                    warn!("{e:#}");
                }
            }
            self.device
                .destroy_pipeline_cache(self.pipeline_cache, None);

            self.registry.clear();
            self.device.destroy_device(None);
            Self::destroy_instance(&self.instance, self.debug.take());
        }
        info!("vulkan context destroyed");
    }
}
