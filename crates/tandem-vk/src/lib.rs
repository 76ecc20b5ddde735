// SPDX-License-Identifier: CEPL-1.0
//! Multi-surface Vulkan frame submission.
//!
//! One [`Context`] per device; one [`Swapchain`] per surface, each driven by
//! its own worker thread. Workers share device queues through the
//! [`QueueRegistry`] and get their own descriptor pool from
//! [`DescriptorPools`].
#![deny(unsafe_op_in_unsafe_fn)]

pub mod ash_device;
pub mod context;
pub mod descriptor_pools;
pub mod device;
pub mod error;
pub mod frame;
pub mod queue;
pub mod swapchain;

pub use ash::{self, vk};

pub use ash_device::{aspects_for_format, find_memory_type, AshDevice};
pub use context::{Context, ContextConfig};
pub use descriptor_pools::{DescriptorPools, PoolSizes};
pub use device::{DepthBuffer, GpuDevice, RenderPassBegin, SubmitBatch, SwapchainDesc};
pub use error::{InitError, PresentError, ResultExt};
pub use frame::{FrameStage, FrameStatus, SubmitStats};
pub use queue::{QueueKey, QueueRegistry, SyncQueue};
pub use swapchain::{StaticCommands, Swapchain, SwapchainConfig};
