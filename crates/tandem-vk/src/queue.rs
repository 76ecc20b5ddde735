// SPDX-License-Identifier: CEPL-1.0
//! Shared, mutex-guarded device queues.
//!
//! Vulkan requires external synchronization on `vkQueueSubmit`,
//! `vkQueuePresentKHR` and `vkQueueWaitIdle`. Several surfaces may end up on
//! the same (family, index) pair, so every worker goes through one
//! [`SyncQueue`] per pair, handed out by a [`QueueRegistry`].
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;
use parking_lot::Mutex;
use tracing::debug;

use crate::device::{GpuDevice, SubmitBatch};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub device: u64,
    pub family: u32,
    pub index: u32,
}

impl QueueKey {
    pub fn new(device: &dyn GpuDevice, family: u32, index: u32) -> Self {
        Self {
            device: device.id(),
            family,
            index,
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{}/{}", self.device, self.family, self.index)
    }
}

struct QueueEntry {
    key: QueueKey,
    raw: Mutex<vk::Queue>,
}

/// Cloneable handle to one shared device queue. Clones share the same lock.
#[derive(Clone)]
pub struct SyncQueue {
    entry: Arc<QueueEntry>,
}

impl SyncQueue {
    fn new(key: QueueKey, raw: vk::Queue) -> Self {
        Self {
            entry: Arc::new(QueueEntry {
                key,
                raw: Mutex::new(raw),
            }),
        }
    }

    pub fn key(&self) -> QueueKey {
        self.entry.key
    }

    /// True when both handles refer to the same registry entry.
    pub fn same_queue(&self, other: &SyncQueue) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }

    /// Runs `f` with the raw queue while holding the queue lock. The lock is
    /// released when `f` returns, whatever it returns.
    pub fn with<R>(&self, f: impl FnOnce(vk::Queue) -> R) -> R {
        let raw = self.entry.raw.lock();
        f(*raw)
    }

    pub fn submit(
        &self,
        device: &dyn GpuDevice,
        batches: &[SubmitBatch],
        fence: vk::Fence,
    ) -> VkResult<()> {
        // SAFETY: the queue lock is held for the duration of the call.
        self.with(|queue| unsafe { device.queue_submit(queue, batches, fence) })
    }

    pub fn present(
        &self,
        device: &dyn GpuDevice,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool> {
        // SAFETY: the queue lock is held for the duration of the call.
        self.with(|queue| unsafe { device.queue_present(queue, swapchain, image_index, wait) })
    }

    pub fn wait_idle(&self, device: &dyn GpuDevice) -> VkResult<()> {
        // SAFETY: the queue lock is held for the duration of the call.
        self.with(|queue| unsafe { device.queue_wait_idle(queue) })
    }
}

impl fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncQueue")
            .field("key", &self.entry.key)
            .finish_non_exhaustive()
    }
}

/// Process-wide (per context) cache of [`SyncQueue`]s keyed by
/// (device, family, index).
#[derive(Default)]
pub struct QueueRegistry {
    entries: Mutex<HashMap<QueueKey, SyncQueue>>,
    created: AtomicUsize,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared handle for the key, creating it on first use.
    pub fn acquire(&self, device: &dyn GpuDevice, family: u32, index: u32) -> SyncQueue {
        let key = QueueKey::new(device, family, index);
        let mut entries = self.entries.lock();
        entries
            .entry(key)
            .or_insert_with(|| {
                self.created.fetch_add(1, Ordering::Relaxed);
                debug!("queue {key} registered");
                SyncQueue::new(key, device.get_queue(family, index))
            })
            .clone()
    }

    /// Scoped access to a shared queue: lock, run `f`, unlock.
    pub fn with_queue<R>(
        &self,
        device: &dyn GpuDevice,
        family: u32,
        index: u32,
        f: impl FnOnce(vk::Queue) -> R,
    ) -> R {
        // The registry lock is released before the queue lock is taken.
        let queue = self.acquire(device, family, index);
        queue.with(f)
    }

    /// Number of entries ever created.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Forgets every entry. Outstanding handles keep their queue alive, but a
    /// later `acquire` creates a fresh entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
