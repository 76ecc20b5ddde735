// SPDX-License-Identifier: CEPL-1.0
//! One descriptor pool per calling thread.
//!
//! Descriptor pools are externally synchronized, so each worker gets its own.
//! Pools live in a table shared by every thread of one context. A worker
//! gives its pool back with [`DescriptorPools::release_current_thread`]; a
//! thread-local exit hook holding a `Weak` to the table catches threads that
//! exit without doing so.
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::device::GpuDevice;
use crate::error::{Result, ResultExt};

/// Capacity classes of every per-thread pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSizes {
    pub uniform_buffers: u32,
    pub combined_image_samplers: u32,
    pub storage_buffers: u32,
    pub max_sets: u32,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            uniform_buffers: 128,
            combined_image_samplers: 128,
            storage_buffers: 128,
            max_sets: 256,
        }
    }
}

impl PoolSizes {
    pub fn to_vk(&self) -> [vk::DescriptorPoolSize; 3] {
        [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: self.uniform_buffers,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: self.combined_image_samplers,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: self.storage_buffers,
            },
        ]
    }
}

struct PoolTable {
    device: Arc<dyn GpuDevice>,
    sizes: PoolSizes,
    pools: Mutex<HashMap<ThreadId, vk::DescriptorPool>>,
    exit_removals: AtomicUsize,
}

impl PoolTable {
    /// Removes and destroys the thread's pool if it is still there.
    fn remove(&self, thread: ThreadId) -> bool {
        let pool = self.pools.lock().remove(&thread);
        match pool {
            Some(pool) => {
                self.device.destroy_descriptor_pool(pool);
                debug!("descriptor pool for {thread:?} released");
                true
            }
            None => false,
        }
    }

    fn destroy_all(&self) {
        let drained: Vec<_> = self.pools.lock().drain().collect();
        for (thread, pool) in drained {
            debug!("descriptor pool for {thread:?} destroyed with its table");
            self.device.destroy_descriptor_pool(pool);
        }
    }
}

impl Drop for PoolTable {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

struct ExitHook {
    table: Weak<PoolTable>,
    thread: ThreadId,
}

impl Drop for ExitHook {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            if table.remove(self.thread) {
                table.exit_removals.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

thread_local! {
    static EXIT_HOOKS: RefCell<Vec<ExitHook>> = const { RefCell::new(Vec::new()) };
}

fn arm_exit_hook(table: &Arc<PoolTable>) {
    let weak = Arc::downgrade(table);
    let armed = EXIT_HOOKS.try_with(|hooks| {
        let mut hooks = hooks.borrow_mut();
        // Hooks of tables that are already gone are dead weight.
        hooks.retain(|h| h.table.strong_count() > 0);
        if !hooks.iter().any(|h| Weak::ptr_eq(&h.table, &weak)) {
            hooks.push(ExitHook {
                table: weak,
                thread: thread::current().id(),
            });
        }
    });
    if armed.is_err() {
        warn!("thread is shutting down; descriptor pool will only be freed with its context");
    }
}

/// Shared table of per-thread descriptor pools.
#[derive(Clone)]
pub struct DescriptorPools {
    table: Arc<PoolTable>,
}

impl DescriptorPools {
    pub fn new(device: Arc<dyn GpuDevice>, sizes: PoolSizes) -> Self {
        Self {
            table: Arc::new(PoolTable {
                device,
                sizes,
                pools: Mutex::new(HashMap::new()),
                exit_removals: AtomicUsize::new(0),
            }),
        }
    }

    pub fn sizes(&self) -> PoolSizes {
        self.table.sizes
    }

    /// Returns the calling thread's pool, creating it on first request.
    pub fn pool_for_current_thread(&self) -> Result<vk::DescriptorPool> {
        let thread = thread::current().id();
        let pool = {
            let mut pools = self.table.pools.lock();
            if let Some(&pool) = pools.get(&thread) {
                return Ok(pool);
            }
            let pool = self
                .table
                .device
                .create_descriptor_pool(&self.table.sizes)
                .during("create_descriptor_pool")?;
            pools.insert(thread, pool);
            pool
        };
        debug!("descriptor pool for {thread:?} created");
        arm_exit_hook(&self.table);
        Ok(pool)
    }

    /// Destroys the calling thread's pool. Returns `false` if it had none.
    pub fn release_current_thread(&self) -> bool {
        self.table.remove(thread::current().id())
    }

    /// Destroys every pool. Used by context teardown once workers are joined.
    pub fn clear(&self) {
        self.table.destroy_all();
    }

    pub fn len(&self) -> usize {
        self.table.pools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.pools.lock().is_empty()
    }

    /// How many pools were reclaimed by thread-exit hooks.
    pub fn thread_exit_removals(&self) -> usize {
        self.table.exit_removals.load(Ordering::Relaxed)
    }
}
