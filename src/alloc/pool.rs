//! Descriptor set pool.
//!
//! Sets are allocated up-front in pool-sized batches and handed out through a
//! lock-free queue, so the steady state costs one dequeue. When the queue
//! runs dry, one thread grows the backing storage under a try-lock while the
//! others spin back to the dequeue.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crossbeam::queue::SegQueue;

use crate::backend::{DescriptorPoolCreateInfo, DescriptorType, DeviceBackend};
use crate::error::Result;
use crate::resource::{DescriptorPoolHandle, DescriptorSetHandle, DescriptorSetLayoutHandle};

pub struct DescriptorSetPool {
    layout: DescriptorSetLayoutHandle,
    sizes: Vec<(DescriptorType, u32)>,
    pools: Mutex<Vec<DescriptorPoolHandle>>,
    free_sets: SegQueue<DescriptorSetHandle>,
    sets_allocated: AtomicU32,
    grow_lock: Mutex<()>,
}

impl DescriptorSetPool {
    pub fn new(
        layout: DescriptorSetLayoutHandle,
        sizes: Vec<(DescriptorType, u32)>,
    ) -> DescriptorSetPool {
        DescriptorSetPool {
            layout,
            sizes,
            pools: Mutex::new(Vec::new()),
            free_sets: SegQueue::new(),
            sets_allocated: AtomicU32::new(0),
            grow_lock: Mutex::new(()),
        }
    }

    pub fn layout(&self) -> DescriptorSetLayoutHandle {
        self.layout
    }

    pub fn acquire(&self, backend: &dyn DeviceBackend) -> Result<DescriptorSetHandle> {
        loop {
            if let Some(set) = self.free_sets.pop() {
                return Ok(set);
            }
            self.grow(backend)?;
        }
    }

    /// Return a set to the free list.
    pub fn recycle(&self, set: DescriptorSetHandle) {
        self.free_sets.push(set);
    }

    fn grow(&self, backend: &dyn DeviceBackend) -> Result<()> {
        let guard = match self.grow_lock.try_lock() {
            Ok(g) => g,
            Err(_) => {
                // another thread is growing; let the caller retry the queue
                std::hint::spin_loop();
                return Ok(());
            }
        };

        let prior = self.sets_allocated.load(Ordering::Relaxed);
        let max_sets = if prior == 0 { 1 } else { prior * 2 };
        let sizes = self
            .sizes
            .iter()
            .map(|&(ty, count)| (ty, count * max_sets))
            .collect();
        let pool = backend.create_descriptor_pool(&DescriptorPoolCreateInfo { max_sets, sizes })?;
        let sets = backend.create_descriptor_sets(pool, self.layout, max_sets)?;
        log::debug!(
            "descriptor pool for {:?}: grew by {} sets",
            self.layout,
            max_sets
        );
        self.pools.lock().unwrap().push(pool);
        for s in sets {
            self.free_sets.push(s);
        }
        self.sets_allocated.store(max_sets, Ordering::Relaxed);

        drop(guard);
        Ok(())
    }

    pub fn destroy(&self, backend: &dyn DeviceBackend) {
        let mut pools = self.pools.lock().unwrap();
        for p in pools.drain(..) {
            backend.destroy_descriptor_pool(p);
        }
        while self.free_sets.pop().is_some() {}
        self.sets_allocated.store(0, Ordering::Relaxed);
    }
}
