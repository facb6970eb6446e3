//! Per-frame allocators.
//!
//! A [`RingFrameAllocator`] owns N frame slots. Acquiring the next frame
//! waits on that slot's fences before recycling anything, so resources handed
//! out N frames ago are only reused once the GPU is provably done with them.

use std::sync::{Mutex, MutexGuard};

use crate::access::DomainFlags;
use crate::alloc::{GlobalAllocator, LinearAllocator, ResourceAllocator};
use crate::backend::{DescriptorSetLayoutCreateInfo, DeviceBackend, FramebufferCreateInfo, RenderPassCreateInfo, SetBinding};
use crate::alloc::pool::DescriptorSetPool;
use crate::cache::PerFrameCache;
use crate::error::Result;
use crate::resource::{
    Buffer, BufferCreateInfo, BufferUsageFlags, CommandBufferHandle, DescriptorSetHandle,
    FenceHandle, FramebufferHandle, ImageCreateInfo, ImageHandle, ImageViewCreateInfo,
    ImageViewHandle, MemoryUsage, RenderPassHandle, SamplerCreateInfo, SamplerHandle,
    SemaphoreHandle,
};
use std::sync::Arc;

struct ObjectPool<T> {
    free: Vec<T>,
    used: Vec<T>,
}

impl<T: Copy> ObjectPool<T> {
    fn new() -> ObjectPool<T> {
        ObjectPool {
            free: Vec::new(),
            used: Vec::new(),
        }
    }

    fn allocate(&mut self, create: impl FnOnce() -> Result<T>) -> Result<T> {
        let v = match self.free.pop() {
            Some(v) => v,
            None => create()?,
        };
        self.used.push(v);
        Ok(v)
    }

    fn allocate_matching(
        &mut self,
        matches: impl Fn(&T) -> bool,
        create: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let v = match self.free.iter().position(|t| matches(t)) {
            Some(pos) => self.free.swap_remove(pos),
            None => create()?,
        };
        self.used.push(v);
        Ok(v)
    }

    fn reset(&mut self) {
        self.free.append(&mut self.used);
    }
}

#[derive(Default)]
struct RecycleBins {
    images: Vec<ImageHandle>,
    image_views: Vec<ImageViewHandle>,
    buffers: Vec<Buffer>,
}

struct FrameSlot {
    pending_fences: Mutex<Vec<FenceHandle>>,
    semaphores: Mutex<ObjectPool<SemaphoreHandle>>,
    fences: Mutex<ObjectPool<FenceHandle>>,
    command_buffers: Mutex<ObjectPool<(DomainFlags, CommandBufferHandle)>>,
    recycle: Mutex<RecycleBins>,
    descriptor_sets: PerFrameCache<SetBinding, (DescriptorSetHandle, Arc<DescriptorSetPool>)>,
    scratch: Mutex<LinearAllocator>,
}

impl FrameSlot {
    fn new(global: &GlobalAllocator) -> FrameSlot {
        FrameSlot {
            pending_fences: Mutex::new(Vec::new()),
            semaphores: Mutex::new(ObjectPool::new()),
            fences: Mutex::new(ObjectPool::new()),
            command_buffers: Mutex::new(ObjectPool::new()),
            recycle: Mutex::new(RecycleBins::default()),
            descriptor_sets: PerFrameCache::new(global.options.max_recording_threads),
            scratch: Mutex::new(LinearAllocator::new(
                global.options.scratch_block_size,
                BufferUsageFlags::UNIFORM_BUFFER
                    | BufferUsageFlags::STORAGE_BUFFER
                    | BufferUsageFlags::TRANSFER_SRC,
                MemoryUsage::CpuToGpu,
            )),
        }
    }
}

/// Ring of frame slots.
pub struct RingFrameAllocator {
    global: Arc<GlobalAllocator>,
    slots: Vec<FrameSlot>,
}

impl RingFrameAllocator {
    pub fn new(global: Arc<GlobalAllocator>) -> RingFrameAllocator {
        let n = global.options.frames_in_flight.max(1);
        let slots = (0..n).map(|_| FrameSlot::new(&global)).collect();
        RingFrameAllocator { global, slots }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Advance to the next frame: wait for the slot's previous use to retire
    /// on the GPU, recycle everything it handed out, and return the fresh
    /// per-frame allocator.
    pub fn next_frame(&mut self) -> Result<FrameAllocator> {
        let absolute_frame = self.global.advance_frame();
        let n = self.slots.len();
        let frame = (absolute_frame % n as u64) as usize;
        let slot = &mut self.slots[frame];
        let backend = self.global.backend();

        // the slot's submissions from N frames ago must be done before we
        // reuse anything it owns
        {
            let mut fences = slot.pending_fences.lock().unwrap();
            if !fences.is_empty() {
                log::debug!(
                    "frame {}: waiting {} fences before recycling slot {}",
                    absolute_frame,
                    fences.len(),
                    frame
                );
                backend.wait_fences(fences.as_slice())?;
                fences.clear();
            }
        }

        slot.fences.lock().unwrap().reset();
        slot.semaphores.lock().unwrap().reset();
        slot.command_buffers.lock().unwrap().reset();
        slot.scratch.lock().unwrap().reset();

        {
            let mut bins = slot.recycle.lock().unwrap();
            for img in bins.images.drain(..) {
                self.global.deallocate_image(img);
            }
            for view in bins.image_views.drain(..) {
                self.global.deallocate_image_view(view);
            }
            for buf in bins.buffers.drain(..) {
                self.global.deallocate_buffer(buf);
            }
        }

        slot.descriptor_sets
            .collect(absolute_frame, 2 * n as u64, |(set, pool)| {
                pool.recycle(set)
            });
        self.global.collect(absolute_frame);

        let slot = &self.slots[frame];
        Ok(FrameAllocator {
            global: &self.global,
            slot,
            absolute_frame,
            frame,
            frames_in_flight: n,
        })
    }
}

/// Allocator for one frame-in-flight. Thread-safe for allocation; resources
/// it hands out are reclaimed when the slot comes around again.
pub struct FrameAllocator<'a> {
    global: &'a GlobalAllocator,
    slot: &'a FrameSlot,
    pub absolute_frame: u64,
    /// Index into the ring (`absolute_frame % frames_in_flight`).
    pub frame: usize,
    pub frames_in_flight: usize,
}

impl<'a> FrameAllocator<'a> {
    pub fn global(&self) -> &GlobalAllocator {
        self.global
    }

    /// Fences passed here gate the recycling of this slot.
    pub fn pending_fence(&self, fence: FenceHandle) {
        self.slot.pending_fences.lock().unwrap().push(fence);
    }

    /// Host-visible scratch, valid for this frame only.
    pub fn allocate_scratch_buffer(&self, size: u64, align: u64) -> Result<Buffer> {
        let mut scratch: MutexGuard<LinearAllocator> = self.slot.scratch.lock().unwrap();
        scratch.allocate(self.global, size, align)
    }

    /// Frame-lifetime descriptor set; cached on contents, per-thread append
    /// on miss.
    pub fn allocate_descriptor_set(
        &self,
        layout_ci: &DescriptorSetLayoutCreateInfo,
        contents: &SetBinding,
        tid: usize,
    ) -> Result<DescriptorSetHandle> {
        let global = self.global;
        let backend = global.backend();
        self.slot
            .descriptor_sets
            .acquire(contents, self.absolute_frame, tid, |ci| {
                let pool = global.descriptor_pool(layout_ci)?;
                let set = pool.acquire(backend)?;
                backend.write_descriptor_set(set, ci)?;
                Ok((set, pool))
            })
            .map(|(set, _)| set)
    }
}

impl<'a> ResourceAllocator for FrameAllocator<'a> {
    fn backend(&self) -> &dyn DeviceBackend {
        self.global.backend()
    }

    fn allocate_image(&self, ci: &ImageCreateInfo) -> Result<ImageHandle> {
        let img = self.global.allocate_image(ci)?;
        self.slot.recycle.lock().unwrap().images.push(img);
        Ok(img)
    }

    fn allocate_image_view(&self, ci: &ImageViewCreateInfo) -> Result<ImageViewHandle> {
        let view = self.global.allocate_image_view(ci)?;
        self.slot.recycle.lock().unwrap().image_views.push(view);
        Ok(view)
    }

    fn allocate_buffer(&self, ci: &BufferCreateInfo) -> Result<Buffer> {
        let buf = self.global.allocate_buffer(ci)?;
        self.slot.recycle.lock().unwrap().buffers.push(buf);
        Ok(buf)
    }

    fn allocate_semaphore(&self) -> Result<SemaphoreHandle> {
        let backend = self.backend();
        self.slot
            .semaphores
            .lock()
            .unwrap()
            .allocate(|| backend.create_semaphore())
    }

    fn allocate_timeline_semaphore(&self, initial_value: u64) -> Result<SemaphoreHandle> {
        // timeline semaphores are not pooled, their values carry across frames
        self.global.allocate_timeline_semaphore(initial_value)
    }

    fn allocate_fence(&self) -> Result<FenceHandle> {
        let backend = self.backend();
        self.slot
            .fences
            .lock()
            .unwrap()
            .allocate(|| backend.create_fence())
    }

    fn allocate_command_buffer(&self, domain: DomainFlags) -> Result<CommandBufferHandle> {
        let backend = self.backend();
        self.slot
            .command_buffers
            .lock()
            .unwrap()
            .allocate_matching(
                |(d, _)| *d == domain,
                || Ok((domain, backend.create_command_buffer(domain)?)),
            )
            .map(|(_, cb)| cb)
    }

    fn allocate_renderpass(&self, ci: &RenderPassCreateInfo) -> Result<RenderPassHandle> {
        self.global.allocate_renderpass(ci)
    }

    fn allocate_framebuffer(&self, ci: &FramebufferCreateInfo) -> Result<FramebufferHandle> {
        self.global.allocate_framebuffer(ci)
    }

    fn allocate_sampler(&self, ci: &SamplerCreateInfo) -> Result<SamplerHandle> {
        self.global.allocate_sampler(ci)
    }

    // everything allocated through this tier is already queued for
    // reclamation when the slot is recycled

    fn deallocate_image(&self, _image: ImageHandle) {}

    fn deallocate_image_view(&self, _view: ImageViewHandle) {}

    fn deallocate_buffer(&self, _buffer: Buffer) {}
}
