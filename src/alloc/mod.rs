//! Resource allocator hierarchy.
//!
//! Three tiers: the [`GlobalAllocator`] talks to the device directly and owns
//! the long-lived caches; a [`frame::RingFrameAllocator`] hands out one
//! [`frame::FrameAllocator`] per frame-in-flight and recycles a slot only
//! after its fences signal; [`linear::LinearAllocator`]s serve per-submission
//! scratch with bump allocation.
//!
//! Callers that don't care about the tier hold a `&dyn ResourceAllocator`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::access::DomainFlags;
use crate::backend::{
    DescriptorSetLayoutCreateInfo, DeviceBackend, FramebufferCreateInfo, PipelineCreateInfo,
    RenderPassCreateInfo, SetBinding,
};
use crate::cache::Cache;
use crate::error::Result;
use crate::resource::{
    Buffer, BufferCreateInfo, CommandBufferHandle, DescriptorSetHandle, DescriptorSetLayoutHandle,
    FenceHandle, FramebufferHandle, ImageCreateInfo, ImageHandle, ImageViewCreateInfo,
    ImageViewHandle, PipelineHandle, RenderPassHandle, SamplerCreateInfo, SamplerHandle,
    SemaphoreHandle,
};

pub mod frame;
pub mod linear;
pub mod pool;

pub use self::frame::{FrameAllocator, RingFrameAllocator};
pub use self::linear::LinearAllocator;
pub use self::pool::DescriptorSetPool;

/// Runtime tunables, loaded from a `config::Config` the way the surrounding
/// application configures everything else.
#[derive(Clone, Debug)]
pub struct RuntimeOptions {
    pub frames_in_flight: usize,
    pub cache_collect_threshold: u64,
    pub scratch_block_size: u64,
    pub max_recording_threads: usize,
}

impl Default for RuntimeOptions {
    fn default() -> RuntimeOptions {
        RuntimeOptions {
            frames_in_flight: 2,
            cache_collect_threshold: 32,
            scratch_block_size: 1 << 20,
            max_recording_threads: 8,
        }
    }
}

impl RuntimeOptions {
    pub fn from_config(cfg: &config::Config) -> RuntimeOptions {
        let d = RuntimeOptions::default();
        RuntimeOptions {
            frames_in_flight: cfg
                .get::<usize>("gfx.frames_in_flight")
                .unwrap_or(d.frames_in_flight),
            cache_collect_threshold: cfg
                .get::<u64>("gfx.cache_collect_threshold")
                .unwrap_or(d.cache_collect_threshold),
            scratch_block_size: cfg
                .get::<u64>("gfx.scratch_block_size")
                .unwrap_or(d.scratch_block_size),
            max_recording_threads: cfg
                .get::<usize>("gfx.max_recording_threads")
                .unwrap_or(d.max_recording_threads),
        }
    }
}

/// The operation set every allocator tier exposes.
pub trait ResourceAllocator {
    fn backend(&self) -> &dyn DeviceBackend;
    fn allocate_image(&self, ci: &ImageCreateInfo) -> Result<ImageHandle>;
    fn allocate_image_view(&self, ci: &ImageViewCreateInfo) -> Result<ImageViewHandle>;
    fn allocate_buffer(&self, ci: &BufferCreateInfo) -> Result<Buffer>;
    fn allocate_semaphore(&self) -> Result<SemaphoreHandle>;
    fn allocate_timeline_semaphore(&self, initial_value: u64) -> Result<SemaphoreHandle>;
    fn allocate_fence(&self) -> Result<FenceHandle>;
    fn allocate_command_buffer(&self, domain: DomainFlags) -> Result<CommandBufferHandle>;
    fn allocate_renderpass(&self, ci: &RenderPassCreateInfo) -> Result<RenderPassHandle>;
    fn allocate_framebuffer(&self, ci: &FramebufferCreateInfo) -> Result<FramebufferHandle>;
    fn allocate_sampler(&self, ci: &SamplerCreateInfo) -> Result<SamplerHandle>;
    fn deallocate_image(&self, image: ImageHandle);
    fn deallocate_image_view(&self, view: ImageViewHandle);
    fn deallocate_buffer(&self, buffer: Buffer);
}

/// Thread-safe device-level allocator. Creation calls go straight to the
/// backend; cacheable objects go through the LRU caches.
pub struct GlobalAllocator {
    backend: Arc<dyn DeviceBackend>,
    pub options: RuntimeOptions,
    frame_counter: AtomicU64,

    pub renderpasses: Cache<RenderPassCreateInfo, RenderPassHandle>,
    pub framebuffers: Cache<FramebufferCreateInfo, FramebufferHandle>,
    pub samplers: Cache<SamplerCreateInfo, SamplerHandle>,
    pub pipelines: Cache<PipelineCreateInfo, PipelineHandle>,
    pub set_layouts: Cache<DescriptorSetLayoutCreateInfo, DescriptorSetLayoutHandle>,
    pub descriptor_pools: Cache<DescriptorSetLayoutCreateInfo, Arc<DescriptorSetPool>>,
}

impl GlobalAllocator {
    pub fn new(backend: Arc<dyn DeviceBackend>, options: RuntimeOptions) -> GlobalAllocator {
        GlobalAllocator {
            backend,
            options,
            frame_counter: AtomicU64::new(0),
            renderpasses: Cache::new(),
            framebuffers: Cache::new(),
            samplers: Cache::new(),
            pipelines: Cache::new(),
            set_layouts: Cache::new(),
            descriptor_pools: Cache::new(),
        }
    }

    pub fn current_frame(&self) -> u64 {
        self.frame_counter.load(Ordering::Relaxed)
    }

    pub(crate) fn advance_frame(&self) -> u64 {
        self.frame_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub fn allocate_pipeline(&self, ci: &PipelineCreateInfo) -> Result<PipelineHandle> {
        let frame = self.current_frame();
        let backend = &*self.backend;
        self.pipelines
            .acquire(ci, frame, |ci| backend.create_pipeline(ci))
    }

    pub fn allocate_descriptor_set(
        &self,
        layout_ci: &DescriptorSetLayoutCreateInfo,
        contents: &SetBinding,
    ) -> Result<DescriptorSetHandle> {
        let pool = self.descriptor_pool(layout_ci)?;
        let set = pool.acquire(&*self.backend)?;
        self.backend.write_descriptor_set(set, contents)?;
        Ok(set)
    }

    pub fn descriptor_pool(
        &self,
        layout_ci: &DescriptorSetLayoutCreateInfo,
    ) -> Result<Arc<DescriptorSetPool>> {
        let frame = self.current_frame();
        let backend = &*self.backend;
        let set_layouts = &self.set_layouts;
        self.descriptor_pools.acquire(layout_ci, frame, |ci| {
            let layout = set_layouts.acquire(ci, frame, |ci| backend.create_descriptor_set_layout(ci))?;
            let sizes = ci
                .bindings
                .iter()
                .map(|b| (b.descriptor_type, b.count))
                .collect();
            Ok(Arc::new(DescriptorSetPool::new(layout, sizes)))
        })
    }

    /// Evict cache entries that have not been used for a while.
    pub fn collect(&self, current_frame: u64) {
        let t = self.options.cache_collect_threshold;
        let backend = &*self.backend;
        self.framebuffers
            .collect(current_frame, t, |fb| backend.destroy_framebuffer(fb));
        self.renderpasses
            .collect(current_frame, t, |rp| backend.destroy_renderpass(rp));
        self.samplers
            .collect(current_frame, t, |s| backend.destroy_sampler(s));
        self.pipelines
            .collect(current_frame, t, |p| backend.destroy_pipeline(p));
        self.descriptor_pools
            .collect(current_frame, t, |p| p.destroy(backend));
    }
}

impl Drop for GlobalAllocator {
    fn drop(&mut self) {
        let backend = self.backend.clone();
        self.framebuffers.clear(|fb| backend.destroy_framebuffer(fb));
        self.renderpasses.clear(|rp| backend.destroy_renderpass(rp));
        self.samplers.clear(|s| backend.destroy_sampler(s));
        self.pipelines.clear(|p| backend.destroy_pipeline(p));
        self.descriptor_pools.clear(|p| p.destroy(&*backend));
        self.set_layouts.clear(|_| {});
    }
}

impl ResourceAllocator for GlobalAllocator {
    fn backend(&self) -> &dyn DeviceBackend {
        &*self.backend
    }

    fn allocate_image(&self, ci: &ImageCreateInfo) -> Result<ImageHandle> {
        self.backend.create_image(ci)
    }

    fn allocate_image_view(&self, ci: &ImageViewCreateInfo) -> Result<ImageViewHandle> {
        self.backend.create_image_view(ci)
    }

    fn allocate_buffer(&self, ci: &BufferCreateInfo) -> Result<Buffer> {
        self.backend.create_buffer(ci)
    }

    fn allocate_semaphore(&self) -> Result<SemaphoreHandle> {
        self.backend.create_semaphore()
    }

    fn allocate_timeline_semaphore(&self, initial_value: u64) -> Result<SemaphoreHandle> {
        self.backend.create_timeline_semaphore(initial_value)
    }

    fn allocate_fence(&self) -> Result<FenceHandle> {
        self.backend.create_fence()
    }

    fn allocate_command_buffer(&self, domain: DomainFlags) -> Result<CommandBufferHandle> {
        self.backend.create_command_buffer(domain)
    }

    fn allocate_renderpass(&self, ci: &RenderPassCreateInfo) -> Result<RenderPassHandle> {
        let frame = self.current_frame();
        let backend = &*self.backend;
        self.renderpasses
            .acquire(ci, frame, |ci| backend.create_renderpass(ci))
    }

    fn allocate_framebuffer(&self, ci: &FramebufferCreateInfo) -> Result<FramebufferHandle> {
        let frame = self.current_frame();
        let backend = &*self.backend;
        self.framebuffers
            .acquire(ci, frame, |ci| backend.create_framebuffer(ci))
    }

    fn allocate_sampler(&self, ci: &SamplerCreateInfo) -> Result<SamplerHandle> {
        let frame = self.current_frame();
        let backend = &*self.backend;
        self.samplers
            .acquire(ci, frame, |ci| backend.create_sampler(ci))
    }

    fn deallocate_image(&self, image: ImageHandle) {
        self.backend.destroy_image(image);
    }

    fn deallocate_image_view(&self, view: ImageViewHandle) {
        self.backend.destroy_image_view(view);
    }

    fn deallocate_buffer(&self, buffer: Buffer) {
        self.backend.destroy_buffer(buffer.buffer);
    }
}
