//! Recording device backend for the integration tests.
//!
//! Every creation call hands out a fresh handle; every command and queue
//! operation is appended to an event log the tests assert against. Fences
//! are always "signaled": waiting records the wait and succeeds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use framegraph::backend::*;
use framegraph::error::Result;
use framegraph::resource::*;
use framegraph::{AccessFlags, DomainFlags, ImageLayout, PipelineStageFlags};

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    CreateImage {
        extent: Extent3D,
        usage: ImageUsageFlags,
    },
    CreateBuffer {
        size: u64,
    },
    Barrier {
        image: ImageHandle,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
        src_stages: PipelineStageFlags,
        dst_stages: PipelineStageFlags,
        src_access: AccessFlags,
        dst_access: AccessFlags,
    },
    ClearColor {
        image: ImageHandle,
        layout: ImageLayout,
        value: ClearValue,
    },
    BeginRenderPass,
    EndRenderPass,
    Draw,
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    AcquireNextImage {
        swapchain: SwapchainHandle,
        index: u32,
    },
    QueueSubmit {
        domain: DomainFlags,
        command_buffers: usize,
        waits: usize,
        signals: usize,
        fenced: bool,
    },
    QueuePresent {
        swapchain: SwapchainHandle,
        index: u32,
    },
    WaitFences {
        fences: Vec<FenceHandle>,
    },
}

pub struct MockBackend {
    counter: AtomicU64,
    pub events: Mutex<Vec<Event>>,
    acquire_counter: AtomicU64,
    image_count: u64,
}

impl MockBackend {
    pub fn new() -> Arc<MockBackend> {
        Arc::new(MockBackend {
            counter: AtomicU64::new(1),
            events: Mutex::new(Vec::new()),
            acquire_counter: AtomicU64::new(0),
            image_count: 2,
        })
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    fn record(&self, e: Event) {
        self.events.lock().unwrap().push(e);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Barriers on one image, as (old, new) layout pairs, in order.
    pub fn layout_transitions(&self, image: ImageHandle) -> Vec<(ImageLayout, ImageLayout)> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                Event::Barrier {
                    image: i,
                    old_layout,
                    new_layout,
                    ..
                } if *i == image => Some((*old_layout, *new_layout)),
                _ => None,
            })
            .collect()
    }

    pub fn submits(&self) -> Vec<DomainFlags> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                Event::QueueSubmit { domain, .. } => Some(*domain),
                _ => None,
            })
            .collect()
    }
}

impl DeviceBackend for MockBackend {
    fn create_image(&self, ci: &ImageCreateInfo) -> Result<ImageHandle> {
        self.record(Event::CreateImage {
            extent: ci.extent,
            usage: ci.usage,
        });
        Ok(ImageHandle(self.next()))
    }

    fn create_image_view(&self, _ci: &ImageViewCreateInfo) -> Result<ImageViewHandle> {
        Ok(ImageViewHandle(self.next()))
    }

    fn create_buffer(&self, ci: &BufferCreateInfo) -> Result<Buffer> {
        self.record(Event::CreateBuffer { size: ci.size });
        let id = self.next();
        Ok(Buffer {
            buffer: BufferHandle(id),
            offset: 0,
            size: ci.size,
            device_address: id << 20,
            host_visible: ci.mem_usage.is_host_visible(),
        })
    }

    fn create_framebuffer(&self, _ci: &FramebufferCreateInfo) -> Result<FramebufferHandle> {
        Ok(FramebufferHandle(self.next()))
    }

    fn create_renderpass(&self, _ci: &RenderPassCreateInfo) -> Result<RenderPassHandle> {
        Ok(RenderPassHandle(self.next()))
    }

    fn create_pipeline(&self, _ci: &PipelineCreateInfo) -> Result<PipelineHandle> {
        Ok(PipelineHandle(self.next()))
    }

    fn create_sampler(&self, _ci: &SamplerCreateInfo) -> Result<SamplerHandle> {
        Ok(SamplerHandle(self.next()))
    }

    fn create_descriptor_set_layout(
        &self,
        _ci: &DescriptorSetLayoutCreateInfo,
    ) -> Result<DescriptorSetLayoutHandle> {
        Ok(DescriptorSetLayoutHandle(self.next()))
    }

    fn create_descriptor_pool(
        &self,
        _ci: &DescriptorPoolCreateInfo,
    ) -> Result<DescriptorPoolHandle> {
        Ok(DescriptorPoolHandle(self.next()))
    }

    fn create_descriptor_sets(
        &self,
        _pool: DescriptorPoolHandle,
        _layout: DescriptorSetLayoutHandle,
        count: u32,
    ) -> Result<Vec<DescriptorSetHandle>> {
        Ok((0..count).map(|_| DescriptorSetHandle(self.next())).collect())
    }

    fn write_descriptor_set(&self, _set: DescriptorSetHandle, _contents: &SetBinding) -> Result<()> {
        Ok(())
    }

    fn create_fence(&self) -> Result<FenceHandle> {
        Ok(FenceHandle(self.next()))
    }

    fn create_semaphore(&self) -> Result<SemaphoreHandle> {
        Ok(SemaphoreHandle(self.next()))
    }

    fn create_timeline_semaphore(&self, _initial_value: u64) -> Result<SemaphoreHandle> {
        Ok(SemaphoreHandle(self.next()))
    }

    fn create_command_buffer(&self, _domain: DomainFlags) -> Result<CommandBufferHandle> {
        Ok(CommandBufferHandle(self.next()))
    }

    fn begin_command_buffer(&self, _cb: CommandBufferHandle) -> Result<()> {
        Ok(())
    }

    fn end_command_buffer(&self, _cb: CommandBufferHandle) -> Result<()> {
        Ok(())
    }

    fn cmd_pipeline_barrier(
        &self,
        _cb: CommandBufferHandle,
        image_barriers: &[ImageBarrier],
        _memory_barriers: &[MemoryBarrier],
    ) {
        for b in image_barriers {
            self.record(Event::Barrier {
                image: b.image,
                old_layout: b.old_layout,
                new_layout: b.new_layout,
                src_stages: b.src_stages,
                dst_stages: b.dst_stages,
                src_access: b.src_access,
                dst_access: b.dst_access,
            });
        }
    }

    fn cmd_begin_renderpass(
        &self,
        _cb: CommandBufferHandle,
        _render_pass: RenderPassHandle,
        _framebuffer: FramebufferHandle,
        _render_area: Extent2D,
        _clear_values: &[ClearValue],
    ) {
        self.record(Event::BeginRenderPass);
    }

    fn cmd_next_subpass(&self, _cb: CommandBufferHandle) {}

    fn cmd_end_renderpass(&self, _cb: CommandBufferHandle) {
        self.record(Event::EndRenderPass);
    }

    fn cmd_bind_pipeline(&self, _cb: CommandBufferHandle, _pipeline: PipelineHandle) {}

    fn cmd_bind_descriptor_set(
        &self,
        _cb: CommandBufferHandle,
        _index: u32,
        _set: DescriptorSetHandle,
    ) {
    }

    fn cmd_bind_vertex_buffer(&self, _cb: CommandBufferHandle, _binding: u32, _buffer: Buffer) {}

    fn cmd_bind_index_buffer(&self, _cb: CommandBufferHandle, _buffer: Buffer) {}

    fn cmd_draw(
        &self,
        _cb: CommandBufferHandle,
        _vertices: u32,
        _instances: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.record(Event::Draw);
    }

    fn cmd_draw_indexed(
        &self,
        _cb: CommandBufferHandle,
        _indices: u32,
        _instances: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.record(Event::Draw);
    }

    fn cmd_dispatch(&self, _cb: CommandBufferHandle, x: u32, y: u32, z: u32) {
        self.record(Event::Dispatch { x, y, z });
    }

    fn cmd_copy_buffer(
        &self,
        _cb: CommandBufferHandle,
        _src: Buffer,
        _dst: Buffer,
        _regions: &[CopyRegion],
    ) {
    }

    fn cmd_copy_image(
        &self,
        _cb: CommandBufferHandle,
        _src: ImageHandle,
        _dst: ImageHandle,
        _regions: &[CopyRegion],
    ) {
    }

    fn cmd_copy_buffer_to_image(
        &self,
        _cb: CommandBufferHandle,
        _src: Buffer,
        _dst: ImageHandle,
        _dst_layout: ImageLayout,
    ) {
    }

    fn cmd_clear_color_image(
        &self,
        _cb: CommandBufferHandle,
        image: ImageHandle,
        layout: ImageLayout,
        value: ClearValue,
    ) {
        self.record(Event::ClearColor {
            image,
            layout,
            value,
        });
    }

    fn cmd_resolve_image(&self, _cb: CommandBufferHandle, _src: ImageHandle, _dst: ImageHandle) {}

    fn cmd_blit_image(
        &self,
        _cb: CommandBufferHandle,
        _src: ImageHandle,
        _src_layout: ImageLayout,
        _dst: ImageHandle,
        _dst_layout: ImageLayout,
    ) {
    }

    fn cmd_execute_commands(&self, _cb: CommandBufferHandle, _secondary: &[CommandBufferHandle]) {}

    fn queue_submit(
        &self,
        domain: DomainFlags,
        command_buffers: &[CommandBufferHandle],
        waits: &[(SemaphoreHandle, u64)],
        signals: &[(SemaphoreHandle, u64)],
        fence: Option<FenceHandle>,
    ) -> Result<()> {
        self.record(Event::QueueSubmit {
            domain,
            command_buffers: command_buffers.len(),
            waits: waits.len(),
            signals: signals.len(),
            fenced: fence.is_some(),
        });
        Ok(())
    }

    fn queue_present(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        _wait: &[SemaphoreHandle],
    ) -> Result<()> {
        self.record(Event::QueuePresent {
            swapchain,
            index: image_index,
        });
        Ok(())
    }

    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        _signal: Option<SemaphoreHandle>,
    ) -> Result<u32> {
        let index =
            (self.acquire_counter.fetch_add(1, Ordering::Relaxed) % self.image_count) as u32;
        self.record(Event::AcquireNextImage { swapchain, index });
        Ok(index)
    }

    fn wait_fences(&self, fences: &[FenceHandle]) -> Result<()> {
        self.record(Event::WaitFences {
            fences: fences.to_vec(),
        });
        Ok(())
    }

    fn wait_semaphores(&self, _semaphores: &[(SemaphoreHandle, u64)]) -> Result<()> {
        Ok(())
    }

    fn destroy_image(&self, _image: ImageHandle) {}
    fn destroy_image_view(&self, _view: ImageViewHandle) {}
    fn destroy_buffer(&self, _buffer: BufferHandle) {}
    fn destroy_framebuffer(&self, _fb: FramebufferHandle) {}
    fn destroy_renderpass(&self, _rp: RenderPassHandle) {}
    fn destroy_pipeline(&self, _p: PipelineHandle) {}
    fn destroy_sampler(&self, _s: SamplerHandle) {}
    fn destroy_descriptor_pool(&self, _p: DescriptorPoolHandle) {}
    fn destroy_fence(&self, _f: FenceHandle) {}
    fn destroy_semaphore(&self, _s: SemaphoreHandle) {}
}

/// A two-image swapchain on a fixed extent.
pub fn test_swapchain() -> SwapchainRef {
    let extent = Extent2D {
        width: 1280,
        height: 720,
    };
    let images = (0..2)
        .map(|i| ImageAttachment {
            image: ImageHandle(9000 + i),
            view: ImageViewHandle(9100 + i),
            extent: Extent3D::new(extent.width, extent.height, 1),
            format: framegraph::Format::B8g8r8a8Unorm,
            samples: 1,
            base_level: 0,
            level_count: 1,
            base_layer: 0,
            layer_count: 1,
        })
        .collect();
    std::sync::Arc::new(Swapchain {
        handle: SwapchainHandle(7777),
        images,
        extent,
    })
}
