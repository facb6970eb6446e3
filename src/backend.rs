//! Device backend interface.
//!
//! The `DeviceBackend` trait is the narrow boundary between the compiler and
//! a graphics API: object creation, command recording, queue submission and
//! waiting. The core hands handles back to the backend verbatim and never
//! interprets them.
//!
//! See the `tests/` tree for a recording implementation used by the
//! integration tests.

use std::sync::Arc;

use crate::access::{AccessFlags, DomainFlags, ImageLayout, PipelineStageFlags};
use crate::error::Result;
use crate::format::{Format, ImageAspectFlags};
use crate::ir::value::Value;
use crate::reflect::StageFlags;
use crate::resource::{
    Buffer, BufferCreateInfo, BufferHandle, ClearValue, CommandBufferHandle, DescriptorPoolHandle,
    DescriptorSetHandle, DescriptorSetLayoutHandle, Extent2D, Extent3D, FenceHandle,
    FramebufferHandle, ImageCreateInfo, ImageHandle, ImageViewCreateInfo, ImageViewHandle,
    PipelineHandle, RenderPassHandle, SamplerCreateInfo, SamplerHandle, SemaphoreHandle,
    SwapchainHandle,
};

//--------------------------------------------------------------------------------------------------
// barriers

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ImageBarrier {
    pub image: ImageHandle,
    pub src_stages: PipelineStageFlags,
    pub src_access: AccessFlags,
    pub old_layout: ImageLayout,
    pub dst_stages: PipelineStageFlags,
    pub dst_access: AccessFlags,
    pub new_layout: ImageLayout,
    pub aspect: ImageAspectFlags,
    pub base_level: u32,
    pub level_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MemoryBarrier {
    pub src_stages: PipelineStageFlags,
    pub src_access: AccessFlags,
    pub dst_stages: PipelineStageFlags,
    pub dst_access: AccessFlags,
}

//--------------------------------------------------------------------------------------------------
// creation records (double as cache keys)

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StoreOp {
    Store,
    DontCare,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct AttachmentDescription {
    pub format: Format,
    pub samples: u32,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub initial_layout: ImageLayout,
    pub final_layout: ImageLayout,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct RenderPassCreateInfo {
    pub attachments: Vec<AttachmentDescription>,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct FramebufferCreateInfo {
    pub render_pass: RenderPassHandle,
    pub attachments: Vec<ImageViewHandle>,
    pub extent: Extent2D,
    pub layers: u32,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct PipelineCreateInfo {
    pub stages: Vec<(StageFlags, Arc<[u8]>)>,
    pub render_pass: Option<RenderPassHandle>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DescriptorType {
    Sampler,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    UniformTexelBuffer,
    StorageTexelBuffer,
    UniformBuffer,
    StorageBuffer,
    InputAttachment,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DescriptorSetLayoutBinding {
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    pub count: u32,
    pub stages: StageFlags,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct DescriptorSetLayoutCreateInfo {
    pub bindings: Vec<DescriptorSetLayoutBinding>,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DescriptorPoolCreateInfo {
    pub max_sets: u32,
    pub sizes: Vec<(DescriptorType, u32)>,
}

/// One bound resource inside a descriptor set.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum DescriptorBinding {
    Buffer {
        buffer: Buffer,
    },
    Image {
        view: ImageViewHandle,
        layout: ImageLayout,
    },
    CombinedImageSampler {
        view: ImageViewHandle,
        layout: ImageLayout,
        sampler: SamplerHandle,
    },
    Sampler {
        sampler: SamplerHandle,
    },
}

/// Full contents of a descriptor set; the per-frame descriptor cache key.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SetBinding {
    pub layout: DescriptorSetLayoutHandle,
    pub bindings: Vec<(u32, DescriptorBinding)>,
}

//--------------------------------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CopyRegion {
    Buffer {
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    },
    Image {
        src_level: u32,
        dst_level: u32,
        extent: Extent3D,
    },
}

/// The GPU encoder interface consumed by the executor and the allocators.
///
/// All methods take `&self`: implementations are expected to be internally
/// synchronized the way a Vulkan device is (per-queue submission order is the
/// caller's business, object creation is free-threaded).
pub trait DeviceBackend: Send + Sync {
    fn create_image(&self, ci: &ImageCreateInfo) -> Result<ImageHandle>;
    fn create_image_view(&self, ci: &ImageViewCreateInfo) -> Result<ImageViewHandle>;
    fn create_buffer(&self, ci: &BufferCreateInfo) -> Result<Buffer>;
    fn create_framebuffer(&self, ci: &FramebufferCreateInfo) -> Result<FramebufferHandle>;
    fn create_renderpass(&self, ci: &RenderPassCreateInfo) -> Result<RenderPassHandle>;
    fn create_pipeline(&self, ci: &PipelineCreateInfo) -> Result<PipelineHandle>;
    fn create_sampler(&self, ci: &SamplerCreateInfo) -> Result<SamplerHandle>;
    fn create_descriptor_set_layout(
        &self,
        ci: &DescriptorSetLayoutCreateInfo,
    ) -> Result<DescriptorSetLayoutHandle>;
    fn create_descriptor_pool(&self, ci: &DescriptorPoolCreateInfo) -> Result<DescriptorPoolHandle>;
    /// Allocate `count` sets of `layout` out of `pool`, up front.
    fn create_descriptor_sets(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
        count: u32,
    ) -> Result<Vec<DescriptorSetHandle>>;
    fn write_descriptor_set(&self, set: DescriptorSetHandle, contents: &SetBinding) -> Result<()>;
    fn create_fence(&self) -> Result<FenceHandle>;
    fn create_semaphore(&self) -> Result<SemaphoreHandle>;
    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<SemaphoreHandle>;
    fn create_command_buffer(&self, domain: DomainFlags) -> Result<CommandBufferHandle>;

    fn begin_command_buffer(&self, cb: CommandBufferHandle) -> Result<()>;
    fn end_command_buffer(&self, cb: CommandBufferHandle) -> Result<()>;

    fn cmd_pipeline_barrier(
        &self,
        cb: CommandBufferHandle,
        image_barriers: &[ImageBarrier],
        memory_barriers: &[MemoryBarrier],
    );
    fn cmd_begin_renderpass(
        &self,
        cb: CommandBufferHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        render_area: Extent2D,
        clear_values: &[ClearValue],
    );
    fn cmd_next_subpass(&self, cb: CommandBufferHandle);
    fn cmd_end_renderpass(&self, cb: CommandBufferHandle);
    fn cmd_bind_pipeline(&self, cb: CommandBufferHandle, pipeline: PipelineHandle);
    fn cmd_bind_descriptor_set(
        &self,
        cb: CommandBufferHandle,
        index: u32,
        set: DescriptorSetHandle,
    );
    fn cmd_bind_vertex_buffer(&self, cb: CommandBufferHandle, binding: u32, buffer: Buffer);
    fn cmd_bind_index_buffer(&self, cb: CommandBufferHandle, buffer: Buffer);
    fn cmd_draw(
        &self,
        cb: CommandBufferHandle,
        vertices: u32,
        instances: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_draw_indexed(
        &self,
        cb: CommandBufferHandle,
        indices: u32,
        instances: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn cmd_dispatch(&self, cb: CommandBufferHandle, x: u32, y: u32, z: u32);
    fn cmd_copy_buffer(
        &self,
        cb: CommandBufferHandle,
        src: Buffer,
        dst: Buffer,
        regions: &[CopyRegion],
    );
    fn cmd_copy_image(
        &self,
        cb: CommandBufferHandle,
        src: ImageHandle,
        dst: ImageHandle,
        regions: &[CopyRegion],
    );
    fn cmd_copy_buffer_to_image(
        &self,
        cb: CommandBufferHandle,
        src: Buffer,
        dst: ImageHandle,
        dst_layout: ImageLayout,
    );
    fn cmd_clear_color_image(
        &self,
        cb: CommandBufferHandle,
        image: ImageHandle,
        layout: ImageLayout,
        value: ClearValue,
    );
    fn cmd_resolve_image(&self, cb: CommandBufferHandle, src: ImageHandle, dst: ImageHandle);
    fn cmd_blit_image(
        &self,
        cb: CommandBufferHandle,
        src: ImageHandle,
        src_layout: ImageLayout,
        dst: ImageHandle,
        dst_layout: ImageLayout,
    );
    fn cmd_execute_commands(&self, cb: CommandBufferHandle, secondary: &[CommandBufferHandle]);

    fn queue_submit(
        &self,
        domain: DomainFlags,
        command_buffers: &[CommandBufferHandle],
        waits: &[(SemaphoreHandle, u64)],
        signals: &[(SemaphoreHandle, u64)],
        fence: Option<FenceHandle>,
    ) -> Result<()>;
    fn queue_present(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait: &[SemaphoreHandle],
    ) -> Result<()>;
    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        signal: Option<SemaphoreHandle>,
    ) -> Result<u32>;

    fn wait_fences(&self, fences: &[FenceHandle]) -> Result<()>;
    fn wait_semaphores(&self, semaphores: &[(SemaphoreHandle, u64)]) -> Result<()>;

    fn destroy_image(&self, image: ImageHandle);
    fn destroy_image_view(&self, view: ImageViewHandle);
    fn destroy_buffer(&self, buffer: BufferHandle);
    fn destroy_framebuffer(&self, fb: FramebufferHandle);
    fn destroy_renderpass(&self, rp: RenderPassHandle);
    fn destroy_pipeline(&self, p: PipelineHandle);
    fn destroy_sampler(&self, s: SamplerHandle);
    fn destroy_descriptor_pool(&self, p: DescriptorPoolHandle);
    fn destroy_fence(&self, f: FenceHandle);
    fn destroy_semaphore(&self, s: SemaphoreHandle);
}

/// What an opaque-function callback sees while its call is being recorded.
pub struct RecordContext<'a> {
    pub backend: &'a dyn DeviceBackend,
    pub cb: CommandBufferHandle,
    /// Resolved argument values, in call argument order.
    pub args: &'a [Value],
    /// The queue this call was scheduled onto.
    pub domain: DomainFlags,
}

pub type ExecFn = Box<dyn Fn(&mut RecordContext) -> Result<()> + Send + Sync>;
