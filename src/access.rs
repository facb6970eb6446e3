//! Access kinds and their lowering to pipeline synchronization.
//!
//! Passes describe *what* they do to a resource with an [`Access`]; the
//! compiler lowers that to a [`ResourceUse`] (stage mask, access mask, image
//! layout) when it builds barriers and semaphore waits.

use bitflags::bitflags;

use crate::resource::ImageUsageFlags;

bitflags! {
    pub struct PipelineStageFlags: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const DRAW_INDIRECT = 1 << 1;
        const VERTEX_INPUT = 1 << 2;
        const VERTEX_SHADER = 1 << 3;
        const FRAGMENT_SHADER = 1 << 4;
        const EARLY_FRAGMENT_TESTS = 1 << 5;
        const LATE_FRAGMENT_TESTS = 1 << 6;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 7;
        const COMPUTE_SHADER = 1 << 8;
        const TRANSFER = 1 << 9;
        const BOTTOM_OF_PIPE = 1 << 10;
        const HOST = 1 << 11;
        const ALL_COMMANDS = 1 << 12;
    }
}

bitflags! {
    pub struct AccessFlags: u32 {
        const INDIRECT_COMMAND_READ = 1 << 0;
        const INDEX_READ = 1 << 1;
        const VERTEX_ATTRIBUTE_READ = 1 << 2;
        const UNIFORM_READ = 1 << 3;
        const SHADER_READ = 1 << 4;
        const SHADER_WRITE = 1 << 5;
        const COLOR_ATTACHMENT_READ = 1 << 6;
        const COLOR_ATTACHMENT_WRITE = 1 << 7;
        const DEPTH_STENCIL_ATTACHMENT_READ = 1 << 8;
        const DEPTH_STENCIL_ATTACHMENT_WRITE = 1 << 9;
        const TRANSFER_READ = 1 << 10;
        const TRANSFER_WRITE = 1 << 11;
        const HOST_READ = 1 << 12;
        const HOST_WRITE = 1 << 13;
        const MEMORY_READ = 1 << 14;
        const MEMORY_WRITE = 1 << 15;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ImageLayout {
    Undefined,
    General,
    ColorAttachmentOptimal,
    DepthStencilAttachmentOptimal,
    DepthStencilReadOnlyOptimal,
    ShaderReadOnlyOptimal,
    TransferSrcOptimal,
    TransferDstOptimal,
    ReadOnlyOptimalKhr,
    Preinitialized,
    PresentSrcKhr,
}

impl Default for ImageLayout {
    fn default() -> ImageLayout {
        ImageLayout::Undefined
    }
}

bitflags! {
    /// Coarse execution sites. Also used as compute classes during constant
    /// folding, where the numeric ordering of the bits matters:
    /// placeholder < constant < host < device.
    pub struct DomainFlags: u32 {
        const PLACEHOLDER = 1 << 0;
        const CONSTANT = 1 << 1;
        const HOST = 1 << 2;
        const PE = 1 << 3;
        const TRANSFER_QUEUE = 1 << 4;
        const COMPUTE_QUEUE = 1 << 5;
        const GRAPHICS_QUEUE = 1 << 6;
        const DEVICE = Self::TRANSFER_QUEUE.bits | Self::COMPUTE_QUEUE.bits | Self::GRAPHICS_QUEUE.bits;
        const ANY = Self::DEVICE.bits | Self::HOST.bits;
    }
}

impl DomainFlags {
    /// True if this is exactly one of the three queue domains.
    pub fn is_queue(self) -> bool {
        self == DomainFlags::GRAPHICS_QUEUE
            || self == DomainFlags::COMPUTE_QUEUE
            || self == DomainFlags::TRANSFER_QUEUE
    }

    /// The first set queue bit, in transfer < compute < graphics order.
    pub fn pick_first_domain(self) -> DomainFlags {
        for d in &[
            DomainFlags::TRANSFER_QUEUE,
            DomainFlags::COMPUTE_QUEUE,
            DomainFlags::GRAPHICS_QUEUE,
            DomainFlags::HOST,
        ] {
            if self.contains(*d) {
                return *d;
            }
        }
        self
    }

    pub fn to_str(self) -> &'static str {
        match self {
            DomainFlags::HOST => "Host",
            DomainFlags::PE => "PE",
            DomainFlags::TRANSFER_QUEUE => "Transfer",
            DomainFlags::COMPUTE_QUEUE => "Compute",
            DomainFlags::GRAPHICS_QUEUE => "Graphics",
            DomainFlags::DEVICE => "Device",
            DomainFlags::ANY => "Any",
            _ => "?",
        }
    }
}

/// Semantic access a pass makes to a resource.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Access {
    None,
    Clear,
    ColorRead,
    ColorWrite,
    ColorRW,
    ColorResolveRead,
    ColorResolveWrite,
    DepthStencilRead,
    DepthStencilRW,
    FragmentSampled,
    FragmentRead,
    FragmentWrite,
    TransferRead,
    TransferWrite,
    TransferClear,
    ComputeRead,
    ComputeWrite,
    ComputeRW,
    ComputeSampled,
    AttributeRead,
    VertexRead,
    IndexRead,
    IndirectRead,
    HostRead,
    HostWrite,
    HostRW,
    MemoryRead,
    MemoryWrite,
    MemoryRW,
}

/// The lowered form of an [`Access`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct ResourceUse {
    pub stages: PipelineStageFlags,
    pub access: AccessFlags,
    pub layout: ImageLayout,
}

impl Default for PipelineStageFlags {
    fn default() -> PipelineStageFlags {
        PipelineStageFlags::empty()
    }
}

impl Default for AccessFlags {
    fn default() -> AccessFlags {
        AccessFlags::empty()
    }
}

pub fn is_write_access(ia: Access) -> bool {
    match ia {
        Access::Clear
        | Access::ColorResolveWrite
        | Access::ColorWrite
        | Access::ColorRW
        | Access::DepthStencilRW
        | Access::FragmentWrite
        | Access::TransferWrite
        | Access::TransferClear
        | Access::ComputeWrite
        | Access::ComputeRW
        | Access::HostWrite
        | Access::HostRW
        | Access::MemoryWrite
        | Access::MemoryRW => true,
        _ => false,
    }
}

pub fn is_read_access(ia: Access) -> bool {
    match ia {
        Access::ColorResolveRead
        | Access::ColorRead
        | Access::ColorRW
        | Access::DepthStencilRead
        | Access::DepthStencilRW
        | Access::FragmentRead
        | Access::FragmentSampled
        | Access::TransferRead
        | Access::ComputeRead
        | Access::ComputeSampled
        | Access::ComputeRW
        | Access::AttributeRead
        | Access::VertexRead
        | Access::IndexRead
        | Access::IndirectRead
        | Access::HostRead
        | Access::HostRW
        | Access::MemoryRead
        | Access::MemoryRW => true,
        _ => false,
    }
}

pub fn is_transfer_access(ia: Access) -> bool {
    match ia {
        Access::TransferRead | Access::TransferWrite | Access::TransferClear => true,
        _ => false,
    }
}

pub fn is_storage_access(ia: Access) -> bool {
    match ia {
        Access::FragmentRead
        | Access::FragmentWrite
        | Access::ComputeRead
        | Access::ComputeWrite
        | Access::ComputeRW
        | Access::HostRead
        | Access::HostWrite
        | Access::HostRW
        | Access::MemoryRead
        | Access::MemoryWrite
        | Access::MemoryRW => true,
        _ => false,
    }
}

/// Accesses that can live in a read-only optimal layout.
pub fn is_readonly_access(ia: Access) -> bool {
    match ia {
        Access::FragmentSampled | Access::ComputeSampled | Access::DepthStencilRead => true,
        _ => false,
    }
}

pub fn access_name(ia: Access) -> &'static str {
    match ia {
        Access::None => "none",
        Access::Clear => "clear",
        Access::ColorRead => "color_read",
        Access::ColorWrite => "color_write",
        Access::ColorRW => "color_rw",
        Access::ColorResolveRead => "color_resolve_read",
        Access::ColorResolveWrite => "color_resolve_write",
        Access::DepthStencilRead => "depth_stencil_read",
        Access::DepthStencilRW => "depth_stencil_rw",
        Access::FragmentSampled => "fragment_sampled",
        Access::FragmentRead => "fragment_read",
        Access::FragmentWrite => "fragment_write",
        Access::TransferRead => "transfer_read",
        Access::TransferWrite => "transfer_write",
        Access::TransferClear => "transfer_clear",
        Access::ComputeRead => "compute_read",
        Access::ComputeWrite => "compute_write",
        Access::ComputeRW => "compute_rw",
        Access::ComputeSampled => "compute_sampled",
        Access::AttributeRead => "attribute_read",
        Access::VertexRead => "vertex_read",
        Access::IndexRead => "index_read",
        Access::IndirectRead => "indirect_read",
        Access::HostRead => "host_read",
        Access::HostWrite => "host_write",
        Access::HostRW => "host_rw",
        Access::MemoryRead => "memory_read",
        Access::MemoryWrite => "memory_write",
        Access::MemoryRW => "memory_rw",
    }
}

/// Total lowering of an access to (stages, access bits, layout).
pub fn to_use(ia: Access) -> ResourceUse {
    use self::Access::*;
    let (stages, access, layout) = match ia {
        ColorResolveWrite | ColorWrite => (
            PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            AccessFlags::COLOR_ATTACHMENT_WRITE,
            ImageLayout::ColorAttachmentOptimal,
        ),
        ColorRW => (
            PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            AccessFlags::COLOR_ATTACHMENT_WRITE | AccessFlags::COLOR_ATTACHMENT_READ,
            ImageLayout::ColorAttachmentOptimal,
        ),
        ColorResolveRead | ColorRead => (
            PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            AccessFlags::COLOR_ATTACHMENT_READ,
            ImageLayout::ColorAttachmentOptimal,
        ),
        DepthStencilRW => (
            PipelineStageFlags::EARLY_FRAGMENT_TESTS | PipelineStageFlags::LATE_FRAGMENT_TESTS,
            AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ImageLayout::DepthStencilAttachmentOptimal,
        ),
        DepthStencilRead => (
            PipelineStageFlags::EARLY_FRAGMENT_TESTS | PipelineStageFlags::LATE_FRAGMENT_TESTS,
            AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
            ImageLayout::DepthStencilReadOnlyOptimal,
        ),
        FragmentSampled | FragmentRead => (
            PipelineStageFlags::FRAGMENT_SHADER,
            AccessFlags::SHADER_READ,
            ImageLayout::ShaderReadOnlyOptimal,
        ),
        FragmentWrite => (
            PipelineStageFlags::FRAGMENT_SHADER,
            AccessFlags::SHADER_WRITE,
            ImageLayout::General,
        ),
        TransferRead => (
            PipelineStageFlags::TRANSFER,
            AccessFlags::TRANSFER_READ,
            ImageLayout::TransferSrcOptimal,
        ),
        TransferWrite | TransferClear => (
            PipelineStageFlags::TRANSFER,
            AccessFlags::TRANSFER_WRITE,
            ImageLayout::TransferDstOptimal,
        ),
        ComputeRead => (
            PipelineStageFlags::COMPUTE_SHADER,
            AccessFlags::SHADER_READ,
            ImageLayout::General,
        ),
        ComputeWrite => (
            PipelineStageFlags::COMPUTE_SHADER,
            AccessFlags::SHADER_WRITE,
            ImageLayout::General,
        ),
        ComputeRW => (
            PipelineStageFlags::COMPUTE_SHADER,
            AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
            ImageLayout::General,
        ),
        ComputeSampled => (
            PipelineStageFlags::COMPUTE_SHADER,
            AccessFlags::SHADER_READ,
            ImageLayout::ShaderReadOnlyOptimal,
        ),
        // layout is ignored for buffer-only accesses
        AttributeRead => (
            PipelineStageFlags::VERTEX_INPUT,
            AccessFlags::VERTEX_ATTRIBUTE_READ,
            ImageLayout::General,
        ),
        VertexRead => (
            PipelineStageFlags::VERTEX_SHADER,
            AccessFlags::SHADER_READ,
            ImageLayout::General,
        ),
        IndexRead => (
            PipelineStageFlags::VERTEX_INPUT,
            AccessFlags::INDEX_READ,
            ImageLayout::General,
        ),
        IndirectRead => (
            PipelineStageFlags::DRAW_INDIRECT,
            AccessFlags::INDIRECT_COMMAND_READ,
            ImageLayout::General,
        ),
        HostRead => (
            PipelineStageFlags::HOST,
            AccessFlags::HOST_READ,
            ImageLayout::General,
        ),
        HostWrite => (
            PipelineStageFlags::HOST,
            AccessFlags::HOST_WRITE,
            ImageLayout::General,
        ),
        HostRW => (
            PipelineStageFlags::HOST,
            AccessFlags::HOST_READ | AccessFlags::HOST_WRITE,
            ImageLayout::General,
        ),
        MemoryRead => (
            PipelineStageFlags::BOTTOM_OF_PIPE,
            AccessFlags::MEMORY_READ,
            ImageLayout::General,
        ),
        MemoryWrite => (
            PipelineStageFlags::BOTTOM_OF_PIPE,
            AccessFlags::MEMORY_WRITE,
            ImageLayout::General,
        ),
        MemoryRW => (
            PipelineStageFlags::BOTTOM_OF_PIPE,
            AccessFlags::MEMORY_READ | AccessFlags::MEMORY_WRITE,
            ImageLayout::General,
        ),
        Clear => (
            PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            AccessFlags::COLOR_ATTACHMENT_WRITE,
            ImageLayout::Preinitialized,
        ),
        None => (
            PipelineStageFlags::TOP_OF_PIPE,
            AccessFlags::empty(),
            ImageLayout::Undefined,
        ),
    };
    ResourceUse {
        stages,
        access,
        layout,
    }
}

pub fn is_write_use(u: ResourceUse) -> bool {
    u.access.intersects(
        AccessFlags::COLOR_ATTACHMENT_WRITE
            | AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
            | AccessFlags::SHADER_WRITE
            | AccessFlags::TRANSFER_WRITE
            | AccessFlags::HOST_WRITE
            | AccessFlags::MEMORY_WRITE,
    )
}

pub fn is_framebuffer_attachment_use(u: ResourceUse) -> bool {
    match u.layout {
        ImageLayout::ColorAttachmentOptimal | ImageLayout::DepthStencilAttachmentOptimal => true,
        _ => false,
    }
}

pub fn is_framebuffer_attachment(ia: Access) -> bool {
    match ia {
        Access::ColorWrite
        | Access::ColorRW
        | Access::ColorRead
        | Access::ColorResolveRead
        | Access::ColorResolveWrite
        | Access::DepthStencilRead
        | Access::DepthStencilRW => true,
        _ => false,
    }
}

/// Accumulate the image usage implied by an access.
pub fn access_to_usage(usage: &mut ImageUsageFlags, ia: Access) {
    match ia {
        Access::ColorRead | Access::ColorWrite | Access::ColorRW | Access::Clear => {
            *usage |= ImageUsageFlags::COLOR_ATTACHMENT;
        }
        Access::ColorResolveRead | Access::ColorResolveWrite => {
            *usage |= ImageUsageFlags::COLOR_ATTACHMENT;
        }
        Access::DepthStencilRead | Access::DepthStencilRW => {
            *usage |= ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        Access::FragmentSampled | Access::ComputeSampled => {
            *usage |= ImageUsageFlags::SAMPLED;
        }
        Access::FragmentRead | Access::FragmentWrite => {
            *usage |= ImageUsageFlags::STORAGE;
        }
        Access::ComputeRead | Access::ComputeWrite | Access::ComputeRW => {
            *usage |= ImageUsageFlags::STORAGE;
        }
        Access::TransferRead => {
            *usage |= ImageUsageFlags::TRANSFER_SRC;
        }
        Access::TransferWrite | Access::TransferClear => {
            *usage |= ImageUsageFlags::TRANSFER_DST;
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_accesses_are_consistent_with_lowering() {
        for &a in &[
            Access::ColorWrite,
            Access::ComputeRW,
            Access::TransferClear,
            Access::MemoryRW,
        ] {
            assert!(is_write_access(a));
            assert!(is_write_use(to_use(a)));
        }
        for &a in &[Access::FragmentSampled, Access::ColorRead, Access::IndexRead] {
            assert!(!is_write_access(a));
            assert!(!is_write_use(to_use(a)));
        }
    }

    #[test]
    fn lowering_is_total() {
        // every access has a defined lowering; this is mostly a compile-time
        // guarantee, but spot-check the interesting layouts
        assert_eq!(to_use(Access::TransferRead).layout, ImageLayout::TransferSrcOptimal);
        assert_eq!(to_use(Access::TransferClear).layout, ImageLayout::TransferDstOptimal);
        assert_eq!(
            to_use(Access::FragmentSampled).layout,
            ImageLayout::ShaderReadOnlyOptimal
        );
        assert_eq!(to_use(Access::None).layout, ImageLayout::Undefined);
    }

    #[test]
    fn queue_domain_picking() {
        assert_eq!(
            DomainFlags::DEVICE.pick_first_domain(),
            DomainFlags::TRANSFER_QUEUE
        );
        assert_eq!(
            (DomainFlags::GRAPHICS_QUEUE | DomainFlags::COMPUTE_QUEUE).pick_first_domain(),
            DomainFlags::COMPUTE_QUEUE
        );
        assert!(DomainFlags::GRAPHICS_QUEUE.is_queue());
        assert!(!DomainFlags::DEVICE.is_queue());
    }
}
