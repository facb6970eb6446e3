//! Resource descriptions and handles.
//!
//! The compiler never interprets device objects: everything it receives from
//! the backend is an opaque handle wrapped in a newtype. Creation parameters
//! (`*CreateInfo`) are plain hashable records so they can double as cache
//! keys.

use std::sync::Arc;

use bitflags::bitflags;
use ordered_float::NotNan;

use crate::format::Format;

macro_rules! define_handle {
    ($(#[$m:meta])* $name:ident) => {
        $(#[$m])*
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
        pub struct $name(pub u64);

        impl $name {
            pub fn null() -> $name {
                $name(0)
            }
            pub fn is_null(self) -> bool {
                self.0 == 0
            }
        }
    };
}

define_handle!(ImageHandle);
define_handle!(ImageViewHandle);
define_handle!(BufferHandle);
define_handle!(FramebufferHandle);
define_handle!(RenderPassHandle);
define_handle!(PipelineHandle);
define_handle!(SamplerHandle);
define_handle!(DescriptorSetHandle);
define_handle!(DescriptorSetLayoutHandle);
define_handle!(DescriptorPoolHandle);
define_handle!(FenceHandle);
define_handle!(SemaphoreHandle);
define_handle!(CommandBufferHandle);
define_handle!(SwapchainHandle);

//--------------------------------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct Extent3D {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3D {
    pub fn new(width: u32, height: u32, depth: u32) -> Extent3D {
        Extent3D {
            width,
            height,
            depth,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0 || self.depth == 0
    }
}

bitflags! {
    pub struct ImageUsageFlags: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const SAMPLED = 1 << 2;
        const STORAGE = 1 << 3;
        const COLOR_ATTACHMENT = 1 << 4;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 5;
        const TRANSIENT_ATTACHMENT = 1 << 6;
        const INPUT_ATTACHMENT = 1 << 7;
    }
}

bitflags! {
    pub struct BufferUsageFlags: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const UNIFORM_BUFFER = 1 << 2;
        const STORAGE_BUFFER = 1 << 3;
        const INDEX_BUFFER = 1 << 4;
        const VERTEX_BUFFER = 1 << 5;
        const INDIRECT_BUFFER = 1 << 6;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ImageType {
    D1,
    D2,
    D3,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ImageTiling {
    Optimal,
    Linear,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MemoryUsage {
    GpuOnly,
    CpuOnly,
    CpuToGpu,
    GpuToCpu,
}

impl MemoryUsage {
    pub fn is_host_visible(self) -> bool {
        match self {
            MemoryUsage::GpuOnly => false,
            _ => true,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ImageCreateInfo {
    pub flags: u32,
    pub image_type: ImageType,
    pub tiling: ImageTiling,
    pub usage: ImageUsageFlags,
    pub extent: Extent3D,
    pub format: Format,
    pub samples: u32,
    pub levels: u32,
    pub layers: u32,
}

impl Default for ImageCreateInfo {
    fn default() -> ImageCreateInfo {
        ImageCreateInfo {
            flags: 0,
            image_type: ImageType::D2,
            tiling: ImageTiling::Optimal,
            usage: ImageUsageFlags::empty(),
            extent: Extent3D::default(),
            format: Format::Undefined,
            samples: 1,
            levels: 1,
            layers: 1,
        }
    }
}

pub const REMAINING_LEVELS: u32 = !0;
pub const REMAINING_LAYERS: u32 = !0;

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ImageViewCreateInfo {
    pub base_level: u32,
    pub level_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
    pub image: ImageHandle,
    pub format: Format,
}

/// A concrete image together with the view and subresource window through
/// which the graph sees it.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct ImageAttachment {
    pub image: ImageHandle,
    pub view: ImageViewHandle,
    pub extent: Extent3D,
    pub format: Format,
    pub samples: u32,
    pub base_level: u32,
    pub level_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl ImageAttachment {
    /// Restrict the attachment to a mip window. Does not touch the handles.
    pub fn mip_range(&self, base: u32, count: u32) -> ImageAttachment {
        let mut a = self.clone();
        a.base_level = self.base_level + base;
        a.level_count = count;
        a
    }

    /// Restrict the attachment to a layer window. Does not touch the handles.
    pub fn layer_range(&self, base: u32, count: u32) -> ImageAttachment {
        let mut a = self.clone();
        a.base_layer = self.base_layer + base;
        a.layer_count = count;
        a
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct BufferCreateInfo {
    pub mem_usage: MemoryUsage,
    pub usage: BufferUsageFlags,
    pub size: u64,
    pub alignment: u64,
}

/// A contiguous portion of device-visible memory.
///
/// Offset/sub-range derivations produce new `Buffer` values with adjusted
/// fields; the creation metadata of the parent allocation is never aliased.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct Buffer {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
    pub device_address: u64,
    pub host_visible: bool,
}

impl Buffer {
    pub fn add_offset(&self, offset: u64) -> Buffer {
        assert!(offset <= self.size);
        Buffer {
            buffer: self.buffer,
            offset: self.offset + offset,
            size: self.size - offset,
            device_address: if self.device_address != 0 {
                self.device_address + offset
            } else {
                0
            },
            host_visible: self.host_visible,
        }
    }

    pub fn subrange(&self, offset: u64, size: u64) -> Buffer {
        assert!(offset + size <= self.size);
        Buffer {
            buffer: self.buffer,
            offset: self.offset + offset,
            size,
            device_address: if self.device_address != 0 {
                self.device_address + offset
            } else {
                0
            },
            host_visible: self.host_visible,
        }
    }
}

//--------------------------------------------------------------------------------------------------

/// External swapchain state. The compiler only ever indexes into `images` and
/// reads `extent`; everything else is backend business.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Swapchain {
    pub handle: SwapchainHandle,
    pub images: Vec<ImageAttachment>,
    pub extent: Extent2D,
}

pub type SwapchainRef = Arc<Swapchain>;

//--------------------------------------------------------------------------------------------------

/// Clear values are cache-key material (render pass begin), hence the
/// `NotNan` components.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ClearValue {
    Color([NotNan<f32>; 4]),
    DepthStencil { depth: NotNan<f32>, stencil: u32 },
}

impl ClearValue {
    pub fn color(r: f32, g: f32, b: f32, a: f32) -> ClearValue {
        ClearValue::Color([
            NotNan::new(r).unwrap(),
            NotNan::new(g).unwrap(),
            NotNan::new(b).unwrap(),
            NotNan::new(a).unwrap(),
        ])
    }

    pub fn depth(depth: f32) -> ClearValue {
        ClearValue::DepthStencil {
            depth: NotNan::new(depth).unwrap(),
            stencil: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SamplerAddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SamplerCreateInfo {
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub mipmap_mode: Filter,
    pub address_u: SamplerAddressMode,
    pub address_v: SamplerAddressMode,
    pub address_w: SamplerAddressMode,
    pub min_lod: NotNan<f32>,
    pub max_lod: NotNan<f32>,
    pub lod_bias: NotNan<f32>,
}

impl Default for SamplerCreateInfo {
    fn default() -> SamplerCreateInfo {
        SamplerCreateInfo {
            min_filter: Filter::Linear,
            mag_filter: Filter::Linear,
            mipmap_mode: Filter::Nearest,
            address_u: SamplerAddressMode::ClampToEdge,
            address_v: SamplerAddressMode::ClampToEdge,
            address_w: SamplerAddressMode::ClampToEdge,
            min_lod: NotNan::new(0.0).unwrap(),
            max_lod: NotNan::new(1000.0).unwrap(),
            lod_bias: NotNan::new(0.0).unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_subrange_adjusts_all_derived_fields() {
        let b = Buffer {
            buffer: BufferHandle(7),
            offset: 64,
            size: 256,
            device_address: 0x1000,
            host_visible: true,
        };
        let sub = b.subrange(32, 64);
        assert_eq!(sub.offset, 96);
        assert_eq!(sub.size, 64);
        assert_eq!(sub.device_address, 0x1020);
        assert_eq!(sub.buffer, b.buffer);

        let tail = b.add_offset(128);
        assert_eq!(tail.size, 128);
        assert_eq!(tail.device_address, 0x1080);
        // parent untouched
        assert_eq!(b.offset, 64);
        assert_eq!(b.size, 256);
    }
}
