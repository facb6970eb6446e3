//! Texel formats.

use bitflags::bitflags;

bitflags! {
    pub struct ImageAspectFlags: u32 {
        const COLOR = 0b001;
        const DEPTH = 0b010;
        const STENCIL = 0b100;
    }
}

/// Texel format of an image or attachment.
///
/// This is the subset of formats the compiler has to reason about (attachment
/// creation, aspect masks, clear encoding). Backends are free to support more.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Format {
    Undefined,
    R8Unorm,
    R8g8Unorm,
    R8g8b8a8Unorm,
    R8g8b8a8Srgb,
    B8g8r8a8Unorm,
    B8g8r8a8Srgb,
    R16g16Sfloat,
    R16g16b16a16Sfloat,
    R32Uint,
    R32Sfloat,
    R32g32Sfloat,
    R32g32b32a32Sfloat,
    D16Unorm,
    D32Sfloat,
    D24UnormS8Uint,
    D32SfloatS8Uint,
}

impl Format {
    pub fn aspect(self) -> ImageAspectFlags {
        match self {
            Format::D16Unorm | Format::D32Sfloat => ImageAspectFlags::DEPTH,
            Format::D24UnormS8Uint | Format::D32SfloatS8Uint => {
                ImageAspectFlags::DEPTH | ImageAspectFlags::STENCIL
            }
            _ => ImageAspectFlags::COLOR,
        }
    }

    pub fn is_depth_or_stencil(self) -> bool {
        !self.aspect().intersects(ImageAspectFlags::COLOR)
    }

    /// Byte size of one texel block.
    pub fn block_size(self) -> usize {
        match self {
            Format::Undefined => 0,
            Format::R8Unorm => 1,
            Format::R8g8Unorm | Format::D16Unorm => 2,
            Format::R8g8b8a8Unorm
            | Format::R8g8b8a8Srgb
            | Format::B8g8r8a8Unorm
            | Format::B8g8r8a8Srgb
            | Format::R16g16Sfloat
            | Format::R32Uint
            | Format::R32Sfloat
            | Format::D32Sfloat
            | Format::D24UnormS8Uint => 4,
            Format::R16g16b16a16Sfloat | Format::R32g32Sfloat | Format::D32SfloatS8Uint => 8,
            Format::R32g32b32a32Sfloat => 16,
        }
    }
}

impl Default for Format {
    fn default() -> Format {
        Format::Undefined
    }
}
