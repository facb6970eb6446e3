//! Shader reflection records.
//!
//! Reflection is an external concern: something turns shader bytes into a
//! [`ShaderReflection`], the compiler only consumes the record (descriptor
//! layouts, push constants, workgroup size). Records for the stages of one
//! pipeline are merged with [`ShaderReflection::append`].

use bitflags::bitflags;
use fxhash::FxHashMap;

use crate::error::Result;

bitflags! {
    pub struct StageFlags: u32 {
        const VERTEX = 1 << 0;
        const TESS_CONTROL = 1 << 1;
        const TESS_EVAL = 1 << 2;
        const GEOMETRY = 1 << 3;
        const FRAGMENT = 1 << 4;
        const COMPUTE = 1 << 5;
    }
}

impl Default for StageFlags {
    fn default() -> StageFlags {
        StageFlags::empty()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReflectedType {
    UInt,
    Int,
    Float,
    Double,
    UVec2,
    UVec3,
    UVec4,
    IVec2,
    IVec3,
    IVec4,
    Vec2,
    Vec3,
    Vec4,
    Mat4,
    Struct,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub location: u32,
    pub ty: ReflectedType,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PushConstantRange {
    pub stages: StageFlags,
    pub offset: u32,
    pub size: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SpecConstant {
    pub constant_id: u32,
    pub ty: ReflectedType,
    pub stages: StageFlags,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReflectedBinding {
    pub name: String,
    pub binding: u32,
    pub array_size: u32,
    pub stages: StageFlags,
}

/// Descriptors declared in one set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DescriptorSetReflection {
    pub uniform_buffers: Vec<ReflectedBinding>,
    pub storage_buffers: Vec<ReflectedBinding>,
    pub storage_images: Vec<ReflectedBinding>,
    pub samplers: Vec<ReflectedBinding>,
    pub subpass_inputs: Vec<ReflectedBinding>,
    pub texel_buffers: Vec<ReflectedBinding>,
    pub highest_binding: u32,
}

impl DescriptorSetReflection {
    fn append(&mut self, o: &DescriptorSetReflection) {
        fn merge(dst: &mut Vec<ReflectedBinding>, src: &[ReflectedBinding]) {
            for b in src {
                if let Some(existing) = dst.iter_mut().find(|e| e.binding == b.binding) {
                    existing.stages |= b.stages;
                } else {
                    dst.push(b.clone());
                }
            }
        }
        merge(&mut self.uniform_buffers, &o.uniform_buffers);
        merge(&mut self.storage_buffers, &o.storage_buffers);
        merge(&mut self.storage_images, &o.storage_images);
        merge(&mut self.samplers, &o.samplers);
        merge(&mut self.subpass_inputs, &o.subpass_inputs);
        merge(&mut self.texel_buffers, &o.texel_buffers);
        self.highest_binding = self.highest_binding.max(o.highest_binding);
    }
}

/// Everything the compiler needs to know about one shader stage (or, after
/// merging, one pipeline).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShaderReflection {
    pub stage: StageFlags,
    pub local_size: [u32; 3],
    pub attributes: Vec<Attribute>,
    pub push_constant_ranges: Vec<PushConstantRange>,
    pub spec_constants: Vec<SpecConstant>,
    pub sets: FxHashMap<u32, DescriptorSetReflection>,
    pub stages: StageFlags,
}

impl ShaderReflection {
    /// Merge another stage's reflection into this one.
    pub fn append(&mut self, o: &ShaderReflection) {
        if o.local_size != [0, 0, 0] {
            self.local_size = o.local_size;
        }
        if !o.attributes.is_empty() {
            self.attributes = o.attributes.clone();
        }
        self.push_constant_ranges
            .extend(o.push_constant_ranges.iter().cloned());
        self.spec_constants.extend(o.spec_constants.iter().cloned());
        for (index, set) in &o.sets {
            self.sets.entry(*index).or_default().append(set);
        }
        self.stages |= o.stages;
    }
}

/// Pure function from shader bytes to a reflection record.
pub trait ShaderReflector {
    fn reflect(&self, bytes: &[u8]) -> Result<ShaderReflection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(name: &str, binding: u32, stages: StageFlags) -> ReflectedBinding {
        ReflectedBinding {
            name: name.to_owned(),
            binding,
            array_size: 1,
            stages,
        }
    }

    #[test]
    fn append_merges_stages_of_shared_bindings() {
        let mut vert = ShaderReflection::default();
        vert.stages = StageFlags::VERTEX;
        vert.sets.entry(0).or_default().uniform_buffers =
            vec![binding("globals", 0, StageFlags::VERTEX)];

        let mut frag = ShaderReflection::default();
        frag.stages = StageFlags::FRAGMENT;
        frag.sets.entry(0).or_default().uniform_buffers =
            vec![binding("globals", 0, StageFlags::FRAGMENT)];
        frag.sets.entry(0).or_default().samplers = vec![binding("tex", 1, StageFlags::FRAGMENT)];

        vert.append(&frag);
        assert_eq!(vert.stages, StageFlags::VERTEX | StageFlags::FRAGMENT);
        let set0 = &vert.sets[&0];
        assert_eq!(set0.uniform_buffers.len(), 1);
        assert_eq!(
            set0.uniform_buffers[0].stages,
            StageFlags::VERTEX | StageFlags::FRAGMENT
        );
        assert_eq!(set0.samplers.len(), 1);
    }
}
