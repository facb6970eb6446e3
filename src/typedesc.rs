//! Structural type registry.
//!
//! Types are hash-consed: structurally equal descriptions intern to the same
//! `TypeId`, so equality is pointer-ish (key comparison) everywhere else in
//! the crate. Every type also carries a stable `hash_value` derived from its
//! structure alone, which is what the passes compare against the well-known
//! builtin hashes (image, buffer, sampled image, sampler, swapchain).

use std::sync::RwLock;

use fxhash::FxHashMap;
use slotmap::{new_key_type, SlotMap};

use crate::access::{Access, DomainFlags};
use crate::resource::PipelineHandle;

new_key_type! {
    pub struct TypeId;
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum TypeKind {
    Integer {
        width: u8,
    },
    Memory,
    Enum {
        name: &'static str,
    },
    EnumValue {
        enum_ty: TypeId,
        value: u64,
    },
    Composite {
        name: &'static str,
        members: Vec<TypeId>,
        member_names: Vec<&'static str>,
    },
    Array {
        elem: TypeId,
        count: usize,
    },
    Union {
        arms: Vec<TypeId>,
    },
    Pointer {
        pointee: TypeId,
    },
    Imbued {
        inner: TypeId,
        access: Access,
    },
    Aliased {
        inner: TypeId,
        ref_idx: u32,
    },
    OpaqueFn {
        args: Vec<TypeId>,
        returns: Vec<TypeId>,
        execute_on: DomainFlags,
    },
    ShaderFn {
        args: Vec<TypeId>,
        returns: Vec<TypeId>,
        execute_on: DomainFlags,
        pipeline: PipelineHandle,
    },
}

struct TypeDesc {
    kind: TypeKind,
    hash_value: u64,
}

struct Tables {
    types: SlotMap<TypeId, TypeDesc>,
    intern: FxHashMap<TypeKind, TypeId>,
}

/// Interner for structural types. Shared between builder threads; interned
/// types are immutable.
pub struct TypeRegistry {
    inner: RwLock<Tables>,

    pub ty_u32: TypeId,
    pub ty_u64: TypeId,
    pub ty_memory: TypeId,
    pub ty_image: TypeId,
    pub ty_image_view: TypeId,
    pub ty_buffer: TypeId,
    pub ty_sampled_image: TypeId,
    pub ty_sampler: TypeId,
    pub ty_swapchain: TypeId,

    pub builtin_image: u64,
    pub builtin_image_view: u64,
    pub builtin_buffer: u64,
    pub builtin_sampled_image: u64,
    pub builtin_sampler: u64,
    pub builtin_swapchain: u64,
}

fn structural_hash(tables: &Tables, kind: &TypeKind) -> u64 {
    use std::hash::{Hash, Hasher};
    // child types contribute their own structural hash so the value is
    // stable across registries
    let mut h = fxhash::FxHasher::default();
    std::mem::discriminant(kind).hash(&mut h);
    match kind {
        TypeKind::Integer { width } => width.hash(&mut h),
        TypeKind::Memory => {}
        TypeKind::Enum { name } => name.hash(&mut h),
        TypeKind::EnumValue { enum_ty, value } => {
            tables.types[*enum_ty].hash_value.hash(&mut h);
            value.hash(&mut h);
        }
        TypeKind::Composite {
            name,
            members,
            member_names,
        } => {
            name.hash(&mut h);
            for m in members {
                tables.types[*m].hash_value.hash(&mut h);
            }
            member_names.hash(&mut h);
        }
        TypeKind::Array { elem, count } => {
            tables.types[*elem].hash_value.hash(&mut h);
            count.hash(&mut h);
        }
        TypeKind::Union { arms } => {
            for a in arms {
                tables.types[*a].hash_value.hash(&mut h);
            }
        }
        TypeKind::Pointer { pointee } => tables.types[*pointee].hash_value.hash(&mut h),
        TypeKind::Imbued { inner, access } => {
            tables.types[*inner].hash_value.hash(&mut h);
            access.hash(&mut h);
        }
        TypeKind::Aliased { inner, ref_idx } => {
            tables.types[*inner].hash_value.hash(&mut h);
            ref_idx.hash(&mut h);
        }
        TypeKind::OpaqueFn {
            args,
            returns,
            execute_on,
        } => {
            for a in args {
                tables.types[*a].hash_value.hash(&mut h);
            }
            for r in returns {
                tables.types[*r].hash_value.hash(&mut h);
            }
            execute_on.bits().hash(&mut h);
        }
        TypeKind::ShaderFn {
            args,
            returns,
            execute_on,
            pipeline,
        } => {
            for a in args {
                tables.types[*a].hash_value.hash(&mut h);
            }
            for r in returns {
                tables.types[*r].hash_value.hash(&mut h);
            }
            execute_on.bits().hash(&mut h);
            pipeline.hash(&mut h);
        }
    }
    h.finish()
}

fn intern(tables: &mut Tables, kind: TypeKind) -> TypeId {
    if let Some(id) = tables.intern.get(&kind) {
        return *id;
    }
    let hash_value = structural_hash(tables, &kind);
    let id = tables.types.insert(TypeDesc {
        kind: kind.clone(),
        hash_value,
    });
    tables.intern.insert(kind, id);
    id
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        let mut t = Tables {
            types: SlotMap::with_key(),
            intern: FxHashMap::default(),
        };

        let u32_ty = intern(&mut t, TypeKind::Integer { width: 32 });
        let u64_ty = intern(&mut t, TypeKind::Integer { width: 64 });
        let memory = intern(&mut t, TypeKind::Memory);
        let e_image_type = intern(&mut t, TypeKind::Enum { name: "image_type" });
        let e_tiling = intern(&mut t, TypeKind::Enum { name: "tiling" });
        let e_format = intern(&mut t, TypeKind::Enum { name: "format" });
        let e_mem_usage = intern(
            &mut t,
            TypeKind::Enum {
                name: "memory_usage",
            },
        );

        // the image composite's members mirror its creation parameters, so a
        // CONSTRUCT of an image carries one argument per member
        let image = intern(
            &mut t,
            TypeKind::Composite {
                name: "image",
                members: vec![
                    u32_ty,
                    e_image_type,
                    e_tiling,
                    memory,
                    memory,
                    e_format,
                    u32_ty,
                    u32_ty,
                    u32_ty,
                ],
                member_names: vec![
                    "flags",
                    "image_type",
                    "tiling",
                    "usage",
                    "extent",
                    "format",
                    "samples",
                    "levels",
                    "layers",
                ],
            },
        );
        let image_ptr = intern(&mut t, TypeKind::Pointer { pointee: image });
        let image_view = intern(
            &mut t,
            TypeKind::Composite {
                name: "image_view",
                members: vec![u32_ty, u32_ty, u32_ty, u32_ty, image_ptr, e_format],
                member_names: vec![
                    "base_level",
                    "level_count",
                    "base_layer",
                    "layer_count",
                    "image",
                    "format",
                ],
            },
        );
        let buffer = intern(
            &mut t,
            TypeKind::Composite {
                name: "buffer",
                members: vec![u64_ty, memory, e_mem_usage],
                member_names: vec!["size", "usage", "memory_usage"],
            },
        );
        let sampler = intern(
            &mut t,
            TypeKind::Composite {
                name: "sampler",
                members: vec![memory],
                member_names: vec!["state"],
            },
        );
        let sampled_image = intern(
            &mut t,
            TypeKind::Composite {
                name: "sampled_image",
                members: vec![image, sampler],
                member_names: vec!["image", "sampler"],
            },
        );
        let swapchain = intern(
            &mut t,
            TypeKind::Composite {
                name: "swapchain",
                members: vec![memory],
                member_names: vec!["state"],
            },
        );

        let h = |t: &Tables, id: TypeId| t.types[id].hash_value;
        let builtin_image = h(&t, image);
        let builtin_image_view = h(&t, image_view);
        let builtin_buffer = h(&t, buffer);
        let builtin_sampled_image = h(&t, sampled_image);
        let builtin_sampler = h(&t, sampler);
        let builtin_swapchain = h(&t, swapchain);

        TypeRegistry {
            inner: RwLock::new(t),
            ty_u32: u32_ty,
            ty_u64: u64_ty,
            ty_memory: memory,
            ty_image: image,
            ty_image_view: image_view,
            ty_buffer: buffer,
            ty_sampled_image: sampled_image,
            ty_sampler: sampler,
            ty_swapchain: swapchain,
            builtin_image,
            builtin_image_view,
            builtin_buffer,
            builtin_sampled_image,
            builtin_sampler,
            builtin_swapchain,
        }
    }

    pub fn kind(&self, id: TypeId) -> TypeKind {
        self.inner.read().unwrap().types[id].kind.clone()
    }

    pub fn hash_value(&self, id: TypeId) -> u64 {
        self.inner.read().unwrap().types[id].hash_value
    }

    fn make(&self, kind: TypeKind) -> TypeId {
        {
            let t = self.inner.read().unwrap();
            if let Some(id) = t.intern.get(&kind) {
                return *id;
            }
        }
        let mut t = self.inner.write().unwrap();
        intern(&mut t, kind)
    }

    pub fn make_integer_ty(&self, width: u8) -> TypeId {
        self.make(TypeKind::Integer { width })
    }

    pub fn make_memory_ty(&self) -> TypeId {
        self.ty_memory
    }

    pub fn make_enum_ty(&self, name: &'static str) -> TypeId {
        self.make(TypeKind::Enum { name })
    }

    pub fn make_composite_ty(
        &self,
        name: &'static str,
        members: Vec<TypeId>,
        member_names: Vec<&'static str>,
    ) -> TypeId {
        self.make(TypeKind::Composite {
            name,
            members,
            member_names,
        })
    }

    pub fn make_array_ty(&self, elem: TypeId, count: usize) -> TypeId {
        self.make(TypeKind::Array { elem, count })
    }

    pub fn make_union_ty(&self, arms: Vec<TypeId>) -> TypeId {
        self.make(TypeKind::Union { arms })
    }

    pub fn make_pointer_ty(&self, pointee: TypeId) -> TypeId {
        self.make(TypeKind::Pointer { pointee })
    }

    pub fn make_imbued_ty(&self, inner: TypeId, access: Access) -> TypeId {
        self.make(TypeKind::Imbued { inner, access })
    }

    pub fn make_aliased_ty(&self, inner: TypeId, ref_idx: u32) -> TypeId {
        self.make(TypeKind::Aliased { inner, ref_idx })
    }

    pub fn make_opaque_fn_ty(
        &self,
        args: Vec<TypeId>,
        returns: Vec<TypeId>,
        execute_on: DomainFlags,
    ) -> TypeId {
        self.make(TypeKind::OpaqueFn {
            args,
            returns,
            execute_on,
        })
    }

    pub fn make_shader_fn_ty(
        &self,
        args: Vec<TypeId>,
        returns: Vec<TypeId>,
        execute_on: DomainFlags,
        pipeline: PipelineHandle,
    ) -> TypeId {
        self.make(TypeKind::ShaderFn {
            args,
            returns,
            execute_on,
            pipeline,
        })
    }

    /// Remove one layer of `Imbued` or `Aliased`.
    pub fn stripped(&self, id: TypeId) -> TypeId {
        match self.kind(id) {
            TypeKind::Imbued { inner, .. } => inner,
            TypeKind::Aliased { inner, .. } => inner,
            _ => id,
        }
    }

    /// Remove all layers of `Imbued`/`Aliased`.
    pub fn fully_stripped(&self, id: TypeId) -> TypeId {
        let mut id = id;
        loop {
            let s = self.stripped(id);
            if s == id {
                return id;
            }
            id = s;
        }
    }

    pub fn is_imageview(&self, id: TypeId) -> bool {
        let id = self.fully_stripped(id);
        let h = self.hash_value(id);
        h == self.builtin_image || h == self.builtin_image_view
    }

    pub fn is_bufferlike_view(&self, id: TypeId) -> bool {
        let id = self.fully_stripped(id);
        if self.hash_value(id) == self.builtin_buffer {
            return true;
        }
        match self.kind(id) {
            TypeKind::Pointer { pointee } => self.kind(pointee) == TypeKind::Memory,
            _ => false,
        }
    }

    /// Whether values of this type take part in execution ordering (and so a
    /// SLICE of it must chain as a write rather than a read).
    pub fn is_synchronized(&self, id: TypeId) -> bool {
        let id = self.fully_stripped(id);
        if self.is_imageview(id) || self.is_bufferlike_view(id) {
            return true;
        }
        let h = self.hash_value(id);
        if h == self.builtin_sampled_image || h == self.builtin_swapchain {
            return true;
        }
        match self.kind(id) {
            TypeKind::Array { elem, .. } => self.is_synchronized(elem),
            TypeKind::Union { arms } => arms.iter().any(|a| self.is_synchronized(*a)),
            _ => false,
        }
    }

    /// Number of results a value of this type occupies (always one; fn types
    /// are not first-class values).
    pub fn member_count(&self, id: TypeId) -> Option<usize> {
        match self.kind(self.fully_stripped(id)) {
            TypeKind::Composite { members, .. } => Some(members.len()),
            TypeKind::Array { count, .. } => Some(count),
            TypeKind::Union { arms } => Some(arms.len()),
            _ => None,
        }
    }

    pub fn member_type(&self, id: TypeId, index: usize) -> Option<TypeId> {
        match self.kind(self.fully_stripped(id)) {
            TypeKind::Composite { members, .. } => members.get(index).copied(),
            TypeKind::Array { elem, .. } => Some(elem),
            TypeKind::Union { arms } => arms.get(index).copied(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_structural() {
        let reg = TypeRegistry::new();
        let a = reg.make_array_ty(reg.ty_image, 4);
        let b = reg.make_array_ty(reg.ty_image, 4);
        let c = reg.make_array_ty(reg.ty_image, 5);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(reg.hash_value(a), reg.hash_value(b));
        assert_ne!(reg.hash_value(a), reg.hash_value(c));
    }

    #[test]
    fn stripped_removes_one_layer() {
        let reg = TypeRegistry::new();
        let imbued = reg.make_imbued_ty(reg.ty_image, Access::ColorWrite);
        let aliased = reg.make_aliased_ty(imbued, 1);
        assert_eq!(reg.stripped(aliased), imbued);
        assert_eq!(reg.stripped(imbued), reg.ty_image);
        assert_eq!(reg.fully_stripped(aliased), reg.ty_image);
    }

    #[test]
    fn view_predicates() {
        let reg = TypeRegistry::new();
        assert!(reg.is_imageview(reg.ty_image));
        assert!(reg.is_imageview(reg.ty_image_view));
        assert!(!reg.is_imageview(reg.ty_buffer));
        assert!(reg.is_bufferlike_view(reg.ty_buffer));
        let memptr = reg.make_pointer_ty(reg.ty_memory);
        assert!(reg.is_bufferlike_view(memptr));
        assert!(reg.is_synchronized(reg.ty_swapchain));
        assert!(reg.is_synchronized(reg.make_array_ty(reg.ty_image, 2)));
        assert!(!reg.is_synchronized(reg.ty_u32));
    }
}
