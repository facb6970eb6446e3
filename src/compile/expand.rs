//! Default-view expansion.
//!
//! An ALLOCATE that asks for an image view but is fed an image pointer gets
//! rewritten to construct an explicit view creation record: pull the image's
//! creation info with GET_CI, extract format and counts, and build a view
//! covering the whole subresource range.

use crate::ir::{IRModule, NodeKey, NodeKind, Ref};
use crate::typedesc::TypeKind;

use crate::error::Result;

pub(crate) fn run(
    module: &mut IRModule,
    nodes: &[NodeKey],
    new_nodes: &mut Vec<NodeKey>,
    rewrites: &mut Vec<(Ref, Ref)>,
) -> Result<()> {
    for &key in nodes {
        let (src, tier) = match &module.node(key).kind {
            NodeKind::Allocate { src, tier } => (*src, *tier),
            _ => continue,
        };
        let alloc_ty = module.types.fully_stripped(module.node(key).ty[0]);
        let src_ty = module.types.fully_stripped(module.ref_ty(src));

        let alloc_is_view =
            module.types.hash_value(alloc_ty) == module.types.builtin_image_view;
        let src_is_image_ptr = match module.types.kind(src_ty) {
            TypeKind::Pointer { pointee } => {
                module.types.hash_value(pointee) == module.types.builtin_image
            }
            _ => module.types.hash_value(src_ty) == module.types.builtin_image,
        };
        if !alloc_is_view || !src_is_image_ptr {
            continue;
        }

        let ci = module.make_get_ci(src);
        let format = module.make_extract(ci, 5);
        let base_level = module.make_constant_u32(0);
        let level_count = module.make_extract(ci, 7);
        let base_layer = module.make_constant_u32(0);
        let layer_count = module.make_extract(ci, 8);

        let view_ty = module.types.ty_image_view;
        let ivci = module.make_construct(
            view_ty,
            &[base_level, level_count, base_layer, layer_count, src, format],
        );
        let out_ty = module.node(key).ty[0];
        let new_alloc = module.make_allocate(out_ty, ivci, tier);
        if let Some(debug) = module.node_mut(key).debug.take() {
            module.node_mut(new_alloc.node).debug = Some(debug);
        }

        for r in &[ci, format, base_level, level_count, base_layer, layer_count, ivci, new_alloc] {
            new_nodes.push(r.node);
        }
        // extract nodes carry their own constant operands
        for r in &[format, level_count, layer_count] {
            if let NodeKind::Slice { start, count, .. } = &module.node(r.node).kind {
                new_nodes.push(start.node);
                new_nodes.push(count.node);
            }
        }

        rewrites.push((Ref::new(key, 0), new_alloc));
        module.node_mut(key).kind = NodeKind::Garbage;
    }
    Ok(())
}
