//! Forced convergence.
//!
//! A chain whose final revision is consumed by a SLICE leaves the image
//! logically split at the end of the graph. Before release, the slice's
//! three tails are re-merged by a synthesized CONVERGE feeding a bare USE,
//! and the release source is wrapped so the outside world gets a single,
//! fully-owned resource back.

use crate::access::Access;
use crate::error::Result;
use crate::ir::link::Links;
use crate::ir::{IRModule, NodeKey, NodeKind, Ref};
use crate::typedesc::TypeKind;

pub(crate) fn run(
    module: &mut IRModule,
    ref_nodes: &[NodeKey],
    chains: &[Ref],
    links: &mut Links,
    new_nodes: &mut Vec<NodeKey>,
) -> Result<()> {
    for &head in chains {
        let def_node = match links.link(head).def {
            Some(d) => d.node,
            None => continue,
        };
        if matches!(module.node(def_node).kind, NodeKind::Slice { .. }) {
            // subchains converge through their parent
            continue;
        }
        let tail = links.chain_tail(head);
        let undef = match links.link(tail).undef {
            Some(u) => u,
            None => continue,
        };
        if !matches!(module.node(undef.node).kind, NodeKind::Slice { .. }) {
            continue;
        }
        let token_ty = module.types.fully_stripped(module.ref_ty(undef.sibling(2)));
        if matches!(module.types.kind(token_ty), TypeKind::Union { .. }) {
            continue;
        }

        let slice_node = undef.node;
        // already re-merged on an earlier invocation
        let token_tail = links.chain_tail(Ref::new(slice_node, 2));
        if let Some(u) = links.link(token_tail).undef {
            if matches!(module.node(u.node).kind, NodeKind::Converge { .. }) {
                continue;
            }
        }
        let src_ty = match &module.node(slice_node).kind {
            NodeKind::Slice { src, .. } => module.types.fully_stripped(module.ref_ty(*src)),
            _ => unreachable!(),
        };

        // merge the three diverged tails back into one revision
        let tails = [
            Ref::new(slice_node, 2),
            Ref::new(slice_node, 0),
            Ref::new(slice_node, 1),
        ];
        let f_converge = module.make_converge(src_ty, &tails);
        new_nodes.push(f_converge.node);
        let use_node = module.make_use(f_converge, Access::None);
        new_nodes.push(use_node.node);

        // make the release depend on the merged resource
        let release = match ref_nodes
            .iter()
            .rev()
            .find(|k| matches!(module.node(**k).kind, NodeKind::Release { .. }))
        {
            Some(r) => *r,
            None => continue,
        };
        let old_src = match &module.node(release).kind {
            NodeKind::Release { src, .. } => src[0],
            _ => unreachable!(),
        };
        {
            let l = links.link_mut(old_src);
            l.undef = None;
            l.next = None;
        }
        let wrap_ty = module.types.fully_stripped(module.ref_ty(old_src));
        let wrap = module.make_converge(wrap_ty, &[old_src, use_node]);
        new_nodes.push(wrap.node);
        if let NodeKind::Release { src, .. } = &mut module.node_mut(release).kind {
            src[0] = wrap;
        }
        // the release must re-link after everything synthesized above
        let new_index = module.bump_index();
        module.node_mut(release).index = new_index;
        log::debug!("forced convergence: re-merged a chain split by a slice before release");
    }
    Ok(())
}
