//! Synchronization lowering.
//!
//! Turns the access annotations on the linked graph into per-link
//! `ResourceUse`s. Writes get an `undef_sync`. All readers of one link share
//! a single `read_sync`: their stage and access masks are OR-ed together and
//! the layout is merged (transfer-source if only transfer readers, general
//! if storage readers or a transfer/read-only mix, read-only otherwise), so
//! no read-to-read barriers are ever emitted.

use slotmap::SecondaryMap;

use crate::access::{
    is_readonly_access, is_storage_access, is_transfer_access, is_write_access, to_use, Access,
    ImageLayout, ResourceUse,
};
use crate::compile::ScheduledItem;
use crate::error::Result;
use crate::ir::link::Links;
use crate::ir::{IRModule, NodeKey, NodeKind, Ref};
use crate::typedesc::TypeKind;

fn call_signature(module: &IRModule, key: NodeKey) -> Option<(usize, Vec<crate::typedesc::TypeId>)> {
    if let NodeKind::Call { args } = &module.node(key).kind {
        match module.types.kind(module.ref_ty(args[0])) {
            TypeKind::OpaqueFn { args, .. } => Some((1, args)),
            TypeKind::ShaderFn { args, .. } => Some((4, args)),
            _ => None,
        }
    } else {
        None
    }
}

/// The access a consumer makes through one of its argument slots.
fn consumer_access(module: &IRModule, consumer: Ref) -> Option<Access> {
    match &module.node(consumer.node).kind {
        NodeKind::Call { .. } => {
            let (first_parm, fn_args) = call_signature(module, consumer.node)?;
            let i = consumer.index as usize;
            if i < first_parm || i - first_parm >= fn_args.len() {
                return None;
            }
            match module.types.kind(fn_args[i - first_parm]) {
                TypeKind::Imbued { access, .. } => Some(access),
                _ => None,
            }
        }
        _ => None,
    }
}

fn merge_reads(module: &IRModule, reads: &[Ref]) -> Option<ResourceUse> {
    let mut dst_use = ResourceUse::default();
    let mut need_read_only = false;
    let mut need_transfer = false;
    let mut need_general = false;
    let mut any = false;

    for r in reads {
        let access = match &module.node(r.node).kind {
            NodeKind::Call { .. } => match consumer_access(module, *r) {
                Some(a) => a,
                None => continue,
            },
            NodeKind::Converge { .. } | NodeKind::Construct { .. } => continue,
            _ => continue,
        };
        if is_transfer_access(access) {
            need_transfer = true;
        }
        if is_storage_access(access) {
            need_general = true;
        }
        if is_readonly_access(access) {
            need_read_only = true;
        }
        let u = to_use(access);
        dst_use.access |= u.access;
        dst_use.stages |= u.stages;
        any = true;
    }

    if !any {
        return None;
    }

    dst_use.layout = ImageLayout::ReadOnlyOptimalKhr;
    if need_transfer && !need_read_only {
        dst_use.layout = ImageLayout::TransferSrcOptimal;
    }
    if need_general || (need_transfer && need_read_only) {
        dst_use.layout = ImageLayout::General;
    }
    Some(dst_use)
}

pub(crate) fn run(
    module: &IRModule,
    nodes: &[NodeKey],
    links: &mut Links,
    scheduled: &SecondaryMap<NodeKey, usize>,
    items: &[ScheduledItem],
) -> Result<()> {
    for &key in nodes {
        match &module.node(key).kind {
            NodeKind::Call { args } => {
                let args: Vec<Ref> = args.iter().copied().collect();
                let (first_parm, fn_args) = match call_signature(module, key) {
                    Some(s) => s,
                    None => continue,
                };
                for i in first_parm..args.len() {
                    let access = match module.types.kind(fn_args[i - first_parm]) {
                        TypeKind::Imbued { access, .. } => access,
                        _ => continue,
                    };
                    let parm = args[i];
                    if is_write_access(access) {
                        debug_assert!(links.link(parm).undef_sync.is_none());
                        links.link_mut(parm).undef_sync = Some(to_use(access));
                    } else if links.link(parm).read_sync.is_none() {
                        let reads: Vec<Ref> = links.link(parm).reads.iter().copied().collect();
                        links.link_mut(parm).read_sync = merge_reads(module, &reads);
                    }
                }
            }
            NodeKind::Clear { dst, .. } => {
                let dst = *dst;
                debug_assert!(links.link(dst).undef_sync.is_none());
                links.link_mut(dst).undef_sync = Some(to_use(Access::TransferClear));
            }
            NodeKind::Release {
                src, dst_access, ..
            } => {
                let src: Vec<Ref> = src.iter().copied().collect();
                let dst_access = *dst_access;
                let release_domain = scheduled
                    .get(key)
                    .map(|i| items[*i].scheduled_domain);
                for parm in src {
                    if links.link(parm).undef_sync.is_some() {
                        continue;
                    }
                    if dst_access != Access::None {
                        links.link_mut(parm).undef_sync = Some(to_use(dst_access));
                    } else if let (Some(rd), Some(pi)) =
                        (release_domain, scheduled.get(parm.node))
                    {
                        if items[*pi].scheduled_domain != rd {
                            // the producer runs on another queue and we know
                            // nothing about future use
                            links.link_mut(parm).undef_sync = Some(to_use(Access::MemoryRW));
                        }
                    }
                }
            }
            NodeKind::Use { src, access } => {
                let (src, access) = (*src, *access);
                let src_ty = module.ref_ty(src);
                let elem_hash = match module.types.kind(module.types.fully_stripped(src_ty)) {
                    TypeKind::Array { elem, .. } => module.types.hash_value(elem),
                    _ => module.types.hash_value(module.types.fully_stripped(src_ty)),
                };
                if !module.types.is_bufferlike_view(src_ty)
                    && elem_hash != module.types.builtin_image
                {
                    continue;
                }
                if links.link(src).undef_sync.is_some() {
                    continue;
                }
                if access != Access::None {
                    links.link_mut(src).undef_sync = Some(to_use(access));
                } else if let NodeKind::Converge { diverged } = &module.node(src.node).kind {
                    // borrow the sync of the first diverged branch that has
                    // any; it is possible none do, in which case no sync is
                    // needed here
                    let mut found = None;
                    for d in diverged.iter().skip(1) {
                        let mut cur = *d;
                        loop {
                            let l = links.link(cur);
                            if l.undef_sync.is_some() || l.read_sync.is_some() {
                                found = l.undef_sync.or(l.read_sync);
                                break;
                            }
                            match l.prev {
                                Some(p) => cur = p,
                                None => break,
                            }
                        }
                        if found.is_some() {
                            break;
                        }
                    }
                    if let Some(sync) = found {
                        links.link_mut(src).undef_sync = Some(sync);
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}
