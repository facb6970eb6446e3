//! Linearization.
//!
//! Emits the scheduled items into one linear list using a two-visit
//! worklist: the first time a node is dequeued its data dependencies are
//! pushed in front of it (in reverse use order) and it is marked expanded;
//! the second time, all dependencies have run, so the node itself is
//! emitted and receives its naming index.

use std::collections::VecDeque;

use fxhash::FxHashSet;
use slotmap::SecondaryMap;

use crate::compile::ScheduledItem;
use crate::error::Result;
use crate::ir::link::Links;
use crate::ir::{IRModule, NodeKey, NodeKind, Ref};

#[derive(Copy, Clone, Eq, PartialEq)]
enum Rw {
    Read,
    Write,
}

fn collect_deps(module: &IRModule, node: NodeKey, out: &mut Vec<(Ref, Rw)>) {
    match &module.node(node).kind {
        NodeKind::MathBinary { a, b, .. } => {
            out.push((*a, Rw::Read));
            out.push((*b, Rw::Read));
        }
        NodeKind::Construct { args } => {
            for a in args {
                out.push((*a, Rw::Read));
            }
        }
        NodeKind::Call { args } => {
            let fn_ty = module.ref_ty(args[0]);
            let (first_parm, fn_args) = match module.types.kind(fn_ty) {
                crate::typedesc::TypeKind::OpaqueFn { args, .. } => (1usize, args),
                crate::typedesc::TypeKind::ShaderFn { args, .. } => (4usize, args),
                _ => (1usize, Vec::new()),
            };
            for (i, a) in args.iter().enumerate() {
                if i < first_parm {
                    if i > 0 {
                        out.push((*a, Rw::Read));
                    }
                    continue;
                }
                let access = match module.types.kind(fn_args[i - first_parm]) {
                    crate::typedesc::TypeKind::Imbued { access, .. } => access,
                    _ => continue,
                };
                let rw = if crate::access::is_write_access(access) {
                    Rw::Write
                } else {
                    Rw::Read
                };
                out.push((*a, rw));
            }
        }
        NodeKind::Release { src, .. } => {
            for s in src {
                out.push((*s, Rw::Write));
            }
        }
        NodeKind::Acquire { .. } => {} // no deps
        NodeKind::AcquireNextImage { swapchain } => {
            out.push((*swapchain, Rw::Write));
        }
        NodeKind::Slice {
            src, start, count, ..
        } => {
            let head_ty = module.node(node).ty[0];
            if module.types.is_synchronized(head_ty) {
                out.push((*src, Rw::Write));
            } else {
                out.push((*src, Rw::Read));
            }
            out.push((*start, Rw::Read));
            out.push((*count, Rw::Read));
        }
        NodeKind::Converge { diverged } => {
            for d in diverged {
                out.push((*d, Rw::Write));
            }
        }
        NodeKind::Use { src, .. } => out.push((*src, Rw::Write)),
        NodeKind::Clear { dst, value } => {
            out.push((*value, Rw::Read));
            out.push((*dst, Rw::Write));
        }
        NodeKind::LogicalCopy { src }
        | NodeKind::Cast { src }
        | NodeKind::CompilePipeline { src }
        | NodeKind::Allocate { src, .. }
        | NodeKind::GetAllocationSize { src }
        | NodeKind::GetCi { src }
        | NodeKind::GetIvMeta { src } => out.push((*src, Rw::Read)),
        NodeKind::Constant { .. }
        | NodeKind::Placeholder
        | NodeKind::Import { .. }
        | NodeKind::Set { .. }
        | NodeKind::Garbage => {}
    }
}

pub(crate) fn run(
    module: &IRModule,
    items: &mut Vec<ScheduledItem>,
    scheduled: &SecondaryMap<NodeKey, usize>,
    links: &Links,
    item_list: &mut Vec<usize>,
) -> Result<()> {
    item_list.clear();
    let mut naming_index_counter: u32 = 0;
    let mut done: FxHashSet<NodeKey> = FxHashSet::default();
    let mut expanded: FxHashSet<NodeKey> = FxHashSet::default();
    let mut work: VecDeque<NodeKey> = VecDeque::new();

    let initial: Vec<NodeKey> = items.iter().map(|i| i.node).collect();
    let mut deps: Vec<(Ref, Rw)> = Vec::new();

    for root in initial {
        expanded.clear();
        work.push_back(root);

        while let Some(node) = work.pop_front() {
            if done.contains(&node) {
                // only schedule things once
                continue;
            }

            if expanded.contains(&node) {
                // all dependencies have run
                done.insert(node);
                if let Some(item_idx) = scheduled.get(node) {
                    items[*item_idx].naming_index = naming_index_counter;
                    item_list.push(*item_idx);
                }
                naming_index_counter += module.result_count(node) as u32;
                continue;
            }

            expanded.insert(node);
            work.push_front(node);

            deps.clear();
            collect_deps(module, node, &mut deps);
            // dependencies land in front of the node, in use order: push in
            // reverse so the first use is dequeued first
            for (parm, rw) in deps.iter().rev() {
                if *rw == Rw::Write {
                    // readers of the old revision must run before the writer
                    if let Some(link) = links.try_link(*parm) {
                        for r in link.reads.iter().rev() {
                            if !done.contains(&r.node) {
                                work.push_front(r.node);
                            }
                        }
                    }
                }
                if !done.contains(&parm.node) {
                    work.push_front(parm.node);
                }
            }
        }
    }

    log::debug!("linearize: {} items emitted", item_list.len());
    Ok(())
}
