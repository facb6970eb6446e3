//! Link building.
//!
//! Gives every node result a chain link and wires the def/read/write edges.
//! Two modes share the code: *fresh* linking requires the graph to already be
//! single-writer and treats violations as internal errors, while *implicit*
//! linking (`do_ssa`) repairs multi-writer situations by walking the write
//! chain to the latest revision and, where necessary, synthesizing
//! convergences, replica slices or union extracts.

use crate::access::is_write_access;
use crate::error::Result;
use crate::ir::link::Links;
use crate::ir::value::eval_owned;
use crate::ir::{Axis, IRModule, NodeKey, NodeKind, Ref};
use crate::radix::RadixTree;
use crate::typedesc::TypeKind;

pub(crate) struct LinkBuilder<'a> {
    pub module: &'a mut IRModule,
    pub links: &'a mut Links,
    pub new_nodes: &'a mut Vec<NodeKey>,
    pub do_ssa: bool,
    /// Device-address index of live buffer acquisitions, for union synthesis.
    bufs: RadixTree<Ref>,
}

/// A half-open cut `[start, start + count)` along one axis.
#[derive(Copy, Clone, Debug)]
struct Cut {
    axis: Axis,
    start: u64,
    count: u64,
}

impl Cut {
    fn of(module: &IRModule, key: NodeKey) -> Option<Cut> {
        if let NodeKind::Slice {
            axis, start, count, ..
        } = &module.node(key).kind
        {
            let start = eval_owned(module, *start).ok()?.as_u64()?;
            let count = eval_owned(module, *count).ok()?.as_u64()?;
            Some(Cut {
                axis: *axis,
                start,
                count,
            })
        } else {
            None
        }
    }

    /// Whether `self` lies entirely inside `other` (cases "shrinking" and
    /// "identity").
    fn shrinks(&self, other: &Cut) -> bool {
        self.axis == other.axis
            && self.start >= other.start
            && self.start + self.count <= other.start + other.count
    }

    fn intersects(&self, other: &Cut) -> bool {
        if self.axis != other.axis {
            // different axes always interact
            return true;
        }
        self.start < other.start + other.count && other.start < self.start + self.count
    }
}

impl<'a> LinkBuilder<'a> {
    pub fn new(
        module: &'a mut IRModule,
        links: &'a mut Links,
        new_nodes: &'a mut Vec<NodeKey>,
        do_ssa: bool,
    ) -> LinkBuilder<'a> {
        LinkBuilder {
            module,
            links,
            new_nodes,
            do_ssa,
            bufs: RadixTree::new(),
        }
    }

    pub fn run(&mut self, nodes: &[NodeKey]) -> Result<()> {
        for &n in nodes {
            self.alloc_links(n);
        }
        for &n in nodes {
            self.process_node_links(n)?;
        }
        Ok(())
    }

    fn alloc_links(&mut self, key: NodeKey) {
        self.links.alloc(key, self.module.result_count(key));
    }

    /// Record a node synthesized mid-link: give it links, process it, and
    /// remember it for the caller's node-set rebuild.
    fn add_synthesized(&mut self, key: NodeKey) -> Result<()> {
        self.alloc_links(key);
        self.process_node_links(key)?;
        self.new_nodes.push(key);
        Ok(())
    }

    /// External (already linked in an earlier invocation) producers get
    /// fresh self-def links on first touch.
    fn init_external(&mut self, key: NodeKey) {
        if self.links.contains(key) {
            return;
        }
        assert!(self.do_ssa, "unlinked producer outside implicit linking");
        self.alloc_links(key);
        for i in 0..self.module.result_count(key) {
            let r = Ref::new(key, i as u32);
            self.links.link_mut(r).def = Some(r);
        }
    }

    /// Find the newest revision of `parm`'s resource, synthesizing repair
    /// nodes as needed. `cur` is the consumer that wants to write next.
    fn walk_writes(&mut self, cur: NodeKey, parm: Ref) -> Result<Ref> {
        let tail = self.links.chain_tail(parm);
        let link = self.links.link(tail).clone();

        let undef = match link.undef {
            None => return Ok(link.def.expect("tail link without def")),
            Some(u) => u,
        };

        match &self.module.node(undef.node).kind {
            NodeKind::Slice { src, .. } => {
                let slice_src = *src;
                let token_ty = self.module.ref_ty(undef.sibling(2));
                let forbid_elision = matches!(
                    self.module.types.kind(self.module.types.fully_stripped(token_ty)),
                    TypeKind::Union { .. }
                );
                let is_cur_slice = matches!(self.module.node(cur).kind, NodeKind::Slice { .. });

                if is_cur_slice && !forbid_elision {
                    let scope_s = Cut::of(self.module, undef.node);
                    let scope_sp = Cut::of(self.module, cur);
                    if let (Some(s), Some(sp)) = (scope_s, scope_sp) {
                        if sp.shrinks(&s) {
                            // the new cut is contained in the old one, no
                            // convergence needed, rewrite against the window
                            let new_start = sp.start - s.start;
                            if new_start == 0 && sp.count == 1 && sp.axis == Axis::Field {
                                let cur_src = match &self.module.node(cur).kind {
                                    NodeKind::Slice { src, .. } => *src,
                                    _ => unreachable!(),
                                };
                                let node = self.module.node_mut(cur);
                                node.kind = NodeKind::LogicalCopy { src: cur_src };
                                node.ty.truncate(1);
                                return self.walk_writes(cur, undef.sibling(0));
                            } else {
                                let ns = self.module.make_constant_u64(new_start);
                                let nc = self.module.make_constant_u64(sp.count);
                                self.add_synthesized(ns.node)?;
                                self.add_synthesized(nc.node)?;
                                if let NodeKind::Slice { start, count, .. } =
                                    &mut self.module.node_mut(cur).kind
                                {
                                    *start = ns;
                                    *count = nc;
                                }
                                return self.walk_writes(cur, undef.sibling(0));
                            }
                        } else if !sp.intersects(&s) {
                            // disjoint from the old cut, rewrite against the
                            // remainder output
                            return self.walk_writes(cur, undef.sibling(1));
                        }
                    }
                }

                // re-merge the three tails of the slice
                let tails = [undef.sibling(2), undef.sibling(0), undef.sibling(1)];
                let ty = self.module.types.fully_stripped(self.module.ref_ty(slice_src));
                let cv = self.module.make_converge(ty, &tails);
                self.module.node_mut(cv.node).index = self.module.node(cur).index;
                self.add_synthesized(cv.node)?;
                Ok(cv)
            }
            NodeKind::Converge { .. } => {
                // the chain was consumed by a convergence: replicate the
                // slice against the converged whole
                if let NodeKind::Slice {
                    axis, start, count, ..
                } = &self.module.node(parm.node).kind
                {
                    let (axis, start, count) = (*axis, *start, *count);
                    let ty = self.module.ref_ty(Ref::new(parm.node, 0));
                    let whole = Ref::new(undef.node, 0);
                    let replica = self.module.make_slice(ty, whole, axis, start, count);
                    self.module.node_mut(replica.node).index = self.module.node(cur).index;
                    self.add_synthesized(replica.node)?;
                    Ok(replica)
                } else {
                    // not a divergence of ours; the newest revision continues
                    // from the converged result
                    self.walk_writes(cur, Ref::new(undef.node, 0))
                }
            }
            NodeKind::Construct { .. }
                if matches!(
                    self.module
                        .types
                        .kind(self.module.types.fully_stripped(self.module.ref_ty(Ref::new(undef.node, 0)))),
                    TypeKind::Union { .. }
                ) =>
            {
                // consumed into a union view: extract the arm back out
                let ext = self.module.make_extract(Ref::new(undef.node, 0), undef.index as u64);
                self.module.node_mut(ext.node).index = self.module.node(cur).index;
                if let NodeKind::Slice { start, count, .. } = &self.module.node(ext.node).kind {
                    let (s, c) = (start.node, count.node);
                    self.add_synthesized(s)?;
                    self.add_synthesized(c)?;
                }
                self.add_synthesized(ext.node)?;
                Ok(ext)
            }
            _ => panic!(
                "link building: cannot rewrite past a {} consumer",
                self.module.node(undef.node).kind.name()
            ),
        }
    }

    /// Install a write edge of `cur` onto `parm`, rewriting to the latest
    /// revision under implicit linking. Returns the (possibly rewritten)
    /// argument the caller must store back.
    fn add_write(&mut self, cur: NodeKey, parm: Ref, index: usize) -> Result<Ref> {
        debug_assert!(!matches!(self.module.node(parm.node).kind, NodeKind::Garbage));
        self.init_external(parm.node);
        let mut parm = parm;

        if let Some(undef) = self.links.link(parm).undef {
            if undef.node == cur {
                return Ok(parm); // we are already writing this
            }
            // there is already a write, do the SSA rewrite
            assert!(self.do_ssa, "multiple writers outside implicit linking");
            assert!(
                self.module.node(cur).index >= self.module.node(undef.node).index,
                "write ordering violated"
            );
            parm = self.walk_writes(cur, parm)?;
            if parm.node == cur {
                // the latest revision is our own result; the chain already
                // continues through us
                return Ok(parm);
            }
        }
        self.links.link_mut(parm).undef = Some(Ref::new(cur, index as u32));
        Ok(parm)
    }

    /// Continue a chain: result `output_idx` of `cur` is the next revision
    /// of `parm`.
    fn add_result(&mut self, cur: NodeKey, output_idx: usize, parm: Ref) {
        self.init_external(cur);
        let out = Ref::new(cur, output_idx as u32);
        self.links.link_mut(out).def = Some(out);

        if !self.links.contains(parm.node) {
            assert!(self.do_ssa);
            return;
        }
        if !self.do_ssa {
            assert!(self.links.link(parm).next.is_none(), "chain already advanced");
            assert!(self.links.link(out).prev.is_none());
        }
        self.links.link_mut(parm).next = Some(out);
        self.links.link_mut(out).prev = Some(parm);
    }

    fn add_breaking_result(&mut self, cur: NodeKey, output_idx: usize) {
        let out = Ref::new(cur, output_idx as u32);
        self.links.link_mut(out).def = Some(out);
    }

    /// Install a read edge, rewriting to the latest revision when a write
    /// already ended this link.
    fn add_read(&mut self, cur: NodeKey, parm: Ref, index: usize, needs_ssa: bool) -> Result<Ref> {
        debug_assert!(!matches!(self.module.node(parm.node).kind, NodeKind::Garbage));
        self.init_external(parm.node);
        let mut parm = parm;

        if let Some(undef) = self.links.link(parm).undef {
            if needs_ssa && self.module.node(cur).index > self.module.node(undef.node).index {
                assert!(self.do_ssa, "read of an overwritten value outside implicit linking");
                parm = self.walk_writes(cur, parm)?;
            }
        }
        self.links.link_mut(parm).reads.push(Ref::new(cur, index as u32));
        Ok(parm)
    }

    pub fn process_node_links(&mut self, key: NodeKey) -> Result<()> {
        match &self.module.node(key).kind {
            NodeKind::Set { .. } => {} // not a real node
            NodeKind::Garbage => {}
            NodeKind::Constant { .. } | NodeKind::Placeholder | NodeKind::Import { .. } => {
                self.add_breaking_result(key, 0);
            }
            NodeKind::Construct { args } => {
                let args: Vec<Ref> = args.iter().copied().collect();
                self.add_breaking_result(key, 0);
                let out_ty = self.module.node(key).ty[0];
                let out_kind = self.module.types.kind(self.module.types.fully_stripped(out_ty));
                let aggregate = matches!(
                    out_kind,
                    TypeKind::Array { .. } | TypeKind::Union { .. }
                );
                let out_hash = self
                    .module
                    .types
                    .hash_value(self.module.types.fully_stripped(out_ty));
                for (i, arg) in args.iter().enumerate() {
                    let arg_ty = self.module.types.fully_stripped(self.module.ref_ty(*arg));
                    let pointer = matches!(self.module.types.kind(arg_ty), TypeKind::Pointer { .. });
                    let new_arg = if aggregate || pointer {
                        self.add_write(key, *arg, i)?
                    } else {
                        self.add_read(key, *arg, i, true)?
                    };
                    if new_arg != *arg {
                        if let NodeKind::Construct { args } = &mut self.module.node_mut(key).kind {
                            args[i] = new_arg;
                        }
                    }
                }
                // aggregate members flow into the constructed value
                let args: Vec<Ref> = match &self.module.node(key).kind {
                    NodeKind::Construct { args } => args.iter().copied().collect(),
                    _ => unreachable!(),
                };
                for arg in &args {
                    let arg_ty = self.module.types.fully_stripped(self.module.ref_ty(*arg));
                    let pointer = matches!(self.module.types.kind(arg_ty), TypeKind::Pointer { .. });
                    let sampled = out_hash == self.module.types.builtin_sampled_image;
                    if aggregate || sampled || pointer {
                        if self.links.contains(arg.node) {
                            self.links.link_mut(*arg).next = Some(Ref::new(key, 0));
                        }
                    }
                }
            }
            NodeKind::MathBinary { a, b, .. } => {
                let (a, b) = (*a, *b);
                self.add_read(key, a, 0, true)?;
                self.add_read(key, b, 1, true)?;
                self.add_breaking_result(key, 0);
            }
            NodeKind::Call { args } => {
                let args: Vec<Ref> = args.iter().copied().collect();
                let fn_ty = self.module.ref_ty(args[0]);
                let (first_parm, fn_args) = match self.module.types.kind(fn_ty) {
                    TypeKind::OpaqueFn { args, .. } => (1usize, args),
                    TypeKind::ShaderFn { args, .. } => (4usize, args),
                    other => panic!("call through a non-function type {:?}", other),
                };
                for i in 0..args.len() {
                    if i < first_parm {
                        if i > 0 {
                            // dispatch dimensions of a shader call
                            self.add_read(key, args[i], i, true)?;
                        }
                        continue;
                    }
                    let arg_ty = fn_args[i - first_parm];
                    let access = match self.module.types.kind(arg_ty) {
                        TypeKind::Imbued { access, .. } => access,
                        other => panic!("call argument without access annotation: {:?}", other),
                    };
                    let new_arg = if is_write_access(access) {
                        self.add_write(key, args[i], i)?
                    } else {
                        self.add_read(key, args[i], i, true)?
                    };
                    if new_arg != args[i] {
                        if let NodeKind::Call { args } = &mut self.module.node_mut(key).kind {
                            args[i] = new_arg;
                        }
                    }
                }
                // re-read after potential rewrites
                let args: Vec<Ref> = match &self.module.node(key).kind {
                    NodeKind::Call { args } => args.iter().copied().collect(),
                    _ => unreachable!(),
                };
                let result_tys: Vec<_> = self.module.node(key).ty.iter().copied().collect();
                for (idx, ret_ty) in result_tys.iter().enumerate() {
                    let ref_idx = match self.module.types.kind(*ret_ty) {
                        TypeKind::Aliased { ref_idx, .. } => ref_idx as usize,
                        other => panic!("call result is not aliased to an argument: {:?}", other),
                    };
                    let arg_ty = fn_args[ref_idx - first_parm];
                    let access = match self.module.types.kind(arg_ty) {
                        TypeKind::Imbued { access, .. } => access,
                        _ => unreachable!(),
                    };
                    if is_write_access(access) {
                        self.add_result(key, idx, args[ref_idx]);
                    } else {
                        let out = Ref::new(key, idx as u32);
                        self.links.link_mut(out).def = Some(out);
                        self.links.link_mut(out).prev = Some(args[ref_idx]);
                    }
                }
            }
            NodeKind::Release { src, .. } => {
                let src: Vec<Ref> = src.iter().copied().collect();
                for (i, s) in src.iter().enumerate() {
                    let new_s = self.add_write(key, *s, i)?;
                    if new_s != *s {
                        if let NodeKind::Release { src, .. } = &mut self.module.node_mut(key).kind {
                            src[i] = new_s;
                        }
                    }
                    self.add_result(key, i, new_s);
                }
            }
            NodeKind::Acquire { values } => {
                let values: Vec<_> = values.iter().cloned().collect();
                let result_count = self.module.result_count(key);
                for out in 0..result_count {
                    self.add_breaking_result(key, out);
                    let out_ty = self.module.node(key).ty[out];
                    if self.do_ssa && self.module.types.is_bufferlike_view(out_ty) {
                        if let Some(crate::ir::Value::Buffer(buf)) = values.get(out) {
                            if buf.device_address != 0 && buf.size > 0 {
                                let start = buf.device_address;
                                let end = start + buf.size - 1;
                                let existing =
                                    self.bufs.find(start).or_else(|| self.bufs.find(end)).copied();
                                if let Some(existing_def) = existing {
                                    // overlapping live buffers: union them so
                                    // downstream passes see a single view
                                    log::debug!(
                                        "link building: unioning overlapping buffer acquisitions"
                                    );
                                    let here = Ref::new(key, out as u32);
                                    let cur_index = self.module.node(key).index;
                                    let un = self.module.make_declare_union(&[here, existing_def]);
                                    self.module.node_mut(un.node).index = cur_index;
                                    self.add_synthesized(un.node)?;
                                } else {
                                    self.bufs.insert_unaligned(
                                        start,
                                        buf.size,
                                        Ref::new(key, out as u32),
                                    );
                                }
                            }
                        }
                    }
                }
            }
            NodeKind::Slice { start, count, .. } => {
                let (start, count) = (*start, *count);
                let new_start = self.add_read(key, start, 1, true)?;
                let new_count = self.add_read(key, count, 2, true)?;
                if new_start != start || new_count != count {
                    if let NodeKind::Slice { start, count, .. } = &mut self.module.node_mut(key).kind
                    {
                        *start = new_start;
                        *count = new_count;
                    }
                }
                let src = match &self.module.node(key).kind {
                    NodeKind::Slice { src, .. } => *src,
                    _ => unreachable!(),
                };
                let head_ty = self.module.node(key).ty[0];
                let is_plain = matches!(
                    self.module.types.kind(self.module.types.fully_stripped(head_ty)),
                    TypeKind::Integer { .. } | TypeKind::Enum { .. } | TypeKind::EnumValue { .. } | TypeKind::Memory
                );
                let new_src = if is_plain {
                    self.add_read(key, src, 0, false)?
                } else {
                    self.add_write(key, src, 0)?
                };
                // the write walk may have rewritten us into a plain copy
                if let NodeKind::LogicalCopy { src } = &self.module.node(key).kind {
                    let src = *src;
                    self.add_result(key, 0, src);
                    return Ok(());
                }
                if new_src != src {
                    if let NodeKind::Slice { src, .. } = &mut self.module.node_mut(key).kind {
                        *src = new_src;
                    }
                }
                self.add_breaking_result(key, 0); // the selected window
                self.add_breaking_result(key, 1); // the remainder
                self.add_breaking_result(key, 2); // the source token
                if self.links.contains(new_src.node) {
                    self.links
                        .link_mut(new_src)
                        .child_chains
                        .push(Ref::new(key, 0));
                } else {
                    assert!(self.do_ssa);
                }
            }
            NodeKind::Converge { diverged } => {
                let diverged: Vec<Ref> = diverged.iter().copied().collect();
                if let NodeKind::Slice { src, .. } = &self.module.node(diverged[0].node).kind {
                    let slice_src = *src;
                    self.add_result(diverged[0].node, 2, slice_src);
                }
                self.add_result(key, 0, diverged[0]);
                for (i, d) in diverged.iter().enumerate() {
                    let new_d = self.add_write(key, *d, i)?;
                    if new_d != *d {
                        if let NodeKind::Converge { diverged } = &mut self.module.node_mut(key).kind
                        {
                            diverged[i] = new_d;
                        }
                    }
                }
            }
            NodeKind::AcquireNextImage { swapchain } => {
                let swapchain = *swapchain;
                let new_sw = self.add_write(key, swapchain, 0)?;
                if new_sw != swapchain {
                    if let NodeKind::AcquireNextImage { swapchain } =
                        &mut self.module.node_mut(key).kind
                    {
                        *swapchain = new_sw;
                    }
                }
                self.add_breaking_result(key, 0);
            }
            NodeKind::Use { src, .. } => {
                let src = *src;
                self.add_result(key, 0, src);
                let new_src = self.add_write(key, src, 0)?;
                if new_src != src {
                    if let NodeKind::Use { src, .. } = &mut self.module.node_mut(key).kind {
                        *src = new_src;
                    }
                }
            }
            NodeKind::LogicalCopy { src } => {
                let src = *src;
                self.add_result(key, 0, src);
                self.add_read(key, src, 0, true)?;
            }
            NodeKind::Clear { dst, value } => {
                let (dst, value) = (*dst, *value);
                self.add_read(key, value, 1, true)?;
                let new_dst = self.add_write(key, dst, 0)?;
                if new_dst != dst {
                    if let NodeKind::Clear { dst, .. } = &mut self.module.node_mut(key).kind {
                        *dst = new_dst;
                    }
                }
                self.add_result(key, 0, new_dst);
            }
            NodeKind::Cast { src } => {
                let src = *src;
                self.add_read(key, src, 0, true)?;
                self.add_breaking_result(key, 0);
            }
            NodeKind::CompilePipeline { src } => {
                let src = *src;
                self.add_breaking_result(key, 0);
                self.add_read(key, src, 0, true)?;
            }
            NodeKind::GetAllocationSize { src }
            | NodeKind::GetCi { src }
            | NodeKind::GetIvMeta { src } => {
                let src = *src;
                self.add_read(key, src, 0, true)?;
                self.add_breaking_result(key, 0);
            }
            NodeKind::Allocate { src, .. } => {
                let src = *src;
                let new_src = self.add_read(key, src, 0, true)?;
                if new_src != src {
                    if let NodeKind::Allocate { src, .. } = &mut self.module.node_mut(key).kind {
                        *src = new_src;
                    }
                }
                self.add_result(key, 0, new_src);
            }
        }
        Ok(())
    }
}
