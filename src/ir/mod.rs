//! The dataflow IR.
//!
//! User code builds a graph of operation nodes; every node produces one or
//! more results, and a [`Ref`] (node + result index) is the universal value
//! token. Nodes live in an arena owned by an [`IRModule`] and are assigned
//! monotonically increasing indices, which makes the graph acyclic by
//! construction. Unreachable nodes are reclaimed by mark-sweep GC.

use slotmap::{new_key_type, SecondaryMap, SlotMap};
use smallvec::{smallvec, SmallVec};

use crate::access::{Access, DomainFlags};
use crate::backend::ExecFn;
use crate::typedesc::{TypeId, TypeKind, TypeRegistry};

pub mod dump;
pub mod link;
pub mod value;

pub use self::link::ChainLink;
pub use self::value::Value;

new_key_type! {
    pub struct NodeKey;
}

/// One result of one node.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Ref {
    pub node: NodeKey,
    pub index: u32,
}

impl Ref {
    pub fn new(node: NodeKey, index: u32) -> Ref {
        Ref { node, index }
    }

    /// Another result of the same node.
    pub fn sibling(self, index: u32) -> Ref {
        Ref {
            node: self.node,
            index,
        }
    }
}

/// Axis along which a SLICE divides a value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Axis {
    Mip,
    Layer,
    Field,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
}

/// Which allocator tier an ALLOCATE node draws from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AllocTier {
    Global,
    Frame,
    Linear,
}

#[derive(Debug)]
pub enum NodeKind {
    Garbage,
    Placeholder,
    Constant {
        value: Value,
    },
    Construct {
        args: SmallVec<[Ref; 4]>,
    },
    Slice {
        src: Ref,
        axis: Axis,
        start: Ref,
        count: Ref,
    },
    Converge {
        diverged: SmallVec<[Ref; 4]>,
    },
    Import {
        value: Value,
    },
    Call {
        args: SmallVec<[Ref; 4]>,
    },
    Clear {
        dst: Ref,
        value: Ref,
    },
    Acquire {
        values: SmallVec<[Value; 2]>,
    },
    Release {
        src: SmallVec<[Ref; 2]>,
        dst_access: Access,
        dst_domain: DomainFlags,
    },
    AcquireNextImage {
        swapchain: Ref,
    },
    Use {
        src: Ref,
        access: Access,
    },
    LogicalCopy {
        src: Ref,
    },
    Set {
        dst: Ref,
        index: u32,
        value: Ref,
    },
    Cast {
        src: Ref,
    },
    MathBinary {
        op: BinaryOp,
        a: Ref,
        b: Ref,
    },
    CompilePipeline {
        src: Ref,
    },
    Allocate {
        src: Ref,
        tier: AllocTier,
    },
    GetAllocationSize {
        src: Ref,
    },
    GetCi {
        src: Ref,
    },
    GetIvMeta {
        src: Ref,
    },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Garbage => "garbage",
            NodeKind::Placeholder => "placeholder",
            NodeKind::Constant { .. } => "constant",
            NodeKind::Construct { .. } => "construct",
            NodeKind::Slice { .. } => "slice",
            NodeKind::Converge { .. } => "converge",
            NodeKind::Import { .. } => "import",
            NodeKind::Call { .. } => "call",
            NodeKind::Clear { .. } => "clear",
            NodeKind::Acquire { .. } => "acquire",
            NodeKind::Release { .. } => "release",
            NodeKind::AcquireNextImage { .. } => "acquire_next_image",
            NodeKind::Use { .. } => "use",
            NodeKind::LogicalCopy { .. } => "logical_copy",
            NodeKind::Set { .. } => "set",
            NodeKind::Cast { .. } => "cast",
            NodeKind::MathBinary { .. } => "math_binary",
            NodeKind::CompilePipeline { .. } => "compile_pipeline",
            NodeKind::Allocate { .. } => "allocate",
            NodeKind::GetAllocationSize { .. } => "get_allocation_size",
            NodeKind::GetCi { .. } => "get_ci",
            NodeKind::GetIvMeta { .. } => "get_iv_meta",
        }
    }

    pub fn for_each_arg(&self, mut f: impl FnMut(Ref)) {
        match self {
            NodeKind::Construct { args } | NodeKind::Call { args } => {
                for a in args {
                    f(*a)
                }
            }
            NodeKind::Slice {
                src, start, count, ..
            } => {
                f(*src);
                f(*start);
                f(*count);
            }
            NodeKind::Converge { diverged } => {
                for a in diverged {
                    f(*a)
                }
            }
            NodeKind::Clear { dst, value } => {
                f(*dst);
                f(*value);
            }
            NodeKind::Release { src, .. } => {
                for a in src {
                    f(*a)
                }
            }
            NodeKind::AcquireNextImage { swapchain } => f(*swapchain),
            NodeKind::Use { src, .. }
            | NodeKind::LogicalCopy { src }
            | NodeKind::Cast { src }
            | NodeKind::CompilePipeline { src }
            | NodeKind::Allocate { src, .. }
            | NodeKind::GetAllocationSize { src }
            | NodeKind::GetCi { src }
            | NodeKind::GetIvMeta { src } => f(*src),
            NodeKind::Set { dst, value, .. } => {
                f(*dst);
                f(*value);
            }
            NodeKind::MathBinary { a, b, .. } => {
                f(*a);
                f(*b);
            }
            NodeKind::Garbage
            | NodeKind::Placeholder
            | NodeKind::Constant { .. }
            | NodeKind::Import { .. }
            | NodeKind::Acquire { .. } => {}
        }
    }

    pub fn for_each_arg_mut(&mut self, mut f: impl FnMut(&mut Ref)) {
        match self {
            NodeKind::Construct { args } | NodeKind::Call { args } => {
                for a in args {
                    f(a)
                }
            }
            NodeKind::Slice {
                src, start, count, ..
            } => {
                f(src);
                f(start);
                f(count);
            }
            NodeKind::Converge { diverged } => {
                for a in diverged {
                    f(a)
                }
            }
            NodeKind::Clear { dst, value } => {
                f(dst);
                f(value);
            }
            NodeKind::Release { src, .. } => {
                for a in src {
                    f(a)
                }
            }
            NodeKind::AcquireNextImage { swapchain } => f(swapchain),
            NodeKind::Use { src, .. }
            | NodeKind::LogicalCopy { src }
            | NodeKind::Cast { src }
            | NodeKind::CompilePipeline { src }
            | NodeKind::Allocate { src, .. }
            | NodeKind::GetAllocationSize { src }
            | NodeKind::GetCi { src }
            | NodeKind::GetIvMeta { src } => f(src),
            NodeKind::Set { dst, value, .. } => {
                f(dst);
                f(value);
            }
            NodeKind::MathBinary { a, b, .. } => {
                f(a);
                f(b);
            }
            NodeKind::Garbage
            | NodeKind::Placeholder
            | NodeKind::Constant { .. }
            | NodeKind::Import { .. }
            | NodeKind::Acquire { .. } => {}
        }
    }
}

#[derive(Debug, Default)]
pub struct DebugInfo {
    pub trace: SmallVec<[&'static std::panic::Location<'static>; 2]>,
    pub result_names: SmallVec<[String; 2]>,
}

#[derive(Debug)]
pub struct Node {
    /// Global creation order; argument refs always point at lower indices.
    pub index: u64,
    pub kind: NodeKind,
    /// Type of each result.
    pub ty: SmallVec<[TypeId; 2]>,
    /// Scratch used by GC and reachability walks.
    pub flag: u8,
    /// Keeps the node (and everything it reaches) alive across GC.
    pub held: bool,
    /// Domain preference supplied by the builder, consumed by queue inference.
    pub scheduling: Option<DomainFlags>,
    /// Compute class, assigned by constant folding.
    pub class: DomainFlags,
    pub debug: Option<Box<DebugInfo>>,
}

/// Arena of IR nodes plus the type registry they reference.
pub struct IRModule {
    pub types: TypeRegistry,
    ops: SlotMap<NodeKey, Node>,
    node_counter: u64,
    /// Highest index known to have been linked by a previous compile.
    pub link_frontier: u64,
    /// Nodes queued for reclamation on the next GC.
    garbage: Vec<NodeKey>,
    callbacks: Vec<ExecFn>,
}

impl IRModule {
    pub fn new() -> IRModule {
        IRModule {
            types: TypeRegistry::new(),
            ops: SlotMap::with_key(),
            node_counter: 0,
            link_frontier: 0,
            garbage: Vec::new(),
            callbacks: Vec::new(),
        }
    }

    pub fn node(&self, key: NodeKey) -> &Node {
        &self.ops[key]
    }

    pub fn node_mut(&mut self, key: NodeKey) -> &mut Node {
        &mut self.ops[key]
    }

    pub fn contains(&self, key: NodeKey) -> bool {
        self.ops.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeKey, &Node)> {
        self.ops.iter()
    }

    pub fn keys(&self) -> Vec<NodeKey> {
        self.ops.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn node_counter(&self) -> u64 {
        self.node_counter
    }

    /// Take a fresh index without creating a node. Used by passes that must
    /// re-order an existing node after freshly synthesized ones.
    pub fn bump_index(&mut self) -> u64 {
        let i = self.node_counter;
        self.node_counter += 1;
        i
    }

    pub fn ref_ty(&self, r: Ref) -> TypeId {
        self.ops[r.node].ty[r.index as usize]
    }

    pub fn callback(&self, index: usize) -> &ExecFn {
        &self.callbacks[index]
    }

    pub fn result_count(&self, key: NodeKey) -> usize {
        self.ops[key].ty.len()
    }

    //----------------------------------------------------------------------------------------------
    // builders

    #[track_caller]
    fn new_node(&mut self, kind: NodeKind, ty: SmallVec<[TypeId; 2]>) -> NodeKey {
        let index = self.node_counter;
        self.node_counter += 1;
        let mut debug = DebugInfo::default();
        debug.trace.push(std::panic::Location::caller());
        self.ops.insert(Node {
            index,
            kind,
            ty,
            flag: 0,
            held: false,
            scheduling: None,
            class: DomainFlags::PLACEHOLDER,
            debug: Some(Box::new(debug)),
        })
    }

    #[track_caller]
    pub fn make_placeholder(&mut self, ty: TypeId) -> Ref {
        Ref::new(self.new_node(NodeKind::Placeholder, smallvec![ty]), 0)
    }

    #[track_caller]
    pub fn make_constant(&mut self, ty: TypeId, value: Value) -> Ref {
        Ref::new(self.new_node(NodeKind::Constant { value }, smallvec![ty]), 0)
    }

    #[track_caller]
    pub fn make_constant_u32(&mut self, v: u32) -> Ref {
        let ty = self.types.ty_u32;
        self.make_constant(ty, Value::U64(v as u64))
    }

    #[track_caller]
    pub fn make_constant_u64(&mut self, v: u64) -> Ref {
        let ty = self.types.ty_u64;
        self.make_constant(ty, Value::U64(v))
    }

    #[track_caller]
    pub fn make_construct(&mut self, ty: TypeId, args: &[Ref]) -> Ref {
        Ref::new(
            self.new_node(
                NodeKind::Construct {
                    args: args.iter().copied().collect(),
                },
                smallvec![ty],
            ),
            0,
        )
    }

    /// Declare a union view over values that share storage.
    #[track_caller]
    pub fn make_declare_union(&mut self, args: &[Ref]) -> Ref {
        let arms: Vec<_> = args.iter().map(|a| self.ref_ty(*a)).collect();
        let ty = self.types.make_union_ty(arms);
        self.make_construct(ty, args)
    }

    /// Declare an opaque function; `execute` runs when the scheduled call is
    /// replayed.
    #[track_caller]
    pub fn make_declare_fn(&mut self, fn_ty: TypeId, execute: ExecFn) -> Ref {
        let idx = self.callbacks.len();
        self.callbacks.push(execute);
        self.make_constant(fn_ty, Value::OpaqueFn(idx))
    }

    /// Call a declared function. Result types come from the function
    /// signature's (aliased) return types.
    #[track_caller]
    pub fn make_call(&mut self, fun: Ref, args: &[Ref]) -> Ref {
        let fn_ty = self.ref_ty(fun);
        let returns = match self.types.kind(fn_ty) {
            TypeKind::OpaqueFn { returns, .. } | TypeKind::ShaderFn { returns, .. } => returns,
            other => panic!("call of a non-function type {:?}", other),
        };
        let mut all_args: SmallVec<[Ref; 4]> = smallvec![fun];
        all_args.extend(args.iter().copied());
        Ref::new(
            self.new_node(NodeKind::Call { args: all_args }, returns.into_iter().collect()),
            0,
        )
    }

    /// Divide a value along an axis. Results: 0 = the selected window,
    /// 1 = the remainder, 2 = the undivided source token.
    #[track_caller]
    pub fn make_slice(&mut self, ty: TypeId, src: Ref, axis: Axis, start: Ref, count: Ref) -> Ref {
        let src_ty = self.types.fully_stripped(self.ref_ty(src));
        Ref::new(
            self.new_node(
                NodeKind::Slice {
                    src,
                    axis,
                    start,
                    count,
                },
                smallvec![ty, ty, src_ty],
            ),
            0,
        )
    }

    /// Field extraction is a degenerate slice along the field axis.
    #[track_caller]
    pub fn make_extract(&mut self, src: Ref, index: u64) -> Ref {
        let src_ty = self.ref_ty(src);
        let member = self
            .types
            .member_type(src_ty, index as usize)
            .expect("extract from a non-aggregate");
        let start = self.make_constant_u64(index);
        let count = self.make_constant_u64(1);
        self.make_slice(member, src, Axis::Field, start, count)
    }

    #[track_caller]
    pub fn make_converge(&mut self, ty: TypeId, diverged: &[Ref]) -> Ref {
        Ref::new(
            self.new_node(
                NodeKind::Converge {
                    diverged: diverged.iter().copied().collect(),
                },
                smallvec![ty],
            ),
            0,
        )
    }

    /// Bring external values into the graph. One result per (type, value)
    /// pair.
    #[track_caller]
    pub fn make_acquire(&mut self, types: &[TypeId], values: Vec<Value>) -> Ref {
        assert_eq!(types.len(), values.len());
        Ref::new(
            self.new_node(
                NodeKind::Acquire {
                    values: values.into_iter().collect(),
                },
                types.iter().copied().collect(),
            ),
            0,
        )
    }

    #[track_caller]
    pub fn make_import(&mut self, ty: TypeId, value: Value) -> Ref {
        Ref::new(self.new_node(NodeKind::Import { value }, smallvec![ty]), 0)
    }

    /// Hand values back to the outside. Results alias the sources.
    #[track_caller]
    pub fn make_release(
        &mut self,
        src: &[Ref],
        dst_access: Access,
        dst_domain: DomainFlags,
    ) -> Ref {
        let ty: SmallVec<[TypeId; 2]> = src.iter().map(|r| self.ref_ty(*r)).collect();
        Ref::new(
            self.new_node(
                NodeKind::Release {
                    src: src.iter().copied().collect(),
                    dst_access,
                    dst_domain,
                },
                ty,
            ),
            0,
        )
    }

    #[track_caller]
    pub fn make_acquire_next_image(&mut self, swapchain: Ref) -> Ref {
        let ty = self.types.ty_image;
        Ref::new(
            self.new_node(NodeKind::AcquireNextImage { swapchain }, smallvec![ty]),
            0,
        )
    }

    #[track_caller]
    pub fn make_use(&mut self, src: Ref, access: Access) -> Ref {
        let ty = self.ref_ty(src);
        Ref::new(self.new_node(NodeKind::Use { src, access }, smallvec![ty]), 0)
    }

    #[track_caller]
    pub fn make_clear(&mut self, dst: Ref, value: Ref) -> Ref {
        let ty = self.ref_ty(dst);
        Ref::new(self.new_node(NodeKind::Clear { dst, value }, smallvec![ty]), 0)
    }

    #[track_caller]
    pub fn make_logical_copy(&mut self, src: Ref) -> Ref {
        let ty = self.ref_ty(src);
        Ref::new(self.new_node(NodeKind::LogicalCopy { src }, smallvec![ty]), 0)
    }

    #[track_caller]
    pub fn make_set(&mut self, dst: Ref, index: u32, value: Ref) -> Ref {
        let ty = self.ref_ty(dst);
        Ref::new(
            self.new_node(NodeKind::Set { dst, index, value }, smallvec![ty]),
            0,
        )
    }

    #[track_caller]
    pub fn make_cast(&mut self, ty: TypeId, src: Ref) -> Ref {
        Ref::new(self.new_node(NodeKind::Cast { src }, smallvec![ty]), 0)
    }

    #[track_caller]
    pub fn make_math_binary(&mut self, op: BinaryOp, a: Ref, b: Ref) -> Ref {
        let ty = self.ref_ty(a);
        Ref::new(self.new_node(NodeKind::MathBinary { op, a, b }, smallvec![ty]), 0)
    }

    #[track_caller]
    pub fn make_compile_pipeline(&mut self, src: Ref) -> Ref {
        let ty = self.types.ty_memory;
        Ref::new(
            self.new_node(NodeKind::CompilePipeline { src }, smallvec![ty]),
            0,
        )
    }

    #[track_caller]
    pub fn make_allocate(&mut self, ty: TypeId, src: Ref, tier: AllocTier) -> Ref {
        Ref::new(self.new_node(NodeKind::Allocate { src, tier }, smallvec![ty]), 0)
    }

    #[track_caller]
    pub fn make_get_allocation_size(&mut self, src: Ref) -> Ref {
        let ty = self.types.ty_u64;
        Ref::new(
            self.new_node(NodeKind::GetAllocationSize { src }, smallvec![ty]),
            0,
        )
    }

    #[track_caller]
    pub fn make_get_ci(&mut self, src: Ref) -> Ref {
        let ty = self.types.ty_image;
        Ref::new(self.new_node(NodeKind::GetCi { src }, smallvec![ty]), 0)
    }

    #[track_caller]
    pub fn make_get_iv_meta(&mut self, src: Ref) -> Ref {
        let ty = self.types.ty_image_view;
        Ref::new(self.new_node(NodeKind::GetIvMeta { src }, smallvec![ty]), 0)
    }

    //----------------------------------------------------------------------------------------------

    /// Name a result for diagnostics and the bound-resource maps.
    pub fn name_result(&mut self, r: Ref, name: &str) {
        let node = &mut self.ops[r.node];
        let debug = node.debug.get_or_insert_with(Default::default);
        while debug.result_names.len() <= r.index as usize {
            debug.result_names.push(String::new());
        }
        debug.result_names[r.index as usize] = name.to_owned();
    }

    /// Set a domain preference for queue inference.
    pub fn set_scheduling(&mut self, r: Ref, domains: DomainFlags) {
        self.ops[r.node].scheduling = Some(domains);
    }

    /// Protect a node from garbage collection.
    pub fn hold(&mut self, r: Ref) {
        self.ops[r.node].held = true;
    }

    pub fn release_hold(&mut self, r: Ref) {
        if let Some(n) = self.ops.get_mut(r.node) {
            n.held = false;
        }
    }

    /// Queue a node for reclamation on the next GC.
    pub fn discard(&mut self, key: NodeKey) {
        self.garbage.push(key);
    }

    /// Mark-sweep over the arena. The initial live set is every held node
    /// plus everything at or above the link frontier; anything they reach
    /// stays, the rest is freed.
    pub fn collect_garbage(&mut self) {
        const DEAD: u8 = 1;
        const ALIVE: u8 = 2;

        let mut work: Vec<NodeKey> = Vec::new();
        let mut garbage_now: Vec<NodeKey> = Vec::new();

        for (key, node) in self.ops.iter_mut() {
            if let NodeKind::Garbage = node.kind {
                garbage_now.push(key);
                continue;
            }
            if node.held || node.index >= self.link_frontier {
                node.flag = ALIVE;
                work.push(key);
            } else {
                node.flag = DEAD;
            }
        }
        for key in garbage_now {
            self.ops.remove(key);
        }

        while let Some(key) = work.pop() {
            let mut args: SmallVec<[NodeKey; 8]> = SmallVec::new();
            self.ops[key].kind.for_each_arg(|r| args.push(r.node));
            for a in args {
                if let Some(n) = self.ops.get_mut(a) {
                    if n.flag == DEAD {
                        n.flag = ALIVE;
                        work.push(a);
                    }
                }
            }
        }

        let dead: Vec<NodeKey> = self
            .ops
            .iter()
            .filter(|(_, n)| n.flag == DEAD)
            .map(|(k, _)| k)
            .collect();
        let freed = dead.len();
        for key in dead {
            self.ops.remove(key);
        }
        for key in self.garbage.drain(..) {
            self.ops.remove(key);
        }
        for (_, n) in self.ops.iter_mut() {
            n.flag = 0;
        }
        if freed > 0 {
            log::debug!("gc: freed {} nodes, {} remain", freed, self.ops.len());
        }
    }

    /// Reachability map from a set of roots, in dependency-first order.
    pub fn reachable_from(&self, roots: &[NodeKey]) -> Vec<NodeKey> {
        let mut seen: SecondaryMap<NodeKey, ()> = SecondaryMap::new();
        let mut work: Vec<NodeKey> = Vec::new();
        let mut out = Vec::new();
        for r in roots {
            if seen.insert(*r, ()).is_none() {
                work.push(*r);
            }
        }
        while let Some(key) = work.pop() {
            out.push(key);
            self.ops[key].kind.for_each_arg(|r| {
                if seen.insert(r.node, ()).is_none() {
                    work.push(r.node);
                }
            });
        }
        out.sort_by_key(|k| self.ops[*k].index);
        out
    }

    pub fn format_source_location(&self, key: NodeKey) -> String {
        match &self.ops[key].debug {
            Some(d) if !d.trace.is_empty() => d
                .trace
                .iter()
                .map(|l| format!("{}({})", l.file(), l.line()))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => "?".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_are_monotone_and_args_point_down() {
        let mut m = IRModule::new();
        let a = m.make_constant_u32(1);
        let b = m.make_constant_u32(2);
        let c = m.make_math_binary(BinaryOp::Add, a, b);
        let ci = m.node(c.node).index;
        m.node(c.node).kind.for_each_arg(|r| {
            assert!(m.node(r.node).index < ci);
        });
    }

    #[test]
    fn collect_garbage_is_idempotent() {
        let mut m = IRModule::new();
        let a = m.make_constant_u32(1);
        let b = m.make_constant_u32(2);
        let c = m.make_math_binary(BinaryOp::Add, a, b);
        let _dangling = m.make_constant_u32(3);
        m.hold(c);
        // pretend a compile already linked everything
        m.link_frontier = m.node_counter();

        m.collect_garbage();
        let after_first: Vec<_> = m.keys();
        assert_eq!(after_first.len(), 3);

        m.collect_garbage();
        let after_second: Vec<_> = m.keys();
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn held_roots_keep_their_arguments_alive() {
        let mut m = IRModule::new();
        let a = m.make_constant_u32(1);
        let b = m.make_constant_u32(2);
        let c = m.make_math_binary(BinaryOp::Add, a, b);
        m.hold(c);
        m.link_frontier = m.node_counter();
        m.collect_garbage();
        assert!(m.contains(a.node));
        assert!(m.contains(b.node));
        assert!(m.contains(c.node));
    }
}
