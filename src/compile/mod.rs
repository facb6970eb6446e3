//! The graph compiler.
//!
//! `Compiler::compile` takes a module and the refs the caller wants realized,
//! and drives the pass pipeline: garbage collection, implicit linking (SSA
//! repair), SET application, constant folding, reification, validation,
//! forced convergence, scheduling, queue inference, partitioning, sync
//! lowering and linearization. The result stays inside the `Compiler` and is
//! what the executor walks.

use std::ops::Range;

use derivative::Derivative;
use fxhash::FxHashMap;
use slotmap::SecondaryMap;

use crate::access::access_to_usage;
use crate::access::DomainFlags;
use crate::error::{Error, Result};
use crate::ir::dump::GraphDumper;
use crate::ir::link::Links;
use crate::ir::{IRModule, NodeKey, NodeKind, Ref};
use crate::resource::ImageUsageFlags;
use crate::typedesc::TypeKind;

mod const_fold;
mod converge;
mod dedup;
mod expand;
mod link_building;
mod linearize;
mod reify;
mod sync;

use self::link_building::LinkBuilder;

/// One executable step of the final schedule.
#[derive(Copy, Clone, Debug)]
pub struct ScheduledItem {
    pub node: NodeKey,
    pub scheduled_domain: DomainFlags,
    /// Assigned at linearization, used by diagnostics to name results.
    pub naming_index: u32,
}

#[derive(Copy, Clone, Debug)]
pub struct LiveRange {
    pub def: Ref,
    pub undef: Ref,
}

#[derive(Derivative, Default)]
#[derivative(Debug)]
pub struct CompileCallbacks {
    /// Receives the Graphviz text when `dump_graph` is set (e.g. to launch a
    /// viewer).
    #[derivative(Debug = "ignore")]
    pub on_dump: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

#[derive(Derivative, Default)]
#[derivative(Debug)]
pub struct RenderGraphCompileOptions {
    pub callbacks: CompileCallbacks,
    pub dump_graph: bool,
    pub graph_label: String,
}

#[derive(Default)]
pub struct Compiler {
    /// Ref-reachable nodes, in index order.
    pub(crate) nodes: Vec<NodeKey>,
    /// Tail nodes the caller asked for.
    pub(crate) ref_nodes: Vec<NodeKey>,
    pub(crate) links: Links,
    /// Chain heads.
    pub(crate) chains: Vec<Ref>,
    pub(crate) live_ranges: FxHashMap<Ref, LiveRange>,
    pub(crate) items: Vec<ScheduledItem>,
    pub(crate) scheduled: SecondaryMap<NodeKey, usize>,
    /// Linear schedule: indices into `items`.
    pub(crate) item_list: Vec<usize>,
    /// Queue-partitioned schedule: indices into `items`, transfer first,
    /// then compute, then graphics.
    pub(crate) partitioned: Vec<usize>,
    pub(crate) transfer_range: Range<usize>,
    pub(crate) compute_range: Range<usize>,
    pub(crate) graphics_range: Range<usize>,
    pub(crate) bound_attachments: FxHashMap<String, Ref>,
    pub(crate) bound_buffers: FxHashMap<String, Ref>,
    new_nodes: Vec<NodeKey>,
    set_nodes: Vec<NodeKey>,
}

impl Compiler {
    pub fn new() -> Compiler {
        Compiler::default()
    }

    fn reset(&mut self) {
        self.nodes.clear();
        self.ref_nodes.clear();
        self.links.clear();
        self.chains.clear();
        self.live_ranges.clear();
        self.items.clear();
        self.scheduled.clear();
        self.item_list.clear();
        self.partitioned.clear();
        self.transfer_range = 0..0;
        self.compute_range = 0..0;
        self.graphics_range = 0..0;
        self.bound_attachments.clear();
        self.bound_buffers.clear();
        self.new_nodes.clear();
        self.set_nodes.clear();
    }

    //----------------------------------------------------------------------------------------------
    // compiled artifact accessors

    pub fn get_use_chains(&self) -> &[Ref] {
        &self.chains
    }

    pub fn get_scheduled_nodes(&self) -> impl Iterator<Item = &ScheduledItem> {
        self.item_list.iter().map(move |i| &self.items[*i])
    }

    pub fn item(&self, index: usize) -> &ScheduledItem {
        &self.items[index]
    }

    pub fn item_of(&self, node: NodeKey) -> Option<&ScheduledItem> {
        self.scheduled.get(node).map(|i| &self.items[*i])
    }

    pub fn bound_attachments(&self) -> &FxHashMap<String, Ref> {
        &self.bound_attachments
    }

    pub fn bound_buffers(&self) -> &FxHashMap<String, Ref> {
        &self.bound_buffers
    }

    pub fn links(&self) -> &Links {
        &self.links
    }

    /// The queue-partitioned schedule, transfer segment.
    pub fn transfer_partition(&self) -> impl Iterator<Item = &ScheduledItem> {
        self.partitioned[self.transfer_range.clone()]
            .iter()
            .map(move |i| &self.items[*i])
    }

    pub fn compute_partition(&self) -> impl Iterator<Item = &ScheduledItem> {
        self.partitioned[self.compute_range.clone()]
            .iter()
            .map(move |i| &self.items[*i])
    }

    pub fn graphics_partition(&self) -> impl Iterator<Item = &ScheduledItem> {
        self.partitioned[self.graphics_range.clone()]
            .iter()
            .map(move |i| &self.items[*i])
    }

    //----------------------------------------------------------------------------------------------

    pub fn compile(
        &mut self,
        module: &mut IRModule,
        refs: &[Ref],
        options: &RenderGraphCompileOptions,
    ) -> Result<()> {
        let result = self.compile_inner(module, refs, options);
        if let Err(e) = &result {
            // best effort: linearize whatever we have so the listing names
            // operands the way the rest of the diagnostics do
            self.schedule_items(module);
            let ok = linearize::run(
                module,
                &mut self.items,
                &self.scheduled,
                &self.links,
                &mut self.item_list,
            )
            .is_ok();
            if ok && log::log_enabled!(log::Level::Debug) {
                let schedule: Vec<(NodeKey, u32)> = self
                    .item_list
                    .iter()
                    .map(|i| (self.items[*i].node, self.items[*i].naming_index))
                    .collect();
                log::debug!(
                    "IR listing at failure:\n{}",
                    crate::ir::dump::listing(module, &schedule)
                );
            }
            log::error!("compile failed: {}", e);
        }
        result
    }

    fn compile_inner(
        &mut self,
        module: &mut IRModule,
        refs: &[Ref],
        options: &RenderGraphCompileOptions,
    ) -> Result<()> {
        self.reset();
        self.ref_nodes = refs.iter().map(|r| r.node).collect();
        self.ref_nodes.dedup();

        let mut dumper = GraphDumper::begin(options.dump_graph, &options.graph_label);

        module.collect_garbage();
        dumper.cluster("fragments", module, module.keys().iter().copied());

        self.implicit_link(module)?;
        dumper.cluster("modules", module, module.keys().iter().copied());

        self.build_nodes(module);
        self.rebuild_links(module, false)?;
        dumper.cluster("linked", module, self.nodes.iter().copied());

        self.apply_set_nodes(module);
        if !self.set_nodes.is_empty() {
            self.set_nodes.clear();
            self.build_nodes(module);
            self.rebuild_links(module, true)?;
        }

        // rewrite allocates of default views before folding so the new
        // extracts can fold too
        let mut rewrites = Vec::new();
        expand::run(module, &self.nodes, &mut self.new_nodes, &mut rewrites)?;
        if !rewrites.is_empty() {
            self.apply_rewrites(module, &rewrites);
            self.absorb_new_nodes(module)?;
        }

        const_fold::run(module, &self.nodes, &mut self.new_nodes)?;
        self.absorb_new_nodes(module)?;

        reify::run(module, &self.nodes, &self.links, &mut self.new_nodes)?;
        self.absorb_new_nodes(module)?;

        const_fold::run(module, &self.nodes, &mut self.new_nodes)?;
        self.absorb_new_nodes(module)?;

        dedup::run(module, &self.nodes, &self.links)?;
        self.validate_read_undefined(module)?;
        self.validate_same_argument_different_access(module)?;

        self.collect_chains(module);
        converge::run(
            module,
            &self.ref_nodes,
            &self.chains.clone(),
            &mut self.links,
            &mut self.new_nodes,
        )?;
        self.absorb_new_nodes(module)?;
        self.collect_chains(module);

        self.schedule_items(module);
        self.queue_inference(module);
        self.pass_partitioning();

        sync::run(module, &self.nodes, &mut self.links, &self.scheduled, &self.items)?;

        self.collect_bound_names(module);

        dumper.cluster("final", module, self.nodes.iter().copied());
        if let Some(dot) = dumper.end() {
            if let Some(cb) = &options.callbacks.on_dump {
                cb(&dot);
            }
        }

        linearize::run(
            module,
            &mut self.items,
            &self.scheduled,
            &self.links,
            &mut self.item_list,
        )?;

        // everything we synthesized counts as linked for future GC
        module.link_frontier = module.node_counter();

        log::debug!(
            "compile: {} nodes, {} chains, {} scheduled items",
            self.nodes.len(),
            self.chains.len(),
            self.item_list.len()
        );
        Ok(())
    }

    //----------------------------------------------------------------------------------------------

    /// Link everything at or above the module's frontier with SSA repair.
    fn implicit_link(&mut self, module: &mut IRModule) -> Result<()> {
        let frontier = module.link_frontier;
        let mut working: Vec<NodeKey> = Vec::new();
        for (key, node) in module.iter() {
            let already_linked =
                node.index < frontier && !matches!(node.kind, NodeKind::Acquire { .. });
            if already_linked {
                continue;
            }
            if let NodeKind::Set { .. } = node.kind {
                self.set_nodes.push(key);
            } else {
                working.push(key);
            }
        }
        working.sort_by_key(|k| module.node(*k).index);

        self.links.clear();
        let mut builder = LinkBuilder::new(module, &mut self.links, &mut self.new_nodes, true);
        builder.run(&working)?;
        module.link_frontier = module.node_counter();
        self.new_nodes.clear();
        Ok(())
    }

    fn build_nodes(&mut self, module: &IRModule) {
        self.nodes = module.reachable_from(&self.ref_nodes);
    }

    fn rebuild_links(&mut self, module: &mut IRModule, implicit: bool) -> Result<()> {
        self.links.clear();
        let nodes = self.nodes.clone();
        let mut builder = LinkBuilder::new(module, &mut self.links, &mut self.new_nodes, implicit);
        builder.run(&nodes)?;
        if !self.new_nodes.is_empty() {
            // linking itself synthesized nodes (unions, replicas); settle
            self.new_nodes.clear();
            self.build_nodes(module);
            let nodes = self.nodes.clone();
            self.links.clear();
            let mut builder =
                LinkBuilder::new(module, &mut self.links, &mut self.new_nodes, implicit);
            builder.run(&nodes)?;
            self.new_nodes.clear();
        }
        Ok(())
    }

    /// Fold freshly synthesized nodes into the working set and re-link.
    fn absorb_new_nodes(&mut self, module: &mut IRModule) -> Result<()> {
        if self.new_nodes.is_empty() {
            return Ok(());
        }
        self.new_nodes.clear();
        self.build_nodes(module);
        self.rebuild_links(module, true)
    }

    fn apply_rewrites(&mut self, module: &mut IRModule, rewrites: &[(Ref, Ref)]) {
        let map: FxHashMap<Ref, Ref> = rewrites.iter().copied().collect();
        let keys = module.keys();
        for key in keys {
            module.node_mut(key).kind.for_each_arg_mut(|r| {
                if let Some(to) = map.get(r) {
                    *r = *to;
                }
            });
        }
    }

    /// SET nodes patch the head construct of their destination chain.
    fn apply_set_nodes(&mut self, module: &mut IRModule) {
        for i in 0..self.set_nodes.len() {
            let key = self.set_nodes[i];
            let (dst, index, value) = match &module.node(key).kind {
                NodeKind::Set { dst, index, value } => (*dst, *index, *value),
                _ => continue,
            };
            if self.links.try_link(dst).is_none() {
                continue;
            }
            let head = self.links.chain_head(dst);
            let def_node = match self.links.link(head).def {
                Some(d) => d.node,
                None => continue,
            };
            if let NodeKind::Construct { args } = &mut module.node_mut(def_node).kind {
                if (index as usize) < args.len() {
                    args[index as usize] = value;
                }
            }
            module.node_mut(key).kind = NodeKind::Garbage;
            module.discard(key);
        }
    }

    fn collect_chains(&mut self, module: &IRModule) {
        self.chains = self.links.heads(module, &self.nodes);
        self.live_ranges.clear();
        for &head in &self.chains {
            let tail = self.links.chain_tail(head);
            self.live_ranges.insert(
                head,
                LiveRange {
                    def: head,
                    undef: tail,
                },
            );
        }
    }

    //----------------------------------------------------------------------------------------------
    // scheduling

    fn schedule_items(&mut self, module: &IRModule) {
        self.items.clear();
        self.scheduled.clear();

        let mut add = |items: &mut Vec<ScheduledItem>,
                       scheduled: &mut SecondaryMap<NodeKey, usize>,
                       node: NodeKey| {
            if scheduled.contains_key(node) {
                return;
            }
            let idx = items.len();
            items.push(ScheduledItem {
                node,
                scheduled_domain: DomainFlags::ANY,
                naming_index: 0,
            });
            scheduled.insert(node, idx);
        };

        for &node in &self.ref_nodes {
            add(&mut self.items, &mut self.scheduled, node);
        }
        for &node in &self.nodes {
            match module.node(node).kind {
                NodeKind::Call { .. }
                | NodeKind::Slice { .. }
                | NodeKind::Converge { .. }
                | NodeKind::Clear { .. }
                | NodeKind::Release { .. } => {
                    add(&mut self.items, &mut self.scheduled, node);
                }
                _ => {}
            }
        }
    }

    fn chain_revisions(&self, head: Ref) -> Vec<Ref> {
        let mut out = vec![head];
        let mut cur = head;
        while let Some(next) = self.links.link(cur).next {
            out.push(next);
            cur = next;
        }
        out
    }

    /// Forward/backward domain propagation over every chain, with a graphics
    /// fallback for anything the data flow could not determine.
    fn queue_inference(&mut self, module: &IRModule) {
        let chains = self.chains.clone();
        let mut items = std::mem::replace(&mut self.items, Vec::new());

        let propagate = |items: &mut Vec<ScheduledItem>,
                         scheduled: &SecondaryMap<NodeKey, usize>,
                         last_domain: &mut DomainFlags,
                         node: NodeKey| {
            let idx = match scheduled.get(node) {
                Some(i) => *i,
                None => return,
            };
            let item = &mut items[idx];
            if item.scheduled_domain == DomainFlags::ANY {
                let prop_known =
                    *last_domain != DomainFlags::DEVICE && *last_domain != DomainFlags::ANY;
                match (prop_known, module.node(node).scheduling) {
                    (true, None) => item.scheduled_domain = *last_domain,
                    (false, Some(required)) => {
                        item.scheduled_domain = required.pick_first_domain()
                    }
                    (true, Some(required)) => {
                        let intersection = *last_domain & required;
                        item.scheduled_domain = if intersection.is_empty() {
                            required.pick_first_domain()
                        } else {
                            intersection
                        };
                    }
                    (false, None) => {}
                }
            } else {
                *last_domain = item.scheduled_domain;
            }
        };

        let mut run_round = |items: &mut Vec<ScheduledItem>| {
            for &head in &chains {
                // forward
                let mut last_domain = DomainFlags::DEVICE;
                for rev in self.chain_revisions(head) {
                    let link = self.links.link(rev);
                    if let Some(def) = link.def {
                        propagate(items, &self.scheduled, &mut last_domain, def.node);
                    }
                    for r in &link.reads {
                        propagate(items, &self.scheduled, &mut last_domain, r.node);
                    }
                    if let Some(u) = link.undef {
                        propagate(items, &self.scheduled, &mut last_domain, u.node);
                    }
                }
                // backward
                let mut last_domain = DomainFlags::DEVICE;
                for rev in self.chain_revisions(head).into_iter().rev() {
                    let link = self.links.link(rev);
                    if let Some(u) = link.undef {
                        propagate(items, &self.scheduled, &mut last_domain, u.node);
                    }
                    for r in &link.reads {
                        propagate(items, &self.scheduled, &mut last_domain, r.node);
                    }
                    if let Some(def) = link.def {
                        propagate(items, &self.scheduled, &mut last_domain, def.node);
                    }
                }
            }
        };

        run_round(&mut items);

        // anything inference could not place goes to graphics
        for item in items.iter_mut() {
            if item.scheduled_domain == DomainFlags::DEVICE
                || item.scheduled_domain == DomainFlags::ANY
            {
                item.scheduled_domain = DomainFlags::GRAPHICS_QUEUE;
            }
        }

        run_round(&mut items);
        self.items = items;

        if log::log_enabled!(log::Level::Debug) {
            for item in &self.items {
                log::debug!(
                    "queue inference: {} -> {}",
                    module.node(item.node).kind.name(),
                    item.scheduled_domain.to_str()
                );
            }
        }
    }

    /// Split the schedule into the three queue segments, in transfer,
    /// compute, graphics order.
    fn pass_partitioning(&mut self) {
        self.partitioned.clear();
        for (i, item) in self.items.iter().enumerate() {
            if item.scheduled_domain.contains(DomainFlags::TRANSFER_QUEUE) {
                self.partitioned.push(i);
            }
        }
        self.transfer_range = 0..self.partitioned.len();
        for (i, item) in self.items.iter().enumerate() {
            if item.scheduled_domain.contains(DomainFlags::COMPUTE_QUEUE) {
                self.partitioned.push(i);
            }
        }
        self.compute_range = self.transfer_range.end..self.partitioned.len();
        for (i, item) in self.items.iter().enumerate() {
            if item.scheduled_domain.contains(DomainFlags::GRAPHICS_QUEUE) {
                self.partitioned.push(i);
            }
        }
        self.graphics_range = self.compute_range.end..self.partitioned.len();
    }

    //----------------------------------------------------------------------------------------------
    // validators

    fn validate_read_undefined(&self, module: &IRModule) -> Result<()> {
        for &key in &self.nodes {
            if !matches!(module.node(key).kind, NodeKind::Allocate { .. }) {
                continue;
            }
            let link = match self.links.try_link(Ref::new(key, 0)) {
                Some(l) => l,
                None => continue,
            };
            if let Some(offender) = link.reads.first() {
                return Err(Error::ReadUndefined {
                    node: module.node(offender.node).kind.name().to_owned(),
                    trace: module.format_source_location(key),
                });
            }
        }
        Ok(())
    }

    fn validate_same_argument_different_access(&self, module: &IRModule) -> Result<()> {
        let mut arg_set: FxHashMap<Ref, crate::access::Access> = FxHashMap::default();
        for &key in &self.nodes {
            let args = match &module.node(key).kind {
                NodeKind::Call { args } => args.clone(),
                _ => continue,
            };
            arg_set.clear();
            let fn_ty = module.ref_ty(args[0]);
            let (first_parm, fn_args) = match module.types.kind(fn_ty) {
                TypeKind::OpaqueFn { args, .. } => (1usize, args),
                TypeKind::ShaderFn { args, .. } => (4usize, args),
                _ => continue,
            };
            for i in first_parm..args.len() {
                let access = match module.types.kind(fn_args[i - first_parm]) {
                    TypeKind::Imbued { access, .. } => access,
                    _ => continue,
                };
                if let Some(prev) = arg_set.insert(args[i], access) {
                    if prev != access {
                        return Err(Error::SameArgumentDifferentAccess {
                            node: module.node(key).kind.name().to_owned(),
                            trace: module.format_source_location(key),
                            first_access: crate::access::access_name(prev),
                            second_access: crate::access::access_name(access),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    //----------------------------------------------------------------------------------------------

    fn collect_bound_names(&mut self, module: &IRModule) {
        for &key in &self.nodes {
            let node = module.node(key);
            let names = match &node.debug {
                Some(d) => &d.result_names,
                None => continue,
            };
            match node.kind {
                NodeKind::Construct { .. } | NodeKind::Acquire { .. } => {}
                _ => continue,
            }
            for (i, name) in names.iter().enumerate() {
                if name.is_empty() || i >= node.ty.len() {
                    continue;
                }
                let r = Ref::new(key, i as u32);
                if module.types.is_imageview(node.ty[i]) {
                    self.bound_attachments.insert(name.clone(), r);
                } else if module.types.is_bufferlike_view(node.ty[i]) {
                    self.bound_buffers.insert(name.clone(), r);
                }
            }
        }
    }

    /// Image usage implied by everything a chain (and its subchains) does.
    pub fn compute_usage(&self, module: &IRModule, head: Ref) -> ImageUsageFlags {
        let mut usage = ImageUsageFlags::empty();
        self.compute_usage_inner(module, head, &mut usage);
        usage
    }

    fn compute_usage_inner(&self, module: &IRModule, head: Ref, usage: &mut ImageUsageFlags) {
        let mut cur = Some(head);
        while let Some(rev) = cur {
            let link = match self.links.try_link(rev) {
                Some(l) => l,
                None => break,
            };
            for consumer in link.reads.iter().chain(link.undef.iter()) {
                match &module.node(consumer.node).kind {
                    NodeKind::Call { args } => {
                        let fn_ty = module.ref_ty(args[0]);
                        let (first_parm, fn_args) = match module.types.kind(fn_ty) {
                            TypeKind::OpaqueFn { args, .. } => (1usize, args),
                            TypeKind::ShaderFn { args, .. } => (4usize, args),
                            _ => continue,
                        };
                        let i = consumer.index as usize;
                        if i < first_parm || i - first_parm >= fn_args.len() {
                            continue;
                        }
                        if let TypeKind::Imbued { access, .. } =
                            module.types.kind(fn_args[i - first_parm])
                        {
                            access_to_usage(usage, access);
                        }
                    }
                    NodeKind::Clear { .. } => {
                        access_to_usage(usage, crate::access::Access::TransferClear);
                    }
                    _ => {}
                }
            }
            for child in &link.child_chains {
                self.compute_usage_inner(module, *child, usage);
            }
            cur = link.next;
        }
    }
}
