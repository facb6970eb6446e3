//! Graphviz .dot generator and textual IR listing.

use std::fmt::Write as _;

use fxhash::FxHashMap;

use crate::ir::{IRModule, NodeKey, NodeKind, Ref};

fn kind_color(kind: &NodeKind) -> &'static str {
    match kind {
        NodeKind::Constant { .. } | NodeKind::Placeholder => "gray25",
        NodeKind::Construct { .. } => "navyblue",
        NodeKind::Call { .. } => "darkgreen",
        NodeKind::Clear { .. } => "darkgreen",
        NodeKind::Acquire { .. }
        | NodeKind::AcquireNextImage { .. }
        | NodeKind::Import { .. } => "purple4",
        NodeKind::Release { .. } => "red4",
        NodeKind::Slice { .. } | NodeKind::Converge { .. } => "midnightblue",
        _ => "gray40",
    }
}

/// Accumulates one digraph with a cluster per compile milestone and writes
/// it out at the end.
pub struct GraphDumper {
    enabled: bool,
    label: String,
    out: String,
    clusters: usize,
}

impl GraphDumper {
    pub fn begin(enabled: bool, label: &str) -> GraphDumper {
        let mut out = String::new();
        if enabled {
            writeln!(out, "digraph G {{").unwrap();
            writeln!(
                out,
                "node [shape=box, style=filled, fontcolor=white, fontname=monospace];"
            )
            .unwrap();
            writeln!(out, "rankdir=LR;").unwrap();
        }
        GraphDumper {
            enabled,
            label: if label.is_empty() {
                "graph".to_owned()
            } else {
                label.to_owned()
            },
            out,
            clusters: 0,
        }
    }

    /// Dump a snapshot of the given nodes as one cluster.
    pub fn cluster(
        &mut self,
        name: &str,
        module: &IRModule,
        nodes: impl Iterator<Item = NodeKey>,
    ) {
        if !self.enabled {
            return;
        }
        let cluster = self.clusters;
        self.clusters += 1;
        writeln!(self.out, "subgraph cluster_{} {{", cluster).unwrap();
        writeln!(self.out, "label=\"{}\";", name).unwrap();

        let mut present: FxHashMap<NodeKey, u64> = FxHashMap::default();
        let nodes: Vec<NodeKey> = nodes.collect();
        for &key in &nodes {
            present.insert(key, module.node(key).index);
        }

        for &key in &nodes {
            let node = module.node(key);
            writeln!(
                self.out,
                "n{}_{} [fillcolor={}, label=\"{} (#{})\"];",
                cluster,
                node.index,
                kind_color(&node.kind),
                node.kind.name(),
                node.index
            )
            .unwrap();
        }
        for &key in &nodes {
            let node = module.node(key);
            let dst = node.index;
            node.kind.for_each_arg(|r: Ref| {
                if let Some(src) = present.get(&r.node) {
                    writeln!(self.out, "n{}_{} -> n{}_{};", cluster, src, cluster, dst).unwrap();
                }
            });
        }
        writeln!(self.out, "}}").unwrap();
    }

    /// Close the graph, write `<label>.dot`, and hand the text back.
    pub fn end(mut self) -> Option<String> {
        if !self.enabled {
            return None;
        }
        writeln!(self.out, "}}").unwrap();
        let path = format!("{}.dot", self.label);
        if let Err(e) = std::fs::write(&path, &self.out) {
            log::warn!("could not write graph dump to {}: {}", path, e);
        } else {
            log::info!("graph dumped to {}", path);
        }
        Some(self.out)
    }
}

//--------------------------------------------------------------------------------------------------

fn parm_to_string(
    module: &IRModule,
    naming: &FxHashMap<NodeKey, u32>,
    parm: Ref,
    msg: &mut String,
) {
    let node = module.node(parm.node);
    if let Some(debug) = &node.debug {
        if let Some(name) = debug.result_names.get(parm.index as usize) {
            if !name.is_empty() {
                write!(msg, "%{}", name).unwrap();
                return;
            }
        }
    }
    match &node.kind {
        NodeKind::Constant { value } => {
            if let Some(v) = value.as_u64() {
                write!(msg, "{}", v).unwrap();
            } else {
                write!(msg, "<mem>").unwrap();
            }
        }
        NodeKind::Placeholder => write!(msg, "?").unwrap(),
        kind => {
            if let Some(base) = naming.get(&parm.node) {
                write!(msg, "%{}_{}", kind.name(), base + parm.index).unwrap();
            } else {
                write!(msg, "%{}_#{}", kind.name(), node.index).unwrap();
            }
        }
    }
}

/// Textual listing of a linear schedule, one line per emitted node, operands
/// named by their naming index.
pub fn listing(module: &IRModule, schedule: &[(NodeKey, u32)]) -> String {
    let naming: FxHashMap<NodeKey, u32> = schedule.iter().copied().collect();
    let mut out = String::new();
    for (counter, &(key, base)) in schedule.iter().enumerate() {
        let node = module.node(key);
        let mut line = String::new();
        write!(line, "[{:#06x}] ", counter + 1).unwrap();
        write!(line, "%{}_{} = {}(", node.kind.name(), base, node.kind.name()).unwrap();
        let mut first = true;
        node.kind.for_each_arg(|r| {
            if !first {
                line.push_str(", ");
            }
            first = false;
            parm_to_string(module, &naming, r, &mut line);
        });
        line.push(')');
        out.push_str(&line);
        out.push('\n');
    }
    out
}
