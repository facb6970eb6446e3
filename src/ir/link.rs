//! Chain link overlay.
//!
//! Every node result gets a `ChainLink` during link building. Links form the
//! write chain of a resource (`prev`/`next`), record the readers that do not
//! advance the chain, and remember which consumer ends the link (`undef`).
//! The overlay is scoped to a compiler invocation and rebuilt from scratch
//! whenever the node set or the connections change.

use slotmap::SecondaryMap;
use smallvec::SmallVec;

use crate::access::ResourceUse;
use crate::ir::{IRModule, NodeKey, Ref};

#[derive(Clone, Debug, Default)]
pub struct ChainLink {
    /// Producer of this revision.
    pub def: Option<Ref>,
    /// Previous revision in the write chain.
    pub prev: Option<Ref>,
    /// Next revision in the write chain.
    pub next: Option<Ref>,
    /// Consumers that read this revision without ending it.
    pub reads: SmallVec<[Ref; 4]>,
    /// The consumer that renders this revision inaccessible.
    pub undef: Option<Ref>,
    /// Sub-chains introduced by slicing this revision.
    pub child_chains: SmallVec<[Ref; 2]>,
    /// Lowered synchronization for the merged read group.
    pub read_sync: Option<ResourceUse>,
    /// Lowered synchronization for the ending write.
    pub undef_sync: Option<ResourceUse>,
}

/// Per-result link storage for one compile invocation.
#[derive(Default)]
pub struct Links {
    map: SecondaryMap<NodeKey, SmallVec<[ChainLink; 2]>>,
}

impl Links {
    pub fn new() -> Links {
        Links {
            map: SecondaryMap::new(),
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn contains(&self, node: NodeKey) -> bool {
        self.map.contains_key(node)
    }

    /// Allocate empty links for every result of `node`.
    pub fn alloc(&mut self, node: NodeKey, result_count: usize) {
        let mut v: SmallVec<[ChainLink; 2]> = SmallVec::new();
        v.resize(result_count, ChainLink::default());
        self.map.insert(node, v);
    }

    pub fn link(&self, r: Ref) -> &ChainLink {
        &self.map[r.node][r.index as usize]
    }

    pub fn link_mut(&mut self, r: Ref) -> &mut ChainLink {
        &mut self.map[r.node][r.index as usize]
    }

    pub fn try_link(&self, r: Ref) -> Option<&ChainLink> {
        self.map.get(r.node).and_then(|v| v.get(r.index as usize))
    }

    /// Follow `next` to the last revision of the chain containing `r`.
    pub fn chain_tail(&self, r: Ref) -> Ref {
        let mut cur = r;
        while let Some(next) = self.link(cur).next {
            cur = next;
        }
        cur
    }

    /// Follow `prev` to the first revision of the chain containing `r`.
    pub fn chain_head(&self, r: Ref) -> Ref {
        let mut cur = r;
        while let Some(prev) = self.link(cur).prev {
            cur = prev;
        }
        cur
    }

    /// All link heads (results whose link has no `prev`), in node index
    /// order.
    pub fn heads(&self, module: &IRModule, nodes: &[NodeKey]) -> Vec<Ref> {
        let mut out = Vec::new();
        for &key in nodes {
            if let Some(links) = self.map.get(key) {
                for (i, l) in links.iter().enumerate() {
                    if l.prev.is_none() && l.def.is_some() {
                        out.push(Ref::new(key, i as u32));
                    }
                }
            }
        }
        out.sort_by_key(|r| (module.node(r.node).index, r.index));
        out
    }
}
