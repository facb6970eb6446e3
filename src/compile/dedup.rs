//! Duplicated-resource validation.
//!
//! Replays every host-known resource value into an aliasing index (radix
//! trie over device addresses for buffers, identity sets for images and
//! swapchains). Two live acquisitions of overlapping storage are an error
//! pointing at both acquisition sites, with one exception: buffers may be
//! acquired twice because implicit linking has already unioned them.

use fxhash::FxHashMap;

use crate::error::{Error, Result};
use crate::ir::link::Links;
use crate::ir::value::{eval_owned, Value};
use crate::ir::{IRModule, NodeKey, NodeKind, Ref};
use crate::radix::RadixTree;
use crate::resource::{ImageAttachment, SwapchainHandle};
use crate::typedesc::TypeKind;

fn duplicate_error(module: &IRModule, node: NodeKey, previous: NodeKey) -> Error {
    Error::DuplicatedResource {
        node: module.node(node).kind.name().to_owned(),
        trace: module.format_source_location(node),
        previous: module.node(previous).kind.name().to_owned(),
        previous_trace: module.format_source_location(previous),
    }
}

struct Index {
    memory: RadixTree<NodeKey>,
    images: FxHashMap<ImageAttachment, NodeKey>,
    swapchains: FxHashMap<SwapchainHandle, NodeKey>,
}

impl Index {
    fn add_one(
        &mut self,
        module: &IRModule,
        ty: crate::typedesc::TypeId,
        node: NodeKey,
        value: &Value,
    ) -> Option<NodeKey> {
        let ty = module.types.fully_stripped(ty);
        match module.types.kind(ty) {
            TypeKind::Array { .. } | TypeKind::Union { .. } => return None,
            _ => {}
        }
        match value {
            Value::Image(ia) if !ia.image.is_null() => {
                if let Some(prev) = self.images.get(ia) {
                    return Some(*prev);
                }
                self.images.insert(ia.clone(), node);
            }
            Value::Buffer(buf)
                if module.types.is_bufferlike_view(ty)
                    && buf.device_address != 0
                    && buf.size > 0 =>
            {
                let collided = self
                    .memory
                    .insert_unaligned(buf.device_address, buf.size, node);
                if collided {
                    if let Some(prev) = self.memory.find(buf.device_address) {
                        if *prev != node {
                            return Some(*prev);
                        }
                    }
                }
            }
            Value::Swapchain(sw) => {
                if let Some(prev) = self.swapchains.get(&sw.handle) {
                    return Some(*prev);
                }
                self.swapchains.insert(sw.handle, node);
            }
            _ => {}
        }
        None
    }
}

pub(crate) fn run(module: &IRModule, nodes: &[NodeKey], links: &Links) -> Result<()> {
    let mut index = Index {
        memory: RadixTree::new(),
        images: FxHashMap::default(),
        swapchains: FxHashMap::default(),
    };

    for &key in nodes {
        match &module.node(key).kind {
            NodeKind::Constant { .. } | NodeKind::Construct { .. } => {
                // values we cannot evaluate will be freshly allocated, so
                // they cannot alias anything already known
                let value = match eval_owned(module, Ref::new(key, 0)) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let ty = module.node(key).ty[0];
                if let Some(prev) = index.add_one(module, ty, key, &value) {
                    return Err(duplicate_error(module, key, prev));
                }
            }
            NodeKind::Acquire { values } => {
                for (i, value) in values.iter().enumerate() {
                    let r = Ref::new(key, i as u32);
                    let link = match links.try_link(r) {
                        Some(l) => l,
                        None => continue,
                    };
                    // acquisitions nothing consumes are not live
                    if link.reads.is_empty() && link.undef.is_none() && link.next.is_none() {
                        continue;
                    }
                    let ty = module.node(key).ty[i];
                    if let Some(prev) = index.add_one(module, ty, key, value) {
                        let buffer_pair = module.types.is_bufferlike_view(ty)
                            && matches!(module.node(prev).kind, NodeKind::Acquire { .. });
                        if buffer_pair {
                            // acquire/acquire on buffers is allowed; implicit
                            // linking already unioned the two views
                            continue;
                        }
                        return Err(duplicate_error(module, key, prev));
                    }
                }
            }
            _ => {}
        }
    }

    Ok(())
}
