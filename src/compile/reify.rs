//! Reification inference.
//!
//! Image metadata (extent, format, sample count, mip/layer counts) flows
//! between everything that shares storage: along write chains, across slices
//! (parent to children and back) and through convergences. The pass iterates
//! to a fixed point, then replaces resolved PLACEHOLDER construct arguments
//! with constants. Attachments that still have no extent afterwards are
//! caught by the executor's framebuffer sweep.

use fxhash::FxHashMap;

use crate::error::Result;
use crate::format::Format;
use crate::ir::link::Links;
use crate::ir::value::{eval_owned, Value};
use crate::ir::{IRModule, NodeKey, NodeKind, Ref};
use crate::resource::Extent3D;

#[derive(Copy, Clone, Debug, Default, PartialEq)]
struct ImageMeta {
    extent: Option<Extent3D>,
    format: Option<Format>,
    samples: Option<u32>,
    levels: Option<u32>,
    layers: Option<u32>,
}

impl ImageMeta {
    /// Take fields from `other` that we don't know yet. Returns true on
    /// progress.
    fn absorb(&mut self, other: &ImageMeta) -> bool {
        let mut progress = false;
        if self.extent.is_none() && other.extent.is_some() {
            self.extent = other.extent;
            progress = true;
        }
        if self.format.is_none() && other.format.is_some() {
            self.format = other.format;
            progress = true;
        }
        if self.samples.is_none() && other.samples.is_some() {
            self.samples = other.samples;
            progress = true;
        }
        progress
    }

    /// Like `absorb`, but mip/layer structure too (same-storage only).
    fn absorb_all(&mut self, other: &ImageMeta) -> bool {
        let mut progress = self.absorb(other);
        if self.levels.is_none() && other.levels.is_some() {
            self.levels = other.levels;
            progress = true;
        }
        if self.layers.is_none() && other.layers.is_some() {
            self.layers = other.layers;
            progress = true;
        }
        progress
    }
}

// construct argument positions of the image composite
const F_EXTENT: usize = 4;
const F_FORMAT: usize = 5;
const F_SAMPLES: usize = 6;
const F_LEVELS: usize = 7;
const F_LAYERS: usize = 8;

fn seed_from_construct(module: &IRModule, key: NodeKey) -> ImageMeta {
    let mut meta = ImageMeta::default();
    if let NodeKind::Construct { args } = &module.node(key).kind {
        let field = |i: usize| args.get(i).copied();
        if let Some(r) = field(F_EXTENT) {
            if let Ok(v) = eval_owned(module, r) {
                meta.extent = v.as_extent();
            }
        }
        if let Some(r) = field(F_FORMAT) {
            if let Ok(v) = eval_owned(module, r) {
                meta.format = v.as_format();
            }
        }
        if let Some(r) = field(F_SAMPLES) {
            if let Ok(v) = eval_owned(module, r) {
                meta.samples = v.as_u64().map(|v| v as u32);
            }
        }
        if let Some(r) = field(F_LEVELS) {
            if let Ok(v) = eval_owned(module, r) {
                meta.levels = v.as_u64().map(|v| v as u32);
            }
        }
        if let Some(r) = field(F_LAYERS) {
            if let Ok(v) = eval_owned(module, r) {
                meta.layers = v.as_u64().map(|v| v as u32);
            }
        }
    }
    meta
}

fn seed_from_image(img: &crate::resource::ImageAttachment) -> ImageMeta {
    ImageMeta {
        extent: if img.extent.is_zero() {
            None
        } else {
            Some(img.extent)
        },
        format: if img.format == Format::Undefined {
            None
        } else {
            Some(img.format)
        },
        samples: Some(img.samples.max(1)),
        levels: Some(img.level_count.max(1)),
        layers: Some(img.layer_count.max(1)),
    }
}

pub(crate) fn run(
    module: &mut IRModule,
    nodes: &[NodeKey],
    links: &Links,
    new_nodes: &mut Vec<NodeKey>,
) -> Result<()> {
    // metadata per storage, keyed by chain head
    let mut metas: FxHashMap<Ref, ImageMeta> = FxHashMap::default();

    let head_of = |r: Ref| -> Option<Ref> {
        if links.try_link(r).is_some() {
            Some(links.chain_head(r))
        } else {
            None
        }
    };

    // seed
    for &key in nodes {
        match &module.node(key).kind {
            NodeKind::Construct { .. } if module.types.is_imageview(module.node(key).ty[0]) => {
                let seed = seed_from_construct(module, key);
                if let Some(h) = head_of(Ref::new(key, 0)) {
                    metas.entry(h).or_default().absorb_all(&seed);
                }
            }
            NodeKind::Acquire { values } => {
                for (i, v) in values.iter().enumerate() {
                    if let Value::Image(img) = v {
                        if let Some(h) = head_of(Ref::new(key, i as u32)) {
                            metas.entry(h).or_default().absorb_all(&seed_from_image(img));
                        }
                    }
                }
            }
            NodeKind::AcquireNextImage { swapchain } => {
                if let Ok(Value::Swapchain(sw)) = eval_owned(module, *swapchain) {
                    if let Some(img) = sw.images.first() {
                        let mut seed = seed_from_image(img);
                        seed.extent = Some(Extent3D::new(sw.extent.width, sw.extent.height, 1));
                        if let Some(h) = head_of(Ref::new(key, 0)) {
                            metas.entry(h).or_default().absorb_all(&seed);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    // propagate across storage-sharing edges to a fixed point
    let mut rounds = 0;
    loop {
        let mut progress = false;
        for &key in nodes {
            match &module.node(key).kind {
                NodeKind::Slice { src, .. } => {
                    let parent = match head_of(*src) {
                        Some(h) => h,
                        None => continue,
                    };
                    for i in 0..3u32 {
                        let child = match head_of(Ref::new(key, i)) {
                            Some(h) => h,
                            None => continue,
                        };
                        if child == parent {
                            continue;
                        }
                        let p = metas.get(&parent).copied().unwrap_or_default();
                        let c = metas.get(&child).copied().unwrap_or_default();
                        progress |= metas.entry(child).or_default().absorb(&p);
                        progress |= metas.entry(parent).or_default().absorb(&c);
                    }
                }
                NodeKind::Converge { diverged } => {
                    let out = match head_of(Ref::new(key, 0)) {
                        Some(h) => h,
                        None => continue,
                    };
                    for d in diverged.iter() {
                        let input = match head_of(*d) {
                            Some(h) => h,
                            None => continue,
                        };
                        if input == out {
                            continue;
                        }
                        let a = metas.get(&out).copied().unwrap_or_default();
                        let b = metas.get(&input).copied().unwrap_or_default();
                        progress |= metas.entry(input).or_default().absorb(&a);
                        progress |= metas.entry(out).or_default().absorb(&b);
                    }
                }
                _ => {}
            }
        }
        rounds += 1;
        if !progress {
            break;
        }
    }
    log::debug!("reify: fixed point after {} rounds", rounds);

    // write resolved fields back into placeholder construct arguments
    for &key in nodes {
        if !matches!(module.node(key).kind, NodeKind::Construct { .. })
            || !module.types.is_imageview(module.node(key).ty[0])
        {
            continue;
        }
        let head = match head_of(Ref::new(key, 0)) {
            Some(h) => h,
            None => continue,
        };
        let meta = match metas.get(&head) {
            Some(m) => *m,
            None => continue,
        };

        let args: Vec<Ref> = match &module.node(key).kind {
            NodeKind::Construct { args } => args.iter().copied().collect(),
            _ => unreachable!(),
        };
        let mut fill = |module: &mut IRModule, slot: usize, value: Option<Value>| {
            let (arg, value) = match (args.get(slot), value) {
                (Some(a), Some(v)) => (*a, v),
                _ => return None,
            };
            if !matches!(module.node(arg.node).kind, NodeKind::Placeholder) {
                return None;
            }
            let ty = module.ref_ty(arg);
            let c = module.make_constant(ty, value);
            Some((slot, c))
        };

        let mut fills: Vec<(usize, Ref)> = Vec::new();
        if let Some(f) = fill(module, F_EXTENT, meta.extent.map(Value::Extent)) {
            fills.push(f);
        }
        if let Some(f) = fill(module, F_FORMAT, meta.format.map(Value::Format)) {
            fills.push(f);
        }
        if let Some(f) = fill(module, F_SAMPLES, meta.samples.map(|s| Value::U64(s as u64))) {
            fills.push(f);
        }
        if let Some(f) = fill(module, F_LEVELS, meta.levels.map(|s| Value::U64(s as u64))) {
            fills.push(f);
        }
        if let Some(f) = fill(module, F_LAYERS, meta.layers.map(|s| Value::U64(s as u64))) {
            fills.push(f);
        }

        for (slot, c) in fills {
            new_nodes.push(c.node);
            if let NodeKind::Construct { args } = &mut module.node_mut(key).kind {
                args[slot] = c;
            }
        }
    }

    Ok(())
}
