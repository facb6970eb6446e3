//! Schedule execution.
//!
//! Walks the linearized item list, materializing transient resources through
//! the allocator tiers, emitting the barriers derived from the lowered sync,
//! and recording commands through the device backend. Work is recorded into
//! one command buffer per queue segment (transfer, compute, graphics, in
//! that order) with timeline-semaphore chaining between queues.

use fxhash::FxHashMap;

use crate::access::{
    is_write_use, to_use, Access, AccessFlags, DomainFlags, ImageLayout, PipelineStageFlags,
    ResourceUse,
};
use crate::alloc::{FrameAllocator, ResourceAllocator};
use crate::backend::{
    AttachmentDescription, DeviceBackend, FramebufferCreateInfo, ImageBarrier, LoadOp,
    RecordContext, RenderPassCreateInfo, StoreOp,
};
use crate::compile::Compiler;
use crate::error::{Error, Result};
use crate::format::Format;
use crate::ir::value::{eval_owned, Value};
use crate::ir::{IRModule, NodeKey, NodeKind, Ref};
use crate::resource::{
    ClearValue, CommandBufferHandle, Extent2D, Extent3D, FenceHandle, ImageAttachment,
    ImageCreateInfo, ImageHandle, ImageTiling, ImageType, ImageUsageFlags, ImageViewCreateInfo,
    SemaphoreHandle, SwapchainHandle,
};
use crate::typedesc::TypeKind;

pub struct SubmitResult {
    pub fence: Option<FenceHandle>,
    pub presented: bool,
}

struct RenderPassRegion {
    attachments: Vec<(usize, Ref, Access)>,
    extent: Extent2D,
}

struct Executor<'a> {
    module: &'a IRModule,
    compiler: &'a Compiler,
    frame: &'a FrameAllocator<'a>,
    backend: &'a dyn DeviceBackend,
    values: FxHashMap<Ref, Value>,
    last_use: FxHashMap<ImageHandle, ResourceUse>,
    swapchain_images: FxHashMap<ImageHandle, (SwapchainHandle, u32)>,
    acquire_semaphores: Vec<SemaphoreHandle>,
    extent_overrides: FxHashMap<NodeKey, Extent3D>,
    render_passes: FxHashMap<NodeKey, RenderPassRegion>,
    present: Option<(SwapchainHandle, u32, SemaphoreHandle)>,
}

fn undefined_use() -> ResourceUse {
    ResourceUse {
        stages: PipelineStageFlags::TOP_OF_PIPE,
        access: AccessFlags::empty(),
        layout: ImageLayout::Undefined,
    }
}

pub fn execute(
    module: &IRModule,
    compiler: &Compiler,
    frame: &FrameAllocator,
) -> Result<SubmitResult> {
    let mut exec = Executor {
        module,
        compiler,
        frame,
        backend: frame.backend(),
        values: FxHashMap::default(),
        last_use: FxHashMap::default(),
        swapchain_images: FxHashMap::default(),
        acquire_semaphores: Vec::new(),
        extent_overrides: FxHashMap::default(),
        render_passes: FxHashMap::default(),
        present: None,
    };
    exec.collect_render_passes();
    exec.infer_framebuffer_extents()?;
    exec.run()
}

impl<'a> Executor<'a> {
    //----------------------------------------------------------------------------------------------
    // framebuffer sizing

    fn collect_render_passes(&mut self) {
        for item in self.compiler.get_scheduled_nodes() {
            let args = match &self.module.node(item.node).kind {
                NodeKind::Call { args } => args.clone(),
                _ => continue,
            };
            let fn_ty = self.module.ref_ty(args[0]);
            let (first_parm, fn_args) = match self.module.types.kind(fn_ty) {
                TypeKind::OpaqueFn { args, .. } => (1usize, args),
                TypeKind::ShaderFn { args, .. } => (4usize, args),
                _ => continue,
            };
            let mut attachments = Vec::new();
            for i in first_parm..args.len() {
                if let TypeKind::Imbued { access, .. } =
                    self.module.types.kind(fn_args[i - first_parm])
                {
                    if crate::access::is_framebuffer_attachment(access) {
                        attachments.push((i, args[i], access));
                    }
                }
            }
            if !attachments.is_empty() {
                self.render_passes.insert(
                    item.node,
                    RenderPassRegion {
                        attachments,
                        extent: Extent2D::default(),
                    },
                );
            }
        }
    }

    /// The extent of an attachment, without allocating anything.
    fn peek_extent(&self, r: Ref) -> Option<Extent3D> {
        let node = self.module.node(r.node);
        match &node.kind {
            NodeKind::Construct { args } => {
                if let Some(e) = self.extent_overrides.get(&r.node) {
                    return Some(*e);
                }
                let extent = args.get(4)?;
                eval_owned(self.module, *extent)
                    .ok()?
                    .as_extent()
                    .filter(|e| !e.is_zero())
            }
            NodeKind::Acquire { values } => match values.get(r.index as usize) {
                Some(Value::Image(img)) if !img.extent.is_zero() => Some(img.extent),
                _ => None,
            },
            NodeKind::AcquireNextImage { swapchain } => {
                let v = eval_owned(self.module, *swapchain).ok()?;
                let sw = v.as_swapchain()?;
                Some(Extent3D::new(sw.extent.width, sw.extent.height, 1))
            }
            NodeKind::Slice { src, .. }
            | NodeKind::Use { src, .. }
            | NodeKind::LogicalCopy { src }
            | NodeKind::Clear { dst: src, .. } => self.peek_extent(*src),
            NodeKind::Converge { diverged } => self.peek_extent(diverged[0]),
            NodeKind::Call { args } => {
                // aliased result: look through to the argument
                let ret_ty = node.ty.get(r.index as usize)?;
                if let TypeKind::Aliased { ref_idx, .. } = self.module.types.kind(*ret_ty) {
                    self.peek_extent(args[ref_idx as usize])
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Repeating sweep over all render-pass regions: adopt any attachment
    /// extent that is already known, push it into the still-symbolic
    /// attachments, stop when everything is sized or a full sweep makes no
    /// progress.
    fn infer_framebuffer_extents(&mut self) -> Result<()> {
        loop {
            let mut progress = false;
            let mut incomplete = false;

            let keys: Vec<NodeKey> = self.render_passes.keys().copied().collect();
            for key in keys {
                let (known, attachments) = {
                    let rp = &self.render_passes[&key];
                    (
                        rp.extent.width != 0 && rp.extent.height != 0,
                        rp.attachments.clone(),
                    )
                };
                if known {
                    continue;
                }

                let mut found = None;
                for (_, r, _) in &attachments {
                    if let Some(e) = self.peek_extent(*r) {
                        found = Some(e);
                        break;
                    }
                }

                match found {
                    Some(e) => {
                        self.render_passes.get_mut(&key).unwrap().extent = Extent2D {
                            width: e.width,
                            height: e.height,
                        };
                        // size the attachments that still have no extent
                        for (_, r, _) in &attachments {
                            if self.peek_extent(*r).is_none() {
                                let head = self.defining_construct(*r);
                                if let Some(c) = head {
                                    self.extent_overrides.insert(c, e);
                                }
                            }
                        }
                        progress = true;
                    }
                    None => incomplete = true,
                }
            }

            if !incomplete {
                return Ok(());
            }
            if !progress {
                let offender = self
                    .render_passes
                    .iter()
                    .find(|(_, rp)| rp.extent.width == 0)
                    .map(|(k, _)| *k);
                let key = offender.expect("incomplete without offender");
                return Err(Error::ExtentUnresolved {
                    node: self.module.node(key).kind.name().to_owned(),
                    trace: self.module.format_source_location(key),
                });
            }
        }
    }

    /// The CONSTRUCT at the head of `r`'s storage chain, if any.
    fn defining_construct(&self, r: Ref) -> Option<NodeKey> {
        let links = self.compiler.links();
        let head = if links.try_link(r).is_some() {
            links.chain_head(r)
        } else {
            r
        };
        let def = links.try_link(head).and_then(|l| l.def)?;
        match self.module.node(def.node).kind {
            NodeKind::Construct { .. } => Some(def.node),
            NodeKind::Slice { .. } => {
                if let NodeKind::Slice { src, .. } = &self.module.node(def.node).kind {
                    self.defining_construct(*src)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    //----------------------------------------------------------------------------------------------
    // value resolution

    fn resolve(&mut self, r: Ref) -> Result<Value> {
        if let Some(v) = self.values.get(&r) {
            return Ok(v.clone());
        }
        let v = self.resolve_uncached(r)?;
        self.values.insert(r, v.clone());
        Ok(v)
    }

    fn cannot(&self, r: Ref) -> Error {
        Error::CannotEvaluate {
            node: self.module.node(r.node).kind.name().to_owned(),
            trace: self.module.format_source_location(r.node),
        }
    }

    fn resolve_uncached(&mut self, r: Ref) -> Result<Value> {
        let node = self.module.node(r.node);
        match &node.kind {
            NodeKind::Constant { value } | NodeKind::Import { value } => Ok(value.clone()),
            NodeKind::Acquire { values } => values
                .get(r.index as usize)
                .cloned()
                .ok_or_else(|| self.cannot(r)),
            NodeKind::AcquireNextImage { swapchain } => {
                let swapchain = *swapchain;
                let sw = self
                    .resolve(swapchain)?
                    .as_swapchain()
                    .cloned()
                    .ok_or_else(|| self.cannot(r))?;
                let sem = self.frame.allocate_semaphore()?;
                let index = self.backend.acquire_next_image(sw.handle, Some(sem))?;
                self.acquire_semaphores.push(sem);
                let img = sw
                    .images
                    .get(index as usize)
                    .cloned()
                    .ok_or_else(|| self.cannot(r))?;
                self.swapchain_images.insert(img.image, (sw.handle, index));
                log::debug!("acquired swapchain image {}", index);
                Ok(Value::Image(img))
            }
            NodeKind::Construct { args } => {
                let ty = node.ty[0];
                if self.module.types.hash_value(self.module.types.fully_stripped(ty))
                    == self.module.types.builtin_image
                {
                    let img = self.create_transient(r.node)?;
                    return Ok(Value::Image(img));
                }
                let args: Vec<Ref> = args.iter().copied().collect();
                let mut fields = Vec::with_capacity(args.len());
                for a in args {
                    fields.push(self.resolve(a)?);
                }
                Ok(Value::Composite(fields))
            }
            NodeKind::Call { args } => {
                let ret_ty = node.ty[r.index as usize];
                match self.module.types.kind(ret_ty) {
                    TypeKind::Aliased { ref_idx, .. } => {
                        let src = args[ref_idx as usize];
                        self.resolve(src)
                    }
                    _ => Err(self.cannot(r)),
                }
            }
            NodeKind::Slice {
                src, axis, start, count,
            } => {
                let (src, axis, start, count) = (*src, *axis, *start, *count);
                let src_v = self.resolve(src)?;
                let start = eval_owned(self.module, start)?
                    .as_u64()
                    .ok_or_else(|| self.cannot(r))?;
                let count = eval_owned(self.module, count)?
                    .as_u64()
                    .ok_or_else(|| self.cannot(r))?;
                match (axis, &src_v) {
                    (crate::ir::Axis::Field, Value::Composite(fields)) => fields
                        .get(start as usize)
                        .cloned()
                        .ok_or_else(|| self.cannot(r)),
                    (crate::ir::Axis::Mip, Value::Image(img)) => Ok(match r.index {
                        0 => Value::Image(img.mip_range(start as u32, count as u32)),
                        1 => {
                            if start == 0 {
                                Value::Image(img.mip_range(
                                    count as u32,
                                    img.level_count.saturating_sub(count as u32),
                                ))
                            } else {
                                Value::Image(img.mip_range(0, start as u32))
                            }
                        }
                        _ => src_v.clone(),
                    }),
                    (crate::ir::Axis::Layer, Value::Image(img)) => Ok(match r.index {
                        0 => Value::Image(img.layer_range(start as u32, count as u32)),
                        1 => {
                            if start == 0 {
                                Value::Image(img.layer_range(
                                    count as u32,
                                    img.layer_count.saturating_sub(count as u32),
                                ))
                            } else {
                                Value::Image(img.layer_range(0, start as u32))
                            }
                        }
                        _ => src_v.clone(),
                    }),
                    _ => Err(self.cannot(r)),
                }
            }
            NodeKind::Converge { diverged } => {
                let d0 = diverged[0];
                self.resolve(d0)
            }
            NodeKind::Use { src, .. }
            | NodeKind::LogicalCopy { src }
            | NodeKind::Cast { src } => {
                let src = *src;
                self.resolve(src)
            }
            NodeKind::Clear { dst, .. } => {
                let dst = *dst;
                self.resolve(dst)
            }
            NodeKind::Release { src, .. } => {
                let src = src
                    .get(r.index as usize)
                    .copied()
                    .ok_or_else(|| self.cannot(r))?;
                self.resolve(src)
            }
            NodeKind::Allocate { src, tier } => {
                let (src, _tier) = (*src, *tier);
                let ci = self.resolve(src)?;
                self.allocate_from_value(r, &ci)
            }
            NodeKind::GetCi { src } => {
                let src = *src;
                let img = self
                    .resolve(src)?
                    .as_image()
                    .cloned()
                    .ok_or_else(|| self.cannot(r))?;
                Ok(Value::Composite(vec![
                    Value::U64(0),
                    Value::ImageType(ImageType::D2),
                    Value::Tiling(ImageTiling::Optimal),
                    Value::Usage(ImageUsageFlags::empty()),
                    Value::Extent(img.extent),
                    Value::Format(img.format),
                    Value::U64(img.samples as u64),
                    Value::U64(img.level_count as u64),
                    Value::U64(img.layer_count as u64),
                ]))
            }
            NodeKind::GetIvMeta { src } => {
                let src = *src;
                let img = self
                    .resolve(src)?
                    .as_image()
                    .cloned()
                    .ok_or_else(|| self.cannot(r))?;
                Ok(Value::Composite(vec![
                    Value::U64(img.base_level as u64),
                    Value::U64(img.level_count as u64),
                    Value::U64(img.base_layer as u64),
                    Value::U64(img.layer_count as u64),
                    Value::Image(img.clone()),
                    Value::Format(img.format),
                ]))
            }
            NodeKind::GetAllocationSize { src } => {
                let src = *src;
                match self.resolve(src)? {
                    Value::Buffer(b) => Ok(Value::U64(b.size)),
                    Value::BufferCi(ci) => Ok(Value::U64(ci.size)),
                    _ => Err(self.cannot(r)),
                }
            }
            NodeKind::MathBinary { .. } => eval_owned(self.module, r),
            NodeKind::CompilePipeline { src } => {
                let src = *src;
                let v = self.resolve(src)?;
                match v {
                    Value::ShaderSource(bytes) => {
                        let pipeline =
                            self.frame
                                .global()
                                .allocate_pipeline(&crate::backend::PipelineCreateInfo {
                                    stages: vec![(crate::reflect::StageFlags::COMPUTE, bytes)],
                                    render_pass: None,
                                })?;
                        Ok(Value::Pipeline(pipeline))
                    }
                    v @ Value::Pipeline(_) => Ok(v),
                    _ => Err(self.cannot(r)),
                }
            }
            _ => Err(self.cannot(r)),
        }
    }

    fn create_transient(&mut self, key: NodeKey) -> Result<ImageAttachment> {
        let args: Vec<Ref> = match &self.module.node(key).kind {
            NodeKind::Construct { args } => args.iter().copied().collect(),
            _ => unreachable!(),
        };
        let field = |i: usize| -> Option<Value> {
            args.get(i).and_then(|r| eval_owned(self.module, *r).ok())
        };

        let mut extent = field(4).and_then(|v| v.as_extent()).unwrap_or_default();
        if extent.is_zero() {
            if let Some(e) = self.extent_overrides.get(&key) {
                extent = *e;
            }
        }
        if extent.is_zero() {
            return Err(Error::ExtentUnresolved {
                node: self.module.node(key).kind.name().to_owned(),
                trace: self.module.format_source_location(key),
            });
        }
        let format = field(5).and_then(|v| v.as_format()).unwrap_or(Format::Undefined);
        let samples = field(6).and_then(|v| v.as_u64()).unwrap_or(1) as u32;
        let levels = field(7).and_then(|v| v.as_u64()).unwrap_or(1) as u32;
        let layers = field(8).and_then(|v| v.as_u64()).unwrap_or(1) as u32;

        let mut usage = match field(3) {
            Some(Value::Usage(u)) => u,
            _ => ImageUsageFlags::empty(),
        };
        let links = self.compiler.links();
        if links.try_link(Ref::new(key, 0)).is_some() {
            let head = links.chain_head(Ref::new(key, 0));
            usage |= self.compiler.compute_usage(self.module, head);
        }

        let ci = ImageCreateInfo {
            flags: 0,
            image_type: ImageType::D2,
            tiling: ImageTiling::Optimal,
            usage,
            extent,
            format,
            samples,
            levels,
            layers,
        };
        let image = self.frame.allocate_image(&ci)?;
        let view = self.frame.allocate_image_view(&ImageViewCreateInfo {
            base_level: 0,
            level_count: levels,
            base_layer: 0,
            layer_count: layers,
            image,
            format,
        })?;
        log::debug!(
            "created transient attachment {}x{} {:?} usage {:?}",
            extent.width,
            extent.height,
            format,
            usage
        );
        Ok(ImageAttachment {
            image,
            view,
            extent,
            format,
            samples,
            base_level: 0,
            level_count: levels,
            base_layer: 0,
            layer_count: layers,
        })
    }

    fn allocate_from_value(&mut self, r: Ref, ci: &Value) -> Result<Value> {
        let ty = self
            .module
            .types
            .fully_stripped(self.module.node(r.node).ty[0]);
        let hash = self.module.types.hash_value(ty);
        if hash == self.module.types.builtin_buffer || matches!(ci, Value::BufferCi(_)) {
            let bci = match ci {
                Value::BufferCi(bci) => bci.clone(),
                Value::Composite(fields) => crate::resource::BufferCreateInfo {
                    mem_usage: crate::resource::MemoryUsage::GpuOnly,
                    usage: crate::resource::BufferUsageFlags::STORAGE_BUFFER,
                    size: fields.get(0).and_then(|f| f.as_u64()).unwrap_or(0),
                    alignment: 256,
                },
                _ => return Err(self.cannot(r)),
            };
            let buf = self.frame.allocate_buffer(&bci)?;
            return Ok(Value::Buffer(buf));
        }
        if hash == self.module.types.builtin_image_view {
            // view creation record: [base_level, level_count, base_layer,
            // layer_count, image, format]
            if let Value::Composite(fields) = ci {
                let img = fields
                    .get(4)
                    .and_then(|f| f.as_image())
                    .cloned()
                    .ok_or_else(|| self.cannot(r))?;
                let format = fields
                    .get(5)
                    .and_then(|f| f.as_format())
                    .unwrap_or(img.format);
                let base_level = fields.get(0).and_then(|f| f.as_u64()).unwrap_or(0) as u32;
                let mut level_count =
                    fields.get(1).and_then(|f| f.as_u64()).unwrap_or(u64::from(u32::MAX)) as u32;
                if level_count == crate::resource::REMAINING_LEVELS {
                    level_count = img.level_count;
                }
                let base_layer = fields.get(2).and_then(|f| f.as_u64()).unwrap_or(0) as u32;
                let mut layer_count =
                    fields.get(3).and_then(|f| f.as_u64()).unwrap_or(u64::from(u32::MAX)) as u32;
                if layer_count == crate::resource::REMAINING_LAYERS {
                    layer_count = img.layer_count;
                }
                let view = self.frame.allocate_image_view(&ImageViewCreateInfo {
                    base_level,
                    level_count,
                    base_layer,
                    layer_count,
                    image: img.image,
                    format,
                })?;
                let mut out = img;
                out.view = view;
                out.base_level = base_level;
                out.level_count = level_count;
                out.base_layer = base_layer;
                out.layer_count = layer_count;
                out.format = format;
                return Ok(Value::Image(out));
            }
            return Err(self.cannot(r));
        }
        if hash == self.module.types.builtin_image {
            // an image construct arrives here via ALLOCATE of its CI
            if let NodeKind::Construct { .. } = self.module.node(r.node).kind {
                return Ok(Value::Image(self.create_transient(r.node)?));
            }
        }
        Err(self.cannot(r))
    }

    //----------------------------------------------------------------------------------------------
    // recording

    fn barrier_to(&mut self, cb: CommandBufferHandle, img: &ImageAttachment, dst: ResourceUse) {
        let src = self
            .last_use
            .get(&img.image)
            .copied()
            .unwrap_or_else(undefined_use);
        if src.layout == dst.layout && !is_write_use(src) && !is_write_use(dst) {
            // read-to-read in the same layout needs no barrier
            return;
        }
        let barrier = ImageBarrier {
            image: img.image,
            src_stages: src.stages,
            src_access: src.access,
            old_layout: src.layout,
            dst_stages: dst.stages,
            dst_access: dst.access,
            new_layout: dst.layout,
            aspect: img.format.aspect(),
            base_level: img.base_level,
            level_count: img.level_count.max(1),
            base_layer: img.base_layer,
            layer_count: img.layer_count.max(1),
        };
        self.backend.cmd_pipeline_barrier(cb, &[barrier], &[]);
        self.last_use.insert(img.image, dst);
    }

    fn process_call(&mut self, cb: CommandBufferHandle, key: NodeKey, domain: DomainFlags) -> Result<()> {
        let args: Vec<Ref> = match &self.module.node(key).kind {
            NodeKind::Call { args } => args.iter().copied().collect(),
            _ => unreachable!(),
        };
        let fn_ty = self.module.ref_ty(args[0]);
        let (first_parm, fn_args) = match self.module.types.kind(fn_ty) {
            TypeKind::OpaqueFn { args, .. } => (1usize, args),
            TypeKind::ShaderFn { args, .. } => (4usize, args),
            _ => return Err(self.cannot(Ref::new(key, 0))),
        };

        let mut vals = Vec::with_capacity(args.len());
        for a in &args {
            vals.push(self.resolve(*a)?);
        }

        // barriers for every annotated argument
        let links = self.compiler.links();
        for i in first_parm..args.len() {
            let access = match self.module.types.kind(fn_args[i - first_parm]) {
                TypeKind::Imbued { access, .. } => access,
                _ => continue,
            };
            let parm = args[i];
            let dst = match links.try_link(parm) {
                Some(link) => {
                    if link.undef == Some(Ref::new(key, i as u32)) {
                        link.undef_sync.unwrap_or_else(|| to_use(access))
                    } else {
                        link.read_sync.unwrap_or_else(|| to_use(access))
                    }
                }
                None => to_use(access),
            };
            if let Value::Image(img) = &vals[i] {
                let img = img.clone();
                self.barrier_to(cb, &img, dst);
            }
        }

        // render pass region, if this call draws into attachments
        let region = self.render_passes.get(&key).map(|rp| {
            (
                rp.extent,
                rp.attachments
                    .iter()
                    .map(|(i, _, access)| (*i, *access))
                    .collect::<Vec<_>>(),
            )
        });
        let mut in_renderpass = false;
        if let Some((extent, attachments)) = region {
            let mut descs = Vec::new();
            let mut views = Vec::new();
            let mut clears = Vec::new();
            for (i, access) in &attachments {
                if let Value::Image(img) = &vals[*i] {
                    let layout = to_use(*access).layout;
                    descs.push(AttachmentDescription {
                        format: img.format,
                        samples: img.samples.max(1),
                        load_op: if self.last_use.contains_key(&img.image) {
                            LoadOp::Load
                        } else {
                            LoadOp::DontCare
                        },
                        store_op: StoreOp::Store,
                        initial_layout: layout,
                        final_layout: layout,
                    });
                    views.push(img.view);
                    clears.push(ClearValue::color(0.0, 0.0, 0.0, 0.0));
                }
            }
            let rp = self.frame.allocate_renderpass(&RenderPassCreateInfo {
                attachments: descs,
            })?;
            let fb = self.frame.allocate_framebuffer(&FramebufferCreateInfo {
                render_pass: rp,
                attachments: views,
                extent,
                layers: 1,
            })?;
            self.backend.cmd_begin_renderpass(cb, rp, fb, extent, &clears);
            in_renderpass = true;
        }

        match &vals[0] {
            Value::OpaqueFn(idx) => {
                let execute = self.module.callback(*idx);
                let mut ctx = RecordContext {
                    backend: self.backend,
                    cb,
                    args: &vals[1..],
                    domain,
                };
                execute(&mut ctx)?;
            }
            Value::Pipeline(pipeline) => {
                self.backend.cmd_bind_pipeline(cb, *pipeline);
                let dim = |i: usize| {
                    vals.get(i)
                        .and_then(|v| v.as_u64())
                        .unwrap_or(1)
                        .max(1) as u32
                };
                self.backend.cmd_dispatch(cb, dim(1), dim(2), dim(3));
            }
            _ => return Err(self.cannot(Ref::new(key, 0))),
        }

        if in_renderpass {
            self.backend.cmd_end_renderpass(cb);
        }
        Ok(())
    }

    fn process_clear(&mut self, cb: CommandBufferHandle, key: NodeKey) -> Result<()> {
        let (dst, value) = match &self.module.node(key).kind {
            NodeKind::Clear { dst, value } => (*dst, *value),
            _ => unreachable!(),
        };
        let img = self
            .resolve(dst)?
            .as_image()
            .cloned()
            .ok_or_else(|| self.cannot(dst))?;
        let clear = self
            .resolve(value)?
            .as_clear()
            .ok_or_else(|| self.cannot(value))?;
        let dst_use = self
            .compiler
            .links()
            .try_link(dst)
            .and_then(|l| l.undef_sync)
            .unwrap_or_else(|| to_use(Access::TransferClear));
        self.barrier_to(cb, &img, dst_use);
        self.backend
            .cmd_clear_color_image(cb, img.image, dst_use.layout, clear);
        Ok(())
    }

    fn process_release(&mut self, cb: CommandBufferHandle, key: NodeKey) -> Result<()> {
        let (src, dst_access) = match &self.module.node(key).kind {
            NodeKind::Release { src, dst_access, .. } => {
                (src.iter().copied().collect::<Vec<_>>(), *dst_access)
            }
            _ => unreachable!(),
        };
        for s in src {
            let v = self.resolve(s)?;
            if let Value::Image(img) = v {
                if dst_access != Access::None {
                    let img = img.clone();
                    self.barrier_to(cb, &img, to_use(dst_access));
                } else if let Some((sw, index)) = self.swapchain_images.get(&img.image).copied() {
                    // hand the image back to presentation
                    let present_use = ResourceUse {
                        stages: PipelineStageFlags::BOTTOM_OF_PIPE,
                        access: AccessFlags::empty(),
                        layout: ImageLayout::PresentSrcKhr,
                    };
                    self.barrier_to(cb, &img, present_use);
                    if self.present.is_none() {
                        let sem = self.frame.allocate_semaphore()?;
                        self.present = Some((sw, index, sem));
                    }
                }
            }
        }
        Ok(())
    }

    fn process_item(
        &mut self,
        cb: CommandBufferHandle,
        key: NodeKey,
        domain: DomainFlags,
    ) -> Result<()> {
        match self.module.node(key).kind {
            NodeKind::Call { .. } => self.process_call(cb, key, domain),
            NodeKind::Clear { .. } => self.process_clear(cb, key),
            NodeKind::Release { .. } => self.process_release(cb, key),
            NodeKind::Slice { .. } | NodeKind::Converge { .. } | NodeKind::Use { .. } => {
                // logical restructuring only; make sure the value exists so
                // later consumers see the right subresource window
                let _ = self.resolve(Ref::new(key, 0))?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    //----------------------------------------------------------------------------------------------

    fn run(&mut self) -> Result<SubmitResult> {
        let domains = [
            DomainFlags::TRANSFER_QUEUE,
            DomainFlags::COMPUTE_QUEUE,
            DomainFlags::GRAPHICS_QUEUE,
        ];
        let mut segments: Vec<(DomainFlags, Vec<NodeKey>)> = Vec::new();
        for &domain in &domains {
            let items: Vec<NodeKey> = self
                .compiler
                .get_scheduled_nodes()
                .filter(|i| i.scheduled_domain == domain)
                .map(|i| i.node)
                .collect();
            if !items.is_empty() {
                segments.push((domain, items));
            }
        }

        let timeline = if segments.len() > 1 {
            Some(self.frame.allocate_timeline_semaphore(0)?)
        } else {
            None
        };
        let mut timeline_value: u64 = 0;
        let mut fence = None;
        let last_segment = segments.len().saturating_sub(1);

        for (si, (domain, items)) in segments.iter().enumerate() {
            let cb = self.frame.allocate_command_buffer(*domain)?;
            self.backend.begin_command_buffer(cb)?;
            for &key in items {
                self.process_item(cb, key, *domain)?;
            }
            self.backend.end_command_buffer(cb)?;

            let mut waits: Vec<(SemaphoreHandle, u64)> = Vec::new();
            for sem in self.acquire_semaphores.drain(..) {
                waits.push((sem, 0));
            }
            if let (Some(t), true) = (timeline, timeline_value > 0) {
                waits.push((t, timeline_value));
            }

            let mut signals: Vec<(SemaphoreHandle, u64)> = Vec::new();
            if let (Some(t), true) = (timeline, si < last_segment) {
                timeline_value += 1;
                signals.push((t, timeline_value));
            }
            if si == last_segment {
                if let Some((_, _, present_sem)) = self.present {
                    signals.push((present_sem, 0));
                }
                let f = self.frame.allocate_fence()?;
                self.frame.pending_fence(f);
                fence = Some(f);
            }

            log::debug!(
                "submit: {} items on {}",
                items.len(),
                domain.to_str()
            );
            self.backend
                .queue_submit(*domain, &[cb], &waits, &signals, if si == last_segment { fence } else { None })?;
        }

        let mut presented = false;
        if let Some((sw, index, sem)) = self.present {
            self.backend.queue_present(sw, index, &[sem])?;
            presented = true;
        }

        Ok(SubmitResult { fence, presented })
    }
}
