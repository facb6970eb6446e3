//! End-to-end graph scenarios against the recording backend.

mod common;

use std::sync::Arc;

use common::{test_swapchain, Event, MockBackend};
use framegraph::compile::RenderGraphCompileOptions;
use framegraph::resource::*;
use framegraph::{
    execute, Access, Axis, Compiler, DomainFlags, Error, GlobalAllocator, IRModule, ImageLayout,
    NodeKind, Ref, ResourceAllocator, RingFrameAllocator, RuntimeOptions, Value,
};

fn runtime(backend: Arc<MockBackend>) -> RingFrameAllocator {
    let options = RuntimeOptions {
        frames_in_flight: 2,
        ..Default::default()
    };
    let global = Arc::new(GlobalAllocator::new(backend, options));
    RingFrameAllocator::new(global)
}

fn image_fn(module: &mut IRModule, access: Access) -> Ref {
    let img_ty = module.types.ty_image;
    let imbued = module.types.make_imbued_ty(img_ty, access);
    let aliased = module.types.make_aliased_ty(img_ty, 1);
    let fn_ty = module
        .types
        .make_opaque_fn_ty(vec![imbued], vec![aliased], DomainFlags::ANY);
    module.make_declare_fn(
        fn_ty,
        Box::new(|ctx| {
            ctx.backend.cmd_dispatch(ctx.cb, 1, 1, 1);
            Ok(())
        }),
    )
}

fn plain_image(handle: u64, levels: u32) -> ImageAttachment {
    ImageAttachment {
        image: ImageHandle(handle),
        view: ImageViewHandle(handle + 1),
        extent: Extent3D::new(64, 64, 1),
        format: framegraph::Format::R8g8b8a8Unorm,
        samples: 1,
        base_level: 0,
        level_count: levels,
        base_layer: 0,
        layer_count: 1,
    }
}

//--------------------------------------------------------------------------------------------------

#[test]
fn single_pass_clear_and_present() {
    let _ = pretty_env_logger::try_init();
    let backend = MockBackend::new();
    let mut ring = runtime(backend.clone());

    let mut module = IRModule::new();
    let sw = test_swapchain();
    let sw_ty = module.types.ty_swapchain;
    let sw_ref = module.make_acquire(&[sw_ty], vec![Value::Swapchain(sw.clone())]);
    let img = module.make_acquire_next_image(sw_ref);
    let mem_ty = module.types.ty_memory;
    let clear_value = module.make_constant(
        mem_ty,
        Value::Clear(ClearValue::color(0.3, 0.5, 0.3, 1.0)),
    );
    let cleared = module.make_clear(img, clear_value);
    let released = module.make_release(&[cleared], Access::None, DomainFlags::PE);
    module.hold(released);

    let mut compiler = Compiler::new();
    compiler
        .compile(&mut module, &[released], &RenderGraphCompileOptions::default())
        .unwrap();

    let frame = ring.next_frame().unwrap();
    let result = execute(&module, &compiler, &frame).unwrap();
    assert!(result.presented);
    assert!(result.fence.is_some());

    // one graphics submission, no compute or transfer work
    assert_eq!(backend.submits(), vec![DomainFlags::GRAPHICS_QUEUE]);

    // the first swapchain image went undefined -> transfer-dst -> present
    let image = sw.images[0].image;
    assert_eq!(
        backend.layout_transitions(image),
        vec![
            (ImageLayout::Undefined, ImageLayout::TransferDstOptimal),
            (ImageLayout::TransferDstOptimal, ImageLayout::PresentSrcKhr),
        ]
    );

    let events = backend.events();
    assert!(events.contains(&Event::ClearColor {
        image,
        layout: ImageLayout::TransferDstOptimal,
        value: ClearValue::color(0.3, 0.5, 0.3, 1.0),
    }));
    assert!(events.contains(&Event::QueuePresent {
        swapchain: sw.handle,
        index: 0,
    }));
}

#[test]
fn double_write_is_rewritten_into_a_chain() {
    let backend = MockBackend::new();
    let mut ring = runtime(backend.clone());

    let mut module = IRModule::new();
    let img_ty = module.types.ty_image;
    let a = module.make_acquire(&[img_ty], vec![Value::Image(plain_image(42, 1))]);
    let f = image_fn(&mut module, Access::ComputeWrite);
    let w1 = module.make_call(f, &[a]);
    // second write against the stale ref; implicit linking must rewrite it
    let w2 = module.make_call(f, &[a]);
    let released = module.make_release(&[w2], Access::None, DomainFlags::HOST);
    module.hold(released);

    let mut compiler = Compiler::new();
    compiler
        .compile(&mut module, &[released], &RenderGraphCompileOptions::default())
        .unwrap();

    // the second call now consumes the first call's result
    match &module.node(w2.node).kind {
        NodeKind::Call { args } => assert_eq!(args[1], w1),
        other => panic!("unexpected kind {:?}", other.name()),
    }

    // schedule holds exactly the two writes plus the release, in link order
    let order: Vec<_> = compiler.get_scheduled_nodes().map(|i| i.node).collect();
    let p1 = order.iter().position(|n| *n == w1.node).unwrap();
    let p2 = order.iter().position(|n| *n == w2.node).unwrap();
    let pr = order.iter().position(|n| *n == released.node).unwrap();
    assert!(p1 < p2 && p2 < pr);

    let frame = ring.next_frame().unwrap();
    execute(&module, &compiler, &frame).unwrap();
    let dispatches = backend
        .events()
        .iter()
        .filter(|e| matches!(e, Event::Dispatch { .. }))
        .count();
    assert_eq!(dispatches, 2);
}

#[test]
fn slice_and_reconverge_before_release() {
    let backend = MockBackend::new();
    let mut ring = runtime(backend.clone());

    let mut module = IRModule::new();
    let img_ty = module.types.ty_image;
    let a = module.make_acquire(&[img_ty], vec![Value::Image(plain_image(50, 4))]);
    let start = module.make_constant_u64(0);
    let count = module.make_constant_u64(2);
    let sliced = module.make_slice(img_ty, a, Axis::Mip, start, count);

    let writer = image_fn(&mut module, Access::ComputeWrite);
    let written = module.make_call(writer, &[sliced]);
    let sampler = image_fn(&mut module, Access::FragmentSampled);
    let sampled = module.make_call(sampler, &[sliced.sibling(1)]);

    let released = module.make_release(&[written, sampled], Access::None, DomainFlags::HOST);
    module.hold(released);

    let mut compiler = Compiler::new();
    compiler
        .compile(&mut module, &[released], &RenderGraphCompileOptions::default())
        .unwrap();

    // forced convergence re-merged the diverged image before the release
    let order: Vec<_> = compiler.get_scheduled_nodes().map(|i| i.node).collect();
    let release_pos = order.iter().position(|n| *n == released.node).unwrap();
    let converge_pos = order
        .iter()
        .position(|n| matches!(module.node(*n).kind, NodeKind::Converge { .. }))
        .expect("a synthesized converge must be scheduled");
    assert!(converge_pos < release_pos);

    let frame = ring.next_frame().unwrap();
    execute(&module, &compiler, &frame).unwrap();
}

#[test]
fn duplicate_acquire_is_rejected() {
    let mut module = IRModule::new();
    let sw = test_swapchain();
    let sw_ty = module.types.ty_swapchain;
    let s1 = module.make_acquire(&[sw_ty], vec![Value::Swapchain(sw.clone())]);
    let s2 = module.make_acquire(&[sw_ty], vec![Value::Swapchain(sw.clone())]);
    let i1 = module.make_acquire_next_image(s1);
    let i2 = module.make_acquire_next_image(s2);
    let mem_ty = module.types.ty_memory;
    let cv = module.make_constant(mem_ty, Value::Clear(ClearValue::color(0.0, 0.0, 0.0, 1.0)));
    let c1 = module.make_clear(i1, cv);
    let c2 = module.make_clear(i2, cv);
    let released = module.make_release(&[c1, c2], Access::None, DomainFlags::PE);
    module.hold(released);

    let mut compiler = Compiler::new();
    let err = compiler
        .compile(&mut module, &[released], &RenderGraphCompileOptions::default())
        .unwrap_err();
    match err {
        Error::DuplicatedResource {
            trace,
            previous_trace,
            ..
        } => {
            // both acquisition sites are reported
            assert!(trace.contains("graph.rs"));
            assert!(previous_trace.contains("graph.rs"));
            assert_ne!(trace, previous_trace);
        }
        other => panic!("expected a duplicated-resource error, got {}", other),
    }
}

#[test]
fn queue_inference_falls_back_to_graphics() {
    let backend = MockBackend::new();
    let mut ring = runtime(backend.clone());

    let mut module = IRModule::new();
    let img_ty = module.types.ty_image;
    let a = module.make_acquire(&[img_ty], vec![Value::Image(plain_image(60, 1))]);
    let f = image_fn(&mut module, Access::ComputeRW);
    let w1 = module.make_call(f, &[a]);
    let w2 = module.make_call(f, &[w1]);
    let released = module.make_release(&[w2], Access::None, DomainFlags::HOST);
    module.hold(released);

    let mut compiler = Compiler::new();
    compiler
        .compile(&mut module, &[released], &RenderGraphCompileOptions::default())
        .unwrap();

    // no hints anywhere: everything lands on the graphics queue
    for item in compiler.get_scheduled_nodes() {
        assert_eq!(item.scheduled_domain, DomainFlags::GRAPHICS_QUEUE);
    }
    assert_eq!(compiler.transfer_partition().count(), 0);
    assert_eq!(compiler.compute_partition().count(), 0);
    assert_eq!(
        compiler.graphics_partition().count(),
        compiler.get_scheduled_nodes().count()
    );

    let frame = ring.next_frame().unwrap();
    execute(&module, &compiler, &frame).unwrap();
    assert_eq!(backend.submits(), vec![DomainFlags::GRAPHICS_QUEUE]);
}

#[test]
fn frame_recycle_waits_on_the_slot_fence() {
    let backend = MockBackend::new();
    let mut ring = runtime(backend.clone());

    // frame 0 leaves a pending fence in slot 0
    let f0 = {
        let frame = ring.next_frame().unwrap();
        let fence = frame.allocate_fence().unwrap();
        frame.pending_fence(fence);
        fence
    };
    // frame 1 uses slot 1, no wait on slot 0
    {
        let frame = ring.next_frame().unwrap();
        let fence = frame.allocate_fence().unwrap();
        frame.pending_fence(fence);
    }
    let waits_before: Vec<_> = backend
        .events()
        .iter()
        .filter(|e| matches!(e, Event::WaitFences { .. }))
        .cloned()
        .collect();
    assert!(waits_before.is_empty());

    // frame 2 recycles slot 0: it must observe frame 0's fence first
    let frame = ring.next_frame().unwrap();
    let waits: Vec<_> = backend
        .events()
        .iter()
        .filter_map(|e| match e {
            Event::WaitFences { fences } => Some(fences.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(waits, vec![vec![f0]]);

    // the per-frame state was reset: the recycled slot serves the same fence
    let fence = frame.allocate_fence().unwrap();
    assert_eq!(fence, f0);
}

#[test]
fn recompilation_is_stable() {
    let mut module = IRModule::new();
    let img_ty = module.types.ty_image;
    let a = module.make_acquire(&[img_ty], vec![Value::Image(plain_image(42, 1))]);
    let f = image_fn(&mut module, Access::ComputeWrite);
    let _w1 = module.make_call(f, &[a]);
    let w2 = module.make_call(f, &[a]);
    let released = module.make_release(&[w2], Access::None, DomainFlags::HOST);
    module.hold(released);

    let mut compiler = Compiler::new();
    compiler
        .compile(&mut module, &[released], &RenderGraphCompileOptions::default())
        .unwrap();
    let first: Vec<_> = compiler.get_scheduled_nodes().map(|i| i.node).collect();
    let frontier = module.link_frontier;

    // the second invocation finds the frontier covering the whole module and
    // reproduces the same schedule
    compiler
        .compile(&mut module, &[released], &RenderGraphCompileOptions::default())
        .unwrap();
    let second: Vec<_> = compiler.get_scheduled_nodes().map(|i| i.node).collect();
    assert_eq!(first, second);
    assert_eq!(module.link_frontier, frontier);
}
