//! Allocator hierarchy behavior against the recording backend.

mod common;

use std::sync::Arc;

use common::{Event, MockBackend};
use framegraph::alloc::DescriptorSetPool;
use framegraph::backend::{
    DescriptorSetLayoutBinding, DescriptorSetLayoutCreateInfo, DescriptorType,
};
use framegraph::reflect::StageFlags;
use framegraph::resource::*;
use framegraph::{
    Access, Compiler, DomainFlags, GlobalAllocator, IRModule, LinearAllocator, Ref,
    ResourceAllocator, RuntimeOptions, Value,
};

fn global(backend: Arc<MockBackend>) -> GlobalAllocator {
    GlobalAllocator::new(backend, RuntimeOptions::default())
}

#[test]
fn linear_allocator_bumps_and_grows() {
    let backend = MockBackend::new();
    let global = global(backend.clone());
    let mut linear = LinearAllocator::new(
        1024,
        BufferUsageFlags::UNIFORM_BUFFER,
        MemoryUsage::CpuToGpu,
    );

    let a = linear.allocate(&global, 256, 64).unwrap();
    let b = linear.allocate(&global, 256, 64).unwrap();
    // same block, bumped offset
    assert_eq!(a.buffer, b.buffer);
    assert_eq!(a.offset, 0);
    assert_eq!(b.offset, 256);

    // exhausting the block grabs a new one
    let c = linear.allocate(&global, 768, 64).unwrap();
    assert_ne!(c.buffer, a.buffer);

    // freeing is a no-op; reset makes the space reusable without new blocks
    let blocks_before = backend
        .events()
        .iter()
        .filter(|e| matches!(e, Event::CreateBuffer { .. }))
        .count();
    linear.reset();
    let d = linear.allocate(&global, 256, 64).unwrap();
    assert_eq!(d.buffer, a.buffer);
    assert_eq!(d.offset, 0);
    let blocks_after = backend
        .events()
        .iter()
        .filter(|e| matches!(e, Event::CreateBuffer { .. }))
        .count();
    assert_eq!(blocks_before, blocks_after);

    // oversized requests get a dedicated block
    let big = linear.allocate(&global, 4096, 64).unwrap();
    assert_eq!(big.size, 4096);
}

#[test]
fn descriptor_pool_grows_by_doubling() {
    let backend = MockBackend::new();
    let global = global(backend.clone());
    let layout = global
        .backend()
        .create_descriptor_set_layout(&DescriptorSetLayoutCreateInfo {
            bindings: vec![DescriptorSetLayoutBinding {
                binding: 0,
                descriptor_type: DescriptorType::UniformBuffer,
                count: 1,
                stages: StageFlags::COMPUTE,
            }],
        })
        .unwrap();

    let pool = DescriptorSetPool::new(layout, vec![(DescriptorType::UniformBuffer, 1)]);

    // pool sizes go 1, 2, 4, ...: seven acquisitions need three grows
    let mut seen = Vec::new();
    for _ in 0..7 {
        let set = pool.acquire(global.backend()).unwrap();
        assert!(!seen.contains(&set), "sets must be distinct");
        seen.push(set);
    }

    // recycled sets are served again without growing
    pool.recycle(seen[0]);
    let again = pool.acquire(global.backend()).unwrap();
    assert_eq!(again, seen[0]);
}

#[test]
fn overlapping_buffer_acquires_are_unioned_not_rejected() {
    let mut module = IRModule::new();
    let buf_ty = module.types.ty_buffer;

    let buf = |addr: u64| Buffer {
        buffer: BufferHandle(addr >> 4),
        offset: 0,
        size: 256,
        device_address: addr,
        host_visible: false,
    };
    let b1 = module.make_acquire(&[buf_ty], vec![Value::Buffer(buf(0x1000))]);
    // overlaps the first range
    let b2 = module.make_acquire(&[buf_ty], vec![Value::Buffer(buf(0x1080))]);

    let imbued = module.types.make_imbued_ty(buf_ty, Access::ComputeWrite);
    let aliased = module.types.make_aliased_ty(buf_ty, 1);
    let fn_ty = module
        .types
        .make_opaque_fn_ty(vec![imbued], vec![aliased], DomainFlags::ANY);
    let f = module.make_declare_fn(fn_ty, Box::new(|_| Ok(())));
    let w1 = module.make_call(f, &[b1]);
    let w2 = module.make_call(f, &[b2]);
    let released = module.make_release(&[w1, w2], Access::None, DomainFlags::HOST);
    module.hold(released);

    // two live acquisitions of overlapping device memory would be an error;
    // implicit linking unions them into a single view instead
    let mut compiler = Compiler::new();
    compiler
        .compile(
            &mut module,
            &[released],
            &framegraph::compile::RenderGraphCompileOptions::default(),
        )
        .unwrap();

    let unioned = compiler.get_use_chains().iter().any(|head: &Ref| {
        use framegraph::{NodeKind, TypeKind};
        match &module.node(head.node).kind {
            NodeKind::Construct { .. } => matches!(
                module.types.kind(module.ref_ty(*head)),
                TypeKind::Union { .. }
            ),
            _ => false,
        }
    });
    let any_union = module.keys().iter().any(|k| {
        use framegraph::TypeKind;
        let node = module.node(*k);
        !node.ty.is_empty() && matches!(module.types.kind(node.ty[0]), TypeKind::Union { .. })
    });
    assert!(unioned || any_union, "a union view must have been synthesized");
}
