//! Frame graph compiler and executor.
//!
//! Client code composes a computation as a graph of passes over images and
//! buffers, each argument annotated with an access. The compiler analyzes
//! the graph, repairs it into SSA form, schedules work onto queues, infers
//! missing sizes and layouts, lowers synchronization, and linearizes
//! everything into a command stream; the executor replays that stream
//! through a narrow device backend, drawing transient resources from a
//! frame-in-flight allocator ring.
//!
//! Submission order on a queue follows link order; between queues the
//! compiler lowers dependencies to semaphores. Compilation either succeeds
//! wholesale or returns an error pointing at the offending node's build
//! site - nothing is submitted on failure.

pub mod access;
pub mod alloc;
pub mod backend;
pub mod cache;
pub mod compile;
pub mod error;
pub mod exec;
pub mod format;
pub mod ir;
pub mod radix;
pub mod reflect;
pub mod resource;
pub mod typedesc;

pub use self::access::{
    is_read_access, is_write_access, to_use, Access, AccessFlags, DomainFlags, ImageLayout,
    PipelineStageFlags, ResourceUse,
};
pub use self::alloc::{
    FrameAllocator, GlobalAllocator, LinearAllocator, ResourceAllocator, RingFrameAllocator,
    RuntimeOptions,
};
pub use self::backend::{DeviceBackend, ExecFn, RecordContext};
pub use self::compile::{
    CompileCallbacks, Compiler, RenderGraphCompileOptions, ScheduledItem,
};
pub use self::error::{Error, Result};
pub use self::exec::{execute, SubmitResult};
pub use self::format::Format;
pub use self::ir::{AllocTier, Axis, BinaryOp, IRModule, NodeKind, Ref, Value};
pub use self::resource::*;
pub use self::typedesc::{TypeId, TypeKind, TypeRegistry};
