//! Constant values and the host evaluator.
//!
//! The evaluator is a pure interpreter over the constant-class subset of the
//! IR. Results are allocated into a caller-provided scratch arena so a pass
//! can evaluate freely and drop everything at once; evaluation has no side
//! effects and is idempotent.

use std::sync::Arc;

use ordered_float::NotNan;
use typed_arena::Arena;

use crate::error::{Error, Result};
use crate::format::Format;
use crate::ir::{Axis, BinaryOp, IRModule, NodeKind, Ref};
use crate::resource::{
    Buffer, BufferCreateInfo, ClearValue, Extent3D, ImageAttachment, ImageTiling, ImageType,
    ImageUsageFlags, ImageViewCreateInfo, MemoryUsage, PipelineHandle, SwapchainRef,
};

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    U64(u64),
    F32(NotNan<f32>),
    Extent(Extent3D),
    Format(Format),
    Usage(ImageUsageFlags),
    MemUsage(MemoryUsage),
    ImageType(ImageType),
    Tiling(ImageTiling),
    Clear(ClearValue),
    Image(ImageAttachment),
    ImageViewCi(ImageViewCreateInfo),
    BufferCi(BufferCreateInfo),
    Buffer(Buffer),
    Swapchain(SwapchainRef),
    Pipeline(PipelineHandle),
    ShaderSource(Arc<[u8]>),
    OpaqueFn(usize),
    Composite(Vec<Value>),
}

impl Value {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_extent(&self) -> Option<Extent3D> {
        match self {
            Value::Extent(e) => Some(*e),
            _ => None,
        }
    }

    pub fn as_format(&self) -> Option<Format> {
        match self {
            Value::Format(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&ImageAttachment> {
        match self {
            Value::Image(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&Buffer> {
        match self {
            Value::Buffer(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_swapchain(&self) -> Option<&SwapchainRef> {
        match self {
            Value::Swapchain(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_clear(&self) -> Option<ClearValue> {
        match self {
            Value::Clear(c) => Some(*c),
            _ => None,
        }
    }
}

fn cannot_evaluate(module: &IRModule, r: Ref) -> Error {
    Error::CannotEvaluate {
        node: module.node(r.node).kind.name().to_owned(),
        trace: module.format_source_location(r.node),
    }
}

/// Evaluate a ref on the host. Fails with [`Error::CannotEvaluate`] if the
/// value depends on anything that only exists at execution time.
pub fn eval<'a>(module: &IRModule, arena: &'a Arena<Value>, r: Ref) -> Result<&'a Value> {
    let node = module.node(r.node);
    let v = match &node.kind {
        NodeKind::Constant { value } | NodeKind::Import { value } => value.clone(),
        NodeKind::Acquire { values } => values
            .get(r.index as usize)
            .cloned()
            .ok_or_else(|| cannot_evaluate(module, r))?,
        NodeKind::Construct { args } => {
            let mut fields = Vec::with_capacity(args.len());
            for a in args {
                fields.push(eval(module, arena, *a)?.clone());
            }
            Value::Composite(fields)
        }
        NodeKind::MathBinary { op, a, b } => {
            let a = eval(module, arena, *a)?
                .as_u64()
                .ok_or_else(|| cannot_evaluate(module, r))?;
            let b = eval(module, arena, *b)?
                .as_u64()
                .ok_or_else(|| cannot_evaluate(module, r))?;
            let v = match op {
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Sub => a.wrapping_sub(b),
                BinaryOp::Mul => a.wrapping_mul(b),
                BinaryOp::Div => a.checked_div(b).ok_or_else(|| cannot_evaluate(module, r))?,
                BinaryOp::Mod => a.checked_rem(b).ok_or_else(|| cannot_evaluate(module, r))?,
                BinaryOp::Min => a.min(b),
                BinaryOp::Max => a.max(b),
            };
            Value::U64(v)
        }
        NodeKind::Slice {
            src, axis, start, count,
        } => {
            let start = eval(module, arena, *start)?
                .as_u64()
                .ok_or_else(|| cannot_evaluate(module, r))?;
            let count = eval(module, arena, *count)?
                .as_u64()
                .ok_or_else(|| cannot_evaluate(module, r))?;
            let src_v = eval(module, arena, *src)?;
            match (axis, src_v) {
                (Axis::Field, Value::Composite(fields)) => match r.index {
                    0 => fields
                        .get(start as usize)
                        .cloned()
                        .ok_or_else(|| cannot_evaluate(module, r))?,
                    _ => return Err(cannot_evaluate(module, r)),
                },
                (Axis::Mip, Value::Image(img)) => match r.index {
                    0 => Value::Image(img.mip_range(start as u32, count as u32)),
                    1 => {
                        // remainder: everything outside the window
                        if start == 0 {
                            Value::Image(img.mip_range(
                                count as u32,
                                img.level_count.saturating_sub(count as u32),
                            ))
                        } else {
                            Value::Image(img.mip_range(0, start as u32))
                        }
                    }
                    _ => Value::Image(img.clone()),
                },
                (Axis::Layer, Value::Image(img)) => match r.index {
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
                    _ => Value::Image(img.clone()),
                },
                _ => return Err(cannot_evaluate(module, r)),
            }
        }
        NodeKind::Cast { src } | NodeKind::LogicalCopy { src } | NodeKind::Use { src, .. } => {
            eval(module, arena, *src)?.clone()
        }
        NodeKind::Converge { diverged } => eval(module, arena, diverged[0])?.clone(),
        NodeKind::GetAllocationSize { src } => {
            let v = eval(module, arena, *src)?;
            match v {
                Value::Buffer(b) => Value::U64(b.size),
                Value::BufferCi(ci) => Value::U64(ci.size),
                _ => return Err(cannot_evaluate(module, r)),
            }
        }
        _ => return Err(cannot_evaluate(module, r)),
    };
    Ok(arena.alloc(v))
}

/// Evaluate into an owned value with a throwaway arena.
pub fn eval_owned(module: &IRModule, r: Ref) -> Result<Value> {
    let arena = Arena::new();
    eval(module, &arena, r).map(|v| v.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IRModule;

    #[test]
    fn eval_is_idempotent() {
        let mut m = IRModule::new();
        let a = m.make_constant_u64(40);
        let b = m.make_constant_u64(2);
        let c = m.make_math_binary(BinaryOp::Add, a, b);
        let first = eval_owned(&m, c).unwrap();
        let second = eval_owned(&m, c).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Value::U64(42));
    }

    #[test]
    fn field_extract_evaluates_through_constructs() {
        let mut m = IRModule::new();
        let x = m.make_constant_u64(7);
        let y = m.make_constant_u64(9);
        let u32_ty = m.types.ty_u32;
        let pair_ty = m
            .types
            .make_composite_ty("pair", vec![u32_ty, u32_ty], vec!["x", "y"]);
        let pair = m.make_construct(pair_ty, &[x, y]);
        let second = m.make_extract(pair, 1);
        assert_eq!(eval_owned(&m, second).unwrap(), Value::U64(9));
    }

    #[test]
    fn placeholders_do_not_evaluate() {
        let mut m = IRModule::new();
        let ty = m.types.ty_u32;
        let p = m.make_placeholder(ty);
        assert!(eval_owned(&m, p).is_err());
    }
}
