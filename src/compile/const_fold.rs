//! Compute-class assignment and constant folding.
//!
//! Each node kind starts from a static class (placeholder < constant < host <
//! device) and escalates to the maximum class of its inputs. Along the way,
//! any input that is constant-class but not yet a CONSTANT node is evaluated
//! on the host and replaced by a fresh constant.

use crate::access::DomainFlags;
use crate::error::Result;
use crate::ir::value::eval_owned;
use crate::ir::{IRModule, NodeKey, NodeKind, Ref};
use crate::typedesc::TypeKind;

fn kind_class(kind: &NodeKind) -> DomainFlags {
    match kind {
        NodeKind::Placeholder | NodeKind::Set { .. } | NodeKind::Garbage => DomainFlags::PLACEHOLDER,
        NodeKind::Constant { .. }
        | NodeKind::Construct { .. }
        | NodeKind::Slice { .. }
        | NodeKind::Converge { .. }
        | NodeKind::Use { .. }
        | NodeKind::LogicalCopy { .. }
        | NodeKind::Cast { .. }
        | NodeKind::MathBinary { .. }
        | NodeKind::CompilePipeline { .. }
        | NodeKind::GetAllocationSize { .. }
        | NodeKind::GetCi { .. }
        | NodeKind::GetIvMeta { .. } => DomainFlags::CONSTANT,
        NodeKind::Import { .. }
        | NodeKind::Call { .. }
        | NodeKind::Acquire { .. }
        | NodeKind::Release { .. }
        | NodeKind::AcquireNextImage { .. }
        | NodeKind::Allocate { .. } => DomainFlags::HOST,
        NodeKind::Clear { .. } => DomainFlags::DEVICE,
    }
}

pub(crate) fn run(
    module: &mut IRModule,
    nodes: &[NodeKey],
    new_nodes: &mut Vec<NodeKey>,
) -> Result<()> {
    // `nodes` is in index order, which is a topological order of the graph,
    // so inputs are classified before their consumers
    for &key in nodes {
        let mut class = kind_class(&module.node(key).kind);

        if let NodeKind::Call { args } = &module.node(key).kind {
            let fn_ty = module.ref_ty(args[0]);
            let execute_on = match module.types.kind(fn_ty) {
                TypeKind::OpaqueFn { execute_on, .. } | TypeKind::ShaderFn { execute_on, .. } => {
                    execute_on
                }
                _ => DomainFlags::ANY,
            };
            if execute_on != DomainFlags::ANY {
                class = execute_on;
            }
        }

        let mut args: Vec<Ref> = Vec::new();
        module.node(key).kind.for_each_arg(|r| args.push(r));

        let mut replacements: Vec<(usize, Ref)> = Vec::new();
        for (i, arg) in args.iter().enumerate() {
            let input_class = module.node(arg.node).class;
            if input_class.bits() > class.bits() {
                class = input_class;
            }
            let is_const_node = matches!(module.node(arg.node).kind, NodeKind::Constant { .. });
            if input_class == DomainFlags::CONSTANT && !is_const_node {
                match eval_owned(module, *arg) {
                    Ok(value) => {
                        let ty = module.ref_ty(*arg);
                        let c = module.make_constant(ty, value);
                        new_nodes.push(c.node);
                        replacements.push((i, c));
                    }
                    Err(_) => {
                        // not actually host-evaluable (placeholder upstream);
                        // leave the argument alone
                    }
                }
            }
        }

        if !replacements.is_empty() {
            let mut it = replacements.into_iter().peekable();
            let mut idx = 0;
            module.node_mut(key).kind.for_each_arg_mut(|r| {
                if let Some((i, rep)) = it.peek() {
                    if *i == idx {
                        *r = *rep;
                        it.next();
                    }
                }
                idx += 1;
            });
        }

        module.node_mut(key).class = class;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::value::Value;
    use crate::ir::BinaryOp;

    #[test]
    fn arithmetic_over_constants_folds_to_a_constant_node() {
        let mut m = IRModule::new();
        let a = m.make_constant_u64(6);
        let b = m.make_constant_u64(7);
        let prod = m.make_math_binary(BinaryOp::Mul, a, b);
        // a consumer forces the fold of its input
        let consumer = m.make_cast(m.types.ty_u64, prod);

        let nodes = m.reachable_from(&[consumer.node]);
        let mut new_nodes = Vec::new();
        run(&mut m, &nodes, &mut new_nodes).unwrap();

        assert_eq!(new_nodes.len(), 1);
        let folded = match &m.node(consumer.node).kind {
            NodeKind::Cast { src } => *src,
            _ => unreachable!(),
        };
        match &m.node(folded.node).kind {
            NodeKind::Constant { value } => assert_eq!(*value, Value::U64(42)),
            other => panic!("expected a folded constant, got {:?}", other.name()),
        }
        assert_eq!(m.node(consumer.node).class, DomainFlags::CONSTANT);
    }

    #[test]
    fn placeholder_inputs_poison_the_class() {
        let mut m = IRModule::new();
        let ty = m.types.ty_u64;
        let p = m.make_placeholder(ty);
        let c = m.make_constant_u64(1);
        let sum = m.make_math_binary(BinaryOp::Add, p, c);

        let nodes = m.reachable_from(&[sum.node]);
        let mut new_nodes = Vec::new();
        run(&mut m, &nodes, &mut new_nodes).unwrap();
        // the placeholder cannot be folded away
        assert!(new_nodes.is_empty());
        assert_eq!(m.node(sum.node).class, DomainFlags::CONSTANT);
    }
}
