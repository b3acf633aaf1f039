// descriptor.rs — Per-iteration descriptor buffers
//
// A tensor descriptor materialized inside the loop cannot be rewritten in
// place while earlier iterations' copies may still read it. Each
// materialization gets a global scratch area holding one descriptor per
// stage; the loop writes the next slot, fences, reinterprets the slot as
// the descriptor and advances a carried counter modulo the stage count.
// Materializations under conditionals thread the counter out through every
// enclosing conditional.
//
// Preconditions: `plan_descriptors` accepted the loop; the allocator
//                appended one counter per planned materialization.
// Postconditions: no materialization remains; the loop yield carries each
//                 advanced counter.
// Failure modes: E0100 (planning) when a materialization is nested under
//                anything but conditionals; Invariant error on descriptor
//                shapes the hardware cannot encode.
// Side effects: inserts scratch allocations before the loop; rewrites the
//               body and enclosing conditionals' signatures.

use serde::Serialize;
use tracing::debug;

use crate::diag::{codes, Diagnostic};
use crate::id::{BlockId, OpId, ValueId};
use crate::ir::{Module, OpBuilder, OpKind};
use crate::multibuffer::Allocation;
use crate::pass::PassId;
use crate::pipeline::PipelineError;
use crate::types::{ScalarType, Type};

/// Largest block dimension a hardware descriptor can describe.
pub const MAX_BLOCK_DIM: i64 = 256;

/// Descriptor materializations of one loop, in program order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DescriptorPlan {
    pub materializations: Vec<OpId>,
}

impl DescriptorPlan {
    pub fn len(&self) -> usize {
        self.materializations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materializations.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DescriptorBuffer {
    pub make_desc: OpId,
    /// Scratch area of `num_stages` descriptors.
    pub scratch: ValueId,
    /// Carried-slot index of the counter.
    pub counter_slot: usize,
    /// Replacement descriptor read back from the written slot.
    pub descriptor: ValueId,
}

/// Collect materializations and check that only conditionals enclose them.
/// Runs before any mutation so a rejected loop is left untouched.
pub fn plan_descriptors(m: &Module, for_op: OpId) -> Result<DescriptorPlan, Vec<Diagnostic>> {
    let mut plan = DescriptorPlan::default();
    let mut errors = Vec::new();
    for op in m.walk_block(m.for_body(for_op)) {
        if !matches!(m.kind(op), OpKind::MakeTensorDesc) {
            continue;
        }
        let mut parent = m.parent_op(op);
        while let Some(p) = parent {
            if p == for_op {
                break;
            }
            if !matches!(m.kind(p), OpKind::If) {
                errors.push(
                    Diagnostic::error(
                        op,
                        format!(
                            "cannot pipeline a descriptor materialized inside `{}`",
                            m.kind(p).mnemonic()
                        ),
                    )
                    .with_code(codes::E0100)
                    .with_related(p, "enclosing construct")
                    .with_hint("only conditionals may enclose a descriptor materialization"),
                );
                break;
            }
            parent = m.parent_op(p);
        }
        plan.materializations.push(op);
    }
    if errors.is_empty() {
        Ok(plan)
    } else {
        Err(errors)
    }
}

/// Yield terminating `block`, created empty if missing.
fn ensure_yield(m: &mut Module, block: BlockId) -> OpId {
    match m.terminator(block) {
        Some(y) => y,
        None => OpBuilder::at_end(block).create(m, OpKind::Yield, vec![], vec![]),
    }
}

/// Rewrite every planned materialization into a write of the next scratch
/// slot.
pub fn rewrite_descriptors(
    m: &mut Module,
    for_op: OpId,
    plan: &DescriptorPlan,
    alloc: &Allocation,
    num_stages: u32,
) -> Result<Vec<DescriptorBuffer>, PipelineError> {
    let invariant = |msg: String| PipelineError::invariant(PassId::RewriteDescriptors, msg);
    if plan.len() != alloc.descriptor_counters.len() {
        return Err(invariant(format!(
            "{} descriptor materializations but {} counters",
            plan.len(),
            alloc.descriptor_counters.len()
        )));
    }
    if plan.is_empty() {
        return Ok(Vec::new());
    }
    let Some(loop_yield) = m.for_yield(for_op) else {
        return Err(invariant("loop body has no yield".to_string()));
    };
    let size = m.target.descriptor_size;
    let align = m.target.descriptor_align;
    let stages_val = OpBuilder::before(for_op).const_i32(m, num_stages as i64);

    let mut buffers = Vec::with_capacity(plan.len());
    for (i, &make_desc) in plan.materializations.iter().enumerate() {
        let counter = alloc.descriptor_counters[i];
        let counter_slot = alloc.layout.descriptor_counters[i];
        let old_desc = m.result(make_desc, 0);
        let desc_ty = m.ty(old_desc).clone();
        let Type::TensorDesc(desc) = &desc_ty else {
            return Err(invariant(format!("{make_desc} does not produce a descriptor")));
        };
        if desc.elem == ScalarType::I1 {
            return Err(invariant(format!("{make_desc}: i1 descriptors are not encodable")));
        }
        if let Some(dim) = desc.block_shape.iter().find(|&&d| d > MAX_BLOCK_DIM) {
            return Err(invariant(format!(
                "{make_desc}: block dimension {dim} exceeds {MAX_BLOCK_DIM}"
            )));
        }
        let (block_shape, elem) = (desc.block_shape.clone(), desc.elem);

        let scratch = OpBuilder::before(for_op).create1(
            m,
            OpKind::GlobalScratchAlloc {
                bytes: num_stages as u64 * size as u64,
                align,
            },
            vec![],
            Type::Ptr(ScalarType::I8),
        );

        let mut sb = OpBuilder::for_stage_of(m, make_desc);
        let size_val = sb.const_i32(m, size as i64);
        let offset = sb.binary(m, OpKind::MulI, size_val, counter);
        let slot_ptr = sb.binary(m, OpKind::AddPtr, scratch, offset);
        let mut create_operands = vec![slot_ptr];
        create_operands.extend(m.op(make_desc).operands.iter().copied());
        sb.create(m, OpKind::TensormapCreate { block_shape, elem }, create_operands, vec![]);
        sb.create(m, OpKind::TensormapFenceAcquire, vec![slot_ptr], vec![]);
        let descriptor = sb.create1(m, OpKind::ReinterpretTensorDesc, vec![slot_ptr], desc_ty);
        m.replace_all_uses(old_desc, descriptor);
        let mut next = sb.increment_modulo(m, counter, stages_val, alloc.zero, alloc.one);

        // Thread the advanced counter out through the enclosing conditionals.
        let mut cur_block = m.parent_block(make_desc);
        m.erase(make_desc);
        while let Some(parent) = m.block(cur_block).parent {
            if parent == for_op {
                break;
            }
            if !matches!(m.kind(parent), OpKind::If) {
                return Err(invariant(format!(
                    "descriptor counter cannot leave `{}`",
                    m.kind(parent).mnemonic()
                )));
            }
            let result = m.add_result(parent, Type::i32());
            let then_block = m.op(parent).regions[0];
            let else_block = match m.op(parent).regions.get(1) {
                Some(&b) => b,
                None => {
                    let b = m.new_block(vec![]);
                    m.attach_region(parent, b);
                    b
                }
            };
            let (taken, other) = if cur_block == then_block {
                (then_block, else_block)
            } else {
                (else_block, then_block)
            };
            let taken_yield = ensure_yield(m, taken);
            m.push_operand(taken_yield, next);
            let other_yield = ensure_yield(m, other);
            m.push_operand(other_yield, counter);
            next = result;
            cur_block = m.parent_block(parent);
        }
        m.set_operand(loop_yield, counter_slot, next);

        debug!(make_desc = %make_desc, slot = counter_slot, "descriptor rewritten to scratch slot");
        buffers.push(DescriptorBuffer {
            make_desc,
            scratch,
            counter_slot,
            descriptor,
        });
    }
    Ok(buffers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify_loads;
    use crate::fixtures::{self, DescriptorPlacement};
    use crate::multibuffer::allocate;
    use crate::print::print_module;

    fn rewrite(placement: DescriptorPlacement) -> (fixtures::Kernel, Vec<DescriptorBuffer>) {
        let mut k = fixtures::descriptor_materialized(3, placement);
        let plan = plan_descriptors(&k.module, k.for_op).unwrap();
        let infos = classify_loads(&k.module, k.for_op);
        let alloc = allocate(&mut k.module, k.for_op, &infos, plan.len()).unwrap();
        let buffers = rewrite_descriptors(&mut k.module, k.for_op, &plan, &alloc, 3).unwrap();
        (k, buffers)
    }

    fn find(m: &Module, pred: impl Fn(&OpKind) -> bool) -> Vec<OpId> {
        m.walk().into_iter().filter(|&op| pred(m.kind(op))).collect()
    }

    #[test]
    fn inner_loop_materialization_is_rejected_without_mutation() {
        let k = fixtures::descriptor_materialized(3, DescriptorPlacement::InInnerLoop);
        let before = print_module(&k.module);
        let errors = plan_descriptors(&k.module, k.for_op).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, Some(codes::E0100));
        assert!(errors[0].message.contains("scf.for"));
        assert_eq!(print_module(&k.module), before);
    }

    #[test]
    fn counter_threads_through_nested_conditionals() {
        let (k, buffers) = rewrite(DescriptorPlacement::InIf { depth: 2 });
        let m = &k.module;
        assert_eq!(buffers.len(), 1);
        assert!(find(m, |kind| matches!(kind, OpKind::MakeTensorDesc)).is_empty());

        let ifs = find(m, |kind| matches!(kind, OpKind::If));
        assert_eq!(ifs.len(), 2);
        for &if_op in &ifs {
            assert_eq!(m.op(if_op).results.len(), 2);
            assert_eq!(m.ty(m.result(if_op, 1)), &Type::i32());
        }
        let outer = ifs[0];
        let y = m.for_yield(k.for_op).unwrap();
        assert_eq!(m.operand(y, buffers[0].counter_slot), m.result(outer, 1));

        // Else branches keep the incoming counter.
        let counter = m.for_iter_args(k.for_op)[buffers[0].counter_slot];
        for &if_op in &ifs {
            let else_yield = m.terminator(m.op(if_op).regions[1]).unwrap();
            assert_eq!(m.op(else_yield).operands.last(), Some(&counter));
        }
    }

    #[test]
    fn missing_else_branch_is_created() {
        let (k, _) = rewrite(DescriptorPlacement::InIfWithoutElse);
        let m = &k.module;
        let if_op = find(m, |kind| matches!(kind, OpKind::If))[0];
        assert_eq!(m.op(if_op).regions.len(), 2);
        let else_yield = m.terminator(m.op(if_op).regions[1]).unwrap();
        assert_eq!(m.op(else_yield).operands.len(), 1);
    }

    #[test]
    fn scratch_holds_one_descriptor_per_stage() {
        let (k, buffers) = rewrite(DescriptorPlacement::InIf { depth: 1 });
        let m = &k.module;
        let scratch_op = m.defining_op(buffers[0].scratch).unwrap();
        assert_eq!(
            m.kind(scratch_op),
            &OpKind::GlobalScratchAlloc { bytes: 3 * 128, align: 128 }
        );
        assert_eq!(find(m, |kind| matches!(kind, OpKind::TensormapFenceAcquire)).len(), 1);
    }

    #[test]
    fn oversized_block_is_an_invariant_violation() {
        let mut k = fixtures::descriptor_materialized(3, DescriptorPlacement::InIf { depth: 1 });
        let plan = plan_descriptors(&k.module, k.for_op).unwrap();
        let md = plan.materializations[0];
        let v = k.module.result(md, 0);
        k.module.set_type(
            v,
            Type::TensorDesc(crate::types::TensorDescType {
                block_shape: vec![512, 64],
                elem: ScalarType::F16,
            }),
        );
        let infos = classify_loads(&k.module, k.for_op);
        let alloc = allocate(&mut k.module, k.for_op, &infos, 1).unwrap();
        let err = rewrite_descriptors(&mut k.module, k.for_op, &plan, &alloc, 3).unwrap_err();
        assert!(matches!(err, PipelineError::Invariant { .. }));
    }
}
