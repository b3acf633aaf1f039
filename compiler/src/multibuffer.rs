// multibuffer.rs — Ring buffers and rotating slot counters
//
// Gives every eligible load a shared-memory ring of N slots, groups loads
// with equal N so they share one set of loop-carried counters (insert,
// extract, and a barrier phase when a descriptor load is in the group), and
// appends one counter per materialized descriptor. Also owns the barrier
// arrays and the post-loop release sequence.
//
// Preconditions: loads were classified on this loop; the loop ends in a yield.
// Postconditions: counters are carried with initial values -1, -1, 0 and are
//                 advanced at the top of the body; the yield carries the
//                 advanced values (descriptor slots hold placeholders).
// Failure modes: Invariant error if the loop or a load has an unexpected shape.
// Side effects: inserts allocations and constants before the loop, extends
//               the loop signature, inserts counter updates in the body.

use serde::Serialize;
use tracing::debug;

use crate::classify::{LoadInfo, LoadInfoMap};
use crate::id::{OpId, ValueId};
use crate::ir::{CmpPredicate, Module, OpBuilder, OpKind, StageCluster};
use crate::layout;
use crate::pass::PassId;
use crate::pipeline::PipelineError;
use crate::types::{MemDescType, ScalarType, SharedEncoding, Type};

// ── Records ─────────────────────────────────────────────────────────────────

/// The ring buffer backing one load.
#[derive(Debug, Clone, Serialize)]
pub struct MultiBuffer {
    pub load: OpId,
    pub alloc: ValueId,
    pub num_buffers: u32,
    pub first_use: StageCluster,
    pub is_descriptor_load: bool,
}

/// Counters shared by all rings of one depth.
#[derive(Debug, Clone, Serialize)]
pub struct StageGroup {
    pub num_buffers: u32,
    /// Slot written this iteration (advanced value).
    pub insert_idx: ValueId,
    /// Slot read this iteration (advanced value).
    pub extract_idx: ValueId,
    /// Barrier parity; present iff the group contains a descriptor load.
    pub phase: Option<ValueId>,
    pub has_descriptor_load: bool,
}

/// Carried-slot positions of one stage group, as iter-arg indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSlots {
    pub num_buffers: u32,
    pub insert: usize,
    pub extract: usize,
    pub phase: Option<usize>,
}

/// Order of the carried slots appended to the loop: per stage group in
/// first-seen order `insert, extract[, phase]`, then one counter per
/// descriptor materialization in program order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CarriedLayout {
    pub first_slot: usize,
    pub groups: Vec<GroupSlots>,
    pub descriptor_counters: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Allocation {
    pub buffers: Vec<MultiBuffer>,
    pub groups: Vec<StageGroup>,
    /// Body arguments holding the descriptor counters.
    pub descriptor_counters: Vec<ValueId>,
    pub layout: CarriedLayout,
    pub zero: ValueId,
    pub one: ValueId,
}

impl Allocation {
    pub fn group(&self, num_buffers: u32) -> Option<&StageGroup> {
        self.groups.iter().find(|g| g.num_buffers == num_buffers)
    }

    pub fn buffer(&self, load: OpId) -> Option<&MultiBuffer> {
        self.buffers.iter().find(|b| b.load == load)
    }

    pub fn allocs(&self) -> Vec<ValueId> {
        self.buffers.iter().map(|b| b.alloc).collect()
    }
}

// ── Depths and types ────────────────────────────────────────────────────────

/// Ring depth for a load: one slot per stage in flight plus the one being
/// read. Operands consumed straight from shared memory by a warp-group MMA,
/// and scale operands, keep one extra slot alive.
pub fn num_buffers(info: &LoadInfo) -> u32 {
    let mut n = info.dist_to_use.max(0) as u32 + 1;
    if info.is_wide_shared_operand || info.is_scale_operand {
        n += 1;
    }
    n
}

fn ring_type(m: &Module, load: OpId, shared: &SharedEncoding, depth: u32) -> Option<Type> {
    let tile = m.ty(m.result(load, 0)).as_tensor()?;
    let mut shape = vec![depth as i64];
    shape.extend_from_slice(&tile.shape);
    Some(Type::MemDesc(MemDescType {
        shape: shape.clone(),
        elem: tile.elem.pointee(),
        encoding: shared.clone(),
        mutable: true,
        alloc_shape: shape,
    }))
}

/// Type of one slot of a ring: the leading dimension dropped.
pub fn slot_view_type(ring: &Type) -> Type {
    match ring {
        Type::MemDesc(desc) => Type::MemDesc(MemDescType {
            shape: desc.shape[1..].to_vec(),
            elem: desc.elem,
            encoding: desc.encoding.clone(),
            mutable: true,
            alloc_shape: desc.alloc_shape.clone(),
        }),
        other => other.clone(),
    }
}

// ── Allocation ──────────────────────────────────────────────────────────────

/// Allocate rings for `infos`, carry the counters through `for_op`, and
/// append `num_descriptors` descriptor counters.
pub fn allocate(
    m: &mut Module,
    for_op: OpId,
    infos: &LoadInfoMap,
    num_descriptors: usize,
) -> Result<Allocation, PipelineError> {
    let Some(yield_op) = m.for_yield(for_op) else {
        return Err(PipelineError::invariant(PassId::Allocate, "loop body has no yield"));
    };

    let mut buffers = Vec::with_capacity(infos.len());
    // (depth, has_descriptor_load) in first-seen order.
    let mut depths: Vec<(u32, bool)> = Vec::new();
    for (load, info) in infos.iter() {
        let depth = num_buffers(info);
        let Some(ty) = ring_type(m, load, &info.shared, depth) else {
            return Err(PipelineError::invariant(
                PassId::Allocate,
                format!("{load} does not produce a tensor"),
            ));
        };
        let alloc = OpBuilder::before(for_op).create1(m, OpKind::LocalAlloc, vec![], ty);
        let is_descriptor_load = m.kind(load).is_descriptor_load();
        match depths.iter_mut().find(|(d, _)| *d == depth) {
            Some(entry) => entry.1 |= is_descriptor_load,
            None => depths.push((depth, is_descriptor_load)),
        }
        buffers.push(MultiBuffer {
            load,
            alloc,
            num_buffers: depth,
            first_use: info.first_use_sched,
            is_descriptor_load,
        });
    }

    let mut b = OpBuilder::before(for_op);
    let minus_one = b.const_i32(m, -1);
    let zero = b.const_i32(m, 0);
    let one = b.const_i32(m, 1);

    let first_slot = m.for_iter_args(for_op).len();
    let mut inits = Vec::new();
    let mut group_slots = Vec::new();
    for &(depth, has_descriptor_load) in &depths {
        let insert = first_slot + inits.len();
        inits.push(minus_one);
        inits.push(minus_one);
        let phase = has_descriptor_load.then(|| {
            inits.push(zero);
            first_slot + inits.len() - 1
        });
        group_slots.push(GroupSlots {
            num_buffers: depth,
            insert,
            extract: insert + 1,
            phase,
        });
    }
    let descriptor_slots: Vec<usize> = (0..num_descriptors)
        .map(|i| first_slot + inits.len() + i)
        .collect();
    inits.extend(std::iter::repeat(zero).take(num_descriptors));
    let args = m.append_loop_carried(for_op, &inits);
    let arg = |slot: usize| args[slot - first_slot];

    let body = m.for_body(for_op);
    let mut groups = Vec::with_capacity(group_slots.len());
    for slots in &group_slots {
        // Each group's updates go to the top of the body.
        let mut b = OpBuilder::at_start(body);
        let depth = slots.num_buffers as i64;
        let nb = b.const_i32(m, depth);
        let insert_idx = b.increment_modulo(m, arg(slots.insert), nb, zero, one);
        let extract_next = b.binary(m, OpKind::AddI, arg(slots.extract), one);
        // Duplicated so the bound is never carried across iterations.
        let nb_ext = b.const_i32(m, depth);
        let in_range = b.cmp(m, CmpPredicate::Slt, extract_next, nb_ext);
        let extract_idx = b.select(m, in_range, extract_next, zero);
        let phase = slots.phase.map(|slot| {
            let current = arg(slot);
            let flipped = b.binary(m, OpKind::XorI, current, one);
            b.select(m, in_range, current, flipped)
        });

        m.set_operand(yield_op, slots.insert, insert_idx);
        m.set_operand(yield_op, slots.extract, extract_idx);
        if let (Some(slot), Some(phase)) = (slots.phase, phase) {
            m.set_operand(yield_op, slot, phase);
        }
        groups.push(StageGroup {
            num_buffers: slots.num_buffers,
            insert_idx,
            extract_idx,
            phase,
            has_descriptor_load: slots.phase.is_some(),
        });
    }

    let descriptor_counters = descriptor_slots.iter().map(|&s| arg(s)).collect();
    debug!(
        buffers = buffers.len(),
        groups = groups.len(),
        descriptors = num_descriptors,
        "allocated ring buffers"
    );
    Ok(Allocation {
        buffers,
        groups,
        descriptor_counters,
        layout: CarriedLayout {
            first_slot,
            groups: group_slots,
            descriptor_counters: descriptor_slots,
        },
        zero,
        one,
    })
}

// ── Barriers ────────────────────────────────────────────────────────────────

fn barrier_array_type(depth: u32) -> Type {
    Type::MemDesc(MemDescType {
        shape: vec![depth as i64],
        elem: ScalarType::I64,
        encoding: layout::generic_swizzled(vec![0]),
        mutable: true,
        alloc_shape: vec![depth as i64],
    })
}

/// Type of a single barrier viewed out of an array of `depth`.
pub fn barrier_view_type(depth: u32) -> Type {
    Type::MemDesc(MemDescType {
        shape: vec![1],
        elem: ScalarType::I64,
        encoding: layout::generic_swizzled(vec![0]),
        mutable: true,
        alloc_shape: vec![depth as i64],
    })
}

/// Allocate `depth` barriers before the loop and initialise each with an
/// arrival count of one.
pub fn alloc_barriers(m: &mut Module, for_op: OpId, depth: u32) -> ValueId {
    let mut b = OpBuilder::before(for_op);
    let array = b.create1(m, OpKind::LocalAlloc, vec![], barrier_array_type(depth));
    for slot in 0..depth {
        let idx = b.const_i32(m, slot as i64);
        let view = b.create1(m, OpKind::MemDescSubview, vec![array, idx], barrier_view_type(depth));
        b.create(m, OpKind::InitBarrier { count: 1 }, vec![view], vec![]);
    }
    array
}

/// After the loop: drain outstanding copies, invalidate every barrier, then
/// release every ring. Returns the created ops in order.
pub fn release_after_loop(
    m: &mut Module,
    for_op: OpId,
    rings: &[ValueId],
    barriers: &[ValueId],
) -> Vec<OpId> {
    let mut b = OpBuilder::after(for_op);
    let mut created = vec![b.create(m, OpKind::AsyncWait { num: 0 }, vec![], vec![Type::Token])];
    for &array in barriers {
        let depth = m.ty(array).shape().first().copied().unwrap_or(0) as u32;
        for slot in 0..depth {
            let idx = b.const_i32(m, slot as i64);
            let view =
                b.create1(m, OpKind::MemDescSubview, vec![array, idx], barrier_view_type(depth));
            created.push(b.create(m, OpKind::InvalBarrier, vec![view], vec![]));
        }
    }
    for &ring in rings {
        created.push(b.create(m, OpKind::LocalDealloc, vec![ring], vec![]));
    }
    created
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify_loads;
    use crate::fixtures;

    fn allocated(kernel: &mut fixtures::Kernel) -> Allocation {
        let infos = classify_loads(&kernel.module, kernel.for_op);
        allocate(&mut kernel.module, kernel.for_op, &infos, 0).unwrap()
    }

    #[test]
    fn direct_loads_share_one_group() {
        let mut k = fixtures::matmul_direct(3);
        let alloc = allocated(&mut k);
        assert_eq!(alloc.buffers.len(), 2);
        assert!(alloc.buffers.iter().all(|b| b.num_buffers == 3));
        assert_eq!(alloc.groups.len(), 1);
        assert!(alloc.groups[0].phase.is_none());
        assert_eq!(
            alloc.layout.groups,
            vec![GroupSlots {
                num_buffers: 3,
                insert: 3,
                extract: 4,
                phase: None
            }]
        );
        let ring = k.module.ty(alloc.buffers[0].alloc);
        assert_eq!(ring.shape(), &[3, 128, 32]);
    }

    #[test]
    fn counters_start_at_minus_one_and_phase_at_zero() {
        let mut k = fixtures::matmul_tma(3);
        let alloc = allocated(&mut k);
        let slots = &alloc.layout.groups[0];
        assert_eq!(slots.num_buffers, 4);
        let init = |slot| k.module.constant_value(k.module.for_init(k.for_op, slot)).unwrap().as_int();
        assert_eq!(init(slots.insert), Some(-1));
        assert_eq!(init(slots.extract), Some(-1));
        assert_eq!(init(slots.phase.unwrap()), Some(0));
    }

    #[test]
    fn yield_carries_advanced_counters() {
        let mut k = fixtures::matmul_tma(2);
        let alloc = allocated(&mut k);
        let y = k.module.for_yield(k.for_op).unwrap();
        let group = &alloc.groups[0];
        let slots = &alloc.layout.groups[0];
        assert_eq!(k.module.operand(y, slots.insert), group.insert_idx);
        assert_eq!(k.module.operand(y, slots.extract), group.extract_idx);
        assert_eq!(k.module.operand(y, slots.phase.unwrap()), group.phase.unwrap());
    }

    #[test]
    fn descriptor_counters_follow_groups() {
        let mut k = fixtures::matmul_direct(2);
        let infos = classify_loads(&k.module, k.for_op);
        let alloc = allocate(&mut k.module, k.for_op, &infos, 2).unwrap();
        assert_eq!(alloc.layout.descriptor_counters, vec![5, 6]);
        assert_eq!(alloc.descriptor_counters.len(), 2);
    }

    #[test]
    fn release_order_is_wait_inval_dealloc() {
        let mut k = fixtures::matmul_tma(3);
        let alloc = allocated(&mut k);
        let barrier = alloc_barriers(&mut k.module, k.for_op, 4);
        let ops = release_after_loop(&mut k.module, k.for_op, &alloc.allocs(), &[barrier]);
        let kinds: Vec<&str> = ops.iter().map(|&op| k.module.kind(op).mnemonic()).collect();
        let mut expected = vec!["ttg.async_wait"];
        expected.extend(std::iter::repeat("ttng.inval_barrier").take(4));
        expected.extend(["ttg.local_dealloc", "ttg.local_dealloc"]);
        assert_eq!(kinds, expected);
        assert_eq!(k.module.next_op(k.for_op), Some(ops[0]));
    }
}
