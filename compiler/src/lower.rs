// lower.rs — Asynchronous copy lowering
//
// Replaces every eligible load with a copy into the insert slot of its ring
// buffer and a read of the extract slot at the first use. Pointer loads
// become async copies closed by a commit group and guarded by a count-based
// wait; descriptor loads become barrier-tracked hardware copies whose wait
// was placed by barrier grouping.
//
// Preconditions: rings and stage groups allocated; descriptor loads carry
//                their group's barrier and wait.
// Postconditions: no eligible load remains in the body; every copy writes
//                 its group's insert slot and every read uses the extract
//                 slot.
// Failure modes: Invariant error when a wide shared operand is not consumed
//                by exactly one shared allocation, when a descriptor load
//                has no barrier, or when a prefetched operand has no
//                preceding stage.
// Side effects: rewrites the loop body in place.

use serde::Serialize;
use tracing::{debug, trace};

use crate::classify::{LoadInfo, LoadInfoMap};
use crate::id::{OpId, ValueId};
use crate::ir::{Module, OpBuilder, OpKind, StageCluster};
use crate::multibuffer::{slot_view_type, Allocation, MultiBuffer, StageGroup};
use crate::pass::PassId;
use crate::pipeline::PipelineError;
use crate::schedule::cluster_range;
use crate::types::{Encoding, ScalarType, Type};

/// One load on its way to becoming an asynchronous copy. Barrier grouping
/// fills `barrier` and `wait` for descriptor loads; lowering fills the rest.
#[derive(Debug, Clone, Serialize)]
pub struct AsyncLoad {
    pub load: OpId,
    pub alloc: ValueId,
    pub num_buffers: u32,
    pub first_use: StageCluster,
    pub is_descriptor_load: bool,
    /// Barrier view the copy arrives on (descriptor loads).
    pub barrier: Option<ValueId>,
    /// Barrier wait (descriptor loads) or async wait (pointer loads).
    pub wait: Option<OpId>,
    pub copy: Option<OpId>,
    pub extract_view: Option<ValueId>,
}

impl AsyncLoad {
    pub fn new(buffer: &MultiBuffer) -> Self {
        AsyncLoad {
            load: buffer.load,
            alloc: buffer.alloc,
            num_buffers: buffer.num_buffers,
            first_use: buffer.first_use,
            is_descriptor_load: buffer.is_descriptor_load,
            barrier: None,
            wait: None,
            copy: None,
            extract_view: None,
        }
    }
}

/// Async loads in allocation order.
pub fn async_loads(alloc: &Allocation) -> Vec<AsyncLoad> {
    alloc.buffers.iter().map(AsyncLoad::new).collect()
}

/// Pointer loads below one element per thread are cheap enough to be
/// re-laid out before copying.
fn is_expensive(m: &Module, load: OpId) -> bool {
    match m.ty(m.operand(load, 0)) {
        Type::Tensor(t) => t.shape.iter().product::<i64>() >= m.target.threads_per_cta() as i64,
        _ => false,
    }
}

fn invariant(msg: impl Into<String>) -> PipelineError {
    PipelineError::invariant(PassId::LowerLoads, msg)
}

/// Lower every load in `loads`. Barrier grouping must already have run.
pub fn lower_loads(
    m: &mut Module,
    for_op: OpId,
    infos: &LoadInfoMap,
    alloc: &Allocation,
    loads: &mut [AsyncLoad],
) -> Result<(), PipelineError> {
    let max_cluster = cluster_range(m, for_op).map_or(0, |(_, max)| max);
    for async_load in loads.iter_mut() {
        let Some(info) = infos.get(async_load.load) else {
            return Err(invariant(format!("{} has no buffer layout", async_load.load)));
        };
        let Some(group) = alloc.group(async_load.num_buffers) else {
            return Err(invariant(format!(
                "no stage group of depth {}",
                async_load.num_buffers
            )));
        };
        if async_load.is_descriptor_load {
            lower_descriptor_load(m, async_load, info, group)?;
        } else {
            lower_pointer_load(m, async_load, info, group, max_cluster)?;
        }
    }
    debug!(loads = loads.len(), "lowered loads to async copies");
    Ok(())
}

/// Hand the consumers of `load` the extract view: shared allocations of the
/// loaded value are replaced by the view itself. Returns true when the load
/// has no other consumer left to feed.
fn redirect_allocs(
    m: &mut Module,
    load: OpId,
    info: &LoadInfo,
    view: ValueId,
) -> Result<bool, PipelineError> {
    let users = m.op_users(load);
    if info.is_wide_shared_operand || info.is_scale_operand {
        let [user] = users.as_slice() else {
            return Err(invariant(format!(
                "{load}: shared operand must have exactly one consumer"
            )));
        };
        if !matches!(m.kind(*user), OpKind::LocalAlloc) {
            return Err(invariant(format!(
                "{load}: shared operand must be consumed by a shared allocation"
            )));
        }
        m.replace_uses_and_propagate_type(m.result(*user, 0), view);
        m.erase(*user);
        return Ok(true);
    }
    for user in users {
        if matches!(m.kind(user), OpKind::LocalAlloc) {
            m.replace_uses_and_propagate_type(m.result(user, 0), view);
            m.erase(user);
        }
    }
    Ok(false)
}

fn lower_pointer_load(
    m: &mut Module,
    al: &mut AsyncLoad,
    info: &LoadInfo,
    group: &StageGroup,
    max_cluster: i32,
) -> Result<(), PipelineError> {
    let load = al.load;
    let OpKind::Load(attrs) = m.kind(load).clone() else {
        return Err(invariant(format!("{load} is not a pointer load")));
    };
    let mut b = OpBuilder::for_stage_of(m, load);
    let orig_mask = attrs.has_mask.then(|| m.operand(load, 1));
    let other = attrs
        .has_other
        .then(|| m.operand(load, 1 + attrs.has_mask as usize));
    let mut src = m.operand(load, 0);
    let mut mask = orig_mask;
    let mut copy_other = other;

    if let Some(blocked) = info.blocked.as_ref().filter(|_| !is_expensive(m, load)) {
        let encoding = Some(Encoding::Blocked(blocked.clone()));
        let mut convert = |m: &mut Module, v: ValueId| {
            let ty = m.ty(v).with_encoding(encoding.clone());
            b.create1(m, OpKind::ConvertLayout, vec![v], ty)
        };
        src = convert(m, src);
        mask = mask.map(|v| convert(m, v));
        copy_other = copy_other.map(|v| convert(m, v));
    }

    let view_ty = slot_view_type(m.ty(al.alloc));
    let view = b.create1(m, OpKind::MemDescSubview, vec![al.alloc, group.insert_idx], view_ty.clone());
    let mut operands = vec![src, view];
    operands.extend(mask);
    operands.extend(copy_other);
    let copy = b.create(
        m,
        OpKind::AsyncCopyGlobalToLocal(attrs),
        operands,
        vec![Type::Token],
    );
    let copy_token = m.result(copy, 0);
    let commit = b.create1(m, OpKind::AsyncCommitGroup, vec![copy_token], Type::Token);

    let mut fb = b.with_sched(Some(al.first_use));
    let wait = fb.create(m, OpKind::AsyncWait { num: 0 }, vec![commit], vec![Type::Token]);
    let view_load = fb.create1(m, OpKind::MemDescSubview, vec![al.alloc, group.extract_idx], view_ty);

    if !redirect_allocs(m, load, info, view_load)? {
        let loaded = m.result(load, 0);
        let load_ty = m.ty(loaded).clone();
        let wait_token = m.result(wait, 0);
        let mut result = fb.create1(m, OpKind::LocalLoad, vec![view_load, wait_token], load_ty);
        // Async copies only fill with zero.
        if let (Some(other), Some(mask)) = (other, orig_mask) {
            if !m.constant_value(other).is_some_and(|c| c.is_zero()) {
                result = fb.select(m, mask, result, other);
            }
        }
        m.replace_all_uses(loaded, result);

        if info.used_by_dot {
            if al.first_use.stage < 1 {
                return Err(invariant(format!("{load}: dot operand consumed in stage 0")));
            }
            let prefetch = Some(StageCluster::new(al.first_use.stage - 1, max_cluster + 1));
            m.set_sched(wait, prefetch);
            if let Some(view_op) = m.defining_op(view_load) {
                m.set_sched(view_op, prefetch);
            }
            trace!(load = %load, "dot operand read prefetched one stage early");
        }
    }
    m.erase(load);

    al.wait = Some(wait);
    al.copy = Some(copy);
    al.extract_view = Some(view_load);
    Ok(())
}

fn lower_descriptor_load(
    m: &mut Module,
    al: &mut AsyncLoad,
    info: &LoadInfo,
    group: &StageGroup,
) -> Result<(), PipelineError> {
    let load = al.load;
    let (Some(barrier), Some(wait)) = (al.barrier, al.wait) else {
        return Err(invariant(format!("{load}: descriptor load has no barrier")));
    };
    let mut b = OpBuilder::for_stage_of(m, load);
    let view_ty = slot_view_type(m.ty(al.alloc));
    let view = b.create1(m, OpKind::MemDescSubview, vec![al.alloc, group.insert_idx], view_ty.clone());
    let pred = b.const_true(m);
    let desc = m.operand(load, 0);
    let tma = b.create1(m, OpKind::TensorDescToTmaPtr, vec![desc], Type::Ptr(ScalarType::I8));
    let mut operands = vec![tma];
    operands.extend(m.op(load).operands[1..].iter().copied());
    operands.extend([barrier, view, pred]);
    let kind = match m.kind(load) {
        OpKind::DescriptorGather => OpKind::AsyncTmaGather,
        _ => OpKind::AsyncTmaCopy,
    };
    let copy = b.create(m, kind, operands, vec![]);

    let mut fb = OpBuilder::after(wait).with_sched(Some(al.first_use));
    let view_load = fb.create1(m, OpKind::MemDescSubview, vec![al.alloc, group.extract_idx], view_ty);
    if !redirect_allocs(m, load, info, view_load)? {
        let loaded = m.result(load, 0);
        let load_ty = m.ty(loaded).clone();
        let result = fb.create1(m, OpKind::LocalLoad, vec![view_load], load_ty);
        m.replace_all_uses(loaded, result);
    }
    m.erase(load);

    al.copy = Some(copy);
    al.extract_view = Some(view_load);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::group_barriers;
    use crate::classify::classify_loads;
    use crate::fixtures;
    use crate::multibuffer::allocate;

    fn lowered(mut k: fixtures::Kernel) -> (fixtures::Kernel, Allocation, Vec<AsyncLoad>) {
        let infos = classify_loads(&k.module, k.for_op);
        let alloc = allocate(&mut k.module, k.for_op, &infos, 0).unwrap();
        let mut loads = async_loads(&alloc);
        group_barriers(&mut k.module, k.for_op, &infos, &alloc, &mut loads).unwrap();
        lower_loads(&mut k.module, k.for_op, &infos, &alloc, &mut loads).unwrap();
        (k, alloc, loads)
    }

    fn count(m: &Module, pred: impl Fn(&OpKind) -> bool) -> usize {
        m.walk().into_iter().filter(|&op| pred(m.kind(op))).count()
    }

    #[test]
    fn pointer_loads_become_copy_commit_wait() {
        let (k, alloc, loads) = lowered(fixtures::matmul_direct(3));
        let m = &k.module;
        for &load in &k.loads {
            assert!(m.is_erased(load));
        }
        assert_eq!(count(m, |kind| matches!(kind, OpKind::Load(_))), 0);
        assert_eq!(count(m, |kind| matches!(kind, OpKind::AsyncCopyGlobalToLocal(_))), 2);
        assert_eq!(count(m, |kind| matches!(kind, OpKind::AsyncCommitGroup)), 2);
        assert_eq!(count(m, |kind| matches!(kind, OpKind::LocalLoad)), 2);

        let group = &alloc.groups[0];
        for al in &loads {
            let copy = al.copy.unwrap();
            let dst = m.operand(copy, 1);
            let view = m.defining_op(dst).unwrap();
            assert_eq!(m.operand(view, 1), group.insert_idx);
            let extract = m.defining_op(al.extract_view.unwrap()).unwrap();
            assert_eq!(m.operand(extract, 1), group.extract_idx);
        }
    }

    #[test]
    fn dot_operands_are_prefetched_one_stage_early() {
        let (k, _, loads) = lowered(fixtures::matmul_direct(3));
        let m = &k.module;
        // Loads sit in cluster 1, the dot in cluster 0.
        for al in &loads {
            assert_eq!(m.sched(al.wait.unwrap()), Some(StageCluster::new(1, 2)));
        }
    }

    #[test]
    fn plain_loads_keep_first_use_stage() {
        let (k, _, loads) = lowered(fixtures::elementwise_stream(3));
        let m = &k.module;
        assert_eq!(m.sched(loads[0].wait.unwrap()), Some(StageCluster::new(2, 0)));
        // 1024 pointers exceed the 128 threads of the default target.
        let copy = loads[0].copy.unwrap();
        assert_eq!(m.operand(copy, 0), m.for_iter_args(k.for_op)[0]);
    }

    #[test]
    fn wide_operands_replace_their_allocations() {
        let (k, _, loads) = lowered(fixtures::matmul_tma(3));
        let m = &k.module;
        assert_eq!(count(m, |kind| matches!(kind, OpKind::AsyncTmaCopy)), 2);
        assert_eq!(count(m, |kind| matches!(kind, OpKind::LocalLoad)), 0);
        let dot = k.dots[0];
        assert_eq!(m.operand(dot, 0), loads[0].extract_view.unwrap());
        assert_eq!(m.operand(dot, 1), loads[1].extract_view.unwrap());
        // Two rings and one barrier array.
        assert_eq!(count(m, |kind| matches!(kind, OpKind::LocalAlloc)), 3);
    }

    #[test]
    fn descriptor_load_reads_after_barrier_wait() {
        let (k, _, loads) = lowered(fixtures::descriptor_dot(3));
        let m = &k.module;
        let wait = loads[0].wait.unwrap();
        let view_op = m.defining_op(loads[0].extract_view.unwrap()).unwrap();
        assert_eq!(m.next_op(wait), Some(view_op));
        let read = m.next_op(view_op).unwrap();
        assert!(matches!(m.kind(read), OpKind::LocalLoad));
        assert_eq!(m.op(read).operands.len(), 1);
    }
}
