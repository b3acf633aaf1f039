// barrier.rs — Barrier grouping for descriptor loads
//
// Adjacent descriptor loads of equal depth and equal (stage, cluster) share
// one barrier: a single expect for the summed tile bytes before the first
// member and a single phase wait after the last one. The scan is greedy and
// order-dependent; a group ends at the first consumer of any member, at an
// already grouped load, or at a descriptor load of another depth.
//
// Preconditions: stage groups allocated; loads not yet lowered.
// Postconditions: every descriptor load belongs to exactly one group and
//                 carries the group's barrier view and wait.
// Failure modes: Invariant error when a group's depth has no stage group or
//                the stage group carries no phase.
// Side effects: allocates and initialises barrier arrays before the loop,
//               inserts expect and wait ops in the body.

use std::collections::HashSet;

use serde::Serialize;
use tracing::debug;

use crate::classify::LoadInfoMap;
use crate::id::{OpId, ValueId};
use crate::ir::{Module, OpBuilder, OpKind};
use crate::lower::AsyncLoad;
use crate::multibuffer::{alloc_barriers, barrier_view_type, Allocation};
use crate::pass::PassId;
use crate::pipeline::PipelineError;

#[derive(Debug, Clone, Serialize)]
pub struct BarrierGroup {
    /// Member loads in program order.
    pub members: Vec<OpId>,
    pub num_buffers: u32,
    /// Barrier array of `num_buffers` slots, allocated before the loop.
    pub barrier_alloc: ValueId,
    /// Insert-slot barrier the members' copies arrive on.
    pub barrier_view: ValueId,
    pub expect: OpId,
    pub wait: OpId,
    /// Expected transaction bytes: the sum of the members' tile sizes.
    pub bytes: u64,
}

/// Ops of the load's block that consume any member of the group.
fn record_consumers(
    m: &Module,
    infos: &LoadInfoMap,
    load: OpId,
    consumers: &mut HashSet<OpId>,
) {
    let block = m.parent_block(load);
    let wide = infos.get(load).is_some_and(|i| i.is_wide_shared_operand);
    for user in m.op_users(load) {
        // A wide operand's allocation is replaced by the slot view, so its
        // users are the real consumers.
        if wide && matches!(m.kind(user), OpKind::LocalAlloc) && m.op(user).parent == Some(block) {
            consumers.extend(m.op_users(user));
            continue;
        }
        if let Some(in_block) = m.ancestor_in_block(block, user) {
            consumers.insert(in_block);
        }
    }
}

/// Partition the descriptor loads of `loads` into groups.
pub fn partition(m: &Module, infos: &LoadInfoMap, loads: &[AsyncLoad]) -> Vec<Vec<usize>> {
    let index_of = |op: OpId| loads.iter().position(|al| al.load == op);
    let mut visited: HashSet<OpId> = HashSet::new();
    let mut groups = Vec::new();
    for (i, al) in loads.iter().enumerate() {
        if !al.is_descriptor_load || visited.contains(&al.load) {
            continue;
        }
        let mut consumers = HashSet::new();
        let mut group = vec![i];
        visited.insert(al.load);
        record_consumers(m, infos, al.load, &mut consumers);
        let head_sched = m.sched(al.load);

        let mut next = m.next_op(al.load);
        while let Some(op) = next {
            if consumers.contains(&op) || visited.contains(&op) {
                break;
            }
            if m.kind(op).is_descriptor_load() {
                if let Some(j) = index_of(op).filter(|&j| loads[j].is_descriptor_load) {
                    if loads[j].num_buffers != al.num_buffers {
                        break;
                    }
                    if m.sched(op) == head_sched {
                        group.push(j);
                        visited.insert(op);
                        record_consumers(m, infos, op, &mut consumers);
                    }
                }
            }
            next = m.next_op(op);
        }
        groups.push(group);
    }
    groups
}

/// Group descriptor loads, allocate one barrier array per group and insert
/// the expect and wait ops. Members of `loads` receive their barrier view
/// and wait.
pub fn group_barriers(
    m: &mut Module,
    for_op: OpId,
    infos: &LoadInfoMap,
    alloc: &Allocation,
    loads: &mut [AsyncLoad],
) -> Result<Vec<BarrierGroup>, PipelineError> {
    let invariant = |msg: String| PipelineError::invariant(PassId::GroupBarriers, msg);
    let mut groups = Vec::new();
    for members in partition(m, infos, loads) {
        let head = &loads[members[0]];
        let (head_load, num_buffers, first_use) = (head.load, head.num_buffers, head.first_use);
        let last_load = loads[members[members.len() - 1]].load;
        let Some(stage_group) = alloc.group(num_buffers) else {
            return Err(invariant(format!("no stage group of depth {num_buffers}")));
        };
        let Some(phase) = stage_group.phase else {
            return Err(invariant(format!("stage group of depth {num_buffers} has no phase")));
        };

        let bytes: u64 = members
            .iter()
            .map(|&i| {
                let ty = m.ty(m.result(loads[i].load, 0));
                ty.num_elements() as u64 * ty.element_bits() as u64 / 8
            })
            .sum();

        let barrier_alloc = alloc_barriers(m, for_op, num_buffers);
        let view_ty = barrier_view_type(num_buffers);
        let mut b = OpBuilder::for_stage_of(m, head_load);
        let barrier_view = b.create1(
            m,
            OpKind::MemDescSubview,
            vec![barrier_alloc, stage_group.insert_idx],
            view_ty.clone(),
        );
        let pred = b.const_true(m);
        let expect = b.create(m, OpKind::BarrierExpect { bytes }, vec![barrier_view, pred], vec![]);

        let mut wb = OpBuilder::after(last_load).with_sched(Some(first_use));
        let wait_view = wb.create1(
            m,
            OpKind::MemDescSubview,
            vec![barrier_alloc, stage_group.extract_idx],
            view_ty,
        );
        let wait = wb.create(m, OpKind::WaitBarrier, vec![wait_view, phase], vec![]);

        let member_loads: Vec<OpId> = members.iter().map(|&i| loads[i].load).collect();
        for &i in &members {
            loads[i].barrier = Some(barrier_view);
            loads[i].wait = Some(wait);
        }
        debug!(members = member_loads.len(), bytes, depth = num_buffers, "barrier group");
        groups.push(BarrierGroup {
            members: member_loads,
            num_buffers,
            barrier_alloc,
            barrier_view,
            expect,
            wait,
            bytes,
        });
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify_loads;
    use crate::fixtures;
    use crate::ir::StageCluster;
    use crate::lower::async_loads;
    use crate::multibuffer::allocate;

    fn grouped(k: &mut fixtures::Kernel) -> (Vec<BarrierGroup>, Vec<AsyncLoad>) {
        let infos = classify_loads(&k.module, k.for_op);
        let alloc = allocate(&mut k.module, k.for_op, &infos, 0).unwrap();
        let mut loads = async_loads(&alloc);
        let groups = group_barriers(&mut k.module, k.for_op, &infos, &alloc, &mut loads).unwrap();
        (groups, loads)
    }

    #[test]
    fn adjacent_descriptor_loads_share_one_barrier() {
        let mut k = fixtures::matmul_tma(3);
        let (groups, loads) = grouped(&mut k);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members, k.loads);
        // 128x64 + 64x128 f16 tiles.
        assert_eq!(groups[0].bytes, 2 * 128 * 64 * 2);
        assert_eq!(loads[0].wait, loads[1].wait);
        assert_eq!(k.module.next_op(k.loads[1]), k.module.defining_op(
            k.module.operand(groups[0].wait, 0)
        ));
    }

    #[test]
    fn expect_sits_before_first_member_in_its_stage() {
        let mut k = fixtures::matmul_tma(3);
        let (groups, _) = grouped(&mut k);
        let m = &k.module;
        let expect = groups[0].expect;
        assert_eq!(m.next_op(expect), Some(k.loads[0]));
        assert_eq!(m.sched(expect), Some(StageCluster::new(0, 1)));
        assert_eq!(m.sched(groups[0].wait), Some(StageCluster::new(2, 0)));
    }

    #[test]
    fn single_descriptor_load_gets_its_own_tile_bytes() {
        let mut k = fixtures::descriptor_dot(3);
        let (groups, _) = grouped(&mut k);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].num_buffers, 3);
        assert_eq!(groups[0].bytes, 128 * 64 * 2);
    }

    #[test]
    fn different_stage_starts_a_new_group() {
        let mut k = fixtures::matmul_tma(3);
        k.module.set_sched(k.loads[1], Some(StageCluster::new(0, 0)));
        let (groups, _) = grouped(&mut k);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn pointer_loads_are_not_grouped() {
        let mut k = fixtures::matmul_direct(3);
        let (groups, loads) = grouped(&mut k);
        assert!(groups.is_empty());
        assert!(loads.iter().all(|al| al.barrier.is_none()));
    }
}
