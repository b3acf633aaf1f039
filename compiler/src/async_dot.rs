// async_dot.rs — Asynchronous warp-group MMA promotion
//
// Every warp-group dot in an expanded loop body is launched asynchronously.
// A dot whose result may stay in flight across the loop back-edge is
// "properly async": its operands cannot change under it, its result only
// leaves the loop through one carried value, and that carried value is read
// only as another dot's accumulator or after a full drain. The last
// properly async dot is followed by a wait that allows that many dots to
// remain pending. Every other dot is drained right after it issues.
//
// Preconditions: the loop has been expanded.
// Postconditions: no result of an in-flight dot is read before a wait that
//                 covers it; the loop results are drained after the loop.
// Side effects: marks dots async, inserts and replaces warp-group waits.

use std::collections::HashSet;

use serde::Serialize;
use tracing::debug;

use crate::id::{BlockId, OpId, ValueId};
use crate::ir::{InsertPoint, Module, OpBuilder, OpKind, ValueDef};
use crate::types::Encoding;

/// Outcome of [`async_launch_dots`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct AsyncDotReport {
    /// Every dot marked async, in body order.
    pub promoted: Vec<OpId>,
    /// Properly async dots with the carried slot their result leaves by.
    pub eligible: Vec<(OpId, usize)>,
    /// Waits inserted, in creation order.
    pub waits: Vec<OpId>,
}

fn pendings(m: &Module, wait: OpId) -> Option<u32> {
    match m.kind(wait) {
        OpKind::WarpGroupDotWait { pendings } => Some(*pendings),
        _ => None,
    }
}

/// Rebuild `wait` so it also carries `values` and the shared-memory operands
/// of the dots producing them. Later readers of the values in the wait's
/// block read the wait's results instead. Returns the new wait.
pub fn thread_values_through_wait(m: &mut Module, wait: OpId, values: &[ValueId]) -> OpId {
    let block = m.parent_block(wait);
    let pendings = pendings(m, wait).unwrap_or(0);
    let mut operands = m.op(wait).operands.clone();
    let original = operands.len();
    for &v in values {
        if !operands.contains(&v) {
            operands.push(v);
        }
    }

    // Dots in this block that feed the values; their shared operands must
    // stay live until the wait.
    let mut seen: HashSet<OpId> = HashSet::new();
    let mut stack: Vec<ValueId> = values.to_vec();
    let mut dots = Vec::new();
    while let Some(v) = stack.pop() {
        let Some(def) = m.defining_op(v) else { continue };
        if m.op(def).parent != Some(block) || !seen.insert(def) {
            continue;
        }
        if matches!(m.kind(def), OpKind::WarpGroupDot { .. }) {
            dots.push(def);
            continue;
        }
        stack.extend(m.op(def).operands.iter().copied());
    }
    for dot in dots {
        for &v in &m.op(dot).operands {
            if m.ty(v).is_mem_desc() && !operands.contains(&v) {
                operands.push(v);
            }
        }
    }

    let types = operands.iter().map(|&v| m.ty(v).clone()).collect();
    let sched = m.sched(wait);
    let new_wait = OpBuilder::before(wait).with_sched(sched).create(
        m,
        OpKind::WarpGroupDotWait { pendings },
        operands.clone(),
        types,
    );

    for i in 0..original {
        let old = m.result(wait, i);
        let new = m.result(new_wait, i);
        m.replace_all_uses(old, new);
    }
    for (i, &v) in operands.iter().enumerate().skip(original) {
        if m.ty(v).is_mem_desc() {
            continue;
        }
        let new = m.result(new_wait, i);
        m.replace_uses_if(v, new, |m, u| {
            m.ancestor_in_block(block, u.op)
                .is_some_and(|anc| anc != new_wait && m.is_before_in_block(new_wait, anc))
        });
    }
    m.erase(wait);
    new_wait
}

/// Create a wait at `ip` and thread `values` through it.
fn insert_wait(m: &mut Module, ip: InsertPoint, pendings: u32, values: &[ValueId]) -> OpId {
    let wait = OpBuilder::new(ip).create(m, OpKind::WarpGroupDotWait { pendings }, vec![], vec![]);
    thread_values_through_wait(m, wait, values)
}

/// A register operand must be loop-invariant or come from another MMA's
/// accumulator; a shared operand must trace back to something outside the
/// loop or to a ring slot view.
fn operand_is_stable(m: &Module, operand: ValueId, for_op: OpId) -> bool {
    if !m.ty(operand).is_mem_desc() {
        if let Some(def) = m.defining_op(operand) {
            if matches!(m.kind(def), OpKind::ConvertLayout) {
                let src = m.operand(def, 0);
                return matches!(
                    m.ty(src).as_tensor().and_then(|t| t.encoding.as_ref()),
                    Some(Encoding::Mma(_))
                );
            }
        }
        return m.is_defined_outside(operand, for_op);
    }

    let body = m.for_body(for_op);
    let mut visited = HashSet::new();
    let mut v = operand;
    loop {
        if !visited.insert(v) {
            return false;
        }
        if m.is_defined_outside(v, for_op) {
            return true;
        }
        match m.value(v).def {
            ValueDef::OpResult { op, .. } => match m.kind(op) {
                OpKind::ConvertLayout | OpKind::MemDescTrans => v = m.operand(op, 0),
                OpKind::MemDescSubview => return true,
                _ => return false,
            },
            ValueDef::BlockArg { block, index } if block == body && index > 0 => {
                let Some(yield_op) = m.for_yield(for_op) else { return false };
                v = m.operand(yield_op, index as usize - 1);
            }
            ValueDef::BlockArg { .. } => return false,
        }
    }
}

/// The carried slot through which `dot`'s result leaves the loop, if every
/// use is that slot or a read inside a conditional of the body.
fn carried_slot(m: &Module, dot: OpId, for_op: OpId) -> Option<usize> {
    let mut slot = None;
    let mut queue = m.uses(m.result(dot, 0));
    while let Some(u) = queue.pop() {
        let owner = m.op(u.op);
        let parent = m.parent_op(u.op);
        let is_yield = matches!(owner.kind, OpKind::Yield);
        if parent == Some(for_op) {
            if !is_yield || slot.is_some() {
                return None;
            }
            slot = Some(u.operand);
            continue;
        }
        match parent {
            Some(p) if matches!(m.kind(p), OpKind::If) => {
                if is_yield {
                    queue.extend(m.uses(m.result(p, u.operand)));
                }
            }
            _ => return None,
        }
    }
    slot
}

/// Decide whether `dot` may stay in flight across iterations and return its
/// carried slot. May thread the carried value through an existing full
/// drain in the body.
pub fn dot_can_be_properly_async(m: &mut Module, dot: OpId, for_op: OpId) -> Option<usize> {
    let stable = (0..2).all(|i| operand_is_stable(m, m.operand(dot, i), for_op));
    if !stable {
        return None;
    }
    let slot = carried_slot(m, dot, for_op)?;
    let iter_arg = m.for_iter_args(for_op)[slot];

    let uses = m.uses(iter_arg);
    if uses
        .iter()
        .all(|u| matches!(m.kind(u.op), OpKind::WarpGroupDot { .. }) && u.operand == 2)
    {
        return Some(slot);
    }

    // Otherwise every reader must follow a full drain in the body.
    let body = m.for_body(for_op);
    let drain = m
        .block(body)
        .ops
        .iter()
        .copied()
        .find(|&op| pendings(m, op) == Some(0))?;
    let after_drain = uses.iter().all(|u| {
        m.ancestor_in_block(body, u.op)
            .is_some_and(|anc| m.is_before_in_block(drain, anc))
    });
    if !after_drain {
        return None;
    }
    thread_values_through_wait(m, drain, &[iter_arg]);
    Some(slot)
}

/// Waits for properly async dots: a drain before each reader outside the
/// loop yield, one partial wait after the last of them, and a drain of the
/// loop results after the loop.
pub fn insert_async_wait_in_loop(
    m: &mut Module,
    for_op: OpId,
    eligible: &[(OpId, usize)],
) -> Vec<OpId> {
    let mut waits = Vec::new();
    let Some(&(last_dot, _)) = eligible.last() else {
        return waits;
    };
    let loop_yield = m.for_yield(for_op);
    // One drain per consuming block, carrying every eligible result read there.
    let mut block_values: Vec<(BlockId, Vec<ValueId>)> = Vec::new();
    for &(dot, _) in eligible {
        let result = m.result(dot, 0);
        for user in m.users(result) {
            if Some(user) == loop_yield {
                continue;
            }
            let Some(block) = m.op(user).parent else { continue };
            match block_values.iter_mut().find(|(b, _)| *b == block) {
                Some((_, values)) if values.contains(&result) => {}
                Some((_, values)) => values.push(result),
                None => block_values.push((block, vec![result])),
            }
        }
    }
    for (block, values) in block_values {
        waits.push(insert_wait(m, InsertPoint::BlockStart(block), 0, &values));
    }

    let body = m.for_body(for_op);
    let has_drain = m
        .block(body)
        .ops
        .iter()
        .any(|&op| pendings(m, op) == Some(0));
    if !has_drain {
        let results: Vec<ValueId> = eligible.iter().map(|&(d, _)| m.result(d, 0)).collect();
        waits.push(insert_wait(
            m,
            InsertPoint::After(last_dot),
            eligible.len() as u32,
            &results,
        ));
    }

    let loop_results: Vec<ValueId> = eligible.iter().map(|&(_, slot)| m.result(for_op, slot)).collect();
    waits.push(insert_wait(m, InsertPoint::After(for_op), 0, &loop_results));
    waits
}

/// Launch every warp-group dot of the loop body asynchronously and insert
/// the waits that keep their results safe to read.
pub fn async_launch_dots(m: &mut Module, for_op: OpId) -> AsyncDotReport {
    let body = m.for_body(for_op);
    let dots: Vec<OpId> = m
        .block(body)
        .ops
        .iter()
        .copied()
        .filter(|&op| matches!(m.kind(op), OpKind::WarpGroupDot { .. }))
        .collect();
    let mut report = AsyncDotReport::default();
    for &dot in &dots {
        m.op_mut(dot).kind = OpKind::WarpGroupDot { is_async: true };
    }
    for &dot in &dots {
        match dot_can_be_properly_async(m, dot, for_op) {
            Some(slot) => report.eligible.push((dot, slot)),
            None => {
                let result = m.result(dot, 0);
                report.waits.push(insert_wait(m, InsertPoint::After(dot), 0, &[result]));
            }
        }
    }
    report.promoted = dots;
    if !report.eligible.is_empty() {
        let waits = insert_async_wait_in_loop(m, for_op, &report.eligible);
        report.waits.extend(waits);
    }
    debug!(
        dots = report.promoted.len(),
        eligible = report.eligible.len(),
        waits = report.waits.len(),
        "launched async dots"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, WgmmaVariant};

    fn body_waits(m: &Module, for_op: OpId) -> Vec<(OpId, u32)> {
        m.block(m.for_body(for_op))
            .ops
            .iter()
            .filter_map(|&op| pendings(m, op).map(|p| (op, p)))
            .collect()
    }

    #[test]
    fn plain_accumulator_stays_in_flight() {
        let mut k = fixtures::wgmma_loop(WgmmaVariant::Plain);
        let report = async_launch_dots(&mut k.module, k.for_op);
        let m = &k.module;
        let dot = k.dots[0];
        assert_eq!(m.kind(dot), &OpKind::WarpGroupDot { is_async: true });
        assert_eq!(report.eligible, vec![(dot, 0)]);

        let waits = body_waits(m, k.for_op);
        assert_eq!(waits.len(), 1);
        let (wait, pending) = waits[0];
        assert_eq!(pending, 1);
        assert_eq!(m.next_op(dot), Some(wait));
        // Result plus both shared operands.
        assert_eq!(m.op(wait).operands.len(), 3);
        assert_eq!(m.operand(m.for_yield(k.for_op).unwrap(), 0), m.result(wait, 0));

        let after = m.next_op(k.for_op).unwrap();
        assert_eq!(pendings(m, after), Some(0));
        let truncf = m.next_op(after).unwrap();
        assert_eq!(m.operand(truncf, 0), m.result(after, 0));
    }

    #[test]
    fn accumulator_read_elsewhere_is_drained_immediately() {
        let mut k = fixtures::wgmma_loop(WgmmaVariant::ElementwiseUse);
        let report = async_launch_dots(&mut k.module, k.for_op);
        let m = &k.module;
        assert!(report.eligible.is_empty());
        let wait = m.next_op(k.dots[0]).unwrap();
        assert_eq!(pendings(m, wait), Some(0));
        assert_eq!(m.operand(m.for_yield(k.for_op).unwrap(), 0), m.result(wait, 0));
        // Nothing left in flight, so no drain after the loop.
        let after = m.next_op(k.for_op).unwrap();
        assert_eq!(pendings(m, after), None);
    }

    #[test]
    fn chained_dots_keep_only_the_last_in_flight() {
        let mut k = fixtures::wgmma_loop(WgmmaVariant::Chained);
        let report = async_launch_dots(&mut k.module, k.for_op);
        let m = &k.module;
        let (first, second) = (k.dots[0], k.dots[1]);
        assert_eq!(report.eligible, vec![(second, 0)]);
        let drain = m.next_op(first).unwrap();
        assert_eq!(pendings(m, drain), Some(0));
        assert_eq!(m.operand(second, 2), m.result(drain, 0));
        // The drain already bounds the body; only the post-loop drain is added.
        assert_eq!(body_waits(m, k.for_op), vec![(drain, 0)]);
        assert_eq!(pendings(m, m.next_op(k.for_op).unwrap()), Some(0));
    }

    #[test]
    fn reader_under_conditional_gets_its_own_drain() {
        let mut k = fixtures::wgmma_loop(WgmmaVariant::UseUnderIf);
        let report = async_launch_dots(&mut k.module, k.for_op);
        let m = &k.module;
        assert_eq!(report.eligible.len(), 1);
        let if_op = m
            .block(m.for_body(k.for_op))
            .ops
            .iter()
            .copied()
            .find(|&op| matches!(m.kind(op), OpKind::If))
            .unwrap();
        let then_block = m.op(if_op).regions[0];
        let first = m.block(then_block).ops[0];
        assert_eq!(pendings(m, first), Some(0));
        let truncf = m.block(then_block).ops[1];
        assert_eq!(m.operand(truncf, 0), m.result(first, 0));
        assert!(body_waits(m, k.for_op).iter().any(|&(_, p)| p == 1));
    }

    #[test]
    fn readers_sharing_a_block_share_one_drain() {
        let mut k = fixtures::wgmma_loop(WgmmaVariant::UseUnderIf);
        let body = k.module.for_body(k.for_op);
        let if_op = k
            .module
            .block(body)
            .ops
            .iter()
            .copied()
            .find(|&op| matches!(k.module.kind(op), OpKind::If))
            .unwrap();
        let then_block = k.module.op(if_op).regions[0];
        let first_reader = k.module.block(then_block).ops[0];
        let result = k.module.operand(first_reader, 0);
        let ty = k.module.ty(result).clone();
        let second_reader = OpBuilder::at_end(then_block).create(
            &mut k.module,
            OpKind::Elementwise("arith.truncf".to_string()),
            vec![result],
            vec![ty],
        );

        async_launch_dots(&mut k.module, k.for_op);
        let m = &k.module;
        let drains: Vec<OpId> = m
            .block(then_block)
            .ops
            .iter()
            .copied()
            .filter(|&op| pendings(m, op).is_some())
            .collect();
        assert_eq!(drains.len(), 1);
        let drain = drains[0];
        assert_eq!(m.block(then_block).ops[0], drain);
        assert_eq!(pendings(m, drain), Some(0));
        assert_eq!(m.operand(first_reader, 0), m.result(drain, 0));
        assert_eq!(m.operand(second_reader, 0), m.result(drain, 0));
    }

    #[test]
    fn reader_after_existing_drain_is_threaded() {
        let mut k = fixtures::wgmma_loop(WgmmaVariant::ElementwiseUse);
        let body = k.module.for_body(k.for_op);
        let drain = OpBuilder::at_start(body).create(
            &mut k.module,
            OpKind::WarpGroupDotWait { pendings: 0 },
            vec![],
            vec![],
        );
        let acc = k.module.for_iter_args(k.for_op)[0];
        let slot = dot_can_be_properly_async(&mut k.module, k.dots[0], k.for_op);
        assert_eq!(slot, Some(0));
        let m = &k.module;
        assert!(m.is_erased(drain));
        let threaded = m.block(body).ops[0];
        assert_eq!(m.op(threaded).operands, vec![acc]);
        // Both the elementwise read and the dot now read the drained value.
        assert!(m.uses(acc).iter().all(|u| u.op == threaded));
    }

    #[test]
    fn register_operand_from_loop_is_unstable() {
        let k = fixtures::matmul_direct(3);
        // Converted from a blocked load, not from an accumulator.
        let a = k.module.operand(k.dots[0], 0);
        assert!(!operand_is_stable(&k.module, a, k.for_op));
        let acc = k.module.operand(k.dots[0], 2);
        assert!(!operand_is_stable(&k.module, acc, k.for_op));
    }
}
