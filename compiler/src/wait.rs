// wait.rs — Async copy wait resolution after loop expansion
//
// Every single-token `async_wait` starts at a count of 0, which drains all
// in-flight copies. The real bound is the fewest commit groups issued
// between the token's commit and the wait along any def path; that many
// groups may stay pending. Paths enter loops through their carried values:
// one history starts at the loop init, the other at the previous
// iteration's yield. Adjacent waits separated only by views are merged.
//
// Preconditions: the module has been expanded; waits carry commit tokens.
// Postconditions: every wait's count is a lower bound on the commits
//                 interleaved along all of its token's histories.
// Side effects: rewrites wait counts, replaces merged waits.

use std::collections::HashSet;

use serde::Serialize;
use tracing::debug;

use crate::id::{BlockId, OpId, ValueId};
use crate::ir::{Module, OpBuilder, OpKind, ValueDef};
use crate::types::Type;

/// Outcome of [`update_waits`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct WaitReport {
    /// `(wait, pending count)` for every wait seen, in program order.
    pub resolved: Vec<(OpId, u32)>,
    /// Waits created by merging adjacent groups.
    pub combined: Vec<OpId>,
    /// Number of waits replaced by a merge.
    pub merged: usize,
}

/// Commit groups in `block` from position `from` up to `sink`, or up to the
/// end of the block when `sink` lives elsewhere.
fn commits_between(m: &Module, block: BlockId, from: usize, sink: OpId) -> u32 {
    m.block(block)
        .ops
        .iter()
        .skip(from)
        .take_while(|&&op| op != sink)
        .filter(|&&op| matches!(m.kind(op), OpKind::AsyncCommitGroup))
        .count() as u32
}

struct HistoryWalk<'a> {
    m: &'a Module,
    min: u32,
    on_path: HashSet<(ValueId, OpId)>,
}

impl HistoryWalk<'_> {
    fn visit(&mut self, value: ValueId, sink: OpId, history: u32) {
        if !self.on_path.insert((value, sink)) {
            return;
        }
        self.visit_inner(value, sink, history);
        self.on_path.remove(&(value, sink));
    }

    fn visit_inner(&mut self, value: ValueId, sink: OpId, history: u32) {
        let m = self.m;
        match m.value(value).def {
            ValueDef::OpResult { op, .. } => {
                let Some((block, pos)) = m.block_position(op) else {
                    self.min = 0;
                    return;
                };
                let sum = history + commits_between(m, block, pos + 1, sink);
                self.min = self.min.min(sum);
            }
            ValueDef::BlockArg { block, index } => {
                let owner = m.block(block).parent;
                let Some(for_op) = owner.filter(|&o| matches!(m.kind(o), OpKind::For { .. })) else {
                    self.min = 0;
                    return;
                };
                if index == 0 {
                    self.min = 0;
                    return;
                }
                let slot = index as usize - 1;
                let sum = history + commits_between(m, block, 0, sink);
                if sum >= self.min {
                    return;
                }
                self.visit(m.for_init(for_op, slot), for_op, sum);
                if let Some(yield_op) = m.for_yield(for_op) {
                    self.visit(m.operand(yield_op, slot), yield_op, sum);
                }
            }
        }
    }
}

/// The fewest commit groups interleaved between `wait`'s token and `wait`
/// along any def path. Waits on more or fewer than one token resolve to 0.
pub fn min_interleaved_commits(m: &Module, wait: OpId) -> u32 {
    let operands = &m.op(wait).operands;
    if operands.len() != 1 {
        return 0;
    }
    let value = operands[0];
    let value_block = match m.value(value).def {
        ValueDef::OpResult { op, .. } => m.op(op).parent,
        ValueDef::BlockArg { block, .. } => Some(block),
    };
    // A wait nested below the token's block measures up to its ancestor
    // there.
    let Some(sink) = value_block.and_then(|b| m.ancestor_in_block(b, wait)) else {
        return 0;
    };
    let mut walk = HistoryWalk {
        m,
        min: u32::MAX,
        on_path: HashSet::new(),
    };
    walk.visit(value, sink, 0);
    if walk.min == u32::MAX {
        0
    } else {
        walk.min
    }
}

/// Merge each run of waits separated only by views and other waits into one
/// wait before the last of the run, carrying the union of their tokens and
/// the smallest count. Returns the new waits and how many were replaced.
pub fn combine_redundant_waits(m: &mut Module, waits: &[OpId]) -> (Vec<OpId>, usize) {
    let mut absorbed: HashSet<OpId> = HashSet::new();
    let mut replacements: Vec<(Vec<OpId>, OpId)> = Vec::new();
    for &wait in waits {
        if absorbed.contains(&wait) || m.is_erased(wait) {
            continue;
        }
        let OpKind::AsyncWait { num } = *m.kind(wait) else { continue };
        let mut group = vec![wait];
        let mut min_num = num;
        let mut tokens: Vec<ValueId> = m.op(wait).operands.clone();
        let mut next = m.next_op(wait);
        while let Some(op) = next {
            match *m.kind(op) {
                OpKind::AsyncWait { num } => {
                    group.push(op);
                    min_num = min_num.min(num);
                    for &t in &m.op(op).operands {
                        if !tokens.contains(&t) {
                            tokens.push(t);
                        }
                    }
                }
                OpKind::MemDescSubview => {}
                _ => break,
            }
            next = m.next_op(op);
        }
        if group.len() == 1 {
            continue;
        }
        let last = group[group.len() - 1];
        let sched = m.sched(last);
        let merged = OpBuilder::before(last).with_sched(sched).create(
            m,
            OpKind::AsyncWait { num: min_num },
            tokens,
            vec![Type::Token],
        );
        absorbed.extend(group.iter().copied());
        replacements.push((group, merged));
    }

    let mut created = Vec::with_capacity(replacements.len());
    let mut merged_count = 0;
    for (group, merged) in replacements {
        let new_token = m.result(merged, 0);
        for old in group {
            let old_token = m.result(old, 0);
            m.replace_all_uses(old_token, new_token);
            m.erase(old);
            merged_count += 1;
        }
        created.push(merged);
    }
    (created, merged_count)
}

/// Resolve every wait's count, then merge redundant waits.
pub fn update_waits(m: &mut Module) -> WaitReport {
    let waits: Vec<OpId> = m
        .walk()
        .into_iter()
        .filter(|&op| matches!(m.kind(op), OpKind::AsyncWait { .. }))
        .collect();
    let mut report = WaitReport::default();
    for &wait in &waits {
        let num = min_interleaved_commits(m, wait);
        m.op_mut(wait).kind = OpKind::AsyncWait { num };
        report.resolved.push((wait, num));
    }
    let (combined, merged) = combine_redundant_waits(m, &waits);
    debug!(waits = waits.len(), merged, "updated async waits");
    report.combined = combined;
    report.merged = merged;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    fn wait_num(m: &Module, wait: OpId) -> u32 {
        match m.kind(wait) {
            OpKind::AsyncWait { num } => *num,
            other => panic!("not a wait: {other:?}"),
        }
    }

    #[test]
    fn steady_state_keeps_all_but_one_group_in_flight() {
        for stages in 3..=5 {
            let mut k = fixtures::expanded_copy_loop(stages);
            let report = update_waits(&mut k.module);
            assert_eq!(report.resolved, vec![(k.waits[0], stages - 2)], "stages = {stages}");
            assert_eq!(wait_num(&k.module, k.waits[0]), stages - 2);
        }
    }

    #[test]
    fn wait_without_a_single_token_drains_everything() {
        let mut k = fixtures::expanded_copy_loop(3);
        let body = k.module.for_body(k.for_op);
        let bare = OpBuilder::at_start(body).create(
            &mut k.module,
            OpKind::AsyncWait { num: 5 },
            vec![],
            vec![Type::Token],
        );
        assert_eq!(min_interleaved_commits(&k.module, bare), 0);
    }

    #[test]
    fn token_committed_right_before_the_wait_allows_nothing_pending() {
        let mut k = fixtures::expanded_copy_loop(3);
        let body = k.module.for_body(k.for_op);
        let yield_op = k.module.for_yield(k.for_op).unwrap();
        let commit = k.module.defining_op(k.module.operand(yield_op, 3)).unwrap();
        let token = k.module.result(commit, 0);
        let wait = OpBuilder::after(commit).create(
            &mut k.module,
            OpKind::AsyncWait { num: 0 },
            vec![token],
            vec![Type::Token],
        );
        assert_eq!(k.module.parent_block(wait), body);
        assert_eq!(min_interleaved_commits(&k.module, wait), 0);
    }

    #[test]
    fn adjacent_waits_merge_into_one() {
        let mut k = fixtures::expanded_copy_loop(4);
        let first = k.waits[0];
        let tokens = k.module.for_iter_args(k.for_op);
        let (t0, t1) = (tokens[2], tokens[3]);
        let second = OpBuilder::after(first).create(
            &mut k.module,
            OpKind::AsyncWait { num: 0 },
            vec![t1],
            vec![Type::Token],
        );
        let old_token = k.module.result(first, 0);
        let user = k.module.users(old_token)[0];

        let report = update_waits(&mut k.module);
        assert_eq!(report.merged, 2);
        assert_eq!(report.combined.len(), 1);
        let merged = report.combined[0];
        assert!(k.module.is_erased(first) && k.module.is_erased(second));
        assert_eq!(k.module.op(merged).operands, vec![t0, t1]);
        // t0 may leave two groups in flight, t1 only one.
        assert_eq!(wait_num(&k.module, merged), 1);
        assert_eq!(k.module.operand(user, 1), k.module.result(merged, 0));
    }

    #[test]
    fn waits_separated_by_real_work_stay_apart() {
        let mut k = fixtures::expanded_copy_loop(3);
        let yield_op = k.module.for_yield(k.for_op).unwrap();
        let tokens = k.module.for_iter_args(k.for_op);
        OpBuilder::before(yield_op).create(
            &mut k.module,
            OpKind::AsyncWait { num: 0 },
            vec![tokens[3]],
            vec![Type::Token],
        );
        let report = update_waits(&mut k.module);
        assert_eq!(report.merged, 0);
        assert_eq!(report.resolved.len(), 2);
    }
}
