// classify.rs — Load eligibility classification
//
// Decides which loads of an annotated loop body become multi-buffered
// asynchronous copies. For each eligible load it records the shared layout
// of its ring buffer, an optional register layout for the copy source, and
// the distance in stages to its first consumer.
//
// Preconditions: `for_op` is a `For`; body ops may carry stage annotations.
// Postconditions: every recorded load has a shared encoding and
//                 `dist_to_use >= 1`.
// Failure modes: none. Ineligible loads are skipped (trace log only).
// Side effects: none (read-only over the module).

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, trace};

use crate::axis::AxisAnalysis;
use crate::id::{OpId, ValueId};
use crate::ir::{Module, OpKind, StageCluster};
use crate::layout;
use crate::types::{BlockedEncoding, Encoding, SharedEncoding, Type};

// ── Records ─────────────────────────────────────────────────────────────────

/// Per-load classification result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadInfo {
    /// Layout of the ring buffer in shared memory.
    pub shared: SharedEncoding,
    /// Register layout for the copy source; only for loads not fed to a dot.
    pub blocked: Option<BlockedEncoding>,
    pub used_by_dot: bool,
    /// The single consumer is a shared allocation with an MMA layout.
    pub is_wide_shared_operand: bool,
    /// Feeds the scale operand of a scaled MMA.
    pub is_scale_operand: bool,
    pub dist_to_use: i32,
    pub first_use: OpId,
    pub first_use_sched: StageCluster,
}

/// Eligible loads in body order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadInfoMap {
    entries: Vec<(OpId, LoadInfo)>,
}

impl LoadInfoMap {
    pub fn get(&self, load: OpId) -> Option<&LoadInfo> {
        self.entries
            .iter()
            .find(|(op, _)| *op == load)
            .map(|(_, info)| info)
    }

    pub fn iter(&self) -> impl Iterator<Item = (OpId, &LoadInfo)> {
        self.entries.iter().map(|(op, info)| (*op, info))
    }

    pub fn loads(&self) -> Vec<OpId> {
        self.entries.iter().map(|(op, _)| *op).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, load: OpId, info: LoadInfo) {
        self.entries.push((load, info));
    }
}

// ── Use queries ─────────────────────────────────────────────────────────────

/// Annotated direct user in the load's block with the lowest
/// `(stage, cluster)`; ties keep the earliest user.
pub fn first_use(m: &Module, load: OpId) -> Option<(OpId, StageCluster)> {
    let block = m.parent_block(load);
    let mut best: Option<(OpId, StageCluster)> = None;
    for user in m.op_users(load) {
        if m.op(user).parent != Some(block) {
            continue;
        }
        let Some(sc) = m.sched(user) else { continue };
        if best.map_or(true, |(_, b)| sc < b) {
            best = Some((user, sc));
        }
    }
    best
}

/// Users of `load` in its block reached by following def-use chains. The
/// walk stops at the first load or dot of each chain. When the loop carries
/// a stage count, the head of every chain is recorded as well.
pub fn transitive_users(m: &Module, load: OpId, loop_has_stages: bool) -> Vec<OpId> {
    let mut users = Vec::new();
    let mut seen = HashSet::new();
    user_dfs(m, load, load, false, &mut seen, &mut users);
    if loop_has_stages {
        seen.clear();
        user_dfs(m, load, load, true, &mut seen, &mut users);
    }
    users
}

fn user_dfs(
    m: &Module,
    op: OpId,
    base: OpId,
    any_op: bool,
    seen: &mut HashSet<OpId>,
    users: &mut Vec<OpId>,
) {
    if !seen.insert(op) {
        return;
    }
    if op != base {
        let kind = m.kind(op);
        if any_op || kind.is_load_like() || kind.is_dot_like() {
            users.push(op);
            return;
        }
    }
    let block = m.op(op).parent;
    for user in m.op_users(op) {
        if m.op(user).parent == block {
            user_dfs(m, user, base, any_op, seen, users);
        }
    }
    // An accumulator copy continues into the accumulator it writes.
    if matches!(m.kind(op), OpKind::TmemCopy) {
        let dst = m.operand(op, 1);
        if let Some(alloc) = m.defining_op(dst) {
            if matches!(m.kind(alloc), OpKind::TmemAlloc) {
                user_dfs(m, alloc, base, any_op, seen, users);
            }
        }
    }
}

/// The load has exactly one use and it is an allocation with an MMA layout.
pub fn is_wide_shared_buffer(m: &Module, load: OpId) -> bool {
    let result = m.result(load, 0);
    let uses = m.uses(result);
    if uses.len() != 1 {
        return false;
    }
    let user = uses[0].op;
    if !matches!(m.kind(user), OpKind::LocalAlloc) {
        return false;
    }
    matches!(
        m.ty(m.result(user, 0)).as_mem_desc().map(|d| &d.encoding),
        Some(SharedEncoding::NvMma(_))
    )
}

// ── Shared layout selection ─────────────────────────────────────────────────

/// Dimension order of a tensor or memory-descriptor value.
fn value_order(ty: &Type) -> Vec<u32> {
    let rank = ty.shape().len();
    match ty {
        Type::Tensor(t) => layout::order_of(t.encoding.as_ref(), rank),
        Type::MemDesc(d) => match &d.encoding {
            SharedEncoding::Swizzled(s) => s.order.clone(),
            SharedEncoding::NvMma(n) if n.transposed => (0..rank as u32).collect(),
            SharedEncoding::NvMma(_) => layout::order_of(None, rank),
        },
        _ => layout::order_of(None, rank),
    }
}

/// Shared layout for a load: allocation users must agree on one encoding.
/// Descriptor loads always get the MMA-compatible layout.
pub fn shared_encoding(m: &Module, load: OpId, is_descriptor: bool) -> Option<SharedEncoding> {
    let result = m.result(load, 0);
    let ty = m.ty(result).as_tensor()?;
    let order = layout::shared_order(ty.encoding.as_ref(), ty.shape.len());

    let mut alloc_enc: Option<SharedEncoding> = None;
    for user in m.users(result) {
        if !matches!(m.kind(user), OpKind::LocalAlloc) {
            continue;
        }
        let enc = m.ty(m.result(user, 0)).as_mem_desc()?.encoding.clone();
        match &alloc_enc {
            None => alloc_enc = Some(enc),
            Some(existing) if *existing != enc => return None,
            Some(_) => {}
        }
    }

    if is_descriptor {
        let bits = ty.elem.bit_width();
        return Some(SharedEncoding::NvMma(layout::nvmma_for_tile(
            &ty.shape, &order, bits, false,
        )));
    }
    Some(alloc_enc.unwrap_or_else(|| layout::generic_swizzled(order)))
}

/// Layout compatible with every dot-operand consumer of `value`, looking
/// through shared allocations. `None` when some user is not such a consumer
/// or two consumers disagree.
pub fn shared_enc_if_all_users_are_dot(m: &Module, value: ValueId) -> Option<SharedEncoding> {
    let mut found: Option<SharedEncoding> = None;
    for user in m.users(value) {
        let results = &m.op(user).results;
        if results.len() != 1 {
            return None;
        }
        let result_ty = m.ty(results[0]);
        let candidate = if let Type::MemDesc(desc) = result_ty {
            shared_enc_if_all_users_are_dot(m, results[0])?;
            desc.encoding.clone()
        } else {
            if !matches!(m.kind(user), OpKind::LocalLoad | OpKind::ConvertLayout) {
                return None;
            }
            let dot = match result_ty.as_tensor().and_then(|t| t.encoding.as_ref()) {
                Some(Encoding::DotOperand(d)) => d.clone(),
                _ => return None,
            };
            let src_ty = m.ty(value);
            layout::swizzled_for_dot_operand(
                &dot,
                src_ty.shape(),
                &value_order(src_ty),
                src_ty.element_bits(),
            )
        };
        match &found {
            Some(existing) if *existing != candidate => return None,
            _ => found = Some(candidate),
        }
    }
    found
}

// ── Classification ──────────────────────────────────────────────────────────

/// Classify every annotated load of `for_op`'s body.
pub fn classify_loads(m: &Module, for_op: OpId) -> LoadInfoMap {
    let mut infos = LoadInfoMap::default();
    let mut axis = AxisAnalysis::new(m);
    let loop_has_stages = m.num_stages(for_op).is_some();
    let body = m.for_body(for_op);

    for &op in &m.block(body).ops {
        let kind = m.kind(op);
        if !kind.is_load_like() {
            continue;
        }
        let Some(load_sc) = m.sched(op) else { continue };
        let Some((use_op, use_sc)) = first_use(m, op) else {
            trace!(load = %op, "no annotated consumer in the loop body");
            continue;
        };
        if use_sc.stage == load_sc.stage {
            trace!(load = %op, "consumer shares the load's stage");
            continue;
        }
        let dist = use_sc.stage - load_sc.stage;
        if dist < 1 {
            trace!(load = %op, dist, "consumer scheduled before the load");
            continue;
        }

        let is_descriptor = kind.is_descriptor_load();
        let users = transitive_users(m, op, loop_has_stages);
        let mut shared: Option<SharedEncoding> = None;
        let mut blocked = None;
        let mut used_by_dot = false;
        let mut is_wide = false;
        let mut is_scale = false;

        for &user in &users {
            if m.kind(user).is_dot_like() {
                used_by_dot = true;
                is_wide = is_wide_shared_buffer(m, op);
                shared = if is_wide || is_descriptor {
                    shared_encoding(m, op, is_descriptor)
                } else {
                    shared_enc_if_all_users_are_dot(m, m.result(op, 0))
                };
            }
            if shared.is_none() {
                shared = shared_encoding(m, op, is_descriptor);
                if matches!(m.kind(user), OpKind::ScaledMma) {
                    is_scale = true;
                }
                if let OpKind::Load(attrs) = m.kind(op) {
                    let ptr = m.operand(op, 0);
                    let mask = attrs.has_mask.then(|| m.operand(op, 1));
                    blocked = layout::blocked_for_load(m, &mut axis, ptr, mask, &m.target);
                }
            }
        }

        let Some(shared) = shared else {
            trace!(load = %op, "no shared layout for the load");
            continue;
        };
        debug!(
            load = %op,
            dist,
            used_by_dot,
            wide = is_wide,
            scale = is_scale,
            "load eligible for pipelining"
        );
        infos.insert(
            op,
            LoadInfo {
                shared,
                blocked,
                used_by_dot,
                is_wide_shared_operand: is_wide,
                is_scale_operand: is_scale,
                dist_to_use: dist,
                first_use: use_op,
                first_use_sched: use_sc,
            },
        );
    }
    infos
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn direct_matmul_loads_take_dot_operand_layout() {
        let fx = fixtures::matmul_direct(3);
        let infos = classify_loads(&fx.module, fx.for_op);
        assert_eq!(infos.len(), 2);
        let a = infos.get(fx.loads[0]).unwrap();
        assert!(a.used_by_dot);
        assert!(!a.is_wide_shared_operand);
        assert_eq!(a.dist_to_use, 2);
        assert!(a.blocked.is_none());
        match &a.shared {
            SharedEncoding::Swizzled(s) => {
                assert_eq!((s.vec, s.per_phase, s.max_phase), (8, 2, 4));
            }
            other => panic!("unexpected layout {other:?}"),
        }
    }

    #[test]
    fn descriptor_loads_feeding_mma_allocs_are_wide() {
        let fx = fixtures::matmul_tma(3);
        let infos = classify_loads(&fx.module, fx.for_op);
        assert_eq!(infos.len(), 2);
        for (_, info) in infos.iter() {
            assert!(info.is_wide_shared_operand);
            assert!(matches!(info.shared, SharedEncoding::NvMma(ref n) if n.swizzle_bytes == 128));
        }
    }

    #[test]
    fn same_stage_consumer_is_not_pipelined() {
        let mut fx = fixtures::matmul_direct(3);
        for &load in &fx.loads {
            let (user, _) = first_use(&fx.module, load).unwrap();
            fx.module.set_sched(user, Some(StageCluster::new(0, 1)));
        }
        assert!(classify_loads(&fx.module, fx.for_op).is_empty());
    }

    #[test]
    fn unannotated_loads_are_skipped() {
        let mut fx = fixtures::matmul_direct(2);
        fx.module.set_sched(fx.loads[0], None);
        let infos = classify_loads(&fx.module, fx.for_op);
        assert_eq!(infos.loads(), vec![fx.loads[1]]);
    }

    #[test]
    fn non_dot_load_gets_blocked_fallback() {
        let fx = fixtures::elementwise_stream(2);
        let infos = classify_loads(&fx.module, fx.for_op);
        let info = infos.get(fx.loads[0]).unwrap();
        assert!(!info.used_by_dot);
        assert!(matches!(info.shared, SharedEncoding::Swizzled(ref s) if s.vec == 1));
        let blocked = info.blocked.as_ref().unwrap();
        assert_eq!(blocked.size_per_thread, vec![4]);
    }

    #[test]
    fn transitive_users_stop_at_dot() {
        let fx = fixtures::matmul_direct(3);
        let users = transitive_users(&fx.module, fx.loads[0], true);
        assert_eq!(users[0], fx.dots[0]);
        assert!(users.len() == 2);
    }
}
