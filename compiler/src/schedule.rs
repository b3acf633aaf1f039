// schedule.rs — Final (operation, stage) schedule for the pipeline expander
//
// Ops created by the earlier passes are pulled into the stage and cluster of
// the first annotated op that consumes them; the annotated body is then
// linearized cluster by cluster, keeping program order inside a cluster.
// The result, together with the expander options and the predication hook,
// is everything the external expander needs.
//
// Preconditions: the loop has been lowered; original ops carry annotations.
// Postconditions: every non-terminator body op appears exactly once in the
//                 schedule with a stage below `num_stages`.
// Failure modes: Invariant error for an op annotated beyond the last stage
//                or an op the predication hook cannot guard.
// Side effects: annotates unannotated body ops; `clear_annotations` and
//               `predicate_op` mutate the module.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::id::{OpId, ValueId};
use crate::ir::{Module, OpBuilder, OpKind, StageCluster};
use crate::pass::PassId;
use crate::pipeline::PipelineError;
use crate::types::{ElemType, ScalarType, Type};

// ── Public types ────────────────────────────────────────────────────────────

/// One entry of the final schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduledOp {
    pub op: OpId,
    pub stage: u32,
    pub cluster: i32,
}

/// Body ops in expander order with their stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FinalSchedule {
    pub entries: Vec<ScheduledOp>,
}

impl FinalSchedule {
    /// The `(operation, stage)` pairs handed to the expander.
    pub fn pairs(&self) -> Vec<(OpId, u32)> {
        self.entries.iter().map(|e| (e.op, e.stage)).collect()
    }

    pub fn stage_of(&self, op: OpId) -> Option<u32> {
        self.entries.iter().find(|e| e.op == op).map(|e| e.stage)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Text form with op mnemonics, one entry per line.
    pub fn render(&self, m: &Module) -> String {
        let mut out = String::new();
        for e in &self.entries {
            out.push_str(&format!(
                "{:>6}  stage {}  cluster {}  {}\n",
                e.op.to_string(),
                e.stage,
                e.cluster,
                m.kind(e.op).mnemonic()
            ));
        }
        out
    }
}

impl fmt::Display for FinalSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "FinalSchedule ({} ops)", self.entries.len())?;
        for e in &self.entries {
            writeln!(f, "  {} @ {}", e.op, e.stage)?;
        }
        Ok(())
    }
}

/// Guards one op with an iteration predicate.
pub type PredicateFn = fn(&mut Module, OpId, ValueId) -> Result<(), PipelineError>;

/// Configuration handed to the external expander alongside the schedule.
#[derive(Debug, Clone)]
pub struct PipeliningOptions {
    pub schedule: FinalSchedule,
    pub peel_epilogue: bool,
    pub support_dynamic_loops: bool,
    pub predicate: PredicateFn,
}

impl PipeliningOptions {
    pub fn new(schedule: FinalSchedule) -> Self {
        PipeliningOptions {
            schedule,
            peel_epilogue: false,
            support_dynamic_loops: true,
            predicate: predicate_op,
        }
    }
}

// ── Verification ────────────────────────────────────────────────────────────

/// Machine-checkable evidence for schedule postconditions.
#[derive(Debug, Clone)]
pub struct ScheduleCert {
    /// S1: every non-terminator body op appears exactly once.
    pub s1_every_op_once: bool,
    /// S2: every stage is below the loop's stage count.
    pub s2_stages_in_range: bool,
    /// S3: clusters never decrease along the schedule.
    pub s3_clusters_ordered: bool,
}

impl crate::pass::StageCert for ScheduleCert {
    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("S1_every_op_once", self.s1_every_op_once),
            ("S2_stages_in_range", self.s2_stages_in_range),
            ("S3_clusters_ordered", self.s3_clusters_ordered),
        ]
    }
}

pub fn verify_schedule(
    m: &Module,
    for_op: OpId,
    schedule: &FinalSchedule,
    num_stages: u32,
) -> ScheduleCert {
    let body_ops = body_ops(m, for_op);
    let mut seen = HashSet::with_capacity(schedule.len());
    let unique = schedule.entries.iter().all(|e| seen.insert(e.op));
    let s1 = unique
        && schedule.len() == body_ops.len()
        && body_ops.iter().all(|op| seen.contains(op));
    let s2 = schedule.entries.iter().all(|e| e.stage < num_stages);
    let s3 = schedule.entries.windows(2).all(|w| w[0].cluster <= w[1].cluster);
    ScheduleCert {
        s1_every_op_once: s1,
        s2_stages_in_range: s2,
        s3_clusters_ordered: s3,
    }
}

// ── Scheduling ──────────────────────────────────────────────────────────────

fn body_ops(m: &Module, for_op: OpId) -> Vec<OpId> {
    let body = m.for_body(for_op);
    m.block(body)
        .ops
        .iter()
        .copied()
        .filter(|&op| !m.kind(op).is_terminator())
        .collect()
}

/// Smallest and largest cluster among annotated body ops.
pub fn cluster_range(m: &Module, for_op: OpId) -> Option<(i32, i32)> {
    body_ops(m, for_op)
        .into_iter()
        .filter_map(|op| m.sched(op))
        .fold(None, |acc, sc| match acc {
            None => Some((sc.cluster, sc.cluster)),
            Some((lo, hi)) => Some((lo.min(sc.cluster), hi.max(sc.cluster))),
        })
}

/// Operands of `op` and of everything nested in it.
fn nested_operands(m: &Module, op: OpId) -> Vec<ValueId> {
    let mut values = m.op(op).operands.clone();
    for &region in &m.op(op).regions {
        for inner in m.walk_block(region) {
            values.extend(m.op(inner).operands.iter().copied());
        }
    }
    values
}

/// Pull unannotated producers into the stage and cluster of their earliest
/// consumer, visiting consumers stage by stage. Whatever is left lands in
/// stage 0 at the lowest cluster. Returns the number of ops annotated.
pub fn schedule_dependencies(m: &mut Module, for_op: OpId, num_stages: u32) -> usize {
    let body = m.for_body(for_op);
    let ops = body_ops(m, for_op);
    let mut annotated = 0;
    for stage in 0..num_stages as i32 {
        for &op in &ops {
            let Some(sc) = m.sched(op).filter(|sc| sc.stage == stage) else {
                continue;
            };
            let mut stack = vec![op];
            while let Some(consumer) = stack.pop() {
                for value in nested_operands(m, consumer) {
                    let Some(def) = m.defining_op(value) else { continue };
                    if m.op(def).parent != Some(body) || m.sched(def).is_some() {
                        continue;
                    }
                    m.set_sched(def, Some(sc));
                    annotated += 1;
                    stack.push(def);
                }
            }
        }
    }
    let min_cluster = cluster_range(m, for_op).map_or(0, |(lo, _)| lo);
    for op in ops {
        if m.sched(op).is_none() {
            m.set_sched(op, Some(StageCluster::new(0, min_cluster)));
            annotated += 1;
        }
    }
    annotated
}

/// Linearize the annotated body: clusters ascending, program order within a
/// cluster.
pub fn final_schedule(
    m: &Module,
    for_op: OpId,
    num_stages: u32,
) -> Result<FinalSchedule, PipelineError> {
    let Some((min_cluster, max_cluster)) = cluster_range(m, for_op) else {
        return Ok(FinalSchedule::default());
    };
    let mut buckets: Vec<Vec<ScheduledOp>> = vec![Vec::new(); (max_cluster - min_cluster + 1) as usize];
    for op in body_ops(m, for_op) {
        let Some(sc) = m.sched(op) else { continue };
        if sc.stage < 0 || sc.stage as u32 >= num_stages {
            return Err(PipelineError::invariant(
                PassId::Schedule,
                format!("{op} has stage {} but the loop has {num_stages}", sc.stage),
            ));
        }
        buckets[(sc.cluster - min_cluster) as usize].push(ScheduledOp {
            op,
            stage: sc.stage as u32,
            cluster: sc.cluster,
        });
    }
    let schedule = FinalSchedule {
        entries: buckets.into_iter().flatten().collect(),
    };
    debug!(ops = schedule.len(), clusters = max_cluster - min_cluster + 1, "final schedule");
    Ok(schedule)
}

/// Drop every stage annotation inside the loop.
pub fn clear_annotations(m: &mut Module, for_op: OpId) {
    for op in m.walk_block(m.for_body(for_op)) {
        m.set_sched(op, None);
    }
}

// ── Predication ─────────────────────────────────────────────────────────────

/// Ops that only compute values; they run unguarded.
fn is_pure(kind: &OpKind) -> bool {
    matches!(
        kind,
        OpKind::Constant(_)
            | OpKind::AddI
            | OpKind::SubI
            | OpKind::MulI
            | OpKind::XorI
            | OpKind::AndI
            | OpKind::CmpI(_)
            | OpKind::Select
            | OpKind::Splat
            | OpKind::Broadcast
            | OpKind::ExpandDims { .. }
            | OpKind::MakeRange { .. }
            | OpKind::AddPtr
            | OpKind::Elementwise(_)
            | OpKind::ConvertLayout
            | OpKind::MemDescSubview
            | OpKind::MemDescTrans
            | OpKind::MakeTensorDesc
            | OpKind::TensorDescToTmaPtr
            | OpKind::ReinterpretTensorDesc
            | OpKind::Yield
    )
}

/// Side-effecting ops that are harmless on a speculated iteration: they
/// touch only buffers the loop owns or wait on work already issued.
fn is_speculatable(kind: &OpKind) -> bool {
    matches!(
        kind,
        OpKind::LocalAlloc
            | OpKind::LocalLoad
            | OpKind::LocalDealloc
            | OpKind::AsyncCommitGroup
            | OpKind::AsyncWait { .. }
            | OpKind::Dot
            | OpKind::WarpGroupDot { .. }
            | OpKind::WarpGroupDotWait { .. }
            | OpKind::ScaledMma
            | OpKind::TmemAlloc
            | OpKind::TmemCopy
            | OpKind::TensormapCreate { .. }
            | OpKind::TensormapFenceAcquire
    )
}

/// `pred` broadcast to the shape of `like`, or `pred` itself for scalars.
fn mask_like(b: &mut OpBuilder, m: &mut Module, pred: ValueId, like: ValueId) -> ValueId {
    match m.ty(like) {
        Type::Tensor(t) => {
            let ty = Type::tensor(t.shape.clone(), ElemType::Scalar(ScalarType::I1), t.encoding.clone());
            b.create1(m, OpKind::Splat, vec![pred], ty)
        }
        _ => pred,
    }
}

/// And `mask` into the optional mask operand at `index`; returns true when
/// the operand had to be inserted.
fn fold_mask(m: &mut Module, op: OpId, index: usize, present: bool, mask: ValueId) -> bool {
    if present {
        let existing = m.operand(op, index);
        let mut b = OpBuilder::before(op).with_sched(m.sched(op));
        let combined = b.binary(m, OpKind::AndI, existing, mask);
        m.set_operand(op, index, combined);
        false
    } else {
        m.op_mut(op).operands.insert(index, mask);
        true
    }
}

/// Guard `op` so it has no effect when `pred` is false.
pub fn predicate_op(m: &mut Module, op: OpId, pred: ValueId) -> Result<(), PipelineError> {
    let kind = m.kind(op).clone();
    if is_pure(&kind) || is_speculatable(&kind) {
        return Ok(());
    }
    let mut b = OpBuilder::before(op).with_sched(m.sched(op));
    match kind {
        OpKind::Load(mut attrs) => {
            let ptr = m.operand(op, 0);
            let mask = mask_like(&mut b, m, pred, ptr);
            attrs.has_mask |= fold_mask(m, op, 1, attrs.has_mask, mask);
            m.op_mut(op).kind = OpKind::Load(attrs);
        }
        OpKind::AsyncCopyGlobalToLocal(mut attrs) => {
            let ptr = m.operand(op, 0);
            let mask = mask_like(&mut b, m, pred, ptr);
            attrs.has_mask |= fold_mask(m, op, 2, attrs.has_mask, mask);
            m.op_mut(op).kind = OpKind::AsyncCopyGlobalToLocal(attrs);
        }
        OpKind::Store { has_mask } => {
            let ptr = m.operand(op, 0);
            let mask = mask_like(&mut b, m, pred, ptr);
            let inserted = fold_mask(m, op, 2, has_mask, mask);
            m.op_mut(op).kind = OpKind::Store {
                has_mask: has_mask || inserted,
            };
        }
        OpKind::AsyncTmaCopy | OpKind::AsyncTmaGather | OpKind::BarrierExpect { .. } => {
            let last = m.op(op).operands.len() - 1;
            fold_mask(m, op, last, true, pred);
        }
        OpKind::WaitBarrier => {
            let present = m.op(op).operands.len() == 3;
            fold_mask(m, op, 2, present, pred);
        }
        OpKind::If if m.op(op).results.is_empty() => {
            fold_mask(m, op, 0, true, pred);
        }
        OpKind::If => {
            for region in m.op(op).regions.clone() {
                for inner in m.block(region).ops.clone() {
                    predicate_op(m, inner, pred)?;
                }
            }
        }
        other => {
            return Err(PipelineError::invariant(
                PassId::Schedule,
                format!("cannot predicate `{}`", other.mnemonic()),
            ))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::pass::StageCert;

    #[test]
    fn clusters_ascend_with_program_order_inside() {
        let mut k = fixtures::matmul_direct(3);
        schedule_dependencies(&mut k.module, k.for_op, 3);
        let s = final_schedule(&k.module, k.for_op, 3).unwrap();
        let cert = verify_schedule(&k.module, k.for_op, &s, 3);
        assert!(cert.all_pass(), "{:?}", cert.failures());
        // The dot's cluster 0 comes before the loads' cluster 1.
        let dot_pos = s.entries.iter().position(|e| e.op == k.dots[0]).unwrap();
        let load_pos = s.entries.iter().position(|e| e.op == k.loads[0]).unwrap();
        assert!(dot_pos < load_pos);
        assert_eq!(s.stage_of(k.loads[0]), Some(0));
        assert_eq!(s.stage_of(k.dots[0]), Some(2));
    }

    #[test]
    fn stage_beyond_loop_is_rejected() {
        let mut k = fixtures::matmul_direct(3);
        k.module.set_sched(k.dots[0], Some(StageCluster::new(3, 0)));
        let err = final_schedule(&k.module, k.for_op, 3).unwrap_err();
        assert!(matches!(err, PipelineError::Invariant { pass: PassId::Schedule, .. }));
    }

    #[test]
    fn producers_join_their_consumers_stage() {
        let mut k = fixtures::matmul_direct(3);
        let body = k.module.for_body(k.for_op);
        let iv = k.module.block(body).args[0];
        let load = k.loads[0];
        let mut b = OpBuilder::before(load);
        let one = b.const_i32(&mut k.module, 1);
        let next = b.binary(&mut k.module, OpKind::AddI, iv, one);
        let mut sb = OpBuilder::before(k.dots[0]).with_sched(Some(StageCluster::new(2, 0)));
        sb.create1(&mut k.module, OpKind::Elementwise("user".into()), vec![next], Type::i32());
        schedule_dependencies(&mut k.module, k.for_op, 3);
        let add = k.module.defining_op(next).unwrap();
        let c = k.module.defining_op(one).unwrap();
        assert_eq!(k.module.sched(add), Some(StageCluster::new(2, 0)));
        assert_eq!(k.module.sched(c), Some(StageCluster::new(2, 0)));
    }

    #[test]
    fn options_disable_epilogue_peeling() {
        let opts = PipeliningOptions::new(FinalSchedule::default());
        assert!(!opts.peel_epilogue);
        assert!(opts.support_dynamic_loops);
    }

    #[test]
    fn predicating_a_load_adds_a_splat_mask() {
        let mut k = fixtures::matmul_direct(3);
        let load = k.loads[0];
        let pred = OpBuilder::before(k.for_op).const_true(&mut k.module);
        predicate_op(&mut k.module, load, pred).unwrap();
        let m = &k.module;
        assert_eq!(m.kind(load), &OpKind::Load(crate::ir::LoadAttrs { has_mask: true, ..Default::default() }));
        let mask = m.operand(load, 1);
        assert!(matches!(m.kind(m.defining_op(mask).unwrap()), OpKind::Splat));
        assert_eq!(m.ty(mask).shape(), &[128, 32]);
    }

    #[test]
    fn predicating_a_barrier_wait_appends_the_predicate() {
        let mut k = fixtures::matmul_tma(3);
        let infos = crate::classify::classify_loads(&k.module, k.for_op);
        let alloc = crate::multibuffer::allocate(&mut k.module, k.for_op, &infos, 0).unwrap();
        let mut loads = crate::lower::async_loads(&alloc);
        let groups =
            crate::barrier::group_barriers(&mut k.module, k.for_op, &infos, &alloc, &mut loads).unwrap();
        let pred = OpBuilder::before(k.for_op).const_true(&mut k.module);
        predicate_op(&mut k.module, groups[0].wait, pred).unwrap();
        assert_eq!(k.module.op(groups[0].wait).operands.len(), 3);
        assert_eq!(k.module.operand(groups[0].wait, 2), pred);
    }

    #[test]
    fn unknown_side_effects_cannot_be_predicated() {
        let mut k = fixtures::matmul_direct(3);
        let body = k.module.for_body(k.for_op);
        let op = OpBuilder::at_start(body).create(&mut k.module, OpKind::Other("gpu.barrier".into()), vec![], vec![]);
        let pred = OpBuilder::before(k.for_op).const_true(&mut k.module);
        assert!(predicate_op(&mut k.module, op, pred).is_err());
    }
}
