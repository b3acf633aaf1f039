// pipeline.rs — Pipeline state and pass orchestration
//
// Holds every pass artifact for one loop and runs the minimal set of passes
// for a given terminal PassId. Passes whose artifact is already present are
// skipped, so a driver may stop after classification and resume later.
//
// Preconditions: the loop carries a stage count; its body ops are annotated.
// Postconditions: artifacts for all required passes are populated, or an
//                 error names the failing pass.
// Failure modes: Aborted (diagnostics, loop unchanged) for unsupported
//                descriptor placement; Invariant for internal violations.
// Side effects: mutates the module; calls on_pass_complete after each pass.

use std::time::Instant;

use thiserror::Error;
use tracing::{debug, warn};

use crate::async_dot::{async_launch_dots, AsyncDotReport};
use crate::barrier::{group_barriers, BarrierGroup};
use crate::classify::{classify_loads, LoadInfoMap};
use crate::config::TargetConfig;
use crate::descriptor::{plan_descriptors, rewrite_descriptors, DescriptorBuffer, DescriptorPlan};
use crate::diag::Diagnostic;
use crate::id::OpId;
use crate::ir::{Module, OpKind};
use crate::lower::{async_loads, lower_loads, AsyncLoad};
use crate::multibuffer::{allocate, release_after_loop, Allocation};
use crate::pass::{required_passes, PassId, StageCert};
use crate::schedule::{
    clear_annotations, final_schedule, schedule_dependencies, verify_schedule, FinalSchedule,
    PipeliningOptions,
};
use crate::wait::{update_waits, WaitReport};

// ── Error type ─────────────────────────────────────────────────────────────

/// Why a pass stopped.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The loop cannot be pipelined; nothing was mutated.
    #[error("{pass}: loop not pipelined ({} diagnostic(s))", .diagnostics.len())]
    Aborted {
        pass: PassId,
        diagnostics: Vec<Diagnostic>,
    },
    /// An internal consistency check failed; the module may be half-rewritten.
    #[error("{pass}: internal invariant violated: {message}")]
    Invariant { pass: PassId, message: String },
}

impl PipelineError {
    pub fn invariant(pass: PassId, message: impl Into<String>) -> Self {
        PipelineError::Invariant {
            pass,
            message: message.into(),
        }
    }

    /// The pass that produced the error.
    pub fn pass(&self) -> PassId {
        match self {
            PipelineError::Aborted { pass, .. } | PipelineError::Invariant { pass, .. } => *pass,
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            PipelineError::Aborted { diagnostics, .. } => diagnostics,
            PipelineError::Invariant { .. } => &[],
        }
    }

    /// True when the module can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Invariant { .. })
    }
}

// ── Provenance ─────────────────────────────────────────────────────────────

/// Provenance metadata for reproducible runs.
///
/// `input_hash`: SHA-256 of the serialized input module.
/// `target_fingerprint`: SHA-256 of `TargetConfig::canonical_json()`.
/// `version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub input_hash: [u8; 32],
    pub target_fingerprint: [u8; 32],
    pub version: &'static str,
}

impl Provenance {
    /// Hex string of the input hash (64 characters).
    pub fn input_hash_hex(&self) -> String {
        bytes_to_hex(&self.input_hash)
    }

    /// Hex string of the target fingerprint (64 characters).
    pub fn target_fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.target_fingerprint)
    }

    /// Serialize provenance as a JSON string for `--emit build-info`.
    pub fn to_json(&self) -> String {
        format!(
            "{{\n  \"input_hash\": \"{}\",\n  \"target_fingerprint\": \"{}\",\n  \"version\": \"{}\"\n}}\n",
            self.input_hash_hex(),
            self.target_fingerprint_hex(),
            self.version,
        )
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

/// Compute provenance from the serialized input and the target.
pub fn compute_provenance(input: &str, target: &TargetConfig) -> Provenance {
    Provenance {
        input_hash: sha256(input.as_bytes()),
        target_fingerprint: sha256(target.canonical_json().as_bytes()),
        version: env!("CARGO_PKG_VERSION"),
    }
}

// ── State ──────────────────────────────────────────────────────────────────

/// The module under transformation and every artifact produced so far.
/// Pre-expansion passes act on `for_op`; post-expansion passes act on the
/// whole module.
pub struct PipelineState<'m> {
    pub module: &'m mut Module,
    pub for_op: Option<OpId>,
    pub num_stages: u32,
    pub load_info: Option<LoadInfoMap>,
    pub descriptor_plan: Option<DescriptorPlan>,
    pub allocation: Option<Allocation>,
    pub descriptors: Option<Vec<DescriptorBuffer>>,
    pub barrier_groups: Option<Vec<BarrierGroup>>,
    pub async_loads: Option<Vec<AsyncLoad>>,
    pub schedule: Option<FinalSchedule>,
    pub options: Option<PipeliningOptions>,
    pub finalized: Option<Vec<OpId>>,
    pub waits: Option<WaitReport>,
    pub async_dots: Option<Vec<AsyncDotReport>>,
}

impl<'m> PipelineState<'m> {
    /// State for pipelining `for_op` over `num_stages` stages.
    pub fn for_loop(module: &'m mut Module, for_op: OpId, num_stages: u32) -> Self {
        let mut state = Self::for_module(module);
        state.for_op = Some(for_op);
        state.num_stages = num_stages;
        state
    }

    /// State for the post-expansion passes.
    pub fn for_module(module: &'m mut Module) -> Self {
        PipelineState {
            module,
            for_op: None,
            num_stages: 0,
            load_info: None,
            descriptor_plan: None,
            allocation: None,
            descriptors: None,
            barrier_groups: None,
            async_loads: None,
            schedule: None,
            options: None,
            finalized: None,
            waits: None,
            async_dots: None,
        }
    }

    fn is_done(&self, pass: PassId) -> bool {
        match pass {
            PassId::Classify => self.load_info.is_some(),
            PassId::PlanDescriptors => self.descriptor_plan.is_some(),
            PassId::Allocate => self.allocation.is_some(),
            PassId::RewriteDescriptors => self.descriptors.is_some(),
            PassId::GroupBarriers => self.barrier_groups.is_some(),
            PassId::LowerLoads => self.async_loads.as_ref().is_some_and(|l| {
                l.iter().all(|al| al.extract_view.is_some())
            }),
            PassId::Schedule => self.schedule.is_some(),
            PassId::Finalize => self.finalized.is_some(),
            PassId::UpdateWaits => self.waits.is_some(),
            PassId::AsyncDots => self.async_dots.is_some(),
        }
    }
}

/// Unwrap an artifact a previous pass must have produced.
fn artifact<'a, T>(slot: &'a Option<T>, pass: PassId, name: &str) -> Result<&'a T, PipelineError> {
    slot.as_ref()
        .ok_or_else(|| PipelineError::invariant(pass, format!("missing {name} artifact")))
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `terminal`.
///
/// Per-pass sequence: execute → debug log with elapsed time → on_pass_complete.
pub fn run_passes(
    state: &mut PipelineState<'_>,
    terminal: PassId,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    for pass in required_passes(terminal) {
        if state.is_done(pass) {
            continue;
        }
        let t = Instant::now();
        let diags = run_pass(state, pass)?;
        let elapsed = t.elapsed();
        debug!(
            pass = %pass,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "pass complete"
        );
        on_pass_complete(pass, &diags);
    }
    Ok(())
}

fn loop_of(state: &PipelineState<'_>, pass: PassId) -> Result<OpId, PipelineError> {
    state
        .for_op
        .ok_or_else(|| PipelineError::invariant(pass, "no loop selected"))
}

fn run_pass(state: &mut PipelineState<'_>, pass: PassId) -> Result<Vec<Diagnostic>, PipelineError> {
    match pass {
        PassId::Classify => {
            let for_op = loop_of(state, pass)?;
            state.load_info = Some(classify_loads(state.module, for_op));
        }
        PassId::PlanDescriptors => {
            let for_op = loop_of(state, pass)?;
            match plan_descriptors(state.module, for_op) {
                Ok(plan) => state.descriptor_plan = Some(plan),
                Err(diagnostics) => {
                    return Err(PipelineError::Aborted { pass, diagnostics });
                }
            }
        }
        PassId::Allocate => {
            let for_op = loop_of(state, pass)?;
            let infos = artifact(&state.load_info, pass, "load info")?;
            let plan = artifact(&state.descriptor_plan, pass, "descriptor plan")?;
            let alloc = allocate(state.module, for_op, infos, plan.len())?;
            state.async_loads = Some(async_loads(&alloc));
            state.allocation = Some(alloc);
        }
        PassId::RewriteDescriptors => {
            let for_op = loop_of(state, pass)?;
            let plan = artifact(&state.descriptor_plan, pass, "descriptor plan")?;
            let alloc = artifact(&state.allocation, pass, "allocation")?;
            let buffers = rewrite_descriptors(state.module, for_op, plan, alloc, state.num_stages)?;
            state.descriptors = Some(buffers);
        }
        PassId::GroupBarriers => {
            let for_op = loop_of(state, pass)?;
            let infos = artifact(&state.load_info, pass, "load info")?;
            let alloc = artifact(&state.allocation, pass, "allocation")?;
            let Some(loads) = state.async_loads.as_mut() else {
                return Err(PipelineError::invariant(pass, "missing async loads artifact"));
            };
            let groups = group_barriers(state.module, for_op, infos, alloc, loads)?;
            state.barrier_groups = Some(groups);
        }
        PassId::LowerLoads => {
            let for_op = loop_of(state, pass)?;
            let infos = artifact(&state.load_info, pass, "load info")?;
            let alloc = artifact(&state.allocation, pass, "allocation")?;
            let Some(loads) = state.async_loads.as_mut() else {
                return Err(PipelineError::invariant(pass, "missing async loads artifact"));
            };
            lower_loads(state.module, for_op, infos, alloc, loads)?;
        }
        PassId::Schedule => {
            let for_op = loop_of(state, pass)?;
            let num_stages = state.num_stages;
            let pulled = schedule_dependencies(state.module, for_op, num_stages);
            let schedule = final_schedule(state.module, for_op, num_stages)?;
            let cert = verify_schedule(state.module, for_op, &schedule, num_stages);
            if !cert.all_pass() {
                return Err(PipelineError::invariant(
                    pass,
                    format!("schedule verification failed: {}", cert.failures().join(", ")),
                ));
            }
            debug!(pulled, ops = schedule.len(), "scheduled loop body");
            state.options = Some(PipeliningOptions::new(schedule.clone()));
            state.schedule = Some(schedule);
        }
        PassId::Finalize => {
            let for_op = loop_of(state, pass)?;
            let alloc = artifact(&state.allocation, pass, "allocation")?;
            let mut allocs = alloc.allocs();
            let barriers: Vec<_> = state
                .barrier_groups
                .iter()
                .flatten()
                .map(|g| g.barrier_alloc)
                .collect();
            allocs.extend(barriers.iter().copied());
            clear_annotations(state.module, for_op);
            state.finalized = Some(release_after_loop(state.module, for_op, &allocs, &barriers));
        }
        PassId::UpdateWaits => {
            state.waits = Some(update_waits(state.module));
        }
        PassId::AsyncDots => {
            let loops = match state.for_op {
                Some(for_op) => vec![for_op],
                None => state.module.loops(),
            };
            let loops: Vec<OpId> = loops
                .into_iter()
                .filter(|&l| has_warp_group_dot(state.module, l))
                .collect();
            let reports = loops
                .into_iter()
                .map(|l| async_launch_dots(state.module, l))
                .collect();
            state.async_dots = Some(reports);
        }
    }
    Ok(Vec::new())
}

fn has_warp_group_dot(m: &Module, for_op: OpId) -> bool {
    m.block(m.for_body(for_op))
        .ops
        .iter()
        .any(|&op| matches!(m.kind(op), OpKind::WarpGroupDot { .. }))
}

// ── Entry points ───────────────────────────────────────────────────────────

/// Everything the external expander needs, plus what was built for it.
#[derive(Debug, Clone)]
pub struct PipelinedLoop {
    pub for_op: OpId,
    pub num_stages: u32,
    pub load_info: LoadInfoMap,
    pub allocation: Allocation,
    pub descriptors: Vec<DescriptorBuffer>,
    pub barrier_groups: Vec<BarrierGroup>,
    pub async_loads: Vec<AsyncLoad>,
    pub options: PipeliningOptions,
    /// Post-loop drain, barrier invalidations and deallocations, in order.
    pub finalized: Vec<OpId>,
}

fn take<T>(slot: Option<T>, pass: PassId) -> Result<T, PipelineError> {
    slot.ok_or_else(|| PipelineError::invariant(pass, "pass produced no artifact"))
}

/// Pipeline one annotated loop. Returns `Ok(None)` and leaves the module
/// untouched when the loop has no stage count or no eligible load.
pub fn pipeline_loop(m: &mut Module, for_op: OpId) -> Result<Option<PipelinedLoop>, PipelineError> {
    let Some(num_stages) = m.num_stages(for_op) else {
        return Ok(None);
    };
    let mut state = PipelineState::for_loop(m, for_op, num_stages);
    run_passes(&mut state, PassId::Classify, |_, _| {})?;
    if state.load_info.as_ref().map_or(true, |i| i.is_empty()) {
        debug!(loop_op = %for_op, "no eligible loads");
        return Ok(None);
    }
    if let Err(err) = run_passes(&mut state, PassId::Finalize, |_, _| {}) {
        warn!(loop_op = %for_op, error = %err, "loop not pipelined");
        return Err(err);
    }
    Ok(Some(PipelinedLoop {
        for_op,
        num_stages,
        load_info: take(state.load_info, PassId::Classify)?,
        allocation: take(state.allocation, PassId::Allocate)?,
        descriptors: take(state.descriptors, PassId::RewriteDescriptors)?,
        barrier_groups: take(state.barrier_groups, PassId::GroupBarriers)?,
        async_loads: take(state.async_loads, PassId::LowerLoads)?,
        options: take(state.options, PassId::Schedule)?,
        finalized: take(state.finalized, PassId::Finalize)?,
    }))
}

/// Results of the post-expansion clean-up.
#[derive(Debug, Clone)]
pub struct PostExpansion {
    pub waits: WaitReport,
    pub async_dots: Vec<AsyncDotReport>,
}

/// Resolve wait counts over the whole module, then launch warp-group dots
/// asynchronously in every loop that has them.
pub fn run_post_expansion(m: &mut Module) -> Result<PostExpansion, PipelineError> {
    let mut state = PipelineState::for_module(m);
    run_passes(&mut state, PassId::AsyncDots, |_, _| {})?;
    Ok(PostExpansion {
        waits: take(state.waits, PassId::UpdateWaits)?,
        async_dots: take(state.async_dots, PassId::AsyncDots)?,
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, DescriptorPlacement, WgmmaVariant};
    use crate::print::print_module;

    fn stages_ascend_within_clusters(schedule: &FinalSchedule) -> bool {
        schedule
            .entries
            .windows(2)
            .all(|w| w[0].cluster != w[1].cluster || w[0].stage <= w[1].stage)
    }

    #[test]
    fn matmul_direct_pipelines_end_to_end() {
        let mut k = fixtures::matmul_direct(3);
        let pipelined = pipeline_loop(&mut k.module, k.for_op).unwrap().unwrap();
        assert_eq!(pipelined.allocation.buffers.len(), 2);
        assert_eq!(pipelined.allocation.groups.len(), 1);
        assert!(pipelined.barrier_groups.is_empty());
        assert!(k.loads.iter().all(|&l| k.module.is_erased(l)));
        let schedule = &pipelined.options.schedule;
        assert!(!schedule.is_empty());
        assert!(stages_ascend_within_clusters(schedule));
        assert!(!pipelined.options.peel_epilogue);
        // Annotations are consumed by the schedule.
        let body = k.module.for_body(k.for_op);
        assert!(k.module.walk_block(body).iter().all(|&op| k.module.sched(op).is_none()));
    }

    #[test]
    fn descriptor_load_at_distance_two_gets_one_barrier() {
        let mut k = fixtures::descriptor_dot(3);
        let pipelined = pipeline_loop(&mut k.module, k.for_op).unwrap().unwrap();
        assert_eq!(pipelined.allocation.buffers[0].num_buffers, 3);
        assert_eq!(pipelined.allocation.groups.len(), 1);
        assert!(pipelined.allocation.groups[0].phase.is_some());
        assert_eq!(pipelined.barrier_groups.len(), 1);
        assert_eq!(pipelined.barrier_groups[0].bytes, 128 * 64 * 2);
        assert!(stages_ascend_within_clusters(&pipelined.options.schedule));
    }

    #[test]
    fn three_stage_schedules_keep_stages_ordered_per_cluster() {
        for mut k in [
            fixtures::matmul_direct(3),
            fixtures::matmul_tma(3),
            fixtures::descriptor_dot(3),
        ] {
            let pipelined = pipeline_loop(&mut k.module, k.for_op).unwrap().unwrap();
            let schedule = &pipelined.options.schedule;
            assert!(
                stages_ascend_within_clusters(schedule),
                "stage decreases inside a cluster:\n{}",
                schedule.render(&k.module)
            );
        }
    }

    #[test]
    fn finalize_drains_then_invalidates_then_deallocates() {
        let mut k = fixtures::matmul_tma(3);
        let pipelined = pipeline_loop(&mut k.module, k.for_op).unwrap().unwrap();
        let kinds: Vec<&str> = pipelined
            .finalized
            .iter()
            .map(|&op| k.module.kind(op).mnemonic())
            .collect();
        assert_eq!(kinds[0], "ttg.async_wait");
        let first_dealloc = kinds.iter().position(|&k| k == "ttg.local_dealloc").unwrap();
        assert!(kinds[1..first_dealloc].iter().all(|&k| k == "ttng.inval_barrier"));
        assert!(kinds[first_dealloc..].iter().all(|&k| k == "ttg.local_dealloc"));
        // Two rings and one barrier array.
        assert_eq!(kinds.len() - first_dealloc, 3);
    }

    #[test]
    fn loop_without_stage_count_is_left_alone() {
        let mut k = fixtures::wgmma_loop(WgmmaVariant::Plain);
        let before = print_module(&k.module);
        assert!(pipeline_loop(&mut k.module, k.for_op).unwrap().is_none());
        assert_eq!(print_module(&k.module), before);
    }

    #[test]
    fn inner_loop_descriptor_aborts_without_mutation() {
        let mut k = fixtures::descriptor_materialized(3, DescriptorPlacement::InInnerLoop);
        let before = print_module(&k.module);
        let err = pipeline_loop(&mut k.module, k.for_op).unwrap_err();
        assert!(matches!(err, PipelineError::Aborted { pass: PassId::PlanDescriptors, .. }));
        assert!(!err.is_fatal());
        assert_eq!(err.diagnostics().len(), 1);
        assert_eq!(print_module(&k.module), before);
    }

    #[test]
    fn partial_run_stops_at_the_terminal_pass() {
        let mut k = fixtures::matmul_direct(3);
        let mut state = PipelineState::for_loop(&mut k.module, k.for_op, 3);
        let mut seen = Vec::new();
        run_passes(&mut state, PassId::GroupBarriers, |p, _| seen.push(p)).unwrap();
        assert_eq!(seen, required_passes(PassId::GroupBarriers));
        assert!(state.descriptors.is_none());
        assert!(state.schedule.is_none());
        // Resuming only runs what is missing.
        seen.clear();
        run_passes(&mut state, PassId::Schedule, |p, _| seen.push(p)).unwrap();
        assert_eq!(
            seen,
            vec![PassId::RewriteDescriptors, PassId::LowerLoads, PassId::Schedule]
        );
    }

    #[test]
    fn post_expansion_resolves_waits_and_dots() {
        let mut k = fixtures::expanded_copy_loop(3);
        let report = run_post_expansion(&mut k.module).unwrap();
        assert_eq!(report.waits.resolved, vec![(k.waits[0], 1)]);
        assert!(report.async_dots.is_empty());

        let mut w = fixtures::wgmma_loop(WgmmaVariant::Plain);
        let report = run_post_expansion(&mut w.module).unwrap();
        assert_eq!(report.async_dots.len(), 1);
        assert_eq!(report.async_dots[0].eligible, vec![(w.dots[0], 0)]);
    }

    #[test]
    fn provenance_is_deterministic() {
        let target = TargetConfig::default();
        let a = compute_provenance("{}", &target);
        let b = compute_provenance("{}", &target);
        assert_eq!(a.input_hash, b.input_hash);
        assert_eq!(a.input_hash_hex().len(), 64);
        assert_ne!(a.input_hash, compute_provenance("{ }", &target).input_hash);
        assert!(a.to_json().contains("\"target_fingerprint\""));
    }

    #[test]
    fn errors_name_their_pass() {
        let err = PipelineError::invariant(PassId::LowerLoads, "broken");
        assert_eq!(err.pass(), PassId::LowerLoads);
        assert_eq!(err.to_string(), "lower_loads: internal invariant violated: broken");
    }
}
