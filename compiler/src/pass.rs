// pass.rs — Pass descriptor module: metadata, dependency resolution, artifact IDs
//
// Declares the pipeliner's passes, their dependency edges, and the artifacts
// they produce. The first eight run on one annotated loop before the
// external pipeline expander; the last two run over the whole module after
// expansion and have no pre-expansion inputs.

use std::collections::HashSet;
use std::fmt;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Classify,
    PlanDescriptors,
    Allocate,
    RewriteDescriptors,
    GroupBarriers,
    LowerLoads,
    Schedule,
    Finalize,
    UpdateWaits,
    AsyncDots,
}

/// Machine-readable artifact identifiers. Each maps to a concrete type
/// in the pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    LoadInfo,       // LoadInfoMap
    DescriptorPlan, // DescriptorPlan
    Allocation,     // Allocation
    Descriptors,    // Vec<DescriptorBuffer>
    BarrierGroups,  // Vec<BarrierGroup>
    AsyncLoads,     // Vec<AsyncLoad>
    Schedule,       // FinalSchedule + PipeliningOptions
    Finalized,      // post-loop cleanup ops
    Waits,          // resolved wait counts
    AsyncDots,      // promoted dots
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics/verbose output.
    pub name: &'static str,
    /// Pass dependencies (other passes whose outputs this pass consumes).
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces.
    pub outputs: &'static [ArtifactId],
    /// What invalidates this pass's output.
    pub invalidation_key: &'static str,
    /// Pre/post conditions (documentation only).
    pub invariants: &'static str,
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Classify => PassDescriptor {
            name: "classify",
            inputs: &[],
            outputs: &[ArtifactId::LoadInfo],
            invalidation_key: "loop body + annotations + target",
            invariants: "every recorded load has a shared encoding and dist_to_use > 0",
        },
        PassId::PlanDescriptors => PassDescriptor {
            name: "plan_descriptors",
            inputs: &[],
            outputs: &[ArtifactId::DescriptorPlan],
            invalidation_key: "loop body",
            invariants: "every materialization is nested only under conditionals",
        },
        PassId::Allocate => PassDescriptor {
            name: "allocate",
            inputs: &[PassId::Classify, PassId::PlanDescriptors],
            outputs: &[ArtifactId::Allocation],
            invalidation_key: "load info + loop",
            invariants: "one ring per load, one stage group per depth, counters carried",
        },
        PassId::RewriteDescriptors => PassDescriptor {
            name: "rewrite_descriptors",
            inputs: &[PassId::Allocate],
            outputs: &[ArtifactId::Descriptors],
            invalidation_key: "descriptor plan + allocation",
            invariants: "counter reaches the loop yield through every enclosing conditional",
        },
        PassId::GroupBarriers => PassDescriptor {
            name: "group_barriers",
            inputs: &[PassId::Allocate],
            outputs: &[ArtifactId::BarrierGroups],
            invalidation_key: "load info + allocation",
            invariants: "each descriptor load belongs to exactly one group",
        },
        PassId::LowerLoads => PassDescriptor {
            name: "lower_loads",
            inputs: &[PassId::RewriteDescriptors, PassId::GroupBarriers],
            outputs: &[ArtifactId::AsyncLoads],
            invalidation_key: "allocation + barrier groups",
            invariants: "no eligible load remains, every copy targets its insert slot",
        },
        PassId::Schedule => PassDescriptor {
            name: "schedule",
            inputs: &[PassId::LowerLoads],
            outputs: &[ArtifactId::Schedule],
            invalidation_key: "annotated loop body",
            invariants: "every body op scheduled once, stages below num_stages",
        },
        PassId::Finalize => PassDescriptor {
            name: "finalize",
            inputs: &[PassId::Schedule],
            outputs: &[ArtifactId::Finalized],
            invalidation_key: "allocation",
            invariants: "drain wait, then barrier invalidation, then deallocation",
        },
        PassId::UpdateWaits => PassDescriptor {
            name: "update_waits",
            inputs: &[],
            outputs: &[ArtifactId::Waits],
            invalidation_key: "expanded module",
            invariants: "every single-token wait carries its minimal count",
        },
        PassId::AsyncDots => PassDescriptor {
            name: "async_dots",
            inputs: &[PassId::UpdateWaits],
            outputs: &[ArtifactId::AsyncDots],
            invalidation_key: "expanded loop",
            invariants: "at most the eligible dots remain in flight across iterations",
        },
    }
}

impl fmt::Display for PassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(descriptor(*self).name)
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order (used for iteration).
pub const ALL_PASSES: [PassId; 10] = [
    PassId::Classify,
    PassId::PlanDescriptors,
    PassId::Allocate,
    PassId::RewriteDescriptors,
    PassId::GroupBarriers,
    PassId::LowerLoads,
    PassId::Schedule,
    PassId::Finalize,
    PassId::UpdateWaits,
    PassId::AsyncDots,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Certificates ───────────────────────────────────────────────────────────

/// A postcondition certificate produced by checking one pass's output.
pub trait StageCert {
    /// Named obligations and whether each holds.
    fn obligations(&self) -> Vec<(&'static str, bool)>;

    fn all_pass(&self) -> bool {
        self.obligations().iter().all(|(_, ok)| *ok)
    }

    /// Names of the obligations that do not hold.
    fn failures(&self) -> Vec<&'static str> {
        self.obligations()
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| name)
            .collect()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
