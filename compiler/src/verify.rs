// verify.rs — Postcondition certificates and ring-buffer simulation
//
// Checks a pipelined loop against the shape the expander relies on, and
// simulates slot counters and in-flight copy groups over concrete iteration
// counts. The simulations mirror the IR's counter arithmetic; they are the
// oracle for the property tests.

use std::collections::VecDeque;

use serde::Serialize;

use crate::id::{OpId, ValueId};
use crate::ir::{Module, OpKind};
use crate::pass::StageCert;
use crate::pipeline::PipelinedLoop;

// ── Certificate ────────────────────────────────────────────────────────────

/// Machine-checkable evidence for pipelining postconditions.
#[derive(Debug, Clone)]
pub struct PipelineCert {
    /// P1: no eligible load survives.
    pub p1_loads_replaced: bool,
    /// P2: every copy writes its group's insert slot.
    pub p2_copies_hit_insert_slot: bool,
    /// P3: every read goes through its group's extract slot.
    pub p3_reads_hit_extract_slot: bool,
    /// P4: the yield carries every advanced counter in its layout slot.
    pub p4_counters_carried: bool,
    /// P5: post-loop drain, then invalidations, then deallocations.
    pub p5_release_order: bool,
    /// P6: every schedule entry is a live body op.
    pub p6_schedule_live: bool,
}

impl StageCert for PipelineCert {
    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("P1_loads_replaced", self.p1_loads_replaced),
            ("P2_copies_hit_insert_slot", self.p2_copies_hit_insert_slot),
            ("P3_reads_hit_extract_slot", self.p3_reads_hit_extract_slot),
            ("P4_counters_carried", self.p4_counters_carried),
            ("P5_release_order", self.p5_release_order),
            ("P6_schedule_live", self.p6_schedule_live),
        ]
    }
}

/// Slot index operand of the view `view`, if it is a subview.
fn slot_of(m: &Module, view: ValueId) -> Option<ValueId> {
    let def = m.defining_op(view)?;
    matches!(m.kind(def), OpKind::MemDescSubview).then(|| m.operand(def, 1))
}

fn release_rank(kind: &OpKind) -> Option<u8> {
    match kind {
        OpKind::AsyncWait { .. } => Some(0),
        OpKind::InvalBarrier => Some(1),
        OpKind::LocalDealloc => Some(2),
        OpKind::MemDescSubview | OpKind::Constant(_) => None,
        _ => Some(u8::MAX),
    }
}

pub fn verify_pipelined(m: &Module, p: &PipelinedLoop) -> PipelineCert {
    let group = |n: u32| p.allocation.group(n);

    let p1 = p.async_loads.iter().all(|al| m.is_erased(al.load));

    let p2 = p.async_loads.iter().all(|al| {
        let Some(copy) = al.copy else { return false };
        let dst_index = match m.kind(copy) {
            OpKind::AsyncCopyGlobalToLocal(_) => 1,
            OpKind::AsyncTmaCopy | OpKind::AsyncTmaGather => m.op(copy).operands.len() - 2,
            _ => return false,
        };
        let insert = group(al.num_buffers).map(|g| g.insert_idx);
        insert.is_some() && slot_of(m, m.operand(copy, dst_index)) == insert
    });

    let p3 = p.async_loads.iter().all(|al| {
        let extract = group(al.num_buffers).map(|g| g.extract_idx);
        extract.is_some() && al.extract_view.and_then(|v| slot_of(m, v)) == extract
    });

    let p4 = m.for_yield(p.for_op).is_some_and(|y| {
        let operands = &m.op(y).operands;
        p.allocation.layout.groups.iter().all(|slots| {
            let Some(g) = group(slots.num_buffers) else { return false };
            let phase_ok = match (slots.phase, g.phase) {
                (Some(i), Some(v)) => operands.get(i) == Some(&v),
                (None, None) => true,
                _ => false,
            };
            operands.get(slots.insert) == Some(&g.insert_idx)
                && operands.get(slots.extract) == Some(&g.extract_idx)
                && phase_ok
        }) && p
            .descriptors
            .iter()
            .all(|d| operands.get(d.counter_slot).is_some_and(|&v| m.block_arg(v).is_none()))
    });

    let ranks: Vec<u8> = p
        .finalized
        .iter()
        .filter_map(|&op| release_rank(m.kind(op)))
        .collect();
    let p5 = ranks.first() == Some(&0)
        && ranks.windows(2).all(|w| w[0] <= w[1])
        && ranks.iter().all(|&r| r != u8::MAX);

    let body = m.for_body(p.for_op);
    let p6 = p
        .options
        .schedule
        .entries
        .iter()
        .all(|e| !m.is_erased(e.op) && m.op(e.op).parent == Some(body));

    PipelineCert {
        p1_loads_replaced: p1,
        p2_copies_hit_insert_slot: p2,
        p3_reads_hit_extract_slot: p3,
        p4_counters_carried: p4,
        p5_release_order: p5,
        p6_schedule_live: p6,
    }
}

// ── Simulation ─────────────────────────────────────────────────────────────

/// Counter values seen by one iteration of the pipelined body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RingStep {
    pub insert: i64,
    pub extract: i64,
    pub phase: i64,
}

/// Run the in-body counter updates of a stage group of depth `num_buffers`
/// for `iterations` iterations, starting from the carried initial values.
pub fn simulate_rings(num_buffers: u32, iterations: u32) -> Vec<RingStep> {
    let n = num_buffers as i64;
    let (mut insert, mut extract, mut phase) = (-1i64, -1i64, 0i64);
    let mut steps = Vec::with_capacity(iterations as usize);
    for _ in 0..iterations {
        let next_insert = insert + 1;
        insert = if next_insert < n { next_insert } else { 0 };
        let next_extract = extract + 1;
        let in_range = next_extract < n;
        extract = if in_range { next_extract } else { 0 };
        phase = if in_range { phase } else { phase ^ 1 };
        steps.push(RingStep {
            insert,
            extract,
            phase,
        });
    }
    steps
}

/// A read that could observe a copy still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hazard {
    pub iteration: u32,
    pub slot: i64,
}

/// Model the expanded single-load loop: a prologue issues `depth - 1` copy
/// groups, and each iteration waits until at most `pending` groups are in
/// flight, reads the oldest slot and issues the next copy. Returns the first
/// read or overwrite of a slot whose copy has not completed.
pub fn simulate_async_copies(depth: u32, pending: u32, iterations: u32) -> Result<(), Hazard> {
    let n = depth as i64;
    let mut in_flight: VecDeque<i64> = (0..n - 1).collect();
    let (mut insert, mut extract) = (n - 2, -1i64);
    for iteration in 0..iterations {
        while in_flight.len() > pending as usize {
            in_flight.pop_front();
        }
        extract = (extract + 1) % n;
        if in_flight.contains(&extract) {
            return Err(Hazard {
                iteration,
                slot: extract,
            });
        }
        insert = (insert + 1) % n;
        if insert == extract || in_flight.contains(&insert) {
            return Err(Hazard {
                iteration,
                slot: insert,
            });
        }
        in_flight.push_back(insert);
    }
    Ok(())
}

/// Count carried by an async copy wait.
pub fn wait_count(m: &Module, wait: OpId) -> Option<u32> {
    match m.kind(wait) {
        OpKind::AsyncWait { num } => Some(*num),
        _ => None,
    }
}
