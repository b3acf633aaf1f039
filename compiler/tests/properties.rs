// Property-based tests for pipelining invariants.
//
// Three categories:
// 1. Ring counters: slot indices stay in range and the phase tracks wraps
// 2. Wait resolution: the resolved count is the largest hazard-free one
// 3. Whole-loop pipelining: generated stage counts satisfy every certificate
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use proptest::prelude::*;
use tilepipe::fixtures;
use tilepipe::ir::OpKind;
use tilepipe::pass::StageCert;
use tilepipe::pipeline::pipeline_loop;
use tilepipe::verify::{simulate_async_copies, simulate_rings, verify_pipelined, wait_count};
use tilepipe::wait::update_waits;

// ── 1. Ring counters ────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn ring_slots_stay_in_range(num_buffers in 1u32..9, iterations in 0u32..64) {
        let steps = simulate_rings(num_buffers, iterations);
        prop_assert_eq!(steps.len(), iterations as usize);
        let n = num_buffers as i64;
        for (i, s) in steps.iter().enumerate() {
            prop_assert!((0..n).contains(&s.insert));
            prop_assert!((0..n).contains(&s.extract));
            prop_assert_eq!(s.extract, i as i64 % n);
        }
    }

    #[test]
    fn phase_counts_completed_laps(num_buffers in 1u32..9, iterations in 1u32..64) {
        let steps = simulate_rings(num_buffers, iterations);
        let n = num_buffers as usize;
        for (i, s) in steps.iter().enumerate() {
            prop_assert_eq!(s.phase, ((i / n) % 2) as i64, "iteration {}", i);
        }
    }
}

// ── 2. Wait resolution ──────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn resolved_wait_is_the_loosest_safe_count(stages in 2u32..9, extra in 0u32..16) {
        let mut k = fixtures::expanded_copy_loop(stages);
        update_waits(&mut k.module);
        let pending = wait_count(&k.module, k.waits[0]).unwrap();
        prop_assert_eq!(pending, stages - 2);

        let iterations = stages + extra;
        prop_assert!(simulate_async_copies(stages, pending, iterations).is_ok());
        prop_assert!(simulate_async_copies(stages, pending + 1, iterations).is_err());
    }

    #[test]
    fn wait_resolution_is_idempotent(stages in 2u32..9) {
        let mut k = fixtures::expanded_copy_loop(stages);
        let first = update_waits(&mut k.module);
        let second = update_waits(&mut k.module);
        prop_assert_eq!(first.resolved, second.resolved);
        prop_assert_eq!(second.merged, 0);
    }
}

// ── 3. Whole-loop pipelining ───────────────────────────────────────────────

fn arb_kernel() -> impl Strategy<Value = fixtures::Kernel> {
    (0usize..4, 3u32..6).prop_map(|(which, stages)| match which {
        0 => fixtures::matmul_direct(stages),
        1 => fixtures::matmul_tma(stages),
        2 => fixtures::descriptor_dot(stages),
        _ => fixtures::elementwise_stream(stages),
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 24,
        max_shrink_iters: 50,
        .. ProptestConfig::default()
    })]

    #[test]
    fn pipelined_loops_satisfy_certificates(kernel in arb_kernel()) {
        let mut k = kernel;
        let p = pipeline_loop(&mut k.module, k.for_op).unwrap().unwrap();
        let cert = verify_pipelined(&k.module, &p);
        prop_assert!(cert.all_pass(), "failed obligations: {:?}", cert.failures());

        let clusters: Vec<i32> = p.options.schedule.entries.iter().map(|e| e.cluster).collect();
        prop_assert!(clusters.windows(2).all(|w| w[0] <= w[1]));
        prop_assert!(p.options.schedule.entries.iter().all(|e| e.stage < p.num_stages));

        // The loop is handed to the expander without scheduling attributes.
        let body = k.module.for_body(k.for_op);
        prop_assert!(k
            .module
            .walk_block(body)
            .iter()
            .all(|&op| k.module.sched(op).is_none()));
        let still_a_loop = matches!(k.module.kind(k.for_op), OpKind::For { .. });
        prop_assert!(still_a_loop);
    }
}
