// End-to-end tests over the library API: serialized modules in, pipelined
// loops out, followed by the post-expansion clean-up.

use tilepipe::fixtures::{self, DescriptorPlacement, WgmmaVariant};
use tilepipe::ir::{Module, OpKind};
use tilepipe::pass::StageCert;
use tilepipe::pipeline::{pipeline_loop, run_post_expansion, PipelineError};
use tilepipe::print::print_module;
use tilepipe::verify::verify_pipelined;

fn roundtrip(m: &Module) -> Module {
    let json = serde_json::to_string(m).unwrap();
    serde_json::from_str(&json).unwrap()
}

fn count(m: &Module, mnemonic: &str) -> usize {
    m.walk()
        .into_iter()
        .filter(|&op| m.kind(op).mnemonic() == mnemonic)
        .count()
}

#[test]
fn every_named_kernel_builds() {
    for name in fixtures::KERNEL_NAMES {
        assert!(fixtures::by_name(name, 3).is_some(), "{name}");
    }
    assert!(fixtures::by_name("no-such-kernel", 3).is_none());
}

#[test]
fn deserialized_module_pipelines_like_the_original() {
    let k = fixtures::matmul_direct(3);
    let mut original = k.module.clone();
    let mut decoded = roundtrip(&k.module);
    pipeline_loop(&mut original, k.for_op).unwrap().unwrap();
    pipeline_loop(&mut decoded, k.for_op).unwrap().unwrap();
    assert_eq!(print_module(&original), print_module(&decoded));
}

#[test]
fn direct_loads_become_committed_async_copies() {
    let mut k = fixtures::matmul_direct(3);
    let p = pipeline_loop(&mut k.module, k.for_op).unwrap().unwrap();
    assert!(verify_pipelined(&k.module, &p).all_pass());
    assert!(k.loads.iter().all(|&l| k.module.is_erased(l)));

    let m = &k.module;
    assert_eq!(count(m, "ttg.async_copy_global_to_local"), k.loads.len());
    assert_eq!(count(m, "ttg.async_commit_group"), k.loads.len());
    assert_eq!(count(m, "ttg.local_dealloc"), p.allocation.buffers.len());
    assert_eq!(count(m, "ttng.init_barrier"), 0);
}

#[test]
fn descriptor_loads_arrive_on_barriers() {
    let mut k = fixtures::matmul_tma(3);
    let p = pipeline_loop(&mut k.module, k.for_op).unwrap().unwrap();
    assert!(verify_pipelined(&k.module, &p).all_pass());

    let m = &k.module;
    assert_eq!(count(m, "ttng.async_tma_copy_global_to_local"), k.loads.len());
    assert!(count(m, "ttng.wait_barrier") >= 1);
    assert_eq!(count(m, "ttng.init_barrier"), count(m, "ttng.inval_barrier"));
    assert!(p.async_loads.iter().all(|al| al.is_descriptor_load && al.barrier.is_some()));
}

#[test]
fn materialized_descriptor_in_conditional_uses_scratch_ring() {
    let mut k = fixtures::descriptor_materialized(3, DescriptorPlacement::InIf { depth: 2 });
    let p = pipeline_loop(&mut k.module, k.for_op).unwrap().unwrap();
    assert!(verify_pipelined(&k.module, &p).all_pass());
    assert_eq!(p.descriptors.len(), 1);
    assert_eq!(count(&k.module, "tt.make_tensor_descriptor"), 0);
    assert!(count(&k.module, "ttng.tensormap_create") >= 1);
    assert!(count(&k.module, "ttg.global_scratch_alloc") >= 1);
}

#[test]
fn rejected_loop_reports_diagnostics_and_keeps_the_module() {
    let mut k = fixtures::descriptor_materialized(3, DescriptorPlacement::InInnerLoop);
    let before = print_module(&k.module);
    match pipeline_loop(&mut k.module, k.for_op) {
        Err(PipelineError::Aborted { diagnostics, .. }) => {
            assert!(diagnostics.iter().all(|d| d.is_error()));
            assert!(!diagnostics.is_empty());
        }
        other => panic!("expected an aborted pipeline, got {other:?}"),
    }
    assert_eq!(print_module(&k.module), before);
}

#[test]
fn post_expansion_launches_dots_and_waits_once() {
    let mut k = fixtures::wgmma_loop(WgmmaVariant::Plain);
    let report = run_post_expansion(&mut k.module).unwrap();
    let dots = &report.async_dots[0];
    assert_eq!(dots.promoted, k.dots);
    assert!(k
        .dots
        .iter()
        .all(|&d| matches!(k.module.kind(d), OpKind::WarpGroupDot { is_async: true })));
    // One in-loop wait after the dot and one drain after the loop.
    assert_eq!(count(&k.module, "ttng.warp_group_dot_wait"), 2);
}

#[test]
fn chained_dots_post_expansion_is_deterministic() {
    let a = {
        let mut k = fixtures::wgmma_loop(WgmmaVariant::Chained);
        run_post_expansion(&mut k.module).unwrap();
        print_module(&k.module)
    };
    let b = {
        let mut k = fixtures::wgmma_loop(WgmmaVariant::Chained);
        run_post_expansion(&mut k.module).unwrap();
        print_module(&k.module)
    };
    assert_eq!(a, b);
}
