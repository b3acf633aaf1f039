// Snapshot tests: lock the textual IR and simulation tables to detect
// unintended changes in printing or counter arithmetic.
//
// Snapshots are inline and managed by `insta`.
// Run `cargo insta review` after intentional output changes to update baselines.

use tilepipe::config::TargetConfig;
use tilepipe::ir::{Module, OpBuilder, OpKind};
use tilepipe::print::print_module;
use tilepipe::types::Type;
use tilepipe::verify::simulate_rings;
use tilepipe::wait::update_waits;

/// Two commit groups issued before the loop; each iteration waits on the
/// oldest and issues one more.
fn rotating_token_loop() -> Module {
    let mut m = Module::new(TargetConfig::default());
    let mut b = OpBuilder::at_end(m.body());
    let lb = b.const_i32(&mut m, 0);
    let ub = b.const_i32(&mut m, 4);
    let step = b.const_i32(&mut m, 1);
    let c0 = b.create1(&mut m, OpKind::AsyncCommitGroup, vec![], Type::Token);
    let c1 = b.create1(&mut m, OpKind::AsyncCommitGroup, vec![], Type::Token);
    let body = m.new_block(vec![Type::i32(), Type::Token, Type::Token]);
    let for_op = b.create(
        &mut m,
        OpKind::For { num_stages: None },
        vec![lb, ub, step, c0, c1],
        vec![Type::Token, Type::Token],
    );
    m.attach_region(for_op, body);
    let args = m.block(body).args.clone();

    let mut ib = OpBuilder::at_end(body);
    ib.create(&mut m, OpKind::AsyncWait { num: 0 }, vec![args[1]], vec![Type::Token]);
    let commit = ib.create1(&mut m, OpKind::AsyncCommitGroup, vec![], Type::Token);
    OpBuilder::at_end(body).create(&mut m, OpKind::Yield, vec![args[2], commit], vec![]);
    m
}

#[test]
fn snapshot_expanded_loop_before_wait_resolution() {
    let m = rotating_token_loop();
    insta::assert_snapshot!(print_module(&m), @r"
%0 = arith.constant 0 : i32
%1 = arith.constant 4 : i32
%2 = arith.constant 1 : i32
%3 = ttg.async_commit_group : !token
%4 = ttg.async_commit_group : !token
%8, %9 = scf.for %0, %1, %2, %3, %4 : !token, !token {
^bb1(%5: i32, %6: !token, %7: !token):
  %10 = ttg.async_wait num=0 %6 : !token
  %11 = ttg.async_commit_group : !token
  scf.yield %7, %11
}
");
}

#[test]
fn snapshot_expanded_loop_after_wait_resolution() {
    let mut m = rotating_token_loop();
    let report = update_waits(&mut m);
    assert_eq!(report.merged, 0);
    insta::assert_snapshot!(print_module(&m), @r"
%0 = arith.constant 0 : i32
%1 = arith.constant 4 : i32
%2 = arith.constant 1 : i32
%3 = ttg.async_commit_group : !token
%4 = ttg.async_commit_group : !token
%8, %9 = scf.for %0, %1, %2, %3, %4 : !token, !token {
^bb1(%5: i32, %6: !token, %7: !token):
  %10 = ttg.async_wait num=1 %6 : !token
  %11 = ttg.async_commit_group : !token
  scf.yield %7, %11
}
");
}

#[test]
fn snapshot_ring_counters_depth_three() {
    let table: String = simulate_rings(3, 7)
        .iter()
        .enumerate()
        .map(|(i, s)| format!("iter {i}: insert={} extract={} phase={}\n", s.insert, s.extract, s.phase))
        .collect();
    insta::assert_snapshot!(table, @r"
iter 0: insert=0 extract=0 phase=0
iter 1: insert=1 extract=1 phase=0
iter 2: insert=2 extract=2 phase=0
iter 3: insert=0 extract=0 phase=1
iter 4: insert=1 extract=1 phase=1
iter 5: insert=2 extract=2 phase=1
iter 6: insert=0 extract=0 phase=0
");
}
