// fixtures.rs — Canonical kernels
//
// Small hand-built modules exercising each pipelining path: direct pointer
// loads feeding a dot, descriptor loads feeding warp-group MMA through
// shared allocations, descriptor materializations under conditionals, an
// already-expanded copy loop for wait resolution, and warp-group MMA loops
// for async promotion. Shared by unit tests, integration tests, benches and
// the CLI's `--kernel` option.

use crate::config::TargetConfig;
use crate::id::{BlockId, OpId, ValueId};
use crate::ir::{CmpPredicate, ConstValue, LoadAttrs, Module, OpBuilder, OpKind, StageCluster};
use crate::layout;
use crate::types::{
    DotOperandEncoding, ElemType, Encoding, MemDescType, MmaEncoding, ScalarType, SharedEncoding,
    TensorDescType, Type,
};

/// A module with the loop of interest and the ops tests usually poke at.
#[derive(Debug, Clone)]
pub struct Kernel {
    pub module: Module,
    pub for_op: OpId,
    /// Candidate loads in body order.
    pub loads: Vec<OpId>,
    pub dots: Vec<OpId>,
    pub waits: Vec<OpId>,
}

/// Names accepted by [`by_name`].
pub const KERNEL_NAMES: &[&str] = &[
    "matmul-direct",
    "matmul-tma",
    "descriptor-dot",
    "descriptor-in-if",
    "descriptor-in-inner-loop",
    "elementwise-stream",
    "expanded-copy",
    "wgmma",
    "wgmma-chained",
];

/// Build a named kernel with the given stage count.
pub fn by_name(name: &str, num_stages: u32) -> Option<Kernel> {
    let kernel = match name {
        "matmul-direct" => matmul_direct(num_stages),
        "matmul-tma" => matmul_tma(num_stages),
        "descriptor-dot" => descriptor_dot(num_stages),
        "descriptor-in-if" => descriptor_materialized(num_stages, DescriptorPlacement::InIf { depth: 2 }),
        "descriptor-in-inner-loop" => {
            descriptor_materialized(num_stages, DescriptorPlacement::InInnerLoop)
        }
        "elementwise-stream" => elementwise_stream(num_stages),
        "expanded-copy" => expanded_copy_loop(num_stages),
        "wgmma" => wgmma_loop(WgmmaVariant::Plain),
        "wgmma-chained" => wgmma_loop(WgmmaVariant::Chained),
        _ => return None,
    };
    Some(kernel)
}

// ── Type helpers ────────────────────────────────────────────────────────────

const F16: ScalarType = ScalarType::F16;

fn blocked(shape: &[i64]) -> Encoding {
    Encoding::Blocked(layout::blocked_for_shape(shape, vec![1, 8], vec![1, 0], 4, 32))
}

fn mma(version: u32) -> MmaEncoding {
    MmaEncoding {
        version_major: version,
        warps_per_cta: vec![4, 1],
    }
}

fn dot_operand(op_idx: u32, version: u32) -> Encoding {
    Encoding::DotOperand(DotOperandEncoding {
        op_idx,
        parent: mma(version),
        k_width: 2,
    })
}

fn tile(shape: &[i64], elem: ScalarType, encoding: Encoding) -> Type {
    Type::tensor(shape.to_vec(), ElemType::Scalar(elem), Some(encoding))
}

fn accumulator(version: u32) -> Type {
    tile(&[128, 128], ScalarType::F32, Encoding::Mma(mma(version)))
}

fn nvmma_memdesc(shape: &[i64], mutable: bool) -> Type {
    let tile_shape = &shape[shape.len() - 2..];
    Type::MemDesc(MemDescType {
        shape: shape.to_vec(),
        elem: F16,
        encoding: SharedEncoding::NvMma(layout::nvmma_for_tile(tile_shape, &[1, 0], 16, false)),
        mutable,
        alloc_shape: shape.to_vec(),
    })
}

fn tensor_desc(block_shape: &[i64]) -> Type {
    Type::TensorDesc(TensorDescType {
        block_shape: block_shape.to_vec(),
        elem: F16,
    })
}

fn const_float(b: &mut OpBuilder, m: &mut Module, value: f64, ty: Type) -> ValueId {
    b.create1(m, OpKind::Constant(ConstValue::Float(value)), vec![], ty)
}

/// `splat(base) + broadcast(range(0, cols))` over a `[rows, cols]` tile.
fn tile_pointers(
    b: &mut OpBuilder,
    m: &mut Module,
    base: ValueId,
    shape: &[i64],
    encoding: Encoding,
) -> ValueId {
    let elem = match m.ty(base) {
        Type::Ptr(s) => *s,
        _ => F16,
    };
    let i32_elem = ElemType::Scalar(ScalarType::I32);
    let range = b.create1(
        m,
        OpKind::MakeRange { start: 0, end: shape[1] },
        vec![],
        Type::tensor(vec![shape[1]], i32_elem, None),
    );
    let row = b.create1(
        m,
        OpKind::ExpandDims { axis: 0 },
        vec![range],
        Type::tensor(vec![1, shape[1]], i32_elem, None),
    );
    let offsets = b.create1(
        m,
        OpKind::Broadcast,
        vec![row],
        Type::tensor(shape.to_vec(), i32_elem, Some(encoding.clone())),
    );
    let ptr_ty = Type::tensor(shape.to_vec(), ElemType::Ptr(elem), Some(encoding));
    let splat = b.create1(m, OpKind::Splat, vec![base], ptr_ty.clone());
    b.create1(m, OpKind::AddPtr, vec![splat, offsets], ptr_ty)
}

/// `for iv in 0..trip` carrying `inits`; returns the loop, its body block,
/// the induction variable and the carried arguments.
fn build_loop(
    b: &mut OpBuilder,
    m: &mut Module,
    trip: i64,
    num_stages: Option<u32>,
    inits: &[ValueId],
) -> (OpId, BlockId, ValueId, Vec<ValueId>) {
    let lb = b.const_i32(m, 0);
    let ub = b.const_i32(m, trip);
    let step = b.const_i32(m, 1);
    let types: Vec<Type> = inits.iter().map(|&v| m.ty(v).clone()).collect();
    let mut arg_types = vec![Type::i32()];
    arg_types.extend(types.iter().cloned());
    let body = m.new_block(arg_types);
    let mut operands = vec![lb, ub, step];
    operands.extend_from_slice(inits);
    let for_op = b.create(m, OpKind::For { num_stages }, operands, types);
    m.attach_region(for_op, body);
    let args = m.block(body).args.clone();
    (for_op, body, args[0], args[1..].to_vec())
}

fn stage(s: u32, cluster: i32) -> Option<StageCluster> {
    Some(StageCluster::new(s as i32, cluster))
}

// ── Pre-expansion kernels ───────────────────────────────────────────────────

/// `acc += a_tile · b_tile` with pointer loads converted to dot operands.
/// Loads and pointer increments run in stage 0, the dot in the last stage.
pub fn matmul_direct(num_stages: u32) -> Kernel {
    let mut m = Module::new(TargetConfig::default());
    let top = m.body();
    let a_base = m.add_block_arg(top, Type::Ptr(F16));
    let b_base = m.add_block_arg(top, Type::Ptr(F16));
    let mut b = OpBuilder::at_end(top);

    let (a_shape, b_shape) = ([128, 32], [32, 128]);
    let a_ptrs0 = tile_pointers(&mut b, &mut m, a_base, &a_shape, blocked(&a_shape));
    let b_ptrs0 = tile_pointers(&mut b, &mut m, b_base, &b_shape, blocked(&b_shape));
    let i32_elem = ElemType::Scalar(ScalarType::I32);
    let a_step = b.const_int(&mut m, 32, Type::tensor(a_shape.to_vec(), i32_elem, Some(blocked(&a_shape))));
    let b_step = b.const_int(
        &mut m,
        32 * 128,
        Type::tensor(b_shape.to_vec(), i32_elem, Some(blocked(&b_shape))),
    );
    let acc0 = const_float(&mut b, &mut m, 0.0, accumulator(2));
    let (for_op, body, _iv, args) =
        build_loop(&mut b, &mut m, 32, Some(num_stages), &[acc0, a_ptrs0, b_ptrs0]);
    let (acc, a_ptrs, b_ptrs) = (args[0], args[1], args[2]);

    let mut ib = OpBuilder::at_end(body).with_sched(stage(0, 1));
    let a_load = ib.create(
        &mut m,
        OpKind::Load(LoadAttrs::default()),
        vec![a_ptrs],
        vec![tile(&a_shape, F16, blocked(&a_shape))],
    );
    let b_load = ib.create(
        &mut m,
        OpKind::Load(LoadAttrs::default()),
        vec![b_ptrs],
        vec![tile(&b_shape, F16, blocked(&b_shape))],
    );
    let a_next = ib.binary(&mut m, OpKind::AddPtr, a_ptrs, a_step);
    let b_next = ib.binary(&mut m, OpKind::AddPtr, b_ptrs, b_step);

    ib.sched = stage(num_stages - 1, 0);
    let a_val = m.result(a_load, 0);
    let b_val = m.result(b_load, 0);
    let a_op = ib.create1(&mut m, OpKind::ConvertLayout, vec![a_val], tile(&a_shape, F16, dot_operand(0, 2)));
    let b_op = ib.create1(&mut m, OpKind::ConvertLayout, vec![b_val], tile(&b_shape, F16, dot_operand(1, 2)));
    let dot = ib.create(&mut m, OpKind::Dot, vec![a_op, b_op, acc], vec![accumulator(2)]);
    let next_acc = m.result(dot, 0);
    OpBuilder::at_end(body).create(&mut m, OpKind::Yield, vec![next_acc, a_next, b_next], vec![]);

    Kernel {
        module: m,
        for_op,
        loads: vec![a_load, b_load],
        dots: vec![dot],
        waits: vec![],
    }
}

/// Descriptor loads staged through MMA-layout shared allocations into a
/// warp-group dot.
pub fn matmul_tma(num_stages: u32) -> Kernel {
    let mut m = Module::new(TargetConfig::default());
    let top = m.body();
    let (a_shape, b_shape) = ([128, 64], [64, 128]);
    let desc_a = m.add_block_arg(top, tensor_desc(&a_shape));
    let desc_b = m.add_block_arg(top, tensor_desc(&b_shape));
    let mut b = OpBuilder::at_end(top);
    let zero = b.const_i32(&mut m, 0);
    let k_step = b.const_i32(&mut m, 64);
    let acc0 = const_float(&mut b, &mut m, 0.0, accumulator(3));
    let (for_op, body, iv, args) = build_loop(&mut b, &mut m, 16, Some(num_stages), &[acc0]);
    let acc = args[0];

    let mut ib = OpBuilder::at_end(body).with_sched(stage(0, 1));
    let k = ib.binary(&mut m, OpKind::MulI, iv, k_step);
    let a_load = ib.create(
        &mut m,
        OpKind::DescriptorLoad,
        vec![desc_a, zero, k],
        vec![tile(&a_shape, F16, blocked(&a_shape))],
    );
    let b_load = ib.create(
        &mut m,
        OpKind::DescriptorLoad,
        vec![desc_b, k, zero],
        vec![tile(&b_shape, F16, blocked(&b_shape))],
    );

    ib.sched = stage(num_stages - 1, 0);
    let a_val = m.result(a_load, 0);
    let b_val = m.result(b_load, 0);
    let a_smem = ib.create1(&mut m, OpKind::LocalAlloc, vec![a_val], nvmma_memdesc(&a_shape, false));
    let b_smem = ib.create1(&mut m, OpKind::LocalAlloc, vec![b_val], nvmma_memdesc(&b_shape, false));
    let dot = ib.create(
        &mut m,
        OpKind::WarpGroupDot { is_async: false },
        vec![a_smem, b_smem, acc],
        vec![accumulator(3)],
    );
    let next_acc = m.result(dot, 0);
    OpBuilder::at_end(body).create(&mut m, OpKind::Yield, vec![next_acc], vec![]);

    Kernel {
        module: m,
        for_op,
        loads: vec![a_load, b_load],
        dots: vec![dot],
        waits: vec![],
    }
}

/// One descriptor load converted to a dot operand; the other operand is
/// loop-invariant.
pub fn descriptor_dot(num_stages: u32) -> Kernel {
    descriptor_materialized(num_stages, DescriptorPlacement::Argument)
}

/// Where the loop's tensor descriptor comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorPlacement {
    /// Kernel argument; nothing to materialize.
    Argument,
    /// Materialized under `depth` nested conditionals with else branches.
    InIf { depth: usize },
    /// Materialized in a conditional without an else branch and consumed
    /// there; the pipelined load reads the argument descriptor.
    InIfWithoutElse,
    /// Materialized inside an inner loop.
    InInnerLoop,
}

/// `acc += load(desc) · b` where `desc` is placed per `placement`.
pub fn descriptor_materialized(num_stages: u32, placement: DescriptorPlacement) -> Kernel {
    let mut m = Module::new(TargetConfig::default());
    let top = m.body();
    let a_shape = [128, 64];
    let base = m.add_block_arg(top, Type::Ptr(F16));
    let desc_arg = m.add_block_arg(top, tensor_desc(&a_shape));
    let mut b = OpBuilder::at_end(top);
    let zero = b.const_i32(&mut m, 0);
    let k_step = b.const_i32(&mut m, 64);
    let rows = b.const_i32(&mut m, 1024);
    let cols = b.const_i32(&mut m, 512);
    let unit = b.const_i32(&mut m, 1);
    let threshold = b.const_i32(&mut m, 4);
    let b_op = const_float(&mut b, &mut m, 1.0, tile(&[64, 128], F16, dot_operand(1, 2)));
    let acc0 = const_float(&mut b, &mut m, 0.0, accumulator(2));
    let (for_op, body, iv, args) = build_loop(&mut b, &mut m, 16, Some(num_stages), &[acc0]);
    let acc = args[0];

    let make_desc_operands = vec![base, rows, cols, cols, unit];
    let mut ib = OpBuilder::at_end(body).with_sched(stage(0, 1));
    let k = ib.binary(&mut m, OpKind::MulI, iv, k_step);
    let cond = ib.cmp(&mut m, CmpPredicate::Slt, iv, threshold);
    let desc = match placement {
        DescriptorPlacement::Argument => desc_arg,
        DescriptorPlacement::InIf { depth } => {
            let if_op = nested_desc_if(&mut ib, &mut m, depth, cond, desc_arg, &make_desc_operands);
            m.result(if_op, 0)
        }
        DescriptorPlacement::InIfWithoutElse => {
            let if_op = ib.create(&mut m, OpKind::If, vec![cond], vec![]);
            let then_block = m.new_block(vec![]);
            m.attach_region(if_op, then_block);
            consume_fresh_descriptor(&mut m, then_block, &make_desc_operands, zero, k);
            OpBuilder::at_end(then_block).create(&mut m, OpKind::Yield, vec![], vec![]);
            desc_arg
        }
        DescriptorPlacement::InInnerLoop => {
            let (_, inner_body, _, _) = build_loop(&mut ib, &mut m, 2, None, &[]);
            consume_fresh_descriptor(&mut m, inner_body, &make_desc_operands, zero, k);
            OpBuilder::at_end(inner_body).create(&mut m, OpKind::Yield, vec![], vec![]);
            desc_arg
        }
    };
    let a_load = ib.create(
        &mut m,
        OpKind::DescriptorLoad,
        vec![desc, zero, k],
        vec![tile(&a_shape, F16, blocked(&a_shape))],
    );

    ib.sched = stage(num_stages - 1, 0);
    let a_val = m.result(a_load, 0);
    let a_op = ib.create1(&mut m, OpKind::ConvertLayout, vec![a_val], tile(&a_shape, F16, dot_operand(0, 2)));
    let dot = ib.create(&mut m, OpKind::Dot, vec![a_op, b_op, acc], vec![accumulator(2)]);
    let next_acc = m.result(dot, 0);
    OpBuilder::at_end(body).create(&mut m, OpKind::Yield, vec![next_acc], vec![]);

    Kernel {
        module: m,
        for_op,
        loads: vec![a_load],
        dots: vec![dot],
        waits: vec![],
    }
}

fn nested_desc_if(
    b: &mut OpBuilder,
    m: &mut Module,
    depth: usize,
    cond: ValueId,
    fallback: ValueId,
    make_desc_operands: &[ValueId],
) -> OpId {
    let desc_ty = m.ty(fallback).clone();
    let if_op = b.create(m, OpKind::If, vec![cond], vec![desc_ty.clone()]);
    let then_block = m.new_block(vec![]);
    let else_block = m.new_block(vec![]);
    m.attach_region(if_op, then_block);
    m.attach_region(if_op, else_block);
    let mut tb = OpBuilder::at_end(then_block);
    let desc = if depth <= 1 {
        tb.create1(m, OpKind::MakeTensorDesc, make_desc_operands.to_vec(), desc_ty)
    } else {
        let inner = nested_desc_if(&mut tb, m, depth - 1, cond, fallback, make_desc_operands);
        m.result(inner, 0)
    };
    tb.create(m, OpKind::Yield, vec![desc], vec![]);
    OpBuilder::at_end(else_block).create(m, OpKind::Yield, vec![fallback], vec![]);
    if_op
}

/// Materialize a descriptor in `block` and read one tile through it.
fn consume_fresh_descriptor(
    m: &mut Module,
    block: BlockId,
    make_desc_operands: &[ValueId],
    row: ValueId,
    col: ValueId,
) {
    let shape = [128, 64];
    let mut b = OpBuilder::at_end(block);
    let desc = b.create1(m, OpKind::MakeTensorDesc, make_desc_operands.to_vec(), tensor_desc(&shape));
    let ty = tile(&shape, F16, blocked(&shape));
    let x = b.create1(m, OpKind::DescriptorLoad, vec![desc, row, col], ty.clone());
    b.create1(m, OpKind::Elementwise("math.exp".to_string()), vec![x], ty);
}

/// `dst[i] = exp(src[i])` over 1-D tiles; the load never reaches a dot.
pub fn elementwise_stream(num_stages: u32) -> Kernel {
    let mut m = Module::new(TargetConfig::default());
    let top = m.body();
    let src = m.add_block_arg(top, Type::Ptr(ScalarType::F32));
    let dst = m.add_block_arg(top, Type::Ptr(ScalarType::F32));
    let mut b = OpBuilder::at_end(top);
    let n = 1024;
    let i32_ty = Type::tensor(vec![n], ElemType::Scalar(ScalarType::I32), None);
    let ptr_ty = Type::tensor(vec![n], ElemType::Ptr(ScalarType::F32), None);
    let range = b.create1(&mut m, OpKind::MakeRange { start: 0, end: n }, vec![], i32_ty.clone());
    let src_splat = b.create1(&mut m, OpKind::Splat, vec![src], ptr_ty.clone());
    let src_ptrs0 = b.binary(&mut m, OpKind::AddPtr, src_splat, range);
    let dst_splat = b.create1(&mut m, OpKind::Splat, vec![dst], ptr_ty);
    let dst_ptrs0 = b.binary(&mut m, OpKind::AddPtr, dst_splat, range);
    let step = b.const_int(&mut m, n, i32_ty);
    let (for_op, body, _iv, args) =
        build_loop(&mut b, &mut m, 8, Some(num_stages), &[src_ptrs0, dst_ptrs0]);
    let (src_ptrs, dst_ptrs) = (args[0], args[1]);

    let mut ib = OpBuilder::at_end(body).with_sched(stage(0, 0));
    let val_ty = Type::tensor(vec![n], ElemType::Scalar(ScalarType::F32), None);
    let load = ib.create(&mut m, OpKind::Load(LoadAttrs::default()), vec![src_ptrs], vec![val_ty.clone()]);
    let src_next = ib.binary(&mut m, OpKind::AddPtr, src_ptrs, step);
    let dst_next = ib.binary(&mut m, OpKind::AddPtr, dst_ptrs, step);
    ib.sched = stage(num_stages - 1, 0);
    let x = m.result(load, 0);
    let y = ib.create1(&mut m, OpKind::Elementwise("math.exp".to_string()), vec![x], val_ty);
    ib.create(&mut m, OpKind::Store { has_mask: false }, vec![dst_ptrs, y], vec![]);
    OpBuilder::at_end(body).create(&mut m, OpKind::Yield, vec![src_next, dst_next], vec![]);

    Kernel {
        module: m,
        for_op,
        loads: vec![load],
        dots: vec![],
        waits: vec![],
    }
}

// ── Post-expansion kernels ──────────────────────────────────────────────────

/// The shape an expander leaves behind for one direct load over
/// `num_stages` stages: a prologue issuing `num_stages - 1` copies, and a
/// body that waits on the oldest in-flight group, reads its slot and issues
/// the next copy. In-flight commit tokens rotate through the carried values.
/// The single wait starts with a count of 0.
pub fn expanded_copy_loop(num_stages: u32) -> Kernel {
    let depth = num_stages.max(2) as i64;
    let mut m = Module::new(TargetConfig::default());
    let top = m.body();
    let base = m.add_block_arg(top, Type::Ptr(F16));
    let mut b = OpBuilder::at_end(top);

    let n = 64;
    let ptr_ty = Type::tensor(vec![n], ElemType::Ptr(F16), None);
    let range = b.create1(
        &mut m,
        OpKind::MakeRange { start: 0, end: n },
        vec![],
        Type::tensor(vec![n], ElemType::Scalar(ScalarType::I32), None),
    );
    let splat = b.create1(&mut m, OpKind::Splat, vec![base], ptr_ty.clone());
    let src = b.binary(&mut m, OpKind::AddPtr, splat, range);
    let encoding = layout::generic_swizzled(vec![0]);
    let alloc = b.create1(
        &mut m,
        OpKind::LocalAlloc,
        vec![],
        Type::MemDesc(MemDescType {
            shape: vec![depth, n],
            elem: F16,
            encoding: encoding.clone(),
            mutable: true,
            alloc_shape: vec![depth, n],
        }),
    );
    let slot_ty = Type::MemDesc(MemDescType {
        shape: vec![n],
        elem: F16,
        encoding,
        mutable: true,
        alloc_shape: vec![depth, n],
    });
    let zero = b.const_i32(&mut m, 0);
    let one = b.const_i32(&mut m, 1);

    let mut commits = Vec::new();
    for slot in 0..depth - 1 {
        let idx = b.const_i32(&mut m, slot);
        let view = b.create1(&mut m, OpKind::MemDescSubview, vec![alloc, idx], slot_ty.clone());
        let token = b.create1(
            &mut m,
            OpKind::AsyncCopyGlobalToLocal(LoadAttrs::default()),
            vec![src, view],
            Type::Token,
        );
        commits.push(b.create1(&mut m, OpKind::AsyncCommitGroup, vec![token], Type::Token));
    }
    let insert0 = b.const_i32(&mut m, depth - 2);
    let extract0 = b.const_i32(&mut m, -1);
    let mut inits = vec![insert0, extract0];
    inits.extend(commits.iter().copied());
    let (for_op, body, _iv, args) = build_loop(&mut b, &mut m, 16, None, &inits);
    let (insert, extract, tokens) = (args[0], args[1], args[2..].to_vec());

    let mut ib = OpBuilder::at_end(body);
    let nb = ib.const_i32(&mut m, depth);
    let next_insert = ib.increment_modulo(&mut m, insert, nb, zero, one);
    let nb_ext = ib.const_i32(&mut m, depth);
    let next_extract = ib.increment_modulo(&mut m, extract, nb_ext, zero, one);
    let wait = ib.create(&mut m, OpKind::AsyncWait { num: 0 }, vec![tokens[0]], vec![Type::Token]);
    let read_view = ib.create1(&mut m, OpKind::MemDescSubview, vec![alloc, next_extract], slot_ty.clone());
    let wait_token = m.result(wait, 0);
    let val_ty = Type::tensor(vec![n], ElemType::Scalar(F16), None);
    let x = ib.create1(&mut m, OpKind::LocalLoad, vec![read_view, wait_token], val_ty.clone());
    ib.create1(&mut m, OpKind::Elementwise("math.exp".to_string()), vec![x], val_ty);
    let write_view = ib.create1(&mut m, OpKind::MemDescSubview, vec![alloc, next_insert], slot_ty);
    let token = ib.create1(
        &mut m,
        OpKind::AsyncCopyGlobalToLocal(LoadAttrs::default()),
        vec![src, write_view],
        Type::Token,
    );
    let commit = ib.create1(&mut m, OpKind::AsyncCommitGroup, vec![token], Type::Token);
    let mut yielded = vec![next_insert, next_extract];
    yielded.extend(tokens[1..].iter().copied());
    yielded.push(commit);
    OpBuilder::at_end(body).create(&mut m, OpKind::Yield, yielded, vec![]);

    Kernel {
        module: m,
        for_op,
        loads: vec![],
        dots: vec![],
        waits: vec![wait],
    }
}

/// Shapes of post-expansion warp-group MMA loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WgmmaVariant {
    /// The carried accumulator feeds only the dot.
    Plain,
    /// The carried accumulator is also read by an elementwise op.
    ElementwiseUse,
    /// Two dots chained through the accumulator.
    Chained,
    /// The dot result is also consumed under a conditional.
    UseUnderIf,
}

/// Warp-group MMA over double-buffered shared tiles, after expansion.
pub fn wgmma_loop(variant: WgmmaVariant) -> Kernel {
    let mut m = Module::new(TargetConfig::default());
    let top = m.body();
    let mut b = OpBuilder::at_end(top);
    let (a_shape, b_shape) = ([128, 64], [64, 128]);
    let a_alloc = b.create1(&mut m, OpKind::LocalAlloc, vec![], nvmma_memdesc(&[2, 128, 64], true));
    let b_alloc = b.create1(&mut m, OpKind::LocalAlloc, vec![], nvmma_memdesc(&[2, 64, 128], true));
    let zero = b.const_i32(&mut m, 0);
    let one = b.const_i32(&mut m, 1);
    let two = b.const_i32(&mut m, 2);
    let acc0 = const_float(&mut b, &mut m, 0.0, accumulator(3));
    let (for_op, body, iv, args) = build_loop(&mut b, &mut m, 16, None, &[acc0, zero]);
    let (acc, idx) = (args[0], args[1]);

    let view_ty = |alloc_shape: &[i64], shape: &[i64]| {
        let mut ty = nvmma_memdesc(shape, true);
        if let Type::MemDesc(d) = &mut ty {
            d.alloc_shape = alloc_shape.to_vec();
        }
        ty
    };
    let mut ib = OpBuilder::at_end(body);
    let next_idx = ib.increment_modulo(&mut m, idx, two, zero, one);
    let a_view = ib.create1(&mut m, OpKind::MemDescSubview, vec![a_alloc, next_idx], view_ty(&[2, 128, 64], &a_shape));
    let b_view = ib.create1(&mut m, OpKind::MemDescSubview, vec![b_alloc, next_idx], view_ty(&[2, 64, 128], &b_shape));
    let wgdot = OpKind::WarpGroupDot { is_async: false };

    let mut dots = Vec::new();
    if variant == WgmmaVariant::ElementwiseUse {
        ib.create1(&mut m, OpKind::Elementwise("arith.truncf".to_string()), vec![acc], accumulator(3));
    }
    let first = ib.create(&mut m, wgdot.clone(), vec![a_view, b_view, acc], vec![accumulator(3)]);
    dots.push(first);
    let mut result = m.result(first, 0);
    if variant == WgmmaVariant::Chained {
        let second = ib.create(&mut m, wgdot, vec![a_view, b_view, result], vec![accumulator(3)]);
        dots.push(second);
        result = m.result(second, 0);
    }
    if variant == WgmmaVariant::UseUnderIf {
        let cond = ib.cmp(&mut m, CmpPredicate::Eq, iv, zero);
        let if_op = ib.create(&mut m, OpKind::If, vec![cond], vec![]);
        let then_block = m.new_block(vec![]);
        m.attach_region(if_op, then_block);
        let mut tb = OpBuilder::at_end(then_block);
        tb.create1(&mut m, OpKind::Elementwise("arith.truncf".to_string()), vec![result], accumulator(3));
        tb.create(&mut m, OpKind::Yield, vec![], vec![]);
    }
    OpBuilder::at_end(body).create(&mut m, OpKind::Yield, vec![result, next_idx], vec![]);

    let final_acc = m.result(for_op, 0);
    OpBuilder::at_end(top).create1(
        &mut m,
        OpKind::Elementwise("arith.truncf".to_string()),
        vec![final_acc],
        accumulator(3),
    );

    Kernel {
        module: m,
        for_op,
        loads: vec![],
        dots,
        waits: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_named_kernel_builds_a_loop() {
        for name in KERNEL_NAMES {
            let kernel = by_name(name, 3).unwrap();
            assert!(kernel.module.loops().contains(&kernel.for_op), "{name}");
            assert!(kernel.module.for_yield(kernel.for_op).is_some(), "{name}");
        }
        assert!(by_name("nope", 3).is_none());
    }

    #[test]
    fn matmul_direct_annotates_loads_and_dot() {
        let k = matmul_direct(3);
        for &load in &k.loads {
            assert_eq!(k.module.sched(load), Some(StageCluster::new(0, 1)));
        }
        assert_eq!(k.module.sched(k.dots[0]), Some(StageCluster::new(2, 0)));
    }

    #[test]
    fn expanded_loop_rotates_tokens() {
        let k = expanded_copy_loop(3);
        // insert, extract and two in-flight tokens.
        assert_eq!(k.module.for_iter_args(k.for_op).len(), 4);
    }

    #[test]
    fn nested_conditionals_reach_requested_depth() {
        let k = descriptor_materialized(3, DescriptorPlacement::InIf { depth: 2 });
        let make_desc = k
            .module
            .walk()
            .into_iter()
            .find(|&op| matches!(k.module.kind(op), OpKind::MakeTensorDesc))
            .unwrap();
        let inner_if = k.module.parent_op(make_desc).unwrap();
        let outer_if = k.module.parent_op(inner_if).unwrap();
        assert_eq!(k.module.parent_op(outer_if), Some(k.for_op));
    }
}
