// print.rs — Deterministic textual form of the IR
//
// Renders a module in an MLIR-like syntax. Value and block names are their
// arena ids, so output is stable across runs and usable for snapshots.
//
// Preconditions: module is well-formed (ids in range).
// Postconditions: output ends with a newline when non-empty.
// Failure modes: none.
// Side effects: none.

use std::fmt::Write as _;

use crate::id::{BlockId, OpId, ValueId};
use crate::ir::{CacheModifier, ConstValue, EvictionPolicy, LoadAttrs, Module, OpKind};

/// Render the whole module body.
pub fn print_module(m: &Module) -> String {
    let mut out = String::new();
    print_block_ops(m, m.body(), 0, &mut out);
    out
}

/// Render a single op (and its regions).
pub fn print_op(m: &Module, op: OpId) -> String {
    let mut out = String::new();
    print_op_into(m, op, 0, &mut out);
    out
}

/// One-line summary of `op` without its regions.
pub fn op_header(m: &Module, op: OpId) -> String {
    let record = m.op(op);
    let mut line = String::new();
    if !record.results.is_empty() {
        line.push_str(&join_values(&record.results));
        line.push_str(" = ");
    }
    line.push_str(record.kind.mnemonic());
    if let Some(attrs) = attributes(&record.kind) {
        line.push(' ');
        line.push_str(&attrs);
    }
    if !record.operands.is_empty() {
        line.push(' ');
        line.push_str(&join_values(&record.operands));
    }
    if !record.results.is_empty() {
        let types: Vec<String> = record.results.iter().map(|&v| m.ty(v).to_string()).collect();
        line.push_str(" : ");
        line.push_str(&types.join(", "));
    }
    if let Some(sc) = record.sched {
        let _ = write!(line, " @[{}, {}]", sc.stage, sc.cluster);
    }
    line
}

fn print_block_ops(m: &Module, block: BlockId, indent: usize, out: &mut String) {
    for &op in &m.block(block).ops {
        print_op_into(m, op, indent, out);
    }
}

fn print_op_into(m: &Module, op: OpId, indent: usize, out: &mut String) {
    let pad = " ".repeat(indent);
    let regions = &m.op(op).regions;
    if regions.is_empty() {
        let _ = writeln!(out, "{pad}{}", op_header(m, op));
        return;
    }
    let _ = writeln!(out, "{pad}{} {{", op_header(m, op));
    for (i, &region) in regions.iter().enumerate() {
        if i > 0 {
            let _ = writeln!(out, "{pad}}} {{");
        }
        let args = &m.block(region).args;
        if !args.is_empty() {
            let typed: Vec<String> = args.iter().map(|&a| format!("{a}: {}", m.ty(a))).collect();
            let _ = writeln!(out, "{pad}{region}({}):", typed.join(", "));
        }
        print_block_ops(m, region, indent + 2, out);
    }
    let _ = writeln!(out, "{pad}}}");
}

fn join_values(values: &[ValueId]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn load_attributes(attrs: &LoadAttrs) -> Option<String> {
    let mut parts = Vec::new();
    match attrs.cache {
        CacheModifier::None => {}
        CacheModifier::Ca => parts.push("cache=ca"),
        CacheModifier::Cg => parts.push("cache=cg"),
    }
    match attrs.evict {
        EvictionPolicy::Normal => {}
        EvictionPolicy::EvictFirst => parts.push("evict=first"),
        EvictionPolicy::EvictLast => parts.push("evict=last"),
    }
    if attrs.volatile {
        parts.push("volatile");
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

fn attributes(kind: &OpKind) -> Option<String> {
    match kind {
        OpKind::Constant(ConstValue::Int(v)) => Some(v.to_string()),
        OpKind::Constant(ConstValue::Float(v)) => Some(format!("{v:?}")),
        OpKind::Constant(ConstValue::Bool(v)) => Some(v.to_string()),
        OpKind::CmpI(pred) => Some(format!("{pred:?}").to_lowercase()),
        OpKind::ExpandDims { axis } => Some(format!("axis={axis}")),
        OpKind::MakeRange { start, end } => Some(format!("start={start} end={end}")),
        OpKind::Load(attrs) | OpKind::AsyncCopyGlobalToLocal(attrs) => load_attributes(attrs),
        OpKind::AsyncWait { num } => Some(format!("num={num}")),
        OpKind::InitBarrier { count } => Some(format!("count={count}")),
        OpKind::BarrierExpect { bytes } => Some(format!("bytes={bytes}")),
        OpKind::GlobalScratchAlloc { bytes, align } => Some(format!("bytes={bytes} align={align}")),
        OpKind::TensormapCreate { block_shape, elem } => {
            let dims: Vec<String> = block_shape.iter().map(|d| d.to_string()).collect();
            Some(format!("block=[{}] elem={elem}", dims.join(",")))
        }
        OpKind::WarpGroupDot { is_async: true } => Some("async".to_string()),
        OpKind::WarpGroupDotWait { pendings } => Some(format!("pendings={pendings}")),
        OpKind::For {
            num_stages: Some(n),
        } => Some(format!("num_stages={n}")),
        _ => None,
    }
}
