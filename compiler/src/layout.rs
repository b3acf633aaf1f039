// layout.rs — Register and shared-memory layout selection
//
// Constructors for the encodings chosen by the load classifier: the
// MMA-compatible shared layout (also required by descriptor copies), the
// generic swizzled fallback, the swizzled layout derived from a dot-operand
// register encoding, and the access-pattern blocked layout built from axis
// information.
//
// Preconditions: shapes are non-empty and positive.
// Postconditions: returned encodings have one entry per tensor dimension.
// Failure modes: none.
// Side effects: none.

use crate::axis::AxisAnalysis;
use crate::config::TargetConfig;
use crate::id::ValueId;
use crate::ir::Module;
use crate::types::{
    BlockedEncoding, DotOperandEncoding, Encoding, NvMmaShared, SharedEncoding, SwizzledShared,
};

/// Dimension order (fastest-varying first) of a register encoding.
pub fn order_of(encoding: Option<&Encoding>, rank: usize) -> Vec<u32> {
    let row_major = || (0..rank as u32).rev().collect::<Vec<_>>();
    match encoding {
        Some(Encoding::Blocked(b)) => b.order.clone(),
        Some(Encoding::DotOperand(d)) if rank >= 2 => {
            // K is the contiguous dimension of both operands.
            let k_dim = if d.op_idx == 0 { rank - 1 } else { rank - 2 };
            let mut order = vec![k_dim as u32];
            order.extend((0..rank as u32).rev().filter(|&i| i as usize != k_dim));
            order
        }
        _ => row_major(),
    }
}

/// Order used for shared buffers: rank-3 orders move the batch dim last.
pub fn shared_order(encoding: Option<&Encoding>, rank: usize) -> Vec<u32> {
    let order = order_of(encoding, rank);
    if order.len() != 3 {
        return order;
    }
    let mut out: Vec<u32> = order.into_iter().filter(|&d| d != 0).collect();
    out.push(0);
    out
}

/// MMA-compatible shared layout for a tile, swizzled by the byte width of its
/// contiguous dimension.
pub fn nvmma_for_tile(shape: &[i64], order: &[u32], element_bits: u32, fp4_padded: bool) -> NvMmaShared {
    let packing = if fp4_padded { 2 } else { 1 };
    let contig = order.first().map(|&d| shape[d as usize]).unwrap_or(1);
    let contig_bytes = contig * packing * element_bits as i64 / 8;
    let swizzle_bytes = [128, 64, 32]
        .into_iter()
        .find(|&w| contig_bytes >= w && contig_bytes % w == 0)
        .unwrap_or(0) as u32;
    NvMmaShared {
        swizzle_bytes,
        transposed: order.first() == Some(&0),
        element_bits,
        fp4_padded,
    }
}

/// Non-swizzled layout for loads that do not feed a dot.
pub fn generic_swizzled(order: Vec<u32>) -> SharedEncoding {
    SharedEncoding::Swizzled(SwizzledShared {
        vec: 1,
        per_phase: 1,
        max_phase: 1,
        order,
    })
}

/// Swizzled shared layout matching an mma dot operand (Ampere/Hopper rule).
pub fn swizzled_for_dot_operand(
    dot: &DotOperandEncoding,
    shape: &[i64],
    order: &[u32],
    element_bits: u32,
) -> SharedEncoding {
    let rank = order.len();
    let k_width = dot.k_width.max(1) as i64;
    let contig = shape[order[0] as usize].max(1);
    let mut per_phase = (128 / (contig * 4 / k_width).max(1)).max(1);
    let mat_shape = [8i64, 8, 4 * k_width];
    let vec_width = (32 / element_bits.max(1)) as i64;
    let inner = if dot.op_idx == 0 { rank - 1 } else { rank.saturating_sub(2) };
    if vec_width != k_width && order[0] as usize == inner {
        per_phase = per_phase.max(2 * vec_width);
    }
    let row_contig = order[0] as usize == rank - 1;
    let (vec, mma_stride) = if dot.op_idx == 0 {
        let (m, k) = (mat_shape[0], mat_shape[2]);
        if row_contig { (k, m) } else { (m, k) }
    } else {
        let (n, k) = (mat_shape[1], mat_shape[2]);
        if row_contig { (n, k) } else { (k, n) }
    };
    let max_phase = (mma_stride / per_phase).max(1);
    SharedEncoding::Swizzled(SwizzledShared {
        vec: vec as u32,
        per_phase: per_phase as u32,
        max_phase: max_phase as u32,
        order: order.to_vec(),
    })
}

/// Distribute lanes and warps over `shape`, starting from the contiguous
/// dimension and giving the remainder to the slowest one.
pub fn blocked_for_shape(
    shape: &[i64],
    size_per_thread: Vec<u32>,
    order: Vec<u32>,
    num_warps: u32,
    threads_per_warp: u32,
) -> BlockedEncoding {
    let rank = size_per_thread.len();
    let mut tpw = vec![1u32; rank];
    let mut wpc = vec![1u32; rank];
    let mut remaining_lanes = threads_per_warp;
    let mut remaining_threads = num_warps * threads_per_warp;
    let mut remaining_warps = num_warps;
    let mut prev_lanes = 1u32;
    let mut prev_warps = 1u32;
    for d in 0..rank.saturating_sub(1) {
        let i = order[d] as usize;
        let per_dim = ((shape[i] as u32) / size_per_thread[i].max(1)).max(1);
        let threads_per_cta = remaining_threads.clamp(1, per_dim);
        tpw[i] = threads_per_cta.clamp(1, remaining_lanes.max(1));
        wpc[i] = (threads_per_cta / tpw[i]).clamp(1, remaining_warps.max(1));
        remaining_warps /= wpc[i];
        remaining_lanes /= tpw[i];
        remaining_threads /= threads_per_cta;
        prev_lanes *= tpw[i];
        prev_warps *= wpc[i];
    }
    if let Some(&last) = order.get(rank.wrapping_sub(1)) {
        tpw[last as usize] = threads_per_warp / prev_lanes;
        wpc[last as usize] = num_warps / prev_warps;
    }
    BlockedEncoding {
        size_per_thread,
        threads_per_warp: tpw,
        warps_per_cta: wpc,
        order,
    }
}

/// Indices sorted by descending value; ties keep index order.
pub fn arg_sort_desc(values: &[i64]) -> Vec<u32> {
    let mut idx: Vec<u32> = (0..values.len() as u32).collect();
    idx.sort_by(|&a, &b| values[b as usize].cmp(&values[a as usize]));
    idx
}

/// Access-pattern blocked layout for a direct load of `ptr` (optionally
/// masked by `mask`).
pub fn blocked_for_load(
    m: &Module,
    axis: &mut AxisAnalysis<'_>,
    ptr: ValueId,
    mask: Option<ValueId>,
    target: &TargetConfig,
) -> Option<BlockedEncoding> {
    let ty = m.ty(ptr).as_tensor()?;
    let shape = ty.shape.clone();
    let info = axis.info(ptr);
    let order = arg_sort_desc(&info.contiguity);
    let fast = order[0] as usize;

    let elem_bits = ty.elem.pointee().bit_width().max(1);
    let elem_bytes = (elem_bits / 8).max(1) as i64;
    let max_multiple = (info.divisibility[fast] / elem_bytes).max(1);
    let max_contig = info.contiguity[fast].min(shape[fast]);
    let mut per_thread = max_multiple.min(max_contig).min(128 / elem_bits as i64).max(1);
    if let Some(mask) = mask {
        let mask_info = axis.info(mask);
        if let Some(&c) = mask_info.constancy.get(fast) {
            per_thread = per_thread.min(c.max(1));
        }
    }

    let mut size_per_thread = vec![1u32; shape.len()];
    size_per_thread[fast] = per_thread as u32;
    Some(blocked_for_shape(
        &shape,
        size_per_thread,
        order,
        target.num_warps,
        target.threads_per_warp,
    ))
}
