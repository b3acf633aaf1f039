// axis.rs — Contiguity / divisibility / constancy analysis
//
// Forward dataflow over tensor and scalar integer values. For each dimension
// it tracks how many consecutive elements form an arithmetic run of stride 1
// (contiguity), the largest power of two dividing every run's first element
// (divisibility, in bytes for pointers), and how many consecutive elements
// are equal (constancy). Results feed the access-pattern blocked layout.
//
// Preconditions: module is well-formed.
// Postconditions: every queried value receives an `AxisInfo` with one entry
//                 per dimension (one entry for scalars).
// Failure modes: none; untraceable values get the pessimistic info.
// Side effects: none (memoized in the analysis object).

use std::collections::HashMap;

use crate::id::{BlockId, ValueId};
use crate::ir::{ConstValue, Module, OpKind};
use crate::types::Type;

/// Cap on tracked divisibility.
pub const MAX_DIVISIBILITY: i64 = 1 << 30;
/// Byte divisibility assumed for pointer arguments of the kernel.
pub const KERNEL_ARG_DIVISIBILITY: i64 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisInfo {
    pub contiguity: Vec<i64>,
    pub divisibility: Vec<i64>,
    pub constancy: Vec<i64>,
    /// Known value when every element is the same constant.
    pub constant: Option<i64>,
}

impl AxisInfo {
    pub fn pessimistic(rank: usize) -> Self {
        let rank = rank.max(1);
        AxisInfo {
            contiguity: vec![1; rank],
            divisibility: vec![1; rank],
            constancy: vec![1; rank],
            constant: None,
        }
    }

    fn splat(shape: &[i64], divisibility: i64, constant: Option<i64>) -> Self {
        let rank = shape.len().max(1);
        AxisInfo {
            contiguity: vec![1; rank],
            divisibility: vec![divisibility; rank],
            constancy: if shape.is_empty() { vec![1] } else { shape.to_vec() },
            constant,
        }
    }

    pub fn rank(&self) -> usize {
        self.contiguity.len()
    }

    /// Meet of two facts about the same value.
    fn join(&self, other: &AxisInfo) -> AxisInfo {
        let zip = |a: &[i64], b: &[i64], f: fn(i64, i64) -> i64| -> Vec<i64> {
            a.iter().zip(b).map(|(&x, &y)| f(x, y)).collect()
        };
        AxisInfo {
            contiguity: zip(&self.contiguity, &other.contiguity, i64::min),
            divisibility: zip(&self.divisibility, &other.divisibility, gcd),
            constancy: zip(&self.constancy, &other.constancy, i64::min),
            constant: if self.constant == other.constant {
                self.constant
            } else {
                None
            },
        }
    }
}

pub fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Largest power of two dividing `v` (capped; zero is maximally divisible).
pub fn highest_pow2_divisor(v: i64) -> i64 {
    if v == 0 {
        return MAX_DIVISIBILITY;
    }
    (v & v.wrapping_neg()).abs().min(MAX_DIVISIBILITY)
}

fn rank_of(ty: &Type) -> usize {
    ty.shape().len()
}

/// Memoizing axis analysis over one module.
pub struct AxisAnalysis<'m> {
    module: &'m Module,
    cache: HashMap<ValueId, AxisInfo>,
}

impl<'m> AxisAnalysis<'m> {
    pub fn new(module: &'m Module) -> Self {
        AxisAnalysis {
            module,
            cache: HashMap::new(),
        }
    }

    pub fn info(&mut self, value: ValueId) -> AxisInfo {
        if let Some(info) = self.cache.get(&value) {
            return info.clone();
        }
        let info = self.compute(value);
        self.cache.insert(value, info.clone());
        info
    }

    fn compute(&mut self, value: ValueId) -> AxisInfo {
        let m = self.module;
        let ty = m.ty(value).clone();
        let rank = rank_of(&ty);

        if let Some((block, index)) = m.block_arg(value) {
            return self.block_arg_info(value, block, index, &ty);
        }
        let Some(def) = m.defining_op(value) else {
            return AxisInfo::pessimistic(rank);
        };
        let operands = m.op(def).operands.clone();

        match m.kind(def).clone() {
            OpKind::Constant(ConstValue::Int(v)) => {
                AxisInfo::splat(ty.shape(), highest_pow2_divisor(v), Some(v))
            }
            OpKind::Constant(ConstValue::Bool(b)) => {
                AxisInfo::splat(ty.shape(), highest_pow2_divisor(b as i64), Some(b as i64))
            }
            OpKind::MakeRange { start, end } => AxisInfo {
                contiguity: vec![end - start],
                divisibility: vec![highest_pow2_divisor(start)],
                constancy: vec![1],
                constant: None,
            },
            OpKind::Splat => {
                let src = self.info(operands[0]);
                AxisInfo::splat(ty.shape(), src.divisibility[0], src.constant)
            }
            OpKind::Broadcast => {
                let src = self.info(operands[0]);
                let src_shape = m.ty(operands[0]).shape().to_vec();
                let mut out = src.clone();
                for (d, &dim) in ty.shape().iter().enumerate() {
                    if src_shape.get(d) == Some(&1) && dim > 1 {
                        out.contiguity[d] = 1;
                        out.constancy[d] = dim;
                    }
                }
                out
            }
            OpKind::ExpandDims { axis } => {
                let src = self.info(operands[0]);
                let axis = axis as usize;
                let min_div = src.divisibility.iter().copied().min().unwrap_or(1);
                let mut out = src.clone();
                if m.ty(operands[0]).shape().is_empty() {
                    return AxisInfo::splat(ty.shape(), min_div, src.constant);
                }
                out.contiguity.insert(axis, 1);
                out.divisibility.insert(axis, min_div);
                out.constancy.insert(axis, 1);
                out
            }
            OpKind::AddI | OpKind::AddPtr | OpKind::SubI => {
                let lhs = self.info(operands[0]);
                let mut rhs = self.info(operands[1]);
                if matches!(m.kind(def), OpKind::AddPtr) {
                    // Offsets count elements; pointer divisibility is in bytes.
                    let elem_bytes = (pointee_bits(m.ty(operands[0])) / 8).max(1) as i64;
                    for d in rhs.divisibility.iter_mut() {
                        *d = (*d * elem_bytes).min(MAX_DIVISIBILITY);
                    }
                }
                self.add_like(&lhs, &rhs, matches!(m.kind(def), OpKind::SubI))
            }
            OpKind::MulI => {
                let lhs = self.info(operands[0]);
                let rhs = self.info(operands[1]);
                let n = lhs.rank().min(rhs.rank());
                let mut out = AxisInfo::pessimistic(n);
                for d in 0..n {
                    out.contiguity[d] = if rhs.constant == Some(1) {
                        lhs.contiguity[d]
                    } else if lhs.constant == Some(1) {
                        rhs.contiguity[d]
                    } else {
                        1
                    };
                    out.divisibility[d] =
                        (lhs.divisibility[d].saturating_mul(rhs.divisibility[d])).min(MAX_DIVISIBILITY);
                    out.constancy[d] = gcd(lhs.constancy[d], rhs.constancy[d]);
                }
                out.constant = match (lhs.constant, rhs.constant) {
                    (Some(a), Some(b)) => Some(a.wrapping_mul(b)),
                    _ => None,
                };
                out
            }
            OpKind::ConvertLayout => self.info(operands[0]),
            _ => AxisInfo::pessimistic(rank),
        }
    }

    fn add_like(&self, lhs: &AxisInfo, rhs: &AxisInfo, sub: bool) -> AxisInfo {
        let n = lhs.rank().min(rhs.rank());
        let mut out = AxisInfo::pessimistic(n);
        for d in 0..n {
            out.contiguity[d] = if sub {
                gcd(lhs.contiguity[d], rhs.constancy[d])
            } else {
                gcd(lhs.contiguity[d], rhs.constancy[d]).max(gcd(lhs.constancy[d], rhs.contiguity[d]))
            };
            out.divisibility[d] = gcd(lhs.divisibility[d], rhs.divisibility[d]);
            out.constancy[d] = gcd(lhs.constancy[d], rhs.constancy[d]);
        }
        out.constant = match (lhs.constant, rhs.constant) {
            (Some(a), Some(b)) if sub => Some(a.wrapping_sub(b)),
            (Some(a), Some(b)) => Some(a.wrapping_add(b)),
            _ => None,
        };
        out
    }

    fn block_arg_info(
        &mut self,
        value: ValueId,
        block: BlockId,
        index: usize,
        ty: &Type,
    ) -> AxisInfo {
        let m = self.module;
        let rank = rank_of(ty);
        match m.block(block).parent {
            None => {
                // Kernel argument.
                let mut info = AxisInfo::pessimistic(rank);
                if matches!(ty, Type::Ptr(_)) {
                    info.divisibility = vec![KERNEL_ARG_DIVISIBILITY; info.rank()];
                }
                info
            }
            Some(owner) if matches!(m.kind(owner), OpKind::For { .. }) && index > 0 => {
                // Loop-carried: meet of the entry value and one trip around
                // the back edge, seeded with the entry value.
                let slot = index - 1;
                let init = self.info(m.for_init(owner, slot));
                self.cache.insert(value, init.clone());
                let Some(yield_op) = m.for_yield(owner) else {
                    return init;
                };
                let next = m.operand(yield_op, slot);
                let next_info = self.info(next);
                if next_info.rank() != init.rank() {
                    return AxisInfo::pessimistic(rank);
                }
                init.join(&next_info)
            }
            Some(_) => AxisInfo::pessimistic(rank),
        }
    }
}

/// Bit width of the pointee for pointer-typed values.
pub fn pointee_bits(ty: &Type) -> u32 {
    match ty {
        Type::Ptr(s) => s.bit_width(),
        Type::Tensor(t) => t.elem.pointee().bit_width(),
        other => other.element_bits(),
    }
}
