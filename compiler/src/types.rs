// types.rs — Value types and memory layouts of the tilepipe IR
//
// Tensors live in registers and carry an optional distributed encoding;
// memory descriptors (`MemDesc`) name shared-memory storage and always
// carry a shared encoding. Layout *selection* lives in `layout.rs`; this
// module only defines the data.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Scalars ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    I1,
    I8,
    I16,
    I32,
    I64,
    F8E4M3,
    F8E5M2,
    F16,
    BF16,
    F32,
    F64,
}

impl ScalarType {
    pub fn bit_width(self) -> u32 {
        match self {
            ScalarType::I1 => 1,
            ScalarType::I8 | ScalarType::F8E4M3 | ScalarType::F8E5M2 => 8,
            ScalarType::I16 | ScalarType::F16 | ScalarType::BF16 => 16,
            ScalarType::I32 | ScalarType::F32 => 32,
            ScalarType::I64 | ScalarType::F64 => 64,
        }
    }

    pub fn is_float(self) -> bool {
        !matches!(
            self,
            ScalarType::I1 | ScalarType::I8 | ScalarType::I16 | ScalarType::I32 | ScalarType::I64
        )
    }

    fn mnemonic(self) -> &'static str {
        match self {
            ScalarType::I1 => "i1",
            ScalarType::I8 => "i8",
            ScalarType::I16 => "i16",
            ScalarType::I32 => "i32",
            ScalarType::I64 => "i64",
            ScalarType::F8E4M3 => "f8E4M3",
            ScalarType::F8E5M2 => "f8E5M2",
            ScalarType::F16 => "f16",
            ScalarType::BF16 => "bf16",
            ScalarType::F32 => "f32",
            ScalarType::F64 => "f64",
        }
    }
}

/// Element type of a tensor: a scalar, or a global pointer to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElemType {
    Scalar(ScalarType),
    Ptr(ScalarType),
}

impl ElemType {
    /// Bit width of the element itself (pointers are 64-bit).
    pub fn bit_width(self) -> u32 {
        match self {
            ElemType::Scalar(s) => s.bit_width(),
            ElemType::Ptr(_) => 64,
        }
    }

    /// For pointer elements, the pointee; otherwise the scalar itself.
    pub fn pointee(self) -> ScalarType {
        match self {
            ElemType::Scalar(s) | ElemType::Ptr(s) => s,
        }
    }
}

// ── Register encodings ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockedEncoding {
    pub size_per_thread: Vec<u32>,
    pub threads_per_warp: Vec<u32>,
    pub warps_per_cta: Vec<u32>,
    pub order: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MmaEncoding {
    /// 2 = Ampere-class mma, 3 = Hopper-class warp-group mma.
    pub version_major: u32,
    pub warps_per_cta: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DotOperandEncoding {
    /// 0 = A operand, 1 = B operand.
    pub op_idx: u32,
    pub parent: MmaEncoding,
    pub k_width: u32,
}

/// Distributed (register) layout of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    Blocked(BlockedEncoding),
    Mma(MmaEncoding),
    DotOperand(DotOperandEncoding),
}

// ── Shared encodings ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SwizzledShared {
    pub vec: u32,
    pub per_phase: u32,
    pub max_phase: u32,
    pub order: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NvMmaShared {
    pub swizzle_bytes: u32,
    pub transposed: bool,
    pub element_bits: u32,
    pub fp4_padded: bool,
}

/// Layout of data resident in shared memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SharedEncoding {
    Swizzled(SwizzledShared),
    /// MMA-compatible layout, also required by descriptor-driven copies.
    NvMma(NvMmaShared),
}

// ── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorType {
    pub shape: Vec<i64>,
    pub elem: ElemType,
    pub encoding: Option<Encoding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemDescType {
    pub shape: Vec<i64>,
    pub elem: ScalarType,
    pub encoding: SharedEncoding,
    pub mutable: bool,
    /// Shape of the underlying allocation (equal to `shape` for allocations).
    pub alloc_shape: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDescType {
    pub block_shape: Vec<i64>,
    pub elem: ScalarType,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Scalar(ScalarType),
    Ptr(ScalarType),
    Tensor(TensorType),
    MemDesc(MemDescType),
    TensorDesc(TensorDescType),
    Token,
}

impl Type {
    pub fn i1() -> Type {
        Type::Scalar(ScalarType::I1)
    }

    pub fn i32() -> Type {
        Type::Scalar(ScalarType::I32)
    }

    pub fn tensor(shape: Vec<i64>, elem: ElemType, encoding: Option<Encoding>) -> Type {
        Type::Tensor(TensorType {
            shape,
            elem,
            encoding,
        })
    }

    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            Type::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_mem_desc(&self) -> Option<&MemDescType> {
        match self {
            Type::MemDesc(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_mem_desc(&self) -> bool {
        matches!(self, Type::MemDesc(_))
    }

    /// Shape of a shaped type; scalars, pointers and tokens are rank 0.
    pub fn shape(&self) -> &[i64] {
        match self {
            Type::Tensor(t) => &t.shape,
            Type::MemDesc(m) => &m.shape,
            Type::TensorDesc(d) => &d.block_shape,
            _ => &[],
        }
    }

    /// Element bit width for shaped and scalar types.
    pub fn element_bits(&self) -> u32 {
        match self {
            Type::Scalar(s) => s.bit_width(),
            Type::Ptr(_) => 64,
            Type::Tensor(t) => t.elem.bit_width(),
            Type::MemDesc(m) => m.elem.bit_width(),
            Type::TensorDesc(d) => d.elem.bit_width(),
            Type::Token => 0,
        }
    }

    pub fn num_elements(&self) -> i64 {
        self.shape().iter().product()
    }

    /// Same tensor type with a different encoding; other types unchanged.
    pub fn with_encoding(&self, encoding: Option<Encoding>) -> Type {
        match self {
            Type::Tensor(t) => Type::Tensor(TensorType {
                encoding,
                ..t.clone()
            }),
            other => other.clone(),
        }
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElemType::Scalar(s) => write!(f, "{s}"),
            ElemType::Ptr(s) => write!(f, "!ptr<{s}>"),
        }
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Blocked(b) => write!(
                f,
                "#blocked<spt=[{}], tpw=[{}], wpc=[{}], ord=[{}]>",
                join(&b.size_per_thread),
                join(&b.threads_per_warp),
                join(&b.warps_per_cta),
                join(&b.order)
            ),
            Encoding::Mma(m) => write!(f, "#mma<v{}, wpc=[{}]>", m.version_major, join(&m.warps_per_cta)),
            Encoding::DotOperand(d) => write!(
                f,
                "#dot_op<{}, v{}, k={}>",
                d.op_idx, d.parent.version_major, d.k_width
            ),
        }
    }
}

impl fmt::Display for SharedEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SharedEncoding::Swizzled(s) => write!(
                f,
                "#swizzled<{},{},{}, ord=[{}]>",
                s.vec,
                s.per_phase,
                s.max_phase,
                join(&s.order)
            ),
            SharedEncoding::NvMma(n) => write!(
                f,
                "#nvmma<swizzle={}, trans={}, bits={}>",
                n.swizzle_bytes, n.transposed, n.element_bits
            ),
        }
    }
}

fn write_shape(f: &mut fmt::Formatter<'_>, shape: &[i64]) -> fmt::Result {
    for dim in shape {
        write!(f, "{dim}x")?;
    }
    Ok(())
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Scalar(s) => write!(f, "{s}"),
            Type::Ptr(s) => write!(f, "!ptr<{s}>"),
            Type::Tensor(t) => {
                write!(f, "tensor<")?;
                write_shape(f, &t.shape)?;
                write!(f, "{}", t.elem)?;
                if let Some(enc) = &t.encoding {
                    write!(f, ", {enc}")?;
                }
                write!(f, ">")
            }
            Type::MemDesc(m) => {
                write!(f, "memdesc<")?;
                write_shape(f, &m.shape)?;
                write!(f, "{}, {}", m.elem, m.encoding)?;
                if m.mutable {
                    write!(f, ", mutable")?;
                }
                if m.alloc_shape != m.shape {
                    write!(f, ", alloc=[{}]", join(&m.alloc_shape))?;
                }
                write!(f, ">")
            }
            Type::TensorDesc(d) => {
                write!(f, "tensordesc<")?;
                write_shape(f, &d.block_shape)?;
                write!(f, "{}>", d.elem)
            }
            Type::Token => write!(f, "!token"),
        }
    }
}
