// ir.rs — Arena IR for annotated compute loops
//
// Operations, values and blocks are stored in arenas owned by `Module` and
// addressed by stable ids. Rewrites never mutate shared references: a
// replacement redirects every recorded use to the new value and retires the
// old operation, so an id held across several rewrite steps either still
// names the same entity or names an erased one.
//
// Preconditions: none (data structure).
// Postconditions: block op lists only ever contain live (non-erased) ops.
// Failure modes: accessors index the arenas directly; ids come from the
//                same module.
// Side effects: none.

use serde::{Deserialize, Serialize};

use crate::config::TargetConfig;
use crate::id::{BlockId, OpId, ValueId};
use crate::types::{ElemType, ScalarType, Type};

// ── Annotations ─────────────────────────────────────────────────────────────

/// Externally assigned pipeline position: `stage` is the pipeline depth,
/// `cluster` orders operations within a stage (lower runs first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageCluster {
    pub stage: i32,
    pub cluster: i32,
}

impl StageCluster {
    pub fn new(stage: i32, cluster: i32) -> Self {
        StageCluster { stage, cluster }
    }
}

// ── Op kinds ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ConstValue {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl ConstValue {
    pub fn is_zero(&self) -> bool {
        match self {
            ConstValue::Int(v) => *v == 0,
            ConstValue::Float(v) => *v == 0.0,
            ConstValue::Bool(v) => !*v,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConstValue::Int(v) => Some(*v),
            ConstValue::Bool(v) => Some(*v as i64),
            ConstValue::Float(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpPredicate {
    Slt,
    Sle,
    Sgt,
    Sge,
    Eq,
    Ne,
}

impl CmpPredicate {
    pub fn eval(self, lhs: i64, rhs: i64) -> bool {
        match self {
            CmpPredicate::Slt => lhs < rhs,
            CmpPredicate::Sle => lhs <= rhs,
            CmpPredicate::Sgt => lhs > rhs,
            CmpPredicate::Sge => lhs >= rhs,
            CmpPredicate::Eq => lhs == rhs,
            CmpPredicate::Ne => lhs != rhs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CacheModifier {
    #[default]
    None,
    Ca,
    Cg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EvictionPolicy {
    #[default]
    Normal,
    EvictFirst,
    EvictLast,
}

/// Operand presence and memory attributes shared by loads and async copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LoadAttrs {
    pub has_mask: bool,
    pub has_other: bool,
    pub cache: CacheModifier,
    pub evict: EvictionPolicy,
    pub volatile: bool,
}

/// Operation kind. Operand layouts are documented per variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// Scalar constant, or a splat when the result is a tensor.
    Constant(ConstValue),
    AddI,
    SubI,
    MulI,
    XorI,
    AndI,
    CmpI(CmpPredicate),
    /// `[cond, true_value, false_value]`
    Select,
    Splat,
    Broadcast,
    ExpandDims { axis: u32 },
    MakeRange { start: i64, end: i64 },
    /// `[ptr, offset]`
    AddPtr,
    Elementwise(String),

    /// `[ptr, mask?, other?]`
    Load(LoadAttrs),
    /// `[ptr, value, mask?]`
    Store { has_mask: bool },
    /// `[desc, indices...]`
    DescriptorLoad,
    /// `[desc, x_offsets, y_offset]`
    DescriptorGather,
    /// `[base, shape..., strides...]`
    MakeTensorDesc,

    /// `[src?]`
    LocalAlloc,
    /// `[view, token?]`
    LocalLoad,
    LocalDealloc,
    /// `[src, slot]`: selects one slot along the leading dimension.
    MemDescSubview,
    MemDescTrans,
    ConvertLayout,

    /// `[src, dst, mask?, other?]`
    AsyncCopyGlobalToLocal(LoadAttrs),
    /// `[tokens...]`
    AsyncCommitGroup,
    /// `[tokens...]`: wait until at most `num` commit groups are pending.
    AsyncWait { num: u32 },

    /// `[barrier_view]`
    InitBarrier { count: u32 },
    /// `[barrier_view, pred]`
    BarrierExpect { bytes: u64 },
    /// `[barrier_view, phase, pred?]`
    WaitBarrier,
    /// `[barrier_view]`
    InvalBarrier,
    /// `[desc]`
    TensorDescToTmaPtr,
    /// `[tma_ptr, indices..., barrier, view, pred]`
    AsyncTmaCopy,
    /// `[tma_ptr, x_offsets, y_offset, barrier, view, pred]`
    AsyncTmaGather,
    GlobalScratchAlloc { bytes: u64, align: u32 },
    /// `[dst_ptr, base, shape..., strides...]`
    TensormapCreate { block_shape: Vec<i64>, elem: ScalarType },
    /// `[ptr]`
    TensormapFenceAcquire,
    /// `[ptr]`
    ReinterpretTensorDesc,

    /// `[a, b, c]`
    Dot,
    /// `[a, b, c]`
    WarpGroupDot { is_async: bool },
    /// `[values...]` → one result per operand.
    WarpGroupDotWait { pendings: u32 },
    /// `[a, b, d, a_scale, b_scale]`
    ScaledMma,
    TmemAlloc,
    /// `[src, dst]`
    TmemCopy,

    /// `[lb, ub, step, init...]`; body args `[iv, iter...]`.
    For { num_stages: Option<u32> },
    /// `[cond]`; regions `[then, else?]`.
    If,
    Yield,
    Other(String),
}

impl OpKind {
    /// Global-memory loads that are candidates for pipelining.
    pub fn is_load_like(&self) -> bool {
        matches!(
            self,
            OpKind::Load(_) | OpKind::DescriptorLoad | OpKind::DescriptorGather
        )
    }

    pub fn is_descriptor_load(&self) -> bool {
        matches!(self, OpKind::DescriptorLoad | OpKind::DescriptorGather)
    }

    pub fn is_dot_like(&self) -> bool {
        matches!(
            self,
            OpKind::Dot | OpKind::WarpGroupDot { .. } | OpKind::ScaledMma
        )
    }

    /// Ops that reinterpret shared memory without touching it.
    pub fn is_view_like(&self) -> bool {
        matches!(self, OpKind::MemDescSubview | OpKind::MemDescTrans)
    }

    pub fn is_terminator(&self) -> bool {
        matches!(self, OpKind::Yield)
    }

    pub fn mnemonic(&self) -> &str {
        match self {
            OpKind::Constant(_) => "arith.constant",
            OpKind::AddI => "arith.addi",
            OpKind::SubI => "arith.subi",
            OpKind::MulI => "arith.muli",
            OpKind::XorI => "arith.xori",
            OpKind::AndI => "arith.andi",
            OpKind::CmpI(_) => "arith.cmpi",
            OpKind::Select => "arith.select",
            OpKind::Splat => "tt.splat",
            OpKind::Broadcast => "tt.broadcast",
            OpKind::ExpandDims { .. } => "tt.expand_dims",
            OpKind::MakeRange { .. } => "tt.make_range",
            OpKind::AddPtr => "tt.addptr",
            OpKind::Elementwise(name) => name,
            OpKind::Load(_) => "tt.load",
            OpKind::Store { .. } => "tt.store",
            OpKind::DescriptorLoad => "tt.descriptor_load",
            OpKind::DescriptorGather => "tt.descriptor_gather",
            OpKind::MakeTensorDesc => "tt.make_tensor_descriptor",
            OpKind::LocalAlloc => "ttg.local_alloc",
            OpKind::LocalLoad => "ttg.local_load",
            OpKind::LocalDealloc => "ttg.local_dealloc",
            OpKind::MemDescSubview => "ttg.memdesc_subview",
            OpKind::MemDescTrans => "ttg.memdesc_trans",
            OpKind::ConvertLayout => "ttg.convert_layout",
            OpKind::AsyncCopyGlobalToLocal(_) => "ttg.async_copy_global_to_local",
            OpKind::AsyncCommitGroup => "ttg.async_commit_group",
            OpKind::AsyncWait { .. } => "ttg.async_wait",
            OpKind::InitBarrier { .. } => "ttng.init_barrier",
            OpKind::BarrierExpect { .. } => "ttng.barrier_expect",
            OpKind::WaitBarrier => "ttng.wait_barrier",
            OpKind::InvalBarrier => "ttng.inval_barrier",
            OpKind::TensorDescToTmaPtr => "ttng.tensor_desc_to_tma_ptr",
            OpKind::AsyncTmaCopy => "ttng.async_tma_copy_global_to_local",
            OpKind::AsyncTmaGather => "ttng.async_tma_gather",
            OpKind::GlobalScratchAlloc { .. } => "ttg.global_scratch_alloc",
            OpKind::TensormapCreate { .. } => "ttng.tensormap_create",
            OpKind::TensormapFenceAcquire => "ttng.tensormap_fenceproxy_acquire",
            OpKind::ReinterpretTensorDesc => "ttng.reinterpret_tensor_descriptor",
            OpKind::Dot => "tt.dot",
            OpKind::WarpGroupDot { .. } => "ttng.warp_group_dot",
            OpKind::WarpGroupDotWait { .. } => "ttng.warp_group_dot_wait",
            OpKind::ScaledMma => "ttng.tc_gen5_mma_scaled",
            OpKind::TmemAlloc => "ttng.tmem_alloc",
            OpKind::TmemCopy => "ttng.tmem_copy",
            OpKind::For { .. } => "scf.for",
            OpKind::If => "scf.if",
            OpKind::Yield => "scf.yield",
            OpKind::Other(name) => name,
        }
    }
}

// ── Arena records ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Op {
    pub kind: OpKind,
    pub operands: Vec<ValueId>,
    pub results: Vec<ValueId>,
    pub regions: Vec<BlockId>,
    pub parent: Option<BlockId>,
    pub sched: Option<StageCluster>,
    pub erased: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub args: Vec<ValueId>,
    pub ops: Vec<OpId>,
    pub parent: Option<OpId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueDef {
    OpResult { op: OpId, index: u32 },
    BlockArg { block: BlockId, index: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Value {
    pub ty: Type,
    pub def: ValueDef,
}

/// One recorded use: operand `operand` of op `op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Use {
    pub op: OpId,
    pub operand: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPoint {
    Before(OpId),
    After(OpId),
    BlockStart(BlockId),
    BlockEnd(BlockId),
}

// ── Module ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    ops: Vec<Op>,
    values: Vec<Value>,
    blocks: Vec<Block>,
    body: BlockId,
    pub target: TargetConfig,
}

impl Module {
    pub fn new(target: TargetConfig) -> Self {
        let mut module = Module {
            ops: Vec::new(),
            values: Vec::new(),
            blocks: Vec::new(),
            body: BlockId(0),
            target,
        };
        module.body = module.new_block(Vec::new());
        module
    }

    /// Top-level block holding the kernel body.
    pub fn body(&self) -> BlockId {
        self.body
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn op(&self, id: OpId) -> &Op {
        &self.ops[id.index()]
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut Op {
        &mut self.ops[id.index()]
    }

    pub fn kind(&self, id: OpId) -> &OpKind {
        &self.ops[id.index()].kind
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.index()]
    }

    pub fn ty(&self, id: ValueId) -> &Type {
        &self.values[id.index()].ty
    }

    pub fn set_type(&mut self, id: ValueId, ty: Type) {
        self.values[id.index()].ty = ty;
    }

    pub fn operand(&self, op: OpId, index: usize) -> ValueId {
        self.ops[op.index()].operands[index]
    }

    pub fn result(&self, op: OpId, index: usize) -> ValueId {
        self.ops[op.index()].results[index]
    }

    pub fn sched(&self, op: OpId) -> Option<StageCluster> {
        self.ops[op.index()].sched
    }

    pub fn set_sched(&mut self, op: OpId, sched: Option<StageCluster>) {
        self.ops[op.index()].sched = sched;
    }

    pub fn is_erased(&self, op: OpId) -> bool {
        self.ops[op.index()].erased
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    // ── Construction ────────────────────────────────────────────────────

    /// Create a detached block with arguments of the given types.
    pub fn new_block(&mut self, arg_types: Vec<Type>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            args: Vec::new(),
            ops: Vec::new(),
            parent: None,
        });
        for ty in arg_types {
            self.add_block_arg(id, ty);
        }
        id
    }

    pub fn add_block_arg(&mut self, block: BlockId, ty: Type) -> ValueId {
        let index = self.blocks[block.index()].args.len() as u32;
        let id = ValueId(self.values.len() as u32);
        self.values.push(Value {
            ty,
            def: ValueDef::BlockArg { block, index },
        });
        self.blocks[block.index()].args.push(id);
        id
    }

    /// Append a region block to `op`.
    pub fn attach_region(&mut self, op: OpId, block: BlockId) {
        self.blocks[block.index()].parent = Some(op);
        self.ops[op.index()].regions.push(block);
    }

    pub fn add_result(&mut self, op: OpId, ty: Type) -> ValueId {
        let index = self.ops[op.index()].results.len() as u32;
        let id = ValueId(self.values.len() as u32);
        self.values.push(Value {
            ty,
            def: ValueDef::OpResult { op, index },
        });
        self.ops[op.index()].results.push(id);
        id
    }

    pub fn push_operand(&mut self, op: OpId, value: ValueId) {
        self.ops[op.index()].operands.push(value);
    }

    pub fn set_operand(&mut self, op: OpId, index: usize, value: ValueId) {
        self.ops[op.index()].operands[index] = value;
    }

    fn resolve(&self, ip: InsertPoint) -> (BlockId, usize) {
        match ip {
            InsertPoint::Before(op) => {
                let block = self.parent_block(op);
                (block, self.position(op))
            }
            InsertPoint::After(op) => {
                let block = self.parent_block(op);
                (block, self.position(op) + 1)
            }
            InsertPoint::BlockStart(block) => (block, 0),
            InsertPoint::BlockEnd(block) => {
                let ops = &self.blocks[block.index()].ops;
                // Keep terminators last.
                match ops.last() {
                    Some(&last) if self.kind(last).is_terminator() => (block, ops.len() - 1),
                    _ => (block, ops.len()),
                }
            }
        }
    }

    /// Create an operation at `ip` with fresh result values.
    pub fn insert(
        &mut self,
        ip: InsertPoint,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_types: Vec<Type>,
        sched: Option<StageCluster>,
    ) -> OpId {
        let (block, pos) = self.resolve(ip);
        let id = OpId(self.ops.len() as u32);
        self.ops.push(Op {
            kind,
            operands,
            results: Vec::new(),
            regions: Vec::new(),
            parent: Some(block),
            sched,
            erased: false,
        });
        for ty in result_types {
            self.add_result(id, ty);
        }
        self.blocks[block.index()].ops.insert(pos, id);
        id
    }

    /// Move a live op to a new position.
    pub fn move_op(&mut self, op: OpId, ip: InsertPoint) {
        let old_block = self.parent_block(op);
        let pos = self.position(op);
        self.blocks[old_block.index()].ops.remove(pos);
        let (block, pos) = self.resolve(ip);
        self.blocks[block.index()].ops.insert(pos, op);
        self.ops[op.index()].parent = Some(block);
    }

    // ── Structure queries ───────────────────────────────────────────────

    /// Block holding `op` and its index there, or `None` once `op` has been
    /// erased.
    pub fn block_position(&self, op: OpId) -> Option<(BlockId, usize)> {
        let block = self.ops[op.index()].parent?;
        let pos = self.blocks[block.index()].ops.iter().position(|&o| o == op)?;
        Some((block, pos))
    }

    /// # Panics
    ///
    /// Panics if `op` has been erased. Use [`Module::block_position`] for ops
    /// that may be detached.
    pub fn parent_block(&self, op: OpId) -> BlockId {
        self.ops[op.index()]
            .parent
            .unwrap_or_else(|| panic!("{op} is detached"))
    }

    /// The op owning the region that contains `op`.
    pub fn parent_op(&self, op: OpId) -> Option<OpId> {
        self.ops[op.index()]
            .parent
            .and_then(|b| self.blocks[b.index()].parent)
    }

    /// Index of `op` within its block.
    ///
    /// # Panics
    ///
    /// Panics if `op` has been erased.
    pub fn position(&self, op: OpId) -> usize {
        self.block_position(op)
            .map(|(_, pos)| pos)
            .unwrap_or_else(|| panic!("{op} is detached"))
    }

    pub fn next_op(&self, op: OpId) -> Option<OpId> {
        let block = self.ops[op.index()].parent?;
        let ops = &self.blocks[block.index()].ops;
        let pos = ops.iter().position(|&o| o == op)?;
        ops.get(pos + 1).copied()
    }

    pub fn is_before_in_block(&self, a: OpId, b: OpId) -> bool {
        self.position(a) < self.position(b)
    }

    /// Terminator of `block`, if it ends in one.
    pub fn terminator(&self, block: BlockId) -> Option<OpId> {
        self.blocks[block.index()]
            .ops
            .last()
            .copied()
            .filter(|&op| self.kind(op).is_terminator())
    }

    /// The op in `block` that is `op` or transitively contains it.
    pub fn ancestor_in_block(&self, block: BlockId, op: OpId) -> Option<OpId> {
        let mut cur = op;
        loop {
            let parent = self.ops[cur.index()].parent?;
            if parent == block {
                return Some(cur);
            }
            cur = self.blocks[parent.index()].parent?;
        }
    }

    /// True if `op` is nested (at any depth) inside `ancestor`'s regions.
    pub fn is_proper_ancestor(&self, ancestor: OpId, op: OpId) -> bool {
        let mut cur = self.parent_op(op);
        while let Some(p) = cur {
            if p == ancestor {
                return true;
            }
            cur = self.parent_op(p);
        }
        false
    }

    pub fn defining_op(&self, value: ValueId) -> Option<OpId> {
        match self.values[value.index()].def {
            ValueDef::OpResult { op, .. } => Some(op),
            ValueDef::BlockArg { .. } => None,
        }
    }

    /// Block argument position, if `value` is a block argument.
    pub fn block_arg(&self, value: ValueId) -> Option<(BlockId, usize)> {
        match self.values[value.index()].def {
            ValueDef::BlockArg { block, index } => Some((block, index as usize)),
            ValueDef::OpResult { .. } => None,
        }
    }

    /// True if `value` is not defined within `loop_op`'s regions.
    pub fn is_defined_outside(&self, value: ValueId, loop_op: OpId) -> bool {
        match self.values[value.index()].def {
            ValueDef::OpResult { op, .. } => !self.is_proper_ancestor(loop_op, op),
            ValueDef::BlockArg { block, .. } => match self.blocks[block.index()].parent {
                Some(owner) => owner != loop_op && !self.is_proper_ancestor(loop_op, owner),
                None => true,
            },
        }
    }

    pub fn constant_value(&self, value: ValueId) -> Option<ConstValue> {
        let def = self.defining_op(value)?;
        match self.kind(def) {
            OpKind::Constant(c) => Some(*c),
            _ => None,
        }
    }

    // ── Traversal ───────────────────────────────────────────────────────

    /// Live ops of the module in program (pre-order) order.
    pub fn walk(&self) -> Vec<OpId> {
        self.walk_block(self.body)
    }

    /// Live ops nested in `block` in program (pre-order) order.
    pub fn walk_block(&self, block: BlockId) -> Vec<OpId> {
        let mut out = Vec::new();
        self.walk_into(block, &mut out);
        out
    }

    fn walk_into(&self, block: BlockId, out: &mut Vec<OpId>) {
        for &op in &self.blocks[block.index()].ops {
            out.push(op);
            for &region in &self.ops[op.index()].regions {
                self.walk_into(region, out);
            }
        }
    }

    /// All uses of `value` in program order.
    pub fn uses(&self, value: ValueId) -> Vec<Use> {
        let mut uses = Vec::new();
        for op in self.walk() {
            for (i, &operand) in self.ops[op.index()].operands.iter().enumerate() {
                if operand == value {
                    uses.push(Use { op, operand: i });
                }
            }
        }
        uses
    }

    /// Distinct user ops of `value` in program order.
    pub fn users(&self, value: ValueId) -> Vec<OpId> {
        let mut users: Vec<OpId> = Vec::new();
        for u in self.uses(value) {
            if users.last() != Some(&u.op) {
                users.push(u.op);
            }
        }
        users
    }

    /// Distinct users of any result of `op`, in program order.
    pub fn op_users(&self, op: OpId) -> Vec<OpId> {
        let results = &self.ops[op.index()].results;
        let mut users = Vec::new();
        for candidate in self.walk() {
            let uses_result = self.ops[candidate.index()]
                .operands
                .iter()
                .any(|v| results.contains(v));
            if uses_result {
                users.push(candidate);
            }
        }
        users
    }

    pub fn has_one_use(&self, value: ValueId) -> bool {
        self.uses(value).len() == 1
    }

    // ── Mutation ────────────────────────────────────────────────────────

    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        self.replace_uses_if(old, new, |_, _| true);
    }

    /// Redirect the uses of `old` accepted by `pred` to `new`.
    pub fn replace_uses_if(
        &mut self,
        old: ValueId,
        new: ValueId,
        pred: impl Fn(&Module, Use) -> bool,
    ) {
        let accepted: Vec<Use> = self
            .uses(old)
            .into_iter()
            .filter(|&u| pred(self, u))
            .collect();
        for u in accepted {
            self.ops[u.op.index()].operands[u.operand] = new;
        }
    }

    /// Replace uses of `old` with `new` and refresh the mutability of view
    /// results derived from it.
    pub fn replace_uses_and_propagate_type(&mut self, old: ValueId, new: ValueId) {
        self.replace_all_uses(old, new);
        let mutable = match self.ty(new) {
            Type::MemDesc(m) => m.mutable,
            _ => return,
        };
        for user in self.users(new) {
            if !self.kind(user).is_view_like() {
                continue;
            }
            for result in self.ops[user.index()].results.clone() {
                if let Type::MemDesc(mut desc) = self.ty(result).clone() {
                    if desc.mutable != mutable {
                        desc.mutable = mutable;
                        self.set_type(result, Type::MemDesc(desc));
                        self.replace_uses_and_propagate_type(result, result);
                    }
                }
            }
        }
    }

    /// Retire `op` and everything nested in it.
    pub fn erase(&mut self, op: OpId) {
        if let Some(block) = self.ops[op.index()].parent {
            self.blocks[block.index()].ops.retain(|&o| o != op);
        }
        let regions = self.ops[op.index()].regions.clone();
        for region in regions {
            for inner in self.blocks[region.index()].ops.clone() {
                self.erase(inner);
            }
        }
        let record = &mut self.ops[op.index()];
        record.erased = true;
        record.parent = None;
    }

    // ── Loops ───────────────────────────────────────────────────────────

    /// All loops of the module in program order.
    pub fn loops(&self) -> Vec<OpId> {
        self.walk()
            .into_iter()
            .filter(|&op| matches!(self.kind(op), OpKind::For { .. }))
            .collect()
    }

    pub fn num_stages(&self, for_op: OpId) -> Option<u32> {
        match self.kind(for_op) {
            OpKind::For { num_stages } => *num_stages,
            _ => None,
        }
    }

    pub fn for_body(&self, for_op: OpId) -> BlockId {
        self.ops[for_op.index()].regions[0]
    }

    /// Loop-carried block arguments (induction variable excluded).
    pub fn for_iter_args(&self, for_op: OpId) -> Vec<ValueId> {
        self.blocks[self.for_body(for_op).index()].args[1..].to_vec()
    }

    /// Initial value of carried slot `slot`.
    pub fn for_init(&self, for_op: OpId, slot: usize) -> ValueId {
        self.ops[for_op.index()].operands[3 + slot]
    }

    pub fn for_yield(&self, for_op: OpId) -> Option<OpId> {
        self.terminator(self.for_body(for_op))
    }

    /// Append carried slots initialised with `inits`. The yield receives the
    /// init values as placeholders; returns the new body arguments.
    pub fn append_loop_carried(&mut self, for_op: OpId, inits: &[ValueId]) -> Vec<ValueId> {
        let body = self.for_body(for_op);
        let yield_op = self.for_yield(for_op);
        let mut args = Vec::with_capacity(inits.len());
        for &init in inits {
            let ty = self.ty(init).clone();
            self.push_operand(for_op, init);
            args.push(self.add_block_arg(body, ty.clone()));
            self.add_result(for_op, ty);
            if let Some(y) = yield_op {
                self.push_operand(y, init);
            }
        }
        args
    }
}

// ── Builder ─────────────────────────────────────────────────────────────────

/// Stage-aware op builder: every op it creates carries `sched`.
#[derive(Debug, Clone, Copy)]
pub struct OpBuilder {
    pub ip: InsertPoint,
    pub sched: Option<StageCluster>,
}

impl OpBuilder {
    pub fn new(ip: InsertPoint) -> Self {
        OpBuilder { ip, sched: None }
    }

    pub fn before(op: OpId) -> Self {
        Self::new(InsertPoint::Before(op))
    }

    pub fn after(op: OpId) -> Self {
        Self::new(InsertPoint::After(op))
    }

    pub fn at_start(block: BlockId) -> Self {
        Self::new(InsertPoint::BlockStart(block))
    }

    pub fn at_end(block: BlockId) -> Self {
        Self::new(InsertPoint::BlockEnd(block))
    }

    pub fn with_sched(mut self, sched: Option<StageCluster>) -> Self {
        self.sched = sched;
        self
    }

    /// Builder at `op`'s position that inherits `op`'s annotation.
    pub fn for_stage_of(m: &Module, op: OpId) -> Self {
        Self::before(op).with_sched(m.sched(op))
    }

    pub fn create(
        &mut self,
        m: &mut Module,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_types: Vec<Type>,
    ) -> OpId {
        let op = m.insert(self.ip, kind, operands, result_types, self.sched);
        match self.ip {
            InsertPoint::After(_) | InsertPoint::BlockStart(_) => self.ip = InsertPoint::After(op),
            InsertPoint::Before(_) | InsertPoint::BlockEnd(_) => {}
        }
        op
    }

    /// Create a single-result op and return the result.
    pub fn create1(&mut self, m: &mut Module, kind: OpKind, operands: Vec<ValueId>, ty: Type) -> ValueId {
        let op = self.create(m, kind, operands, vec![ty]);
        m.result(op, 0)
    }

    pub fn const_int(&mut self, m: &mut Module, value: i64, ty: Type) -> ValueId {
        self.create1(m, OpKind::Constant(ConstValue::Int(value)), vec![], ty)
    }

    pub fn const_i32(&mut self, m: &mut Module, value: i64) -> ValueId {
        self.const_int(m, value, Type::i32())
    }

    pub fn const_true(&mut self, m: &mut Module) -> ValueId {
        self.create1(m, OpKind::Constant(ConstValue::Bool(true)), vec![], Type::i1())
    }

    pub fn binary(&mut self, m: &mut Module, kind: OpKind, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = m.ty(lhs).clone();
        self.create1(m, kind, vec![lhs, rhs], ty)
    }

    pub fn cmp(&mut self, m: &mut Module, pred: CmpPredicate, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = match m.ty(lhs) {
            Type::Tensor(t) => Type::tensor(
                t.shape.clone(),
                ElemType::Scalar(ScalarType::I1),
                t.encoding.clone(),
            ),
            _ => Type::i1(),
        };
        self.create1(m, OpKind::CmpI(pred), vec![lhs, rhs], ty)
    }

    pub fn select(&mut self, m: &mut Module, cond: ValueId, t: ValueId, f: ValueId) -> ValueId {
        let ty = m.ty(t).clone();
        self.create1(m, OpKind::Select, vec![cond, t, f], ty)
    }

    /// `select((counter + 1) < modulus, counter + 1, zero)`
    pub fn increment_modulo(
        &mut self,
        m: &mut Module,
        counter: ValueId,
        modulus: ValueId,
        zero: ValueId,
        one: ValueId,
    ) -> ValueId {
        let add_one = self.binary(m, OpKind::AddI, counter, one);
        let in_range = self.cmp(m, CmpPredicate::Slt, add_one, modulus);
        self.select(m, in_range, add_one, zero)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
