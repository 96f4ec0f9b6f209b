mod builder;
mod dom_frontier;
mod dom_tree;
mod predecessors;
mod printer;
mod remove_unreachable_blocks;
mod rpo;
mod uses;
mod verify;

use std::slice;

use slotmap::{new_key_type, SecondaryMap, SlotMap};
use strum::Display;

use crate::program::{CalleeId, ClassId, FieldId, GlobalId};
use crate::util::try_match;

pub use self::builder::FuncBuilder;
pub use self::dom_frontier::{iterated_frontier, DomFrontiers};
pub use self::dom_tree::DomTree;
pub use self::predecessors::Predecessors;
pub use self::rpo::Rpo;
pub use self::uses::{Use, Uses};
pub use self::verify::VerifyError;

new_key_type! {
    pub struct BlockId;
    pub struct InstId;
    pub struct SafepointId;
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[strum(serialize_all = "lowercase")]
pub enum Ty {
    Byte,
    Short,
    Int,
    Long,
    Ref,
    Class,
}

impl Ty {
    /// The type a value of this type has once loaded into an SSA value.
    pub fn stack_ty(self) -> Self {
        match self {
            Self::Byte | Self::Short => Self::Int,
            _ => self,
        }
    }

    pub fn byte_size(self) -> Option<u32> {
        match self {
            Self::Byte => Some(1),
            Self::Short => Some(2),
            Self::Int => Some(4),
            Self::Long => Some(8),
            Self::Ref | Self::Class => None,
        }
    }

    pub fn is_ref(self) -> bool {
        self == Self::Ref
    }

    pub fn default_value(self) -> Value {
        match self {
            Self::Byte | Self::Short | Self::Int => Value::Int(0),
            Self::Long => Value::Long(0),
            Self::Ref | Self::Class => Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    Int(i32),
    Long(i64),
    Null,
    Class(ClassId),
}

impl Value {
    pub fn ty(&self) -> Ty {
        match self {
            Self::Int(_) => Ty::Int,
            Self::Long(_) => Ty::Long,
            Self::Null => Ty::Ref,
            Self::Class(_) => Ty::Class,
        }
    }

    pub fn to_i32(&self) -> Option<i32> {
        try_match!(*self, Self::Int(value) => value)
    }

    pub fn to_i64(&self) -> Option<i64> {
        match *self {
            Self::Int(value) => Some(value.into()),
            Self::Long(value) => Some(value),
            _ => None,
        }
    }

    /// Converts an integral value to the canonical representation of `ty`.
    pub fn narrow(self, ty: Ty) -> Option<Self> {
        let value = self.to_i64()?;

        Some(match ty {
            Ty::Byte => Self::Int(value as i8 as i32),
            Ty::Short => Self::Int(value as i16 as i32),
            Ty::Int => Self::Int(value as i32),
            Ty::Long => Self::Long(value),
            Ty::Ref | Ty::Class => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Neg,
    Not,
    Narrow(Ty),
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[strum(serialize_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,

    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    pub fn is_cmp(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub callee: CalleeId,
    pub args: Vec<InstId>,
    pub safepoint: SafepointId,
    /// Set when some argument is a method-local object the callee only borrows.
    pub arg_escape: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstKind {
    Param(u32),
    Const(Value),
    Unary(UnOp, InstId),
    Binary(BinOp, [InstId; 2]),
    Phi(Vec<(BlockId, InstId)>),

    New(ClassId),
    NewArray {
        elem: Ty,
        len: InstId,
    },

    LoadField {
        obj: InstId,
        field: FieldId,
    },

    StoreField {
        obj: InstId,
        field: FieldId,
        value: InstId,
    },

    LoadElem {
        array: InstId,
        index: InstId,
    },

    StoreElem {
        array: InstId,
        index: InstId,
        value: InstId,
    },

    ArrayLength(InstId),

    /// Writes the low `width` bytes of `value` little-endian at byte `offset` of an array's payload.
    RawStore {
        array: InstId,
        offset: u32,
        width: u32,
        value: InstId,
    },

    ArrayCopy {
        src: InstId,
        src_pos: InstId,
        dst: InstId,
        dst_pos: InstId,
        len: InstId,
    },

    ArrayFill {
        array: InstId,
        value: InstId,
    },

    LoadGlobal(GlobalId),
    StoreGlobal(GlobalId, InstId),
    Call(Call),

    RefEq([InstId; 2]),
    LoadClass(InstId),
    InstanceOf {
        obj: InstId,
        class: ClassId,
    },
    CheckCast {
        obj: InstId,
        class: ClassId,
    },

    MonitorEnter(InstId),
    MonitorExit(InstId),

    /// A post-write barrier attached to a reference store.
    WriteBarrier {
        store: InstId,
    },

    Safepoint(SafepointId),

    /// The exception caught by the enclosing handler block.
    Exception,
}

impl InstKind {
    pub fn operands(&self) -> Vec<InstId> {
        match *self {
            Self::Param(_)
            | Self::Const(_)
            | Self::New(_)
            | Self::LoadGlobal(_)
            | Self::WriteBarrier { .. }
            | Self::Safepoint(_)
            | Self::Exception => vec![],

            Self::Unary(_, inst_id)
            | Self::ArrayLength(inst_id)
            | Self::StoreGlobal(_, inst_id)
            | Self::LoadClass(inst_id)
            | Self::MonitorEnter(inst_id)
            | Self::MonitorExit(inst_id)
            | Self::InstanceOf { obj: inst_id, .. }
            | Self::CheckCast { obj: inst_id, .. }
            | Self::NewArray { len: inst_id, .. }
            | Self::LoadField { obj: inst_id, .. } => vec![inst_id],

            Self::Binary(_, [lhs, rhs]) | Self::RefEq([lhs, rhs]) => vec![lhs, rhs],
            Self::Phi(ref args) => args.iter().map(|&(_, inst_id)| inst_id).collect(),

            Self::StoreField { obj, value, .. } => vec![obj, value],
            Self::LoadElem { array, index } => vec![array, index],
            Self::StoreElem {
                array,
                index,
                value,
            } => vec![array, index, value],
            Self::RawStore { array, value, .. } => vec![array, value],
            Self::ArrayCopy {
                src,
                src_pos,
                dst,
                dst_pos,
                len,
            } => vec![src, src_pos, dst, dst_pos, len],
            Self::ArrayFill { array, value } => vec![array, value],
            Self::Call(ref call) => call.args.clone(),
        }
    }

    pub fn operands_mut(&mut self) -> Vec<&mut InstId> {
        match self {
            Self::Param(_)
            | Self::Const(_)
            | Self::New(_)
            | Self::LoadGlobal(_)
            | Self::WriteBarrier { .. }
            | Self::Safepoint(_)
            | Self::Exception => vec![],

            Self::Unary(_, inst_id)
            | Self::ArrayLength(inst_id)
            | Self::StoreGlobal(_, inst_id)
            | Self::LoadClass(inst_id)
            | Self::MonitorEnter(inst_id)
            | Self::MonitorExit(inst_id)
            | Self::InstanceOf { obj: inst_id, .. }
            | Self::CheckCast { obj: inst_id, .. }
            | Self::NewArray { len: inst_id, .. }
            | Self::LoadField { obj: inst_id, .. } => vec![inst_id],

            Self::Binary(_, [lhs, rhs]) | Self::RefEq([lhs, rhs]) => vec![lhs, rhs],
            Self::Phi(args) => args.iter_mut().map(|(_, inst_id)| inst_id).collect(),

            Self::StoreField { obj, value, .. } => vec![obj, value],
            Self::LoadElem { array, index } => vec![array, index],
            Self::StoreElem {
                array,
                index,
                value,
            } => vec![array, index, value],
            Self::RawStore { array, value, .. } => vec![array, value],
            Self::ArrayCopy {
                src,
                src_pos,
                dst,
                dst_pos,
                len,
            } => vec![src, src_pos, dst, dst_pos, len],
            Self::ArrayFill { array, value } => vec![array, value],
            Self::Call(call) => call.args.iter_mut().collect(),
        }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Self::Phi(_))
    }

    pub fn to_const(&self) -> Option<Value> {
        try_match!(*self, Self::Const(value) => value)
    }

    pub fn safepoint(&self) -> Option<SafepointId> {
        match *self {
            Self::Call(Call { safepoint, .. }) | Self::Safepoint(safepoint) => Some(safepoint),
            _ => None,
        }
    }

}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inst {
    pub kind: InstKind,
    pub ty: Option<Ty>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum Terminator {
    #[default]
    Unreachable,
    Br(BlockId),
    If(InstId, [BlockId; 2]),
    Return(Option<InstId>),
    Throw(InstId),
    Deopt(SafepointId),
    /// Ends a block whose last instruction is a call: `[normal, unwind]`.
    Invoke(InstId, [BlockId; 2]),
}

impl Terminator {
    pub fn successors(&self) -> &[BlockId] {
        match self {
            Self::Unreachable | Self::Return(_) | Self::Throw(_) | Self::Deopt(_) => &[],
            Self::Br(block_id) => slice::from_ref(block_id),
            Self::If(_, successors) | Self::Invoke(_, successors) => successors,
        }
    }

    pub fn successors_mut(&mut self) -> &mut [BlockId] {
        match self {
            Self::Unreachable | Self::Return(_) | Self::Throw(_) | Self::Deopt(_) => &mut [],
            Self::Br(block_id) => slice::from_mut(block_id),
            Self::If(_, successors) | Self::Invoke(_, successors) => successors,
        }
    }

    pub fn operand(&self) -> Option<InstId> {
        match *self {
            Self::If(cond, _) => Some(cond),
            Self::Return(value) => value,
            Self::Throw(value) => Some(value),
            _ => None,
        }
    }

    pub fn operand_mut(&mut self) -> Option<&mut InstId> {
        match self {
            Self::If(cond, _) => Some(cond),
            Self::Return(value) => value.as_mut(),
            Self::Throw(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Block {
    pub name: Option<String>,
    pub body: Vec<InstId>,
    pub term: Terminator,
}

impl Block {
    pub fn successors(&self) -> &[BlockId] {
        self.term.successors()
    }

    pub fn successors_mut(&mut self) -> &mut [BlockId] {
        self.term.successors_mut()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    Instance(ClassId),
    Array { elem: Ty, len: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeValue {
    /// `-1` selects `nsr`, anything else indexes `candidates`.
    pub selector: InstId,
    pub nsr: InstId,
    pub candidates: Vec<DebugValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugValue {
    Value(InstId),
    Const(Value),
    /// An index into [`Safepoint::objects`].
    Object(usize),
    Merge(Box<MergeValue>),
}

impl DebugValue {
    pub fn for_each_inst(&self, f: &mut impl FnMut(InstId)) {
        match self {
            Self::Value(inst_id) => f(*inst_id),
            Self::Const(_) | Self::Object(_) => {}

            Self::Merge(merge) => {
                f(merge.selector);
                f(merge.nsr);

                for candidate in &merge.candidates {
                    candidate.for_each_inst(f);
                }
            }
        }
    }

    pub fn for_each_inst_mut(&mut self, f: &mut impl FnMut(&mut InstId)) {
        match self {
            Self::Value(inst_id) => f(inst_id),
            Self::Const(_) | Self::Object(_) => {}

            Self::Merge(merge) => {
                f(&mut merge.selector);
                f(&mut merge.nsr);

                for candidate in &mut merge.candidates {
                    candidate.for_each_inst_mut(f);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSlot {
    pub obj: DebugValue,
    /// The compiled code never locked this object; the runtime must on deoptimization.
    pub eliminated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecipe {
    pub shape: Shape,
    pub fields: Vec<DebugValue>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Safepoint {
    pub locals: Vec<DebugValue>,
    pub monitors: Vec<MonitorSlot>,
    pub objects: Vec<ObjectRecipe>,
    pub has_ea_local: bool,
}

impl Safepoint {
    pub fn for_each_inst(&self, mut f: impl FnMut(InstId)) {
        for value in &self.locals {
            value.for_each_inst(&mut f);
        }

        for monitor in &self.monitors {
            monitor.obj.for_each_inst(&mut f);
        }

        for object in &self.objects {
            for value in &object.fields {
                value.for_each_inst(&mut f);
            }
        }
    }

    pub fn for_each_inst_mut(&mut self, mut f: impl FnMut(&mut InstId)) {
        for value in &mut self.locals {
            value.for_each_inst_mut(&mut f);
        }

        for monitor in &mut self.monitors {
            monitor.obj.for_each_inst_mut(&mut f);
        }

        for object in &mut self.objects {
            for value in &mut object.fields {
                value.for_each_inst_mut(&mut f);
            }
        }
    }
}

/// Where a safepoint's state is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafepointSite {
    Inst(BlockId, InstId),
    Term(BlockId),
}

impl SafepointSite {
    pub fn block(&self) -> BlockId {
        match *self {
            Self::Inst(block_id, _) | Self::Term(block_id) => block_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FuncBody {
    pub blocks: SlotMap<BlockId, Block>,
    pub insts: SlotMap<InstId, Inst>,
    pub safepoints: SlotMap<SafepointId, Safepoint>,
    pub entry: BlockId,
    pub params: Vec<Ty>,
    pub ret: Option<Ty>,
}

impl FuncBody {
    pub fn new(params: Vec<Ty>, ret: Option<Ty>) -> Self {
        let mut blocks = SlotMap::<BlockId, Block>::with_key();
        let entry = blocks.insert(Default::default());

        Self {
            blocks,
            insts: Default::default(),
            safepoints: Default::default(),
            entry,
            params,
            ret,
        }
    }

    pub fn add_inst(&mut self, kind: InstKind, ty: Option<Ty>) -> InstId {
        self.insts.insert(Inst { kind, ty })
    }

    pub fn ty(&self, inst_id: InstId) -> Option<Ty> {
        self.insts[inst_id].ty
    }

    /// The block and position of every placed instruction.
    pub fn placement(&self) -> SecondaryMap<InstId, (BlockId, usize)> {
        let mut result = SecondaryMap::new();

        for (block_id, block) in &self.blocks {
            for (idx, &inst_id) in block.body.iter().enumerate() {
                result.insert(inst_id, (block_id, idx));
            }
        }

        result
    }

    pub fn phi_count(&self, block_id: BlockId) -> usize {
        self.blocks[block_id]
            .body
            .iter()
            .take_while(|&&inst_id| self.insts[inst_id].kind.is_phi())
            .count()
    }

    pub fn phis(&self, block_id: BlockId) -> impl Iterator<Item = InstId> + '_ {
        self.blocks[block_id]
            .body
            .iter()
            .copied()
            .take_while(|&inst_id| self.insts[inst_id].kind.is_phi())
    }

    pub fn append_phi(&mut self, block_id: BlockId, phi: InstId) {
        let idx = self.phi_count(block_id);
        self.blocks[block_id].body.insert(idx, phi);
    }

    /// Inserts an instruction so that it executes last before the block's control transfer.
    ///
    /// For blocks ending with an `Invoke`, that means before the call.
    pub fn insert_at_end(&mut self, block_id: BlockId, inst_id: InstId) {
        let block = &mut self.blocks[block_id];

        match block.term {
            Terminator::Invoke(call, _) if block.body.last() == Some(&call) => {
                let idx = block.body.len() - 1;
                block.body.insert(idx, inst_id);
            }

            _ => block.body.push(inst_id),
        }
    }

    pub fn safepoint_sites(&self) -> SecondaryMap<SafepointId, SafepointSite> {
        let mut result = SecondaryMap::new();

        for (block_id, block) in &self.blocks {
            for &inst_id in &block.body {
                if let Some(safepoint_id) = self.insts[inst_id].kind.safepoint() {
                    result.insert(safepoint_id, SafepointSite::Inst(block_id, inst_id));
                }
            }

            if let Terminator::Deopt(safepoint_id) = block.term {
                result.insert(safepoint_id, SafepointSite::Term(block_id));
            }
        }

        result
    }

    /// Strips `CheckCast`s, which forward their operand's identity.
    pub fn underlying_ref(&self, mut inst_id: InstId) -> InstId {
        while let InstKind::CheckCast { obj, .. } = self.insts[inst_id].kind {
            inst_id = obj;
        }

        inst_id
    }
}
