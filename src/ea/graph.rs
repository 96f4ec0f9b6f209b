use std::collections::{BTreeMap, BTreeSet};

use log::trace;
use slotmap::{new_key_type, SecondaryMap, SlotMap};
use strum::Display;

use crate::cfg::{FuncBody, InstId, InstKind, Terminator, Ty, Value};
use crate::program::{ArgEffect, ClassFlags, ClassId, FieldId, Program};

use super::Config;

new_key_type! {
    pub struct ObjId;
}

#[derive(Display, Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EscapeState {
    #[default]
    #[strum(to_string = "no-escape")]
    NoEscape,

    #[strum(to_string = "arg-escape")]
    ArgEscape,

    #[strum(to_string = "global-escape")]
    GlobalEscape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    Alloc(InstId),
    /// Every object the method cannot see.
    Phantom,
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjShape {
    Instance(ClassId),
    Array { elem: Ty, len: Option<u32> },
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldKey {
    Field(FieldId),
    Elem(u32),
    /// Summarizes elements that are not tracked individually.
    AnyElem,
}

/// The storage an instruction addresses, before its base object is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Field(FieldId),
    /// An element at a constant index, or at an unknown one.
    Elem(Option<u32>),
    AllElems,
}

pub type PtSet = BTreeSet<ObjId>;

#[derive(Debug, Clone)]
pub struct ObjNode {
    pub kind: ObjKind,
    pub shape: ObjShape,
    pub state: EscapeState,
    pub fields: BTreeMap<FieldKey, PtSet>,
    /// Reference phis this object flows into.
    pub merge_uses: Vec<InstId>,
    pub locked: bool,
}

impl ObjNode {
    fn new(kind: ObjKind, shape: ObjShape, state: EscapeState) -> Self {
        Self {
            kind,
            shape,
            state,
            fields: Default::default(),
            merge_uses: vec![],
            locked: false,
        }
    }

    pub fn alloc_inst(&self) -> Option<InstId> {
        match self.kind {
            ObjKind::Alloc(inst_id) => Some(inst_id),
            _ => None,
        }
    }

    pub fn is_alloc(&self) -> bool {
        matches!(self.kind, ObjKind::Alloc(_))
    }

    /// The length of an array whose elements are tracked one by one.
    pub fn tracked_len(&self, limit: u32) -> Option<u32> {
        match self.shape {
            ObjShape::Array { len: Some(len), .. } if len <= limit => Some(len),
            _ => None,
        }
    }

    pub(super) fn keys(&self, access: Access, limit: u32) -> Vec<FieldKey> {
        match access {
            Access::Field(field_id) => vec![FieldKey::Field(field_id)],

            Access::Elem(Some(idx)) => match self.tracked_len(limit) {
                Some(len) if idx < len => vec![FieldKey::Elem(idx)],
                _ => vec![FieldKey::AnyElem],
            },

            Access::Elem(None) => vec![FieldKey::AnyElem],

            Access::AllElems => match self.tracked_len(limit) {
                Some(len) => (0..len).map(FieldKey::Elem).collect(),
                None => vec![FieldKey::AnyElem],
            },
        }
    }

    pub(super) fn read(&self, access: Access, limit: u32) -> PtSet {
        let mut result = PtSet::new();

        match access {
            Access::Field(field_id) => {
                if let Some(targets) = self.fields.get(&FieldKey::Field(field_id)) {
                    result.extend(targets);
                }
            }

            Access::Elem(Some(_)) => {
                for key in self
                    .keys(access, limit)
                    .into_iter()
                    .chain([FieldKey::AnyElem])
                {
                    if let Some(targets) = self.fields.get(&key) {
                        result.extend(targets);
                    }
                }
            }

            Access::Elem(None) | Access::AllElems => {
                for (key, targets) in &self.fields {
                    if matches!(key, FieldKey::Elem(_) | FieldKey::AnyElem) {
                        result.extend(targets);
                    }
                }
            }
        }

        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Constraint {
    Copy {
        dst: InstId,
        src: InstId,
    },

    Load {
        dst: InstId,
        base: InstId,
        access: Access,
    },

    Store {
        base: InstId,
        access: Access,
        value: InstId,
    },

    CopyElems {
        src: InstId,
        dst: InstId,
        /// `(src_pos, dst_pos, len)` when all three are constants.
        range: Option<(u32, u32, u32)>,
    },

    Sink {
        value: InstId,
        state: EscapeState,
    },
}

/// The points-to graph of one method: object nodes, their field edges and the objects each
/// reference-typed instruction may refer to.
#[derive(Debug, Clone)]
pub struct ConnectionGraph {
    pub objs: SlotMap<ObjId, ObjNode>,
    pub phantom: ObjId,
    pub null: ObjId,
    pub pts: SecondaryMap<InstId, PtSet>,
    pub alloc_objs: SecondaryMap<InstId, ObjId>,
    pub(super) constraints: Vec<Constraint>,
    pub(super) elem_limit: u32,
    phis: Vec<InstId>,
    monitors: Vec<InstId>,
}

impl ConnectionGraph {
    pub fn build(program: &Program, body: &FuncBody, config: &Config) -> Self {
        let mut objs = SlotMap::with_key();
        let phantom = objs.insert(ObjNode::new(
            ObjKind::Phantom,
            ObjShape::Unknown,
            EscapeState::GlobalEscape,
        ));
        let null = objs.insert(ObjNode::new(
            ObjKind::Null,
            ObjShape::Unknown,
            EscapeState::NoEscape,
        ));

        let mut graph = Self {
            objs,
            phantom,
            null,
            pts: Default::default(),
            alloc_objs: Default::default(),
            constraints: vec![],
            elem_limit: config.array_size_limit,
            phis: vec![],
            monitors: vec![],
        };

        let rpo = body.rpo();

        for &block_id in &rpo.order {
            let block = &body.blocks[block_id];

            for &inst_id in &block.body {
                graph.add_inst(program, body, inst_id);
            }

            match block.term {
                Terminator::Return(Some(value)) | Terminator::Throw(value) => {
                    graph.constraints.push(Constraint::Sink {
                        value,
                        state: EscapeState::GlobalEscape,
                    });
                }

                _ => {}
            }
        }

        trace!(
            "built a connection graph with {} objects and {} constraints",
            graph.objs.len(),
            graph.constraints.len(),
        );

        graph
    }

    fn add_inst(&mut self, program: &Program, body: &FuncBody, inst_id: InstId) {
        let inst = &body.insts[inst_id];
        let is_ref = |inst_id: InstId| body.ty(inst_id) == Some(Ty::Ref);
        let const_u32 = |inst_id: InstId| {
            body.insts[inst_id]
                .kind
                .to_const()
                .and_then(|value| value.to_i32())
                .and_then(|value| u32::try_from(value).ok())
        };

        if is_ref(inst_id) {
            self.pts.insert(inst_id, PtSet::new());
        }

        match inst.kind {
            InstKind::New(class_id) => {
                let state = if program.classes[class_id]
                    .flags
                    .intersects(ClassFlags::FINALIZER | ClassFlags::THREAD)
                {
                    EscapeState::GlobalEscape
                } else {
                    EscapeState::NoEscape
                };

                self.add_alloc(inst_id, ObjShape::Instance(class_id), state);
            }

            InstKind::NewArray { elem, len } => {
                let shape = ObjShape::Array {
                    elem,
                    len: const_u32(len),
                };

                self.add_alloc(inst_id, shape, EscapeState::NoEscape);
            }

            InstKind::Const(Value::Null) => {
                self.pts[inst_id].insert(self.null);
            }

            InstKind::Param(_) | InstKind::LoadGlobal(_) | InstKind::Exception if is_ref(inst_id) => {
                self.pts[inst_id].insert(self.phantom);
            }

            InstKind::Call(ref call) => {
                let callee = &program.callees[call.callee];

                for (idx, &arg) in call.args.iter().enumerate() {
                    if is_ref(arg) {
                        let state = match callee.arg_effect(idx) {
                            ArgEffect::Escapes => EscapeState::GlobalEscape,
                            ArgEffect::Borrows => EscapeState::ArgEscape,
                        };

                        self.constraints.push(Constraint::Sink { value: arg, state });
                    }
                }

                if is_ref(inst_id) {
                    self.pts[inst_id].insert(self.phantom);
                }
            }

            InstKind::Phi(ref args) if is_ref(inst_id) => {
                self.phis.push(inst_id);

                for &(_, src) in args {
                    self.constraints.push(Constraint::Copy { dst: inst_id, src });
                }
            }

            InstKind::CheckCast { obj, .. } => {
                self.constraints.push(Constraint::Copy {
                    dst: inst_id,
                    src: obj,
                });
            }

            InstKind::LoadField { obj, field } if is_ref(inst_id) => {
                self.constraints.push(Constraint::Load {
                    dst: inst_id,
                    base: obj,
                    access: Access::Field(field),
                });
            }

            InstKind::LoadElem { array, index } if is_ref(inst_id) => {
                self.constraints.push(Constraint::Load {
                    dst: inst_id,
                    base: array,
                    access: Access::Elem(const_u32(index)),
                });
            }

            InstKind::StoreField { obj, field, value } if is_ref(value) => {
                self.constraints.push(Constraint::Store {
                    base: obj,
                    access: Access::Field(field),
                    value,
                });
            }

            InstKind::StoreElem {
                array,
                index,
                value,
            } if is_ref(value) => {
                self.constraints.push(Constraint::Store {
                    base: array,
                    access: Access::Elem(const_u32(index)),
                    value,
                });
            }

            InstKind::ArrayFill { array, value } if is_ref(value) => {
                self.constraints.push(Constraint::Store {
                    base: array,
                    access: Access::AllElems,
                    value,
                });
            }

            InstKind::ArrayCopy {
                src,
                src_pos,
                dst,
                dst_pos,
                len,
            } => {
                let range = const_u32(src_pos)
                    .zip(const_u32(dst_pos))
                    .zip(const_u32(len))
                    .map(|((src_pos, dst_pos), len)| (src_pos, dst_pos, len));

                self.constraints
                    .push(Constraint::CopyElems { src, dst, range });
            }

            InstKind::StoreGlobal(_, value) if is_ref(value) => {
                self.constraints.push(Constraint::Sink {
                    value,
                    state: EscapeState::GlobalEscape,
                });
            }

            InstKind::MonitorEnter(obj) => self.monitors.push(obj),

            _ => {}
        }
    }

    fn add_alloc(&mut self, inst_id: InstId, shape: ObjShape, state: EscapeState) {
        let obj_id = self
            .objs
            .insert(ObjNode::new(ObjKind::Alloc(inst_id), shape, state));
        self.alloc_objs.insert(inst_id, obj_id);
        self.pts[inst_id].insert(obj_id);
    }

    pub fn pts_of(&self, inst_id: InstId) -> PtSet {
        self.pts.get(inst_id).cloned().unwrap_or_default()
    }

    /// The allocations `inst_id` may refer to.
    pub fn allocs_of(&self, inst_id: InstId) -> impl Iterator<Item = ObjId> + '_ {
        self.pts
            .get(inst_id)
            .into_iter()
            .flatten()
            .copied()
            .filter(|&obj_id| self.objs[obj_id].is_alloc())
    }

    /// Whether `inst_id` may refer to more than one object, counting unknown ones but not null.
    pub fn is_ambiguous(&self, inst_id: InstId) -> bool {
        self.pts
            .get(inst_id)
            .map(|pts| pts.iter().filter(|&&obj_id| obj_id != self.null).count() > 1)
            .unwrap_or(false)
    }

    pub fn may_be_null(&self, inst_id: InstId) -> bool {
        self.pts
            .get(inst_id)
            .is_some_and(|pts| pts.contains(&self.null))
    }

    pub fn allocs(&self) -> impl Iterator<Item = (ObjId, &ObjNode)> {
        self.objs.iter().filter(|(_, obj)| obj.is_alloc())
    }

    pub fn state_of_alloc(&self, inst_id: InstId) -> Option<EscapeState> {
        self.alloc_objs
            .get(inst_id)
            .map(|&obj_id| self.objs[obj_id].state)
    }

    /// Raises an allocation's state, returning whether it changed.
    pub(super) fn raise(&mut self, obj_id: ObjId, state: EscapeState) -> bool {
        let obj = &mut self.objs[obj_id];

        if !obj.is_alloc() || obj.state >= state {
            return false;
        }

        trace!("{:?} ({:?}): {} -> {}", obj_id, obj.kind, obj.state, state);
        obj.state = state;

        true
    }

    /// Records merge uses and monitor participation once points-to sets are final.
    pub(super) fn link(&mut self) {
        for obj in self.objs.values_mut() {
            obj.merge_uses.clear();
            obj.locked = false;
        }

        for &phi in &self.phis {
            for &obj_id in self.pts.get(phi).into_iter().flatten() {
                if self.objs[obj_id].is_alloc() {
                    self.objs[obj_id].merge_uses.push(phi);
                }
            }
        }

        for &monitor in &self.monitors {
            for &obj_id in self.pts.get(monitor).into_iter().flatten() {
                self.objs[obj_id].locked = true;
            }
        }
    }
}
