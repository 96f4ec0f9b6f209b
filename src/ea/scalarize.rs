//! Scalar replacement of non-escaping allocations.
//!
//! Every slot of a scalar-replaceable object becomes an SSA variable. The variables are renamed
//! over the dominator tree with phis at the iterated dominance frontier of the blocks writing the
//! object, the way an SSA builder handles locals. Nothing is mutated until the whole plan has
//! been validated: an allocation whose uses cannot all be resolved is reported back so the
//! caller can keep it and plan again.

use std::collections::BTreeMap;

use hashbrown::{HashMap, HashSet};
use log::{debug, trace};
use slotmap::SecondaryMap;

use crate::cfg::{
    iterated_frontier, BinOp, BlockId, DebugValue, FuncBody, InstId, InstKind, SafepointId, Shape,
    Terminator, Ty, UnOp, Value,
};
use crate::program::{FieldId, Program};

use super::classify::{Classification, NsrReason};
use super::graph::{ConnectionGraph, ObjId, ObjShape};
use super::propagate::Budget;
use super::EaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Val {
    Inst(InstId),
    Phi(usize),
    Const(Value),
    Temp(usize),
}

/// An instruction the rewrite has to insert.
#[derive(Debug, Clone, Copy)]
enum TempOp {
    Narrow(Ty, Val),
    Binary(BinOp, Val, Val),
    LoadElem { array: Val, index: Val },
    StoreElem { array: Val, index: Val, value: Val },
    Barrier(usize),
}

#[derive(Debug, Clone)]
struct Temp {
    block: BlockId,
    before: InstId,
    op: TempOp,
    ty: Option<Ty>,
}

#[derive(Debug, Clone)]
struct Var {
    ty: Ty,
}

#[derive(Debug, Clone)]
struct VarPhi {
    block: BlockId,
    var: usize,
    args: Vec<(BlockId, Val)>,
}

#[derive(Debug, Clone)]
struct ObjInfo {
    inst: InstId,
    shape: Shape,
    base: usize,
    slots: usize,
}

#[derive(Debug, Clone, Default)]
pub(super) struct Plan {
    objs: BTreeMap<ObjId, ObjInfo>,
    vars: Vec<Var>,
    phis: Vec<VarPhi>,
    alias: HashMap<usize, Val>,
    temps: Vec<Temp>,
    replace: HashMap<InstId, Val>,
    dead: HashSet<InstId>,
    snapshots: HashMap<SafepointId, BTreeMap<ObjId, Vec<Val>>>,
    monitors_removed: usize,
}

pub(super) enum Planned {
    Ready(Plan),
    /// Allocations that have to be kept, with the reasons.
    Retry(BTreeMap<ObjId, NsrReason>),
}

#[derive(Debug, Clone, Default)]
pub(super) struct Committed {
    /// Field values of every eliminated object reachable from each safepoint, keyed by the
    /// allocation.
    pub snapshots: HashMap<SafepointId, HashMap<InstId, Vec<DebugValue>>>,
    pub shapes: HashMap<InstId, Shape>,
    pub eliminated: Vec<InstId>,
    pub dead: HashSet<InstId>,
    pub monitors_removed: usize,
}

enum Event {
    Enter(BlockId),
    Exit(usize),
}

struct Planner<'a> {
    program: &'a Program,
    body: &'a FuncBody,
    graph: &'a ConnectionGraph,
    plan: Plan,
    alloc_obj: HashMap<InstId, ObjId>,
    block_phis: SecondaryMap<BlockId, Vec<usize>>,
    current: Vec<Val>,
    undo: Vec<(usize, Val)>,
    failures: BTreeMap<ObjId, NsrReason>,
}

pub(super) fn plan(
    program: &Program,
    body: &FuncBody,
    graph: &ConnectionGraph,
    classes: &Classification,
    budget: &mut Budget,
) -> Result<Planned, EaError> {
    let mut plan = Plan::default();

    for &obj_id in &classes.sr {
        let obj = &graph.objs[obj_id];

        let Some(inst) = obj.alloc_inst() else {
            continue;
        };

        let (shape, tys) = match obj.shape {
            ObjShape::Instance(class_id) => (
                Shape::Instance(class_id),
                program.classes[class_id]
                    .layout
                    .iter()
                    .map(|&field_id| program.fields[field_id].ty)
                    .collect::<Vec<_>>(),
            ),

            ObjShape::Array {
                elem,
                len: Some(len),
            } => (Shape::Array { elem, len }, vec![elem; len as usize]),

            _ => {
                return Err(EaError::Invariant(format!(
                    "scalar-replaceable {inst:?} has no fixed shape"
                )))
            }
        };

        budget.charge(tys.len())?;
        plan.objs.insert(
            obj_id,
            ObjInfo {
                inst,
                shape,
                base: plan.vars.len(),
                slots: tys.len(),
            },
        );
        plan.vars.extend(tys.into_iter().map(|ty| Var { ty }));
    }

    if plan.objs.is_empty() {
        return Ok(Planned::Ready(plan));
    }

    let alloc_obj = plan
        .objs
        .iter()
        .map(|(&obj_id, info)| (info.inst, obj_id))
        .collect();
    let current = plan
        .vars
        .iter()
        .map(|var| Val::Const(var.ty.default_value()))
        .collect();

    let mut planner = Planner {
        program,
        body,
        graph,
        plan,
        alloc_obj,
        block_phis: SecondaryMap::new(),
        current,
        undo: vec![],
        failures: BTreeMap::new(),
    };

    planner.place_phis(budget)?;
    planner.rename(budget)?;
    planner.simplify_phis();
    planner.validate();

    if planner.failures.is_empty() {
        debug!(
            "planned the elimination of {} allocations with {} variables",
            planner.plan.objs.len(),
            planner.plan.vars.len(),
        );

        Ok(Planned::Ready(planner.plan))
    } else {
        debug!("{} allocations failed to resolve", planner.failures.len());

        Ok(Planned::Retry(planner.failures))
    }
}

impl Planner<'_> {
    fn fail(&mut self, obj_id: ObjId, reason: NsrReason) {
        if self.plan.objs.contains_key(&obj_id) && !self.failures.contains_key(&obj_id) {
            trace!("cannot eliminate {:?}: {reason}", self.plan.objs[&obj_id].inst);
            self.failures.insert(obj_id, reason);
        }
    }

    fn place_phis(&mut self, budget: &mut Budget) -> Result<(), EaError> {
        let body = self.body;
        let rpo = body.rpo();
        let preds = body.predecessors();
        let dom_tree = body.dom_tree(&preds, &rpo);
        let frontiers = body.dom_frontiers(&preds, &rpo, &dom_tree);
        let placement = body.placement();

        let mut defs = BTreeMap::<ObjId, Vec<BlockId>>::new();

        for (&obj_id, info) in &self.plan.objs {
            if let Some(&(block_id, _)) = placement.get(info.inst) {
                defs.entry(obj_id).or_default().push(block_id);
            }
        }

        for &block_id in &rpo.order {
            for &inst_id in &body.blocks[block_id].body {
                let base = match body.insts[inst_id].kind {
                    InstKind::StoreField { obj, .. } => obj,
                    InstKind::StoreElem { array, .. }
                    | InstKind::RawStore { array, .. }
                    | InstKind::ArrayFill { array, .. } => array,
                    InstKind::ArrayCopy { dst, .. } => dst,
                    _ => continue,
                };

                for obj_id in self.graph.allocs_of(base) {
                    if self.plan.objs.contains_key(&obj_id) {
                        defs.entry(obj_id).or_default().push(block_id);
                    }
                }
            }
        }

        for (obj_id, blocks) in defs {
            let info = &self.plan.objs[&obj_id];

            for block_id in iterated_frontier(&frontiers, &rpo, blocks) {
                for var in info.base..info.base + info.slots {
                    budget.tick()?;
                    let idx = self.plan.phis.len();
                    self.plan.phis.push(VarPhi {
                        block: block_id,
                        var,
                        args: vec![],
                    });

                    match self.block_phis.entry(block_id) {
                        Some(entry) => entry.or_default().push(idx),
                        None => continue,
                    }
                }
            }
        }

        trace!("placed {} variable phis", self.plan.phis.len());

        Ok(())
    }

    fn set(&mut self, var: usize, val: Val) {
        self.undo.push((var, self.current[var]));
        self.current[var] = val;
    }

    fn rename(&mut self, budget: &mut Budget) -> Result<(), EaError> {
        let body = self.body;
        let preds = body.predecessors();
        let rpo = body.rpo();
        let dom_tree = body.dom_tree(&preds, &rpo);
        let mut stack = vec![Event::Enter(dom_tree.root)];

        while let Some(event) = stack.pop() {
            match event {
                Event::Enter(block_id) => {
                    stack.push(Event::Exit(self.undo.len()));
                    self.visit_block(block_id, budget)?;

                    if let Some(children) = dom_tree.children.get(block_id) {
                        stack.extend(children.iter().rev().map(|&child| Event::Enter(child)));
                    }
                }

                Event::Exit(mark) => {
                    while self.undo.len() > mark {
                        if let Some((var, val)) = self.undo.pop() {
                            self.current[var] = val;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn visit_block(&mut self, block_id: BlockId, budget: &mut Budget) -> Result<(), EaError> {
        let body = self.body;
        let block = &body.blocks[block_id];

        for idx in self.block_phis.get(block_id).cloned().unwrap_or_default() {
            let var = self.plan.phis[idx].var;
            self.set(var, Val::Phi(idx));
        }

        for &inst_id in &block.body[body.phi_count(block_id)..] {
            budget.tick()?;
            self.visit_inst(block_id, inst_id);
        }

        if let Terminator::Deopt(safepoint_id) = block.term {
            self.snapshot(safepoint_id);
        }

        let mut succs = block.successors().to_vec();
        succs.sort_unstable();
        succs.dedup();

        for succ_block_id in succs {
            for &idx in self.block_phis.get(succ_block_id).into_iter().flatten() {
                let var = self.plan.phis[idx].var;
                let val = self.current[var];
                self.plan.phis[idx].args.push((block_id, val));
            }
        }

        Ok(())
    }

    fn resolve(&self, mut inst_id: InstId) -> InstId {
        loop {
            if let InstKind::CheckCast { obj, .. } = self.body.insts[inst_id].kind {
                inst_id = obj;
                continue;
            }

            match self.plan.replace.get(&inst_id) {
                Some(&Val::Inst(next)) if next != inst_id => inst_id = next,
                _ => return inst_id,
            }
        }
    }

    /// The eliminated object `value` refers to at this point of the walk.
    ///
    /// A value that may refer to an eliminated object but cannot be resolved to it fails that
    /// object.
    fn target(&mut self, value: InstId) -> Option<ObjId> {
        if let Some(&obj_id) = self.alloc_obj.get(&self.resolve(value)) {
            return Some(obj_id);
        }

        for obj_id in self.graph.allocs_of(value).collect::<Vec<_>>() {
            self.fail(obj_id, NsrReason::Unresolved);
        }

        None
    }

    fn field_slot(&mut self, obj_id: ObjId, field: FieldId) -> Option<usize> {
        let info = &self.plan.objs[&obj_id];

        let slot = match info.shape {
            Shape::Instance(class_id) => self
                .program
                .field_index(class_id, field)
                .map(|idx| info.base + idx),
            Shape::Array { .. } => None,
        };

        if slot.is_none() {
            self.fail(obj_id, NsrReason::UnsupportedUse);
        }

        slot
    }

    fn const_u32(&self, inst_id: InstId) -> Option<u32> {
        self.body.insts[inst_id]
            .kind
            .to_const()
            .and_then(|value| value.to_i32())
            .and_then(|value| u32::try_from(value).ok())
    }

    fn elem_slot(&mut self, obj_id: ObjId, index: InstId) -> Option<usize> {
        let info = &self.plan.objs[&obj_id];
        let slot = self
            .const_u32(index)
            .filter(|&index| (index as usize) < info.slots)
            .map(|index| info.base + index as usize);

        if slot.is_none() {
            self.fail(obj_id, NsrReason::UnknownIndex);
        }

        slot
    }

    fn elem_ty(&self, obj_id: ObjId) -> Option<Ty> {
        match self.plan.objs[&obj_id].shape {
            Shape::Array { elem, .. } => Some(elem),
            Shape::Instance(_) => None,
        }
    }

    fn replace(&mut self, inst_id: InstId, val: Val) {
        self.plan.replace.insert(inst_id, val);
        self.plan.dead.insert(inst_id);
    }

    fn val_ty(&self, val: Val) -> Option<Ty> {
        match val {
            Val::Inst(inst_id) => self.body.ty(inst_id),
            Val::Const(value) => Some(value.ty()),
            Val::Phi(idx) => Some(self.plan.vars[self.plan.phis[idx].var].ty.stack_ty()),
            Val::Temp(idx) => self.plan.temps[idx].ty,
        }
    }

    fn temp(&mut self, block: BlockId, before: InstId, op: TempOp, ty: Option<Ty>) -> Val {
        self.plan.temps.push(Temp {
            block,
            before,
            op,
            ty,
        });

        Val::Temp(self.plan.temps.len() - 1)
    }

    /// Converts `val` the way storing it into a slot of type `ty` does.
    fn narrow(&mut self, block: BlockId, before: InstId, val: Val, ty: Ty) -> Val {
        let val_ty = self.val_ty(val);
        let integral = |ty: Option<Ty>| matches!(ty, Some(Ty::Int | Ty::Long));
        let needed = matches!(ty, Ty::Byte | Ty::Short)
            || (integral(Some(ty)) && integral(val_ty) && val_ty != Some(ty));

        if !needed {
            return val;
        }

        match val {
            Val::Const(value) => Val::Const(value.narrow(ty).unwrap_or(value)),
            _ => self.temp(block, before, TempOp::Narrow(ty, val), Some(ty.stack_ty())),
        }
    }

    fn visit_inst(&mut self, block_id: BlockId, inst_id: InstId) {
        let body = self.body;
        let kind = &body.insts[inst_id].kind;

        if let Some(safepoint_id) = kind.safepoint() {
            self.snapshot(safepoint_id);
        }

        match *kind {
            InstKind::New(_) | InstKind::NewArray { .. } => {
                if let Some(&obj_id) = self.alloc_obj.get(&inst_id) {
                    let info = &self.plan.objs[&obj_id];

                    for var in info.base..info.base + info.slots {
                        let default = Val::Const(self.plan.vars[var].ty.default_value());
                        self.set(var, default);
                    }

                    self.plan.dead.insert(inst_id);
                }
            }

            InstKind::LoadField { obj, field } => {
                if let Some(obj_id) = self.target(obj) {
                    if let Some(var) = self.field_slot(obj_id, field) {
                        self.replace(inst_id, self.current[var]);
                    }
                }
            }

            InstKind::StoreField { obj, field, value } => {
                if let Some(obj_id) = self.target(obj) {
                    if let Some(var) = self.field_slot(obj_id, field) {
                        let ty = self.program.fields[field].ty;
                        let val = self.narrow(block_id, inst_id, Val::Inst(value), ty);
                        self.set(var, val);
                        self.plan.dead.insert(inst_id);
                    }
                }
            }

            InstKind::LoadElem { array, index } => {
                if let Some(obj_id) = self.target(array) {
                    if let Some(var) = self.elem_slot(obj_id, index) {
                        self.replace(inst_id, self.current[var]);
                    }
                }
            }

            InstKind::StoreElem {
                array,
                index,
                value,
            } => {
                if let Some(obj_id) = self.target(array) {
                    if let Some(var) = self.elem_slot(obj_id, index) {
                        let ty = self.plan.vars[var].ty;
                        let val = self.narrow(block_id, inst_id, Val::Inst(value), ty);
                        self.set(var, val);
                        self.plan.dead.insert(inst_id);
                    }
                }
            }

            InstKind::ArrayLength(array) => {
                if let Some(obj_id) = self.target(array) {
                    let len = self.plan.objs[&obj_id].slots as i32;
                    self.replace(inst_id, Val::Const(Value::Int(len)));
                }
            }

            InstKind::ArrayFill { array, value } => {
                if let Some(obj_id) = self.target(array) {
                    let info = &self.plan.objs[&obj_id];
                    let vars = info.base..info.base + info.slots;

                    if let Some(elem) = self.elem_ty(obj_id) {
                        let val = self.narrow(block_id, inst_id, Val::Inst(value), elem);

                        for var in vars {
                            self.set(var, val);
                        }

                        self.plan.dead.insert(inst_id);
                    }
                }
            }

            InstKind::RawStore {
                array,
                offset,
                width,
                value,
            } => {
                if let Some(obj_id) = self.target(array) {
                    self.raw_store(block_id, inst_id, obj_id, offset, width, value);
                }
            }

            InstKind::ArrayCopy {
                src,
                src_pos,
                dst,
                dst_pos,
                len,
            } => {
                let src_obj = self.target(src);
                let dst_obj = self.target(dst);

                if src_obj.is_some() || dst_obj.is_some() {
                    let bounds = self
                        .const_u32(src_pos)
                        .zip(self.const_u32(dst_pos))
                        .zip(self.const_u32(len))
                        .map(|((src_pos, dst_pos), len)| (src_pos, dst_pos, len));

                    match bounds {
                        Some(bounds) => {
                            self.array_copy(block_id, inst_id, (src, src_obj), (dst, dst_obj), bounds)
                        }

                        None => {
                            for obj_id in src_obj.into_iter().chain(dst_obj) {
                                self.fail(obj_id, NsrReason::ArrayCopy);
                            }
                        }
                    }
                }
            }

            InstKind::RefEq([lhs, rhs]) => {
                let lhs_obj = self.target(lhs);
                let rhs_obj = self.target(rhs);

                let result = match (lhs_obj, rhs_obj) {
                    (Some(lhs_obj), Some(rhs_obj)) => Some(lhs_obj == rhs_obj),
                    (Some(obj_id), None) => self.distinct_from(obj_id, rhs),
                    (None, Some(obj_id)) => self.distinct_from(obj_id, lhs),
                    (None, None) => None,
                };

                if let Some(result) = result {
                    self.replace(inst_id, Val::Const(Value::Int(result.into())));
                }
            }

            InstKind::LoadClass(obj) => {
                if let Some(obj_id) = self.target(obj) {
                    match self.plan.objs[&obj_id].shape {
                        Shape::Instance(class_id) => {
                            self.replace(inst_id, Val::Const(Value::Class(class_id)))
                        }

                        Shape::Array { .. } => self.fail(obj_id, NsrReason::UnsupportedUse),
                    }
                }
            }

            InstKind::InstanceOf { obj, class } => {
                if let Some(obj_id) = self.target(obj) {
                    let result = match self.plan.objs[&obj_id].shape {
                        Shape::Instance(class_id) => self.program.is_subclass(class_id, class),
                        Shape::Array { .. } => false,
                    };

                    self.replace(inst_id, Val::Const(Value::Int(result.into())));
                }
            }

            InstKind::CheckCast { obj, .. } => {
                if self.target(obj).is_some() {
                    self.replace(inst_id, Val::Inst(obj));
                }
            }

            InstKind::MonitorEnter(obj) | InstKind::MonitorExit(obj) => {
                if self.target(obj).is_some() {
                    self.plan.dead.insert(inst_id);
                    self.plan.monitors_removed += 1;
                }
            }

            _ => {}
        }
    }

    /// The result of comparing eliminated `obj_id` with an unresolved `other`, which must not
    /// be able to refer to it.
    fn distinct_from(&mut self, obj_id: ObjId, other: InstId) -> Option<bool> {
        if self.graph.pts_of(other).contains(&obj_id) {
            self.fail(obj_id, NsrReason::Identity);

            None
        } else {
            Some(false)
        }
    }

    fn raw_store(
        &mut self,
        block_id: BlockId,
        inst_id: InstId,
        obj_id: ObjId,
        offset: u32,
        width: u32,
        value: InstId,
    ) {
        let value_ty = self.body.ty(value);
        let layout = self.elem_ty(obj_id).and_then(|elem| {
            let elem_size = elem.byte_size()?;
            let value_size = value_ty.and_then(Ty::byte_size)?;
            let info = &self.plan.objs[&obj_id];
            let first = offset / elem_size;
            let count = width / elem_size;

            let fits = offset % elem_size == 0
                && width % elem_size == 0
                && width <= value_size
                && first as usize + count as usize <= info.slots;

            fits.then_some((elem, elem_size, info.base + first as usize, count))
        });

        let Some((elem, elem_size, first_var, count)) = layout else {
            self.fail(obj_id, NsrReason::RawStore);

            return;
        };

        // little-endian: element k receives bits [8 * elem_size * k, 8 * elem_size * (k + 1))
        for k in 0..count {
            let shift = 8 * elem_size * k;
            let part = if shift == 0 {
                Val::Inst(value)
            } else {
                let amount = match value_ty {
                    Some(Ty::Long) => Value::Long(shift.into()),
                    _ => Value::Int(shift as i32),
                };

                self.temp(
                    block_id,
                    inst_id,
                    TempOp::Binary(BinOp::ShrS, Val::Inst(value), Val::Const(amount)),
                    value_ty,
                )
            };

            let val = self.narrow(block_id, inst_id, part, elem);
            self.set(first_var + k as usize, val);
        }

        self.plan.dead.insert(inst_id);
    }

    fn array_copy(
        &mut self,
        block_id: BlockId,
        inst_id: InstId,
        (src, src_obj): (InstId, Option<ObjId>),
        (dst, dst_obj): (InstId, Option<ObjId>),
        (src_pos, dst_pos, len): (u32, u32, u32),
    ) {
        let in_range = |planner: &Self, obj_id: ObjId, pos: u32| {
            pos as usize + len as usize <= planner.plan.objs[&obj_id].slots
        };

        for (obj_id, pos) in [(src_obj, src_pos), (dst_obj, dst_pos)] {
            if let Some(obj_id) = obj_id {
                if !in_range(self, obj_id, pos) {
                    self.fail(obj_id, NsrReason::ArrayCopy);

                    return;
                }
            }
        }

        match (src_obj, dst_obj) {
            (Some(src_obj), Some(dst_obj)) => {
                let src_base = self.plan.objs[&src_obj].base + src_pos as usize;
                let dst_base = self.plan.objs[&dst_obj].base + dst_pos as usize;
                let values = (0..len as usize)
                    .map(|k| self.current[src_base + k])
                    .collect::<Vec<_>>();

                for (k, val) in values.into_iter().enumerate() {
                    self.set(dst_base + k, val);
                }
            }

            (Some(src_obj), None) => {
                // the real destination still has to be checked, which needs at least one store
                if len == 0 {
                    self.fail(src_obj, NsrReason::ArrayCopy);

                    return;
                }

                let src_base = self.plan.objs[&src_obj].base + src_pos as usize;
                let is_ref = self.elem_ty(src_obj) == Some(Ty::Ref);

                // the highest index first, so an out-of-bounds copy fails before writing
                for k in (0..len).rev() {
                    let store = self.temp(
                        block_id,
                        inst_id,
                        TempOp::StoreElem {
                            array: Val::Inst(dst),
                            index: Val::Const(Value::Int((dst_pos + k) as i32)),
                            value: self.current[src_base + k as usize],
                        },
                        None,
                    );

                    if is_ref {
                        if let Val::Temp(store) = store {
                            self.temp(block_id, inst_id, TempOp::Barrier(store), None);
                        }
                    }
                }
            }

            (None, Some(dst_obj)) => {
                if len == 0 {
                    self.fail(dst_obj, NsrReason::ArrayCopy);

                    return;
                }

                let dst_base = self.plan.objs[&dst_obj].base + dst_pos as usize;
                let elem = self.elem_ty(dst_obj).map(Ty::stack_ty);
                let loads = (0..len)
                    .map(|k| {
                        self.temp(
                            block_id,
                            inst_id,
                            TempOp::LoadElem {
                                array: Val::Inst(src),
                                index: Val::Const(Value::Int((src_pos + k) as i32)),
                            },
                            elem,
                        )
                    })
                    .collect::<Vec<_>>();

                for (k, val) in loads.into_iter().enumerate() {
                    self.set(dst_base + k, val);
                }
            }

            (None, None) => return,
        }

        self.plan.dead.insert(inst_id);
    }

    /// Records the current state of every eliminated object reachable from the safepoint.
    fn snapshot(&mut self, safepoint_id: SafepointId) {
        let mut roots = vec![];
        self.body.safepoints[safepoint_id].for_each_inst(|inst_id| roots.push(inst_id));

        let mut stack = roots
            .into_iter()
            .filter_map(|inst_id| self.target(inst_id))
            .collect::<Vec<_>>();
        let mut objs = BTreeMap::new();

        while let Some(obj_id) = stack.pop() {
            if objs.contains_key(&obj_id) {
                continue;
            }

            let info = &self.plan.objs[&obj_id];
            let values = self.current[info.base..info.base + info.slots].to_vec();

            for &val in &values {
                if let Val::Inst(inst_id) = val {
                    if let Some(&nested) = self.alloc_obj.get(&self.resolve(inst_id)) {
                        stack.push(nested);
                    }
                }
            }

            objs.insert(obj_id, values);
        }

        self.plan.snapshots.insert(safepoint_id, objs);
    }

    fn simplify_phis(&mut self) {
        loop {
            let mut changed = false;

            for idx in 0..self.plan.phis.len() {
                if self.plan.alias.contains_key(&idx) {
                    continue;
                }

                let mut unique = None;
                let mut trivial = true;

                for &(_, arg) in &self.plan.phis[idx].args {
                    let arg = self.plan.canon(arg);

                    if arg == Val::Phi(idx) {
                        continue;
                    }

                    match unique {
                        None => unique = Some(arg),
                        Some(unique) if unique == arg => {}

                        Some(_) => {
                            trivial = false;
                            break;
                        }
                    }
                }

                if let (true, Some(unique)) = (trivial, unique) {
                    self.plan.alias.insert(idx, unique);
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }
    }

    /// The eliminated object `val` refers to, if any.
    fn val_obj(&self, val: Val) -> Option<ObjId> {
        match self.plan.canon(val) {
            Val::Inst(inst_id) => self.alloc_obj.get(&self.resolve(inst_id)).copied(),
            _ => None,
        }
    }

    fn validate(&mut self) {
        let body = self.body;
        let mut live = vec![false; self.plan.phis.len()];
        let mut worklist = vec![];

        let roots = self
            .plan
            .replace
            .values()
            .copied()
            .chain(self.plan.snapshots.values().flat_map(|objs| objs.values().flatten().copied()))
            .chain(self.plan.temps.iter().flat_map(|temp| temp.op.operands()))
            .collect::<Vec<_>>();

        for val in roots {
            if let Val::Phi(idx) = self.plan.canon(val) {
                if !live[idx] {
                    live[idx] = true;
                    worklist.push(idx);
                }
            }
        }

        while let Some(idx) = worklist.pop() {
            for &(_, arg) in &self.plan.phis[idx].args {
                if let Val::Phi(arg_idx) = self.plan.canon(arg) {
                    if !live[arg_idx] {
                        live[arg_idx] = true;
                        worklist.push(arg_idx);
                    }
                }
            }
        }

        let mut failed = vec![];

        for (idx, phi) in self.plan.phis.iter().enumerate() {
            if live[idx] && self.plan.vars[phi.var].ty == Ty::Ref {
                failed.extend(phi.args.iter().filter_map(|&(_, arg)| self.val_obj(arg)));
            }
        }

        for temp in &self.plan.temps {
            failed.extend(temp.op.operands().filter_map(|val| self.val_obj(val)));
        }

        for block in body.blocks.values() {
            for &inst_id in &block.body {
                if self.plan.dead.contains(&inst_id) {
                    continue;
                }

                failed.extend(
                    body.insts[inst_id]
                        .kind
                        .operands()
                        .into_iter()
                        .filter_map(|operand| self.val_obj(Val::Inst(operand))),
                );
            }

            failed.extend(
                block
                    .term
                    .operand()
                    .and_then(|operand| self.val_obj(Val::Inst(operand))),
            );
        }

        for obj_id in failed {
            self.fail(obj_id, NsrReason::Unresolved);
        }
    }
}

impl TempOp {
    fn operands(&self) -> impl Iterator<Item = Val> {
        let operands = match *self {
            Self::Narrow(_, val) => vec![val],
            Self::Binary(_, lhs, rhs) => vec![lhs, rhs],
            Self::LoadElem { array, index } => vec![array, index],
            Self::StoreElem {
                array,
                index,
                value,
            } => vec![array, index, value],
            Self::Barrier(_) => vec![],
        };

        operands.into_iter()
    }
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }

    fn canon(&self, mut val: Val) -> Val {
        while let Val::Phi(idx) = val {
            match self.alias.get(&idx) {
                Some(&next) => val = next,
                None => break,
            }
        }

        val
    }

    /// Applies the plan to `body`.
    ///
    /// Removed instructions stay in place so that debug state can still be rewritten into
    /// recipes; the caller removes [`Committed::dead`] afterwards.
    pub(super) fn commit(self, body: &mut FuncBody) -> Result<Committed, EaError> {
        let mut emitter = Emitter {
            body,
            plan: &self,
            consts: HashMap::new(),
            phi_insts: vec![None; self.phis.len()],
            unfilled: vec![],
            temp_insts: vec![],
        };

        for temp in &self.temps {
            let kind = match temp.op {
                TempOp::Narrow(ty, val) => InstKind::Unary(UnOp::Narrow(ty), emitter.inst_of(val)?),

                TempOp::Binary(op, lhs, rhs) => {
                    InstKind::Binary(op, [emitter.inst_of(lhs)?, emitter.inst_of(rhs)?])
                }

                TempOp::LoadElem { array, index } => InstKind::LoadElem {
                    array: emitter.inst_of(array)?,
                    index: emitter.inst_of(index)?,
                },

                TempOp::StoreElem {
                    array,
                    index,
                    value,
                } => InstKind::StoreElem {
                    array: emitter.inst_of(array)?,
                    index: emitter.inst_of(index)?,
                    value: emitter.inst_of(value)?,
                },

                TempOp::Barrier(store) => InstKind::WriteBarrier {
                    store: emitter.inst_of(Val::Temp(store))?,
                },
            };

            let inst_id = emitter.body.add_inst(kind, temp.ty);
            let block = &mut emitter.body.blocks[temp.block];
            let pos = block
                .body
                .iter()
                .position(|&other| other == temp.before)
                .ok_or_else(|| {
                    EaError::Invariant(format!("{:?} is not in {:?}", temp.before, temp.block))
                })?;
            block.body.insert(pos, inst_id);
            emitter.temp_insts.push(inst_id);
        }

        let mut map = HashMap::new();

        for (&inst_id, &val) in &self.replace {
            let replacement = emitter.inst_of(val)?;

            if replacement != inst_id {
                map.insert(inst_id, replacement);
            }
        }

        let resolve = |map: &HashMap<InstId, InstId>, mut inst_id: InstId| {
            while let Some(&next) = map.get(&inst_id) {
                inst_id = next;
            }

            inst_id
        };

        let mut snapshots = HashMap::new();

        for (&safepoint_id, objs) in &self.snapshots {
            let mut fields = HashMap::new();

            for (obj_id, values) in objs {
                let values = values
                    .iter()
                    .map(|&val| -> Result<DebugValue, EaError> {
                        Ok(match self.canon(val) {
                            Val::Const(value) => DebugValue::Const(value),
                            Val::Inst(inst_id) => DebugValue::Value(resolve(&map, inst_id)),
                            val => DebugValue::Value(emitter.inst_of(val)?),
                        })
                    })
                    .collect::<Result<Vec<_>, EaError>>()?;

                fields.insert(self.objs[obj_id].inst, values);
            }

            snapshots.insert(safepoint_id, fields);
        }

        emitter.fill_phis()?;
        emitter.body.substitute(&map);

        let shapes = self
            .objs
            .values()
            .map(|info| (info.inst, info.shape))
            .collect();
        let eliminated = self.objs.values().map(|info| info.inst).collect();

        debug!(
            "committed {} temporaries and {} replacements",
            self.temps.len(),
            self.replace.len()
        );

        Ok(Committed {
            snapshots,
            shapes,
            eliminated,
            dead: self.dead,
            monitors_removed: self.monitors_removed,
        })
    }
}

struct Emitter<'a> {
    body: &'a mut FuncBody,
    plan: &'a Plan,
    consts: HashMap<Value, InstId>,
    phi_insts: Vec<Option<InstId>>,
    unfilled: Vec<usize>,
    temp_insts: Vec<InstId>,
}

impl Emitter<'_> {
    fn inst_of(&mut self, val: Val) -> Result<InstId, EaError> {
        match self.plan.canon(val) {
            Val::Inst(inst_id) => Ok(inst_id),

            Val::Const(value) => {
                if let Some(&inst_id) = self.consts.get(&value) {
                    return Ok(inst_id);
                }

                let inst_id = self.body.add_inst(InstKind::Const(value), Some(value.ty()));
                let entry = self.body.entry;
                let idx = self.body.phi_count(entry);
                self.body.blocks[entry].body.insert(idx, inst_id);
                self.consts.insert(value, inst_id);

                Ok(inst_id)
            }

            Val::Phi(idx) => {
                if let Some(inst_id) = self.phi_insts[idx] {
                    return Ok(inst_id);
                }

                let phi = &self.plan.phis[idx];
                let ty = self.plan.vars[phi.var].ty.stack_ty();
                let inst_id = self.body.add_inst(InstKind::Phi(vec![]), Some(ty));
                self.body.append_phi(phi.block, inst_id);
                self.phi_insts[idx] = Some(inst_id);
                self.unfilled.push(idx);

                Ok(inst_id)
            }

            Val::Temp(idx) => self.temp_insts.get(idx).copied().ok_or_else(|| {
                EaError::Invariant(format!("temporary #{idx} used before its creation"))
            }),
        }
    }

    /// Fills the inputs of every phi created so far, creating the phis they refer to.
    fn fill_phis(&mut self) -> Result<(), EaError> {
        while let Some(idx) = self.unfilled.pop() {
            let plan = self.plan;
            let args = plan.phis[idx]
                .args
                .iter()
                .map(|&(pred, val)| -> Result<(BlockId, InstId), EaError> {
                    Ok((pred, self.inst_of(val)?))
                })
                .collect::<Result<Vec<_>, EaError>>()?;

            if let Some(inst_id) = self.phi_insts[idx] {
                self.body.insts[inst_id].kind = InstKind::Phi(args);
            }
        }

        Ok(())
    }
}
