use crate::program::{CalleeId, ClassId, FieldId, GlobalId, Program};

use super::{
    BinOp, Block, BlockId, Call, DebugValue, FuncBody, InstId, InstKind, MonitorSlot, Safepoint,
    SafepointId, Terminator, Ty, UnOp, Value,
};

/// Appends instructions to a [`FuncBody`] one block at a time.
///
/// Safepoints capture the monitors entered (and not yet exited) at the point of their creation,
/// so monitor regions must be built in lexical order.
pub struct FuncBuilder<'a> {
    program: &'a Program,
    body: FuncBody,
    current: BlockId,
    params: Vec<InstId>,
    monitors: Vec<InstId>,
}

impl<'a> FuncBuilder<'a> {
    pub fn new(program: &'a Program, params: &[Ty], ret: Option<Ty>) -> Self {
        let mut body = FuncBody::new(params.to_vec(), ret);
        let entry = body.entry;
        body.blocks[entry].name = Some("entry".into());

        let params = params
            .iter()
            .enumerate()
            .map(|(idx, &ty)| {
                let inst_id = body.add_inst(InstKind::Param(idx as u32), Some(ty.stack_ty()));
                body.blocks[entry].body.push(inst_id);

                inst_id
            })
            .collect();

        Self {
            program,
            body,
            current: entry,
            params,
            monitors: vec![],
        }
    }

    pub fn entry(&self) -> BlockId {
        self.body.entry
    }

    pub fn current(&self) -> BlockId {
        self.current
    }

    pub fn param(&self, idx: usize) -> InstId {
        self.params[idx]
    }

    pub fn create_block(&mut self, name: &str) -> BlockId {
        self.body.blocks.insert(Block {
            name: Some(name.into()),
            ..Default::default()
        })
    }

    pub fn switch_to(&mut self, block_id: BlockId) {
        self.current = block_id;
    }

    fn push(&mut self, kind: InstKind, ty: Option<Ty>) -> InstId {
        let inst_id = self.body.add_inst(kind, ty);
        self.body.blocks[self.current].body.push(inst_id);

        inst_id
    }

    fn capture(&mut self, locals: &[InstId]) -> SafepointId {
        self.body.safepoints.insert(Safepoint {
            locals: locals.iter().map(|&inst_id| DebugValue::Value(inst_id)).collect(),
            monitors: self
                .monitors
                .iter()
                .map(|&inst_id| MonitorSlot {
                    obj: DebugValue::Value(inst_id),
                    eliminated: false,
                })
                .collect(),
            ..Default::default()
        })
    }

    pub fn constant(&mut self, value: Value) -> InstId {
        self.push(InstKind::Const(value), Some(value.ty()))
    }

    pub fn int(&mut self, value: i32) -> InstId {
        self.constant(Value::Int(value))
    }

    pub fn long(&mut self, value: i64) -> InstId {
        self.constant(Value::Long(value))
    }

    pub fn null(&mut self) -> InstId {
        self.constant(Value::Null)
    }

    pub fn unary(&mut self, op: UnOp, operand: InstId) -> InstId {
        let ty = match op {
            UnOp::Neg | UnOp::Not => self.body.ty(operand),
            UnOp::Narrow(ty) => Some(ty.stack_ty()),
        };

        self.push(InstKind::Unary(op, operand), ty)
    }

    pub fn binary(&mut self, op: BinOp, lhs: InstId, rhs: InstId) -> InstId {
        let ty = if op.is_cmp() {
            Some(Ty::Int)
        } else {
            self.body.ty(lhs)
        };

        self.push(InstKind::Binary(op, [lhs, rhs]), ty)
    }

    pub fn add(&mut self, lhs: InstId, rhs: InstId) -> InstId {
        self.binary(BinOp::Add, lhs, rhs)
    }

    /// Creates a phi in the current block. Inputs can be added later with [`Self::add_phi_arg`].
    pub fn phi(&mut self, ty: Ty, args: &[(BlockId, InstId)]) -> InstId {
        let inst_id = self.body.add_inst(InstKind::Phi(args.to_vec()), Some(ty));
        self.body.append_phi(self.current, inst_id);

        inst_id
    }

    pub fn add_phi_arg(&mut self, phi: InstId, pred: BlockId, value: InstId) {
        if let InstKind::Phi(args) = &mut self.body.insts[phi].kind {
            args.push((pred, value));
        }
    }

    pub fn new_object(&mut self, class_id: ClassId) -> InstId {
        self.push(InstKind::New(class_id), Some(Ty::Ref))
    }

    pub fn new_array(&mut self, elem: Ty, len: InstId) -> InstId {
        self.push(InstKind::NewArray { elem, len }, Some(Ty::Ref))
    }

    pub fn load_field(&mut self, obj: InstId, field: FieldId) -> InstId {
        let ty = self.program.fields[field].ty.stack_ty();

        self.push(InstKind::LoadField { obj, field }, Some(ty))
    }

    pub fn store_field(&mut self, obj: InstId, field: FieldId, value: InstId) -> InstId {
        let store = self.push(InstKind::StoreField { obj, field, value }, None);
        self.barrier_for(store, value);

        store
    }

    pub fn load_elem(&mut self, array: InstId, index: InstId, elem: Ty) -> InstId {
        self.push(InstKind::LoadElem { array, index }, Some(elem.stack_ty()))
    }

    pub fn store_elem(&mut self, array: InstId, index: InstId, value: InstId) -> InstId {
        let store = self.push(
            InstKind::StoreElem {
                array,
                index,
                value,
            },
            None,
        );
        self.barrier_for(store, value);

        store
    }

    fn barrier_for(&mut self, store: InstId, value: InstId) {
        if self.body.ty(value) == Some(Ty::Ref) {
            self.push(InstKind::WriteBarrier { store }, None);
        }
    }

    pub fn array_length(&mut self, array: InstId) -> InstId {
        self.push(InstKind::ArrayLength(array), Some(Ty::Int))
    }

    pub fn raw_store(&mut self, array: InstId, offset: u32, width: u32, value: InstId) -> InstId {
        self.push(
            InstKind::RawStore {
                array,
                offset,
                width,
                value,
            },
            None,
        )
    }

    pub fn array_copy(
        &mut self,
        src: InstId,
        src_pos: InstId,
        dst: InstId,
        dst_pos: InstId,
        len: InstId,
    ) -> InstId {
        self.push(
            InstKind::ArrayCopy {
                src,
                src_pos,
                dst,
                dst_pos,
                len,
            },
            None,
        )
    }

    pub fn array_fill(&mut self, array: InstId, value: InstId) -> InstId {
        self.push(InstKind::ArrayFill { array, value }, None)
    }

    pub fn load_global(&mut self, global_id: GlobalId) -> InstId {
        let ty = self.program.globals[global_id].ty.stack_ty();

        self.push(InstKind::LoadGlobal(global_id), Some(ty))
    }

    pub fn store_global(&mut self, global_id: GlobalId, value: InstId) -> InstId {
        let store = self.push(InstKind::StoreGlobal(global_id, value), None);
        self.barrier_for(store, value);

        store
    }

    fn call_inst(&mut self, callee: CalleeId, args: &[InstId], locals: &[InstId]) -> InstId {
        let safepoint = self.capture(locals);
        let ty = self.program.callees[callee].ret.map(Ty::stack_ty);

        self.push(
            InstKind::Call(Call {
                callee,
                args: args.to_vec(),
                safepoint,
                arg_escape: false,
            }),
            ty,
        )
    }

    /// Emits a call whose exceptions propagate out of the method.
    pub fn call(&mut self, callee: CalleeId, args: &[InstId], locals: &[InstId]) -> InstId {
        self.call_inst(callee, args, locals)
    }

    /// Ends the current block with a call whose exceptions are caught by `unwind`.
    pub fn invoke(
        &mut self,
        callee: CalleeId,
        args: &[InstId],
        locals: &[InstId],
        normal: BlockId,
        unwind: BlockId,
    ) -> InstId {
        let call = self.call_inst(callee, args, locals);
        self.body.blocks[self.current].term = Terminator::Invoke(call, [normal, unwind]);

        call
    }

    pub fn ref_eq(&mut self, lhs: InstId, rhs: InstId) -> InstId {
        self.push(InstKind::RefEq([lhs, rhs]), Some(Ty::Int))
    }

    pub fn load_class(&mut self, obj: InstId) -> InstId {
        self.push(InstKind::LoadClass(obj), Some(Ty::Class))
    }

    pub fn instance_of(&mut self, obj: InstId, class: ClassId) -> InstId {
        self.push(InstKind::InstanceOf { obj, class }, Some(Ty::Int))
    }

    pub fn check_cast(&mut self, obj: InstId, class: ClassId) -> InstId {
        self.push(InstKind::CheckCast { obj, class }, Some(Ty::Ref))
    }

    pub fn monitor_enter(&mut self, obj: InstId) -> InstId {
        let inst_id = self.push(InstKind::MonitorEnter(obj), None);
        self.monitors.push(obj);

        inst_id
    }

    pub fn monitor_exit(&mut self, obj: InstId) -> InstId {
        if let Some(idx) = self.monitors.iter().rposition(|&held| held == obj) {
            self.monitors.remove(idx);
        }

        self.push(InstKind::MonitorExit(obj), None)
    }

    pub fn safepoint(&mut self, locals: &[InstId]) -> SafepointId {
        let safepoint = self.capture(locals);
        self.push(InstKind::Safepoint(safepoint), None);

        safepoint
    }

    pub fn exception(&mut self) -> InstId {
        self.push(InstKind::Exception, Some(Ty::Ref))
    }

    pub fn br(&mut self, target: BlockId) {
        self.body.blocks[self.current].term = Terminator::Br(target);
    }

    pub fn branch(&mut self, cond: InstId, then_block: BlockId, else_block: BlockId) {
        self.body.blocks[self.current].term = Terminator::If(cond, [then_block, else_block]);
    }

    pub fn ret(&mut self, value: Option<InstId>) {
        self.body.blocks[self.current].term = Terminator::Return(value);
    }

    pub fn throw(&mut self, value: InstId) {
        self.body.blocks[self.current].term = Terminator::Throw(value);
    }

    /// Ends the current block with an uncommon trap.
    pub fn deopt(&mut self, locals: &[InstId]) -> SafepointId {
        let safepoint = self.capture(locals);
        self.body.blocks[self.current].term = Terminator::Deopt(safepoint);

        safepoint
    }

    pub fn finish(mut self) -> FuncBody {
        self.body.remove_unreachable_blocks();

        self.body
    }
}
