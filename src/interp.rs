mod deopt;
mod heap;

use anyhow::{anyhow, bail, ensure, Context, Result};
use log::trace;
use slotmap::SecondaryMap;
use strum::Display;

use crate::cfg::{BinOp, BlockId, FuncBody, InstId, InstKind, SafepointId, Shape, Terminator, UnOp};
use crate::program::{CalleeId, FieldId, Program};

pub use self::heap::{Heap, ObjRef, Object, RtValue};

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Thrown {
    #[strum(to_string = "exception object")]
    Object(RtValue),

    NullPointer,
    IndexOutOfBounds,
    ClassCast,
    NegativeArraySize,
    IllegalMonitorState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeoptState {
    pub safepoint: SafepointId,
    pub locals: Vec<RtValue>,
    pub monitors: Vec<RtValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    Return(Option<RtValue>),
    Threw(Thrown),
    Deopt(DeoptState),
}

impl Exit {
    /// Compares two exits whose values live in different heaps.
    pub fn equiv(&self, heap: &Heap, other: &Exit, other_heap: &Heap) -> bool {
        let values = |lhs: &[RtValue], rhs: &[RtValue]| {
            lhs.len() == rhs.len()
                && lhs
                    .iter()
                    .zip(rhs)
                    .all(|(&lhs, &rhs)| heap.equiv(lhs, other_heap, rhs))
        };

        match (self, other) {
            (Self::Return(Some(lhs)), Self::Return(Some(rhs))) => heap.equiv(*lhs, other_heap, *rhs),
            (Self::Return(None), Self::Return(None)) => true,

            (Self::Threw(Thrown::Object(lhs)), Self::Threw(Thrown::Object(rhs))) => {
                heap.equiv(*lhs, other_heap, *rhs)
            }

            (Self::Threw(lhs), Self::Threw(rhs)) => lhs == rhs,

            (Self::Deopt(lhs), Self::Deopt(rhs)) => {
                lhs.safepoint == rhs.safepoint
                    && values(&lhs.locals, &rhs.locals)
                    && values(&lhs.monitors, &rhs.monitors)
            }

            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Return(Option<RtValue>),
    Throw(RtValue),
}

/// Implements the callees a method under interpretation invokes.
pub trait Host {
    fn call(
        &mut self,
        program: &Program,
        heap: &mut Heap,
        callee: CalleeId,
        args: &[RtValue],
    ) -> Result<CallOutcome>;
}

enum Flow {
    Next,
    Throw(Thrown),
    Deopt(SafepointId),
}

pub struct Interpreter<'a> {
    program: &'a Program,
    body: &'a FuncBody,
    forced_deopt: Option<SafepointId>,
    fuel: usize,
}

impl<'a> Interpreter<'a> {
    pub fn new(program: &'a Program, body: &'a FuncBody) -> Self {
        Self {
            program,
            body,
            forced_deopt: None,
            fuel: 1_000_000,
        }
    }

    /// Deoptimizes when execution reaches the instruction owning `safepoint`, before running it.
    pub fn force_deopt(mut self, safepoint: SafepointId) -> Self {
        self.forced_deopt = Some(safepoint);

        self
    }

    pub fn with_fuel(mut self, fuel: usize) -> Self {
        self.fuel = fuel;

        self
    }

    pub fn run(&self, heap: &mut Heap, host: &mut dyn Host, args: &[RtValue]) -> Result<Exit> {
        ensure!(
            args.len() == self.body.params.len(),
            "expected {} arguments, got {}",
            self.body.params.len(),
            args.len(),
        );

        let mut frame = Frame {
            values: SecondaryMap::new(),
            block_id: self.body.entry,
            pred: None,
            exception: None,
        };
        let mut fuel = self.fuel;

        'block: loop {
            fuel = fuel.checked_sub(1).context("ran out of fuel")?;
            let block = &self.body.blocks[frame.block_id];
            let phi_count = self.body.phi_count(frame.block_id);

            if phi_count > 0 {
                let pred = frame
                    .pred
                    .ok_or_else(|| anyhow!("phis in {:?} without a predecessor", frame.block_id))?;
                let mut incoming = Vec::with_capacity(phi_count);

                for &phi in &block.body[..phi_count] {
                    let InstKind::Phi(args) = &self.body.insts[phi].kind else {
                        unreachable!();
                    };
                    let &(_, value) = args
                        .iter()
                        .find(|&&(block_id, _)| block_id == pred)
                        .with_context(|| format!("phi {phi:?} has no input from {pred:?}"))?;

                    incoming.push((phi, frame.get(value)?));
                }

                for (phi, value) in incoming {
                    frame.values.insert(phi, value);
                }
            }

            for &inst_id in &block.body[phi_count..] {
                fuel = fuel.checked_sub(1).context("ran out of fuel")?;
                trace!("{:?}: {:?}", inst_id, self.body.insts[inst_id].kind);

                match self.step(heap, host, &mut frame, args, inst_id)? {
                    Flow::Next => {}

                    Flow::Throw(thrown) => match block.term {
                        Terminator::Invoke(call, [_, unwind]) if call == inst_id => {
                            trace!("unwinding to {unwind:?}");
                            frame.exception = Some(thrown);
                            frame.jump(unwind);
                            continue 'block;
                        }

                        _ => return Ok(Exit::Threw(thrown)),
                    },

                    Flow::Deopt(safepoint_id) => {
                        return self.deoptimize(heap, &frame.values, safepoint_id).map(Exit::Deopt);
                    }
                }
            }

            match block.term {
                Terminator::Unreachable => bail!("reached an unreachable terminator"),
                Terminator::Br(target) => frame.jump(target),

                Terminator::If(cond, [then_block_id, else_block_id]) => {
                    let cond = frame.get(cond)?.to_i32().context("non-int condition")?;
                    frame.jump(if cond != 0 { then_block_id } else { else_block_id });
                }

                Terminator::Return(value) => {
                    return Ok(Exit::Return(value.map(|value| frame.get(value)).transpose()?));
                }

                Terminator::Throw(value) => {
                    return Ok(Exit::Threw(match frame.get(value)? {
                        RtValue::Null => Thrown::NullPointer,
                        value => Thrown::Object(value),
                    }));
                }

                Terminator::Deopt(safepoint_id) => {
                    return self.deoptimize(heap, &frame.values, safepoint_id).map(Exit::Deopt);
                }

                Terminator::Invoke(_, [normal, _]) => frame.jump(normal),
            }
        }
    }

    fn step(
        &self,
        heap: &mut Heap,
        host: &mut dyn Host,
        frame: &mut Frame,
        args: &[RtValue],
        inst_id: InstId,
    ) -> Result<Flow> {
        let program = self.program;
        let inst = &self.body.insts[inst_id];

        if let Some(safepoint_id) = inst.kind.safepoint() {
            if self.forced_deopt == Some(safepoint_id) {
                return Ok(Flow::Deopt(safepoint_id));
            }
        }

        macro_rules! throw {
            ($thrown:expr) => {
                return Ok(Flow::Throw($thrown))
            };
        }

        macro_rules! obj {
            ($operand:expr) => {
                match frame.get($operand)? {
                    RtValue::Null => throw!(Thrown::NullPointer),
                    RtValue::Ref(obj) => obj,
                    value => bail!("{value:?} is not a reference"),
                }
            };
        }

        let result = match inst.kind {
            InstKind::Param(idx) => *args.get(idx as usize).context("parameter out of range")?,
            InstKind::Const(value) => value.into(),
            InstKind::Unary(op, operand) => unary(op, frame.get(operand)?)?,
            InstKind::Binary(op, [lhs, rhs]) => binary(op, frame.get(lhs)?, frame.get(rhs)?)?,
            InstKind::Phi(_) => bail!("phi {inst_id:?} after the start of a block"),

            InstKind::New(class_id) => {
                heap.allocations += 1;

                RtValue::Ref(heap.alloc(program, Shape::Instance(class_id)))
            }

            InstKind::NewArray { elem, len } => {
                let len = frame.get(len)?.to_i32().context("non-int array length")?;

                let Ok(len) = u32::try_from(len) else {
                    throw!(Thrown::NegativeArraySize);
                };

                heap.allocations += 1;

                RtValue::Ref(heap.alloc(program, Shape::Array { elem, len }))
            }

            InstKind::LoadField { obj, field } => {
                let obj = &heap.objects[obj!(obj)];

                *obj.fields
                    .get(field_index(program, obj, field)?)
                    .context("field out of range")?
            }

            InstKind::StoreField { obj, field, value } => {
                let obj = obj!(obj);
                let value = frame.get(value)?.narrow(program.fields[field].ty);
                let idx = field_index(program, &heap.objects[obj], field)?;
                heap.objects[obj].fields[idx] = value;

                return Ok(Flow::Next);
            }

            InstKind::LoadElem { array, index } => {
                let array = &heap.objects[obj!(array)];
                let index = frame.get(index)?.to_i32().context("non-int index")?;

                match usize::try_from(index).ok().and_then(|idx| array.fields.get(idx)) {
                    Some(&value) => value,
                    None => throw!(Thrown::IndexOutOfBounds),
                }
            }

            InstKind::StoreElem {
                array,
                index,
                value,
            } => {
                let array = obj!(array);
                let index = frame.get(index)?.to_i32().context("non-int index")?;
                let array = &mut heap.objects[array];
                let elem = array.elem_ty().context("element store into an instance")?;
                let value = frame.get(value)?.narrow(elem);

                match usize::try_from(index).ok().and_then(|idx| array.fields.get_mut(idx)) {
                    Some(slot) => *slot = value,
                    None => throw!(Thrown::IndexOutOfBounds),
                }

                return Ok(Flow::Next);
            }

            InstKind::ArrayLength(array) => {
                let array = &heap.objects[obj!(array)];
                ensure!(array.elem_ty().is_some(), "array length of an instance");

                RtValue::Int(array.fields.len() as i32)
            }

            InstKind::RawStore {
                array,
                offset,
                width,
                value,
            } => {
                let array = obj!(array);
                let value = frame.get(value)?;
                let array = &mut heap.objects[array];
                let elem = array.elem_ty().context("raw store into an instance")?;
                let elem_size = elem.byte_size().context("raw store into a reference array")?;
                let value_size = match value {
                    RtValue::Int(_) => 4,
                    RtValue::Long(_) => 8,
                    _ => bail!("raw store of a non-integral value"),
                };

                ensure!(
                    offset % elem_size == 0 && width % elem_size == 0 && width <= value_size,
                    "misaligned raw store of {width} bytes at {offset} into {elem} elements",
                );

                let first = (offset / elem_size) as usize;
                let count = (width / elem_size) as usize;

                if first + count > array.fields.len() {
                    throw!(Thrown::IndexOutOfBounds);
                }

                let bits = value.to_i64().unwrap_or_default();

                for k in 0..count {
                    let part = bits >> (8 * elem_size as usize * k);
                    array.fields[first + k] = RtValue::Long(part).narrow(elem);
                }

                return Ok(Flow::Next);
            }

            InstKind::ArrayCopy {
                src,
                src_pos,
                dst,
                dst_pos,
                len,
            } => {
                let src = obj!(src);
                let dst = obj!(dst);
                let int = |inst_id| -> Result<i64> {
                    Ok(frame.get(inst_id)?.to_i32().context("non-int copy bound")?.into())
                };
                let (src_pos, dst_pos, len) = (int(src_pos)?, int(dst_pos)?, int(len)?);

                ensure!(
                    heap.objects[src].elem_ty().is_some()
                        && heap.objects[src].elem_ty() == heap.objects[dst].elem_ty(),
                    "array copy between incompatible objects",
                );

                let src_len = heap.objects[src].fields.len() as i64;
                let dst_len = heap.objects[dst].fields.len() as i64;

                if src_pos < 0 || dst_pos < 0 || len < 0 || src_pos + len > src_len || dst_pos + len > dst_len {
                    throw!(Thrown::IndexOutOfBounds);
                }

                let (src_pos, dst_pos, len) = (src_pos as usize, dst_pos as usize, len as usize);
                let values = heap.objects[src].fields[src_pos..src_pos + len].to_vec();
                heap.objects[dst].fields[dst_pos..dst_pos + len].copy_from_slice(&values);

                return Ok(Flow::Next);
            }

            InstKind::ArrayFill { array, value } => {
                let array = obj!(array);
                let value = frame.get(value)?;
                let array = &mut heap.objects[array];
                let elem = array.elem_ty().context("fill of an instance")?;
                array.fields.fill(value.narrow(elem));

                return Ok(Flow::Next);
            }

            InstKind::LoadGlobal(global_id) => heap.global(program, global_id),

            InstKind::StoreGlobal(global_id, value) => {
                let value = frame.get(value)?.narrow(program.globals[global_id].ty);
                heap.globals.insert(global_id, value);

                return Ok(Flow::Next);
            }

            InstKind::Call(ref call) => {
                let args = call
                    .args
                    .iter()
                    .map(|&arg| frame.get(arg))
                    .collect::<Result<Vec<_>>>()?;

                match host.call(program, heap, call.callee, &args)? {
                    CallOutcome::Return(Some(value)) => value,
                    CallOutcome::Return(None) => return Ok(Flow::Next),
                    CallOutcome::Throw(RtValue::Null) => throw!(Thrown::NullPointer),
                    CallOutcome::Throw(value) => throw!(Thrown::Object(value)),
                }
            }

            InstKind::RefEq([lhs, rhs]) => RtValue::Int((frame.get(lhs)? == frame.get(rhs)?).into()),

            InstKind::LoadClass(obj) => match heap.objects[obj!(obj)].shape {
                Shape::Instance(class_id) => RtValue::Class(class_id),
                Shape::Array { .. } => bail!("class load of an array"),
            },

            InstKind::InstanceOf { obj, class } => match frame.get(obj)? {
                RtValue::Ref(obj) => RtValue::Int(match heap.objects[obj].shape {
                    Shape::Instance(class_id) => program.is_subclass(class_id, class).into(),
                    Shape::Array { .. } => 0,
                }),

                _ => RtValue::Int(0),
            },

            InstKind::CheckCast { obj, class } => match frame.get(obj)? {
                RtValue::Null => RtValue::Null,

                RtValue::Ref(obj) => match heap.objects[obj].shape {
                    Shape::Instance(class_id) if program.is_subclass(class_id, class) => {
                        RtValue::Ref(obj)
                    }

                    _ => throw!(Thrown::ClassCast),
                },

                value => bail!("{value:?} is not a reference"),
            },

            InstKind::MonitorEnter(obj) => {
                heap.objects[obj!(obj)].locks += 1;

                return Ok(Flow::Next);
            }

            InstKind::MonitorExit(obj) => {
                let obj = &mut heap.objects[obj!(obj)];

                if obj.locks == 0 {
                    throw!(Thrown::IllegalMonitorState);
                }

                obj.locks -= 1;

                return Ok(Flow::Next);
            }

            InstKind::WriteBarrier { .. } | InstKind::Safepoint(_) => return Ok(Flow::Next),

            InstKind::Exception => match frame.exception {
                Some(Thrown::Object(value)) => value,
                Some(_) => RtValue::Null,
                None => bail!("no exception in flight"),
            },
        };

        trace!("  = {result:?}");
        frame.values.insert(inst_id, result);

        Ok(Flow::Next)
    }
}

struct Frame {
    values: SecondaryMap<InstId, RtValue>,
    block_id: BlockId,
    pred: Option<BlockId>,
    exception: Option<Thrown>,
}

impl Frame {
    fn get(&self, inst_id: InstId) -> Result<RtValue> {
        self.values
            .get(inst_id)
            .copied()
            .with_context(|| format!("{inst_id:?} used before it was computed"))
    }

    fn jump(&mut self, block_id: BlockId) {
        self.pred = Some(self.block_id);
        self.block_id = block_id;
    }
}

fn field_index(program: &Program, obj: &Object, field: FieldId) -> Result<usize> {
    match obj.shape {
        Shape::Instance(class_id) => program
            .field_index(class_id, field)
            .with_context(|| format!("{} has no field {field:?}", program.classes[class_id].name)),

        Shape::Array { .. } => bail!("field access on an array"),
    }
}

fn unary(op: UnOp, value: RtValue) -> Result<RtValue> {
    Ok(match (op, value) {
        (UnOp::Neg, RtValue::Int(value)) => RtValue::Int(value.wrapping_neg()),
        (UnOp::Neg, RtValue::Long(value)) => RtValue::Long(value.wrapping_neg()),
        (UnOp::Not, RtValue::Int(value)) => RtValue::Int(!value),
        (UnOp::Not, RtValue::Long(value)) => RtValue::Long(!value),
        (UnOp::Narrow(ty), RtValue::Int(_) | RtValue::Long(_)) => value.narrow(ty),
        _ => bail!("cannot apply {op} to {value:?}"),
    })
}

fn binary(op: BinOp, lhs: RtValue, rhs: RtValue) -> Result<RtValue> {
    fn cmp<T: Ord>(op: BinOp, lhs: T, rhs: T) -> RtValue {
        RtValue::Int(
            match op {
                BinOp::Eq => lhs == rhs,
                BinOp::Ne => lhs != rhs,
                BinOp::Lt => lhs < rhs,
                BinOp::Le => lhs <= rhs,
                BinOp::Gt => lhs > rhs,
                _ => lhs >= rhs,
            }
            .into(),
        )
    }

    Ok(match (lhs, rhs) {
        (RtValue::Int(lhs), RtValue::Int(rhs)) if op.is_cmp() => cmp(op, lhs, rhs),
        (RtValue::Long(lhs), RtValue::Long(rhs)) if op.is_cmp() => cmp(op, lhs, rhs),
        (RtValue::Class(lhs), RtValue::Class(rhs)) if matches!(op, BinOp::Eq | BinOp::Ne) => {
            RtValue::Int(((lhs == rhs) == (op == BinOp::Eq)).into())
        }

        (RtValue::Int(lhs), RtValue::Int(rhs)) => RtValue::Int(match op {
            BinOp::Add => lhs.wrapping_add(rhs),
            BinOp::Sub => lhs.wrapping_sub(rhs),
            BinOp::Mul => lhs.wrapping_mul(rhs),
            BinOp::And => lhs & rhs,
            BinOp::Or => lhs | rhs,
            BinOp::Xor => lhs ^ rhs,
            BinOp::Shl => lhs.wrapping_shl(rhs as u32),
            BinOp::ShrS => lhs.wrapping_shr(rhs as u32),
            BinOp::ShrU => (lhs as u32).wrapping_shr(rhs as u32) as i32,
            _ => unreachable!(),
        }),

        (RtValue::Long(lhs), RtValue::Long(rhs)) => RtValue::Long(match op {
            BinOp::Add => lhs.wrapping_add(rhs),
            BinOp::Sub => lhs.wrapping_sub(rhs),
            BinOp::Mul => lhs.wrapping_mul(rhs),
            BinOp::And => lhs & rhs,
            BinOp::Or => lhs | rhs,
            BinOp::Xor => lhs ^ rhs,
            BinOp::Shl => lhs.wrapping_shl(rhs as u32),
            BinOp::ShrS => lhs.wrapping_shr(rhs as u32),
            BinOp::ShrU => (lhs as u64).wrapping_shr(rhs as u32) as i64,
            _ => unreachable!(),
        }),

        _ => bail!("cannot apply {op} to {lhs:?} and {rhs:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{FuncBuilder, Ty};

    #[test]
    fn shifts_mask_their_amount() {
        assert_eq!(
            binary(BinOp::Shl, RtValue::Int(1), RtValue::Int(33)).unwrap(),
            RtValue::Int(2)
        );
        assert_eq!(
            binary(BinOp::ShrU, RtValue::Int(-1), RtValue::Int(28)).unwrap(),
            RtValue::Int(0xf)
        );
        assert_eq!(
            binary(BinOp::ShrS, RtValue::Long(-256), RtValue::Long(4)).unwrap(),
            RtValue::Long(-16)
        );
    }

    #[test]
    fn mixed_operands_are_rejected() {
        assert!(binary(BinOp::Add, RtValue::Int(1), RtValue::Long(1)).is_err());
        assert!(unary(UnOp::Neg, RtValue::Null).is_err());
    }

    struct NoCalls;

    impl Host for NoCalls {
        fn call(
            &mut self,
            _: &Program,
            _: &mut Heap,
            callee: CalleeId,
            _: &[RtValue],
        ) -> Result<CallOutcome> {
            bail!("unexpected call to {callee:?}")
        }
    }

    #[test]
    fn endless_loops_run_out_of_fuel() {
        let program = Program::new();
        let mut builder = FuncBuilder::new(&program, &[], None);
        let spin = builder.create_block("spin");
        builder.br(spin);

        builder.switch_to(spin);
        builder.br(spin);
        let body = builder.finish();

        let result = Interpreter::new(&program, &body)
            .with_fuel(100)
            .run(&mut Heap::new(), &mut NoCalls, &[]);

        assert!(result.is_err());
    }

    #[test]
    fn narrowing_wraps() {
        assert_eq!(
            unary(UnOp::Narrow(Ty::Byte), RtValue::Int(200)).unwrap(),
            RtValue::Int(-56)
        );
    }
}
