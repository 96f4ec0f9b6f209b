use std::fmt::{self, Display};

use slotmap::SecondaryMap;

use super::{DebugValue, FuncBody, InstId, InstKind, Shape, Terminator, UnOp, Value};

impl Display for UnOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Neg => write!(f, "neg"),
            Self::Not => write!(f, "not"),
            Self::Narrow(ty) => write!(f, "narrow.{ty}"),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Long(value) => write!(f, "{value}L"),
            Self::Null => write!(f, "null"),
            Self::Class(class_id) => write!(f, "class {class_id:?}"),
        }
    }
}

/// Instruction numbers in block order, so printed bodies do not depend on arena keys.
struct Names(SecondaryMap<InstId, usize>);

impl Names {
    fn of(&self, inst_id: InstId) -> impl Display {
        match self.0.get(inst_id) {
            Some(&idx) => format!("%{idx}"),
            None => format!("%?{inst_id:?}"),
        }
    }

    fn list(&self, inst_ids: &[InstId]) -> String {
        inst_ids
            .iter()
            .map(|&inst_id| self.of(inst_id).to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn debug_value(&self, value: &DebugValue) -> String {
        match value {
            DebugValue::Value(inst_id) => self.of(*inst_id).to_string(),
            DebugValue::Const(value) => value.to_string(),
            DebugValue::Object(idx) => format!("obj#{idx}"),
            DebugValue::Merge(merge) => format!(
                "merge(sel {}, nsr {}, [{}])",
                self.of(merge.selector),
                self.of(merge.nsr),
                merge
                    .candidates
                    .iter()
                    .map(|candidate| self.debug_value(candidate))
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
        }
    }

    fn kind(&self, kind: &InstKind) -> String {
        match kind {
            InstKind::Param(idx) => format!("param {idx}"),
            InstKind::Const(value) => format!("const {value}"),
            InstKind::Unary(op, operand) => format!("{op} {}", self.of(*operand)),
            InstKind::Binary(op, [lhs, rhs]) => {
                format!("{op} {}, {}", self.of(*lhs), self.of(*rhs))
            }
            InstKind::Phi(args) => format!(
                "phi {}",
                args.iter()
                    .map(|&(block_id, inst_id)| format!("[{block_id:?}: {}]", self.of(inst_id)))
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            InstKind::New(class_id) => format!("new {class_id:?}"),
            InstKind::NewArray { elem, len } => format!("newarray {elem}[{}]", self.of(*len)),
            InstKind::LoadField { obj, field } => format!("load {}.{field:?}", self.of(*obj)),
            InstKind::StoreField { obj, field, value } => {
                format!("store {}.{field:?}, {}", self.of(*obj), self.of(*value))
            }
            InstKind::LoadElem { array, index } => {
                format!("aload {}[{}]", self.of(*array), self.of(*index))
            }
            InstKind::StoreElem {
                array,
                index,
                value,
            } => format!(
                "astore {}[{}], {}",
                self.of(*array),
                self.of(*index),
                self.of(*value)
            ),
            InstKind::ArrayLength(array) => format!("arraylength {}", self.of(*array)),
            InstKind::RawStore {
                array,
                offset,
                width,
                value,
            } => format!(
                "rawstore{} {}+{offset}, {}",
                width * 8,
                self.of(*array),
                self.of(*value)
            ),
            InstKind::ArrayCopy {
                src,
                src_pos,
                dst,
                dst_pos,
                len,
            } => format!(
                "arraycopy {}[{}..] -> {}[{}..] x {}",
                self.of(*src),
                self.of(*src_pos),
                self.of(*dst),
                self.of(*dst_pos),
                self.of(*len),
            ),
            InstKind::ArrayFill { array, value } => {
                format!("arrayfill {}, {}", self.of(*array), self.of(*value))
            }
            InstKind::LoadGlobal(global_id) => format!("getglobal {global_id:?}"),
            InstKind::StoreGlobal(global_id, value) => {
                format!("setglobal {global_id:?}, {}", self.of(*value))
            }
            InstKind::Call(call) => format!(
                "call {:?}({}) @{:?}{}",
                call.callee,
                self.list(&call.args),
                call.safepoint,
                if call.arg_escape { " argescape" } else { "" },
            ),
            InstKind::RefEq([lhs, rhs]) => format!("refeq {}, {}", self.of(*lhs), self.of(*rhs)),
            InstKind::LoadClass(obj) => format!("loadclass {}", self.of(*obj)),
            InstKind::InstanceOf { obj, class } => {
                format!("instanceof {}, {class:?}", self.of(*obj))
            }
            InstKind::CheckCast { obj, class } => format!("checkcast {}, {class:?}", self.of(*obj)),
            InstKind::MonitorEnter(obj) => format!("monitorenter {}", self.of(*obj)),
            InstKind::MonitorExit(obj) => format!("monitorexit {}", self.of(*obj)),
            InstKind::WriteBarrier { store } => format!("barrier {}", self.of(*store)),
            InstKind::Safepoint(safepoint_id) => format!("safepoint @{safepoint_id:?}"),
            InstKind::Exception => "exception".into(),
        }
    }

    fn term(&self, term: &Terminator) -> String {
        match term {
            Terminator::Unreachable => "unreachable".into(),
            Terminator::Br(block_id) => format!("br {block_id:?}"),
            Terminator::If(cond, [then_block_id, else_block_id]) => {
                format!("if {} {then_block_id:?} {else_block_id:?}", self.of(*cond))
            }
            Terminator::Return(Some(value)) => format!("return {}", self.of(*value)),
            Terminator::Return(None) => "return".into(),
            Terminator::Throw(value) => format!("throw {}", self.of(*value)),
            Terminator::Deopt(safepoint_id) => format!("deopt @{safepoint_id:?}"),
            Terminator::Invoke(call, [normal, unwind]) => {
                format!("invoke {} to {normal:?} unwind {unwind:?}", self.of(*call))
            }
        }
    }
}

impl Display for FuncBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rpo = self.rpo();
        let preds = self.predecessors();
        let names = Names(
            rpo.order
                .iter()
                .flat_map(|&block_id| &self.blocks[block_id].body)
                .enumerate()
                .map(|(idx, &inst_id)| (inst_id, idx))
                .collect(),
        );

        for (idx, &block_id) in rpo.order.iter().enumerate() {
            let block = &self.blocks[block_id];

            writeln!(
                f,
                "{}{block_id:?}: predecessors {:?}, name {:?}",
                if idx > 0 { "\n" } else { "" },
                &preds[block_id],
                block.name,
            )?;

            for &inst_id in &block.body {
                let inst = &self.insts[inst_id];

                match inst.ty {
                    Some(ty) => write!(f, "  {}: {ty} = ", names.of(inst_id))?,
                    None => write!(f, "  ")?,
                }

                writeln!(f, "{}", names.kind(&inst.kind))?;
            }

            writeln!(f, "  {}", names.term(&block.term))?;
        }

        for (safepoint_id, safepoint) in &self.safepoints {
            writeln!(f)?;
            write!(f, "@{safepoint_id:?}: locals [")?;

            for (idx, value) in safepoint.locals.iter().enumerate() {
                write!(f, "{}{}", if idx > 0 { ", " } else { "" }, names.debug_value(value))?;
            }

            write!(f, "]")?;

            for monitor in &safepoint.monitors {
                write!(
                    f,
                    " lock({}{})",
                    names.debug_value(&monitor.obj),
                    if monitor.eliminated { ", eliminated" } else { "" },
                )?;
            }

            for (idx, object) in safepoint.objects.iter().enumerate() {
                let shape = match object.shape {
                    Shape::Instance(class_id) => format!("{class_id:?}"),
                    Shape::Array { elem, len } => format!("{elem}[{len}]"),
                };
                let fields = object
                    .fields
                    .iter()
                    .map(|value| names.debug_value(value))
                    .collect::<Vec<_>>()
                    .join(", ");

                write!(f, "\n  obj#{idx} = {shape} {{{fields}}}")?;
            }

            writeln!(f)?;
        }

        Ok(())
    }
}
