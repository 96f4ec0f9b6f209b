use std::collections::VecDeque;

use anyhow::{bail, Context, Result};
use log::debug;
use slotmap::SecondaryMap;

use crate::cfg::{DebugValue, InstId, ObjectRecipe, SafepointId, Shape};
use crate::program::Program;

use super::{DeoptState, Heap, Interpreter, ObjRef, RtValue};

struct Materializer<'a> {
    values: &'a SecondaryMap<InstId, RtValue>,
    recipes: &'a [ObjectRecipe],
    built: Vec<Option<ObjRef>>,
    pending: VecDeque<usize>,
}

impl Materializer<'_> {
    fn eval(&mut self, heap: &mut Heap, program: &Program, value: &DebugValue) -> Result<RtValue> {
        Ok(match value {
            DebugValue::Value(inst_id) => self.get(*inst_id)?,
            DebugValue::Const(value) => (*value).into(),

            DebugValue::Object(idx) => {
                let idx = *idx;
                let slot = self.built.get_mut(idx).context("object index out of range")?;

                match *slot {
                    Some(obj) => RtValue::Ref(obj),

                    None => {
                        let obj = heap.alloc(program, self.recipes[idx].shape);
                        heap.rematerialized += 1;
                        *slot = Some(obj);
                        self.pending.push_back(idx);

                        RtValue::Ref(obj)
                    }
                }
            }

            DebugValue::Merge(merge) => {
                let selector = self.get(merge.selector)?.to_i32().context("non-int merge selector")?;

                if selector == -1 {
                    self.get(merge.nsr)?
                } else {
                    let candidate = usize::try_from(selector)
                        .ok()
                        .and_then(|idx| merge.candidates.get(idx))
                        .with_context(|| format!("merge selector {selector} out of range"))?;

                    self.eval(heap, program, candidate)?
                }
            }
        })
    }

    fn get(&self, inst_id: InstId) -> Result<RtValue> {
        self.values
            .get(inst_id)
            .copied()
            .with_context(|| format!("debug state refers to uncomputed {inst_id:?}"))
    }
}

impl Interpreter<'_> {
    /// Reconstructs the interpreter-visible state recorded at `safepoint_id`.
    ///
    /// Scalar-replaced objects are allocated on first reference and shared between all their uses.
    pub(super) fn deoptimize(
        &self,
        heap: &mut Heap,
        values: &SecondaryMap<InstId, RtValue>,
        safepoint_id: SafepointId,
    ) -> Result<DeoptState> {
        let program = self.program;
        let safepoint = self
            .body
            .safepoints
            .get(safepoint_id)
            .with_context(|| format!("no safepoint {safepoint_id:?}"))?;

        debug!(
            "deoptimizing at {safepoint_id:?} with {} scalar-replaced objects",
            safepoint.objects.len()
        );

        let mut materializer = Materializer {
            values,
            recipes: &safepoint.objects,
            built: vec![None; safepoint.objects.len()],
            pending: VecDeque::new(),
        };

        let locals = safepoint
            .locals
            .iter()
            .map(|value| materializer.eval(heap, program, value))
            .collect::<Result<Vec<_>>>()?;

        let mut monitors = Vec::with_capacity(safepoint.monitors.len());

        for monitor in &safepoint.monitors {
            let obj = materializer.eval(heap, program, &monitor.obj)?;

            if monitor.eliminated {
                let Some(obj_ref) = obj.to_ref() else {
                    bail!("eliminated monitor of {safepoint_id:?} is not an object");
                };

                heap.objects[obj_ref].locks += 1;
            }

            monitors.push(obj);
        }

        while let Some(idx) = materializer.pending.pop_front() {
            let recipe = &safepoint.objects[idx];
            let obj = materializer.built[idx].context("pending object was never allocated")?;

            for (field_idx, value) in recipe.fields.iter().enumerate() {
                let value = materializer.eval(heap, program, value)?;
                let value = match recipe.shape {
                    Shape::Instance(class_id) => {
                        let field_id = program.classes[class_id].layout[field_idx];

                        value.narrow(program.fields[field_id].ty)
                    }

                    Shape::Array { elem, .. } => value.narrow(elem),
                };

                heap.objects[obj].fields[field_idx] = value;
            }
        }

        Ok(DeoptState {
            safepoint: safepoint_id,
            locals,
            monitors,
        })
    }
}
