use std::collections::VecDeque;

use hashbrown::HashMap;
use log::trace;

use crate::cfg::{DebugValue, FuncBody, InstId, ObjectRecipe, SafepointId};

use super::scalarize::Committed;
use super::EaError;

/// Replaces references to eliminated allocations in debug state with rematerialization recipes.
///
/// Returns the number of recipes emitted.
pub(super) fn emit(body: &mut FuncBody, committed: &Committed) -> Result<usize, EaError> {
    let mut total = 0;

    for (safepoint_id, safepoint) in body.safepoints.iter_mut() {
        let mut recipes = Recipes {
            safepoint_id,
            committed,
            indices: HashMap::new(),
            objects: std::mem::take(&mut safepoint.objects),
            pending: VecDeque::new(),
        };
        let base = recipes.objects.len();

        for value in &mut safepoint.locals {
            recipes.convert(value)?;
        }

        for monitor in &mut safepoint.monitors {
            if recipes.convert(&mut monitor.obj)? {
                monitor.eliminated = true;
            }
        }

        recipes.fill()?;

        if recipes.objects.len() > base {
            trace!(
                "{safepoint_id:?} describes {} eliminated objects",
                recipes.objects.len() - base
            );
        }

        total += recipes.objects.len() - base;
        safepoint.objects = recipes.objects;
    }

    Ok(total)
}

struct Recipes<'a> {
    safepoint_id: SafepointId,
    committed: &'a Committed,
    indices: HashMap<InstId, usize>,
    objects: Vec<ObjectRecipe>,
    pending: VecDeque<(usize, InstId)>,
}

impl Recipes<'_> {
    /// Returns whether `value` itself became a recipe reference.
    fn convert(&mut self, value: &mut DebugValue) -> Result<bool, EaError> {
        match value {
            DebugValue::Value(inst_id) if self.committed.shapes.contains_key(inst_id) => {
                *value = DebugValue::Object(self.index_of(*inst_id));

                Ok(true)
            }

            DebugValue::Merge(merge) => {
                for candidate in &mut merge.candidates {
                    self.convert(candidate)?;
                }

                Ok(false)
            }

            _ => Ok(false),
        }
    }

    fn index_of(&mut self, alloc: InstId) -> usize {
        if let Some(&idx) = self.indices.get(&alloc) {
            return idx;
        }

        let idx = self.objects.len();
        self.objects.push(ObjectRecipe {
            shape: self.committed.shapes[&alloc],
            fields: vec![],
        });
        self.indices.insert(alloc, idx);
        self.pending.push_back((idx, alloc));

        idx
    }

    fn fill(&mut self) -> Result<(), EaError> {
        while let Some((idx, alloc)) = self.pending.pop_front() {
            let mut fields = self
                .committed
                .snapshots
                .get(&self.safepoint_id)
                .and_then(|snapshot| snapshot.get(&alloc))
                .cloned()
                .ok_or_else(|| {
                    EaError::Invariant(format!(
                        "{:?} refers to {alloc:?}, whose state was not recorded",
                        self.safepoint_id
                    ))
                })?;

            for field in &mut fields {
                self.convert(field)?;
            }

            self.objects[idx].fields = fields;
        }

        Ok(())
    }
}
