use log::{debug, trace};

use crate::cfg::InstId;

use super::graph::{Access, ConnectionGraph, Constraint, EscapeState, FieldKey, ObjId, PtSet};
use super::{Config, EaError};

/// Counts analysis steps against a fixed limit.
#[derive(Debug, Clone)]
pub struct Budget {
    limit: usize,
    spent: usize,
}

impl Budget {
    pub fn new(limit: usize) -> Self {
        Self { limit, spent: 0 }
    }

    pub fn tick(&mut self) -> Result<(), EaError> {
        self.charge(1)
    }

    pub fn charge(&mut self, steps: usize) -> Result<(), EaError> {
        self.spent += steps;

        if self.spent > self.limit {
            Err(EaError::StepBudget(self.limit))
        } else {
            Ok(())
        }
    }

    pub fn spent(&self) -> usize {
        self.spent
    }
}

impl ConnectionGraph {
    /// Runs points-to and escape propagation to a common fixpoint.
    ///
    /// Returns whether anything changed.
    pub fn propagate(&mut self, config: &Config, budget: &mut Budget) -> Result<bool, EaError> {
        let mut changed = false;

        for iter in 0..config.graph_iter_limit {
            let mut iter_changed = self.propagate_pointers(budget)?;
            iter_changed |= self.close_escape(budget)?;

            if !iter_changed {
                debug!("escape propagation converged after {} iterations", iter + 1);
                self.link();

                return Ok(changed);
            }

            changed = true;
        }

        Err(EaError::IterationLimit(config.graph_iter_limit))
    }

    fn propagate_pointers(&mut self, budget: &mut Budget) -> Result<bool, EaError> {
        let mut changed = false;

        loop {
            let mut pass_changed = false;

            for idx in 0..self.constraints.len() {
                budget.tick()?;
                pass_changed |= self.apply(self.constraints[idx]);
            }

            if !pass_changed {
                return Ok(changed);
            }

            changed = true;
        }
    }

    fn apply(&mut self, constraint: Constraint) -> bool {
        match constraint {
            Constraint::Copy { dst, src } => {
                let src = self.pts_of(src);

                self.add_pts(dst, &src)
            }

            Constraint::Load { dst, base, access } => {
                let mut loaded = PtSet::new();

                for obj_id in self.pts_of(base) {
                    loaded.extend(self.read_through(obj_id, access));
                }

                self.add_pts(dst, &loaded)
            }

            Constraint::Store {
                base,
                access,
                value,
            } => {
                let value = self.pts_of(value);
                let mut changed = false;

                for obj_id in self.pts_of(base) {
                    changed |= self.write(obj_id, access, &value);
                }

                changed
            }

            Constraint::CopyElems { src, dst, range } => {
                let mut changed = false;

                for src_id in self.pts_of(src) {
                    for dst_id in self.pts_of(dst) {
                        changed |= self.copy_elems(src_id, dst_id, range);
                    }
                }

                changed
            }

            Constraint::Sink { value, state } => {
                let mut changed = false;

                for obj_id in self.pts_of(value) {
                    changed |= self.raise(obj_id, state);
                }

                changed
            }
        }
    }

    /// The objects a load through `obj_id` may produce.
    fn read_through(&self, obj_id: ObjId, access: Access) -> PtSet {
        if obj_id == self.null {
            return PtSet::new();
        }

        let obj = &self.objs[obj_id];
        let mut result = obj.read(access, self.elem_limit);

        if obj_id == self.phantom || obj.state > EscapeState::NoEscape {
            result.insert(self.phantom);
        }

        result
    }

    /// Adds `value` to the slots of `obj_id` selected by `access`.
    fn write(&mut self, obj_id: ObjId, access: Access, value: &PtSet) -> bool {
        if obj_id == self.null || value.is_empty() {
            return false;
        }

        if obj_id == self.phantom {
            let mut changed = false;

            for &target in value {
                changed |= self.raise(target, EscapeState::GlobalEscape);
            }

            return changed;
        }

        let limit = self.elem_limit;
        let keys = self.objs[obj_id].keys(access, limit);
        let obj = &mut self.objs[obj_id];
        let mut changed = false;

        for key in keys {
            let slot = obj.fields.entry(key).or_default();
            let before = slot.len();
            slot.extend(value);
            changed |= slot.len() != before;
        }

        changed
    }

    fn copy_elems(&mut self, src_id: ObjId, dst_id: ObjId, range: Option<(u32, u32, u32)>) -> bool {
        let limit = self.elem_limit;
        let per_elem = match range {
            Some(range) if dst_id != self.phantom && dst_id != self.null => {
                self.objs[dst_id].tracked_len(limit).map(|_| range)
            }

            _ => None,
        };

        match per_elem {
            Some((src_pos, dst_pos, len)) => {
                let mut changed = false;

                for k in 0..len {
                    let value =
                        self.read_through(src_id, Access::Elem(src_pos.checked_add(k)));
                    let dst_idx = dst_pos.checked_add(k);
                    changed |= self.write(dst_id, Access::Elem(dst_idx), &value);
                }

                changed
            }

            None => {
                let value = self.read_through(src_id, Access::AllElems);

                self.write(dst_id, Access::Elem(None), &value)
            }
        }
    }

    fn add_pts(&mut self, inst_id: InstId, objs: &PtSet) -> bool {
        let Some(pts) = self.pts.get_mut(inst_id) else {
            return false;
        };

        let before = pts.len();
        pts.extend(objs);

        if pts.len() != before {
            trace!("pts({inst_id:?}) grew to {} objects", pts.len());

            true
        } else {
            false
        }
    }

    /// Promotes everything reachable from an escaping object to GlobalEscape.
    fn close_escape(&mut self, budget: &mut Budget) -> Result<bool, EaError> {
        let mut worklist = self
            .objs
            .iter()
            .filter(|(_, obj)| obj.is_alloc() && obj.state > EscapeState::NoEscape)
            .map(|(obj_id, _)| obj_id)
            .collect::<Vec<_>>();
        let mut changed = false;

        while let Some(obj_id) = worklist.pop() {
            budget.tick()?;

            let targets = self.objs[obj_id]
                .fields
                .values()
                .flatten()
                .copied()
                .collect::<Vec<_>>();

            for target in targets {
                if self.raise(target, EscapeState::GlobalEscape) {
                    changed = true;
                    worklist.push(target);
                }
            }
        }

        Ok(changed)
    }

    /// Whether any element of `obj_id` is summarized rather than tracked individually.
    pub fn has_summary_elem(&self, obj_id: ObjId) -> bool {
        self.objs[obj_id].fields.contains_key(&FieldKey::AnyElem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{FuncBuilder, Ty};
    use crate::program::{ArgEffect, CalleeKind, Program};

    fn analyze(program: &Program, body: &crate::cfg::FuncBody) -> ConnectionGraph {
        let config = Config::default();
        let mut graph = ConnectionGraph::build(program, body, &config);
        graph
            .propagate(&config, &mut Budget::new(config.step_budget))
            .unwrap();

        graph
    }

    #[test]
    fn escape_is_transitive_through_fields() {
        let mut program = Program::new();
        let node = program.add_class("Node", None, &[("next", Ty::Ref)]);
        let next = program.field(node, "next").unwrap();
        let global = program.add_global("g", Ty::Ref);

        let mut builder = FuncBuilder::new(&program, &[], None);
        let a = builder.new_object(node);
        let b = builder.new_object(node);
        let c = builder.new_object(node);
        builder.store_field(a, next, b);
        builder.store_field(b, next, c);
        builder.store_global(global, a);
        builder.ret(None);
        let body = builder.finish();

        let graph = analyze(&program, &body);

        for obj in [a, b, c] {
            assert_eq!(graph.state_of_alloc(obj), Some(EscapeState::GlobalEscape));
        }
    }

    #[test]
    fn borrowed_arguments_are_arg_escape() {
        let mut program = Program::new();
        let point = program.add_class("Point", None, &[("x", Ty::Int)]);
        let peek = program.add_callee(
            "peek",
            vec![Ty::Ref],
            None,
            CalleeKind::Summarized(vec![ArgEffect::Borrows]),
        );

        let mut builder = FuncBuilder::new(&program, &[], None);
        let obj = builder.new_object(point);
        let other = builder.new_object(point);
        builder.call(peek, &[obj], &[]);
        builder.ret(None);
        let body = builder.finish();

        let graph = analyze(&program, &body);

        assert_eq!(graph.state_of_alloc(obj), Some(EscapeState::ArgEscape));
        assert_eq!(graph.state_of_alloc(other), Some(EscapeState::NoEscape));
    }

    #[test]
    fn loads_from_escaped_objects_are_unknown() {
        let mut program = Program::new();
        let node = program.add_class("Node", None, &[("next", Ty::Ref)]);
        let next = program.field(node, "next").unwrap();

        let mut builder = FuncBuilder::new(&program, &[Ty::Ref], None);
        let param = builder.param(0);
        let obj = builder.new_object(node);
        let inner = builder.new_object(node);
        builder.store_field(obj, next, inner);
        builder.store_field(param, next, obj);
        let loaded = builder.load_field(obj, next);
        builder.ret(None);
        let body = builder.finish();

        let graph = analyze(&program, &body);

        assert_eq!(graph.state_of_alloc(obj), Some(EscapeState::GlobalEscape));
        assert_eq!(graph.state_of_alloc(inner), Some(EscapeState::GlobalEscape));
        assert!(graph.pts[loaded].contains(&graph.phantom));
        assert!(graph.pts[loaded].contains(&graph.alloc_objs[inner]));
    }

    #[test]
    fn propagation_is_idempotent() {
        let mut program = Program::new();
        let node = program.add_class("Node", None, &[("next", Ty::Ref)]);
        let next = program.field(node, "next").unwrap();

        let mut builder = FuncBuilder::new(&program, &[Ty::Int], Some(Ty::Ref));
        let cond = builder.param(0);
        let then_block = builder.create_block("then");
        let else_block = builder.create_block("else");
        let join = builder.create_block("join");
        builder.branch(cond, then_block, else_block);

        builder.switch_to(then_block);
        let a = builder.new_object(node);
        builder.br(join);

        builder.switch_to(else_block);
        let b = builder.new_object(node);
        builder.store_field(b, next, b);
        builder.br(join);

        builder.switch_to(join);
        let phi = builder.phi(Ty::Ref, &[(then_block, a), (else_block, b)]);
        builder.ret(Some(phi));
        let body = builder.finish();

        let config = Config::default();
        let mut graph = analyze(&program, &body);
        let states = graph
            .allocs()
            .map(|(obj_id, obj)| (obj_id, obj.state))
            .collect::<Vec<_>>();

        assert!(!graph
            .propagate(&config, &mut Budget::new(config.step_budget))
            .unwrap());
        assert_eq!(
            graph
                .allocs()
                .map(|(obj_id, obj)| (obj_id, obj.state))
                .collect::<Vec<_>>(),
            states
        );
        assert_eq!(graph.objs[graph.alloc_objs[a]].merge_uses, [phi]);
    }

    #[test]
    fn budget_is_enforced() {
        let mut program = Program::new();
        let node = program.add_class("Node", None, &[("next", Ty::Ref)]);
        let next = program.field(node, "next").unwrap();

        let mut builder = FuncBuilder::new(&program, &[], None);
        let mut prev = builder.new_object(node);

        for _ in 0..10 {
            let obj = builder.new_object(node);
            builder.store_field(obj, next, prev);
            prev = obj;
        }

        builder.ret(None);
        let body = builder.finish();

        let config = Config::default();
        let mut graph = ConnectionGraph::build(&program, &body, &config);

        assert_eq!(
            graph.propagate(&config, &mut Budget::new(5)),
            Err(EaError::StepBudget(5))
        );
    }
}
