use hashbrown::HashSet;
use thiserror::Error;

use crate::program::Program;

use super::{
    BlockId, DebugValue, FuncBody, InstId, InstKind, SafepointId, SafepointSite, Shape, Terminator,
    Use,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("{0:?} is placed more than once")]
    DuplicatePlacement(InstId),

    #[error("{user:?} uses {operand:?}, which is not placed")]
    UnplacedOperand { user: Use, operand: InstId },

    #[error("{user:?} uses {operand:?}, which does not dominate it")]
    NotDominated { user: Use, operand: InstId },

    #[error("phi {phi:?} is not at the start of {block:?}")]
    MisplacedPhi { phi: InstId, block: BlockId },

    #[error("phi {phi:?} has inputs from {found:?}, but the predecessors are {expected:?}")]
    PhiInputs {
        phi: InstId,
        found: Vec<BlockId>,
        expected: Vec<BlockId>,
    },

    #[error("the invoke ending {0:?} is not preceded by its call")]
    DetachedInvoke(BlockId),

    #[error("barrier {barrier:?} refers to {store:?}, which is not a placed store")]
    DanglingBarrier { barrier: InstId, store: InstId },

    #[error("the debug state of {0:?} refers to the result of its own call")]
    SelfReferencingSafepoint(SafepointId),

    #[error("object #{idx} of {safepoint:?} has {found} fields, but its shape has {expected}")]
    RecipeShape {
        safepoint: SafepointId,
        idx: usize,
        found: usize,
        expected: usize,
    },

    #[error("{safepoint:?} refers to object #{idx}, which does not exist")]
    MissingObject { safepoint: SafepointId, idx: usize },
}

impl FuncBody {
    pub fn verify(&self, program: &Program) -> Result<(), VerifyError> {
        let rpo = self.rpo();
        let preds = self.predecessors();
        let dom_tree = self.dom_tree(&preds, &rpo);
        let mut placement = slotmap::SecondaryMap::new();

        for (block_id, block) in &self.blocks {
            for (idx, &inst_id) in block.body.iter().enumerate() {
                if placement.insert(inst_id, (block_id, idx)).is_some() {
                    return Err(VerifyError::DuplicatePlacement(inst_id));
                }
            }
        }

        // whether `operand` is available right before position `idx` of `block_id`
        let available = |user: Use, operand: InstId, block_id: BlockId, idx: usize| {
            let Some(&(def_block_id, def_idx)) = placement.get(operand) else {
                return Err(VerifyError::UnplacedOperand { user, operand });
            };

            let ok = if def_block_id == block_id {
                def_idx < idx
            } else {
                dom_tree.dominates(def_block_id, block_id)
            };

            if ok {
                Ok(())
            } else {
                Err(VerifyError::NotDominated { user, operand })
            }
        };

        for &block_id in &rpo.order {
            let block = &self.blocks[block_id];
            let phi_count = self.phi_count(block_id);
            let mut reachable_preds = preds[block_id]
                .iter()
                .copied()
                .filter(|&pred| rpo.is_reachable(pred))
                .collect::<Vec<_>>();
            reachable_preds.sort_unstable();

            for (idx, &inst_id) in block.body.iter().enumerate() {
                let user = Use::Inst(inst_id);

                match &self.insts[inst_id].kind {
                    InstKind::Phi(args) => {
                        if idx >= phi_count {
                            return Err(VerifyError::MisplacedPhi {
                                phi: inst_id,
                                block: block_id,
                            });
                        }

                        let mut found = args.iter().map(|&(pred, _)| pred).collect::<Vec<_>>();
                        found.sort_unstable();

                        if found != reachable_preds {
                            return Err(VerifyError::PhiInputs {
                                phi: inst_id,
                                found,
                                expected: reachable_preds,
                            });
                        }

                        for &(pred, operand) in args {
                            let end = self.blocks[pred].body.len();
                            available(user, operand, pred, end)?;
                        }
                    }

                    InstKind::WriteBarrier { store } => {
                        let is_store = self.insts.get(*store).is_some_and(|store| {
                            matches!(
                                store.kind,
                                InstKind::StoreField { .. }
                                    | InstKind::StoreElem { .. }
                                    | InstKind::StoreGlobal(..)
                            )
                        });

                        if !is_store || !placement.contains_key(*store) {
                            return Err(VerifyError::DanglingBarrier {
                                barrier: inst_id,
                                store: *store,
                            });
                        }
                    }

                    kind => {
                        for operand in kind.operands() {
                            available(user, operand, block_id, idx)?;
                        }
                    }
                }
            }

            if let Some(operand) = block.term.operand() {
                available(Use::Term(block_id), operand, block_id, block.body.len())?;
            }

            if let Terminator::Invoke(call, _) = block.term {
                let is_call = matches!(self.insts[call].kind, InstKind::Call(_));

                if !is_call || block.body.last() != Some(&call) {
                    return Err(VerifyError::DetachedInvoke(block_id));
                }
            }
        }

        let sites = self.safepoint_sites();

        for (safepoint_id, site) in &sites {
            if !rpo.is_reachable(site.block()) {
                continue;
            }

            let safepoint = &self.safepoints[safepoint_id];
            let user = Use::Debug(safepoint_id);
            let (block_id, idx) = match *site {
                SafepointSite::Inst(block_id, inst_id) => (block_id, placement[inst_id].1),
                SafepointSite::Term(block_id) => (block_id, self.blocks[block_id].body.len()),
            };
            let own_result = match *site {
                SafepointSite::Inst(_, inst_id) => Some(inst_id),
                SafepointSite::Term(_) => None,
            };

            let mut operands = HashSet::new();
            safepoint.for_each_inst(|inst_id| {
                operands.insert(inst_id);
            });

            for operand in operands {
                if Some(operand) == own_result {
                    return Err(VerifyError::SelfReferencingSafepoint(safepoint_id));
                }

                available(user, operand, block_id, idx)?;
            }

            let check_index = |value: &DebugValue| -> Result<(), VerifyError> {
                let mut stack = vec![value];

                while let Some(value) = stack.pop() {
                    match value {
                        DebugValue::Object(idx) if *idx >= safepoint.objects.len() => {
                            return Err(VerifyError::MissingObject {
                                safepoint: safepoint_id,
                                idx: *idx,
                            });
                        }

                        DebugValue::Merge(merge) => stack.extend(&merge.candidates),
                        _ => {}
                    }
                }

                Ok(())
            };

            for value in safepoint
                .locals
                .iter()
                .chain(safepoint.monitors.iter().map(|monitor| &monitor.obj))
            {
                check_index(value)?;
            }

            for (idx, object) in safepoint.objects.iter().enumerate() {
                let expected = match object.shape {
                    Shape::Instance(class_id) => program.classes[class_id].layout.len(),
                    Shape::Array { len, .. } => len as usize,
                };

                if object.fields.len() != expected {
                    return Err(VerifyError::RecipeShape {
                        safepoint: safepoint_id,
                        idx,
                        found: object.fields.len(),
                        expected,
                    });
                }

                for value in &object.fields {
                    check_index(value)?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{FuncBuilder, Ty};

    /// Branches on the parameter into `then` and `else`, both falling through to `join`.
    fn diamond(program: &Program) -> (FuncBuilder<'_>, [BlockId; 3]) {
        let mut builder = FuncBuilder::new(program, &[Ty::Int], Some(Ty::Int));
        let cond = builder.param(0);
        let then_block = builder.create_block("then");
        let else_block = builder.create_block("else");
        let join = builder.create_block("join");
        builder.branch(cond, then_block, else_block);

        builder.switch_to(else_block);
        builder.br(join);

        builder.switch_to(then_block);
        builder.br(join);

        (builder, [then_block, else_block, join])
    }

    #[test]
    fn phis_cover_every_predecessor() {
        let program = Program::new();
        let (mut builder, [then_block, _, join]) = diamond(&program);
        let one = builder.int(1);
        builder.switch_to(join);
        let phi = builder.phi(Ty::Int, &[(then_block, one)]);
        builder.ret(Some(phi));
        let body = builder.finish();

        assert!(matches!(
            body.verify(&program),
            Err(VerifyError::PhiInputs { phi: found, .. }) if found == phi
        ));
    }

    #[test]
    fn operands_dominate_their_uses() {
        let program = Program::new();
        let (mut builder, [_, _, join]) = diamond(&program);
        let one = builder.int(1);
        builder.switch_to(join);
        builder.ret(Some(one));
        let body = builder.finish();

        assert_eq!(
            body.verify(&program),
            Err(VerifyError::NotDominated {
                user: Use::Term(join),
                operand: one,
            })
        );
    }
}
