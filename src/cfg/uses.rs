use hashbrown::{HashMap, HashSet};
use slotmap::SecondaryMap;

use super::{BlockId, FuncBody, InstId, InstKind, SafepointId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Use {
    Inst(InstId),
    Term(BlockId),
    Debug(SafepointId),
}

pub type Uses = SecondaryMap<InstId, Vec<Use>>;

impl FuncBody {
    /// Collects the users of every placed instruction.
    ///
    /// A user appears once per distinct use site even if it refers to the value several times.
    pub fn uses(&self) -> Uses {
        let mut result = Uses::new();

        let add = |result: &mut Uses, def: InstId, user: Use| {
            if let Some(entry) = result.entry(def) {
                let users = entry.or_default();

                if users.last() != Some(&user) {
                    users.push(user);
                }
            }
        };

        for (block_id, block) in &self.blocks {
            for &inst_id in &block.body {
                if let Some(entry) = result.entry(inst_id) {
                    entry.or_default();
                }

                for operand in self.insts[inst_id].kind.operands() {
                    add(&mut result, operand, Use::Inst(inst_id));
                }
            }

            if let Some(operand) = block.term.operand() {
                add(&mut result, operand, Use::Term(block_id));
            }
        }

        for (safepoint_id, safepoint) in &self.safepoints {
            safepoint.for_each_inst(|operand| add(&mut result, operand, Use::Debug(safepoint_id)));
        }

        result
    }

    /// Rewrites every operand according to `map`, following chains of replacements.
    pub fn substitute(&mut self, map: &HashMap<InstId, InstId>) {
        if map.is_empty() {
            return;
        }

        let resolve = |mut inst_id: InstId| {
            let mut steps = 0;

            while let Some(&next) = map.get(&inst_id) {
                inst_id = next;
                steps += 1;
                debug_assert!(steps <= map.len(), "cyclic substitution");
            }

            inst_id
        };

        for inst in self.insts.values_mut() {
            for operand in inst.kind.operands_mut() {
                *operand = resolve(*operand);
            }
        }

        for block in self.blocks.values_mut() {
            if let Some(operand) = block.term.operand_mut() {
                *operand = resolve(*operand);
            }
        }

        for safepoint in self.safepoints.values_mut() {
            safepoint.for_each_inst_mut(|operand| *operand = resolve(*operand));
        }
    }

    /// Unplaces and frees the given instructions, along with barriers attached to removed stores.
    pub fn remove_insts(&mut self, dead: &HashSet<InstId>) {
        if dead.is_empty() {
            return;
        }

        let barriers = self
            .insts
            .iter()
            .filter_map(|(inst_id, inst)| match inst.kind {
                InstKind::WriteBarrier { store } if dead.contains(&store) => Some(inst_id),
                _ => None,
            })
            .collect::<HashSet<_>>();

        for block in self.blocks.values_mut() {
            block
                .body
                .retain(|inst_id| !dead.contains(inst_id) && !barriers.contains(inst_id));
        }

        self.insts
            .retain(|inst_id, _| !dead.contains(&inst_id) && !barriers.contains(&inst_id));
    }
}
