use log::trace;
use slotmap::SecondaryMap;

use super::{BlockId, FuncBody, Predecessors, Rpo};

/// Immediate dominators of the reachable blocks.
///
/// The entry has no `idom` entry; every other reachable block has exactly one.
#[derive(Debug, Default, Clone)]
pub struct DomTree {
    pub root: BlockId,
    pub idom: SecondaryMap<BlockId, BlockId>,
    /// Children in reverse post-order.
    pub children: SecondaryMap<BlockId, Vec<BlockId>>,
}

impl DomTree {
    pub fn dominates(&self, lhs: BlockId, rhs: BlockId) -> bool {
        let mut block_id = rhs;

        while block_id != lhs {
            match self.idom.get(block_id) {
                Some(&parent) => block_id = parent,
                None => return false,
            }
        }

        true
    }
}

impl FuncBody {
    /// Computes the dominator tree over the positions of `rpo`.
    ///
    /// Each block's dominator is refined by walking the candidates up towards the entry until
    /// they meet, repeated until nothing changes (Cooper, Harvey and Kennedy).
    pub fn dom_tree(&self, preds: &Predecessors, rpo: &Rpo) -> DomTree {
        const UNSET: usize = usize::MAX;

        let pred_idxs = rpo
            .order
            .iter()
            .map(|&block_id| {
                preds[block_id]
                    .iter()
                    .filter_map(|&pred| rpo.idx.get(pred).copied())
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let mut doms = vec![UNSET; rpo.order.len()];

        if let Some(entry) = doms.first_mut() {
            *entry = 0;
        }

        let meet = |doms: &[usize], mut lhs: usize, mut rhs: usize| {
            while lhs != rhs {
                while lhs > rhs {
                    lhs = doms[lhs];
                }

                while rhs > lhs {
                    rhs = doms[rhs];
                }
            }

            lhs
        };

        let mut changed = true;

        while changed {
            changed = false;

            for idx in 1..doms.len() {
                let new_dom = pred_idxs[idx]
                    .iter()
                    .copied()
                    .filter(|&pred_idx| doms[pred_idx] != UNSET)
                    .reduce(|acc, pred_idx| meet(&doms, acc, pred_idx));

                if let Some(new_dom) = new_dom {
                    if doms[idx] != new_dom {
                        doms[idx] = new_dom;
                        changed = true;
                    }
                }
            }
        }

        let mut idom = SecondaryMap::new();
        let mut children = rpo
            .order
            .iter()
            .map(|&block_id| (block_id, vec![]))
            .collect::<SecondaryMap<_, _>>();

        for (idx, &dom_idx) in doms.iter().enumerate().skip(1) {
            let block_id = rpo.order[idx];
            let parent = rpo.order[dom_idx];
            trace!("{parent:?} immediately dominates {block_id:?}");
            idom.insert(block_id, parent);
            children[parent].push(block_id);
        }

        DomTree {
            root: self.entry,
            idom,
            children,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cfg::{FuncBuilder, Ty};
    use crate::program::Program;

    #[test]
    fn loop_exits_are_dominated_by_the_header() {
        let program = Program::new();
        let mut builder = FuncBuilder::new(&program, &[Ty::Int], None);
        let cond = builder.param(0);
        let header = builder.create_block("header");
        let body_block = builder.create_block("body");
        let exit = builder.create_block("exit");
        builder.br(header);

        builder.switch_to(header);
        builder.branch(cond, body_block, exit);

        builder.switch_to(body_block);
        builder.br(header);

        builder.switch_to(exit);
        builder.ret(None);
        let body = builder.finish();

        let rpo = body.rpo();
        let dom_tree = body.dom_tree(&body.predecessors(), &rpo);

        assert_eq!(dom_tree.idom.get(body.entry), None);
        assert_eq!(dom_tree.idom[header], body.entry);
        assert_eq!(dom_tree.idom[body_block], header);
        assert_eq!(dom_tree.idom[exit], header);
        assert!(dom_tree.dominates(header, exit));
        assert!(!dom_tree.dominates(body_block, exit));
        assert_eq!(dom_tree.children[header].len(), 2);
    }
}
