use slotmap::SecondaryMap;

use super::{BlockId, DomTree, FuncBody, Predecessors, Rpo};

pub type DomFrontiers = SecondaryMap<BlockId, Vec<BlockId>>;

impl FuncBody {
    pub fn dom_frontiers(&self, preds: &Predecessors, rpo: &Rpo, dom_tree: &DomTree) -> DomFrontiers {
        let mut result = rpo
            .order
            .iter()
            .map(|&block_id| (block_id, vec![]))
            .collect::<DomFrontiers>();

        for &block_id in &rpo.order {
            let reachable_preds = preds[block_id]
                .iter()
                .copied()
                .filter(|&pred_block_id| rpo.is_reachable(pred_block_id))
                .collect::<Vec<_>>();

            if reachable_preds.len() < 2 {
                continue;
            }

            let Some(&idom) = dom_tree.idom.get(block_id) else {
                continue;
            };

            for mut runner in reachable_preds {
                while runner != idom {
                    let frontier = &mut result[runner];

                    if frontier.last() != Some(&block_id) {
                        frontier.push(block_id);
                    }

                    match dom_tree.idom.get(runner) {
                        Some(&next) => runner = next,
                        None => break,
                    }
                }
            }
        }

        result
    }
}

/// Computes the iterated dominance frontier of `defs`, sorted by reverse post-order.
pub fn iterated_frontier(
    frontiers: &DomFrontiers,
    rpo: &Rpo,
    defs: impl IntoIterator<Item = BlockId>,
) -> Vec<BlockId> {
    let mut result = SecondaryMap::<BlockId, ()>::new();
    let mut queued = SecondaryMap::<BlockId, ()>::new();
    let mut worklist = vec![];

    for block_id in defs {
        if queued.insert(block_id, ()).is_none() {
            worklist.push(block_id);
        }
    }

    while let Some(block_id) = worklist.pop() {
        let Some(frontier) = frontiers.get(block_id) else {
            continue;
        };

        for &df_block_id in frontier {
            if result.insert(df_block_id, ()).is_none() && queued.insert(df_block_id, ()).is_none()
            {
                worklist.push(df_block_id);
            }
        }
    }

    let mut result = result.keys().collect::<Vec<_>>();
    result.sort_unstable_by_key(|&block_id| rpo.idx[block_id]);

    result
}
