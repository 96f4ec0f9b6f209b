use slotmap::SecondaryMap;

use super::{BlockId, FuncBody};

#[derive(Debug, Default, Clone)]
pub struct Rpo {
    pub order: Vec<BlockId>,
    pub idx: SecondaryMap<BlockId, usize>,
}

impl Rpo {
    pub fn is_reachable(&self, block_id: BlockId) -> bool {
        self.idx.contains_key(block_id)
    }
}

impl FuncBody {
    /// Orders the blocks reachable from the entry so that each one precedes its successors,
    /// back edges aside.
    pub fn rpo(&self) -> Rpo {
        let mut post = Vec::with_capacity(self.blocks.len());
        let mut seen = SecondaryMap::<BlockId, ()>::new();
        seen.insert(self.entry, ());

        let mut stack = vec![(self.entry, self.blocks[self.entry].successors().iter())];

        while let Some((block_id, succs)) = stack.last_mut() {
            let block_id = *block_id;

            match succs.find(|&&succ| !seen.contains_key(succ)).copied() {
                Some(succ) => {
                    seen.insert(succ, ());
                    stack.push((succ, self.blocks[succ].successors().iter()));
                }

                None => {
                    post.push(block_id);
                    stack.pop();
                }
            }
        }

        let order = post.into_iter().rev().collect::<Vec<_>>();
        let idx = order
            .iter()
            .enumerate()
            .map(|(idx, &block_id)| (block_id, idx))
            .collect();

        Rpo { order, idx }
    }
}
