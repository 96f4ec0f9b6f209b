use hashbrown::HashSet;
use slotmap::SecondaryMap;

use super::{BlockId, FuncBody, InstKind};

impl FuncBody {
    /// Drops unreachable blocks along with their instructions and phi inputs flowing from them.
    pub fn remove_unreachable_blocks(&mut self) {
        let mut stack = vec![self.entry];
        let mut reachable = SecondaryMap::<BlockId, ()>::new();
        reachable.insert(self.entry, ());

        while let Some(block_id) = stack.pop() {
            for &succ_block_id in self.blocks[block_id].successors() {
                if reachable.insert(succ_block_id, ()).is_none() {
                    stack.push(succ_block_id);
                }
            }
        }

        let dead = self
            .blocks
            .iter()
            .filter(|&(block_id, _)| !reachable.contains_key(block_id))
            .flat_map(|(_, block)| block.body.iter().copied())
            .collect::<HashSet<_>>();

        self.blocks.retain(|block_id, _| reachable.contains_key(block_id));
        self.remove_insts(&dead);

        for inst in self.insts.values_mut() {
            if let InstKind::Phi(args) = &mut inst.kind {
                args.retain(|&(pred, _)| reachable.contains_key(pred));
            }
        }
    }
}
