use hashbrown::{HashMap, HashSet};
use log::{debug, trace};
use slotmap::SecondaryMap;

use crate::cfg::{BlockId, DebugValue, FuncBody, InstId, InstKind};

use super::classify::Classification;
use super::graph::{ConnectionGraph, EscapeState, ObjId};

/// Removes the monitor operations on kept allocations that never leave the method.
///
/// Every monitor instruction that may touch such an object has to refer to it directly; a
/// debug slot for an elided lock is marked eliminated so the runtime takes the lock when it
/// deoptimizes. Returns the number of removed instructions.
pub(super) fn elide(body: &mut FuncBody, graph: &ConnectionGraph, classes: &Classification) -> usize {
    let mut monitors = Vec::<(InstId, InstId)>::new();

    for block in body.blocks.values() {
        for &inst_id in &block.body {
            if let InstKind::MonitorEnter(obj) | InstKind::MonitorExit(obj) = body.insts[inst_id].kind {
                monitors.push((inst_id, obj));
            }
        }
    }

    let mut rejected = unbalanced(body, graph);

    for &(_, obj) in &monitors {
        let pts = graph.pts_of(obj);
        let direct = pts.len() == 1
            && graph
                .alloc_objs
                .get(body.underlying_ref(obj))
                .is_some_and(|alloc_obj| pts.contains(alloc_obj));

        if !direct {
            rejected.extend(pts);
        }
    }

    let elided = graph
        .allocs()
        .filter(|&(obj_id, obj)| {
            obj.locked
                && obj.state == EscapeState::NoEscape
                && !classes.is_sr(obj_id)
                && !rejected.contains(&obj_id)
        })
        .filter_map(|(_, obj)| obj.alloc_inst())
        .collect::<HashSet<_>>();

    if elided.is_empty() {
        return 0;
    }

    let dead = monitors
        .iter()
        .filter(|&&(_, obj)| elided.contains(&body.underlying_ref(obj)))
        .map(|&(inst_id, _)| inst_id)
        .collect::<HashSet<_>>();

    for safepoint in body.safepoints.values_mut() {
        for monitor in &mut safepoint.monitors {
            if let DebugValue::Value(obj) = monitor.obj {
                if graph.allocs_of(obj).any(|obj_id| {
                    graph.objs[obj_id]
                        .alloc_inst()
                        .is_some_and(|alloc| elided.contains(&alloc))
                }) {
                    monitor.eliminated = true;
                }
            }
        }
    }

    debug!(
        "elided {} monitor operations on {} objects",
        dead.len(),
        elided.len()
    );

    body.remove_insts(&dead);

    dead.len()
}

/// Objects whose monitor operations may not pair up.
///
/// An object qualifies if some exit can run while it is not held, if paths reach a block
/// holding it a different number of times, or if a monitor operation may refer to it and to
/// something else.
pub(super) fn unbalanced(body: &FuncBody, graph: &ConnectionGraph) -> HashSet<ObjId> {
    let rpo = body.rpo();
    let mut result = HashSet::new();
    let mut ops = HashMap::<InstId, (ObjId, i32)>::new();

    for &block_id in &rpo.order {
        for &inst_id in &body.blocks[block_id].body {
            let (obj, delta) = match body.insts[inst_id].kind {
                InstKind::MonitorEnter(obj) => (obj, 1),
                InstKind::MonitorExit(obj) => (obj, -1),
                _ => continue,
            };

            let pts = graph.pts_of(obj);

            match pts.first() {
                Some(&obj_id) if pts.len() == 1 => {
                    ops.insert(inst_id, (obj_id, delta));
                }

                _ => result.extend(pts),
            }
        }
    }

    let candidates = ops
        .values()
        .map(|&(obj_id, _)| obj_id)
        .filter(|obj_id| !result.contains(obj_id))
        .collect::<HashSet<_>>();

    for obj_id in candidates {
        if !holds_balanced(body, &ops, obj_id) {
            trace!("monitors on {obj_id:?} are unbalanced");
            result.insert(obj_id);
        }
    }

    result
}

fn holds_balanced(body: &FuncBody, ops: &HashMap<InstId, (ObjId, i32)>, obj_id: ObjId) -> bool {
    let mut depth_in = SecondaryMap::<BlockId, i32>::new();
    let mut worklist = vec![body.entry];
    depth_in.insert(body.entry, 0);

    while let Some(block_id) = worklist.pop() {
        let block = &body.blocks[block_id];
        let mut depth = depth_in[block_id];

        for inst_id in &block.body {
            match ops.get(inst_id) {
                Some(&(target, delta)) if target == obj_id => depth += delta,
                _ => continue,
            }

            if depth < 0 {
                return false;
            }
        }

        for &succ in block.successors() {
            match depth_in.get(succ) {
                Some(&expected) if expected != depth => return false,
                Some(_) => {}

                None => {
                    depth_in.insert(succ, depth);
                    worklist.push(succ);
                }
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::cfg::{FuncBuilder, Ty};
    use crate::ea::Config;
    use crate::program::Program;

    /// Locks a fresh object in a loop, releasing it in the loop body only if `release` is set.
    fn locking_loop(program: &Program, release: bool) -> (FuncBody, InstId) {
        let mut builder = FuncBuilder::new(program, &[Ty::Int], None);
        let cond = builder.param(0);
        let obj = builder.new_array(Ty::Int, cond);
        let header = builder.create_block("header");
        let body_block = builder.create_block("body");
        let exit = builder.create_block("exit");
        builder.br(header);

        builder.switch_to(header);
        builder.branch(cond, body_block, exit);

        builder.switch_to(body_block);
        builder.monitor_enter(obj);

        if release {
            builder.monitor_exit(obj);
        }

        builder.br(header);

        builder.switch_to(exit);
        builder.ret(None);

        (builder.finish(), obj)
    }

    #[rstest]
    fn loops_must_release_what_they_take(#[values(false, true)] release: bool) {
        let program = Program::new();
        let (body, obj) = locking_loop(&program, release);
        let graph = ConnectionGraph::build(&program, &body, &Config::default());
        let obj_id = graph.alloc_objs[obj];

        assert_eq!(unbalanced(&body, &graph).contains(&obj_id), !release);
    }
}
