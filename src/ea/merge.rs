//! Reduction of phis that merge allocations.
//!
//! Connected reference phis form a web. A web is reducible when every use of its phis can be
//! rewritten in terms of the merged allocations themselves: field loads become phis of
//! per-predecessor loads, null checks and class checks become constants, and debug uses become
//! [`DebugValue::Merge`] descriptors. After the rewrite, the allocations no longer flow through
//! a phi and can be scalar-replaced independently.

use std::collections::BTreeMap;
use std::ops::Range;

use bitvec::prelude::*;
use hashbrown::{HashMap, HashSet};
use log::{debug, trace};
use slotmap::SecondaryMap;
use strum::Display;

use crate::cfg::{
    BlockId, DebugValue, FuncBody, InstId, InstKind, MergeValue, Predecessors, Rpo, SafepointId,
    SafepointSite, Terminator, Ty, Use, Uses, Value,
};
use crate::program::{ClassId, FieldId, Program};
use crate::util::try_match;

use super::classify::Classification;
use super::graph::{ConnectionGraph, EscapeState, ObjId, ObjShape, PtSet};
use super::propagate::Budget;
use super::EaError;

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[strum(serialize_all = "kebab-case")]
pub enum Irreducible {
    /// The web contains a cycle of phis.
    LoopCarried,
    OpaqueInput,
    ArrayLeaf,
    NullableLoad,
    MissingField,
    /// A field may be overwritten between the merge and a load of it.
    Clobbered,
    Polymorphic,
    UnsupportedUse,
    EscapingInvoke,
    /// A merged allocation may execute again between the merge and a safepoint.
    ReallocatedLeaf,
    Blacklisted,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeInput {
    Alloc(ObjId, InstId),
    Null(InstId),
    Phi(InstId),
    Opaque(InstId),
}

/// An object a web phi may evaluate to, in input order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leaf {
    Alloc(ObjId, InstId),
    Null,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shapes {
    Exact(ClassId),
    Poly(Vec<ClassId>),
    Unknown,
}

#[derive(Debug, Clone)]
pub struct MergeDesc {
    pub phi: InstId,
    pub block: BlockId,
    pub inputs: Vec<(BlockId, MergeInput)>,
    pub shapes: Shapes,
    pub has_null: bool,
    /// Transitive leaves, with one entry per path through nested phis.
    pub leaves: Vec<Leaf>,
    pub irreducible: Option<Irreducible>,
}

impl MergeDesc {
    fn child_phis(&self) -> impl Iterator<Item = InstId> + '_ {
        self.inputs
            .iter()
            .filter_map(|&(_, input)| try_match!(input, MergeInput::Phi(child) => child))
    }

    pub fn leaf_insts(&self) -> impl Iterator<Item = (ObjId, InstId)> + '_ {
        self.leaves
            .iter()
            .filter_map(|&leaf| try_match!(leaf, Leaf::Alloc(obj_id, inst_id) => (obj_id, inst_id)))
    }
}

#[derive(Debug, Clone)]
pub struct Web {
    /// Children before parents.
    pub phis: Vec<InstId>,
    pub irreducible: Option<Irreducible>,
}

#[derive(Debug, Clone, Default)]
pub struct MergeAnalysis {
    pub descs: BTreeMap<InstId, MergeDesc>,
    pub webs: Vec<Web>,
    web_of: HashMap<InstId, usize>,
}

/// Phis reduced so far in one run of the pass, across rounds.
#[derive(Debug, Clone, Default)]
pub struct MergeRegistry {
    reduced: HashSet<InstId>,
    nsr_phis: HashSet<InstId>,
    leaves: HashSet<InstId>,
}

impl MergeRegistry {
    pub fn register(&mut self, phi: InstId) -> Result<(), EaError> {
        if self.reduced.insert(phi) {
            Ok(())
        } else {
            Err(EaError::DoubleRegistration(phi))
        }
    }

    pub fn is_reduced(&self, phi: InstId) -> bool {
        self.reduced.contains(&phi)
    }

    /// Whether `phi` carries the non-scalar-replaced inputs of an earlier reduction.
    pub fn is_nsr_phi(&self, phi: InstId) -> bool {
        self.nsr_phis.contains(&phi)
    }

    /// Allocations that must stay scalar-replaceable for the reductions to be valid.
    pub fn leaves(&self) -> impl Iterator<Item = InstId> + '_ {
        self.leaves.iter().copied()
    }
}

impl MergeAnalysis {
    pub fn compute(
        program: &Program,
        body: &FuncBody,
        graph: &ConnectionGraph,
        registry: &MergeRegistry,
        blacklist: &HashSet<InstId>,
        enabled: bool,
        budget: &mut Budget,
    ) -> Result<Self, EaError> {
        let rpo = body.rpo();
        let placement = body.placement();

        let mut candidates = vec![];

        for &block_id in &rpo.order {
            for phi in body.phis(block_id) {
                if body.ty(phi) == Some(Ty::Ref)
                    && !registry.is_nsr_phi(phi)
                    && graph.allocs_of(phi).next().is_some()
                {
                    candidates.push(phi);
                }
            }
        }

        let is_candidate = candidates.iter().copied().collect::<HashSet<_>>();
        let mut descs = BTreeMap::new();

        for &phi in &candidates {
            let InstKind::Phi(args) = &body.insts[phi].kind else {
                continue;
            };

            let inputs = args
                .iter()
                .map(|&(pred, value)| (pred, classify_input(body, graph, &is_candidate, value)))
                .collect();

            descs.insert(
                phi,
                MergeDesc {
                    phi,
                    block: placement[phi].0,
                    inputs,
                    shapes: Shapes::Unknown,
                    has_null: false,
                    leaves: vec![],
                    irreducible: None,
                },
            );
        }

        let mut analysis = Self {
            descs,
            webs: vec![],
            web_of: HashMap::new(),
        };
        analysis.find_webs(&candidates);

        let checker = Checker {
            program,
            body,
            graph,
            uses: body.uses(),
            placement,
            sites: body.safepoint_sites(),
            regions: Regions::new(body, rpo),
        };

        for web_idx in 0..analysis.webs.len() {
            analysis.analyze_web(&checker, web_idx, blacklist, enabled, budget)?;
        }

        debug!(
            "found {} merge webs ({} reducible)",
            analysis.webs.len(),
            analysis
                .webs
                .iter()
                .filter(|web| web.irreducible.is_none())
                .count(),
        );

        Ok(analysis)
    }

    fn find_webs(&mut self, candidates: &[InstId]) {
        let mut neighbors = HashMap::<InstId, Vec<InstId>>::new();

        for desc in self.descs.values() {
            for child in desc.child_phis() {
                neighbors.entry(desc.phi).or_default().push(child);
                neighbors.entry(child).or_default().push(desc.phi);
            }
        }

        for &root in candidates {
            if self.web_of.contains_key(&root) {
                continue;
            }

            let web_idx = self.webs.len();
            let mut members = vec![];
            let mut stack = vec![root];
            self.web_of.insert(root, web_idx);

            while let Some(phi) = stack.pop() {
                members.push(phi);

                for &next in neighbors.get(&phi).into_iter().flatten() {
                    if !self.web_of.contains_key(&next) {
                        self.web_of.insert(next, web_idx);
                        stack.push(next);
                    }
                }
            }

            let (phis, cyclic) = self.post_order(&members);

            self.webs.push(Web {
                phis,
                irreducible: cyclic.then_some(Irreducible::LoopCarried),
            });
        }
    }

    /// Orders `members` children-first, reporting whether the phis form a cycle.
    fn post_order(&self, members: &[InstId]) -> (Vec<InstId>, bool) {
        // false while on the stack, true once finished
        let mut state = HashMap::<InstId, bool>::new();
        let mut order = vec![];
        let mut cyclic = false;

        for &root in members {
            if state.contains_key(&root) {
                continue;
            }

            state.insert(root, false);
            let mut stack = vec![(root, 0)];

            while let Some(&mut (phi, ref mut next_child)) = stack.last_mut() {
                if let Some(child) = self.descs[&phi].child_phis().nth(*next_child) {
                    *next_child += 1;

                    match state.get(&child) {
                        Some(false) => cyclic = true,
                        Some(true) => {}

                        None => {
                            state.insert(child, false);
                            stack.push((child, 0));
                        }
                    }
                } else {
                    state.insert(phi, true);
                    order.push(phi);
                    stack.pop();
                }
            }
        }

        (order, cyclic)
    }

    fn analyze_web(
        &mut self,
        checker: &Checker<'_>,
        web_idx: usize,
        blacklist: &HashSet<InstId>,
        enabled: bool,
        budget: &mut Budget,
    ) -> Result<(), EaError> {
        let phis = self.webs[web_idx].phis.clone();
        let members = phis.iter().copied().collect::<HashSet<_>>();

        let mut verdict = if !enabled {
            Some(Irreducible::Disabled)
        } else if phis.iter().any(|phi| blacklist.contains(phi)) {
            Some(Irreducible::Blacklisted)
        } else {
            self.webs[web_idx].irreducible
        };

        if verdict != Some(Irreducible::LoopCarried) {
            for &phi in &phis {
                self.summarize(checker, phi, budget)?;
            }
        }

        for &phi in &phis {
            if verdict.is_some() {
                break;
            }

            let desc = &self.descs[&phi];
            verdict = checker.check_inputs(desc).or_else(|| checker.check_uses(self, desc, &members));

            if let Some(reason) = verdict {
                debug!("merge {phi:?} is irreducible: {reason}");
            }
        }

        self.webs[web_idx].irreducible = verdict;

        for phi in phis {
            if let Some(desc) = self.descs.get_mut(&phi) {
                desc.irreducible = verdict;
            }
        }

        Ok(())
    }

    /// Computes the leaves and shapes of `phi`, whose children are already summarized.
    fn summarize(&mut self, checker: &Checker<'_>, phi: InstId, budget: &mut Budget) -> Result<(), EaError> {
        let desc = &self.descs[&phi];
        let mut leaves = vec![];
        let mut opaque = false;

        for &(_, input) in &desc.inputs {
            match input {
                MergeInput::Alloc(obj_id, inst_id) => leaves.push(Leaf::Alloc(obj_id, inst_id)),
                MergeInput::Null(_) => leaves.push(Leaf::Null),
                MergeInput::Opaque(_) => opaque = true,

                MergeInput::Phi(child) => {
                    let child = &self.descs[&child];
                    opaque |= child.shapes == Shapes::Unknown;
                    budget.charge(child.leaves.len())?;
                    leaves.extend_from_slice(&child.leaves);
                }
            }
        }

        let mut classes = vec![];

        for &leaf in &leaves {
            match leaf {
                Leaf::Alloc(obj_id, _) => match checker.graph.objs[obj_id].shape {
                    ObjShape::Instance(class_id) => {
                        if !classes.contains(&class_id) {
                            classes.push(class_id);
                        }
                    }

                    _ => opaque = true,
                },

                Leaf::Null => {}
            }
        }

        let shapes = match classes.len() {
            _ if opaque => Shapes::Unknown,
            0 => Shapes::Unknown,
            1 => Shapes::Exact(classes[0]),
            _ => Shapes::Poly(classes),
        };

        trace!("merge {phi:?}: {} leaves, shapes {shapes:?}", leaves.len());

        if let Some(desc) = self.descs.get_mut(&phi) {
            desc.has_null = leaves.contains(&Leaf::Null);
            desc.leaves = leaves;
            desc.shapes = shapes;
        }

        Ok(())
    }

    pub fn web_of(&self, phi: InstId) -> Option<&Web> {
        self.web_of.get(&phi).map(|&web_idx| &self.webs[web_idx])
    }

    /// Whether `phi` belongs to a web that can be reduced.
    pub fn is_reducible(&self, phi: InstId) -> bool {
        self.web_of(phi).is_some_and(|web| web.irreducible.is_none())
    }

    pub fn verdict(&self, phi: InstId) -> Option<Irreducible> {
        self.descs.get(&phi).and_then(|desc| desc.irreducible)
    }

    pub fn irreducible(&self) -> impl Iterator<Item = (InstId, Irreducible)> + '_ {
        self.descs
            .values()
            .filter_map(|desc| desc.irreducible.map(|reason| (desc.phi, reason)))
    }

    /// Reducible webs worth reducing: those merging at least one scalar-replaceable allocation.
    pub fn reducible_webs(&self, classes: &Classification) -> Vec<usize> {
        self.webs
            .iter()
            .enumerate()
            .filter(|(_, web)| web.irreducible.is_none())
            .filter(|(_, web)| {
                web.phis.iter().any(|phi| {
                    self.descs[phi]
                        .leaf_insts()
                        .any(|(obj_id, _)| classes.is_sr(obj_id))
                })
            })
            .map(|(web_idx, _)| web_idx)
            .collect()
    }
}

fn classify_input(
    body: &FuncBody,
    graph: &ConnectionGraph,
    candidates: &HashSet<InstId>,
    value: InstId,
) -> MergeInput {
    match body.insts[value].kind {
        InstKind::New(_) | InstKind::NewArray { .. } => match graph.alloc_objs.get(value) {
            Some(&obj_id) => MergeInput::Alloc(obj_id, value),
            None => MergeInput::Opaque(value),
        },

        _ if candidates.contains(&value) => MergeInput::Phi(value),

        _ => {
            let pts = graph.pts_of(value);

            if !pts.is_empty() && pts.iter().all(|&obj_id| obj_id == graph.null) {
                MergeInput::Null(value)
            } else {
                MergeInput::Opaque(value)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Point {
    /// Right before the instruction at the given index.
    Before(BlockId, usize),
    End(BlockId),
}

impl Point {
    fn block(self) -> BlockId {
        match self {
            Self::Before(block_id, _) | Self::End(block_id) => block_id,
        }
    }
}

struct Regions<'a> {
    body: &'a FuncBody,
    preds: Predecessors,
    rpo: Rpo,
}

impl<'a> Regions<'a> {
    fn new(body: &'a FuncBody, rpo: Rpo) -> Self {
        Self {
            body,
            preds: body.predecessors(),
            rpo,
        }
    }

    fn reach(&self, start: BlockId, forward: bool) -> BitVec {
        let mut visited = bitvec![0; self.rpo.order.len()];
        let mut stack = vec![start];

        if let Some(&idx) = self.rpo.idx.get(start) {
            visited.set(idx, true);
        }

        while let Some(block_id) = stack.pop() {
            let next: &[BlockId] = if forward {
                self.body.blocks[block_id].successors()
            } else {
                &self.preds[block_id]
            };

            for &next_block_id in next {
                if let Some(&idx) = self.rpo.idx.get(next_block_id) {
                    if !visited[idx] {
                        visited.set(idx, true);
                        stack.push(next_block_id);
                    }
                }
            }
        }

        visited
    }

    /// The instructions on some path from the start of `from` to `to`.
    fn between(&self, from: BlockId, to: Point) -> Vec<(BlockId, Range<usize>)> {
        let to_block_id = to.block();
        let forward = self.reach(from, true);
        let backward = self.reach(to_block_id, false);
        let in_region = |block_id: BlockId| {
            self.rpo
                .idx
                .get(block_id)
                .is_some_and(|&idx| forward[idx] && backward[idx])
        };

        let cyclic = self.body.blocks[to_block_id]
            .successors()
            .iter()
            .any(|&succ_block_id| in_region(succ_block_id));

        self.rpo
            .order
            .iter()
            .copied()
            .filter(|&block_id| in_region(block_id))
            .map(|block_id| {
                let len = self.body.blocks[block_id].body.len();
                let end = match to {
                    Point::Before(to_block_id, idx) if to_block_id == block_id && !cyclic => idx,
                    _ => len,
                };

                (block_id, 0..end)
            })
            .collect()
    }
}

struct Checker<'a> {
    program: &'a Program,
    body: &'a FuncBody,
    graph: &'a ConnectionGraph,
    uses: Uses,
    placement: SecondaryMap<InstId, (BlockId, usize)>,
    sites: SecondaryMap<SafepointId, SafepointSite>,
    regions: Regions<'a>,
}

impl Checker<'_> {
    fn check_inputs(&self, desc: &MergeDesc) -> Option<Irreducible> {
        if desc
            .inputs
            .iter()
            .any(|(_, input)| matches!(input, MergeInput::Opaque(_)))
        {
            return Some(Irreducible::OpaqueInput);
        }

        let has_array = desc
            .leaf_insts()
            .any(|(obj_id, _)| matches!(self.graph.objs[obj_id].shape, ObjShape::Array { .. }));

        if has_array {
            return Some(Irreducible::ArrayLeaf);
        }

        let escaping = self.escaping(desc);
        let invoke_pred = desc.inputs.iter().any(|&(pred, _)| {
            matches!(self.body.blocks[pred].term, Terminator::Invoke(..))
        });

        if escaping && invoke_pred {
            return Some(Irreducible::EscapingInvoke);
        }

        None
    }

    fn escaping(&self, desc: &MergeDesc) -> bool {
        desc.leaf_insts()
            .any(|(obj_id, _)| self.graph.objs[obj_id].state > EscapeState::NoEscape)
    }

    fn check_uses(
        &self,
        analysis: &MergeAnalysis,
        desc: &MergeDesc,
        web: &HashSet<InstId>,
    ) -> Option<Irreducible> {
        for &user in self.uses.get(desc.phi).into_iter().flatten() {
            let verdict = match user {
                Use::Inst(user) => self.check_inst_use(analysis, desc, web, user),
                Use::Term(_) => Some(Irreducible::UnsupportedUse),
                Use::Debug(safepoint_id) => self.check_debug_use(analysis, desc, safepoint_id),
            };

            if verdict.is_some() {
                trace!("use {user:?} of {:?} is not reducible", desc.phi);

                return verdict;
            }
        }

        None
    }

    fn check_inst_use(
        &self,
        analysis: &MergeAnalysis,
        desc: &MergeDesc,
        web: &HashSet<InstId>,
        user: InstId,
    ) -> Option<Irreducible> {
        match self.body.insts[user].kind {
            InstKind::Phi(_) if web.contains(&user) => None,

            InstKind::LoadField { obj, field } if obj == desc.phi => {
                if desc.has_null {
                    Some(Irreducible::NullableLoad)
                } else if !desc.leaf_insts().all(|(obj_id, _)| self.has_field(obj_id, field)) {
                    Some(Irreducible::MissingField)
                } else if self.clobbered(analysis, desc, user, field) {
                    Some(Irreducible::Clobbered)
                } else {
                    None
                }
            }

            InstKind::RefEq([lhs, rhs]) => {
                let other = if lhs == desc.phi { rhs } else { lhs };

                if other != desc.phi && self.body.insts[other].kind == InstKind::Const(Value::Null) {
                    None
                } else {
                    Some(Irreducible::UnsupportedUse)
                }
            }

            InstKind::LoadClass(_) | InstKind::InstanceOf { .. } => match desc.shapes {
                Shapes::Exact(_) if !desc.has_null => None,
                _ => Some(Irreducible::Polymorphic),
            },

            _ => Some(Irreducible::UnsupportedUse),
        }
    }

    fn check_debug_use(
        &self,
        analysis: &MergeAnalysis,
        desc: &MergeDesc,
        safepoint_id: SafepointId,
    ) -> Option<Irreducible> {
        let safepoint = &self.body.safepoints[safepoint_id];
        let mut total = 0;
        safepoint.for_each_inst(|inst_id| total += usize::from(inst_id == desc.phi));

        let top_level = safepoint
            .locals
            .iter()
            .chain(safepoint.monitors.iter().map(|monitor| &monitor.obj))
            .filter(|&value| *value == DebugValue::Value(desc.phi))
            .count();

        if total != top_level {
            return Some(Irreducible::UnsupportedUse);
        }

        let to = match self.sites.get(safepoint_id) {
            Some(&SafepointSite::Inst(block_id, inst_id)) => {
                Point::Before(block_id, self.placement[inst_id].1)
            }

            Some(&SafepointSite::Term(block_id)) => Point::End(block_id),
            None => return None,
        };

        let leaves = desc.leaf_insts().map(|(_, inst_id)| inst_id).collect::<HashSet<_>>();

        self.scan(analysis, desc, to, |inst_id| leaves.contains(&inst_id))
            .then_some(Irreducible::ReallocatedLeaf)
    }

    fn has_field(&self, obj_id: ObjId, field: FieldId) -> bool {
        match self.graph.objs[obj_id].shape {
            ObjShape::Instance(class_id) => self.program.field_index(class_id, field).is_some(),
            _ => false,
        }
    }

    /// Whether `field` of some leaf may change between the merge and `load`.
    fn clobbered(
        &self,
        analysis: &MergeAnalysis,
        desc: &MergeDesc,
        load: InstId,
        field: FieldId,
    ) -> bool {
        let (block_id, idx) = self.placement[load];
        let leaf_objs = desc.leaf_insts().map(|(obj_id, _)| obj_id).collect::<PtSet>();
        let leaf_insts = desc.leaf_insts().map(|(_, inst_id)| inst_id).collect::<HashSet<_>>();
        let escaping = self.escaping(desc);

        self.scan(analysis, desc, Point::Before(block_id, idx), |inst_id| {
            match self.body.insts[inst_id].kind {
                InstKind::StoreField { obj, field: stored, .. } if stored == field => {
                    let pts = self.graph.pts_of(obj);

                    !pts.is_disjoint(&leaf_objs) || (escaping && pts.contains(&self.graph.phantom))
                }

                InstKind::Call(_) => escaping,
                InstKind::New(_) | InstKind::NewArray { .. } => leaf_insts.contains(&inst_id),
                _ => false,
            }
        })
    }

    /// Looks for an instruction matching `hit` on the paths from the merge (and the merges
    /// nested in it) to `to`.
    fn scan(
        &self,
        analysis: &MergeAnalysis,
        desc: &MergeDesc,
        to: Point,
        mut hit: impl FnMut(InstId) -> bool,
    ) -> bool {
        let mut segments = vec![(desc.phi, to)];

        while let Some((phi, to)) = segments.pop() {
            let desc = &analysis.descs[&phi];

            for (block_id, range) in self.regions.between(desc.block, to) {
                if let Some(&inst_id) = self.body.blocks[block_id].body[range]
                    .iter()
                    .find(|&&inst_id| hit(inst_id))
                {
                    trace!("{inst_id:?} in {block_id:?} interferes with merge {phi:?}");

                    return true;
                }
            }

            for &(pred, input) in &desc.inputs {
                if let MergeInput::Phi(child) = input {
                    segments.push((child, Point::End(pred)));
                }
            }
        }

        false
    }
}

struct Reducer<'a> {
    program: &'a Program,
    body: &'a mut FuncBody,
    analysis: &'a MergeAnalysis,
    classes: &'a Classification,
    consts: HashMap<Value, InstId>,
    loads: HashMap<(InstId, FieldId), InstId>,
    null_checks: HashMap<InstId, InstId>,
    selectors: HashMap<(InstId, i32), InstId>,
    nsr_phis: HashMap<InstId, InstId>,
}

impl Reducer<'_> {
    fn constant(&mut self, value: Value) -> InstId {
        if let Some(&inst_id) = self.consts.get(&value) {
            return inst_id;
        }

        let inst_id = self.body.add_inst(InstKind::Const(value), Some(value.ty()));
        let entry = self.body.entry;
        let idx = self.body.phi_count(entry);
        self.body.blocks[entry].body.insert(idx, inst_id);
        self.consts.insert(value, inst_id);

        inst_id
    }

    fn add_phi(&mut self, block_id: BlockId, ty: Ty, args: Vec<(BlockId, InstId)>) -> InstId {
        let phi = self.body.add_inst(InstKind::Phi(args), Some(ty));
        self.body.append_phi(block_id, phi);

        phi
    }

    fn is_sr(&self, obj_id: ObjId) -> bool {
        self.classes.is_sr(obj_id)
    }

    /// A phi yielding `field` of whichever leaf `phi` evaluates to.
    fn split_load(&mut self, phi: InstId, field: FieldId) -> InstId {
        if let Some(&inst_id) = self.loads.get(&(phi, field)) {
            return inst_id;
        }

        let analysis = self.analysis;
        let desc = &analysis.descs[&phi];
        let ty = self.program.fields[field].ty.stack_ty();
        let mut args = vec![];

        for &(pred, input) in &desc.inputs {
            let value = match input {
                MergeInput::Alloc(_, obj) => {
                    let load = self
                        .body
                        .add_inst(InstKind::LoadField { obj, field }, Some(ty));
                    self.body.insert_at_end(pred, load);

                    load
                }

                MergeInput::Phi(child) => self.split_load(child, field),

                MergeInput::Null(_) | MergeInput::Opaque(_) => {
                    self.constant(self.program.fields[field].ty.default_value())
                }
            };

            args.push((pred, value));
        }

        let result = self.add_phi(desc.block, ty, args);
        trace!("split {phi:?}.{field:?} into {result:?}");
        self.loads.insert((phi, field), result);

        result
    }

    /// An int phi that is 1 when `phi` is null.
    fn null_check(&mut self, phi: InstId) -> InstId {
        if let Some(&inst_id) = self.null_checks.get(&phi) {
            return inst_id;
        }

        let analysis = self.analysis;
        let desc = &analysis.descs[&phi];
        let mut args = vec![];

        for &(pred, input) in &desc.inputs {
            let value = match input {
                MergeInput::Null(_) => self.constant(Value::Int(1)),
                MergeInput::Phi(child) => self.null_check(child),
                MergeInput::Alloc(..) | MergeInput::Opaque(_) => self.constant(Value::Int(0)),
            };

            args.push((pred, value));
        }

        let result = self.add_phi(desc.block, Ty::Int, args);
        self.null_checks.insert(phi, result);

        result
    }

    /// An int phi indexing the merge candidates, with the leaves of `phi` numbered from `offset`.
    fn selector(&mut self, phi: InstId, offset: i32) -> InstId {
        if let Some(&inst_id) = self.selectors.get(&(phi, offset)) {
            return inst_id;
        }

        let analysis = self.analysis;
        let desc = &analysis.descs[&phi];
        let mut pos = offset;
        let mut args = vec![];

        for &(pred, input) in &desc.inputs {
            let value = match input {
                MergeInput::Alloc(obj_id, _) if self.is_sr(obj_id) => {
                    pos += 1;
                    self.constant(Value::Int(pos - 1))
                }

                MergeInput::Phi(child) => {
                    let selector = self.selector(child, pos);
                    pos += analysis.descs[&child].leaves.len() as i32;

                    selector
                }

                MergeInput::Alloc(..) | MergeInput::Null(_) | MergeInput::Opaque(_) => {
                    pos += 1;
                    self.constant(Value::Int(-1))
                }
            };

            args.push((pred, value));
        }

        let result = self.add_phi(desc.block, Ty::Int, args);
        self.selectors.insert((phi, offset), result);

        result
    }

    /// A reference phi carrying the leaves that stay real allocations, and null otherwise.
    fn nsr_phi(&mut self, phi: InstId) -> InstId {
        if let Some(&inst_id) = self.nsr_phis.get(&phi) {
            return inst_id;
        }

        let analysis = self.analysis;
        let desc = &analysis.descs[&phi];
        let mut args = vec![];

        for &(pred, input) in &desc.inputs {
            let value = match input {
                MergeInput::Alloc(obj_id, _) if self.is_sr(obj_id) => self.constant(Value::Null),
                MergeInput::Phi(child) => self.nsr_phi(child),
                MergeInput::Alloc(_, value) | MergeInput::Null(value) | MergeInput::Opaque(value) => {
                    value
                }
            };

            args.push((pred, value));
        }

        let result = self.add_phi(desc.block, Ty::Ref, args);
        self.nsr_phis.insert(phi, result);

        result
    }

    fn merge_value(&mut self, phi: InstId) -> DebugValue {
        let analysis = self.analysis;
        let candidates = analysis.descs[&phi]
            .leaves
            .iter()
            .map(|&leaf| match leaf {
                Leaf::Alloc(obj_id, inst_id) if self.is_sr(obj_id) => DebugValue::Value(inst_id),
                _ => DebugValue::Const(Value::Null),
            })
            .collect();

        DebugValue::Merge(Box::new(MergeValue {
            selector: self.selector(phi, 0),
            nsr: self.nsr_phi(phi),
            candidates,
        }))
    }
}

/// Rewrites every use of the phis in the given webs and removes the phis.
///
/// Returns the reduced phis.
pub(super) fn reduce(
    program: &Program,
    body: &mut FuncBody,
    analysis: &MergeAnalysis,
    classes: &Classification,
    registry: &mut MergeRegistry,
    webs: &[usize],
) -> Result<Vec<InstId>, EaError> {
    let uses = body.uses();
    let mut reducer = Reducer {
        program,
        body,
        analysis,
        classes,
        consts: HashMap::new(),
        loads: HashMap::new(),
        null_checks: HashMap::new(),
        selectors: HashMap::new(),
        nsr_phis: HashMap::new(),
    };
    let mut replace = HashMap::new();
    let mut dead = HashSet::new();
    let mut reduced = vec![];

    for &web_idx in webs {
        let web = &analysis.webs[web_idx];

        if web.irreducible.is_some() {
            return Err(EaError::Invariant(format!(
                "attempted to reduce an irreducible web rooted at {:?}",
                web.phis.last()
            )));
        }

        for &phi in &web.phis {
            registry.register(phi)?;
        }

        for &phi in &web.phis {
            let mut debug_uses = vec![];

            for &user in uses.get(phi).into_iter().flatten() {
                let Use::Inst(user) = user else {
                    if let Use::Debug(safepoint_id) = user {
                        debug_uses.push(safepoint_id);
                    }

                    continue;
                };

                let value = match reducer.body.insts[user].kind.clone() {
                    InstKind::Phi(_) => continue,
                    InstKind::LoadField { field, .. } => reducer.split_load(phi, field),
                    InstKind::RefEq(_) => reducer.null_check(phi),

                    InstKind::LoadClass(_) => match analysis.descs[&phi].shapes {
                        Shapes::Exact(class_id) => reducer.constant(Value::Class(class_id)),
                        _ => return Err(EaError::Invariant(format!("class load of polymorphic {phi:?}"))),
                    },

                    InstKind::InstanceOf { class, .. } => match analysis.descs[&phi].shapes {
                        Shapes::Exact(class_id) => {
                            let result = program.is_subclass(class_id, class);

                            reducer.constant(Value::Int(result.into()))
                        }

                        _ => return Err(EaError::Invariant(format!("type check of polymorphic {phi:?}"))),
                    },

                    kind => {
                        return Err(EaError::Invariant(format!(
                            "unexpected use of reduced {phi:?}: {kind:?}"
                        )))
                    }
                };

                replace.insert(user, value);
                dead.insert(user);
            }

            if !debug_uses.is_empty() {
                let merge = reducer.merge_value(phi);

                for safepoint_id in debug_uses {
                    let safepoint = &mut reducer.body.safepoints[safepoint_id];

                    for value in safepoint
                        .locals
                        .iter_mut()
                        .chain(safepoint.monitors.iter_mut().map(|monitor| &mut monitor.obj))
                    {
                        if *value == DebugValue::Value(phi) {
                            *value = merge.clone();
                        }
                    }
                }
            }

            dead.insert(phi);
            reduced.push(phi);
        }

        for &phi in &web.phis {
            for (obj_id, inst_id) in analysis.descs[&phi].leaf_insts() {
                if classes.is_sr(obj_id) {
                    registry.leaves.insert(inst_id);
                }
            }
        }
    }

    registry.nsr_phis.extend(reducer.nsr_phis.values().copied());

    debug!("reduced {} merges", reduced.len());
    body.substitute(&replace);
    body.remove_insts(&dead);

    Ok(reduced)
}
