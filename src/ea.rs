//! Escape analysis and scalar replacement of allocations.
//!
//! [`run`] builds a connection graph for a method, propagates escape states, reduces phis that
//! merge allocations, and replaces every allocation that never leaves the method with SSA
//! values. Safepoints that can still observe an eliminated object get a recipe the runtime
//! uses to rebuild it on deoptimization.

mod classify;
mod error;
mod graph;
mod locks;
mod merge;
mod propagate;
mod remat;
mod scalarize;

use std::collections::BTreeMap;

use hashbrown::HashSet;
use log::{debug, error, warn};
use strum::Display;

use crate::cfg::{FuncBody, InstId, InstKind};
use crate::program::Program;

use self::scalarize::Planned;

pub use self::classify::{Classification, NsrReason};
pub use self::error::EaError;
pub use self::graph::{
    Access, ConnectionGraph, EscapeState, FieldKey, ObjId, ObjKind, ObjNode, ObjShape, PtSet,
};
pub use self::merge::{
    Irreducible, Leaf, MergeAnalysis, MergeDesc, MergeInput, MergeRegistry, Shapes, Web,
};
pub use self::propagate::Budget;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub enabled: bool,
    pub reduce_merges: bool,
    pub eliminate_allocations: bool,
    pub eliminate_locks: bool,
    /// Fold reference comparisons involving eliminated objects.
    pub optimize_ptr_compare: bool,
    /// Arrays longer than this are never scalar replaced.
    pub array_size_limit: u32,
    pub fields_limit: usize,
    pub node_budget: usize,
    pub step_budget: usize,
    pub graph_iter_limit: usize,
    pub max_rounds: usize,
    /// Verify the result and roll back if it is malformed.
    pub verify: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            reduce_merges: true,
            eliminate_allocations: true,
            eliminate_locks: true,
            optimize_ptr_compare: true,
            array_size_limit: 64,
            fields_limit: 512,
            node_budget: 80_000,
            step_budget: 1_000_000,
            graph_iter_limit: 20,
            max_rounds: 4,
            verify: cfg!(debug_assertions),
        }
    }
}

impl Config {
    pub fn with_enabled(self, enabled: bool) -> Self {
        Self { enabled, ..self }
    }

    pub fn with_reduce_merges(self, reduce_merges: bool) -> Self {
        Self {
            reduce_merges,
            ..self
        }
    }

    pub fn with_eliminate_allocations(self, eliminate_allocations: bool) -> Self {
        Self {
            eliminate_allocations,
            ..self
        }
    }

    pub fn with_eliminate_locks(self, eliminate_locks: bool) -> Self {
        Self {
            eliminate_locks,
            ..self
        }
    }

    pub fn with_optimize_ptr_compare(self, optimize_ptr_compare: bool) -> Self {
        Self {
            optimize_ptr_compare,
            ..self
        }
    }

    pub fn with_array_size_limit(self, array_size_limit: u32) -> Self {
        Self {
            array_size_limit,
            ..self
        }
    }

    pub fn with_node_budget(self, node_budget: usize) -> Self {
        Self {
            node_budget,
            ..self
        }
    }

    pub fn with_step_budget(self, step_budget: usize) -> Self {
        Self {
            step_budget,
            ..self
        }
    }

    pub fn with_max_rounds(self, max_rounds: usize) -> Self {
        Self { max_rounds, ..self }
    }

    pub fn with_verify(self, verify: bool) -> Self {
        Self { verify, ..self }
    }
}

/// Why a run left the method untouched.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[strum(serialize_all = "kebab-case")]
pub enum Bailout {
    Budget,
    IterationLimit,
    Invariant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Disabled,
    NothingToDo,
    Reduced,
    NotReduced(Bailout),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EscapeCounts {
    pub no_escape: usize,
    pub arg_escape: usize,
    pub global_escape: usize,
}

impl EscapeCounts {
    fn record(&mut self, state: EscapeState) {
        match state {
            EscapeState::NoEscape => self.no_escape += 1,
            EscapeState::ArgEscape => self.arg_escape += 1,
            EscapeState::GlobalEscape => self.global_escape += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.no_escape + self.arg_escape + self.global_escape
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub outcome: Outcome,
    pub rounds: usize,
    /// Merge-reduction rounds undone because they invalidated an earlier reduction.
    pub rolled_back: usize,
    pub eliminated: Vec<InstId>,
    pub retained: Vec<(InstId, NsrReason)>,
    pub reduced_merges: Vec<InstId>,
    pub irreducible_merges: Vec<(InstId, Irreducible)>,
    pub eliminated_locks: usize,
    pub escape: EscapeCounts,
}

impl Report {
    fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            rounds: 0,
            rolled_back: 0,
            eliminated: vec![],
            retained: vec![],
            reduced_merges: vec![],
            irreducible_merges: vec![],
            eliminated_locks: 0,
            escape: EscapeCounts::default(),
        }
    }

    pub fn reason(&self, alloc: InstId) -> Option<NsrReason> {
        self.retained
            .iter()
            .find(|&&(inst_id, _)| inst_id == alloc)
            .map(|&(_, reason)| reason)
    }
}

/// Runs the pass over `body`.
///
/// On a bailout the body is restored to its original state and every allocation counts as
/// escaping globally.
pub fn run(program: &Program, body: &mut FuncBody, config: &Config) -> Report {
    if !config.enabled {
        return Report::new(Outcome::Disabled);
    }

    let original = body.clone();
    let mut pass = Pass {
        program,
        config,
        budget: Budget::new(config.step_budget),
        registry: MergeRegistry::default(),
        blacklist: HashSet::new(),
        rounds: 0,
        rolled_back: 0,
        reduced_merges: vec![],
    };

    match pass.run(body) {
        Ok(report) => report,

        Err(err) => {
            match err.bailout() {
                Bailout::Invariant => error!("escape analysis failed: {err}"),
                _ => warn!("escape analysis bailed out: {err}"),
            }

            *body = original;

            let mut report = Report::new(Outcome::NotReduced(err.bailout()));
            report.rounds = pass.rounds;
            report.escape.global_escape = body
                .insts
                .values()
                .filter(|inst| matches!(inst.kind, InstKind::New(_) | InstKind::NewArray { .. }))
                .count();

            report
        }
    }
}

struct Analysis {
    graph: ConnectionGraph,
    merges: MergeAnalysis,
    classes: Classification,
}

struct Pass<'a> {
    program: &'a Program,
    config: &'a Config,
    budget: Budget,
    registry: MergeRegistry,
    blacklist: HashSet<InstId>,
    rounds: usize,
    rolled_back: usize,
    reduced_merges: Vec<InstId>,
}

impl Pass<'_> {
    fn analyze(&mut self, body: &FuncBody) -> Result<Analysis, EaError> {
        let nodes = body.insts.len();

        if nodes > self.config.node_budget {
            return Err(EaError::NodeBudget {
                nodes,
                budget: self.config.node_budget,
            });
        }

        let mut graph = ConnectionGraph::build(self.program, body, self.config);
        graph.propagate(self.config, &mut self.budget)?;

        let merges = MergeAnalysis::compute(
            self.program,
            body,
            &graph,
            &self.registry,
            &self.blacklist,
            self.config.reduce_merges && self.config.eliminate_allocations,
            &mut self.budget,
        )?;
        let classes = Classification::compute(
            self.program,
            body,
            &graph,
            &merges,
            self.config,
            &BTreeMap::new(),
        );

        Ok(Analysis {
            graph,
            merges,
            classes,
        })
    }

    fn blacklist_webs(&mut self, analysis: &Analysis, webs: &[usize]) {
        for &web_idx in webs {
            self.blacklist
                .extend(analysis.merges.webs[web_idx].phis.iter().copied());
        }
    }

    fn run(&mut self, body: &mut FuncBody) -> Result<Report, EaError> {
        let mut analysis = self.analyze(body)?;

        if analysis.graph.allocs().next().is_none() {
            debug!("no allocations to analyze");

            return Ok(Report::new(Outcome::NothingToDo));
        }

        loop {
            let webs = analysis.merges.reducible_webs(&analysis.classes);

            if webs.is_empty() {
                break;
            }

            self.budget.tick()?;

            if self.rounds >= self.config.max_rounds {
                debug!("out of rounds with {} reducible merges left", webs.len());
                self.blacklist_webs(&analysis, &webs);
                analysis = self.analyze(body)?;

                continue;
            }

            self.rounds += 1;
            debug!("round {}: reducing {} merges", self.rounds, webs.len());

            let snapshot = (body.clone(), self.registry.clone());
            let reduced = merge::reduce(
                self.program,
                body,
                &analysis.merges,
                &analysis.classes,
                &mut self.registry,
                &webs,
            )?;
            let next = self.analyze(body)?;

            if self
                .registry
                .leaves()
                .all(|leaf| next.classes.is_sr_alloc(&next.graph, leaf))
            {
                self.reduced_merges.extend(reduced);
                analysis = next;
            } else {
                warn!(
                    "round {} kept an allocation a reduced merge depends on; rolling it back",
                    self.rounds
                );

                (*body, self.registry) = snapshot;
                self.rolled_back += 1;
                self.blacklist_webs(&analysis, &webs);
                analysis = self.analyze(body)?;
            }
        }

        let mut forced = BTreeMap::new();

        let plan = loop {
            match scalarize::plan(
                self.program,
                body,
                &analysis.graph,
                &analysis.classes,
                &mut self.budget,
            )? {
                Planned::Ready(plan) => break plan,

                Planned::Retry(failures) => {
                    self.budget.tick()?;
                    forced.extend(failures);
                    analysis.classes = Classification::compute(
                        self.program,
                        body,
                        &analysis.graph,
                        &analysis.merges,
                        self.config,
                        &forced,
                    );
                }
            }
        };

        if let Some(leaf) = self
            .registry
            .leaves()
            .find(|&leaf| !analysis.classes.is_sr_alloc(&analysis.graph, leaf))
        {
            return Err(EaError::Invariant(format!(
                "{leaf:?} feeds a reduced merge but is kept"
            )));
        }

        let mut eliminated_locks = 0;
        let mut eliminated = vec![];

        if !plan.is_empty() {
            let committed = plan.commit(body)?;
            remat::emit(body, &committed)?;
            body.remove_insts(&committed.dead);
            eliminated_locks += committed.monitors_removed;
            eliminated = committed.eliminated;
        }

        if self.config.eliminate_locks {
            eliminated_locks += locks::elide(body, &analysis.graph, &analysis.classes);
        }

        annotate(body, &analysis.graph);

        if self.config.verify {
            if let Err(err) = body.verify(self.program) {
                error!("escape analysis produced malformed IR: {err}");

                return Err(EaError::Invariant(err.to_string()));
            }
        }

        Ok(self.report(&analysis, eliminated, eliminated_locks))
    }

    fn report(&self, analysis: &Analysis, eliminated: Vec<InstId>, eliminated_locks: usize) -> Report {
        let graph = &analysis.graph;
        let mut escape = EscapeCounts::default();

        for (_, obj) in graph.allocs() {
            escape.record(obj.state);
        }

        let retained = analysis
            .classes
            .nsr
            .iter()
            .filter_map(|(&obj_id, &reason)| Some((graph.objs[obj_id].alloc_inst()?, reason)))
            .collect();

        let outcome = if eliminated.is_empty()
            && self.reduced_merges.is_empty()
            && eliminated_locks == 0
        {
            Outcome::NothingToDo
        } else {
            Outcome::Reduced
        };

        debug!(
            "eliminated {} allocations and {} monitor operations in {} rounds",
            eliminated.len(),
            eliminated_locks,
            self.rounds,
        );

        Report {
            outcome,
            rounds: self.rounds,
            rolled_back: self.rolled_back,
            eliminated,
            retained,
            reduced_merges: self.reduced_merges.clone(),
            irreducible_merges: analysis.merges.irreducible().collect(),
            eliminated_locks,
            escape,
        }
    }
}

/// Records which safepoints and calls still see method-local objects.
fn annotate(body: &mut FuncBody, graph: &ConnectionGraph) {
    let is_local = |inst_id: InstId| {
        graph
            .allocs_of(inst_id)
            .any(|obj_id| graph.objs[obj_id].state < EscapeState::GlobalEscape)
    };

    for safepoint in body.safepoints.values_mut() {
        let mut has_ea_local = !safepoint.objects.is_empty();
        safepoint.for_each_inst(|inst_id| has_ea_local |= is_local(inst_id));
        safepoint.has_ea_local = has_ea_local;
    }

    for inst in body.insts.values_mut() {
        if let InstKind::Call(call) = &mut inst.kind {
            call.arg_escape = call.args.iter().any(|&arg| {
                graph
                    .allocs_of(arg)
                    .any(|obj_id| graph.objs[obj_id].state == EscapeState::ArgEscape)
            });
        }
    }
}
