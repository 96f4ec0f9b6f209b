use std::collections::{BTreeMap, BTreeSet};

use log::{debug, trace};
use strum::Display;

use crate::cfg::{FuncBody, InstId, InstKind, Ty};
use crate::program::Program;

use super::graph::{ConnectionGraph, EscapeState, ObjId, ObjKind, ObjShape, PtSet};
use super::locks;
use super::merge::MergeAnalysis;
use super::Config;

/// Why an allocation is kept as a real object.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[strum(serialize_all = "kebab-case")]
pub enum NsrReason {
    ArgEscape,
    GlobalEscape,
    Disabled,
    ArrayLength,
    TooManyFields,
    UnknownIndex,
    Locked,
    /// Stored into an object that is kept.
    NestedInRetained,
    StoredThroughAmbiguous,
    Merged,
    IrreducibleMerge,
    Identity,
    FailingCast,
    RawStore,
    ArrayCopy,
    /// Some use could not be traced back to the allocation.
    Unresolved,
    UnsupportedUse,
}

#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub sr: BTreeSet<ObjId>,
    pub nsr: BTreeMap<ObjId, NsrReason>,
}

impl Classification {
    pub fn is_sr(&self, obj_id: ObjId) -> bool {
        self.sr.contains(&obj_id)
    }

    pub fn is_sr_alloc(&self, graph: &ConnectionGraph, inst_id: InstId) -> bool {
        graph
            .alloc_objs
            .get(inst_id)
            .is_some_and(|&obj_id| self.is_sr(obj_id))
    }

    pub fn reason(&self, obj_id: ObjId) -> Option<NsrReason> {
        self.nsr.get(&obj_id).copied()
    }

    pub fn compute(
        program: &Program,
        body: &FuncBody,
        graph: &ConnectionGraph,
        merges: &MergeAnalysis,
        config: &Config,
        forced: &BTreeMap<ObjId, NsrReason>,
    ) -> Self {
        let mut classifier = Classifier {
            program,
            body,
            graph,
            merges,
            config,
            nsr: BTreeMap::new(),
        };

        classifier.check_objects(forced);
        classifier.check_merges();
        classifier.check_insts();
        classifier.check_locks();
        classifier.close_nested();

        let nsr = classifier.nsr;
        let sr = graph
            .allocs()
            .map(|(obj_id, _)| obj_id)
            .filter(|obj_id| !nsr.contains_key(obj_id))
            .collect::<BTreeSet<_>>();

        debug!(
            "{} allocations are scalar replaceable, {} are not",
            sr.len(),
            nsr.len()
        );

        Self { sr, nsr }
    }
}

struct Classifier<'a> {
    program: &'a Program,
    body: &'a FuncBody,
    graph: &'a ConnectionGraph,
    merges: &'a MergeAnalysis,
    config: &'a Config,
    nsr: BTreeMap<ObjId, NsrReason>,
}

impl Classifier<'_> {
    fn mark(&mut self, obj_id: ObjId, reason: NsrReason) -> bool {
        if !matches!(self.graph.objs[obj_id].kind, ObjKind::Alloc(_)) {
            return false;
        }

        if self.nsr.contains_key(&obj_id) {
            return false;
        }

        trace!("{obj_id:?} is not scalar replaceable: {reason}");
        self.nsr.insert(obj_id, reason);

        true
    }

    fn mark_pts(&mut self, inst_id: InstId, reason: NsrReason) {
        for obj_id in self.graph.pts_of(inst_id) {
            self.mark(obj_id, reason);
        }
    }

    fn const_index(&self, inst_id: InstId) -> Option<u32> {
        self.body.insts[inst_id]
            .kind
            .to_const()
            .and_then(|value| value.to_i32())
            .and_then(|value| u32::try_from(value).ok())
    }

    fn tracked_len(&self, obj_id: ObjId) -> Option<u32> {
        self.graph.objs[obj_id].tracked_len(self.config.array_size_limit)
    }

    fn check_objects(&mut self, forced: &BTreeMap<ObjId, NsrReason>) {
        let graph = self.graph;

        for (obj_id, obj) in graph.allocs() {
            let reason = match obj.state {
                EscapeState::ArgEscape => Some(NsrReason::ArgEscape),
                EscapeState::GlobalEscape => Some(NsrReason::GlobalEscape),
                EscapeState::NoEscape => None,
            };

            let reason = reason
                .or_else(|| (!self.config.eliminate_allocations).then_some(NsrReason::Disabled))
                .or_else(|| forced.get(&obj_id).copied())
                .or_else(|| match obj.shape {
                    ObjShape::Array { .. } if self.tracked_len(obj_id).is_none() => {
                        Some(NsrReason::ArrayLength)
                    }

                    ObjShape::Instance(class_id)
                        if self.program.classes[class_id].layout.len() > self.config.fields_limit =>
                    {
                        Some(NsrReason::TooManyFields)
                    }

                    _ => None,
                })
                .or_else(|| {
                    (obj.locked && !self.config.eliminate_locks).then_some(NsrReason::Locked)
                })
                .or_else(|| {
                    graph
                        .has_summary_elem(obj_id)
                        .then_some(NsrReason::UnknownIndex)
                });

            if let Some(reason) = reason {
                self.mark(obj_id, reason);
            }
        }
    }

    fn check_insts(&mut self) {
        let body = self.body;
        let graph = self.graph;
        let rpo = body.rpo();

        for &block_id in &rpo.order {
            for &inst_id in &body.blocks[block_id].body {
                let kind = &body.insts[inst_id].kind;

                if kind.is_phi() && self.merges.descs.contains_key(&inst_id) {
                    continue;
                }

                for operand in kind.operands() {
                    if graph.is_ambiguous(operand) && !self.merges.is_reducible(operand) {
                        self.mark_pts(operand, NsrReason::Merged);
                    }
                }

                self.check_inst(inst_id, kind);
            }
        }

        for safepoint in body.safepoints.values() {
            safepoint.for_each_inst(|operand| {
                if graph.is_ambiguous(operand) && !self.merges.is_reducible(operand) {
                    self.mark_pts(operand, NsrReason::Merged);
                }
            });
        }
    }

    fn check_inst(&mut self, inst_id: InstId, kind: &InstKind) {
        let graph = self.graph;

        match *kind {
            InstKind::Phi(_) => self.mark_pts(inst_id, NsrReason::Merged),

            InstKind::LoadElem { array, index } | InstKind::StoreElem { array, index, .. } => {
                let index = self.const_index(index);

                for obj_id in graph.allocs_of(array).collect::<Vec<_>>() {
                    let in_range = index
                        .zip(self.tracked_len(obj_id))
                        .is_some_and(|(index, len)| index < len);

                    if !in_range {
                        self.mark(obj_id, NsrReason::UnknownIndex);
                    }
                }
            }

            _ => {}
        }

        match *kind {
            InstKind::StoreField { obj: base, value, .. }
            | InstKind::StoreElem {
                array: base, value, ..
            } if self.body.ty(value) == Some(Ty::Ref) => {
                if graph.is_ambiguous(base) || graph.may_be_null(base) {
                    self.mark_pts(value, NsrReason::StoredThroughAmbiguous);
                }
            }

            InstKind::ArrayFill { array, value } if self.body.ty(value) == Some(Ty::Ref) => {
                if graph.is_ambiguous(array) || graph.may_be_null(array) {
                    self.mark_pts(value, NsrReason::StoredThroughAmbiguous);
                }
            }

            InstKind::RefEq([lhs, rhs]) => {
                if self.merges.is_reducible(lhs) || self.merges.is_reducible(rhs) {
                    return;
                }

                let lhs_pts = graph.pts_of(lhs);
                let rhs_pts = graph.pts_of(rhs);
                let null_only =
                    |pts: &PtSet| !pts.is_empty() && pts.iter().all(|&obj_id| obj_id == graph.null);
                let same_single = lhs_pts.len() == 1 && lhs_pts == rhs_pts;

                // comparisons against null always fold
                let foldable = if null_only(&lhs_pts) || null_only(&rhs_pts) {
                    lhs_pts.is_disjoint(&rhs_pts)
                } else {
                    self.config.optimize_ptr_compare
                        && (same_single || lhs_pts.is_disjoint(&rhs_pts))
                };

                if !foldable {
                    self.mark_pts(lhs, NsrReason::Identity);
                    self.mark_pts(rhs, NsrReason::Identity);
                }
            }

            InstKind::CheckCast { obj, class } => {
                for obj_id in graph.allocs_of(obj).collect::<Vec<_>>() {
                    let passes = match graph.objs[obj_id].shape {
                        ObjShape::Instance(class_id) => self.program.is_subclass(class_id, class),
                        _ => false,
                    };

                    if !passes {
                        self.mark(obj_id, NsrReason::FailingCast);
                    }
                }
            }

            InstKind::LoadClass(obj) => {
                for obj_id in graph.allocs_of(obj).collect::<Vec<_>>() {
                    if !matches!(graph.objs[obj_id].shape, ObjShape::Instance(_)) {
                        self.mark(obj_id, NsrReason::UnsupportedUse);
                    }
                }
            }

            InstKind::RawStore {
                array,
                offset,
                width,
                value,
            } => {
                let value_size = self.body.ty(value).and_then(Ty::byte_size);

                for obj_id in graph.allocs_of(array).collect::<Vec<_>>() {
                    let fits = match (graph.objs[obj_id].shape, self.tracked_len(obj_id), value_size)
                    {
                        (ObjShape::Array { elem, .. }, Some(len), Some(value_size)) => {
                            elem.byte_size().is_some_and(|elem_size| {
                                offset % elem_size == 0
                                    && width % elem_size == 0
                                    && width > 0
                                    && width <= value_size
                                    && u64::from(offset / elem_size) + u64::from(width / elem_size)
                                        <= u64::from(len)
                            })
                        }

                        _ => false,
                    };

                    if !fits {
                        self.mark(obj_id, NsrReason::RawStore);
                    }
                }
            }

            InstKind::ArrayCopy {
                src,
                src_pos,
                dst,
                dst_pos,
                len,
            } => {
                let bounds = self
                    .const_index(src_pos)
                    .zip(self.const_index(dst_pos))
                    .zip(self.const_index(len));

                for (array, pos) in [(src, src_pos), (dst, dst_pos)] {
                    let pos = self.const_index(pos);

                    for obj_id in graph.allocs_of(array).collect::<Vec<_>>() {
                        let in_range = match (bounds, pos, self.tracked_len(obj_id)) {
                            (Some((_, copy_len)), Some(pos), Some(array_len)) => {
                                u64::from(pos) + u64::from(copy_len) <= u64::from(array_len)
                            }

                            _ => false,
                        };

                        if !in_range {
                            self.mark(obj_id, NsrReason::ArrayCopy);
                        }
                    }
                }
            }

            InstKind::MonitorEnter(obj) | InstKind::MonitorExit(obj) => {
                if !self.config.eliminate_locks {
                    self.mark_pts(obj, NsrReason::Locked);
                }
            }

            _ => {}
        }
    }

    fn check_merges(&mut self) {
        let graph = self.graph;

        for (phi, _) in self.merges.irreducible().collect::<Vec<_>>() {
            for obj_id in graph.allocs_of(phi).collect::<Vec<_>>() {
                self.mark(obj_id, NsrReason::IrreducibleMerge);
            }
        }
    }

    fn check_locks(&mut self) {
        for obj_id in locks::unbalanced(self.body, self.graph) {
            self.mark(obj_id, NsrReason::Locked);
        }
    }

    /// Objects stored into kept objects must be kept too.
    fn close_nested(&mut self) {
        let graph = self.graph;
        let mut worklist = self.nsr.keys().copied().collect::<Vec<_>>();

        while let Some(obj_id) = worklist.pop() {
            let targets = graph.objs[obj_id]
                .fields
                .values()
                .flatten()
                .copied()
                .collect::<Vec<_>>();

            for target in targets {
                if self.mark(target, NsrReason::NestedInRetained) {
                    worklist.push(target);
                }
            }
        }
    }
}
