//! Binary-to-source basic-block mapping: the staged pipeline that turns a
//! pair of [`crate::region::HierarchicalFlowGraph`]s into a
//! [`HierarchicalGraphMap`].
//!
//! The pipeline stages (edge matcher, loop matcher, the two interchangeable
//! per-subgraph mappers, lumping passes, skip completion) are kept as
//! separate modules; this module holds the shared vocabulary every stage
//! reads and writes: decision-edge labels, the per-function `GraphMap`, its
//! hierarchical wrapper, and execution-count arithmetic. Grounded on §4.F-H
//! of the mapping specification and on the reference mapper's
//! `mapping/*.py` family, which keeps exactly this "frozen map consumed by
//! the next stage" shape (see the DAG-of-maps note in this crate's design
//! notes).

pub mod edge_matcher;
pub mod loop_matcher;
pub mod pipeline;

use crate::graph::NodeId;
use std::collections::HashMap;
use std::fmt;

/// `c<D>.<O>`: decision-source id `D` and consequent (outcome) id `O`,
/// shared across the binary and source CFGs so equal labels denote the same
/// branch decision/outcome pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeLabel {
    pub decision: u32,
    pub outcome: u32,
}

impl fmt::Display for EdgeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}.{}", self.decision, self.outcome)
    }
}

/// `[lo, hi]` execution-count bound for one mapped node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecCount {
    pub lo: u64,
    pub hi: u64,
}

impl ExecCount {
    pub fn exact(n: u64) -> Self {
        ExecCount { lo: n, hi: n }
    }

    pub fn unknown() -> Self {
        ExecCount { lo: 0, hi: u64::MAX }
    }

    /// Pointwise sum, used when merging disjoint maps.
    pub fn merge(self, other: Self) -> Self {
        ExecCount {
            lo: self.lo.saturating_add(other.lo),
            hi: self.hi.saturating_add(other.hi),
        }
    }
}

#[derive(Debug)]
pub enum MappingError {
    Unmapped(NodeId),
    HierarchyMismatch(String),
    AssertionFailed(String),
    MissingAnnotation(NodeId),
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingError::Unmapped(n) => write!(f, "node {n} left unmapped after completion"),
            MappingError::HierarchyMismatch(msg) => write!(f, "hierarchy preservation violated: {msg}"),
            MappingError::AssertionFailed(msg) => write!(f, "pipeline invariant violated: {msg}"),
            MappingError::MissingAnnotation(n) => write!(f, "skipped loop at {n} has no user annotation"),
        }
    }
}

impl std::error::Error for MappingError {}

/// `bin_bb -> src_bb` for one flat subgraph (top level, or one matched
/// loop), plus the execution count attributed to each mapped binary node.
#[derive(Debug, Clone, Default)]
pub struct GraphMap {
    map: HashMap<NodeId, NodeId>,
    exec_counts: HashMap<NodeId, ExecCount>,
    cycle_overrides: HashMap<NodeId, u64>,
}

impl GraphMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, bin: NodeId, src: NodeId) {
        self.map.insert(bin, src);
    }

    pub fn get(&self, bin: NodeId) -> Option<NodeId> {
        self.map.get(&bin).copied()
    }

    pub fn is_mapped(&self, bin: NodeId) -> bool {
        self.map.contains_key(&bin)
    }

    pub fn set_exec_count(&mut self, bin: NodeId, count: ExecCount) {
        self.exec_counts
            .entry(bin)
            .and_modify(|c| *c = c.merge(count))
            .or_insert(count);
    }

    pub fn exec_count(&self, bin: NodeId) -> Option<ExecCount> {
        self.exec_counts.get(&bin).copied()
    }

    /// Records `cycles` as the authoritative total for `bin`, bypassing the
    /// output writer's `exec_count.hi * block_time` product for this node.
    /// Used when a loop annotation's `time` field overrides the derived
    /// count for a skipped subflow.
    pub fn set_cycle_override(&mut self, bin: NodeId, cycles: u64) {
        self.cycle_overrides.insert(bin, cycles);
    }

    pub fn cycle_override(&self, bin: NodeId) -> Option<u64> {
        self.cycle_overrides.get(&bin).copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.map.iter().map(|(&b, &s)| (b, s))
    }

    pub fn unmapped<'a>(&'a self, bin_nodes: impl Iterator<Item = NodeId> + 'a) -> Vec<NodeId> {
        bin_nodes.filter(|n| !self.is_mapped(*n)).collect()
    }

    /// Inverted view: `src -> [bin]`, used by the output writer.
    pub fn by_source(&self) -> HashMap<NodeId, Vec<NodeId>> {
        let mut out: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for (&b, &s) in &self.map {
            out.entry(s).or_default().push(b);
        }
        for v in out.values_mut() {
            v.sort_by_key(|n| n.as_u32());
        }
        out
    }
}

/// One node of the hierarchical map, paired 1:1 with a matched
/// (bin-HFG, src-HFG) pair. `skip` marks a binary subflow with no source
/// counterpart (or vice versa): it is filled in by skip completion instead
/// of a per-subgraph mapper.
#[derive(Debug, Clone)]
pub struct HierarchicalGraphMap {
    pub loop_id_bin: Option<NodeId>,
    pub loop_id_src: Option<NodeId>,
    pub map: GraphMap,
    pub skip: bool,
    pub children: Vec<HierarchicalGraphMap>,
}

impl HierarchicalGraphMap {
    pub fn leaf(map: GraphMap) -> Self {
        HierarchicalGraphMap { loop_id_bin: None, loop_id_src: None, map, skip: false, children: Vec::new() }
    }

    /// Flattens the hierarchy into one `bin -> src` map by merging every
    /// level's `map`. A value may still be a *surrogate* id standing in for
    /// a reduced source loop at some ancestor level; resolving those to
    /// their original loop header (§8's flatten invariant) needs the
    /// source-side `HierarchicalFlowGraph`'s region bookkeeping, which this
    /// type doesn't carry — see `Analysis::flatten_resolving_surrogates`,
    /// which does that substitution as a pass over this method's output.
    pub fn flatten(&self) -> HashMap<NodeId, NodeId> {
        let mut out = HashMap::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(&self, out: &mut HashMap<NodeId, NodeId>) {
        for (bin, src) in self.map.entries() {
            out.insert(bin, src);
        }
        for child in &self.children {
            child.flatten_into(out);
        }
    }

    pub fn find_child(&self, loop_id_bin: NodeId) -> Option<&HierarchicalGraphMap> {
        self.children.iter().find(|c| c.loop_id_bin == Some(loop_id_bin))
    }

    pub fn find_child_mut(&mut self, loop_id_bin: NodeId) -> Option<&mut HierarchicalGraphMap> {
        self.children.iter_mut().find(|c| c.loop_id_bin == Some(loop_id_bin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_count_merge_sums_pointwise() {
        let a = ExecCount { lo: 1, hi: 2 };
        let b = ExecCount { lo: 3, hi: 4 };
        let m = a.merge(b);
        assert_eq!(m.lo, 4);
        assert_eq!(m.hi, 6);
    }

    #[test]
    fn by_source_groups_and_sorts_bin_nodes() {
        let mut gm = GraphMap::new();
        gm.insert(NodeId(5), NodeId(0));
        gm.insert(NodeId(1), NodeId(0));
        let by_src = gm.by_source();
        assert_eq!(by_src[&NodeId(0)], vec![NodeId(1), NodeId(5)]);
    }

    #[test]
    fn edge_label_display_matches_wire_format() {
        let l = EdgeLabel { decision: 3, outcome: 7 };
        assert_eq!(l.to_string(), "c3.7");
    }
}
