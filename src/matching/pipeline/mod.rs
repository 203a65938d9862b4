//! The staged mapping pipeline: Stage 0/0' (per-subgraph mapper) -> Stage 1
//! (straight-line lumping, optional) -> Stage 2 (dominator lumping,
//! completes the map) -> Stage 3 (skip completion), recursing through the
//! [`crate::region::HierarchicalFlowGraph`] hierarchy and checking it is
//! preserved at every step.
//!
//! Grounded on §4.H of the mapping specification; the mapper choice
//! (`ctrldep` vs `homomorphism`) is a [`MapperKind`] rather than a class
//! hierarchy, per this crate's design notes on avoiding deep class trees.

pub mod ctrldep;
pub mod domlump;
pub mod homomorphism;
pub mod linelump;
pub mod skip;

use crate::dom::DominatorTree;
use crate::graph::{DiGraph, NodeId};
use crate::matching::{EdgeLabel, GraphMap, HierarchicalGraphMap, MappingError};
use homomorphism::{HomOrder, PotentialMap};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperKind {
    CtrlDep,
    Homomorphism,
}

pub struct MapperInputs<'a> {
    pub bin_graph: &'a DiGraph,
    pub src_graph: &'a DiGraph,
    pub bin_dom: &'a DominatorTree,
    pub src_dom: &'a DominatorTree,
    pub bin_pdom: &'a DominatorTree,
    pub src_pdom: &'a DominatorTree,
    pub bin_labels: &'a HashMap<(NodeId, NodeId), EdgeLabel>,
    pub src_labels: &'a HashMap<(NodeId, NodeId), EdgeLabel>,
    pub bin_controlled: &'a HashMap<NodeId, HashSet<(NodeId, NodeId)>>,
    pub src_controlled: &'a HashMap<NodeId, HashSet<(NodeId, NodeId)>>,
    pub potential: &'a PotentialMap,
    pub fixed_points: &'a GraphMap,
    pub hom_order: HomOrder,
}

/// Runs Stage 0 or 0' over one subgraph pair, per `kind`.
pub fn run_subgraph_mapper(kind: MapperKind, inputs: &MapperInputs<'_>, src_min_line: impl Fn(NodeId) -> u32) -> GraphMap {
    match kind {
        MapperKind::CtrlDep => {
            let mut gm = ctrldep::map_via_ctrl_dep(
                inputs.bin_graph.nodes(),
                inputs.src_graph.nodes(),
                inputs.bin_controlled,
                inputs.src_controlled,
                inputs.bin_labels,
                inputs.src_labels,
                src_min_line,
            );
            for (b, a) in inputs.fixed_points.entries() {
                gm.insert(b, a);
            }
            gm
        }
        MapperKind::Homomorphism => homomorphism::map_via_homomorphism(
            inputs.potential,
            inputs.bin_dom,
            inputs.src_dom,
            inputs.fixed_points,
            inputs.hom_order,
            inputs.bin_pdom,
            inputs.src_pdom,
        ),
    }
}

pub struct PipelineConfig {
    pub mapper: MapperKind,
    pub hom_order: HomOrder,
    /// The reference mapper disables this by default "for safety".
    pub enable_straight_line_lumping: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig { mapper: MapperKind::CtrlDep, hom_order: HomOrder::PreDominatorFirst, enable_straight_line_lumping: false }
    }
}

/// Runs Stages 0/0'/1/2 over one subgraph, producing a completed
/// `GraphMap`. Stage 3 (skip completion) is applied afterward by the
/// caller once the whole hierarchy's maps exist, since it needs a child's
/// *parent* map.
pub fn run_stages_0_to_2(
    cfg: &PipelineConfig,
    inputs: &MapperInputs<'_>,
    entry: NodeId,
    src_min_line: impl Fn(NodeId) -> u32,
) -> Result<GraphMap, MappingError> {
    let mut gm = run_subgraph_mapper(cfg.mapper, inputs, src_min_line);

    if cfg.enable_straight_line_lumping {
        linelump::lump_straight_line(inputs.bin_graph, inputs.bin_dom, entry, &mut gm);
    }
    domlump::lump_dominators(inputs.bin_graph, inputs.bin_dom, entry, &mut gm)?;
    Ok(gm)
}

/// Verifies a child HGM's fixed points (the matched loop's surrogate ids in
/// both parent maps) agree with the parent map, per the "every stage
/// preserves the hierarchy exactly" requirement.
pub fn check_hierarchy_preserved(parent: &GraphMap, child: &HierarchicalGraphMap) -> Result<(), MappingError> {
    let (Some(bin_surrogate), Some(src_surrogate)) = (child.loop_id_bin, child.loop_id_src) else {
        return Ok(());
    };
    match parent.get(bin_surrogate) {
        Some(mapped) if mapped == src_surrogate => Ok(()),
        Some(mapped) => Err(MappingError::HierarchyMismatch(format!(
            "parent maps surrogate {bin_surrogate} to {mapped}, but child HFG pair expects {src_surrogate}"
        ))),
        None => Err(MappingError::HierarchyMismatch(format!("parent map has no entry for surrogate {bin_surrogate}"))),
    }
}
