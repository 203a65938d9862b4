//! Per-function `Analysis`: owns one function's binary and source
//! [`ControlFlow`]s and runs the whole pipeline — loop analysis, region
//! reduction, loop matching, the staged mapper — to produce a flattened
//! `bin_bb -> src_bb` map with execution counts.
//!
//! Grounded on §5 of the mapping specification ("all state is owned by a
//! per-function Analysis object that transitively owns its two CFGs,
//! their dominator/loop/TFG/HFG caches, and the resulting HGM"). Kept as a
//! plain owning struct (no trait objects, no shared mutable global state),
//! matching the compiler's own per-function `FunctionContext` shape.

use crate::cfg::{compute_source_discriminators, ControlFlow, InstructionTable};
use crate::dom::DominatorTree;
use crate::graph::NodeId;
use crate::loops::{analyze_loops, LoopTree};
use crate::matching::edge_matcher::{label_decision_edges, pair_discriminators, DiscrMap};
use crate::matching::loop_matcher::{match_loops, LoopMatchResult};
use crate::matching::pipeline::ctrldep::compute_control_dependence;
use crate::matching::pipeline::homomorphism::build_potential_map;
use crate::matching::pipeline::skip::{complete_skips, LoopAnnotation};
use crate::matching::pipeline::{check_hierarchy_preserved, run_stages_0_to_2, MapperInputs, MapperKind, PipelineConfig};
use crate::matching::{EdgeLabel, GraphMap, HierarchicalGraphMap, MappingError};
use crate::region::{HierarchicalFlowGraph, Transformation};
use std::collections::{HashMap, HashSet};

#[derive(Debug)]
pub enum AnalysisError {
    IrreducibleLoop(String),
    NoDebugInfo(String),
    Mapping(MappingError),
}

impl std::fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalysisError::IrreducibleLoop(func) => write!(f, "function '{func}' contains an irreducible loop"),
            AnalysisError::NoDebugInfo(func) => write!(f, "function '{func}' has no matching debug info; skipped"),
            AnalysisError::Mapping(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AnalysisError {}

impl From<MappingError> for AnalysisError {
    fn from(e: MappingError) -> Self {
        AnalysisError::Mapping(e)
    }
}

pub struct Analysis {
    pub bin_cf: ControlFlow,
    pub src_cf: ControlFlow,
    bin_loops: LoopTree,
    src_loops: LoopTree,
    bin_dom: DominatorTree,
    src_dom: DominatorTree,
    bin_pdom: DominatorTree,
    src_pdom: DominatorTree,
}

impl Analysis {
    pub fn new(mut bin_cf: ControlFlow, mut src_cf: ControlFlow, simplify: bool) -> Result<Self, AnalysisError> {
        bin_cf.prune_unreachable();
        src_cf.prune_unreachable();
        if simplify {
            bin_cf.simplify();
            src_cf.simplify();
        }
        compute_source_discriminators(&mut src_cf);

        let bin_loops = analyze_loops(bin_cf.graph(), bin_cf.entry_id());
        let src_loops = analyze_loops(src_cf.graph(), src_cf.entry_id());
        if bin_loops.any_irreducible() {
            return Err(AnalysisError::IrreducibleLoop(bin_cf.name.clone()));
        }

        let bin_dom = DominatorTree::compute(bin_cf.graph(), bin_cf.entry_id());
        let src_dom = DominatorTree::compute(src_cf.graph(), src_cf.entry_id());
        let bin_pdom = match bin_cf.exit_id() {
            Some(e) => DominatorTree::compute(&bin_cf.graph().reverse(), e),
            None => DominatorTree::compute(&bin_cf.graph().reverse(), bin_cf.entry_id()),
        };
        let src_pdom = match src_cf.exit_id() {
            Some(e) => DominatorTree::compute(&src_cf.graph().reverse(), e),
            None => DominatorTree::compute(&src_cf.graph().reverse(), src_cf.entry_id()),
        };

        Ok(Analysis { bin_cf, src_cf, bin_loops, src_loops, bin_dom, src_dom, bin_pdom, src_pdom })
    }

    pub fn match_loops(
        &self,
        insns: &InstructionTable,
        line_of_addr: impl Fn(u64) -> Option<u32>,
        user_skip: &HashSet<NodeId>,
    ) -> LoopMatchResult {
        match_loops(&self.bin_cf, &self.bin_loops, &self.src_cf, &self.src_loops, insns, line_of_addr, user_skip)
    }

    /// Runs the full mapping pipeline and returns the flattened
    /// `bin_bb -> src_bb` map (over original node ids) plus its
    /// hierarchical form (kept for execution-count lookups). `insns` and
    /// `line_of_addr` are only consulted when `cfg.mapper` is
    /// [`MapperKind::Homomorphism`], to build that mapper's potential map.
    pub fn run_mapping(
        &self,
        bin_discr: &DiscrMap,
        trust_dbg: bool,
        loop_match: &LoopMatchResult,
        annotations: &HashMap<NodeId, LoopAnnotation>,
        cfg: PipelineConfig,
        insns: &InstructionTable,
        line_of_addr: &dyn Fn(u64) -> Option<u32>,
    ) -> Result<(HashMap<NodeId, NodeId>, HierarchicalGraphMap), AnalysisError> {
        let src_discr = self.src_line_discr();

        let find_source_block = |line: u32, col: u32| {
            let candidates: Vec<NodeId> = self.src_cf.nodes().collect();
            self.src_cf.find_source_block(line, col, &candidates)
        };
        let src_discr_of = |n: NodeId| self.src_cf.block(n).and_then(|b| b.source()).map(|s| s.discriminator);
        let bin_col_of = |_n: NodeId| None; // column resolution needs DWARF line-table data from ingest

        let pairing =
            pair_discriminators(bin_discr, &src_discr, trust_dbg, bin_col_of, find_source_block, src_discr_of, &self.bin_dom, &self.src_dom, &self.bin_pdom, &self.src_pdom);
        let (bin_labels, src_labels) = label_decision_edges(&self.bin_cf, &self.src_cf, &pairing);

        let mut bin_hfg = HierarchicalFlowGraph::top_level(&self.bin_cf, &self.bin_loops);
        let mut src_hfg = HierarchicalFlowGraph::top_level(&self.src_cf, &self.src_loops);

        let mut subflow_nodes: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for region in bin_hfg.tfg.regions.regions() {
            subflow_nodes.insert(region.id, region.members.iter().copied().collect());
        }

        let mut hgm = self.build_level(&cfg, &mut bin_hfg, &mut src_hfg, loop_match, &bin_labels, &src_labels, GraphMap::new(), insns, line_of_addr)?;

        self.check_annotation_sanity(annotations, line_of_addr)?;
        complete_skips(&mut hgm, None, &subflow_nodes, annotations)?;

        let flat = self.flatten_resolving_surrogates(&hgm, &src_hfg);
        Ok((flat, hgm))
    }

    fn src_line_discr(&self) -> DiscrMap {
        let mut out: DiscrMap = HashMap::new();
        for n in self.src_cf.nodes() {
            if let Some(s) = self.src_cf.block(n).and_then(|b| b.source()) {
                out.entry(s.begin.line).or_default().insert(s.discriminator, n);
            }
        }
        out
    }

    /// Checks a loop annotation's optional `line`/`addr` fields against the
    /// DWARF-derived facts for the binary loop head they name, the same
    /// precondition the reference mapper enforces before trusting `repeats`/
    /// `time` for a skipped subflow. A mismatch means the annotation is
    /// keyed to the wrong loop and is fatal rather than silently ignored.
    fn check_annotation_sanity(&self, annotations: &HashMap<NodeId, LoopAnnotation>, line_of_addr: &dyn Fn(u64) -> Option<u32>) -> Result<(), MappingError> {
        let mut surrogates: Vec<NodeId> = annotations.keys().copied().collect();
        surrogates.sort_by_key(|n| n.as_u32());
        for surrogate in surrogates {
            let annotation = &annotations[&surrogate];
            if annotation.line.is_none() && annotation.addr.is_none() {
                continue;
            }
            let Some(block) = self.bin_cf.block(surrogate) else { continue };
            let Some(bin_data) = block.binary() else { continue };

            if let Some(addr) = annotation.addr {
                if !bin_data.addr_ranges.iter().any(|r| r.contains(addr)) {
                    return Err(MappingError::AssertionFailed(format!(
                        "loop annotation for {surrogate} names address {addr:#x}, outside its address ranges"
                    )));
                }
            }
            if let Some(line) = annotation.line {
                let lines: Vec<u32> = bin_data.addr_ranges.iter().filter_map(|r| line_of_addr(r.lo)).collect();
                if !lines.is_empty() && !lines.contains(&line) {
                    return Err(MappingError::AssertionFailed(format!(
                        "loop annotation for {surrogate} names line {line}, matching none of its DWARF lines {lines:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn build_level<'a>(
        &self,
        cfg: &PipelineConfig,
        bin_hfg: &mut HierarchicalFlowGraph<'a>,
        src_hfg: &mut HierarchicalFlowGraph<'a>,
        loop_match: &LoopMatchResult,
        bin_labels: &HashMap<(NodeId, NodeId), EdgeLabel>,
        src_labels: &HashMap<(NodeId, NodeId), EdgeLabel>,
        mut fixed_points: GraphMap,
        insns: &InstructionTable,
        line_of_addr: &dyn Fn(u64) -> Option<u32>,
    ) -> Result<HierarchicalGraphMap, AnalysisError> {
        let bin_dom = DominatorTree::compute(bin_hfg.tfg.graph(), bin_hfg.tfg.entry());
        let bin_pdom_root = bin_hfg.tfg.exit().unwrap_or(bin_hfg.tfg.entry());
        let bin_pdom = DominatorTree::compute(&bin_hfg.tfg.graph().reverse(), bin_pdom_root);
        let src_dom = DominatorTree::compute(src_hfg.tfg.graph(), src_hfg.tfg.entry());
        let src_pdom_root = src_hfg.tfg.exit().unwrap_or(src_hfg.tfg.entry());
        let src_pdom = DominatorTree::compute(&src_hfg.tfg.graph().reverse(), src_pdom_root);

        let bin_controlled = compute_control_dependence(bin_hfg.tfg.graph(), &bin_pdom);
        let src_controlled = compute_control_dependence(src_hfg.tfg.graph(), &src_pdom);

        fixed_points.insert(bin_hfg.tfg.entry(), src_hfg.tfg.entry());
        if let (Some(be), Some(se)) = (bin_hfg.tfg.exit(), src_hfg.tfg.exit()) {
            fixed_points.insert(be, se);
        }
        for (&sh, &bh) in &loop_match.matched {
            if let (Some(bin_child), Some(src_child)) = (bin_hfg.find_child(bh), src_hfg.find_child(sh)) {
                if let (Some(bs), Some(ss)) = (bin_child.node_in_parent, src_child.node_in_parent) {
                    fixed_points.insert(bs, ss);
                }
            }
        }

        let potential = match cfg.mapper {
            MapperKind::Homomorphism => build_potential_map(&bin_hfg.tfg, &src_hfg.tfg, insns, line_of_addr, &src_dom),
            MapperKind::CtrlDep => HashMap::new(), // not consumed by this mapper
        };
        let inputs = MapperInputs {
            bin_graph: bin_hfg.tfg.graph(),
            src_graph: src_hfg.tfg.graph(),
            bin_dom: &bin_dom,
            src_dom: &src_dom,
            bin_pdom: &bin_pdom,
            src_pdom: &src_pdom,
            bin_labels,
            src_labels,
            bin_controlled: &bin_controlled,
            src_controlled: &src_controlled,
            potential: &potential,
            fixed_points: &fixed_points,
            hom_order: cfg.hom_order,
        };
        let src_min_line = |n: NodeId| self.src_cf.block(n).and_then(|b| b.source()).map(|s| s.begin.line).unwrap_or(0);
        let map = run_stages_0_to_2(cfg, &inputs, bin_hfg.tfg.entry(), src_min_line)?;

        let mut hgm = HierarchicalGraphMap {
            loop_id_bin: bin_hfg.node_in_parent,
            loop_id_src: src_hfg.node_in_parent,
            map,
            skip: false,
            children: Vec::new(),
        };

        let mut matched_bin_headers: HashSet<NodeId> = HashSet::new();
        for (&sh, &bh) in &loop_match.matched {
            matched_bin_headers.insert(bh);
            let (Some(bin_child_idx), Some(src_child_idx)) =
                (bin_hfg.children.iter().position(|c| c.loop_id == Some(bh)), src_hfg.children.iter().position(|c| c.loop_id == Some(sh)))
            else {
                continue;
            };
            let mut bin_child = std::mem::replace(
                &mut bin_hfg.children[bin_child_idx],
                HierarchicalFlowGraph { loop_id: None, tfg: crate::region::TransformedFlowGraph::new(&self.bin_cf), node_in_parent: None, partner: None, skip: false, children: Vec::new() },
            );
            let mut src_child = std::mem::replace(
                &mut src_hfg.children[src_child_idx],
                HierarchicalFlowGraph { loop_id: None, tfg: crate::region::TransformedFlowGraph::new(&self.src_cf), node_in_parent: None, partner: None, skip: false, children: Vec::new() },
            );
            let child_hgm = self.build_level(cfg, &mut bin_child, &mut src_child, loop_match, bin_labels, src_labels, GraphMap::new(), insns, line_of_addr)?;
            check_hierarchy_preserved(&hgm.map, &child_hgm)?;
            hgm.children.push(child_hgm);
        }

        for child in &bin_hfg.children {
            let Some(h) = child.loop_id else { continue };
            if matched_bin_headers.contains(&h) {
                continue;
            }
            hgm.children.push(HierarchicalGraphMap {
                loop_id_bin: child.node_in_parent,
                loop_id_src: None,
                map: GraphMap::new(),
                skip: true,
                children: Vec::new(),
            });
        }

        Ok(hgm)
    }

    /// Flattens `hgm` and replaces any source value that is itself a
    /// reduced src-loop surrogate with that loop's original header id, per
    /// the flatten invariant in §8.
    fn flatten_resolving_surrogates(&self, hgm: &HierarchicalGraphMap, src_hfg: &HierarchicalFlowGraph<'_>) -> HashMap<NodeId, NodeId> {
        let mut header_of_surrogate: HashMap<NodeId, NodeId> = HashMap::new();
        collect_src_surrogates(src_hfg, &mut header_of_surrogate);

        hgm.flatten()
            .into_iter()
            .map(|(b, s)| (b, *header_of_surrogate.get(&s).unwrap_or(&s)))
            .collect()
    }
}

fn collect_src_surrogates(hfg: &HierarchicalFlowGraph<'_>, out: &mut HashMap<NodeId, NodeId>) {
    for region in hfg.tfg.regions.regions() {
        if let Transformation::ReducedLoop(t) = &region.transformation {
            out.insert(region.id, t.header);
        }
    }
    for child in &hfg.children {
        collect_src_surrogates(child, out);
    }
}
