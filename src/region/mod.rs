//! Loop-to-surrogate reduction: [`Region`], [`RegionCollection`],
//! [`TransformedFlowGraph`] and the [`HierarchicalFlowGraph`] tree built on
//! top of it.
//!
//! Grounded on the reference mapper's hierarchical-flow-graph construction
//! (`flow/region.py`/`flow/hierarchy.py` as summarized by the mapping
//! pipeline doc): every reduction is modeled as a tagged
//! [`Transformation`] rather than a subclass, regions and HFGs only ever
//! reference each other by id (never an owning pointer), and reduction
//! always proceeds innermost-loop-first so a region's body can itself
//! already contain surrogate ids from loops nested inside it.

use crate::cfg::ControlFlow;
use crate::dom::DominatorTree;
use crate::graph::{DiGraph, NodeId};
use crate::loops::LoopTree;
use std::collections::{HashMap, HashSet};

/// What a region's id stands for, relative to the original `ControlFlow`.
#[derive(Debug, Clone)]
pub enum Transformation {
    /// A singleton region: `id` is an original node, untouched.
    Identity,
    /// `id` replaces an entire reduced loop body.
    ReducedLoop(ReducedLoopTransf),
    /// `id` replaces a set of nodes collapsed while reducing to a connected
    /// subgraph (straight-line lumping operates on the mapping layer, not
    /// here, but `reduce_to_connected_subgraph` uses this to record what it
    /// dropped).
    MergedNodes(Vec<NodeId>),
}

#[derive(Debug, Clone)]
pub struct ReducedLoopTransf {
    pub header: NodeId,
    pub level: u32,
    pub parentloop: Option<NodeId>,
    pub exit_edges: Vec<(NodeId, NodeId)>,
}

/// A node-id range plus the subgraph it stands for in the *original*
/// numbering, and the transformation that produced it.
#[derive(Debug, Clone)]
pub struct Region {
    pub id: NodeId,
    /// Original (pre-reduction) node ids folded into this region.
    pub members: HashSet<NodeId>,
    /// The induced subgraph on `members`, captured at reduction time.
    pub subgraph: DiGraph,
    pub transformation: Transformation,
}

/// Owns every [`Region`] ever created while reducing one [`TransformedFlowGraph`].
#[derive(Debug, Clone, Default)]
pub struct RegionCollection {
    regions: HashMap<NodeId, Region>,
}

impl RegionCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, region: Region) {
        self.regions.insert(region.id, region);
    }

    pub fn get(&self, id: NodeId) -> Option<&Region> {
        self.regions.get(&id)
    }

    /// Original members of `id`, or `{id}` itself if it was never reduced
    /// (a plain original node).
    pub fn members_of(&self, id: NodeId) -> HashSet<NodeId> {
        match self.regions.get(&id) {
            Some(r) => r.members.clone(),
            None => std::iter::once(id).collect(),
        }
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }
}

/// A `ControlFlow` after zero or more loop reductions, plus the bookkeeping
/// needed to map back to the original graph.
pub struct TransformedFlowGraph<'a> {
    pub original: &'a ControlFlow,
    graph: DiGraph,
    pub regions: RegionCollection,
    /// Partitions original node ids (`<= max_id`) from surrogate ids
    /// (`> max_id`).
    max_id: u32,
    next_surrogate: u32,
    entry: NodeId,
    exit: Option<NodeId>,
    dom_cache: Option<DominatorTree>,
}

impl<'a> TransformedFlowGraph<'a> {
    pub fn new(original: &'a ControlFlow) -> Self {
        let max_id = original.max_id();
        TransformedFlowGraph {
            original,
            graph: original.graph().clone(),
            regions: RegionCollection::new(),
            max_id,
            next_surrogate: max_id + 1,
            entry: original.entry_id(),
            exit: original.exit_id(),
            dom_cache: None,
        }
    }

    pub fn graph(&self) -> &DiGraph {
        &self.graph
    }

    pub fn entry(&self) -> NodeId {
        self.entry
    }

    pub fn exit(&self) -> Option<NodeId> {
        self.exit
    }

    pub fn is_surrogate(&self, n: NodeId) -> bool {
        n.as_u32() > self.max_id
    }

    /// Lazily computed and cached; invalidated by every reduction.
    pub fn dominators(&mut self) -> &DominatorTree {
        if self.dom_cache.is_none() {
            self.dom_cache = Some(DominatorTree::compute(&self.graph, self.entry));
        }
        self.dom_cache.as_ref().unwrap()
    }

    fn invalidate_dominators(&mut self) {
        self.dom_cache = None;
    }

    fn fresh_surrogate(&mut self) -> NodeId {
        let id = NodeId(self.next_surrogate);
        self.next_surrogate += 1;
        id
    }

    /// Reduces one loop with header `h` and body `body` (both already
    /// translated through any previously assigned surrogate ids) to a
    /// single fresh region node. Returns the new surrogate id.
    pub fn reduce_loop(&mut self, h: NodeId, body: &HashSet<NodeId>, level: u32, parentloop: Option<NodeId>) -> NodeId {
        let mut members: HashSet<NodeId> = body.clone();
        members.insert(h);

        let back_edges: HashSet<(NodeId, NodeId)> = members
            .iter()
            .flat_map(|&u| self.graph.successors(u).iter().map(move |&v| (u, v)))
            .filter(|&(_, v)| v == h)
            .collect();

        let entry_edges: Vec<(NodeId, NodeId)> = self
            .graph
            .predecessors(h)
            .iter()
            .map(|&p| (p, h))
            .filter(|e| !back_edges.contains(e))
            .collect();

        let exit_edges: Vec<(NodeId, NodeId)> = members
            .iter()
            .flat_map(|&u| self.graph.successors(u).iter().map(move |&v| (u, v)))
            .filter(|(_, v)| !members.contains(v))
            .collect();

        let subgraph = self.graph.subgraph(&members);
        let r = self.fresh_surrogate();

        self.regions.insert(Region {
            id: r,
            members: members.iter().flat_map(|&m| self.regions.members_of(m)).collect(),
            subgraph,
            transformation: Transformation::ReducedLoop(ReducedLoopTransf {
                header: h,
                level,
                parentloop,
                exit_edges: exit_edges.clone(),
            }),
        });

        for &m in &members {
            self.graph.remove_node(m);
        }
        self.graph.add_node(r);
        for (p, _) in &entry_edges {
            self.graph.add_edge(*p, r);
        }
        for (_, v) in &exit_edges {
            self.graph.add_edge(r, *v);
        }

        self.invalidate_dominators();
        r
    }

    /// Reduces every loop in `loops`, innermost first, tagging each
    /// reduction with its nesting level and (if its loop-tree parent is
    /// itself a header) that parent's *original* header id. Returns a map
    /// from original loop header to the surrogate id it was reduced to.
    pub fn reduce_all(&mut self, loops: &LoopTree) -> HashMap<NodeId, NodeId> {
        let mut header_to_surrogate: HashMap<NodeId, NodeId> = HashMap::new();
        let mut innermost_first = loops.preorder_headers();
        innermost_first.reverse();

        for h in innermost_first {
            let info = loops.header(h).expect("preorder_headers only yields headers");
            let level = info.level;
            let parentloop = loops.parent_header(h);
            let translated_body: HashSet<NodeId> = info
                .body
                .iter()
                .map(|&n| *header_to_surrogate.get(&n).unwrap_or(&n))
                .collect();
            let translated_h = *header_to_surrogate.get(&h).unwrap_or(&h);
            let r = self.reduce_loop(translated_h, &translated_body, level, parentloop);
            header_to_surrogate.insert(h, r);
        }
        header_to_surrogate
    }

    /// Removes every node not in `keep ∪ {entry, exit}`, splicing direct
    /// edges from each removed node's predecessors to its successors so
    /// reachability through it is preserved.
    pub fn reduce_to_connected_subgraph(&mut self, keep: &HashSet<NodeId>) {
        let mut protect = keep.clone();
        protect.insert(self.entry);
        if let Some(e) = self.exit {
            protect.insert(e);
        }
        let doomed: Vec<NodeId> = self.graph.nodes().filter(|n| !protect.contains(n)).collect();
        for n in doomed {
            let preds: Vec<NodeId> = self.graph.predecessors(n).to_vec();
            let succs: Vec<NodeId> = self.graph.successors(n).to_vec();
            self.graph.remove_node(n);
            for &p in &preds {
                for &s in &succs {
                    if p != n && s != n {
                        self.graph.add_edge(p, s);
                    }
                }
            }
        }
        self.invalidate_dominators();
    }
}

/// One node of the hierarchical flow graph: owns the TFG for one loop (or
/// the condensed top level), plus child HFGs for loops nested directly
/// inside it.
pub struct HierarchicalFlowGraph<'a> {
    pub loop_id: Option<NodeId>,
    pub tfg: TransformedFlowGraph<'a>,
    /// The surrogate id this HFG occupies inside its parent's TFG; `None`
    /// for the top-level HFG.
    pub node_in_parent: Option<NodeId>,
    /// Set once this HFG has been paired with a binary/source counterpart
    /// by the loop matcher.
    pub partner: Option<usize>,
    /// True when this binary subflow was not matched to any source loop
    /// (or vice versa) and must be completed via skip annotations.
    pub skip: bool,
    pub children: Vec<HierarchicalFlowGraph<'a>>,
}

impl<'a> HierarchicalFlowGraph<'a> {
    pub fn top_level(original: &'a ControlFlow, loops: &LoopTree) -> Self {
        let mut tfg = TransformedFlowGraph::new(original);
        let header_to_surrogate = tfg.reduce_all(loops);
        let mut by_level: Vec<(u32, NodeId)> =
            loops.headers().map(|h| (h.level, h.header)).collect();
        by_level.sort_by_key(|&(lvl, h)| (lvl, h.as_u32()));

        let mut nodes: HashMap<NodeId, HierarchicalFlowGraph<'a>> = HashMap::new();
        for (_, h) in by_level.iter().rev() {
            let surrogate = header_to_surrogate[h];
            let region = tfg.regions.get(surrogate).expect("reduced region must exist");
            let body_graph = region.subgraph.clone();
            let loop_tfg = TransformedFlowGraph {
                original,
                graph: body_graph,
                regions: RegionCollection::new(),
                max_id: tfg.max_id,
                next_surrogate: tfg.next_surrogate,
                entry: *h,
                exit: None,
                dom_cache: None,
            };
            let mut hfg = HierarchicalFlowGraph {
                loop_id: Some(*h),
                tfg: loop_tfg,
                node_in_parent: Some(surrogate),
                partner: None,
                skip: false,
                children: Vec::new(),
            };
            // Adopt any already-built inner HFGs whose node_in_parent lies
            // within this loop's body.
            let mut adopted = Vec::new();
            for &child_h in nodes.keys() {
                if region.members.contains(&child_h) {
                    adopted.push(child_h);
                }
            }
            for child_h in adopted {
                if let Some(child_hfg) = nodes.remove(&child_h) {
                    hfg.children.push(child_hfg);
                }
            }
            hfg.children.sort_by_key(|c| c.loop_id.map(|n| n.as_u32()).unwrap_or(0));
            nodes.insert(*h, hfg);
        }

        let mut top = HierarchicalFlowGraph {
            loop_id: None,
            tfg,
            node_in_parent: None,
            partner: None,
            skip: false,
            children: Vec::new(),
        };
        let mut remaining: Vec<HierarchicalFlowGraph<'a>> = nodes.into_values().collect();
        remaining.sort_by_key(|h| h.loop_id.map(|n| n.as_u32()).unwrap_or(0));
        top.children = remaining;
        top
    }

    pub fn find_child(&self, loop_header: NodeId) -> Option<&HierarchicalFlowGraph<'a>> {
        self.children.iter().find(|c| c.loop_id == Some(loop_header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{BasicBlock, BinaryBlockData, BlockData, BlockKind};
    use crate::loops::analyze_loops;

    fn bin_block(id: u32, kind: BlockKind) -> BasicBlock {
        BasicBlock {
            id: NodeId(id),
            kind,
            calls: Vec::new(),
            data: BlockData::Binary(BinaryBlockData { addr_ranges: Vec::new(), cycle_cost: None }),
        }
    }

    fn loop_cf() -> ControlFlow {
        let mut cf = ControlFlow::new("f", NodeId(0), Some(NodeId(4)));
        cf.add_block(bin_block(0, BlockKind::Entry));
        cf.add_block(bin_block(1, BlockKind::Normal)); // loop header
        cf.add_block(bin_block(2, BlockKind::Normal)); // loop body
        cf.add_block(bin_block(3, BlockKind::Normal)); // after loop
        cf.add_block(bin_block(4, BlockKind::Exit));
        cf.add_edge(NodeId(0), NodeId(1));
        cf.add_edge(NodeId(1), NodeId(2));
        cf.add_edge(NodeId(2), NodeId(1));
        cf.add_edge(NodeId(1), NodeId(3));
        cf.add_edge(NodeId(3), NodeId(4));
        cf
    }

    #[test]
    fn reduce_loop_collapses_body_to_one_surrogate() {
        let cf = loop_cf();
        let loops = analyze_loops(cf.graph(), cf.entry_id());
        let mut tfg = TransformedFlowGraph::new(&cf);
        let map = tfg.reduce_all(&loops);
        let surrogate = map[&NodeId(1)];
        assert!(tfg.is_surrogate(surrogate));
        assert!(!tfg.graph().has_node(NodeId(1)));
        assert!(!tfg.graph().has_node(NodeId(2)));
        assert!(tfg.graph().has_node(surrogate));
        assert_eq!(tfg.graph().predecessors(surrogate), &[NodeId(0)]);
        assert_eq!(tfg.graph().successors(surrogate), &[NodeId(3)]);
    }

    #[test]
    fn hierarchy_assembles_one_child_for_the_loop() {
        let cf = loop_cf();
        let loops = analyze_loops(cf.graph(), cf.entry_id());
        let top = HierarchicalFlowGraph::top_level(&cf, &loops);
        assert_eq!(top.children.len(), 1);
        assert_eq!(top.children[0].loop_id, Some(NodeId(1)));
        assert!(top.children[0].tfg.graph().has_node(NodeId(2)));
    }

    #[test]
    fn reduce_to_connected_subgraph_splices_around_dropped_nodes() {
        let mut cf = ControlFlow::new("f", NodeId(0), Some(NodeId(3)));
        cf.add_block(bin_block(0, BlockKind::Entry));
        cf.add_block(bin_block(1, BlockKind::Normal));
        cf.add_block(bin_block(2, BlockKind::Normal));
        cf.add_block(bin_block(3, BlockKind::Exit));
        cf.add_edge(NodeId(0), NodeId(1));
        cf.add_edge(NodeId(1), NodeId(2));
        cf.add_edge(NodeId(2), NodeId(3));
        let mut tfg = TransformedFlowGraph::new(&cf);
        let keep: HashSet<NodeId> = [NodeId(2)].into_iter().collect();
        tfg.reduce_to_connected_subgraph(&keep);
        assert!(!tfg.graph().has_node(NodeId(1)));
        assert_eq!(tfg.graph().successors(NodeId(0)), &[NodeId(2)]);
    }
}
