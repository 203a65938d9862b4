//! Stage 0: the Control-Dependency Mapper.
//!
//! Grounded on §4.H Stage 0 of the mapping specification: a node's "ctrl
//! signature" is the set of decision-edge labels on the edges that control
//! it, and nodes with matching signatures on both sides are mapped to each
//! other. This is the cheaper of the two interchangeable per-subgraph
//! mappers (the other being [`super::homomorphism`]); `--mapper` selects
//! between them.

use crate::dom::DominatorTree;
use crate::graph::{DiGraph, NodeId};
use crate::matching::{EdgeLabel, GraphMap};
use std::collections::{BTreeSet, HashMap, HashSet};

/// `controlled node -> {controlling (u, v) edges}`.
pub fn compute_control_dependence(g: &DiGraph, pdom: &DominatorTree) -> HashMap<NodeId, HashSet<(NodeId, NodeId)>> {
    let mut controlled: HashMap<NodeId, HashSet<(NodeId, NodeId)>> = HashMap::new();
    for (u, v) in g.edges() {
        if !pdom.contains(v) || !pdom.contains(u) {
            continue;
        }
        if pdom.dominates(v, u) {
            continue; // v postdominates u: edge is not a control-dependence edge
        }
        let l = pdom.nearest_common_dominator(&[v, u], false);
        let mut x = v;
        while x != l {
            controlled.entry(x).or_default().insert((u, v));
            let Some(parent) = pdom.parent_of(x) else { break };
            x = parent;
        }
        if l == u {
            controlled.entry(l).or_default().insert((u, v));
        }
    }
    controlled
}

/// Frozen set of labels on `node`'s controlling edges, excluding the
/// self-dependence a loop header picks up from its own back edge.
pub fn ctrl_signature(
    controlled: &HashMap<NodeId, HashSet<(NodeId, NodeId)>>,
    labels: &HashMap<(NodeId, NodeId), EdgeLabel>,
    node: NodeId,
) -> BTreeSet<EdgeLabel> {
    controlled
        .get(&node)
        .into_iter()
        .flatten()
        .filter(|&&(u, _v)| u != node)
        .filter_map(|e| labels.get(e).copied())
        .collect()
}

/// Maps every binary node (restricted to `bin_nodes`) to a source node
/// sharing its ctrl signature, skipping virtual/sentinel source nodes
/// (`begin.line == 0`). Several bin nodes commonly share the same
/// signature — most often the empty one, shared by entry, exit, and every
/// node not dependent on any decision — so candidates within a signature
/// are consumed positionally (both sides walked in ascending id order)
/// rather than every bin node in the group collapsing onto a single first
/// candidate.
pub fn map_via_ctrl_dep(
    bin_nodes: impl Iterator<Item = NodeId>,
    src_nodes: impl Iterator<Item = NodeId>,
    bin_controlled: &HashMap<NodeId, HashSet<(NodeId, NodeId)>>,
    src_controlled: &HashMap<NodeId, HashSet<(NodeId, NodeId)>>,
    bin_labels: &HashMap<(NodeId, NodeId), EdgeLabel>,
    src_labels: &HashMap<(NodeId, NodeId), EdgeLabel>,
    src_min_line: impl Fn(NodeId) -> u32,
) -> GraphMap {
    let mut by_signature: HashMap<BTreeSet<EdgeLabel>, Vec<NodeId>> = HashMap::new();
    let mut ordered_src: Vec<NodeId> = src_nodes.collect();
    ordered_src.sort_by_key(|n| n.as_u32());
    for s in ordered_src {
        if src_min_line(s) == 0 {
            continue;
        }
        let sig = ctrl_signature(src_controlled, src_labels, s);
        by_signature.entry(sig).or_default().push(s);
    }

    let mut gm = GraphMap::new();
    let mut cursor: HashMap<BTreeSet<EdgeLabel>, usize> = HashMap::new();
    let mut ordered_bin: Vec<NodeId> = bin_nodes.collect();
    ordered_bin.sort_by_key(|n| n.as_u32());
    for b in ordered_bin {
        let sig = ctrl_signature(bin_controlled, bin_labels, b);
        let Some(candidates) = by_signature.get(&sig) else { continue };
        let idx = cursor.entry(sig).or_insert(0);
        if let Some(&s) = candidates.get(*idx) {
            gm.insert(b, s);
            *idx += 1;
        }
    }
    gm
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(i: u32) -> NodeId {
        NodeId(i)
    }

    #[test]
    fn diamond_control_dependence_controls_each_branch_target() {
        let mut g = DiGraph::new();
        g.add_edge(n(0), n(1)); // E -> B
        g.add_edge(n(1), n(2)); // B -> C
        g.add_edge(n(1), n(3)); // B -> D
        g.add_edge(n(2), n(4)); // C -> M
        g.add_edge(n(3), n(4)); // D -> M
        let rev = g.reverse();
        let pdom = DominatorTree::compute(&rev, n(4));
        let controlled = compute_control_dependence(&g, &pdom);
        assert!(controlled.get(&n(2)).map(|s| s.contains(&(n(1), n(2)))).unwrap_or(false));
        assert!(controlled.get(&n(3)).map(|s| s.contains(&(n(1), n(3)))).unwrap_or(false));
        assert!(!controlled.contains_key(&n(4)));
    }
}
