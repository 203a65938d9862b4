//! Stage 1: Straight-Line Lumping.
//!
//! Grounded on §4.H Stage 1: an unmapped node sitting on a straight
//! single-predecessor/single-successor run gets folded into whichever
//! neighbor already has (or will get) a mapping, walked in reverse
//! pre-dominator preorder so downstream nodes resolve before the nodes
//! that feed them. Disabled by default (`maintain_order = false` callers
//! skip this stage entirely), matching the reference mapper's default.

use crate::dom::DominatorTree;
use crate::graph::{DiGraph, NodeId};
use crate::matching::GraphMap;

/// Runs one straight-line lumping pass over `g`, mutating `gm` in place.
/// `entry` identifies the current subgraph's entry node so loop headers
/// (whose only in-neighbor is the subgraph entry) are excluded from
/// folding, per spec.
pub fn lump_straight_line(g: &DiGraph, dom: &DominatorTree, entry: NodeId, gm: &mut GraphMap) {
    let mut order: Vec<NodeId> = g.nodes().filter(|&n| dom.contains(n)).collect();
    order.sort_by_key(|&n| std::cmp::Reverse(dom.preorder(n).unwrap_or(0)));

    for n in order {
        if gm.is_mapped(n) {
            continue;
        }
        if g.in_degree(n) != 1 || g.out_degree(n) != 1 {
            continue;
        }
        let pred = g.predecessors(n)[0];
        if pred == entry {
            continue; // loop header excluded
        }
        let succ = g.successors(n)[0];

        if let Some(s) = gm.get(succ) {
            gm.insert(n, s);
            continue;
        }
        if let Some(parent) = dom.parent_of(n) {
            if let Some(s) = gm.get(parent) {
                gm.insert(n, s);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(i: u32) -> NodeId {
        NodeId(i)
    }

    #[test]
    fn straight_line_node_adopts_its_mapped_successor() {
        let mut g = DiGraph::new();
        g.add_edge(n(0), n(1));
        g.add_edge(n(1), n(2));
        g.add_edge(n(2), n(3));
        let dom = DominatorTree::compute(&g, n(0));
        let mut gm = GraphMap::new();
        gm.insert(n(0), n(100));
        gm.insert(n(3), n(103));
        lump_straight_line(&g, &dom, n(0), &mut gm);
        assert_eq!(gm.get(n(2)), Some(n(103)));
        assert_eq!(gm.get(n(1)), Some(n(103)));
    }
}
