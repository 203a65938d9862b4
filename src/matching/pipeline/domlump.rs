//! Stage 2: Dominator Lumping — completes the map.
//!
//! Grounded on §4.H Stage 2: a simple-path pass identical to straight-line
//! lumping but without the "maintain order" restriction (always runs),
//! followed by a generic pass that folds many-in/one-out merge points
//! downward when their successor is already fixed, then assigns every
//! still-unmapped node its pre-dominator-tree parent's mapping. Every node
//! must end mapped; failing that is a pipeline assertion failure.

use crate::dom::DominatorTree;
use crate::graph::{DiGraph, NodeId};
use crate::matching::pipeline::linelump::lump_straight_line;
use crate::matching::{GraphMap, MappingError};

pub fn lump_dominators(g: &DiGraph, dom: &DominatorTree, entry: NodeId, gm: &mut GraphMap) -> Result<(), MappingError> {
    lump_straight_line(g, dom, entry, gm);

    // Generic pass: (many-in, one-out) nodes merge downward if their
    // successor is already mapped.
    let mut order: Vec<NodeId> = g.nodes().filter(|&n| dom.contains(n)).collect();
    order.sort_by_key(|&n| std::cmp::Reverse(dom.preorder(n).unwrap_or(0)));
    for &n in &order {
        if gm.is_mapped(n) {
            continue;
        }
        if g.in_degree(n) > 1 && g.out_degree(n) == 1 {
            let succ = g.successors(n)[0];
            if let Some(s) = gm.get(succ) {
                gm.insert(n, s);
            }
        }
    }

    // Remaining unmapped nodes union with their pre-dom parent's current
    // representative.
    for &n in &order {
        if gm.is_mapped(n) {
            continue;
        }
        let mut cur = dom.parent_of(n);
        while let Some(p) = cur {
            if let Some(s) = gm.get(p) {
                gm.insert(n, s);
                break;
            }
            cur = dom.parent_of(p);
        }
    }

    let unmapped: Vec<NodeId> = g.nodes().filter(|&n| !gm.is_mapped(n)).collect();
    if let Some(&n) = unmapped.first() {
        return Err(MappingError::AssertionFailed(format!("node {n} left unmapped after dominator lumping")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(i: u32) -> NodeId {
        NodeId(i)
    }

    #[test]
    fn merge_point_adopts_its_mapped_successor() {
        let mut g = DiGraph::new();
        g.add_edge(n(0), n(1));
        g.add_edge(n(0), n(2));
        g.add_edge(n(1), n(3));
        g.add_edge(n(2), n(3));
        g.add_edge(n(3), n(4));
        let dom = DominatorTree::compute(&g, n(0));
        let mut gm = GraphMap::new();
        gm.insert(n(0), n(200));
        gm.insert(n(1), n(201));
        gm.insert(n(2), n(202));
        gm.insert(n(4), n(204));
        lump_dominators(&g, &dom, n(0), &mut gm).unwrap();
        assert!(gm.is_mapped(n(3)));
    }
}
