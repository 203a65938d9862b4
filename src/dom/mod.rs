//! Dominator / post-dominator trees with O(1) dominance queries and the
//! Chu (1991) nearest-common-dominator algorithm.
//!
//! Immediate dominators are computed with the Cooper-Harvey-Kennedy
//! iterative dataflow algorithm (simple, and easy to keep deterministic by
//! walking reverse-postorder) — grounded the same way the compiler's own
//! `DominatorTree::compute` walks reverse postorder to a fixed point. The
//! pre/last-descendant numbering and the NCD algorithm mirror the reference
//! mapper's `AbstractDominatorTree` exactly, since both the edge-case
//! behavior (single-node graphs) and the NCD bookkeeping are load-bearing
//! for the mapping pipeline above.

use crate::graph::{DiGraph, NodeId};
use std::collections::HashMap;

/// A pre- or post-dominator tree over a [`DiGraph`], rooted at `entry` (the
/// function entry for pre-dominance, the function exit for post-dominance
/// over the reversed graph).
#[derive(Debug, Clone)]
pub struct DominatorTree {
    root: NodeId,
    /// Tree edge `idom(n) -> n` for every `n != root`.
    idom: HashMap<NodeId, NodeId>,
    children: HashMap<NodeId, Vec<NodeId>>,
    num: HashMap<NodeId, u32>,
    las: HashMap<NodeId, u32>,
}

impl DominatorTree {
    /// Builds the dominator tree of `g` rooted at `entry`. `entry` must be a
    /// node of `g`; only nodes reachable from `entry` are considered.
    pub fn compute(g: &DiGraph, entry: NodeId) -> Self {
        let reach = g.reachable_from(entry);

        if reach.len() <= 1 {
            let mut num = HashMap::new();
            let mut las = HashMap::new();
            num.insert(entry, 0);
            las.insert(entry, 0);
            return DominatorTree {
                root: entry,
                idom: HashMap::new(),
                children: HashMap::new(),
                num,
                las,
            };
        }

        let numbering = g.dfs_preorder(entry);
        let rpo: Vec<NodeId> = numbering.order.clone();
        let rpo_index: HashMap<NodeId, usize> =
            rpo.iter().enumerate().map(|(i, &n)| (n, i)).collect();

        let mut idom: HashMap<NodeId, Option<NodeId>> = HashMap::new();
        for &n in &rpo {
            idom.insert(n, None);
        }
        idom.insert(entry, Some(entry));

        let mut changed = true;
        while changed {
            changed = false;
            for &b in &rpo {
                if b == entry {
                    continue;
                }
                let mut new_idom: Option<NodeId> = None;
                for &pred in g.predecessors(b) {
                    if !reach.contains(&pred) {
                        continue;
                    }
                    if idom.get(&pred).copied().flatten().is_some() || pred == entry {
                        new_idom = Some(match new_idom {
                            None => pred,
                            Some(cur) => intersect(cur, pred, &idom, &rpo_index),
                        });
                    }
                }
                if new_idom != idom[&b] {
                    idom.insert(b, new_idom);
                    changed = true;
                }
            }
        }

        let mut final_idom = HashMap::new();
        for (&n, &d) in &idom {
            if n != entry {
                if let Some(d) = d {
                    final_idom.insert(n, d);
                }
            }
        }

        let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for (&n, &d) in &final_idom {
            children.entry(d).or_default().push(n);
        }
        for ch in children.values_mut() {
            ch.sort_by_key(|n| n.as_u32());
        }

        let (num, las) = number_tree(entry, &children);

        DominatorTree {
            root: entry,
            idom: final_idom,
            children,
            num,
            las,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn parent_of(&self, n: NodeId) -> Option<NodeId> {
        self.idom.get(&n).copied()
    }

    pub fn children_of(&self, n: NodeId) -> &[NodeId] {
        self.children.get(&n).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn preorder(&self, n: NodeId) -> Option<u32> {
        self.num.get(&n).copied()
    }

    /// `a dom b` in O(1): `num[a] <= num[b] <= las[a]`.
    pub fn dominates(&self, a: NodeId, b: NodeId) -> bool {
        match (self.num.get(&a), self.num.get(&b), self.las.get(&a)) {
            (Some(&na), Some(&nb), Some(&la)) => na <= nb && nb <= la,
            _ => false,
        }
    }

    pub fn contains(&self, n: NodeId) -> bool {
        self.num.contains_key(&n)
    }

    /// Nearest common dominator of `nodes`, per Chu (1991), operating over
    /// this tree's parent pointers. If `nodes.len() == 1` and `!strict`,
    /// returns that node (self-domination); `strict` is not supported, per
    /// the reference implementation.
    pub fn nearest_common_dominator(&self, nodes: &[NodeId], strict: bool) -> NodeId {
        assert!(!nodes.is_empty(), "nearest_common_dominator: empty node set");
        if nodes.len() == 1 {
            if strict {
                panic!("strict nearest_common_dominator is not supported");
            }
            return nodes[0];
        }

        let mut visited_node: HashMap<NodeId, bool> = HashMap::new();
        let mut reentered_node: HashMap<NodeId, bool> = HashMap::new();
        // Arc (parent(child), child) visited-ness, keyed by child (each node
        // has at most one tree-parent arc).
        let mut visited_arc: HashMap<NodeId, bool> = HashMap::new();

        let make_stack = |n: NodeId,
                           visited_node: &mut HashMap<NodeId, bool>,
                           reentered_node: &mut HashMap<NodeId, bool>|
         -> Vec<NodeId> {
            visited_node.insert(n, true);
            reentered_node.insert(n, true);
            vec![n]
        };

        let mut stacks: Vec<Vec<NodeId>> = nodes
            .iter()
            .map(|&u| make_stack(u, &mut visited_node, &mut reentered_node))
            .collect();

        loop {
            loop {
                let nonempty = stacks.iter().filter(|s| !s.is_empty()).count();
                if nonempty <= 1 {
                    break;
                }
                for st in stacks.iter_mut() {
                    if st.is_empty() {
                        continue;
                    }
                    let top = *st.last().unwrap();
                    if top == self.root {
                        continue;
                    }
                    loop {
                        let Some(&w) = st.last() else { break };
                        let arc_visited = *visited_arc.get(&w).unwrap_or(&false);
                        if arc_visited {
                            st.pop();
                            continue;
                        }
                        let u = self.idom[&w];
                        visited_arc.insert(w, true);
                        if !*visited_node.get(&u).unwrap_or(&false) {
                            visited_node.insert(u, true);
                            st.push(u);
                        } else {
                            reentered_node.insert(u, true);
                            visited_node.insert(u, true);
                        }
                        break;
                    }
                }
            }

            let nonempty_idx: Vec<usize> = stacks
                .iter()
                .enumerate()
                .filter(|(_, s)| !s.is_empty())
                .map(|(i, _)| i)
                .collect();
            if nonempty_idx.is_empty() {
                break;
            }
            assert_eq!(nonempty_idx.len(), 1, "NCD: expected exactly one live stack");
            let idx = nonempty_idx[0];
            let stack = std::mem::take(&mut stacks[idx]);

            let mut pos_topmost_re = None;
            for (rpos, &el) in stack.iter().rev().enumerate() {
                if *reentered_node.get(&el).unwrap_or(&false) {
                    pos_topmost_re = Some(rpos);
                    break;
                }
            }
            let pos_topmost_re =
                pos_topmost_re.expect("NCD: no re-entered node on the surviving stack");
            let len = stack.len();
            let start_idx = len - pos_topmost_re - 1;
            let topmost_re = stack[start_idx];

            let mut below: Option<NodeId> = None;
            for &v in &stack[start_idx..] {
                if v != topmost_re {
                    visited_node.insert(v, false);
                }
                if let Some(b) = below {
                    visited_arc.insert(b, false);
                }
                below = Some(v);
            }
            let kept = &stack[..=start_idx];
            for &n in kept {
                stacks.push(make_stack(n, &mut visited_node, &mut reentered_node));
            }

            let nonempty_after = stacks.iter().filter(|s| !s.is_empty()).count();
            if nonempty_after <= 1 {
                break;
            }
        }

        let mut remaining: Vec<&Vec<NodeId>> = stacks.iter().filter(|s| !s.is_empty()).collect();
        if remaining.is_empty() {
            log::warn!("nearest_common_dominator: no common dominator found, returning root");
            return self.root;
        }
        let stack = remaining.pop().unwrap();
        assert_eq!(stack.len(), 1, "NCD: surviving stack must have a single element");
        stack[0]
    }
}

/// Intersect two dominator-path nodes by walking toward the root via
/// reverse-postorder comparison, a la Cooper/Harvey/Kennedy.
fn intersect(
    mut a: NodeId,
    mut b: NodeId,
    idom: &HashMap<NodeId, Option<NodeId>>,
    rpo_index: &HashMap<NodeId, usize>,
) -> NodeId {
    while a != b {
        while rpo_index[&a] > rpo_index[&b] {
            a = idom[&a].expect("intersect: walked off the dominator chain");
        }
        while rpo_index[&b] > rpo_index[&a] {
            b = idom[&b].expect("intersect: walked off the dominator chain");
        }
    }
    a
}

/// Recursive-DFS preorder/last-descendant numbering of a tree given as a
/// `parent -> children` adjacency map.
fn number_tree(
    root: NodeId,
    children: &HashMap<NodeId, Vec<NodeId>>,
) -> (HashMap<NodeId, u32>, HashMap<NodeId, u32>) {
    let mut num = HashMap::new();
    let mut las = HashMap::new();
    let mut counter = 0u32;

    enum Frame {
        Enter(NodeId),
        Leave(NodeId),
    }
    let mut stack = vec![Frame::Enter(root)];
    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Enter(n) => {
                num.insert(n, counter);
                counter += 1;
                stack.push(Frame::Leave(n));
                if let Some(ch) = children.get(&n) {
                    for &c in ch.iter().rev() {
                        stack.push(Frame::Enter(c));
                    }
                }
            }
            Frame::Leave(n) => {
                las.insert(n, counter - 1);
            }
        }
    }
    (num, las)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(i: u32) -> NodeId {
        NodeId(i)
    }

    fn diamond() -> DiGraph {
        // E -> B -> {C, D} -> M
        let mut g = DiGraph::new();
        g.add_edge(n(0), n(1));
        g.add_edge(n(1), n(2));
        g.add_edge(n(1), n(3));
        g.add_edge(n(2), n(4));
        g.add_edge(n(3), n(4));
        g
    }

    #[test]
    fn single_node_graph() {
        let mut g = DiGraph::new();
        g.add_node(n(0));
        let dt = DominatorTree::compute(&g, n(0));
        assert_eq!(dt.preorder(n(0)), Some(0));
        assert!(dt.dominates(n(0), n(0)));
    }

    #[test]
    fn diamond_dominance() {
        let g = diamond();
        let dt = DominatorTree::compute(&g, n(0));
        assert!(dt.dominates(n(1), n(4)));
        assert!(!dt.dominates(n(2), n(3)));
        assert!(dt.dominates(n(0), n(4)));
        assert_eq!(dt.parent_of(n(4)), Some(n(1)));
    }

    #[test]
    fn dominance_is_transitive_and_antisymmetric() {
        let g = diamond();
        let dt = DominatorTree::compute(&g, n(0));
        for a in g.nodes() {
            for b in g.nodes() {
                for c in g.nodes() {
                    if dt.dominates(a, b) && dt.dominates(b, c) {
                        assert!(dt.dominates(a, c));
                    }
                    if dt.dominates(a, b) && dt.dominates(b, a) {
                        assert_eq!(a, b);
                    }
                }
            }
        }
    }

    #[test]
    fn ncd_of_diamond_branches_is_the_branch_point() {
        let g = diamond();
        let dt = DominatorTree::compute(&g, n(0));
        assert_eq!(dt.nearest_common_dominator(&[n(2), n(3)], false), n(1));
        assert_eq!(dt.nearest_common_dominator(&[n(1), n(4)], false), n(1));
        assert_eq!(dt.nearest_common_dominator(&[n(2)], false), n(2));
    }

    #[test]
    fn ncd_is_always_a_common_dominator_and_minimal() {
        let mut g = DiGraph::new();
        // E -> A -> B -> {C, D} -> M, plus A -> M directly (extra edge)
        g.add_edge(n(0), n(1));
        g.add_edge(n(1), n(2));
        g.add_edge(n(2), n(3));
        g.add_edge(n(2), n(4));
        g.add_edge(n(3), n(5));
        g.add_edge(n(4), n(5));
        let dt = DominatorTree::compute(&g, n(0));
        let ncd = dt.nearest_common_dominator(&[n(3), n(4)], false);
        assert!(dt.dominates(ncd, n(3)));
        assert!(dt.dominates(ncd, n(4)));
        assert_eq!(ncd, n(2));
    }

    #[test]
    fn post_dominator_tree_via_reversed_graph() {
        let g = diamond();
        let pdt = DominatorTree::compute(&g.reverse(), n(4));
        assert!(pdt.dominates(n(1), n(0)) || n(1) == n(0)); // M..B post-dominate E through the diamond
        assert!(pdt.dominates(n(4), n(2)));
        assert!(pdt.dominates(n(4), n(3)));
    }
}
