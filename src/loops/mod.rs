//! Havlak loop nesting analysis: reducible / irreducible / self-loop
//! classification, loop bodies, back-edges, exit-edges and the resulting
//! loop forest.
//!
//! This is a direct port of Havlak's "Nesting of Reducible and Irreducible
//! Loops" union-find construction, grounded on the reference mapper's
//! `flow/loop_analysis.py` (`analyze_loops` / `LoopInfo`): same DFS-tree
//! back/non-back predecessor split, same reverse-preorder sweep with a
//! union-find body accumulation, same `header[node]` attribution used to
//! build the forest. One deliberate deviation: the reference's
//! `_note_preorder_number` passes its counter by value across recursive
//! calls, so sibling subtrees silently collide on the same number — not
//! in the documented list of inherited quirks to preserve, and it would
//! break the stated "preorder reversed gives a postorder" invariant, so
//! this port uses a real monotonic counter instead.

use crate::graph::{DiGraph, NodeId};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Reducible,
    Irreducible,
    SelfLoop,
}

/// One loop header's nesting record.
#[derive(Debug, Clone)]
pub struct LoopHeader {
    pub header: NodeId,
    pub kind: LoopKind,
    /// Tails of back-edges into this header (includes `header` itself for a
    /// self-loop).
    pub back_preds: Vec<NodeId>,
    /// Direct body nodes that are not themselves headers of a nested loop.
    pub nonheader: Vec<NodeId>,
    /// Nested loop headers directly inside this loop.
    pub children: Vec<NodeId>,
    /// `nonheader ∪ children` — the immediate body, one level deep.
    pub body: HashSet<NodeId>,
    /// Edges leaving the loop body (including the header and its
    /// non-header members), computed after the forest is built.
    pub exit_edges: Vec<(NodeId, NodeId)>,
    /// 0 for an outermost loop.
    pub level: u32,
}

/// The loop forest of one `ControlFlow`-like digraph, rooted at a synthetic
/// node collecting all non-header nodes.
#[derive(Debug, Clone)]
pub struct LoopTree {
    headers: HashMap<NodeId, LoopHeader>,
    /// Innermost enclosing loop header for every node that is inside a
    /// loop. Absent entries mean "directly under the root".
    header_of: HashMap<NodeId, NodeId>,
    root_children: Vec<NodeId>,
    preorder: HashMap<Option<NodeId>, u32>,
}

impl LoopTree {
    pub fn is_loop_header(&self, n: NodeId) -> bool {
        self.headers.contains_key(&n)
    }

    pub fn header(&self, n: NodeId) -> Option<&LoopHeader> {
        self.headers.get(&n)
    }

    pub fn headers(&self) -> impl Iterator<Item = &LoopHeader> {
        self.headers.values()
    }

    pub fn root_children(&self) -> &[NodeId] {
        &self.root_children
    }

    /// The innermost loop header enclosing `n`, or `None` if `n` is not
    /// inside any loop (it hangs directly off the root).
    pub fn enclosing_header(&self, n: NodeId) -> Option<NodeId> {
        self.header_of.get(&n).copied()
    }

    pub fn parent_header(&self, header: NodeId) -> Option<NodeId> {
        self.headers.get(&header).and_then(|_| self.header_of.get(&header).copied())
    }

    /// Nesting level of a header: 0 for outermost.
    pub fn level_of(&self, header: NodeId) -> u32 {
        self.headers.get(&header).map(|h| h.level).unwrap_or(0)
    }

    pub fn preorder_of(&self, header: Option<NodeId>) -> u32 {
        self.preorder.get(&header).copied().unwrap_or(0)
    }

    pub fn any_irreducible(&self) -> bool {
        self.headers.values().any(|h| h.kind == LoopKind::Irreducible)
    }

    /// Loop headers ordered outermost-first (root-level first), each level
    /// before its children — the order region reduction wants reversed
    /// (innermost first).
    pub fn preorder_headers(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        fn walk(tree: &LoopTree, roots: &[NodeId], out: &mut Vec<NodeId>) {
            let mut roots = roots.to_vec();
            roots.sort_by_key(|n| n.as_u32());
            for &h in &roots {
                out.push(h);
                if let Some(hdr) = tree.headers.get(&h) {
                    walk(tree, &hdr.children, out);
                }
            }
        }
        walk(self, &self.root_children, &mut out);
        out
    }
}

struct UnionFind {
    sets: HashMap<NodeId, Vec<NodeId>>,
    lookup: HashMap<NodeId, NodeId>,
}

impl UnionFind {
    fn new(nodes: impl Iterator<Item = NodeId>) -> Self {
        let mut sets = HashMap::new();
        let mut lookup = HashMap::new();
        for n in nodes {
            sets.insert(n, vec![n]);
            lookup.insert(n, n);
        }
        UnionFind { sets, lookup }
    }

    fn find(&self, n: NodeId) -> Option<NodeId> {
        self.lookup.get(&n).copied()
    }

    fn union(&mut self, x: NodeId, y: NodeId) {
        let members = self.sets.remove(&x).unwrap_or_default();
        for &m in &members {
            self.lookup.insert(m, y);
        }
        self.sets.entry(y).or_default().extend(members);
    }
}

/// Runs Havlak's algorithm over `g` from `entry` and builds the loop
/// forest.
pub fn analyze_loops(g: &DiGraph, entry: NodeId) -> LoopTree {
    let numbering = g.dfs_preorder(entry);
    let order = &numbering.order;

    let mut back_preds: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    let mut non_back_preds: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for &w in order {
        let mut bp = Vec::new();
        let mut nbp = Vec::new();
        for &p in g.predecessors(w) {
            if !numbering.num.contains_key(&p) {
                continue; // unreachable predecessor, ignore
            }
            if numbering.is_ancestor(w, p) {
                bp.push(p);
            } else {
                nbp.push(p);
            }
        }
        back_preds.insert(w, bp);
        non_back_preds.insert(w, nbp);
    }

    let mut header_of: HashMap<NodeId, NodeId> = HashMap::new();
    let mut kind_of: HashMap<NodeId, LoopKind> = HashMap::new();
    let mut uf = UnionFind::new(order.iter().copied());

    // Reverse preorder: innermost (highest preorder number) processed first.
    for &w in order.iter().rev() {
        let mut p_set: Vec<NodeId> = Vec::new();
        let mut is_self = false;
        for &v in &back_preds[&w] {
            if v == w {
                is_self = true;
            } else if let Some(rep) = uf.find(v) {
                if !p_set.contains(&rep) {
                    p_set.push(rep);
                }
            }
        }
        if is_self {
            kind_of.insert(w, LoopKind::SelfLoop);
        }

        let mut worklist = p_set.clone();
        if !p_set.is_empty() {
            kind_of.insert(w, LoopKind::Reducible);
        }

        while let Some(x) = worklist.pop() {
            for &y in non_back_preds.get(&x).map(|v| v.as_slice()).unwrap_or(&[]) {
                let Some(y1) = uf.find(y) else { continue };
                if !numbering.is_ancestor(w, y1) {
                    kind_of.insert(w, LoopKind::Irreducible);
                    non_back_preds.entry(w).or_default().push(y1);
                } else if y1 != w && !p_set.contains(&y1) {
                    p_set.push(y1);
                    worklist.push(y1);
                }
            }
        }

        if !p_set.is_empty() {
            for x in p_set {
                header_of.insert(x, w);
                uf.union(x, w);
            }
        }
    }

    // Build the forest: headers are every node with a kind assigned.
    let mut headers: HashMap<NodeId, LoopHeader> = HashMap::new();
    for (&n, &kind) in &kind_of {
        headers.insert(
            n,
            LoopHeader {
                header: n,
                kind,
                back_preds: back_preds[&n].clone(),
                nonheader: Vec::new(),
                children: Vec::new(),
                body: HashSet::new(),
                exit_edges: Vec::new(),
                level: 0,
            },
        );
    }

    let mut root_children = Vec::new();
    for &n in order.iter() {
        match header_of.get(&n) {
            None => {
                if headers.contains_key(&n) {
                    root_children.push(n);
                }
                // plain non-header root-level nodes need no record.
            }
            Some(&h) => {
                if headers.contains_key(&n) {
                    headers.get_mut(&h).unwrap().children.push(n);
                } else {
                    headers.get_mut(&h).unwrap().nonheader.push(n);
                }
            }
        }
    }
    root_children.sort_by_key(|n| n.as_u32());

    for h in headers.values_mut() {
        h.body = h.nonheader.iter().chain(h.children.iter()).copied().collect();
    }

    // Levels: root = 0 conceptually, outermost headers = 0 too (per spec
    // "level 0 is outermost").
    let levels: HashMap<NodeId, u32> = {
        let mut levels = HashMap::new();
        fn assign(tree_children: &HashMap<NodeId, Vec<NodeId>>, n: NodeId, lvl: u32, out: &mut HashMap<NodeId, u32>) {
            out.insert(n, lvl);
            if let Some(ch) = tree_children.get(&n) {
                for &c in ch {
                    assign(tree_children, c, lvl + 1, out);
                }
            }
        }
        let children_map: HashMap<NodeId, Vec<NodeId>> =
            headers.iter().map(|(&k, v)| (k, v.children.clone())).collect();
        for &h in &root_children {
            assign(&children_map, h, 0, &mut levels);
        }
        levels
    };
    for (n, lvl) in levels {
        headers.get_mut(&n).unwrap().level = lvl;
    }

    // Exit edges, per header.
    let exit_edges: HashMap<NodeId, Vec<(NodeId, NodeId)>> = headers
        .keys()
        .map(|&h| {
            let hdr = &headers[&h];
            let mut members: Vec<NodeId> = hdr.nonheader.clone();
            members.push(h);
            let mut edges = Vec::new();
            for &b in &members {
                for &s in g.successors(b) {
                    if !hdr.body.contains(&s) && s != h {
                        edges.push((b, s));
                    }
                }
            }
            if edges.is_empty() {
                log::warn!("eternal loop detected: header {h} has no exit edges");
            }
            (h, edges)
        })
        .collect();
    for (h, ee) in exit_edges {
        headers.get_mut(&h).unwrap().exit_edges = ee;
    }

    // Loop-tree preorder numbering (monotonic; see module docs for why this
    // departs from the reference's buggy counter semantics).
    let mut preorder = HashMap::new();
    let mut counter = 0u32;
    preorder.insert(None, 0);
    fn visit(
        headers: &HashMap<NodeId, LoopHeader>,
        n: NodeId,
        counter: &mut u32,
        preorder: &mut HashMap<Option<NodeId>, u32>,
    ) {
        *counter += 1;
        preorder.insert(Some(n), *counter);
        for &c in &headers[&n].children {
            visit(headers, c, counter, preorder);
        }
    }
    let mut sorted_roots = root_children.clone();
    sorted_roots.sort_by_key(|n| n.as_u32());
    for &h in &sorted_roots {
        visit(&headers, h, &mut counter, &mut preorder);
    }

    LoopTree {
        headers,
        header_of,
        root_children,
        preorder,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(i: u32) -> NodeId {
        NodeId(i)
    }

    #[test]
    fn simple_loop_is_reducible() {
        // E -> H -> B -> H (back edge), H -> X (exit)
        let mut g = DiGraph::new();
        g.add_edge(n(0), n(1));
        g.add_edge(n(1), n(2));
        g.add_edge(n(2), n(1));
        g.add_edge(n(1), n(3));
        let lt = analyze_loops(&g, n(0));
        assert!(lt.is_loop_header(n(1)));
        let h = lt.header(n(1)).unwrap();
        assert_eq!(h.kind, LoopKind::Reducible);
        assert!(h.back_preds.contains(&n(2)));
        assert!(h.body.contains(&n(2)));
        assert_eq!(h.level, 0);
        assert_eq!(h.exit_edges, vec![(n(1), n(3))]);
    }

    #[test]
    fn self_loop_is_classified_as_self() {
        let mut g = DiGraph::new();
        g.add_edge(n(0), n(1));
        g.add_edge(n(1), n(1));
        g.add_edge(n(1), n(2));
        let lt = analyze_loops(&g, n(0));
        let h = lt.header(n(1)).unwrap();
        assert_eq!(h.kind, LoopKind::SelfLoop);
        assert_eq!(h.back_preds, vec![n(1)]);
    }

    #[test]
    fn nested_loop_levels() {
        // E -> H1 -> H2 -> B -> H2 (inner back edge) -> H1 (outer back edge) -> X
        let mut g = DiGraph::new();
        g.add_edge(n(0), n(1));
        g.add_edge(n(1), n(2));
        g.add_edge(n(2), n(3));
        g.add_edge(n(3), n(2)); // inner back edge
        g.add_edge(n(2), n(1)); // outer back edge
        g.add_edge(n(1), n(4)); // exit
        let lt = analyze_loops(&g, n(0));
        assert!(lt.is_loop_header(n(1)));
        assert!(lt.is_loop_header(n(2)));
        assert_eq!(lt.header(n(2)).unwrap().level, 1);
        assert_eq!(lt.header(n(1)).unwrap().level, 0);
        assert_eq!(lt.enclosing_header(n(2)), Some(n(1)));
        assert_eq!(lt.enclosing_header(n(3)), Some(n(2)));
    }

    #[test]
    fn irreducible_loop_detected() {
        // classic irreducible: two entries into a cycle {A,B} from outside
        let mut g = DiGraph::new();
        g.add_edge(n(0), n(1));
        g.add_edge(n(0), n(2));
        g.add_edge(n(1), n(2));
        g.add_edge(n(2), n(1));
        let lt = analyze_loops(&g, n(0));
        assert!(lt.any_irreducible());
    }

    #[test]
    fn acyclic_graph_has_no_headers() {
        let mut g = DiGraph::new();
        g.add_edge(n(0), n(1));
        g.add_edge(n(1), n(2));
        let lt = analyze_loops(&g, n(0));
        assert!(lt.headers().next().is_none());
        assert!(!lt.any_irreducible());
    }
}
