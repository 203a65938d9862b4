//! Directed graph primitives shared by every layer of the mapper.
//!
//! This is the leaf component: dominator computation, loop analysis, the CFG
//! model and everything built on top of it all reduce to operations on a
//! [`DiGraph`] — a dense, integer-id adjacency-list digraph. Nodes are never
//! removed by index reuse; `remove_node` just drops the node's own edges and
//! leaves a hole, matching how the region/reduction layer above retires
//! original ids after folding a loop into a surrogate.

use indexmap::IndexSet;
use std::collections::HashSet;

/// Dense node identifier, unique within one [`DiGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// A directed graph over [`NodeId`]s, stored as parallel successor/predecessor
/// adjacency lists. Edge order is preserved (insertion order) since several
/// higher layers depend on deterministic iteration (Havlak, homomorphism
/// worklists).
#[derive(Debug, Clone, Default)]
pub struct DiGraph {
    nodes: IndexSet<NodeId>,
    succs: std::collections::HashMap<NodeId, Vec<NodeId>>,
    preds: std::collections::HashMap<NodeId, Vec<NodeId>>,
}

impl DiGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: NodeId) {
        self.nodes.insert(id);
        self.succs.entry(id).or_default();
        self.preds.entry(id).or_default();
    }

    pub fn has_node(&self, id: NodeId) -> bool {
        self.nodes.contains(&id)
    }

    /// Adds a directed edge `u -> v`, registering both endpoints if new.
    /// Duplicate edges are ignored.
    pub fn add_edge(&mut self, u: NodeId, v: NodeId) {
        self.add_node(u);
        self.add_node(v);
        let s = self.succs.get_mut(&u).unwrap();
        if !s.contains(&v) {
            s.push(v);
        }
        let p = self.preds.get_mut(&v).unwrap();
        if !p.contains(&u) {
            p.push(u);
        }
    }

    /// Removes `n` and every edge touching it.
    pub fn remove_node(&mut self, n: NodeId) {
        if !self.nodes.shift_remove(&n) {
            return;
        }
        let succs = self.succs.remove(&n).unwrap_or_default();
        let preds = self.preds.remove(&n).unwrap_or_default();
        for v in succs {
            if let Some(p) = self.preds.get_mut(&v) {
                p.retain(|&x| x != n);
            }
        }
        for u in preds {
            if let Some(s) = self.succs.get_mut(&u) {
                s.retain(|&x| x != n);
            }
        }
    }

    pub fn remove_edge(&mut self, u: NodeId, v: NodeId) {
        if let Some(s) = self.succs.get_mut(&u) {
            s.retain(|&x| x != v);
        }
        if let Some(p) = self.preds.get_mut(&v) {
            p.retain(|&x| x != u);
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().copied()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn successors(&self, n: NodeId) -> &[NodeId] {
        self.succs.get(&n).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn predecessors(&self, n: NodeId) -> &[NodeId] {
        self.preds.get(&n).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn out_degree(&self, n: NodeId) -> usize {
        self.successors(n).len()
    }

    pub fn in_degree(&self, n: NodeId) -> usize {
        self.predecessors(n).len()
    }

    pub fn edges(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.nodes.iter().flat_map(move |&u| {
            self.successors(u).iter().map(move |&v| (u, v))
        })
    }

    /// The graph with every edge reversed; used to build post-dominator
    /// trees and to walk predecessors as successors.
    pub fn reverse(&self) -> DiGraph {
        let mut g = DiGraph::new();
        for n in self.nodes() {
            g.add_node(n);
        }
        for (u, v) in self.edges() {
            g.add_edge(v, u);
        }
        g
    }

    /// Induced subgraph on `keep`: only edges with both endpoints in `keep`
    /// survive.
    pub fn subgraph(&self, keep: &HashSet<NodeId>) -> DiGraph {
        let mut g = DiGraph::new();
        for &n in keep {
            g.add_node(n);
        }
        for (u, v) in self.edges() {
            if keep.contains(&u) && keep.contains(&v) {
                g.add_edge(u, v);
            }
        }
        g
    }

    /// Forward-reachable set from `entry`, iterative DFS.
    pub fn reachable_from(&self, entry: NodeId) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        if !self.has_node(entry) {
            return seen;
        }
        let mut stack = vec![entry];
        seen.insert(entry);
        while let Some(n) = stack.pop() {
            for &s in self.successors(n) {
                if seen.insert(s) {
                    stack.push(s);
                }
            }
        }
        seen
    }

    /// Preorder DFS numbering from `entry` plus, for every visited node, the
    /// last-descendant preorder number ("las" in dominator-tree terms, but
    /// here computed over plain DFS tree edges — used by Havlak's ancestor
    /// test). Ties among successors are broken by edge insertion order.
    pub fn dfs_preorder(&self, entry: NodeId) -> DfsNumbering {
        let mut order = Vec::new();
        let mut num = std::collections::HashMap::new();
        let mut las = std::collections::HashMap::new();
        let mut parent = std::collections::HashMap::new();

        // Explicit-stack preorder DFS that also records, on the way back up,
        // the highest preorder number reached in the subtree.
        enum Frame {
            Enter(NodeId, Option<NodeId>),
            Leave(NodeId),
        }
        let mut stack = vec![Frame::Enter(entry, None)];
        let mut visited = HashSet::new();
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(n, par) => {
                    if visited.contains(&n) {
                        continue;
                    }
                    visited.insert(n);
                    let here = order.len() as u32;
                    num.insert(n, here);
                    order.push(n);
                    if let Some(p) = par {
                        parent.insert(n, p);
                    }
                    stack.push(Frame::Leave(n));
                    for &s in self.successors(n).iter().rev() {
                        if !visited.contains(&s) {
                            stack.push(Frame::Enter(s, Some(n)));
                        }
                    }
                }
                Frame::Leave(n) => {
                    las.insert(n, (order.len() as u32).saturating_sub(1));
                }
            }
        }
        DfsNumbering { order, num, las, parent }
    }

    /// Whether the subgraph reachable from `entry` is acyclic (no back-edge
    /// under DFS tree ancestry).
    pub fn is_acyclic_from(&self, entry: NodeId) -> bool {
        let mut color = std::collections::HashMap::new(); // 0 = visiting, 1 = done
        let mut stack = vec![(entry, 0usize)];
        let mut acyclic = true;
        if !self.has_node(entry) {
            return true;
        }
        fn visit(
            g: &DiGraph,
            n: NodeId,
            color: &mut std::collections::HashMap<NodeId, u8>,
            acyclic: &mut bool,
        ) {
            color.insert(n, 0);
            for &s in g.successors(n) {
                match color.get(&s) {
                    Some(0) => *acyclic = false,
                    Some(1) => {}
                    _ => visit(g, s, color, acyclic),
                }
            }
            color.insert(n, 1);
        }
        stack.clear();
        visit(self, entry, &mut color, &mut acyclic);
        acyclic
    }

    /// Tarjan's SCC algorithm. Returns components in reverse-topological
    /// order (as Tarjan naturally produces them).
    pub fn strongly_connected_components(&self) -> Vec<Vec<NodeId>> {
        struct State {
            index: std::collections::HashMap<NodeId, u32>,
            lowlink: std::collections::HashMap<NodeId, u32>,
            on_stack: HashSet<NodeId>,
            stack: Vec<NodeId>,
            next_index: u32,
            sccs: Vec<Vec<NodeId>>,
        }
        fn strongconnect(g: &DiGraph, v: NodeId, st: &mut State) {
            st.index.insert(v, st.next_index);
            st.lowlink.insert(v, st.next_index);
            st.next_index += 1;
            st.stack.push(v);
            st.on_stack.insert(v);

            for &w in g.successors(v) {
                if !st.index.contains_key(&w) {
                    strongconnect(g, w, st);
                    let wl = st.lowlink[&w];
                    let vl = st.lowlink[&v];
                    st.lowlink.insert(v, vl.min(wl));
                } else if st.on_stack.contains(&w) {
                    let wi = st.index[&w];
                    let vl = st.lowlink[&v];
                    st.lowlink.insert(v, vl.min(wi));
                }
            }

            if st.lowlink[&v] == st.index[&v] {
                let mut comp = Vec::new();
                loop {
                    let w = st.stack.pop().unwrap();
                    st.on_stack.remove(&w);
                    comp.push(w);
                    if w == v {
                        break;
                    }
                }
                st.sccs.push(comp);
            }
        }

        let mut st = State {
            index: Default::default(),
            lowlink: Default::default(),
            on_stack: Default::default(),
            stack: Vec::new(),
            next_index: 0,
            sccs: Vec::new(),
        };
        for n in self.nodes() {
            if !st.index.contains_key(&n) {
                strongconnect(self, n, &mut st);
            }
        }
        st.sccs
    }

    /// The condensation graph: one node per SCC (identified by the smallest
    /// member id), edges wherever an inter-SCC edge exists in `self`.
    pub fn condensation(&self) -> (DiGraph, std::collections::HashMap<NodeId, NodeId>) {
        let sccs = self.strongly_connected_components();
        let mut rep = std::collections::HashMap::new();
        for comp in &sccs {
            let r = *comp.iter().min_by_key(|n| n.0).unwrap();
            for &n in comp {
                rep.insert(n, r);
            }
        }
        let mut g = DiGraph::new();
        for comp in &sccs {
            let r = rep[&comp[0]];
            g.add_node(r);
        }
        for (u, v) in self.edges() {
            let ru = rep[&u];
            let rv = rep[&v];
            if ru != rv {
                g.add_edge(ru, rv);
            }
        }
        (g, rep)
    }
}

/// Result of [`DiGraph::dfs_preorder`].
#[derive(Debug, Clone)]
pub struct DfsNumbering {
    pub order: Vec<NodeId>,
    pub num: std::collections::HashMap<NodeId, u32>,
    pub las: std::collections::HashMap<NodeId, u32>,
    pub parent: std::collections::HashMap<NodeId, NodeId>,
}

impl DfsNumbering {
    pub fn num_of(&self, n: NodeId) -> u32 {
        self.num[&n]
    }

    pub fn las_of(&self, n: NodeId) -> u32 {
        self.las[&n]
    }

    /// `w` is a DFS-tree ancestor of (or equal to) `v`.
    pub fn is_ancestor(&self, w: NodeId, v: NodeId) -> bool {
        match (self.num.get(&w), self.num.get(&v), self.las.get(&w)) {
            (Some(&nw), Some(&nv), Some(&lw)) => nw <= nv && nv <= lw,
            _ => false,
        }
    }
}
