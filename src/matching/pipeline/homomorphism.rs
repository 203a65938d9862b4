//! Stage 0': the Dominator-Homomorphism Mapper.
//!
//! Grounded on §4.H Stage 0' of the mapping specification: builds a
//! potential-match set per binary node from DWARF line/column resolution
//! and call-site overlap, then iteratively commits the worklist to the
//! first candidate that keeps the whole map a dominance homomorphism —
//! `dom_bin(b, b') == dom_src(map(b), map(b'))` for every already-mapped
//! pair — backing out and requeuing both sides of any pair that breaks it.

use crate::cfg::InstructionTable;
use crate::dom::DominatorTree;
use crate::graph::NodeId;
use crate::matching::GraphMap;
use crate::region::TransformedFlowGraph;
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomOrder {
    PreDominatorFirst,
    PostDominatorFirst,
    PreDominatedFirst,
    PostDominatedFirst,
}

/// `bin node -> candidate src nodes`, already ordered per `hom_order`.
pub type PotentialMap = HashMap<NodeId, Vec<NodeId>>;

fn order_key(order: HomOrder, dom: &DominatorTree, pdom: &DominatorTree, n: NodeId) -> i64 {
    match order {
        HomOrder::PreDominatorFirst => dom.preorder(n).map(|p| p as i64).unwrap_or(i64::MAX),
        HomOrder::PostDominatorFirst => pdom.preorder(n).map(|p| p as i64).unwrap_or(i64::MAX),
        HomOrder::PreDominatedFirst => dom.preorder(n).map(|p| -(p as i64)).unwrap_or(i64::MIN),
        HomOrder::PostDominatedFirst => pdom.preorder(n).map(|p| -(p as i64)).unwrap_or(i64::MIN),
    }
}

/// Builds the `bin -> candidate src` potential map of §4.H Stage 0''s first
/// bullet, from DWARF line resolution plus function-call overlap, restricted
/// to original (non-surrogate) nodes on both sides. Per-node candidates are
/// ordered by source pre-dominator preorder (dominators first), mirroring
/// the reference mapper's `predominator-first` default for `hom_order_src`.
pub fn build_potential_map(
    bin_tfg: &TransformedFlowGraph<'_>,
    src_tfg: &TransformedFlowGraph<'_>,
    insns: &InstructionTable,
    line_of_addr: &dyn Fn(u64) -> Option<u32>,
    src_dom: &DominatorTree,
) -> PotentialMap {
    let bin_cf = bin_tfg.original;
    let src_cf = src_tfg.original;

    let nodes_s: Vec<NodeId> = src_tfg.graph().nodes().filter(|&n| !src_tfg.is_surrogate(n)).collect();

    let mut call_inv: HashMap<&str, Vec<NodeId>> = HashMap::new();
    for &s in &nodes_s {
        let Some(block) = src_cf.block(s) else { continue };
        for call in &block.calls {
            call_inv.entry(call.as_str()).or_default().push(s);
        }
    }

    let mut potential = PotentialMap::new();
    for b in bin_tfg.graph().nodes() {
        if bin_tfg.is_surrogate(b) {
            continue;
        }
        let Some(block) = bin_cf.block(b) else { continue };

        let mut candidates: Vec<NodeId> = Vec::new();
        for range in block.addr_ranges() {
            for insn in insns.in_range(*range) {
                let Some(line) = line_of_addr(insn.addr) else { continue };
                candidates.extend(src_cf.find_source_blocks_line_only(line, &nodes_s));
            }
        }
        for call in &block.calls {
            if let Some(srcs) = call_inv.get(call.as_str()) {
                candidates.extend(srcs.iter().copied());
            }
        }
        if candidates.is_empty() {
            continue;
        }
        candidates.sort_by_key(|&s| (src_dom.preorder(s).unwrap_or(u32::MAX), s.as_u32()));
        candidates.dedup();
        potential.insert(b, candidates);
    }
    potential
}

/// Runs the worklist to a fixed point. `fixed_points` are never removed
/// once mapped (function entry/exit, matched inner-loop surrogates).
pub fn map_via_homomorphism(
    potential: &PotentialMap,
    bin_dom: &DominatorTree,
    src_dom: &DominatorTree,
    fixed_points: &GraphMap,
    order: HomOrder,
    bin_pdom: &DominatorTree,
    src_pdom: &DominatorTree,
) -> GraphMap {
    let mut gm = fixed_points.clone();
    let mut conflicted: HashMap<NodeId, HashSet<NodeId>> = HashMap::new();

    let mut worklist: Vec<NodeId> = potential.keys().copied().filter(|b| !gm.is_mapped(*b)).collect();
    worklist.sort_by_key(|&b| order_key(order, bin_dom, bin_pdom, b));
    let mut queue: VecDeque<NodeId> = worklist.into();

    let is_consistent = |gm: &GraphMap, b: NodeId, a: NodeId| -> Option<(NodeId, NodeId)> {
        for (bp, ap) in gm.entries() {
            if bp == b {
                continue;
            }
            let bin_rel = bin_dom.dominates(b, bp) as i8 - bin_dom.dominates(bp, b) as i8;
            let src_rel = src_dom.dominates(a, ap) as i8 - src_dom.dominates(ap, a) as i8;
            if bin_rel != src_rel {
                return Some((bp, ap));
            }
        }
        None
    };

    let mut guard = 0usize;
    while let Some(b) = queue.pop_front() {
        guard += 1;
        if guard > potential.len() * potential.len() + potential.len() + 16 {
            log::warn!("dominator-homomorphism worklist did not converge; aborting with a partial map");
            break;
        }
        if gm.is_mapped(b) {
            continue;
        }
        let Some(candidates) = potential.get(&b) else { continue };
        let already_conflicted = conflicted.get(&b).cloned().unwrap_or_default();
        let chosen = candidates.iter().find(|a| !already_conflicted.contains(a)).copied();
        let Some(a) = chosen else { continue };

        gm.insert(b, a);
        if let Some((bp, ap)) = is_consistent(&gm, b, a) {
            gm_remove(&mut gm, b);
            gm_remove(&mut gm, bp);
            conflicted.entry(b).or_default().insert(a);
            conflicted.entry(bp).or_default().insert(ap);
            if !fixed_points.is_mapped(b) {
                queue.push_back(b);
            }
            if !fixed_points.is_mapped(bp) {
                queue.push_back(bp);
            }
        }
    }

    remove_ambiguous_leaves(&mut gm, bin_dom, potential);
    gm
}

fn gm_remove(gm: &mut GraphMap, bin: NodeId) {
    let mut fresh = GraphMap::new();
    for (b, a) in gm.entries() {
        if b != bin {
            fresh.insert(b, a);
        }
    }
    *gm = fresh;
}

/// Walks the binary pre-dominator tree from the root; among dominator-tree
/// leaves that share a parent and whose candidate sets collide, drops all
/// of them from the map.
fn remove_ambiguous_leaves(gm: &mut GraphMap, bin_dom: &DominatorTree, potential: &PotentialMap) {
    let mut by_parent: HashMap<Option<NodeId>, Vec<NodeId>> = HashMap::new();
    for (&b, _) in potential {
        if bin_dom.children_of(b).is_empty() {
            by_parent.entry(bin_dom.parent_of(b)).or_default().push(b);
        }
    }
    let mut to_drop = Vec::new();
    for leaves in by_parent.values() {
        if leaves.len() < 2 {
            continue;
        }
        for i in 0..leaves.len() {
            for j in (i + 1)..leaves.len() {
                let ci: HashSet<_> = potential.get(&leaves[i]).into_iter().flatten().collect();
                let cj: HashSet<_> = potential.get(&leaves[j]).into_iter().flatten().collect();
                if ci.intersection(&cj).next().is_some() {
                    to_drop.push(leaves[i]);
                    to_drop.push(leaves[j]);
                }
            }
        }
    }
    for b in to_drop {
        gm_remove(gm, b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DiGraph;

    fn n(i: u32) -> NodeId {
        NodeId(i)
    }

    #[test]
    fn identical_diamonds_map_one_to_one() {
        let mut bg = DiGraph::new();
        bg.add_edge(n(0), n(1));
        bg.add_edge(n(1), n(2));
        bg.add_edge(n(1), n(3));
        bg.add_edge(n(2), n(4));
        bg.add_edge(n(3), n(4));
        let bin_dom = DominatorTree::compute(&bg, n(0));
        let bin_pdom = DominatorTree::compute(&bg.reverse(), n(4));

        let mut sg = DiGraph::new();
        sg.add_edge(n(10), n(11));
        sg.add_edge(n(11), n(12));
        sg.add_edge(n(11), n(13));
        sg.add_edge(n(12), n(14));
        sg.add_edge(n(13), n(14));
        let src_dom = DominatorTree::compute(&sg, n(10));
        let src_pdom = DominatorTree::compute(&sg.reverse(), n(14));

        let mut potential = PotentialMap::new();
        potential.insert(n(1), vec![n(11)]);
        potential.insert(n(2), vec![n(12)]);
        potential.insert(n(3), vec![n(13)]);

        let mut fixed = GraphMap::new();
        fixed.insert(n(0), n(10));
        fixed.insert(n(4), n(14));

        let gm = map_via_homomorphism(&potential, &bin_dom, &src_dom, &fixed, HomOrder::PreDominatorFirst, &bin_pdom, &src_pdom);
        assert_eq!(gm.get(n(1)), Some(n(11)));
        assert_eq!(gm.get(n(2)), Some(n(12)));
        assert_eq!(gm.get(n(3)), Some(n(13)));
    }
}
