//! Decision-edge labeling: assigns every out-edge of a multi-successor
//! block a `c<D>.<O>` label such that equal labels denote the same branch
//! decision and outcome on both sides, via DWARF-discriminator pairing.
//!
//! Grounded on §4.F of the mapping specification and the reference
//! mapper's discriminator-based edge matching (`mapping/edge_matcher.py`):
//! same per-line discriminator bucketing, same `trust_dbg` column fallback.
//! Structural (dominator-homomorphism) fallback for lines whose
//! discriminators can't be paired by column reuses the Stage 0' mapper
//! (`super::pipeline::homomorphism`) restricted to the candidate BBs.

use crate::cfg::ControlFlow;
use crate::dom::DominatorTree;
use crate::graph::NodeId;
use crate::matching::pipeline::homomorphism::{map_via_homomorphism, HomOrder, PotentialMap};
use crate::matching::{EdgeLabel, GraphMap};
use std::collections::HashMap;

/// `line -> discriminator -> decision node`, built by the caller from
/// per-side discriminator bookkeeping (source: [`crate::cfg::compute_source_discriminators`];
/// binary: DWARF `LineInfoEntries[*].Discriminator` grouped by the
/// resolved decision block).
pub type DiscrMap = HashMap<u32, HashMap<u32, NodeId>>;

/// Pairs `(line, discr_bin) <-> (line, discr_src)` wherever both sides
/// reference the same line. Returns `bin node -> src node` for every
/// decision node that could be paired. `bin_dom`/`src_dom`/`bin_pdom`/
/// `src_pdom` are the whole-function dominator/post-dominator trees,
/// consulted only by the structural fallback below.
#[allow(clippy::too_many_arguments)]
pub fn pair_discriminators(
    bin_discr: &DiscrMap,
    src_discr: &DiscrMap,
    trust_dbg: bool,
    bin_col_of: impl Fn(NodeId) -> Option<u32>,
    find_source_block: impl Fn(u32, u32) -> Option<NodeId>,
    src_discr_of: impl Fn(NodeId) -> Option<u32>,
    bin_dom: &DominatorTree,
    src_dom: &DominatorTree,
    bin_pdom: &DominatorTree,
    src_pdom: &DominatorTree,
) -> HashMap<NodeId, NodeId> {
    let mut paired = HashMap::new();

    let mut lines: Vec<u32> = bin_discr.keys().copied().collect();
    lines.retain(|l| src_discr.contains_key(l));
    lines.sort_unstable();

    for line in lines {
        let bside = &bin_discr[&line];
        let sside = &src_discr[&line];

        if bside.len() == 1 && sside.len() == 1 {
            let (_, &bn) = bside.iter().next().unwrap();
            let (_, &sn) = sside.iter().next().unwrap();
            paired.insert(bn, sn);
            continue;
        }

        if trust_dbg {
            let mut any_paired = false;
            for (_, &bn) in bside {
                let Some(col) = bin_col_of(bn) else { continue };
                let Some(sn) = find_source_block(line, col) else { continue };
                if let Some(discr) = src_discr_of(sn) {
                    if sside.get(&discr) == Some(&sn) {
                        paired.insert(bn, sn);
                        any_paired = true;
                    }
                }
            }
            if any_paired {
                continue;
            }
        }

        log::debug!(
            "edge matcher: line {line} has {} bin / {} src discriminators; column info \
             unavailable or inconclusive, falling back to structural matching",
            bside.len(),
            sside.len()
        );

        let mut ordered_src: Vec<NodeId> = sside.values().copied().collect();
        ordered_src.sort_by_key(|&s| (src_dom.preorder(s).unwrap_or(u32::MAX), s.as_u32()));
        let mut potential = PotentialMap::new();
        for &bn in bside.values() {
            potential.insert(bn, ordered_src.clone());
        }
        let sub_map = map_via_homomorphism(&potential, bin_dom, src_dom, &GraphMap::new(), HomOrder::PreDominatorFirst, bin_pdom, src_pdom);
        for (bn, sn) in sub_map.entries() {
            paired.insert(bn, sn);
        }
    }
    paired
}

/// Assigns `c<D>.<O>` to every out-edge of every decision node (out-degree
/// > 1) in `g`. `pairing` maps each decision node to its counterpart on the
/// other side so matched decisions and matched successors receive equal
/// ids; nodes absent from `pairing` get unique, unmatched ids. Bin and src
/// decision ids are tracked in separate maps (bridged only through
/// `pairing`), since `NodeId` is only unique within one graph — a bin node
/// and a src node can and routinely do share the same integer id without
/// being related, and a single shared map would silently alias them.
pub fn label_decision_edges(
    bin: &ControlFlow,
    src: &ControlFlow,
    bin_to_src_decision: &HashMap<NodeId, NodeId>,
) -> (HashMap<(NodeId, NodeId), EdgeLabel>, HashMap<(NodeId, NodeId), EdgeLabel>) {
    let mut bin_decision_id: HashMap<NodeId, u32> = HashMap::new();
    let mut src_decision_id: HashMap<NodeId, u32> = HashMap::new();
    let mut next_decision = 0u32;

    let mut bin_decisions: Vec<NodeId> = bin.graph().nodes().filter(|&n| bin.graph().out_degree(n) > 1).collect();
    bin_decisions.sort_by_key(|n| n.as_u32());
    for &b in &bin_decisions {
        let id = next_decision;
        next_decision += 1;
        bin_decision_id.insert(b, id);
        if let Some(&s) = bin_to_src_decision.get(&b) {
            src_decision_id.insert(s, id);
        }
    }
    let mut src_decisions: Vec<NodeId> = src.graph().nodes().filter(|&n| src.graph().out_degree(n) > 1).collect();
    src_decisions.sort_by_key(|n| n.as_u32());
    for &s in &src_decisions {
        src_decision_id.entry(s).or_insert_with(|| {
            let id = next_decision;
            next_decision += 1;
            id
        });
    }

    let bin_labels = label_side(bin, &bin_decisions, &bin_decision_id);
    let src_labels = label_side(src, &src_decisions, &src_decision_id);
    (bin_labels, src_labels)
}

fn label_side(
    cf: &ControlFlow,
    decisions: &[NodeId],
    decision_id: &HashMap<NodeId, u32>,
) -> HashMap<(NodeId, NodeId), EdgeLabel> {
    let mut labels = HashMap::new();
    for &d in decisions {
        let id = decision_id[&d];
        let mut succs: Vec<NodeId> = cf.graph().successors(d).to_vec();
        succs.sort_by_key(|n| n.as_u32());
        for (outcome, &s) in succs.iter().enumerate() {
            labels.insert((d, s), EdgeLabel { decision: id, outcome: outcome as u32 });
        }
    }
    labels
}
