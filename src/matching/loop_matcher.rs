//! Pairs binary loop headers with source loop headers via the DWARF line
//! numbers each binary loop's instructions carry.
//!
//! Grounded on §4.G of the mapping specification and the reference
//! mapper's `mapping/loop_matcher.py`: lines are attributed to the
//! innermost binary loop that references them, source loops are searched
//! outermost-first by `[line_min, line_max]`, and loops with zero or
//! conflicting hits fall through the same filter rules (unrolled source
//! loop -> `skipped_src`; compiler-introduced binary self-loop ->
//! `skipped_bin`).

use crate::cfg::{ControlFlow, InstructionTable};
use crate::graph::NodeId;
use crate::loops::{LoopKind, LoopTree};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default)]
pub struct LoopMatchResult {
    /// `src header -> bin header`.
    pub matched: HashMap<NodeId, NodeId>,
    pub skipped_bin: HashSet<NodeId>,
    pub skipped_src: HashSet<NodeId>,
}

/// Attributes every DWARF line referenced by a binary loop's body
/// instructions to that loop, innermost first: a line already claimed by
/// an inner loop is subtracted from its outer loops' sets.
pub fn unique_dwarf_lines_per_bin_loop(
    bin_cf: &ControlFlow,
    bin_loops: &LoopTree,
    insns: &InstructionTable,
    line_of_addr: impl Fn(u64) -> Option<u32>,
) -> HashMap<NodeId, HashSet<u32>> {
    let mut claimed: HashSet<u32> = HashSet::new();
    let mut result = HashMap::new();

    let mut innermost_first = bin_loops.preorder_headers();
    innermost_first.reverse();

    for h in innermost_first {
        let info = bin_loops.header(h).expect("preorder_headers yields headers");
        let mut members = info.nonheader.clone();
        members.push(h);

        let mut lines: HashSet<u32> = HashSet::new();
        for m in members {
            for range in bin_cf.block(m).map(|b| b.addr_ranges()).unwrap_or(&[]) {
                for insn in insns.in_range(*range) {
                    if let Some(line) = line_of_addr(insn.addr) {
                        lines.insert(line);
                    }
                }
            }
        }
        lines.retain(|l| !claimed.contains(l));
        claimed.extend(lines.iter().copied());
        result.insert(h, lines);
    }
    result
}

#[derive(Debug, Clone, Copy)]
struct LineRange {
    min: u32,
    max: u32,
}

/// `[line_min, line_max]` per source loop header, with each ancestor's max
/// widened to cover every descendant.
fn source_loop_line_tree(src_cf: &ControlFlow, src_loops: &LoopTree) -> HashMap<NodeId, LineRange> {
    let mut ranges: HashMap<NodeId, LineRange> = HashMap::new();
    for header in src_loops.headers() {
        let mut lo = u32::MAX;
        let mut hi = 0u32;
        let mut members = header.nonheader.clone();
        members.push(header.header);
        for m in members {
            if let Some(s) = src_cf.block(m).and_then(|b| b.source()) {
                lo = lo.min(s.begin.line);
                hi = hi.max(s.end.line);
            }
        }
        ranges.insert(header.header, LineRange { min: lo, max: hi });
    }
    // propagate max upward, outermost headers first so nested widening is visible bottom-up
    let mut innermost_first = src_loops.preorder_headers();
    innermost_first.reverse();
    for h in innermost_first {
        if let Some(parent) = src_loops.parent_header(h) {
            let child_max = ranges[&h].max;
            let p = ranges.get_mut(&parent).unwrap();
            p.max = p.max.max(child_max);
        }
    }
    ranges
}

/// Finds the innermost source loop whose `[line_min, line_max]` contains
/// `line`, descending from outermost loops sorted by `line_min`.
fn resolve_line_to_src_loop(line: u32, src_loops: &LoopTree, ranges: &HashMap<NodeId, LineRange>) -> Option<NodeId> {
    fn search(
        candidates: &[NodeId],
        line: u32,
        src_loops: &LoopTree,
        ranges: &HashMap<NodeId, LineRange>,
    ) -> Option<NodeId> {
        let mut sorted: Vec<NodeId> = candidates.to_vec();
        sorted.sort_by_key(|&h| ranges[&h].min);
        for h in sorted {
            let r = ranges[&h];
            if r.min <= line && line <= r.max {
                let info = src_loops.header(h).unwrap();
                if let Some(found) = search(&info.children, line, src_loops, ranges) {
                    return Some(found);
                }
                return Some(h);
            }
        }
        None
    }
    let result = search(src_loops.root_children(), line, src_loops, ranges);
    if result.is_none() {
        log::warn!("line {line} is outside every source loop's range");
    }
    result
}

/// Runs the full loop-matching procedure.
pub fn match_loops(
    bin_cf: &ControlFlow,
    bin_loops: &LoopTree,
    src_cf: &ControlFlow,
    src_loops: &LoopTree,
    insns: &InstructionTable,
    line_of_addr: impl Fn(u64) -> Option<u32>,
    user_skip: &HashSet<NodeId>,
) -> LoopMatchResult {
    let bin_lines = unique_dwarf_lines_per_bin_loop(bin_cf, bin_loops, insns, line_of_addr);
    let src_ranges = source_loop_line_tree(src_cf, src_loops);

    let mut result = LoopMatchResult::default();
    let mut bin_to_src: HashMap<NodeId, Option<NodeId>> = HashMap::new();

    // outer-first reverse order: preorder_headers is outermost-first already.
    let outer_first = bin_loops.preorder_headers();
    for h in &outer_first {
        if user_skip.contains(h) {
            bin_to_src.insert(*h, None);
            result.skipped_bin.insert(*h);
            continue;
        }
        let parent_match = bin_loops.parent_header(*h).and_then(|p| bin_to_src.get(&p).copied().flatten());

        let mut hits: Vec<NodeId> = Vec::new();
        for &line in bin_lines.get(h).into_iter().flatten() {
            if let Some(s) = resolve_line_to_src_loop(line, src_loops, &src_ranges) {
                if Some(s) == parent_match {
                    continue; // collapses into the parent bin loop's own match
                }
                hits.push(s);
            }
        }

        if hits.is_empty() {
            bin_to_src.insert(*h, None);
            result.skipped_bin.insert(*h);
            continue;
        }

        hits.sort_by_key(|&s| src_loops.preorder_of(Some(s)));
        let chosen = hits[0];
        bin_to_src.insert(*h, Some(chosen));
    }

    // Invert, applying the filter rules.
    let mut src_hits: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for (&b, s) in &bin_to_src {
        if let Some(s) = s {
            src_hits.entry(*s).or_default().push(b);
        }
    }

    for header in src_loops.headers() {
        let sh = header.header;
        let hits = src_hits.get(&sh).cloned().unwrap_or_default();
        if hits.is_empty() {
            result.skipped_src.insert(sh);
            continue;
        }
        if hits.len() == 1 {
            result.matched.insert(sh, hits[0]);
            continue;
        }
        let non_self: Vec<NodeId> = hits
            .iter()
            .copied()
            .filter(|&b| bin_loops.header(b).map(|h| h.kind != LoopKind::SelfLoop).unwrap_or(true))
            .collect();
        if non_self.is_empty() {
            for &b in &hits {
                result.skipped_bin.insert(b);
            }
            result.skipped_src.insert(sh);
        } else if non_self.len() == 1 {
            result.matched.insert(sh, non_self[0]);
            for &b in &hits {
                if b != non_self[0] {
                    result.skipped_bin.insert(b);
                }
            }
        } else {
            log::error!("source loop at {sh} has multiple non-self binary hits; ambiguous match");
            result.skipped_src.insert(sh);
        }
    }

    for header in bin_loops.headers() {
        let h = header.header;
        if !result.matched.values().any(|&b| b == h) && !result.skipped_bin.contains(&h) {
            result.skipped_bin.insert(h);
        }
    }

    for &h in &result.skipped_bin {
        if !user_skip.contains(&h) {
            log::error!("binary loop at {h} is unmatched and has no user annotation");
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{BasicBlock, BinaryBlockData, BlockData, BlockKind, SourceBlockData, SourceLoc};
    use crate::loops::analyze_loops;

    fn bin_block(id: u32, lo: u64, hi: u64) -> BasicBlock {
        BasicBlock { id: NodeId(id), kind: BlockKind::Normal, calls: vec![], data: BlockData::Binary(BinaryBlockData { addr_ranges: vec![crate::cfg::AddrRange::new(lo, hi)], cycle_cost: None }) }
    }

    fn src_block(id: u32, bl: u32, el: u32) -> BasicBlock {
        BasicBlock { id: NodeId(id), kind: BlockKind::Normal, calls: vec![], data: BlockData::Source(SourceBlockData { begin: SourceLoc { line: bl, col: 0 }, end: SourceLoc { line: el, col: 0 }, discriminator: 0, is_virtual: false }) }
    }

    #[test]
    fn matches_a_single_bin_loop_to_its_source_loop() {
        let mut bin = ControlFlow::new("f", NodeId(0), Some(NodeId(9)));
        bin.add_block(bin_block(1, 0x10, 0x1f));
        bin.add_block(bin_block(2, 0x20, 0x2f));
        bin.add_edge(NodeId(0), NodeId(1));
        bin.add_edge(NodeId(1), NodeId(2));
        bin.add_edge(NodeId(2), NodeId(1));
        let bin_loops = analyze_loops(bin.graph(), bin.entry_id());

        let mut src = ControlFlow::new("f", NodeId(0), Some(NodeId(9)));
        src.add_block(src_block(10, 5, 5));
        src.add_block(src_block(11, 6, 6));
        src.add_edge(NodeId(0), NodeId(10));
        src.add_edge(NodeId(10), NodeId(11));
        src.add_edge(NodeId(11), NodeId(10));
        let src_loops = analyze_loops(src.graph(), src.entry_id());

        let mut insns = InstructionTable::new();
        insns.insert(crate::cfg::Instruction { addr: 0x10, mnemonic: "nop".into(), operands: vec![], targets: vec![] });
        let line_of_addr = |addr: u64| if addr == 0x10 { Some(5) } else { None };

        let result = match_loops(&bin, &bin_loops, &src, &src_loops, &insns, line_of_addr, &HashSet::new());
        assert_eq!(result.matched.get(&NodeId(10)), Some(&NodeId(1)));
        assert!(result.skipped_bin.is_empty());
        assert!(result.skipped_src.is_empty());
    }
}
