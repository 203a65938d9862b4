//! End-to-end scenarios over [`flowmap::analysis::Analysis`], one per
//! concrete case named in the mapping specification: straight-line
//! function, diamond, matched loop, unrolled source loop, and a bin-only
//! self-loop compiler artifact.

use flowmap::analysis::Analysis;
use flowmap::cfg::{AddrRange, BasicBlock, BinaryBlockData, BlockData, BlockKind, ControlFlow, InstructionTable, SourceBlockData, SourceLoc};
use flowmap::graph::NodeId;
use flowmap::ingest::annotations::LoopAnnotations;
use flowmap::matching::edge_matcher::DiscrMap;
use flowmap::matching::pipeline::PipelineConfig;
use std::collections::{HashMap, HashSet};

fn bin_block(id: u32, kind: BlockKind, lo: u64, hi: u64) -> BasicBlock {
    BasicBlock {
        id: NodeId(id),
        kind,
        calls: Vec::new(),
        data: BlockData::Binary(BinaryBlockData { addr_ranges: vec![AddrRange::new(lo, hi)], cycle_cost: None }),
    }
}

fn src_block(id: u32, kind: BlockKind, line: u32) -> BasicBlock {
    BasicBlock {
        id: NodeId(id),
        kind,
        calls: Vec::new(),
        data: BlockData::Source(SourceBlockData {
            begin: SourceLoc { line, col: 0 },
            end: SourceLoc { line, col: 10 },
            discriminator: 0,
            is_virtual: false,
        }),
    }
}

fn empty_discr() -> DiscrMap {
    HashMap::new()
}

/// The loop matcher attributes lines by scanning instructions in a block's
/// address range, so tests exercising it need at least one instruction per
/// address of interest.
fn insns_at(addrs: &[u64]) -> InstructionTable {
    let mut table = InstructionTable::new();
    for &addr in addrs {
        table.insert(flowmap::cfg::Instruction { addr, mnemonic: "NOP".into(), operands: Vec::new(), targets: Vec::new() });
    }
    table
}

/// Runs the full `Analysis` pipeline with the default (ctrldep) mapper and
/// no loop annotations, returning the flattened `bin -> src` map. `bin_discr`
/// supplies the DWARF discriminator evidence a real ingest would provide for
/// any decision node in `bin_cf` — without it, decision edges on the two
/// sides get independent, unbridged decision ids and never compare equal.
fn run(bin_cf: ControlFlow, src_cf: ControlFlow, bin_discr: DiscrMap) -> HashMap<NodeId, NodeId> {
    let analysis = Analysis::new(bin_cf, src_cf, true).expect("analysis should build for a reducible function");
    let insns = InstructionTable::new();
    let loop_match = analysis.match_loops(&insns, |_| None, &HashSet::new());
    let annotations = LoopAnnotations::default();
    let (flat, _hgm) = analysis
        .run_mapping(&bin_discr, false, &loop_match, &annotations.timing, PipelineConfig::default(), &insns, &|_| None)
        .expect("mapping should complete for a reducible, fully-matched function");
    flat
}

#[test]
fn straight_line_function_maps_each_block_to_its_counterpart() {
    // Entry(0) -> A(1) -> Exit(2), on both sides.
    let mut bin_cf = ControlFlow::new("f", NodeId(0), Some(NodeId(2)));
    bin_cf.add_block(bin_block(0, BlockKind::Entry, 0x1000, 0x1000));
    bin_cf.add_block(bin_block(1, BlockKind::Normal, 0x1004, 0x1008));
    bin_cf.add_block(bin_block(2, BlockKind::Exit, 0x100c, 0x100c));
    bin_cf.add_edge(NodeId(0), NodeId(1));
    bin_cf.add_edge(NodeId(1), NodeId(2));

    let mut src_cf = ControlFlow::new("f", NodeId(0), Some(NodeId(2)));
    src_cf.add_block(src_block(0, BlockKind::Entry, 1));
    src_cf.add_block(src_block(1, BlockKind::Normal, 2));
    src_cf.add_block(src_block(2, BlockKind::Exit, 3));
    src_cf.add_edge(NodeId(0), NodeId(1));
    src_cf.add_edge(NodeId(1), NodeId(2));

    let flat = run(bin_cf, src_cf, empty_discr());

    assert_eq!(flat.get(&NodeId(0)), Some(&NodeId(0)));
    assert_eq!(flat.get(&NodeId(1)), Some(&NodeId(1)));
    assert_eq!(flat.get(&NodeId(2)), Some(&NodeId(2)));
}

#[test]
fn annotation_line_mismatch_against_dwarf_is_fatal() {
    let mut bin_cf = ControlFlow::new("f", NodeId(0), Some(NodeId(2)));
    bin_cf.add_block(bin_block(0, BlockKind::Entry, 0x1000, 0x1000));
    bin_cf.add_block(bin_block(1, BlockKind::Normal, 0x1004, 0x1008));
    bin_cf.add_block(bin_block(2, BlockKind::Exit, 0x100c, 0x100c));
    bin_cf.add_edge(NodeId(0), NodeId(1));
    bin_cf.add_edge(NodeId(1), NodeId(2));

    let mut src_cf = ControlFlow::new("f", NodeId(0), Some(NodeId(2)));
    src_cf.add_block(src_block(0, BlockKind::Entry, 1));
    src_cf.add_block(src_block(1, BlockKind::Normal, 2));
    src_cf.add_block(src_block(2, BlockKind::Exit, 3));
    src_cf.add_edge(NodeId(0), NodeId(1));
    src_cf.add_edge(NodeId(1), NodeId(2));

    let analysis = Analysis::new(bin_cf, src_cf, true).expect("analysis should build for a reducible function");
    let insns = InstructionTable::new();
    let loop_match = analysis.match_loops(&insns, |_| None, &HashSet::new());

    let mut annotations = HashMap::new();
    annotations.insert(NodeId(1), flowmap::matching::pipeline::skip::LoopAnnotation { repeats: 1, time: None, line: Some(999), addr: None });
    let line_of_addr = |_addr: u64| Some(2u32); // block 1's real DWARF line is 2, not 999

    let result = analysis.run_mapping(&empty_discr(), false, &loop_match, &annotations, PipelineConfig::default(), &insns, &line_of_addr);
    assert!(result.is_err(), "mismatched line annotation must be rejected before skip completion runs");
}

#[test]
fn diamond_maps_both_branch_arms() {
    // Entry(0) -> B(1) -> {C(2), D(3)} -> M(4) -> Exit(5), both sides.
    let mut bin_cf = ControlFlow::new("f", NodeId(0), Some(NodeId(5)));
    bin_cf.add_block(bin_block(0, BlockKind::Entry, 0x1000, 0x1000));
    bin_cf.add_block(bin_block(1, BlockKind::Normal, 0x1004, 0x1004));
    bin_cf.add_block(bin_block(2, BlockKind::Normal, 0x1008, 0x1008));
    bin_cf.add_block(bin_block(3, BlockKind::Normal, 0x100c, 0x100c));
    bin_cf.add_block(bin_block(4, BlockKind::Normal, 0x1010, 0x1010));
    bin_cf.add_block(bin_block(5, BlockKind::Exit, 0x1014, 0x1014));
    for (u, v) in [(0, 1), (1, 2), (1, 3), (2, 4), (3, 4), (4, 5)] {
        bin_cf.add_edge(NodeId(u), NodeId(v));
    }

    let mut src_cf = ControlFlow::new("f", NodeId(0), Some(NodeId(5)));
    src_cf.add_block(src_block(0, BlockKind::Entry, 1));
    src_cf.add_block(src_block(1, BlockKind::Normal, 2));
    src_cf.add_block(src_block(2, BlockKind::Normal, 3));
    src_cf.add_block(src_block(3, BlockKind::Normal, 4));
    src_cf.add_block(src_block(4, BlockKind::Normal, 5));
    src_cf.add_block(src_block(5, BlockKind::Exit, 6));
    for (u, v) in [(0, 1), (1, 2), (1, 3), (2, 4), (3, 4), (4, 5)] {
        src_cf.add_edge(NodeId(u), NodeId(v));
    }

    // B is the only decision node on either side, at source line 2; without
    // this evidence the bin and src branch edges would get independent,
    // unbridged decision ids and never compare equal under the ctrl-dep
    // mapper's signature matching.
    let mut bin_discr = empty_discr();
    bin_discr.entry(2).or_default().insert(0, NodeId(1));

    let flat = run(bin_cf, src_cf, bin_discr);

    // Both decision arms resolve via their distinct ctrl-dep signatures;
    // the uncontrolled nodes (entry, B, M, exit) share an empty signature
    // and are paired positionally in ascending id order.
    assert_eq!(flat.len(), 6);
    for i in 0..6 {
        assert_eq!(flat.get(&NodeId(i)), Some(&NodeId(i)), "node {i} should map to its identical counterpart");
    }
}

#[test]
fn simple_matched_loop_maps_header_and_body() {
    // Entry(0) -> H(1) -> {Body(2) -> H, Exit(3)}, both sides; the loop
    // matcher should pair the two headers via shared DWARF/line evidence.
    let mut bin_cf = ControlFlow::new("f", NodeId(0), Some(NodeId(3)));
    bin_cf.add_block(bin_block(0, BlockKind::Entry, 0x1000, 0x1000));
    bin_cf.add_block(bin_block(1, BlockKind::Normal, 0x1004, 0x1004));
    bin_cf.add_block(bin_block(2, BlockKind::Normal, 0x1008, 0x1008));
    bin_cf.add_block(bin_block(3, BlockKind::Exit, 0x100c, 0x100c));
    for (u, v) in [(0, 1), (1, 2), (2, 1), (1, 3)] {
        bin_cf.add_edge(NodeId(u), NodeId(v));
    }

    let mut src_cf = ControlFlow::new("f", NodeId(0), Some(NodeId(3)));
    src_cf.add_block(src_block(0, BlockKind::Entry, 1));
    src_cf.add_block(src_block(1, BlockKind::Normal, 2));
    src_cf.add_block(src_block(2, BlockKind::Normal, 3));
    src_cf.add_block(src_block(3, BlockKind::Exit, 4));
    for (u, v) in [(0, 1), (1, 2), (2, 1), (1, 3)] {
        src_cf.add_edge(NodeId(u), NodeId(v));
    }

    // line_of_addr maps every binary address in the loop body to line 2,
    // the loop matcher's only evidence for pairing headers.
    let analysis = Analysis::new(bin_cf, src_cf, true).unwrap();
    let insns = insns_at(&[0x1004, 0x1008]);
    let loop_match = analysis.match_loops(&insns, |addr| if (0x1004..=0x1008).contains(&addr) { Some(2) } else { None }, &HashSet::new());

    assert_eq!(loop_match.matched.get(&NodeId(1)), Some(&NodeId(1)));
    assert!(loop_match.skipped_bin.is_empty());
    assert!(loop_match.skipped_src.is_empty());

    let bin_discr = empty_discr();
    let annotations = LoopAnnotations::default();
    let (flat, hgm) =
        analysis.run_mapping(&bin_discr, false, &loop_match, &annotations.timing, PipelineConfig::default(), &insns, &|_| None).unwrap();

    assert_eq!(flat.get(&NodeId(1)), Some(&NodeId(1)));
    assert_eq!(flat.get(&NodeId(2)), Some(&NodeId(2)));
    // One child HGM for the matched loop body.
    assert_eq!(hgm.children.len(), 1);
    assert!(!hgm.children[0].skip);
}

#[test]
fn unrolled_source_loop_is_recorded_as_skipped_src() {
    // Binary is straight-line (the loop was unrolled); source still has a
    // loop. The loop matcher must report it as skipped_src rather than
    // erroring, per the "unrolled source loop" scenario.
    let mut bin_cf = ControlFlow::new("f", NodeId(0), Some(NodeId(2)));
    bin_cf.add_block(bin_block(0, BlockKind::Entry, 0x1000, 0x1000));
    bin_cf.add_block(bin_block(1, BlockKind::Normal, 0x1004, 0x1004));
    bin_cf.add_block(bin_block(2, BlockKind::Exit, 0x1008, 0x1008));
    bin_cf.add_edge(NodeId(0), NodeId(1));
    bin_cf.add_edge(NodeId(1), NodeId(2));

    let mut src_cf = ControlFlow::new("f", NodeId(0), Some(NodeId(3)));
    src_cf.add_block(src_block(0, BlockKind::Entry, 1));
    src_cf.add_block(src_block(1, BlockKind::Normal, 2));
    src_cf.add_block(src_block(2, BlockKind::Normal, 3));
    src_cf.add_block(src_block(3, BlockKind::Exit, 4));
    for (u, v) in [(0, 1), (1, 2), (2, 1), (1, 3)] {
        src_cf.add_edge(NodeId(u), NodeId(v));
    }

    let analysis = Analysis::new(bin_cf, src_cf, true).unwrap();
    let insns = InstructionTable::new();
    let loop_match = analysis.match_loops(&insns, |_| None, &HashSet::new());

    assert!(loop_match.matched.is_empty());
    assert_eq!(loop_match.skipped_src.len(), 1);
    assert!(loop_match.skipped_src.contains(&NodeId(1)));
}

#[test]
fn bin_only_self_loop_is_filtered_to_skipped_bin_when_matched_loop_exists() {
    // Binary has the true loop header H(1) plus a compiler-inserted
    // self-loop S(4) (e.g. a spin-wait) attributed to a different line
    // within the same source loop's range; the self-loop must be demoted
    // to skipped_bin rather than stealing the match. Simplification is
    // disabled here since H(1)'s body chain would otherwise contract away
    // the very two-node shape this scenario depends on.
    let mut bin_cf = ControlFlow::new("f", NodeId(0), Some(NodeId(5)));
    bin_cf.add_block(bin_block(0, BlockKind::Entry, 0x1000, 0x1000));
    bin_cf.add_block(bin_block(1, BlockKind::Normal, 0x1004, 0x1004));
    bin_cf.add_block(bin_block(2, BlockKind::Normal, 0x1008, 0x1008));
    bin_cf.add_block(bin_block(4, BlockKind::Normal, 0x100c, 0x100c));
    bin_cf.add_block(bin_block(5, BlockKind::Exit, 0x1010, 0x1010));
    for (u, v) in [(0, 1), (1, 2), (2, 1), (2, 4), (4, 4), (4, 5)] {
        bin_cf.add_edge(NodeId(u), NodeId(v));
    }

    let mut src_cf = ControlFlow::new("f", NodeId(0), Some(NodeId(3)));
    src_cf.add_block(src_block(0, BlockKind::Entry, 1));
    src_cf.add_block(src_block(1, BlockKind::Normal, 2));
    src_cf.add_block(src_block(2, BlockKind::Normal, 3));
    src_cf.add_block(src_block(3, BlockKind::Exit, 4));
    for (u, v) in [(0, 1), (1, 2), (2, 1), (1, 3)] {
        src_cf.add_edge(NodeId(u), NodeId(v));
    }

    let analysis = Analysis::new(bin_cf, src_cf, false).unwrap();
    let insns = insns_at(&[0x1004, 0x1008, 0x100c]);
    let loop_match = analysis.match_loops(
        &insns,
        |addr| if (0x1004..=0x1008).contains(&addr) { Some(2) } else if addr == 0x100c { Some(3) } else { None },
        &HashSet::new(),
    );

    assert_eq!(loop_match.matched.get(&NodeId(1)), Some(&NodeId(1)));
    assert!(loop_match.skipped_bin.contains(&NodeId(4)));
}
