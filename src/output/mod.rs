//! CSV output writer: one record per source BB, per function.
//!
//! Grounded on §6's output format and §4.I's `total_cycles` formula. Column
//! layout and the `[<source_file>,<func>]` wrapper header follow the
//! reference mapper's `output.py` exactly, since downstream WCET tooling
//! parses this format directly.

use crate::cfg::ControlFlow;
use crate::graph::NodeId;
use crate::matching::{ExecCount, GraphMap};
use std::collections::HashMap;
use std::io::{self, Write};

/// One row of the per-function mapping CSV.
#[derive(Debug, Clone)]
pub struct OutputRow {
    pub src_bb: NodeId,
    pub line: u32,
    pub col: u32,
    pub bin_bbs: Vec<NodeId>,
    pub total_cycles: u64,
    pub callees: Vec<String>,
}

/// Builds one [`OutputRow`] per source BB from the flattened map and the
/// binary CFG's per-block cycle costs, summing `exec_count.hi * block_time`
/// over every binary BB attributed to that source BB.
pub fn build_rows(src_cf: &ControlFlow, bin_cf: &ControlFlow, flat: &HashMap<NodeId, NodeId>, gm: &GraphMap) -> Vec<OutputRow> {
    let mut by_src: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for (&b, &s) in flat {
        by_src.entry(s).or_default().push(b);
    }

    let mut rows = Vec::new();
    let mut src_ids: Vec<NodeId> = src_cf.nodes().collect();
    src_ids.sort_by_key(|n| n.as_u32());

    for src_bb in src_ids {
        let Some(s) = src_cf.block(src_bb).and_then(|b| b.source()) else { continue };
        let mut bin_bbs = by_src.get(&src_bb).cloned().unwrap_or_default();
        bin_bbs.sort_by_key(|n| n.as_u32());

        let mut total_cycles = 0u64;
        let mut callees = Vec::new();
        for &b in &bin_bbs {
            let contribution = match gm.cycle_override(b) {
                Some(cycles) => cycles,
                None => {
                    let exec = gm.exec_count(b).unwrap_or(ExecCount::exact(1));
                    let block_time = bin_cf.block(b).and_then(|bb| bb.binary()).and_then(|d| d.cycle_cost).unwrap_or(0);
                    exec.hi.saturating_mul(block_time)
                }
            };
            total_cycles = total_cycles.saturating_add(contribution);
            if let Some(bb) = bin_cf.block(b) {
                callees.extend(bb.calls.iter().cloned());
            }
        }

        rows.push(OutputRow { src_bb, line: s.begin.line, col: s.begin.col, bin_bbs, total_cycles, callees });
    }
    rows
}

/// Writes `rows` as one function's CSV block (no wrapper header).
pub fn write_function_csv<W: Write>(w: &mut W, rows: &[OutputRow]) -> io::Result<()> {
    writeln!(w, "# Source_BB; Line_Col; BinaryBB+; ExecTime[,fcall]*")?;
    for row in rows {
        let bin_list = row.bin_bbs.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(",");
        write!(w, "{}; l{}c{}; {}; {}", row.src_bb, row.line, row.col, bin_list, row.total_cycles)?;
        for callee in &row.callees {
            write!(w, ",{callee}")?;
        }
        writeln!(w)?;
    }
    Ok(())
}

/// Writes the `[<source_file>,<func>]` wrapper header followed by one
/// function's rows, for the concatenated multi-function output file.
pub fn write_function_block<W: Write>(w: &mut W, source_file: &str, func: &str, rows: &[OutputRow]) -> io::Result<()> {
    writeln!(w, "[{source_file},{func}]")?;
    write_function_csv(w, rows)?;
    writeln!(w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{BasicBlock, BinaryBlockData, BlockData, BlockKind, SourceBlockData, SourceLoc};

    #[test]
    fn total_cycles_sums_exec_count_times_block_time() {
        let mut src = ControlFlow::new("f", NodeId(0), Some(NodeId(9)));
        src.add_block(BasicBlock {
            id: NodeId(1),
            kind: BlockKind::Normal,
            calls: vec![],
            data: BlockData::Source(SourceBlockData { begin: SourceLoc { line: 3, col: 1 }, end: SourceLoc { line: 3, col: 10 }, discriminator: 0, is_virtual: false }),
        });

        let mut bin = ControlFlow::new("f", NodeId(0), Some(NodeId(9)));
        bin.add_block(BasicBlock {
            id: NodeId(100),
            kind: BlockKind::Normal,
            calls: vec![],
            data: BlockData::Binary(BinaryBlockData { addr_ranges: vec![], cycle_cost: Some(5) }),
        });

        let mut flat = HashMap::new();
        flat.insert(NodeId(100), NodeId(1));
        let mut gm = GraphMap::new();
        gm.set_exec_count(NodeId(100), ExecCount::exact(3));

        let rows = build_rows(&src, &bin, &flat, &gm);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_cycles, 15);
    }

    #[test]
    fn cycle_override_bypasses_the_exec_count_times_block_time_product() {
        let mut src = ControlFlow::new("f", NodeId(0), Some(NodeId(9)));
        src.add_block(BasicBlock {
            id: NodeId(1),
            kind: BlockKind::Normal,
            calls: vec![],
            data: BlockData::Source(SourceBlockData { begin: SourceLoc { line: 3, col: 1 }, end: SourceLoc { line: 3, col: 10 }, discriminator: 0, is_virtual: false }),
        });

        let mut bin = ControlFlow::new("f", NodeId(0), Some(NodeId(9)));
        bin.add_block(BasicBlock {
            id: NodeId(100),
            kind: BlockKind::Normal,
            calls: vec![],
            data: BlockData::Binary(BinaryBlockData { addr_ranges: vec![], cycle_cost: Some(5) }),
        });

        let mut flat = HashMap::new();
        flat.insert(NodeId(100), NodeId(1));
        let mut gm = GraphMap::new();
        gm.set_exec_count(NodeId(100), ExecCount::exact(3));
        gm.set_cycle_override(NodeId(100), 500);

        let rows = build_rows(&src, &bin, &flat, &gm);
        assert_eq!(rows[0].total_cycles, 500);
    }

    #[test]
    fn csv_line_format_matches_the_wire_layout() {
        let row = OutputRow { src_bb: NodeId(1), line: 3, col: 1, bin_bbs: vec![NodeId(100)], total_cycles: 15, callees: vec![] };
        let mut buf = Vec::new();
        write_function_csv(&mut buf, &[row]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("n1; l3c1; n100; 15"));
    }
}
