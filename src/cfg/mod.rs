//! The CFG model: typed basic blocks (binary or source), address ranges,
//! line info, timing attribution, discriminators, block split/merge and
//! unreachable pruning.
//!
//! Grounded on the reference mapper's `fparser/control_flow.py`
//! (`ControlFlow`, `BinaryControlFlow`, `SourceControlFlow`): block typing,
//! `split_block`'s address-range surgery, `_attr_block_time`'s per-opcode
//! cost summation, `_calc_discriminators`'s per-line enumeration and
//! `find_source_block`'s overlap tie-break are all direct ports of that
//! module's behavior, since the spec calls those semantics out exactly.

pub mod var_access;

use crate::graph::{DiGraph, NodeId};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Entry,
    Exit,
    Normal,
    FunctionCall,
}

/// Inclusive `[lo, hi]` address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AddrRange {
    pub lo: u64,
    pub hi: u64,
}

impl AddrRange {
    pub fn new(lo: u64, hi: u64) -> Self {
        assert!(lo <= hi, "invalid address range [{lo:#x}, {hi:#x}]");
        AddrRange { lo, hi }
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.lo <= addr && addr <= self.hi
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceLoc {
    pub line: u32,
    pub col: u32,
}

#[derive(Debug, Clone)]
pub struct BinaryBlockData {
    pub addr_ranges: Vec<AddrRange>,
    pub cycle_cost: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SourceBlockData {
    pub begin: SourceLoc,
    pub end: SourceLoc,
    pub discriminator: u32,
    pub is_virtual: bool,
}

#[derive(Debug, Clone)]
pub enum BlockData {
    Binary(BinaryBlockData),
    Source(SourceBlockData),
}

/// One node of a [`ControlFlow`]. `calls` holds callee symbol names: at
/// most one for a binary `FunctionCall` block, possibly several for a
/// source node whose CSV row lists multiple `function.call.callees`.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: NodeId,
    pub kind: BlockKind,
    pub calls: Vec<String>,
    pub data: BlockData,
}

impl BasicBlock {
    pub fn is_function_call(&self) -> bool {
        self.kind == BlockKind::FunctionCall
    }

    pub fn callee(&self) -> Option<&str> {
        self.calls.first().map(|s| s.as_str())
    }

    pub fn addr_ranges(&self) -> &[AddrRange] {
        match &self.data {
            BlockData::Binary(b) => &b.addr_ranges,
            BlockData::Source(_) => &[],
        }
    }

    pub fn source(&self) -> Option<&SourceBlockData> {
        match &self.data {
            BlockData::Source(s) => Some(s),
            _ => None,
        }
    }

    pub fn source_mut(&mut self) -> Option<&mut SourceBlockData> {
        match &mut self.data {
            BlockData::Source(s) => Some(s),
            _ => None,
        }
    }

    pub fn binary(&self) -> Option<&BinaryBlockData> {
        match &self.data {
            BlockData::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn binary_mut(&mut self) -> Option<&mut BinaryBlockData> {
        match &mut self.data {
            BlockData::Binary(b) => Some(b),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum CfgError {
    EntryExitCollision,
    InvalidSplit(String),
    MissingTiming { function: String, mnemonics: Vec<String> },
}

impl std::fmt::Display for CfgError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CfgError::EntryExitCollision => write!(f, "entry and exit must be distinct nodes"),
            CfgError::InvalidSplit(msg) => write!(f, "invalid block split: {msg}"),
            CfgError::MissingTiming { function, mnemonics } => write!(
                f,
                "missing opcode timing for function '{function}': {}",
                mnemonics.join(", ")
            ),
        }
    }
}

impl std::error::Error for CfgError {}

/// A labeled digraph of [`BasicBlock`]s with distinguished entry/exit.
#[derive(Debug, Clone)]
pub struct ControlFlow {
    pub name: String,
    graph: DiGraph,
    blocks: HashMap<NodeId, BasicBlock>,
    entry_id: NodeId,
    exit_id: Option<NodeId>,
    max_id: u32,
    terminates: bool,
}

impl ControlFlow {
    pub fn new(name: impl Into<String>, entry_id: NodeId, exit_id: Option<NodeId>) -> Self {
        if let Some(e) = exit_id {
            assert_ne!(entry_id, e, "entry and exit must be distinct");
        }
        let max_id = exit_id.map(|e| e.as_u32()).unwrap_or(0).max(entry_id.as_u32());
        ControlFlow {
            name: name.into(),
            graph: DiGraph::new(),
            blocks: HashMap::new(),
            entry_id,
            exit_id,
            max_id,
            terminates: true,
        }
    }

    pub fn add_block(&mut self, bb: BasicBlock) {
        self.max_id = self.max_id.max(bb.id.as_u32());
        self.graph.add_node(bb.id);
        self.blocks.insert(bb.id, bb);
    }

    pub fn add_edge(&mut self, u: NodeId, v: NodeId) {
        self.graph.add_edge(u, v);
    }

    pub fn graph(&self) -> &DiGraph {
        &self.graph
    }

    pub fn entry_id(&self) -> NodeId {
        self.entry_id
    }

    pub fn exit_id(&self) -> Option<NodeId> {
        self.exit_id
    }

    pub fn max_id(&self) -> u32 {
        self.max_id
    }

    pub fn terminates(&self) -> bool {
        self.terminates
    }

    pub fn block(&self, id: NodeId) -> Option<&BasicBlock> {
        self.blocks.get(&id)
    }

    pub fn block_mut(&mut self, id: NodeId) -> Option<&mut BasicBlock> {
        self.blocks.get_mut(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.graph.nodes()
    }

    pub fn func_calls(&self) -> Vec<(NodeId, &str)> {
        self.blocks
            .values()
            .filter_map(|b| b.callee().map(|c| (b.id, c)))
            .collect()
    }

    /// Removes nodes unreachable from `entry_id` via forward DFS. If `exit`
    /// was removed, the function is recorded as non-terminating.
    pub fn prune_unreachable(&mut self) {
        let reach = self.graph.reachable_from(self.entry_id);
        let doomed: Vec<NodeId> = self.graph.nodes().filter(|n| !reach.contains(n)).collect();
        for n in doomed {
            self.graph.remove_node(n);
            self.blocks.remove(&n);
        }
        if let Some(e) = self.exit_id {
            if !self.graph.has_node(e) {
                self.exit_id = None;
                self.terminates = false;
                log::warn!("function '{}' has no reachable Exit; treating as non-terminating", self.name);
            }
        }
    }

    /// Contracts `u -> v` chains where `out_degree(u) == 1`,
    /// `in_degree(v) == 1`, and neither endpoint is Entry/Exit/FunctionCall.
    /// Address ranges concatenate in edge order; source `begin` becomes the
    /// lexicographically smaller of the two `(line, col)` pairs.
    pub fn simplify(&mut self) {
        loop {
            let candidate = self.graph.nodes().find_map(|u| {
                if self.graph.out_degree(u) != 1 {
                    return None;
                }
                let v = self.graph.successors(u)[0];
                if u == v || self.graph.in_degree(v) != 1 {
                    return None;
                }
                if Some(u) == self.exit_id || Some(v) == self.exit_id {
                    return None;
                }
                if u == self.entry_id {
                    return None; // Entry is preserved
                }
                let bu = self.blocks.get(&u)?;
                let bv = self.blocks.get(&v)?;
                if bu.is_function_call() || bv.is_function_call() {
                    return None;
                }
                Some((u, v))
            });
            let Some((u, v)) = candidate else { break };
            self.merge_into(u, v);
        }
    }

    fn merge_into(&mut self, u: NodeId, v: NodeId) {
        let bv = self.blocks.remove(&v).expect("merge target missing");
        {
            let bu = self.blocks.get_mut(&u).expect("merge source missing");
            match (&mut bu.data, bv.data) {
                (BlockData::Binary(a), BlockData::Binary(b)) => {
                    a.addr_ranges.extend(b.addr_ranges);
                }
                (BlockData::Source(a), BlockData::Source(b)) => {
                    let (a_key, b_key) = ((a.begin.line, a.begin.col), (b.begin.line, b.begin.col));
                    if b_key < a_key {
                        a.begin = b.begin;
                    }
                    if (b.end.line, b.end.col) > (a.end.line, a.end.col) {
                        a.end = b.end;
                    }
                }
                _ => panic!("cannot merge a binary block with a source block"),
            }
            bu.calls.extend(bv.calls);
        }
        let succs: Vec<NodeId> = self.graph.successors(v).to_vec();
        self.graph.remove_node(v);
        for s in succs {
            self.graph.add_edge(u, s);
        }
    }

    /// Splits `bb` at `addr`, which must not be the block's final address.
    /// `next_addr` is the start address of the instruction right after
    /// `addr` (supplied by the instruction table). Returns the id of the
    /// newly created second half.
    pub fn split_block(&mut self, bb: NodeId, addr: u64, next_addr: u64) -> Result<NodeId, CfgError> {
        if Some(bb) == Some(self.entry_id) || Some(bb) == self.exit_id {
            return Err(CfgError::InvalidSplit("cannot split Entry/Exit".into()));
        }
        let block = self
            .blocks
            .get(&bb)
            .ok_or_else(|| CfgError::InvalidSplit("unknown block".into()))?;
        if block.kind != BlockKind::Normal {
            return Err(CfgError::InvalidSplit("can only split Normal blocks".into()));
        }
        let ranges = block.addr_ranges().to_vec();
        if ranges.last().map(|r| r.hi) == Some(addr) {
            return Err(CfgError::InvalidSplit("addr is the block's last address".into()));
        }

        let mut ar1 = Vec::new();
        let mut ar2 = Vec::new();
        let mut found = false;
        for r in &ranges {
            if r.contains(addr) {
                assert!(!found, "overlapping address ranges");
                if addr == r.hi {
                    ar1.push(*r);
                } else {
                    ar1.push(AddrRange::new(r.lo, addr));
                    ar2.push(AddrRange::new(next_addr, r.hi));
                }
                found = true;
                continue;
            }
            if !found {
                ar1.push(*r);
            } else {
                ar2.push(*r);
            }
        }
        if !found {
            return Err(CfgError::InvalidSplit("addr not within block's ranges".into()));
        }

        let preds: Vec<NodeId> = self.graph.predecessors(bb).to_vec();
        let succs: Vec<NodeId> = self.graph.successors(bb).to_vec();
        let calls = self.blocks.get(&bb).unwrap().calls.clone();

        self.graph.remove_node(bb);
        self.blocks.remove(&bb);

        let id1 = bb;
        let id2 = NodeId(self.max_id + 1);
        self.max_id += 1;

        self.add_block(BasicBlock {
            id: id1,
            kind: BlockKind::Normal,
            calls: calls.clone(),
            data: BlockData::Binary(BinaryBlockData { addr_ranges: ar1, cycle_cost: None }),
        });
        self.add_block(BasicBlock {
            id: id2,
            kind: BlockKind::Normal,
            calls: Vec::new(),
            data: BlockData::Binary(BinaryBlockData { addr_ranges: ar2, cycle_cost: None }),
        });
        for p in preds {
            self.graph.add_edge(p, id1);
        }
        for s in succs {
            self.graph.add_edge(id2, s);
        }
        self.graph.add_edge(id1, id2);
        Ok(id2)
    }

    /// Sums per-instruction max-cycle cost into each binary block's
    /// `cycle_cost`, given a mnemonic -> (min, max) timing table and the
    /// instruction stream. Fails listing every unresolved mnemonic.
    pub fn attribute_block_times(
        &mut self,
        insns: &InstructionTable,
        timing: &HashMap<String, (u64, u64)>,
    ) -> Result<(), CfgError> {
        let mut missing: std::collections::BTreeSet<String> = Default::default();
        let mut costs = Vec::new();
        for id in self.graph.nodes() {
            let Some(block) = self.blocks.get(&id) else { continue };
            if block.binary().is_none() {
                continue;
            }
            let mut total = 0u64;
            for range in block.addr_ranges() {
                for insn in insns.in_range(*range) {
                    match timing.get(&insn.mnemonic) {
                        Some(&(_min, max)) => total += max,
                        None => {
                            missing.insert(insn.mnemonic.clone());
                        }
                    }
                }
            }
            costs.push((id, total));
        }
        if !missing.is_empty() {
            return Err(CfgError::MissingTiming {
                function: self.name.clone(),
                mnemonics: missing.into_iter().collect(),
            });
        }
        for (id, total) in costs {
            if let Some(b) = self.blocks.get_mut(&id).and_then(|b| b.binary_mut()) {
                b.cycle_cost = Some(total);
            }
        }
        Ok(())
    }

    pub fn instructions<'a>(&self, block: NodeId, insns: &'a InstructionTable) -> Vec<&'a Instruction> {
        let Some(b) = self.block(block) else { return Vec::new() };
        let mut out = Vec::new();
        for r in b.addr_ranges() {
            out.extend(insns.in_range(*r));
        }
        out
    }

    pub fn block_containing_addr(&self, addr: u64) -> Option<NodeId> {
        self.blocks
            .values()
            .find(|b| b.addr_ranges().iter().any(|r| r.contains(addr)))
            .map(|b| b.id)
    }

    /// `find_source_block` tie-break, replicated exactly: among candidate
    /// source blocks whose `[begin, end]` span covers `(line, column)`,
    /// keep the one with the largest `(begin.line, begin.col)`.
    pub fn find_source_block(&self, line: u32, column: u32, candidates: &[NodeId]) -> Option<NodeId> {
        assert_ne!(line, 0, "requesting source block at line zero");
        let mut best: Option<(NodeId, (u32, u32))> = None;
        for &n in candidates {
            let Some(s) = self.block(n).and_then(|b| b.source()) else { continue };
            let covers = (line > s.begin.line || (line == s.begin.line && column >= s.begin.col))
                && (line < s.end.line || (line == s.end.line && column <= s.end.col));
            if !covers {
                continue;
            }
            let key = (s.begin.line, s.begin.col);
            match &best {
                None => best = Some((n, key)),
                Some((_, bk)) => {
                    if key.0 > bk.0 || (key.0 == bk.0 && key.1 > bk.1) {
                        best = Some((n, key));
                    }
                }
            }
        }
        best.map(|(n, _)| n)
    }

    pub fn find_source_blocks_line_only(&self, line: u32, candidates: &[NodeId]) -> Vec<NodeId> {
        candidates
            .iter()
            .copied()
            .filter(|&n| {
                self.block(n)
                    .and_then(|b| b.source())
                    .map(|s| line == 0 || (s.begin.line <= line && line <= s.end.line))
                    .unwrap_or(false)
            })
            .collect()
    }
}

/// `line -> discriminator -> [src BB]`, as built by [`compute_source_discriminators`].
pub type LineDiscrIndex = HashMap<u32, HashMap<u32, Vec<NodeId>>>;

/// Assigns each source BB a local discriminator by grouping BBs that begin
/// on the same line, ordering by start column, and enumerating from 0. If a
/// BB's span crosses into a later line, that end-line also gets an entry
/// (keyed by the same node, `is_end = true`) so a later, distinct BB
/// starting that line doesn't collide with a disc of 0.
pub fn compute_source_discriminators(cf: &mut ControlFlow) -> LineDiscrIndex {
    let mut bb_per_line: HashMap<u32, Vec<(u32, NodeId, bool)>> = HashMap::new();
    let ids: Vec<NodeId> = cf.nodes().collect();
    for id in ids {
        let Some(s) = cf.block(id).and_then(|b| b.source()) else { continue };
        let (begin, end) = (s.begin, s.end);
        bb_per_line.entry(begin.line).or_default().push((begin.col, id, false));
        if begin.line < end.line {
            bb_per_line.entry(end.line).or_default().push((end.col, id, true));
        }
    }

    let mut index: LineDiscrIndex = HashMap::new();
    for (line, mut entries) in bb_per_line {
        entries.sort_by_key(|&(col, id, _)| (col, id.as_u32()));
        for (disc, &(_, id, is_end)) in entries.iter().enumerate() {
            let disc = disc as u32;
            index.entry(line).or_default().entry(disc).or_default().push(id);
            if !is_end {
                if let Some(s) = cf.block_mut(id).and_then(|b| b.source_mut()) {
                    s.discriminator = disc;
                }
            }
        }
    }
    index
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub addr: u64,
    pub mnemonic: String,
    pub operands: Vec<String>,
    pub targets: Vec<u64>,
}

/// Addr-sorted instruction stream for one section, with range queries used
/// by `instructions(block)` and timing/variable-access passes.
#[derive(Debug, Clone, Default)]
pub struct InstructionTable {
    by_addr: std::collections::BTreeMap<u64, Instruction>,
}

impl InstructionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, insn: Instruction) {
        self.by_addr.insert(insn.addr, insn);
    }

    pub fn get(&self, addr: u64) -> Option<&Instruction> {
        self.by_addr.get(&addr)
    }

    pub fn in_range(&self, r: AddrRange) -> Vec<&Instruction> {
        self.by_addr.range(r.lo..=r.hi).map(|(_, i)| i).collect()
    }

    /// The address of the instruction immediately after `addr`, if any.
    pub fn next_insn_address(&self, addr: u64) -> Option<u64> {
        self.by_addr.range((std::ops::Bound::Excluded(addr), std::ops::Bound::Unbounded)).next().map(|(&a, _)| a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src_block(id: u32, bl: u32, bc: u32, el: u32, ec: u32) -> BasicBlock {
        BasicBlock {
            id: NodeId(id),
            kind: BlockKind::Normal,
            calls: Vec::new(),
            data: BlockData::Source(SourceBlockData {
                begin: SourceLoc { line: bl, col: bc },
                end: SourceLoc { line: el, col: ec },
                discriminator: 0,
                is_virtual: false,
            }),
        }
    }

    #[test]
    fn prune_unreachable_drops_dead_nodes_and_unsets_exit() {
        let mut cf = ControlFlow::new("f", NodeId(0), Some(NodeId(2)));
        cf.add_block(BasicBlock { id: NodeId(0), kind: BlockKind::Entry, calls: vec![], data: BlockData::Binary(BinaryBlockData { addr_ranges: vec![], cycle_cost: None }) });
        cf.add_block(BasicBlock { id: NodeId(1), kind: BlockKind::Normal, calls: vec![], data: BlockData::Binary(BinaryBlockData { addr_ranges: vec![], cycle_cost: None }) });
        cf.add_block(BasicBlock { id: NodeId(5), kind: BlockKind::Normal, calls: vec![], data: BlockData::Binary(BinaryBlockData { addr_ranges: vec![], cycle_cost: None }) });
        cf.add_edge(NodeId(0), NodeId(1));
        // node 5 and exit(2) are unreachable
        cf.prune_unreachable();
        assert!(cf.block(NodeId(5)).is_none());
        assert_eq!(cf.exit_id(), None);
        assert!(!cf.terminates());
    }

    #[test]
    fn discriminators_enumerate_by_column_within_a_line() {
        let mut cf = ControlFlow::new("f", NodeId(0), Some(NodeId(3)));
        cf.add_block(src_block(0, 1, 10, 1, 20));
        cf.add_block(src_block(1, 1, 0, 1, 5));
        cf.add_edge(NodeId(0), NodeId(1));
        let idx = compute_source_discriminators(&mut cf);
        assert_eq!(cf.block(NodeId(1)).unwrap().source().unwrap().discriminator, 0);
        assert_eq!(cf.block(NodeId(0)).unwrap().source().unwrap().discriminator, 1);
        assert!(idx.contains_key(&1));
    }

    #[test]
    fn find_source_block_breaks_ties_on_largest_start() {
        let mut cf = ControlFlow::new("f", NodeId(0), Some(NodeId(9)));
        cf.add_block(src_block(0, 1, 0, 5, 0));
        cf.add_block(src_block(1, 2, 0, 3, 0));
        let found = cf.find_source_block(2, 5, &[NodeId(0), NodeId(1)]);
        assert_eq!(found, Some(NodeId(1)));
    }

    #[test]
    fn split_block_preserves_instruction_count() {
        let mut cf = ControlFlow::new("f", NodeId(0), Some(NodeId(9)));
        cf.add_block(BasicBlock {
            id: NodeId(1),
            kind: BlockKind::Normal,
            calls: vec![],
            data: BlockData::Binary(BinaryBlockData { addr_ranges: vec![AddrRange::new(0x100, 0x110)], cycle_cost: None }),
        });
        cf.add_edge(NodeId(0), NodeId(1));
        let second = cf.split_block(NodeId(1), 0x104, 0x108).unwrap();
        let first_ranges = cf.block(NodeId(1)).unwrap().addr_ranges().to_vec();
        let second_ranges = cf.block(second).unwrap().addr_ranges().to_vec();
        assert_eq!(first_ranges, vec![AddrRange::new(0x100, 0x104)]);
        assert_eq!(second_ranges, vec![AddrRange::new(0x108, 0x110)]);
        assert_eq!(cf.graph().successors(NodeId(1)), &[second]);
    }
}
