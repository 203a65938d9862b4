//! Binary CFG JSON: `{"Type":"Flow"|"InsnMap"|"SymbolMap", ...}` records,
//! newline-blank-line delimited.

use super::IngestError;
use crate::cfg::{AddrRange, BasicBlock, BinaryBlockData, BlockData, BlockKind, ControlFlow, Instruction, InstructionTable};
use crate::graph::NodeId;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
#[serde(tag = "Type")]
enum Record {
    Flow {
        #[serde(rename = "Name")]
        name: String,
        #[serde(rename = "BasicBlocks")]
        basic_blocks: Vec<RawBlock>,
        #[serde(rename = "Edges")]
        edges: Vec<(u32, u32)>,
    },
    InsnMap {
        #[serde(rename = "Section")]
        #[allow(dead_code)]
        section: String,
        #[serde(rename = "Instructions")]
        instructions: Vec<RawInsn>,
    },
    SymbolMap {
        #[serde(rename = "Section")]
        #[allow(dead_code)]
        section: String,
        #[serde(rename = "Symbols")]
        symbols: Vec<RawSymbol>,
    },
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    #[serde(rename = "ID")]
    id: u32,
    #[serde(rename = "BlockType")]
    block_type: String,
    #[serde(rename = "AddrRanges", default)]
    addr_ranges: Vec<[u64; 2]>,
    #[serde(default)]
    calls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawInsn {
    #[serde(rename = "Addr")]
    addr: u64,
    #[serde(rename = "Mnem")]
    mnem: String,
    #[serde(rename = "Op", default)]
    op: Vec<String>,
    #[serde(rename = "Target", default)]
    target: Vec<u64>,
}

#[derive(Debug, Deserialize)]
struct RawSymbol {
    #[serde(rename = "Addr")]
    addr: u64,
    #[serde(rename = "Symbol")]
    symbol: String,
}

pub struct BinaryProgram {
    pub flows: HashMap<String, ControlFlow>,
    pub instructions: InstructionTable,
    pub symbols: HashMap<u64, String>,
}

fn block_kind(block_type: &str) -> Option<BlockKind> {
    match block_type.to_lowercase().as_str() {
        "entry" => Some(BlockKind::Entry),
        "exit" => Some(BlockKind::Exit),
        "normal" => Some(BlockKind::Normal),
        "functioncall" => Some(BlockKind::FunctionCall),
        _ => None,
    }
}

fn parse_flow(name: String, basic_blocks: Vec<RawBlock>, edges: Vec<(u32, u32)>) -> Result<ControlFlow, IngestError> {
    let entry = basic_blocks
        .iter()
        .find(|b| b.block_type.eq_ignore_ascii_case("entry"))
        .map(|b| NodeId(b.id))
        .ok_or_else(|| IngestError::Schema(format!("function '{name}' has no Entry block")))?;
    let exit = basic_blocks.iter().find(|b| b.block_type.eq_ignore_ascii_case("exit")).map(|b| NodeId(b.id));

    let mut cf = ControlFlow::new(name.clone(), entry, exit);
    for raw in basic_blocks {
        let Some(kind) = block_kind(&raw.block_type) else {
            log::error!("function '{name}': unknown block type '{}'", raw.block_type);
            continue;
        };
        if kind != BlockKind::Entry && kind != BlockKind::Exit && raw.addr_ranges.is_empty() {
            log::error!("function '{name}': block {} has invalid AddrRanges", raw.id);
            continue;
        }
        let ranges = raw.addr_ranges.iter().map(|r| AddrRange::new(r[0], r[1])).collect();
        cf.add_block(BasicBlock {
            id: NodeId(raw.id),
            kind,
            calls: raw.calls,
            data: BlockData::Binary(BinaryBlockData { addr_ranges: ranges, cycle_cost: None }),
        });
    }
    for (u, v) in edges {
        cf.add_edge(NodeId(u), NodeId(v));
    }
    Ok(cf)
}

/// Parses a blank-line-delimited stream of JSON records into a
/// [`BinaryProgram`]. Malformed JSON aborts the whole load (fatal, per the
/// error taxonomy).
pub fn parse(text: &str) -> Result<BinaryProgram, IngestError> {
    let mut flows = HashMap::new();
    let mut instructions = InstructionTable::new();
    let mut symbols = HashMap::new();

    for chunk in text.split("\n\n").map(str::trim).filter(|s| !s.is_empty()) {
        let record: Record = serde_json::from_str(chunk)?;
        match record {
            Record::Flow { name, basic_blocks, edges } => {
                let cf = parse_flow(name.clone(), basic_blocks, edges)?;
                flows.insert(name, cf);
            }
            Record::InsnMap { instructions: raw, .. } => {
                for i in raw {
                    instructions.insert(Instruction { addr: i.addr, mnemonic: i.mnem, operands: i.op, targets: i.target });
                }
            }
            Record::SymbolMap { symbols: raw, .. } => {
                for s in raw {
                    symbols.insert(s.addr, s.symbol);
                }
            }
        }
    }
    Ok(BinaryProgram { flows, instructions, symbols })
}
