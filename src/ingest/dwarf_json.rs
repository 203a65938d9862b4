//! DWARF JSON: DIE tree, line-number table and the address encoding used
//! for `high_pc` (`S_<signed>_U_<unsigned>` denotes a DWARF-constant offset
//! from `low_pc` rather than an absolute address).

use super::IngestError;
use crate::cfg::ControlFlow;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
struct RawDie {
    #[serde(rename = "Offset")]
    offset: u64,
    #[serde(rename = "ParentOffset")]
    parent_offset: i64,
    #[serde(rename = "Tag")]
    tag: String,
    #[serde(rename = "Attributes")]
    attributes: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawLineEntry {
    #[serde(rename = "LineNumber")]
    line_number: u32,
    #[serde(rename = "LineOffset")]
    line_offset: u32,
    #[serde(rename = "Discriminator", default)]
    discriminator: u32,
}

#[derive(Debug, Deserialize)]
struct RawDebugInfo {
    #[serde(rename = "DIEs")]
    dies: Vec<RawDie>,
    #[serde(rename = "LineInfoEntries")]
    line_info_entries: HashMap<String, RawLineEntry>,
    #[serde(rename = "LineInfoMap")]
    line_info_map: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "Type")]
    #[allow(dead_code)]
    ty: String,
    #[serde(rename = "Data")]
    data: RawDebugInfo,
}

#[derive(Debug, Clone)]
pub struct Die {
    pub offset: u64,
    pub parent_offset: Option<u64>,
    pub tag: String,
    pub attributes: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy)]
pub struct LineEntry {
    pub line: u32,
    pub column: u32,
    pub discriminator: u32,
}

pub struct DebugInfo {
    pub dies: Vec<Die>,
    by_offset: HashMap<u64, usize>,
    children: HashMap<u64, Vec<u64>>,
    line_by_addr: HashMap<u64, LineEntry>,
}

/// Parses a `high_pc` value: either an absolute address, or a
/// `S_<signed>_U_<unsigned>` constant-offset encoding (the DWARF spec
/// allows `high_pc` to be a constant offset from `low_pc`).
pub fn parse_high_pc(low_pc: u64, raw: &serde_json::Value) -> Option<u64> {
    if let Some(n) = raw.as_u64() {
        return Some(n);
    }
    let s = raw.as_str()?;
    let rest = s.strip_prefix("S_")?;
    let (signed, rest) = rest.split_once("_U_")?;
    let _signed: i64 = signed.parse().ok()?;
    let unsigned: u64 = rest.parse().ok()?;
    Some(low_pc.wrapping_add(unsigned))
}

impl DebugInfo {
    pub fn parse(text: &str) -> Result<Self, IngestError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let raw = envelope.data;

        let mut dies = Vec::with_capacity(raw.dies.len());
        let mut by_offset = HashMap::new();
        let mut children: HashMap<u64, Vec<u64>> = HashMap::new();
        for (i, d) in raw.dies.into_iter().enumerate() {
            let parent = if d.parent_offset < 0 { None } else { Some(d.parent_offset as u64) };
            if let Some(p) = parent {
                children.entry(p).or_default().push(d.offset);
            }
            by_offset.insert(d.offset, i);
            dies.push(Die { offset: d.offset, parent_offset: parent, tag: d.tag, attributes: d.attributes });
        }

        let mut line_by_addr = HashMap::new();
        for (addr_str, idx_str) in &raw.line_info_map {
            let Ok(addr) = addr_str.parse::<u64>() else { continue };
            let Some(entry) = raw.line_info_entries.get(idx_str) else { continue };
            line_by_addr.insert(
                addr,
                LineEntry { line: entry.line_number, column: entry.line_offset, discriminator: entry.discriminator },
            );
        }

        Ok(DebugInfo { dies, by_offset, children, line_by_addr })
    }

    pub fn die(&self, offset: u64) -> Option<&Die> {
        self.by_offset.get(&offset).map(|&i| &self.dies[i])
    }

    pub fn children_of(&self, offset: u64) -> &[u64] {
        self.children.get(&offset).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn line_at(&self, addr: u64) -> Option<LineEntry> {
        self.line_by_addr.get(&addr).copied()
    }

    pub fn line_number_of(&self, addr: u64) -> Option<u32> {
        self.line_at(addr).map(|e| e.line)
    }
}

#[derive(Debug)]
pub struct InlinedSubroutine {
    pub die_offset: u64,
    pub low_pc: u64,
    pub high_pc: u64,
    pub entry_block: Option<crate::graph::NodeId>,
    pub exit_block: Option<crate::graph::NodeId>,
}

#[derive(Debug)]
pub enum InlineError {
    NestedInlining { outer: u64, inner: u64 },
}

impl std::fmt::Display for InlineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InlineError::NestedInlining { outer, inner } => {
                write!(f, "inlined subroutine at DIE {inner:#x} is nested inside DIE {outer:#x}; not supported")
            }
        }
    }
}

impl std::error::Error for InlineError {}

/// Finds every `DW_TAG_inlined_subroutine` and resolves the binary block
/// containing each endpoint. Detection and endpoint resolution only — the
/// actual collapse into a virtual call node is left as a stub per the
/// mapping specification's §4.D non-goal.
pub fn find_inlined_subroutines(dbg: &DebugInfo, bin_cf: &ControlFlow) -> Result<Vec<InlinedSubroutine>, InlineError> {
    let mut out = Vec::new();
    let mut seen_ranges: Vec<(u64, u64, u64)> = Vec::new();

    for die in &dbg.dies {
        if die.tag != "DW_TAG_inlined_subroutine" {
            continue;
        }
        let Some(low_pc) = die.attributes.get("low_pc").and_then(|v| v.as_u64()) else { continue };
        let Some(high_pc) = die.attributes.get("high_pc").and_then(|v| parse_high_pc(low_pc, v)) else { continue };

        for &(slo, shi, soff) in &seen_ranges {
            if low_pc < shi && slo < high_pc {
                return Err(InlineError::NestedInlining { outer: soff, inner: die.offset });
            }
        }
        seen_ranges.push((low_pc, high_pc, die.offset));

        out.push(InlinedSubroutine {
            die_offset: die.offset,
            low_pc,
            high_pc,
            entry_block: bin_cf.block_containing_addr(low_pc),
            exit_block: bin_cf.block_containing_addr(high_pc.saturating_sub(1)),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_constant_offset_high_pc() {
        let v = serde_json::json!("S_0_U_16");
        assert_eq!(parse_high_pc(0x100, &v), Some(0x110));
    }

    #[test]
    fn absolute_high_pc_passes_through() {
        let v = serde_json::json!(0x200);
        assert_eq!(parse_high_pc(0x100, &v), Some(0x200));
    }
}
