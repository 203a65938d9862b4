//! Source CFG CSV: one function per blank-line-delimited block, each
//! starting with a `#col1;col2;...` header naming that block's columns
//! (the optional trailing `VarWrite;VarRead` pair may or may not be
//! present).

use super::IngestError;
use crate::cfg::{BasicBlock, BlockData, BlockKind, ControlFlow, SourceBlockData, SourceLoc};
use crate::graph::NodeId;
use std::collections::HashMap;

const REQUIRED_COLUMNS: &[&str] = &[
    "BB.index",
    "BB.type",
    "BB.label",
    "File",
    "Subprogram",
    "Line.Begin",
    "Col.Begin",
    "Line.End",
    "Col.End",
    "Successors",
    "function.call.callees",
    "Exec.Count",
    "Exec.Time.Per",
    "function.call.type",
    "Code",
];

fn block_kind(bb_type: &str) -> BlockKind {
    match bb_type {
        "entry" => BlockKind::Entry,
        "exit" => BlockKind::Exit,
        "virtual node" => BlockKind::Normal,
        _ => BlockKind::Normal,
    }
}

fn parse_header(line: &str) -> Result<HashMap<String, usize>, IngestError> {
    let line = line.strip_prefix('#').ok_or_else(|| IngestError::Schema("source CSV block missing header line".into()))?;
    let cols: Vec<&str> = line.split(';').map(str::trim).collect();
    for required in REQUIRED_COLUMNS {
        if !cols.contains(required) {
            return Err(IngestError::Schema(format!("source CSV header missing required column '{required}'")));
        }
    }
    Ok(cols.into_iter().enumerate().map(|(i, c)| (c.to_string(), i)).collect())
}

fn field<'a>(fields: &'a [&'a str], idx: &HashMap<String, usize>, name: &str) -> Option<&'a str> {
    idx.get(name).and_then(|&i| fields.get(i)).copied()
}

/// Parses one function's CSV block (header line + data rows) into a
/// [`ControlFlow`] with [`crate::cfg::SourceBlockData`] nodes. Discriminators
/// are not set here; call [`crate::cfg::compute_source_discriminators`]
/// once the whole flow is built. The function name is taken from the
/// `Subprogram` column of the first row.
pub fn parse_function_block(text: &str) -> Result<ControlFlow, IngestError> {
    let mut lines = text.lines();
    let header_line = lines.next().ok_or_else(|| IngestError::Schema("empty source CSV block".into()))?;
    let idx = parse_header(header_line)?;

    let mut rows: Vec<(u32, Vec<String>)> = Vec::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<String> = line.splitn(idx.len(), ';').map(|s| s.trim().to_string()).collect();
        let bb_index: u32 = field(&fields.iter().map(String::as_str).collect::<Vec<_>>(), &idx, "BB.index")
            .ok_or_else(|| IngestError::Schema("row missing BB.index".into()))?
            .parse()
            .map_err(|_| IngestError::Schema("BB.index is not an integer".into()))?;
        rows.push((bb_index, fields));
    }

    let name = rows
        .first()
        .and_then(|(_, f)| field(&f.iter().map(String::as_str).collect::<Vec<_>>(), &idx, "Subprogram"))
        .ok_or_else(|| IngestError::Schema("source CSV block has no rows to name the function from".into()))?
        .to_string();

    let entry = rows
        .iter()
        .find(|(_, f)| field(&f.iter().map(String::as_str).collect::<Vec<_>>(), &idx, "BB.type") == Some("entry"))
        .map(|(id, _)| NodeId(*id))
        .ok_or_else(|| IngestError::Schema(format!("function '{name}' has no entry BB")))?;
    let exit = rows
        .iter()
        .find(|(_, f)| field(&f.iter().map(String::as_str).collect::<Vec<_>>(), &idx, "BB.type") == Some("exit"))
        .map(|(id, _)| NodeId(*id));

    let mut cf = ControlFlow::new(name.clone(), entry, exit);
    let mut successors: Vec<(NodeId, Vec<NodeId>)> = Vec::new();

    for (id, fields) in &rows {
        let fs: Vec<&str> = fields.iter().map(String::as_str).collect();
        let get = |name: &str| field(&fs, &idx, name).unwrap_or("");
        let kind = block_kind(get("BB.type"));
        let line_begin: u32 = get("Line.Begin").parse().unwrap_or(0);
        let col_begin: u32 = get("Col.Begin").parse().unwrap_or(0);
        let line_end: u32 = get("Line.End").parse().unwrap_or(line_begin);
        let col_end: u32 = get("Col.End").parse().unwrap_or(col_begin);
        let calls: Vec<String> = get("function.call.callees").split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect();
        let succ: Vec<NodeId> = get("Successors")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse::<u32>().ok())
            .map(NodeId)
            .collect();

        cf.add_block(BasicBlock {
            id: NodeId(*id),
            kind,
            calls,
            data: BlockData::Source(SourceBlockData {
                begin: SourceLoc { line: line_begin, col: col_begin },
                end: SourceLoc { line: line_end, col: col_end },
                discriminator: 0,
                is_virtual: get("BB.type") == "virtual node",
            }),
        });
        successors.push((NodeId(*id), succ));
    }
    for (u, succs) in successors {
        for v in succs {
            cf.add_edge(u, v);
        }
    }
    Ok(cf)
}

/// Parses the whole blank-line-separated CSV stream, one function per block.
pub fn parse(text: &str) -> Result<HashMap<String, ControlFlow>, IngestError> {
    let mut flows = HashMap::new();
    for block in text.split("\n\n").map(str::trim).filter(|s| !s.is_empty()) {
        let cf = parse_function_block(block)?;
        flows.insert(cf.name.clone(), cf);
    }
    Ok(flows)
}
