//! Loop-skip annotation JSON:
//! `{"loops":{"<binary_header_id>":{"skip":"True","repeats":N,"time":T,"line":L,"addr":"0xHEX"}}}`.
//!
//! Supplies the user overrides Stage 3 (skip completion) needs for binary
//! loops the loop matcher could not pair with a source loop.

use super::IngestError;
use crate::graph::NodeId;
use crate::matching::pipeline::skip::LoopAnnotation;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Deserialize)]
struct RawAnnotation {
    #[serde(default)]
    skip: Option<String>,
    #[serde(default)]
    repeats: Option<u64>,
    #[serde(default)]
    time: Option<u64>,
    #[serde(default)]
    line: Option<u32>,
    #[serde(default)]
    addr: Option<String>,
}

fn parse_hex_addr(s: &str) -> Option<u64> {
    u64::from_str_radix(s.trim_start_matches("0x").trim_start_matches("0X"), 16).ok()
}

#[derive(Debug, Deserialize)]
struct RawFile {
    loops: HashMap<String, RawAnnotation>,
}

#[derive(Debug, Default)]
pub struct LoopAnnotations {
    pub skip: HashSet<NodeId>,
    pub timing: HashMap<NodeId, LoopAnnotation>,
}

fn parse_bool(s: &str) -> bool {
    s.eq_ignore_ascii_case("true")
}

pub fn parse(text: &str) -> Result<LoopAnnotations, IngestError> {
    let raw: RawFile = serde_json::from_str(text)?;
    let mut out = LoopAnnotations::default();
    for (id_str, entry) in raw.loops {
        let id: u32 = id_str
            .parse()
            .map_err(|_| IngestError::Schema(format!("annotation key '{id_str}' is not a binary loop header id")))?;
        let node = NodeId(id);
        if entry.skip.as_deref().is_some_and(parse_bool) {
            out.skip.insert(node);
        }
        let repeats = entry.repeats.unwrap_or(1);
        let addr = entry.addr.as_deref().and_then(parse_hex_addr);
        out.timing.insert(node, LoopAnnotation { repeats, time: entry.time, line: entry.line, addr });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_skip_entry_with_repeats() {
        let text = r#"{"loops":{"50":{"skip":"True","repeats":10,"time":200}}}"#;
        let annot = parse(text).unwrap();
        assert!(annot.skip.contains(&NodeId(50)));
        assert_eq!(annot.timing[&NodeId(50)].repeats, 10);
        assert_eq!(annot.timing[&NodeId(50)].time, Some(200));
    }

    #[test]
    fn entries_without_skip_are_not_marked_skipped() {
        let text = r#"{"loops":{"7":{"repeats":3}}}"#;
        let annot = parse(text).unwrap();
        assert!(!annot.skip.contains(&NodeId(7)));
        assert_eq!(annot.timing[&NodeId(7)].repeats, 3);
    }

    #[test]
    fn parses_line_and_hex_addr_sanity_fields() {
        let text = r#"{"loops":{"50":{"skip":"True","repeats":10,"line":42,"addr":"0x1A2B"}}}"#;
        let annot = parse(text).unwrap();
        assert_eq!(annot.timing[&NodeId(50)].line, Some(42));
        assert_eq!(annot.timing[&NodeId(50)].addr, Some(0x1A2B));
    }
}
