//! Opcode timing CSV: `mnemonic;min_cycles;max_cycles` lines, `#` comments
//! and blank lines ignored. Used to feed [`crate::cfg::ControlFlow::attribute_block_times`].

use super::IngestError;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
pub struct OpTiming {
    pub min_cycles: u64,
    pub max_cycles: u64,
}

/// Maps an uppercased mnemonic to its timing. Lookup in
/// `attribute_block_times` should normalize case the same way.
pub type TimingTable = HashMap<String, OpTiming>;

pub fn parse(text: &str) -> Result<TimingTable, IngestError> {
    let mut table = HashMap::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(';').map(str::trim).collect();
        let [mnem, min_s, max_s] = fields[..] else {
            return Err(IngestError::Csv(format!("line {}: expected 'mnemonic;min;max', got '{line}'", lineno + 1)));
        };
        let min_cycles: u64 = min_s
            .parse()
            .map_err(|_| IngestError::Csv(format!("line {}: min_cycles '{min_s}' is not an integer", lineno + 1)))?;
        let max_cycles: u64 = max_s
            .parse()
            .map_err(|_| IngestError::Csv(format!("line {}: max_cycles '{max_s}' is not an integer", lineno + 1)))?;
        table.insert(mnem.to_uppercase(), OpTiming { min_cycles, max_cycles });
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lines_and_skips_comments() {
        let text = "# opcode;min;max\nLDI;1;1\nMUL;1;2\n\n";
        let table = parse(text).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table["MUL"].max_cycles, 2);
    }

    #[test]
    fn rejects_a_malformed_row() {
        let text = "LDI;1\n";
        assert!(parse(text).is_err());
    }
}
