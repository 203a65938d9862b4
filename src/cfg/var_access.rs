//! AVR-style variable access grouping: recovers which local variables a
//! binary block reads/writes from `Y+<offset>` stack-frame operands.
//!
//! Grounded on the reference mapper's `fparser/disassembly.py`
//! (`Instructions.get_var_accesses`): a two-operand instruction whose first
//! operand matches `Y+<n>` is a write at offset `n`, whose *second* operand
//! matches is a read. Multi-byte variables are accessed one byte per
//! instruction at consecutive offsets, so reads/writes are grouped by
//! walking the offset list and consuming `byte_size` consecutive bytes
//! belonging to the same variable. A short run (cut off by the address
//! range boundary) still emits the variable, since AVR code may only touch
//! part of it in a given block (e.g. `var & 0xEF`).

use super::{AddrRange, Instruction, InstructionTable};
use std::collections::HashMap;

/// One local variable's frame layout: byte offset -> (name, size in bytes).
pub type StackFrame = HashMap<u32, (String, u32)>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarAccesses {
    pub reads: Vec<u32>,
    pub writes: Vec<u32>,
}

fn y_plus_offset(operand: &str) -> Option<u32> {
    let rest = operand.strip_prefix("Y+")?;
    rest.parse().ok()
}

/// Maps every valid byte offset to the offset of the variable that owns it.
fn valid_offsets(frame: &StackFrame) -> HashMap<u32, u32> {
    let mut valid = HashMap::new();
    for (&start, &(_, size)) in frame {
        for o in start..start + size {
            valid.insert(o, start);
        }
    }
    valid
}

/// Consumes a run of up to `byte_size` consecutive offsets belonging to the
/// same variable starting at `offsets[i]`. Returns the index just past the
/// run, the variable's base offset, and whether the full variable was
/// covered.
fn consume_run(offsets: &[u32], i: usize, valid: &HashMap<u32, u32>, frame: &StackFrame) -> (usize, u32, bool) {
    let init = valid[&offsets[i]];
    let size = frame[&init].1;
    if i + size as usize > offsets.len() {
        return (i + size as usize, init, false);
    }
    let mut count = 0usize;
    for j in i..i + size as usize {
        if valid[&offsets[j]] == init {
            count += 1;
        } else {
            break;
        }
    }
    if count == size as usize {
        (i + size as usize, init, true)
    } else {
        (i + 1, init, false)
    }
}

/// Returns `(var_reads, var_writes)` as base stack offsets, one entry per
/// variable access (repeats allowed), for the instructions covered by
/// `ranges`.
pub fn get_var_accesses(insns: &InstructionTable, ranges: &[AddrRange], frame: &StackFrame) -> VarAccesses {
    let valid = valid_offsets(frame);
    let mut read_offsets = Vec::new();
    let mut write_offsets = Vec::new();

    let check_insn = |insn: &Instruction, reads: &mut Vec<u32>, writes: &mut Vec<u32>| {
        if insn.operands.len() != 2 {
            return;
        }
        if let Some(o) = y_plus_offset(&insn.operands[0]) {
            if valid.contains_key(&o) {
                writes.push(o);
            }
            return;
        }
        if let Some(o) = y_plus_offset(&insn.operands[1]) {
            if valid.contains_key(&o) {
                reads.push(o);
            }
        }
    };

    for range in ranges {
        for insn in insns.in_range(*range) {
            check_insn(insn, &mut read_offsets, &mut write_offsets);
        }
    }

    let mut reads = Vec::new();
    let mut i = 0;
    while i < read_offsets.len() {
        let (next, base, complete) = consume_run(&read_offsets, i, &valid, frame);
        if !complete {
            log::debug!("partial read for variable starting at offset {base}");
        }
        reads.push(base);
        i = next;
    }

    let mut writes = Vec::new();
    let mut i = 0;
    while i < write_offsets.len() {
        let (next, base, complete) = consume_run(&write_offsets, i, &valid, frame);
        assert!(complete, "partial write to variable at offset {base}");
        writes.push(base);
        i = next;
    }

    VarAccesses { reads, writes }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insn(addr: u64, ops: &[&str]) -> Instruction {
        Instruction {
            addr,
            mnemonic: "mov".into(),
            operands: ops.iter().map(|s| s.to_string()).collect(),
            targets: vec![],
        }
    }

    #[test]
    fn single_byte_write_then_read() {
        let mut table = InstructionTable::new();
        table.insert(insn(0x10, &["Y+4", "r16"]));
        table.insert(insn(0x12, &["r17", "Y+4"]));
        let mut frame = StackFrame::new();
        frame.insert(4, ("x".into(), 1));
        let acc = get_var_accesses(&table, &[AddrRange::new(0x10, 0x12)], &frame);
        assert_eq!(acc.writes, vec![4]);
        assert_eq!(acc.reads, vec![4]);
    }

    #[test]
    fn two_byte_variable_groups_consecutive_offsets() {
        let mut table = InstructionTable::new();
        table.insert(insn(0x10, &["r17", "Y+0"]));
        table.insert(insn(0x12, &["r18", "Y+1"]));
        let mut frame = StackFrame::new();
        frame.insert(0, ("wide".into(), 2));
        let acc = get_var_accesses(&table, &[AddrRange::new(0x10, 0x12)], &frame);
        assert_eq!(acc.reads, vec![0]);
    }

    #[test]
    fn offsets_outside_the_frame_are_ignored() {
        let mut table = InstructionTable::new();
        table.insert(insn(0x10, &["r17", "Y+99"]));
        let frame = StackFrame::new();
        let acc = get_var_accesses(&table, &[AddrRange::new(0x10, 0x10)], &frame);
        assert!(acc.reads.is_empty());
    }
}
