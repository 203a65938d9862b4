//! Command-line surface: wires the ingesters to [`crate::analysis::Analysis`]
//! and the CSV output writer. Out of the core analysis scope per the mapping
//! specification (§3's explicit non-goals list CLI parsing, a renderer, and
//! report serialization as ingesters/drivers rather than analysis), but
//! every complete binary needs one; kept in the compiler's own `clap`-derive
//! style (see the teacher's argument-parsing module).

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MapperChoice {
    Ctrldep,
    Homomorphism,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HomOrderChoice {
    PreDominatorFirst,
    PostDominatorFirst,
    PreDominatedFirst,
    PostDominatedFirst,
}

/// Maps a binary CFG to a source CFG, basic block by basic block, for
/// source-level WCET annotation of an optimized build.
#[derive(Debug, Parser)]
#[command(name = "flowmap", version, about)]
pub struct Cli {
    /// Binary CFG JSON (Flow/InsnMap/SymbolMap records).
    #[arg(long, value_name = "PATH")]
    pub bin_json: PathBuf,

    /// DWARF debug info, as JSON.
    #[arg(long, value_name = "PATH")]
    pub dwarf_json: PathBuf,

    /// Source CFG CSV.
    #[arg(long, value_name = "PATH")]
    pub src_csv: PathBuf,

    /// Opcode timing table (`mnemonic;min;max` CSV).
    #[arg(long, value_name = "PATH")]
    pub optime_csv: PathBuf,

    /// Directory for intermediate artifacts (unused by the core pipeline;
    /// accepted for compatibility with callers that always pass it).
    #[arg(long, value_name = "DIR")]
    pub temp_dir: Option<PathBuf>,

    /// Render CFG/TFG/HFG images alongside the mapping (not implemented;
    /// out of scope per the mapping specification's non-goals).
    #[arg(long)]
    pub render_graphs: bool,

    /// Node visitation order for the dominator-homomorphism mapper.
    #[arg(long, value_enum, default_value = "pre-dominator-first")]
    pub hom_order: HomOrderChoice,

    /// Which Stage 0 per-subgraph mapper to use.
    #[arg(long, value_enum, default_value = "ctrldep")]
    pub mapper: MapperChoice,

    /// Disable straight-line-chain contraction before analysis.
    #[arg(long)]
    pub no_simplify: bool,

    /// Loop-skip annotation JSON.
    #[arg(long, value_name = "PATH")]
    pub annot_file: Option<PathBuf>,

    /// Trust DWARF column numbers when pairing ambiguous discriminators.
    #[arg(long)]
    pub trust_dbg_info: bool,

    /// Where to write the concatenated per-function mapping CSV. Defaults
    /// to stdout.
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,
}

impl From<HomOrderChoice> for crate::matching::pipeline::homomorphism::HomOrder {
    fn from(c: HomOrderChoice) -> Self {
        use crate::matching::pipeline::homomorphism::HomOrder;
        match c {
            HomOrderChoice::PreDominatorFirst => HomOrder::PreDominatorFirst,
            HomOrderChoice::PostDominatorFirst => HomOrder::PostDominatorFirst,
            HomOrderChoice::PreDominatedFirst => HomOrder::PreDominatedFirst,
            HomOrderChoice::PostDominatedFirst => HomOrder::PostDominatedFirst,
        }
    }
}

impl From<MapperChoice> for crate::matching::pipeline::MapperKind {
    fn from(c: MapperChoice) -> Self {
        use crate::matching::pipeline::MapperKind;
        match c {
            MapperChoice::Ctrldep => MapperKind::CtrlDep,
            MapperChoice::Homomorphism => MapperKind::Homomorphism,
        }
    }
}
