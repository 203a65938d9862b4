//! Basic-block level mapping between a binary control-flow graph (compiled
//! machine code + DWARF debug info) and a source control-flow graph,
//! producing a per-function `bin_bb -> src_bb` map plus per-source-BB
//! execution timing for worst-case execution time analysis on optimized
//! binaries.
//!
//! Module layout mirrors the analysis pipeline bottom-up: [`graph`] (dense
//! digraph primitives) underlies [`dom`] (dominator/post-dominator trees)
//! and [`loops`] (Havlak loop nesting), both of which [`cfg`] (the typed
//! basic-block model) and [`region`] (loop-to-surrogate reduction and the
//! hierarchical flow graph) build on. [`matching`] is the staged mapping
//! pipeline itself; [`ingest`] and [`output`] are the external JSON/CSV
//! interfaces; [`analysis`] wires one function's two CFGs and the
//! pipeline together as a single owned object.

pub mod analysis;
pub mod cfg;
pub mod cli;
pub mod dom;
pub mod graph;
pub mod ingest;
pub mod logging;
pub mod loops;
pub mod matching;
pub mod output;
pub mod region;
