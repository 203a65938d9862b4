use clap::Parser;
use flowmap::analysis::Analysis;
use flowmap::cli::Cli;
use flowmap::ingest::{annotations, bin_json, dwarf_json, optime_csv, src_csv};
use flowmap::matching::edge_matcher::DiscrMap;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::process::ExitCode;

fn build_bin_discr(bin_cf: &flowmap::cfg::ControlFlow, dbg: &dwarf_json::DebugInfo) -> DiscrMap {
    let mut out: DiscrMap = HashMap::new();
    for n in bin_cf.graph().nodes() {
        if bin_cf.graph().out_degree(n) <= 1 {
            continue;
        }
        let Some(block) = bin_cf.block(n) else { continue };
        let Some(range) = block.addr_ranges().first() else { continue };
        let Some(entry) = dbg.line_at(range.lo) else { continue };
        out.entry(entry.line).or_default().insert(entry.discriminator, n);
    }
    out
}

fn run() -> Result<u32, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    flowmap::logging::init_from_env();

    let bin_text = fs::read_to_string(&cli.bin_json)?;
    let dwarf_text = fs::read_to_string(&cli.dwarf_json)?;
    let src_text = fs::read_to_string(&cli.src_csv)?;
    let optime_text = fs::read_to_string(&cli.optime_csv)?;

    let mut bin_program = bin_json::parse(&bin_text)?;
    let dbg = dwarf_json::DebugInfo::parse(&dwarf_text)?;
    let src_flows = src_csv::parse(&src_text)?;
    let timing = optime_csv::parse(&optime_text)?;
    let timing: HashMap<String, (u64, u64)> = timing.iter().map(|(k, v)| (k.clone(), (v.min_cycles, v.max_cycles))).collect();

    let loop_annotations = match &cli.annot_file {
        Some(path) => annotations::parse(&fs::read_to_string(path)?)?,
        None => annotations::LoopAnnotations::default(),
    };

    let mut out: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(fs::File::create(path)?),
        None => Box::new(std::io::stdout()),
    };

    let mut failures = 0u32;
    let mut names: Vec<String> = bin_program.flows.keys().cloned().collect();
    names.sort();

    for name in names {
        let Some(mut bin_cf) = bin_program.flows.remove(&name) else { continue };
        let Some(src_cf) = src_flows.get(&name).cloned() else {
            log::warn!("function '{name}' has no matching source CFG; skipped");
            continue;
        };

        if let Err(e) = bin_cf.attribute_block_times(&bin_program.instructions, &timing) {
            log::error!("function '{name}': {e}");
            failures += 1;
            continue;
        }

        let bin_discr = build_bin_discr(&bin_cf, &dbg);

        let analysis = match Analysis::new(bin_cf, src_cf, !cli.no_simplify) {
            Ok(a) => a,
            Err(e) => {
                log::warn!("function '{name}': {e}");
                failures += 1;
                continue;
            }
        };

        let line_of_addr = |addr: u64| dbg.line_number_of(addr);
        let loop_match = analysis.match_loops(&bin_program.instructions, line_of_addr, &loop_annotations.skip);

        let pipeline_cfg = flowmap::matching::pipeline::PipelineConfig {
            mapper: cli.mapper.into(),
            hom_order: cli.hom_order.into(),
            enable_straight_line_lumping: false,
        };
        match analysis.run_mapping(&bin_discr, cli.trust_dbg_info, &loop_match, &loop_annotations.timing, pipeline_cfg, &bin_program.instructions, &line_of_addr) {
            Ok((flat, gm_hier)) => {
                let rows = flowmap::output::build_rows(&analysis.src_cf, &analysis.bin_cf, &flat, &flatten_for_counts(&gm_hier));
                if let Err(e) = flowmap::output::write_function_block(&mut out, &analysis.src_cf.name, &name, &rows) {
                    log::error!("function '{name}': failed writing output: {e}");
                    failures += 1;
                }
            }
            Err(e) => {
                log::error!("function '{name}': mapping failed: {e}");
                failures += 1;
            }
        }
    }

    Ok(failures)
}

/// The output writer reads per-node execution counts from a single flat
/// [`flowmap::matching::GraphMap`]; merge the hierarchy's per-level maps
/// into one for that lookup.
fn flatten_for_counts(hgm: &flowmap::matching::HierarchicalGraphMap) -> flowmap::matching::GraphMap {
    let mut merged = flowmap::matching::GraphMap::new();
    merge_into(hgm, &mut merged);
    merged
}

fn merge_into(hgm: &flowmap::matching::HierarchicalGraphMap, merged: &mut flowmap::matching::GraphMap) {
    for (bin, src) in hgm.map.entries() {
        merged.insert(bin, src);
        if let Some(count) = hgm.map.exec_count(bin) {
            merged.set_exec_count(bin, count);
        }
        if let Some(cycles) = hgm.map.cycle_override(bin) {
            merged.set_cycle_override(bin, cycles);
        }
    }
    for child in &hgm.children {
        merge_into(child, merged);
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(failures) if failures <= u8::MAX as u32 => ExitCode::from(failures as u8),
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("flowmap: {e}");
            ExitCode::FAILURE
        }
    }
}
