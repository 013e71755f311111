use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use issl::index_builder::{dedup_sorted_seeds, IndexBuilder};
use issl::index_reader::IndexReader;
use issl::penalties::PenaltyTables;
use issl::scoring::{ScoreMethod, ScoringConfig, ScoringEngine, Verdict};
use issl::timing::TimingReport;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about = "ISSL off-target index builder and specificity scorer", long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    #[clap(long, global = true, help_heading = "General options")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build an ISSL index from a sorted seed stream (see `issl-extract`).
    BuildIndex {
        /// Sorted, newline-terminated 20-mer seed file.
        #[clap(value_name = "SEEDS")]
        seeds: PathBuf,

        /// Destination path for the `.issl` index file.
        #[clap(value_name = "OUTPUT")]
        output: PathBuf,

        /// Number of slices N; must satisfy N > max-dist (pigeonhole).
        #[clap(long = "slices", default_value = "5", help_heading = "Index layout")]
        slices: usize,

        /// Maximum Hamming distance this index must be able to serve.
        #[clap(long = "max-dist", default_value = "4", help_heading = "Index layout")]
        max_dist: u32,
    },

    /// Score candidate guides against a built ISSL index.
    Score {
        /// Path to a `.issl` index file.
        #[clap(value_name = "INDEX")]
        index: PathBuf,

        /// Newline-terminated file of 20-nt candidate guide sequences.
        #[clap(value_name = "GUIDES")]
        guides: PathBuf,

        /// Directory containing `mit_local_score.bin`, `cfd_pam_penalty.bin`,
        /// `cfd_pos_penalty.bin`.
        #[clap(long = "tables", help_heading = "Scoring options")]
        tables: PathBuf,

        #[clap(long = "max-dist", default_value = "4", help_heading = "Scoring options")]
        max_dist: u32,

        #[clap(long = "method", value_enum, default_value = "mit-and-cfd", help_heading = "Scoring options")]
        method: ScoreMethod,

        #[clap(long = "threshold", default_value = "75.0", help_heading = "Scoring options")]
        threshold: f64,

        #[clap(long = "threads", default_value_t = num_cpus::get(), help_heading = "General options")]
        threads: usize,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let timing = TimingReport::new();

    if !args.quiet {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let cmd_line: Vec<String> = std::env::args().collect();
        log::info!("{timestamp} | {}", cmd_line.join(" "));
    }

    match args.command {
        Command::BuildIndex {
            seeds,
            output,
            slices,
            max_dist,
        } => run_build_index(&seeds, &output, slices, max_dist, &timing),
        Command::Score {
            index,
            guides,
            tables,
            max_dist,
            method,
            threshold,
            threads,
        } => run_score(&index, &guides, &tables, max_dist, method, threshold, threads, &timing),
    }
}

fn run_build_index(
    seeds_path: &PathBuf,
    output_path: &PathBuf,
    n_slices: usize,
    max_dist: u32,
    timing: &TimingReport,
) -> Result<()> {
    let file = std::fs::File::open(seeds_path)
        .with_context(|| format!("opening seed stream {}", seeds_path.display()))?;
    let unique = dedup_sorted_seeds(BufReader::new(file))
        .map_err(anyhow::Error::from)
        .with_context(|| format!("deduplicating {}", seeds_path.display()))?;
    timing.log_phase("dedup", &format!("{} unique off-targets", unique.len()));

    let builder = IndexBuilder::new(n_slices, max_dist).map_err(anyhow::Error::from)?;
    builder
        .build(&unique, output_path)
        .map_err(anyhow::Error::from)
        .with_context(|| format!("writing index to {}", output_path.display()))?;
    timing.log_phase("build-index", &format!("wrote {}", output_path.display()));
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_score(
    index_path: &PathBuf,
    guides_path: &PathBuf,
    tables_dir: &PathBuf,
    max_dist: u32,
    method: ScoreMethod,
    threshold: f64,
    threads: usize,
    timing: &TimingReport,
) -> Result<()> {
    let index = IndexReader::open(index_path)
        .map_err(anyhow::Error::from)
        .with_context(|| format!("opening index {}", index_path.display()))?;
    let tables = PenaltyTables::load_from_dir(tables_dir)
        .map_err(anyhow::Error::from)
        .with_context(|| format!("loading penalty tables from {}", tables_dir.display()))?;
    timing.log_phase("load", "index mapped and penalty tables loaded");

    let config = ScoringConfig {
        max_dist,
        score_method: method,
        score_threshold: threshold,
        threads,
    };
    let engine = ScoringEngine::new(&index, &tables, config).map_err(anyhow::Error::from)?;

    let file = std::fs::File::open(guides_path)
        .with_context(|| format!("opening guide file {}", guides_path.display()))?;
    let guides: Vec<Vec<u8>> = BufReader::new(file)
        .lines()
        .filter_map(|line| line.ok())
        .map(|line| line.trim().as_bytes().to_vec())
        .filter(|g| !g.is_empty())
        .collect();
    timing.log_phase("read-guides", &format!("{} guides queued", guides.len()));

    let results = engine.score_batch(&guides).map_err(anyhow::Error::from)?;
    timing.log_phase("score", &format!("{} guides scored", results.len()));

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for (guide, result) in guides.iter().zip(results.iter()) {
        writeln!(
            out,
            "{}\t{:.6}\t{:.6}",
            String::from_utf8_lossy(guide),
            result.final_mit,
            result.final_cfd
        )?;
    }

    let accepted = results.iter().filter(|r| r.verdict == Verdict::Accepted).count();
    log::info!("{accepted}/{} guides accepted at threshold {threshold}", results.len());

    Ok(())
}
