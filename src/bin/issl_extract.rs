//! `issl-extract <output-file> <input1> [input2 ...]` — the off-target
//! extractor CLI.

use issl::extractor;
use issl::timing::TimingReport;
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args_os().skip(1);
    let output = match args.next() {
        Some(o) => PathBuf::from(o),
        None => {
            eprintln!("usage: issl-extract <output-file> <input1> [input2 ...]");
            return ExitCode::FAILURE;
        }
    };
    let inputs: Vec<PathBuf> = args.map(PathBuf::from).collect();
    if inputs.is_empty() {
        eprintln!("usage: issl-extract <output-file> <input1> [input2 ...]");
        return ExitCode::FAILURE;
    }

    let timing = TimingReport::new();
    match extractor::run(&inputs, &output) {
        Ok(stats) => {
            timing.log_phase(
                "done",
                &format!(
                    "{} file(s), {} chunk(s), {} seeds -> {}",
                    stats.files_processed,
                    stats.chunks,
                    stats.seeds_written,
                    output.display()
                ),
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
