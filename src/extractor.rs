//! Off-target extraction: a two-pass, parallel external sorter that scans
//! genomic sequences for PAM-flanked sites and emits a globally sorted,
//! duplicate-preserving stream of 20-nt seeds.

use crate::error::IsslError;
use crate::signature::reverse_complement;
use crate::timing::TimingReport;
use rayon::prelude::*;
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const SEED_LEN: usize = 20;
const FWD_SITE_LEN: usize = 23;
const REV_SITE_LEN: usize = 23;

/// Open a text input, transparently decompressing `.gz` files by extension
/// (the extractor's only compression support).
fn open_text_input(path: &Path) -> std::io::Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    let is_gz = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("gz"))
        .unwrap_or(false);
    if is_gz {
        Ok(Box::new(BufReader::new(flate2::read::MultiGzDecoder::new(
            file,
        ))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Expand CLI input paths into concrete files to process: directories
/// expand to their immediate (non-recursive) children; missing paths are
/// logged and skipped.
fn expand_inputs(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_file() {
            files.push(input.clone());
        } else if input.is_dir() {
            match fs::read_dir(input) {
                Ok(entries) => {
                    for entry in entries.flatten() {
                        let path = entry.path();
                        if path.is_file() {
                            files.push(path);
                        }
                    }
                }
                Err(e) => {
                    log::warn!("skipping unreadable directory {}: {e}", input.display());
                }
            }
        } else {
            log::warn!(
                "skipping {}: not a file or directory, please check the path",
                input.display()
            );
        }
    }
    files
}

/// Split one input into per-sequence temp chunk files under `tmp_dir`,
/// assigning ids from the shared, process-wide `counter`.
fn split_input(path: &Path, tmp_dir: &Path, counter: &AtomicU64) -> Result<(), IsslError> {
    let mut reader = open_text_input(path).map_err(|source| io_err(path, source))?;

    let mut first_line = String::new();
    let first_len = reader
        .read_line(&mut first_line)
        .map_err(|source| io_err(path, source))?;
    if first_len == 0 {
        return Ok(()); // empty input, nothing to split
    }

    if first_line.trim_start().starts_with('>') {
        split_fasta(reader, &first_line, tmp_dir, counter, path)
    } else {
        split_plaintext(reader, &first_line, tmp_dir, counter, path)
    }
}

fn new_chunk_writer(tmp_dir: &Path, counter: &AtomicU64) -> Result<(BufWriter<File>, u64), IsslError> {
    let id = counter.fetch_add(1, Ordering::SeqCst);
    let chunk_path = tmp_dir.join(format!("{id}.txt"));
    let file = File::create(&chunk_path).map_err(|source| io_err(&chunk_path, source))?;
    Ok((BufWriter::new(file), id))
}

fn split_fasta(
    mut reader: Box<dyn BufRead>,
    first_line: &str,
    tmp_dir: &Path,
    counter: &AtomicU64,
    source_path: &Path,
) -> Result<(), IsslError> {
    let (mut writer, _) = new_chunk_writer(tmp_dir, counter)?;
    debug_assert!(first_line.trim_start().starts_with('>'));

    let mut line = String::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .map_err(|source| io_err(source_path, source))?;
        if n == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.starts_with('>') {
            writer
                .flush()
                .map_err(|source| io_err(source_path, source))?;
            let (w, _) = new_chunk_writer(tmp_dir, counter)?;
            writer = w;
        } else if !trimmed.is_empty() {
            writer
                .write_all(trimmed.to_ascii_uppercase().as_bytes())
                .map_err(|source| io_err(source_path, source))?;
        }
    }
    writer
        .flush()
        .map_err(|source| io_err(source_path, source))?;
    Ok(())
}

fn split_plaintext(
    mut reader: Box<dyn BufRead>,
    first_line: &str,
    tmp_dir: &Path,
    counter: &AtomicU64,
    source_path: &Path,
) -> Result<(), IsslError> {
    let mut line = first_line.to_string();
    loop {
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            let (mut writer, _) = new_chunk_writer(tmp_dir, counter)?;
            writer
                .write_all(trimmed.to_ascii_uppercase().as_bytes())
                .map_err(|source| io_err(source_path, source))?;
            writer
                .flush()
                .map_err(|source| io_err(source_path, source))?;
        }

        line.clear();
        let n = reader
            .read_line(&mut line)
            .map_err(|source| io_err(source_path, source))?;
        if n == 0 {
            break;
        }
    }
    Ok(())
}

/// Scan a sequence for forward-strand sites: 23-mers matching
/// `[ACG][ACGT]{19}[ACGT][AG]G`; the seed is the first 20 characters.
/// Overlapping, single-position advance.
fn scan_forward_sites(seq: &[u8]) -> Vec<Vec<u8>> {
    let mut seeds = Vec::new();
    if seq.len() < FWD_SITE_LEN {
        return seeds;
    }
    for i in 0..=seq.len() - FWD_SITE_LEN {
        let window = &seq[i..i + FWD_SITE_LEN];
        if matches!(window[0], b'A' | b'C' | b'G')
            && window[1..20].iter().all(|&b| is_acgt(b))
            && is_acgt(window[20])
            && matches!(window[21], b'A' | b'G')
            && window[22] == b'G'
        {
            seeds.push(window[0..SEED_LEN].to_vec());
        }
    }
    seeds
}

/// Scan a sequence for reverse-strand sites: 23-mers matching
/// `C[CT][ACGT][ACGT]{19}[TGC]`; the seed is the reverse complement of
/// positions 3..22.
fn scan_reverse_sites(seq: &[u8]) -> Vec<Vec<u8>> {
    let mut seeds = Vec::new();
    if seq.len() < REV_SITE_LEN {
        return seeds;
    }
    for i in 0..=seq.len() - REV_SITE_LEN {
        let window = &seq[i..i + REV_SITE_LEN];
        if window[0] == b'C'
            && matches!(window[1], b'C' | b'T')
            && is_acgt(window[2])
            && window[3..22].iter().all(|&b| is_acgt(b))
            && matches!(window[22], b'T' | b'G' | b'C')
        {
            seeds.push(reverse_complement(&window[3..23]));
        }
    }
    seeds
}

#[inline]
fn is_acgt(b: u8) -> bool {
    matches!(b, b'A' | b'C' | b'G' | b'T')
}

/// Extract and sort the seeds from a single chunk, writing
/// `<id>_sorted.txt`.
fn extract_and_sort_chunk(chunk_path: &Path, sorted_path: &Path) -> Result<(), IsslError> {
    let mut content = String::new();
    File::open(chunk_path)
        .and_then(|mut f| f.read_to_string(&mut content))
        .map_err(|source| io_err(chunk_path, source))?;

    let seq = content.as_bytes();
    let mut seeds = scan_forward_sites(seq);
    seeds.extend(scan_reverse_sites(seq));
    seeds.sort_unstable();

    let out = File::create(sorted_path).map_err(|source| io_err(sorted_path, source))?;
    let mut w = BufWriter::new(out);
    for seed in &seeds {
        w.write_all(seed).map_err(|source| io_err(sorted_path, source))?;
        w.write_all(b"\n").map_err(|source| io_err(sorted_path, source))?;
    }
    w.flush().map_err(|source| io_err(sorted_path, source))
}

/// N-way merge of sorted chunk files into `output_path`, keyed on each
/// stream's current front line.
fn merge_sorted_chunks(sorted_paths: &[PathBuf], output_path: &Path) -> Result<(), IsslError> {
    struct Stream {
        reader: std::io::Lines<BufReader<File>>,
        front: String,
        idx: usize,
    }
    // Min-heap ordered by line content, tie-broken by stream index for
    // determinism; `Reverse` turns BinaryHeap (a max-heap) into a min-heap.
    use std::cmp::Reverse;

    let mut streams = Vec::with_capacity(sorted_paths.len());
    let mut heap: BinaryHeap<Reverse<(String, usize)>> = BinaryHeap::new();

    for (idx, path) in sorted_paths.iter().enumerate() {
        let file = File::open(path).map_err(|source| io_err(path, source))?;
        let mut lines = BufReader::new(file).lines();
        if let Some(first) = lines.next() {
            let front = first.map_err(|source| io_err(path, source))?;
            heap.push(Reverse((front.clone(), idx)));
            streams.push(Some(Stream {
                reader: lines,
                front,
                idx,
            }));
        } else {
            streams.push(None);
        }
    }

    let out = File::create(output_path).map_err(|source| io_err(output_path, source))?;
    let mut writer = BufWriter::new(out);

    while let Some(Reverse((line, idx))) = heap.pop() {
        writer
            .write_all(line.as_bytes())
            .map_err(|source| io_err(output_path, source))?;
        writer
            .write_all(b"\n")
            .map_err(|source| io_err(output_path, source))?;

        let stream = streams[idx].as_mut().expect("stream must exist for a heap entry");
        match stream.reader.next() {
            Some(next) => {
                let next = next.map_err(|source| io_err(&sorted_paths[idx], source))?;
                stream.front = next.clone();
                heap.push(Reverse((next, idx)));
            }
            None => {
                streams[idx] = None;
            }
        }
    }

    writer.flush().map_err(|source| io_err(output_path, source))
}

/// Extract every PAM-flanked 20-nt seed from `inputs` and write them,
/// sorted and newline-terminated, to `output_path`.
pub fn run(inputs: &[PathBuf], output_path: &Path) -> Result<ExtractorStats, IsslError> {
    let timing = TimingReport::new();
    let files = expand_inputs(inputs);
    if files.is_empty() {
        return Err(IsslError::Usage(
            "no readable input files or directories given".into(),
        ));
    }

    let tmp_dir = tempfile::Builder::new()
        .prefix("issl-extract-")
        .tempdir()
        .map_err(|source| io_err(Path::new("<tempdir>"), source))?
        .into_path();

    let counter = AtomicU64::new(0);
    log::info!("splitting {} input(s)", files.len());
    let failed = AtomicU64::new(0);
    files.par_iter().for_each(|path| {
        if let Err(e) = split_input(path, &tmp_dir, &counter) {
            log::warn!("skipping {}: {e}", path.display());
            failed.fetch_add(1, Ordering::SeqCst);
        }
    });
    let files_processed = files.len() - failed.load(Ordering::SeqCst) as usize;
    timing.log_phase("split", "inputs split into per-sequence chunks");

    let total_chunks = counter.load(Ordering::SeqCst);
    log::info!("sorting {total_chunks} intermediate chunk(s)");
    let chunk_ids: Vec<u64> = (0..total_chunks).collect();
    chunk_ids.par_iter().try_for_each(|&id| {
        let chunk_path = tmp_dir.join(format!("{id}.txt"));
        let sorted_path = tmp_dir.join(format!("{id}_sorted.txt"));
        extract_and_sort_chunk(&chunk_path, &sorted_path)
    })?;
    timing.log_phase("sort", "intermediate chunks extracted and sorted");

    let sorted_paths: Vec<PathBuf> = chunk_ids
        .iter()
        .map(|&id| tmp_dir.join(format!("{id}_sorted.txt")))
        .collect();
    log::info!("merging {} sorted chunk(s)", sorted_paths.len());
    merge_sorted_chunks(&sorted_paths, output_path)?;
    timing.log_phase("merge", "sorted chunks merged into final output");

    let seed_count = fs::metadata(output_path)
        .map(|_| count_lines(output_path))
        .map_err(|source| io_err(output_path, source))??;

    fs::remove_dir_all(&tmp_dir).map_err(|source| io_err(&tmp_dir, source))?;
    timing.log_phase("cleanup", "temp directory removed");

    Ok(ExtractorStats {
        files_processed,
        chunks: total_chunks,
        seeds_written: seed_count,
    })
}

fn count_lines(path: &Path) -> Result<u64, IsslError> {
    let file = File::open(path).map_err(|source| io_err(path, source))?;
    let mut count = 0u64;
    for line in BufReader::new(file).lines() {
        line.map_err(|source| io_err(path, source))?;
        count += 1;
    }
    Ok(count)
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractorStats {
    pub files_processed: usize,
    pub chunks: u64,
    pub seeds_written: u64,
}

fn io_err(path: &Path, source: std::io::Error) -> IsslError {
    IsslError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    #[test]
    fn forward_site_extracts_first_20_bases() {
        let seq = b"AAAAAAAAAAAAAAAAAAAAAGG";
        let seeds = scan_forward_sites(seq);
        assert_eq!(seeds, vec![b"AAAAAAAAAAAAAAAAAAAA".to_vec()]);
    }

    #[test]
    fn reverse_site_extracts_revcomp_of_positions_3_to_22() {
        // positions 3..23 = "AAAAAAAAAAAAAAAAAAAA" -> revcomp is the same (all A -> all T actually)
        let seq = b"CCAAAAAAAAAAAAAAAAAAAAAG";
        let seeds = scan_reverse_sites(&seq[..23]);
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0], reverse_complement(b"AAAAAAAAAAAAAAAAAAAA"));
    }

    #[test]
    fn both_strands_scenario_yields_one_seed() {
        let seq = b"AAAAAAAAAAAAAAAAAAAAAGGCCT";
        let mut seeds = scan_forward_sites(seq);
        seeds.extend(scan_reverse_sites(seq));
        assert_eq!(seeds.len(), 1);
    }

    #[test]
    fn extractor_end_to_end_forward_pam() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("in.fasta");
        std::fs::write(&input_path, ">x\nAAAAAAAAAAAAAAAAAAAAAGG\n").unwrap();
        let output_path = dir.path().join("out.txt");

        let stats = run(&[input_path], &output_path).unwrap();
        assert_eq!(stats.seeds_written, 1);

        let mut out = String::new();
        File::open(&output_path).unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "AAAAAAAAAAAAAAAAAAAA\n");
    }

    #[test]
    fn extractor_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("in.fasta");
        std::fs::write(
            &input_path,
            ">x\nAAAAAAAAAAAAAAAAAAAAAGG\n>y\nTTTTTTTTTTTTTTTTTTTTTAG\n",
        )
        .unwrap();

        let out1 = dir.path().join("out1.txt");
        let out2 = dir.path().join("out2.txt");
        run(&[input_path.clone()], &out1).unwrap();
        run(&[input_path], &out2).unwrap();

        let bytes1 = std::fs::read(&out1).unwrap();
        let bytes2 = std::fs::read(&out2).unwrap();
        assert_eq!(bytes1, bytes2);
    }

    #[test]
    fn missing_input_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("in.fasta");
        std::fs::write(&good, ">x\nAAAAAAAAAAAAAAAAAAAAAGG\n").unwrap();
        let missing = dir.path().join("does_not_exist.fasta");
        let output_path = dir.path().join("out.txt");

        let stats = run(&[missing, good], &output_path).unwrap();
        assert_eq!(stats.files_processed, 1);
    }

    #[test]
    fn unreadable_input_is_skipped_not_fatal() {
        // split_input fails partway through a non-UTF-8 file; the batch
        // must still produce output from the remaining valid inputs rather
        // than aborting the whole run.
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.fasta");
        std::fs::write(&bad, [b'>', b'x', b'\n', 0xFF, 0xFE, b'\n']).unwrap();
        let good = dir.path().join("good.fasta");
        std::fs::write(&good, ">x\nAAAAAAAAAAAAAAAAAAAAAGG\n").unwrap();
        let output_path = dir.path().join("out.txt");

        let stats = run(&[bad, good], &output_path).unwrap();
        assert_eq!(stats.files_processed, 1);
        assert_eq!(stats.seeds_written, 1);

        let mut out = String::new();
        File::open(&output_path).unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "AAAAAAAAAAAAAAAAAAAA\n");
    }

    #[test]
    fn plaintext_one_sequence_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("in.txt");
        std::fs::write(&input_path, "aaaaaaaaaaaaaaaaaaaaaGG\n").unwrap();
        let output_path = dir.path().join("out.txt");
        let stats = run(&[input_path], &output_path).unwrap();
        assert_eq!(stats.seeds_written, 1);
    }
}
