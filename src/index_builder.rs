//! Consumes the extractor's sorted seed stream and writes the ISSL index
//! file. Single-threaded streaming writer — I/O dominates,
//! so no concurrency is needed here.

use crate::error::IsslError;
use crate::index_format::{expected_file_size, pack_offtarget_record, HEADER_BYTES};
use crate::signature::{sequence_to_signature, Signature, SEQ_LENGTH};
use crate::slice::{partition_contiguous, validate_slices, SliceMask};
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{BufRead, BufWriter, Write};
use std::path::Path;

/// Deduplicate a sorted stream of 20-mers into `(signature, occurrences)`
/// pairs, id = rank in the stream.
pub fn dedup_sorted_seeds<R: BufRead>(reader: R) -> Result<Vec<(Signature, u32)>, IsslError> {
    let mut unique: Vec<(Signature, u32)> = Vec::new();
    let mut current: Option<Signature> = None;

    for line in reader.lines() {
        let line = line.map_err(|source| IsslError::Io {
            path: "<seed stream>".into(),
            source,
        })?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.len() != SEQ_LENGTH {
            return Err(IsslError::Format(format!(
                "seed stream: expected {SEQ_LENGTH}-nt lines, got {} ({line:?})",
                line.len()
            )));
        }
        let sig = sequence_to_signature(line.as_bytes())
            .map_err(|e| IsslError::Format(format!("seed stream: {e}")))?;

        match current {
            Some(cur) if cur == sig => {
                unique.last_mut().unwrap().1 += 1;
            }
            _ => {
                unique.push((sig, 1));
                current = Some(sig);
            }
        }
    }
    Ok(unique)
}

/// Build an ISSL index from a sorted, deduplicated seed list and write it
/// to `output_path`, following the on-disk layout's exact write order:
/// header, offtargets table, then each slice's mask word, bucket-size
/// array, and records, in slice order.
pub struct IndexBuilder {
    masks: Vec<SliceMask>,
}

impl IndexBuilder {
    /// `n_slices` must satisfy the pigeonhole constraint `n_slices > max_dist`.
    pub fn new(n_slices: usize, max_dist: u32) -> Result<Self, IsslError> {
        let masks = partition_contiguous(SEQ_LENGTH, n_slices)?;
        validate_slices(&masks, SEQ_LENGTH, max_dist)?;
        Ok(IndexBuilder { masks })
    }

    /// Build with an explicit, possibly non-contiguous, mask set (contiguous
    /// equal-width slices and arbitrary disjoint masks are both valid).
    /// Still validated against `max_dist`.
    pub fn with_masks(masks: Vec<SliceMask>, max_dist: u32) -> Result<Self, IsslError> {
        validate_slices(&masks, SEQ_LENGTH, max_dist)?;
        Ok(IndexBuilder { masks })
    }

    pub fn masks(&self) -> &[SliceMask] {
        &self.masks
    }

    pub fn build(
        &self,
        unique: &[(Signature, u32)],
        output_path: &Path,
    ) -> Result<(), IsslError> {
        let u = unique.len() as u64;
        let file = std::fs::File::create(output_path).map_err(|source| IsslError::Io {
            path: output_path.to_path_buf(),
            source,
        })?;
        let mut w = BufWriter::new(file);

        write_header(&mut w, output_path, u, self.masks.len() as u64)?;

        for (sig, _) in unique {
            w.write_u64::<LittleEndian>(sig.bits())
                .map_err(|source| io_err(output_path, source))?;
        }

        for mask in &self.masks {
            self.write_slice_block(&mut w, output_path, mask, unique)?;
        }

        w.flush().map_err(|source| io_err(output_path, source))?;

        let on_disk = std::fs::metadata(output_path)
            .map_err(|source| io_err(output_path, source))?
            .len();
        let expected = expected_file_size(u, &self.masks);
        if on_disk != expected {
            return Err(IsslError::Format(format!(
                "internal error: wrote {on_disk} bytes, expected {expected}"
            )));
        }

        log::info!(
            "wrote ISSL index: {} unique off-targets, {} slices, {} bytes -> {}",
            u,
            self.masks.len(),
            on_disk,
            output_path.display()
        );
        Ok(())
    }

    fn write_slice_block<W: Write>(
        &self,
        w: &mut W,
        output_path: &Path,
        mask: &SliceMask,
        unique: &[(Signature, u32)],
    ) -> Result<(), IsslError> {
        w.write_u64::<LittleEndian>(mask.mask_word)
            .map_err(|source| io_err(output_path, source))?;

        let bucket_count = mask.bucket_count() as usize;
        let mut sizes = vec![0u64; bucket_count];
        let mut keys = Vec::with_capacity(unique.len());
        for (sig, _) in unique {
            let key = mask.project(*sig) as usize;
            sizes[key] += 1;
            keys.push(key);
        }

        for &size in &sizes {
            w.write_u64::<LittleEndian>(size)
                .map_err(|source| io_err(output_path, source))?;
        }

        // Counting-sort placement: bucket cursors start at each bucket's
        // prefix-summed offset so records land contiguous and
        // ascending-by-key without a full comparison sort.
        let mut offsets = vec![0u64; bucket_count];
        let mut running = 0u64;
        for (bucket, &size) in sizes.iter().enumerate() {
            offsets[bucket] = running;
            running += size;
        }

        let mut records = vec![0u64; unique.len()];
        let mut cursor = offsets;
        for (id, (key, (_, occurrences))) in keys.iter().zip(unique.iter()).enumerate() {
            let slot = &mut cursor[*key];
            records[*slot as usize] = pack_offtarget_record(id as u32, *occurrences);
            *slot += 1;
        }

        for rec in &records {
            w.write_u64::<LittleEndian>(*rec)
                .map_err(|source| io_err(output_path, source))?;
        }
        Ok(())
    }
}

fn write_header<W: Write>(
    w: &mut W,
    output_path: &Path,
    offtargets_count: u64,
    slice_count: u64,
) -> Result<(), IsslError> {
    w.write_u64::<LittleEndian>(offtargets_count)
        .map_err(|source| io_err(output_path, source))?;
    w.write_u64::<LittleEndian>(SEQ_LENGTH as u64)
        .map_err(|source| io_err(output_path, source))?;
    w.write_u64::<LittleEndian>(slice_count)
        .map_err(|source| io_err(output_path, source))?;
    debug_assert_eq!(HEADER_BYTES, 24);
    Ok(())
}

fn io_err(path: &Path, source: std::io::Error) -> IsslError {
    IsslError::Io {
        path: path.to_path_buf(),
        source,
    }
}
