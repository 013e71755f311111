//! Read-only, memory-mapped view over an ISSL index file.
//!
//! The mapping is borrowed for the lifetime of every scoring worker that
//! uses it and never copied: `IndexReader` owns the
//! `Mmap`, and accessors read directly out of it with `byteorder` rather
//! than materialising owned buffers.

use crate::error::IsslError;
use crate::index_format::{unpack_offtarget_record, IndexHeader, HEADER_BYTES, WORD_BYTES};
use crate::signature::Signature;
use crate::slice::SliceMask;
use byteorder::{ByteOrder, LittleEndian};
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::path::Path;

struct SliceLayout {
    mask: SliceMask,
    /// Precomputed byte offset of each bucket's first record, length
    /// `bucket_count + 1` (last entry = one-past-the-end).
    bucket_byte_offsets: Vec<u64>,
}

pub struct IndexReader {
    mmap: Mmap,
    header: IndexHeader,
    offtargets_offset: u64,
    slices: Vec<SliceLayout>,
}

impl IndexReader {
    pub fn open(path: &Path) -> Result<Self, IsslError> {
        let file = File::open(path).map_err(|source| io_err(path, source))?;
        let mmap = unsafe { MmapOptions::new().map(&file) }.map_err(|source| io_err(path, source))?;

        if (mmap.len() as u64) < HEADER_BYTES {
            return Err(IsslError::Format(format!(
                "{}: file too short to contain a header",
                path.display()
            )));
        }

        let header = IndexHeader {
            offtargets_count: read_u64(&mmap, 0),
            seq_length: read_u64(&mmap, 8),
            slice_count: read_u64(&mmap, 16),
        };
        header.validate()?;

        let offtargets_offset = HEADER_BYTES;
        let mut cursor = offtargets_offset + WORD_BYTES * header.offtargets_count;

        let mut slices = Vec::with_capacity(header.slice_count as usize);
        for _ in 0..header.slice_count {
            if cursor + WORD_BYTES > mmap.len() as u64 {
                return Err(IsslError::Format(format!(
                    "{}: truncated before slice mask word",
                    path.display()
                )));
            }
            let mask_word = read_u64(&mmap, cursor);
            let mask = SliceMask::from_mask_word(mask_word);
            cursor += WORD_BYTES;

            let sizes_offset = cursor;
            let bucket_count = mask.bucket_count();
            cursor += WORD_BYTES * bucket_count;

            let records_offset = cursor;
            cursor += WORD_BYTES * header.offtargets_count;

            if cursor > mmap.len() as u64 {
                return Err(IsslError::Format(format!(
                    "{}: truncated slice block (bucket pointer out of file)",
                    path.display()
                )));
            }

            let mut bucket_byte_offsets = Vec::with_capacity(bucket_count as usize + 1);
            let mut running = 0u64;
            for b in 0..bucket_count {
                bucket_byte_offsets.push(records_offset + WORD_BYTES * running);
                running += read_u64(&mmap, sizes_offset + WORD_BYTES * b);
            }
            bucket_byte_offsets.push(records_offset + WORD_BYTES * running);
            if running != header.offtargets_count {
                return Err(IsslError::Format(format!(
                    "{}: slice bucket sizes sum to {} but index has {} unique off-targets",
                    path.display(),
                    running,
                    header.offtargets_count
                )));
            }

            slices.push(SliceLayout {
                mask,
                bucket_byte_offsets,
            });
        }

        if cursor != mmap.len() as u64 {
            return Err(IsslError::Format(format!(
                "{}: file size {} does not match layout-derived size {}",
                path.display(),
                mmap.len(),
                cursor
            )));
        }

        Ok(IndexReader {
            mmap,
            header,
            offtargets_offset,
            slices,
        })
    }

    #[inline]
    pub fn unique_offtargets_count(&self) -> u64 {
        self.header.offtargets_count
    }

    #[inline]
    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    #[inline]
    pub fn slice_mask(&self, slice_idx: usize) -> &SliceMask {
        &self.slices[slice_idx].mask
    }

    /// `signatureAt(id) -> Signature`.
    #[inline]
    pub fn signature_at(&self, id: u32) -> Signature {
        let offset = self.offtargets_offset + WORD_BYTES * id as u64;
        Signature(read_u64(&self.mmap, offset))
    }

    /// `lookup(sliceIdx, key) -> (ptr, count)`, returned here as the decoded
    /// `(id, occurrences)` pairs for every record in that bucket, O(1) to
    /// locate (the byte range is precomputed at open time).
    #[inline]
    pub fn lookup(&self, slice_idx: usize, key: u64) -> BucketIter<'_> {
        let slice = &self.slices[slice_idx];
        let key = key as usize;
        let start = slice.bucket_byte_offsets[key];
        let end = slice.bucket_byte_offsets[key + 1];
        BucketIter {
            mmap: &self.mmap,
            pos: start,
            end,
        }
    }
}

/// An iterator over `(id, occurrences)` for one slice bucket, reading
/// directly out of the mapping without copying it into a `Vec`.
pub struct BucketIter<'a> {
    mmap: &'a Mmap,
    pos: u64,
    end: u64,
}

impl<'a> Iterator for BucketIter<'a> {
    type Item = (u32, u32);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        let record = read_u64(self.mmap, self.pos);
        self.pos += WORD_BYTES;
        Some(unpack_offtarget_record(record))
    }
}

#[inline]
fn read_u64(mmap: &Mmap, offset: u64) -> u64 {
    LittleEndian::read_u64(&mmap[offset as usize..offset as usize + 8])
}

fn io_err(path: &Path, source: std::io::Error) -> IsslError {
    IsslError::Io {
        path: path.to_path_buf(),
        source,
    }
}
