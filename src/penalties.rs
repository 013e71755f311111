//! MIT and CFD penalty tables.
//!
//! These are scientific artifacts (Hsu et al. 2013 / Doench et al. 2016)
//! supplied externally, not encoded in source — the only
//! literal this module hard-codes is the NGG PAM index `0b1010`. Tables are
//! loaded at runtime from flat little-endian `f64` files and held for the
//! process lifetime, referenced read-only by every scoring worker.

use crate::error::IsslError;
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// `mitLocalScore` is indexed by a 20-bit mismatch mask.
pub const MIT_TABLE_LEN: usize = 1 << 20;
/// `cfdPamPenalty` is indexed by a 4-bit PAM code.
pub const CFD_PAM_TABLE_LEN: usize = 16;
/// `cfdPosPenalty` is indexed by `(pos<<4)|(guideBase<<2)|rcOffTargetBase`.
pub const CFD_POS_TABLE_LEN: usize = 1024;

/// PAM hard-coded as NGG. Replacing the PAM
/// requires only changing this literal.
pub const NGG_PAM_INDEX: usize = 0b1010;

pub struct PenaltyTables {
    pub mit_local_score: Vec<f64>,
    pub cfd_pam_penalty: Vec<f64>,
    pub cfd_pos_penalty: Vec<f64>,
}

impl PenaltyTables {
    /// Load the three tables from a directory containing
    /// `mit_local_score.bin`, `cfd_pam_penalty.bin`, `cfd_pos_penalty.bin` —
    /// each a flat array of little-endian `f64`s of the exact lengths above.
    pub fn load_from_dir(dir: &Path) -> Result<Self, IsslError> {
        let mit_local_score = read_f64_table(&dir.join("mit_local_score.bin"), MIT_TABLE_LEN)?;
        let cfd_pam_penalty = read_f64_table(&dir.join("cfd_pam_penalty.bin"), CFD_PAM_TABLE_LEN)?;
        let cfd_pos_penalty = read_f64_table(&dir.join("cfd_pos_penalty.bin"), CFD_POS_TABLE_LEN)?;
        Ok(PenaltyTables {
            mit_local_score,
            cfd_pam_penalty,
            cfd_pos_penalty,
        })
    }

    /// Build tables with every entry zeroed except the NGG PAM penalty,
    /// which defaults to 1.0 (no penalty). Useful for tests and for callers
    /// that only need the CFD perfect-match / MIT-disabled paths.
    pub fn zeroed() -> Self {
        let mut cfd_pam_penalty = vec![0.0; CFD_PAM_TABLE_LEN];
        cfd_pam_penalty[NGG_PAM_INDEX] = 1.0;
        PenaltyTables {
            mit_local_score: vec![0.0; MIT_TABLE_LEN],
            cfd_pam_penalty,
            cfd_pos_penalty: vec![1.0; CFD_POS_TABLE_LEN],
        }
    }

    #[inline]
    pub fn mit_score(&self, mismatch_mask: u32) -> f64 {
        self.mit_local_score[mismatch_mask as usize]
    }

    /// The CFD position-penalty index for a single mismatching position:
    /// `(pos<<4) | (guideBase2bit<<2) | rcOffTargetBase2bit`, where the
    /// off-target base is reverse-complemented (XOR 0b11) so the table is
    /// keyed by `(sgRNA, rc(offTarget))` at that position.
    #[inline]
    pub fn cfd_pos_index(pos: usize, guide_base: u64, offtarget_base: u64) -> usize {
        ((pos << 4) | ((guide_base as usize) << 2) | ((offtarget_base ^ 0b11) as usize)) & 0x3FF
    }
}

fn read_f64_table(path: &Path, expected_len: usize) -> Result<Vec<f64>, IsslError> {
    let file = File::open(path).map_err(|source| IsslError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut bytes = Vec::with_capacity(expected_len * 8);
    BufReader::new(file)
        .read_to_end(&mut bytes)
        .map_err(|source| IsslError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if bytes.len() != expected_len * 8 {
        return Err(IsslError::Format(format!(
            "{}: expected {} f64 entries ({} bytes), found {} bytes",
            path.display(),
            expected_len,
            expected_len * 8,
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(LittleEndian::read_f64)
        .collect())
}
