//! The specificity scoring engine: for each candidate
//! guide, walks every slice bucket it projects into, deduplicates
//! candidates with a per-worker bitset, accumulates MIT/CFD contributions
//! with early exit, and classifies the result against a threshold.

use crate::bitset::SeenSet;
use crate::error::IsslError;
use crate::index_reader::IndexReader;
use crate::penalties::PenaltyTables;
use crate::signature::{hamming_distance, mismatch_mask, sequence_to_signature, Signature, SEQ_LENGTH};
use rayon::prelude::*;

/// Which score(s) to compute and how early exit and acceptance are judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ScoreMethod {
    Mit,
    Cfd,
    MitAndCfd,
    MitOrCfd,
    AvgMitCfd,
}

#[derive(Debug, Clone, Copy)]
pub struct ScoringConfig {
    /// Maximum Hamming distance scored; candidates beyond are skipped.
    pub max_dist: u32,
    pub score_method: ScoreMethod,
    /// Accept/reject cutoff in (0, 100].
    pub score_threshold: f64,
    pub threads: usize,
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), IsslError> {
        if !(self.score_threshold > 0.0 && self.score_threshold <= 100.0) {
            return Err(IsslError::Config(format!(
                "scoreThreshold must be in (0, 100], got {}",
                self.score_threshold
            )));
        }
        if self.threads == 0 {
            return Err(IsslError::Config("threads must be > 0".into()));
        }
        Ok(())
    }

    /// `(10000 - threshold*100) / threshold`.
    fn maximum_sum(&self) -> f64 {
        (10000.0 - self.score_threshold * 100.0) / self.score_threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy)]
pub struct GuideScore {
    /// `-1.0` when MIT was not computed for this `scoreMethod`.
    pub final_mit: f64,
    /// `-1.0` when CFD was not computed for this `scoreMethod`.
    pub final_cfd: f64,
    pub verdict: Verdict,
}

pub struct ScoringEngine<'a> {
    index: &'a IndexReader,
    tables: &'a PenaltyTables,
    config: ScoringConfig,
}

impl<'a> ScoringEngine<'a> {
    pub fn new(
        index: &'a IndexReader,
        tables: &'a PenaltyTables,
        config: ScoringConfig,
    ) -> Result<Self, IsslError> {
        config.validate()?;
        Ok(ScoringEngine {
            index,
            tables,
            config,
        })
    }

    /// Score a batch of guide sequences. Results are returned in input
    /// order regardless of scheduling, and are bitwise-identical no matter
    /// how many worker threads ran: each guide is
    /// scored start-to-finish by a single thread.
    pub fn score_batch(&self, guides: &[Vec<u8>]) -> Result<Vec<GuideScore>, IsslError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.threads)
            .build()
            .map_err(|e| IsslError::Config(format!("failed to build thread pool: {e}")))?;

        let unique_count = self.index.unique_offtargets_count() as usize;
        pool.install(|| {
            guides
                .par_iter()
                .map_init(
                    || SeenSet::new(unique_count),
                    |seen, seq| {
                        let sig = sequence_to_signature(seq)
                            .map_err(|e| IsslError::Format(format!("query guide: {e}")))?;
                        Ok(self.score_one(sig, seen))
                    },
                )
                .collect()
        })
    }

    /// Evaluate a single guide signature against every slice, accumulating
    /// MIT/CFD contributions with early exit.
    fn score_one(&self, guide: Signature, seen: &mut SeenSet) -> GuideScore {
        seen.clear();

        let wants_mit = matches!(
            self.config.score_method,
            ScoreMethod::Mit | ScoreMethod::MitAndCfd | ScoreMethod::MitOrCfd | ScoreMethod::AvgMitCfd
        );
        let wants_cfd = matches!(
            self.config.score_method,
            ScoreMethod::Cfd | ScoreMethod::MitAndCfd | ScoreMethod::MitOrCfd | ScoreMethod::AvgMitCfd
        );

        let max_sum = self.config.maximum_sum();
        let mut tot_mit = 0.0f64;
        let mut tot_cfd = 0.0f64;

        'slices: for slice_idx in 0..self.index.slice_count() {
            let mask = self.index.slice_mask(slice_idx);
            let key = mask.project(guide);

            for (id, occurrences) in self.index.lookup(slice_idx, key) {
                if seen.test_and_set(id) {
                    continue;
                }

                let candidate = self.index.signature_at(id);
                let m = mismatch_mask(guide, candidate);
                let d = m.count_ones();
                if d > self.config.max_dist {
                    continue;
                }

                let occurrences = occurrences as f64;
                if wants_mit {
                    tot_mit += self.tables.mit_score(m) * occurrences;
                }
                if wants_cfd {
                    tot_cfd += self.cfd_contribution(guide, candidate, d) * occurrences;
                }

                if self.should_exit_early(tot_mit, tot_cfd, max_sum) {
                    break 'slices;
                }
            }
        }

        let final_mit = if wants_mit { 10000.0 / (100.0 + tot_mit) } else { -1.0 };
        let final_cfd = if wants_cfd { 10000.0 / (100.0 + tot_cfd) } else { -1.0 };
        let verdict = self.classify(final_mit, final_cfd);

        GuideScore {
            final_mit,
            final_cfd,
            verdict,
        }
    }

    /// CFD contribution for one candidate: `1.0`
    /// for a perfect match, otherwise the PAM penalty times each
    /// mismatching position's positional penalty.
    fn cfd_contribution(&self, guide: Signature, candidate: Signature, distance: u32) -> f64 {
        if distance == 0 {
            return 1.0;
        }
        let mut cfd = self.tables.cfd_pam_penalty[crate::penalties::NGG_PAM_INDEX];
        for pos in 0..SEQ_LENGTH {
            let g = (guide.0 >> (pos * 2)) & 0x3;
            let t = (candidate.0 >> (pos * 2)) & 0x3;
            if g != t {
                let idx = PenaltyTables::cfd_pos_index(pos, g, t);
                cfd *= self.tables.cfd_pos_penalty[idx];
            }
        }
        cfd
    }

    fn should_exit_early(&self, tot_mit: f64, tot_cfd: f64, max_sum: f64) -> bool {
        match self.config.score_method {
            ScoreMethod::Mit => tot_mit > max_sum,
            ScoreMethod::Cfd => tot_cfd > max_sum,
            ScoreMethod::MitAndCfd => tot_mit > max_sum && tot_cfd > max_sum,
            ScoreMethod::MitOrCfd => tot_mit > max_sum || tot_cfd > max_sum,
            ScoreMethod::AvgMitCfd => (tot_mit + tot_cfd) / 2.0 > max_sum,
        }
    }

    fn classify(&self, final_mit: f64, final_cfd: f64) -> Verdict {
        let t = self.config.score_threshold;
        let accepted = match self.config.score_method {
            ScoreMethod::Mit => final_mit >= t,
            ScoreMethod::Cfd => final_cfd >= t,
            ScoreMethod::MitAndCfd => final_mit >= t && final_cfd >= t,
            ScoreMethod::MitOrCfd => final_mit >= t || final_cfd >= t,
            ScoreMethod::AvgMitCfd => (final_mit + final_cfd) / 2.0 >= t,
        };
        if accepted {
            Verdict::Accepted
        } else {
            Verdict::Rejected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_builder::{dedup_sorted_seeds, IndexBuilder};
    use std::io::Cursor;

    fn build_index(seeds: &str, n_slices: usize, max_dist: u32) -> (tempfile::TempDir, IndexReader) {
        let unique = dedup_sorted_seeds(Cursor::new(seeds)).unwrap();
        let builder = IndexBuilder::new(n_slices, max_dist).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.issl");
        builder.build(&unique, &path).unwrap();
        let reader = IndexReader::open(&path).unwrap();
        (dir, reader)
    }

    fn mit_tables_with_identity() -> PenaltyTables {
        // mitLocalScore[mask] = 0 everywhere so a perfect match scores 0,
        // matching the scenario 4 assertion without needing real data.
        PenaltyTables::zeroed()
    }

    #[test]
    fn mit_perfect_match_scores_100() {
        let (_dir, index) = build_index("AAAAAAAAAAAAAAAAAAAA\n", 5, 4);
        let tables = mit_tables_with_identity();
        let config = ScoringConfig {
            max_dist: 4,
            score_method: ScoreMethod::Mit,
            score_threshold: 50.0,
            threads: 1,
        };
        let engine = ScoringEngine::new(&index, &tables, config).unwrap();
        let results = engine
            .score_batch(&[b"AAAAAAAAAAAAAAAAAAAA".to_vec()])
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!((results[0].final_mit - 100.0).abs() < 1e-9);
        assert_eq!(results[0].final_cfd, -1.0);
        assert_eq!(results[0].verdict, Verdict::Accepted);
    }

    #[test]
    fn cfd_perfect_match_scores_approx_99() {
        let (_dir, index) = build_index("AAAAAAAAAAAAAAAAAAAA\n", 5, 4);
        let tables = mit_tables_with_identity();
        let config = ScoringConfig {
            max_dist: 4,
            score_method: ScoreMethod::Cfd,
            score_threshold: 50.0,
            threads: 1,
        };
        let engine = ScoringEngine::new(&index, &tables, config).unwrap();
        let results = engine
            .score_batch(&[b"AAAAAAAAAAAAAAAAAAAA".to_vec()])
            .unwrap();
        assert!((results[0].final_cfd - 10000.0 / 101.0).abs() < 1e-6);
        assert_eq!(results[0].final_mit, -1.0);
    }

    #[test]
    fn pigeonhole_finds_one_mismatch_neighbor() {
        let (_dir, index) = build_index(
            "AAAAAAAAAAAAAAAAAAAA\nAAAAAAAAAAAAAAAAAAAC\n",
            5,
            4,
        );
        let mut tables = PenaltyTables::zeroed();
        // give every 1-bit mismatch mask a nonzero score so we can observe
        // the neighbor being scored at all.
        for (mask, v) in tables.mit_local_score.iter_mut().enumerate() {
            if (mask as u32).count_ones() == 1 {
                *v = 1.0;
            }
        }
        let config = ScoringConfig {
            max_dist: 4,
            score_method: ScoreMethod::Mit,
            score_threshold: 1.0,
            threads: 1,
        };
        let engine = ScoringEngine::new(&index, &tables, config).unwrap();
        let results = engine
            .score_batch(&[b"AAAAAAAAAAAAAAAAAAAA".to_vec()])
            .unwrap();
        // R2 has occurrences=1, contributing 1.0 to totMit.
        assert!(results[0].final_mit < 100.0);
    }

    #[test]
    fn distance_beyond_max_dist_is_dropped() {
        let (_dir, index) = build_index(
            "AAAAAAAAAAAAAAAAAAAA\nTTTTTTTTTTTTTTTTTTTT\n",
            5,
            4,
        );
        let tables = mit_tables_with_identity();
        let config = ScoringConfig {
            max_dist: 4,
            score_method: ScoreMethod::Mit,
            score_threshold: 50.0,
            threads: 1,
        };
        let engine = ScoringEngine::new(&index, &tables, config).unwrap();
        // all-T is 20 mismatches from all-A, far beyond max_dist=4, so
        // only the perfect self-match contributes.
        let results = engine
            .score_batch(&[b"AAAAAAAAAAAAAAAAAAAA".to_vec()])
            .unwrap();
        assert!((results[0].final_mit - 100.0).abs() < 1e-9);
    }

    #[test]
    fn scoring_is_deterministic_across_thread_counts() {
        let (_dir, index) = build_index(
            "AAAAAAAAAAAAAAAAAAAA\nAAAAAAAAAAAAAAAAAAAC\nAAAAAAAAAAAAAAAAAACC\n",
            5,
            4,
        );
        let mut tables = PenaltyTables::zeroed();
        for (mask, v) in tables.mit_local_score.iter_mut().enumerate() {
            *v = (mask as u32).count_ones() as f64 * 0.1;
        }
        let guides: Vec<Vec<u8>> = vec![
            b"AAAAAAAAAAAAAAAAAAAA".to_vec(),
            b"AAAAAAAAAAAAAAAAAAAC".to_vec(),
        ];

        let single = {
            let config = ScoringConfig {
                max_dist: 4,
                score_method: ScoreMethod::AvgMitCfd,
                score_threshold: 10.0,
                threads: 1,
            };
            let engine = ScoringEngine::new(&index, &tables, config).unwrap();
            engine.score_batch(&guides).unwrap()
        };
        let multi = {
            let config = ScoringConfig {
                max_dist: 4,
                score_method: ScoreMethod::AvgMitCfd,
                score_threshold: 10.0,
                threads: 4,
            };
            let engine = ScoringEngine::new(&index, &tables, config).unwrap();
            engine.score_batch(&guides).unwrap()
        };

        for (a, b) in single.iter().zip(multi.iter()) {
            assert_eq!(a.final_mit.to_bits(), b.final_mit.to_bits());
            assert_eq!(a.final_cfd.to_bits(), b.final_cfd.to_bits());
            assert_eq!(a.verdict, b.verdict);
        }
    }

    #[test]
    fn rejects_invalid_threshold() {
        let (_dir, index) = build_index("AAAAAAAAAAAAAAAAAAAA\n", 5, 4);
        let tables = mit_tables_with_identity();
        let config = ScoringConfig {
            max_dist: 4,
            score_method: ScoreMethod::Mit,
            score_threshold: 0.0,
            threads: 1,
        };
        assert!(ScoringEngine::new(&index, &tables, config).is_err());
    }

    #[test]
    fn hamming_distance_matches_mismatch_popcount() {
        let a = sequence_to_signature(b"AAAAAAAAAAAAAAAAAAAA").unwrap();
        let b = sequence_to_signature(b"AAAAAAAAAAAAAAAAAAAC").unwrap();
        assert_eq!(hamming_distance(a, b), 1);
    }
}
