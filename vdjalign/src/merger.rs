use serde::{Deserialize, Serialize};
use vdjlib::SequenceQuality;

/// Quality scores are capped at this value when two agreeing bases are combined.
pub const MAX_PHRED: u8 = 93;
/// Lowest quality assigned to a disagreeing position.
pub const MIN_PHRED: u8 = 2;

/// Relative orientation of the two mates of a pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReadsLayout {
    /// Mate 2 is sequenced from the opposite strand (standard paired-end).
    #[default]
    Opposite,
    /// Both mates are read in the same direction.
    Collinear,
}

impl ReadsLayout {
    /// Put mate 2 in the orientation of mate 1.
    pub fn orient_mate2(&self, mate2: &SequenceQuality) -> SequenceQuality {
        match self {
            ReadsLayout::Opposite => mate2.reverse_complement(),
            ReadsLayout::Collinear => mate2.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergerParameters {
    pub min_overlap: usize,
    pub max_mismatches: usize,
    pub max_mismatch_rate: f64,
}

impl Default for MergerParameters {
    fn default() -> Self {
        Self {
            min_overlap: 17,
            max_mismatches: 5,
            max_mismatch_rate: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeResult {
    Merged {
        consensus: SequenceQuality,
        overlap: usize,
        mismatches: usize,
    },
    Failed,
}

impl MergeResult {
    pub fn is_merged(&self) -> bool {
        matches!(self, MergeResult::Merged { .. })
    }
}

/// Reconciles the two mates of a pair into a single consensus read when
/// their ends overlap.
#[derive(Debug, Clone)]
pub struct PairMerger {
    parameters: MergerParameters,
    layout: ReadsLayout,
}

impl PairMerger {
    pub fn new(parameters: MergerParameters, layout: ReadsLayout) -> Self {
        Self { parameters, layout }
    }

    pub fn parameters(&self) -> &MergerParameters {
        &self.parameters
    }

    pub fn layout(&self) -> ReadsLayout {
        self.layout
    }

    /// Try to merge two mates. The result is deterministic for a given input.
    pub fn merge(&self, mate1: &SequenceQuality, mate2: &SequenceQuality) -> MergeResult {
        let mate2 = self.layout.orient_mate2(mate2);
        match self.find_overlap(mate1.sequence(), mate2.sequence()) {
            None => MergeResult::Failed,
            Some((overlap, mismatches)) => MergeResult::Merged {
                consensus: consensus(mate1, &mate2, overlap),
                overlap,
                mismatches,
            },
        }
    }

    /// Returns the overlap length and its number of mismatches. Among the
    /// acceptable overlaps the one with fewest mismatches wins, ties going to
    /// the longest.
    fn find_overlap(&self, seq1: &[u8], seq2: &[u8]) -> Option<(usize, usize)> {
        let max_overlap = seq1.len().min(seq2.len());
        let mut best: Option<(usize, usize)> = None;
        for k in self.parameters.min_overlap.max(1)..=max_overlap {
            let suffix = &seq1[seq1.len() - k..];
            let prefix = &seq2[..k];
            let limit = self
                .parameters
                .max_mismatches
                .min((self.parameters.max_mismatch_rate * k as f64).floor() as usize);
            let mut mismatches = 0;
            for (a, b) in suffix.iter().zip(prefix) {
                if a != b {
                    mismatches += 1;
                    if mismatches > limit {
                        break;
                    }
                }
            }
            if mismatches > limit {
                continue;
            }
            match best {
                Some((_, m)) if m < mismatches => {}
                _ => best = Some((k, mismatches)),
            }
        }
        best
    }
}

/// Call one position read twice. Agreeing bases add their qualities; otherwise
/// the better base wins (the first on ties) with the difference as quality.
pub(crate) fn combine_bases((b1, q1): (u8, u8), (b2, q2): (u8, u8)) -> (u8, u8) {
    if b1 == b2 {
        (b1, q1.saturating_add(q2).min(MAX_PHRED))
    } else if q2 > q1 {
        (b2, (q2 - q1).max(MIN_PHRED))
    } else {
        (b1, (q1 - q2).max(MIN_PHRED))
    }
}

/// Build the merged read: mate 1 prefix, consensus of the overlap, then the
/// rest of the (oriented) mate 2.
fn consensus(mate1: &SequenceQuality, mate2: &SequenceQuality, overlap: usize) -> SequenceQuality {
    let offset = mate1.len() - overlap;
    let mut result = SequenceQuality::default();
    for i in 0..offset {
        result.push(mate1.sequence()[i], mate1.quality()[i]);
    }
    for i in 0..overlap {
        let (base, quality) = combine_bases(
            (mate1.sequence()[offset + i], mate1.quality()[offset + i]),
            (mate2.sequence()[i], mate2.quality()[i]),
        );
        result.push(base, quality);
    }
    for i in overlap..mate2.len() {
        result.push(mate2.sequence()[i], mate2.quality()[i]);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEQ: &[u8] = b"GATCCTGACGTTAGCCATGGTACGATCGGATTCAGCTAGGCTTACCGATCGATTGCAGTCAGTTGACCA";

    #[test]
    fn test_merge_opposite() {
        let mate1 = SequenceQuality::with_uniform_quality(&SEQ[..40], 30);
        let mate2 = SequenceQuality::with_uniform_quality(&SEQ[20..], 30).reverse_complement();
        let merger = PairMerger::new(MergerParameters::default(), ReadsLayout::Opposite);
        match merger.merge(&mate1, &mate2) {
            MergeResult::Merged { consensus, overlap, mismatches } => {
                assert_eq!(overlap, 20);
                assert_eq!(mismatches, 0);
                assert_eq!(consensus.sequence(), SEQ);
                assert_eq!(consensus.quality()[0], 30);
                assert_eq!(consensus.quality()[25], 60);
            }
            MergeResult::Failed => panic!("expected a merge"),
        }
    }

    #[test]
    fn test_merge_with_mismatch() {
        let mate1 = SequenceQuality::with_uniform_quality(&SEQ[..40], 30);
        let mut seq2 = SEQ[20..].to_vec();
        seq2[5] = if seq2[5] == b'A' { b'C' } else { b'A' };
        let mut qual2 = vec![30; seq2.len()];
        qual2[5] = 35;
        let mate2 = SequenceQuality::new(seq2.clone(), qual2).unwrap();
        let merger = PairMerger::new(MergerParameters::default(), ReadsLayout::Collinear);
        match merger.merge(&mate1, &mate2) {
            MergeResult::Merged { consensus, overlap, mismatches } => {
                assert_eq!(overlap, 20);
                assert_eq!(mismatches, 1);
                assert_eq!(consensus.len(), SEQ.len());
                assert_eq!(consensus.sequence()[25], seq2[5]);
                assert_eq!(consensus.quality()[25], 5);
            }
            MergeResult::Failed => panic!("expected a merge"),
        }
    }

    #[test]
    fn test_merge_failure() {
        let mate1 = SequenceQuality::with_uniform_quality(&SEQ[..30], 30);
        let mate2 = SequenceQuality::with_uniform_quality(&SEQ[40..], 30);
        let merger = PairMerger::new(MergerParameters::default(), ReadsLayout::Collinear);
        assert_eq!(merger.merge(&mate1, &mate2), MergeResult::Failed);

        let short = SequenceQuality::with_uniform_quality(&SEQ[..10], 30);
        assert!(!merger.merge(&short, &short).is_merged());
    }
}
