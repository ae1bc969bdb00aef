use anyhow::{bail, Result};
use bincode::{Decode, Encode};
use bstr::ByteSlice;
use noodles::fastq;
use std::fmt::Display;
use std::ops::Range;

/// Phred offset used by FASTQ quality strings.
pub const PHRED_OFFSET: u8 = 33;

/// A nucleotide sequence together with per-base phred qualities.
#[derive(Encode, Decode, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SequenceQuality {
    sequence: Vec<u8>,
    quality: Vec<u8>,
}

impl SequenceQuality {
    pub fn new(sequence: Vec<u8>, quality: Vec<u8>) -> Result<Self> {
        if sequence.len() != quality.len() {
            bail!(
                "Sequence and quality lengths differ: {} != {}",
                sequence.len(),
                quality.len()
            );
        }
        Ok(Self { sequence, quality })
    }

    /// Create a sequence where every base has the same quality.
    pub fn with_uniform_quality(sequence: &[u8], quality: u8) -> Self {
        Self {
            sequence: sequence.to_vec(),
            quality: vec![quality; sequence.len()],
        }
    }

    /// Decode a FASTQ record. Quality scores are converted from phred+33.
    pub fn from_fastq(record: &fastq::Record) -> Result<Self> {
        let sequence = record.sequence().to_ascii_uppercase();
        let quality = record
            .quality_scores()
            .iter()
            .map(|q| q.saturating_sub(PHRED_OFFSET))
            .collect();
        Self::new(sequence, quality)
    }

    pub fn sequence(&self) -> &[u8] {
        &self.sequence
    }

    pub fn quality(&self) -> &[u8] {
        &self.quality
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    /// Lowest quality in the sequence, 0 when empty.
    pub fn min_quality(&self) -> u8 {
        self.quality.iter().copied().min().unwrap_or(0)
    }

    pub fn get(&self, range: Range<usize>) -> Option<Self> {
        if range.start > range.end || range.end > self.len() {
            return None;
        }
        Some(Self {
            sequence: self.sequence[range.clone()].to_vec(),
            quality: self.quality[range].to_vec(),
        })
    }

    pub fn push(&mut self, base: u8, quality: u8) {
        self.sequence.push(base);
        self.quality.push(quality);
    }

    pub fn extend(&mut self, other: &Self) {
        self.sequence.extend_from_slice(&other.sequence);
        self.quality.extend_from_slice(&other.quality);
    }

    pub fn reverse_complement(&self) -> Self {
        Self {
            sequence: rev_compl(&self.sequence),
            quality: self.quality.iter().rev().copied().collect(),
        }
    }
}

impl FromIterator<SequenceQuality> for SequenceQuality {
    fn from_iter<T: IntoIterator<Item = SequenceQuality>>(iter: T) -> Self {
        let mut result = SequenceQuality::default();
        iter.into_iter().for_each(|x| result.extend(&x));
        result
    }
}

impl Display for SequenceQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.sequence.as_bstr())
    }
}

pub fn rev_compl(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|&x| match x {
            b'A' => b'T',
            b'T' => b'A',
            b'C' => b'G',
            b'G' => b'C',
            b'a' => b't',
            b't' => b'a',
            b'c' => b'g',
            b'g' => b'c',
            _ => x,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_fastq() {
        let record = fastq::Record::new(
            fastq::record::Definition::new("r1", ""),
            b"acgtN".to_vec(),
            b"I5+!#".to_vec(),
        );
        let sq = SequenceQuality::from_fastq(&record).unwrap();
        assert_eq!(sq.sequence(), b"ACGTN");
        assert_eq!(sq.quality(), &[40, 20, 10, 0, 2]);
        assert_eq!(sq.min_quality(), 0);
    }

    #[test]
    fn test_reverse_complement() {
        let sq = SequenceQuality::new(b"AACGT".to_vec(), vec![1, 2, 3, 4, 5]).unwrap();
        let rc = sq.reverse_complement();
        assert_eq!(rc.sequence(), b"ACGTT");
        assert_eq!(rc.quality(), &[5, 4, 3, 2, 1]);
        assert_eq!(rc.reverse_complement(), sq);
    }

    #[test]
    fn test_slicing() {
        let sq = SequenceQuality::with_uniform_quality(b"ACGTACGT", 30);
        assert_eq!(sq.get(2..5).unwrap().sequence(), b"GTA");
        assert!(sq.get(5..9).is_none());
        let joined: SequenceQuality = vec![sq.get(0..2).unwrap(), sq.get(6..8).unwrap()]
            .into_iter()
            .collect();
        assert_eq!(joined.to_string(), "ACGT");
        assert!(SequenceQuality::new(b"AC".to_vec(), vec![1]).is_err());
    }
}
