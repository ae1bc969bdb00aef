use crate::sequence::SequenceQuality;

use anyhow::{bail, Result};
use bincode::{Decode, Encode};
use itertools::Itertools;
use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::ops::Range;

#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mutation {
    pub position: u32, // 0-based position in the reference (allele) sequence
    pub ty: MutationKind,
}

impl PartialOrd for Mutation {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Mutation {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.position.cmp(&other.position)
    }
}

#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MutationKind {
    Substitution(u8),   // The base observed in the read
    Deletion(u16),      // Number of reference bases missing from the read
    Insertion(Vec<u8>), // Bases inserted before `position`
}

impl MutationKind {
    /// Change in length of the read relative to the reference.
    fn length_delta(&self) -> i64 {
        match self {
            MutationKind::Substitution(_) => 0,
            MutationKind::Deletion(len) => -(*len as i64),
            MutationKind::Insertion(bases) => bases.len() as i64,
        }
    }
}

impl Display for Mutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.ty {
            MutationKind::Substitution(base) => write!(f, "S{}{}", self.position, *base as char),
            MutationKind::Deletion(len) => write!(f, "D{}:{}", self.position, len),
            MutationKind::Insertion(bases) => {
                write!(f, "I{}{}", self.position, String::from_utf8_lossy(bases))
            }
        }
    }
}

pub fn format_mutations(mutations: &[Mutation]) -> String {
    mutations.iter().join(",")
}

/// Alignment of a read (target) against a reference allele.
///
/// Ranges are 0-based and half-open. Mutations are sorted by reference
/// position and describe how the target differs from the reference inside
/// the aligned ranges.
#[derive(Encode, Decode, Debug, Clone)]
pub struct Alignment {
    reference_start: u32,
    reference_end: u32,
    target_start: u32,
    target_end: u32,
    mutations: Vec<Mutation>,
    score: f32,
}

impl Alignment {
    pub fn new(
        reference_range: Range<u32>,
        target_range: Range<u32>,
        mut mutations: Vec<Mutation>,
        score: f32,
    ) -> Result<Self> {
        if reference_range.start > reference_range.end || target_range.start > target_range.end {
            bail!("Invalid alignment ranges: {:?} -> {:?}", reference_range, target_range);
        }
        mutations.sort();
        let mut delta = 0i64;
        for m in mutations.iter() {
            let end = match &m.ty {
                MutationKind::Deletion(len) => m.position + *len as u32,
                MutationKind::Insertion(_) => m.position,
                MutationKind::Substitution(_) => m.position + 1,
            };
            if m.position < reference_range.start || end > reference_range.end {
                bail!("Mutation {} outside of reference range {:?}", m, reference_range);
            }
            delta += m.ty.length_delta();
        }
        let ref_len = (reference_range.end - reference_range.start) as i64;
        let target_len = (target_range.end - target_range.start) as i64;
        if ref_len + delta != target_len {
            bail!(
                "Inconsistent alignment: reference length {} with mutations [{}] does not match target length {}",
                ref_len,
                format_mutations(&mutations),
                target_len
            );
        }
        Ok(Self {
            reference_start: reference_range.start,
            reference_end: reference_range.end,
            target_start: target_range.start,
            target_end: target_range.end,
            mutations,
            score,
        })
    }

    pub fn reference_range(&self) -> Range<u32> {
        self.reference_start..self.reference_end
    }

    pub fn target_range(&self) -> Range<u32> {
        self.target_start..self.target_end
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn score(&self) -> f32 {
        self.score
    }

    /// Map a reference position to the target.
    ///
    /// Returns `None` outside `[reference_start, reference_end]`. The exclusive
    /// reference end maps to the target end. A position inside a deletion maps
    /// to the target position where the deletion occurs.
    pub fn convert_position(&self, position: u32) -> Option<u32> {
        if position < self.reference_start || position > self.reference_end {
            return None;
        }
        let mut delta = 0i64;
        for m in self.mutations.iter() {
            match &m.ty {
                MutationKind::Substitution(_) => {}
                MutationKind::Insertion(bases) => {
                    if m.position <= position {
                        delta += bases.len() as i64;
                    }
                }
                MutationKind::Deletion(len) => {
                    let end = m.position + *len as u32;
                    if end <= position {
                        delta -= *len as i64;
                    } else if m.position <= position {
                        let p = (m.position - self.reference_start) as i64 + delta;
                        return Some(self.target_start + p as u32);
                    }
                }
            }
        }
        let p = (position - self.reference_start) as i64 + delta;
        Some(self.target_start + p as u32)
    }

    /// The part of `target` aligned to `range` of the reference.
    pub fn project(&self, target: &SequenceQuality, range: Range<u32>) -> Option<SequenceQuality> {
        let from = self.convert_position(range.start)?;
        let to = self.convert_position(range.end)?;
        if from > to {
            return None;
        }
        target.get(from as usize..to as usize)
    }
}

impl PartialEq for Alignment {
    fn eq(&self, other: &Self) -> bool {
        self.reference_start == other.reference_start
            && self.reference_end == other.reference_end
            && self.target_start == other.target_start
            && self.target_end == other.target_end
            && self.mutations == other.mutations
            && self.score.to_bits() == other.score.to_bits()
    }
}

impl Eq for Alignment {}

impl Hash for Alignment {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.reference_start.hash(state);
        self.reference_end.hash(state);
        self.target_start.hash(state);
        self.target_end.hash(state);
        self.mutations.hash(state);
        self.score.to_bits().hash(state);
    }
}

/// Intersection of two half-open ranges, `None` if empty.
pub fn intersect(a: &Range<u32>, b: &Range<u32>) -> Option<Range<u32>> {
    let start = a.start.max(b.start);
    let end = a.end.min(b.end);
    if start < end {
        Some(start..end)
    } else {
        None
    }
}
