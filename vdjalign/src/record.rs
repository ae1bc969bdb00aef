use crate::error::{Error, Result};
use crate::merger::combine_bases;

use itertools::Itertools;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::ops::Range;
use std::sync::{Arc, OnceLock};
use vdjlib::{
    intersect, shift_position, Alignment, Allele, GeneFeature, GeneType, ReferencePoint,
    SequenceQuality,
};

/// Alignment of one allele against the targets of a record.
#[derive(Debug, Clone)]
pub struct Hit {
    allele: Arc<Allele>,
    alignments: SmallVec<[Option<Alignment>; 2]>, // One slot per target
    score: f32,
}

impl Hit {
    pub fn new(allele: Arc<Allele>, alignments: Vec<Option<Alignment>>, score: f32) -> Self {
        Self {
            allele,
            alignments: alignments.into(),
            score,
        }
    }

    pub fn allele(&self) -> &Arc<Allele> {
        &self.allele
    }

    pub fn gene_type(&self) -> GeneType {
        self.allele.gene_type()
    }

    pub fn alignment(&self, target: usize) -> Option<&Alignment> {
        self.alignments.get(target)?.as_ref()
    }

    pub fn alignments(&self) -> &[Option<Alignment>] {
        &self.alignments
    }

    pub fn score(&self) -> f32 {
        self.score
    }
}

impl PartialEq for Hit {
    fn eq(&self, other: &Self) -> bool {
        (Arc::ptr_eq(&self.allele, &other.allele) || self.allele.name() == other.allele.name())
            && self.alignments == other.alignments
            && self.score.to_bits() == other.score.to_bits()
    }
}

impl Eq for Hit {}

impl Hash for Hit {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.allele.name().hash(state);
        self.alignments.hash(state);
        self.score.to_bits().hash(state);
    }
}

/// Anchor positions resolved on one target from the top hit of each gene type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetPartitioning {
    target_len: u32,
    points: BTreeMap<ReferencePoint, u32>,
}

impl TargetPartitioning {
    fn new(target: usize, target_len: u32, top_hits: &[&Hit]) -> Self {
        let mut points = BTreeMap::new();
        for hit in top_hits {
            let alignment = match hit.alignment(target) {
                Some(a) => a,
                None => continue,
            };
            for (point, position) in hit.allele().anchors() {
                if let Some(p) = alignment.convert_position(position) {
                    points.insert(point, p);
                }
            }
            let range = alignment.target_range();
            match hit.gene_type() {
                GeneType::Variable => {
                    points.insert(ReferencePoint::VEndTrimmed, range.end);
                }
                GeneType::Diversity => {
                    points.insert(ReferencePoint::DBeginTrimmed, range.start);
                    points.insert(ReferencePoint::DEndTrimmed, range.end);
                }
                GeneType::Joining => {
                    points.insert(ReferencePoint::JBeginTrimmed, range.start);
                }
                GeneType::Constant => {}
            }
        }
        Self { target_len, points }
    }

    pub fn position(&self, point: ReferencePoint) -> Option<u32> {
        self.points.get(&point).copied()
    }

    fn shifted(&self, point: ReferencePoint, offset: i32) -> Option<u32> {
        let p = shift_position(self.position(point)? as usize, offset)?;
        if p > self.target_len as usize {
            None
        } else {
            Some(p as u32)
        }
    }

    /// Range of the feature on the target, if both of its anchors are resolved.
    pub fn feature_range(&self, feature: &GeneFeature) -> Option<Range<u32>> {
        let begin = self.shifted(feature.begin(), feature.begin_offset())?;
        let end = self.shifted(feature.end(), feature.end_offset())?;
        if begin > end {
            None
        } else {
            Some(begin..end)
        }
    }

    /// Range of `inner` relative to the start of `outer`.
    pub fn relative_range(&self, outer: &GeneFeature, inner: &GeneFeature) -> Option<Range<u32>> {
        let outer = self.feature_range(outer)?;
        let inner = self.feature_range(inner)?;
        if inner.start < outer.start || inner.end > outer.end {
            None
        } else {
            Some(inner.start - outer.start..inner.end - outer.start)
        }
    }
}

/// Alignment result of one read: its targets and the ranked hits of every
/// gene type.
#[derive(Debug, Clone)]
pub struct AlignmentRecord {
    targets: SmallVec<[SequenceQuality; 2]>,
    hits: BTreeMap<GeneType, Vec<Hit>>,
    read_id: u64,
    index: Option<u64>,
    partitions: OnceLock<Vec<TargetPartitioning>>,
}

impl AlignmentRecord {
    /// Create a record. Hits are sorted best-first and gene types without
    /// hits are dropped.
    pub fn new<I>(read_id: u64, targets: Vec<SequenceQuality>, hits: I) -> Result<Self>
    where
        I: IntoIterator<Item = (GeneType, Vec<Hit>)>,
    {
        if targets.is_empty() || targets.len() > 2 {
            return Err(Error::format(format!(
                "a record must have one or two targets, found {}",
                targets.len()
            )));
        }
        let mut map = BTreeMap::new();
        for (gene_type, list) in hits {
            if list.is_empty() {
                continue;
            }
            for hit in list.iter() {
                if hit.alignments.len() != targets.len() {
                    return Err(Error::format(format!(
                        "hit on {} has {} alignment slots for {} targets",
                        hit.allele.name(),
                        hit.alignments.len(),
                        targets.len()
                    )));
                }
                if hit.gene_type() != gene_type {
                    return Err(Error::format(format!(
                        "{} is not a {} gene",
                        hit.allele.name(),
                        gene_type
                    )));
                }
            }
            map.entry(gene_type).or_insert_with(Vec::new).extend(list);
        }
        map.values_mut()
            .for_each(|list: &mut Vec<Hit>| list.sort_by(|a, b| b.score.total_cmp(&a.score)));
        Ok(Self {
            targets: targets.into(),
            hits: map,
            read_id,
            index: None,
            partitions: OnceLock::new(),
        })
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = Some(index);
        self
    }

    pub fn read_id(&self) -> u64 {
        self.read_id
    }

    /// Position of the record in the stream it was read from.
    pub fn index(&self) -> Option<u64> {
        self.index
    }

    pub fn number_of_targets(&self) -> usize {
        self.targets.len()
    }

    pub fn target(&self, i: usize) -> &SequenceQuality {
        &self.targets[i]
    }

    pub fn targets(&self) -> &[SequenceQuality] {
        &self.targets
    }

    /// Hits of a gene type, best first. Empty if there are none.
    pub fn hits(&self, gene_type: GeneType) -> &[Hit] {
        self.hits
            .get(&gene_type)
            .map(|x| x.as_slice())
            .unwrap_or(&[])
    }

    pub fn all_hits(&self) -> impl Iterator<Item = (GeneType, &[Hit])> {
        self.hits.iter().map(|(g, h)| (*g, h.as_slice()))
    }

    pub fn best_hit(&self, gene_type: GeneType) -> Option<&Hit> {
        self.hits.get(&gene_type)?.first()
    }

    fn partitions(&self) -> &[TargetPartitioning] {
        self.partitions.get_or_init(|| {
            let top_hits = self.hits.values().filter_map(|h| h.first()).collect::<Vec<_>>();
            self.targets
                .iter()
                .enumerate()
                .map(|(i, t)| TargetPartitioning::new(i, t.len() as u32, &top_hits))
                .collect()
        })
    }

    /// Anchor positions of a target. Computed once on first access.
    pub fn partitioned_target(&self, target: usize) -> Option<&TargetPartitioning> {
        self.partitions().get(target)
    }

    fn feature_on_target(&self, target: usize, feature: &GeneFeature) -> Option<SequenceQuality> {
        let range = self.partitioned_target(target)?.feature_range(feature)?;
        self.targets[target].get(range.start as usize..range.end as usize)
    }

    /// Sequence of a gene feature.
    ///
    /// If several targets cover the feature, the one with the highest minimal
    /// quality is used. For paired targets a feature that starts on one mate
    /// and ends on the other is stitched together over the region both mates
    /// share on the best V hit.
    pub fn feature(&self, feature: &GeneFeature) -> Option<SequenceQuality> {
        let direct = (0..self.targets.len())
            .filter_map(|i| self.feature_on_target(i, feature))
            .max_set_by_key(|x| x.min_quality())
            .into_iter()
            .next();
        if direct.is_some() || self.targets.len() != 2 {
            return direct;
        }
        self.straddling_feature(feature)
    }

    fn straddling_feature(&self, feature: &GeneFeature) -> Option<SequenceQuality> {
        let v_hit = self.best_hit(GeneType::Variable)?;
        let p0 = self.partitioned_target(0)?;
        let p1 = self.partitioned_target(1)?;

        let (left, begin, end) = match (
            p1.shifted(feature.begin(), feature.begin_offset()),
            p0.shifted(feature.end(), feature.end_offset()),
        ) {
            (Some(b), Some(e)) => (1, b, e),
            _ => (
                0,
                p0.shifted(feature.begin(), feature.begin_offset())?,
                p1.shifted(feature.end(), feature.end_offset())?,
            ),
        };
        let right = 1 - left;
        let l_alignment = v_hit.alignment(left)?;
        let r_alignment = v_hit.alignment(right)?;

        let overlap = intersect(&l_alignment.reference_range(), &r_alignment.reference_range())?;
        let middle = consensus(
            l_alignment.project(&self.targets[left], overlap.clone())?,
            r_alignment.project(&self.targets[right], overlap.clone())?,
        );

        let l_end = l_alignment.convert_position(overlap.start)?;
        let r_start = r_alignment.convert_position(overlap.end)?;
        let prefix = self.targets[left].get(begin as usize..l_end as usize)?;
        let suffix = self.targets[right].get(r_start as usize..end as usize)?;
        Some([prefix, middle, suffix].into_iter().collect())
    }

    /// Range of `inner` relative to `outer`, taken from the target with the
    /// best quality over `outer`.
    pub fn relative_range(&self, outer: &GeneFeature, inner: &GeneFeature) -> Option<Range<u32>> {
        let target = (0..self.targets.len())
            .filter_map(|i| Some((i, self.feature_on_target(i, outer)?.min_quality())))
            .max_set_by_key(|(_, q)| *q)
            .into_iter()
            .next()?
            .0;
        self.partitioned_target(target)?.relative_range(outer, inner)
    }
}

/// Combine two reads of the same reference region. Equal-length projections
/// are merged base by base with the pair merging rule; otherwise the
/// projection with the higher minimal quality is kept.
fn consensus(a: SequenceQuality, b: SequenceQuality) -> SequenceQuality {
    if a.len() != b.len() {
        return if b.min_quality() > a.min_quality() { b } else { a };
    }
    let mut result = SequenceQuality::default();
    for i in 0..a.len() {
        let (base, quality) = combine_bases(
            (a.sequence()[i], a.quality()[i]),
            (b.sequence()[i], b.quality()[i]),
        );
        result.push(base, quality);
    }
    result
}

impl PartialEq for AlignmentRecord {
    fn eq(&self, other: &Self) -> bool {
        self.targets == other.targets && self.hits == other.hits
    }
}

impl Eq for AlignmentRecord {}

impl Hash for AlignmentRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.targets.hash(state);
        self.hits.hash(state);
    }
}

impl std::fmt::Display for AlignmentRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.targets.iter().join("+"))?;
        for (gene_type, hits) in self.hits.iter() {
            write!(
                f,
                "\t{}:{}",
                gene_type,
                hits.iter()
                    .map(|h| format!("{}({})", h.allele.name(), h.score))
                    .join(",")
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdjlib::{Locus, Mutation, MutationKind};

    fn allele(name: &str, gene_type: GeneType, seq: &[u8]) -> Arc<Allele> {
        Arc::new(Allele::new(name, gene_type, Locus::TRB, seq))
    }

    fn hit(allele: &Arc<Allele>, score: f32, alignments: Vec<Option<Alignment>>) -> Hit {
        Hit::new(allele.clone(), alignments, score)
    }

    #[test]
    fn test_best_hit() {
        let target = SequenceQuality::with_uniform_quality(b"ACGTACGTAC", 30);
        let v1 = allele("V1", GeneType::Variable, b"ACGTACGTAC");
        let v2 = allele("V2", GeneType::Variable, b"ACGTACGTAA");
        let ali = |s| Some(Alignment::new(0..10, 0..10, vec![], s).unwrap());
        let record = AlignmentRecord::new(
            7,
            vec![target],
            vec![
                (GeneType::Variable, vec![hit(&v2, 30.0, vec![ali(30.0)]), hit(&v1, 50.0, vec![ali(50.0)])]),
                (GeneType::Joining, vec![]),
            ],
        )
        .unwrap();
        assert_eq!(record.best_hit(GeneType::Variable).unwrap().allele().name(), "V1");
        assert!(record.hits(GeneType::Variable).windows(2).all(|w| w[0].score() >= w[1].score()));
        assert!(record.best_hit(GeneType::Joining).is_none());
        assert_eq!(record.all_hits().count(), 1);
        assert_eq!(record.read_id(), 7);
        assert_eq!(record.index(), None);
    }

    #[test]
    fn test_invalid_record() {
        let target = SequenceQuality::with_uniform_quality(b"ACGT", 30);
        let v1 = allele("V1", GeneType::Variable, b"ACGT");
        let ali = Some(Alignment::new(0..4, 0..4, vec![], 20.0).unwrap());
        assert!(AlignmentRecord::new(0, vec![], vec![]).is_err());
        assert!(AlignmentRecord::new(
            0,
            vec![target.clone(), target.clone()],
            vec![(GeneType::Variable, vec![hit(&v1, 20.0, vec![ali.clone()])])]
        )
        .is_err());
        assert!(AlignmentRecord::new(
            0,
            vec![target],
            vec![(GeneType::Joining, vec![hit(&v1, 20.0, vec![ali])])]
        )
        .is_err());
    }

    // V allele: CDR3Begin at 12, VEnd at 20
    fn v_allele() -> Arc<Allele> {
        Arc::new(
            Allele::new("V1", GeneType::Variable, Locus::TRB, b"GGGGACGTACGTACGTCCAA")
                .with_anchor(ReferencePoint::CDR3Begin, 12)
                .unwrap()
                .with_anchor(ReferencePoint::VEnd, 20)
                .unwrap(),
        )
    }

    // J allele: JBegin at 0, CDR3End at 6
    fn j_allele() -> Arc<Allele> {
        Arc::new(
            Allele::new("J1", GeneType::Joining, Locus::TRB, b"TTTGGCCAAGG")
                .with_anchor(ReferencePoint::JBegin, 0)
                .unwrap()
                .with_anchor(ReferencePoint::CDR3End, 6)
                .unwrap(),
        )
    }

    #[test]
    fn test_partitioning() {
        // The read starts at V allele position 4
        let (v, j) = (v_allele(), j_allele());
        let target = SequenceQuality::with_uniform_quality(b"AGGTACGTACGTCCAATATTTGGCCAAGG", 30);
        let v_ali = Alignment::new(
            4..20,
            0..16,
            vec![Mutation { position: 5, ty: MutationKind::Substitution(b'G') }],
            70.0,
        )
        .unwrap();
        let j_ali = Alignment::new(0..11, 18..29, vec![], 55.0).unwrap();
        let record = AlignmentRecord::new(
            0,
            vec![target],
            vec![
                (GeneType::Variable, vec![hit(&v, 70.0, vec![Some(v_ali)])]),
                (GeneType::Joining, vec![hit(&j, 55.0, vec![Some(j_ali)])]),
            ],
        )
        .unwrap();
        let p = record.partitioned_target(0).unwrap();
        assert_eq!(p.position(ReferencePoint::CDR3Begin), Some(8));
        assert_eq!(p.position(ReferencePoint::VEndTrimmed), Some(16));
        assert_eq!(p.position(ReferencePoint::CDR3End), Some(24));
        assert_eq!(p.position(ReferencePoint::FR1Begin), None);

        assert_eq!(record.feature(&GeneFeature::CDR3).unwrap().sequence(), b"ACGTCCAATATTTGGC");
        assert_eq!(record.feature(&GeneFeature::VJ_JUNCTION).unwrap().sequence(), b"TA");
        assert!(record.feature(&GeneFeature::FR1).is_none());
        assert_eq!(
            record.relative_range(&GeneFeature::CDR3, &GeneFeature::VJ_JUNCTION),
            Some(8..10)
        );
        assert_eq!(
            record.relative_range(&GeneFeature::VJ_JUNCTION, &GeneFeature::CDR3),
            None
        );
    }

    #[test]
    fn test_straddling_feature_second_target_first() {
        // Molecule AGGTACGTACGTCCAATATTTGGCCAAGG, CDR3 at 8..24. Target 0 is
        // the J side (10..29), target 1 the V side (0..14). The overlap
        // 10..14 is read by both mates, target 0 with an error at 11.
        let (v, j) = (v_allele(), j_allele());
        let mut q0 = vec![30; 19];
        q0[..4].copy_from_slice(&[25, 10, 30, 20]);
        let mut q1 = vec![30; 14];
        q1[10..].copy_from_slice(&[30, 35, 30, 20]);
        let t0 = SequenceQuality::new(b"GACCAATATTTGGCCAAGG".to_vec(), q0).unwrap();
        let t1 = SequenceQuality::new(b"AGGTACGTACGTCC".to_vec(), q1).unwrap();

        let sub = |position, base| Mutation { position, ty: MutationKind::Substitution(base) };
        let v0 = Alignment::new(14..20, 0..6, vec![sub(15, b'A')], 25.0).unwrap();
        let v1 = Alignment::new(4..18, 0..14, vec![sub(5, b'G')], 60.0).unwrap();
        let j0 = Alignment::new(0..11, 8..19, vec![], 55.0).unwrap();
        let record = AlignmentRecord::new(
            0,
            vec![t0, t1],
            vec![
                (GeneType::Variable, vec![hit(&v, 85.0, vec![Some(v0), Some(v1)])]),
                (GeneType::Joining, vec![hit(&j, 55.0, vec![Some(j0), None])]),
            ],
        )
        .unwrap();
        assert_eq!(record.partitioned_target(0).unwrap().position(ReferencePoint::CDR3Begin), None);
        assert_eq!(record.partitioned_target(1).unwrap().position(ReferencePoint::CDR3End), None);

        let cdr3 = record.feature(&GeneFeature::CDR3).unwrap();
        assert_eq!(cdr3.sequence(), b"ACGTCCAATATTTGGC");
        assert_eq!(
            cdr3.quality(),
            &[30, 30, 55, 25, 60, 40, 30, 30, 30, 30, 30, 30, 30, 30, 30, 30]
        );
    }

    #[test]
    fn test_consensus() {
        let a = SequenceQuality::new(b"ACGT".to_vec(), vec![30, 10, 30, 30]).unwrap();
        let b = SequenceQuality::new(b"AGGT".to_vec(), vec![30, 20, 30, 5]).unwrap();
        let c = consensus(a.clone(), b);
        assert_eq!(c.sequence(), b"AGGT");
        assert_eq!(c.quality(), &[60, 10, 60, 35]);

        let short = SequenceQuality::new(b"AC".to_vec(), vec![40, 40]).unwrap();
        assert_eq!(consensus(a, short.clone()), short);
    }
}
