use crate::feature::{shift_position, GeneFeature, ReferencePoint};
use crate::gene::{GeneType, Locus};

use anyhow::{bail, Result};
use bstr::ByteSlice;
use indexmap::IndexMap;
use log::debug;
use std::ops::Range;
use std::sync::Arc;

/// A reference germline allele with its annotated anchor points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allele {
    name: String,
    gene_type: GeneType,
    locus: Locus,
    functional: bool,
    sequence: Vec<u8>,
    anchors: IndexMap<ReferencePoint, u32>,
}

impl Allele {
    pub fn new(name: impl Into<String>, gene_type: GeneType, locus: Locus, sequence: &[u8]) -> Self {
        Self {
            name: name.into(),
            gene_type,
            locus,
            functional: true,
            sequence: sequence.to_ascii_uppercase(),
            anchors: IndexMap::new(),
        }
    }

    pub fn with_functional(mut self, functional: bool) -> Self {
        self.functional = functional;
        self
    }

    /// Annotate an anchor point. The point must belong to this allele's gene
    /// type and lie within the sequence.
    pub fn with_anchor(mut self, point: ReferencePoint, position: u32) -> Result<Self> {
        if point.is_alignment_derived() {
            bail!("{} is not an allele anchor", point);
        }
        if point.gene_type() != self.gene_type {
            bail!(
                "{} belongs to {} genes, but {} is a {} gene",
                point,
                point.gene_type(),
                self.name,
                self.gene_type
            );
        }
        if position as usize > self.sequence.len() {
            bail!(
                "{} at {} is beyond the end of {} (length {})",
                point,
                position,
                self.name,
                self.sequence.len()
            );
        }
        self.anchors.insert(point, position);
        self.anchors.sort_keys();
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gene_type(&self) -> GeneType {
        self.gene_type
    }

    pub fn locus(&self) -> Locus {
        self.locus
    }

    pub fn is_functional(&self) -> bool {
        self.functional
    }

    pub fn sequence(&self) -> &[u8] {
        &self.sequence
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    pub fn anchor(&self, point: ReferencePoint) -> Option<u32> {
        self.anchors.get(&point).copied()
    }

    pub fn anchors(&self) -> impl Iterator<Item = (ReferencePoint, u32)> + '_ {
        self.anchors.iter().map(|(p, x)| (*p, *x))
    }

    /// Position of the feature on this allele, with offsets applied.
    pub fn feature_range(&self, feature: &GeneFeature) -> Option<Range<u32>> {
        let begin = shift_position(self.anchor(feature.begin())? as usize, feature.begin_offset())?;
        let end = shift_position(self.anchor(feature.end())? as usize, feature.end_offset())?;
        if begin > end || end > self.sequence.len() {
            None
        } else {
            Some(begin as u32..end as u32)
        }
    }

    pub fn contains_feature(&self, feature: &GeneFeature) -> bool {
        self.feature_range(feature).is_some()
    }

    pub fn feature_sequence(&self, feature: &GeneFeature) -> Option<&[u8]> {
        let range = self.feature_range(feature)?;
        Some(&self.sequence[range.start as usize..range.end as usize])
    }
}

impl std::fmt::Display for Allele {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, ">{}\n{}", self.name, self.sequence.as_bstr())
    }
}

/// A set of alleles addressable by name, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct AlleleCatalog(IndexMap<String, Arc<Allele>>);

impl AlleleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, allele: Allele) -> Result<Arc<Allele>> {
        if self.0.contains_key(allele.name()) {
            bail!("Duplicate allele: {}", allele.name());
        }
        let allele = Arc::new(allele);
        self.0.insert(allele.name().to_string(), allele.clone());
        Ok(allele)
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<Allele>> {
        self.0.get(name).cloned()
    }

    pub fn alleles_of_type(&self, gene_type: GeneType) -> impl Iterator<Item = &Arc<Allele>> {
        self.0.values().filter(move |a| a.gene_type() == gene_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Allele>> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<Allele>> for AlleleCatalog {
    type Error = anyhow::Error;

    fn try_from(alleles: Vec<Allele>) -> Result<Self> {
        let mut catalog = AlleleCatalog::new();
        for allele in alleles {
            catalog.insert(allele)?;
        }
        debug!("Loaded {} alleles", catalog.len());
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v_allele() -> Allele {
        Allele::new("TRBV1*01", GeneType::Variable, Locus::TRB, b"acgtacgtacgtacgtacgt")
            .with_anchor(ReferencePoint::FR1Begin, 0)
            .unwrap()
            .with_anchor(ReferencePoint::CDR3Begin, 12)
            .unwrap()
            .with_anchor(ReferencePoint::VEnd, 20)
            .unwrap()
    }

    #[test]
    fn test_feature_range() {
        let allele = v_allele();
        assert_eq!(allele.sequence(), b"ACGTACGTACGTACGTACGT");
        assert_eq!(allele.feature_range(&GeneFeature::V_REGION), Some(0..20));
        let f = GeneFeature::new(ReferencePoint::CDR3Begin, ReferencePoint::VEnd);
        assert_eq!(allele.feature_range(&f), Some(12..20));
        assert_eq!(allele.feature_range(&f.with_offsets(-2, 0)), Some(10..20));
        assert_eq!(allele.feature_range(&f.with_offsets(0, 1)), None);
        assert!(!allele.contains_feature(&GeneFeature::CDR1));
    }

    #[test]
    fn test_invalid_anchor() {
        let allele = Allele::new("TRBJ1*01", GeneType::Joining, Locus::TRB, b"ACGT");
        assert!(allele.clone().with_anchor(ReferencePoint::VEnd, 1).is_err());
        assert!(allele.clone().with_anchor(ReferencePoint::JBegin, 5).is_err());
        assert!(allele.clone().with_anchor(ReferencePoint::JBeginTrimmed, 0).is_err());
        assert!(allele.with_anchor(ReferencePoint::JBegin, 4).is_ok());
    }

    #[test]
    fn test_catalog() {
        let mut catalog = AlleleCatalog::new();
        catalog.insert(v_allele()).unwrap();
        assert!(catalog.insert(v_allele()).is_err());
        catalog
            .insert(Allele::new("TRBJ1*01", GeneType::Joining, Locus::TRB, b"ACGT"))
            .unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.alleles_of_type(GeneType::Joining).count(), 1);
        assert_eq!(catalog.resolve("TRBV1*01").unwrap().locus(), Locus::TRB);
        assert!(catalog.resolve("TRBV2*01").is_none());
    }
}
