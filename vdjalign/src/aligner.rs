use crate::error::{Error, Result};
use crate::merger::{MergeResult, PairMerger, ReadsLayout};
use crate::parameters::{AlignerParameters, GeneAlignerParameters};
use crate::reads::{PairedRead, SingleRead};
use crate::record::{AlignmentRecord, Hit};

use indexmap::IndexMap;
use log::{debug, info, warn};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Arc;
use vdjlib::{
    Alignment, Allele, AlleleCatalog, GeneFeature, GeneType, Mutation, MutationKind,
    SequenceQuality,
};

/// One scored alignment of a query against a candidate allele.
#[derive(Debug, Clone)]
pub struct SegmentHit {
    pub allele: Arc<Allele>,
    pub alignment: Alignment,
}

/// Aligns a query against the candidate alleles of a gene type.
pub trait SegmentAligner: Send + Sync {
    /// Hits sorted best first.
    fn align(&self, gene_type: GeneType, query: &SequenceQuality) -> Vec<SegmentHit>;
}

/// Receives notifications about the outcome of every processed read.
pub trait AlignerEventListener: Send + Sync {
    fn on_failed_alignment(&self, _read_id: u64) {}

    fn on_successful_alignment(&self, _read_id: u64, _record: &AlignmentRecord) {}

    /// Called when the mates of a pair were merged before alignment.
    fn on_successful_overlap(&self, _read_id: u64, _overlap: usize, _record: Option<&AlignmentRecord>) {}
}

/// Outcome of aligning one read. `record` is `None` when no gene type had
/// any hit.
#[derive(Debug, Clone)]
pub struct AlignmentResult {
    pub read_id: u64,
    pub record: Option<AlignmentRecord>,
}

pub trait VdjcAligner: Send + Sync {
    type Read: Send + Sync;

    fn process(&self, read: &Self::Read) -> AlignmentResult;

    fn parameters(&self) -> &AlignerParameters;

    /// Every allele that may appear in the output, grouped by gene type.
    fn used_alleles(&self) -> Vec<Arc<Allele>>;
}

/// Decides which alleles take part in the alignment: an allele is accepted
/// when it carries the feature required for its gene type.
#[derive(Debug, Clone, Default)]
pub struct FeatureCoverage(BTreeMap<GeneType, GeneFeature>);

impl FeatureCoverage {
    pub fn from_parameters(parameters: &AlignerParameters) -> Self {
        Self(
            parameters
                .gene_types()
                .filter_map(|g| Some((g, parameters.gene_parameters(g)?.required_feature)))
                .collect(),
        )
    }

    pub fn with_required(mut self, gene_type: GeneType, feature: GeneFeature) -> Self {
        self.0.insert(gene_type, feature);
        self
    }

    pub fn covers(&self, allele: &Allele) -> bool {
        self.0
            .get(&allele.gene_type())
            .map_or(true, |f| allele.contains_feature(f))
    }

    fn validate(&self) -> Result<()> {
        for (gene_type, feature) in self.0.iter() {
            if feature.gene_type() != Some(*gene_type) {
                return Err(Error::configuration(format!(
                    "required feature {} is not a feature of {} genes",
                    feature, gene_type
                )));
            }
        }
        Ok(())
    }
}

/// Collects candidate alleles and produces the aligners. Alleles can only be
/// registered before the aligner is built.
pub struct AlignerBuilder {
    parameters: AlignerParameters,
    coverage: FeatureCoverage,
    pools: BTreeMap<GeneType, Vec<Arc<Allele>>>,
    listener: Option<Arc<dyn AlignerEventListener>>,
}

impl AlignerBuilder {
    pub fn new(parameters: AlignerParameters) -> Self {
        let coverage = FeatureCoverage::from_parameters(&parameters);
        Self {
            parameters,
            coverage,
            pools: BTreeMap::new(),
            listener: None,
        }
    }

    pub fn with_coverage(mut self, coverage: FeatureCoverage) -> Self {
        self.coverage = coverage;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn AlignerEventListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Register a candidate allele. Returns false if it was rejected.
    pub fn add_allele(&mut self, allele: Arc<Allele>) -> bool {
        let gene_type = allele.gene_type();
        if self.parameters.gene_parameters(gene_type).is_none() {
            debug!("{} skipped: {} genes are not aligned", allele.name(), gene_type);
            return false;
        }
        if !self.coverage.covers(&allele) {
            debug!("{} skipped: required feature is missing", allele.name());
            return false;
        }
        let pool = self.pools.entry(gene_type).or_default();
        if pool.iter().any(|a| a.name() == allele.name()) {
            return false;
        }
        pool.push(allele);
        true
    }

    /// Register the alleles of a catalog that belong to the configured loci,
    /// keeping only functional ones if requested.
    pub fn register_from_catalog(&mut self, catalog: &AlleleCatalog) -> Result<usize> {
        let loci = self.parameters.loci()?;
        let functional_only = self.parameters.functional_only;
        let mut n = 0;
        for allele in catalog.iter() {
            if !loci.contains(&allele.locus()) || (functional_only && !allele.is_functional()) {
                continue;
            }
            if self.add_allele(allele.clone()) {
                n += 1;
            }
        }
        info!("Registered {} of {} alleles", n, catalog.len());
        Ok(n)
    }

    pub fn candidates(&self, gene_type: GeneType) -> &[Arc<Allele>] {
        self.pools
            .get(&gene_type)
            .map(|x| x.as_slice())
            .unwrap_or(&[])
    }

    fn validate(&self) -> Result<()> {
        self.coverage.validate()?;
        for gene_type in [GeneType::Variable, GeneType::Joining] {
            if self.parameters.gene_parameters(gene_type).is_none() {
                return Err(Error::configuration(format!(
                    "no alignment parameters for {} genes",
                    gene_type
                )));
            }
            if self.candidates(gene_type).is_empty() {
                return Err(Error::configuration(format!(
                    "no {} alleles registered",
                    gene_type
                )));
            }
        }
        for gene_type in [GeneType::Diversity, GeneType::Constant] {
            if self.parameters.gene_parameters(gene_type).is_some()
                && self.candidates(gene_type).is_empty()
            {
                warn!("No {} alleles registered, {} genes will not be aligned", gene_type, gene_type);
            }
        }
        Ok(())
    }

    fn into_core(self, segment_aligner: Option<Arc<dyn SegmentAligner>>) -> Result<Arc<AlignerCore>> {
        self.validate()?;
        let segment_aligner: Arc<dyn SegmentAligner> = match segment_aligner {
            Some(s) => s,
            None => Arc::new(KmerSegmentAligner::new(&self.parameters, &self.pools)),
        };
        Ok(Arc::new(AlignerCore {
            parameters: self.parameters,
            pools: self.pools,
            segment_aligner,
            listener: self.listener,
        }))
    }

    pub fn build_single(self) -> Result<SingleEndAligner> {
        Ok(SingleEndAligner(self.into_core(None)?))
    }

    pub fn build_paired(self) -> Result<PairedEndAligner> {
        Ok(PairedEndAligner(self.into_core(None)?))
    }

    pub fn build_merging(self) -> Result<MergingAligner> {
        Ok(MergingAligner::new(self.into_core(None)?))
    }

    /// Paired-end aligner, merging overlapping mates first if `merge` is set.
    pub fn build_paired_end(self, merge: bool) -> Result<Arc<dyn VdjcAligner<Read = PairedRead>>> {
        let core = self.into_core(None)?;
        if merge {
            Ok(Arc::new(MergingAligner::new(core)))
        } else {
            Ok(Arc::new(PairedEndAligner(core)))
        }
    }

    pub fn build_single_with(self, segment_aligner: Arc<dyn SegmentAligner>) -> Result<SingleEndAligner> {
        Ok(SingleEndAligner(self.into_core(Some(segment_aligner))?))
    }

    pub fn build_paired_with(self, segment_aligner: Arc<dyn SegmentAligner>) -> Result<PairedEndAligner> {
        Ok(PairedEndAligner(self.into_core(Some(segment_aligner))?))
    }

    pub fn build_merging_with(self, segment_aligner: Arc<dyn SegmentAligner>) -> Result<MergingAligner> {
        Ok(MergingAligner::new(self.into_core(Some(segment_aligner))?))
    }
}

/// State shared by all aligner variants.
struct AlignerCore {
    parameters: AlignerParameters,
    pools: BTreeMap<GeneType, Vec<Arc<Allele>>>,
    segment_aligner: Arc<dyn SegmentAligner>,
    listener: Option<Arc<dyn AlignerEventListener>>,
}

impl AlignerCore {
    fn gene_types(&self) -> impl Iterator<Item = (GeneType, &GeneAlignerParameters)> + '_ {
        self.pools
            .iter()
            .filter(|(_, pool)| !pool.is_empty())
            .filter_map(|(g, _)| Some((*g, self.parameters.gene_parameters(*g)?)))
    }

    /// Align every target and join the hits of the same allele.
    fn align_targets(&self, targets: &[SequenceQuality]) -> Vec<(GeneType, Vec<Hit>)> {
        self.gene_types()
            .map(|(gene_type, params)| {
                let mut joined: IndexMap<&str, (Arc<Allele>, Vec<Option<Alignment>>, f32)> =
                    IndexMap::new();
                let per_target = targets
                    .iter()
                    .map(|t| self.segment_aligner.align(gene_type, t))
                    .collect::<Vec<_>>();
                for (i, hits) in per_target.iter().enumerate() {
                    for hit in hits {
                        let entry = joined.entry(hit.allele.name()).or_insert_with(|| {
                            (hit.allele.clone(), vec![None; targets.len()], 0.0)
                        });
                        if entry.1[i].is_none() {
                            entry.2 += hit.alignment.score();
                            entry.1[i] = Some(hit.alignment.clone());
                        }
                    }
                }
                let hits = joined
                    .into_values()
                    .map(|(allele, alignments, score)| Hit::new(allele, alignments, score))
                    .collect();
                (gene_type, filter_hits(hits, params))
            })
            .collect()
    }

    fn process(&self, read_id: u64, targets: Vec<SequenceQuality>) -> AlignmentResult {
        let hits = self.align_targets(&targets);
        let record = if hits.iter().all(|(_, h)| h.is_empty()) {
            None
        } else {
            match AlignmentRecord::new(read_id, targets, hits) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Read {}: {}", read_id, e);
                    None
                }
            }
        };
        if let Some(listener) = self.listener.as_ref() {
            match record.as_ref() {
                Some(r) => listener.on_successful_alignment(read_id, r),
                None => listener.on_failed_alignment(read_id),
            }
        }
        AlignmentResult { read_id, record }
    }

    fn used_alleles(&self) -> Vec<Arc<Allele>> {
        self.pools.values().flatten().cloned().collect()
    }
}

/// Sort best first, drop hits far below the best one and keep at most
/// `max_hits`.
fn filter_hits(mut hits: Vec<Hit>, params: &GeneAlignerParameters) -> Vec<Hit> {
    hits.sort_by(|a, b| {
        b.score()
            .total_cmp(&a.score())
            .then_with(|| a.allele().name().cmp(b.allele().name()))
    });
    if let Some(best) = hits.first().map(|h| h.score()) {
        let threshold = best * params.relative_min_score;
        hits.retain(|h| h.score() >= threshold);
    }
    hits.truncate(params.max_hits.max(1));
    hits
}

#[derive(Clone)]
pub struct SingleEndAligner(Arc<AlignerCore>);

impl SingleEndAligner {
    pub fn align(&self, read_id: u64, target: &SequenceQuality) -> AlignmentResult {
        self.0.process(read_id, vec![target.clone()])
    }
}

impl VdjcAligner for SingleEndAligner {
    type Read = SingleRead;

    fn process(&self, read: &SingleRead) -> AlignmentResult {
        self.align(read.id, &read.sequence)
    }

    fn parameters(&self) -> &AlignerParameters {
        &self.0.parameters
    }

    fn used_alleles(&self) -> Vec<Arc<Allele>> {
        self.0.used_alleles()
    }
}

/// Aligns both mates without merging them. Mate 2 is stored in the
/// orientation of mate 1.
#[derive(Clone)]
pub struct PairedEndAligner(Arc<AlignerCore>);

impl PairedEndAligner {
    pub fn layout(&self) -> ReadsLayout {
        self.0.parameters.reads_layout
    }
}

impl VdjcAligner for PairedEndAligner {
    type Read = PairedRead;

    fn process(&self, read: &PairedRead) -> AlignmentResult {
        let mate2 = self.layout().orient_mate2(read.mate2());
        self.0.process(read.id, vec![read.mate1().clone(), mate2])
    }

    fn parameters(&self) -> &AlignerParameters {
        &self.0.parameters
    }

    fn used_alleles(&self) -> Vec<Arc<Allele>> {
        self.0.used_alleles()
    }
}

/// Tries to merge the mates first. A merged pair is aligned as a single read,
/// otherwise the mates are aligned separately.
#[derive(Clone)]
pub struct MergingAligner {
    single: SingleEndAligner,
    paired: PairedEndAligner,
    merger: PairMerger,
}

impl MergingAligner {
    fn new(core: Arc<AlignerCore>) -> Self {
        let merger = PairMerger::new(core.parameters.merger.clone(), core.parameters.reads_layout);
        Self {
            single: SingleEndAligner(core.clone()),
            paired: PairedEndAligner(core),
            merger,
        }
    }
}

impl VdjcAligner for MergingAligner {
    type Read = PairedRead;

    fn process(&self, read: &PairedRead) -> AlignmentResult {
        match self.merger.merge(read.mate1(), read.mate2()) {
            MergeResult::Merged { consensus, overlap, .. } => {
                let result = self.single.align(read.id, &consensus);
                if let Some(listener) = self.single.0.listener.as_ref() {
                    listener.on_successful_overlap(read.id, overlap, result.record.as_ref());
                }
                result
            }
            MergeResult::Failed => self.paired.process(read),
        }
    }

    fn parameters(&self) -> &AlignerParameters {
        self.single.parameters()
    }

    fn used_alleles(&self) -> Vec<Arc<Allele>> {
        self.single.used_alleles()
    }
}

fn encode_base(b: u8) -> Option<u64> {
    match b {
        b'A' | b'a' => Some(0),
        b'C' | b'c' => Some(1),
        b'G' | b'g' => Some(2),
        b'T' | b't' => Some(3),
        _ => None,
    }
}

/// Calls `f(position, kmer)` for every k-mer without ambiguous bases.
fn for_each_kmer(seq: &[u8], k: usize, mut f: impl FnMut(usize, u64)) {
    let mask = if k >= 32 { u64::MAX } else { (1u64 << (2 * k)) - 1 };
    let mut kmer = 0u64;
    let mut valid = 0;
    for (i, b) in seq.iter().enumerate() {
        match encode_base(*b) {
            Some(x) => {
                kmer = ((kmer << 2) | x) & mask;
                valid += 1;
                if valid >= k {
                    f(i + 1 - k, kmer);
                }
            }
            None => valid = 0,
        }
    }
}

struct IndexedAllele {
    allele: Arc<Allele>,
    region: Range<u32>,
}

struct KmerIndex {
    params: GeneAlignerParameters,
    alleles: Vec<IndexedAllele>,
    kmers: HashMap<u64, Vec<(u32, u32)>>, // k-mer -> (allele, position in allele)
}

impl KmerIndex {
    fn new(params: GeneAlignerParameters, pool: &[Arc<Allele>]) -> Self {
        let k = params.kmer_size.clamp(1, 31);
        let mut kmers: HashMap<u64, Vec<(u32, u32)>> = HashMap::new();
        let alleles = pool
            .iter()
            .enumerate()
            .map(|(i, allele)| {
                let region = allele
                    .feature_range(&params.feature_to_align)
                    .unwrap_or(0..allele.len() as u32);
                let seq = &allele.sequence()[region.start as usize..region.end as usize];
                for_each_kmer(seq, k, |p, kmer| {
                    kmers
                        .entry(kmer)
                        .or_default()
                        .push((i as u32, region.start + p as u32));
                });
                IndexedAllele {
                    allele: allele.clone(),
                    region,
                }
            })
            .collect();
        Self {
            params,
            alleles,
            kmers,
        }
    }

    fn align(&self, query: &SequenceQuality) -> Vec<SegmentHit> {
        let k = self.params.kmer_size.clamp(1, 31);
        // Votes per (allele, diagonal), diagonal = allele position - query position
        let mut votes: HashMap<(u32, i64), u32> = HashMap::new();
        for_each_kmer(query.sequence(), k, |q, kmer| {
            if let Some(hits) = self.kmers.get(&kmer) {
                for (a, p) in hits {
                    *votes.entry((*a, *p as i64 - q as i64)).or_default() += 1;
                }
            }
        });

        let mut best_diagonal: BTreeMap<u32, (u32, i64)> = BTreeMap::new();
        for ((a, d), n) in votes {
            let entry = best_diagonal.entry(a).or_insert((n, d));
            // Most votes, then the diagonal closest to zero
            if (n, Reverse(d.abs()), Reverse(d)) > (entry.0, Reverse(entry.1.abs()), Reverse(entry.1)) {
                *entry = (n, d);
            }
        }

        let mut hits: Vec<SegmentHit> = best_diagonal
            .into_iter()
            .filter_map(|(a, (_, d))| self.extend(&self.alleles[a as usize], query, d))
            .collect();
        hits.sort_by(|a, b| {
            b.alignment
                .score()
                .total_cmp(&a.alignment.score())
                .then_with(|| a.allele.name().cmp(b.allele.name()))
        });
        hits
    }

    /// Best ungapped segment along a diagonal.
    fn extend(&self, indexed: &IndexedAllele, query: &SequenceQuality, diagonal: i64) -> Option<SegmentHit> {
        let reference = indexed.allele.sequence();
        let q_from = (indexed.region.start as i64 - diagonal).max(0);
        let q_to = (indexed.region.end as i64 - diagonal).min(query.len() as i64);
        if q_from >= q_to {
            return None;
        }

        let (mut best, mut best_range) = (0f32, 0..0);
        let (mut current, mut start) = (0f32, q_from);
        for q in q_from..q_to {
            let r = (q + diagonal) as usize;
            let s = if query.sequence()[q as usize] == reference[r] {
                self.params.match_score
            } else {
                self.params.mismatch_score
            };
            if current <= 0.0 {
                current = 0.0;
                start = q;
            }
            current += s;
            if current > best {
                best = current;
                best_range = start..q + 1;
            }
        }
        if best <= 0.0 || best < self.params.min_score {
            return None;
        }

        let mutations = best_range
            .clone()
            .filter_map(|q| {
                let r = q + diagonal;
                let base = query.sequence()[q as usize];
                (base != reference[r as usize]).then_some(Mutation {
                    position: r as u32,
                    ty: MutationKind::Substitution(base),
                })
            })
            .collect();
        let alignment = Alignment::new(
            (best_range.start + diagonal) as u32..(best_range.end + diagonal) as u32,
            best_range.start as u32..best_range.end as u32,
            mutations,
            best,
        )
        .ok()?;
        Some(SegmentHit {
            allele: indexed.allele.clone(),
            alignment,
        })
    }
}

/// Seed-and-extend aligner: k-mer votes select a diagonal per allele, which
/// is extended into the best scoring ungapped segment.
pub struct KmerSegmentAligner {
    indexes: BTreeMap<GeneType, KmerIndex>,
}

impl KmerSegmentAligner {
    pub fn new(parameters: &AlignerParameters, pools: &BTreeMap<GeneType, Vec<Arc<Allele>>>) -> Self {
        let indexes = pools
            .iter()
            .filter_map(|(gene_type, pool)| {
                let params = parameters.gene_parameters(*gene_type)?.clone();
                Some((*gene_type, KmerIndex::new(params, pool)))
            })
            .collect();
        Self { indexes }
    }
}

impl SegmentAligner for KmerSegmentAligner {
    fn align(&self, gene_type: GeneType, query: &SequenceQuality) -> Vec<SegmentHit> {
        self.indexes
            .get(&gene_type)
            .map(|index| index.align(query))
            .unwrap_or_default()
    }
}
