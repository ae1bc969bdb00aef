use crate::aligner::AlignerEventListener;
use crate::record::AlignmentRecord;

use std::collections::HashMap;
use std::fmt::Display;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use vdjlib::GeneType;

#[derive(Debug, Default, Clone)]
pub struct Metrics(HashMap<String, f64>);

impl From<HashMap<String, f64>> for Metrics {
    fn from(map: HashMap<String, f64>) -> Self {
        Metrics(map)
    }
}

impl From<Metrics> for HashMap<String, f64> {
    fn from(val: Metrics) -> Self {
        val.0
    }
}

impl Deref for Metrics {
    type Target = HashMap<String, f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Metrics {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Display for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys = self.0.keys().collect::<Vec<_>>();
        keys.sort();
        for key in keys {
            writeln!(f, "{}\t{}", key, self.0[key])?;
        }
        Ok(())
    }
}

/// Alignment statistics, collected from aligner events. Safe to share
/// between worker threads.
#[derive(Debug, Default)]
pub struct AlignerReport {
    total: AtomicU64,
    aligned: AtomicU64,
    failed: AtomicU64,
    overlapped: AtomicU64,
    overlapped_aligned: AtomicU64,
    paired_targets: AtomicU64,
    with_hits: [AtomicU64; 4], // Indexed by gene type
}

impl AlignerReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn aligned(&self) -> u64 {
        self.aligned.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn overlapped(&self) -> u64 {
        self.overlapped.load(Ordering::Relaxed)
    }

    pub fn with_hits(&self, gene_type: GeneType) -> u64 {
        self.with_hits[gene_index(gene_type)].load(Ordering::Relaxed)
    }

    pub fn report(&self, metrics: &mut Metrics) {
        let total = self.total() as f64;
        let frac = |x: u64| if total > 0.0 { x as f64 / total } else { 0.0 };
        metrics.insert("total_reads".to_string(), total);
        metrics.insert("aligned_reads".to_string(), self.aligned() as f64);
        metrics.insert("frac_aligned".to_string(), frac(self.aligned()));
        metrics.insert("frac_failed".to_string(), frac(self.failed()));
        metrics.insert("frac_overlapped".to_string(), frac(self.overlapped()));
        metrics.insert(
            "frac_overlapped_aligned".to_string(),
            frac(self.overlapped_aligned.load(Ordering::Relaxed)),
        );
        metrics.insert(
            "frac_paired_alignments".to_string(),
            frac(self.paired_targets.load(Ordering::Relaxed)),
        );
        for gene_type in GeneType::ALL {
            metrics.insert(
                format!("frac_with_{}_hit", gene_type.letter().to_ascii_lowercase()),
                frac(self.with_hits(gene_type)),
            );
        }
    }

    pub fn metrics(&self) -> Metrics {
        let mut metrics = Metrics::default();
        self.report(&mut metrics);
        metrics
    }
}

fn gene_index(gene_type: GeneType) -> usize {
    match gene_type {
        GeneType::Variable => 0,
        GeneType::Diversity => 1,
        GeneType::Joining => 2,
        GeneType::Constant => 3,
    }
}

impl AlignerEventListener for AlignerReport {
    fn on_failed_alignment(&self, _read_id: u64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn on_successful_alignment(&self, _read_id: u64, record: &AlignmentRecord) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.aligned.fetch_add(1, Ordering::Relaxed);
        if record.number_of_targets() == 2 {
            self.paired_targets.fetch_add(1, Ordering::Relaxed);
        }
        for (gene_type, _) in record.all_hits() {
            self.with_hits[gene_index(gene_type)].fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_successful_overlap(&self, _read_id: u64, _overlap: usize, record: Option<&AlignmentRecord>) {
        self.overlapped.fetch_add(1, Ordering::Relaxed);
        if record.is_some() {
            self.overlapped_aligned.fetch_add(1, Ordering::Relaxed);
        }
    }
}
