mod aligner;
mod codec;
mod dispatch;
mod error;
mod merger;
mod parameters;
mod pipeline;
mod reads;
mod record;
mod report;

pub use aligner::{
    AlignerBuilder, AlignerEventListener, AlignmentResult, FeatureCoverage, KmerSegmentAligner,
    MergingAligner, PairedEndAligner, SegmentAligner, SegmentHit, SingleEndAligner, VdjcAligner,
};
pub use codec::{AlignmentReader, AlignmentWriter, MAGIC};
pub use dispatch::{OrderedOutput, ParallelDispatcher};
pub use error::{Error, Result};
pub use merger::{MergeResult, MergerParameters, PairMerger, ReadsLayout};
pub use parameters::{override_parameters, AlignerParameters, GeneAlignerParameters, ParameterPresets};
pub use pipeline::{AlignmentPipeline, PipelineSummary};
pub use reads::{FastqReads, PairedFastqReads, PairedRead, SingleRead};
pub use record::{AlignmentRecord, Hit, TargetPartitioning};
pub use report::{AlignerReport, Metrics};
