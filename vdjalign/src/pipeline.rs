use crate::aligner::VdjcAligner;
use crate::codec::AlignmentWriter;
use crate::dispatch::ParallelDispatcher;
use crate::error::Result;

use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::io::Write;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineSummary {
    pub processed_reads: u64,
    pub records_written: u64,
}

/// Aligns a stream of reads in parallel and writes the records, in input
/// order, to an alignment file.
#[derive(Debug, Clone)]
pub struct AlignmentPipeline {
    dispatcher: ParallelDispatcher,
    limit: Option<u64>,
    show_progress: bool,
}

impl Default for AlignmentPipeline {
    fn default() -> Self {
        Self {
            dispatcher: ParallelDispatcher::default(),
            limit: None,
            show_progress: false,
        }
    }
}

impl AlignmentPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.dispatcher = self.dispatcher.with_threads(threads);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.dispatcher = self.dispatcher.with_batch_size(batch_size);
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.dispatcher = self.dispatcher.with_max_in_flight(max_in_flight);
        self
    }

    /// Process at most `limit` reads.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_progress_bar(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    fn progress_bar(&self) -> Result<ProgressBar> {
        if !self.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let style = ProgressStyle::with_template(
            "[{elapsed}] {spinner} {human_pos:>7} reads ({per_sec})",
        )
        .map_err(|e| anyhow::anyhow!(e))?;
        Ok(ProgressBar::new_spinner().with_style(style))
    }

    /// Run the aligner over `reads` and write the results.
    ///
    /// A read error stops the run; the output is then closed without the
    /// footer so that readers know the read count is missing.
    pub fn run<A, I, W>(
        &self,
        aligner: Arc<A>,
        reads: I,
        mut writer: AlignmentWriter<W>,
    ) -> Result<(PipelineSummary, W)>
    where
        A: VdjcAligner + ?Sized + 'static,
        A::Read: Send + 'static,
        I: IntoIterator<Item = Result<A::Read>>,
        I::IntoIter: Send + 'static,
        W: Write,
    {
        writer.write_header(aligner.parameters(), &aligner.used_alleles())?;

        let limit = self.limit.map_or(usize::MAX, |n| n as usize);
        let reads = reads.into_iter().take(limit);
        info!(
            "Aligning reads with {} threads, batch size {}",
            self.dispatcher.threads(),
            self.dispatcher.batch_size()
        );
        let progress_bar = self.progress_bar()?;

        let worker = aligner.clone();
        let output = self
            .dispatcher
            .run(reads, move |read: Result<A::Read>| read.map(|r| worker.process(&r)))?;

        let mut processed_reads = 0u64;
        for result in output {
            let written = result.and_then(|result| {
                if let Some(record) = result.record.as_ref() {
                    writer.write(record)?;
                }
                Ok(())
            });
            if let Err(e) = written {
                warn!("Alignment stopped after {} reads: {}", processed_reads, e);
                progress_bar.abandon();
                writer.close()?;
                return Err(e);
            }
            processed_reads += 1;
            progress_bar.inc(1);
        }
        progress_bar.finish();

        let summary = PipelineSummary {
            processed_reads,
            records_written: writer.records_written(),
        };
        info!(
            "Aligned {} of {} reads",
            summary.records_written, summary.processed_reads
        );
        writer.set_processed_reads(processed_reads);
        Ok((summary, writer.finish()?))
    }
}
