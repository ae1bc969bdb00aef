use crate::error::{Error, Result};

use crossbeam_channel::{bounded, Receiver};
use log::debug;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

type BatchResult<R> = (usize, thread::Result<Vec<R>>);

/// Runs a function over a stream of items on a worker pool, in batches,
/// and yields the results in input order.
#[derive(Debug, Clone)]
pub struct ParallelDispatcher {
    batch_size: usize,
    threads: usize,
    max_in_flight: usize,
}

impl Default for ParallelDispatcher {
    fn default() -> Self {
        Self {
            batch_size: 64,
            threads: thread::available_parallelism().map_or(1, |n| n.get()),
            max_in_flight: 16,
        }
    }
}

impl ParallelDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Maximum number of batches handed out but not yet returned to the
    /// consumer. Reading pauses when the limit is reached.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Start processing. Items are pulled from `input` on a separate thread.
    /// A panic in `f` is resumed on the thread consuming the output, after
    /// the results of all earlier batches were yielded.
    pub fn run<I, T, R, F>(&self, input: I, f: F) -> Result<OrderedOutput<R>>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .map_err(|e| Error::configuration(format!("cannot start worker pool: {}", e)))?;
        debug!(
            "Dispatching batches of {} on {} threads, at most {} in flight",
            self.batch_size, self.threads, self.max_in_flight
        );

        let (permit_tx, permit_rx) = bounded::<()>(self.max_in_flight);
        let (result_tx, result_rx) = bounded::<BatchResult<R>>(self.max_in_flight);
        let stop = Arc::new(AtomicBool::new(false));
        let f = Arc::new(f);
        let batch_size = self.batch_size;
        let mut input = input.into_iter();

        let stop_producer = stop.clone();
        thread::spawn(move || {
            let mut index = 0;
            while !stop_producer.load(Ordering::Relaxed) {
                let batch: Vec<T> = input.by_ref().take(batch_size).collect();
                if batch.is_empty() {
                    break;
                }
                // Blocks while `max_in_flight` batches are waiting for the consumer
                if permit_tx.send(()).is_err() {
                    break;
                }
                let tx = result_tx.clone();
                let f = f.clone();
                pool.spawn(move || {
                    let result =
                        catch_unwind(AssertUnwindSafe(|| batch.into_iter().map(|x| f(x)).collect()));
                    let _ = tx.send((index, result));
                });
                index += 1;
            }
            debug!("Producer finished after {} batches", index);
        });

        Ok(OrderedOutput {
            results: result_rx,
            permits: permit_rx,
            pending: HashMap::new(),
            next_batch: 0,
            current: Vec::new().into_iter(),
            panicked: None,
            stop,
        })
    }
}

/// Results of a [`ParallelDispatcher`] run, in input order. Dropping it
/// stops reading further input.
pub struct OrderedOutput<R> {
    results: Receiver<BatchResult<R>>,
    permits: Receiver<()>,
    pending: HashMap<usize, Vec<R>>,
    next_batch: usize,
    current: std::vec::IntoIter<R>,
    panicked: Option<(usize, Box<dyn Any + Send>)>, // Earliest failed batch
    stop: Arc<AtomicBool>,
}

impl<R> Iterator for OrderedOutput<R> {
    type Item = R;

    fn next(&mut self) -> Option<R> {
        loop {
            if let Some(x) = self.current.next() {
                return Some(x);
            }
            if let Some(batch) = self.pending.remove(&self.next_batch) {
                self.next_batch += 1;
                let _ = self.permits.try_recv();
                self.current = batch.into_iter();
                continue;
            }
            if self.panicked.as_ref().is_some_and(|(i, _)| *i == self.next_batch) {
                if let Some((_, panic)) = self.panicked.take() {
                    resume_unwind(panic);
                }
            }
            match self.results.recv() {
                Ok((i, Ok(batch))) => {
                    self.pending.insert(i, batch);
                }
                Ok((i, Err(panic))) => {
                    self.stop.store(true, Ordering::Relaxed);
                    if self.panicked.as_ref().map_or(true, |(j, _)| i < *j) {
                        self.panicked = Some((i, panic));
                    }
                }
                // All batches were delivered
                Err(_) => {
                    if let Some((_, panic)) = self.panicked.take() {
                        resume_unwind(panic);
                    }
                    return None;
                }
            }
        }
    }
}

impl<R> Drop for OrderedOutput<R> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
