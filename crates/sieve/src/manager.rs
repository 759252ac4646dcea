//! The search manager: iterates input files, extracts spectrum batches,
//! fans scoring out over the worker pool, and feeds partial results to the
//! communication thread when a distributed exchange is configured.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use fnv::FnvHashMap;
use log::{error, info, trace};
use rayon::prelude::*;

use crate::buffers::tx_ring;
use crate::config::SearchParams;
use crate::error::EngineError;
use crate::exchange::{Exchanger, Transport};
use crate::index::FragmentIndex;
use crate::scheduler::{Decision, LaspScheduler, IDLE_SLEEP};
use crate::scoring::{Scorer, Scratch, SpectrumResult};
use crate::spectrum::{QueryBatch, QCHUNK};
use crate::survival::PartialSurvival;

/// Extracts query batches from one input file. Implementations live with
/// the file-format readers; the engine only consumes parsed batches.
pub trait BatchReader: Send + Sync + 'static {
    fn read_file(
        &self,
        path: &Path,
        file_id: u16,
        sink: &mut dyn FnMut(QueryBatch),
    ) -> Result<(), EngineError>;
}

/// One reported peptide-spectrum match.
#[derive(Clone, Debug, PartialEq)]
pub struct Psm {
    pub file_id: u16,
    pub query_id: i32,
    /// 1-based rank within the spectrum's candidates
    pub rank: u32,
    pub peptide_id: u32,
    pub hyperscore: f32,
    pub shared_ions: u16,
    pub total_ions: u16,
    pub precursor_mass: f32,
    pub charge: u8,
    pub rtime: f32,
    /// Candidate PSMs behind the survival fit (global in distributed mode)
    pub cpsms: i64,
    /// Suppressed when the spectrum's distribution had too little data
    pub evalue: Option<f64>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SearchStats {
    pub spectra: usize,
    pub psms: usize,
    pub batches: usize,
}

enum PrepItem {
    Batch(QueryBatch),
    /// A preparation worker terminated
    Exit,
}

/// Scheduler-governed pool of file preparation threads. Workers pull input
/// files off a shared queue and push extracted batches; LASP decisions
/// resize the pool between one and `max_prep_threads` workers.
struct PrepPool<R: BatchReader> {
    reader: Arc<R>,
    files: Receiver<(PathBuf, u16)>,
    items: Sender<PrepItem>,
    target: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    spawned: usize,
}

impl<R: BatchReader> PrepPool<R> {
    fn start(reader: R, paths: &[PathBuf]) -> (Self, Receiver<PrepItem>) {
        let (file_tx, file_rx) = bounded(paths.len().max(1));
        for (file_id, path) in paths.iter().enumerate() {
            file_tx
                .send((path.clone(), file_id as u16))
                .expect("file queue sized for all inputs");
        }
        drop(file_tx);

        let (item_tx, item_rx) = bounded(4);
        let mut pool = Self {
            reader: Arc::new(reader),
            files: file_rx,
            items: item_tx,
            target: Arc::new(AtomicUsize::new(1)),
            live: Arc::new(AtomicUsize::new(0)),
            spawned: 0,
        };
        pool.spawn_worker();
        (pool, item_rx)
    }

    fn spawn_worker(&mut self) {
        let reader = Arc::clone(&self.reader);
        let files = self.files.clone();
        let items = self.items.clone();
        let target = Arc::clone(&self.target);
        let live = Arc::clone(&self.live);

        live.fetch_add(1, Ordering::SeqCst);
        self.spawned += 1;

        std::thread::spawn(move || {
            loop {
                // Retire if the scheduler shrank the pool below us
                let retired = live
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |l| {
                        (l > target.load(Ordering::SeqCst)).then(|| l - 1)
                    })
                    .is_ok();
                if retired {
                    break;
                }

                match files.recv_timeout(IDLE_SLEEP) {
                    Ok((path, file_id)) => {
                        let mut sink = |batch: QueryBatch| {
                            let _ = items.send(PrepItem::Batch(batch));
                        };
                        if let Err(e) = reader.read_file(&path, file_id, &mut sink) {
                            error!("- {}: {}", path.display(), e);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        live.fetch_sub(1, Ordering::SeqCst);
                        break;
                    }
                }
            }
            let _ = items.send(PrepItem::Exit);
        });
    }

    /// Adopt the scheduler's new thread target.
    fn apply(&mut self, decision: Decision, target: usize) {
        self.target.store(target, Ordering::SeqCst);
        if decision == Decision::Grow {
            self.spawn_worker();
        }
    }

    fn spawned(&self) -> usize {
        self.spawned
    }
}

pub struct SearchManager<'a> {
    index: &'a FragmentIndex,
    params: &'a SearchParams,
}

impl<'a> SearchManager<'a> {
    pub fn new(index: &'a FragmentIndex, params: &'a SearchParams) -> Result<Self, EngineError> {
        params.validate()?;
        if index.peptides.is_empty() {
            return Err(EngineError::InvalidParam("empty fragment index"));
        }
        Ok(Self { index, params })
    }

    /// Search every batch of every input file. `transport` must be present
    /// exactly when the parameters configure more than one node.
    pub fn search_files<R: BatchReader>(
        &self,
        paths: &[PathBuf],
        reader: R,
        transport: Option<Box<dyn Transport>>,
    ) -> Result<(Vec<Psm>, SearchStats), EngineError> {
        match &transport {
            Some(t) => {
                if t.nodes() != self.params.nodes || t.myid() != self.params.myid {
                    return Err(EngineError::InvalidParam(
                        "transport topology disagrees with parameters",
                    ));
                }
            }
            None if self.params.distributed() => {
                return Err(EngineError::InvalidParam(
                    "distributed search requires a transport",
                ));
            }
            None => {}
        }

        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(self.params.threads)
            .build()
            .map_err(|_| EngineError::InvalidParam("could not build scoring pool"))?;

        let scorer = Scorer::new(self.index, self.params);
        let start = Instant::now();

        // Communication thread and transmit ring, distributed mode only
        let mut comm = transport.map(|transport| {
            let (producer, consumer) = tx_ring(QCHUNK);
            let mut exchanger = Exchanger::new(transport, self.params.policy);
            let handle: JoinHandle<Result<FnvHashMap<i32, PartialSurvival>, EngineError>> =
                std::thread::spawn(move || {
                    let mut partials = FnvHashMap::default();
                    while let Some(buffer) = consumer.next() {
                        trace!("- exchanging batch {}", buffer.batch_num);
                        exchanger.exchange_batch(&buffer, &mut partials)?;
                        consumer.release(buffer);
                    }
                    Ok(partials)
                });
            (producer, handle)
        });

        let (mut prep, items) = PrepPool::start(reader, paths);
        let mut scheduler = LaspScheduler::new(self.params.max_prep_threads);

        let mut stats = SearchStats::default();
        let mut psms = Vec::new();
        let mut owned: Vec<SpectrumResult> = Vec::new();
        let mut pending = prep.spawned();

        while pending > 0 {
            let waited = Instant::now();
            let item = items
                .recv()
                .map_err(|_| EngineError::TransferFailure("preparation pool died".into()))?;
            let batch = match item {
                PrepItem::Exit => {
                    pending -= 1;
                    continue;
                }
                PrepItem::Batch(batch) => batch,
            };

            // The wait for this batch is the scheduler's penalty signal
            let penalty = waited.elapsed().as_secs_f64() * 1e3;
            let decision = scheduler.observe(penalty);
            prep.apply(decision, scheduler.active_threads());
            if decision == Decision::Grow {
                pending += 1;
            }

            let mut results = workers.install(|| {
                (0..batch.len())
                    .into_par_iter()
                    .map_init(
                        || Scratch::new(self.index),
                        |scratch, q| scorer.score_spectrum(&batch, q, scratch),
                    )
                    .collect::<Result<Vec<_>, _>>()
            })?;

            stats.batches += 1;
            stats.spectra += results.len();
            trace!(
                "- batch {}: {} spectra ({} spectra/s)",
                batch.batch_num,
                results.len(),
                stats.spectra * 1000 / (start.elapsed().as_millis().max(1) as usize)
            );

            match &comm {
                Some((producer, _)) => {
                    let mut buffer = producer.acquire()?;
                    buffer.batch_num = batch.batch_num;
                    for result in &mut results {
                        if let Some((record, tail)) = result.partial.take() {
                            buffer.records.push((record, *tail));
                        }
                    }
                    producer.submit(buffer)?;

                    let (myid, nodes) = (self.params.myid, self.params.nodes);
                    owned.extend(
                        results
                            .into_iter()
                            .filter(|r| self.params.policy.owner(r.query_id, nodes) == myid),
                    );
                }
                None => {
                    for result in results {
                        let cpsms = result.cpsms as i64;
                        let evalue = result.evalue;
                        self.emit(result, cpsms, evalue, &mut psms);
                    }
                }
            }
        }

        // Combine phase: the communication thread hands back the merged
        // distributions for the spectra this node owns
        if let Some((producer, handle)) = comm.take() {
            drop(producer);
            let partials = handle.join().map_err(|_| {
                EngineError::TransferFailure("communication thread panicked".into())
            })??;

            for result in owned {
                let (cpsms, evalue) = match partials.get(&result.query_id) {
                    Some(partial) if partial.psms() as u64 >= self.params.min_cpsm as u64 => {
                        (partial.psms(), partial.finish())
                    }
                    Some(partial) => (partial.psms(), None),
                    None => (0, None),
                };
                self.emit(result, cpsms, evalue, &mut psms);
            }
        }

        psms.sort_unstable_by(|a, b| {
            (a.file_id, a.query_id, a.rank).cmp(&(b.file_id, b.query_id, b.rank))
        });
        stats.psms = psms.len();

        info!(
            "- search: {:8} ms, {} spectra, {} PSMs",
            start.elapsed().as_millis(),
            stats.spectra,
            stats.psms
        );
        Ok((psms, stats))
    }

    /// Turn one spectrum's candidates into ranked output rows, applying
    /// the E-value reporting cutoff.
    fn emit(
        &self,
        result: SpectrumResult,
        cpsms: i64,
        evalue: Option<f64>,
        out: &mut Vec<Psm>,
    ) {
        if let Some(e) = evalue {
            if e > self.params.expect_max {
                return;
            }
        }
        for (rank, cell) in result.candidates.iter().enumerate() {
            out.push(Psm {
                file_id: result.file_id,
                query_id: result.query_id,
                rank: rank as u32 + 1,
                peptide_id: cell.peptide_id,
                hyperscore: cell.hyperscore,
                shared_ions: cell.shared_ions,
                total_ions: cell.total_ions,
                precursor_mass: result.precursor_mass,
                charge: result.charge,
                rtime: result.rtime,
                cpsms,
                evalue,
            });
        }
    }
}
