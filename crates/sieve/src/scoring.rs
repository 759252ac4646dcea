//! The per-spectrum scoring pipeline: fragment-index lookup into the
//! scorecard, hyperscore conversion, top-K maintenance, histogram
//! accumulation, and the local survival-function fit.

use crate::codec::{self, PartialRecord, TAIL_SAMPLES};
use crate::config::SearchParams;
use crate::error::EngineError;
use crate::heap::{HeapCell, TopK};
use crate::index::{FragmentIndex, IonChunk};
use crate::scorecard::{Byc, Scorecard};
use crate::spectrum::QueryBatch;
use crate::survival::{self, FitOutcome, HISTOGRAM_BINS};

/// Largest matched-ion count with a tabulated log-factorial. Saturated
/// counters clamp to this before lookup.
pub const MAX_SHARED_IONS: usize = 64;

/// Everything the pipeline produced for one query spectrum.
#[derive(Clone, Debug)]
pub struct SpectrumResult {
    pub query_id: i32,
    pub file_id: u16,
    pub precursor_mass: f32,
    pub charge: u8,
    pub rtime: f32,
    /// Best candidates, descending hyperscore
    pub candidates: Vec<HeapCell>,
    /// Candidate PSMs contributing to the histogram
    pub cpsms: u32,
    pub max_hyperscore: f32,
    /// E-value from the locally fitted survival function
    pub evalue: Option<f64>,
    /// Encoded tail for the distributed exchange, when one is configured
    pub partial: Option<(PartialRecord, Box<[u16; TAIL_SAMPLES]>)>,
}

/// Per-worker scratch. Each scoring thread owns one, so lookup and
/// accumulation run without synchronization.
pub struct Scratch {
    scorecard: Scorecard,
    survival: Vec<f64>,
}

impl Scratch {
    pub fn new(index: &FragmentIndex) -> Self {
        Self {
            scorecard: Scorecard::new(index.peptides.len()),
            survival: vec![0.0; HISTOGRAM_BINS],
        }
    }
}

pub struct Scorer<'db> {
    pub index: &'db FragmentIndex,
    pub params: &'db SearchParams,
    /// log10(n!) for n up to [`MAX_SHARED_IONS`]
    lgfact: [f64; MAX_SHARED_IONS + 1],
}

impl<'db> Scorer<'db> {
    pub fn new(index: &'db FragmentIndex, params: &'db SearchParams) -> Self {
        let mut lgfact = [0.0; MAX_SHARED_IONS + 1];
        for n in 2..=MAX_SHARED_IONS {
            lgfact[n] = lgfact[n - 1] + (n as f64).log10();
        }
        Self {
            index,
            params,
            lgfact,
        }
    }

    /// `log10(0.001 + fact(bc) * fact(yc) * ibc * iyc)`, combined in log
    /// space so saturated counters cannot overflow the expression.
    fn hyperscore(&self, cell: &Byc) -> f64 {
        if cell.ibc == 0 || cell.iyc == 0 {
            return 0.0;
        }
        let log_prod = self.lgfact[(cell.bc as usize).min(MAX_SHARED_IONS)]
            + self.lgfact[(cell.yc as usize).min(MAX_SHARED_IONS)]
            + (cell.ibc as f64).log10()
            + (cell.iyc as f64).log10();

        // The additive floor only matters when the product is small enough
        // to exponentiate exactly
        if log_prod < 16.0 {
            (1e-3 + 10f64.powf(log_prod)).log10()
        } else {
            log_prod
        }
    }

    fn chunk_selected(&self, chunk: &IonChunk) -> bool {
        chunk.pep_len >= self.params.min_len
            && chunk.pep_len <= self.params.max_len
            && chunk.max_charge <= self.params.max_charge
    }

    /// Walk one chunk's inverted index for every peak of spectrum `q`,
    /// tallying b/y hits for candidates inside the precursor window.
    fn lookup(
        &self,
        chunk: &IonChunk,
        moz: &[u32],
        intensity: &[u32],
        window: (usize, usize),
        scorecard: &mut Scorecard,
    ) {
        let df = self.params.df;
        let max_bin = self.index.num_bins() as u32;
        let (min_id, max_id) = window;

        for (k, &bin) in moz.iter().enumerate() {
            if bin < df || bin > max_bin.saturating_sub(1 + df) {
                continue;
            }
            let start = chunk.buckets[(bin - df) as usize] as usize;
            let end = chunk.buckets[(bin + 1 + df) as usize] as usize;

            for &raw in &chunk.ions[start..end] {
                let (peptide_id, is_b) = chunk.decode(raw);
                let peptide_id = peptide_id as usize;
                if peptide_id < min_id || peptide_id > max_id {
                    continue;
                }
                if is_b {
                    scorecard.hit_b(peptide_id, intensity[k]);
                } else {
                    scorecard.hit_y(peptide_id, intensity[k]);
                }
            }
        }
    }

    /// Run the full pipeline for spectrum `q` of `batch`.
    pub fn score_spectrum(
        &self,
        batch: &QueryBatch,
        q: usize,
        scratch: &mut Scratch,
    ) -> Result<SpectrumResult, EngineError> {
        if scratch.scorecard.len() < self.index.peptides.len() {
            return Err(EngineError::InvalidMemory {
                have: scratch.scorecard.len(),
                need: self.index.peptides.len(),
            });
        }

        let (moz, intensity) = batch.peaks(q);
        let pmass = batch.precursor_mass[q];

        let mut topk = TopK::new(self.params.topmatches);
        let mut cpsms = 0u32;
        let mut max_hyperscore = 0f32;
        scratch.survival.iter_mut().for_each(|v| *v = 0.0);

        let in_bounds = pmass >= self.params.min_mass && pmass <= self.params.max_mass;
        let window = if in_bounds {
            self.index.precursor_window(pmass, self.params.dm)
        } else {
            None
        };

        if let Some((min_id, max_id)) = window {
            for chunk in self.index.chunks.iter().filter(|c| self.chunk_selected(c)) {
                self.lookup(chunk, moz, intensity, (min_id, max_id), &mut scratch.scorecard);

                for peptide_id in min_id..=max_id {
                    let cell = scratch.scorecard.get(peptide_id);
                    let shared = cell.bc as u32 + cell.yc as u32;
                    if shared < self.params.min_shp as u32 {
                        continue;
                    }
                    let hyperscore = self.hyperscore(&cell);
                    if hyperscore <= 0.0 {
                        continue;
                    }

                    let bin = ((hyperscore * 10.0).round() as usize).min(HISTOGRAM_BINS - 1);
                    scratch.survival[bin] += 1.0;
                    cpsms += 1;
                    if hyperscore as f32 > max_hyperscore {
                        max_hyperscore = hyperscore as f32;
                    }

                    topk.push(HeapCell {
                        hyperscore: hyperscore as f32,
                        peptide_id: peptide_id as u32,
                        shared_ions: shared.min(u16::MAX as u32) as u16,
                        total_ions: chunk.spec_len().min(u16::MAX as u32) as u16,
                        file_id: batch.file_id,
                        precursor_mass: pmass,
                        charge: batch.charge[q],
                        rtime: batch.rtime[q],
                    });
                }

                scratch.scorecard.clear_range(min_id, max_id + 1);
            }
        }

        let hyp_bin = ((max_hyperscore as f64 * 10.0).round() as usize).min(HISTOGRAM_BINS - 1);
        let evalue = if cpsms >= self.params.min_cpsm {
            match survival::model_survival(&scratch.survival, cpsms as i64, hyp_bin) {
                FitOutcome::Fitted(fit) => Some(survival::evalue(&fit, hyp_bin, cpsms as i64)),
                FitOutcome::NotEnoughData => None,
            }
        } else {
            None
        };

        let partial = if self.params.distributed() {
            let (record, samples) = codec::encode_tail(
                &scratch.survival,
                cpsms,
                max_hyperscore,
                batch.query_id[q],
            );
            Some((record, Box::new(samples)))
        } else {
            None
        };

        Ok(SpectrumResult {
            query_id: batch.query_id[q],
            file_id: batch.file_id,
            precursor_mass: pmass,
            charge: batch.charge[q],
            rtime: batch.rtime[q],
            candidates: topk.into_sorted(),
            cpsms,
            max_hyperscore,
            evalue,
            partial,
        })
    }
}
