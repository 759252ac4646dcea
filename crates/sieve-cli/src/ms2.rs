//! Spectra readers: text MS2 (`S`/`I`/`Z` headers followed by peak lines)
//! and the preprocessed binary form (`.pbin`, already binned). Spectra are
//! emitted in batches with globally unique ids.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::{trace, warn};
use sieve_core::error::EngineError;
use sieve_core::manager::BatchReader;
use sieve_core::spectrum::{QueryBatch, RawQuery, SpectrumProcessor, PROTON};

/// Spectrum ids are unique across files: `file_id * QID_STRIDE + ordinal`.
pub const QID_STRIDE: i32 = 1 << 20;

pub struct Ms2Reader {
    processor: SpectrumProcessor,
}

#[derive(Default)]
struct Pending {
    scan: Option<u32>,
    precursor_mz: f32,
    mh_plus: Option<f32>,
    charge: u8,
    rtime: f32,
    mz: Vec<f32>,
    intensity: Vec<f32>,
}

impl Pending {
    fn finish(
        mut self,
        processor: &SpectrumProcessor,
        query_id: i32,
    ) -> Option<RawQuery> {
        self.scan?;
        let (moz, intensity) = processor.process(&self.mz, &self.intensity);
        if moz.is_empty() {
            return None;
        }

        let charge = if self.charge == 0 { 2 } else { self.charge };
        let precursor_mass = match self.mh_plus {
            Some(mh) => mh - PROTON,
            None => (self.precursor_mz - PROTON) * charge as f32,
        };

        Some(RawQuery {
            query_id,
            precursor_mass,
            charge,
            rtime: self.rtime,
            moz,
            intensity,
        })
    }
}

impl Ms2Reader {
    pub fn new(processor: SpectrumProcessor) -> Self {
        Self { processor }
    }

    fn parse<R: BufRead>(
        &self,
        reader: R,
        file_id: u16,
        sink: &mut dyn FnMut(QueryBatch),
    ) -> Result<usize, EngineError> {
        let mut batch_num = 0;
        let mut batch = QueryBatch::new(file_id, batch_num);
        let mut pending: Option<Pending> = None;
        let mut ordinal = 0i32;
        let mut spectra = 0usize;

        let mut flush =
            |pending: Option<Pending>, ordinal: &mut i32, batch: &mut QueryBatch| {
                let Some(p) = pending else { return 0 };
                let query_id = file_id as i32 * QID_STRIDE + *ordinal;
                *ordinal += 1;
                match p.finish(&self.processor, query_id) {
                    Some(query) => {
                        batch.push(query);
                        1
                    }
                    None => 0,
                }
            };

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_ascii_whitespace();
            match fields.next() {
                Some("H") => {}
                Some("S") => {
                    spectra += flush(pending.take(), &mut ordinal, &mut batch);
                    if batch.is_full() {
                        sink(std::mem::replace(&mut batch, {
                            batch_num += 1;
                            QueryBatch::new(file_id, batch_num)
                        }));
                    }

                    let scan = fields.next().and_then(|s| s.parse().ok());
                    let precursor_mz = fields
                        .nth(1)
                        .and_then(|s| s.parse().ok())
                        .unwrap_or_default();
                    if scan.is_none() {
                        warn!("line {}: malformed S record", line_no + 1);
                    }
                    pending = Some(Pending {
                        scan,
                        precursor_mz,
                        ..Default::default()
                    });
                }
                Some("I") => {
                    if let Some(p) = pending.as_mut() {
                        if fields.next() == Some("RTime") {
                            p.rtime = fields
                                .next()
                                .and_then(|s| s.parse().ok())
                                .unwrap_or_default();
                        }
                    }
                }
                Some("Z") => {
                    if let Some(p) = pending.as_mut() {
                        p.charge = fields
                            .next()
                            .and_then(|s| s.parse().ok())
                            .unwrap_or_default();
                        p.mh_plus = fields.next().and_then(|s| s.parse().ok());
                    }
                }
                Some(first) => {
                    let Some(p) = pending.as_mut() else { continue };
                    let mz = first.parse::<f32>();
                    let intensity = fields.next().map(|s| s.parse::<f32>());
                    match (mz, intensity) {
                        (Ok(mz), Some(Ok(intensity))) => {
                            p.mz.push(mz);
                            p.intensity.push(intensity);
                        }
                        _ => warn!("line {}: malformed peak", line_no + 1),
                    }
                }
                None => {}
            }
        }

        spectra += flush(pending.take(), &mut ordinal, &mut batch);
        if !batch.is_empty() {
            sink(batch);
        }
        Ok(spectra)
    }

    /// Preprocessed binary spectra: a serialized `Vec<RawQuery>`, peaks
    /// already scaled to the index's bin resolution.
    fn read_pbin(
        &self,
        path: &Path,
        file_id: u16,
        sink: &mut dyn FnMut(QueryBatch),
    ) -> Result<usize, EngineError> {
        let file = File::open(path)?;
        let spectra: Vec<RawQuery> = bincode::deserialize_from(BufReader::new(file))
            .map_err(|_| EngineError::InvalidParam("malformed pbin spectrum file"))?;

        let mut batch_num = 0;
        let mut batch = QueryBatch::new(file_id, batch_num);
        let total = spectra.len();
        for (ordinal, mut query) in spectra.into_iter().enumerate() {
            query.query_id = file_id as i32 * QID_STRIDE + ordinal as i32;
            batch.push(query);
            if batch.is_full() {
                sink(std::mem::replace(&mut batch, {
                    batch_num += 1;
                    QueryBatch::new(file_id, batch_num)
                }));
            }
        }
        if !batch.is_empty() {
            sink(batch);
        }
        Ok(total)
    }
}

impl BatchReader for Ms2Reader {
    fn read_file(
        &self,
        path: &Path,
        file_id: u16,
        sink: &mut dyn FnMut(QueryBatch),
    ) -> Result<(), EngineError> {
        let spectra = match path.extension().and_then(|e| e.to_str()) {
            Some("pbin") => self.read_pbin(path, file_id, sink)?,
            _ => {
                let file = File::open(path)?;
                self.parse(BufReader::new(file), file_id, sink)?
            }
        };
        trace!("- {}: read {} spectra", path.display(), spectra);
        Ok(())
    }
}
