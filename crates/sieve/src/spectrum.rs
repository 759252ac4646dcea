//! Experimental spectra: batched ragged storage consumed by the scoring
//! pipeline, and the preprocessing that scales peaks to the index's
//! integer bin resolution.

/// Maximum spectra per extracted batch.
pub const QCHUNK: usize = 10_000;

/// Peaks retained per spectrum after preprocessing.
pub const QALEN: usize = 100;

/// Intensities are normalized so the base peak lands at this value.
pub const BASE_INTENSITY: u32 = 1_000_000;

/// Mass of a proton in Da.
pub const PROTON: f32 = 1.007276;

/// A single parsed spectrum, before batching. Also the element of the
/// preprocessed binary spectra format, so it is serializable.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct RawQuery {
    pub query_id: i32,
    pub precursor_mass: f32,
    pub charge: u8,
    pub rtime: f32,
    /// Integer m/z bins, ascending
    pub moz: Vec<u32>,
    pub intensity: Vec<u32>,
}

/// A batch of up to [`QCHUNK`] spectra with shared peak storage.
///
/// Spectrum `q` owns the peak range `idx[q]..idx[q + 1]` of `moz` and
/// `intensity`.
#[derive(Clone, Debug)]
pub struct QueryBatch {
    pub moz: Vec<u32>,
    pub intensity: Vec<u32>,
    pub idx: Vec<u32>,
    pub precursor_mass: Vec<f32>,
    pub charge: Vec<u8>,
    pub rtime: Vec<f32>,
    pub query_id: Vec<i32>,
    pub file_id: u16,
    pub batch_num: usize,
}

impl QueryBatch {
    pub fn new(file_id: u16, batch_num: usize) -> Self {
        Self {
            moz: Vec::new(),
            intensity: Vec::new(),
            idx: vec![0],
            precursor_mass: Vec::new(),
            charge: Vec::new(),
            rtime: Vec::new(),
            query_id: Vec::new(),
            file_id,
            batch_num,
        }
    }

    pub fn len(&self) -> usize {
        self.query_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.query_id.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= QCHUNK
    }

    pub fn push(&mut self, query: RawQuery) {
        debug_assert!(!self.is_full());
        self.moz.extend_from_slice(&query.moz);
        self.intensity.extend_from_slice(&query.intensity);
        self.idx.push(self.moz.len() as u32);
        self.precursor_mass.push(query.precursor_mass);
        self.charge.push(query.charge);
        self.rtime.push(query.rtime);
        self.query_id.push(query.query_id);
    }

    /// Peak slices for spectrum `q`.
    pub fn peaks(&self, q: usize) -> (&[u32], &[u32]) {
        let lo = self.idx[q] as usize;
        let hi = self.idx[q + 1] as usize;
        (&self.moz[lo..hi], &self.intensity[lo..hi])
    }
}

#[derive(PartialEq, Copy, Clone, Default, Debug)]
struct Peak {
    intensity: f32,
    mz: f32,
}

impl Eq for Peak {}

impl PartialOrd for Peak {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Peak {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.intensity
            .total_cmp(&other.intensity)
            .then_with(|| self.mz.total_cmp(&other.mz))
    }
}

/// Converts raw centroided peak lists into the integer representation the
/// fragment index is binned in.
#[derive(Clone, Debug)]
pub struct SpectrumProcessor {
    pub scale: u32,
    pub max_mass: f32,
    pub take_top_n: usize,
    pub base_intensity: u32,
    /// Peaks below this fraction of the base peak are dropped
    pub min_intensity_frac: f32,
}

impl SpectrumProcessor {
    pub fn new(scale: u32, max_mass: f32) -> Self {
        Self {
            scale,
            max_mass,
            take_top_n: QALEN,
            base_intensity: BASE_INTENSITY,
            min_intensity_frac: 0.01,
        }
    }

    /// Keep the `take_top_n` most intense peaks, normalize intensities to
    /// `base_intensity`, and scale m/z values to integer bins.
    pub fn process(&self, mz: &[f32], intensity: &[f32]) -> (Vec<u32>, Vec<u32>) {
        let mut peaks = mz
            .iter()
            .zip(intensity.iter())
            .map(|(&mz, &intensity)| Peak { intensity, mz })
            .collect::<Vec<_>>();

        if self.take_top_n == 0 {
            return (Vec::new(), Vec::new());
        }
        // Partition the most intense peaks into the front of the slice
        if peaks.len() > self.take_top_n {
            peaks.select_nth_unstable_by(self.take_top_n - 1, |a, b| b.cmp(a));
            peaks.truncate(self.take_top_n);
        }

        let base = peaks
            .iter()
            .map(|p| p.intensity)
            .fold(0.0f32, |acc, x| acc.max(x));
        if base <= 0.0 {
            return (Vec::new(), Vec::new());
        }

        let floor = base * self.min_intensity_frac;
        peaks.retain(|p| p.intensity >= floor);
        peaks.sort_unstable_by(|a, b| a.mz.total_cmp(&b.mz));

        let max_bin = (self.max_mass * self.scale as f32) as u32;
        let mut moz = Vec::with_capacity(peaks.len());
        let mut ints = Vec::with_capacity(peaks.len());
        for peak in peaks {
            let bin = (peak.mz * self.scale as f32).round() as u32;
            if bin >= max_bin {
                continue;
            }
            moz.push(bin);
            ints.push((peak.intensity / base * self.base_intensity as f32) as u32);
        }
        (moz, ints)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn batch_rows_are_ragged() {
        let mut batch = QueryBatch::new(0, 0);
        batch.push(RawQuery {
            query_id: 0,
            moz: vec![10, 20, 30],
            intensity: vec![1, 2, 3],
            ..Default::default()
        });
        batch.push(RawQuery {
            query_id: 1,
            moz: vec![40],
            intensity: vec![4],
            ..Default::default()
        });

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.peaks(0).0, &[10, 20, 30]);
        assert_eq!(batch.peaks(1), (&[40u32][..], &[4u32][..]));
    }

    #[test]
    fn processor_scales_and_filters() {
        let sp = SpectrumProcessor::new(100, 50.0);
        let mz = [10.004, 20.009, 49.999, 60.0];
        let intensity = [50.0, 100.0, 0.5, 100.0];
        let (moz, ints) = sp.process(&mz, &intensity);

        // 49.999 is below 1% of base, 60.0 is out of bin range
        assert_eq!(moz, vec![1000, 2001]);
        assert_eq!(ints, vec![BASE_INTENSITY / 2, BASE_INTENSITY]);
    }

    #[test]
    fn processor_keeps_top_n() {
        let mut sp = SpectrumProcessor::new(100, 50.0);
        sp.take_top_n = 2;
        let mz = [1.0, 2.0, 3.0, 4.0];
        let intensity = [10.0, 40.0, 20.0, 30.0];
        let (moz, _) = sp.process(&mz, &intensity);
        assert_eq!(moz, vec![200, 400]);
    }
}
