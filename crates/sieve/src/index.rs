//! The read-only fragment-ion index: a mass-sorted peptide table plus
//! per-peptide-length ion chunks, and the precursor-mass window query.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// b- and y-series
pub const ION_SERIES: u32 = 2;

/// Mass ranges at or below this many peptides are scanned linearly instead
/// of binary searched.
const LINEAR_WINDOW: usize = 500;

/// One peptide (or modified peptide form) in the mass-sorted table.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeptideEntry {
    /// Monoisotopic precursor mass
    pub mass: f32,
    /// Id of the unmodified base sequence
    pub seq_id: u32,
    /// Bit-packed variable modification sites
    pub mod_sites: u64,
}

/// Sparse inverted index over the theoretical fragments of all peptides of
/// one length. `buckets[m]..buckets[m + 1]` delimits the slice of `ions`
/// holding every ion whose integer m/z bin is `m`. Each ion is stored as
/// `peptide_id * spec_len + offset`; offsets below `spec_len / 2` are
/// b-ions, the rest are y-ions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IonChunk {
    pub pep_len: u32,
    pub max_charge: u32,
    pub num_peptides: u32,
    pub buckets: Vec<u32>,
    pub ions: Vec<u32>,
}

impl IonChunk {
    /// Theoretical spectrum length for peptides in this chunk.
    pub fn spec_len(&self) -> u32 {
        (self.pep_len - 1) * self.max_charge * ION_SERIES
    }

    /// Split an encoded ion into (peptide id, is b-ion).
    #[inline]
    pub fn decode(&self, raw: u32) -> (u32, bool) {
        let spec_len = self.spec_len();
        (raw / spec_len, raw % spec_len < spec_len / 2)
    }

    /// Build a chunk from already-enumerated theoretical ions given as
    /// `(peptide_id, offset, bin)` triples. Used by index tooling and tests;
    /// production indices are deserialized from disk.
    pub fn from_ions(
        pep_len: u32,
        max_charge: u32,
        num_peptides: u32,
        num_bins: usize,
        entries: &[(u32, u32, u32)],
    ) -> Self {
        let spec_len = (pep_len - 1) * max_charge * ION_SERIES;

        let mut counts = vec![0u32; num_bins + 1];
        for &(_, _, bin) in entries {
            counts[bin as usize + 1] += 1;
        }
        let mut buckets = counts;
        for i in 1..buckets.len() {
            buckets[i] += buckets[i - 1];
        }

        let mut cursor = buckets.clone();
        let mut ions = vec![0u32; entries.len()];
        for &(pep, offset, bin) in entries {
            let at = cursor[bin as usize] as usize;
            ions[at] = pep * spec_len + offset;
            cursor[bin as usize] += 1;
        }

        Self {
            pep_len,
            max_charge,
            num_peptides,
            buckets,
            ions,
        }
    }

    fn validate(&self, total_peptides: usize) -> Result<(), EngineError> {
        if self.pep_len < 2 || self.max_charge == 0 {
            return Err(EngineError::InvalidParam("ion chunk shape"));
        }
        if self.num_peptides as usize != total_peptides {
            return Err(EngineError::InvalidParam(
                "chunk peptide count does not match table",
            ));
        }
        if self.buckets.windows(2).any(|w| w[0] > w[1]) {
            return Err(EngineError::InvalidParam("bucket array not monotone"));
        }
        if self.buckets.last().copied().unwrap_or(0) as usize != self.ions.len() {
            return Err(EngineError::InvalidParam("bucket array does not cover ions"));
        }
        let spec_len = self.spec_len();
        if self.ions.iter().any(|&raw| raw / spec_len >= self.num_peptides) {
            return Err(EngineError::InvalidParam("ion peptide id out of range"));
        }
        Ok(())
    }
}

/// The complete search index shared read-only by all scoring workers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FragmentIndex {
    /// All peptides, sorted by ascending mass
    pub peptides: Vec<PeptideEntry>,
    /// One chunk per peptide length present in the database
    pub chunks: Vec<IonChunk>,
    /// Integer scaling factor applied to fragment m/z values
    pub scale: u32,
    /// Upper bound on precursor mass, in Da
    pub max_mass: f32,
}

impl FragmentIndex {
    pub fn new(
        peptides: Vec<PeptideEntry>,
        chunks: Vec<IonChunk>,
        scale: u32,
        max_mass: f32,
    ) -> Result<Self, EngineError> {
        if peptides.is_empty() {
            return Err(EngineError::InvalidParam("empty peptide table"));
        }
        if peptides.windows(2).any(|w| w[0].mass > w[1].mass) {
            return Err(EngineError::InvalidParam("peptide table not mass sorted"));
        }
        let bins = (max_mass * scale as f32) as usize;
        for chunk in &chunks {
            chunk.validate(peptides.len())?;
            if chunk.buckets.len() < bins + 1 {
                return Err(EngineError::InvalidParam("bucket array shorter than bin range"));
            }
        }
        Ok(Self {
            peptides,
            chunks,
            scale,
            max_mass,
        })
    }

    /// Number of addressable integer m/z bins.
    pub fn num_bins(&self) -> usize {
        (self.max_mass * self.scale as f32) as usize
    }

    /// Inclusive range of peptide ids whose mass lies within `dm` Da of
    /// `pmass`. A negative `dm` disables the filter. `None` means no
    /// peptide can match and the spectrum should be skipped.
    pub fn precursor_window(&self, pmass: f32, dm: f32) -> Option<(usize, usize)> {
        precursor_window(&self.peptides, pmass, dm)
    }
}

pub fn precursor_window(
    peptides: &[PeptideEntry],
    pmass: f32,
    dm: f32,
) -> Option<(usize, usize)> {
    let t = peptides.len();
    if t == 0 {
        return None;
    }
    if dm < 0.0 {
        return Some((0, t - 1));
    }

    let lo = pmass - dm;
    let hi = pmass + dm;
    if lo > peptides[t - 1].mass {
        return None;
    }

    let (left, right) = if t <= LINEAR_WINDOW {
        let left = peptides.iter().position(|p| p.mass >= lo)?;
        let right = peptides.iter().rposition(|p| p.mass <= hi)?;
        (left, right)
    } else {
        let mut left = match peptides.binary_search_by(|p| p.mass.total_cmp(&lo)) {
            Ok(idx) | Err(idx) => idx,
        };
        // Walk back over any run of equal masses so the window is maximal
        while left > 0 && peptides[left - 1].mass >= lo {
            left -= 1;
        }
        let mut right = match peptides.binary_search_by(|p| p.mass.total_cmp(&hi)) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        while right + 1 < t && peptides[right + 1].mass <= hi {
            right += 1;
        }
        (left, right)
    };

    if left > right || peptides[left].mass > hi {
        return None;
    }
    Some((left, right))
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn table(masses: &[f32]) -> Vec<PeptideEntry> {
        masses
            .iter()
            .enumerate()
            .map(|(i, &mass)| PeptideEntry {
                mass,
                seq_id: i as u32,
                mod_sites: 0,
            })
            .collect()
    }

    #[test]
    fn window_ties_are_inclusive() {
        let peptides = table(&[999.9, 1000.0, 1000.0, 1000.0, 1000.1]);
        assert_eq!(precursor_window(&peptides, 1000.0, 0.0), Some((1, 3)));
    }

    #[test]
    fn window_misses_gap() {
        let peptides = table(&[999.9, 1000.1]);
        assert_eq!(precursor_window(&peptides, 1000.0, 0.001), None);
    }

    #[test]
    fn window_unbounded_when_negative() {
        let peptides = table(&[100.0, 200.0, 300.0]);
        assert_eq!(precursor_window(&peptides, 5000.0, -1.0), Some((0, 2)));
    }

    #[test]
    fn window_above_table_max() {
        let peptides = table(&[100.0, 200.0]);
        assert_eq!(precursor_window(&peptides, 500.0, 1.0), None);
    }

    #[quickcheck]
    fn window_matches_linear_scan(masses: Vec<u32>, center: u32, tol: u16) {
        // Force enough peptides to exercise the binary-search path
        let mut masses = masses
            .iter()
            .cycle()
            .take(masses.len().max(1) * 8 + 600)
            .map(|&m| (m % 10_000) as f32 / 10.0)
            .collect::<Vec<_>>();
        masses.sort_by(|a, b| a.total_cmp(b));
        let peptides = table(&masses);

        let pmass = (center % 11_000) as f32 / 10.0;
        let dm = tol as f32 / 100.0;

        let got = precursor_window(&peptides, pmass, dm);
        let expect = {
            let left = peptides.iter().position(|p| p.mass >= pmass - dm);
            let right = peptides.iter().rposition(|p| p.mass <= pmass + dm);
            match (left, right) {
                (Some(l), Some(r)) if l <= r => Some((l, r)),
                _ => None,
            }
        };
        assert_eq!(got, expect);
    }

    #[test]
    fn chunk_roundtrip_and_decode() {
        // 3 peptides of length 3, charge 1: spec_len = 4, b offsets 0..2
        let entries = [
            (0u32, 0u32, 5u32),
            (0, 2, 9),
            (1, 1, 5),
            (2, 3, 0),
            (1, 3, 9),
        ];
        let chunk = IonChunk::from_ions(3, 1, 3, 10, &entries);
        assert_eq!(chunk.spec_len(), 4);
        assert_eq!(chunk.ions.len(), 5);

        // Bin 5 holds ions for peptides 0 (b) and 1 (b)
        let start = chunk.buckets[5] as usize;
        let end = chunk.buckets[6] as usize;
        let mut hits = chunk.ions[start..end]
            .iter()
            .map(|&raw| chunk.decode(raw))
            .collect::<Vec<_>>();
        hits.sort();
        assert_eq!(hits, vec![(0, true), (1, true)]);

        // Bin 0 holds the y-ion of peptide 2
        assert_eq!(chunk.decode(chunk.ions[0]), (2, false));
    }

    #[test]
    fn index_validation_rejects_unsorted() {
        let peptides = table(&[2.0, 1.0]);
        assert!(FragmentIndex::new(peptides, Vec::new(), 100, 50.0).is_err());
    }
}
