//! Per-worker scratch scorecards: dense b/y ion tallies indexed by
//! candidate peptide id. Owned exclusively by one scoring thread, so no
//! synchronization is required.

/// Matched-ion counts and summed intensities for one candidate peptide.
///
/// Counters saturate instead of wrapping; intensity sums are widened so a
/// saturated counter cannot overflow the score expression downstream.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Byc {
    pub bc: u16,
    pub yc: u16,
    pub ibc: u32,
    pub iyc: u32,
}

#[derive(Clone, Debug, Default)]
pub struct Scorecard {
    cells: Vec<Byc>,
}

impl Scorecard {
    pub fn new(len: usize) -> Self {
        Self {
            cells: vec![Byc::default(); len],
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[inline]
    pub fn hit_b(&mut self, peptide_id: usize, intensity: u32) {
        let cell = &mut self.cells[peptide_id];
        cell.bc = cell.bc.saturating_add(1);
        cell.ibc = cell.ibc.saturating_add(intensity);
    }

    #[inline]
    pub fn hit_y(&mut self, peptide_id: usize, intensity: u32) {
        let cell = &mut self.cells[peptide_id];
        cell.yc = cell.yc.saturating_add(1);
        cell.iyc = cell.iyc.saturating_add(intensity);
    }

    #[inline]
    pub fn get(&self, peptide_id: usize) -> Byc {
        self.cells[peptide_id]
    }

    /// Zero the inspected range after a (spectrum, chunk) pair so the next
    /// pair starts from a clean slate.
    pub fn clear_range(&mut self, lo: usize, hi: usize) {
        for cell in &mut self.cells[lo..hi] {
            *cell = Byc::default();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clean_slate_after_clear() {
        let mut card = Scorecard::new(16);
        for id in 3..9 {
            card.hit_b(id, 100);
            card.hit_y(id, 250);
        }
        card.clear_range(3, 9);
        for id in 0..16 {
            assert_eq!(card.get(id), Byc::default());
        }
    }

    #[test]
    fn counters_saturate() {
        let mut card = Scorecard::new(1);
        for _ in 0..=u16::MAX as u32 + 10 {
            card.hit_b(0, u32::MAX);
        }
        let cell = card.get(0);
        assert_eq!(cell.bc, u16::MAX);
        assert_eq!(cell.ibc, u32::MAX);
    }

    #[test]
    fn clear_is_range_local() {
        let mut card = Scorecard::new(8);
        card.hit_y(1, 5);
        card.hit_y(6, 5);
        card.clear_range(0, 4);
        assert_eq!(card.get(1), Byc::default());
        assert_eq!(card.get(6).yc, 1);
    }
}
