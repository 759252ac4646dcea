//! The bounded candidate heap kept per spectrum during scoring.

/// One retained candidate for a query spectrum.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct HeapCell {
    pub hyperscore: f32,
    pub peptide_id: u32,
    /// Matched b + y ions
    pub shared_ions: u16,
    /// Theoretical ions for this candidate
    pub total_ions: u16,
    pub file_id: u16,
    pub precursor_mass: f32,
    pub charge: u8,
    pub rtime: f32,
}

/// Bounded min-heap of the best-scoring candidates seen so far.
///
/// Insertion is unconditional until the heap is full; afterwards a new cell
/// evicts the current minimum only if its score is *strictly* greater, so
/// ties are resolved in favor of the earlier insertion.
#[derive(Clone, Debug)]
pub struct TopK {
    cells: Vec<HeapCell>,
    capacity: usize,
}

impl TopK {
    pub fn new(capacity: usize) -> Self {
        Self {
            cells: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn push(&mut self, cell: HeapCell) {
        if self.capacity == 0 {
            return;
        }
        if self.cells.len() < self.capacity {
            self.cells.push(cell);
            if self.cells.len() == self.capacity {
                for i in (0..self.capacity / 2).rev() {
                    self.sift_down(i);
                }
            }
        } else if cell.hyperscore > self.cells[0].hyperscore {
            self.cells[0] = cell;
            self.sift_down(0);
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        loop {
            let mut smallest = index;
            for child in [index * 2 + 1, index * 2 + 2] {
                if let Some(c) = self.cells.get(child) {
                    if c.hyperscore < self.cells[smallest].hyperscore {
                        smallest = child;
                    }
                }
            }
            if smallest == index {
                break;
            }
            self.cells.swap(smallest, index);
            index = smallest;
        }
    }

    /// Drain into a vector ordered by descending hyperscore. Equal scores
    /// are ordered by peptide id so output is deterministic.
    pub fn into_sorted(mut self) -> Vec<HeapCell> {
        self.cells.sort_unstable_by(|a, b| {
            b.hyperscore
                .total_cmp(&a.hyperscore)
                .then_with(|| a.peptide_id.cmp(&b.peptide_id))
        });
        self.cells
    }
}

#[cfg(test)]
mod tests {
    use quickcheck_macros::quickcheck;

    use super::*;

    fn cell(score: f32, id: u32) -> HeapCell {
        HeapCell {
            hyperscore: score,
            peptide_id: id,
            ..Default::default()
        }
    }

    #[test]
    fn topk_keeps_k_best() {
        let mut heap = TopK::new(3);
        for (i, &score) in [1.0f32, 9.0, 4.0, 7.0, 2.0, 8.0, 3.0].iter().enumerate() {
            heap.push(cell(score, i as u32));
        }
        let sorted = heap.into_sorted();
        let scores = sorted.iter().map(|c| c.hyperscore).collect::<Vec<_>>();
        assert_eq!(scores, vec![9.0, 8.0, 7.0]);
    }

    #[test]
    fn topk_ties_favor_first_insertion() {
        let mut heap = TopK::new(2);
        heap.push(cell(5.0, 1));
        heap.push(cell(5.0, 2));
        // Equal score must not evict the incumbent minimum
        heap.push(cell(5.0, 3));
        let ids = heap
            .into_sorted()
            .into_iter()
            .map(|c| c.peptide_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn topk_under_capacity() {
        let mut heap = TopK::new(10);
        heap.push(cell(2.0, 0));
        heap.push(cell(1.0, 1));
        assert_eq!(heap.len(), 2);
        let sorted = heap.into_sorted();
        assert_eq!(sorted[0].hyperscore, 2.0);
    }

    #[test]
    fn topk_zero_capacity_accepts_nothing() {
        let mut heap = TopK::new(0);
        heap.push(cell(3.0, 0));
        assert!(heap.is_empty());
    }

    #[quickcheck]
    fn topk_matches_full_sort(scores: Vec<u16>, k: usize) {
        let k = 1 + k % 16;
        let mut heap = TopK::new(k);
        for (i, &s) in scores.iter().enumerate() {
            heap.push(cell(s as f32, i as u32));
        }
        let kept = heap
            .into_sorted()
            .into_iter()
            .map(|c| c.hyperscore)
            .collect::<Vec<_>>();

        let mut expected = scores.iter().map(|&s| s as f32).collect::<Vec<_>>();
        expected.sort_by(|a, b| b.total_cmp(a));
        expected.truncate(k);
        assert_eq!(kept, expected);
    }
}
