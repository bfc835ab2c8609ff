// =============================================================================
// Ratio Matrix — dense N×N price-ratio state with dirty tracking & rollback
// =============================================================================
//
// A flat array-backed matrix with a dirty map keyed by cell for
// transactional rollback, built on a plain owned `Vec<f64>` rather than
// pointers into the backing array.
// =============================================================================

use std::collections::HashMap;

/// Dense N×N ratio matrix. Diagonal is always 1.0; off-diagonal cells start
/// as `NaN` until first observed.
pub struct RatioMatrix {
    n: usize,
    data: Vec<f64>,
    ids: Vec<u64>,
    dirty: HashMap<(usize, usize), f64>,
}

impl RatioMatrix {
    /// Build an empty N×N matrix: diagonal 1.0, off-diagonal `NaN`, all pair
    /// ids zero.
    pub fn new(n: usize) -> Self {
        let mut data = vec![f64::NAN; n * n];
        for i in 0..n {
            data[i * n + i] = 1.0;
        }
        Self {
            n,
            data,
            ids: vec![0; n * n],
            dirty: HashMap::new(),
        }
    }

    /// Build a matrix pre-populated from persisted pairs: `(from_idx, to_idx,
    /// ratio, pair_id)`.
    pub fn from_pairs(n: usize, pairs: impl IntoIterator<Item = (usize, usize, Option<f64>, u64)>) -> Self {
        let mut m = Self::new(n);
        for (i, j, ratio, id) in pairs {
            m.data[n * i + j] = ratio.unwrap_or(f64::NAN);
            m.ids[n * i + j] = id;
        }
        m
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    fn idx(&self, i: usize, j: usize) -> usize {
        self.n * i + j
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[self.idx(i, j)]
    }

    /// Set cell (i, j). On the first write to this cell within the current
    /// transaction, stashes the prior value for `rollback`.
    pub fn set(&mut self, i: usize, j: usize, val: f64) {
        let cell = (i, j);
        if let std::collections::hash_map::Entry::Vacant(e) = self.dirty.entry(cell) {
            e.insert(self.data[self.idx(i, j)]);
        }
        let idx = self.idx(i, j);
        self.data[idx] = val;
    }

    /// Row `i`, left to right by `j`.
    pub fn get_row(&self, i: usize) -> &[f64] {
        &self.data[self.idx(i, 0)..self.idx(i, 0) + self.n]
    }

    /// Column `j`, as an owned copy (strided reads don't borrow cleanly).
    pub fn get_col(&self, j: usize) -> Vec<f64> {
        (0..self.n).map(|i| self.data[self.idx(i, j)]).collect()
    }

    pub fn get_pair_id(&self, i: usize, j: usize) -> u64 {
        self.ids[self.idx(i, j)]
    }

    /// Restore every dirty cell to its pre-transaction value and clear the
    /// dirty set.
    pub fn rollback(&mut self) {
        for ((i, j), old) in self.dirty.drain() {
            let idx = self.n * i + j;
            self.data[idx] = old;
        }
    }

    /// Clear the dirty set. Caller is responsible for persisting dirty cells
    /// beforehand.
    pub fn commit(&mut self) {
        self.dirty.clear();
    }

    /// The cells modified since the last commit/rollback.
    pub fn get_dirty(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.dirty.keys().copied()
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagonal_is_always_one() {
        let mut m = RatioMatrix::new(4);
        for i in 0..4 {
            for j in 0..4 {
                if i != j {
                    m.set(i, j, 42.0);
                }
            }
        }
        m.rollback();
        for i in 0..4 {
            assert_eq!(m.get(i, i), 1.0);
        }
    }

    #[test]
    fn rollback_restores_and_commit_then_rollback_is_noop() {
        let mut m = RatioMatrix::new(3);
        m.set(0, 1, 5.0);
        m.rollback();
        assert!(m.get(0, 1).is_nan());

        m.set(0, 1, 7.0);
        m.commit();
        assert_eq!(m.dirty_len(), 0);
        m.rollback(); // no-op: nothing dirty
        assert_eq!(m.get(0, 1), 7.0);
    }

    #[test]
    fn dirty_set_tracks_only_first_write_per_cell() {
        let mut m = RatioMatrix::new(3);
        m.set(0, 1, 5.0);
        m.set(0, 1, 9.0); // second write to same cell: stash stays at NaN
        assert_eq!(m.dirty_len(), 1);
        m.rollback();
        assert!(m.get(0, 1).is_nan());
    }

    #[test]
    fn dirty_len_bounded_by_n_times_n_minus_one() {
        let n = 5;
        let mut m = RatioMatrix::new(n);
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    m.set(i, j, 1.23);
                }
            }
        }
        assert!(m.dirty_len() <= n * (n - 1));
    }

    #[test]
    fn pair_ids_round_trip_from_pairs() {
        let m = RatioMatrix::from_pairs(2, vec![(0, 1, Some(2.0), 99), (1, 0, None, 100)]);
        assert_eq!(m.get(0, 1), 2.0);
        assert_eq!(m.get_pair_id(0, 1), 99);
        assert!(m.get(1, 0).is_nan());
        assert_eq!(m.get_pair_id(1, 0), 100);
    }
}
