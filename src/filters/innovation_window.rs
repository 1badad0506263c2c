use nalgebra::{UnitQuaternion, Vector3};

/// Sliding window of pose innovations for windowed-delta correction.
///
/// Two ring buffers of capacity `k` hold rotation-vector and translation
/// deltas. Entries are always expressed relative to the owning estimate:
/// whenever that estimate moves, [`InnovationWindow::rebase`] shifts every
/// stored delta so the window mean stays "average of the last k observations
/// minus the current estimate".
#[derive(Clone, Debug, PartialEq)]
pub struct InnovationWindow {
    delta_theta: Vec<Vector3<f64>>,
    delta_x: Vec<Vector3<f64>>,
    /// Number of valid entries, never above capacity
    n: usize,
    /// Next write index
    i: usize,
}

impl InnovationWindow {
    /// Create an empty window holding up to `capacity` innovations.
    ///
    /// Callers validate `capacity > 0` at configuration time; a zero request
    /// is bumped to one so the ring arithmetic stays defined.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        InnovationWindow {
            delta_theta: vec![Vector3::zeros(); capacity],
            delta_x: vec![Vector3::zeros(); capacity],
            n: 0,
            i: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.delta_x.len()
    }

    /// Fill count (actual entries, not capacity)
    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn next_index(&self) -> usize {
        self.i
    }

    /// Insert an innovation at the write index and advance it modulo `k`.
    pub fn push(&mut self, delta_theta: Vector3<f64>, delta_x: Vector3<f64>) {
        let k = self.capacity();
        self.delta_theta[self.i] = delta_theta;
        self.delta_x[self.i] = delta_x;
        self.i = (self.i + 1) % k;
        if self.n < k {
            self.n += 1;
        }
    }

    /// Mean over the valid entries, `None` for an empty window.
    pub fn mean(&self) -> Option<(Vector3<f64>, Vector3<f64>)> {
        if self.n == 0 {
            return None;
        }
        let inv = 1.0 / self.n as f64;
        let (sum_theta, sum_x) = self
            .valid_indices()
            .fold((Vector3::zeros(), Vector3::zeros()), |(st, sx), j| {
                (st + self.delta_theta[j], sx + self.delta_x[j])
            });
        Some((sum_theta * inv, sum_x * inv))
    }

    /// Re-express every entry relative to an estimate that moved by
    /// `rotation` (left-multiplied) and `translation`.
    pub fn rebase(&mut self, rotation: &UnitQuaternion<f64>, translation: &Vector3<f64>) {
        let undo = rotation.inverse();
        for j in 0..self.n {
            let obs = UnitQuaternion::from_scaled_axis(self.delta_theta[j]);
            self.delta_theta[j] = (obs * undo).scaled_axis();
            self.delta_x[j] -= translation;
        }
    }

    /// Entries in insertion order, oldest first.
    ///
    /// These are the rebased deltas against the current estimate, not the
    /// innovations as they were when pushed.
    pub fn entries(&self) -> Vec<(Vector3<f64>, Vector3<f64>)> {
        self.valid_indices()
            .map(|j| (self.delta_theta[j], self.delta_x[j]))
            .collect()
    }

    fn valid_indices(&self) -> impl Iterator<Item = usize> + '_ {
        let k = self.capacity();
        // Oldest valid entry sits `n` slots behind the write index
        let start = (self.i + k - self.n) % k;
        (0..self.n).map(move |off| (start + off) % k)
    }
}
