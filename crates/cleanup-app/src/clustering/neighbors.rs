//! Brute-force cosine nearest-neighbour lists.

use std::cmp::Ordering;

/// Neighbours of one item: parallel arrays sorted by ascending distance.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NeighborList {
    pub distances: Vec<f32>,
    pub indices: Vec<usize>,
}

impl NeighborList {
    pub fn new(distances: Vec<f32>, indices: Vec<usize>) -> Self {
        Self { distances, indices }
    }

    /// Number of leading entries strictly closer than `threshold`.
    ///
    /// A non-positive threshold always cuts at zero; the cut never decreases
    /// as the threshold grows.
    pub fn cut_index(&self, threshold: f32) -> usize {
        if threshold.is_nan() || threshold <= 0.0 {
            return 0;
        }
        let len = self.distances.len().min(self.indices.len());
        self.distances[..len].partition_point(|d| *d < threshold)
    }

    /// Neighbour indices within `threshold`.
    pub fn within(&self, threshold: f32) -> &[usize] {
        &self.indices[..self.cut_index(threshold)]
    }
}

/// Neighbour lists for every item of one feature set, indexed by item position.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NeighborIndex {
    lists: Vec<NeighborList>,
}

impl NeighborIndex {
    pub fn from_lists(lists: Vec<NeighborList>) -> Self {
        Self { lists }
    }

    pub fn lists(&self) -> &[NeighborList] {
        &self.lists
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}

fn normalized(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        vector.iter().map(|v| v / norm).collect()
    } else {
        vec![0.0; vector.len()]
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    (1.0 - dot).clamp(0.0, 2.0)
}

/// Build up to `max_neighbors` neighbours per item (the item itself first, at
/// distance zero), ordered by cosine distance with index as the tie-breaker.
pub fn build_neighbor_index(vectors: &[&[f32]], max_neighbors: usize) -> NeighborIndex {
    let unit: Vec<Vec<f32>> = vectors.iter().map(|v| normalized(v)).collect();
    let keep = max_neighbors.max(1).min(unit.len());

    let lists = unit
        .iter()
        .enumerate()
        .map(|(i, own)| {
            let mut scored: Vec<(f32, usize)> = unit
                .iter()
                .enumerate()
                .map(|(j, other)| {
                    let d = if i == j { 0.0 } else { cosine_distance(own, other) };
                    (d, j)
                })
                .collect();

            let by_distance = |a: &(f32, usize), b: &(f32, usize)| -> Ordering {
                // Self wins every tie at distance zero.
                (a.1 != i)
                    .cmp(&(b.1 != i))
                    .then_with(|| a.0.total_cmp(&b.0))
                    .then_with(|| a.1.cmp(&b.1))
            };
            if keep < scored.len() {
                scored.select_nth_unstable_by(keep - 1, by_distance);
                scored.truncate(keep);
            }
            scored.sort_by(by_distance);

            let (distances, indices) = scored.into_iter().unzip();
            NeighborList {
                distances,
                indices,
            }
        })
        .collect();

    NeighborIndex { lists }
}
