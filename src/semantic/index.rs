//! Exact flat index over squared L2 distance.
//!
//! Vectors are stored row-major in one buffer. Positions are assigned in
//! insertion order and never reused; there is no removal.

/// A search hit: index position and squared L2 distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub position: u64,
    pub distance: f32,
}

/// Brute-force nearest-neighbor index.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatL2Index {
    dimensions: usize,
    /// ntotal * dimensions values
    data: Vec<f32>,
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Index dimensions must be greater than zero")]
    ZeroDimensions,

    #[error("Document {0} is already indexed")]
    AlreadyIndexed(u64),

    #[error("Index corruption: mapping has {mapped} entries for {ntotal} vectors")]
    Corruption { mapped: usize, ntotal: u64 },

    #[error("Index corruption: position {0} has no mapping entry")]
    UnmappedPosition(u64),
}

impl FlatL2Index {
    /// Create a new empty index with specified dimensions.
    pub fn new(dimensions: usize) -> Result<Self, IndexError> {
        if dimensions == 0 {
            return Err(IndexError::ZeroDimensions);
        }
        Ok(Self {
            dimensions,
            data: Vec::new(),
        })
    }

    /// Rebuild an index from a raw row-major buffer.
    pub fn from_raw(dimensions: usize, data: Vec<f32>) -> Result<Self, IndexError> {
        if dimensions == 0 {
            return Err(IndexError::ZeroDimensions);
        }
        if data.len() % dimensions != 0 {
            return Err(IndexError::DimensionMismatch {
                expected: dimensions,
                got: data.len() % dimensions,
            });
        }
        Ok(Self { dimensions, data })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Number of stored vectors.
    pub fn ntotal(&self) -> u64 {
        (self.data.len() / self.dimensions) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn raw(&self) -> &[f32] {
        &self.data
    }

    /// The vector stored at `position`.
    pub fn vector(&self, position: u64) -> Option<&[f32]> {
        let start = (position as usize).checked_mul(self.dimensions)?;
        self.data.get(start..start + self.dimensions)
    }

    /// Append a vector; returns its position (the pre-insertion `ntotal`).
    pub fn add(&mut self, vector: &[f32]) -> Result<u64, IndexError> {
        self.check_dimensions(vector)?;
        let position = self.ntotal();
        self.data.extend_from_slice(vector);
        Ok(position)
    }

    /// Drop every vector from `ntotal` on. Used to undo an append whose
    /// persistence failed.
    pub(crate) fn truncate(&mut self, ntotal: u64) {
        self.data.truncate(ntotal as usize * self.dimensions);
    }

    /// The `min(k, ntotal)` nearest vectors, closest first.
    ///
    /// Equal distances keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        self.check_dimensions(query)?;
        if k == 0 || self.is_empty() {
            return Ok(vec![]);
        }

        let mut neighbors: Vec<Neighbor> = self
            .data
            .chunks_exact(self.dimensions)
            .enumerate()
            .map(|(position, row)| Neighbor {
                position: position as u64,
                distance: squared_l2(query, row),
            })
            .collect();

        neighbors.sort_by(Self::order);
        neighbors.truncate(k);

        Ok(neighbors)
    }

    fn order(a: &Neighbor, b: &Neighbor) -> std::cmp::Ordering {
        a.distance
            .total_cmp(&b.distance)
            .then(a.position.cmp(&b.position))
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        Ok(())
    }
}

/// Squared Euclidean distance; ranking is the same as true L2.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Compute L2 norm of a vector.
fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity; zero when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a < f32::EPSILON || norm_b < f32::EPSILON {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot_product / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_index() {
        let index = FlatL2Index::new(384).unwrap();
        assert_eq!(index.dimensions(), 384);
        assert!(index.is_empty());
        assert_eq!(index.ntotal(), 0);
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        assert!(matches!(
            FlatL2Index::new(0),
            Err(IndexError::ZeroDimensions)
        ));
    }

    #[test]
    fn test_positions_are_sequential() {
        let mut index = FlatL2Index::new(2).unwrap();
        for expected in 0..5u64 {
            let position = index.add(&[expected as f32, 1.0]).unwrap();
            assert_eq!(position, expected);
        }
        assert_eq!(index.ntotal(), 5);
        assert_eq!(index.vector(3), Some(&[3.0, 1.0][..]));
        assert_eq!(index.vector(5), None);
    }

    #[test]
    fn test_add_dimension_mismatch() {
        let mut index = FlatL2Index::new(3).unwrap();
        let result = index.add(&[1.0, 0.0, 0.0, 0.0]);
        assert!(matches!(
            result,
            Err(IndexError::DimensionMismatch {
                expected: 3,
                got: 4
            })
        ));
        // failed adds leave no trace
        assert_eq!(index.ntotal(), 0);
    }

    #[test]
    fn test_zero_vector_is_allowed() {
        let mut index = FlatL2Index::new(2).unwrap();
        assert_eq!(index.add(&[0.0, 0.0]).unwrap(), 0);
    }

    #[test]
    fn test_search_toy_scenario() {
        let mut index = FlatL2Index::new(2).unwrap();
        index.add(&[1.0, 0.0]).unwrap();
        index.add(&[0.0, 1.0]).unwrap();

        let hits = index.search(&[0.9, 0.1], 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].position, 0);
        assert!((hits[0].distance - 0.02).abs() < 1e-6);

        // equidistant: insertion order wins
        let hits = index.search(&[0.0, 0.0], 2).unwrap();
        let positions: Vec<u64> = hits.iter().map(|h| h.position).collect();
        assert_eq!(positions, vec![0, 1]);
    }

    #[test]
    fn test_search_returns_at_most_ntotal() {
        let mut index = FlatL2Index::new(1).unwrap();
        index.add(&[1.0]).unwrap();
        index.add(&[2.0]).unwrap();

        assert_eq!(index.search(&[0.0], 10).unwrap().len(), 2);
        assert_eq!(index.search(&[0.0], 1).unwrap().len(), 1);
        assert!(index.search(&[0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_search_orders_by_distance() {
        let mut index = FlatL2Index::new(1).unwrap();
        for v in [5.0, -1.0, 3.0, 0.5, 10.0, 2.0] {
            index.add(&[v]).unwrap();
        }

        let hits = index.search(&[2.1], 4).unwrap();
        let positions: Vec<u64> = hits.iter().map(|h| h.position).collect();
        // 2.0, 3.0, 0.5, 5.0
        assert_eq!(positions, vec![5, 2, 3, 0]);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn test_self_is_nearest() {
        let mut index = FlatL2Index::new(3).unwrap();
        let vectors = [
            [0.1, 0.2, 0.3],
            [0.9, -0.2, 0.0],
            [-0.5, 0.5, 0.5],
            [0.1, 0.25, 0.3],
        ];
        for v in &vectors {
            index.add(v).unwrap();
        }
        for (i, v) in vectors.iter().enumerate() {
            let hits = index.search(v, 1).unwrap();
            assert_eq!(hits[0].position, i as u64);
            assert_eq!(hits[0].distance, 0.0);
        }
    }

    #[test]
    fn test_search_empty_index() {
        let index = FlatL2Index::new(2).unwrap();
        assert!(index.search(&[1.0, 1.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_search_dimension_mismatch() {
        let mut index = FlatL2Index::new(2).unwrap();
        index.add(&[1.0, 0.0]).unwrap();
        assert!(matches!(
            index.search(&[1.0], 1),
            Err(IndexError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_from_raw_rejects_ragged_buffer() {
        assert!(FlatL2Index::from_raw(3, vec![0.0; 7]).is_err());
        let index = FlatL2Index::from_raw(3, vec![0.0; 9]).unwrap();
        assert_eq!(index.ntotal(), 3);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
