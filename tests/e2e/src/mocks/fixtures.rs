//! Test Data Factory
//!
//! Provides utilities for generating test data:
//! - Unit vectors with known cosine similarities
//! - Items at each level
//! - Pre-built graph scenarios

use strata_core::{EdgeType, IngestItem, Level, MemoryEngine};

/// Vector dimension used across the end-to-end tests
pub const DIMS: usize = 8;

/// Unit vector along axis `i`
pub fn axis(i: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIMS];
    v[i % DIMS] = 1.0;
    v
}

/// Unit vector in the plane of axes 0 and 1 whose cosine with `axis(0)` is
/// `cosine`
pub fn unit_at_angle(cosine: f32) -> Vec<f32> {
    let mut v = vec![0.0; DIMS];
    v[0] = cosine;
    v[1] = (1.0 - cosine * cosine).max(0.0).sqrt();
    v
}

/// Factory for creating test data
pub struct TestDataFactory;

impl TestDataFactory {
    pub fn concept(id: &str, vector: Vec<f32>) -> IngestItem {
        IngestItem::new(id, format!("concept {}", id), vector, Level::Concept)
    }

    pub fn episode(id: &str, vector: Vec<f32>) -> IngestItem {
        IngestItem::new(id, format!("episode {}", id), vector, Level::Episode)
    }

    /// A and B at concept level joined by an edge of strength 0.8.
    ///
    /// A lies on `axis(0)`; B is orthogonal to it, so a probe near A seeds
    /// only A when `seed_k` is 1.
    pub fn create_two_node_scenario(engine: &MemoryEngine) {
        let store = engine.store();
        store
            .put(&Self::concept("A", axis(0)).with_importance(0.9))
            .expect("put A");
        store
            .put(&Self::concept("B", axis(2)).with_importance(0.6))
            .expect("put B");
        engine
            .graph()
            .upsert_edge("A", "B", 0.8, EdgeType::Associative)
            .expect("edge A-B");
    }

    /// Chain `prefix0 - prefix1 - ... - prefix{n-1}` with uniform strength.
    /// Node 0 lies on `axis(0)`, the rest on `axis(3)`.
    pub fn create_chain(engine: &MemoryEngine, prefix: &str, n: usize, strength: f64) -> Vec<String> {
        let ids: Vec<String> = (0..n).map(|i| format!("{}{:03}", prefix, i)).collect();
        for (i, id) in ids.iter().enumerate() {
            let vector = if i == 0 { axis(0) } else { axis(3) };
            engine
                .store()
                .put(&Self::concept(id, vector))
                .expect("put chain node");
        }
        for pair in ids.windows(2) {
            engine
                .graph()
                .upsert_edge(&pair[0], &pair[1], strength, EdgeType::Associative)
                .expect("chain edge");
        }
        ids
    }

    /// Every pair of `n` nodes connected with `strength`. Node 0 lies on
    /// `axis(0)`, the rest on `axis(4)`.
    pub fn create_complete_graph(
        engine: &MemoryEngine,
        prefix: &str,
        n: usize,
        strength: f64,
    ) -> Vec<String> {
        let ids: Vec<String> = (0..n).map(|i| format!("{}{:03}", prefix, i)).collect();
        for (i, id) in ids.iter().enumerate() {
            let vector = if i == 0 { axis(0) } else { axis(4) };
            engine
                .store()
                .put(&Self::concept(id, vector))
                .expect("put graph node");
        }
        for i in 0..n {
            for j in (i + 1)..n {
                engine
                    .graph()
                    .upsert_edge(&ids[i], &ids[j], strength, EdgeType::Associative)
                    .expect("graph edge");
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_at_angle() {
        let v = unit_at_angle(0.9);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((v[0] - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_axis_wraps() {
        assert_eq!(axis(DIMS), axis(0));
    }
}
