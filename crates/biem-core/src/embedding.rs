//! Embedding vector helpers
//!
//! Similarity math and the byte codec used to persist vectors in SQLite.
//! Embedding *generation* is an external capability (see [`crate::llm`]);
//! this module only operates on vectors that already exist.

// ============================================================================
// SIMILARITY FUNCTIONS
// ============================================================================

/// Compute cosine similarity between two vectors
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot_product = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = (norm_a * norm_b).sqrt();
    if denominator > 0.0 {
        dot_product / denominator
    } else {
        0.0
    }
}

/// Compute Euclidean distance between two vectors
#[inline]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::MAX;
    }

    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// Compute dot product between two vectors
#[inline]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Convert a cosine-distance value from a distance-based backend into
/// similarity in `[0, 1]` (`sim = 1 - distance / 2`)
#[inline]
pub fn distance_to_similarity(distance: f32) -> f32 {
    (1.0 - distance / 2.0).clamp(0.0, 1.0)
}

/// An all-zero vector of the given dimension, used when embedding fails
#[inline]
pub fn zero_vector(dim: usize) -> Vec<f32> {
    vec![0.0; dim]
}

/// Whether a vector is missing or all zeros (failed embedding)
#[inline]
pub fn is_zero_vector(v: &[f32]) -> bool {
    v.is_empty() || v.iter().all(|x| *x == 0.0)
}

// ============================================================================
// BYTE CODEC
// ============================================================================

/// Convert a vector to little-endian bytes for storage
pub fn to_bytes(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Create a vector from bytes produced by [`to_bytes`]
pub fn from_bytes(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

// ============================================================================
// TESTS
// ============================================================================
