//! Byte encoding and similarity for embedding vectors.
//!
//! Vectors are stored as consecutive little-endian `f32` values. The store
//! treats the bytes as opaque; only this module knows their layout.

/// Size of a single encoded element in bytes.
pub const ELEMENT_SIZE: usize = std::mem::size_of::<f32>();

/// Errors that can occur while decoding a stored vector.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CodecError {
    #[error("Corrupt embedding: expected {expected} bytes, got {got}")]
    Corrupt { expected: usize, got: usize },
}

/// Serialize a vector into its storage representation.
pub fn encode_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * ELEMENT_SIZE);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Deserialize a stored vector of `dimensions` elements.
///
/// Any length other than `dimensions * 4` bytes is reported as corruption.
pub fn decode_vector(bytes: &[u8], dimensions: usize) -> Result<Vec<f32>, CodecError> {
    let expected = dimensions * ELEMENT_SIZE;
    if bytes.len() != expected {
        return Err(CodecError::Corrupt {
            expected,
            got: bytes.len(),
        });
    }

    Ok(bytes
        .chunks_exact(ELEMENT_SIZE)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Cosine similarity between two vectors.
///
/// Returns 0.0 when either vector has zero norm or the lengths differ.
pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a < f32::EPSILON || norm_b < f32::EPSILON {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot_product / (norm_a * norm_b)
}

/// Cosine similarity against a query whose norm is already known.
///
/// Used by the scan loop so the query norm is computed once per search.
pub fn similarity_with_norm(query: &[f32], query_norm: f32, target: &[f32]) -> f32 {
    if query.len() != target.len() || query_norm < f32::EPSILON {
        return 0.0;
    }

    let target_norm = l2_norm(target);
    if target_norm < f32::EPSILON {
        return 0.0;
    }

    let dot_product: f32 = query.iter().zip(target.iter()).map(|(x, y)| x * y).sum();
    dot_product / (query_norm * target_norm)
}

/// L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}
