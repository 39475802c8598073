//! Text-to-vector embedding.
//!
//! The consolidator only needs the [`TextEmbedder`] capability. Pretrained
//! sentence-embedding models plug in behind the trait; [`HashingEmbedder`] is
//! the deterministic built-in implementation used by the CLI and the tests.

use crate::error::{BizmapError, Result};

/// Default embedding dimension (matches common MiniLM sentence models).
pub const DEFAULT_DIMENSION: usize = 384;

/// Maps free-text strings to fixed-length vectors.
///
/// Implementations must be deterministic for a fixed model and
/// order-preserving: `output[i]` embeds `input[i]`.
pub trait TextEmbedder: Send + Sync {
    /// Embed a batch of strings.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Number of dimensions this embedder produces.
    fn dimension(&self) -> usize;
}

/// Embed `texts` and verify the output contract.
///
/// Any violation is an [`BizmapError::EmbeddingFailed`]; consolidation treats
/// it as fatal.
pub fn embed_checked(embedder: &dyn TextEmbedder, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let vectors = embedder.embed(texts)?;
    if vectors.len() != texts.len() {
        return Err(BizmapError::EmbeddingFailed {
            message: format!("expected {} vectors, got {}", texts.len(), vectors.len()),
        });
    }
    let dim = embedder.dimension();
    for (text, vector) in texts.iter().zip(&vectors) {
        if vector.len() != dim {
            return Err(BizmapError::EmbeddingFailed {
                message: format!("'{}' embedded to {} dims, expected {}", text, vector.len(), dim),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(BizmapError::EmbeddingFailed {
                message: format!("'{}' embedded to a non-finite vector", text),
            });
        }
    }
    Ok(vectors)
}

/// Scale a vector to unit length. Zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
}

/// Cosine similarity; 0.0 when either vector is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Euclidean distance between two embeddings.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = (*x - *y) as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

// ============================================================================
// Feature-hashing embedder
// ============================================================================

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| (hash ^ *b as u64).wrapping_mul(FNV_PRIME))
}

/// Deterministic FNV-1a feature-hashing embedder.
///
/// Lower-cased word tokens and padded character trigrams are hashed into
/// signed buckets; the result is L2-normalized. Texts sharing words or
/// word fragments land close together, which is enough to merge spelling
/// variants of the same business activity.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    word_weight: f32,
    trigram_weight: f32,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            word_weight: 1.0,
            trigram_weight: 0.5,
        }
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = fnv1a(feature.as_bytes());
        let bucket = (hash % self.dimension as u64) as usize;
        let sign = if (hash >> 63) & 1 == 1 { -1.0 } else { 1.0 };
        vector[bucket] += sign * weight;
    }

    fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        if words.is_empty() {
            return Err(BizmapError::EmbeddingFailed {
                message: format!("cannot embed empty text '{}'", text),
            });
        }

        let mut vector = vec![0.0f32; self.dimension];
        for word in &words {
            self.add_feature(&mut vector, &format!("w:{}", word), self.word_weight);
            let padded: Vec<char> = format!("#{}#", word).chars().collect();
            for gram in padded.windows(3) {
                let gram: String = gram.iter().collect();
                self.add_feature(&mut vector, &format!("g:{}", gram), self.trigram_weight);
            }
        }
        normalize(&mut vector);
        Ok(vector)
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

impl TextEmbedder for HashingEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed_one(t)).collect()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_hashing_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::default();
        let texts = strings(&["Retail Sales of Food", "Tavern"]);
        let a = embedder.embed(&texts).unwrap();
        let b = embedder.embed(&texts).unwrap();
        assert_eq!(a, b);
        for v in &a {
            assert_eq!(v.len(), DEFAULT_DIMENSION);
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_similar_texts_are_closer() {
        let embedder = HashingEmbedder::default();
        let v = embedder
            .embed(&strings(&[
                "Retail sale of groceries",
                "retail sales of grocery",
                "Motor vehicle repair",
            ]))
            .unwrap();
        let close = cosine_similarity(&v[0], &v[1]);
        let far = cosine_similarity(&v[0], &v[2]);
        assert!(close > far, "close={} far={}", close, far);
    }

    #[test]
    fn test_empty_text_rejected() {
        let embedder = HashingEmbedder::default();
        let err = embedder.embed(&strings(&["ok", "   "])).unwrap_err();
        assert!(matches!(err, BizmapError::EmbeddingFailed { .. }));
    }

    struct ShortEmbedder;

    impl TextEmbedder for ShortEmbedder {
        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().skip(1).map(|_| vec![1.0, 0.0]).collect())
        }
        fn dimension(&self) -> usize {
            2
        }
    }

    #[test]
    fn test_embed_checked_catches_contract_violations() {
        let err = embed_checked(&ShortEmbedder, &strings(&["a", "b"])).unwrap_err();
        assert!(matches!(err, BizmapError::EmbeddingFailed { .. }));
    }

    #[test]
    fn test_cosine_and_euclidean() {
        assert!((cosine_similarity(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-6);
        assert!((cosine_similarity(&[2.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]) - 5.0).abs() < 1e-9);
    }
}
