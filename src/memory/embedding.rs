//! Text embedding for the semantic tier.
//!
//! Real embedding models live outside this crate and plug in through the
//! [`Embedder`] trait. [`HashingEmbedder`] is a dependency-free stand-in:
//! tokens are hashed into a fixed number of signed buckets and the result is
//! L2-normalised, so cosine similarity approximates token overlap.

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Produces fixed-length vectors for text.
pub trait Embedder: Send + Sync {
    /// Embed a piece of text.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Length of every vector returned by `embed`.
    fn dimensions(&self) -> usize;
}

/// Words too common to act as concepts or carry similarity.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "in",
    "is", "it", "its", "of", "on", "or", "that", "the", "their", "there", "these", "this", "to",
    "was", "were", "will", "with", "about", "into", "than", "then", "they", "them", "what",
    "when", "which", "while", "would", "could", "should",
];

/// Lowercasing word tokenizer.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    word_re: Regex,
}

impl Tokenizer {
    pub fn new() -> Self {
        Self {
            word_re: Regex::new(r"[\p{L}\p{N}_]+").unwrap(),
        }
    }

    /// All word tokens, lowercased, in order.
    pub fn tokens(&self, text: &str) -> Vec<String> {
        self.word_re
            .find_iter(text)
            .map(|m| m.as_str().to_lowercase())
            .collect()
    }

    /// Tokens with stop words removed.
    pub fn content_tokens(&self, text: &str) -> Vec<String> {
        self.tokens(text)
            .into_iter()
            .filter(|t| !is_stop_word(t))
            .collect()
    }

    /// Most frequent keyword of at least `min_len` characters. Ties go to the
    /// earliest occurrence.
    pub fn top_keyword(&self, text: &str, min_len: usize) -> Option<String> {
        let mut counts: Vec<(String, usize)> = Vec::new();
        for token in self.content_tokens(text) {
            if token.chars().count() < min_len {
                continue;
            }
            match counts.iter_mut().find(|(t, _)| *t == token) {
                Some((_, n)) => *n += 1,
                None => counts.push((token, 1)),
            }
        }
        // max_by_key keeps the last maximum, so walk in reverse
        counts
            .into_iter()
            .rev()
            .max_by_key(|(_, n)| *n)
            .map(|(t, _)| t)
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(&token)
}

/// Feature-hashing bag-of-words embedder.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
    tokenizer: Tokenizer,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            tokenizer: Tokenizer::new(),
        }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimensions];

        for token in self.tokenizer.content_tokens(text) {
            let digest = Sha256::digest(token.as_bytes());
            let bytes: [u8; 8] = digest[..8]
                .try_into()
                .map_err(|_| Error::IndexDegraded("short digest".into()))?;
            let bucket = (u64::from_le_bytes(bytes) % self.dimensions as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Cosine similarity; 0.0 when either vector is zero or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        (dot / (norm_a * norm_b)).clamp(-1.0, 1.0) as f64
    }
}
