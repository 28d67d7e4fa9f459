//! Text encoders
//!
//! The engine stores vectors, never text embeddings it computed itself. The
//! CLI turns text into vectors here:
//!
//! - [`HashingEncoder`]: deterministic feature hashing, no model download
//! - [`FastEmbedEncoder`]: local ONNX model (feature `embeddings`)
//!
//! Both produce L2-normalized vectors of the configured dimension.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use anyhow::{Result, bail};
use lru::LruCache;
use sha2::{Digest, Sha256};

/// Maximum text length passed to an encoder (bytes, cut on a char boundary)
pub const MAX_TEXT_LENGTH: usize = 8192;

/// Query encodings kept by [`CachedEncoder`]
const QUERY_CACHE_SIZE: usize = 100;

/// Maps text to a fixed-dimension vector
pub trait Encoder: Send + Sync {
    fn dimensions(&self) -> usize;

    fn encode(&self, text: &str) -> Result<Vec<f32>>;

    /// Name recorded in status output
    fn name(&self) -> &str;
}

// ============================================================================
// HASHING ENCODER
// ============================================================================

/// Signed feature hashing over word unigrams and bigrams
pub struct HashingEncoder {
    dimensions: usize,
}

impl HashingEncoder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        let value = u64::from_le_bytes(raw);
        let index = (value % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }
}

impl Encoder for HashingEncoder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let tokens = tokenize(truncate_text(text));
        if tokens.is_empty() {
            bail!("Text has no encodable words");
        }

        let mut vector = vec![0.0f32; self.dimensions];
        for token in &tokens {
            let (index, sign) = self.bucket(token);
            vector[index] += sign;
        }
        for pair in tokens.windows(2) {
            let (index, sign) = self.bucket(&format!("{} {}", pair[0], pair[1]));
            vector[index] += 0.5 * sign;
        }

        normalize(&mut vector);
        if vector.iter().all(|x| *x == 0.0) {
            // Every feature cancelled out; fall back to the first token
            let (index, sign) = self.bucket(&tokens[0]);
            vector[index] = sign;
        }
        Ok(vector)
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn truncate_text(text: &str) -> &str {
    if text.len() <= MAX_TEXT_LENGTH {
        return text;
    }
    let mut end = MAX_TEXT_LENGTH;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// L2-normalize in place; zero vectors are left unchanged
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

// ============================================================================
// FASTEMBED ENCODER
// ============================================================================

#[cfg(feature = "embeddings")]
pub use local::FastEmbedEncoder;

#[cfg(feature = "embeddings")]
mod local {
    use std::sync::Mutex;

    use anyhow::{Result, anyhow, bail};
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

    use super::{Encoder, normalize, truncate_text};

    /// nomic-embed-text-v1.5, truncated to the configured dimension
    pub struct FastEmbedEncoder {
        model: Mutex<TextEmbedding>,
        dimensions: usize,
    }

    impl FastEmbedEncoder {
        pub fn new(dimensions: usize) -> Result<Self> {
            if dimensions > 768 {
                bail!("nomic-embed-text-v1.5 produces at most 768 dimensions");
            }
            let cache_dir = cache_dir();
            if let Err(e) = std::fs::create_dir_all(&cache_dir) {
                tracing::warn!("Failed to create cache directory {:?}: {}", cache_dir, e);
            }

            let options = InitOptions::new(EmbeddingModel::NomicEmbedTextV15)
                .with_show_download_progress(true)
                .with_cache_dir(cache_dir);
            let model = TextEmbedding::try_new(options)
                .map_err(|e| anyhow!("Failed to initialize embedding model: {}", e))?;

            Ok(Self {
                model: Mutex::new(model),
                dimensions,
            })
        }
    }

    /// FASTEMBED_CACHE_PATH, else the platform cache directory
    fn cache_dir() -> std::path::PathBuf {
        if let Ok(path) = std::env::var("FASTEMBED_CACHE_PATH") {
            return std::path::PathBuf::from(path);
        }
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "strata", "core") {
            return proj_dirs.cache_dir().join("fastembed");
        }
        std::path::PathBuf::from(".fastembed_cache")
    }

    impl Encoder for FastEmbedEncoder {
        fn dimensions(&self) -> usize {
            self.dimensions
        }

        fn encode(&self, text: &str) -> Result<Vec<f32>> {
            if text.trim().is_empty() {
                bail!("Text cannot be empty");
            }
            let mut model = self
                .model
                .lock()
                .map_err(|_| anyhow!("Embedding model lock poisoned"))?;
            let mut embeddings = model
                .embed(vec![truncate_text(text)], None)
                .map_err(|e| anyhow!("Embedding generation failed: {}", e))?;
            let Some(mut vector) = embeddings.pop() else {
                bail!("No embedding generated");
            };

            // Matryoshka: the first N dims are the N-dim representation
            vector.truncate(self.dimensions);
            normalize(&mut vector);
            Ok(vector)
        }

        fn name(&self) -> &str {
            "nomic-ai/nomic-embed-text-v1.5"
        }
    }
}

// ============================================================================
// QUERY CACHE
// ============================================================================

/// Wraps an encoder with an LRU cache of recent encodings
pub struct CachedEncoder {
    inner: Box<dyn Encoder>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl CachedEncoder {
    pub fn new(inner: Box<dyn Encoder>) -> Self {
        let capacity = NonZeroUsize::new(QUERY_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn cached(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl Encoder for CachedEncoder {
    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(vector) = cache.get(text) {
                return Ok(vector.clone());
            }
        }

        let vector = self.inner.encode(text)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(text.to_string(), vector.clone());
        }
        Ok(vector)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// The best encoder this build supports
pub fn default_encoder(dimensions: usize) -> Result<CachedEncoder> {
    #[cfg(feature = "embeddings")]
    {
        match FastEmbedEncoder::new(dimensions) {
            Ok(encoder) => return Ok(CachedEncoder::new(Box::new(encoder))),
            Err(e) => tracing::warn!("Embeddings unavailable, using hashing encoder: {}", e),
        }
    }
    Ok(CachedEncoder::new(Box::new(HashingEncoder::new(dimensions))))
}
