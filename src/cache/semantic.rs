//! Semantic (embedding-bucket) cache.
//!
//! Not a nearest-neighbour index. The first `dims` dimensions of an
//! embedding are re-normalized, rounded to a fixed number of decimals and
//! joined into a key, so texts whose embeddings round to the same prefix
//! share a verdict. Each configured threshold maps to its own bucket:
//! the tightest threshold keeps `precision` decimals and every looser one
//! keeps one decimal fewer (never below one).
//!
//! Lookup probes buckets tightest first. Writes go to the tightest bucket
//! only unless `write_all_buckets` is set.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::CacheLayer;
use crate::config::CacheConfig;
use crate::types::{AnalysisResult, ContentType};

/// External embedding source.
///
/// Returns `None` when no vector can be produced; the semantic tier is then
/// skipped for that text.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `text` into a fixed-length vector.
    async fn embed(&self, text: &str) -> Option<Vec<f32>>;
}

/// Deterministic bag-of-tokens embedder.
///
/// Tokens are whitespace-separated words, with CJK runs split into
/// character bigrams. Each token is hashed and projected onto `dim`
/// sin/cos components; the sum is unit-normalized. Two texts sharing most
/// tokens land close together.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    /// Embedder producing `dim`-dimensional vectors.
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn tokens(text: &str) -> Vec<String> {
        let mut out = Vec::new();
        for word in text.split_whitespace() {
            let chars: Vec<char> = word.chars().collect();
            if chars.len() > 1 && chars.iter().any(|c| crate::normalize::is_cjk(*c)) {
                out.extend(chars.windows(2).map(|w| w.iter().collect::<String>()));
            } else {
                out.push(word.to_string());
            }
        }
        out
    }

    /// Synchronous embedding, `None` for texts with no tokens.
    pub fn embed_text(&self, text: &str) -> Option<Vec<f32>> {
        if self.dim == 0 {
            return None;
        }
        let tokens = Self::tokens(text);
        if tokens.is_empty() {
            return None;
        }
        let mut acc = vec![0.0f64; self.dim];
        for token in &tokens {
            let digest = Sha256::digest(token.as_bytes());
            let mut seed = [0u8; 8];
            seed.copy_from_slice(&digest[..8]);
            let hv = u64::from_be_bytes(seed);
            for (i, slot) in acc.iter_mut().enumerate() {
                let angle =
                    (hv.wrapping_add(i as u64) as f64) * std::f64::consts::PI / self.dim as f64;
                *slot += if i % 2 == 0 { angle.sin() } else { angle.cos() };
            }
        }
        let norm: f64 = acc.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm < 1e-9 {
            return None;
        }
        Some(acc.iter().map(|v| (v / norm) as f32).collect())
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        self.embed_text(text)
    }
}

/// Semantic cache over a shared [`CacheLayer`].
#[derive(Clone)]
pub struct SemanticCache {
    layer: CacheLayer,
    ttl_secs: u64,
    min_length: usize,
    dims: usize,
    precision: u32,
    thresholds: Vec<f64>,
    write_all_buckets: bool,
}

impl SemanticCache {
    /// Build from the `[cache]` section.
    pub fn new(layer: CacheLayer, config: &CacheConfig) -> Self {
        Self {
            layer,
            ttl_secs: config.semantic_ttl_s,
            min_length: config.semantic_min_length,
            dims: config.semantic_dims,
            precision: config.semantic_precision,
            thresholds: config.semantic_thresholds.clone(),
            write_all_buckets: config.semantic_write_all_buckets,
        }
    }

    /// Whether `text` is long enough to use this tier.
    pub fn applies_to(&self, text: &str) -> bool {
        text.trim().chars().count() >= self.min_length
    }

    /// Quantized prefix for the bucket at `level` (0 = tightest).
    fn bucket(&self, embedding: &[f32], level: usize) -> Option<String> {
        let k = self.dims.min(embedding.len());
        if k == 0 {
            return None;
        }
        let prefix = &embedding[..k];
        let norm = prefix
            .iter()
            .map(|v| f64::from(*v) * f64::from(*v))
            .sum::<f64>()
            .sqrt();
        if !norm.is_finite() || norm < 1e-9 {
            return None;
        }
        let decimals = self.precision.saturating_sub(level as u32).max(1) as usize;
        let parts: Vec<String> = prefix
            .iter()
            .map(|v| {
                let q = f64::from(*v) / norm;
                // Avoid "-0.0" and "0.0" landing in different buckets.
                let s = format!("{q:.decimals$}");
                if s.trim_start_matches('-').chars().all(|c| c == '0' || c == '.') {
                    s.trim_start_matches('-').to_string()
                } else {
                    s
                }
            })
            .collect();
        Some(parts.join(","))
    }

    fn key(
        &self,
        content_type: ContentType,
        prompt_version_id: Option<i64>,
        level: usize,
        bucket: &str,
    ) -> String {
        let version = prompt_version_id.map_or_else(|| "none".to_string(), |v| v.to_string());
        let threshold = self.thresholds.get(level).copied().unwrap_or(0.0);
        format!(
            "sem:{}:{}:t{:.2}:{}",
            content_type.as_str(),
            version,
            threshold,
            bucket
        )
    }

    /// Probe buckets tightest first; returns the result and the matched
    /// threshold.
    pub async fn lookup(
        &self,
        embedding: &[f32],
        content_type: ContentType,
        prompt_version_id: Option<i64>,
    ) -> Option<(AnalysisResult, f64)> {
        for (level, threshold) in self.thresholds.iter().enumerate() {
            let bucket = self.bucket(embedding, level)?;
            let key = self.key(content_type, prompt_version_id, level, &bucket);
            if let Some(result) = self.layer.get_json::<AnalysisResult>(&key).await {
                debug!(threshold = threshold, "semantic cache hit");
                return Some((result, *threshold));
            }
        }
        None
    }

    /// Store `result` under the primary bucket (or every bucket).
    pub async fn store(
        &self,
        embedding: &[f32],
        content_type: ContentType,
        prompt_version_id: Option<i64>,
        result: &AnalysisResult,
    ) {
        let levels = if self.write_all_buckets {
            self.thresholds.len()
        } else {
            self.thresholds.len().min(1)
        };
        for level in 0..levels {
            if let Some(bucket) = self.bucket(embedding, level) {
                let key = self.key(content_type, prompt_version_id, level, &bucket);
                self.layer.put_json(key, result, self.ttl_secs).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DefaultTag, ResultSource};

    fn config() -> CacheConfig {
        CacheConfig {
            semantic_dims: 4,
            semantic_precision: 2,
            semantic_thresholds: vec![0.95, 0.90, 0.85],
            ..CacheConfig::default()
        }
    }

    fn result(score: u8) -> AnalysisResult {
        let mut r = AnalysisResult::default_tagged(DefaultTag::LlmOff, None);
        r.source = ResultSource::LocalModel;
        r.score = score;
        r
    }

    #[test]
    fn test_hashing_embedder_is_deterministic_and_unit_length() {
        let e = HashingEmbedder::new(32);
        let a = e.embed_text("this is a fine comment").expect("test: vector");
        let b = e.embed_text("this is a fine comment").expect("test: vector");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_hashing_embedder_none_for_blank() {
        assert!(HashingEmbedder::new(8).embed_text("   ").is_none());
        assert!(HashingEmbedder::new(0).embed_text("text").is_none());
    }

    #[test]
    fn test_cjk_text_tokenizes_into_bigrams() {
        let tokens = HashingEmbedder::tokens("讲得很好");
        assert_eq!(tokens, vec!["讲得", "得很", "很好"]);
    }

    #[test]
    fn test_looser_buckets_keep_fewer_decimals() {
        let cache = SemanticCache::new(CacheLayer::new_memory(10), &config());
        let v = [0.5f32, 0.5, 0.5, 0.5];
        assert_eq!(cache.bucket(&v, 0).as_deref(), Some("0.50,0.50,0.50,0.50"));
        assert_eq!(cache.bucket(&v, 1).as_deref(), Some("0.5,0.5,0.5,0.5"));
        assert_eq!(cache.bucket(&v, 2).as_deref(), Some("0.5,0.5,0.5,0.5"));
    }

    #[tokio::test]
    async fn test_nearby_vectors_share_primary_bucket() {
        let cache = SemanticCache::new(CacheLayer::new_memory(10), &config());
        let a = [0.5f32, 0.5, 0.5, 0.5];
        let b = [0.501f32, 0.499, 0.5, 0.5];
        cache.store(&a, ContentType::Comment, Some(1), &result(64)).await;

        let (hit, threshold) = cache
            .lookup(&b, ContentType::Comment, Some(1))
            .await
            .expect("test: semantic hit");
        assert_eq!(hit.score, 64);
        assert!((threshold - 0.95).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_other_type_or_version_misses() {
        let cache = SemanticCache::new(CacheLayer::new_memory(10), &config());
        let v = [0.5f32, 0.5, 0.5, 0.5];
        cache.store(&v, ContentType::Comment, Some(1), &result(64)).await;
        assert!(cache.lookup(&v, ContentType::Danmaku, Some(1)).await.is_none());
        assert!(cache.lookup(&v, ContentType::Comment, Some(2)).await.is_none());
    }

    #[tokio::test]
    async fn test_write_all_buckets_hits_looser_threshold() {
        let mut cfg = config();
        cfg.semantic_write_all_buckets = true;
        let cache = SemanticCache::new(CacheLayer::new_memory(10), &cfg);
        let stored = [0.5f32, 0.5, 0.5, 0.5];
        // Differs at the 2nd decimal but rounds the same at 1 decimal.
        let probe = [0.53f32, 0.47, 0.5, 0.5];
        cache.store(&stored, ContentType::Comment, None, &result(70)).await;

        let (_, threshold) = cache
            .lookup(&probe, ContentType::Comment, None)
            .await
            .expect("test: loose hit");
        assert!(threshold < 0.95);
    }

    #[tokio::test]
    async fn test_primary_only_write_misses_looser_probe() {
        let cache = SemanticCache::new(CacheLayer::new_memory(10), &config());
        let stored = [0.5f32, 0.5, 0.5, 0.5];
        let probe = [0.53f32, 0.47, 0.5, 0.5];
        cache.store(&stored, ContentType::Comment, None, &result(70)).await;
        assert!(cache.lookup(&probe, ContentType::Comment, None).await.is_none());
    }

    #[test]
    fn test_applies_to_respects_min_length() {
        let cache = SemanticCache::new(CacheLayer::new_memory(10), &config());
        assert!(!cache.applies_to("short"));
        assert!(cache.applies_to("long enough"));
    }
}
