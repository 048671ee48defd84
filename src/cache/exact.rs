//! Exact-content cache.
//!
//! The key is a SHA-256 over the normalized text, the content type and the
//! prompt version, so a new prompt version never reads verdicts produced
//! under an older one.

use sha2::{Digest, Sha256};

use super::CacheLayer;
use crate::normalize::normalize;
use crate::types::{AnalysisResult, ContentType};

/// Exact cache over a shared [`CacheLayer`].
#[derive(Clone)]
pub struct ExactCache {
    layer: CacheLayer,
    ttl_secs: u64,
}

impl ExactCache {
    /// Wrap `layer`; entries live for `ttl_secs`.
    pub fn new(layer: CacheLayer, ttl_secs: u64) -> Self {
        Self { layer, ttl_secs }
    }

    /// Cache key for a piece of content.
    pub fn key(text: &str, content_type: ContentType, prompt_version_id: Option<i64>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(normalize(text).as_bytes());
        hasher.update([0u8]);
        hasher.update(content_type.as_str().as_bytes());
        hasher.update([0u8]);
        if let Some(id) = prompt_version_id {
            hasher.update(id.to_be_bytes());
        }
        format!("exact:{}", hex::encode(hasher.finalize()))
    }

    /// Look up a stored result. Undecodable entries count as misses.
    pub async fn get(&self, key: &str) -> Option<AnalysisResult> {
        self.layer.get_json(key).await
    }

    /// Store `result` under `key`.
    pub async fn put(&self, key: &str, result: &AnalysisResult) {
        self.layer.put_json(key, result, self.ttl_secs).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DefaultTag, ResultSource};

    #[test]
    fn test_key_ignores_case_and_repetition() {
        let a = ExactCache::key("Great video!!!", ContentType::Comment, Some(1));
        let b = ExactCache::key("great   video!", ContentType::Comment, Some(1));
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_separates_type_and_version() {
        let base = ExactCache::key("nice", ContentType::Comment, Some(1));
        assert_ne!(base, ExactCache::key("nice", ContentType::Danmaku, Some(1)));
        assert_ne!(base, ExactCache::key("nice", ContentType::Comment, Some(2)));
        assert_ne!(base, ExactCache::key("nice", ContentType::Comment, None));
    }

    #[tokio::test]
    async fn test_put_then_get_returns_result() {
        let cache = ExactCache::new(CacheLayer::new_memory(10), 60);
        let key = ExactCache::key("hello there", ContentType::Comment, None);
        let mut result = AnalysisResult::default_tagged(DefaultTag::LlmOff, None);
        result.source = ResultSource::CloudLlm;
        result.score = 77;

        cache.put(&key, &result).await;
        let back = cache.get(&key).await.expect("test: hit");
        assert_eq!(back.score, 77);
        assert_eq!(back.source, ResultSource::CloudLlm);
    }

    #[tokio::test]
    async fn test_garbage_entry_is_a_miss() {
        let layer = CacheLayer::new_memory(10);
        layer.setex("exact:bad", "not json", 60).await;
        let cache = ExactCache::new(layer, 60);
        assert!(cache.get("exact:bad").await.is_none());
    }
}
