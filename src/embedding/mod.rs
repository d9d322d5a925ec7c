//! 임베딩 모듈 - 텍스트 벡터화 프로바이더
//!
//! 검색 엔진은 임베딩 모델을 직접 호출하지 않습니다. 호출자가 `EmbeddingProvider`를
//! 구현해서 넘기면 `HybridRetriever::backfill_embeddings`가 벡터가 없는 청크를
//! 배치 단위로 채웁니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let provider = HashingEmbedding::new(384);
//! let embedded = retriever.backfill_embeddings(&provider, Some(1), 64).await?;
//! ```

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{Result, StoreError};
use crate::knowledge::l2_normalize;

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 텍스트를 벡터로 변환하는 인터페이스입니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 단일 텍스트 임베딩
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// 배치 임베딩 (기본 구현: 순차 호출)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Hashing Embedding (로컬, 결정적)
// ============================================================================

/// 토큰 해싱 기반 로컬 임베딩
///
/// 소문자 토큰마다 SHA-256으로 버킷과 부호를 정해 누적한 뒤 L2 정규화합니다.
/// 의미를 이해하지는 못하지만 같은 단어를 공유하는 텍스트끼리 가까워지므로
/// 오프라인 개발, CLI 백필, 테스트에 사용합니다.
#[derive(Debug, Clone)]
pub struct HashingEmbedding {
    dimension: usize,
}

impl HashingEmbedding {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]) as usize
                % self.dimension;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        l2_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.dimension == 0 {
            return Err(StoreError::Embedding {
                provider: self.name().to_string(),
                message: "dimension must be positive".to_string(),
            });
        }
        Ok(self.vectorize(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{cosine_similarity, l2_norm};

    #[tokio::test]
    async fn test_hashing_embedding_is_deterministic() {
        let provider = HashingEmbedding::new(64);
        let a = provider.embed("Rust borrow checker").await.unwrap();
        let b = provider.embed("rust BORROW checker").await.unwrap();

        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        assert!((l2_norm(&a) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_shared_words_are_closer() {
        let provider = HashingEmbedding::new(256);
        let vectors = provider
            .embed_batch(&[
                "tokio async runtime".to_string(),
                "the tokio runtime schedules tasks".to_string(),
                "sourdough bread recipe".to_string(),
            ])
            .await
            .unwrap();

        assert_eq!(vectors.len(), 3);
        let related = cosine_similarity(&vectors[0], &vectors[1]);
        let unrelated = cosine_similarity(&vectors[0], &vectors[2]);
        assert!(related > unrelated);
    }

    #[tokio::test]
    async fn test_zero_dimension_is_error() {
        let provider = HashingEmbedding::new(0);
        let err = provider.embed("anything").await.unwrap_err();
        assert!(err.to_string().contains("hashing"));
    }

    #[tokio::test]
    async fn test_punctuation_only_text_is_zero_vector() {
        let provider = HashingEmbedding::new(8);
        let v = provider.embed("?!").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }
}
