//! 하이브리드 검색기 - 비동기 서비스 표면
//!
//! `ChunkStore`와 `HybridRanker`는 동기(blocking) API입니다. `HybridRetriever`는
//! 각 호출을 tokio blocking 풀에서 실행하고, 지연 임베딩(backfill)을 조율합니다.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::config::EngineConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{Result, StoreError};

use super::library::{JsonFileLibraryConfigs, LibraryConfigCache, LibraryConfigSource};
use super::ranker::{HybridRanker, HybridSearchRequest, ScoredChunk};
use super::store::{Chunk, ChunkStore, IngestOutcome, IngestRequest, StoreStats};

/// 기본 백필 배치 크기
pub const DEFAULT_BACKFILL_BATCH: usize = 64;

// ============================================================================
// HybridRetriever
// ============================================================================

/// 하이브리드 검색기
///
/// 복제 비용이 낮으므로(`Arc`) 요청 핸들러마다 clone 해서 사용합니다.
#[derive(Clone)]
pub struct HybridRetriever {
    store: Arc<ChunkStore>,
    ranker: Arc<HybridRanker>,
}

impl HybridRetriever {
    /// 설정의 데이터 디렉토리로 생성 (라이브러리 설정은 `libraries.json`)
    pub fn open(config: &EngineConfig) -> Result<Self> {
        if !config.data_dir.exists() {
            std::fs::create_dir_all(&config.data_dir)?;
        }

        let source = Arc::new(JsonFileLibraryConfigs::new(config.libraries_path()));
        Self::with_source(&config.db_path(), source, config)
    }

    /// 임의의 라이브러리 설정 소스로 생성
    pub fn with_source(
        db_path: &Path,
        source: Arc<dyn LibraryConfigSource>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let cache = Arc::new(
            LibraryConfigCache::new(source, config.cache_ttl())
                .with_default_dimension(config.default_dimension),
        );
        let store = Arc::new(ChunkStore::open(db_path, cache)?);

        tracing::info!(
            "Hybrid retriever ready (db={:?}, metric={}, ttl={}s)",
            db_path,
            config.distance_metric,
            config.cache_ttl_secs
        );

        Ok(Self::new(store, config))
    }

    pub fn new(store: Arc<ChunkStore>, config: &EngineConfig) -> Self {
        let ranker = Arc::new(HybridRanker::new(Arc::clone(&store), config));
        Self { store, ranker }
    }

    /// 내부 스토어 접근
    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    /// 내부 라이브러리 설정 캐시 접근
    pub fn libraries(&self) -> &Arc<LibraryConfigCache> {
        self.store.libraries()
    }

    async fn run<T, F>(&self, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ChunkStore) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || task(&store))
            .await
            .map_err(|e| StoreError::TaskJoin(e.to_string()))?
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    pub async fn save(&self, chunk: Chunk) -> Result<i64> {
        self.run(move |store| store.save(&chunk)).await
    }

    /// 배치 저장 (전부 성공 또는 전부 롤백)
    pub async fn save_all(&self, chunks: Vec<Chunk>) -> Result<Vec<i64>> {
        self.run(move |store| store.save_all(&chunks)).await
    }

    pub async fn update_embedding_vector(&self, id: i64, vector: Vec<f32>) -> Result<()> {
        self.run(move |store| store.update_embedding_vector(id, &vector))
            .await
    }

    pub async fn ingest_document(&self, request: IngestRequest) -> Result<IngestOutcome> {
        self.run(move |store| store.ingest_document(request)).await
    }

    pub async fn count_by_document(&self, document_id: i64) -> Result<usize> {
        self.run(move |store| store.count_by_document(document_id))
            .await
    }

    /// 청크 삭제 (하위 청크 포함), 존재했는지 반환
    pub async fn delete(&self, id: i64) -> Result<bool> {
        self.run(move |store| store.delete(id)).await
    }

    pub async fn delete_by_document(&self, document_id: i64) -> Result<usize> {
        self.run(move |store| store.delete_by_document(document_id))
            .await
    }

    pub async fn find_pending_embeddings(
        &self,
        library_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Chunk>> {
        self.run(move |store| store.find_pending_embeddings(library_id, limit))
            .await
    }

    /// FTS5 인덱스 재구성, 색인된 청크 수 반환
    pub async fn rebuild_fts_index(&self) -> Result<usize> {
        self.run(|store| store.rebuild_fts_index()).await
    }

    // ------------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------------

    /// 하이브리드 검색 (`score_semantic`, `score_text`, `score`가 메타데이터에 기록됨)
    pub async fn hybrid_search(&self, request: HybridSearchRequest) -> Result<Vec<Chunk>> {
        let ranker = Arc::clone(&self.ranker);
        tokio::task::spawn_blocking(move || ranker.search(&request))
            .await
            .map_err(|e| StoreError::TaskJoin(e.to_string()))?
    }

    /// 하이브리드 검색 (순위/점수 구조체)
    pub async fn hybrid_search_scored(
        &self,
        request: HybridSearchRequest,
    ) -> Result<Vec<ScoredChunk>> {
        let ranker = Arc::clone(&self.ranker);
        tokio::task::spawn_blocking(move || ranker.search_scored(&request))
            .await
            .map_err(|e| StoreError::TaskJoin(e.to_string()))?
    }

    // ------------------------------------------------------------------------
    // Deferred embedding
    // ------------------------------------------------------------------------

    /// 벡터가 없는 청크를 배치 단위로 임베딩
    ///
    /// 프로바이더 호출은 배치마다 한 번입니다. 실패하면 즉시 중단하고 에러를 반환하며,
    /// 이미 기록된 벡터는 유지됩니다. 반환값은 임베딩된 청크 수입니다.
    pub async fn backfill_embeddings(
        &self,
        provider: &dyn EmbeddingProvider,
        library_id: Option<i64>,
        batch_size: usize,
    ) -> Result<usize> {
        if batch_size == 0 {
            return Err(StoreError::invalid("batch_size must be positive"));
        }

        let mut embedded = 0;

        loop {
            let pending = self
                .run(move |store| store.find_pending_embeddings(library_id, batch_size))
                .await?;
            if pending.is_empty() {
                break;
            }

            let texts: Vec<String> = pending.iter().map(|c| c.text.clone()).collect();
            let vectors = provider.embed_batch(&texts).await?;

            if vectors.len() != pending.len() {
                return Err(StoreError::Embedding {
                    provider: provider.name().to_string(),
                    message: format!(
                        "returned {} vectors for {} texts",
                        vectors.len(),
                        pending.len()
                    ),
                });
            }

            let updates: Vec<(i64, Vec<f32>)> = pending
                .iter()
                .filter_map(|c| c.id)
                .zip(vectors)
                .collect();

            let written = self
                .run(move |store| {
                    for (id, vector) in &updates {
                        store.update_embedding_vector(*id, vector)?;
                    }
                    Ok(updates.len())
                })
                .await?;

            embedded += written;
            tracing::info!(
                "Embedded {} chunks with {} ({} total)",
                written,
                provider.name(),
                embedded
            );

            if pending.len() < batch_size {
                break;
            }
        }

        Ok(embedded)
    }

    /// 저장소 통계
    pub async fn stats(&self) -> Result<HybridStats> {
        let store_stats = self.run(|store| store.stats()).await?;
        let pending_count = store_stats.chunk_count - store_stats.embedded_count;

        Ok(HybridStats {
            store: store_stats,
            pending_count,
        })
    }
}

/// 하이브리드 저장소 통계
#[derive(Debug, Clone, Serialize)]
pub struct HybridStats {
    #[serde(flatten)]
    pub store: StoreStats,
    /// 임베딩 대기 청크 수
    pub pending_count: usize,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedding;
    use crate::knowledge::library::{LibraryConfig, StaticLibraryConfigs};
    use crate::knowledge::store::ChunkKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn create_retriever(configs: Vec<LibraryConfig>) -> (TempDir, HybridRetriever) {
        let dir = TempDir::new().unwrap();
        let retriever = HybridRetriever::with_source(
            &dir.path().join("test.db"),
            Arc::new(StaticLibraryConfigs::new(configs)),
            &EngineConfig::default(),
        )
        .unwrap();
        (dir, retriever)
    }

    fn chunks(document_id: i64, count: usize) -> Vec<Chunk> {
        (0..count)
            .map(|i| {
                Chunk::new(1, document_id, ChunkKind::Chunk, format!("paragraph {} about tokio", i))
                    .with_order(i as i32)
            })
            .collect()
    }

    /// 호출 횟수를 세고 N번째 배치에서 실패하는 프로바이더
    struct CountingProvider {
        calls: AtomicUsize,
        fail_on_call: Option<usize>,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on_call == Some(call) {
                return Err(StoreError::Embedding {
                    provider: self.name().to_string(),
                    message: "quota exceeded".to_string(),
                });
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }

        fn dimension(&self) -> usize {
            2
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_save_all_then_count() {
        let (_dir, retriever) = create_retriever(vec![LibraryConfig::new(1, 4)]);

        let ids = retriever.save_all(chunks(42, 5)).await.unwrap();
        assert_eq!(ids.len(), 5);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(retriever.count_by_document(42).await.unwrap(), 5);

        assert_eq!(retriever.delete_by_document(42).await.unwrap(), 5);
        assert_eq!(retriever.count_by_document(42).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_backfill_embeds_all_pending() {
        let (_dir, retriever) = create_retriever(vec![LibraryConfig::new(1, 4)]);
        retriever.save_all(chunks(1, 5)).await.unwrap();

        let provider = CountingProvider {
            calls: AtomicUsize::new(0),
            fail_on_call: None,
        };
        let embedded = retriever
            .backfill_embeddings(&provider, Some(1), 2)
            .await
            .unwrap();

        assert_eq!(embedded, 5);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);

        let stats = retriever.stats().await.unwrap();
        assert_eq!(stats.store.embedded_count, 5);
        assert_eq!(stats.pending_count, 0);

        // 2차원 벡터가 라이브러리 차원(4)으로 보정되어 저장됨
        let chunk = retriever.store().list_by_document(1).unwrap().remove(0);
        assert_eq!(chunk.vector, Some(vec![1.0, 0.0, 0.0, 0.0]));
    }

    #[tokio::test]
    async fn test_backfill_stops_on_provider_failure() {
        let (_dir, retriever) = create_retriever(vec![LibraryConfig::new(1, 2)]);
        retriever.save_all(chunks(1, 4)).await.unwrap();

        let provider = CountingProvider {
            calls: AtomicUsize::new(0),
            fail_on_call: Some(2),
        };
        let err = retriever
            .backfill_embeddings(&provider, None, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Embedding { .. }));

        let stats = retriever.stats().await.unwrap();
        assert_eq!(stats.store.embedded_count, 2);
        assert_eq!(stats.pending_count, 2);
    }

    #[tokio::test]
    async fn test_backfill_rejects_zero_batch() {
        let (_dir, retriever) = create_retriever(vec![]);
        let provider = HashingEmbedding::new(8);
        let err = retriever
            .backfill_embeddings(&provider, None, 0)
            .await
            .unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[tokio::test]
    async fn test_hybrid_search_after_backfill() {
        let (_dir, retriever) = create_retriever(vec![LibraryConfig::new(1, 64)]);

        retriever
            .save_all(vec![
                Chunk::new(1, 1, ChunkKind::Chunk, "tokio async runtime internals"),
                Chunk::new(1, 1, ChunkKind::Chunk, "sourdough bread baking"),
                Chunk::new(1, 2, ChunkKind::Summary, "async runtime comparison"),
            ])
            .await
            .unwrap();

        let provider = HashingEmbedding::new(64);
        assert_eq!(
            retriever
                .backfill_embeddings(&provider, Some(1), DEFAULT_BACKFILL_BATCH)
                .await
                .unwrap(),
            3
        );

        let query_vector = provider.embed("tokio async runtime").await.unwrap();
        let results = retriever
            .hybrid_search(
                HybridSearchRequest::new(vec![1])
                    .with_vector(query_vector)
                    .with_text("tokio runtime")
                    .with_k(2),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].text, "tokio async runtime internals");
        assert!(results[0].metadata.contains_key("score"));
        assert!(results[0].metadata.contains_key("score_semantic"));
    }

    #[tokio::test]
    async fn test_invalid_search_surfaces_error() {
        let (_dir, retriever) = create_retriever(vec![]);
        let err = retriever
            .hybrid_search_scored(HybridSearchRequest::new(vec![1]))
            .await
            .unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[tokio::test]
    async fn test_ingest_duplicate_through_retriever() {
        let (_dir, retriever) = create_retriever(vec![]);

        let request = |document_id: i64| IngestRequest {
            library_id: 1,
            document_id,
            content: "same body".to_string(),
            source_url: None,
            chunks: chunks(document_id, 2),
            overwrite: false,
        };

        assert!(matches!(
            retriever.ingest_document(request(1)).await.unwrap(),
            IngestOutcome::Inserted { .. }
        ));
        assert_eq!(
            retriever.ingest_document(request(2)).await.unwrap(),
            IngestOutcome::Duplicate { existing_document_id: 1 }
        );
    }

    #[tokio::test]
    async fn test_maintenance_wrappers() {
        let (_dir, retriever) = create_retriever(vec![LibraryConfig::new(1, 4)]);
        let ids = retriever.save_all(chunks(7, 3)).await.unwrap();

        let pending = retriever.find_pending_embeddings(Some(1), 10).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert!(retriever.find_pending_embeddings(Some(2), 10).await.unwrap().is_empty());

        assert_eq!(retriever.rebuild_fts_index().await.unwrap(), 3);

        assert!(retriever.delete(ids[0]).await.unwrap());
        assert!(!retriever.delete(ids[0]).await.unwrap());
        assert_eq!(retriever.count_by_document(7).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_open_creates_data_dir() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("nested").join("data");
        let config = EngineConfig {
            data_dir: data_dir.clone(),
            ..EngineConfig::default()
        };

        let retriever = HybridRetriever::open(&config).unwrap();
        assert!(data_dir.join("chunks.db").exists());
        assert_eq!(retriever.stats().await.unwrap().store.chunk_count, 0);
    }
}
