//! 하이브리드 랭커 - 시맨틱 + 키워드 순위 가중 융합
//!
//! 두 후보 목록(각 2k개)의 순위를 `1 / (k + rank)` 점수로 바꾸고, 청크 id로
//! outer join 한 뒤 `score_semantic * ws + score_text * wt`로 정렬합니다.
//!
//! ref: https://www.elastic.co/blog/hybrid-search-rrf

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::config::EngineConfig;
use crate::error::{Result, StoreError};

use super::library::SearchWeights;
use super::query::{LexicalQuery, QueryNormalizer};
use super::store::{Chunk, ChunkStore, RankedChunk};
use super::vector::DistanceMetric;

/// 결과 청크 메타데이터의 점수 키
pub const SCORE_SEMANTIC_KEY: &str = "score_semantic";
pub const SCORE_TEXT_KEY: &str = "score_text";
pub const SCORE_KEY: &str = "score";

// ============================================================================
// Types
// ============================================================================

/// 하이브리드 검색 요청
#[derive(Debug, Clone, Default)]
pub struct HybridSearchRequest {
    pub query_vector: Option<Vec<f32>>,
    pub query_text: Option<String>,
    pub library_ids: Vec<i64>,
    /// 결과 개수 (None이면 설정 기본값)
    pub k: Option<usize>,
    /// None이면 라이브러리 설정 → 엔진 기본값
    pub weights: Option<SearchWeights>,
    /// None이면 엔진 설정(`broaden_queries`)
    pub broaden: Option<bool>,
}

impl HybridSearchRequest {
    pub fn new(library_ids: impl Into<Vec<i64>>) -> Self {
        Self {
            library_ids: library_ids.into(),
            ..Self::default()
        }
    }

    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.query_vector = Some(vector);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.query_text = Some(text.into());
        self
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }

    pub fn with_weights(mut self, semantic: f64, textual: f64) -> Self {
        self.weights = Some(SearchWeights::new(semantic, textual));
        self
    }

    /// OR 확장 없이 정확도 우선
    pub fn narrow(mut self) -> Self {
        self.broaden = Some(false);
        self
    }
}

/// 검색 방법
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    /// 벡터 후보에만 포함
    Semantic,
    /// 키워드 후보에만 포함
    Lexical,
    /// 양쪽 모두 포함
    Hybrid,
}

/// 융합 점수가 매겨진 청크
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub rank_semantic: Option<usize>,
    pub rank_text: Option<usize>,
    pub score_semantic: f64,
    pub score_text: f64,
    pub score: f64,
}

impl ScoredChunk {
    fn id(&self) -> i64 {
        self.chunk.id.unwrap_or_default()
    }

    pub fn method(&self) -> SearchMethod {
        match (self.rank_semantic.is_some(), self.rank_text.is_some()) {
            (true, false) => SearchMethod::Semantic,
            (false, true) => SearchMethod::Lexical,
            _ => SearchMethod::Hybrid,
        }
    }

    /// 점수를 메타데이터에 기록한 청크
    pub fn into_annotated(mut self) -> Chunk {
        let metadata = &mut self.chunk.metadata;
        metadata.insert(SCORE_SEMANTIC_KEY.to_string(), self.score_semantic.into());
        metadata.insert(SCORE_TEXT_KEY.to_string(), self.score_text.into());
        metadata.insert(SCORE_KEY.to_string(), self.score.into());
        self.chunk
    }
}

/// 메타데이터의 점수 읽기
///
/// 값이 없거나 숫자가 아니면 0.0 (debug 로그만 남김).
pub fn annotated_score(chunk: &Chunk, key: &str) -> f64 {
    match chunk.metadata.get(key).and_then(|v| v.as_f64()) {
        Some(score) => score,
        None => {
            tracing::debug!("Chunk {:?} has no '{}' annotation, using 0.0", chunk.id, key);
            0.0
        }
    }
}

// ============================================================================
// Fusion
// ============================================================================

/// 순위 → 점수 (`1 / (k + rank)`, rank는 1부터)
pub fn reciprocal_rank(k: usize, rank: usize) -> f64 {
    1.0 / (k as f64 + rank as f64)
}

/// 두 후보 목록 융합
///
/// 한쪽에만 있는 청크는 다른 쪽 점수가 0.0입니다.
/// 점수 내림차순, 동점은 id 오름차순으로 정렬한 뒤 `k`개로 자릅니다.
pub fn fuse(
    semantic: Vec<RankedChunk>,
    lexical: Vec<RankedChunk>,
    k: usize,
    weights: SearchWeights,
) -> Vec<ScoredChunk> {
    let mut merged: HashMap<i64, ScoredChunk> = HashMap::new();

    for candidate in semantic {
        let Some(id) = candidate.chunk.id else { continue };
        let entry = merged.entry(id).or_insert_with(|| blank(candidate.chunk));
        entry.rank_semantic = Some(candidate.rank);
        entry.score_semantic = reciprocal_rank(k, candidate.rank);
    }

    for candidate in lexical {
        let Some(id) = candidate.chunk.id else { continue };
        let entry = merged.entry(id).or_insert_with(|| blank(candidate.chunk));
        entry.rank_text = Some(candidate.rank);
        entry.score_text = reciprocal_rank(k, candidate.rank);
    }

    let mut results: Vec<ScoredChunk> = merged
        .into_values()
        .map(|mut scored| {
            scored.score =
                scored.score_semantic * weights.semantic + scored.score_text * weights.textual;
            scored
        })
        .collect();

    results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id().cmp(&b.id())));
    results.truncate(k);
    results
}

fn blank(chunk: Chunk) -> ScoredChunk {
    ScoredChunk {
        chunk,
        rank_semantic: None,
        rank_text: None,
        score_semantic: 0.0,
        score_text: 0.0,
        score: 0.0,
    }
}

// ============================================================================
// HybridRanker
// ============================================================================

/// 동기 하이브리드 랭커
///
/// 입력 검증은 모두 I/O 전에 끝납니다.
pub struct HybridRanker {
    store: Arc<ChunkStore>,
    normalizer: QueryNormalizer,
    default_k: usize,
    default_weights: SearchWeights,
    metric: DistanceMetric,
    broaden: bool,
}

impl HybridRanker {
    pub fn new(store: Arc<ChunkStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            normalizer: QueryNormalizer::default(),
            default_k: config.default_k,
            default_weights: SearchWeights::new(
                config.default_semantic_weight,
                config.default_textual_weight,
            ),
            metric: config.distance_metric,
            broaden: config.broaden_queries,
        }
    }

    pub fn with_normalizer(mut self, normalizer: QueryNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    /// 하이브리드 검색 (점수 정보 포함)
    pub fn search_scored(&self, request: &HybridSearchRequest) -> Result<Vec<ScoredChunk>> {
        let k = request.k.unwrap_or(self.default_k);
        if k == 0 {
            return Err(StoreError::invalid("k must be positive"));
        }
        if request.library_ids.is_empty() {
            return Err(StoreError::invalid("At least one library id is required"));
        }
        if request.query_vector.is_none() && request.query_text.is_none() {
            return Err(StoreError::invalid(
                "Either a query vector or query text is required",
            ));
        }
        if matches!(&request.query_vector, Some(v) if v.is_empty()) {
            return Err(StoreError::invalid("Query vector is empty"));
        }

        let lexical_query = request
            .query_text
            .as_deref()
            .map(|text| {
                self.normalizer
                    .normalize(text, request.broaden.unwrap_or(self.broaden))
            })
            .transpose()?;

        let weights = self.resolve_weights(request);
        let limit = k.saturating_mul(2);

        let semantic = match &request.query_vector {
            Some(vector) => {
                self.store
                    .semantic_candidates(vector, &request.library_ids, limit, self.metric)?
            }
            None => Vec::new(),
        };

        let lexical = match &lexical_query {
            Some(LexicalQuery {
                expression: Some(expression),
                degraded,
                ..
            }) => {
                if *degraded {
                    tracing::warn!("Lexical query degraded to phrase: {}", expression);
                }
                self.store
                    .lexical_candidates(expression, &request.library_ids, limit)?
            }
            Some(query) => {
                tracing::debug!(
                    "No positive terms in '{}', skipping lexical candidates",
                    query.cleaned
                );
                Vec::new()
            }
            None => Vec::new(),
        };

        let (semantic_count, lexical_count) = (semantic.len(), lexical.len());
        let results = fuse(semantic, lexical, k, weights);

        tracing::debug!(
            "Hybrid search: semantic={}, lexical={}, fused={} (k={}, ws={}, wt={})",
            semantic_count,
            lexical_count,
            results.len(),
            k,
            weights.semantic,
            weights.textual
        );

        Ok(results)
    }

    /// 하이브리드 검색 (점수를 메타데이터에 기록한 청크)
    pub fn search(&self, request: &HybridSearchRequest) -> Result<Vec<Chunk>> {
        Ok(self
            .search_scored(request)?
            .into_iter()
            .map(ScoredChunk::into_annotated)
            .collect())
    }

    /// 요청 → 첫 번째로 설정이 있는 라이브러리 → 엔진 기본값
    fn resolve_weights(&self, request: &HybridSearchRequest) -> SearchWeights {
        if let Some(weights) = request.weights {
            return weights;
        }
        let libraries = self.store.libraries();
        request
            .library_ids
            .iter()
            .find_map(|id| libraries.weights_for(*id))
            .unwrap_or(self.default_weights)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::library::{LibraryConfig, LibraryConfigCache, StaticLibraryConfigs};
    use crate::knowledge::store::ChunkKind;
    use std::time::Duration;
    use tempfile::TempDir;

    fn candidate(id: i64, rank: usize) -> RankedChunk {
        let mut chunk = Chunk::new(1, 1, ChunkKind::Chunk, format!("chunk {}", id));
        chunk.id = Some(id);
        RankedChunk {
            chunk,
            rank,
            raw_score: rank as f64,
        }
    }

    fn ids(results: &[ScoredChunk]) -> Vec<i64> {
        results.iter().map(|r| r.chunk.id.unwrap()).collect()
    }

    fn create_ranker(configs: Vec<LibraryConfig>) -> (TempDir, HybridRanker) {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(LibraryConfigCache::new(
            Arc::new(StaticLibraryConfigs::new(configs)),
            Duration::from_secs(60),
        ));
        let store = Arc::new(ChunkStore::open(&dir.path().join("test.db"), cache).unwrap());
        let ranker = HybridRanker::new(store, &EngineConfig::default());
        (dir, ranker)
    }

    #[test]
    fn test_reciprocal_rank() {
        assert!((reciprocal_rank(10, 1) - 1.0 / 11.0).abs() < 1e-12);
        assert!(reciprocal_rank(10, 1) > reciprocal_rank(10, 5));
    }

    #[test]
    fn test_fuse_outer_join() {
        let results = fuse(
            vec![candidate(1, 1), candidate(2, 2)],
            vec![candidate(2, 1), candidate(3, 2)],
            10,
            SearchWeights::new(0.5, 0.5),
        );

        assert_eq!(ids(&results), vec![2, 1, 3]);

        let both = &results[0];
        assert_eq!(both.method(), SearchMethod::Hybrid);
        assert_eq!(both.rank_semantic, Some(2));
        assert_eq!(both.rank_text, Some(1));
        let expected = 0.5 / 12.0 + 0.5 / 11.0;
        assert!((both.score - expected).abs() < 1e-12);

        assert_eq!(results[1].method(), SearchMethod::Semantic);
        assert_eq!(results[1].score_text, 0.0);
        assert_eq!(results[2].method(), SearchMethod::Lexical);
        assert_eq!(results[2].score_semantic, 0.0);
    }

    #[test]
    fn test_fuse_truncates_and_breaks_ties_by_id() {
        // 같은 순위 → 같은 점수 → id 순
        let results = fuse(
            vec![candidate(9, 1)],
            vec![candidate(4, 1), candidate(7, 2)],
            2,
            SearchWeights::new(0.5, 0.5),
        );
        assert_eq!(ids(&results), vec![4, 9]);
    }

    #[test]
    fn test_fusion_monotonic_in_semantic_weight() {
        let semantic = vec![candidate(1, 1), candidate(2, 3)];
        let lexical = vec![candidate(3, 1), candidate(4, 2)];

        let position = |ws: f64, id: i64| {
            let results = fuse(semantic.clone(), lexical.clone(), 10, SearchWeights::new(ws, 1.0 - ws));
            ids(&results).iter().position(|x| *x == id).unwrap()
        };

        for id in [1, 2] {
            let mut previous = usize::MAX;
            for step in 0..=10 {
                let current = position(step as f64 / 10.0, id);
                assert!(current <= previous, "id {} moved down at step {}", id, step);
                previous = current;
            }
        }

        assert_eq!(position(1.0, 1), 0);
        assert_eq!(position(0.0, 3), 0);
    }

    #[test]
    fn test_annotation_round_trip_and_default() {
        let scored = fuse(vec![candidate(1, 1)], vec![], 5, SearchWeights::semantic_only());
        let chunk = scored.into_iter().next().unwrap().into_annotated();

        assert!((annotated_score(&chunk, SCORE_SEMANTIC_KEY) - 1.0 / 6.0).abs() < 1e-12);
        assert_eq!(annotated_score(&chunk, SCORE_TEXT_KEY), 0.0);
        assert_eq!(annotated_score(&chunk, SCORE_KEY), annotated_score(&chunk, SCORE_SEMANTIC_KEY));

        let bare = Chunk::new(1, 1, ChunkKind::Chunk, "no scores");
        assert_eq!(annotated_score(&bare, SCORE_KEY), 0.0);
    }

    #[test]
    fn test_invalid_requests_fail_fast() {
        let (_dir, ranker) = create_ranker(vec![]);

        let cases = vec![
            HybridSearchRequest::new(vec![1]).with_text("cats").with_k(0),
            HybridSearchRequest::new(Vec::<i64>::new()).with_text("cats"),
            HybridSearchRequest::new(vec![1]),
            HybridSearchRequest::new(vec![1]).with_vector(vec![]),
            HybridSearchRequest::new(vec![1]).with_text("   "),
            HybridSearchRequest::new(vec![1]).with_text("?!"),
        ];

        for request in cases {
            let err = ranker.search(&request).unwrap_err();
            assert!(err.is_invalid_input(), "{:?} -> {}", request, err);
        }
    }

    #[test]
    fn test_semantic_nearest_ordering() {
        let (_dir, ranker) = create_ranker(vec![LibraryConfig::new(1, 4)]);
        let store = ranker.store();

        let first = store
            .save(&Chunk::new(1, 1, ChunkKind::Chunk, "first").with_vector(vec![1.0, 0.0, 0.0, 0.0]))
            .unwrap();
        store
            .save(&Chunk::new(1, 1, ChunkKind::Chunk, "second").with_vector(vec![0.0, 1.0, 0.0, 0.0]))
            .unwrap();
        let third = store
            .save(&Chunk::new(1, 1, ChunkKind::Chunk, "third").with_vector(vec![1.0, 1.0, 0.0, 0.0]))
            .unwrap();

        let request = HybridSearchRequest::new(vec![1])
            .with_vector(vec![1.0, 0.0, 0.0, 0.0])
            .with_k(2)
            .with_weights(1.0, 0.0);
        let results = ranker.search_scored(&request).unwrap();

        assert_eq!(ids(&results), vec![first, third]);
        assert!(results.iter().all(|r| r.method() == SearchMethod::Semantic));
    }

    #[test]
    fn test_text_only_matches_lexical_order() {
        let (_dir, ranker) = create_ranker(vec![]);
        let store = ranker.store();

        let texts = [
            "rust rust rust memory safety",
            "rust ownership",
            "a long note about gardening that mentions rust only once at the very end rust",
            "python scripting",
            "rust",
        ];
        for text in texts {
            store.save(&Chunk::new(1, 1, ChunkKind::Chunk, text)).unwrap();
        }

        let request = HybridSearchRequest::new(vec![1])
            .with_text("rust")
            .with_k(3)
            .with_weights(0.0, 1.0);
        let results = ranker.search(&request).unwrap();

        let lexical = store.lexical_candidates("\"rust\"", &[1], 6).unwrap();
        let expected: Vec<_> = lexical.iter().take(3).map(|c| c.chunk.id).collect();
        let actual: Vec<_> = results.iter().map(|c| c.id).collect();
        assert_eq!(actual, expected);

        assert!(annotated_score(&results[0], SCORE_KEY) >= annotated_score(&results[1], SCORE_KEY));
        assert_eq!(annotated_score(&results[0], SCORE_SEMANTIC_KEY), 0.0);
    }

    #[test]
    fn test_hybrid_boosts_chunks_in_both_lists() {
        let (_dir, ranker) = create_ranker(vec![LibraryConfig::new(1, 2)]);
        let store = ranker.store();

        let text_only = store
            .save(&Chunk::new(1, 1, ChunkKind::Chunk, "tokio scheduler"))
            .unwrap();
        let both = store
            .save(&Chunk::new(1, 1, ChunkKind::Chunk, "tokio runtime").with_vector(vec![1.0, 0.0]))
            .unwrap();
        store
            .save(&Chunk::new(1, 1, ChunkKind::Chunk, "bread").with_vector(vec![0.0, 1.0]))
            .unwrap();

        let request = HybridSearchRequest::new(vec![1])
            .with_vector(vec![1.0, 0.0])
            .with_text("tokio")
            .with_k(3);
        let results = ranker.search_scored(&request).unwrap();

        assert_eq!(results[0].chunk.id, Some(both));
        assert_eq!(results[0].method(), SearchMethod::Hybrid);
        assert!(results.iter().any(|r| r.chunk.id == Some(text_only)));
    }

    #[test]
    fn test_weights_resolution() {
        let (_dir, ranker) = create_ranker(vec![LibraryConfig::new(2, 4).with_weights(0.9, 0.1)]);

        let explicit = HybridSearchRequest::new(vec![2]).with_weights(0.3, 0.7);
        assert_eq!(ranker.resolve_weights(&explicit), SearchWeights::new(0.3, 0.7));

        let from_library = HybridSearchRequest::new(vec![5, 2]);
        assert_eq!(ranker.resolve_weights(&from_library), SearchWeights::new(0.9, 0.1));

        let fallback = HybridSearchRequest::new(vec![5]);
        assert_eq!(ranker.resolve_weights(&fallback), SearchWeights::default());
    }

    #[test]
    fn test_search_scoped_to_libraries() {
        let (_dir, ranker) = create_ranker(vec![]);
        let store = ranker.store();

        store.save(&Chunk::new(1, 1, ChunkKind::Chunk, "shared term")).unwrap();
        let other = store.save(&Chunk::new(2, 2, ChunkKind::Chunk, "shared term")).unwrap();

        let results = ranker
            .search_scored(&HybridSearchRequest::new(vec![2]).with_text("shared"))
            .unwrap();
        assert_eq!(ids(&results), vec![other]);
    }

    #[test]
    fn test_large_k_is_bounded_by_rows() {
        let (_dir, ranker) = create_ranker(vec![LibraryConfig::new(1, 2)]);
        let store = ranker.store();

        for text in ["alpha one", "alpha two", "alpha three"] {
            store
                .save(&Chunk::new(1, 1, ChunkKind::Chunk, text).with_vector(vec![1.0, 0.0]))
                .unwrap();
        }

        let request = HybridSearchRequest::new(vec![1])
            .with_vector(vec![1.0, 0.0])
            .with_text("alpha")
            .with_k(usize::MAX);
        let results = ranker.search_scored(&request).unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.method() == SearchMethod::Hybrid));
    }

    #[test]
    fn test_exclusion_only_text_never_returns_excluded() {
        let (_dir, ranker) = create_ranker(vec![]);
        let store = ranker.store();

        store.save(&Chunk::new(1, 1, ChunkKind::Chunk, "cats sleep")).unwrap();
        store.save(&Chunk::new(1, 1, ChunkKind::Chunk, "dogs bark")).unwrap();

        for text in ["-dogs", "NOT dogs"] {
            let results = ranker
                .search(&HybridSearchRequest::new(vec![1]).with_text(text))
                .unwrap();
            assert!(
                results.iter().all(|c| !c.text.contains("dogs")),
                "{} -> {:?}",
                text,
                results
            );
        }

        let results = ranker
            .search(&HybridSearchRequest::new(vec![1]).with_text("cats -dogs"))
            .unwrap();
        let texts: Vec<_> = results.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["cats sleep"]);
    }
}
