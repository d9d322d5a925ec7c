//! Knowledge 모듈 - 임베딩 저장소 + 하이브리드 검색 엔진
//!
//! - Store: SQLite 청크 저장 + FTS5 키워드 인덱스 + 벡터 거리 함수
//! - Library: 라이브러리별 차원/가중치 TTL 캐시
//! - Query: 자유 텍스트 → FTS5 검색식 (OR 확장)
//! - Ranker: 시맨틱/키워드 순위 가중 융합
//! - Hybrid: tokio 기반 비동기 검색기 + 임베딩 백필

mod checksum;
mod hybrid;
mod library;
mod query;
mod ranker;
mod store;
mod vector;

// Re-exports
pub use checksum::{content_checksum, is_valid_checksum, text_checksum, CHECKSUM_KEY, SOURCE_URL_KEY};
pub use hybrid::{HybridRetriever, HybridStats, DEFAULT_BACKFILL_BATCH};
pub use library::{
    JsonFileLibraryConfigs, LibraryConfig, LibraryConfigCache, LibraryConfigSource,
    SearchWeights, StaticLibraryConfigs,
};
pub use query::{LexicalExpressionEngine, LexicalQuery, QueryNormalizer, WebSearchSyntax};
pub use ranker::{
    annotated_score, fuse, reciprocal_rank, HybridRanker, HybridSearchRequest, ScoredChunk,
    SearchMethod, SCORE_KEY, SCORE_SEMANTIC_KEY, SCORE_TEXT_KEY,
};
pub use store::{
    Chunk, ChunkKind, ChunkStore, IngestOutcome, IngestRequest, Metadata, RankedChunk,
    StoreStats,
};
pub use vector::{
    cosine_distance, cosine_similarity, l2_distance, l2_norm, l2_normalize, parse_vector,
    repair_optional, repair_vector, vector_from_blob, vector_to_blob, DistanceMetric,
    DEFAULT_EMBEDDING_DIMENSION,
};
