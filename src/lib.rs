//! palank-retrieval - 멀티 테넌트 임베딩 저장소 + 하이브리드 검색 엔진
//!
//! SQLite FTS5 키워드 검색과 벡터 거리 검색을 가중 순위 융합으로 결합합니다.
//! 라이브러리(테넌트)마다 임베딩 차원과 검색 가중치가 다를 수 있으며,
//! 저장/조회되는 벡터는 항상 라이브러리 차원으로 보정됩니다.

pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod knowledge;

// Re-exports
pub use config::{get_data_dir, EngineConfig};
pub use embedding::{EmbeddingProvider, HashingEmbedding};
pub use error::{Result, StoreError};
pub use knowledge::{
    Chunk, ChunkKind, ChunkStore, DistanceMetric, HybridRanker, HybridRetriever,
    HybridSearchRequest, HybridStats, IngestOutcome, IngestRequest, LibraryConfig,
    LibraryConfigCache, LibraryConfigSource, QueryNormalizer, ScoredChunk, SearchMethod,
    SearchWeights,
};
