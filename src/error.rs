//! 에러 타입 - 검색 엔진 공통 에러
//!
//! 라이브러리 API는 `StoreError`를 반환하고, CLI는 anyhow로 감싸서 사용합니다.

use thiserror::Error;

/// 저장소/검색 엔진 에러
#[derive(Debug, Error)]
pub enum StoreError {
    /// 잘못된 입력 (I/O 전에 즉시 실패)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// 대상 청크가 없음
    #[error("Chunk not found: id={0}")]
    NotFound(i64),

    /// SQLite 연결/쿼리 실패
    #[error("Storage failure in {operation} ({context}): {source}")]
    Storage {
        operation: &'static str,
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    /// 배치 삽입 실패 - 트랜잭션 전체가 롤백됨
    #[error("Batch insert rolled back at row {index} of {total}: {source}")]
    BatchFailed {
        index: usize,
        total: usize,
        #[source]
        source: Box<StoreError>,
    },

    /// 메타데이터 JSON 직렬화 실패
    #[error("Metadata serialization failed: {0}")]
    Metadata(#[from] serde_json::Error),

    /// 라이브러리 설정 소스 에러
    #[error("Library config unavailable: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// 외부 임베딩 프로바이더 실패
    #[error("Embedding provider '{provider}' failed: {message}")]
    Embedding { provider: String, message: String },

    /// blocking 작업 join 실패
    #[error("Background task failed: {0}")]
    TaskJoin(String),

    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// rusqlite 결과에 작업 이름과 대상 id를 붙이는 확장 트레이트
pub trait StorageContext<T> {
    fn storage(self, operation: &'static str, context: impl Into<String>) -> Result<T>;

    fn storage_with<F, C>(self, operation: &'static str, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T> StorageContext<T> for std::result::Result<T, rusqlite::Error> {
    fn storage(self, operation: &'static str, context: impl Into<String>) -> Result<T> {
        self.map_err(|source| StoreError::Storage {
            operation,
            context: context.into(),
            source,
        })
    }

    fn storage_with<F, C>(self, operation: &'static str, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|source| StoreError::Storage {
            operation,
            context: context().into(),
            source,
        })
    }
}

impl StoreError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// 입력 검증 에러인지 (배치 실패의 원인 포함)
    pub fn is_invalid_input(&self) -> bool {
        match self {
            Self::InvalidInput(_) => true,
            Self::BatchFailed { source, .. } => source.is_invalid_input(),
            _ => false,
        }
    }
}
