//! 엔진 설정
//!
//! 기본값 → `PALANK_*` 환경변수 → CLI 인자 순서로 덮어씁니다.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::knowledge::{DistanceMetric, DEFAULT_EMBEDDING_DIMENSION};

/// 기본 캐시 TTL (30분)
pub const DEFAULT_CACHE_TTL_SECS: u64 = 30 * 60;

/// 기본 결과 개수
pub const DEFAULT_K: usize = 10;

/// 기본 가중치 (시맨틱 0.6 / 키워드 0.4)
pub const DEFAULT_SEMANTIC_WEIGHT: f64 = 0.6;
pub const DEFAULT_TEXTUAL_WEIGHT: f64 = 0.4;

/// 데이터 디렉토리 경로 (~/.palank-retrieval/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".palank-retrieval")
}

/// 검색 엔진 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// DB와 라이브러리 설정 파일이 위치하는 디렉토리
    pub data_dir: PathBuf,
    /// 라이브러리 설정 캐시 TTL (초)
    pub cache_ttl_secs: u64,
    pub default_k: usize,
    pub default_semantic_weight: f64,
    pub default_textual_weight: f64,
    /// 라이브러리 설정이 없을 때 사용할 임베딩 차원
    pub default_dimension: usize,
    pub distance_metric: DistanceMetric,
    /// 키워드 검색식을 OR로 확장할지 여부
    pub broaden_queries: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: get_data_dir(),
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            default_k: DEFAULT_K,
            default_semantic_weight: DEFAULT_SEMANTIC_WEIGHT,
            default_textual_weight: DEFAULT_TEXTUAL_WEIGHT,
            default_dimension: DEFAULT_EMBEDDING_DIMENSION,
            distance_metric: DistanceMetric::Cosine,
            broaden_queries: true,
        }
    }
}

impl EngineConfig {
    /// 기본값에 환경변수를 덮어쓴 설정
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// 키 조회 함수로 값을 덮어씁니다 (테스트에서 환경변수 대신 사용)
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = get("PALANK_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = get("PALANK_CACHE_TTL_SECS") {
            self.cache_ttl_secs = parse_value("PALANK_CACHE_TTL_SECS", &v)?;
        }
        if let Some(v) = get("PALANK_DEFAULT_K") {
            self.default_k = parse_value("PALANK_DEFAULT_K", &v)?;
        }
        if let Some(v) = get("PALANK_SEMANTIC_WEIGHT") {
            self.default_semantic_weight = parse_value("PALANK_SEMANTIC_WEIGHT", &v)?;
        }
        if let Some(v) = get("PALANK_TEXTUAL_WEIGHT") {
            self.default_textual_weight = parse_value("PALANK_TEXTUAL_WEIGHT", &v)?;
        }
        if let Some(v) = get("PALANK_DEFAULT_DIMENSION") {
            self.default_dimension = parse_value("PALANK_DEFAULT_DIMENSION", &v)?;
        }
        if let Some(v) = get("PALANK_DISTANCE") {
            self.distance_metric = v.parse()?;
        }
        if let Some(v) = get("PALANK_BROADEN_QUERIES") {
            self.broaden_queries = parse_value("PALANK_BROADEN_QUERIES", &v)?;
        }

        self.validate()?;
        tracing::debug!("Engine config: {:?}", self);
        Ok(self)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// DB 파일 경로
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chunks.db")
    }

    /// 라이브러리 설정 파일 경로
    pub fn libraries_path(&self) -> PathBuf {
        self.data_dir.join("libraries.json")
    }

    fn validate(&self) -> Result<()> {
        if self.default_k == 0 {
            return Err(StoreError::Config("default_k must be positive".to_string()));
        }
        if self.default_dimension == 0 {
            return Err(StoreError::Config(
                "default_dimension must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| StoreError::Config(format!("{}: cannot parse '{}'", key, raw)))
}
