//! Library Config Cache - 라이브러리별 임베딩 차원/검색 가중치 캐시
//!
//! 청크를 읽고 쓸 때마다 설정을 조회하지 않도록 `library_id → LibraryConfig`를
//! TTL 동안 캐싱합니다. TTL이 지나면 다음 조회에서 전체 맵을 한 번에 다시 읽고
//! 통째로 교체하므로, 읽는 쪽은 부분적으로 갱신된 맵을 보지 않습니다.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_SEMANTIC_WEIGHT, DEFAULT_TEXTUAL_WEIGHT};
use crate::error::{Result, StoreError};

use super::vector::DEFAULT_EMBEDDING_DIMENSION;

// ============================================================================
// Types
// ============================================================================

/// 시맨틱/키워드 점수 가중치
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchWeights {
    pub semantic: f64,
    pub textual: f64,
}

impl SearchWeights {
    pub fn new(semantic: f64, textual: f64) -> Self {
        Self { semantic, textual }
    }

    /// 키워드 검색만 사용
    pub fn textual_only() -> Self {
        Self::new(0.0, 1.0)
    }

    /// 시맨틱 검색만 사용
    pub fn semantic_only() -> Self {
        Self::new(1.0, 0.0)
    }
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self::new(DEFAULT_SEMANTIC_WEIGHT, DEFAULT_TEXTUAL_WEIGHT)
    }
}

fn default_dimension() -> usize {
    DEFAULT_EMBEDDING_DIMENSION
}

fn default_semantic_weight() -> f64 {
    DEFAULT_SEMANTIC_WEIGHT
}

fn default_textual_weight() -> f64 {
    DEFAULT_TEXTUAL_WEIGHT
}

/// 라이브러리(테넌트) 검색 설정
///
/// 가중치 합계(1.0) 검증은 설정을 소유한 쪽의 책임이며 여기서는 다시 검증하지 않습니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryConfig {
    pub library_id: i64,
    #[serde(default = "default_dimension")]
    pub embedding_dimension: usize,
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_textual_weight")]
    pub textual_weight: f64,
}

impl LibraryConfig {
    pub fn new(library_id: i64, embedding_dimension: usize) -> Self {
        Self {
            library_id,
            embedding_dimension,
            semantic_weight: DEFAULT_SEMANTIC_WEIGHT,
            textual_weight: DEFAULT_TEXTUAL_WEIGHT,
        }
    }

    pub fn with_weights(mut self, semantic: f64, textual: f64) -> Self {
        self.semantic_weight = semantic;
        self.textual_weight = textual;
        self
    }

    pub fn weights(&self) -> SearchWeights {
        SearchWeights::new(self.semantic_weight, self.textual_weight)
    }
}

// ============================================================================
// LibraryConfigSource
// ============================================================================

/// 라이브러리 설정 원본 (외부 저장소)
///
/// 캐시 갱신 시 전체 목록을 한 번에 읽습니다.
pub trait LibraryConfigSource: Send + Sync {
    fn list_all(&self) -> Result<Vec<LibraryConfig>>;
}

/// 메모리 내 설정 소스
#[derive(Debug, Default)]
pub struct StaticLibraryConfigs {
    configs: RwLock<BTreeMap<i64, LibraryConfig>>,
}

impl StaticLibraryConfigs {
    pub fn new(configs: impl IntoIterator<Item = LibraryConfig>) -> Self {
        let configs = configs.into_iter().map(|c| (c.library_id, c)).collect();
        Self {
            configs: RwLock::new(configs),
        }
    }

    pub fn upsert(&self, config: LibraryConfig) {
        self.configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config.library_id, config);
    }

    pub fn remove(&self, library_id: i64) -> bool {
        self.configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&library_id)
            .is_some()
    }
}

impl LibraryConfigSource for StaticLibraryConfigs {
    fn list_all(&self) -> Result<Vec<LibraryConfig>> {
        let configs = self.configs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(configs.values().cloned().collect())
    }
}

/// JSON 파일 설정 소스 (`libraries.json`)
///
/// 파일이 없으면 빈 목록으로 취급합니다.
#[derive(Debug, Clone)]
pub struct JsonFileLibraryConfigs {
    path: PathBuf,
}

impl JsonFileLibraryConfigs {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 설정 추가 또는 교체
    pub fn upsert(&self, config: LibraryConfig) -> Result<()> {
        let mut configs = self.read_map()?;
        configs.insert(config.library_id, config);
        self.write_map(&configs)
    }

    /// 설정 삭제
    pub fn remove(&self, library_id: i64) -> Result<bool> {
        let mut configs = self.read_map()?;
        let removed = configs.remove(&library_id).is_some();
        if removed {
            self.write_map(&configs)?;
        }
        Ok(removed)
    }

    fn read_map(&self) -> Result<BTreeMap<i64, LibraryConfig>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let raw = std::fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let configs: Vec<LibraryConfig> = serde_json::from_str(&raw).map_err(|e| {
            StoreError::Config(format!("{}: {}", self.path.display(), e))
        })?;
        Ok(configs.into_iter().map(|c| (c.library_id, c)).collect())
    }

    fn write_map(&self, configs: &BTreeMap<i64, LibraryConfig>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let list: Vec<&LibraryConfig> = configs.values().collect();
        let json = serde_json::to_string_pretty(&list)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

impl LibraryConfigSource for JsonFileLibraryConfigs {
    fn list_all(&self) -> Result<Vec<LibraryConfig>> {
        Ok(self.read_map()?.into_values().collect())
    }
}

// ============================================================================
// LibraryConfigCache
// ============================================================================

#[derive(Clone)]
struct Snapshot {
    configs: Arc<HashMap<i64, LibraryConfig>>,
    refreshed_at: Option<Instant>,
}

/// TTL 기반 라이브러리 설정 캐시
///
/// 읽기는 `RwLock` read guard에서 `Arc` 맵을 복제해 가져가므로 서로 막지 않습니다.
/// 갱신은 `refresh_lock`으로 한 번에 하나만 수행됩니다.
pub struct LibraryConfigCache {
    source: Arc<dyn LibraryConfigSource>,
    ttl: Duration,
    default_dimension: usize,
    snapshot: RwLock<Snapshot>,
    refresh_lock: Mutex<()>,
}

impl LibraryConfigCache {
    pub fn new(source: Arc<dyn LibraryConfigSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            default_dimension: DEFAULT_EMBEDDING_DIMENSION,
            snapshot: RwLock::new(Snapshot {
                configs: Arc::new(HashMap::new()),
                refreshed_at: None,
            }),
            refresh_lock: Mutex::new(()),
        }
    }

    /// 설정이 없는 라이브러리에 쓸 기본 차원 지정
    pub fn with_default_dimension(mut self, dimension: usize) -> Self {
        self.default_dimension = dimension;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 라이브러리 설정 조회 (없으면 None, 에러를 던지지 않음)
    pub fn get(&self, library_id: i64) -> Option<LibraryConfig> {
        self.configs().get(&library_id).cloned()
    }

    /// 라이브러리 임베딩 차원 (없으면 기본값)
    pub fn dimension_for(&self, library_id: i64) -> usize {
        match self.get(library_id) {
            Some(config) => config.embedding_dimension,
            None => {
                tracing::debug!(
                    "No config for library {}, using default dimension {}",
                    library_id,
                    self.default_dimension
                );
                self.default_dimension
            }
        }
    }

    /// 라이브러리 검색 가중치
    pub fn weights_for(&self, library_id: i64) -> Option<SearchWeights> {
        self.get(library_id).map(|c| c.weights())
    }

    /// 다음 조회에서 강제로 다시 읽도록 만료시킵니다
    pub fn invalidate(&self) {
        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        snapshot.refreshed_at = None;
        tracing::debug!("Library config cache invalidated");
    }

    /// 현재(필요 시 갱신된) 설정 맵
    fn configs(&self) -> Arc<HashMap<i64, LibraryConfig>> {
        let current = self.current();
        if self.is_fresh(&current) {
            return current.configs;
        }
        self.refresh()
    }

    fn current(&self) -> Snapshot {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_fresh(&self, snapshot: &Snapshot) -> bool {
        snapshot
            .refreshed_at
            .map(|at| at.elapsed() <= self.ttl)
            .unwrap_or(false)
    }

    fn refresh(&self) -> Arc<HashMap<i64, LibraryConfig>> {
        let _guard = self.refresh_lock.lock().unwrap_or_else(PoisonError::into_inner);

        // 대기하는 동안 다른 호출자가 이미 갱신했을 수 있음
        let current = self.current();
        if self.is_fresh(&current) {
            return current.configs;
        }

        match self.source.list_all() {
            Ok(list) => {
                let configs: HashMap<i64, LibraryConfig> =
                    list.into_iter().map(|c| (c.library_id, c)).collect();
                let configs = Arc::new(configs);

                let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
                *snapshot = Snapshot {
                    configs: Arc::clone(&configs),
                    refreshed_at: Some(Instant::now()),
                };
                tracing::debug!("Library config cache refreshed ({} libraries)", configs.len());
                configs
            }
            Err(e) => {
                // 이전 스냅샷 유지, 타임스탬프는 그대로 두어 다음 조회에서 재시도
                tracing::warn!("Library config refresh failed, serving previous snapshot: {}", e);
                current.configs
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
