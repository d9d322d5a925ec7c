//! Chunk Store - rusqlite 기반 청크 + 임베딩 저장소
//!
//! - `chunks`: 텍스트 청크와 임베딩 벡터(f32 little-endian BLOB)
//! - `chunks_fts`: FTS5 external-content 인덱스 (트리거로 동기화, 직접 쓰지 않음)
//! - `vec_distance_cosine` / `vec_distance_l2`: 연결에 등록한 벡터 거리 함수
//!
//! 저장/반환되는 벡터는 모두 라이브러리 설정 차원으로 보정됩니다.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageContext, StoreError};

use super::checksum::{is_valid_checksum, text_checksum, CHECKSUM_KEY, SOURCE_URL_KEY};
use super::library::LibraryConfigCache;
use super::vector::{
    repair_optional, repair_vector, vector_from_blob, vector_to_blob, DistanceMetric,
};

/// 청크 메타데이터 (자유 형식 JSON 객체)
pub type Metadata = serde_json::Map<String, serde_json::Value>;

const CHUNK_COLUMNS: &str = "c.id, c.library_id, c.document_id, c.parent_chunk_id, c.kind, \
     c.text, c.order_in_parent, c.embedding_vector, c.metadata, c.created_at, c.updated_at";

/// CHUNK_COLUMNS 다음에 오는 순위 점수 컬럼 위치
const SCORE_COLUMN: usize = 11;

// ============================================================================
// Types
// ============================================================================

/// 임베딩 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkKind {
    FullText,
    Summary,
    Qa,
    Chapter,
    Chunk,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::FullText => "FULL_TEXT",
            ChunkKind::Summary => "SUMMARY",
            ChunkKind::Qa => "QA",
            ChunkKind::Chapter => "CHAPTER",
            ChunkKind::Chunk => "CHUNK",
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkKind {
    type Err = StoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace('-', "_").as_str() {
            "FULL_TEXT" => Ok(ChunkKind::FullText),
            "SUMMARY" => Ok(ChunkKind::Summary),
            "QA" => Ok(ChunkKind::Qa),
            "CHAPTER" => Ok(ChunkKind::Chapter),
            "CHUNK" => Ok(ChunkKind::Chunk),
            other => Err(StoreError::invalid(format!("Unknown chunk kind: {}", other))),
        }
    }
}

/// 검색 가능한 텍스트 단위 + 선택적 임베딩 벡터
///
/// `id`가 없으면 아직 저장되지 않은 청크입니다.
/// FTS5 인덱스(searchable text)는 저장소가 관리하므로 여기에는 없습니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Option<i64>,
    pub library_id: i64,
    pub document_id: i64,
    pub parent_chunk_id: Option<i64>,
    pub kind: ChunkKind,
    pub text: String,
    pub order_in_parent: Option<i32>,
    pub vector: Option<Vec<f32>>,
    pub metadata: Metadata,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Chunk {
    pub fn new(library_id: i64, document_id: i64, kind: ChunkKind, text: impl Into<String>) -> Self {
        Self {
            id: None,
            library_id,
            document_id,
            parent_chunk_id: None,
            kind,
            text: text.into(),
            order_in_parent: None,
            vector: None,
            metadata: Metadata::new(),
            created_at: None,
            updated_at: None,
        }
    }

    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = Some(vector);
        self
    }

    pub fn with_parent(mut self, parent_chunk_id: i64) -> Self {
        self.parent_chunk_id = Some(parent_chunk_id);
        self
    }

    pub fn with_order(mut self, order_in_parent: i32) -> Self {
        self.order_in_parent = Some(order_in_parent);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// 순위가 매겨진 검색 후보
#[derive(Debug, Clone)]
pub struct RankedChunk {
    pub chunk: Chunk,
    /// 1부터 시작하는 순위
    pub rank: usize,
    /// 벡터 거리 또는 BM25 점수 (둘 다 작을수록 관련도 높음)
    pub raw_score: f64,
}

/// 문서 수집 요청 (체크섬 기반 중복 검사 포함)
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub library_id: i64,
    pub document_id: i64,
    /// 체크섬 계산에 쓰는 문서 원문
    pub content: String,
    pub source_url: Option<String>,
    pub chunks: Vec<Chunk>,
    /// 기존 청크를 지우고 다시 생성
    pub overwrite: bool,
}

/// 문서 수집 결과
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Inserted { ids: Vec<i64>, replaced: usize, checksum: String },
    Duplicate { existing_document_id: i64 },
}

/// 저장소 통계
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub chunk_count: usize,
    pub embedded_count: usize,
    pub document_count: usize,
    pub library_count: usize,
    pub db_path: PathBuf,
}

// ============================================================================
// ChunkStore
// ============================================================================

/// 청크 저장소
///
/// 하나의 SQLite 연결을 `Mutex`로 보호합니다. 라이브러리 차원 조회는
/// 연결 잠금 전에 끝내므로 설정 소스가 느려도 잠금을 오래 잡지 않습니다.
pub struct ChunkStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
    libraries: Arc<LibraryConfigCache>,
}

impl ChunkStore {
    /// 저장소 열기 (없으면 생성)
    pub fn open(path: &Path, libraries: Arc<LibraryConfigCache>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .storage_with("open", || path.display().to_string())?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
            libraries,
        };

        store.initialize()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn libraries(&self) -> &Arc<LibraryConfigCache> {
        &self.libraries
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))
    }

    /// 스키마, 트리거, 거리 함수 초기화
    fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .storage("initialize", "pragmas")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                library_id INTEGER NOT NULL,
                document_id INTEGER NOT NULL,
                parent_chunk_id INTEGER REFERENCES chunks(id) ON DELETE CASCADE,
                kind TEXT NOT NULL
                    CHECK (kind IN ('FULL_TEXT', 'SUMMARY', 'QA', 'CHAPTER', 'CHUNK')),
                text TEXT NOT NULL CHECK (length(text) > 0),
                order_in_parent INTEGER,
                embedding_vector BLOB,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_library ON chunks(library_id);
            CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);
            CREATE INDEX IF NOT EXISTS idx_chunks_parent ON chunks(parent_chunk_id);",
        )
        .storage("initialize", "chunks table")?;

        // FTS5 external-content 인덱스 + 동기화 트리거
        // source: https://www.sqlite.org/fts5.html#external_content_tables
        conn.execute_batch(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
                text,
                content = chunks,
                content_rowid = id,
                tokenize = 'porter unicode61'
            );

            CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
                INSERT INTO chunks_fts(rowid, text) VALUES (new.id, new.text);
            END;

            CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
                INSERT INTO chunks_fts(chunks_fts, rowid, text)
                VALUES ('delete', old.id, old.text);
            END;

            CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE OF text ON chunks BEGIN
                INSERT INTO chunks_fts(chunks_fts, rowid, text)
                VALUES ('delete', old.id, old.text);
                INSERT INTO chunks_fts(rowid, text) VALUES (new.id, new.text);
            END;
            "#,
        )
        .storage("initialize", "chunks_fts")?;

        register_distance_functions(&conn).storage("initialize", "distance functions")?;

        tracing::debug!("Chunk store initialized at {:?}", self.db_path);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// 청크 저장 (id가 있으면 update)
    pub fn save(&self, chunk: &Chunk) -> Result<i64> {
        if let Some(id) = chunk.id {
            self.update(chunk)?;
            return Ok(id);
        }

        let dimension = self.libraries.dimension_for(chunk.library_id);
        let conn = self.lock()?;
        let id = insert_row(&conn, chunk, dimension, &now_rfc3339())?;

        tracing::debug!("Saved chunk {} (library={})", id, chunk.library_id);
        Ok(id)
    }

    /// 배치 저장 (전부 성공 또는 전부 롤백)
    ///
    /// 한 트랜잭션에서 순서대로 삽입하고, 실패한 행이 있으면 전체를 롤백한 뒤
    /// `BatchFailed { index, .. }`를 반환합니다. 반환 id는 입력 순서와 같습니다.
    pub fn save_all(&self, chunks: &[Chunk]) -> Result<Vec<i64>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let dimensions = self.dimensions_for(chunks);
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .storage_with("save_all", || format!("begin, {} rows", chunks.len()))?;

        let ids = insert_batch(&tx, chunks, &dimensions)?;

        tx.commit()
            .storage_with("save_all", || format!("commit, {} rows", chunks.len()))?;

        tracing::info!("Saved {} chunks", ids.len());
        Ok(ids)
    }

    /// 청크 수정 (library_id, document_id는 변경 불가)
    pub fn update(&self, chunk: &Chunk) -> Result<()> {
        let id = chunk
            .id
            .ok_or_else(|| StoreError::invalid("update requires a chunk id"))?;
        validate_chunk(chunk)?;

        let dimension = self.libraries.dimension_for(chunk.library_id);
        let vector = chunk
            .vector
            .as_deref()
            .map(|v| vector_to_blob(&repair_vector(v, dimension)));
        let metadata = serde_json::to_string(&chunk.metadata)?;

        let conn = self.lock()?;

        let owner: Option<(i64, i64)> = conn
            .query_row(
                "SELECT library_id, document_id FROM chunks WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .storage_with("update", || format!("id={}", id))?;

        match owner {
            None => return Err(StoreError::NotFound(id)),
            Some((library_id, document_id))
                if library_id != chunk.library_id || document_id != chunk.document_id =>
            {
                return Err(StoreError::invalid(format!(
                    "Chunk {} belongs to library {} / document {}; owners are immutable",
                    id, library_id, document_id
                )));
            }
            Some(_) => {}
        }

        conn.execute(
            "UPDATE chunks SET parent_chunk_id = ?1, kind = ?2, text = ?3, order_in_parent = ?4,
                    embedding_vector = ?5, metadata = ?6, updated_at = ?7
             WHERE id = ?8",
            params![
                chunk.parent_chunk_id,
                chunk.kind.as_str(),
                chunk.text,
                chunk.order_in_parent,
                vector,
                metadata,
                now_rfc3339(),
                id
            ],
        )
        .storage_with("update", || format!("id={}", id))?;

        tracing::debug!("Updated chunk {}", id);
        Ok(())
    }

    /// 임베딩 벡터만 갱신 (지연 임베딩 파이프라인용)
    ///
    /// 다른 쓰기 경로와 같이 라이브러리 차원으로 보정한 뒤 저장합니다.
    pub fn update_embedding_vector(&self, id: i64, vector: &[f32]) -> Result<()> {
        if vector.is_empty() {
            return Err(StoreError::invalid(format!("Empty vector for chunk {}", id)));
        }

        let library_id = self.library_of(id)?.ok_or(StoreError::NotFound(id))?;
        let dimension = self.libraries.dimension_for(library_id);
        let blob = vector_to_blob(&repair_vector(vector, dimension));

        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE chunks SET embedding_vector = ?1, updated_at = ?2 WHERE id = ?3",
                params![blob, now_rfc3339(), id],
            )
            .storage_with("update_embedding_vector", || format!("id={}", id))?;

        if rows == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// 메타데이터 교체
    pub fn update_metadata(&self, id: i64, metadata: &Metadata) -> Result<()> {
        let json = serde_json::to_string(metadata)?;

        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE chunks SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
                params![json, now_rfc3339(), id],
            )
            .storage_with("update_metadata", || format!("id={}", id))?;

        if rows == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// 청크 삭제 (하위 청크는 FK cascade로 함께 삭제)
    pub fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn
            .execute("DELETE FROM chunks WHERE id = ?1", params![id])
            .storage_with("delete", || format!("id={}", id))?;
        Ok(rows > 0)
    }

    /// 문서의 모든 청크 삭제 (한 트랜잭션)
    pub fn delete_by_document(&self, document_id: i64) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .storage_with("delete_by_document", || format!("document_id={}", document_id))?;

        let rows = tx
            .execute("DELETE FROM chunks WHERE document_id = ?1", params![document_id])
            .storage_with("delete_by_document", || format!("document_id={}", document_id))?;

        tx.commit()
            .storage_with("delete_by_document", || format!("document_id={}", document_id))?;

        tracing::info!("Deleted {} chunks of document {}", rows, document_id);
        Ok(rows)
    }

    /// 체크섬 중복 검사 후 문서 청크 저장
    ///
    /// 같은 라이브러리의 다른 문서가 같은 체크섬을 갖고 있으면 아무것도 쓰지 않습니다.
    /// `overwrite`면 기존 청크 삭제와 새 청크 삽입이 한 트랜잭션에서 수행됩니다.
    pub fn ingest_document(&self, request: IngestRequest) -> Result<IngestOutcome> {
        if request.chunks.is_empty() {
            return Err(StoreError::invalid(format!(
                "Document {} has no chunks to ingest",
                request.document_id
            )));
        }
        if let Some(stray) = request.chunks.iter().find(|c| {
            c.library_id != request.library_id || c.document_id != request.document_id
        }) {
            return Err(StoreError::invalid(format!(
                "Chunk for library {} / document {} in ingest of library {} / document {}",
                stray.library_id, stray.document_id, request.library_id, request.document_id
            )));
        }

        let checksum = text_checksum(&request.content);
        let chunks: Vec<Chunk> = request
            .chunks
            .into_iter()
            .map(|mut chunk| {
                chunk
                    .metadata
                    .insert(CHECKSUM_KEY.to_string(), checksum.clone().into());
                if let Some(url) = &request.source_url {
                    chunk
                        .metadata
                        .insert(SOURCE_URL_KEY.to_string(), url.clone().into());
                }
                chunk
            })
            .collect();

        let dimensions = self.dimensions_for(&chunks);
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .storage_with("ingest_document", || format!("document_id={}", request.document_id))?;

        if let Some(existing) = find_checksum(&tx, request.library_id, &checksum)? {
            if existing != request.document_id || !request.overwrite {
                tracing::info!(
                    "Skipping document {}: duplicate of document {} (checksum {})",
                    request.document_id,
                    existing,
                    checksum
                );
                return Ok(IngestOutcome::Duplicate {
                    existing_document_id: existing,
                });
            }
        }

        let replaced = if request.overwrite {
            tx.execute(
                "DELETE FROM chunks WHERE document_id = ?1",
                params![request.document_id],
            )
            .storage_with("ingest_document", || {
                format!("overwrite document_id={}", request.document_id)
            })?
        } else {
            0
        };

        let ids = insert_batch(&tx, &chunks, &dimensions)?;

        tx.commit()
            .storage_with("ingest_document", || format!("document_id={}", request.document_id))?;

        tracing::info!(
            "Ingested document {} (library={}, chunks={}, replaced={})",
            request.document_id,
            request.library_id,
            ids.len(),
            replaced
        );

        Ok(IngestOutcome::Inserted {
            ids,
            replaced,
            checksum,
        })
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// ID로 청크 조회
    pub fn get(&self, id: i64) -> Result<Option<Chunk>> {
        let chunk = {
            let conn = self.lock()?;
            conn.query_row(
                &format!("SELECT {} FROM chunks c WHERE c.id = ?1", CHUNK_COLUMNS),
                params![id],
                decode_chunk,
            )
            .optional()
            .storage_with("get", || format!("id={}", id))?
        };

        Ok(chunk.map(|c| self.repaired(c)))
    }

    /// 문서의 청크 목록 (상위 청크, 순서, id 순)
    pub fn list_by_document(&self, document_id: i64) -> Result<Vec<Chunk>> {
        let chunks = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM chunks c WHERE c.document_id = ?1
                     ORDER BY COALESCE(c.parent_chunk_id, 0), COALESCE(c.order_in_parent, 0), c.id",
                    CHUNK_COLUMNS
                ))
                .storage_with("list_by_document", || format!("document_id={}", document_id))?;

            let rows = stmt
                .query_map(params![document_id], decode_chunk)
                .storage_with("list_by_document", || format!("document_id={}", document_id))?;

            rows.collect::<rusqlite::Result<Vec<_>>>()
                .storage_with("list_by_document", || format!("document_id={}", document_id))?
        };

        Ok(self.repaired_all(chunks))
    }

    /// 문서의 청크 개수
    pub fn count_by_document(&self, document_id: i64) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chunks WHERE document_id = ?1",
                params![document_id],
                |row| row.get(0),
            )
            .storage_with("count_by_document", || format!("document_id={}", document_id))?;
        Ok(count as usize)
    }

    /// 임베딩이 아직 없는 청크 (id 순)
    pub fn find_pending_embeddings(
        &self,
        library_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Chunk>> {
        let chunks = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM chunks c
                     WHERE c.embedding_vector IS NULL AND (?1 IS NULL OR c.library_id = ?1)
                     ORDER BY c.id
                     LIMIT ?2",
                    CHUNK_COLUMNS
                ))
                .storage("find_pending_embeddings", "prepare")?;

            let rows = stmt
                .query_map(params![library_id, sql_limit(limit)], decode_chunk)
                .storage_with("find_pending_embeddings", || format!("library_id={:?}", library_id))?;

            rows.collect::<rusqlite::Result<Vec<_>>>()
                .storage("find_pending_embeddings", "decode")?
        };

        Ok(chunks)
    }

    /// 체크섬으로 같은 라이브러리의 문서 찾기
    pub fn find_document_by_checksum(&self, library_id: i64, checksum: &str) -> Result<Option<i64>> {
        if !is_valid_checksum(checksum) {
            return Err(StoreError::invalid(format!("Malformed checksum: '{}'", checksum)));
        }
        let conn = self.lock()?;
        find_checksum(&conn, library_id, checksum)
    }

    /// 시맨틱 후보: 쿼리 벡터와 가까운 순
    ///
    /// 벡터가 없는 청크는 제외됩니다.
    pub fn semantic_candidates(
        &self,
        query_vector: &[f32],
        library_ids: &[i64],
        limit: usize,
        metric: DistanceMetric,
    ) -> Result<Vec<RankedChunk>> {
        if library_ids.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {cols}, {func}(c.embedding_vector, ?1) AS distance
             FROM chunks c
             WHERE c.embedding_vector IS NOT NULL AND c.library_id IN ({libs})
             ORDER BY distance IS NULL, distance ASC, c.id ASC
             LIMIT ?2",
            cols = CHUNK_COLUMNS,
            func = metric.sql_function(),
            libs = placeholders(3, library_ids.len()),
        );

        let mut values = vec![
            Value::Blob(vector_to_blob(query_vector)),
            Value::Integer(sql_limit(limit)),
        ];
        values.extend(library_ids.iter().map(|id| Value::Integer(*id)));

        let ranked = self.ranked_query("semantic_candidates", &sql, &values)?;
        tracing::debug!("Semantic candidates: {} (metric={})", ranked.len(), metric);
        Ok(ranked)
    }

    /// 키워드 후보: FTS5 BM25 순
    pub fn lexical_candidates(
        &self,
        expression: &str,
        library_ids: &[i64],
        limit: usize,
    ) -> Result<Vec<RankedChunk>> {
        if library_ids.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        // source: https://www.sqlite.org/fts5.html#the_bm25_function
        let sql = format!(
            "SELECT {cols}, bm25(chunks_fts) AS score
             FROM chunks_fts
             JOIN chunks c ON c.id = chunks_fts.rowid
             WHERE chunks_fts MATCH ?1 AND c.library_id IN ({libs})
             ORDER BY bm25(chunks_fts) ASC, c.id ASC
             LIMIT ?2",
            cols = CHUNK_COLUMNS,
            libs = placeholders(3, library_ids.len()),
        );

        let mut values = vec![
            Value::Text(expression.to_string()),
            Value::Integer(sql_limit(limit)),
        ];
        values.extend(library_ids.iter().map(|id| Value::Integer(*id)));

        let ranked = self.ranked_query("lexical_candidates", &sql, &values)?;
        tracing::debug!("Lexical candidates: {} for {}", ranked.len(), expression);
        Ok(ranked)
    }

    fn ranked_query(
        &self,
        operation: &'static str,
        sql: &str,
        values: &[Value],
    ) -> Result<Vec<RankedChunk>> {
        let rows = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(sql).storage(operation, "prepare")?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), decode_scored)
                .storage(operation, "query")?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .storage(operation, "decode")?
        };

        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, (chunk, raw_score))| RankedChunk {
                chunk: self.repaired(chunk),
                rank: i + 1,
                raw_score,
            })
            .collect())
    }

    /// 저장소 통계
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;

        let (chunks, embedded, documents, libraries): (i64, i64, i64, i64) = conn
            .query_row(
                "SELECT COUNT(*),
                        COUNT(embedding_vector),
                        COUNT(DISTINCT document_id),
                        COUNT(DISTINCT library_id)
                 FROM chunks",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .storage("stats", "counts")?;

        Ok(StoreStats {
            chunk_count: chunks as usize,
            embedded_count: embedded as usize,
            document_count: documents as usize,
            library_count: libraries as usize,
            db_path: self.db_path.clone(),
        })
    }

    /// FTS5 인덱스 리빌드
    pub fn rebuild_fts_index(&self) -> Result<usize> {
        let conn = self.lock()?;

        conn.execute("INSERT INTO chunks_fts(chunks_fts) VALUES ('rebuild')", [])
            .storage("rebuild_fts_index", "rebuild")?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
            .storage("rebuild_fts_index", "count")?;

        tracing::info!("Rebuilt FTS5 index with {} chunks", count);
        Ok(count as usize)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn library_of(&self, id: i64) -> Result<Option<i64>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT library_id FROM chunks WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .storage_with("library_of", || format!("id={}", id))
    }

    fn dimensions_for(&self, chunks: &[Chunk]) -> HashMap<i64, usize> {
        let mut dimensions = HashMap::new();
        for chunk in chunks {
            dimensions
                .entry(chunk.library_id)
                .or_insert_with(|| self.libraries.dimension_for(chunk.library_id));
        }
        dimensions
    }

    fn repaired(&self, mut chunk: Chunk) -> Chunk {
        if chunk.vector.is_some() {
            let dimension = self.libraries.dimension_for(chunk.library_id);
            chunk.vector = repair_optional(chunk.vector.take(), dimension);
        }
        chunk
    }

    fn repaired_all(&self, chunks: Vec<Chunk>) -> Vec<Chunk> {
        chunks.into_iter().map(|c| self.repaired(c)).collect()
    }
}

// ============================================================================
// Row Helpers
// ============================================================================

fn validate_chunk(chunk: &Chunk) -> Result<()> {
    if chunk.text.trim().is_empty() {
        return Err(StoreError::invalid(format!(
            "Chunk text is empty (library={}, document={})",
            chunk.library_id, chunk.document_id
        )));
    }
    if matches!(&chunk.vector, Some(v) if v.is_empty()) {
        return Err(StoreError::invalid("Chunk vector is empty"));
    }
    Ok(())
}

fn insert_row(conn: &Connection, chunk: &Chunk, dimension: usize, now: &str) -> Result<i64> {
    validate_chunk(chunk)?;
    if chunk.id.is_some() {
        return Err(StoreError::invalid("Insert of a chunk that already has an id"));
    }

    let vector = chunk
        .vector
        .as_deref()
        .map(|v| vector_to_blob(&repair_vector(v, dimension)));
    let metadata = serde_json::to_string(&chunk.metadata)?;

    conn.execute(
        "INSERT INTO chunks (library_id, document_id, parent_chunk_id, kind, text,
                             order_in_parent, embedding_vector, metadata, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            chunk.library_id,
            chunk.document_id,
            chunk.parent_chunk_id,
            chunk.kind.as_str(),
            chunk.text,
            chunk.order_in_parent,
            vector,
            metadata,
            now
        ],
    )
    .storage_with("insert", || {
        format!("library={}, document={}", chunk.library_id, chunk.document_id)
    })?;

    Ok(conn.last_insert_rowid())
}

/// 트랜잭션 안에서 순서대로 삽입 (실패 시 BatchFailed, 커밋은 호출자)
fn insert_batch(
    conn: &Connection,
    chunks: &[Chunk],
    dimensions: &HashMap<i64, usize>,
) -> Result<Vec<i64>> {
    let now = now_rfc3339();
    let total = chunks.len();
    let mut ids = Vec::with_capacity(total);

    for (index, chunk) in chunks.iter().enumerate() {
        let dimension = dimensions.get(&chunk.library_id).copied().unwrap_or(0);
        match insert_row(conn, chunk, dimension, &now) {
            Ok(id) => ids.push(id),
            Err(source) => {
                tracing::warn!("Batch insert failed at row {}/{}: {}", index, total, source);
                return Err(StoreError::BatchFailed {
                    index,
                    total,
                    source: Box::new(source),
                });
            }
        }
    }

    Ok(ids)
}

fn find_checksum(conn: &Connection, library_id: i64, checksum: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT document_id FROM chunks
         WHERE library_id = ?1 AND json_extract(metadata, '$.checksum') = ?2
         ORDER BY id
         LIMIT 1",
        params![library_id, checksum],
        |row| row.get(0),
    )
    .optional()
    .storage_with("find_document_by_checksum", || {
        format!("library={}, checksum={}", library_id, checksum)
    })
}

/// 행 → Chunk (벡터 보정 전)
fn decode_chunk(row: &Row<'_>) -> rusqlite::Result<Chunk> {
    let kind: String = row.get(4)?;
    let kind = kind
        .parse::<ChunkKind>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

    let vector = match row.get::<_, Option<Vec<u8>>>(7)? {
        Some(blob) => Some(vector_from_blob(&blob).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                7,
                Type::Blob,
                "embedding blob length is not a multiple of 4".into(),
            )
        })?),
        None => None,
    };

    let metadata: String = row.get(8)?;
    let metadata: Metadata = serde_json::from_str(&metadata)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?;

    Ok(Chunk {
        id: Some(row.get(0)?),
        library_id: row.get(1)?,
        document_id: row.get(2)?,
        parent_chunk_id: row.get(3)?,
        kind,
        text: row.get(5)?,
        order_in_parent: row.get(6)?,
        vector,
        metadata,
        created_at: Some(parse_datetime(row.get::<_, String>(9)?)),
        updated_at: Some(parse_datetime(row.get::<_, String>(10)?)),
    })
}

/// 행 → (Chunk, 순위 점수)
fn decode_scored(row: &Row<'_>) -> rusqlite::Result<(Chunk, f64)> {
    let chunk = decode_chunk(row)?;
    let score: Option<f64> = row.get(SCORE_COLUMN)?;
    Ok((chunk, score.unwrap_or(f64::MAX)))
}

/// `?start, ?start+1, ...` 자리표시자
/// SQLite LIMIT 값 (음수는 무제한이므로 i64 최대값으로 고정)
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// 벡터 거리 SQL 함수 등록
///
/// 저장된 벡터를 쿼리 벡터 길이로 보정한 뒤 거리를 계산합니다.
fn register_distance_functions(conn: &Connection) -> rusqlite::Result<()> {
    for metric in [DistanceMetric::Cosine, DistanceMetric::L2] {
        conn.create_scalar_function(
            metric.sql_function(),
            2,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            move |ctx| {
                let stored = ctx.get::<Option<Vec<u8>>>(0)?;
                let query = ctx.get::<Option<Vec<u8>>>(1)?;

                let (Some(stored), Some(query)) = (
                    stored.as_deref().and_then(vector_from_blob),
                    query.as_deref().and_then(vector_from_blob),
                ) else {
                    return Ok(None);
                };

                let stored = repair_vector(&stored, query.len());
                Ok(Some(metric.distance(&stored, &query) as f64))
            },
        )?;
    }
    Ok(())
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// RFC3339 문자열을 DateTime<Utc>로 파싱
fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ============================================================================
// Tests
// ============================================================================
