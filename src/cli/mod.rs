//! CLI 모듈
//!
//! palank-retrieval CLI 명령어 정의 및 구현

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::config::EngineConfig;
use crate::embedding::{EmbeddingProvider, HashingEmbedding};
use crate::knowledge::{
    annotated_score, parse_vector, Chunk, ChunkKind, DistanceMetric, HybridRetriever,
    HybridSearchRequest, IngestOutcome, IngestRequest, JsonFileLibraryConfigs, LibraryConfig,
    LibraryConfigSource, SearchWeights, SCORE_KEY, SCORE_SEMANTIC_KEY, SCORE_TEXT_KEY,
};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "palank-retrieval")]
#[command(version, about = "임베딩 저장소 + 하이브리드 검색 엔진", long_about = None)]
pub struct Cli {
    /// 데이터 디렉토리 (기본: PALANK_DATA_DIR 또는 ~/.palank-retrieval)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// 벡터 거리 함수 (cosine, l2)
    #[arg(long, global = true)]
    pub distance: Option<DistanceMetric>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 라이브러리 설정 관리
    Library {
        #[command(subcommand)]
        action: LibraryAction,
    },

    /// 청크 하나 추가
    Add {
        #[command(flatten)]
        target: DocumentTarget,

        /// 청크 텍스트
        #[arg(short, long)]
        text: String,

        /// 임베딩 종류 (full_text, summary, qa, chapter, chunk)
        #[arg(long, default_value = "chunk")]
        kind: ChunkKind,

        /// 쉼표로 구분된 벡터 ("0.1,0.2,...")
        #[arg(long)]
        vector: Option<String>,

        /// 상위 청크 ID
        #[arg(long)]
        parent: Option<i64>,

        /// 상위 청크 내 순서
        #[arg(long)]
        order: Option<i32>,
    },

    /// 텍스트/파일을 문단 단위 청크로 수집 (체크섬 중복 검사)
    Ingest {
        #[command(flatten)]
        target: DocumentTarget,

        /// 수집할 파일 경로
        #[arg(long)]
        file: Option<PathBuf>,

        /// 직접 입력할 텍스트
        #[arg(short, long)]
        text: Option<String>,

        /// 원본 URL (메타데이터에 기록)
        #[arg(short, long)]
        url: Option<String>,

        /// 기존 청크를 지우고 다시 수집
        #[arg(long)]
        overwrite: bool,
    },

    /// 청크의 임베딩 벡터 설정
    SetVector {
        /// 청크 ID
        #[arg(long)]
        id: i64,

        /// 쉼표로 구분된 벡터
        #[arg(long)]
        vector: String,
    },

    /// 벡터가 없는 청크를 로컬 해싱 임베딩으로 채움
    Embed {
        /// 라이브러리 ID (없으면 전체)
        #[arg(short, long)]
        library: Option<i64>,

        /// 배치 크기
        #[arg(short, long, default_value = "64")]
        batch: usize,

        /// 임베딩 차원 (기본: 라이브러리 설정 차원)
        #[arg(long)]
        dimension: Option<usize>,
    },

    /// 하이브리드 검색
    Search {
        /// 검색 쿼리
        query: Option<String>,

        /// 검색할 라이브러리 ID (여러 번 지정 가능)
        #[arg(short, long = "library", required = true)]
        libraries: Vec<i64>,

        /// 쿼리 벡터 (쉼표 구분)
        #[arg(long)]
        vector: Option<String>,

        /// 쿼리 텍스트를 로컬 해싱 임베딩으로 벡터화
        #[arg(long)]
        embed_query: bool,

        /// 결과 개수
        #[arg(short)]
        k: Option<usize>,

        /// 시맨틱 가중치
        #[arg(long)]
        semantic_weight: Option<f64>,

        /// 키워드 가중치
        #[arg(long)]
        textual_weight: Option<f64>,

        /// OR 확장 없이 검색
        #[arg(long)]
        narrow: bool,
    },

    /// 문서의 청크 개수
    Count {
        /// 문서 ID
        #[arg(short, long)]
        document: i64,
    },

    /// 청크 또는 문서 삭제
    Delete {
        /// 삭제할 청크 ID
        #[arg(long)]
        id: Option<i64>,

        /// 삭제할 문서 ID (모든 청크)
        #[arg(short, long)]
        document: Option<i64>,
    },

    /// 임베딩 대기 청크 목록
    Pending {
        #[arg(short, long)]
        library: Option<i64>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// 상태 확인
    Status,

    /// FTS5 인덱스 리빌드
    RebuildFts,
}

#[derive(Subcommand)]
pub enum LibraryAction {
    /// 라이브러리 설정 추가/수정
    Set {
        #[arg(long)]
        id: i64,

        /// 임베딩 차원
        #[arg(long)]
        dimension: usize,

        #[arg(long)]
        semantic_weight: Option<f64>,

        #[arg(long)]
        textual_weight: Option<f64>,
    },

    /// 라이브러리 설정 삭제
    Remove {
        #[arg(long)]
        id: i64,
    },

    /// 라이브러리 설정 목록
    List,
}

/// 청크가 속할 라이브러리/문서
#[derive(Args)]
pub struct DocumentTarget {
    /// 라이브러리 ID
    #[arg(short, long)]
    pub library: i64,

    /// 문서 ID
    #[arg(short, long)]
    pub document: i64,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let mut config = EngineConfig::from_env().context("설정 로드 실패")?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(metric) = cli.distance {
        config.distance_metric = metric;
    }

    match cli.command {
        Commands::Library { action } => cmd_library(&config, action),
        Commands::Add {
            target,
            text,
            kind,
            vector,
            parent,
            order,
        } => cmd_add(&config, target, text, kind, vector, parent, order).await,
        Commands::Ingest {
            target,
            file,
            text,
            url,
            overwrite,
        } => cmd_ingest(&config, target, file, text, url, overwrite).await,
        Commands::SetVector { id, vector } => cmd_set_vector(&config, id, &vector).await,
        Commands::Embed {
            library,
            batch,
            dimension,
        } => cmd_embed(&config, library, batch, dimension).await,
        Commands::Search {
            query,
            libraries,
            vector,
            embed_query,
            k,
            semantic_weight,
            textual_weight,
            narrow,
        } => {
            let request = build_search_request(
                query,
                libraries,
                vector,
                k,
                semantic_weight,
                textual_weight,
                narrow,
            )?;
            cmd_search(&config, request, embed_query).await
        }
        Commands::Count { document } => cmd_count(&config, document).await,
        Commands::Delete { id, document } => cmd_delete(&config, id, document).await,
        Commands::Pending { library, limit } => cmd_pending(&config, library, limit).await,
        Commands::Status => cmd_status(&config).await,
        Commands::RebuildFts => cmd_rebuild_fts(&config).await,
    }
}

fn open_retriever(config: &EngineConfig) -> Result<HybridRetriever> {
    HybridRetriever::open(config).context("HybridRetriever 초기화 실패")
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 라이브러리 설정 명령어 (library)
fn cmd_library(config: &EngineConfig, action: LibraryAction) -> Result<()> {
    let source = JsonFileLibraryConfigs::new(config.libraries_path());

    match action {
        LibraryAction::Set {
            id,
            dimension,
            semantic_weight,
            textual_weight,
        } => {
            if dimension == 0 {
                bail!("--dimension은 1 이상이어야 합니다");
            }
            let mut library = LibraryConfig::new(id, dimension);
            if semantic_weight.is_some() || textual_weight.is_some() {
                let semantic = semantic_weight.unwrap_or(config.default_semantic_weight);
                let textual = textual_weight.unwrap_or(1.0 - semantic);
                library = library.with_weights(semantic, textual);
            }

            source.upsert(library.clone()).context("라이브러리 설정 저장 실패")?;
            println!(
                "[OK] 라이브러리 #{} 저장됨 (차원 {}, 가중치 {:.2}/{:.2})",
                library.library_id,
                library.embedding_dimension,
                library.semantic_weight,
                library.textual_weight
            );
        }
        LibraryAction::Remove { id } => {
            if source.remove(id).context("라이브러리 설정 삭제 실패")? {
                println!("[OK] 라이브러리 #{} 설정 삭제됨 (기본 차원 사용)", id);
            } else {
                println!("[!] 라이브러리 #{} 설정이 없습니다", id);
            }
        }
        LibraryAction::List => {
            let libraries = source.list_all().context("라이브러리 설정 조회 실패")?;
            if libraries.is_empty() {
                println!("[!] 등록된 라이브러리가 없습니다.");
                println!("    기본 차원 {} 사용", config.default_dimension);
                return Ok(());
            }

            println!("[OK] 라이브러리 ({} 건):\n", libraries.len());
            for library in libraries {
                println!(
                    "  #{:<4} 차원 {:<5} 가중치 {:.2}/{:.2}",
                    library.library_id,
                    library.embedding_dimension,
                    library.semantic_weight,
                    library.textual_weight
                );
            }
        }
    }

    Ok(())
}

/// 청크 추가 명령어 (add)
async fn cmd_add(
    config: &EngineConfig,
    target: DocumentTarget,
    text: String,
    kind: ChunkKind,
    vector: Option<String>,
    parent: Option<i64>,
    order: Option<i32>,
) -> Result<()> {
    let retriever = open_retriever(config)?;

    let mut chunk = Chunk::new(target.library, target.document, kind, text);
    if let Some(raw) = vector {
        chunk = chunk.with_vector(parse_vector(&raw)?);
    }
    chunk.parent_chunk_id = parent;
    chunk.order_in_parent = order;

    let id = retriever.save(chunk).await.context("청크 저장 실패")?;
    println!("[OK] 청크가 추가되었습니다 (ID: {})", id);

    Ok(())
}

/// 문서 수집 명령어 (ingest)
///
/// 빈 줄 기준으로 문단을 나눠 CHUNK로 저장합니다.
async fn cmd_ingest(
    config: &EngineConfig,
    target: DocumentTarget,
    file: Option<PathBuf>,
    text: Option<String>,
    url: Option<String>,
    overwrite: bool,
) -> Result<()> {
    let (content, source_url) = if let Some(ref path) = file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("파일 읽기 실패: {}", path.display()))?;
        let source_url = url.or_else(|| Some(format!("file://{}", path.display())));
        (content, source_url)
    } else if let Some(text) = text {
        (text, url)
    } else {
        bail!("--file 또는 --text 중 하나를 지정해야 합니다");
    };

    let paragraphs = split_paragraphs(&content);
    if paragraphs.is_empty() {
        bail!("수집할 텍스트가 없습니다");
    }

    let chunks = paragraphs
        .iter()
        .enumerate()
        .map(|(i, p)| {
            Chunk::new(target.library, target.document, ChunkKind::Chunk, p.as_str())
                .with_order(i as i32)
        })
        .collect();

    let retriever = open_retriever(config)?;

    println!("[*] 문서 #{} 수집 중 ({} 문단)...", target.document, paragraphs.len());

    let outcome = retriever
        .ingest_document(IngestRequest {
            library_id: target.library,
            document_id: target.document,
            content,
            source_url,
            chunks,
            overwrite,
        })
        .await
        .context("문서 수집 실패")?;

    match outcome {
        IngestOutcome::Inserted {
            ids,
            replaced,
            checksum,
        } => {
            println!("[OK] {} 청크 저장됨 (교체 {})", ids.len(), replaced);
            println!("     체크섬: {}", checksum);
            println!("     임베딩: palank-retrieval embed --library {}", target.library);
        }
        IngestOutcome::Duplicate {
            existing_document_id,
        } => {
            println!(
                "[!] 같은 내용의 문서가 이미 있습니다 (문서 #{}). --overwrite로 덮어쓸 수 있습니다.",
                existing_document_id
            );
        }
    }

    Ok(())
}

/// 벡터 설정 명령어 (set-vector)
async fn cmd_set_vector(config: &EngineConfig, id: i64, raw: &str) -> Result<()> {
    let vector = parse_vector(raw)?;
    let retriever = open_retriever(config)?;

    retriever
        .update_embedding_vector(id, vector)
        .await
        .context("벡터 갱신 실패")?;

    println!("[OK] 청크 #{} 벡터 갱신됨", id);
    Ok(())
}

/// 임베딩 백필 명령어 (embed)
async fn cmd_embed(
    config: &EngineConfig,
    library: Option<i64>,
    batch: usize,
    dimension: Option<usize>,
) -> Result<()> {
    let retriever = open_retriever(config)?;

    let dimension = dimension.unwrap_or_else(|| match library {
        Some(id) => retriever.libraries().dimension_for(id),
        None => config.default_dimension,
    });
    let provider = HashingEmbedding::new(dimension);

    println!("[*] 임베딩 생성 중 (차원 {})...", dimension);

    let embedded = retriever
        .backfill_embeddings(&provider, library, batch)
        .await
        .context("임베딩 백필 실패")?;

    if embedded == 0 {
        println!("[!] 임베딩할 청크가 없습니다.");
    } else {
        println!("[OK] {} 청크 임베딩 완료", embedded);
    }

    Ok(())
}

/// 검색 요청 생성 (I/O 없음)
fn build_search_request(
    query: Option<String>,
    libraries: Vec<i64>,
    vector: Option<String>,
    k: Option<usize>,
    semantic_weight: Option<f64>,
    textual_weight: Option<f64>,
    narrow: bool,
) -> Result<HybridSearchRequest> {
    let mut request = HybridSearchRequest::new(libraries);
    request.query_text = query;
    request.k = k;

    if let Some(raw) = vector {
        request.query_vector = Some(parse_vector(&raw)?);
    }

    request.weights = match (semantic_weight, textual_weight) {
        (Some(ws), Some(wt)) => Some(SearchWeights::new(ws, wt)),
        (Some(ws), None) => Some(SearchWeights::new(ws, 1.0 - ws)),
        (None, Some(wt)) => Some(SearchWeights::new(1.0 - wt, wt)),
        (None, None) => None,
    };

    if narrow {
        request = request.narrow();
    }

    Ok(request)
}

/// 검색 명령어 (search)
async fn cmd_search(
    config: &EngineConfig,
    mut request: HybridSearchRequest,
    embed_query: bool,
) -> Result<()> {
    let retriever = open_retriever(config)?;

    if embed_query && request.query_vector.is_none() {
        let Some(text) = request.query_text.as_deref() else {
            bail!("--embed-query에는 검색 쿼리가 필요합니다");
        };
        let dimension = request
            .library_ids
            .first()
            .map(|id| retriever.libraries().dimension_for(*id))
            .unwrap_or(config.default_dimension);
        let provider = HashingEmbedding::new(dimension);
        request.query_vector = Some(
            provider
                .embed(text)
                .await
                .context("쿼리 임베딩 실패")?,
        );
    }

    if let Some(ref text) = request.query_text {
        println!("[*] 검색 중: \"{}\"", text);
    } else {
        println!("[*] 벡터 검색 중");
    }

    let results = retriever
        .hybrid_search(request)
        .await
        .context("검색 실패")?;

    if results.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
        return Ok(());
    }

    println!("\n[OK] 검색 결과 ({} 건):\n", results.len());

    for (i, chunk) in results.iter().enumerate() {
        println!(
            "{}. [점수: {:.4} = S {:.4} / T {:.4}] 청크 #{} (문서 #{}, {})",
            i + 1,
            annotated_score(chunk, SCORE_KEY),
            annotated_score(chunk, SCORE_SEMANTIC_KEY),
            annotated_score(chunk, SCORE_TEXT_KEY),
            chunk.id.unwrap_or_default(),
            chunk.document_id,
            chunk.kind
        );
        println!("   내용: {}", truncate_text(&chunk.text, 200));
        println!();
    }

    Ok(())
}

/// 개수 명령어 (count)
async fn cmd_count(config: &EngineConfig, document: i64) -> Result<()> {
    let retriever = open_retriever(config)?;
    let count = retriever
        .count_by_document(document)
        .await
        .context("청크 개수 조회 실패")?;

    println!("[OK] 문서 #{}: {} 청크", document, count);
    Ok(())
}

/// 삭제 명령어 (delete)
///
/// 청크 ID 또는 문서 ID로 삭제합니다.
async fn cmd_delete(config: &EngineConfig, id: Option<i64>, document: Option<i64>) -> Result<()> {
    let retriever = open_retriever(config)?;

    if let Some(id) = id {
        let deleted = retriever.delete(id).await.context("청크 삭제 실패")?;
        if deleted {
            println!("[OK] 청크 #{} 삭제됨 (하위 청크 포함)", id);
        } else {
            println!("[!] 삭제할 청크를 찾을 수 없습니다");
        }
    } else if let Some(document) = document {
        let removed = retriever
            .delete_by_document(document)
            .await
            .context("문서 삭제 실패")?;
        println!("[OK] 문서 #{}: {} 청크 삭제됨", document, removed);
    } else {
        bail!("--id 또는 --document 중 하나를 지정해야 합니다");
    }

    Ok(())
}

/// 임베딩 대기 목록 명령어 (pending)
async fn cmd_pending(config: &EngineConfig, library: Option<i64>, limit: usize) -> Result<()> {
    let retriever = open_retriever(config)?;
    let pending = retriever
        .find_pending_embeddings(library, limit)
        .await
        .context("대기 청크 조회 실패")?;

    if pending.is_empty() {
        println!("[OK] 임베딩 대기 청크가 없습니다.");
        return Ok(());
    }

    println!("[*] 임베딩 대기 ({} 건):\n", pending.len());
    for chunk in pending {
        println!(
            "  #{:<6} 라이브러리 {} / 문서 {} [{}] {}",
            chunk.id.unwrap_or_default(),
            chunk.library_id,
            chunk.document_id,
            chunk.kind,
            truncate_text(&chunk.text, 60)
        );
    }

    Ok(())
}

/// 상태 명령어 (status)
async fn cmd_status(config: &EngineConfig) -> Result<()> {
    println!("palank-retrieval v{}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("[*] 데이터 디렉토리: {}", config.data_dir.display());
    println!(
        "[*] 거리 함수: {}, 캐시 TTL: {}초, 기본 k: {}",
        config.distance_metric, config.cache_ttl_secs, config.default_k
    );

    match open_retriever(config) {
        Ok(retriever) => match retriever.stats().await {
            Ok(stats) => {
                println!(
                    "[OK] 청크: {} (임베딩 {}, 대기 {})",
                    stats.store.chunk_count, stats.store.embedded_count, stats.pending_count
                );
                println!(
                    "     문서: {}, 라이브러리: {}",
                    stats.store.document_count, stats.store.library_count
                );
                if let Ok(meta) = std::fs::metadata(&stats.store.db_path) {
                    println!("     DB 크기: {}", format_bytes(meta.len() as usize));
                }
            }
            Err(e) => {
                println!("[!] 통계 조회 실패: {}", e);
            }
        },
        Err(e) => {
            println!("[!] 저장소 열기 실패: {:#}", e);
        }
    }

    Ok(())
}

/// FTS5 리빌드 명령어 (rebuild-fts)
async fn cmd_rebuild_fts(config: &EngineConfig) -> Result<()> {
    let retriever = open_retriever(config)?;
    let count = retriever
        .rebuild_fts_index()
        .await
        .context("FTS5 인덱스 리빌드 실패")?;

    println!("[OK] FTS5 인덱스 리빌드 완료 ({} 청크)", count);
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 빈 줄 기준 문단 분할
fn split_paragraphs(content: &str) -> Vec<String> {
    content
        .replace("\r\n", "\n")
        .split("\n\n")
        .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|p| !p.is_empty())
        .collect()
}

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("hello world", 5), "hello...");
        assert_eq!(truncate_text("hello\nworld", 20), "hello world");
    }

    #[test]
    fn test_truncate_unicode() {
        let korean = "안녕하세요 세계";
        assert_eq!(truncate_text(korean, 5), "안녕하세요...");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_split_paragraphs() {
        let content = "First line\ncontinues here.\r\n\r\nSecond paragraph.\n\n\n\n  \n\nThird.";
        assert_eq!(
            split_paragraphs(content),
            vec![
                "First line continues here.".to_string(),
                "Second paragraph.".to_string(),
                "Third.".to_string(),
            ]
        );
        assert!(split_paragraphs("  \n\n ").is_empty());
    }

    #[test]
    fn test_build_search_request_weights() {
        let request =
            build_search_request(Some("cats".into()), vec![1], None, Some(5), Some(0.8), None, true)
                .unwrap();
        let weights = request.weights.unwrap();
        assert!((weights.semantic - 0.8).abs() < 1e-12);
        assert!((weights.textual - 0.2).abs() < 1e-12);
        assert_eq!(request.broaden, Some(false));
        assert_eq!(request.k, Some(5));

        let request =
            build_search_request(None, vec![1, 2], Some("1,0".into()), None, None, None, false)
                .unwrap();
        assert_eq!(request.query_vector, Some(vec![1.0, 0.0]));
        assert!(request.weights.is_none());
        assert_eq!(request.library_ids, vec![1, 2]);

        assert!(
            build_search_request(None, vec![1], Some("1,x".into()), None, None, None, false)
                .is_err()
        );
    }

    #[test]
    fn test_cli_parses_search() {
        let cli = Cli::try_parse_from([
            "palank-retrieval",
            "--distance",
            "l2",
            "search",
            "rust ownership",
            "-l",
            "1",
            "-l",
            "2",
            "-k",
            "3",
        ])
        .unwrap();

        assert_eq!(cli.distance, Some(DistanceMetric::L2));
        match cli.command {
            Commands::Search { query, libraries, k, .. } => {
                assert_eq!(query.as_deref(), Some("rust ownership"));
                assert_eq!(libraries, vec![1, 2]);
                assert_eq!(k, Some(3));
            }
            _ => panic!("expected search"),
        }
    }
}
