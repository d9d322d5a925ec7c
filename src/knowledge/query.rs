//! Query Normalizer - 자유 텍스트 → FTS5 검색식
//!
//! 1. `sanitize`: 문자/숫자/공백과 제외 접두사(`-`)만 남기고 `AND`, `NOT` 토큰을 정리
//! 2. `LexicalExpressionEngine`: 정리된 문구를 FTS5 MATCH 식으로 변환 (websearch 문법)
//! 3. `broaden`: AND 결합을 OR로 넓혀 재현율을 높임 (제외 조건은 유지)
//!
//! ref: https://www.sqlite.org/fts5.html#full_text_query_syntax

use regex::Regex;

use crate::error::{Result, StoreError};

/// FTS5 제외 연산자 (tsquery의 `& !`에 해당)
const EXCLUSION_MARKER: &str = " NOT ";

/// broaden 중 제외 연산자를 보호하는 자리표시자
const EXCLUSION_PLACEHOLDER: &str = "\u{1}EXCLUDE\u{1}";

const AND_JOIN: &str = " AND ";
const OR_JOIN: &str = " OR ";

// ============================================================================
// LexicalExpressionEngine
// ============================================================================

/// 문구 → 검색식 변환기
pub trait LexicalExpressionEngine: Send + Sync {
    fn phrase_to_expression(&self, phrase: &str) -> Result<String>;
}

/// `websearch_to_tsquery`와 같은 규칙의 FTS5 변환기
///
/// - 단어는 `"term"`으로 인용하고 ` AND `로 결합
/// - 단어 사이의 `or`는 ` OR `
/// - `-term`은 제외 조건: 긍정 그룹을 괄호로 묶고 ` NOT "term"`을 덧붙임
///
/// 긍정 단어가 하나도 없으면 FTS5로 표현할 수 없으므로 에러를 반환합니다.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSearchSyntax;

impl LexicalExpressionEngine for WebSearchSyntax {
    fn phrase_to_expression(&self, phrase: &str) -> Result<String> {
        let mut positive = String::new();
        let mut positive_count = 0;
        let mut excluded: Vec<String> = Vec::new();
        let mut pending_or = false;

        for token in phrase.split_whitespace() {
            if token.eq_ignore_ascii_case("or") {
                pending_or = positive_count > 0;
                continue;
            }

            if let Some(term) = token.strip_prefix('-') {
                let term = term.trim_start_matches('-');
                if !term.is_empty() {
                    excluded.push(quote_term(term));
                }
                continue;
            }

            if positive_count > 0 {
                positive.push_str(if pending_or { OR_JOIN } else { AND_JOIN });
            }
            positive.push_str(&quote_term(token));
            positive_count += 1;
            pending_or = false;
        }

        if positive_count == 0 {
            return Err(StoreError::invalid(format!(
                "No positive search terms in '{}'",
                phrase
            )));
        }

        if excluded.is_empty() {
            return Ok(positive);
        }

        let mut expression = if positive_count > 1 {
            format!("({})", positive)
        } else {
            positive
        };
        for term in excluded {
            expression.push_str(EXCLUSION_MARKER);
            expression.push_str(&term);
        }

        Ok(expression)
    }
}

/// FTS5 문자열 인용 (내부 따옴표는 두 번)
fn quote_term(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

// ============================================================================
// QueryNormalizer
// ============================================================================

/// 정규화된 키워드 검색식
#[derive(Debug, Clone, PartialEq)]
pub struct LexicalQuery {
    /// sanitize 결과
    pub cleaned: String,
    /// FTS5 MATCH 식 (긍정 단어가 없으면 `None`: 키워드 후보 없음)
    pub expression: Option<String>,
    /// 엔진 변환 실패로 대체 식을 사용했는지
    pub degraded: bool,
    pub broadened: bool,
}

/// 자유 텍스트 쿼리 정규화기
pub struct QueryNormalizer {
    engine: Box<dyn LexicalExpressionEngine>,
    disallowed: Regex,
}

impl Default for QueryNormalizer {
    fn default() -> Self {
        Self::new(Box::new(WebSearchSyntax))
    }
}

impl QueryNormalizer {
    pub fn new(engine: Box<dyn LexicalExpressionEngine>) -> Self {
        Self {
            engine,
            // 문자, 숫자, 공백, 하이픈 외 모두 제거
            disallowed: Regex::new(r"[^\p{L}\p{N}\s-]").expect("static regex"),
        }
    }

    /// 문구 정리
    ///
    /// 빈 문구이거나 정리 후 남는 것이 없으면 `InvalidInput`.
    pub fn sanitize(&self, phrase: &str) -> Result<String> {
        if phrase.trim().is_empty() {
            return Err(StoreError::invalid("Query phrase is empty"));
        }

        let stripped = self.disallowed.replace_all(phrase, "");

        // AND는 버리고, NOT은 다음 단어의 제외 접두사로 (연속된 연산자는 하나로)
        let mut tokens: Vec<String> = Vec::new();
        let mut negate_next = false;
        for token in stripped.split_whitespace() {
            match token {
                "AND" => continue,
                "NOT" => {
                    negate_next = true;
                    continue;
                }
                _ => {}
            }

            if let Some(cleaned) = clean_hyphens(token) {
                if negate_next && !cleaned.starts_with('-') {
                    tokens.push(format!("-{}", cleaned));
                } else {
                    tokens.push(cleaned);
                }
            }
            negate_next = false;
        }

        let cleaned = tokens.join(" ");

        if cleaned.is_empty() {
            return Err(StoreError::invalid(format!(
                "Query phrase has no searchable characters: '{}'",
                phrase
            )));
        }

        Ok(cleaned)
    }

    /// 정리된 문구 → FTS5 검색식
    ///
    /// 엔진 변환이 실패하거나 빈 식을 돌려주면 `fallback_expression`을 사용합니다.
    /// 반환값의 두 번째 값은 대체 식 사용 여부입니다.
    pub fn to_lexical_expression(&self, cleaned: &str) -> (Option<String>, bool) {
        match self.engine.phrase_to_expression(cleaned) {
            Ok(expression) if !expression.trim().is_empty() => (Some(expression), false),
            Ok(_) => {
                tracing::warn!("Lexical engine returned empty expression for '{}'", cleaned);
                (fallback_expression(cleaned), true)
            }
            Err(e) => {
                tracing::warn!("Lexical engine failed for '{}', using phrase: {}", cleaned, e);
                (fallback_expression(cleaned), true)
            }
        }
    }

    /// AND 결합을 OR로 확장
    ///
    /// 제외 연산자를 자리표시자로 보호 → AND를 OR로 교체 → 제외 연산자 복원.
    pub fn broaden(expression: &str) -> String {
        expression
            .replace(EXCLUSION_MARKER, EXCLUSION_PLACEHOLDER)
            .replace(AND_JOIN, OR_JOIN)
            .replace(EXCLUSION_PLACEHOLDER, EXCLUSION_MARKER)
    }

    /// sanitize + 검색식 변환 (+ 선택적 확장)
    pub fn normalize(&self, phrase: &str, broaden: bool) -> Result<LexicalQuery> {
        let cleaned = self.sanitize(phrase)?;
        let (expression, degraded) = self.to_lexical_expression(&cleaned);
        let expression = if broaden {
            expression.map(|e| Self::broaden(&e))
        } else {
            expression
        };

        tracing::debug!("Lexical query: '{}' -> {:?}", phrase, expression);

        Ok(LexicalQuery {
            cleaned,
            expression,
            degraded,
            broadened: broaden,
        })
    }
}

/// 대체 검색식: 긍정 단어를 하나의 phrase로 묶고 제외 단어마다 ` NOT "term"`
///
/// 긍정 단어가 없으면 FTS5로 표현할 수 없으므로 `None`.
fn fallback_expression(cleaned: &str) -> Option<String> {
    let (excluded, positive): (Vec<&str>, Vec<&str>) = cleaned
        .split_whitespace()
        .partition(|token| token.starts_with('-'));

    if positive.is_empty() {
        return None;
    }

    let mut expression = quote_term(&positive.join(" "));
    for term in excluded {
        let term = term.trim_start_matches('-');
        if !term.is_empty() {
            expression.push_str(EXCLUSION_MARKER);
            expression.push_str(&quote_term(term));
        }
    }

    Some(expression)
}

/// 토큰의 하이픈 정리
///
/// 앞쪽 하이픈은 제외 접두사 하나로 줄이고, 단어 안쪽 하이픈은 공백으로 바꿉니다.
fn clean_hyphens(token: &str) -> Option<String> {
    let body = token.trim_start_matches('-');
    let excluded = body.len() != token.len();

    let body = body
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    if body.is_empty() {
        return None;
    }

    Some(if excluded { format!("-{}", body) } else { body })
}

// ============================================================================
// Tests
// ============================================================================
