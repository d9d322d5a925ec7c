//! Vector 유틸리티 - 차원 보정, 거리 계산, BLOB 인코딩
//!
//! 라이브러리마다 임베딩 모델(차원)이 다를 수 있으므로
//! 저장/반환되는 모든 벡터는 `repair_vector`를 거칩니다.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// 라이브러리 설정이 없을 때의 임베딩 차원
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 1536;

// ============================================================================
// Vector Repair
// ============================================================================

/// 벡터를 목표 차원에 맞춥니다
///
/// - `dimension <= 1` 이거나 길이가 이미 같으면 그대로 반환
/// - 그 외에는 앞쪽 `min(len, dimension)`개를 복사하고 나머지를 0으로 채운 뒤 L2 정규화
///
/// 입력은 변경하지 않습니다. 결과 길이가 항상 `dimension`이므로 반복 적용해도 같습니다.
pub fn repair_vector(vector: &[f32], dimension: usize) -> Cow<'_, [f32]> {
    if dimension <= 1 || vector.len() == dimension {
        return Cow::Borrowed(vector);
    }

    let mut repaired = vec![0.0f32; dimension];
    let copied = vector.len().min(dimension);
    repaired[..copied].copy_from_slice(&vector[..copied]);
    l2_normalize(&mut repaired);

    Cow::Owned(repaired)
}

/// nullable 벡터 보정 (None은 그대로)
pub fn repair_optional(vector: Option<Vec<f32>>, dimension: usize) -> Option<Vec<f32>> {
    vector.map(|v| match repair_vector(&v, dimension) {
        Cow::Borrowed(_) => v,
        Cow::Owned(repaired) => repaired,
    })
}

/// L2 정규화 (노름이 0이면 영벡터 유지)
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = l2_norm(vector);
    if norm == 0.0 {
        return;
    }
    for x in vector.iter_mut() {
        *x /= norm;
    }
}

pub fn l2_norm(vector: &[f32]) -> f32 {
    vector.iter().map(|x| x * x).sum::<f32>().sqrt()
}

// ============================================================================
// Distance
// ============================================================================

/// 코사인 유사도 (-1.0 ~ 1.0)
///
/// 길이가 다르거나 한쪽이 영벡터면 0.0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// 코사인 거리 (0.0 ~ 2.0, 작을수록 가까움)
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// 유클리드(L2) 거리
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// 시맨틱 검색 거리 함수
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    L2,
}

impl DistanceMetric {
    /// SQLite에 등록된 거리 함수 이름
    pub fn sql_function(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "vec_distance_cosine",
            DistanceMetric::L2 => "vec_distance_l2",
        }
    }

    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => cosine_distance(a, b),
            DistanceMetric::L2 => l2_distance(a, b),
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMetric::Cosine => write!(f, "cosine"),
            DistanceMetric::L2 => write!(f, "l2"),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "l2" | "euclidean" => Ok(DistanceMetric::L2),
            other => Err(StoreError::Config(format!(
                "Unknown distance metric: {}",
                other
            ))),
        }
    }
}

// ============================================================================
// BLOB Encoding
// ============================================================================

/// f32 벡터 → little-endian BLOB
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

/// little-endian BLOB → f32 벡터 (길이가 4의 배수가 아니면 None)
pub fn vector_from_blob(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

/// 쉼표로 구분된 벡터 문자열 파싱 ("0.1, 0.2, 0.3")
pub fn parse_vector(input: &str) -> Result<Vec<f32>, StoreError> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f32>()
                .map_err(|_| StoreError::invalid(format!("Not a float: '{}'", s)))
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_unit(v: &[f32]) {
        assert!((l2_norm(v) - 1.0).abs() < 1e-5, "norm = {}", l2_norm(v));
    }

    #[test]
    fn test_repair_same_length_unchanged() {
        let v = vec![3.0, 4.0, 0.0, 0.0];
        let repaired = repair_vector(&v, 4);
        assert!(matches!(repaired, Cow::Borrowed(_)));
        assert_eq!(repaired.as_ref(), v.as_slice());
    }

    #[test]
    fn test_repair_noop_dimension() {
        let v = vec![3.0, 4.0];
        assert_eq!(repair_vector(&v, 1).as_ref(), v.as_slice());
        assert_eq!(repair_vector(&v, 0).as_ref(), v.as_slice());
    }

    #[test]
    fn test_repair_pads_and_normalizes() {
        let v = vec![3.0, 4.0];
        let repaired = repair_vector(&v, 4);

        assert_eq!(repaired.len(), 4);
        assert!((repaired[0] - 0.6).abs() < 1e-6);
        assert!((repaired[1] - 0.8).abs() < 1e-6);
        assert_eq!(repaired[2], 0.0);
        assert_eq!(repaired[3], 0.0);
        assert_unit(&repaired);
        // 입력은 그대로
        assert_eq!(v, vec![3.0, 4.0]);
    }

    #[test]
    fn test_repair_truncates() {
        let v = vec![1.0, 1.0, 5.0, 7.0];
        let repaired = repair_vector(&v, 2);
        assert_eq!(repaired.len(), 2);
        assert!((repaired[0] - repaired[1]).abs() < 1e-6);
        assert_unit(&repaired);
    }

    #[test]
    fn test_repair_zero_vector_stays_zero() {
        let v = vec![0.0, 0.0];
        let repaired = repair_vector(&v, 3);
        assert_eq!(repaired.as_ref(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_repair_idempotent() {
        let inputs: Vec<Vec<f32>> = vec![
            vec![],
            vec![2.0],
            vec![1.0, -2.0, 0.5],
            vec![0.3; 7],
            vec![0.0; 5],
        ];
        for v in &inputs {
            for d in 0..9 {
                let once = repair_vector(v, d).into_owned();
                let twice = repair_vector(&once, d).into_owned();
                assert_eq!(once, twice, "v={:?} d={}", v, d);
                if d > 1 {
                    assert_eq!(once.len(), d);
                }
            }
        }
    }

    #[test]
    fn test_repair_optional() {
        assert_eq!(repair_optional(None, 4), None);
        let repaired = repair_optional(Some(vec![1.0]), 3).unwrap();
        assert_eq!(repaired, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_cosine_similarity_same() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &c) - 0.0).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_empty() {
        let a: Vec<f32> = vec![];
        let b: Vec<f32> = vec![];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn test_distance_ordering() {
        let query = [1.0, 0.0, 0.0, 0.0];
        let first = [1.0, 0.0, 0.0, 0.0];
        let second = [0.0, 1.0, 0.0, 0.0];
        let third = [1.0, 1.0, 0.0, 0.0];

        for metric in [DistanceMetric::Cosine, DistanceMetric::L2] {
            let d1 = metric.distance(&query, &first);
            let d2 = metric.distance(&query, &second);
            let d3 = metric.distance(&query, &third);
            assert!(d1 < d3 && d3 < d2, "{}: {} {} {}", metric, d1, d2, d3);
        }
    }

    #[test]
    fn test_blob_encoding() {
        let v = vec![0.25, -1.5, 3.0];
        let blob = vector_to_blob(&v);
        assert_eq!(blob.len(), 12);
        assert_eq!(vector_from_blob(&blob), Some(v));
        assert_eq!(vector_from_blob(&[0u8; 5]), None);
    }

    #[test]
    fn test_parse_vector() {
        assert_eq!(parse_vector("1, 0.5,-2").unwrap(), vec![1.0, 0.5, -2.0]);
        assert!(parse_vector("1, x").is_err());
    }

    #[test]
    fn test_distance_metric_parse() {
        assert_eq!("COSINE".parse::<DistanceMetric>().unwrap(), DistanceMetric::Cosine);
        assert_eq!("euclidean".parse::<DistanceMetric>().unwrap(), DistanceMetric::L2);
        assert!("dot".parse::<DistanceMetric>().is_err());
        assert_eq!(DistanceMetric::L2.sql_function(), "vec_distance_l2");
    }
}
