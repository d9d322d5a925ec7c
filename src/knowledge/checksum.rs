//! 콘텐츠 체크섬 - 중복 문서 감지
//!
//! 같은 라이브러리에 동일한 내용의 문서가 두 번 들어오는 것을 막기 위해
//! 문서 원문의 SHA-256을 청크 메타데이터(`checksum`)에 기록합니다.

use sha2::{Digest, Sha256};

/// 청크 메타데이터의 체크섬 키
pub const CHECKSUM_KEY: &str = "checksum";

/// 청크 메타데이터의 원본 URL 키
pub const SOURCE_URL_KEY: &str = "source_url";

/// SHA-256 체크섬 (소문자 hex)
pub fn content_checksum(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    format!("{:x}", digest)
}

/// 텍스트 체크섬
///
/// 줄바꿈 차이(CRLF/LF)와 앞뒤 공백은 같은 문서로 취급합니다.
pub fn text_checksum(text: &str) -> String {
    let normalized = text.trim().replace("\r\n", "\n");
    content_checksum(normalized.as_bytes())
}

/// 체크섬 형식 검증 (64자리 hex)
pub fn is_valid_checksum(checksum: &str) -> bool {
    checksum.len() == 64 && checksum.chars().all(|c| c.is_ascii_hexdigit())
}
