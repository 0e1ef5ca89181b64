//! 应用服务器密钥编解码
//!
//! VAPID 公钥以无填充的 URL-safe base64 下发，打开订阅时需要原始字节。
//! 密钥格式相关的假设只存在于这里。

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, URL_SAFE_NO_PAD};
use base64::Engine;

use crate::error::{HarnessError, HarnessResult};

/// 标准字母表，最后一个字符的多余位不要求为零
const LENIENT_STANDARD: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

/// 将 base64url 密钥解码为字节
///
/// 先把 `-`/`_` 换成 `+`/`/`，再用 `=` 补齐到 4 的倍数，最后按标准 base64 解码。
pub fn decode_application_key(key: &str) -> HarnessResult<Vec<u8>> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return Err(HarnessError::KeyFormat("key is empty".to_string()));
    }

    let mut standard: String = trimmed
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();

    let padding = (4 - standard.len() % 4) % 4;
    standard.extend(std::iter::repeat('=').take(padding));

    LENIENT_STANDARD
        .decode(standard.as_bytes())
        .map_err(|e| HarnessError::KeyFormat(e.to_string()))
}

/// 编码为无填充 base64url（订阅密钥的下发格式）
pub fn encode_url_safe(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}
