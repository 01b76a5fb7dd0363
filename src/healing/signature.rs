//! 错误签名：把易变的错误文本归一成可聚合的短串
//!
//! 形如 `rate_limit:http #: too many requests`；冒号前为类别，巡检据此判断“主导错误”。

use std::sync::OnceLock;

use regex::Regex;

use crate::core::ProviderError;

const MAX_SIGNATURE_CHARS: usize = 120;

static DIGITS_RE: OnceLock<Regex> = OnceLock::new();
static SPACES_RE: OnceLock<Regex> = OnceLock::new();

/// 小写、数字串替换为 #、空白折叠、截断
pub fn normalize_message(message: &str) -> String {
    let digits = DIGITS_RE.get_or_init(|| Regex::new(r"\d+").expect("static regex"));
    let spaces = SPACES_RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"));
    let lower = message.to_lowercase();
    let masked = digits.replace_all(&lower, "#");
    let collapsed = spaces.replace_all(masked.trim(), " ");
    collapsed.chars().take(MAX_SIGNATURE_CHARS).collect()
}

/// Provider 错误的签名
pub fn error_signature(err: &ProviderError) -> String {
    format!("{}:{}", err.kind.as_str(), normalize_message(&err.message))
}

/// 签名的类别部分（冒号前）
pub fn signature_class(signature: &str) -> &str {
    signature.split(':').next().unwrap_or(signature)
}
