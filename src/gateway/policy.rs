//! # 上游响应判定
//!
//! 决定一次上游尝试是成功、换下一把密钥重试，还是把响应原样交给客户端。

use reqwest::StatusCode;

/// 判定错误类型时最多查看的响应体字节数
pub const INSPECT_BODY_LIMIT: usize = 64 * 1024;

/// 400 响应体中表示密钥本身有问题的标记
const INVALID_KEY_MARKERS: &[&str] = &["API_KEY_INVALID", "API key not valid", "API key expired"];

/// 配额耗尽标记
const QUOTA_MARKER: &str = "RESOURCE_EXHAUSTED";

/// 一次尝试的判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptVerdict {
    /// 2xx，计入用量并回传
    Success,
    /// 密钥失效或配额耗尽，换下一把
    Failover,
    /// 其它结果原样回传
    PassThrough,
}

/// 只凭状态码无法判定、需要查看响应体
#[must_use]
pub fn needs_body(status: StatusCode) -> bool {
    status.is_client_error() && !is_key_failure_status(status)
}

fn is_key_failure_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS
    )
}

/// 根据状态码和（可选的）响应体前缀判定
#[must_use]
pub fn evaluate(status: StatusCode, body: Option<&[u8]>) -> AttemptVerdict {
    if status.is_success() {
        return AttemptVerdict::Success;
    }
    if is_key_failure_status(status) {
        return AttemptVerdict::Failover;
    }
    if !status.is_client_error() {
        return AttemptVerdict::PassThrough;
    }

    let text = body.map(String::from_utf8_lossy).unwrap_or_default();
    if text.contains(QUOTA_MARKER) {
        return AttemptVerdict::Failover;
    }
    if status == StatusCode::BAD_REQUEST && INVALID_KEY_MARKERS.iter().any(|m| text.contains(m)) {
        return AttemptVerdict::Failover;
    }
    AttemptVerdict::PassThrough
}
