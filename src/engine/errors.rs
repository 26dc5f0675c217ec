//! 下载错误分类
//!
//! 错误分为四类：致命（不可重试）、临时（可重试）、已取消、完整性。
//! HTTP 状态码到错误类别的映射是纯函数，便于单元测试

use reqwest::StatusCode;
use thiserror::Error;

/// 下载错误
#[derive(Debug, Error)]
pub enum DownloadError {
    /// 致命错误：鉴权失败、资源不存在等，立即中止整个下载
    #[error("致命错误: {0}")]
    Fatal(String),

    /// 临时错误：网络抖动、限流、服务端 5xx，按退避策略重试
    #[error("临时错误: {0}")]
    Transient(String),

    /// 取消：暂停或关闭触发，不作为错误上报
    #[error("下载已取消")]
    Cancelled,

    /// 完整性错误：写入失败或收尾时大小不符，保留部分文件待排查
    #[error("完整性错误: {0}")]
    Integrity(String),
}

impl DownloadError {
    /// 是否为致命错误
    pub fn is_fatal(&self) -> bool {
        matches!(self, DownloadError::Fatal(_) | DownloadError::Integrity(_))
    }

    /// 是否可以重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, DownloadError::Transient(_))
    }

    /// 错误类别名称（用于事件上报）
    pub fn kind(&self) -> &'static str {
        match self {
            DownloadError::Fatal(_) => "fatal",
            DownloadError::Transient(_) => "transient",
            DownloadError::Cancelled => "cancelled",
            DownloadError::Integrity(_) => "integrity",
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        // 请求构造错误不会因重试恢复，其余（连接、超时、读流中断）可重试
        if e.is_builder() {
            DownloadError::Fatal(format!("请求构造失败: {}", e))
        } else {
            DownloadError::Transient(e.to_string())
        }
    }
}

/// 根据 HTTP 响应状态码分类错误
///
/// 成功状态（200/206）返回 None；401/403/404/410 致命；
/// 408/429 与 5xx 可重试；其余 4xx 一律视为致命
pub fn classify_status(status: StatusCode) -> Option<DownloadError> {
    match status {
        StatusCode::OK | StatusCode::PARTIAL_CONTENT => None,
        StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND
        | StatusCode::GONE => Some(DownloadError::Fatal(format!("服务器返回 {}", status))),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            Some(DownloadError::Transient(format!("服务器返回 {}", status)))
        }
        s if s.is_server_error() => {
            Some(DownloadError::Transient(format!("服务器返回 {}", s)))
        }
        s if s.is_client_error() => {
            Some(DownloadError::Fatal(format!("服务器返回 {}", s)))
        }
        s => Some(DownloadError::Transient(format!("非预期状态码 {}", s))),
    }
}
