//! 下载事件
//!
//! 通过进程内广播总线发布，SSE 端点与 UI 订阅同一路事件。
//! event_type 与 SSE 的 event 字段一一对应

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// 下载事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum Event {
    /// 已加入队列
    Queued {
        id: String,
        url: String,
        filename: String,
    },
    /// 开始下载
    Started { id: String, total_size: u64 },
    /// 进度更新
    Progress {
        id: String,
        downloaded: u64,
        total_size: u64,
        /// 瞬时速度（字节/秒）
        speed: u64,
        active_connections: usize,
    },
    /// 已暂停
    Paused { id: String },
    /// 已恢复
    Resumed { id: String },
    /// 下载完成
    Complete {
        id: String,
        path: String,
        time_taken_ms: i64,
    },
    /// 下载失败
    Error {
        id: String,
        /// 错误类别（fatal / transient / integrity）
        kind: String,
        message: String,
    },
    /// 浏览器扩展请求待 UI 确认
    Request {
        id: String,
        url: String,
        filename: String,
        path: String,
        mirrors: Vec<String>,
        headers: HashMap<String, String>,
    },
    /// 记录已删除
    Removed { id: String },
}

impl Event {
    /// 事件所属的下载 ID
    pub fn id(&self) -> &str {
        match self {
            Event::Queued { id, .. } => id,
            Event::Started { id, .. } => id,
            Event::Progress { id, .. } => id,
            Event::Paused { id } => id,
            Event::Resumed { id } => id,
            Event::Complete { id, .. } => id,
            Event::Error { id, .. } => id,
            Event::Request { id, .. } => id,
            Event::Removed { id } => id,
        }
    }

    /// SSE 事件名
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::Queued { .. } => "queued",
            Event::Started { .. } => "started",
            Event::Progress { .. } => "progress",
            Event::Paused { .. } => "paused",
            Event::Resumed { .. } => "resumed",
            Event::Complete { .. } => "complete",
            Event::Error { .. } => "error",
            Event::Request { .. } => "request",
            Event::Removed { .. } => "removed",
        }
    }
}
