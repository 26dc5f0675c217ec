//! HTTP 端点处理器
//!
//! 下载的增删查、暂停恢复、历史与 SSE 事件流。
//! /download 的路径参数做穿越校验，解析后的目录必须落在
//! 默认下载目录之内

use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    Json,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pool::Event;
use crate::utils::{ensure_abs_path, sanitize_url};

use super::ServerState;

/// 浏览器扩展 / CLI 的下载请求体
#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub relative_to_default_dir: bool,
    #[serde(default)]
    pub mirrors: Vec<String>,
    /// 扩展已确认过的请求，跳过 UI 审批
    #[serde(default)]
    pub skip_approval: bool,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub id: String,
}

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// 逗号分隔的 URL 参数拆成主源 + 镜像
fn parse_url_arg(raw: &str) -> (String, Vec<String>) {
    let mut parts = raw.split(',').map(|s| s.trim().to_string());
    let primary = parts.next().unwrap_or_default();
    let mirrors: Vec<String> = parts.filter(|s| !s.is_empty()).collect();
    (primary, mirrors)
}

/// POST /download
pub async fn create_download(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<DownloadRequest>,
) -> (StatusCode, Json<Value>) {
    if req.url.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "message": "URL 不能为空" })),
        );
    }

    // 路径穿越校验
    let filename = req.filename.clone().unwrap_or_default();
    let path = req.path.clone().unwrap_or_default();
    if path.contains("..") || filename.contains("..") {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "status": "error", "message": "非法路径" })),
        );
    }
    if filename.contains('/') || filename.contains('\\') {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "message": "非法文件名" })),
        );
    }

    debug!(
        "收到下载请求: url={}, path={}",
        sanitize_url(&req.url),
        path
    );

    // 解析输出目录，必须位于默认下载目录内
    let base_dir = ensure_abs_path(&PathBuf::from(
        &state.settings.general.default_download_dir,
    ));
    let out_dir = if req.relative_to_default_dir && !path.is_empty() {
        base_dir.join(&path)
    } else if !path.is_empty() {
        PathBuf::from(&path)
    } else {
        base_dir.clone()
    };
    let out_dir = ensure_abs_path(&out_dir);

    if !out_dir.starts_with(&base_dir) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({
                "status": "error",
                "message": "下载路径必须位于默认下载目录内"
            })),
        );
    }

    if let Err(e) = std::fs::create_dir_all(&out_dir) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "message": format!("创建目录失败: {}", e) })),
        );
    }

    // URL 里可能带逗号分隔的镜像列表
    let (url, mut mirrors) = if req.mirrors.is_empty() && req.url.contains(',') {
        parse_url_arg(&req.url)
    } else {
        (req.url.clone(), Vec::new())
    };
    if mirrors.is_empty() {
        mirrors = req.mirrors.clone();
    }

    let is_duplicate = state.pool.has_download(&url);

    // 审批逻辑：扩展确认过的请求直接放行；否则在需要时
    // 转交 UI 确认，无 UI（无事件订阅者）时拒绝
    if !req.skip_approval {
        let settings = &state.settings.general;
        let should_prompt =
            settings.extension_prompt || (settings.warn_on_duplicate && is_duplicate);
        if should_prompt {
            if state.pool.subscriber_count() > 0 {
                let pending_id = Uuid::new_v4().to_string();
                state.pool.publish(Event::Request {
                    id: pending_id.clone(),
                    url: url.clone(),
                    filename: filename.clone(),
                    path: out_dir.to_string_lossy().to_string(),
                    mirrors: mirrors.clone(),
                    headers: req.headers.clone(),
                });
                return (
                    StatusCode::ACCEPTED,
                    Json(json!({
                        "status": "pending_approval",
                        "message": "下载请求已转交 UI 确认",
                        "id": pending_id,
                    })),
                );
            }
            return (
                StatusCode::CONFLICT,
                Json(json!({
                    "status": "error",
                    "message": "重复下载或需要审批（无 UI 模式下已拒绝）"
                })),
            );
        }
    }

    let filename_opt = (!filename.is_empty()).then_some(filename);
    match state
        .pool
        .add(&url, &out_dir, filename_opt, mirrors, req.headers)
        .await
    {
        Ok(id) => (
            StatusCode::OK,
            Json(json!({
                "status": "queued",
                "message": "下载已入队",
                "id": id,
            })),
        ),
        Err(e) => {
            warn!("新增下载失败: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "message": e.to_string() })),
            )
        }
    }
}

/// GET /download?id=
pub async fn get_download(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<IdQuery>,
) -> Result<Json<Value>, StatusCode> {
    match state.pool.get_status(&query.id) {
        Ok(info) => Ok(Json(serde_json::to_value(info).unwrap_or(Value::Null))),
        Err(_) => Err(StatusCode::NOT_FOUND),
    }
}

/// POST /pause?id=
pub async fn pause_download(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<IdQuery>,
) -> Result<Json<Value>, (StatusCode, String)> {
    state
        .pool
        .pause(&query.id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "status": "paused", "id": query.id })))
}

/// POST /pause-all
pub async fn pause_all(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Value>, (StatusCode, String)> {
    state
        .pool
        .pause_all()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "status": "paused_all" })))
}

/// POST /resume?id=
pub async fn resume_download(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<IdQuery>,
) -> Result<Json<Value>, (StatusCode, String)> {
    state
        .pool
        .resume(&query.id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "status": "resumed", "id": query.id })))
}

/// DELETE /download?id=
pub async fn delete_download(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<IdQuery>,
) -> Result<Json<Value>, (StatusCode, String)> {
    state
        .pool
        .delete(&query.id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "status": "deleted", "id": query.id })))
}

/// GET /list
pub async fn list_downloads(State(state): State<Arc<ServerState>>) -> Json<Value> {
    Json(serde_json::to_value(state.pool.list()).unwrap_or_else(|_| json!([])))
}

/// GET /history
pub async fn history(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let entries = state
        .pool
        .history()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::to_value(entries).unwrap_or_else(|_| json!([]))))
}

/// GET /events — SSE 事件流
///
/// 每条事件为 `event: <类型>` + `data: <json>`
pub async fn events(
    State(state): State<Arc<ServerState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.pool.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(event) => {
            let data = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok(SseEvent::default().event(event.event_type()).data(data)))
        }
        // 消费过慢被挤掉的事件直接跳过
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url_arg() {
        let (url, mirrors) = parse_url_arg("http://a.example/f,http://b.example/f");
        assert_eq!(url, "http://a.example/f");
        assert_eq!(mirrors, vec!["http://b.example/f".to_string()]);

        let (url, mirrors) = parse_url_arg("http://a.example/f");
        assert_eq!(url, "http://a.example/f");
        assert!(mirrors.is_empty());
    }
}
