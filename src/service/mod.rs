//! 下载服务契约
//!
//! CLI、终端 UI 与浏览器扩展消费同一套操作。本地实现直接驱动
//! 下载池；远端实现通过 HTTP 调用正在运行的守护进程，
//! 两者可互换（CLI 有守护进程时走远端，否则走本地）

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::pool::{DownloadStatusInfo, Event, WorkerPool};
use crate::state::DownloadEntry;

/// 下载服务契约
#[async_trait]
pub trait DownloadService: Send + Sync {
    /// 新增下载，返回下载 ID
    async fn add(
        &self,
        url: &str,
        out_dir: &Path,
        filename: Option<String>,
        mirrors: Vec<String>,
        headers: HashMap<String, String>,
    ) -> Result<String>;

    async fn pause(&self, id: &str) -> Result<()>;
    async fn pause_all(&self) -> Result<()>;
    async fn resume(&self, id: &str) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;

    async fn get_status(&self, id: &str) -> Result<DownloadStatusInfo>;
    async fn list(&self) -> Result<Vec<DownloadStatusInfo>>;
    async fn history(&self) -> Result<Vec<DownloadEntry>>;

    /// 订阅事件流
    async fn stream_events(&self) -> Result<broadcast::Receiver<Event>>;

    /// 发布事件（扩展审批流转等）
    async fn publish(&self, event: Event) -> Result<()>;
}

/// 本地实现：直接驱动下载池
pub struct LocalDownloadService {
    pool: Arc<WorkerPool>,
}

impl LocalDownloadService {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }
}

#[async_trait]
impl DownloadService for LocalDownloadService {
    async fn add(
        &self,
        url: &str,
        out_dir: &Path,
        filename: Option<String>,
        mirrors: Vec<String>,
        headers: HashMap<String, String>,
    ) -> Result<String> {
        self.pool.add(url, out_dir, filename, mirrors, headers).await
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.pool.pause(id)
    }

    async fn pause_all(&self) -> Result<()> {
        self.pool.pause_all()
    }

    async fn resume(&self, id: &str) -> Result<()> {
        self.pool.resume(id)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.pool.delete(id)
    }

    async fn get_status(&self, id: &str) -> Result<DownloadStatusInfo> {
        self.pool.get_status(id)
    }

    async fn list(&self) -> Result<Vec<DownloadStatusInfo>> {
        Ok(self.pool.list())
    }

    async fn history(&self) -> Result<Vec<DownloadEntry>> {
        self.pool.history()
    }

    async fn stream_events(&self) -> Result<broadcast::Receiver<Event>> {
        Ok(self.pool.subscribe())
    }

    async fn publish(&self, event: Event) -> Result<()> {
        self.pool.publish(event);
        Ok(())
    }
}

/// 远端实现：HTTP 调用运行中的守护进程
pub struct RemoteDownloadService {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl RemoteDownloadService {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post(&self, path: &str) -> Result<()> {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("请求守护进程失败")?;
        if !resp.status().is_success() {
            bail!("守护进程返回 {}: {}", resp.status(), resp.text().await.unwrap_or_default());
        }
        Ok(())
    }
}

/// POST /download 请求体（与守护进程端点一致）
#[derive(serde::Serialize)]
struct AddRequest<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    filename: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    mirrors: Vec<String>,
    skip_approval: bool,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    headers: HashMap<String, String>,
}

#[derive(serde::Deserialize)]
struct AddResponse {
    id: String,
}

#[async_trait]
impl DownloadService for RemoteDownloadService {
    async fn add(
        &self,
        url: &str,
        out_dir: &Path,
        filename: Option<String>,
        mirrors: Vec<String>,
        headers: HashMap<String, String>,
    ) -> Result<String> {
        let out_dir = out_dir.to_string_lossy();
        let body = AddRequest {
            url,
            filename: filename.as_deref(),
            path: Some(out_dir.as_ref()),
            mirrors,
            skip_approval: true,
            headers,
        };
        let resp = self
            .client
            .post(self.url("/download"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .context("请求守护进程失败")?;
        if !resp.status().is_success() {
            bail!("守护进程返回 {}: {}", resp.status(), resp.text().await.unwrap_or_default());
        }
        let parsed: AddResponse = resp.json().await.context("解析响应失败")?;
        Ok(parsed.id)
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.post(&format!("/pause?id={}", id)).await
    }

    async fn pause_all(&self) -> Result<()> {
        self.post("/pause-all").await
    }

    async fn resume(&self, id: &str) -> Result<()> {
        self.post(&format!("/resume?id={}", id)).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/download?id={}", id)))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("请求守护进程失败")?;
        if !resp.status().is_success() {
            bail!("守护进程返回 {}", resp.status());
        }
        Ok(())
    }

    async fn get_status(&self, id: &str) -> Result<DownloadStatusInfo> {
        let resp = self
            .client
            .get(self.url(&format!("/download?id={}", id)))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("请求守护进程失败")?;
        if !resp.status().is_success() {
            bail!("守护进程返回 {}", resp.status());
        }
        resp.json().await.context("解析响应失败")
    }

    async fn list(&self) -> Result<Vec<DownloadStatusInfo>> {
        let resp = self
            .client
            .get(self.url("/list"))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("请求守护进程失败")?;
        if !resp.status().is_success() {
            bail!("守护进程返回 {}", resp.status());
        }
        resp.json().await.context("解析响应失败")
    }

    async fn history(&self) -> Result<Vec<DownloadEntry>> {
        let resp = self
            .client
            .get(self.url("/history"))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("请求守护进程失败")?;
        if !resp.status().is_success() {
            bail!("守护进程返回 {}", resp.status());
        }
        resp.json().await.context("解析响应失败")
    }

    /// 订阅守护进程的 SSE 事件流并转成本地广播
    async fn stream_events(&self) -> Result<broadcast::Receiver<Event>> {
        let resp = self
            .client
            .get(self.url("/events"))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("连接事件流失败")?;
        if !resp.status().is_success() {
            bail!("守护进程返回 {}", resp.status());
        }

        let (tx, rx) = broadcast::channel(256);
        tokio::spawn(async move {
            use futures::StreamExt;
            let mut stream = resp.bytes_stream();
            let mut pending = String::new();

            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else { break };
                pending.push_str(&String::from_utf8_lossy(&chunk));

                // SSE 以空行分隔事件
                while let Some(pos) = pending.find("\n\n") {
                    let block: String = pending.drain(..pos + 2).collect();
                    for line in block.lines() {
                        if let Some(data) = line.strip_prefix("data: ") {
                            match serde_json::from_str::<Event>(data) {
                                Ok(event) => {
                                    if tx.send(event).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => debug!("忽略无法解析的事件: {}", e),
                            }
                        }
                    }
                }
            }
            warn!("守护进程事件流已断开");
        });

        Ok(rx)
    }

    async fn publish(&self, _event: Event) -> Result<()> {
        bail!("远端服务不支持发布事件")
    }
}
