//! 下载池管理器
//!
//! 进程级状态：下载句柄表、等待队列与全局并发闸门。
//! 新请求经校验与去重后排队，闸门有空位时启动执行协程；
//! 暂停通过取消父级令牌完成，残留区间在执行协程内收取并持久化。
//! 所有状态变化以事件形式发布到广播总线

pub mod events;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::Settings;
use crate::engine::{
    build_client, partial_path, probe, ConcurrentDownloader, DownloadError, DownloadOutcome,
    MirrorStatus, ProgressState, SingleStreamDownloader, Task,
};
use crate::net;
use crate::state::{DownloadEntry, DownloadState, DownloadStatus, Store};
use crate::utils::sanitize_url;

pub use events::Event;

/// 进度事件发布间隔
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// 等待队列扫描间隔（兜底，正常靠完成/恢复时主动触发）
const QUEUE_SCAN_INTERVAL: Duration = Duration::from_millis(500);

/// 下载状态视图（供 CLI / UI / 扩展查询）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadStatusInfo {
    pub id: String,
    pub url: String,
    pub filename: String,
    pub status: DownloadStatus,
    pub total_size: u64,
    pub downloaded: u64,
    /// 瞬时速度（字节/秒）
    pub speed: u64,
    /// 预计剩余秒数（速度为零时为 None）
    pub eta_secs: Option<u64>,
    pub active_connections: usize,
    pub mirrors: Vec<MirrorStatus>,
}

/// 单个下载的运行句柄
struct DownloadHandle {
    entry: Mutex<DownloadEntry>,
    headers: HashMap<String, String>,
    /// 父级取消令牌，恢复时换新
    cancel: Mutex<CancellationToken>,
    state: Mutex<Option<Arc<ProgressState>>>,
    downloader: Mutex<Option<Arc<ConcurrentDownloader>>>,
    /// 最近一次计算的瞬时速度
    speed: AtomicU64,
}

impl DownloadHandle {
    fn new(entry: DownloadEntry, headers: HashMap<String, String>) -> Arc<Self> {
        Arc::new(Self {
            entry: Mutex::new(entry),
            headers,
            cancel: Mutex::new(CancellationToken::new()),
            state: Mutex::new(None),
            downloader: Mutex::new(None),
            speed: AtomicU64::new(0),
        })
    }

    fn status(&self) -> DownloadStatus {
        self.entry.lock().status
    }
}

/// 下载池
pub struct WorkerPool {
    settings: Settings,
    store: Arc<Store>,
    downloads: DashMap<String, Arc<DownloadHandle>>,
    waiting: Mutex<VecDeque<String>>,
    /// 正在执行的下载数（暂停中的不占闸门）
    running: AtomicUsize,
    events: broadcast::Sender<Event>,
    /// 自引用，供执行协程持有池句柄
    weak_self: std::sync::OnceLock<std::sync::Weak<WorkerPool>>,
}

impl WorkerPool {
    /// 创建下载池并恢复持久化的未完成下载
    pub fn new(settings: Settings, store: Arc<Store>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let pool = Arc::new(Self {
            settings,
            store,
            downloads: DashMap::new(),
            waiting: Mutex::new(VecDeque::new()),
            running: AtomicUsize::new(0),
            events,
            weak_self: std::sync::OnceLock::new(),
        });
        let _ = pool.weak_self.set(Arc::downgrade(&pool));

        if let Err(e) = pool.restore() {
            warn!("恢复未完成下载失败: {}", e);
        }

        // 兜底扫描等待队列
        let weak = Arc::downgrade(&pool);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(QUEUE_SCAN_INTERVAL);
            loop {
                tick.tick().await;
                let Some(pool) = weak.upgrade() else { return };
                pool.try_start_queued();
            }
        });

        pool
    }

    /// 获取自身的 Arc 句柄（池销毁中时返回 None）
    fn arc(&self) -> Option<Arc<WorkerPool>> {
        self.weak_self.get().and_then(|weak| weak.upgrade())
    }

    /// 从存储恢复未完成下载；崩溃残留的 downloading/pausing 置为 paused
    fn restore(&self) -> Result<()> {
        let entries = self.store.unfinished()?;
        let auto_resume = self.settings.general.auto_resume;
        let mut restored = 0;

        for mut entry in entries {
            if matches!(
                entry.status,
                DownloadStatus::Downloading | DownloadStatus::Pausing
            ) {
                entry.status = DownloadStatus::Paused;
                let _ = self.store.update_status(&entry.id, DownloadStatus::Paused);
            }

            let id = entry.id.clone();
            let queue_it =
                entry.status == DownloadStatus::Queued || (auto_resume && entry.status == DownloadStatus::Paused);
            if queue_it {
                entry.status = DownloadStatus::Queued;
                self.waiting.lock().push_back(id.clone());
            }
            self.downloads
                .insert(id, DownloadHandle::new(entry, HashMap::new()));
            restored += 1;
        }

        if restored > 0 {
            info!("已恢复 {} 个未完成下载", restored);
        }
        Ok(())
    }

    /// 发布事件
    pub fn publish(&self, event: Event) {
        let _ = self.events.send(event);
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// 当前事件订阅者数量（用于判断是否有 UI 在线）
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// 新增下载
    ///
    /// 校验 URL 与目标主机（SSRF 防护），拒绝同 URL 的非终态重复，
    /// 入队后由闸门决定何时启动
    pub async fn add(
        &self,
        url: &str,
        out_dir: &Path,
        filename: Option<String>,
        mirrors: Vec<String>,
        headers: HashMap<String, String>,
    ) -> Result<String> {
        let parsed = Url::parse(url).context("URL 格式无效")?;
        net::check_url_allowed(url).await?;
        for mirror in &mirrors {
            net::check_url_allowed(mirror).await?;
        }

        if self.has_download(url) {
            bail!("重复下载: 同一 URL 已在进行中");
        }

        let filename = filename
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| derive_filename(&parsed));
        let dest_path = out_dir.join(&filename);

        let mut entry = DownloadEntry::new(
            url.to_string(),
            dest_path.to_string_lossy().to_string(),
            filename.clone(),
        );
        entry.mirrors = mirrors;
        self.store.upsert_entry(&entry).context("写入下载记录失败")?;

        let id = entry.id.clone();
        info!("新增下载 {}: {}", id, sanitize_url(url));

        self.downloads
            .insert(id.clone(), DownloadHandle::new(entry, headers));
        self.waiting.lock().push_back(id.clone());
        self.publish(Event::Queued {
            id: id.clone(),
            url: url.to_string(),
            filename,
        });

        self.try_start_queued();
        Ok(id)
    }

    /// 同 URL 是否存在非终态下载
    pub fn has_download(&self, url: &str) -> bool {
        self.downloads.iter().any(|item| {
            let entry = item.value().entry.lock();
            entry.url == url && !entry.status.is_terminal()
        })
    }

    /// 当前全部下载记录快照
    pub fn get_all(&self) -> Vec<DownloadEntry> {
        self.downloads
            .iter()
            .map(|item| item.value().entry.lock().clone())
            .collect()
    }

    /// 状态视图列表
    pub fn list(&self) -> Vec<DownloadStatusInfo> {
        self.downloads
            .iter()
            .map(|item| self.status_info(item.value()))
            .collect()
    }

    /// 单个下载的状态视图
    pub fn get_status(&self, id: &str) -> Result<DownloadStatusInfo> {
        let handle = self
            .downloads
            .get(id)
            .with_context(|| format!("下载记录不存在: {}", id))?;
        Ok(self.status_info(handle.value()))
    }

    fn status_info(&self, handle: &DownloadHandle) -> DownloadStatusInfo {
        let entry = handle.entry.lock().clone();
        let state = handle.state.lock().clone();
        let speed = handle.speed.load(Ordering::Acquire);

        let (downloaded, active, mirrors) = match &state {
            Some(s) if !entry.status.is_terminal() => (
                s.downloaded(),
                s.active_workers(),
                s.get_mirrors(),
            ),
            _ => (
                entry.downloaded,
                0,
                entry.mirrors.iter().cloned().map(MirrorStatus::new).collect(),
            ),
        };

        let eta_secs = if speed > 0 && entry.total_size > downloaded {
            Some((entry.total_size - downloaded) / speed)
        } else {
            None
        };

        DownloadStatusInfo {
            id: entry.id,
            url: entry.url,
            filename: entry.filename,
            status: entry.status,
            total_size: entry.total_size,
            downloaded,
            speed,
            eta_secs,
            active_connections: active,
            mirrors,
        }
    }

    /// 历史记录（已完成下载）
    pub fn history(&self) -> Result<Vec<DownloadEntry>> {
        self.store.completed()
    }

    /// 把部分 ID 解析为完整 ID（唯一前缀匹配）
    pub fn resolve_id(&self, prefix: &str) -> Result<String> {
        let matches: Vec<String> = self
            .downloads
            .iter()
            .map(|item| item.key().clone())
            .filter(|id| id.starts_with(prefix))
            .collect();
        match matches.len() {
            0 => bail!("找不到匹配的下载: {}", prefix),
            1 => Ok(matches.into_iter().next().unwrap_or_default()),
            _ => bail!("ID 前缀不唯一: {}", prefix),
        }
    }

    /// 暂停下载
    ///
    /// 运行中的通过取消父级令牌异步完成（执行协程负责收取残留
    /// 区间并持久化）；排队中的直接落库
    pub fn pause(&self, id: &str) -> Result<()> {
        let handle = self
            .downloads
            .get(id)
            .with_context(|| format!("下载记录不存在: {}", id))?;

        let status = handle.status();
        match status {
            DownloadStatus::Downloading => {
                handle.entry.lock().status = DownloadStatus::Pausing;
                handle.cancel.lock().cancel();
                info!("暂停下载 {} (等待残留区间收取)", id);
                Ok(())
            }
            DownloadStatus::Queued => {
                self.waiting.lock().retain(|queued| queued != id);
                {
                    let mut entry = handle.entry.lock();
                    entry.status = DownloadStatus::Paused;
                    entry.paused_at = Some(Utc::now().timestamp());
                    let _ = self.store.upsert_entry(&entry);
                }
                self.publish(Event::Paused { id: id.to_string() });
                info!("暂停排队中的下载 {}", id);
                Ok(())
            }
            _ => bail!("当前状态无法暂停: {}", status),
        }
    }

    /// 暂停所有可暂停的下载
    pub fn pause_all(&self) -> Result<()> {
        let ids: Vec<String> = self
            .downloads
            .iter()
            .filter(|item| {
                matches!(
                    item.value().status(),
                    DownloadStatus::Downloading | DownloadStatus::Queued
                )
            })
            .map(|item| item.key().clone())
            .collect();

        for id in ids {
            if let Err(e) = self.pause(&id) {
                debug!("暂停 {} 失败: {}", id, e);
            }
        }
        Ok(())
    }

    /// 恢复已暂停（或失败）的下载
    pub fn resume(&self, id: &str) -> Result<()> {
        let handle = self
            .downloads
            .get(id)
            .with_context(|| format!("下载记录不存在: {}", id))?;

        let status = handle.status();
        if !matches!(status, DownloadStatus::Paused | DownloadStatus::Error) {
            bail!("当前状态无法恢复: {}", status);
        }

        // 旧令牌已取消，换新
        *handle.cancel.lock() = CancellationToken::new();
        handle.entry.lock().status = DownloadStatus::Queued;
        let _ = self.store.update_status(id, DownloadStatus::Queued);

        self.waiting.lock().push_back(id.to_string());
        self.publish(Event::Resumed { id: id.to_string() });
        info!("恢复下载 {}", id);

        drop(handle);
        self.try_start_queued();
        Ok(())
    }

    /// 删除下载：取消执行、删除记录与部分文件
    pub fn delete(&self, id: &str) -> Result<()> {
        self.waiting.lock().retain(|queued| queued != id);

        if let Some((_, handle)) = self.downloads.remove(id) {
            handle.cancel.lock().cancel();
            let entry = handle.entry.lock();
            let part = partial_path(Path::new(&entry.dest_path));
            if part.exists() {
                if let Err(e) = std::fs::remove_file(&part) {
                    warn!("删除部分文件失败: {:?}, {}", part, e);
                }
            }
        }

        self.store.delete(id)?;
        self.publish(Event::Removed { id: id.to_string() });
        info!("删除下载 {}", id);
        Ok(())
    }

    /// 闸门允许时启动排队中的下载
    fn try_start_queued(&self) {
        let max = self.settings.connections.max_global_connections;
        loop {
            if self.running.load(Ordering::Acquire) >= max {
                return;
            }
            let Some(id) = self.waiting.lock().pop_front() else {
                return;
            };
            let Some(handle) = self.downloads.get(&id).map(|h| h.value().clone()) else {
                continue;
            };
            if handle.status() != DownloadStatus::Queued {
                continue;
            }

            let Some(pool) = self.arc() else { return };
            self.running.fetch_add(1, Ordering::AcqRel);
            tokio::spawn(async move {
                pool.run_download(&id, handle).await;
                pool.running.fetch_sub(1, Ordering::AcqRel);
                pool.try_start_queued();
            });
        }
    }

    /// 执行单个下载的完整生命周期
    async fn run_download(&self, id: &str, handle: Arc<DownloadHandle>) {
        let (url, dest_path, mirrors) = {
            let mut entry = handle.entry.lock();
            entry.status = DownloadStatus::Downloading;
            let _ = self.store.upsert_entry(&entry);
            (
                entry.url.clone(),
                PathBuf::from(&entry.dest_path),
                entry.mirrors.clone(),
            )
        };

        let client = match build_client(&self.settings) {
            Ok(client) => client,
            Err(e) => {
                self.fail_download(id, &handle, &DownloadError::Fatal(format!(
                    "构建 HTTP 客户端失败: {}",
                    e
                )), Vec::new());
                return;
            }
        };

        // 探测大小与断点支持；主源失败时依次尝试镜像
        let mut probe_result = None;
        let mut probe_err = None;
        for candidate in std::iter::once(&url).chain(mirrors.iter()) {
            match probe(
                &client,
                candidate,
                &self.settings.connections.user_agent,
                &handle.headers,
            )
            .await
            {
                Ok(result) => {
                    probe_result = Some(result);
                    break;
                }
                Err(e) => {
                    warn!("探测 {} 失败: {}", sanitize_url(candidate), e);
                    probe_err = Some(e);
                }
            }
        }
        let Some(probe_result) = probe_result else {
            let err = probe_err
                .unwrap_or_else(|| DownloadError::Transient("探测失败".to_string()));
            self.fail_download(id, &handle, &err, Vec::new());
            return;
        };

        let cancel = handle.cancel.lock().clone();
        if probe_result.supports_ranges && probe_result.total_size > 0 {
            self.run_concurrent(id, &handle, client, cancel, url, dest_path, mirrors, probe_result.total_size as u64)
                .await;
        } else {
            self.run_single(id, &handle, client, cancel, url, dest_path, probe_result.total_size)
                .await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_concurrent(
        &self,
        id: &str,
        handle: &Arc<DownloadHandle>,
        client: reqwest::Client,
        cancel: CancellationToken,
        url: String,
        dest_path: PathBuf,
        mirrors: Vec<String>,
        total_size: u64,
    ) {
        let state = Arc::new(ProgressState::new(id, total_size));

        // 断点恢复：残留任务原样入队，已写入的字节绝不重取
        let mut resume_tasks: Option<Vec<Task>> = None;
        match self.store.load_state(&url, &dest_path.to_string_lossy()) {
            Ok(Some(saved)) if saved.entry.total_size == total_size && !saved.tasks.is_empty() => {
                let residual: u64 = saved.tasks.iter().map(|t| t.length).sum();
                state.set_downloaded(total_size.saturating_sub(residual));
                state.set_actual_chunk_size(saved.entry.actual_chunk_size);
                state.set_elapsed_ns((saved.entry.time_taken_ms as u64).saturating_mul(1_000_000));
                if !saved.entry.chunk_bitmap.is_empty() {
                    state.set_bitmap_bytes(&saved.entry.chunk_bitmap);
                }
                info!(
                    "下载 {} 发现断点: 已完成 {} / {} 字节",
                    id,
                    state.downloaded(),
                    total_size
                );
                resume_tasks = Some(saved.tasks);
            }
            Ok(_) => {}
            Err(e) => warn!("加载断点状态失败: {}", e),
        }

        {
            let mut entry = handle.entry.lock();
            entry.total_size = total_size;
            entry.downloaded = state.downloaded();
            let _ = self.store.upsert_entry(&entry);
        }
        *handle.state.lock() = Some(state.clone());

        self.publish(Event::Started {
            id: id.to_string(),
            total_size,
        });

        let downloader = Arc::new(ConcurrentDownloader::new(
            id,
            client,
            Some(state.clone()),
            self.settings.clone(),
            handle.headers.clone(),
        ));
        *handle.downloader.lock() = Some(downloader.clone());

        // 进度发布与定期保存
        let ctl = CancellationToken::new();
        self.spawn_progress_publisher(id.to_string(), handle.clone(), state.clone(), ctl.clone());
        self.spawn_checkpointer(handle.clone(), downloader.clone(), state.clone(), ctl.clone());

        let mut urls = vec![url];
        urls.extend(mirrors);
        let outcome = downloader
            .download(cancel, urls, &dest_path, total_size, resume_tasks)
            .await;
        ctl.cancel();
        *handle.downloader.lock() = None;

        match outcome {
            Ok(DownloadOutcome::Completed { final_path }) => {
                state.set_done();
                self.complete_download(id, handle, &state, &final_path);
            }
            Ok(DownloadOutcome::Cancelled) => {
                let residuals = downloader.harvest_residuals();
                self.pause_download(id, handle, &state, residuals);
            }
            Err(e) => {
                let residuals = downloader.harvest_residuals();
                state.set_done();
                self.fail_download(id, handle, &e, residuals);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_single(
        &self,
        id: &str,
        handle: &Arc<DownloadHandle>,
        client: reqwest::Client,
        cancel: CancellationToken,
        url: String,
        dest_path: PathBuf,
        total_size: i64,
    ) {
        let known_total = total_size.max(0) as u64;
        let state = Arc::new(ProgressState::new(id, known_total));
        *handle.state.lock() = Some(state.clone());
        {
            let mut entry = handle.entry.lock();
            entry.total_size = known_total;
            let _ = self.store.upsert_entry(&entry);
        }

        self.publish(Event::Started {
            id: id.to_string(),
            total_size: known_total,
        });

        let ctl = CancellationToken::new();
        self.spawn_progress_publisher(id.to_string(), handle.clone(), state.clone(), ctl.clone());

        let single = SingleStreamDownloader::new(
            id,
            client,
            Some(state.clone()),
            self.settings.clone(),
            handle.headers.clone(),
        );
        let outcome = single.download(cancel, &url, &dest_path).await;
        ctl.cancel();

        match outcome {
            Ok(DownloadOutcome::Completed { final_path }) => {
                // 大小未知时以实际写入为准
                let mut entry = handle.entry.lock();
                entry.total_size = state.downloaded().max(known_total);
                drop(entry);
                self.complete_download(id, handle, &state, &final_path);
            }
            Ok(DownloadOutcome::Cancelled) => {
                // 单连接不支持断点，暂停即从头再来
                if self.downloads.contains_key(id) {
                    {
                        let mut entry = handle.entry.lock();
                        entry.status = DownloadStatus::Paused;
                        entry.paused_at = Some(Utc::now().timestamp());
                        entry.downloaded = 0;
                        let mut persisted = DownloadState {
                            entry: entry.clone(),
                            tasks: Vec::new(),
                        };
                        if let Err(e) = self.store.save_state(&mut persisted) {
                            error!("保存暂停状态失败: {}", e);
                        }
                    }
                    self.publish(Event::Paused { id: id.to_string() });
                }
            }
            Err(e) => {
                self.fail_download(id, handle, &e, Vec::new());
            }
        }
    }

    fn complete_download(
        &self,
        id: &str,
        handle: &Arc<DownloadHandle>,
        state: &Arc<ProgressState>,
        final_path: &Path,
    ) {
        let time_taken_ms = (state.elapsed_ns() / 1_000_000) as i64;
        {
            // 持有句柄锁落库，和定期保存协程串行化
            let mut entry = handle.entry.lock();
            entry.status = DownloadStatus::Completed;
            entry.downloaded = entry.total_size.max(state.downloaded());
            entry.total_size = entry.downloaded;
            entry.completed_at = Some(Utc::now().timestamp());
            entry.time_taken_ms = time_taken_ms;
            entry.dest_path = final_path.to_string_lossy().to_string();
            entry.actual_chunk_size = state.actual_chunk_size();
            entry.chunk_bitmap = state.bitmap_bytes();
            let mut persisted = DownloadState {
                entry: entry.clone(),
                tasks: Vec::new(),
            };
            if let Err(e) = self.store.save_state(&mut persisted) {
                error!("保存完成状态失败: {}", e);
            }
        }

        self.publish(Event::Complete {
            id: id.to_string(),
            path: final_path.to_string_lossy().to_string(),
            time_taken_ms,
        });
    }

    fn pause_download(
        &self,
        id: &str,
        handle: &Arc<DownloadHandle>,
        state: &Arc<ProgressState>,
        residuals: Vec<Task>,
    ) {
        // 下载已被删除时不再回写记录
        if !self.downloads.contains_key(id) {
            debug!("下载 {} 已删除，跳过暂停持久化", id);
            return;
        }

        state.update_bitmap_from_residuals(&residuals);
        let residual_bytes: u64 = residuals.iter().map(|t| t.length).sum();

        let residual_count = residuals.len();
        {
            let mut entry = handle.entry.lock();
            entry.status = DownloadStatus::Paused;
            entry.paused_at = Some(Utc::now().timestamp());
            // 残留区间是权威数据，downloaded 与之对账
            if entry.total_size > 0 {
                entry.downloaded = entry.total_size.saturating_sub(residual_bytes);
            } else {
                entry.downloaded = 0;
            }
            entry.time_taken_ms = (state.elapsed_ns() / 1_000_000) as i64;
            entry.actual_chunk_size = state.actual_chunk_size();
            entry.chunk_bitmap = state.bitmap_bytes();
            let mut persisted = DownloadState {
                entry: entry.clone(),
                tasks: residuals,
            };
            if let Err(e) = self.store.save_state(&mut persisted) {
                error!("保存暂停状态失败: {}", e);
            }
        }

        self.publish(Event::Paused { id: id.to_string() });
        info!("下载 {} 已暂停: 剩余 {} 个残留区间", id, residual_count);
    }

    fn fail_download(
        &self,
        id: &str,
        handle: &Arc<DownloadHandle>,
        err: &DownloadError,
        residuals: Vec<Task>,
    ) {
        // 下载已被删除时不再回写记录
        if !self.downloads.contains_key(id) {
            debug!("下载 {} 已删除，跳过失败持久化", id);
            return;
        }

        {
            let mut entry = handle.entry.lock();
            entry.status = DownloadStatus::Error;
            let mut persisted = DownloadState {
                entry: entry.clone(),
                tasks: residuals,
            };
            if let Err(e) = self.store.save_state(&mut persisted) {
                error!("保存失败状态失败: {}", e);
            }
        }

        error!("下载 {} 失败: {}", id, err);
        self.publish(Event::Error {
            id: id.to_string(),
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
    }

    /// 进度事件发布协程
    fn spawn_progress_publisher(
        &self,
        id: String,
        handle: Arc<DownloadHandle>,
        state: Arc<ProgressState>,
        ctl: CancellationToken,
    ) {
        let Some(pool) = self.arc() else { return };
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PROGRESS_INTERVAL);
            let mut last_downloaded = state.downloaded();
            let mut last_instant = std::time::Instant::now();

            loop {
                tokio::select! {
                    _ = ctl.cancelled() => return,
                    _ = tick.tick() => {}
                }

                let downloaded = state.downloaded();
                let elapsed = last_instant.elapsed().as_secs_f64();
                let speed = if elapsed > 0.0 {
                    ((downloaded.saturating_sub(last_downloaded)) as f64 / elapsed) as u64
                } else {
                    0
                };
                last_downloaded = downloaded;
                last_instant = std::time::Instant::now();
                handle.speed.store(speed, Ordering::Release);

                pool.publish(Event::Progress {
                    id: id.clone(),
                    downloaded,
                    total_size: state.total_size,
                    speed,
                    active_connections: state.active_workers(),
                });
            }
        });
    }

    /// 定期保存断点协程
    ///
    /// 崩溃时最多丢失一个保存间隔内的进度记账，
    /// 已写入磁盘的数据本身不会丢
    fn spawn_checkpointer(
        &self,
        handle: Arc<DownloadHandle>,
        downloader: Arc<ConcurrentDownloader>,
        state: Arc<ProgressState>,
        ctl: CancellationToken,
    ) {
        let Some(pool) = self.arc() else { return };
        let interval = self.settings.checkpoint_interval();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            // 第一个 tick 立即返回，跳过
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = ctl.cancelled() => return,
                    _ = tick.tick() => {}
                }

                let residuals = downloader.residual_snapshot();
                state.update_bitmap_from_residuals(&residuals);
                let residual_bytes: u64 = residuals.iter().map(|t| t.length).sum();

                {
                    let mut entry = handle.entry.lock();
                    // 状态检查与落库同锁，避免与暂停/完成的保存交错
                    if entry.status != DownloadStatus::Downloading {
                        return;
                    }
                    entry.downloaded = entry.total_size.saturating_sub(residual_bytes);
                    entry.time_taken_ms = (state.elapsed_ns() / 1_000_000) as i64;
                    entry.actual_chunk_size = state.actual_chunk_size();
                    entry.chunk_bitmap = state.bitmap_bytes();
                    let mut persisted = DownloadState {
                        entry: entry.clone(),
                        tasks: residuals,
                    };
                    if let Err(e) = pool.store.save_state(&mut persisted) {
                        warn!("定期保存状态失败: {}", e);
                    }
                }
            }
        });
    }

    /// 优雅关闭：暂停所有下载并等待执行协程退出
    pub async fn shutdown(&self) {
        info!("下载池开始关闭，暂停所有下载...");
        let _ = self.pause_all();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while self.running.load(Ordering::Acquire) > 0 {
            if std::time::Instant::now() > deadline {
                warn!("等待下载协程退出超时");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("下载池已关闭");
    }
}

/// 从 URL 推导文件名（最后一段路径，空时回退到 download）
fn derive_filename(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "download".to_string())
}
