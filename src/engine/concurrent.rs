//! 并发下载器
//!
//! 单个下载的核心执行体：把文件切分为字节区间任务，由固定数量的
//! 工作协程消费；平衡器定期把慢协程的剩余区间劈给空闲协程，
//! 健康监控取消停滞或显著慢于中位数的任务并把剩余字节重新入队。
//! 所有写入经由唯一的写入协程落到稀疏文件的绝对偏移上

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{self, Settings, INCOMPLETE_SUFFIX};
use crate::utils::{format_size, unique_file_path};

use super::buffer::BufferPool;
use super::errors::{classify_status, DownloadError};
use super::progress::{MirrorStatus, ProgressState};
use super::queue::TaskQueue;
use super::task::{aligned_split_size, ActiveTask, Task};
use super::worker::{run_worker, WorkerContext};
use super::writer::AsyncWriter;

/// 平衡器扫描间隔
const STEAL_INTERVAL: Duration = Duration::from_millis(250);

/// 健康监控扫描间隔
const HEALTH_INTERVAL: Duration = Duration::from_secs(1);

/// 完成检测轮询间隔
const MONITOR_INTERVAL: Duration = Duration::from_millis(100);

/// 探测结果
#[derive(Debug, Clone, Copy)]
pub struct ProbeResult {
    /// 文件总大小（未知时为 -1）
    pub total_size: i64,
    /// 服务器是否支持 Range 请求
    pub supports_ranges: bool,
}

/// 探测目标资源：单字节 Range 请求确认大小与断点支持
///
/// 206 响应从 Content-Range 解析总大小；200 响应说明服务器
/// 忽略 Range，退化为单连接下载
pub async fn probe(
    client: &Client,
    url: &str,
    user_agent: &str,
    headers: &HashMap<String, String>,
) -> Result<ProbeResult, DownloadError> {
    let mut req = client
        .get(url)
        .header(reqwest::header::RANGE, "bytes=0-0")
        .header(reqwest::header::USER_AGENT, user_agent);
    for (k, v) in headers {
        req = req.header(k.as_str(), v.as_str());
    }

    let resp = req.send().await.map_err(DownloadError::from)?;
    let status = resp.status();

    if let Some(err) = classify_status(status) {
        return Err(err);
    }

    if status == reqwest::StatusCode::PARTIAL_CONTENT {
        // Content-Range: bytes 0-0/1234567
        let total = resp
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(-1);

        debug!("探测成功: 支持 Range, 总大小 {}", total);
        return Ok(ProbeResult {
            total_size: total,
            supports_ranges: total > 0,
        });
    }

    // 200：服务器忽略 Range 请求
    let total = resp.content_length().map(|l| l as i64).unwrap_or(-1);
    debug!("探测成功: 不支持 Range, 总大小 {}", total);
    Ok(ProbeResult {
        total_size: total,
        supports_ranges: false,
    })
}

/// 下载结束方式
#[derive(Debug)]
pub enum DownloadOutcome {
    /// 正常完成，文件已重命名到最终路径
    Completed { final_path: PathBuf },
    /// 被父级取消（暂停或关闭），残留任务可通过 harvest_residuals 收取
    Cancelled,
}

enum RunExit {
    Done,
    Cancelled,
    Failed(DownloadError),
}

/// 并发下载器
pub struct ConcurrentDownloader {
    /// 下载 ID
    pub id: String,
    client: Client,
    settings: Settings,
    state: Option<Arc<ProgressState>>,
    /// 任务队列
    queue: Arc<TaskQueue>,
    /// 活跃任务注册表（worker_id -> ActiveTask）
    registry: Arc<Mutex<HashMap<usize, Arc<ActiveTask>>>>,
    /// 镜像健康列表（索引 0 为主源）
    mirrors: Arc<Mutex<Vec<MirrorStatus>>>,
    buffer_pool: Arc<BufferPool>,
    /// 调用方透传的请求头（扩展 Cookie、鉴权等）
    headers: HashMap<String, String>,
}

impl ConcurrentDownloader {
    pub fn new(
        id: impl Into<String>,
        client: Client,
        state: Option<Arc<ProgressState>>,
        settings: Settings,
        headers: HashMap<String, String>,
    ) -> Self {
        let buffer_size = settings.chunks.worker_buffer_size as usize;
        let max_workers = settings.connections.max_connections_per_host;
        Self {
            id: id.into(),
            client,
            settings,
            state,
            queue: Arc::new(TaskQueue::new()),
            registry: Arc::new(Mutex::new(HashMap::new())),
            mirrors: Arc::new(Mutex::new(Vec::new())),
            // 每个工作协程持有一块、写入队列积压一块
            buffer_pool: Arc::new(BufferPool::new(buffer_size, max_workers * 2)),
            headers,
        }
    }

    /// 把文件切分为对齐的字节区间任务
    pub fn partition(total_size: u64, connections: usize, settings: &Settings) -> (Vec<Task>, u64) {
        let chunk = config::calculate_chunk_size(total_size, connections, settings);
        let mut tasks = Vec::new();
        let mut offset = 0u64;
        while offset < total_size {
            let len = chunk.min(total_size - offset);
            tasks.push(Task::new(offset, len));
            offset += len;
        }
        (tasks, chunk)
    }

    /// 执行下载
    ///
    /// `urls` 为主源 + 镜像（主源在索引 0）；`resume_tasks` 非空时
    /// 原样作为残留区间入队，绝不重新下载已完成的字节。
    /// 父级令牌取消时保留活跃任务信息供暂停处理收取
    pub async fn download(
        &self,
        parent: CancellationToken,
        urls: Vec<String>,
        dest_path: &Path,
        total_size: u64,
        resume_tasks: Option<Vec<Task>>,
    ) -> Result<DownloadOutcome, DownloadError> {
        let started = Instant::now();

        // 1. 镜像健康列表初始化
        {
            let mut mirrors = self.mirrors.lock();
            *mirrors = urls.iter().cloned().map(MirrorStatus::new).collect();
        }
        if let Some(state) = &self.state {
            state.set_mirrors(urls.iter().cloned());
        }

        // 2. 任务切分（或残留任务原样入队）
        let connections = config::get_initial_connections(total_size as i64, &self.settings);
        match resume_tasks {
            Some(tasks) if !tasks.is_empty() => {
                info!(
                    "恢复下载 {}: {} 个残留任务, 剩余 {}",
                    self.id,
                    tasks.len(),
                    format_size(tasks.iter().map(|t| t.length).sum())
                );
                self.queue.push_many(tasks);
            }
            _ => {
                let (tasks, chunk) = Self::partition(total_size, connections, &self.settings);
                info!(
                    "开始下载 {}: 总大小 {}, {} 个连接, 分片 {}",
                    self.id,
                    format_size(total_size),
                    connections,
                    format_size(chunk)
                );
                if let Some(state) = &self.state {
                    state.set_actual_chunk_size(chunk);
                }
                self.queue.push_many(tasks);
            }
        }

        // 3. 准备部分文件并启动写入协程
        let part_path = partial_path(dest_path);
        let file = prepare_file(&part_path, total_size)
            .await
            .map_err(|e| DownloadError::Fatal(format!("准备目标文件失败: {}", e)))?;
        let writer = AsyncWriter::spawn(file, self.buffer_pool.clone(), connections * 2);

        // 4. 启动工作协程
        //    internal 令牌是 parent 的子级：致命错误时取消它即可
        //    让所有协程停下，而不影响上层的暂停语义
        let internal = parent.child_token();
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<DownloadError>(connections);

        let mut workers = JoinSet::new();
        for worker_id in 0..connections {
            let ctx = WorkerContext {
                download_id: self.id.clone(),
                worker_id,
                client: self.client.clone(),
                settings: self.settings.clone(),
                state: self.state.clone(),
                queue: self.queue.clone(),
                registry: self.registry.clone(),
                pool: self.buffer_pool.clone(),
                writer_tx: writer.tx.clone(),
                write_error: writer.error.clone(),
                cancel: internal.clone(),
                fatal_tx: fatal_tx.clone(),
                mirrors: self.mirrors.clone(),
                headers: self.headers.clone(),
            };
            workers.spawn(run_worker(ctx));
        }
        drop(fatal_tx);

        // 5. 平衡器与健康监控
        let ctl = CancellationToken::new();
        let stealer = self.spawn_stealer(ctl.clone());
        let health = self.spawn_health_monitor(ctl.clone());

        // 6. 主监控循环：等待完成、取消或致命错误
        let exit = {
            let mut tick = tokio::time::interval(MONITOR_INTERVAL);
            loop {
                tokio::select! {
                    _ = parent.cancelled() => break RunExit::Cancelled,
                    err = fatal_rx.recv() => {
                        match err {
                            Some(e) => break RunExit::Failed(e),
                            // 所有工作协程已退出
                            None => break RunExit::Done,
                        }
                    }
                    _ = tick.tick() => {
                        if self.all_work_finished(connections) {
                            break RunExit::Done;
                        }
                    }
                }
            }
        };

        // 7. 收尾：停掉辅助协程，让工作协程退出，等写入排空
        ctl.cancel();
        if let RunExit::Failed(_) = exit {
            internal.cancel();
        }
        self.queue.close();

        while workers.join_next().await.is_some() {}
        stealer.abort();
        health.abort();

        drop(writer.tx);
        let write_result = writer.handle.await;

        if let Some(state) = &self.state {
            state.add_elapsed(started.elapsed());
        }

        if let Some(msg) = AsyncWriter::take_error(&writer.error) {
            return Err(DownloadError::Integrity(format!("写入错误: {}", msg)));
        }
        if let Err(e) = write_result {
            return Err(DownloadError::Integrity(format!("写入协程异常: {}", e)));
        }

        match exit {
            RunExit::Done => {
                let final_path = self.finalize(&part_path, dest_path, total_size).await?;
                Ok(DownloadOutcome::Completed { final_path })
            }
            RunExit::Cancelled => {
                info!("下载 {} 已取消（暂停或关闭）", self.id);
                Ok(DownloadOutcome::Cancelled)
            }
            RunExit::Failed(e) => {
                warn!("下载 {} 失败: {}", self.id, e);
                Err(e)
            }
        }
    }

    /// 队列已空、注册表为空且所有工作协程都阻塞在 pop 中，
    /// 说明既无排队任务也无在途任务
    fn all_work_finished(&self, worker_count: usize) -> bool {
        self.queue.is_empty()
            && self.registry.lock().is_empty()
            && self.queue.idle_workers() == worker_count
    }

    /// 校验大小并把部分文件改名到最终路径（冲突时自动加序号）
    async fn finalize(
        &self,
        part_path: &Path,
        dest_path: &Path,
        total_size: u64,
    ) -> Result<PathBuf, DownloadError> {
        if let Some(state) = &self.state {
            let downloaded = state.downloaded();
            if downloaded != total_size {
                return Err(DownloadError::Integrity(format!(
                    "大小不符: 已下载 {} 字节, 预期 {} 字节",
                    downloaded, total_size
                )));
            }
            state.update_bitmap_from_residuals(&[]);
        }

        let final_path = unique_file_path(dest_path);
        crate::utils::rename_or_copy(part_path, &final_path)
            .map_err(|e| DownloadError::Integrity(format!("重命名失败: {}", e)))?;

        info!(
            "下载 {} 完成: {:?} ({})",
            self.id,
            final_path,
            format_size(total_size)
        );
        Ok(final_path)
    }

    /// 启动平衡器
    ///
    /// 定时触发；只有存在空闲工作协程且队列已空时才窃取，
    /// 避免无意义的区间切割
    fn spawn_stealer(&self, ctl: CancellationToken) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let registry = self.registry.clone();
        let min_chunk = self.settings.chunks.min_chunk_size;
        let id = self.id.clone();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(STEAL_INTERVAL);
            loop {
                tokio::select! {
                    _ = ctl.cancelled() => return,
                    _ = tick.tick() => {}
                }
                if queue.idle_workers() == 0 || !queue.is_empty() {
                    continue;
                }
                if steal_work(&queue, &registry, min_chunk) {
                    debug!("下载 {} 平衡器完成一次窃取", id);
                }
            }
        })
    }

    /// 启动健康监控
    ///
    /// 停滞超时或速度明显低于中位数的任务被取消（仅任务级令牌），
    /// 工作协程随后把剩余区间重新入队
    fn spawn_health_monitor(&self, ctl: CancellationToken) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        let stall_timeout = self.settings.stall_timeout();
        let grace = self.settings.slow_worker_grace_period();
        let threshold = self.settings.performance.slow_worker_threshold;
        let id = self.id.clone();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEALTH_INTERVAL);
            loop {
                tokio::select! {
                    _ = ctl.cancelled() => return,
                    _ = tick.tick() => {}
                }

                let registry = registry.lock();

                // 全局中位数速度（只统计已建立速度样本的任务）
                let mut speeds: Vec<f64> = registry
                    .values()
                    .map(|a| a.speed())
                    .filter(|s| *s > 0.0)
                    .collect();
                speeds.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let median = if speeds.is_empty() {
                    0.0
                } else {
                    speeds[speeds.len() / 2]
                };

                for (worker_id, active) in registry.iter() {
                    if active.cancel.is_cancelled() {
                        continue;
                    }
                    if active.idle_duration() > stall_timeout {
                        warn!(
                            "下载 {} 工作协程 {} 停滞超过 {:?}，取消任务",
                            id, worker_id, stall_timeout
                        );
                        active.cancel.cancel();
                        continue;
                    }
                    let speed = active.speed();
                    if median > 0.0
                        && speed > 0.0
                        && speed < threshold * median
                        && active.active_duration() > grace
                    {
                        warn!(
                            "下载 {} 工作协程 {} 速度 {:.0} B/s 低于中位数 {:.0} B/s 的 {:.0}%，取消任务",
                            id, worker_id, speed, median, threshold * 100.0
                        );
                        active.cancel.cancel();
                    }
                }
            }
        })
    }

    /// 暂停/关闭后收取残留任务（排空队列并清空注册表）
    ///
    /// 残留区间按偏移排序，总长度等于尚未写入的字节数
    pub fn harvest_residuals(&self) -> Vec<Task> {
        let mut residuals = self.queue.drain_remaining();
        let mut registry = self.registry.lock();
        for (_, active) in registry.drain() {
            if let Some(task) = active.remaining_task() {
                residuals.push(task);
            }
        }
        residuals.sort_by_key(|t| t.offset);
        residuals
    }

    /// 运行中的残留快照（定期保存状态用，不排空队列）
    pub fn residual_snapshot(&self) -> Vec<Task> {
        let mut residuals = self.queue.snapshot();
        for active in self.registry.lock().values() {
            if let Some(task) = active.remaining_task() {
                residuals.push(task);
            }
        }
        residuals.sort_by_key(|t| t.offset);
        residuals
    }

}

/// 从忙碌的工作协程处窃取剩余区间
///
/// 选择剩余最多的任务，把其后半段（对齐到 ALIGN_SIZE）切下来
/// 入队。先原子调低受害者的 stop_at 再入队，保证两段区间不重叠；
/// 受害者若已越过新上界，从其实际位置开始切
pub fn steal_work(
    queue: &TaskQueue,
    registry: &Mutex<HashMap<usize, Arc<ActiveTask>>>,
    min_chunk: u64,
) -> bool {
    let registry = registry.lock();

    let mut best: Option<&Arc<ActiveTask>> = None;
    let mut max_remaining = min_chunk;
    for active in registry.values() {
        if active.cancel.is_cancelled() {
            continue;
        }
        let remaining = active.remaining();
        if remaining > max_remaining {
            max_remaining = remaining;
            best = Some(active);
        }
    }

    let Some(active) = best else {
        return false;
    };

    let current = active.current_offset();
    let original_end = active.stop_at();
    let remaining = original_end.saturating_sub(current);

    let split = aligned_split_size(remaining, min_chunk);
    if split == 0 {
        return false;
    }

    let new_stop = current + split;
    if new_stop >= original_end {
        return false;
    }
    active.set_stop_at(new_stop);

    // 受害者可能在降界前已经越过 new_stop，从其实际位置开始
    let final_current = active.current_offset();
    let stolen_start = new_stop.max(final_current);
    if stolen_start >= original_end {
        return false;
    }

    let stolen = Task::new(stolen_start, original_end - stolen_start);
    debug!(
        "平衡器窃取 {}: 区间 [{}, {})",
        format_size(stolen.length),
        stolen.offset,
        stolen.end()
    );
    queue.push(stolen);
    true
}

/// 部分文件路径：<dest>.surge
pub fn partial_path(dest_path: &Path) -> PathBuf {
    let mut os = dest_path.as_os_str().to_owned();
    os.push(INCOMPLETE_SUFFIX);
    PathBuf::from(os)
}

/// 创建并预分配部分文件（恢复时保留已有内容）
async fn prepare_file(path: &Path, total_size: u64) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)
        .await?;
    file.set_len(total_size).await?;
    Ok(file)
}

/// 构建下载专用的 HTTP 客户端
///
/// 连接池、TCP keep-alive 与重定向策略按高并发分片下载调优
pub fn build_client(settings: &Settings) -> reqwest::Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(settings.connections.connect_timeout_secs))
        .read_timeout(Duration::from_secs(settings.connections.idle_read_timeout_secs))
        .pool_max_idle_per_host(settings.connections.max_connections_per_host * 2)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .tcp_nodelay(true)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
}
