//! 下载工作协程
//!
//! 每个协程循环从队列取任务，对选定镜像发起 Range 请求，把响应
//! 流填进池化缓冲后整块移交写入协程。进度贡献始终钳制在 stop_at
//! 以内，因此窃取发生时既不会重复计数也不会漏字节。
//! 重试前任务被重定位到 current_offset，已写入的字节不会二次下载

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::utils::sanitize_url;

use super::buffer::{BufferHandle, BufferPool};
use super::errors::{classify_status, DownloadError};
use super::progress::{MirrorStatus, ProgressState};
use super::queue::TaskQueue;
use super::task::{ActiveTask, Task};
use super::writer::{WriteErrorSlot, WriteRequest};

/// 工作协程上下文
pub(crate) struct WorkerContext {
    pub download_id: String,
    pub worker_id: usize,
    pub client: Client,
    pub settings: Settings,
    pub state: Option<Arc<ProgressState>>,
    pub queue: Arc<TaskQueue>,
    pub registry: Arc<Mutex<HashMap<usize, Arc<ActiveTask>>>>,
    pub pool: Arc<BufferPool>,
    pub writer_tx: mpsc::Sender<WriteRequest>,
    pub write_error: WriteErrorSlot,
    /// 下载级取消令牌（暂停/关闭/致命错误）
    pub cancel: CancellationToken,
    /// 致命与不可恢复错误上报通道
    pub fatal_tx: mpsc::Sender<DownloadError>,
    pub mirrors: Arc<Mutex<Vec<MirrorStatus>>>,
    pub headers: HashMap<String, String>,
}

enum TaskExit {
    /// 继续取下一个任务
    Continue,
    /// 协程退出（取消或错误已上报）
    Shutdown,
}

/// 工作协程主循环
pub(crate) async fn run_worker(ctx: WorkerContext) {
    debug!("下载 {} 工作协程 {} 启动", ctx.download_id, ctx.worker_id);
    let mut buf: Option<BufferHandle> = None;

    loop {
        let Some(task) = ctx.queue.pop().await else {
            break;
        };
        if ctx.cancel.is_cancelled() {
            break;
        }

        if let Some(state) = &ctx.state {
            state.worker_started();
        }
        let exit = process_task(&ctx, task, &mut buf).await;
        if let Some(state) = &ctx.state {
            state.worker_finished();
        }

        match exit {
            TaskExit::Continue => continue,
            TaskExit::Shutdown => break,
        }
    }

    // 归还最后持有的缓冲
    if let Some(handle) = buf.take() {
        ctx.pool.put(handle);
    }
    debug!("下载 {} 工作协程 {} 退出", ctx.download_id, ctx.worker_id);
}

/// 处理单个任务：带退避重试与镜像轮换
async fn process_task(
    ctx: &WorkerContext,
    mut task: Task,
    buf: &mut Option<BufferHandle>,
) -> TaskExit {
    let original_end = task.end();
    let max_retries = ctx.settings.performance.max_task_retries;
    let mut last_err: Option<DownloadError> = None;

    for attempt in 0..max_retries {
        if attempt > 0 {
            let delay = ctx.settings.retry_base_delay() * (1u32 << attempt);
            tokio::select! {
                _ = ctx.cancel.cancelled() => return TaskExit::Shutdown,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // 镜像选择：worker_id 对可用镜像数取模
        let Some(mirror_url) = select_mirror(ctx) else {
            let err = last_err
                .take()
                .unwrap_or_else(|| DownloadError::Transient("无可用镜像".to_string()));
            let _ = ctx.fatal_tx.send(err).await;
            return TaskExit::Shutdown;
        };

        let task_token = ctx.cancel.child_token();
        let active = Arc::new(ActiveTask::new(task, task_token.clone()));
        ctx.registry.lock().insert(ctx.worker_id, active.clone());

        let result = fetch_task(ctx, &active, &mirror_url, buf).await;
        let task_cancelled = task_token.is_cancelled();

        if ctx.cancel.is_cancelled() {
            // 下载级取消：保留注册表条目，暂停处理要靠它收取残留区间
            return TaskExit::Shutdown;
        }

        if task_cancelled && result.is_err() {
            // 健康监控只取消了本任务：剩余区间重新入队，不消耗重试次数
            if let Some(mut remaining) = active.remaining_task() {
                if remaining.end() > original_end {
                    remaining.length = original_end - remaining.offset;
                }
                if remaining.length > 0 {
                    debug!(
                        "下载 {} 工作协程 {} 任务被健康监控取消，重新入队 [{}, {})",
                        ctx.download_id,
                        ctx.worker_id,
                        remaining.offset,
                        remaining.end()
                    );
                    ctx.queue.push(remaining);
                }
            }
            ctx.registry.lock().remove(&ctx.worker_id);
            return TaskExit::Continue;
        }

        ctx.registry.lock().remove(&ctx.worker_id);

        match result {
            Ok(()) => return TaskExit::Continue,
            Err(DownloadError::Cancelled) => return TaskExit::Shutdown,
            Err(e) if e.is_fatal() => {
                warn!(
                    "下载 {} 工作协程 {} 遇到致命错误: {}",
                    ctx.download_id, ctx.worker_id, e
                );
                let _ = ctx.fatal_tx.send(e).await;
                return TaskExit::Shutdown;
            }
            Err(e) => {
                mark_mirror_error(ctx, &mirror_url);
                warn!(
                    "下载 {} 工作协程 {} 任务失败 (重试 {}/{}): {}",
                    ctx.download_id,
                    ctx.worker_id,
                    attempt + 1,
                    max_retries,
                    e
                );
                last_err = Some(e);

                // 重试从已写入位置继续，避免重复计数
                let current = active.current_offset();
                if current > task.offset && current < original_end {
                    task = Task::new(current, original_end - current);
                }
            }
        }
    }

    // 重试耗尽：上报任务失败，整个下载终止
    let err = last_err
        .unwrap_or_else(|| DownloadError::Transient("任务重试耗尽".to_string()));
    let _ = ctx.fatal_tx.send(err).await;
    TaskExit::Shutdown
}

/// 按 worker_id 轮询选择可用镜像
fn select_mirror(ctx: &WorkerContext) -> Option<String> {
    let mirrors = ctx.mirrors.lock();
    let eligible: Vec<&MirrorStatus> = mirrors.iter().filter(|m| m.eligible()).collect();
    if eligible.is_empty() {
        return None;
    }
    Some(eligible[ctx.worker_id % eligible.len()].url.clone())
}

/// 标记镜像故障（仅在还有替代镜像时剔除，单源下载保持重试）
fn mark_mirror_error(ctx: &WorkerContext, url: &str) {
    let mut mirrors = ctx.mirrors.lock();
    let eligible = mirrors.iter().filter(|m| m.eligible()).count();
    if eligible <= 1 {
        return;
    }
    if let Some(mirror) = mirrors.iter_mut().find(|m| m.url == url) {
        mirror.error = true;
        warn!(
            "下载 {} 镜像已标记故障: {}",
            ctx.download_id,
            sanitize_url(url)
        );
    }
    drop(mirrors);
    if let Some(state) = &ctx.state {
        state.mark_mirror_error(url);
    }
}

/// 拉取单个字节区间并流式写入
async fn fetch_task(
    ctx: &WorkerContext,
    active: &Arc<ActiveTask>,
    url: &str,
    buf: &mut Option<BufferHandle>,
) -> Result<(), DownloadError> {
    let task = active.task;
    let cancel = active.cancel.clone();

    let mut req = ctx
        .client
        .get(url)
        .header(
            reqwest::header::RANGE,
            format!("bytes={}-{}", task.offset, task.end() - 1),
        )
        .header(
            reqwest::header::USER_AGENT,
            &ctx.settings.connections.user_agent,
        );
    for (k, v) in &ctx.headers {
        req = req.header(k.as_str(), v.as_str());
    }

    let resp = tokio::select! {
        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        r = req.send() => r.map_err(DownloadError::from)?,
    };

    let status = resp.status();
    if let Some(err) = classify_status(status) {
        return Err(err);
    }
    if status == StatusCode::OK {
        // 服务器忽略了 Range：仅当区间从 0 开始且响应恰好覆盖全区间时可接受
        let acceptable =
            task.offset == 0 && resp.content_length().is_some_and(|len| len == task.length);
        if !acceptable {
            return Err(DownloadError::Transient(
                "服务器忽略 Range 请求".to_string(),
            ));
        }
    }

    let alpha = ctx.settings.performance.speed_ema_alpha;
    let mut stream = resp.bytes_stream();
    let mut offset = task.offset;
    let mut filled = 0usize;
    active.touch();

    loop {
        if offset >= active.stop_at() {
            // 剩余区间已被窃取者整体拿走
            return Ok(());
        }

        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            c = stream.next() => c,
        };

        match chunk {
            None => {
                if filled > 0 {
                    flush(ctx, active, buf, &mut offset, &mut filled, alpha).await?;
                }
                if offset < active.stop_at() {
                    // 服务器提前断流，剩余部分走重试
                    return Err(DownloadError::Transient("数据流提前结束".to_string()));
                }
                return Ok(());
            }
            Some(Err(e)) => {
                return Err(DownloadError::Transient(format!("读取数据流失败: {}", e)));
            }
            Some(Ok(bytes)) => {
                let mut data = &bytes[..];
                while !data.is_empty() {
                    let handle = buf.get_or_insert_with(|| ctx.pool.get());
                    let cap = handle.capacity();
                    let n = (cap - filled).min(data.len());
                    handle.as_mut_slice()[filled..filled + n].copy_from_slice(&data[..n]);
                    filled += n;
                    data = &data[n..];

                    if filled == cap {
                        flush(ctx, active, buf, &mut offset, &mut filled, alpha).await?;
                        if offset >= active.stop_at() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

/// 把填充好的缓冲移交写入协程并推进进度
///
/// 写入长度钳制在 stop_at 以内；移交后立刻换取新缓冲，
/// 旧缓冲的所有权完全转给写入协程
async fn flush(
    ctx: &WorkerContext,
    active: &Arc<ActiveTask>,
    buf: &mut Option<BufferHandle>,
    offset: &mut u64,
    filled: &mut usize,
    alpha: f64,
) -> Result<(), DownloadError> {
    // 先检查此前的写入是否已报错
    if let Some(msg) = ctx.write_error.lock().clone() {
        return Err(DownloadError::Integrity(format!("写入错误: {}", msg)));
    }

    let stop_at = active.stop_at();
    let end = *offset + *filled as u64;
    let write_len = (end.min(stop_at).saturating_sub(*offset)) as usize;
    if write_len == 0 {
        // 本缓冲的数据全部落在被窃取的区间里，直接丢弃
        *filled = 0;
        return Ok(());
    }

    let Some(handle) = buf.take() else {
        return Ok(());
    };
    let request = WriteRequest {
        buf: handle,
        len: write_len,
        offset: *offset,
    };

    tokio::select! {
        _ = active.cancel.cancelled() => return Err(DownloadError::Cancelled),
        sent = ctx.writer_tx.send(request) => {
            if sent.is_err() {
                return Err(DownloadError::Integrity("写入通道已关闭".to_string()));
            }
        }
    }

    *buf = Some(ctx.pool.get());

    let new_offset = *offset + write_len as u64;
    active.advance_to(new_offset);
    active.record_bytes(write_len as u64, alpha);
    if let Some(state) = &ctx.state {
        state.add_downloaded(write_len as u64);
    }
    *offset = new_offset;
    *filled = 0;
    Ok(())
}
