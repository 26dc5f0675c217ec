//! 下载任务类型
//!
//! Task 是入队后不可变的字节区间；ActiveTask 是其被某个
//! 工作协程持有期间的可变扩展，所有热点字段均为原子量，
//! 供工作窃取与健康监控跨协程读写

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::ALIGN_SIZE;

/// 待下载的字节区间 [offset, offset + length)
///
/// 对应一次 HTTP Range 请求，入队后不可变
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// 起始偏移
    pub offset: u64,
    /// 区间长度
    pub length: u64,
}

impl Task {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// 区间结束位置（开区间）
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// 执行中任务
///
/// 不变式：task.offset <= current_offset <= stop_at <= task.end()；
/// stop_at 只会被窃取者调低，current_offset 只会前进
#[derive(Debug)]
pub struct ActiveTask {
    /// 原始任务
    pub task: Task,
    /// 下一个尚未写入的字节位置
    current_offset: AtomicU64,
    /// 允许下载到的上界（窃取者可调低）
    stop_at: AtomicU64,
    /// 最近一次收到数据距 started_at 的纳秒数
    last_activity_ns: AtomicU64,
    /// 滑动窗口内累计的字节数
    window_bytes: AtomicU64,
    /// 滑动窗口起点
    window_start: Mutex<Instant>,
    /// EMA 平滑速度（字节/秒）
    speed: Mutex<f64>,
    /// 任务开始时间
    pub started_at: Instant,
    /// 任务级取消令牌（健康监控使用，不影响父级）
    pub cancel: CancellationToken,
}

/// 速度 EMA 的滑动窗口长度
const SPEED_WINDOW: Duration = Duration::from_secs(2);

impl ActiveTask {
    pub fn new(task: Task, cancel: CancellationToken) -> Self {
        Self {
            task,
            current_offset: AtomicU64::new(task.offset),
            stop_at: AtomicU64::new(task.end()),
            last_activity_ns: AtomicU64::new(0),
            window_bytes: AtomicU64::new(0),
            window_start: Mutex::new(Instant::now()),
            speed: Mutex::new(0.0),
            started_at: Instant::now(),
            cancel,
        }
    }

    pub fn current_offset(&self) -> u64 {
        self.current_offset.load(Ordering::Acquire)
    }

    pub fn stop_at(&self) -> u64 {
        self.stop_at.load(Ordering::Acquire)
    }

    /// 推进已写入位置并刷新活跃时间戳
    pub fn advance_to(&self, offset: u64) {
        self.current_offset.store(offset, Ordering::Release);
        self.touch();
    }

    /// 调低下载上界（仅窃取者调用）
    pub fn set_stop_at(&self, stop_at: u64) {
        self.stop_at.store(stop_at, Ordering::Release);
    }

    /// 刷新活跃时间戳
    pub fn touch(&self) {
        let ns = self.started_at.elapsed().as_nanos() as u64;
        self.last_activity_ns.store(ns, Ordering::Release);
    }

    /// 距最近一次收到数据的时长
    pub fn idle_duration(&self) -> Duration {
        let last = self.last_activity_ns.load(Ordering::Acquire);
        self.started_at
            .elapsed()
            .saturating_sub(Duration::from_nanos(last))
    }

    /// 任务已执行时长
    pub fn active_duration(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// 剩余未下载字节数
    pub fn remaining(&self) -> u64 {
        self.stop_at().saturating_sub(self.current_offset())
    }

    /// 剩余区间对应的任务（用于重新入队），为空时返回 None
    pub fn remaining_task(&self) -> Option<Task> {
        let current = self.current_offset();
        let stop = self.stop_at();
        if current >= stop {
            return None;
        }
        Some(Task::new(current, stop - current))
    }

    /// 记录新收到的字节并滚动速度 EMA
    ///
    /// 窗口期满后 recent = window_bytes / elapsed，
    /// speed <- (1 - alpha) * speed + alpha * recent，首次直接取 recent
    pub fn record_bytes(&self, n: u64, alpha: f64) {
        self.window_bytes.fetch_add(n, Ordering::AcqRel);
        self.touch();

        let mut window_start = self.window_start.lock();
        let elapsed = window_start.elapsed();
        if elapsed >= SPEED_WINDOW {
            let bytes = self.window_bytes.swap(0, Ordering::AcqRel);
            let recent = bytes as f64 / elapsed.as_secs_f64();
            let mut speed = self.speed.lock();
            *speed = if *speed == 0.0 {
                recent
            } else {
                (1.0 - alpha) * *speed + alpha * recent
            };
            *window_start = Instant::now();
        }
    }

    /// 当前 EMA 速度（字节/秒）
    pub fn speed(&self) -> f64 {
        *self.speed.lock()
    }
}

/// 计算窃取时的分割大小
///
/// 返回不超过 remaining / 2 的最大 ALIGN_SIZE 倍数；
/// remaining 不足两个最小分片时返回 0（不值得分割）
pub fn aligned_split_size(remaining: u64, min_chunk: u64) -> u64 {
    if remaining < 2 * min_chunk {
        return 0;
    }
    (remaining / 2) / ALIGN_SIZE * ALIGN_SIZE
}
