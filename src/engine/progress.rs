//! 下载进度共享状态
//!
//! 单个下载的跨协程共享聚合：原子计数器 + 锁保护的镜像列表。
//! downloaded 只增不减（重试与窃取场景由调用方钳制贡献），
//! 分片位图由残留任务列表按需推导，用于 UI 快速渲染

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bit_set::BitSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::task::Task;

/// 镜像状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorStatus {
    /// 镜像 URL
    pub url: String,
    /// 是否启用
    pub active: bool,
    /// 是否已标记为故障
    pub error: bool,
}

impl MirrorStatus {
    pub fn new(url: String) -> Self {
        Self {
            url,
            active: true,
            error: false,
        }
    }

    /// 是否可用于发起请求
    pub fn eligible(&self) -> bool {
        self.active && !self.error
    }
}

/// 下载进度状态
#[derive(Debug)]
pub struct ProgressState {
    /// 下载 ID
    pub id: String,
    /// 文件总大小
    pub total_size: u64,
    /// 已下载字节数（只增不减）
    downloaded: AtomicU64,
    /// 活跃工作协程数
    active_workers: AtomicUsize,
    /// 是否已结束（完成、失败或暂停）
    done: AtomicBool,
    /// 镜像列表（含主源，索引 0）
    mirrors: Mutex<Vec<MirrorStatus>>,
    /// 分片完成位图
    bitmap: Mutex<BitSet>,
    /// 实际使用的分片大小（恢复时必须沿用同样的边界）
    actual_chunk_size: AtomicU64,
    /// 累计下载耗时（纳秒）
    elapsed_ns: AtomicU64,
}

impl ProgressState {
    pub fn new(id: impl Into<String>, total_size: u64) -> Self {
        Self {
            id: id.into(),
            total_size,
            downloaded: AtomicU64::new(0),
            active_workers: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            mirrors: Mutex::new(Vec::new()),
            bitmap: Mutex::new(BitSet::new()),
            actual_chunk_size: AtomicU64::new(0),
            elapsed_ns: AtomicU64::new(0),
        }
    }

    pub fn add_downloaded(&self, n: u64) {
        self.downloaded.fetch_add(n, Ordering::AcqRel);
    }

    pub fn set_downloaded(&self, n: u64) {
        self.downloaded.store(n, Ordering::Release);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    pub fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn worker_finished(&self) {
        self.active_workers.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }

    pub fn set_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn set_mirrors(&self, urls: impl IntoIterator<Item = String>) {
        *self.mirrors.lock() = urls.into_iter().map(MirrorStatus::new).collect();
    }

    pub fn get_mirrors(&self) -> Vec<MirrorStatus> {
        self.mirrors.lock().clone()
    }

    /// 当前可用的镜像 URL（主源在前）
    pub fn eligible_mirrors(&self) -> Vec<String> {
        self.mirrors
            .lock()
            .iter()
            .filter(|m| m.eligible())
            .map(|m| m.url.clone())
            .collect()
    }

    /// 标记镜像故障；单次下载内不会恢复
    pub fn mark_mirror_error(&self, url: &str) {
        let mut mirrors = self.mirrors.lock();
        if let Some(mirror) = mirrors.iter_mut().find(|m| m.url == url) {
            mirror.error = true;
        }
    }

    pub fn set_actual_chunk_size(&self, size: u64) {
        self.actual_chunk_size.store(size, Ordering::Release);
    }

    pub fn actual_chunk_size(&self) -> u64 {
        self.actual_chunk_size.load(Ordering::Acquire)
    }

    pub fn add_elapsed(&self, d: Duration) {
        self.elapsed_ns.fetch_add(d.as_nanos() as u64, Ordering::AcqRel);
    }

    pub fn set_elapsed_ns(&self, ns: u64) {
        self.elapsed_ns.store(ns, Ordering::Release);
    }

    pub fn elapsed_ns(&self) -> u64 {
        self.elapsed_ns.load(Ordering::Acquire)
    }

    /// 根据残留任务刷新分片位图
    ///
    /// 未被任何残留区间覆盖的分片视为已完成
    pub fn update_bitmap_from_residuals(&self, residuals: &[Task]) {
        let chunk_size = self.actual_chunk_size();
        if chunk_size == 0 || self.total_size == 0 {
            return;
        }
        let chunk_count = self.total_size.div_ceil(chunk_size) as usize;
        let mut bitmap = BitSet::with_capacity(chunk_count);

        'chunk: for i in 0..chunk_count {
            let start = i as u64 * chunk_size;
            let end = ((i as u64 + 1) * chunk_size).min(self.total_size);
            for task in residuals {
                if task.offset < end && task.end() > start {
                    continue 'chunk;
                }
            }
            bitmap.insert(i);
        }

        *self.bitmap.lock() = bitmap;
    }

    /// 位图序列化为字节（低位在前），用于持久化与 UI
    pub fn bitmap_bytes(&self) -> Vec<u8> {
        let chunk_size = self.actual_chunk_size();
        if chunk_size == 0 || self.total_size == 0 {
            return Vec::new();
        }
        let chunk_count = self.total_size.div_ceil(chunk_size) as usize;
        let bitmap = self.bitmap.lock();
        let mut bytes = vec![0u8; chunk_count.div_ceil(8)];
        for i in bitmap.iter() {
            bytes[i / 8] |= 1 << (i % 8);
        }
        bytes
    }

    /// 从持久化的字节恢复位图
    pub fn set_bitmap_bytes(&self, bytes: &[u8]) {
        let mut bitmap = BitSet::new();
        for (byte_idx, byte) in bytes.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    bitmap.insert(byte_idx * 8 + bit);
                }
            }
        }
        *self.bitmap.lock() = bitmap;
    }
}
