//! 异步写入协程
//!
//! 目标文件句柄由唯一的写入协程持有，工作协程通过有界通道
//! 提交带绝对偏移的缓冲。写请求之间互不重叠（stop_at 只会被
//! 窃取者在窃取区间入队前原子调低），因此无需任何文件级锁。
//! 每次写入不做 fsync，收尾时统一落盘

use std::io::SeekFrom;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::buffer::{BufferHandle, BufferPool};

/// 写请求：数据随缓冲句柄一起移交，写入协程负责归还
#[derive(Debug)]
pub struct WriteRequest {
    /// 数据缓冲（前 len 字节有效）
    pub buf: BufferHandle,
    /// 有效数据长度
    pub len: usize,
    /// 文件内绝对偏移
    pub offset: u64,
}

/// 写入错误槽：写入协程存入，工作协程在下次提交前检查
pub type WriteErrorSlot = Arc<Mutex<Option<String>>>;

/// 写入协程句柄
#[derive(Debug)]
pub struct AsyncWriter {
    /// 写请求发送端
    pub tx: mpsc::Sender<WriteRequest>,
    /// 写入协程 JoinHandle；通道关闭并排空后结束
    pub handle: JoinHandle<Result<u64>>,
    /// 共享写入错误槽
    pub error: WriteErrorSlot,
}

impl AsyncWriter {
    /// 启动写入协程
    ///
    /// `file` 的所有权移交给写入协程；所有发送端关闭后协程
    /// 排空通道、落盘并返回累计写入字节数
    pub fn spawn(mut file: File, pool: Arc<BufferPool>, queue_depth: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<WriteRequest>(queue_depth);
        let error: WriteErrorSlot = Arc::new(Mutex::new(None));
        let error_slot = error.clone();

        let handle = tokio::spawn(async move {
            let mut written: u64 = 0;

            while let Some(req) = rx.recv().await {
                // 出错后继续排空通道归还缓冲，但不再写入
                if error_slot.lock().is_none() {
                    if let Err(e) = write_at(&mut file, &req).await {
                        error!("写入失败: offset={}, 错误: {}", req.offset, e);
                        *error_slot.lock() = Some(e.to_string());
                    } else {
                        written += req.len as u64;
                    }
                }
                pool.put(req.buf);
            }

            if error_slot.lock().is_none() {
                file.flush().await.context("刷新文件缓冲失败")?;
                file.sync_all().await.context("文件落盘失败")?;
            }

            debug!("写入协程退出，累计写入 {} 字节", written);
            Ok(written)
        });

        Self { tx, handle, error }
    }

    /// 读取当前写入错误（如有）
    pub fn take_error(slot: &WriteErrorSlot) -> Option<String> {
        slot.lock().clone()
    }
}

async fn write_at(file: &mut File, req: &WriteRequest) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(req.offset)).await?;
    file.write_all(&req.buf.as_slice()[..req.len]).await
}
