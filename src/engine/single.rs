//! 单连接下载器
//!
//! 服务器不支持 Range 或文件大小未知时的回退路径：
//! 一条 GET 连接，响应体经缓冲池流式写入文件偏移 0 起的
//! 连续区间。不支持断点续传，暂停后重新开始

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Settings;
use crate::utils::{format_size, unique_file_path};

use super::buffer::BufferPool;
use super::concurrent::{partial_path, DownloadOutcome};
use super::errors::{classify_status, DownloadError};
use super::progress::ProgressState;
use super::writer::{AsyncWriter, WriteRequest};

/// 单连接下载器
pub struct SingleStreamDownloader {
    pub id: String,
    client: Client,
    settings: Settings,
    state: Option<Arc<ProgressState>>,
    headers: HashMap<String, String>,
}

impl SingleStreamDownloader {
    pub fn new(
        id: impl Into<String>,
        client: Client,
        state: Option<Arc<ProgressState>>,
        settings: Settings,
        headers: HashMap<String, String>,
    ) -> Self {
        Self {
            id: id.into(),
            client,
            settings,
            state,
            headers,
        }
    }

    /// 执行下载
    pub async fn download(
        &self,
        parent: CancellationToken,
        url: &str,
        dest_path: &Path,
    ) -> Result<DownloadOutcome, DownloadError> {
        info!("下载 {} 使用单连接模式", self.id);

        let part_path = partial_path(dest_path);
        if let Some(dir) = part_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| DownloadError::Fatal(format!("创建目标目录失败: {}", e)))?;
        }
        let file = tokio::fs::File::create(&part_path)
            .await
            .map_err(|e| DownloadError::Fatal(format!("创建目标文件失败: {}", e)))?;

        let pool = Arc::new(BufferPool::new(
            self.settings.chunks.worker_buffer_size as usize,
            4,
        ));
        let writer = AsyncWriter::spawn(file, pool.clone(), 4);

        let mut req = self.client.get(url).header(
            reqwest::header::USER_AGENT,
            &self.settings.connections.user_agent,
        );
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let result = self
            .copy_stream(req, &parent, &pool, &writer)
            .await;

        drop(writer.tx);
        let _ = writer.handle.await;

        if let Some(msg) = AsyncWriter::take_error(&writer.error) {
            return Err(DownloadError::Integrity(format!("写入错误: {}", msg)));
        }

        match result {
            Ok(total) => {
                let final_path = unique_file_path(dest_path);
                crate::utils::rename_or_copy(&part_path, &final_path)
                    .map_err(|e| DownloadError::Integrity(format!("重命名失败: {}", e)))?;
                if let Some(state) = &self.state {
                    state.set_done();
                }
                info!(
                    "下载 {} 完成: {:?} ({})",
                    self.id,
                    final_path,
                    format_size(total)
                );
                Ok(DownloadOutcome::Completed { final_path })
            }
            Err(DownloadError::Cancelled) => Ok(DownloadOutcome::Cancelled),
            Err(e) => Err(e),
        }
    }

    async fn copy_stream(
        &self,
        req: reqwest::RequestBuilder,
        parent: &CancellationToken,
        pool: &Arc<BufferPool>,
        writer: &AsyncWriter,
    ) -> Result<u64, DownloadError> {
        let resp = tokio::select! {
            _ = parent.cancelled() => return Err(DownloadError::Cancelled),
            r = req.send() => r.map_err(DownloadError::from)?,
        };
        if let Some(err) = classify_status(resp.status()) {
            return Err(err);
        }

        let mut stream = resp.bytes_stream();
        let mut offset: u64 = 0;
        let mut handle = pool.get();
        let mut filled = 0usize;

        loop {
            let chunk = tokio::select! {
                _ = parent.cancelled() => return Err(DownloadError::Cancelled),
                c = stream.next() => c,
            };

            match chunk {
                None => break,
                Some(Err(e)) => {
                    return Err(DownloadError::Transient(format!("读取数据流失败: {}", e)));
                }
                Some(Ok(bytes)) => {
                    let mut data = &bytes[..];
                    while !data.is_empty() {
                        let cap = handle.capacity();
                        let n = (cap - filled).min(data.len());
                        handle.as_mut_slice()[filled..filled + n].copy_from_slice(&data[..n]);
                        filled += n;
                        data = &data[n..];

                        if filled == cap {
                            let request = WriteRequest {
                                buf: handle,
                                len: filled,
                                offset,
                            };
                            if writer.tx.send(request).await.is_err() {
                                return Err(DownloadError::Integrity(
                                    "写入通道已关闭".to_string(),
                                ));
                            }
                            offset += filled as u64;
                            if let Some(state) = &self.state {
                                state.add_downloaded(filled as u64);
                            }
                            handle = pool.get();
                            filled = 0;
                        }
                    }
                }
            }
        }

        if filled > 0 {
            let request = WriteRequest {
                buf: handle,
                len: filled,
                offset,
            };
            if writer.tx.send(request).await.is_err() {
                return Err(DownloadError::Integrity("写入通道已关闭".to_string()));
            }
            offset += filled as u64;
            if let Some(state) = &self.state {
                state.add_downloaded(filled as u64);
            }
        } else {
            pool.put(handle);
        }

        Ok(offset)
    }
}
