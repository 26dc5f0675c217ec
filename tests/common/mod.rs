//! 集成测试公共设施
//!
//! 进程内的模拟源站：支持 Range 请求、限速响应与强制错误状态，
//! 用于端到端驱动下载引擎

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use sha2::{Digest, Sha256};

use surge::config::Settings;
use surge::state::{DownloadStatus, Store};
use surge::WorkerPool;

/// 模拟源站配置
#[derive(Clone)]
pub struct OriginConfig {
    /// 完整文件内容
    pub data: Arc<Vec<u8>>,
    /// 所有请求强制返回该状态码
    pub force_status: Option<u16>,
    /// 仅 Range 请求强制返回该状态码（模拟坏镜像）
    pub range_status: Option<u16>,
    /// 响应体按 64 KiB 分块，块间延迟
    pub chunk_delay: Duration,
    /// 起始偏移为 0 的 Range 请求使用的块间延迟（模拟单个慢连接）
    pub slow_head_range: Option<Duration>,
    /// 是否响应 Range 请求
    pub support_ranges: bool,
}

impl OriginConfig {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
            force_status: None,
            range_status: None,
            chunk_delay: Duration::ZERO,
            slow_head_range: None,
            support_ranges: true,
        }
    }
}

#[derive(Clone)]
struct OriginState {
    cfg: OriginConfig,
    hits: Arc<AtomicUsize>,
    range_hits: Arc<AtomicUsize>,
}

/// 正在运行的模拟源站
pub struct Origin {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
    pub range_hits: Arc<AtomicUsize>,
}

impl Origin {
    pub fn url(&self) -> String {
        format!("http://{}/file.bin", self.addr)
    }
}

/// 启动模拟源站
pub async fn spawn_origin(cfg: OriginConfig) -> Origin {
    let state = OriginState {
        cfg,
        hits: Arc::new(AtomicUsize::new(0)),
        range_hits: Arc::new(AtomicUsize::new(0)),
    };
    let hits = state.hits.clone();
    let range_hits = state.range_hits.clone();

    let app = Router::new()
        .route("/file.bin", get(serve_file))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("绑定模拟源站失败");
    let addr = listener.local_addr().expect("读取监听地址失败");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Origin {
        addr,
        hits,
        range_hits,
    }
}

async fn serve_file(State(state): State<OriginState>, headers: HeaderMap) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);

    if let Some(code) = state.cfg.force_status {
        return status_response(code);
    }

    let total = state.cfg.data.len() as u64;
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range);

    match range {
        Some((start, end)) if state.cfg.support_ranges => {
            state.range_hits.fetch_add(1, Ordering::SeqCst);
            if let Some(code) = state.cfg.range_status {
                return status_response(code);
            }
            if start >= total {
                return status_response(416);
            }
            let end = end.min(total - 1);
            let slice = state.cfg.data[start as usize..=end as usize].to_vec();

            let delay = if start == 0 {
                state.cfg.slow_head_range.unwrap_or(state.cfg.chunk_delay)
            } else {
                state.cfg.chunk_delay
            };

            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end, total),
                )
                .body(chunked_body(slice, delay))
                .expect("构造响应失败")
        }
        _ => Response::builder()
            .status(StatusCode::OK)
            .body(chunked_body(state.cfg.data.to_vec(), state.cfg.chunk_delay))
            .expect("构造响应失败"),
    }
}

fn status_response(code: u16) -> Response {
    Response::builder()
        .status(StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .body(Body::from("simulated"))
        .expect("构造响应失败")
}

/// 解析 "bytes=a-b" 形式的 Range 头
fn parse_range(raw: &str) -> Option<(u64, u64)> {
    let spec = raw.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = if end.is_empty() {
        u64::MAX
    } else {
        end.parse().ok()?
    };
    Some((start, end))
}

/// 按 64 KiB 分块的响应体，块间插入延迟
fn chunked_body(data: Vec<u8>, delay: Duration) -> Body {
    if delay.is_zero() {
        return Body::from(data);
    }

    const CHUNK: usize = 64 * 1024;
    let stream = futures::stream::unfold((data, 0usize), move |(data, pos)| async move {
        if pos >= data.len() {
            return None;
        }
        tokio::time::sleep(delay).await;
        let end = (pos + CHUNK).min(data.len());
        let chunk = data[pos..end].to_vec();
        Some((Ok::<_, std::io::Error>(chunk), (data, end)))
    });
    Body::from_stream(stream)
}

/// 确定性伪随机字节（xorshift64）
pub fn deterministic_bytes(size: usize, mut seed: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    while data.len() < size {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        let bytes = seed.to_le_bytes();
        let take = bytes.len().min(size - data.len());
        data.extend_from_slice(&bytes[..take]);
    }
    data
}

pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// 测试用设置：下载目录指向临时目录
pub fn test_settings(download_dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.general.default_download_dir = download_dir.to_string_lossy().to_string();
    settings
}

/// 创建测试下载池（允许访问本机回环地址）
pub fn test_pool(settings: Settings, dir: &Path) -> (Arc<WorkerPool>, Arc<Store>) {
    std::env::set_var("SURGE_ALLOW_PRIVATE_IPS", "true");
    let store = Arc::new(Store::open(&dir.join("surge.db")).expect("打开测试数据库失败"));
    (WorkerPool::new(settings, store.clone()), store)
}

/// 轮询等待下载进入指定状态
pub async fn wait_for_status(
    pool: &WorkerPool,
    id: &str,
    expect: DownloadStatus,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(info) = pool.get_status(id) {
            if info.status == expect {
                return true;
            }
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// 轮询等待下载的已下载字节数超过阈值
pub async fn wait_for_downloaded(
    pool: &WorkerPool,
    id: &str,
    threshold: u64,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(info) = pool.get_status(id) {
            if info.status == DownloadStatus::Downloading && info.downloaded > threshold {
                return true;
            }
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
