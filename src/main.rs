use std::sync::Arc;

use surge::config::{surge_dir, Settings};
use surge::server;
use surge::state::Store;
use surge::{logging, WorkerPool};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志落在配置目录的 logs/ 下，guard 需存活到进程退出
    let log_dir = surge_dir().join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let _log_guard = logging::init_logging(Some(&log_dir));

    info!("surge 守护进程 v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load();
    let store = Arc::new(Store::open(&surge_dir().join("surge.db"))?);
    let pool = WorkerPool::new(settings.clone(), store);

    let shutdown = CancellationToken::new();
    let addr = server::serve(pool.clone(), settings, shutdown.clone()).await?;
    info!("服务就绪: http://{}", addr);

    tokio::signal::ctrl_c().await?;
    info!("收到退出信号，开始优雅关闭...");

    // 先暂停所有下载并持久化残留区间，再停 HTTP 服务
    pool.shutdown().await;
    shutdown.cancel();

    info!("守护进程已退出");
    Ok(())
}
