// surge 多连接下载引擎核心库

// 配置管理模块
pub mod config;

// 日志系统模块
pub mod logging;

// 下载引擎模块
pub mod engine;

// 网络安全检查模块
pub mod net;

// 下载池管理模块
pub mod pool;

// 服务契约模块
pub mod service;

// HTTP 守护进程模块
pub mod server;

// 持久化模块
pub mod state;

// 通用工具模块
pub mod utils;

// 导出常用类型
pub use config::Settings;
pub use engine::{
    ConcurrentDownloader, DownloadError, DownloadOutcome, ProgressState, SingleStreamDownloader,
    Task, TaskQueue,
};
pub use pool::{DownloadStatusInfo, Event, WorkerPool};
pub use service::{DownloadService, LocalDownloadService, RemoteDownloadService};
pub use state::{DownloadEntry, DownloadState, DownloadStatus, Store};
