//! 日志系统配置
//!
//! 控制台输出 + 可选的文件持久化（按天滚动）。
//! 过滤级别由 SURGE_LOG 环境变量控制，默认 info

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// 初始化日志系统
///
/// 返回的 guard 必须在进程存活期间持有，否则文件日志会丢失
pub fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_env("SURGE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = fmt::layer().with_target(false);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "surge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);

            tracing_subscriber::registry()
                .with(filter)
                .with(console_layer.boxed())
                .with(file_layer.boxed())
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console_layer.boxed())
                .init();
            None
        }
    }
}
