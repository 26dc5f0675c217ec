//! 配置管理模块
//!
//! 设置文件为 JSON 格式，保存在用户配置目录下的 surge/ 中，
//! 同目录还存放访问令牌（token）、守护进程端口（port）和持久化数据库（surge.db）

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// 1 MiB
pub const MB: u64 = 1024 * 1024;

/// 分片边界对齐粒度（64 KiB）
pub const ALIGN_SIZE: u64 = 64 * 1024;

/// 未完成文件的后缀
pub const INCOMPLETE_SUFFIX: &str = ".surge";

/// 应用设置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// 通用设置
    #[serde(default)]
    pub general: GeneralSettings,
    /// 连接设置
    #[serde(default)]
    pub connections: ConnectionSettings,
    /// 分片设置
    #[serde(default)]
    pub chunks: ChunkSettings,
    /// 性能调优
    #[serde(default)]
    pub performance: PerformanceSettings,
}

/// 通用设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    /// 默认下载目录
    pub default_download_dir: String,
    /// 重复下载时是否告警
    pub warn_on_duplicate: bool,
    /// 浏览器扩展请求是否需要 UI 确认
    pub extension_prompt: bool,
    /// 启动时是否自动恢复未完成下载
    pub auto_resume: bool,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            default_download_dir: dirs::download_dir()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|| "downloads".to_string()),
            warn_on_duplicate: true,
            extension_prompt: false,
            auto_resume: false,
        }
    }
}

/// 连接设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// 单主机最大连接数
    pub max_connections_per_host: usize,
    /// 全局最大并发下载任务数
    pub max_global_connections: usize,
    /// 请求使用的 User-Agent
    pub user_agent: String,
    /// 建立连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 空闲读取超时（秒），无数据超过该时长由健康监控处理
    pub idle_read_timeout_secs: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_connections_per_host: 8,
            max_global_connections: 3,
            user_agent: format!("surge/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: 15,
            idle_read_timeout_secs: 60,
        }
    }
}

/// 分片设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSettings {
    /// 最小分片大小（字节）
    pub min_chunk_size: u64,
    /// 工作协程读缓冲区大小（字节）
    pub worker_buffer_size: u64,
    /// 顺序下载模式（强制单连接）
    pub sequential_download: bool,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            min_chunk_size: MB,
            worker_buffer_size: 256 * 1024,
            sequential_download: false,
        }
    }
}

/// 性能调优
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSettings {
    /// 单任务最大重试次数
    pub max_task_retries: u32,
    /// 重试基础延迟（毫秒），按 2^attempt 指数退避
    pub retry_base_delay_ms: u64,
    /// 慢工作协程阈值（相对全局中位数速度的比例）
    pub slow_worker_threshold: f64,
    /// 慢工作协程宽限期（秒）
    pub slow_worker_grace_period_secs: u64,
    /// 停滞超时（秒），超过该时长无数据则取消任务
    pub stall_timeout_secs: u64,
    /// 速度 EMA 平滑系数
    pub speed_ema_alpha: f64,
    /// 下载中定期保存状态的间隔（秒）
    pub checkpoint_interval_secs: u64,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            max_task_retries: 3,
            retry_base_delay_ms: 500,
            slow_worker_threshold: 0.3,
            slow_worker_grace_period_secs: 10,
            stall_timeout_secs: 30,
            speed_ema_alpha: 0.3,
            checkpoint_interval_secs: 5,
        }
    }
}

impl Settings {
    /// 从配置目录加载设置，文件不存在时返回默认值
    pub fn load() -> Self {
        let path = surge_dir().join("settings.json");
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!("设置文件解析失败，使用默认设置: {}", e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// 保存设置到配置目录
    pub fn save(&self) -> Result<()> {
        let dir = surge_dir();
        std::fs::create_dir_all(&dir).context("创建配置目录失败")?;
        let path = dir.join("settings.json");
        let content = serde_json::to_string_pretty(self).context("序列化设置失败")?;
        std::fs::write(&path, content).context("写入设置文件失败")?;
        info!("设置已保存: {:?}", path);
        Ok(())
    }

    /// 重试基础延迟
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.performance.retry_base_delay_ms)
    }

    /// 停滞超时
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.performance.stall_timeout_secs)
    }

    /// 慢工作协程宽限期
    pub fn slow_worker_grace_period(&self) -> Duration {
        Duration::from_secs(self.performance.slow_worker_grace_period_secs)
    }

    /// 状态保存间隔
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.performance.checkpoint_interval_secs)
    }
}

/// 根据文件大小计算初始连接数
///
/// 公式：min(max_connections_per_host, ceil(sqrt(size / MB)))，
/// 文件过小（不足一个最小分片）时退化为单连接
pub fn get_initial_connections(total_size: i64, settings: &Settings) -> usize {
    if total_size <= 0 {
        return 1;
    }
    let size = total_size as u64;
    if settings.chunks.sequential_download || settings.chunks.min_chunk_size > size {
        return 1;
    }

    let by_size = ((size as f64 / MB as f64).sqrt().ceil()) as usize;
    by_size.clamp(1, settings.connections.max_connections_per_host.max(1))
}

/// 计算目标分片大小
///
/// 按连接数均分后向上对齐到 ALIGN_SIZE，且不小于 min_chunk_size；
/// 最后一个分片吸收尾部余量
pub fn calculate_chunk_size(total_size: u64, connections: usize, settings: &Settings) -> u64 {
    let n = connections.max(1) as u64;
    let raw = total_size.div_ceil(n);
    let aligned = raw.div_ceil(ALIGN_SIZE) * ALIGN_SIZE;
    aligned.max(settings.chunks.min_chunk_size)
}

/// surge 配置目录（按操作系统惯例）
///
/// 可通过 SURGE_DIR 环境变量覆盖（测试环境使用）
pub fn surge_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SURGE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("surge")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_connections_zero_size() {
        let settings = Settings::default();
        assert_eq!(get_initial_connections(0, &settings), 1);
        assert_eq!(get_initial_connections(-1, &settings), 1);
    }

    #[test]
    fn test_initial_connections_small_file() {
        let settings = Settings::default();
        // 文件比最小分片还小，单连接
        assert_eq!(get_initial_connections(512 * 1024, &settings), 1);
    }

    #[test]
    fn test_initial_connections_sqrt_scaling() {
        let settings = Settings::default();
        // 4 MiB -> sqrt(4) = 2
        assert_eq!(get_initial_connections(4 * MB as i64, &settings), 2);
        // 16 MiB -> sqrt(16) = 4
        assert_eq!(get_initial_connections(16 * MB as i64, &settings), 4);
        // 25 MiB -> 5
        assert_eq!(get_initial_connections(25 * MB as i64, &settings), 5);
    }

    #[test]
    fn test_initial_connections_capped() {
        let settings = Settings::default();
        // 1 GiB -> sqrt(1024) = 32，被 max_connections_per_host=8 限制
        assert_eq!(get_initial_connections(1024 * MB as i64, &settings), 8);
    }

    #[test]
    fn test_initial_connections_sequential() {
        let mut settings = Settings::default();
        settings.chunks.sequential_download = true;
        assert_eq!(get_initial_connections(1024 * MB as i64, &settings), 1);
    }

    #[test]
    fn test_chunk_size_alignment() {
        let settings = Settings::default();
        let chunk = calculate_chunk_size(100 * MB, 8, &settings);
        assert_eq!(chunk % ALIGN_SIZE, 0);
        assert!(chunk >= settings.chunks.min_chunk_size);
        // 8 个分片应能覆盖全文件
        assert!(chunk * 8 >= 100 * MB);
    }

    #[test]
    fn test_chunk_size_min_floor() {
        let settings = Settings::default();
        // 小文件被最小分片兜底
        let chunk = calculate_chunk_size(2 * MB, 8, &settings);
        assert_eq!(chunk, settings.chunks.min_chunk_size);
    }

    #[test]
    fn test_settings_roundtrip() {
        let settings = Settings::default();
        let json = serde_json::to_string(&settings).unwrap();
        let parsed: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(
            parsed.connections.max_connections_per_host,
            settings.connections.max_connections_per_host
        );
        assert_eq!(parsed.chunks.min_chunk_size, settings.chunks.min_chunk_size);
    }
}
