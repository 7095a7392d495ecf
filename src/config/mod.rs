// 配置管理模块
//
// 两层配置：
// - EngineConfig：进程级引擎配置（持久化路径、并发上限、事件节流、日志）
// - UploadConfig：表单级上传声明解析结果（见 form 子模块）

pub mod form;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

pub use form::{
    resolve_upload_config, PostSubmitBehavior, TransferMode, UploadConfig, UploadDeclaration,
    DEFAULT_STAGED_CHUNK_SIZE, MIN_STAGED_CHUNK_SIZE,
};

/// 引擎配置
///
/// 所有字段都有默认值，可从 TOML 文件加载覆盖。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 本地持久化数据库路径
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// 单文件最大并发分片数（跨文件无全局上限）
    #[serde(default = "default_max_concurrent_parts")]
    pub max_concurrent_parts: usize,
    /// 进度事件最小发布间隔（毫秒）
    #[serde(default = "default_progress_throttle_ms")]
    pub progress_throttle_ms: u64,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("uploads.db")
}

fn default_max_concurrent_parts() -> usize {
    3
}

fn default_progress_throttle_ms() -> u64 {
    200
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            max_concurrent_parts: default_max_concurrent_parts(),
            progress_throttle_ms: default_progress_throttle_ms(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// 从 TOML 文件加载配置
    ///
    /// # 参数
    /// * `path` - 配置文件路径
    pub async fn load(path: &std::path::Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;
        let config: Self = toml::from_str(&content).context("解析配置文件失败")?;
        Ok(config)
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化（默认仅控制台输出）
    #[serde(default)]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}
