//! 日志系统配置
//!
//! 控制台输出 + 可选的文件持久化（按天滚动，非阻塞写入）。
//! 级别优先读 RUST_LOG 环境变量，其次用配置中的 level。

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LogConfig;

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "resumable-upload.log";

/// 初始化日志系统
///
/// # 参数
/// * `config` - 日志配置
///
/// # 返回
/// 文件输出启用时返回后台写入线程的守卫，调用方需持有到进程退出
pub fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let console_layer = fmt::layer()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_target(true);

    if config.enabled {
        let appender = tracing_appender::rolling::daily(&config.log_dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let file_layer = fmt::layer()
            .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
            .with_ansi(false)
            .with_writer(writer);

        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        tracing::info!("日志文件输出已启用: {:?}", config.log_dir);
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .init();
        None
    }
}
