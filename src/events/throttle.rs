//! 进度事件节流器
//!
//! 控制进度事件的发布频率，避免分片回调风暴。
//! 只节流 Progress 事件；阶段边界事件（完成、失败等）各自独立发布，不走节流。

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 进度事件节流器
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 上次发布时间（None 表示尚未发布过）
    last_emit: Mutex<Option<Instant>>,
    /// 最小发布间隔
    interval: Duration,
}

impl ProgressThrottler {
    /// 创建节流器
    ///
    /// # 参数
    /// * `interval` - 最小发布间隔
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit: Mutex::new(None),
            interval,
        }
    }

    /// 使用指定毫秒间隔创建
    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 检查是否应该发布事件
    ///
    /// 距上次发布超过间隔时返回 true 并更新时间戳，否则返回 false。
    pub fn should_emit(&self) -> bool {
        let mut last = self.last_emit.lock();
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// 重置节流状态（会话清空时调用）
    pub fn reset(&self) {
        *self.last_emit.lock() = None;
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}
