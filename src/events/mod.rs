// 事件模块
//
// broadcast 总线 + 节流器：引擎在阶段边界发布结构化事件，
// 订阅方（UI、测试）各自持有接收端，无订阅方时发布为空操作。

pub mod throttle;
pub mod types;

pub use throttle::{ProgressThrottler, DEFAULT_THROTTLE_INTERVAL_MS};
pub use types::UploadEvent;

use tokio::sync::broadcast;

/// 事件总线默认容量
const DEFAULT_BUS_CAPACITY: usize = 256;

/// 上传事件总线
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UploadEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.tx.subscribe()
    }

    /// 发布事件
    ///
    /// 没有订阅方时发送失败，静默忽略。
    pub fn emit(&self, event: UploadEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
