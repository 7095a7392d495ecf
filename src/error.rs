// 错误类型定义
//
// 错误分为四类，作用范围各不相同：
// - 配置错误：引擎不附加到该表单，其余表单不受影响
// - 持久化错误：仅建议性，引擎继续使用内存状态
// - 协议错误：对受影响的文件致命（标记 failed），不波及其他文件
// - 传输错误：对受影响的文件致命，已确认的分片保留以便续传
//
// 所有失败最终落到文件状态（status=failed + last_error）和结构化事件上，
// 不会以 panic 形式穿过 gate/start 边界。

use thiserror::Error;

/// 配置错误
///
/// 解析表单上传声明失败时返回；调用方记录日志后放弃附加引擎。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 未知的传输模式（仅支持 staged / simple）
    #[error("未知的上传模式: {0}")]
    UnknownMode(String),

    /// 分片大小必须为正数
    #[error("分片大小无效: {0}")]
    InvalidChunkSize(u64),

    /// staged 模式必须显式声明端点；simple 模式可回退到表单 action
    #[error("缺少上传端点")]
    MissingEndpoint,
}

/// 持久化错误
///
/// 所有调用点都把该错误当作建议性失败处理：记录日志后继续内存运行。
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("数据库错误: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("记录序列化失败: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("后台数据库任务失败: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// 协议错误
///
/// init/complete 响应不符合契约时产生，对受影响的文件致命。
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// init 响应没有给该文件返回条目
    #[error("init 响应缺少文件 {input_name} 的条目")]
    MissingInitEntry { input_name: String },

    /// part URL 数量与计算出的分片数不一致
    #[error("part URL 数量不匹配: 期望 {expected}, 实际 {actual}")]
    PartCountMismatch { expected: usize, actual: usize },

    /// complete 阶段发现某个分片没有确认令牌
    #[error("分片 #{part_number} 缺少确认令牌")]
    MissingConfirmation { part_number: u32 },

    /// 响应体无法解析为预期形状
    #[error("响应格式无效: {0}")]
    MalformedResponse(String),

    /// init/complete 请求返回非 2xx
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
}

/// 传输错误
///
/// 单个分片或整文件传输失败时产生；已确认的分片不会回滚。
#[derive(Debug, Error)]
pub enum TransferError {
    /// 服务器返回非 2xx 状态码
    #[error("HTTP {status}")]
    Status { status: u16 },

    /// 网络层失败（连接、超时、DNS 等）
    #[error("网络错误: {0}")]
    Network(String),

    /// 无法取得分片字节（持久化分片缺失且源已不可用）
    #[error("读取源数据失败: {0}")]
    Source(String),

    /// 文件被替换或会话被清理，传输中止
    #[error("传输已取消")]
    Canceled,
}

/// 单个文件的上传失败
///
/// 协议错误与传输错误的统一包装，Display 结果直接写入 `last_error`。
#[derive(Debug, Error)]
pub enum UploadFailure {
    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Transfer(#[from] TransferError),
}
