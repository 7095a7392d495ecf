// Resumable Upload Rust Library
// 可断点续传的分片上传引擎核心库
//
// 把表单选择的文件在本地持久化后传往远端存储：支持 simple（单次
// multipart 传输）与 staged（init -> 并行分片 -> complete）两种线路协议，
// 单文件分片并发受限，提交闸门在所有文件完成前拦截表单提交，
// 进程重启后从持久化状态续传并重放被推迟的提交。

// 配置管理模块
pub mod config;

// 错误类型模块
pub mod error;

// 事件模块（结构化事件总线 + 进度节流）
pub mod events;

// 字节范围源模块
pub mod source;

// 本地持久化存储模块
pub mod store;

// 协议适配器模块（simple / staged + HTTP 传输层）
pub mod protocol;

// 分片上传调度器模块
pub mod scheduler;

// 上传会话与文件状态模块
pub mod session;

// 提交闸门模块
pub mod gate;

// 上传引擎模块
pub mod engine;

// 日志系统模块
pub mod logging;

// 导出常用类型
pub use config::{
    resolve_upload_config, EngineConfig, LogConfig, PostSubmitBehavior, TransferMode,
    UploadConfig, UploadDeclaration, DEFAULT_STAGED_CHUNK_SIZE, MIN_STAGED_CHUNK_SIZE,
};
pub use engine::UploadEngine;
pub use error::{ConfigError, ProtocolError, StoreError, TransferError, UploadFailure};
pub use events::{EventBus, ProgressThrottler, UploadEvent};
pub use gate::{FormSubmission, GateOutcome, ReplaySubmission};
pub use protocol::{HttpTransport, UploadTransport};
pub use scheduler::PartScheduler;
pub use session::{FileState, SelectedFile, UploadEntry, UploadSession};
pub use source::{ByteRangeSource, FileByteSource, MemoryByteSource};
pub use store::{ChunkStore, FileKey, FileRecord, FileTransferStatus, PendingSubmission};
