//! 上传事件类型定义
//!
//! 在阶段边界发布的结构化事件，供外部观测（UI、日志采集）订阅，
//! 引擎自身不耦合任何具体界面。

use serde::{Deserialize, Serialize};

/// 上传事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 文件入队（选择或恢复时）
    FileQueued {
        session_id: String,
        input_name: String,
        file_index: u32,
        file_uuid: String,
        file_name: String,
        total_chunks: usize,
    },
    /// 状态变更
    StatusChanged {
        session_id: String,
        input_name: String,
        file_index: u32,
        old_status: String,
        new_status: String,
    },
    /// 分片开始传输
    ChunkStarted {
        session_id: String,
        input_name: String,
        file_index: u32,
        chunk_index: usize,
    },
    /// 分片确认完成
    ChunkCompleted {
        session_id: String,
        input_name: String,
        file_index: u32,
        chunk_index: usize,
        uploaded_chunks: usize,
        total_chunks: usize,
    },
    /// 进度更新（节流发布）
    Progress {
        session_id: String,
        input_name: String,
        file_index: u32,
        /// 0.0 - 1.0
        progress: f64,
        uploaded_chunks: usize,
        total_chunks: usize,
    },
    /// finalize 开始
    FinalizeStarted {
        session_id: String,
        input_name: String,
        file_index: u32,
    },
    /// 文件完成
    FileCompleted {
        session_id: String,
        input_name: String,
        file_index: u32,
        remote_id: String,
    },
    /// 文件失败
    FileFailed {
        session_id: String,
        input_name: String,
        file_index: u32,
        error: String,
    },
    /// 提交被推迟（有文件尚未完成）
    SubmissionDeferred { session_id: String },
    /// 被推迟的提交已重放
    SubmissionReplayed { session_id: String, action: String },
    /// 会话已清空
    SessionCleared { session_id: String },
}
