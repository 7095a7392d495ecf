//! 持久化核心类型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 文件键
///
/// 在一个会话内唯一标识一个文件槽位；重新选择同一槽位的文件会替换掉
/// 旧的 FileState 及其持久化分片。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileKey {
    /// 表单控件名
    pub input_name: String,
    /// 同一控件内的文件序号（多选时 0, 1, 2...）
    pub file_index: u32,
}

impl FileKey {
    pub fn new(input_name: impl Into<String>, file_index: u32) -> Self {
        Self {
            input_name: input_name.into(),
            file_index,
        }
    }
}

impl std::fmt::Display for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.input_name, self.file_index)
    }
}

/// 文件传输状态
///
/// 使用 snake_case 序列化以便 JSON 可读
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileTransferStatus {
    /// 已入队，尚未开始传输
    Queued,
    /// 分片（或整文件）传输中
    Uploading,
    /// 所有分片已确认，正在执行 complete
    Finalizing,
    /// 已完成，远端标识已知
    Completed,
    /// 失败（协议或传输错误）
    Failed,
}

impl FileTransferStatus {
    /// 是否为终态（完成或失败）
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for FileTransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Uploading => write!(f, "uploading"),
            Self::Finalizing => write!(f, "finalizing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// 文件持久化记录
///
/// FileState 的耐久投影：省略活句柄（字节源、传输中进度表），
/// 其余字段足以在重启后重建并续传。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// 所属会话
    pub session_id: String,

    /// 文件键
    pub key: FileKey,

    /// 文件 UUID（创建时生成，跨重启稳定）
    pub file_uuid: String,

    /// 原始文件名
    pub file_name: String,

    /// 文件大小（字节）
    pub size: u64,

    /// MIME 类型
    pub mime: String,

    /// 分片大小（字节）
    pub chunk_size: u64,

    /// 总分片数
    pub total_chunks: usize,

    /// 传输状态
    pub status: FileTransferStatus,

    /// 已确认分片数（单调不减，直到清理）
    pub uploaded_chunks: usize,

    /// 远端路径（init 响应给出或本地合成，complete 阶段的回退标识）
    pub path: String,

    /// staged 上传句柄（init 返回）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging_handle: Option<String>,

    /// 分片 URL 列表（init 返回，长度等于 total_chunks）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub part_urls: Vec<String>,

    /// 分片确认令牌（槽位按分片索引，init 成功后长度等于 total_chunks）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub part_confirmations: Vec<Option<String>>,

    /// 远端文件标识（完成后已知）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,

    /// 最后一次错误信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// 创建时间
    pub created_at: DateTime<Utc>,

    /// 最后更新时间
    pub updated_at: DateTime<Utc>,
}

/// 挂起的表单提交
///
/// 在上传未完成时拦截到的提交：记下非文件载荷、方法与解析后的
/// action，等所有文件完成后重放。按会话键持久化，不依赖创建它的
/// 内存提交目标，重载后由所属表单和可选的目标提示重新解析。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSubmission {
    /// 所属会话
    pub session_id: String,

    /// HTTP 方法
    pub method: String,

    /// 解析后的 action URL
    pub action: String,

    /// 非文件表单字段
    pub fields: Vec<(String, String)>,

    /// 提交目标提示（重载后重新解析用）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_hint: Option<String>,

    /// 捕获时间
    pub captured_at: DateTime<Utc>,
}
