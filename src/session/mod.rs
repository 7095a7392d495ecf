// 上传会话与文件状态
//
// UploadSession 与表单一一对应，持有 (input_name, file_index) -> FileState
// 的映射和至多一条挂起提交。FileState 的变更只发生在驱动该文件的那一个
// 传输任务里（调度器在排空后才 finalize），不存在跨任务并发写同一文件。

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{TransferMode, UploadConfig};
use crate::events::ProgressThrottler;
use crate::protocol::types::synthesized_path;
use crate::source::ByteRangeSource;
use crate::store::{FileKey, FileRecord, FileTransferStatus, PendingSubmission};

/// 选择的文件（change/drop 事件产出）
#[derive(Clone)]
pub struct SelectedFile {
    /// 文件名
    pub name: String,
    /// MIME 类型
    pub mime: String,
    /// 字节源
    pub source: Arc<dyn ByteRangeSource>,
}

/// 计算分片数: ceil(size / chunk_size)
pub fn chunk_count(size: u64, chunk_size: u64) -> usize {
    if size == 0 {
        0
    } else {
        size.div_ceil(chunk_size) as usize
    }
}

/// 单个文件的传输状态
///
/// 字节源与传输中进度表是活句柄，不参与持久化。
pub struct FileState {
    /// 所属会话
    pub session_id: String,
    /// 文件键
    pub key: FileKey,
    /// 文件 UUID
    pub file_uuid: String,
    /// 文件名
    pub file_name: String,
    /// 文件大小
    pub size: u64,
    /// MIME 类型
    pub mime: String,
    /// 分片大小
    pub chunk_size: u64,
    /// 总分片数（simple: 1）
    pub total_chunks: usize,
    /// 传输状态
    pub status: FileTransferStatus,
    /// 已确认分片数（单调不减）
    pub uploaded_chunks: usize,
    /// 远端路径（init 响应或合成，complete 的回退标识）
    pub path: String,
    /// staged 上传句柄
    pub staging_handle: Option<String>,
    /// 分片 URL（init 后长度等于 total_chunks）
    pub part_urls: Vec<String>,
    /// 分片确认令牌（槽位按分片索引）
    pub part_confirmations: Vec<Option<String>>,
    /// 远端文件标识
    pub remote_id: Option<String>,
    /// 最后一次错误
    pub last_error: Option<String>,
    /// 创建时间
    pub created_at: chrono::DateTime<Utc>,
    /// 最后更新时间
    pub updated_at: chrono::DateTime<Utc>,

    // === 运行时字段（不持久化） ===
    /// 字节源（重启后为 None，由持久化分片兜底）
    pub source: Option<Arc<dyn ByteRangeSource>>,
    /// 传输中分片进度 (chunk_index -> 0.0..1.0)
    pub inflight: Arc<DashMap<usize, f64>>,
    /// 取消令牌（文件被替换或会话清空时取消）
    pub cancel: CancellationToken,
    /// 进度下限（保证对外进度单调不减）
    progress_floor: f64,
}

impl FileState {
    /// 从选择的文件创建状态
    pub fn new(
        session_id: &str,
        key: FileKey,
        selected: &SelectedFile,
        mode: TransferMode,
        chunk_size: u64,
    ) -> Self {
        let size = selected.source.len();
        let file_uuid = Uuid::new_v4().to_string();
        // simple 模式整文件即单一分片；确认槽位立即就绪（无 init 阶段）
        let (chunk_size, total_chunks, part_confirmations) = match mode {
            TransferMode::Simple => (size.max(1), 1, vec![None]),
            TransferMode::Staged => (chunk_size, chunk_count(size, chunk_size), Vec::new()),
        };
        let now = Utc::now();
        let path = synthesized_path(session_id, &file_uuid, &selected.name);

        Self {
            session_id: session_id.to_string(),
            key,
            file_uuid,
            file_name: selected.name.clone(),
            size,
            mime: selected.mime.clone(),
            chunk_size,
            total_chunks,
            status: FileTransferStatus::Queued,
            uploaded_chunks: 0,
            path,
            staging_handle: None,
            part_urls: Vec::new(),
            part_confirmations,
            remote_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            source: Some(selected.source.clone()),
            inflight: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
            progress_floor: 0.0,
        }
    }

    /// 从持久化记录重建（重启恢复）
    pub fn from_record(record: FileRecord) -> Self {
        Self {
            session_id: record.session_id,
            key: record.key,
            file_uuid: record.file_uuid,
            file_name: record.file_name,
            size: record.size,
            mime: record.mime,
            chunk_size: record.chunk_size,
            total_chunks: record.total_chunks,
            status: record.status,
            uploaded_chunks: record.uploaded_chunks,
            path: record.path,
            staging_handle: record.staging_handle,
            part_urls: record.part_urls,
            part_confirmations: record.part_confirmations,
            remote_id: record.remote_id,
            last_error: record.last_error,
            created_at: record.created_at,
            updated_at: record.updated_at,
            source: None,
            inflight: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
            progress_floor: 0.0,
        }
    }

    /// 生成持久化投影
    pub fn to_record(&self) -> FileRecord {
        FileRecord {
            session_id: self.session_id.clone(),
            key: self.key.clone(),
            file_uuid: self.file_uuid.clone(),
            file_name: self.file_name.clone(),
            size: self.size,
            mime: self.mime.clone(),
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks,
            status: self.status,
            uploaded_chunks: self.uploaded_chunks,
            path: self.path.clone(),
            staging_handle: self.staging_handle.clone(),
            part_urls: self.part_urls.clone(),
            part_confirmations: self.part_confirmations.clone(),
            remote_id: self.remote_id.clone(),
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// 分片的字节范围 (offset, len)
    pub fn chunk_range(&self, chunk_index: usize) -> (u64, u64) {
        let offset = chunk_index as u64 * self.chunk_size;
        let len = self.chunk_size.min(self.size.saturating_sub(offset));
        (offset, len)
    }

    /// 尚未确认的分片索引
    pub fn pending_parts(&self) -> Vec<usize> {
        self.part_confirmations
            .iter()
            .enumerate()
            .filter(|(_, token)| token.is_none())
            .map(|(idx, _)| idx)
            .collect()
    }

    /// init 是否已完成（句柄 + 完整分片 URL 列表）
    pub fn is_initialized(&self) -> bool {
        self.staging_handle.is_some() && self.part_urls.len() == self.total_chunks
    }

    /// 标记为上传中
    pub fn mark_uploading(&mut self) {
        self.status = FileTransferStatus::Uploading;
        self.updated_at = Utc::now();
    }

    /// 标记为 finalize 中
    pub fn mark_finalizing(&mut self) {
        self.status = FileTransferStatus::Finalizing;
        self.updated_at = Utc::now();
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self, remote_id: String) {
        self.status = FileTransferStatus::Completed;
        self.remote_id = Some(remote_id);
        self.uploaded_chunks = self.total_chunks;
        self.inflight.clear();
        self.updated_at = Utc::now();
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        self.status = FileTransferStatus::Failed;
        self.last_error = Some(error);
        self.inflight.clear();
        self.updated_at = Utc::now();
    }

    /// 记录一个分片确认
    ///
    /// 只写槽位 `chunk_index`，最终顺序由分片索引决定，与完成顺序无关。
    pub fn confirm_part(&mut self, chunk_index: usize, token: String) {
        if let Some(slot) = self.part_confirmations.get_mut(chunk_index) {
            if slot.is_none() {
                *slot = Some(token);
                self.uploaded_chunks += 1;
            }
        }
        self.inflight.remove(&chunk_index);
        self.updated_at = Utc::now();
    }

    /// 计算对外进度: min(1, (uploaded + Σ inflight) / total)
    ///
    /// 带单调下限，分片失败移出传输中进度表时对外进度不会回退。
    pub fn progress(&mut self) -> f64 {
        let raw = if self.total_chunks == 0 {
            if self.status == FileTransferStatus::Completed {
                1.0
            } else {
                0.0
            }
        } else {
            let inflight_sum: f64 = self.inflight.iter().map(|entry| *entry.value()).sum();
            ((self.uploaded_chunks as f64 + inflight_sum) / self.total_chunks as f64).min(1.0)
        };
        if raw > self.progress_floor {
            self.progress_floor = raw;
        }
        self.progress_floor
    }

    /// 生成对外进度条目
    pub fn entry(&mut self) -> UploadEntry {
        let progress = self.progress();
        UploadEntry {
            session_id: self.session_id.clone(),
            input_name: self.key.input_name.clone(),
            file_index: self.key.file_index,
            file_uuid: self.file_uuid.clone(),
            file_name: self.file_name.clone(),
            status: self.status,
            uploaded_chunks: self.uploaded_chunks,
            total_chunks: self.total_chunks,
            progress,
            last_error: self.last_error.clone(),
        }
    }
}

/// 对外进度条目（只读投影）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadEntry {
    pub session_id: String,
    pub input_name: String,
    pub file_index: u32,
    pub file_uuid: String,
    pub file_name: String,
    pub status: FileTransferStatus,
    pub uploaded_chunks: usize,
    pub total_chunks: usize,
    /// 0.0 - 1.0
    pub progress: f64,
    pub last_error: Option<String>,
}

/// 文件状态句柄
pub type FileHandle = Arc<Mutex<FileState>>;

/// 上传会话（与表单一一对应）
pub struct UploadSession {
    /// 会话标识
    pub id: String,
    /// 表单级配置（生命周期内不可变）
    pub config: UploadConfig,
    /// 文件映射
    pub files: DashMap<FileKey, FileHandle>,
    /// 挂起提交（至多一条）
    pub pending: Mutex<Option<PendingSubmission>>,
    /// 进度事件节流器（会话内共享）
    pub throttler: Arc<ProgressThrottler>,
    /// init 批量化互斥锁
    pub init_lock: Mutex<()>,
}

impl UploadSession {
    pub fn new(id: &str, config: UploadConfig, throttle_ms: u64) -> Self {
        Self {
            id: id.to_string(),
            config,
            files: DashMap::new(),
            pending: Mutex::new(None),
            throttler: Arc::new(ProgressThrottler::with_millis(throttle_ms)),
            init_lock: Mutex::new(()),
        }
    }

    /// 按键排序的文件句柄快照
    pub fn snapshot(&self) -> Vec<(FileKey, FileHandle)> {
        let mut handles: Vec<(FileKey, FileHandle)> = self
            .files
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        handles.sort_by(|a, b| a.0.cmp(&b.0));
        handles
    }

    /// 取出并移除全部文件句柄（清空会话时用）
    pub fn drain(&self) -> Vec<FileHandle> {
        let keys: Vec<FileKey> = self.files.iter().map(|e| e.key().clone()).collect();
        let mut handles = Vec::new();
        for key in keys {
            if let Some((_, handle)) = self.files.remove(&key) {
                handles.push(handle);
            }
        }
        handles
    }
}
