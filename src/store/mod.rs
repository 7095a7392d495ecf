//! 本地持久化存储模块
//!
//! 让上传在进程重启后可以续传，包括：
//! - 文件记录：每个 FileState 的持久化投影（可重复写入，按会话查询）
//! - 分片字节：每个尚未确认的分片一行，确认后立即删除以控制占用
//! - 挂起提交：每个会话至多一条被推迟的表单提交
//!
//! ## 设计原则
//!
//! 1. **建议性失败**: 任何存储操作失败都不允许中断传输，调用方记录日志后
//!    继续使用内存状态
//! 2. **复合键寻址**: 所有记录用 (session_id, input_name, file_index
//!    [, chunk_index]) 寻址，不依赖创建它们的内存引用
//! 3. **事务删除**: 删除文件及其分片、清空会话都在单个事务内完成
//!
//! ## 表结构
//!
//! ```text
//! file_records        (session_id, input_name, file_index) -> record_json
//! chunk_blobs         (session_id, input_name, file_index, chunk_index) -> bytes
//! pending_submissions (session_id) -> record_json
//! ```

pub mod db;
pub mod types;

pub use db::ChunkStore;
pub use types::{FileKey, FileRecord, FileTransferStatus, PendingSubmission};
