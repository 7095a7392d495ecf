// 提交闸门
//
// 通用请求管线在发出非 GET 提交前调用 gate，按会话内文件状态三选一：
// - 有失败文件 → 阻断（需重新选择文件重试）
// - 有未完成文件 → 捕获并持久化挂起提交（取代旧的），返回"推迟"
// - 全部完成 → 把远端标识并入出站载荷，放行
//
// 挂起提交在最后一个文件到达终态后经注册的重放通道送回管线执行，
// 带 skip_gate=true 避免重入闸门逻辑。

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::events::{EventBus, UploadEvent};
use crate::session::{FileHandle, UploadSession};
use crate::store::{ChunkStore, FileKey, FileTransferStatus, PendingSubmission};

/// 一次待评估的表单提交
#[derive(Debug, Clone)]
pub struct FormSubmission {
    /// 所属会话
    pub session_id: String,
    /// HTTP 方法
    pub method: String,
    /// 解析后的 action URL
    pub action: String,
    /// 非文件表单字段
    pub fields: Vec<(String, String)>,
    /// 提交目标提示（重载后重新解析用）
    pub target_hint: Option<String>,
    /// 重放时置位，跳过闸门逻辑
    pub skip_gate: bool,
}

/// 闸门评估结果
#[derive(Debug, Clone)]
pub enum GateOutcome {
    /// 阻断：存在失败文件
    Blocked { reason: String },
    /// 推迟：已捕获挂起提交，上传完成后自动重放
    Deferred,
    /// 放行：载荷已并入远端标识
    Released { fields: Vec<(String, String)> },
}

/// 重放的提交（经注册的通道送回请求管线）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySubmission {
    pub session_id: String,
    pub method: String,
    pub action: String,
    pub fields: Vec<(String, String)>,
    pub target_hint: Option<String>,
    /// 恒为 true：重放走正常提交路径但不再进闸门
    pub skip_gate: bool,
}

impl ReplaySubmission {
    pub fn from_pending(pending: &PendingSubmission, fields: Vec<(String, String)>) -> Self {
        Self {
            session_id: pending.session_id.clone(),
            method: pending.method.clone(),
            action: pending.action.clone(),
            fields,
            target_hint: pending.target_hint.clone(),
            skip_gate: true,
        }
    }
}

/// 评估一次提交
pub(crate) async fn evaluate(
    session: &Arc<UploadSession>,
    store: &ChunkStore,
    bus: &EventBus,
    submission: &FormSubmission,
) -> GateOutcome {
    if submission.skip_gate {
        return GateOutcome::Released {
            fields: submission.fields.clone(),
        };
    }

    let snapshot = session.snapshot();

    // 失败文件阻断提交
    for (key, handle) in &snapshot {
        let f = handle.lock().await;
        if f.status == FileTransferStatus::Failed {
            let reason = format!(
                "文件 {} 上传失败: {}",
                key,
                f.last_error.clone().unwrap_or_else(|| "未知错误".to_string())
            );
            info!("提交被阻断: {}", reason);
            return GateOutcome::Blocked { reason };
        }
    }

    // 未完成文件（含 queued）推迟提交
    let mut incomplete = false;
    for (_, handle) in &snapshot {
        let f = handle.lock().await;
        if f.status != FileTransferStatus::Completed {
            incomplete = true;
            break;
        }
    }

    if incomplete {
        let pending = PendingSubmission {
            session_id: session.id.clone(),
            method: submission.method.clone(),
            action: submission.action.clone(),
            fields: submission.fields.clone(),
            target_hint: submission.target_hint.clone(),
            captured_at: Utc::now(),
        };

        // 新提交隐式取代旧的，持久化也随之覆盖
        *session.pending.lock().await = Some(pending.clone());
        if let Err(e) = store.put_pending_submission(&pending).await {
            warn!("持久化挂起提交失败: {}", e);
        }

        info!("会话 {} 仍有文件未完成，提交已推迟", session.id);
        bus.emit(UploadEvent::SubmissionDeferred {
            session_id: session.id.clone(),
        });
        return GateOutcome::Deferred;
    }

    // 全部完成：并入远端标识后放行
    let fields = merge_remote_ids(submission.fields.clone(), &snapshot).await;
    GateOutcome::Released { fields }
}

/// 把已完成文件的远端标识并入出站字段（按键序追加）
pub(crate) async fn merge_remote_ids(
    mut fields: Vec<(String, String)>,
    snapshot: &[(FileKey, FileHandle)],
) -> Vec<(String, String)> {
    for (key, handle) in snapshot {
        let f = handle.lock().await;
        match &f.remote_id {
            Some(id) => fields.push((key.input_name.clone(), id.clone())),
            None => warn!("文件 {} 缺少远端标识，未并入载荷", key),
        }
    }
    fields
}
