// 表单上传声明解析
//
// 把属性解析器产出的类型化声明转换为一份不可变的 UploadConfig。
// 解析失败（未知模式、非法分片大小、缺少端点）意味着引擎不附加到该表单；
// "提交后清理" 与 "跨页重定向" 同时声明只是标记冲突并告警，不算失败。

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

/// staged 模式最小分片大小: 5MB（对象存储对非末尾分片的普遍下限）
pub const MIN_STAGED_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// 默认分片大小: 5MB
pub const DEFAULT_STAGED_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// 传输模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// init → 并行分片传输 → complete 三阶段协议
    Staged,
    /// 单次 multipart POST 整文件传输
    Simple,
}

/// 提交成功后的会话处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostSubmitBehavior {
    /// 提交放行后清空会话（文件记录、分片、进度条目）
    Clear,
    /// 保留已完成的条目
    Keep,
}

/// 表单的上传声明（由外部属性解析器产出的类型化字段）
#[derive(Debug, Clone, Default)]
pub struct UploadDeclaration {
    /// 模式字符串（"staged" / "simple"）
    pub mode: String,
    /// 端点覆盖
    pub endpoint: Option<String>,
    /// 分片大小覆盖（字节）
    pub chunk_size: Option<u64>,
    /// 提交后行为（"clear" / "keep"）
    pub post_submit: Option<String>,
    /// 表单是否同时声明了跨页重定向
    pub redirect_declared: bool,
    /// 表单 action（simple 模式的端点回退）
    pub form_action: Option<String>,
}

/// 表单级上传配置
///
/// 在表单生命周期内不可变。
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// 传输模式
    pub mode: TransferMode,
    /// 上传端点
    pub endpoint: String,
    /// 分片大小（仅 staged 模式使用）
    pub chunk_size: u64,
    /// 提交后行为
    pub post_submit: PostSubmitBehavior,
    /// clear 与重定向同时声明（两者描述的提交后界面处理互斥）
    pub conflicting_redirect: bool,
}

/// 解析表单上传声明
///
/// # 参数
/// * `decl` - 属性解析器产出的声明
///
/// # 返回
/// 不可变的 UploadConfig；Err 表示引擎不应附加到该表单
pub fn resolve_upload_config(decl: &UploadDeclaration) -> Result<UploadConfig, ConfigError> {
    let mode = match decl.mode.as_str() {
        "staged" => TransferMode::Staged,
        "simple" => TransferMode::Simple,
        other => return Err(ConfigError::UnknownMode(other.to_string())),
    };

    // staged 模式要求显式端点；simple 模式可回退到表单 action
    let endpoint = match (mode, &decl.endpoint) {
        (_, Some(url)) if !url.is_empty() => url.clone(),
        (TransferMode::Simple, _) => match &decl.form_action {
            Some(action) if !action.is_empty() => action.clone(),
            _ => return Err(ConfigError::MissingEndpoint),
        },
        (TransferMode::Staged, _) => return Err(ConfigError::MissingEndpoint),
    };

    let chunk_size = match decl.chunk_size {
        Some(0) => return Err(ConfigError::InvalidChunkSize(0)),
        Some(size) if size < MIN_STAGED_CHUNK_SIZE => {
            warn!(
                "声明的分片大小 {} 小于协议下限 {}，已自动提升",
                size, MIN_STAGED_CHUNK_SIZE
            );
            MIN_STAGED_CHUNK_SIZE
        }
        Some(size) => size,
        None => DEFAULT_STAGED_CHUNK_SIZE,
    };

    let post_submit = match decl.post_submit.as_deref() {
        Some("clear") => PostSubmitBehavior::Clear,
        Some("keep") | None => PostSubmitBehavior::Keep,
        Some(other) => {
            warn!("未知的提交后行为 {:?}，按 keep 处理", other);
            PostSubmitBehavior::Keep
        }
    };

    // clear 会在提交后清空本页进度，重定向则离开本页，二者互斥
    let conflicting_redirect =
        post_submit == PostSubmitBehavior::Clear && decl.redirect_declared;
    if conflicting_redirect {
        warn!("同时声明了提交后清理与跨页重定向，两者互斥，以重定向为准");
    }

    Ok(UploadConfig {
        mode,
        endpoint,
        chunk_size,
        post_submit,
        conflicting_redirect,
    })
}
