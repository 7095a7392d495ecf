//! simple 协议适配器
//!
//! 整文件一次 multipart POST：上传进度直接映射到单一分片的进度上。
//! 没有低于整文件粒度的续传：失败后只能整文件重传（重新选择文件）。

use std::sync::Arc;

use tracing::{debug, info};

use super::http::{ProgressFn, UploadTransport};
use super::types::remote_id_from_body;
use crate::config::UploadConfig;
use crate::error::{TransferError, UploadFailure};
use crate::events::{EventBus, ProgressThrottler, UploadEvent};
use crate::session::FileHandle;

/// 执行 simple 模式上传
///
/// 可重入：远端标识已知时立即返回，不发起网络调用。
/// 恰好一次网络调用；非 2xx 响应以状态码记入错误。
pub async fn upload(
    transport: &Arc<dyn UploadTransport>,
    config: &UploadConfig,
    file: &FileHandle,
    bus: &EventBus,
    throttler: &Arc<ProgressThrottler>,
) -> Result<String, UploadFailure> {
    let (session_id, key, file_name, mime, size, fallback_path, source, cancel, inflight) = {
        let f = file.lock().await;
        if let Some(id) = &f.remote_id {
            debug!("文件 {} 远端标识已知，跳过上传", f.key);
            return Ok(id.clone());
        }
        (
            f.session_id.clone(),
            f.key.clone(),
            f.file_name.clone(),
            f.mime.clone(),
            f.size,
            f.path.clone(),
            f.source.clone(),
            f.cancel.clone(),
            f.inflight.clone(),
        )
    };

    // simple 模式不持久化分片：重启后源已丢失就无法续传
    let source = source.ok_or_else(|| {
        UploadFailure::from(TransferError::Source(
            "字节源不可用，请重新选择文件".to_string(),
        ))
    })?;

    let bytes = source
        .read_range(0, size)
        .await
        .map_err(|e| UploadFailure::from(TransferError::Source(e.to_string())))?;

    if cancel.is_cancelled() {
        return Err(TransferError::Canceled.into());
    }

    bus.emit(UploadEvent::ChunkStarted {
        session_id: session_id.clone(),
        input_name: key.input_name.clone(),
        file_index: key.file_index,
        chunk_index: 0,
    });

    let progress: ProgressFn = {
        let inflight = inflight.clone();
        let throttler = throttler.clone();
        let bus = bus.clone();
        let session_id = session_id.clone();
        let key = key.clone();
        Arc::new(move |fraction: f64| {
            let fraction = fraction.clamp(0.0, 1.0);
            inflight.insert(0, fraction);
            if throttler.should_emit() {
                bus.emit(UploadEvent::Progress {
                    session_id: session_id.clone(),
                    input_name: key.input_name.clone(),
                    file_index: key.file_index,
                    progress: fraction,
                    uploaded_chunks: 0,
                    total_chunks: 1,
                });
            }
        })
    };

    let body = transport
        .post_simple(
            &config.endpoint,
            &key.input_name,
            &file_name,
            &mime,
            bytes,
            progress,
        )
        .await?;

    // 响应体里找 path / fileId，找不到就用合成路径
    let remote_id = remote_id_from_body(&body).unwrap_or(fallback_path);

    {
        let mut f = file.lock().await;
        f.confirm_part(0, remote_id.clone());
    }
    bus.emit(UploadEvent::ChunkCompleted {
        session_id,
        input_name: key.input_name.clone(),
        file_index: key.file_index,
        chunk_index: 0,
        uploaded_chunks: 1,
        total_chunks: 1,
    });

    info!("文件 {} simple 上传完成: {}", key, remote_id);
    Ok(remote_id)
}
