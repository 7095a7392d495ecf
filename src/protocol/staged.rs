//! staged 协议适配器
//!
//! 三阶段：
//! 1. init — 一次请求列出会话内全部待初始化文件，响应给出每个文件的
//!    上传句柄和分片 URL 列表（数量必须与计算出的分片数一致）
//! 2. 分片传输 — 由调度器驱动（见 scheduler 模块）
//! 3. complete — 按分片索引提交完整确认令牌列表，换取远端标识
//!
//! init 幂等：已持有句柄和完整 URL 列表的文件不再进请求。
//! 请求级失败只影响本批文件；单个文件的校验失败不波及同批其他文件。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::http::UploadTransport;
use super::types::{
    validate_init_entry, CompleteFileSpec, CompletePart, InitFileEntry, InitFileSpec,
};
use crate::error::{ProtocolError, UploadFailure};
use crate::events::{EventBus, UploadEvent};
use crate::session::{FileHandle, UploadSession};
use crate::store::ChunkStore;

/// 初始化会话内所有待初始化的文件
///
/// 单个文件的失败（缺条目、分片数错配）在这里直接标记该文件 failed
/// 并发事件；调用方随后检查自己文件的状态。
pub async fn ensure_init(
    transport: &Arc<dyn UploadTransport>,
    session: &Arc<UploadSession>,
    store: &ChunkStore,
    bus: &EventBus,
) {
    // 串行化 init：并发启动的多个文件传输自然合并成一次批量请求
    let _guard = session.init_lock.lock().await;

    let snapshot = session.snapshot();
    let mut targets: Vec<(FileHandle, InitFileSpec)> = Vec::new();
    for (key, handle) in &snapshot {
        let f = handle.lock().await;
        if f.status.is_terminal() || f.is_initialized() {
            continue;
        }
        targets.push((
            handle.clone(),
            InitFileSpec {
                input_name: key.input_name.clone(),
                file_name: f.file_name.clone(),
                size: f.size,
                mime: f.mime.clone(),
                chunks: f.total_chunks,
            },
        ));
    }

    if targets.is_empty() {
        return;
    }

    info!(
        "init 会话 {} 的 {} 个文件",
        session.id,
        targets.len()
    );

    let specs: Vec<InitFileSpec> = targets.iter().map(|(_, spec)| spec.clone()).collect();
    let entries = match transport.stage_init(&session.config.endpoint, specs).await {
        Ok(entries) => entries,
        Err(e) => {
            // 请求级失败：本批所有文件失败
            warn!("init 请求失败: {}", e);
            for (handle, _) in targets {
                fail_file(&handle, store, bus, e.to_string()).await;
            }
            return;
        }
    };

    // 响应条目按 inputName 分组排队，同名 input 的多个文件按位置匹配
    let mut queues: HashMap<String, VecDeque<InitFileEntry>> = HashMap::new();
    for entry in entries {
        queues
            .entry(entry.input_name.clone())
            .or_default()
            .push_back(entry);
    }

    for (handle, spec) in targets {
        let entry = queues
            .get_mut(&spec.input_name)
            .and_then(|queue| queue.pop_front());

        match entry {
            None => {
                fail_file(
                    &handle,
                    store,
                    bus,
                    ProtocolError::MissingInitEntry {
                        input_name: spec.input_name.clone(),
                    }
                    .to_string(),
                )
                .await;
            }
            Some(entry) => {
                let record = {
                    let mut f = handle.lock().await;
                    match validate_init_entry(&entry, f.total_chunks) {
                        Ok(target) => {
                            f.staging_handle = Some(target.staging_handle);
                            if let Some(path) = target.path {
                                f.path = path;
                            }
                            f.part_urls = target.part_urls;
                            if f.part_confirmations.len() != f.total_chunks {
                                f.part_confirmations = vec![None; f.total_chunks];
                            }
                            f.updated_at = Utc::now();
                            debug!("文件 {} init 完成: {} 个分片 URL", f.key, f.total_chunks);
                            Some(f.to_record())
                        }
                        Err(e) => {
                            drop(f);
                            fail_file(&handle, store, bus, e.to_string()).await;
                            None
                        }
                    }
                };
                if let Some(record) = record {
                    if let Err(e) = store.put_file_record(&record).await {
                        warn!("持久化 init 结果失败: {}", e);
                    }
                }
            }
        }
    }
}

/// complete：提交确认令牌，换取远端标识
///
/// 可重入：远端标识已知时立即返回。缺失任何一个令牌是致命错误：
/// 该文件标记失败，而不是带缺口提交。
pub async fn complete(
    transport: &Arc<dyn UploadTransport>,
    session: &Arc<UploadSession>,
    file: &FileHandle,
) -> Result<String, UploadFailure> {
    let (spec, input_name, fallback_path) = {
        let f = file.lock().await;
        if let Some(id) = &f.remote_id {
            debug!("文件 {} 远端标识已知，跳过 complete", f.key);
            return Ok(id.clone());
        }

        let staging_handle =
            f.staging_handle
                .clone()
                .ok_or_else(|| ProtocolError::MissingInitEntry {
                    input_name: f.key.input_name.clone(),
                })?;

        let mut parts = Vec::with_capacity(f.total_chunks);
        for index in 0..f.total_chunks {
            let token = f
                .part_confirmations
                .get(index)
                .cloned()
                .flatten()
                .ok_or(ProtocolError::MissingConfirmation {
                    part_number: index as u32 + 1,
                })?;
            parts.push(CompletePart {
                part_number: index as u32 + 1,
                confirmation_token: token,
            });
        }

        (
            CompleteFileSpec {
                input_name: f.key.input_name.clone(),
                staging_handle,
                path: f.path.clone(),
                parts,
            },
            f.key.input_name.clone(),
            f.path.clone(),
        )
    };

    let entries = transport
        .stage_complete(&session.config.endpoint, vec![spec])
        .await?;

    // 按 inputName 首个匹配；条目缺失或没给标识时回退到合成路径
    let remote_id = entries
        .iter()
        .find(|entry| entry.input_name == input_name)
        .and_then(|entry| entry.remote_id())
        .unwrap_or(fallback_path);

    info!("文件 {} complete 完成: {}", input_name, remote_id);
    Ok(remote_id)
}

/// 标记单个文件失败并持久化 + 发事件
async fn fail_file(handle: &FileHandle, store: &ChunkStore, bus: &EventBus, error: String) {
    let record = {
        let mut f = handle.lock().await;
        warn!("文件 {} 初始化失败: {}", f.key, error);
        f.mark_failed(error.clone());
        f.to_record()
    };
    bus.emit(UploadEvent::FileFailed {
        session_id: record.session_id.clone(),
        input_name: record.key.input_name.clone(),
        file_index: record.key.file_index,
        error,
    });
    if let Err(e) = store.put_file_record(&record).await {
        warn!("持久化失败状态失败: {}", e);
    }
}
