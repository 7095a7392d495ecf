// 分片上传调度器
//
// 驱动单个文件在 staged 协议下的分片传输：
// - 待传集合 = 没有确认令牌的分片索引
// - Semaphore 限制单文件并发分片数（跨文件没有全局上限，
//   同时上传的文件越多在途传输越多，这是已知的资源压力点）
// - 分片字节优先取持久化分片，缺失时从字节源重新切片
// - 首个失败生效：停止接纳新分片，等在途分片排空后上报单个失败
// - 不做自动重试：失败对该文件是终态，重新选择文件后从已确认处续传
//
// 分片可以乱序完成；完成分片 i 只写确认列表的槽位 i，
// finalize 的最终顺序由分片索引决定，与完成顺序无关。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{TransferError, UploadFailure};
use crate::events::{EventBus, ProgressThrottler, UploadEvent};
use crate::protocol::{synthesized_token, ProgressFn, UploadTransport};
use crate::session::FileHandle;
use crate::store::ChunkStore;

/// 单文件分片调度器
///
/// 并发上限是一等参数，由引擎配置注入。
pub struct PartScheduler {
    max_concurrent: usize,
}

impl PartScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// 排空一个文件的待传分片
    ///
    /// 待传集合为空时立即返回 Ok；已确认的分片绝不重传。
    pub async fn run(
        &self,
        file: FileHandle,
        transport: Arc<dyn UploadTransport>,
        store: ChunkStore,
        bus: EventBus,
        throttler: Arc<ProgressThrottler>,
    ) -> Result<(), UploadFailure> {
        // 快照调度所需字段；传输期间只有本调度器变更该文件
        let (session_id, key, total_chunks, chunk_size, size, pending, part_urls, source, cancel, inflight, uploaded_init) = {
            let f = file.lock().await;
            (
                f.session_id.clone(),
                f.key.clone(),
                f.total_chunks,
                f.chunk_size,
                f.size,
                f.pending_parts(),
                f.part_urls.clone(),
                f.source.clone(),
                f.cancel.clone(),
                f.inflight.clone(),
                f.uploaded_chunks,
            )
        };

        if pending.is_empty() {
            debug!("文件 {} 无待传分片，跳过调度", key);
            return Ok(());
        }

        info!(
            "开始调度文件 {} 的分片: 待传 {}/{}，并发上限 {}",
            key,
            pending.len(),
            total_chunks,
            self.max_concurrent
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let first_failure: Arc<parking_lot::Mutex<Option<UploadFailure>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let uploaded = Arc::new(AtomicUsize::new(uploaded_init));
        let mut join_set = JoinSet::new();

        for idx in pending {
            if cancel.is_cancelled() || first_failure.lock().is_some() {
                break;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            // 等待许可期间可能已有分片失败，不再接纳新分片
            if first_failure.lock().is_some() {
                break;
            }

            let url = match part_urls.get(idx) {
                Some(url) => url.clone(),
                None => {
                    warn!("文件 {} 分片 #{} 缺少 URL，调度中止", key, idx);
                    break;
                }
            };

            let file = file.clone();
            let transport = transport.clone();
            let store = store.clone();
            let bus = bus.clone();
            let throttler = throttler.clone();
            let first_failure = first_failure.clone();
            let uploaded = uploaded.clone();
            let inflight = inflight.clone();
            let source = source.clone();
            let cancel = cancel.clone();
            let session_id = session_id.clone();
            let key = key.clone();

            join_set.spawn(async move {
                let _permit = permit;
                if cancel.is_cancelled() {
                    return;
                }

                bus.emit(UploadEvent::ChunkStarted {
                    session_id: session_id.clone(),
                    input_name: key.input_name.clone(),
                    file_index: key.file_index,
                    chunk_index: idx,
                });

                // 取分片字节：持久化分片优先（重启后字节源已丢失），
                // 缺失时从仍驻留内存的源重新切片
                let offset = idx as u64 * chunk_size;
                let len = chunk_size.min(size.saturating_sub(offset));
                let bytes = match store.get_chunk(&session_id, &key, idx).await {
                    Ok(Some(bytes)) => bytes,
                    other => {
                        if let Err(e) = other {
                            warn!("读取持久化分片失败（改用字节源）: {}", e);
                        }
                        match &source {
                            Some(src) => match src.read_range(offset, len).await {
                                Ok(bytes) => bytes,
                                Err(e) => {
                                    let mut slot = first_failure.lock();
                                    if slot.is_none() {
                                        *slot = Some(
                                            TransferError::Source(e.to_string()).into(),
                                        );
                                    }
                                    return;
                                }
                            },
                            None => {
                                let mut slot = first_failure.lock();
                                if slot.is_none() {
                                    *slot = Some(
                                        TransferError::Source(format!(
                                            "分片 #{} 无持久化副本且字节源不可用",
                                            idx
                                        ))
                                        .into(),
                                    );
                                }
                                return;
                            }
                        }
                    }
                };

                inflight.insert(idx, 0.0);

                let progress: ProgressFn = {
                    let inflight = inflight.clone();
                    let throttler = throttler.clone();
                    let bus = bus.clone();
                    let uploaded = uploaded.clone();
                    let session_id = session_id.clone();
                    let key = key.clone();
                    Arc::new(move |fraction: f64| {
                        inflight.insert(idx, fraction.clamp(0.0, 1.0));
                        if throttler.should_emit() {
                            let inflight_sum: f64 =
                                inflight.iter().map(|entry| *entry.value()).sum();
                            let done = uploaded.load(Ordering::SeqCst);
                            let progress = ((done as f64 + inflight_sum)
                                / total_chunks as f64)
                                .min(1.0);
                            bus.emit(UploadEvent::Progress {
                                session_id: session_id.clone(),
                                input_name: key.input_name.clone(),
                                file_index: key.file_index,
                                progress,
                                uploaded_chunks: done,
                                total_chunks,
                            });
                        }
                    })
                };

                match transport.put_part(&url, bytes, progress).await {
                    Ok(receipt) => {
                        // 文件可能在传输期间被替换/清理，不再落账
                        if cancel.is_cancelled() {
                            return;
                        }
                        // 响应头缺少令牌时合成占位
                        let token = receipt
                            .token
                            .unwrap_or_else(|| synthesized_token(idx as u32 + 1));

                        let (record, done) = {
                            let mut f = file.lock().await;
                            f.confirm_part(idx, token);
                            (f.to_record(), f.uploaded_chunks)
                        };
                        uploaded.store(done, Ordering::SeqCst);

                        // 持久化失败仅建议性：告警后继续内存运行
                        if let Err(e) = store.put_file_record(&record).await {
                            warn!("持久化文件记录失败: {}", e);
                        }
                        // 确认即清理分片副本，控制存储占用
                        if let Err(e) = store.delete_chunk(&session_id, &key, idx).await {
                            warn!("清理已确认分片失败: {}", e);
                        }

                        debug!("✓ 文件 {} 分片 #{} 确认 ({}/{})", key, idx, done, total_chunks);
                        bus.emit(UploadEvent::ChunkCompleted {
                            session_id: session_id.clone(),
                            input_name: key.input_name.clone(),
                            file_index: key.file_index,
                            chunk_index: idx,
                            uploaded_chunks: done,
                            total_chunks,
                        });
                    }
                    Err(e) => {
                        inflight.remove(&idx);
                        warn!("文件 {} 分片 #{} 传输失败: {}", key, idx, e);
                        let mut slot = first_failure.lock();
                        if slot.is_none() {
                            *slot = Some(e.into());
                        }
                    }
                }
            });
        }

        // 等在途分片排空
        while join_set.join_next().await.is_some() {}

        if cancel.is_cancelled() {
            return Err(TransferError::Canceled.into());
        }
        if let Some(failure) = first_failure.lock().take() {
            return Err(failure);
        }
        Ok(())
    }
}
