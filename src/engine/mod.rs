// 上传引擎
//
// 核心职责：
// 1. 会话竞技场：显式 session_id 键控（DashMap），调用方传会话标识，
//    不存在任何按文档/全局键控的隐式注册表
// 2. 文件入列：change/drop 事件产出的文件创建 FileState、立即持久化、
//    staged 模式预切分片入库，然后逐文件启动传输任务
// 3. 传输编排：simple 一次传输；staged 批量 init -> 调度器排空 -> complete
// 4. 提交闸门与重放：gate 三态评估；最后一个文件终态后重放挂起提交
// 5. 恢复：附加会话时加载持久化记录，已知远端标识视为完成，其余续传
//
// 并发形态：每个文件一个传输任务，文件内分片并发受配置上限约束；
// 跨文件没有全局上限，同时上传的文件数直接放大在途传输数。

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{
    EngineConfig, PostSubmitBehavior, TransferMode, UploadDeclaration, UploadConfig,
};
use crate::error::{ConfigError, UploadFailure};
use crate::events::{EventBus, UploadEvent};
use crate::gate::{FormSubmission, GateOutcome, ReplaySubmission};
use crate::protocol::{simple, staged, HttpTransport, UploadTransport};
use crate::scheduler::PartScheduler;
use crate::session::{FileHandle, FileState, SelectedFile, UploadEntry, UploadSession};
use crate::store::{ChunkStore, FileKey, FileTransferStatus};
use crate::{config::resolve_upload_config, gate};

/// 上传引擎
pub struct UploadEngine {
    config: EngineConfig,
    store: ChunkStore,
    transport: Arc<dyn UploadTransport>,
    /// 会话竞技场（session_id -> 会话）
    sessions: DashMap<String, Arc<UploadSession>>,
    bus: EventBus,
    /// 重放通道（请求管线注册）
    replay_tx: parking_lot::RwLock<Option<mpsc::UnboundedSender<ReplaySubmission>>>,
}

impl UploadEngine {
    /// 创建引擎（注入存储与传输层）
    pub fn new(
        config: EngineConfig,
        store: ChunkStore,
        transport: Arc<dyn UploadTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            transport,
            sessions: DashMap::new(),
            bus: EventBus::new(),
            replay_tx: parking_lot::RwLock::new(None),
        })
    }

    /// 按配置启动引擎（打开持久化存储，使用 HTTP 传输）
    pub fn start(config: EngineConfig) -> anyhow::Result<Arc<Self>> {
        let store = ChunkStore::open(&config.store_path)?;
        let transport: Arc<dyn UploadTransport> = Arc::new(HttpTransport::new());
        Ok(Self::new(config, store, transport))
    }

    /// 订阅结构化事件流
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<UploadEvent> {
        self.bus.subscribe()
    }

    /// 注册重放通道
    ///
    /// 挂起提交在全部文件完成后经此通道送回请求管线执行。
    pub fn set_replay_sender(&self, tx: mpsc::UnboundedSender<ReplaySubmission>) {
        *self.replay_tx.write() = Some(tx);
        info!("提交重放通道已注册");
    }

    /// 解析声明并附加会话
    ///
    /// 配置错误时记录日志并返回 Err，引擎不附加到该表单。
    pub async fn attach_session(
        self: &Arc<Self>,
        session_id: &str,
        decl: &UploadDeclaration,
    ) -> Result<(), ConfigError> {
        let config = resolve_upload_config(decl).map_err(|e| {
            warn!("表单 {} 上传声明无效，引擎不附加: {}", session_id, e);
            e
        })?;
        self.attach_session_with_config(session_id, config).await;
        Ok(())
    }

    /// 用现成配置附加会话并恢复持久化状态
    pub async fn attach_session_with_config(
        self: &Arc<Self>,
        session_id: &str,
        config: UploadConfig,
    ) {
        if config.conflicting_redirect {
            warn!("会话 {} 声明了互斥的提交后行为（clear + 重定向）", session_id);
        }
        let session = Arc::new(UploadSession::new(
            session_id,
            config,
            self.config.progress_throttle_ms,
        ));
        self.sessions.insert(session_id.to_string(), session.clone());
        self.restore_session(&session).await;
    }

    /// 查找会话
    pub fn session(&self, session_id: &str) -> Option<Arc<UploadSession>> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    /// 文件选择入口（input change / drop）
    ///
    /// 同键重选会先取消并删除旧文件及其持久化分片，再创建新文件。
    pub async fn add_files(
        self: &Arc<Self>,
        session_id: &str,
        input_name: &str,
        files: Vec<SelectedFile>,
    ) -> anyhow::Result<()> {
        let session = self
            .session(session_id)
            .ok_or_else(|| anyhow::anyhow!("未知会话: {}", session_id))?;

        for (index, selected) in files.into_iter().enumerate() {
            let key = FileKey::new(input_name, index as u32);

            // 同键重选：旧文件取消传输、连同分片一起删除
            if let Some((_, old)) = session.files.remove(&key) {
                let old_state = old.lock().await;
                old_state.cancel.cancel();
                info!("文件 {} 被重新选择，旧状态已取消", key);
                drop(old_state);
                if let Err(e) = self.store.delete_file(&session.id, &key).await {
                    warn!("删除旧文件持久化状态失败: {}", e);
                }
            }

            let state = FileState::new(
                &session.id,
                key.clone(),
                &selected,
                session.config.mode,
                session.config.chunk_size,
            );

            self.bus.emit(UploadEvent::FileQueued {
                session_id: session.id.clone(),
                input_name: key.input_name.clone(),
                file_index: key.file_index,
                file_uuid: state.file_uuid.clone(),
                file_name: state.file_name.clone(),
                total_chunks: state.total_chunks,
            });

            if let Err(e) = self.store.put_file_record(&state.to_record()).await {
                warn!("持久化文件记录失败: {}", e);
            }

            // staged：入列时预切分片落库，重载后不依赖字节源也能续传
            if session.config.mode == TransferMode::Staged {
                for chunk_index in 0..state.total_chunks {
                    let (offset, len) = state.chunk_range(chunk_index);
                    match selected.source.read_range(offset, len).await {
                        Ok(bytes) => {
                            if let Err(e) = self
                                .store
                                .put_chunk(&session.id, &key, chunk_index, bytes)
                                .await
                            {
                                warn!("持久化分片 #{} 失败: {}", chunk_index, e);
                            }
                        }
                        // 读不出来也不致命：调度时再从源直接读
                        Err(e) => warn!("预切分片 #{} 读取失败: {}", chunk_index, e),
                    }
                }
            }

            let handle: FileHandle = Arc::new(tokio::sync::Mutex::new(state));
            session.files.insert(key, handle.clone());
            self.spawn_transfer(session.clone(), handle);
        }

        Ok(())
    }

    /// 提交闸门（请求管线在发出非 GET 提交前调用）
    pub async fn gate(&self, submission: &FormSubmission) -> GateOutcome {
        let Some(session) = self.session(&submission.session_id) else {
            // 未附加引擎的表单不归闸门管，原样放行
            return GateOutcome::Released {
                fields: submission.fields.clone(),
            };
        };

        let outcome = gate::evaluate(&session, &self.store, &self.bus, submission).await;

        if matches!(outcome, GateOutcome::Released { .. })
            && !submission.skip_gate
            && session.config.post_submit == PostSubmitBehavior::Clear
        {
            self.clear_session(&session.id).await;
        }
        outcome
    }

    /// 清空会话：取消在途传输，删除文件状态、持久化记录与挂起提交
    pub async fn clear_session(&self, session_id: &str) {
        let Some(session) = self.session(session_id) else {
            return;
        };

        for handle in session.drain() {
            let f = handle.lock().await;
            f.cancel.cancel();
        }
        *session.pending.lock().await = None;
        session.throttler.reset();

        if let Err(e) = self.store.clear_session(session_id).await {
            warn!("清空会话持久化状态失败: {}", e);
        }

        info!("会话 {} 已清空", session_id);
        self.bus.emit(UploadEvent::SessionCleared {
            session_id: session_id.to_string(),
        });
    }

    /// 全部会话的对外进度条目（按会话、键排序）
    pub async fn entries(&self) -> Vec<UploadEntry> {
        let sessions: Vec<Arc<UploadSession>> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();

        let mut entries = Vec::new();
        for session in sessions {
            for (_, handle) in session.snapshot() {
                entries.push(handle.lock().await.entry());
            }
        }
        entries.sort_by(|a, b| {
            a.session_id
                .cmp(&b.session_id)
                .then_with(|| a.input_name.cmp(&b.input_name))
                .then_with(|| a.file_index.cmp(&b.file_index))
        });
        entries
    }

    // ========================================================================
    // 内部：恢复与传输编排
    // ========================================================================

    /// 恢复会话的持久化状态
    async fn restore_session(self: &Arc<Self>, session: &Arc<UploadSession>) {
        match self.store.get_pending_submission(&session.id).await {
            Ok(pending) => *session.pending.lock().await = pending,
            Err(e) => warn!("加载挂起提交失败: {}", e),
        }

        let records = match self.store.list_file_records(&session.id).await {
            Ok(records) => records,
            Err(e) => {
                warn!("加载文件记录失败: {}", e);
                Vec::new()
            }
        };
        if records.is_empty() {
            return;
        }

        info!("会话 {} 恢复 {} 条文件记录", session.id, records.len());

        let mut resumable: Vec<FileHandle> = Vec::new();
        for record in records {
            let mut state = FileState::from_record(record);

            if state.remote_id.is_some() {
                // 已知远端标识 → 视为完成
                state.status = FileTransferStatus::Completed;
                state.uploaded_chunks = state.total_chunks;
            } else if state.status != FileTransferStatus::Failed {
                if session.config.mode == TransferMode::Simple {
                    // simple 不持久化分片，字节源随重启丢失，无法续传
                    state.mark_failed("重启后字节源不可用，请重新选择文件".to_string());
                } else {
                    state.status = FileTransferStatus::Queued;
                }
            }

            if let Err(e) = self.store.put_file_record(&state.to_record()).await {
                warn!("持久化恢复状态失败: {}", e);
            }

            self.bus.emit(UploadEvent::FileQueued {
                session_id: state.session_id.clone(),
                input_name: state.key.input_name.clone(),
                file_index: state.key.file_index,
                file_uuid: state.file_uuid.clone(),
                file_name: state.file_name.clone(),
                total_chunks: state.total_chunks,
            });

            let key = state.key.clone();
            let queued = state.status == FileTransferStatus::Queued;
            let handle: FileHandle = Arc::new(tokio::sync::Mutex::new(state));
            session.files.insert(key, handle.clone());
            if queued {
                resumable.push(handle);
            }
        }

        for handle in resumable {
            self.spawn_transfer(session.clone(), handle);
        }

        // 记录可能全部已是终态（例如中断发生在提交之后）：评估重放
        self.after_terminal(session).await;
    }

    fn spawn_transfer(self: &Arc<Self>, session: Arc<UploadSession>, handle: FileHandle) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_transfer(session, handle).await;
        });
    }

    /// 单个文件的传输编排
    async fn run_transfer(self: Arc<Self>, session: Arc<UploadSession>, handle: FileHandle) {
        let (key, cancel) = {
            let mut f = handle.lock().await;
            if f.status.is_terminal() {
                let key = f.key.clone();
                drop(f);
                debug!("文件 {} 已是终态，跳过传输", key);
                self.after_terminal(&session).await;
                return;
            }
            let old = f.status;
            f.mark_uploading();
            self.bus.emit(UploadEvent::StatusChanged {
                session_id: f.session_id.clone(),
                input_name: f.key.input_name.clone(),
                file_index: f.key.file_index,
                old_status: old.to_string(),
                new_status: f.status.to_string(),
            });
            (f.key.clone(), f.cancel.clone())
        };

        let outcome: Result<String, UploadFailure> = match session.config.mode {
            TransferMode::Simple => {
                simple::upload(
                    &self.transport,
                    &session.config,
                    &handle,
                    &self.bus,
                    &session.throttler,
                )
                .await
            }
            TransferMode::Staged => {
                staged::ensure_init(&self.transport, &session, &self.store, &self.bus).await;

                // init 的失败已在适配器里落账并广播
                if handle.lock().await.status == FileTransferStatus::Failed {
                    self.after_terminal(&session).await;
                    return;
                }

                let scheduler = PartScheduler::new(self.config.max_concurrent_parts);
                match scheduler
                    .run(
                        handle.clone(),
                        self.transport.clone(),
                        self.store.clone(),
                        self.bus.clone(),
                        session.throttler.clone(),
                    )
                    .await
                {
                    Ok(()) => {
                        // 待传集合排空后才进入 finalize
                        {
                            let mut f = handle.lock().await;
                            f.mark_finalizing();
                        }
                        self.bus.emit(UploadEvent::FinalizeStarted {
                            session_id: session.id.clone(),
                            input_name: key.input_name.clone(),
                            file_index: key.file_index,
                        });
                        staged::complete(&self.transport, &session, &handle).await
                    }
                    Err(e) => Err(e),
                }
            }
        };

        if cancel.is_cancelled() {
            debug!("文件 {} 传输已取消，不落账", key);
            return;
        }

        match outcome {
            Ok(remote_id) => {
                let record = {
                    let mut f = handle.lock().await;
                    f.mark_completed(remote_id.clone());
                    f.to_record()
                };
                info!("✓ 文件 {} 上传完成: {}", key, remote_id);
                self.bus.emit(UploadEvent::FileCompleted {
                    session_id: session.id.clone(),
                    input_name: key.input_name.clone(),
                    file_index: key.file_index,
                    remote_id,
                });
                if let Err(e) = self.store.put_file_record(&record).await {
                    warn!("持久化完成状态失败: {}", e);
                }
            }
            Err(failure) => {
                let error = failure.to_string();
                let record = {
                    let mut f = handle.lock().await;
                    f.mark_failed(error.clone());
                    f.to_record()
                };
                warn!("文件 {} 上传失败: {}", key, error);
                self.bus.emit(UploadEvent::FileFailed {
                    session_id: session.id.clone(),
                    input_name: key.input_name.clone(),
                    file_index: key.file_index,
                    error,
                });
                if let Err(e) = self.store.put_file_record(&record).await {
                    warn!("持久化失败状态失败: {}", e);
                }
            }
        }

        self.after_terminal(&session).await;
    }

    /// 终态后评估：全部完成且存在挂起提交时自动重放
    async fn after_terminal(&self, session: &Arc<UploadSession>) {
        let snapshot = session.snapshot();
        if snapshot.is_empty() {
            return;
        }
        for (_, handle) in &snapshot {
            // 有失败或未完成文件：不重放（失败要等重新选择）
            if handle.lock().await.status != FileTransferStatus::Completed {
                return;
            }
        }

        // 未注册重放通道时保留挂起提交，等通道就绪后由 gate 重新评估
        if self.replay_tx.read().is_none() {
            return;
        }

        let pending = { session.pending.lock().await.take() };
        let Some(pending) = pending else {
            return;
        };

        let fields = gate::merge_remote_ids(pending.fields.clone(), &snapshot).await;
        if let Err(e) = self.store.delete_pending_submission(&session.id).await {
            warn!("删除挂起提交失败: {}", e);
        }

        let replay = ReplaySubmission::from_pending(&pending, fields);
        let sent = {
            let tx = self.replay_tx.read();
            tx.as_ref().map(|tx| tx.send(replay).is_ok()).unwrap_or(false)
        };

        if sent {
            info!("会话 {} 的挂起提交已重放: {}", session.id, pending.action);
            self.bus.emit(UploadEvent::SubmissionReplayed {
                session_id: session.id.clone(),
                action: pending.action.clone(),
            });
            if session.config.post_submit == PostSubmitBehavior::Clear {
                self.clear_session(&session.id).await;
            }
        } else {
            warn!("重放通道已关闭，挂起提交保留");
            *session.pending.lock().await = Some(pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PostSubmitBehavior;
    use crate::protocol::mock::MockTransport;
    use crate::source::MemoryByteSource;
    use crate::store::PendingSubmission;
    use chrono::Utc;
    use std::time::Duration;

    fn staged_config() -> UploadConfig {
        UploadConfig {
            mode: TransferMode::Staged,
            endpoint: "https://store.example/uploads".to_string(),
            chunk_size: 4,
            post_submit: PostSubmitBehavior::Keep,
            conflicting_redirect: false,
        }
    }

    fn simple_config() -> UploadConfig {
        UploadConfig {
            mode: TransferMode::Simple,
            ..staged_config()
        }
    }

    fn build_engine() -> (Arc<UploadEngine>, Arc<MockTransport>, ChunkStore) {
        let mock = Arc::new(MockTransport::new());
        let store = ChunkStore::open_in_memory().unwrap();
        let config = EngineConfig {
            max_concurrent_parts: 2,
            progress_throttle_ms: 0,
            ..EngineConfig::default()
        };
        let engine = UploadEngine::new(
            config,
            store.clone(),
            mock.clone() as Arc<dyn UploadTransport>,
        );
        (engine, mock, store)
    }

    fn selected(name: &str, bytes: Vec<u8>) -> SelectedFile {
        SelectedFile {
            name: name.to_string(),
            mime: "application/octet-stream".to_string(),
            source: Arc::new(MemoryByteSource::new(bytes)),
        }
    }

    fn submission(session: &str) -> FormSubmission {
        FormSubmission {
            session_id: session.to_string(),
            method: "POST".to_string(),
            action: "/orders".to_string(),
            fields: vec![("title".to_string(), "hello".to_string())],
            target_hint: None,
            skip_gate: false,
        }
    }

    /// 轮询等待指定文件到达目标状态
    async fn wait_status(
        engine: &Arc<UploadEngine>,
        session: &str,
        input: &str,
        index: u32,
        status: FileTransferStatus,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let entries = engine.entries().await;
                let hit = entries.iter().any(|e| {
                    e.session_id == session
                        && e.input_name == input
                        && e.file_index == index
                        && e.status == status
                });
                if hit {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("等待文件状态超时");
    }

    #[tokio::test]
    async fn test_staged_upload_happy_path() {
        let (engine, mock, store) = build_engine();
        engine.attach_session_with_config("s1", staged_config()).await;

        // 10 字节 + 4 字节分片 => 3 个分片
        engine
            .add_files("s1", "file", vec![selected("data.bin", b"0123456789".to_vec())])
            .await
            .unwrap();
        wait_status(&engine, "s1", "file", 0, FileTransferStatus::Completed).await;

        assert_eq!(mock.init_call_count(), 1);
        assert_eq!(mock.total_puts(), 3);
        // finalize 恰好一次
        assert_eq!(mock.complete_call_count(), 1);

        let entries = engine.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].uploaded_chunks, 3);
        assert_eq!(entries[0].total_chunks, 3);
        assert_eq!(entries[0].progress, 1.0);

        // 确认过的分片副本全部清理
        let key = FileKey::new("file", 0);
        assert_eq!(store.count_chunks("s1", &key).await.unwrap(), 0);
        // 持久化记录带远端标识
        let record = store.get_file_record("s1", &key).await.unwrap().unwrap();
        assert!(record.remote_id.as_ref().unwrap().starts_with("fid-stage-"));
    }

    #[tokio::test]
    async fn test_simple_upload_and_failure_status() {
        let (engine, mock, _store) = build_engine();
        engine.attach_session_with_config("s1", simple_config()).await;

        engine
            .add_files("s1", "doc", vec![selected("note.txt", vec![1u8; 2048])])
            .await
            .unwrap();
        wait_status(&engine, "s1", "doc", 0, FileTransferStatus::Completed).await;

        // simple 模式恰好一次网络传输，不走 staged 接口
        assert_eq!(mock.simple_posts.lock().len(), 1);
        assert_eq!(mock.init_call_count(), 0);

        // 非 2xx：失败并在 last_error 记下状态码
        *mock.simple_fail_status.lock() = Some(500);
        engine
            .add_files("s1", "doc2", vec![selected("bad.txt", vec![1u8; 64])])
            .await
            .unwrap();
        wait_status(&engine, "s1", "doc2", 0, FileTransferStatus::Failed).await;

        let entries = engine.entries().await;
        let failed = entries.iter().find(|e| e.input_name == "doc2").unwrap();
        assert_eq!(failed.last_error.as_deref(), Some("HTTP 500"));
    }

    #[tokio::test]
    async fn test_gate_defers_then_replays_with_merged_ids() {
        let (engine, mock, store) = build_engine();
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.set_replay_sender(tx);
        engine.attach_session_with_config("s1", staged_config()).await;

        // 放大传输窗口，保证 gate 在上传期间调用
        *mock.part_delay.lock() = Duration::from_millis(50);

        engine
            .add_files("s1", "doc", vec![selected("a.bin", b"0123456789".to_vec())])
            .await
            .unwrap();
        engine
            .add_files("s1", "img", vec![selected("b.bin", b"abcdefgh".to_vec())])
            .await
            .unwrap();

        let outcome = engine.gate(&submission("s1")).await;
        assert!(matches!(outcome, GateOutcome::Deferred));
        assert!(store.get_pending_submission("s1").await.unwrap().is_some());

        // 两个文件全部完成后自动重放
        let replay = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("等待重放超时")
            .expect("重放通道关闭");

        assert!(replay.skip_gate);
        assert_eq!(replay.action, "/orders");
        assert_eq!(replay.fields[0], ("title".to_string(), "hello".to_string()));
        let merged: Vec<&str> = replay.fields[1..].iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(merged, vec!["doc", "img"]);
        assert!(replay.fields[1].1.starts_with("fid-"));
        assert!(replay.fields[2].1.starts_with("fid-"));

        // 挂起提交重放后销毁
        assert!(store.get_pending_submission("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_gate_blocks_on_failed_file() {
        let (engine, mock, _store) = build_engine();
        engine.attach_session_with_config("s1", staged_config()).await;

        mock.failing_urls
            .lock()
            .insert("mock://stage-0/part/2".to_string());
        engine
            .add_files("s1", "doc", vec![selected("a.bin", b"0123456789".to_vec())])
            .await
            .unwrap();
        wait_status(&engine, "s1", "doc", 0, FileTransferStatus::Failed).await;

        match engine.gate(&submission("s1")).await {
            GateOutcome::Blocked { reason } => assert!(reason.contains("doc[0]")),
            other => panic!("期望 Blocked，实际 {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reselect_supersedes_old_file() {
        let (engine, mock, store) = build_engine();
        engine.attach_session_with_config("s1", staged_config()).await;
        *mock.part_delay.lock() = Duration::from_millis(40);

        engine
            .add_files("s1", "doc", vec![selected("old.bin", b"0123456789".to_vec())])
            .await
            .unwrap();
        let old_uuid = engine.entries().await[0].file_uuid.clone();

        // 上传进行中重新选择同一槽位
        engine
            .add_files("s1", "doc", vec![selected("new.bin", b"xyz".to_vec())])
            .await
            .unwrap();

        wait_status(&engine, "s1", "doc", 0, FileTransferStatus::Completed).await;

        let entries = engine.entries().await;
        assert_eq!(entries.len(), 1);
        assert_ne!(entries[0].file_uuid, old_uuid);
        assert_eq!(entries[0].file_name, "new.bin");

        // 持久化记录也只剩新文件
        let record = store
            .get_file_record("s1", &FileKey::new("doc", 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.file_name, "new.bin");
    }

    #[tokio::test]
    async fn test_restore_resumes_only_pending_parts() {
        let (engine, mock, store) = build_engine();

        // 手工构造上次运行留下的状态：3 片中第 1 片已确认
        let selected_file = selected("data.bin", b"0123456789".to_vec());
        let mut state = FileState::new(
            "s1",
            FileKey::new("doc", 0),
            &selected_file,
            TransferMode::Staged,
            4,
        );
        state.staging_handle = Some("stage-old".to_string());
        state.part_urls = (1..=3)
            .map(|n| format!("mock://stage-old/part/{}", n))
            .collect();
        state.part_confirmations = vec![Some("confirm-1".to_string()), None, None];
        state.uploaded_chunks = 1;
        state.status = FileTransferStatus::Uploading;
        store.put_file_record(&state.to_record()).await.unwrap();

        let key = FileKey::new("doc", 0);
        store.put_chunk("s1", &key, 1, b"4567".to_vec()).await.unwrap();
        store.put_chunk("s1", &key, 2, b"89".to_vec()).await.unwrap();

        // 附加会话触发恢复
        engine.attach_session_with_config("s1", staged_config()).await;
        wait_status(&engine, "s1", "doc", 0, FileTransferStatus::Completed).await;

        // 只重传未确认的 2 片；已确认分片不动；init 不再发（已初始化）
        assert_eq!(mock.total_puts(), 2);
        assert!(!mock.parts_received.contains_key("mock://stage-old/part/1"));
        assert_eq!(mock.init_call_count(), 0);
    }

    #[tokio::test]
    async fn test_restore_replays_interrupted_submission() {
        let (engine, mock, store) = build_engine();

        // 上次运行：文件已完成、提交被推迟后进程中断
        let selected_file = selected("data.bin", b"0123".to_vec());
        let mut state = FileState::new(
            "s1",
            FileKey::new("doc", 0),
            &selected_file,
            TransferMode::Staged,
            4,
        );
        state.remote_id = Some("fid-done".to_string());
        state.status = FileTransferStatus::Completed;
        store.put_file_record(&state.to_record()).await.unwrap();
        store
            .put_pending_submission(&PendingSubmission {
                session_id: "s1".to_string(),
                method: "POST".to_string(),
                action: "/orders".to_string(),
                fields: vec![("k".to_string(), "v".to_string())],
                target_hint: Some("#btn".to_string()),
                captured_at: Utc::now(),
            })
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.set_replay_sender(tx);
        engine.attach_session_with_config("s1", staged_config()).await;

        let replay = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("等待重放超时")
            .expect("重放通道关闭");
        assert_eq!(replay.action, "/orders");
        assert_eq!(replay.target_hint.as_deref(), Some("#btn"));
        assert_eq!(
            replay.fields,
            vec![
                ("k".to_string(), "v".to_string()),
                ("doc".to_string(), "fid-done".to_string()),
            ]
        );

        // 完全无需网络传输
        assert_eq!(mock.total_puts(), 0);
        assert_eq!(mock.complete_call_count(), 0);
    }

    #[tokio::test]
    async fn test_restore_simple_without_source_fails() {
        let (engine, _mock, store) = build_engine();

        let selected_file = selected("note.txt", vec![1u8; 64]);
        let state = FileState::new(
            "s1",
            FileKey::new("doc", 0),
            &selected_file,
            TransferMode::Simple,
            4,
        );
        store.put_file_record(&state.to_record()).await.unwrap();

        engine.attach_session_with_config("s1", simple_config()).await;
        wait_status(&engine, "s1", "doc", 0, FileTransferStatus::Failed).await;

        let entries = engine.entries().await;
        assert!(entries[0].last_error.as_ref().unwrap().contains("字节源不可用"));
    }

    #[tokio::test]
    async fn test_part_count_mismatch_fails_file() {
        let (engine, mock, _store) = build_engine();
        mock.extra_part_inputs.lock().insert("doc".to_string());
        engine.attach_session_with_config("s1", staged_config()).await;

        engine
            .add_files("s1", "doc", vec![selected("a.bin", b"0123456789".to_vec())])
            .await
            .unwrap();
        wait_status(&engine, "s1", "doc", 0, FileTransferStatus::Failed).await;

        let entries = engine.entries().await;
        assert!(entries[0].last_error.as_ref().unwrap().contains("不匹配"));
        // 传输阶段没有发生
        assert_eq!(mock.total_puts(), 0);
    }

    #[tokio::test]
    async fn test_complete_without_id_falls_back_to_synthesized_path() {
        let (engine, mock, _store) = build_engine();
        mock.omit_complete_id_inputs.lock().insert("doc".to_string());
        engine.attach_session_with_config("s1", staged_config()).await;

        engine
            .add_files("s1", "doc", vec![selected("a.bin", b"0123456789".to_vec())])
            .await
            .unwrap();
        wait_status(&engine, "s1", "doc", 0, FileTransferStatus::Completed).await;

        match engine.gate(&submission("s1")).await {
            GateOutcome::Released { fields } => {
                // 合成路径 {session}/{uuid}/{名称}
                let (name, id) = &fields[1];
                assert_eq!(name, "doc");
                assert!(id.starts_with("s1/"));
                assert!(id.ends_with("a.bin"));
            }
            other => panic!("期望 Released，实际 {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_post_submit_clear_clears_session_on_release() {
        let (engine, _mock, store) = build_engine();
        let config = UploadConfig {
            post_submit: PostSubmitBehavior::Clear,
            ..staged_config()
        };
        engine.attach_session_with_config("s1", config).await;

        engine
            .add_files("s1", "doc", vec![selected("a.bin", b"0123".to_vec())])
            .await
            .unwrap();
        wait_status(&engine, "s1", "doc", 0, FileTransferStatus::Completed).await;

        let outcome = engine.gate(&submission("s1")).await;
        assert!(matches!(outcome, GateOutcome::Released { .. }));

        // 放行即清空：条目与持久化状态全部移除
        assert!(engine.entries().await.is_empty());
        assert!(store.list_file_records("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gate_without_session_releases_unchanged() {
        let (engine, _mock, _store) = build_engine();
        match engine.gate(&submission("nope")).await {
            GateOutcome::Released { fields } => {
                assert_eq!(fields, vec![("title".to_string(), "hello".to_string())]);
            }
            other => panic!("期望 Released，实际 {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attach_rejects_invalid_declaration() {
        let (engine, _mock, _store) = build_engine();
        let decl = UploadDeclaration {
            mode: "bogus".to_string(),
            ..Default::default()
        };
        assert!(engine.attach_session("s1", &decl).await.is_err());
        assert!(engine.session("s1").is_none());
    }
}
