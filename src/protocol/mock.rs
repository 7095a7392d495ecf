//! 内存传输实现（仅测试编译）
//!
//! 驱动适配器、调度器、闸门的端到端测试：记录每次线路调用，
//! 可注入分片失败、缺失令牌、缺失标识、分片数错配等协议故障。

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::http::{PartReceipt, ProgressFn, UploadTransport};
use super::types::{
    CompleteFileEntry, CompleteFileSpec, InitFileEntry, InitFileSpec, PartUrl,
};
use crate::error::{ProtocolError, TransferError};

/// 内存传输
#[derive(Default)]
pub struct MockTransport {
    handle_seq: AtomicUsize,

    /// 每次 init 请求的文件列表
    pub init_batches: Mutex<Vec<Vec<InitFileSpec>>>,
    /// 每次 complete 请求的文件列表
    pub complete_batches: Mutex<Vec<Vec<CompleteFileSpec>>>,
    /// url -> 收到的字节
    pub parts_received: DashMap<String, Vec<u8>>,
    /// url -> PUT 次数（验证确认过的分片不会重传）
    pub put_counts: DashMap<String, usize>,
    /// simple POST 记录 (endpoint, input_name, 字节数)
    pub simple_posts: Mutex<Vec<(String, String, usize)>>,

    /// 并发观测
    current_inflight: AtomicUsize,
    pub max_inflight: AtomicUsize,

    /// 每个分片 PUT 的人为延迟（放大并发窗口）
    pub part_delay: Mutex<Duration>,
    /// 这些 URL 的 PUT 返回失败
    pub failing_urls: Mutex<HashSet<String>>,
    /// 分片失败时返回的状态码
    pub fail_status: AtomicUsize,
    /// 不返回 ETag（触发令牌合成）
    pub omit_etag: Mutex<bool>,
    /// 这些 input 的 init 条目多给一个分片 URL（触发数量错配）
    pub extra_part_inputs: Mutex<HashSet<String>>,
    /// 这些 input 的 complete 条目不带 fileId/path（触发合成路径回退）
    pub omit_complete_id_inputs: Mutex<HashSet<String>>,
    /// simple POST 返回的响应体（None => 空对象）
    pub simple_body: Mutex<Option<serde_json::Value>>,
    /// simple POST 返回失败状态码
    pub simple_fail_status: Mutex<Option<u16>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let transport = Self::default();
        transport.fail_status.store(500, Ordering::SeqCst);
        transport
    }

    /// 观测到的最大并发分片数
    pub fn max_observed_inflight(&self) -> usize {
        self.max_inflight.load(Ordering::SeqCst)
    }

    /// init 请求次数
    pub fn init_call_count(&self) -> usize {
        self.init_batches.lock().len()
    }

    /// complete 请求次数
    pub fn complete_call_count(&self) -> usize {
        self.complete_batches.lock().len()
    }

    /// 收到的分片 PUT 总数
    pub fn total_puts(&self) -> usize {
        self.put_counts.iter().map(|e| *e.value()).sum()
    }
}

#[async_trait]
impl UploadTransport for MockTransport {
    async fn stage_init(
        &self,
        _endpoint: &str,
        files: Vec<InitFileSpec>,
    ) -> Result<Vec<InitFileEntry>, ProtocolError> {
        self.init_batches.lock().push(files.clone());

        let mut entries = Vec::new();
        for spec in files {
            let seq = self.handle_seq.fetch_add(1, Ordering::SeqCst);
            let handle = format!("stage-{}", seq);
            let mut count = spec.chunks;
            if self.extra_part_inputs.lock().contains(&spec.input_name) {
                count += 1;
            }
            let parts = (1..=count as u32)
                .map(|n| PartUrl {
                    part_number: n,
                    url: format!("mock://{}/part/{}", handle, n),
                })
                .collect();
            entries.push(InitFileEntry {
                input_name: spec.input_name,
                staging_handle: handle,
                path: None,
                parts,
            });
        }
        Ok(entries)
    }

    async fn put_part(
        &self,
        url: &str,
        bytes: Vec<u8>,
        progress: ProgressFn,
    ) -> Result<PartReceipt, TransferError> {
        let inflight = self.current_inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inflight.fetch_max(inflight, Ordering::SeqCst);

        let delay = *self.part_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.current_inflight.fetch_sub(1, Ordering::SeqCst);
        *self.put_counts.entry(url.to_string()).or_insert(0) += 1;

        if self.failing_urls.lock().contains(url) {
            return Err(TransferError::Status {
                status: self.fail_status.load(Ordering::SeqCst) as u16,
            });
        }

        progress(0.5);
        progress(1.0);
        self.parts_received.insert(url.to_string(), bytes);

        let token = if *self.omit_etag.lock() {
            None
        } else {
            Some(format!("etag-{}", url))
        };
        Ok(PartReceipt { token })
    }

    async fn stage_complete(
        &self,
        _endpoint: &str,
        files: Vec<CompleteFileSpec>,
    ) -> Result<Vec<CompleteFileEntry>, ProtocolError> {
        self.complete_batches.lock().push(files.clone());

        let omitted = self.omit_complete_id_inputs.lock();
        Ok(files
            .into_iter()
            .map(|spec| {
                let file_id = if omitted.contains(&spec.input_name) {
                    None
                } else {
                    Some(format!("fid-{}", spec.staging_handle))
                };
                CompleteFileEntry {
                    input_name: spec.input_name,
                    file_id,
                    path: None,
                }
            })
            .collect())
    }

    async fn post_simple(
        &self,
        endpoint: &str,
        input_name: &str,
        _file_name: &str,
        _mime: &str,
        bytes: Vec<u8>,
        progress: ProgressFn,
    ) -> Result<serde_json::Value, TransferError> {
        self.simple_posts
            .lock()
            .push((endpoint.to_string(), input_name.to_string(), bytes.len()));

        if let Some(status) = *self.simple_fail_status.lock() {
            return Err(TransferError::Status { status });
        }

        progress(1.0);
        Ok(self
            .simple_body
            .lock()
            .clone()
            .unwrap_or_else(|| serde_json::json!({})))
    }
}
