//! HTTP 传输层
//!
//! UploadTransport 是引擎与线路之间的唯一边界：staged 的 init / 分片 PUT /
//! complete，以及 simple 的整文件 multipart POST。生产实现基于 reqwest，
//! 测试用内存实现驱动同一套适配器与调度器。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::types::{CompleteFileEntry, CompleteFileSpec, InitFileEntry, InitFileSpec};
use crate::error::{ProtocolError, TransferError};

/// 分片上传进度回调 (0.0 - 1.0)
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// 不关心进度时的空回调
pub fn noop_progress() -> ProgressFn {
    Arc::new(|_| {})
}

/// 分片传输回执
#[derive(Debug, Clone)]
pub struct PartReceipt {
    /// 服务端确认令牌（ETag 响应头；缺失时由调用方合成占位）
    pub token: Option<String>,
}

/// 上传线路契约
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// staged init：一次请求列出会话内所有待初始化文件
    async fn stage_init(
        &self,
        endpoint: &str,
        files: Vec<InitFileSpec>,
    ) -> Result<Vec<InitFileEntry>, ProtocolError>;

    /// 单个分片的原始字节 PUT
    async fn put_part(
        &self,
        url: &str,
        bytes: Vec<u8>,
        progress: ProgressFn,
    ) -> Result<PartReceipt, TransferError>;

    /// staged complete：批量提交确认令牌，换取远端标识
    async fn stage_complete(
        &self,
        endpoint: &str,
        files: Vec<CompleteFileSpec>,
    ) -> Result<Vec<CompleteFileEntry>, ProtocolError>;

    /// simple 模式：整文件 multipart POST，返回宽松解析的响应体
    async fn post_simple(
        &self,
        endpoint: &str,
        input_name: &str,
        file_name: &str,
        mime: &str,
        bytes: Vec<u8>,
        progress: ProgressFn,
    ) -> Result<serde_json::Value, TransferError>;
}

/// reqwest 实现
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        // 分片可能很大，只限制连接超时，不限制整体请求时长
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// 基于现有 client 创建（共享连接池）
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// 拼接阶段 URL：{endpoint}/init、{endpoint}/complete
    fn phase_url(endpoint: &str, phase: &str) -> String {
        format!("{}/{}", endpoint.trim_end_matches('/'), phase)
    }

    /// 把字节切成固定窗口的流，每个窗口发出时汇报累计进度
    fn window_stream(
        bytes: Vec<u8>,
        progress: ProgressFn,
    ) -> impl futures::Stream<Item = Result<Vec<u8>, std::io::Error>> {
        const WINDOW: usize = 64 * 1024;
        let total = bytes.len();
        futures::stream::unfold((0usize, bytes, progress), move |state| async move {
            let (sent, bytes, progress) = state;
            if sent >= bytes.len() {
                return None;
            }
            let end = (sent + WINDOW).min(bytes.len());
            let window = bytes[sent..end].to_vec();
            progress(end as f64 / total as f64);
            Some((Ok::<_, std::io::Error>(window), (end, bytes, progress)))
        })
    }

    /// 把字节包成边发送边汇报进度的请求体
    fn progress_body(bytes: Vec<u8>, progress: ProgressFn) -> reqwest::Body {
        if bytes.is_empty() {
            progress(1.0);
            return reqwest::Body::from(Vec::new());
        }
        reqwest::Body::wrap_stream(Self::window_stream(bytes, progress))
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn stage_init(
        &self,
        endpoint: &str,
        files: Vec<InitFileSpec>,
    ) -> Result<Vec<InitFileEntry>, ProtocolError> {
        let url = Self::phase_url(endpoint, "init");

        let response = self
            .client
            .post(&url)
            .json(&files)
            .send()
            .await
            .map_err(|e| ProtocolError::Http {
                status: 0,
                message: format!("init 请求发送失败: {}", e),
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        debug!("init 响应: status={}, body={}", status, body);

        if !status.is_success() {
            return Err(ProtocolError::Http {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }

        serde_json::from_str(&body)
            .map_err(|e| ProtocolError::MalformedResponse(format!("init 响应解析失败: {}", e)))
    }

    async fn put_part(
        &self,
        url: &str,
        bytes: Vec<u8>,
        progress: ProgressFn,
    ) -> Result<PartReceipt, TransferError> {
        let body = Self::progress_body(bytes, progress);

        let response = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| TransferError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Status {
                status: status.as_u16(),
            });
        }

        // 确认令牌取自 ETag 响应头（对象存储会加引号，去掉）
        let token = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string());

        Ok(PartReceipt { token })
    }

    async fn stage_complete(
        &self,
        endpoint: &str,
        files: Vec<CompleteFileSpec>,
    ) -> Result<Vec<CompleteFileEntry>, ProtocolError> {
        let url = Self::phase_url(endpoint, "complete");

        let response = self
            .client
            .post(&url)
            .json(&files)
            .send()
            .await
            .map_err(|e| ProtocolError::Http {
                status: 0,
                message: format!("complete 请求发送失败: {}", e),
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        debug!("complete 响应: status={}, body={}", status, body);

        if !status.is_success() {
            return Err(ProtocolError::Http {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }

        serde_json::from_str(&body)
            .map_err(|e| ProtocolError::MalformedResponse(format!("complete 响应解析失败: {}", e)))
    }

    async fn post_simple(
        &self,
        endpoint: &str,
        input_name: &str,
        file_name: &str,
        mime: &str,
        bytes: Vec<u8>,
        progress: ProgressFn,
    ) -> Result<serde_json::Value, TransferError> {
        let len = bytes.len() as u64;
        let body = Self::progress_body(bytes, progress);

        let part = reqwest::multipart::Part::stream_with_length(body, len)
            .file_name(file_name.to_string())
            .mime_str(mime)
            .map_err(|e| TransferError::Network(format!("非法 MIME 类型: {}", e)))?;
        let form = reqwest::multipart::Form::new().part(input_name.to_string(), part);

        let response = self
            .client
            .post(endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| TransferError::Network(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        debug!("simple 上传响应: status={}, body={}", status, body);

        if !status.is_success() {
            return Err(TransferError::Status {
                status: status.as_u16(),
            });
        }

        // 响应体宽松解析：非 JSON 时当作没有标识，走合成路径
        Ok(serde_json::from_str(&body).unwrap_or(serde_json::Value::Null))
    }
}
