// 协议适配器模块
//
// 两种互斥的线路协议，统一暴露 start(file) -> 远端标识 的契约：
// - simple：单次 multipart POST 整文件传输，失败需整文件重传
// - staged：init -> 并行分片传输 -> complete 三阶段，支持分片粒度续传
//
// 线路调用全部经过 UploadTransport 边界，生产用 reqwest，测试用内存实现。

pub mod http;
pub mod simple;
pub mod staged;
pub mod types;

#[cfg(test)]
pub mod mock;

pub use http::{noop_progress, HttpTransport, PartReceipt, ProgressFn, UploadTransport};
pub use types::{
    remote_id_from_body, synthesized_path, synthesized_token, validate_init_entry,
    CompleteFileEntry, CompleteFileSpec, CompletePart, InitFileEntry, InitFileSpec, PartUrl,
    StagedTarget,
};
