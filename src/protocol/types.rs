//! 协议线格式类型
//!
//! init/complete 的请求响应都建模为显式结构体，在边界处做穷尽校验：
//! 形状不对就收敛成一个 ProtocolError，绝不让动态 JSON 形状渗进引擎内部。
//! 字段名统一 camelCase（inputName / stagingHandle / partNumber ...）。

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// init 请求中的单个文件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitFileSpec {
    pub input_name: String,
    pub file_name: String,
    pub size: u64,
    pub mime: String,
    /// 计算出的分片数
    pub chunks: usize,
}

/// init 响应中的分片 URL
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUrl {
    /// 1 起始的分片序号
    pub part_number: u32,
    pub url: String,
}

/// init 响应中的单个文件条目
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitFileEntry {
    pub input_name: String,
    /// 上传句柄（complete 阶段必须原样带回）
    pub staging_handle: String,
    /// 服务端指定的远端路径（可选，缺省用本地合成路径）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// 分片 URL 列表，可乱序，按 partNumber 寻址
    pub parts: Vec<PartUrl>,
}

/// complete 请求中的分片确认
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePart {
    pub part_number: u32,
    pub confirmation_token: String,
}

/// complete 请求中的单个文件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteFileSpec {
    pub input_name: String,
    pub staging_handle: String,
    pub path: String,
    /// 按分片序号排列的完整确认列表
    pub parts: Vec<CompletePart>,
}

/// complete 响应中的单个文件条目
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteFileEntry {
    pub input_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl CompleteFileEntry {
    /// 条目给出的远端标识（fileId 优先，其次 path）
    pub fn remote_id(&self) -> Option<String> {
        self.file_id.clone().or_else(|| self.path.clone())
    }
}

/// 校验后的单文件 init 结果
#[derive(Debug, Clone)]
pub struct StagedTarget {
    pub staging_handle: String,
    pub path: Option<String>,
    /// 按分片索引排列（part_urls[i] 对应 partNumber i+1）
    pub part_urls: Vec<String>,
}

/// 校验 init 条目
///
/// 分片 URL 数量必须与计算出的分片数一致，否则对该文件是致命协议错误。
/// URL 按 partNumber 排序后落到按索引寻址的列表里。
pub fn validate_init_entry(
    entry: &InitFileEntry,
    expected_chunks: usize,
) -> Result<StagedTarget, ProtocolError> {
    if entry.parts.len() != expected_chunks {
        return Err(ProtocolError::PartCountMismatch {
            expected: expected_chunks,
            actual: entry.parts.len(),
        });
    }

    let mut parts = entry.parts.clone();
    parts.sort_by_key(|p| p.part_number);

    Ok(StagedTarget {
        staging_handle: entry.staging_handle.clone(),
        path: entry.path.clone(),
        part_urls: parts.into_iter().map(|p| p.url).collect(),
    })
}

/// 合成远端路径（服务端未给标识时的回退）
pub fn synthesized_path(session_id: &str, file_uuid: &str, file_name: &str) -> String {
    format!(
        "{}/{}/{}",
        session_id,
        file_uuid,
        urlencoding::encode(file_name)
    )
}

/// 合成确认令牌（分片响应缺少 ETag 头时的占位）
pub fn synthesized_token(part_number: u32) -> String {
    format!("confirm-{}", part_number)
}

/// 从 simple 模式响应体里提取远端标识（path 或 fileId）
pub fn remote_id_from_body(body: &serde_json::Value) -> Option<String> {
    for field in ["path", "fileId"] {
        if let Some(id) = body.get(field).and_then(|v| v.as_str()) {
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(parts: Vec<(u32, &str)>) -> InitFileEntry {
        InitFileEntry {
            input_name: "file".to_string(),
            staging_handle: "stage-1".to_string(),
            path: None,
            parts: parts
                .into_iter()
                .map(|(n, u)| PartUrl {
                    part_number: n,
                    url: u.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_validate_sorts_by_part_number() {
        // 响应乱序，按 partNumber 归位
        let target = validate_init_entry(&entry(vec![(3, "c"), (1, "a"), (2, "b")]), 3).unwrap();
        assert_eq!(target.part_urls, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_validate_part_count_mismatch() {
        let result = validate_init_entry(&entry(vec![(1, "a"), (2, "b")]), 3);
        assert!(matches!(
            result,
            Err(ProtocolError::PartCountMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_wire_casing() {
        let spec = InitFileSpec {
            input_name: "attachments".to_string(),
            file_name: "a.bin".to_string(),
            size: 1024,
            mime: "application/octet-stream".to_string(),
            chunks: 1,
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert!(json.get("inputName").is_some());
        assert!(json.get("fileName").is_some());

        let entry: CompleteFileEntry =
            serde_json::from_str(r#"{"inputName":"f","fileId":"fid-9"}"#).unwrap();
        assert_eq!(entry.remote_id(), Some("fid-9".to_string()));
    }

    #[test]
    fn test_remote_id_prefers_file_id_then_path() {
        let entry: CompleteFileEntry =
            serde_json::from_str(r#"{"inputName":"f","fileId":"fid","path":"p"}"#).unwrap();
        assert_eq!(entry.remote_id(), Some("fid".to_string()));

        let entry: CompleteFileEntry =
            serde_json::from_str(r#"{"inputName":"f","path":"p"}"#).unwrap();
        assert_eq!(entry.remote_id(), Some("p".to_string()));

        let entry: CompleteFileEntry = serde_json::from_str(r#"{"inputName":"f"}"#).unwrap();
        assert_eq!(entry.remote_id(), None);
    }

    #[test]
    fn test_synthesized_helpers() {
        assert_eq!(synthesized_token(2), "confirm-2");

        let path = synthesized_path("s1", "uuid-1", "年报 final.pdf");
        assert!(path.starts_with("s1/uuid-1/"));
        // 文件名经过 URL 编码
        assert!(!path.contains(' '));
    }

    #[test]
    fn test_remote_id_from_body() {
        let body: serde_json::Value =
            serde_json::from_str(r#"{"path":"bucket/key","fileId":"fid"}"#).unwrap();
        assert_eq!(remote_id_from_body(&body), Some("bucket/key".to_string()));

        let body: serde_json::Value = serde_json::from_str(r#"{"fileId":"fid"}"#).unwrap();
        assert_eq!(remote_id_from_body(&body), Some("fid".to_string()));

        assert_eq!(remote_id_from_body(&serde_json::Value::Null), None);
        let body: serde_json::Value = serde_json::from_str(r#"{"ok":true}"#).unwrap();
        assert_eq!(remote_id_from_body(&body), None);
    }
}
