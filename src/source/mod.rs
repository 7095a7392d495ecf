// 字节范围源
//
// 把"给定偏移和长度产出字节"抽象为能力接口：
// 磁盘文件实现用于真实上传，内存实现用于测试和小对象。
// 该能力只在进程存活期间有效，不做持久化；重启后由持久化分片兜底。

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// 字节范围源
#[async_trait]
pub trait ByteRangeSource: Send + Sync {
    /// 总字节数
    fn len(&self) -> u64;

    /// 是否为空
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 读取 `[offset, offset + len)` 范围的字节
    async fn read_range(&self, offset: u64, len: u64) -> std::io::Result<Vec<u8>>;
}

/// 磁盘文件字节源
#[derive(Debug, Clone)]
pub struct FileByteSource {
    path: PathBuf,
    size: u64,
}

impl FileByteSource {
    /// 打开文件并记录大小
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let meta = tokio::fs::metadata(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            size: meta.len(),
        })
    }
}

#[async_trait]
impl ByteRangeSource for FileByteSource {
    fn len(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(&self.path).await?;

        // 定位到范围起始位置
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buffer = vec![0u8; len as usize];
        file.read_exact(&mut buffer).await?;

        debug!(
            "读取文件范围: {:?} bytes={}-{}",
            self.path,
            offset,
            offset + len - 1
        );

        Ok(buffer)
    }
}

/// 内存字节源
#[derive(Debug, Clone)]
pub struct MemoryByteSource {
    bytes: Arc<Vec<u8>>,
}

impl MemoryByteSource {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }
}

#[async_trait]
impl ByteRangeSource for MemoryByteSource {
    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    async fn read_range(&self, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
        let start = offset as usize;
        let end = start + len as usize;
        if end > self.bytes.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("范围越界: {}..{} (总大小 {})", start, end, self.bytes.len()),
            ));
        }
        Ok(self.bytes[start..end].to_vec())
    }
}
