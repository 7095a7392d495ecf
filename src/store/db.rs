//! SQLite 存储实现
//!
//! 单连接 + parking_lot 互斥锁，所有阻塞操作放到 spawn_blocking 上执行。
//! 记录本体以 JSON 存储（兜底字段演进），复合键列单独建列以支持按键查询。

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use super::types::{FileKey, FileRecord, PendingSubmission};
use crate::error::StoreError;

/// 持久化分片存储
#[derive(Clone)]
pub struct ChunkStore {
    conn: Arc<Mutex<Connection>>,
}

impl ChunkStore {
    /// 打开（或创建）数据库
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_tables()?;
        debug!("已打开上传持久化存储: {:?}", db_path);
        Ok(store)
    }

    /// 打开内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_tables()?;
        Ok(store)
    }

    /// 初始化表结构
    fn init_tables(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS file_records (
                session_id TEXT NOT NULL,
                input_name TEXT NOT NULL,
                file_index INTEGER NOT NULL,
                record_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (session_id, input_name, file_index)
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_file_records_session ON file_records(session_id)",
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS chunk_blobs (
                session_id TEXT NOT NULL,
                input_name TEXT NOT NULL,
                file_index INTEGER NOT NULL,
                chunk_index INTEGER NOT NULL,
                bytes BLOB NOT NULL,
                PRIMARY KEY (session_id, input_name, file_index, chunk_index)
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS pending_submissions (
                session_id TEXT PRIMARY KEY,
                record_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        Ok(())
    }

    /// 在阻塞线程上执行数据库操作
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await?
    }

    // ========================================================================
    // 文件记录
    // ========================================================================

    /// 写入（或覆盖）文件记录
    pub async fn put_file_record(&self, record: &FileRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        let session_id = record.session_id.clone();
        let input_name = record.key.input_name.clone();
        let file_index = record.key.file_index;
        let updated_at = record.updated_at.timestamp_millis();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO file_records \
                 (session_id, input_name, file_index, record_json, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session_id, input_name, file_index, json, updated_at],
            )?;
            Ok(())
        })
        .await
    }

    /// 读取单个文件记录
    pub async fn get_file_record(
        &self,
        session_id: &str,
        key: &FileKey,
    ) -> Result<Option<FileRecord>, StoreError> {
        let session_id = session_id.to_string();
        let input_name = key.input_name.clone();
        let file_index = key.file_index;

        self.with_conn(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT record_json FROM file_records \
                     WHERE session_id = ?1 AND input_name = ?2 AND file_index = ?3",
                    params![session_id, input_name, file_index],
                    |row| row.get(0),
                )
                .optional()?;
            match json {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// 列出一个会话的所有文件记录
    ///
    /// 容错处理：无法解析的行跳过并告警，不让单行损坏挡住恢复。
    pub async fn list_file_records(&self, session_id: &str) -> Result<Vec<FileRecord>, StoreError> {
        let session_id = session_id.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT record_json FROM file_records WHERE session_id = ?1 \
                 ORDER BY input_name, file_index",
            )?;
            let rows = stmt.query_map(params![session_id], |row| row.get::<_, String>(0))?;

            let mut records = Vec::new();
            for row in rows {
                let json = row?;
                match serde_json::from_str::<FileRecord>(&json) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("文件记录解析失败，已跳过: {}", e),
                }
            }
            Ok(records)
        })
        .await
    }

    /// 删除文件记录及其全部分片（单事务）
    pub async fn delete_file(&self, session_id: &str, key: &FileKey) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        let input_name = key.input_name.clone();
        let file_index = key.file_index;

        self.with_conn(move |conn| {
            conn.execute_batch("BEGIN")?;
            let result = (|| -> Result<(), rusqlite::Error> {
                conn.execute(
                    "DELETE FROM file_records \
                     WHERE session_id = ?1 AND input_name = ?2 AND file_index = ?3",
                    params![session_id, input_name, file_index],
                )?;
                conn.execute(
                    "DELETE FROM chunk_blobs \
                     WHERE session_id = ?1 AND input_name = ?2 AND file_index = ?3",
                    params![session_id, input_name, file_index],
                )?;
                Ok(())
            })();
            match result {
                Ok(()) => {
                    conn.execute_batch("COMMIT")?;
                    Ok(())
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e.into())
                }
            }
        })
        .await
    }

    // ========================================================================
    // 分片字节
    // ========================================================================

    /// 写入一个分片的字节
    pub async fn put_chunk(
        &self,
        session_id: &str,
        key: &FileKey,
        chunk_index: usize,
        bytes: Vec<u8>,
    ) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        let input_name = key.input_name.clone();
        let file_index = key.file_index;

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO chunk_blobs \
                 (session_id, input_name, file_index, chunk_index, bytes) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session_id, input_name, file_index, chunk_index as i64, bytes],
            )?;
            Ok(())
        })
        .await
    }

    /// 读取一个分片的字节
    pub async fn get_chunk(
        &self,
        session_id: &str,
        key: &FileKey,
        chunk_index: usize,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let session_id = session_id.to_string();
        let input_name = key.input_name.clone();
        let file_index = key.file_index;

        self.with_conn(move |conn| {
            let bytes: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT bytes FROM chunk_blobs \
                     WHERE session_id = ?1 AND input_name = ?2 \
                       AND file_index = ?3 AND chunk_index = ?4",
                    params![session_id, input_name, file_index, chunk_index as i64],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(bytes)
        })
        .await
    }

    /// 删除一个分片（确认后立即调用，控制存储占用）
    pub async fn delete_chunk(
        &self,
        session_id: &str,
        key: &FileKey,
        chunk_index: usize,
    ) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        let input_name = key.input_name.clone();
        let file_index = key.file_index;

        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM chunk_blobs \
                 WHERE session_id = ?1 AND input_name = ?2 \
                   AND file_index = ?3 AND chunk_index = ?4",
                params![session_id, input_name, file_index, chunk_index as i64],
            )?;
            Ok(())
        })
        .await
    }

    /// 统计一个文件尚存的分片数（测试与诊断用）
    pub async fn count_chunks(&self, session_id: &str, key: &FileKey) -> Result<usize, StoreError> {
        let session_id = session_id.to_string();
        let input_name = key.input_name.clone();
        let file_index = key.file_index;

        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM chunk_blobs \
                 WHERE session_id = ?1 AND input_name = ?2 AND file_index = ?3",
                params![session_id, input_name, file_index],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    // ========================================================================
    // 挂起提交
    // ========================================================================

    /// 写入（或覆盖）会话的挂起提交
    ///
    /// 一个会话至多一条：新的提交隐式取代旧的。
    pub async fn put_pending_submission(
        &self,
        pending: &PendingSubmission,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(pending)?;
        let session_id = pending.session_id.clone();
        let updated_at = pending.captured_at.timestamp_millis();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO pending_submissions \
                 (session_id, record_json, updated_at) VALUES (?1, ?2, ?3)",
                params![session_id, json, updated_at],
            )?;
            Ok(())
        })
        .await
    }

    /// 读取会话的挂起提交
    pub async fn get_pending_submission(
        &self,
        session_id: &str,
    ) -> Result<Option<PendingSubmission>, StoreError> {
        let session_id = session_id.to_string();

        self.with_conn(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT record_json FROM pending_submissions WHERE session_id = ?1",
                    params![session_id],
                    |row| row.get(0),
                )
                .optional()?;
            match json {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// 删除会话的挂起提交（重放后调用）
    pub async fn delete_pending_submission(&self, session_id: &str) -> Result<(), StoreError> {
        let session_id = session_id.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM pending_submissions WHERE session_id = ?1",
                params![session_id],
            )?;
            Ok(())
        })
        .await
    }

    // ========================================================================
    // 会话清理
    // ========================================================================

    /// 清空一个会话的全部持久化状态（单事务）
    pub async fn clear_session(&self, session_id: &str) -> Result<(), StoreError> {
        let session_id = session_id.to_string();

        self.with_conn(move |conn| {
            conn.execute_batch("BEGIN")?;
            let result = (|| -> Result<(), rusqlite::Error> {
                conn.execute(
                    "DELETE FROM file_records WHERE session_id = ?1",
                    params![session_id],
                )?;
                conn.execute(
                    "DELETE FROM chunk_blobs WHERE session_id = ?1",
                    params![session_id],
                )?;
                conn.execute(
                    "DELETE FROM pending_submissions WHERE session_id = ?1",
                    params![session_id],
                )?;
                Ok(())
            })();
            match result {
                Ok(()) => {
                    conn.execute_batch("COMMIT")?;
                    Ok(())
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e.into())
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::FileTransferStatus;
    use chrono::Utc;

    fn sample_record(session: &str, input: &str, index: u32) -> FileRecord {
        FileRecord {
            session_id: session.to_string(),
            key: FileKey::new(input, index),
            file_uuid: format!("uuid-{}-{}", input, index),
            file_name: "photo.jpg".to_string(),
            size: 10 * 1024 * 1024,
            mime: "image/jpeg".to_string(),
            chunk_size: 5 * 1024 * 1024,
            total_chunks: 2,
            status: FileTransferStatus::Queued,
            uploaded_chunks: 0,
            path: format!("{}/uuid/photo.jpg", session),
            staging_handle: None,
            part_urls: vec![],
            part_confirmations: vec![],
            remote_id: None,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_file_record_upsert_and_list() {
        let store = ChunkStore::open_in_memory().unwrap();

        store
            .put_file_record(&sample_record("s1", "file", 0))
            .await
            .unwrap();
        store
            .put_file_record(&sample_record("s1", "file", 1))
            .await
            .unwrap();
        store
            .put_file_record(&sample_record("s2", "file", 0))
            .await
            .unwrap();

        let records = store.list_file_records("s1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, FileKey::new("file", 0));
        assert_eq!(records[1].key, FileKey::new("file", 1));

        // 覆盖写入同一键
        let mut updated = sample_record("s1", "file", 0);
        updated.uploaded_chunks = 1;
        store.put_file_record(&updated).await.unwrap();

        let records = store.list_file_records("s1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].uploaded_chunks, 1);
    }

    #[tokio::test]
    async fn test_chunk_roundtrip_and_prune() {
        let store = ChunkStore::open_in_memory().unwrap();
        let key = FileKey::new("file", 0);

        store
            .put_chunk("s1", &key, 0, b"first".to_vec())
            .await
            .unwrap();
        store
            .put_chunk("s1", &key, 1, b"second".to_vec())
            .await
            .unwrap();

        assert_eq!(
            store.get_chunk("s1", &key, 0).await.unwrap(),
            Some(b"first".to_vec())
        );
        assert_eq!(store.count_chunks("s1", &key).await.unwrap(), 2);

        // 确认后删除
        store.delete_chunk("s1", &key, 0).await.unwrap();
        assert_eq!(store.get_chunk("s1", &key, 0).await.unwrap(), None);
        assert_eq!(store.count_chunks("s1", &key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_file_cascades_chunks() {
        let store = ChunkStore::open_in_memory().unwrap();
        let key = FileKey::new("file", 0);

        store.put_file_record(&sample_record("s1", "file", 0)).await.unwrap();
        store.put_chunk("s1", &key, 0, b"a".to_vec()).await.unwrap();
        store.put_chunk("s1", &key, 1, b"b".to_vec()).await.unwrap();

        store.delete_file("s1", &key).await.unwrap();

        assert!(store.list_file_records("s1").await.unwrap().is_empty());
        assert_eq!(store.count_chunks("s1", &key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pending_submission_supersede() {
        let store = ChunkStore::open_in_memory().unwrap();

        let first = PendingSubmission {
            session_id: "s1".to_string(),
            method: "POST".to_string(),
            action: "/a".to_string(),
            fields: vec![],
            target_hint: None,
            captured_at: Utc::now(),
        };
        store.put_pending_submission(&first).await.unwrap();

        // 新提交取代旧的
        let second = PendingSubmission {
            action: "/b".to_string(),
            ..first.clone()
        };
        store.put_pending_submission(&second).await.unwrap();

        let loaded = store.get_pending_submission("s1").await.unwrap().unwrap();
        assert_eq!(loaded.action, "/b");

        store.delete_pending_submission("s1").await.unwrap();
        assert!(store.get_pending_submission("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_session_removes_everything() {
        let store = ChunkStore::open_in_memory().unwrap();
        let key = FileKey::new("file", 0);

        store.put_file_record(&sample_record("s1", "file", 0)).await.unwrap();
        store.put_chunk("s1", &key, 0, b"x".to_vec()).await.unwrap();
        store
            .put_pending_submission(&PendingSubmission {
                session_id: "s1".to_string(),
                method: "POST".to_string(),
                action: "/a".to_string(),
                fields: vec![],
                target_hint: None,
                captured_at: Utc::now(),
            })
            .await
            .unwrap();

        // 另一个会话不受影响
        store.put_file_record(&sample_record("s2", "file", 0)).await.unwrap();

        store.clear_session("s1").await.unwrap();

        assert!(store.list_file_records("s1").await.unwrap().is_empty());
        assert_eq!(store.count_chunks("s1", &key).await.unwrap(), 0);
        assert!(store.get_pending_submission("s1").await.unwrap().is_none());
        assert_eq!(store.list_file_records("s2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_creates_parent_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/dir/uploads.db");
        let store = ChunkStore::open(&path).unwrap();
        store.put_file_record(&sample_record("s1", "file", 0)).await.unwrap();
        assert!(path.exists());
    }
}
