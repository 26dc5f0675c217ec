//! 下载状态持久化
//!
//! SQLite 存储：downloads 表保存下载主记录，tasks 表保存暂停或
//! 崩溃时的残留字节区间。save_state 在单个事务内完成 upsert 与
//! 残留任务的差异合并；表结构迁移为增量式，打开时补齐缺失列

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::Task;
use crate::utils::hex_encode;

/// 下载状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// 排队等待
    Queued,
    /// 下载中
    Downloading,
    /// 暂停进行中（正在收取残留区间）
    Pausing,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 失败
    Error,
}

impl DownloadStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "downloading" => Some(Self::Downloading),
            "pausing" => Some(Self::Pausing),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 下载主记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadEntry {
    pub id: String,
    pub url: String,
    pub dest_path: String,
    pub filename: String,
    pub status: DownloadStatus,
    pub total_size: u64,
    pub downloaded: u64,
    pub url_hash: String,
    pub created_at: i64,
    pub paused_at: Option<i64>,
    pub completed_at: Option<i64>,
    /// 累计下载耗时（毫秒）
    pub time_taken_ms: i64,
    pub mirrors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub chunk_bitmap: Vec<u8>,
    pub actual_chunk_size: u64,
}

impl DownloadEntry {
    pub fn new(url: String, dest_path: String, filename: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url_hash: url_hash(&url),
            url,
            dest_path,
            filename,
            status: DownloadStatus::Queued,
            total_size: 0,
            downloaded: 0,
            created_at: Utc::now().timestamp(),
            paused_at: None,
            completed_at: None,
            time_taken_ms: 0,
            mirrors: Vec::new(),
            chunk_bitmap: Vec::new(),
            actual_chunk_size: 0,
        }
    }
}

/// 断点状态：主记录 + 残留任务
///
/// 残留任务描述的始终是尚未写入的字节，
/// 其长度之和等于 total_size - downloaded
#[derive(Debug, Clone)]
pub struct DownloadState {
    pub entry: DownloadEntry,
    pub tasks: Vec<Task>,
}

/// URL 短哈希：SHA-256 前 8 字节的十六进制
pub fn url_hash(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    hex_encode(&digest[..8])
}

/// 持久化存储
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// 打开（或创建）数据库并执行迁移
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).context("创建数据库目录失败")?;
        }

        let conn = Connection::open(db_path).context("打开数据库失败")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        store.migrate()?;
        Ok(store)
    }

    /// 内存数据库（测试用）
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| anyhow!("获取数据库锁失败: {}", e))
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                dest_path TEXT NOT NULL,
                filename TEXT,
                status TEXT,
                total_size INTEGER,
                downloaded INTEGER,
                url_hash TEXT,
                created_at INTEGER,
                paused_at INTEGER,
                completed_at INTEGER,
                time_taken INTEGER
            );
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                download_id TEXT,
                offset INTEGER,
                length INTEGER,
                FOREIGN KEY(download_id) REFERENCES downloads(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_downloads_url ON downloads(url, dest_path);
            CREATE INDEX IF NOT EXISTS idx_tasks_download ON tasks(download_id);
            "#,
        )?;
        Ok(())
    }

    /// 增量迁移：补齐旧库缺失的列
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        let migrations = [
            ("mirrors", "ALTER TABLE downloads ADD COLUMN mirrors TEXT"),
            (
                "chunk_bitmap",
                "ALTER TABLE downloads ADD COLUMN chunk_bitmap BLOB",
            ),
            (
                "actual_chunk_size",
                "ALTER TABLE downloads ADD COLUMN actual_chunk_size INTEGER",
            ),
        ];

        for (column, ddl) in migrations {
            let exists: i64 = conn.query_row(
                "SELECT count(*) FROM pragma_table_info('downloads') WHERE name = ?1",
                params![column],
                |row| row.get(0),
            )?;
            if exists == 0 {
                conn.execute(ddl, [])?;
                info!("数据库迁移: downloads 表新增列 {}", column);
            }
        }
        Ok(())
    }

    /// 保存断点状态
    ///
    /// 单个事务：按 id upsert 主记录，再按 offset 对 tasks 做差异
    /// 合并——长度一致的保留，变化的替换，消失的删除，新增的插入
    pub fn save_state(&self, state: &mut DownloadState) -> Result<()> {
        if state.entry.id.is_empty() {
            state.entry.id = Uuid::new_v4().to_string();
        }
        state.entry.url_hash = url_hash(&state.entry.url);
        state.entry.paused_at = Some(Utc::now().timestamp());
        if state.entry.created_at == 0 {
            state.entry.created_at = Utc::now().timestamp();
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let e = &state.entry;
        tx.execute(
            r#"
            INSERT INTO downloads (
                id, url, dest_path, filename, status, total_size, downloaded,
                url_hash, created_at, paused_at, completed_at, time_taken,
                mirrors, chunk_bitmap, actual_chunk_size
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT(id) DO UPDATE SET
                url=excluded.url,
                dest_path=excluded.dest_path,
                filename=excluded.filename,
                status=excluded.status,
                total_size=excluded.total_size,
                downloaded=excluded.downloaded,
                url_hash=excluded.url_hash,
                paused_at=excluded.paused_at,
                completed_at=excluded.completed_at,
                time_taken=excluded.time_taken,
                mirrors=excluded.mirrors,
                chunk_bitmap=excluded.chunk_bitmap,
                actual_chunk_size=excluded.actual_chunk_size
            "#,
            params![
                e.id,
                e.url,
                e.dest_path,
                e.filename,
                e.status.as_str(),
                e.total_size as i64,
                e.downloaded as i64,
                e.url_hash,
                e.created_at,
                e.paused_at,
                e.completed_at,
                e.time_taken_ms,
                e.mirrors.join(","),
                e.chunk_bitmap,
                e.actual_chunk_size as i64,
            ],
        )
        .context("写入下载记录失败")?;

        // 读出已持久化的残留任务，按 offset 做差异
        let mut existing: std::collections::HashMap<u64, (i64, u64)> =
            std::collections::HashMap::new();
        {
            let mut stmt =
                tx.prepare("SELECT id, offset, length FROM tasks WHERE download_id = ?1")?;
            let rows = stmt.query_map(params![e.id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)? as u64,
                ))
            })?;
            for row in rows {
                let (row_id, offset, length) = row?;
                existing.insert(offset, (row_id, length));
            }
        }

        let mut to_insert: Vec<Task> = Vec::new();
        let mut to_delete: Vec<i64> = Vec::new();

        for task in &state.tasks {
            match existing.remove(&task.offset) {
                Some((_, length)) if length == task.length => {}
                Some((row_id, _)) => {
                    to_delete.push(row_id);
                    to_insert.push(*task);
                }
                None => to_insert.push(*task),
            }
        }
        // 余下的是新状态里已不存在的区间
        for (_, (row_id, _)) in existing {
            to_delete.push(row_id);
        }

        if !to_delete.is_empty() {
            let mut stmt = tx.prepare("DELETE FROM tasks WHERE id = ?1")?;
            for row_id in &to_delete {
                stmt.execute(params![row_id])?;
            }
        }
        if !to_insert.is_empty() {
            let mut stmt =
                tx.prepare("INSERT INTO tasks (download_id, offset, length) VALUES (?1, ?2, ?3)")?;
            for task in &to_insert {
                stmt.execute(params![e.id, task.offset as i64, task.length as i64])?;
            }
        }

        tx.commit()?;

        debug!(
            "状态已保存: id={}, 残留任务 {} 个 (新增 {}, 删除 {})",
            e.id,
            state.tasks.len(),
            to_insert.len(),
            to_delete.len()
        );
        Ok(())
    }

    /// 按 (url, dest_path) 加载未完成下载的断点状态
    pub fn load_state(&self, url: &str, dest_path: &str) -> Result<Option<DownloadState>> {
        let conn = self.lock()?;

        let entry = conn
            .query_row(
                &format!(
                    "{} WHERE url = ?1 AND dest_path = ?2 AND status != 'completed' \
                     ORDER BY paused_at DESC LIMIT 1",
                    SELECT_ENTRY
                ),
                params![url, dest_path],
                row_to_entry,
            )
            .optional()?;

        let Some(entry) = entry else {
            return Ok(None);
        };

        let mut stmt =
            conn.prepare("SELECT offset, length FROM tasks WHERE download_id = ?1 ORDER BY offset")?;
        let tasks = stmt
            .query_map(params![entry.id], |row| {
                Ok(Task::new(
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, i64>(1)? as u64,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Some(DownloadState { entry, tasks }))
    }

    /// 按 id 加载断点状态
    pub fn load_state_by_id(&self, id: &str) -> Result<Option<DownloadState>> {
        let Some(entry) = self.get_entry(id)? else {
            return Ok(None);
        };
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT offset, length FROM tasks WHERE download_id = ?1 ORDER BY offset")?;
        let tasks = stmt
            .query_map(params![id], |row| {
                Ok(Task::new(
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, i64>(1)? as u64,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Some(DownloadState { entry, tasks }))
    }

    /// 删除下载记录（残留任务经外键级联删除）
    pub fn delete(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM downloads WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// 写入或更新主记录（不触碰残留任务）
    pub fn upsert_entry(&self, entry: &DownloadEntry) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO downloads (
                id, url, dest_path, filename, status, total_size, downloaded,
                url_hash, created_at, paused_at, completed_at, time_taken,
                mirrors, chunk_bitmap, actual_chunk_size
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT(id) DO UPDATE SET
                url=excluded.url,
                dest_path=excluded.dest_path,
                filename=excluded.filename,
                status=excluded.status,
                total_size=excluded.total_size,
                downloaded=excluded.downloaded,
                url_hash=excluded.url_hash,
                paused_at=excluded.paused_at,
                completed_at=excluded.completed_at,
                time_taken=excluded.time_taken,
                mirrors=excluded.mirrors,
                chunk_bitmap=excluded.chunk_bitmap,
                actual_chunk_size=excluded.actual_chunk_size
            "#,
            params![
                entry.id,
                entry.url,
                entry.dest_path,
                entry.filename,
                entry.status.as_str(),
                entry.total_size as i64,
                entry.downloaded as i64,
                entry.url_hash,
                entry.created_at,
                entry.paused_at,
                entry.completed_at,
                entry.time_taken_ms,
                entry.mirrors.join(","),
                entry.chunk_bitmap,
                entry.actual_chunk_size as i64,
            ],
        )?;
        Ok(())
    }

    /// 按 id 查询主记录
    pub fn get_entry(&self, id: &str) -> Result<Option<DownloadEntry>> {
        let conn = self.lock()?;
        let entry = conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_ENTRY),
                params![id],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// 列出所有下载（limit <= 0 时不分页）
    pub fn list(&self, offset: i64, limit: i64) -> Result<Vec<DownloadEntry>> {
        let conn = self.lock()?;
        let mut entries = Vec::new();
        if limit > 0 {
            let mut stmt = conn.prepare(&format!(
                "{} ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                SELECT_ENTRY
            ))?;
            let rows = stmt.query_map(params![limit, offset], row_to_entry)?;
            for row in rows {
                entries.push(row?);
            }
        } else {
            let mut stmt = conn.prepare(&format!("{} ORDER BY created_at DESC", SELECT_ENTRY))?;
            let rows = stmt.query_map([], row_to_entry)?;
            for row in rows {
                entries.push(row?);
            }
        }
        Ok(entries)
    }

    /// 已完成的下载（历史记录）
    pub fn completed(&self) -> Result<Vec<DownloadEntry>> {
        self.by_statuses(&["completed"])
    }

    /// 未完成的下载（启动时恢复用）
    pub fn unfinished(&self) -> Result<Vec<DownloadEntry>> {
        self.by_statuses(&["paused", "queued", "downloading", "pausing", "error"])
    }

    fn by_statuses(&self, statuses: &[&str]) -> Result<Vec<DownloadEntry>> {
        let conn = self.lock()?;
        let placeholders = statuses
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(",");
        let mut stmt = conn.prepare(&format!(
            "{} WHERE status IN ({}) ORDER BY created_at DESC",
            SELECT_ENTRY, placeholders
        ))?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(statuses.iter().copied()),
            row_to_entry,
        )?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// 更新状态，记录不存在时报错
    pub fn update_status(&self, id: &str, status: DownloadStatus) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE downloads SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        if changed == 0 {
            anyhow::bail!("下载记录不存在: {}", id);
        }
        Ok(())
    }

    /// 暂停所有未完成下载
    pub fn pause_all(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE downloads SET status = 'paused' WHERE status != 'completed'",
            [],
        )?;
        Ok(())
    }

    /// 恢复所有已暂停下载（置回排队状态）
    pub fn resume_all(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE downloads SET status = 'queued' WHERE status = 'paused'",
            [],
        )?;
        Ok(())
    }

    /// URL 是否已有下载记录
    pub fn has_url(&self, url: &str) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM downloads WHERE url = ?1",
            params![url],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// 清除所有已完成记录，返回删除数量
    pub fn remove_completed(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count = conn.execute("DELETE FROM downloads WHERE status = 'completed'", [])?;
        Ok(count)
    }
}

const SELECT_ENTRY: &str = r#"
    SELECT id, url, dest_path, filename, status, total_size, downloaded,
           url_hash, created_at, paused_at, completed_at, time_taken,
           mirrors, chunk_bitmap, actual_chunk_size
    FROM downloads
"#;

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<DownloadEntry> {
    let status_str: String = row.get::<_, Option<String>>(4)?.unwrap_or_default();
    let mirrors: Option<String> = row.get(12)?;
    Ok(DownloadEntry {
        id: row.get(0)?,
        url: row.get(1)?,
        dest_path: row.get(2)?,
        filename: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        status: DownloadStatus::parse(&status_str).unwrap_or(DownloadStatus::Queued),
        total_size: row.get::<_, Option<i64>>(5)?.unwrap_or(0) as u64,
        downloaded: row.get::<_, Option<i64>>(6)?.unwrap_or(0) as u64,
        url_hash: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        created_at: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
        paused_at: row.get(9)?,
        completed_at: row.get(10)?,
        time_taken_ms: row.get::<_, Option<i64>>(11)?.unwrap_or(0),
        mirrors: mirrors
            .filter(|s| !s.is_empty())
            .map(|s| s.split(',').map(|m| m.to_string()).collect())
            .unwrap_or_default(),
        chunk_bitmap: row.get::<_, Option<Vec<u8>>>(13)?.unwrap_or_default(),
        actual_chunk_size: row.get::<_, Option<i64>>(14)?.unwrap_or(0) as u64,
    })
}
