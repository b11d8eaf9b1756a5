//! SQLite-backed store implementation.

use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{
    DownloadEntry, DownloadId, DownloadStatusKind, PersistedDownloadState, StoreError,
};
use crate::task::Task;

/// Handle to the SQLite-backed download store.
///
/// The database file lives under the XDG state directory:
/// `~/.local/state/surge/surge.db`.
#[derive(Clone)]
pub struct StateStore {
    pool: Pool<Sqlite>,
}

impl StateStore {
    /// Open (or create) the default store and run migrations.
    pub async fn open_default() -> Result<Self> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("surge")?;
        let state_dir = xdg_dirs.get_state_home();
        tokio::fs::create_dir_all(&state_dir).await?;
        Self::open_at(&state_dir.join("surge.db")).await
    }

    /// Open (or create) a store at an explicit path. Used by tests and by
    /// callers that manage their own state directory.
    pub async fn open_at(db_path: &Path) -> Result<Self> {
        let uri = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&uri)
            .await
            .with_context(|| format!("failed to open store at {}", db_path.display()))?;
        let store = StateStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests: single connection so the pool cannot hand
    /// back a different empty database.
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = StateStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        // Index table: one row per download id.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                url_hash TEXT NOT NULL,
                dest_path TEXT NOT NULL,
                filename TEXT NOT NULL,
                status TEXT NOT NULL,
                total_size INTEGER,
                downloaded INTEGER NOT NULL DEFAULT 0,
                completed_at INTEGER,
                time_taken_ms INTEGER,
                mirrors_json TEXT,
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Resume-state table: the remaining task list and bitmap, keyed by
        // (url_hash, dest_path) so the same URL to two destinations stays
        // independent.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS states (
                url_hash TEXT NOT NULL,
                dest_path TEXT NOT NULL,
                id TEXT NOT NULL,
                url TEXT NOT NULL,
                filename TEXT NOT NULL,
                total_size INTEGER NOT NULL,
                downloaded INTEGER NOT NULL,
                tasks_json TEXT NOT NULL,
                bitmap BLOB NOT NULL DEFAULT x'',
                chunk_size INTEGER NOT NULL,
                mirrors_json TEXT,
                created_at INTEGER NOT NULL,
                paused_at INTEGER,
                elapsed_ms INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (url_hash, dest_path)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---- resume state ----

    /// Upsert the resumable state for `(state.url_hash, state.dest_path)`.
    pub async fn save_state(&self, state: &PersistedDownloadState) -> Result<()> {
        let tasks_json = serde_json::to_string(&state.tasks)?;
        let mirrors_json = serde_json::to_string(&state.mirrors)?;
        sqlx::query(
            r#"
            INSERT INTO states (
                url_hash, dest_path, id, url, filename, total_size, downloaded,
                tasks_json, bitmap, chunk_size, mirrors_json, created_at,
                paused_at, elapsed_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(url_hash, dest_path) DO UPDATE SET
                id = excluded.id,
                url = excluded.url,
                filename = excluded.filename,
                total_size = excluded.total_size,
                downloaded = excluded.downloaded,
                tasks_json = excluded.tasks_json,
                bitmap = excluded.bitmap,
                chunk_size = excluded.chunk_size,
                mirrors_json = excluded.mirrors_json,
                paused_at = excluded.paused_at,
                elapsed_ms = excluded.elapsed_ms
            "#,
        )
        .bind(&state.url_hash)
        .bind(&state.dest_path)
        .bind(&state.id)
        .bind(&state.url)
        .bind(&state.filename)
        .bind(state.total_size as i64)
        .bind(state.downloaded as i64)
        .bind(tasks_json)
        .bind(&state.bitmap)
        .bind(state.chunk_size as i64)
        .bind(mirrors_json)
        .bind(state.created_at)
        .bind(state.paused_at)
        .bind(state.elapsed_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load resumable state; fails with [`StoreError::NotFound`] when absent.
    pub async fn load_state(
        &self,
        url_hash: &str,
        dest_path: &str,
    ) -> Result<PersistedDownloadState> {
        let row = sqlx::query(
            r#"
            SELECT id, url, filename, total_size, downloaded, tasks_json,
                   bitmap, chunk_size, mirrors_json, created_at, paused_at,
                   elapsed_ms
            FROM states
            WHERE url_hash = ?1 AND dest_path = ?2
            "#,
        )
        .bind(url_hash)
        .bind(dest_path)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(StoreError::NotFound.into());
        };

        let tasks_json: String = row.get("tasks_json");
        let tasks: Vec<Task> = serde_json::from_str(&tasks_json).context("corrupt task list")?;
        let mirrors_json: Option<String> = row.get("mirrors_json");
        let mirrors: Vec<String> = mirrors_json
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(serde_json::from_str)
            .transpose()?
            .unwrap_or_default();

        let total_size: i64 = row.get("total_size");
        let downloaded: i64 = row.get("downloaded");
        let chunk_size: i64 = row.get("chunk_size");
        let elapsed_ms: i64 = row.get("elapsed_ms");

        Ok(PersistedDownloadState {
            id: row.get("id"),
            url: row.get("url"),
            url_hash: url_hash.to_string(),
            dest_path: dest_path.to_string(),
            filename: row.get("filename"),
            total_size: total_size as u64,
            downloaded: downloaded as u64,
            tasks,
            bitmap: row.get("bitmap"),
            chunk_size: chunk_size as u64,
            mirrors,
            created_at: row.get("created_at"),
            paused_at: row.get("paused_at"),
            elapsed_ms: elapsed_ms as u64,
        })
    }

    /// Delete resumable state; silent when nothing is there.
    pub async fn delete_state(&self, url_hash: &str, dest_path: &str) -> Result<()> {
        sqlx::query("DELETE FROM states WHERE url_hash = ?1 AND dest_path = ?2")
            .bind(url_hash)
            .bind(dest_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- index entries ----

    /// Insert a new index entry. One entry per id; a duplicate id is a bug
    /// upstream and surfaces as a constraint error.
    pub async fn add_entry(&self, entry: &DownloadEntry) -> Result<()> {
        let now = unix_timestamp();
        let mirrors_json = serde_json::to_string(&entry.mirrors)?;
        sqlx::query(
            r#"
            INSERT INTO downloads (
                id, url, url_hash, dest_path, filename, status, total_size,
                downloaded, completed_at, time_taken_ms, mirrors_json, error,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.url)
        .bind(&entry.url_hash)
        .bind(&entry.dest_path)
        .bind(&entry.filename)
        .bind(entry.status.as_str())
        .bind(entry.total_size.map(|n| n as i64))
        .bind(entry.downloaded as i64)
        .bind(entry.completed_at)
        .bind(entry.time_taken_ms.map(|n| n as i64))
        .bind(mirrors_json)
        .bind(&entry.error)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Update an entry's status (and error message for `Error`).
    pub async fn update_status(
        &self,
        id: &str,
        status: DownloadStatusKind,
        error: Option<&str>,
    ) -> Result<()> {
        let now = unix_timestamp();
        sqlx::query(
            r#"
            UPDATE downloads
            SET status = ?1, error = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record byte progress on the index entry (pause or completion time).
    pub async fn update_progress(&self, id: &str, downloaded: u64, total_size: Option<u64>) -> Result<()> {
        let now = unix_timestamp();
        sqlx::query(
            r#"
            UPDATE downloads
            SET downloaded = ?1,
                total_size = COALESCE(?2, total_size),
                updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(downloaded as i64)
        .bind(total_size.map(|n| n as i64))
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark an entry completed with its final size and total wall time.
    pub async fn mark_completed(&self, id: &str, total_size: u64, time_taken_ms: u64) -> Result<()> {
        let now = unix_timestamp();
        sqlx::query(
            r#"
            UPDATE downloads
            SET status = 'completed',
                total_size = ?1,
                downloaded = ?1,
                completed_at = ?2,
                time_taken_ms = ?3,
                error = NULL,
                updated_at = ?2
            WHERE id = ?4
            "#,
        )
        .bind(total_size as i64)
        .bind(now)
        .bind(time_taken_ms as i64)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record the resolved filename and destination once the engine has
    /// settled them (uniqueness counters can rename a download at setup).
    pub async fn update_location(&self, id: &str, filename: &str, dest_path: &str) -> Result<()> {
        let now = unix_timestamp();
        sqlx::query(
            r#"
            UPDATE downloads
            SET filename = ?1, dest_path = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(filename)
        .bind(dest_path)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove an index entry; silent when absent.
    pub async fn remove_entry(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM downloads WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All entries, newest first.
    pub async fn list_all(&self) -> Result<Vec<DownloadEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, url, url_hash, dest_path, filename, status, total_size,
                   downloaded, completed_at, time_taken_ms, mirrors_json, error
            FROM downloads
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(entry_from_row).collect()
    }

    /// Entries currently paused (resume candidates after a restart).
    pub async fn list_paused(&self) -> Result<Vec<DownloadEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, url, url_hash, dest_path, filename, status, total_size,
                   downloaded, completed_at, time_taken_ms, mirrors_json, error
            FROM downloads
            WHERE status = 'paused'
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(entry_from_row).collect()
    }

    /// Fetch one entry by id.
    pub async fn get_entry(&self, id: &str) -> Result<Option<DownloadEntry>> {
        let row = sqlx::query(
            r#"
            SELECT id, url, url_hash, dest_path, filename, status, total_size,
                   downloaded, completed_at, time_taken_ms, mirrors_json, error
            FROM downloads
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(entry_from_row).transpose()
    }

    /// Resolve an id prefix to the full id. Fails with
    /// [`StoreError::NotFound`] when nothing matches and
    /// [`StoreError::AmbiguousPrefix`] when more than one entry does.
    pub async fn resolve_by_prefix(&self, prefix: &str) -> Result<DownloadId> {
        let pattern = format!("{}%", prefix.replace('%', "").replace('_', ""));
        let rows = sqlx::query("SELECT id FROM downloads WHERE id LIKE ?1 LIMIT 2")
            .bind(&pattern)
            .fetch_all(&self.pool)
            .await?;
        match rows.len() {
            0 => Err(StoreError::NotFound.into()),
            1 => Ok(rows[0].get("id")),
            _ => Err(StoreError::AmbiguousPrefix(prefix.to_string()).into()),
        }
    }

    /// Normalise entries stranded in `downloading` (e.g. after a crash) to
    /// `paused` so they show up as resume candidates. Returns the number of
    /// entries fixed up.
    pub async fn recover_stranded(&self) -> Result<u64> {
        let now = unix_timestamp();
        let r = sqlx::query(
            r#"
            UPDATE downloads
            SET status = 'paused', updated_at = ?1
            WHERE status = 'downloading' OR status = 'queued'
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(r.rows_affected())
    }
}

fn entry_from_row(row: sqlx::sqlite::SqliteRow) -> Result<DownloadEntry> {
    let status: String = row.get("status");
    let total_size: Option<i64> = row.get("total_size");
    let downloaded: i64 = row.get("downloaded");
    let time_taken_ms: Option<i64> = row.get("time_taken_ms");
    let mirrors_json: Option<String> = row.get("mirrors_json");
    let mirrors: Vec<String> = mirrors_json
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(serde_json::from_str)
        .transpose()?
        .unwrap_or_default();

    Ok(DownloadEntry {
        id: row.get("id"),
        url: row.get("url"),
        url_hash: row.get("url_hash"),
        dest_path: row.get("dest_path"),
        filename: row.get("filename"),
        status: DownloadStatusKind::parse(&status),
        total_size: total_size.map(|n| n as u64),
        downloaded: downloaded as u64,
        completed_at: row.get("completed_at"),
        time_taken_ms: time_taken_ms.map(|n| n as u64),
        mirrors,
        error: row.get("error"),
    })
}

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::url_hash;

    fn entry(id: &str, url: &str) -> DownloadEntry {
        DownloadEntry {
            id: id.to_string(),
            url: url.to_string(),
            url_hash: url_hash(url),
            dest_path: format!("/tmp/{}", id),
            filename: id.to_string(),
            status: DownloadStatusKind::Queued,
            total_size: None,
            downloaded: 0,
            completed_at: None,
            time_taken_ms: None,
            mirrors: Vec::new(),
            error: None,
        }
    }

    fn state(url: &str, dest: &str) -> PersistedDownloadState {
        PersistedDownloadState {
            id: "abc123def456".to_string(),
            url: url.to_string(),
            url_hash: url_hash(url),
            dest_path: dest.to_string(),
            filename: "f.bin".to_string(),
            total_size: 1_000_000,
            downloaded: 250_000,
            tasks: vec![Task::new(250_000, 750_000)],
            bitmap: vec![0b10, 0, 0],
            chunk_size: 250_000,
            mirrors: vec![url.to_string()],
            created_at: 1_700_000_000,
            paused_at: Some(1_700_000_100),
            elapsed_ms: 12_345,
        }
    }

    #[tokio::test]
    async fn save_load_roundtrip_equal_record() {
        let store = StateStore::open_memory().await.unwrap();
        let s = state("https://example.com/f.bin", "/tmp/f.bin");
        store.save_state(&s).await.unwrap();
        let loaded = store
            .load_state(&s.url_hash, &s.dest_path)
            .await
            .unwrap();
        assert_eq!(loaded, s);
    }

    #[tokio::test]
    async fn save_state_upserts() {
        let store = StateStore::open_memory().await.unwrap();
        let mut s = state("https://example.com/f.bin", "/tmp/f.bin");
        store.save_state(&s).await.unwrap();
        s.downloaded = 600_000;
        s.tasks = vec![Task::new(600_000, 400_000)];
        store.save_state(&s).await.unwrap();
        let loaded = store.load_state(&s.url_hash, &s.dest_path).await.unwrap();
        assert_eq!(loaded.downloaded, 600_000);
        assert_eq!(loaded.tasks.len(), 1);
    }

    #[tokio::test]
    async fn load_state_not_found() {
        let store = StateStore::open_memory().await.unwrap();
        let err = store.load_state("nope", "/tmp/x").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn delete_state_silent_when_absent() {
        let store = StateStore::open_memory().await.unwrap();
        store.delete_state("nope", "/tmp/x").await.unwrap();
        let s = state("https://example.com/f.bin", "/tmp/f.bin");
        store.save_state(&s).await.unwrap();
        store.delete_state(&s.url_hash, &s.dest_path).await.unwrap();
        assert!(store.load_state(&s.url_hash, &s.dest_path).await.is_err());
    }

    #[tokio::test]
    async fn same_url_two_destinations_independent() {
        let store = StateStore::open_memory().await.unwrap();
        let a = state("https://example.com/f.bin", "/tmp/a/f.bin");
        let mut b = state("https://example.com/f.bin", "/tmp/b/f.bin");
        b.downloaded = 999;
        store.save_state(&a).await.unwrap();
        store.save_state(&b).await.unwrap();
        assert_eq!(
            store.load_state(&a.url_hash, &a.dest_path).await.unwrap().downloaded,
            250_000
        );
        assert_eq!(
            store.load_state(&b.url_hash, &b.dest_path).await.unwrap().downloaded,
            999
        );
    }

    #[tokio::test]
    async fn entry_lifecycle_and_listing() {
        let store = StateStore::open_memory().await.unwrap();
        store.add_entry(&entry("aaa111", "https://a/1")).await.unwrap();
        store.add_entry(&entry("bbb222", "https://b/2")).await.unwrap();

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 2);

        store
            .update_status("aaa111", DownloadStatusKind::Paused, None)
            .await
            .unwrap();
        let paused = store.list_paused().await.unwrap();
        assert_eq!(paused.len(), 1);
        assert_eq!(paused[0].id, "aaa111");

        store
            .update_status("bbb222", DownloadStatusKind::Error, Some("boom"))
            .await
            .unwrap();
        let e = store.get_entry("bbb222").await.unwrap().unwrap();
        assert_eq!(e.status, DownloadStatusKind::Error);
        assert_eq!(e.error.as_deref(), Some("boom"));

        store.remove_entry("aaa111").await.unwrap();
        assert!(store.get_entry("aaa111").await.unwrap().is_none());
        // Silent for a missing id.
        store.remove_entry("aaa111").await.unwrap();
    }

    #[tokio::test]
    async fn mark_completed_sets_terminal_fields() {
        let store = StateStore::open_memory().await.unwrap();
        store.add_entry(&entry("ccc333", "https://c/3")).await.unwrap();
        store.mark_completed("ccc333", 4096, 1500).await.unwrap();
        let e = store.get_entry("ccc333").await.unwrap().unwrap();
        assert_eq!(e.status, DownloadStatusKind::Completed);
        assert_eq!(e.total_size, Some(4096));
        assert_eq!(e.downloaded, 4096);
        assert_eq!(e.time_taken_ms, Some(1500));
        assert!(e.completed_at.is_some());
    }

    #[tokio::test]
    async fn prefix_resolution() {
        let store = StateStore::open_memory().await.unwrap();
        store.add_entry(&entry("abc111", "https://a/1")).await.unwrap();
        store.add_entry(&entry("abd222", "https://a/2")).await.unwrap();

        assert_eq!(store.resolve_by_prefix("abc").await.unwrap(), "abc111");
        let ambiguous = store.resolve_by_prefix("ab").await.unwrap_err();
        assert!(matches!(
            ambiguous.downcast_ref::<StoreError>(),
            Some(StoreError::AmbiguousPrefix(_))
        ));
        let missing = store.resolve_by_prefix("zzz").await.unwrap_err();
        assert!(matches!(
            missing.downcast_ref::<StoreError>(),
            Some(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn recover_stranded_normalises_to_paused() {
        let store = StateStore::open_memory().await.unwrap();
        store.add_entry(&entry("run111", "https://a/1")).await.unwrap();
        store
            .update_status("run111", DownloadStatusKind::Downloading, None)
            .await
            .unwrap();
        let n = store.recover_stranded().await.unwrap();
        assert_eq!(n, 1);
        let e = store.get_entry("run111").await.unwrap().unwrap();
        assert_eq!(e.status, DownloadStatusKind::Paused);
    }
}
