//! 安装状态 SQLite 数据库
//!
//! - installed_apps: 已安装记录
//! - pending_downloads: 待完成下载（含用户选择的 DLC）
//!
//! depot / DLC 列表以 JSON 文本存储

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::install_state::{InstallStateError, InstallStateResult, InstallStateStore};
use crate::catalog::{AppId, InstalledAppRecord, PendingDownload};

/// SQLite 安装状态存储
pub struct SqliteInstallStateStore {
    conn: Mutex<Connection>,
}

impl SqliteInstallStateStore {
    /// 打开（或创建）数据库文件
    pub fn open(db_path: &Path) -> InstallStateResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self {
            conn: Mutex::new(Connection::open(db_path)?),
        };
        store.init_tables()?;
        info!("安装状态数据库已打开: {:?}", db_path);
        Ok(store)
    }

    /// 内存数据库
    pub fn open_in_memory() -> InstallStateResult<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_tables()?;
        Ok(store)
    }

    fn lock(&self) -> InstallStateResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| InstallStateError::Lock(e.to_string()))
    }

    fn init_tables(&self) -> InstallStateResult<()> {
        let conn = self.lock()?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS installed_apps (
                app_id INTEGER PRIMARY KEY,
                is_downloaded INTEGER NOT NULL DEFAULT 0,
                downloaded_depot_ids TEXT NOT NULL DEFAULT '[]',
                dlc_depot_ids TEXT NOT NULL DEFAULT '[]',
                updated_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS pending_downloads (
                app_id INTEGER PRIMARY KEY,
                dlc_app_ids TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        debug!("安装状态表初始化完成");
        Ok(())
    }
}

impl InstallStateStore for SqliteInstallStateStore {
    fn installed_record(&self, app_id: AppId) -> InstallStateResult<Option<InstalledAppRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT is_downloaded, downloaded_depot_ids, dlc_depot_ids FROM installed_apps WHERE app_id = ?1",
                params![app_id],
                |row| {
                    Ok((
                        row.get::<_, bool>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((is_downloaded, depots, dlcs)) => Ok(Some(InstalledAppRecord {
                app_id,
                is_downloaded,
                downloaded_depot_ids: serde_json::from_str(&depots)?,
                dlc_depot_ids: serde_json::from_str(&dlcs)?,
            })),
            None => Ok(None),
        }
    }

    fn upsert_installed_record(&self, record: &InstalledAppRecord) -> InstallStateResult<()> {
        let depots = serde_json::to_string(&record.downloaded_depot_ids)?;
        let dlcs = serde_json::to_string(&record.dlc_depot_ids)?;

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO installed_apps
                (app_id, is_downloaded, downloaded_depot_ids, dlc_depot_ids, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                record.app_id,
                record.is_downloaded,
                depots,
                dlcs,
                Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    fn delete_installed_record(&self, app_id: AppId) -> InstallStateResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM installed_apps WHERE app_id = ?1", params![app_id])?;
        Ok(())
    }

    fn pending_download(&self, app_id: AppId) -> InstallStateResult<Option<PendingDownload>> {
        let conn = self.lock()?;
        let dlcs: Option<String> = conn
            .query_row(
                "SELECT dlc_app_ids FROM pending_downloads WHERE app_id = ?1",
                params![app_id],
                |row| row.get(0),
            )
            .optional()?;

        match dlcs {
            Some(dlcs) => Ok(Some(PendingDownload {
                app_id,
                dlc_app_ids: serde_json::from_str(&dlcs)?,
            })),
            None => Ok(None),
        }
    }

    fn upsert_pending_download(&self, app_id: AppId, dlc_app_ids: &[AppId]) -> InstallStateResult<()> {
        let dlcs = serde_json::to_string(dlc_app_ids)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO pending_downloads (app_id, dlc_app_ids, created_at) VALUES (?1, ?2, ?3)",
            params![app_id, dlcs, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    fn delete_pending_download(&self, app_id: AppId) -> InstallStateResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM pending_downloads WHERE app_id = ?1", params![app_id])?;
        Ok(())
    }
}
