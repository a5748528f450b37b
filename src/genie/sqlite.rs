//! SQLite 会话链接持久化（rusqlite）
//!
//! 表 session_links，主键 (parent_session_id, child_session_id)；查询在阻塞线程池执行。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, Row};

use crate::core::AgentError;
use crate::genie::links::{LinkStatus, LinkStore, SessionLink};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS session_links (
    parent_session_id TEXT NOT NULL,
    child_session_id  TEXT NOT NULL,
    child_profile_id  TEXT NOT NULL,
    execution_order   INTEGER NOT NULL,
    nesting_level     INTEGER NOT NULL,
    status            TEXT NOT NULL,
    archived          INTEGER NOT NULL DEFAULT 0,
    created_at        INTEGER NOT NULL,
    PRIMARY KEY (parent_session_id, child_session_id)
);
CREATE INDEX IF NOT EXISTS idx_session_links_child ON session_links(child_session_id);
CREATE INDEX IF NOT EXISTS idx_session_links_profile ON session_links(child_profile_id);
";

const COLUMNS: &str = "parent_session_id, child_session_id, child_profile_id, execution_order, \
                       nesting_level, status, archived, created_at";

pub struct SqliteLinkStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLinkStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| AgentError::Store(e.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(store_error)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, AgentError> {
        Self::init(Connection::open_in_memory().map_err(store_error)?)
    }

    fn init(conn: Connection) -> Result<Self, AgentError> {
        conn.execute_batch(SCHEMA).map_err(store_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, AgentError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, AgentError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| AgentError::Store(e.to_string()))?
    }
}

fn store_error(e: rusqlite::Error) -> AgentError {
    AgentError::Store(e.to_string())
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<SessionLink> {
    let status: String = row.get(5)?;
    Ok(SessionLink {
        parent_session_id: row.get(0)?,
        child_session_id: row.get(1)?,
        child_profile_id: row.get(2)?,
        execution_order: row.get(3)?,
        nesting_level: row.get(4)?,
        status: LinkStatus::parse(&status).unwrap_or(LinkStatus::Failed),
        archived: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn query_links(conn: &Connection, sql: &str, arg: &str) -> Result<Vec<SessionLink>, AgentError> {
    let mut stmt = conn.prepare(sql).map_err(store_error)?;
    let rows = stmt.query_map(params![arg], from_row).map_err(store_error)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(store_error)
}

#[async_trait]
impl LinkStore for SqliteLinkStore {
    async fn create_link(&self, link: SessionLink) -> Result<(), AgentError> {
        self.with_conn(move |conn| {
            let result = conn.execute(
                &format!("INSERT INTO session_links ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    link.parent_session_id,
                    link.child_session_id,
                    link.child_profile_id,
                    link.execution_order,
                    link.nesting_level,
                    link.status.as_str(),
                    link.archived,
                    link.created_at,
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::ConstraintViolation => {
                    Err(AgentError::LinkRejected(format!(
                        "link {} -> {} already exists",
                        link.parent_session_id, link.child_session_id
                    )))
                }
                Err(e) => Err(store_error(e)),
            }
        })
        .await
    }

    async fn update_status(&self, child_session_id: &str, status: LinkStatus) -> Result<(), AgentError> {
        let child = child_session_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE session_links SET status = ?1 WHERE child_session_id = ?2",
                    params![status.as_str(), child],
                )
                .map_err(store_error)?;
            if changed == 0 {
                return Err(AgentError::Store(format!("unknown child session: {child}")));
            }
            Ok(())
        })
        .await
    }

    async fn mark_archived(&self, child_session_id: &str) -> Result<(), AgentError> {
        let child = child_session_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE session_links SET archived = 1 WHERE child_session_id = ?1",
                    params![child],
                )
                .map_err(store_error)?;
            if changed == 0 {
                return Err(AgentError::Store(format!("unknown child session: {child}")));
            }
            Ok(())
        })
        .await
    }

    async fn list_children(&self, parent_session_id: &str) -> Result<Vec<SessionLink>, AgentError> {
        let parent = parent_session_id.to_string();
        self.with_conn(move |conn| {
            query_links(
                conn,
                &format!(
                    "SELECT {COLUMNS} FROM session_links WHERE parent_session_id = ?1 ORDER BY execution_order"
                ),
                &parent,
            )
        })
        .await
    }

    async fn find_by_child(&self, child_session_id: &str) -> Result<Option<SessionLink>, AgentError> {
        let child = child_session_id.to_string();
        self.with_conn(move |conn| {
            let links = query_links(
                conn,
                &format!("SELECT {COLUMNS} FROM session_links WHERE child_session_id = ?1 LIMIT 1"),
                &child,
            )?;
            Ok(links.into_iter().next())
        })
        .await
    }

    async fn list_by_child_profile(&self, profile_id: &str) -> Result<Vec<SessionLink>, AgentError> {
        let profile = profile_id.to_string();
        self.with_conn(move |conn| {
            query_links(
                conn,
                &format!("SELECT {COLUMNS} FROM session_links WHERE child_profile_id = ?1"),
                &profile,
            )
        })
        .await
    }
}
