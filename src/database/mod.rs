//! State persistence module
//!
//! SQLite-backed document store for every collection. Documents are stored
//! as JSON with the columns needed for indexed queries extracted alongside;
//! the connection mutex gives callers multi-statement read-modify-write
//! sections, which is what serializes per-document state transitions.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::types::{ApplicationContainer, DataContainer, DeadNode, NodeRecord, Task, TaskGroup};

/// Database errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// A persisted document with a stable id and lifecycle state.
pub trait Document: Serialize + DeserializeOwned {
    /// Collection (table) name
    const COLLECTION: &'static str;

    fn id(&self) -> &str;
    fn state(&self) -> i64;
    fn created_at(&self) -> Option<f64>;
    fn cluster_node(&self) -> Option<&str> {
        None
    }
}

impl Document for Task {
    const COLLECTION: &'static str = "tasks";

    fn id(&self) -> &str {
        &self.id
    }
    fn state(&self) -> i64 {
        self.state
    }
    fn created_at(&self) -> Option<f64> {
        self.created_at
    }
}

impl Document for TaskGroup {
    const COLLECTION: &'static str = "task_groups";

    fn id(&self) -> &str {
        &self.id
    }
    fn state(&self) -> i64 {
        self.state
    }
    fn created_at(&self) -> Option<f64> {
        self.created_at
    }
}

impl Document for ApplicationContainer {
    const COLLECTION: &'static str = "application_containers";

    fn id(&self) -> &str {
        &self.id
    }
    fn state(&self) -> i64 {
        self.state
    }
    fn created_at(&self) -> Option<f64> {
        self.created_at
    }
    fn cluster_node(&self) -> Option<&str> {
        self.cluster_node.as_deref()
    }
}

impl Document for DataContainer {
    const COLLECTION: &'static str = "data_containers";

    fn id(&self) -> &str {
        &self.id
    }
    fn state(&self) -> i64 {
        self.state
    }
    fn created_at(&self) -> Option<f64> {
        self.created_at
    }
    fn cluster_node(&self) -> Option<&str> {
        self.cluster_node.as_deref()
    }
}

/// Main database wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database
    pub fn open(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL mode for concurrent access from the web and master processes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;

        Self::init_tables(&conn)?;

        info!("Database opened at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_tables(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection for a read-modify-write section.
    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    fn init_tables(conn: &Connection) -> SqliteResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                state INTEGER NOT NULL,
                created_at REAL,
                cluster_node TEXT,
                doc TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_groups (
                id TEXT PRIMARY KEY,
                state INTEGER NOT NULL,
                created_at REAL,
                cluster_node TEXT,
                doc TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS application_containers (
                id TEXT PRIMARY KEY,
                state INTEGER NOT NULL,
                created_at REAL,
                cluster_node TEXT,
                doc TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS data_containers (
                id TEXT PRIMARY KEY,
                state INTEGER NOT NULL,
                created_at REAL,
                cluster_node TEXT,
                doc TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS nodes (
                name TEXT PRIMARY KEY,
                doc TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dead_nodes (
                name TEXT PRIMARY KEY,
                doc TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                doc TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                ip TEXT NOT NULL,
                token TEXT NOT NULL,
                timestamp REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS block_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                timestamp REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_state_created
                ON tasks(state, created_at);

            CREATE INDEX IF NOT EXISTS idx_application_containers_state_node
                ON application_containers(state, cluster_node);

            CREATE INDEX IF NOT EXISTS idx_data_containers_state_node
                ON data_containers(state, cluster_node);

            CREATE INDEX IF NOT EXISTS idx_tokens_username
                ON tokens(username);

            CREATE INDEX IF NOT EXISTS idx_block_entries_username
                ON block_entries(username);
            "#,
        )?;

        Ok(())
    }
}

// ============================================================================
// Generic document operations
// ============================================================================

pub fn insert<T: Document>(conn: &Connection, doc: &T) -> DatabaseResult<()> {
    let json = serde_json::to_string(doc)?;
    conn.execute(
        &format!(
            "INSERT INTO {} (id, state, created_at, cluster_node, doc) VALUES (?1, ?2, ?3, ?4, ?5)",
            T::COLLECTION
        ),
        params![doc.id(), doc.state(), doc.created_at(), doc.cluster_node(), json],
    )?;
    Ok(())
}

pub fn get<T: Document>(conn: &Connection, id: &str) -> DatabaseResult<Option<T>> {
    let json: Option<String> = conn
        .query_row(
            &format!("SELECT doc FROM {} WHERE id = ?1", T::COLLECTION),
            [id],
            |row| row.get(0),
        )
        .optional()?;

    match json {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

pub fn require<T: Document>(conn: &Connection, id: &str) -> DatabaseResult<T> {
    get(conn, id)?.ok_or_else(|| DatabaseError::NotFound(format!("{}/{}", T::COLLECTION, id)))
}

pub fn update<T: Document>(conn: &Connection, doc: &T) -> DatabaseResult<()> {
    let json = serde_json::to_string(doc)?;
    conn.execute(
        &format!(
            "UPDATE {} SET state = ?2, created_at = ?3, cluster_node = ?4, doc = ?5 WHERE id = ?1",
            T::COLLECTION
        ),
        params![doc.id(), doc.state(), doc.created_at(), doc.cluster_node(), json],
    )?;
    Ok(())
}

/// Store a raw document value, e.g. after secret scrubbing.
///
/// The index columns are re-extracted from the value so they never drift
/// from the document body.
pub fn update_raw(
    conn: &Connection,
    collection: &str,
    id: &str,
    doc: &Value,
) -> DatabaseResult<()> {
    let state = doc.get("state").and_then(Value::as_i64).unwrap_or(-1);
    let created_at = doc.get("created_at").and_then(Value::as_f64);
    let cluster_node = doc
        .get("cluster_node")
        .and_then(Value::as_str)
        .map(str::to_string);
    conn.execute(
        &format!(
            "UPDATE {} SET state = ?2, created_at = ?3, cluster_node = ?4, doc = ?5 WHERE id = ?1",
            collection
        ),
        params![id, state, created_at, cluster_node, serde_json::to_string(doc)?],
    )?;
    Ok(())
}

pub fn delete<T: Document>(conn: &Connection, id: &str) -> DatabaseResult<()> {
    conn.execute(
        &format!("DELETE FROM {} WHERE id = ?1", T::COLLECTION),
        [id],
    )?;
    Ok(())
}

fn collect_docs<T: DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    state_params: &[i64],
) -> DatabaseResult<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(state_params.iter()), |row| {
        row.get::<_, String>(0)
    })?;

    let mut docs = Vec::new();
    for row in rows {
        docs.push(serde_json::from_str(&row?)?);
    }
    Ok(docs)
}

fn placeholders(count: usize) -> String {
    (1..=count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Documents whose state is one of `states`.
pub fn find_in_states<T: Document>(conn: &Connection, states: &[i64]) -> DatabaseResult<Vec<T>> {
    let sql = format!(
        "SELECT doc FROM {} WHERE state IN ({}) ORDER BY created_at",
        T::COLLECTION,
        placeholders(states.len())
    );
    collect_docs(conn, &sql, states)
}

/// All documents of a collection, oldest first.
pub fn find_all<T: Document>(conn: &Connection) -> DatabaseResult<Vec<T>> {
    let sql = format!("SELECT doc FROM {} ORDER BY created_at", T::COLLECTION);
    collect_docs(conn, &sql, &[])
}

/// Documents whose state is none of `states`.
pub fn find_not_in_states<T: Document>(
    conn: &Connection,
    states: &[i64],
) -> DatabaseResult<Vec<T>> {
    let sql = format!(
        "SELECT doc FROM {} WHERE state NOT IN ({}) ORDER BY created_at",
        T::COLLECTION,
        placeholders(states.len())
    );
    collect_docs(conn, &sql, states)
}

/// Waiting tasks in FIFO order by creation time.
pub fn waiting_tasks(conn: &Connection) -> DatabaseResult<Vec<Task>> {
    let sql = "SELECT doc FROM tasks WHERE state = ?1 ORDER BY created_at ASC";
    collect_docs(conn, sql, &[crate::states::State::Waiting.index()])
}

/// All documents of a collection as raw JSON, for query pipelines.
pub fn all_raw(conn: &Connection, collection: &str) -> DatabaseResult<Vec<Value>> {
    let mut stmt = conn.prepare(&format!("SELECT doc FROM {} ORDER BY created_at", collection))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut docs = Vec::new();
    for row in rows {
        docs.push(serde_json::from_str(&row?)?);
    }
    Ok(docs)
}

// ============================================================================
// Nodes and dead nodes
// ============================================================================

pub fn upsert_node(conn: &Connection, node: &NodeRecord) -> DatabaseResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO nodes (name, doc) VALUES (?1, ?2)",
        params![node.cluster_node, serde_json::to_string(node)?],
    )?;
    Ok(())
}

pub fn get_node(conn: &Connection, name: &str) -> DatabaseResult<Option<NodeRecord>> {
    let json: Option<String> = conn
        .query_row("SELECT doc FROM nodes WHERE name = ?1", [name], |row| {
            row.get(0)
        })
        .optional()?;
    match json {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

pub fn all_nodes(conn: &Connection) -> DatabaseResult<Vec<NodeRecord>> {
    let mut stmt = conn.prepare("SELECT doc FROM nodes ORDER BY name")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut nodes = Vec::new();
    for row in rows {
        nodes.push(serde_json::from_str(&row?)?);
    }
    Ok(nodes)
}

pub fn upsert_dead_node(conn: &Connection, dead: &DeadNode) -> DatabaseResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO dead_nodes (name, doc) VALUES (?1, ?2)",
        params![dead.name, serde_json::to_string(dead)?],
    )?;
    Ok(())
}

pub fn delete_dead_node(conn: &Connection, name: &str) -> DatabaseResult<()> {
    conn.execute("DELETE FROM dead_nodes WHERE name = ?1", [name])?;
    Ok(())
}

pub fn is_dead_node(conn: &Connection, name: &str) -> DatabaseResult<bool> {
    let found: Option<String> = conn
        .query_row("SELECT name FROM dead_nodes WHERE name = ?1", [name], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

pub fn all_dead_nodes(conn: &Connection) -> DatabaseResult<Vec<DeadNode>> {
    let mut stmt = conn.prepare("SELECT doc FROM dead_nodes ORDER BY name")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut nodes = Vec::new();
    for row in rows {
        nodes.push(serde_json::from_str(&row?)?);
    }
    Ok(nodes)
}

// ============================================================================
// Users, tokens, block entries
// ============================================================================

/// Stored user credential record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,

    /// PBKDF2-HMAC-SHA256 derived key, hex encoded
    pub password: String,

    /// Per-user random salt, hex encoded
    pub salt: String,

    pub hash_function: String,

    pub is_admin: bool,
}

pub fn upsert_user(conn: &Connection, user: &UserRecord) -> DatabaseResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO users (username, doc) VALUES (?1, ?2)",
        params![user.username, serde_json::to_string(user)?],
    )?;
    Ok(())
}

pub fn get_user(conn: &Connection, username: &str) -> DatabaseResult<Option<UserRecord>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT doc FROM users WHERE username = ?1",
            [username],
            |row| row.get(0),
        )
        .optional()?;
    match json {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

pub fn insert_token(
    conn: &Connection,
    username: &str,
    ip: &str,
    token: &str,
    timestamp: f64,
) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO tokens (username, ip, token, timestamp) VALUES (?1, ?2, ?3, ?4)",
        params![username, ip, token, timestamp],
    )?;
    Ok(())
}

pub fn purge_tokens_older_than(conn: &Connection, cutoff: f64) -> DatabaseResult<()> {
    conn.execute("DELETE FROM tokens WHERE timestamp < ?1", [cutoff])?;
    Ok(())
}

pub fn token_exists(
    conn: &Connection,
    username: &str,
    ip: &str,
    token: &str,
) -> DatabaseResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT id FROM tokens WHERE username = ?1 AND ip = ?2 AND token = ?3",
            params![username, ip, token],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn insert_block_entry(conn: &Connection, username: &str, timestamp: f64) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO block_entries (username, timestamp) VALUES (?1, ?2)",
        params![username, timestamp],
    )?;
    Ok(())
}

pub fn purge_block_entries_older_than(conn: &Connection, cutoff: f64) -> DatabaseResult<()> {
    conn.execute("DELETE FROM block_entries WHERE timestamp < ?1", [cutoff])?;
    Ok(())
}

pub fn count_block_entries(conn: &Connection, username: &str) -> DatabaseResult<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM block_entries WHERE username = ?1",
        [username],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}
