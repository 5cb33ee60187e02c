//! SQLite storage layer for idlink.
//!
//! Owns the `users` and `user_attributes` tables and the statements that touch
//! them. Row helpers take a plain [`Connection`] so the connector can run them
//! inside whichever transaction it opened; a [`Transaction`] derefs to one.
//!
//! Uniqueness violations are surfaced as [`StorageError::Unique`] so callers
//! can tell a lost race from any other failure.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{ffi, params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConnectorConfig, DEFAULT_BUSY_TIMEOUT_MS};

/// Surrogate user id assigned by the store.
pub type Uid = i64;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    /// A UNIQUE or PRIMARY KEY constraint rejected the statement.
    #[error("unique constraint violated: {constraint}")]
    Unique { constraint: String },
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StorageError::Unique { .. })
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        match unique_violation(&e) {
            Some(constraint) => StorageError::Unique { constraint },
            None => StorageError::Sqlite(e),
        }
    }
}

/// Returns the constraint description when `e` is a uniqueness failure.
fn unique_violation(e: &rusqlite::Error) -> Option<String> {
    match e {
        rusqlite::Error::SqliteFailure(err, msg)
            if err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                || err.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            Some(msg.clone().unwrap_or_else(|| "unique".to_string()))
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// User row stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRow {
    pub uid: Uid,
    pub identifier: Option<String>,
}

/// One attribute observation owned by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAttributeRow {
    pub uid: Uid,
    pub attr_type: String,
    pub attr_data: String,
}

// ---------------------------------------------------------------------------
// Storage handle
// ---------------------------------------------------------------------------

/// Connection tuning applied when a database is opened.
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// How long a writer waits for a competing transaction before failing.
    pub busy_timeout: Duration,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }
}

impl From<&ConnectorConfig> for StorageOptions {
    fn from(config: &ConnectorConfig) -> Self {
        Self {
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
        }
    }
}

/// Main storage handle wrapping a single SQLite connection.
///
/// A handle is used by one caller at a time. Concurrent callers open their
/// own handle on the same file and coordinate through SQLite's locking.
pub struct Storage {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Storage {
    /// Open or create a database at the given path. Creates schema if needed.
    pub fn open(path: &Path, options: &StorageOptions) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(options.busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let storage = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        storage.create_schema()?;
        Ok(storage)
    }

    /// Create a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn, path: None };
        storage.create_schema()?;
        Ok(storage)
    }

    /// Open the database described by `config`, resolving relative defaults
    /// against `data_dir`.
    pub fn from_config(config: &ConnectorConfig, data_dir: &Path) -> Result<Self, StorageError> {
        let path = config.database_path(data_dir);
        Self::open(&path, &StorageOptions::from(config))
    }

    /// Path of the backing file, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Borrow the underlying connection for statements outside a transaction.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Start a write transaction. Takes the database write lock up front so
    /// competing writers queue on the busy timeout instead of failing on
    /// lock upgrade.
    pub fn begin_write(&self) -> Result<Transaction<'_>, StorageError> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    /// Start a read transaction; every statement inside sees one snapshot.
    pub fn begin_read(&self) -> Result<Transaction<'_>, StorageError> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Deferred,
        )?)
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                uid         INTEGER PRIMARY KEY AUTOINCREMENT,
                identifier  TEXT UNIQUE
            );

            CREATE TABLE IF NOT EXISTS user_attributes (
                uid         INTEGER NOT NULL REFERENCES users(uid) ON DELETE CASCADE,
                attr_type   TEXT NOT NULL,
                attr_data   TEXT NOT NULL,
                UNIQUE (uid, attr_type),
                UNIQUE (attr_type, attr_data)
            );
            ",
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// Insert a user row and return the generated uid.
pub fn insert_user(conn: &Connection, identifier: Option<&str>) -> Result<Uid, StorageError> {
    conn.execute(
        "INSERT INTO users (identifier) VALUES (?1)",
        params![identifier],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_user(conn: &Connection, uid: Uid) -> Result<Option<UserRow>, StorageError> {
    let mut stmt = conn.prepare("SELECT uid, identifier FROM users WHERE uid = ?1")?;
    let row = stmt
        .query_row(params![uid], |row| {
            Ok(UserRow {
                uid: row.get(0)?,
                identifier: row.get(1)?,
            })
        })
        .optional()?;
    Ok(row)
}

pub fn user_exists(conn: &Connection, uid: Uid) -> Result<bool, StorageError> {
    let found = conn
        .query_row("SELECT 1 FROM users WHERE uid = ?1", params![uid], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

pub fn list_users(conn: &Connection) -> Result<Vec<UserRow>, StorageError> {
    let mut stmt = conn.prepare("SELECT uid, identifier FROM users ORDER BY uid")?;
    let rows = stmt.query_map([], |row| {
        Ok(UserRow {
            uid: row.get(0)?,
            identifier: row.get(1)?,
        })
    })?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

/// Set the identifier of an existing user. Returns the number of rows touched.
pub fn update_identifier(
    conn: &Connection,
    uid: Uid,
    identifier: &str,
) -> Result<usize, StorageError> {
    let affected = conn.execute(
        "UPDATE users SET identifier = ?1 WHERE uid = ?2",
        params![identifier, uid],
    )?;
    Ok(affected)
}

pub fn find_uid_by_identifier(
    conn: &Connection,
    identifier: &str,
) -> Result<Option<Uid>, StorageError> {
    let uid = conn
        .query_row(
            "SELECT uid FROM users WHERE identifier = ?1",
            params![identifier],
            |row| row.get(0),
        )
        .optional()?;
    Ok(uid)
}

/// Delete a user; attribute rows follow through `ON DELETE CASCADE`.
pub fn delete_user(conn: &Connection, uid: Uid) -> Result<bool, StorageError> {
    let affected = conn.execute("DELETE FROM users WHERE uid = ?1", params![uid])?;
    Ok(affected > 0)
}

// ---------------------------------------------------------------------------
// User attributes
// ---------------------------------------------------------------------------

pub fn insert_attribute(
    conn: &Connection,
    uid: Uid,
    attr_type: &str,
    attr_data: &str,
) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO user_attributes (uid, attr_type, attr_data) VALUES (?1, ?2, ?3)",
        params![uid, attr_type, attr_data],
    )?;
    Ok(())
}

/// Overwrite the value of `(uid, attr_type)` in place. Returns rows touched,
/// so zero means the attribute does not exist yet.
pub fn update_attribute(
    conn: &Connection,
    uid: Uid,
    attr_type: &str,
    attr_data: &str,
) -> Result<usize, StorageError> {
    let affected = conn.execute(
        "UPDATE user_attributes SET attr_data = ?1 WHERE uid = ?2 AND attr_type = ?3",
        params![attr_data, uid, attr_type],
    )?;
    Ok(affected)
}

pub fn attribute_exists(conn: &Connection, uid: Uid, attr_type: &str) -> Result<bool, StorageError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM user_attributes WHERE uid = ?1 AND attr_type = ?2",
            params![uid, attr_type],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// All attributes of a user, ordered by type.
pub fn list_attributes(conn: &Connection, uid: Uid) -> Result<Vec<UserAttributeRow>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT uid, attr_type, attr_data FROM user_attributes
         WHERE uid = ?1 ORDER BY attr_type",
    )?;
    let rows = stmt.query_map(params![uid], |row| {
        Ok(UserAttributeRow {
            uid: row.get(0)?,
            attr_type: row.get(1)?,
            attr_data: row.get(2)?,
        })
    })?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

/// The user owning the observation `(attr_type, attr_data)`, if any.
pub fn find_uid_by_attr(
    conn: &Connection,
    attr_type: &str,
    attr_data: &str,
) -> Result<Option<Uid>, StorageError> {
    let uid = conn
        .query_row(
            "SELECT uid FROM user_attributes WHERE attr_type = ?1 AND attr_data = ?2",
            params![attr_type, attr_data],
            |row| row.get(0),
        )
        .optional()?;
    Ok(uid)
}

#[cfg(test)]
pub fn count_attributes(conn: &Connection) -> Result<u64, StorageError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM user_attributes", [], |row| {
        row.get(0)
    })?;
    Ok(count as u64)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
