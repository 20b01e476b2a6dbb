//! SQLite-backed secure entry store.
//!
//! [`EntryStore`] owns every entry record.  It stores ciphertext only; the
//! facade encrypts before writing and decrypts after reading.
//!
//! # Atomicity
//!
//! Every write is a single SQLite statement, so a reader sees either the old
//! entry or the new one, and a failed write leaves the prior entry intact.
//! Writers to the same `(service, key)` are additionally linearized through a
//! per-entry async mutex ([`EntryGuard`]) so that read-check-write sequences
//! in the facade cannot interleave.  Writers to different entries never wait
//! on each other's locks.
//!
//! # Schema
//!
//! One table, `entries`, keyed by `(service, key)`.  Migration runs on open.

use std::path::Path;
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::error::{Result, StorageError};
use crate::types::{AccessControl, Accessible};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Access metadata stored alongside an entry's ciphertext.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPolicy {
    pub access_control: Option<AccessControl>,
    pub accessible: Accessible,
    pub access_group: Option<String>,
    /// Biometry set enrolled at write time, for `BiometryCurrentSet*`.
    pub biometry_set: Option<String>,
}

/// An encrypted entry as stored.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub service: String,
    pub key: String,
    pub ciphertext: Vec<u8>,
    pub policy: EntryPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One entry in a backup export.  The ciphertext stays encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub service: String,
    pub key: String,
    /// Base64 of the stored ciphertext.
    pub ciphertext: String,
    pub access_control: Option<AccessControl>,
    pub accessible: Accessible,
    pub access_group: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

type LockMap = DashMap<(String, String), Arc<tokio::sync::Mutex<()>>>;

/// Exclusive write access to one `(service, key)` entry.
///
/// Unused lock slots are pruned when the last guard is dropped.
pub struct EntryGuard {
    service: String,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl EntryGuard {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let id = (std::mem::take(&mut self.service), std::mem::take(&mut self.key));
        self.locks
            .remove_if(&id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

// ---------------------------------------------------------------------------
// EntryStore
// ---------------------------------------------------------------------------

/// Durable mapping from `(service, key)` to encrypted entries.
///
/// Cheap to clone; clones share the connection and lock table.  All SQLite
/// work runs on the blocking pool via `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct EntryStore {
    conn: Arc<Mutex<Connection>>,
    locks: Arc<LockMap>,
}

impl EntryStore {
    /// Open (or create) an entry database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Persistence`] if the database cannot be opened
    /// or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "opening entry store");

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory store (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        tracing::debug!("opening in-memory entry store");
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;
             PRAGMA temp_store = MEMORY;",
        )?;
        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            locks: Arc::new(DashMap::new()),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        tracing::debug!("running entry store migrations");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entries (
                service        TEXT NOT NULL,
                key            TEXT NOT NULL,
                ciphertext     BLOB NOT NULL,
                access_control TEXT,
                accessible     TEXT NOT NULL,
                access_group   TEXT,
                biometry_set   TEXT,
                created_at     INTEGER NOT NULL,
                updated_at     INTEGER NOT NULL,
                PRIMARY KEY (service, key)
            );",
        )?;
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StorageError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }

    // -- Locking ------------------------------------------------------------

    /// Acquire exclusive write access to `(service, key)`.
    pub async fn lock(&self, service: &str, key: &str) -> EntryGuard {
        let id = (service.to_string(), key.to_string());
        let mutex = Arc::clone(self.locks.entry(id).or_default().value());
        let guard = mutex.lock_owned().await;

        EntryGuard {
            service: service.to_string(),
            key: key.to_string(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    // -- Reads --------------------------------------------------------------

    /// Fetch the stored entry for `(service, key)`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if no entry exists.
    pub async fn get(&self, service: &str, key: &str) -> Result<StoredEntry> {
        let (service, key) = (service.to_string(), key.to_string());
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT service, key, ciphertext, access_control, accessible,
                            access_group, biometry_set, created_at, updated_at
                     FROM entries WHERE service = ?1 AND key = ?2",
                    params![service, key],
                    EntryRow::from_row,
                )
                .optional()?;

            row.ok_or(StorageError::NotFound { service, key })?
                .into_entry()
        })
        .await
    }

    /// Keys stored under `service`, sorted.  Unknown services yield an empty
    /// list.  With `access_group`, only entries in that group are listed.
    pub async fn list_keys(&self, service: &str, access_group: Option<&str>) -> Result<Vec<String>> {
        let service = service.to_string();
        let access_group = access_group.map(str::to_string);
        let keys = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT key FROM entries
                     WHERE service = ?1 AND (?2 IS NULL OR access_group = ?2)
                     ORDER BY key",
                )?;
                let keys = stmt
                    .query_map(params![service, access_group], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<String>, _>>()?;
                Ok(keys)
            })
            .await?;

        tracing::debug!(count = keys.len(), "listed keys");
        Ok(keys)
    }

    /// Export every entry that may leave the device.
    ///
    /// `*ThisDeviceOnly` entries are never included.
    pub async fn export_backup(&self) -> Result<Vec<BackupRecord>> {
        let rows = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT service, key, ciphertext, access_control, accessible,
                            access_group, biometry_set, created_at, updated_at
                     FROM entries ORDER BY service, key",
                )?;
                let rows = stmt
                    .query_map([], EntryRow::from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut records = Vec::new();
        let mut skipped = 0usize;
        for row in rows {
            let entry = row.into_entry()?;
            if entry.policy.accessible.is_this_device_only() {
                skipped += 1;
                continue;
            }
            records.push(BackupRecord {
                ciphertext: BASE64.encode(&entry.ciphertext),
                service: entry.service,
                key: entry.key,
                access_control: entry.policy.access_control,
                accessible: entry.policy.accessible,
                access_group: entry.policy.access_group,
                created_at: entry.created_at,
                updated_at: entry.updated_at,
            });
        }

        tracing::info!(
            exported = records.len(),
            skipped_device_only = skipped,
            "exported backup"
        );
        Ok(records)
    }

    // -- Writes -------------------------------------------------------------

    /// Insert or replace the entry held by `entry` in one atomic statement.
    ///
    /// `created_at` survives replacement.
    pub async fn put(&self, entry: &EntryGuard, ciphertext: Vec<u8>, policy: EntryPolicy) -> Result<()> {
        let (service, key) = (entry.service.clone(), entry.key.clone());
        let now = Utc::now().timestamp_millis();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO entries (service, key, ciphertext, access_control, accessible,
                                      access_group, biometry_set, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT(service, key) DO UPDATE SET
                    ciphertext     = excluded.ciphertext,
                    access_control = excluded.access_control,
                    accessible     = excluded.accessible,
                    access_group   = excluded.access_group,
                    biometry_set   = excluded.biometry_set,
                    updated_at     = excluded.updated_at",
                params![
                    service,
                    key,
                    ciphertext,
                    policy.access_control.map(|ac| ac.as_str()),
                    policy.accessible.as_str(),
                    policy.access_group,
                    policy.biometry_set,
                    now,
                ],
            )?;
            Ok(())
        })
        .await?;

        tracing::info!(service = %entry.service, key = %entry.key, "stored entry");
        Ok(())
    }

    /// Delete the entry held by `entry`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if no entry exists.
    pub async fn delete(&self, entry: &EntryGuard) -> Result<()> {
        let (service, key) = (entry.service.clone(), entry.key.clone());
        self.with_conn(move |conn| {
            let rows = conn.execute(
                "DELETE FROM entries WHERE service = ?1 AND key = ?2",
                params![service, key],
            )?;
            if rows == 0 {
                return Err(StorageError::NotFound { service, key });
            }
            Ok(())
        })
        .await?;

        tracing::info!(service = %entry.service, key = %entry.key, "removed entry");
        Ok(())
    }

    /// Lock `(service, key)` and insert or replace it.
    pub async fn set(
        &self,
        service: &str,
        key: &str,
        ciphertext: Vec<u8>,
        policy: EntryPolicy,
    ) -> Result<()> {
        let entry = self.lock(service, key).await;
        self.put(&entry, ciphertext, policy).await
    }

    /// Lock `(service, key)` and delete it.
    pub async fn remove(&self, service: &str, key: &str) -> Result<()> {
        let entry = self.lock(service, key).await;
        self.delete(&entry).await
    }
}

// ---------------------------------------------------------------------------
// Internal row type (keeps rusqlite details out of the public types)
// ---------------------------------------------------------------------------

struct EntryRow {
    service: String,
    key: String,
    ciphertext: Vec<u8>,
    access_control: Option<String>,
    accessible: String,
    access_group: Option<String>,
    biometry_set: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl EntryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            service: row.get(0)?,
            key: row.get(1)?,
            ciphertext: row.get(2)?,
            access_control: row.get(3)?,
            accessible: row.get(4)?,
            access_group: row.get(5)?,
            biometry_set: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_entry(self) -> Result<StoredEntry> {
        let corrupt = |what: &str, e: StorageError| {
            StorageError::Internal(format!(
                "corrupt {what} for service={}, key={}: {e}",
                self.service, self.key
            ))
        };

        let access_control = self
            .access_control
            .as_deref()
            .map(str::parse::<AccessControl>)
            .transpose()
            .map_err(|e| corrupt("access_control", e))?;
        let accessible = self
            .accessible
            .parse::<Accessible>()
            .map_err(|e| corrupt("accessible", e))?;
        let timestamp = |what: &str, millis: i64| {
            DateTime::from_timestamp_millis(millis).ok_or_else(|| {
                StorageError::Internal(format!(
                    "corrupt {what} for service={}, key={}: {millis} is out of range",
                    self.service, self.key
                ))
            })
        };
        let created_at = timestamp("created_at", self.created_at)?;
        let updated_at = timestamp("updated_at", self.updated_at)?;

        Ok(StoredEntry {
            policy: EntryPolicy {
                access_control,
                accessible,
                access_group: self.access_group,
                biometry_set: self.biometry_set,
            },
            created_at,
            updated_at,
            service: self.service,
            key: self.key,
            ciphertext: self.ciphertext,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
