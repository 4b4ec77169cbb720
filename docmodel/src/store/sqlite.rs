use super::embedded::{check_precondition, resolve_write, Backend, EmbeddedStore, Precondition, StoredDocument};
use super::{PendingWrite, StoreConfig};
use crate::document::Fields;
use crate::error::{DocModelError, Result};
use crate::path::DocPath;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;

/// Columns of one `documents` row before decoding.
type Row = (String, String, String, String, i64);

/// Backend that persists documents in a single SQLite database.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let backend = SqliteBackend {
            conn: Mutex::new(conn),
        };
        backend.initialize_tables()?;
        log::debug!("Opened document store at {}", path.display());
        Ok(backend)
    }

    /// Open a throwaway in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let backend = SqliteBackend {
            conn: Mutex::new(conn),
        };
        backend.initialize_tables()?;
        Ok(backend)
    }

    fn initialize_tables(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS documents (
                path TEXT PRIMARY KEY,
                parent TEXT NOT NULL,
                id TEXT NOT NULL,
                data_json TEXT NOT NULL,
                create_time TEXT NOT NULL,
                update_time TEXT NOT NULL,
                version INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_documents_parent ON documents(parent);

            CREATE TABLE IF NOT EXISTS store_meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            INSERT OR IGNORE INTO store_meta (key, value) VALUES ('version', 0);
            ",
        )?;
        Ok(())
    }

    /// Number of stored documents across all collections.
    pub fn document_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn read_row(conn: &Connection, path: &DocPath) -> Result<Option<StoredDocument>> {
    let row: Option<Row> = conn
        .query_row(
            "SELECT path, data_json, create_time, update_time, version FROM documents WHERE path = ?1",
            params![path.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .optional()?;
    row.map(decode_row).transpose().map(|doc| doc.map(|(_, doc)| doc))
}

fn decode_row((path, data_json, create_time, update_time, version): Row) -> Result<(DocPath, StoredDocument)> {
    let fields: Fields = serde_json::from_str(&data_json)?;
    Ok((
        DocPath::parse(&path)?,
        StoredDocument {
            fields,
            create_time: parse_time(&create_time)?,
            update_time: parse_time(&update_time)?,
            version: version as u64,
        },
    ))
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|e| DocModelError::Store(format!("Corrupt timestamp '{value}': {e}")))
}

impl Backend for SqliteBackend {
    fn read(&self, path: &DocPath) -> Result<Option<StoredDocument>> {
        read_row(&self.conn.lock(), path)
    }

    fn list(&self, collection: &DocPath) -> Result<Vec<(DocPath, StoredDocument)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT path, data_json, create_time, update_time, version FROM documents WHERE parent = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![collection.to_string()], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(decode_row(row?)?);
        }
        Ok(docs)
    }

    fn apply(&self, writes: &[PendingWrite], preconditions: &[Precondition]) -> Result<Vec<DocPath>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for precondition in preconditions {
            check_precondition(read_row(&tx, &precondition.path)?.as_ref(), precondition)?;
        }

        let mut version: i64 =
            tx.query_row("SELECT value FROM store_meta WHERE key = 'version'", [], |row| row.get(0))?;
        let now = Utc::now();
        let mut staged: BTreeMap<DocPath, Option<StoredDocument>> = BTreeMap::new();
        let mut changed = Vec::new();

        for write in writes {
            let path = write.path();
            let existing = match staged.get(path) {
                Some(doc) => doc.clone(),
                None => read_row(&tx, path)?,
            };
            version += 1;
            let next = resolve_write(existing.as_ref(), write, version as u64, now)?;

            match &next {
                Some(doc) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO documents (path, parent, id, data_json, create_time, update_time, version)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            path.to_string(),
                            path.parent().unwrap_or_default().to_string(),
                            path.id().unwrap_or_default(),
                            serde_json::to_string(&doc.fields)?,
                            doc.create_time.to_rfc3339(),
                            doc.update_time.to_rfc3339(),
                            doc.version as i64,
                        ],
                    )?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM documents WHERE path = ?1",
                        params![path.to_string()],
                    )?;
                }
            }

            staged.insert(path.clone(), next);
            if !changed.contains(path) {
                changed.push(path.clone());
            }
        }

        tx.execute(
            "UPDATE store_meta SET value = ?1 WHERE key = 'version'",
            params![version],
        )?;
        tx.commit()?;
        Ok(changed)
    }
}

/// Store persisted to SQLite.
pub type SqliteStore = EmbeddedStore<SqliteBackend>;

impl EmbeddedStore<SqliteBackend> {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    pub fn open_with_config(path: &Path, config: StoreConfig) -> Result<Self> {
        EmbeddedStore::with_backend(SqliteBackend::open(path)?, config)
    }

    pub fn open_in_memory() -> Result<Self> {
        EmbeddedStore::with_backend(SqliteBackend::open_in_memory()?, StoreConfig::default())
    }
}
