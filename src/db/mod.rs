use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// Durable part of a managed instance. Connection and protection state are
/// never persisted.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub id: String,
    pub name: String,
    pub phone_number: Option<String>,
    pub created_at: String,
}

/// SQLite-backed registry of managed instances.
pub struct Registry {
    conn: Connection,
}

impl Registry {
    /// Open (or create) the registry database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open registry DB: {}", db_path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("Failed to set SQLite pragmas")?;

        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Open an in-memory registry (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                phone_number TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_instances_name ON instances(name);",
        )
        .context("Failed to initialize registry schema")?;
        Ok(())
    }

    /// Register a new instance.
    pub fn create_instance(&self, id: &str, name: &str) -> Result<InstanceRecord> {
        self.conn
            .execute(
                "INSERT INTO instances (id, name) VALUES (?1, ?2)",
                params![id, name],
            )
            .with_context(|| format!("Failed to create instance '{id}'"))?;
        self.get_instance(id)?
            .ok_or_else(|| anyhow::anyhow!("Instance '{id}' vanished after insert"))
    }

    pub fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>> {
        self.conn
            .query_row(
                "SELECT id, name, phone_number, created_at FROM instances WHERE id = ?1",
                params![id],
                Self::row_to_record,
            )
            .optional()
            .context("Failed to query instance by ID")
    }

    pub fn list_instances(&self) -> Result<Vec<InstanceRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, phone_number, created_at FROM instances ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([], Self::row_to_record)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list instances")
    }

    /// Remember the phone number learned on first connect.
    pub fn update_phone(&self, id: &str, phone_number: &str) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE instances SET phone_number = ?1 WHERE id = ?2",
            params![phone_number, id],
        )?;
        if changed == 0 {
            anyhow::bail!("No instance with id '{id}'");
        }
        Ok(())
    }

    /// Returns `true` if a row was removed.
    pub fn delete_instance(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM instances WHERE id = ?1", params![id])
            .with_context(|| format!("Failed to delete instance '{id}'"))?;
        Ok(changed > 0)
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstanceRecord> {
        Ok(InstanceRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            phone_number: row.get(2)?,
            created_at: row.get(3)?,
        })
    }
}
