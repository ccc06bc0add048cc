use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rand::{distributions::Alphanumeric, Rng};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

use crate::errors::{Operation, StoreError};
use crate::models::{
    Application, ApplicationEvent, ApplicationStatus, NewApplication, Note, EVENT_APPLIED,
    EVENT_STATUS_CHANGED,
};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

const ID_LEN: usize = 20;

const APP_COLUMNS: &str = "id, user_id, company_name, title, source_name, applied_at, status, \
     location, salary, url, tags, created_at, updated_at";

/// Embedded document store. Applications are top-level documents owned by a
/// user; notes and events are sub-collections of an application. Every call
/// carries the caller's user id and is checked against the ownership rules
/// before touching data.
pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn default_path() -> PathBuf {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "jobtrack") {
            proj_dirs.data_dir().join("jobtrack.db")
        } else {
            PathBuf::from("jobtrack.db")
        }
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS applications (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                company_name TEXT NOT NULL,
                title TEXT NOT NULL,
                source_name TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'APPLIED' CHECK (status IN (
                    'APPLIED', 'VIEWED', 'PHONE_SCREEN', 'INTERVIEW', 'OFFER', 'REJECTED', 'WITHDRAWN'
                )),
                location TEXT,
                salary TEXT,
                url TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS notes (
                id TEXT PRIMARY KEY,
                application_id TEXT NOT NULL REFERENCES applications(id),
                text TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                application_id TEXT NOT NULL REFERENCES applications(id),
                type TEXT NOT NULL,
                occurred_at TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            );

            CREATE INDEX IF NOT EXISTS idx_applications_user ON applications(user_id);
            CREATE INDEX IF NOT EXISTS idx_notes_application ON notes(application_id);
            CREATE INDEX IF NOT EXISTS idx_events_application ON events(application_id);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='applications'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!(
                "Database not initialized. Run 'jobtrack init' first."
            ));
        }
        Ok(())
    }

    // --- Rules ---

    fn owner_of(&self, application_id: &str) -> StoreResult<Option<String>> {
        let owner = self
            .conn
            .query_row(
                "SELECT user_id FROM applications WHERE id = ?1",
                [application_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner)
    }

    /// Resolves to Ok(true) when the caller owns the application, Ok(false)
    /// when it does not exist.
    fn check_owner(
        &self,
        caller: Option<&str>,
        operation: Operation,
        application_id: &str,
        path: &str,
    ) -> StoreResult<bool> {
        let Some(uid) = caller else {
            return Err(StoreError::denied(operation, path));
        };
        match self.owner_of(application_id)? {
            None => Ok(false),
            Some(owner) if owner == uid => Ok(true),
            Some(_) => Err(StoreError::denied(operation, path)),
        }
    }

    fn require_owner(
        &self,
        caller: Option<&str>,
        operation: Operation,
        application_id: &str,
        path: &str,
    ) -> StoreResult<()> {
        if self.check_owner(caller, operation, application_id, path)? {
            Ok(())
        } else {
            Err(StoreError::NotFound(application_path(application_id)))
        }
    }

    // --- Application operations ---

    /// Lists applications whose owner is `user_id`. Only the owner may run
    /// this query.
    pub fn list_applications(
        &self,
        caller: Option<&str>,
        user_id: &str,
    ) -> StoreResult<Vec<Application>> {
        if caller != Some(user_id) {
            return Err(StoreError::denied(Operation::List, "applications"));
        }

        let sql = format!(
            "SELECT {APP_COLUMNS} FROM applications WHERE user_id = ?1 ORDER BY applied_at DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([user_id], Self::row_to_application)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Shallow read: notes and events are left empty.
    pub fn get_application(
        &self,
        caller: Option<&str>,
        id: &str,
    ) -> StoreResult<Option<Application>> {
        let path = application_path(id);
        if !self.check_owner(caller, Operation::Get, id, &path)? {
            return Ok(None);
        }
        let sql = format!("SELECT {APP_COLUMNS} FROM applications WHERE id = ?1");
        let app = self
            .conn
            .query_row(&sql, [id], Self::row_to_application)
            .optional()?;
        Ok(app)
    }

    /// Creates the application together with its `applied` event and the
    /// optional first note in one transaction. Returns the new id.
    pub fn create_application(
        &self,
        caller: Option<&str>,
        new: &NewApplication,
    ) -> StoreResult<String> {
        if caller != Some(new.user_id.as_str()) {
            return Err(StoreError::denied_with(
                Operation::Create,
                format!("applications/{}", new.user_id),
                json!({
                    "userId": new.user_id,
                    "companyName": new.company_name,
                    "title": new.title,
                    "sourceName": new.source_name,
                    "status": new.status,
                }),
            ));
        }

        let now = to_timestamp(Utc::now());
        let applied_at = to_timestamp(new.applied_at);
        let id = generate_id();
        let tags = serde_json::to_string(&new.tags)?;

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO applications (id, user_id, company_name, title, source_name, applied_at,
                                       status, location, salary, url, tags, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
            params![
                id,
                new.user_id,
                new.company_name,
                new.title,
                new.source_name,
                applied_at,
                new.status.as_str(),
                new.location,
                new.salary,
                new.url,
                tags,
                now,
            ],
        )?;
        tx.execute(
            "INSERT INTO events (id, application_id, type, occurred_at, metadata)
             VALUES (?1, ?2, ?3, ?4, '{}')",
            params![generate_id(), id, EVENT_APPLIED, applied_at],
        )?;
        if let Some(text) = &new.note {
            tx.execute(
                "INSERT INTO notes (id, application_id, text, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![generate_id(), id, text, now],
            )?;
        }
        tx.commit()?;

        Ok(id)
    }

    /// Removes the application and both sub-collections atomically. Returns
    /// false when there was nothing to delete.
    pub fn delete_application(&self, caller: Option<&str>, id: &str) -> StoreResult<bool> {
        let path = application_path(id);
        if !self.check_owner(caller, Operation::Delete, id, &path)? {
            return Ok(false);
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM notes WHERE application_id = ?1", [id])?;
        tx.execute("DELETE FROM events WHERE application_id = ?1", [id])?;
        tx.execute("DELETE FROM applications WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok(true)
    }

    /// Sets a new status and records a `status_changed` event. Returns None
    /// when the application already had that status.
    pub fn update_status(
        &self,
        caller: Option<&str>,
        id: &str,
        status: ApplicationStatus,
    ) -> StoreResult<Option<ApplicationEvent>> {
        let path = application_path(id);
        let tx = self.conn.unchecked_transaction()?;
        self.require_owner(caller, Operation::Update, id, &path)?;

        let current: String = tx
            .query_row(
                "SELECT status FROM applications WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;
        if current == status.as_str() {
            return Ok(None);
        }

        let now = Utc::now();
        let mut metadata = Map::new();
        metadata.insert("from".to_string(), Value::String(current));
        metadata.insert("to".to_string(), Value::String(status.as_str().to_string()));
        let event = ApplicationEvent {
            id: generate_id(),
            application_id: id.to_string(),
            event_type: EVENT_STATUS_CHANGED.to_string(),
            occurred_at: now,
            metadata,
        };

        tx.execute(
            "UPDATE applications SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), to_timestamp(now), id],
        )?;
        insert_event(&tx, &event)?;
        tx.commit()?;

        Ok(Some(event))
    }

    // --- Sub-collections ---

    pub fn add_event(
        &self,
        caller: Option<&str>,
        application_id: &str,
        event_type: &str,
        occurred_at: DateTime<Utc>,
        metadata: Map<String, Value>,
    ) -> StoreResult<ApplicationEvent> {
        let path = format!("{}/events", application_path(application_id));
        self.require_owner(caller, Operation::Create, application_id, &path)?;

        let event_type = event_type.trim();
        if event_type.is_empty() {
            return Err(StoreError::Invalid("Event type is required.".to_string()));
        }

        let event = ApplicationEvent {
            id: generate_id(),
            application_id: application_id.to_string(),
            event_type: event_type.to_string(),
            occurred_at,
            metadata,
        };

        let tx = self.conn.unchecked_transaction()?;
        insert_event(&tx, &event)?;
        touch(&tx, application_id)?;
        tx.commit()?;

        Ok(event)
    }

    pub fn add_note(
        &self,
        caller: Option<&str>,
        application_id: &str,
        text: &str,
    ) -> StoreResult<Note> {
        let path = format!("{}/notes", application_path(application_id));
        self.require_owner(caller, Operation::Create, application_id, &path)?;

        let text = text.trim();
        if text.is_empty() {
            return Err(StoreError::Invalid("Note text cannot be empty.".to_string()));
        }

        let note = Note {
            id: generate_id(),
            application_id: application_id.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
        };

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO notes (id, application_id, text, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![note.id, note.application_id, note.text, to_timestamp(note.created_at)],
        )?;
        touch(&tx, application_id)?;
        tx.commit()?;

        Ok(note)
    }

    pub fn list_notes(&self, caller: Option<&str>, application_id: &str) -> StoreResult<Vec<Note>> {
        let path = format!("{}/notes", application_path(application_id));
        if !self.check_owner(caller, Operation::List, application_id, &path)? {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, application_id, text, created_at FROM notes
             WHERE application_id = ?1 ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map([application_id], Self::row_to_note)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_events(
        &self,
        caller: Option<&str>,
        application_id: &str,
    ) -> StoreResult<Vec<ApplicationEvent>> {
        let path = format!("{}/events", application_path(application_id));
        if !self.check_owner(caller, Operation::List, application_id, &path)? {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, application_id, type, occurred_at, metadata FROM events
             WHERE application_id = ?1 ORDER BY occurred_at, rowid",
        )?;
        let rows = stmt.query_map([application_id], Self::row_to_event)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Every event across the user's applications, oldest first.
    pub fn list_user_events(
        &self,
        caller: Option<&str>,
        user_id: &str,
    ) -> StoreResult<Vec<ApplicationEvent>> {
        if caller != Some(user_id) {
            return Err(StoreError::denied(Operation::List, "applications/*/events"));
        }

        let mut stmt = self.conn.prepare(
            "SELECT e.id, e.application_id, e.type, e.occurred_at, e.metadata
             FROM events e
             JOIN applications a ON e.application_id = a.id
             WHERE a.user_id = ?1
             ORDER BY e.occurred_at, e.rowid",
        )?;
        let rows = stmt.query_map([user_id], Self::row_to_event)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // --- Row mapping ---

    fn row_to_application(row: &rusqlite::Row) -> rusqlite::Result<Application> {
        let status: String = row.get(6)?;
        let status = status
            .parse::<ApplicationStatus>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, e.into()))?;
        let tags: String = row.get(10)?;
        let tags: Vec<String> = serde_json::from_str(&tags)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(e)))?;

        Ok(Application {
            id: row.get(0)?,
            user_id: row.get(1)?,
            company_name: row.get(2)?,
            title: row.get(3)?,
            source_name: row.get(4)?,
            applied_at: timestamp_column(row, 5)?,
            status,
            location: row.get(7)?,
            salary: row.get(8)?,
            url: row.get(9)?,
            tags,
            created_at: timestamp_column(row, 11)?,
            updated_at: timestamp_column(row, 12)?,
            notes: Vec::new(),
            events: Vec::new(),
        })
    }

    fn row_to_note(row: &rusqlite::Row) -> rusqlite::Result<Note> {
        Ok(Note {
            id: row.get(0)?,
            application_id: row.get(1)?,
            text: row.get(2)?,
            created_at: timestamp_column(row, 3)?,
        })
    }

    fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<ApplicationEvent> {
        let metadata: String = row.get(4)?;
        let metadata: Map<String, Value> = serde_json::from_str(&metadata)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
        Ok(ApplicationEvent {
            id: row.get(0)?,
            application_id: row.get(1)?,
            event_type: row.get(2)?,
            occurred_at: timestamp_column(row, 3)?,
            metadata,
        })
    }
}

// --- Helpers ---

pub fn application_path(id: &str) -> String {
    format!("applications/{}", id)
}

/// 20 alphanumeric characters, the shape of hosted document-store ids.
pub fn generate_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LEN)
        .map(char::from)
        .collect()
}

// Fixed-width UTC so lexical order in SQL matches chronological order.
fn to_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp '{}'", raw))
}

fn timestamp_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn insert_event(conn: &Connection, event: &ApplicationEvent) -> StoreResult<()> {
    let metadata = serde_json::to_string(&event.metadata)?;
    conn.execute(
        "INSERT INTO events (id, application_id, type, occurred_at, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            event.id,
            event.application_id,
            event.event_type,
            to_timestamp(event.occurred_at),
            metadata
        ],
    )?;
    Ok(())
}

fn touch(conn: &Connection, application_id: &str) -> StoreResult<()> {
    conn.execute(
        "UPDATE applications SET updated_at = ?1 WHERE id = ?2",
        params![to_timestamp(Utc::now()), application_id],
    )?;
    Ok(())
}
