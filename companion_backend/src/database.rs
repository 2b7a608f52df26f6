use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use crate::llm_client::ChatMessage;

/// Row of the saved-chats listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub id: i64,
    pub title: String,
}

/// A saved conversation as returned to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTranscript {
    pub messages: Vec<ChatMessage>,
    pub persona_id: Option<String>,
}

pub struct ChatDatabase {
    conn: Mutex<Connection>,
}

impl ChatDatabase {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open chat database at {:?}", path))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(columns.iter().any(|name| name == column))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS chats (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                messages TEXT NOT NULL,
                persona_id TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )"#,
            [],
        )?;

        // Databases from before personas were introduced lack this column
        if !Self::table_has_column(&conn, "chats", "persona_id")? {
            conn.execute("ALTER TABLE chats ADD COLUMN persona_id TEXT", [])?;
        }
        Ok(())
    }

    /// Newest first.
    pub fn list_chats(&self) -> Result<Vec<ChatSummary>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT id, title FROM chats ORDER BY created_at DESC, id DESC")?;
        let chats = stmt
            .query_map([], |row| {
                Ok(ChatSummary {
                    id: row.get(0)?,
                    title: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(chats)
    }

    pub fn create_chat(
        &self,
        title: &str,
        messages: &[ChatMessage],
        persona_id: Option<&str>,
    ) -> Result<i64> {
        let messages_json = serde_json::to_string(messages)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO chats (title, messages, persona_id) VALUES (?1, ?2, ?3)",
            params![title, messages_json, persona_id],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_chat(&self, id: i64) -> Result<Option<ChatTranscript>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT messages, persona_id FROM chats WHERE id = ?1",
                [id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;

        match row {
            Some((messages_json, persona_id)) => {
                let messages = serde_json::from_str(&messages_json)
                    .with_context(|| format!("Chat {} has unreadable messages", id))?;
                Ok(Some(ChatTranscript {
                    messages,
                    persona_id,
                }))
            }
            None => Ok(None),
        }
    }

    /// Returns false when the chat does not exist.
    pub fn update_chat(
        &self,
        id: i64,
        messages: &[ChatMessage],
        persona_id: Option<&str>,
    ) -> Result<bool> {
        let messages_json = serde_json::to_string(messages)?;
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE chats SET messages = ?1, persona_id = ?2 WHERE id = ?3",
            params![messages_json, persona_id, id],
        )?;
        Ok(changed > 0)
    }

    /// Returns false when the chat does not exist.
    pub fn delete_chat(&self, id: i64) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute("DELETE FROM chats WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }
}
