//! Long-term memory: one-sentence summaries stored with their embeddings.
//!
//! Records live in a single SQLite table; nearest-neighbour lookup is a
//! brute-force cosine scan, which is plenty for a single user's memories.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::embedding::Embedder;

/// A stored memory as exposed to callers (the embedding stays internal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Vector index of memory texts.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn count(&self) -> Result<usize>;
    async fn insert(&self, id: &str, text: &str, embedding: Vec<f32>) -> Result<()>;
    /// Texts of the `top_k` most similar records, best match first.
    async fn query(&self, embedding: Vec<f32>, top_k: usize) -> Result<Vec<String>>;
    async fn list(&self) -> Result<Vec<MemoryRecord>>;
    async fn get(&self, id: &str) -> Result<Option<MemoryRecord>>;
    /// Returns false when no record has this id.
    async fn update(&self, id: &str, text: &str, embedding: Vec<f32>) -> Result<bool>;
    /// Returns false when no record has this id.
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// Embed `text` and store it under a fresh id.
pub async fn remember(
    store: &dyn MemoryStore,
    embedder: &dyn Embedder,
    text: &str,
) -> Result<String> {
    let embedding = embedder
        .embed(text)
        .await
        .context("Failed to embed memory text")?;
    let id = uuid::Uuid::new_v4().to_string();
    store.insert(&id, text, embedding).await?;
    Ok(id)
}

/// Replace a record's text, re-embedding it. Returns false for an unknown id.
pub async fn revise(
    store: &dyn MemoryStore,
    embedder: &dyn Embedder,
    id: &str,
    text: &str,
) -> Result<bool> {
    let embedding = embedder
        .embed(text)
        .await
        .context("Failed to embed memory text")?;
    store.update(id, text, embedding).await
}

pub struct SqliteMemoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMemoryStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open memory database at {:?}", path))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                text TEXT NOT NULL,
                embedding BLOB NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run blocking SQLite work off the async executor.
    async fn with_conn<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| anyhow::anyhow!("Memory database lock poisoned: {}", e))?;
            work(&*guard)
        })
        .await
        .context("Memory store task failed")?
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    async fn insert(&self, id: &str, text: &str, embedding: Vec<f32>) -> Result<()> {
        let id = id.to_string();
        let text = text.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO memories (id, text, embedding, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, text, f32_vec_to_bytes(&embedding), Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("Failed to insert memory '{}'", id))?;
            Ok(())
        })
        .await
    }

    async fn query(&self, embedding: Vec<f32>, top_k: usize) -> Result<Vec<String>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT text, embedding FROM memories")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut scored: Vec<(f64, String)> = rows
                .into_iter()
                .filter_map(|(text, blob)| {
                    let stored = bytes_to_f32_vec(&blob);
                    if stored.len() != embedding.len() {
                        tracing::debug!(
                            "Skipping memory with {} dims (query has {})",
                            stored.len(),
                            embedding.len()
                        );
                        return None;
                    }
                    Some((cosine_similarity(&embedding, &stored), text))
                })
                .collect();

            scored.sort_by(|a, b| b.0.total_cmp(&a.0));
            Ok(scored.into_iter().take(top_k).map(|(_, text)| text).collect())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<MemoryRecord>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, text, created_at FROM memories ORDER BY created_at DESC")?;
            let records = stmt
                .query_map([], |row| {
                    Ok(MemoryRecord {
                        id: row.get(0)?,
                        text: row.get(1)?,
                        created_at: parse_rfc3339(row.get::<_, String>(2)?, 2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryRecord>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    "SELECT id, text, created_at FROM memories WHERE id = ?1",
                    [&id],
                    |row| {
                        Ok(MemoryRecord {
                            id: row.get(0)?,
                            text: row.get(1)?,
                            created_at: parse_rfc3339(row.get::<_, String>(2)?, 2)?,
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn update(&self, id: &str, text: &str, embedding: Vec<f32>) -> Result<bool> {
        let id = id.to_string();
        let text = text.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE memories SET text = ?1, embedding = ?2 WHERE id = ?3",
                params![text, f32_vec_to_bytes(&embedding), id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute("DELETE FROM memories WHERE id = ?1", [&id])?;
            Ok(changed > 0)
        })
        .await
    }
}

fn f32_vec_to_bytes(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_f32_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity; 0.0 for mismatched, empty or zero-magnitude vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-12 {
        0.0
    } else {
        dot / denom
    }
}

fn parse_rfc3339(
    value: String,
    column: usize,
) -> std::result::Result<DateTime<Utc>, rusqlite::Error> {
    value.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A store whose backend is unreachable: every call fails.
    pub(crate) struct DownStore;

    #[async_trait]
    impl MemoryStore for DownStore {
        async fn count(&self) -> Result<usize> {
            anyhow::bail!("memory database unavailable")
        }
        async fn insert(&self, _id: &str, _text: &str, _embedding: Vec<f32>) -> Result<()> {
            anyhow::bail!("memory database unavailable")
        }
        async fn query(&self, _embedding: Vec<f32>, _top_k: usize) -> Result<Vec<String>> {
            anyhow::bail!("memory database unavailable")
        }
        async fn list(&self) -> Result<Vec<MemoryRecord>> {
            anyhow::bail!("memory database unavailable")
        }
        async fn get(&self, _id: &str) -> Result<Option<MemoryRecord>> {
            anyhow::bail!("memory database unavailable")
        }
        async fn update(&self, _id: &str, _text: &str, _embedding: Vec<f32>) -> Result<bool> {
            anyhow::bail!("memory database unavailable")
        }
        async fn delete(&self, _id: &str) -> Result<bool> {
            anyhow::bail!("memory database unavailable")
        }
    }
}
