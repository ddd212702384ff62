//! SQLite persistence for the gallery and recorded attendance.

use chrono::{DateTime, Utc};
use rollcall_core::{AttendanceEvent, Embedding, GalleryEntry, PersonId, Reference, SessionWindow};
use rusqlite::params;
use std::collections::VecDeque;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("cannot create {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS gallery_references (
    person_id     TEXT    NOT NULL,
    position      INTEGER NOT NULL,
    embedding     BLOB    NOT NULL,
    model_version TEXT,
    label         TEXT,
    enrolled_at   TEXT    NOT NULL,
    created_at    TEXT    NOT NULL,
    PRIMARY KEY (person_id, position)
);
CREATE TABLE IF NOT EXISTS attendance_events (
    person_id      TEXT    NOT NULL,
    session_window TEXT    NOT NULL,
    timestamp_ms   INTEGER NOT NULL,
    PRIMARY KEY (person_id, session_window)
);
CREATE INDEX IF NOT EXISTS idx_attendance_window ON attendance_events(session_window, timestamp_ms);
";

/// Async handle to the database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path).await?;
        conn.call(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
            Ok(())
        })
        .await?;
        let store = Self { conn };
        store.init_schema().await?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(store)
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Connection::open_in_memory().await?,
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Drop every table so later writes fail.
    #[cfg(test)]
    pub async fn drop_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch("DROP TABLE gallery_references; DROP TABLE attendance_events;")?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Replace every stored reference for `entry.person_id` with `entry`'s.
    pub async fn save_entry(&self, entry: GalleryEntry) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let person = entry.person_id.as_str();
                tx.execute("DELETE FROM gallery_references WHERE person_id = ?1", params![person])?;
                let created_at = entry.created_at.to_rfc3339();
                for (position, reference) in entry.references.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO gallery_references
                         (person_id, position, embedding, model_version, label, enrolled_at, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            person,
                            position as i64,
                            encode_embedding(&reference.embedding.values),
                            reference.embedding.model_version,
                            reference.label,
                            reference.enrolled_at.to_rfc3339(),
                            created_at,
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Delete a person's references. Returns whether any row was removed.
    pub async fn delete_person(&self, person_id: &PersonId) -> Result<bool, StoreError> {
        let person = person_id.as_str().to_string();
        let removed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute("DELETE FROM gallery_references WHERE person_id = ?1", params![person])?)
            })
            .await?;
        Ok(removed > 0)
    }

    /// Every stored gallery entry, references oldest first.
    ///
    /// Rows that cannot be decoded are skipped with a warning.
    pub async fn load_gallery(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT person_id, embedding, model_version, label, enrolled_at, created_at
                     FROM gallery_references ORDER BY person_id, position",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(StoredReference {
                            person_id: row.get(0)?,
                            embedding: row.get(1)?,
                            model_version: row.get(2)?,
                            label: row.get(3)?,
                            enrolled_at: row.get(4)?,
                            created_at: row.get(5)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut entries: Vec<GalleryEntry> = Vec::new();
        for row in rows {
            let Some(values) = decode_embedding(&row.embedding) else {
                tracing::warn!(person = %row.person_id, bytes = row.embedding.len(), "skipping malformed embedding blob");
                continue;
            };
            let embedding = Embedding {
                values,
                timestamp_ms: 0,
                model_version: row.model_version,
            };
            let reference = Reference {
                embedding,
                label: row.label,
                enrolled_at: parse_time(&row.enrolled_at),
            };
            match entries.last_mut() {
                Some(entry) if entry.person_id.as_str() == row.person_id => {
                    entry.references.push_back(reference);
                    continue;
                }
                _ => {}
            }
            entries.push(GalleryEntry {
                person_id: PersonId::new(row.person_id),
                references: VecDeque::from([reference]),
                created_at: parse_time(&row.created_at),
            });
        }
        Ok(entries)
    }

    /// Persist an event. Returns false if the person was already recorded in
    /// that window.
    pub async fn record_event(&self, event: &AttendanceEvent) -> Result<bool, StoreError> {
        let person = event.person_id.as_str().to_string();
        let window = event.window.as_str().to_string();
        let timestamp_ms = event.timestamp_ms as i64;
        let inserted = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT OR IGNORE INTO attendance_events (person_id, session_window, timestamp_ms)
                     VALUES (?1, ?2, ?3)",
                    params![person, window, timestamp_ms],
                )?)
            })
            .await?;
        Ok(inserted > 0)
    }

    /// Events recorded in `window`, earliest first.
    pub async fn events_in_window(&self, window: &SessionWindow) -> Result<Vec<AttendanceEvent>, StoreError> {
        let window_id = window.as_str().to_string();
        let rows: Vec<(String, i64)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT person_id, timestamp_ms FROM attendance_events
                     WHERE session_window = ?1 ORDER BY timestamp_ms, person_id",
                )?;
                let rows = stmt
                    .query_map(params![window_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|(person_id, timestamp_ms)| AttendanceEvent {
                person_id: PersonId::new(person_id),
                timestamp_ms: timestamp_ms.max(0) as u64,
                window: window.clone(),
            })
            .collect())
    }
}

struct StoredReference {
    person_id: String,
    embedding: Vec<u8>,
    model_version: Option<String>,
    label: Option<String>,
    enrolled_at: String,
    created_at: String,
}

fn encode_embedding(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            tracing::warn!(value = s, error = %e, "unparseable stored timestamp; using now");
            Utc::now()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(person: &str, vectors: &[[f32; 3]]) -> GalleryEntry {
        GalleryEntry {
            person_id: PersonId::new(person),
            references: vectors
                .iter()
                .map(|v| Reference::new(Embedding::new(v.to_vec(), 0), Some("front".into())))
                .collect(),
            created_at: Utc::now(),
        }
    }

    fn event(person: &str, ts: u64, window: &str) -> AttendanceEvent {
        AttendanceEvent {
            person_id: PersonId::new(person),
            timestamp_ms: ts,
            window: SessionWindow::new(window),
        }
    }

    #[test]
    fn test_embedding_blob_encoding() {
        let values = vec![0.25f32, -1.5, 3.0];
        assert_eq!(decode_embedding(&encode_embedding(&values)), Some(values));
        assert_eq!(decode_embedding(&[1, 2, 3]), None);
        assert_eq!(decode_embedding(&[]), None);
    }

    #[tokio::test]
    async fn test_gallery_persists_in_order() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .save_entry(entry("bob", &[[0.0, 1.0, 0.0]]))
            .await
            .unwrap();
        store
            .save_entry(entry("alice", &[[1.0, 0.0, 0.0], [0.9, 0.1, 0.0]]))
            .await
            .unwrap();

        let loaded = store.load_gallery().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].person_id.as_str(), "alice");
        assert_eq!(loaded[0].references.len(), 2);
        assert_eq!(loaded[0].references[1].embedding.values, vec![0.9, 0.1, 0.0]);
        assert_eq!(loaded[0].references[0].label.as_deref(), Some("front"));
        assert_eq!(loaded[1].person_id.as_str(), "bob");
    }

    #[tokio::test]
    async fn test_save_entry_replaces_previous_references() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .save_entry(entry("alice", &[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]))
            .await
            .unwrap();
        store.save_entry(entry("alice", &[[0.0, 0.0, 1.0]])).await.unwrap();

        let loaded = store.load_gallery().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].references.len(), 1);
        assert_eq!(loaded[0].references[0].embedding.values, vec![0.0, 0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_delete_person() {
        let store = Store::open_in_memory().await.unwrap();
        store.save_entry(entry("alice", &[[1.0, 0.0, 0.0]])).await.unwrap();
        assert!(store.delete_person(&PersonId::new("alice")).await.unwrap());
        assert!(!store.delete_person(&PersonId::new("alice")).await.unwrap());
        assert!(store.load_gallery().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_event_once_per_window() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(store.record_event(&event("alice", 100, "2026-10-16")).await.unwrap());
        assert!(!store.record_event(&event("alice", 200, "2026-10-16")).await.unwrap());
        assert!(store.record_event(&event("alice", 300, "2026-10-17")).await.unwrap());
        assert!(store.record_event(&event("bob", 50, "2026-10-16")).await.unwrap());

        let day = SessionWindow::new("2026-10-16");
        let events = store.events_in_window(&day).await.unwrap();
        let people: Vec<&str> = events.iter().map(|e| e.person_id.as_str()).collect();
        assert_eq!(people, vec!["bob", "alice"]);
        assert_eq!(events[1].timestamp_ms, 100);
    }

    #[tokio::test]
    async fn test_open_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/rollcall.db");
        let store = Store::open(&path).await.unwrap();
        store.record_event(&event("alice", 1, "w")).await.unwrap();
        drop(store);

        let reopened = Store::open(&path).await.unwrap();
        assert_eq!(reopened.events_in_window(&SessionWindow::new("w")).await.unwrap().len(), 1);
    }
}
