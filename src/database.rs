use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
    System,
}

impl TurnRole {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
            TurnRole::System => "system",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "assistant" => TurnRole::Assistant,
            "system" => TurnRole::System,
            _ => TurnRole::User,
        }
    }
}

/// One message in a chat. `sequence` defines the total order within the chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub chat_id: String,
    pub role: TurnRole,
    pub content: String,
    pub sequence: i64,
    pub summarized: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Next sequence number to hand out. Never decremented.
    pub next_sequence: i64,
}

/// Rolling-summary state for one chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMemory {
    pub chat_id: String,
    pub summary_text: String,
    pub summarized_turn_count: usize,
    pub unsummarized_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// Audit record of a knowledge chunk that fed an assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnReference {
    pub turn_id: String,
    pub source_id: String,
    pub score: f32,
}

pub struct ChatDatabase {
    conn: Mutex<Connection>,
}

const TURN_COLUMNS: &str = "id, chat_id, role, content, sequence, summarized, created_at";

impl ChatDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    /// Create the database schema
    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                next_sequence INTEGER NOT NULL DEFAULT 1
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS turns (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                summarized INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE(chat_id, sequence)
            )"#,
            [],
        )?;

        // Active-window reads filter on the flag and order by sequence
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_turns_chat_summarized ON turns(chat_id, summarized, sequence)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS chat_memory (
                chat_id TEXT PRIMARY KEY,
                summary_text TEXT NOT NULL DEFAULT '',
                summarized_turn_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS turn_references (
                turn_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                source_id TEXT NOT NULL,
                score REAL NOT NULL,
                PRIMARY KEY (turn_id, position)
            )"#,
            [],
        )?;

        Ok(())
    }

    // ========================================================================
    // Chats
    // ========================================================================

    /// Create a chat together with its empty rolling summary.
    pub fn create_chat(&self, title: Option<&str>) -> Result<Chat> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let title = title
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Chat {}", now.format("%Y-%m-%d %H:%M")));

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO chats (id, title, created_at, updated_at, next_sequence)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![id, title, now_str.clone(), now_str.clone()],
        )?;
        tx.execute(
            "INSERT INTO chat_memory (chat_id, summary_text, summarized_turn_count, updated_at)
             VALUES (?1, '', 0, ?2)",
            params![id, now_str],
        )?;
        tx.commit()?;

        Ok(Chat {
            id,
            title,
            created_at: now,
            updated_at: now,
            next_sequence: 1,
        })
    }

    pub fn get_chat(&self, chat_id: &str) -> Result<Option<Chat>> {
        let conn = self.lock_conn()?;
        let chat = conn
            .query_row(
                "SELECT id, title, created_at, updated_at, next_sequence FROM chats WHERE id = ?1",
                [chat_id],
                chat_from_row,
            )
            .optional()?;
        Ok(chat)
    }

    /// List chats, newest first.
    pub fn list_chats(&self, limit: usize) -> Result<Vec<Chat>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, created_at, updated_at, next_sequence FROM chats
             ORDER BY created_at DESC
             LIMIT ?1",
        )?;
        let chats = stmt
            .query_map([limit], chat_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(chats)
    }

    pub fn rename_chat(&self, chat_id: &str, title: &str) -> Result<Option<Chat>> {
        {
            let conn = self.lock_conn()?;
            let updated = conn.execute(
                "UPDATE chats SET title = ?2, updated_at = ?3 WHERE id = ?1",
                params![chat_id, title.trim(), Utc::now().to_rfc3339()],
            )?;
            if updated == 0 {
                return Ok(None);
            }
        }
        self.get_chat(chat_id)
    }

    /// Delete a chat, its turns, its summary and the turns' reference records.
    pub fn delete_chat(&self, chat_id: &str) -> Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM turn_references WHERE turn_id IN (SELECT id FROM turns WHERE chat_id = ?1)",
            [chat_id],
        )?;
        tx.execute("DELETE FROM turns WHERE chat_id = ?1", [chat_id])?;
        tx.execute("DELETE FROM chat_memory WHERE chat_id = ?1", [chat_id])?;
        let deleted = tx.execute("DELETE FROM chats WHERE id = ?1", [chat_id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    // ========================================================================
    // Turns
    // ========================================================================

    /// Append a turn with the chat's next sequence number.
    ///
    /// Returns `None` when the chat does not exist.
    pub fn append_turn(&self, chat_id: &str, role: TurnRole, content: &str) -> Result<Option<Turn>> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let next: Option<i64> = tx
            .query_row(
                "SELECT next_sequence FROM chats WHERE id = ?1",
                [chat_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(sequence) = next else {
            return Ok(None);
        };

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        tx.execute(
            "INSERT INTO turns (id, chat_id, role, content, sequence, summarized, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![id, chat_id, role.as_str(), content, sequence, now_str.clone()],
        )?;
        tx.execute(
            "UPDATE chats SET next_sequence = ?2, updated_at = ?3 WHERE id = ?1",
            params![chat_id, sequence + 1, now_str],
        )?;
        tx.commit()?;

        Ok(Some(Turn {
            id,
            chat_id: chat_id.to_string(),
            role,
            content: content.to_string(),
            sequence,
            summarized: false,
            created_at: now,
        }))
    }

    pub fn get_turn(&self, turn_id: &str) -> Result<Option<Turn>> {
        let conn = self.lock_conn()?;
        let turn = conn
            .query_row(
                &format!("SELECT {} FROM turns WHERE id = ?1", TURN_COLUMNS),
                [turn_id],
                turn_from_row,
            )
            .optional()?;
        Ok(turn)
    }

    pub fn get_turn_at(&self, chat_id: &str, sequence: i64) -> Result<Option<Turn>> {
        let conn = self.lock_conn()?;
        let turn = conn
            .query_row(
                &format!(
                    "SELECT {} FROM turns WHERE chat_id = ?1 AND sequence = ?2",
                    TURN_COLUMNS
                ),
                params![chat_id, sequence],
                turn_from_row,
            )
            .optional()?;
        Ok(turn)
    }

    /// Full history of a chat in sequence order, summarized turns included.
    pub fn list_turns(&self, chat_id: &str) -> Result<Vec<Turn>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM turns WHERE chat_id = ?1 ORDER BY sequence ASC",
            TURN_COLUMNS
        ))?;
        let turns = stmt
            .query_map([chat_id], turn_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(turns)
    }

    /// Turns not yet folded into the summary, in sequence order.
    pub fn list_unsummarized(&self, chat_id: &str) -> Result<Vec<Turn>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM turns WHERE chat_id = ?1 AND summarized = 0 ORDER BY sequence ASC",
            TURN_COLUMNS
        ))?;
        let turns = stmt
            .query_map([chat_id], turn_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(turns)
    }

    /// Flag a batch of turns as summarized. All-or-nothing: if any id is missing
    /// or already summarized the transaction is rolled back and `false` returned.
    pub fn mark_summarized(&self, chat_id: &str, turn_ids: &[String]) -> Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        if !flag_batch(&tx, chat_id, turn_ids)? {
            return Ok(false);
        }
        tx.commit()?;
        Ok(true)
    }

    /// Replace the rolling summary and flag the batch it absorbed, atomically.
    pub fn commit_summary(&self, chat_id: &str, summary_text: &str, turn_ids: &[String]) -> Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        if !flag_batch(&tx, chat_id, turn_ids)? {
            return Ok(false);
        }
        let updated = tx.execute(
            "UPDATE chat_memory
             SET summary_text = ?2,
                 summarized_turn_count = summarized_turn_count + ?3,
                 updated_at = ?4
             WHERE chat_id = ?1",
            params![chat_id, summary_text, turn_ids.len() as i64, Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        tx.commit()?;
        Ok(true)
    }

    /// Oldest summarized turn with a sequence greater than `floor`, if any.
    pub fn first_summarized_after(&self, chat_id: &str, floor: i64) -> Result<Option<Turn>> {
        let conn = self.lock_conn()?;
        let turn = conn
            .query_row(
                &format!(
                    "SELECT {} FROM turns
                     WHERE chat_id = ?1 AND summarized = 1 AND sequence > ?2
                     ORDER BY sequence ASC LIMIT 1",
                    TURN_COLUMNS
                ),
                params![chat_id, floor],
                turn_from_row,
            )
            .optional()?;
        Ok(turn)
    }

    /// Delete every turn with a sequence greater than `sequence` (and the turn at
    /// `sequence` itself when `include_target` is set). Returns the number removed.
    pub fn truncate_after(&self, chat_id: &str, sequence: i64, include_target: bool) -> Result<usize> {
        let floor = if include_target { sequence - 1 } else { sequence };
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM turn_references
             WHERE turn_id IN (SELECT id FROM turns WHERE chat_id = ?1 AND sequence > ?2)",
            params![chat_id, floor],
        )?;
        let removed = tx.execute(
            "DELETE FROM turns WHERE chat_id = ?1 AND sequence > ?2",
            params![chat_id, floor],
        )?;
        tx.execute(
            "UPDATE chats SET updated_at = ?2 WHERE id = ?1",
            params![chat_id, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(removed)
    }

    /// Replace the content of an unsummarized turn. Returns `false` if the turn is
    /// missing or already summarized.
    pub fn replace_turn_content(&self, turn_id: &str, content: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE turns SET content = ?2 WHERE id = ?1 AND summarized = 0",
            params![turn_id, content],
        )?;
        Ok(updated > 0)
    }

    /// Remove a single unsummarized turn (used to roll back an aborted turn).
    pub fn delete_unsummarized_turn(&self, turn_id: &str) -> Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM turn_references WHERE turn_id = ?1", [turn_id])?;
        let deleted = tx.execute(
            "DELETE FROM turns WHERE id = ?1 AND summarized = 0",
            [turn_id],
        )?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    // ========================================================================
    // Rolling summary
    // ========================================================================

    pub fn get_memory(&self, chat_id: &str) -> Result<Option<ChatMemory>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT m.chat_id, m.summary_text, m.summarized_turn_count, m.updated_at,
                        (SELECT COUNT(1) FROM turns t WHERE t.chat_id = m.chat_id AND t.summarized = 0)
                 FROM chat_memory m
                 WHERE m.chat_id = ?1",
                [chat_id],
                |row| {
                    Ok(ChatMemory {
                        chat_id: row.get(0)?,
                        summary_text: row.get(1)?,
                        summarized_turn_count: row.get::<_, i64>(2)?.max(0) as usize,
                        updated_at: parse_rfc3339(row.get::<_, String>(3)?, 3)?,
                        unsummarized_count: row.get::<_, i64>(4)?.max(0) as usize,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // ========================================================================
    // Reference audit
    // ========================================================================

    pub fn record_turn_references(&self, turn_id: &str, references: &[(String, f32)]) -> Result<()> {
        if references.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        for (position, (source_id, score)) in references.iter().enumerate() {
            tx.execute(
                "INSERT OR REPLACE INTO turn_references (turn_id, position, source_id, score)
                 VALUES (?1, ?2, ?3, ?4)",
                params![turn_id, position as i64, source_id, *score as f64],
            )?;
        }
        tx.commit()
            .with_context(|| format!("Failed to record references for turn {}", turn_id))?;
        Ok(())
    }

    pub fn list_turn_references(&self, turn_id: &str) -> Result<Vec<TurnReference>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT turn_id, source_id, score FROM turn_references
             WHERE turn_id = ?1
             ORDER BY position ASC",
        )?;
        let references = stmt
            .query_map([turn_id], |row| {
                Ok(TurnReference {
                    turn_id: row.get(0)?,
                    source_id: row.get(1)?,
                    score: row.get::<_, f64>(2)? as f32,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(references)
    }
}

fn flag_batch(tx: &rusqlite::Transaction<'_>, chat_id: &str, turn_ids: &[String]) -> Result<bool> {
    for turn_id in turn_ids {
        let updated = tx.execute(
            "UPDATE turns SET summarized = 1 WHERE id = ?1 AND chat_id = ?2 AND summarized = 0",
            params![turn_id, chat_id],
        )?;
        if updated == 0 {
            return Ok(false);
        }
    }
    Ok(true)
}

fn chat_from_row(row: &Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: parse_rfc3339(row.get::<_, String>(2)?, 2)?,
        updated_at: parse_rfc3339(row.get::<_, String>(3)?, 3)?,
        next_sequence: row.get(4)?,
    })
}

fn turn_from_row(row: &Row<'_>) -> rusqlite::Result<Turn> {
    Ok(Turn {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        role: TurnRole::from_db(&row.get::<_, String>(2)?),
        content: row.get(3)?,
        sequence: row.get(4)?,
        summarized: row.get::<_, i64>(5)? != 0,
        created_at: parse_rfc3339(row.get::<_, String>(6)?, 6)?,
    })
}

fn parse_rfc3339(raw: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("chatloom_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    fn seed(db: &ChatDatabase, chat_id: &str, count: usize) -> Vec<Turn> {
        (0..count)
            .map(|idx| {
                let role = if idx % 2 == 0 { TurnRole::User } else { TurnRole::Assistant };
                db.append_turn(chat_id, role, &format!("message {}", idx + 1))
                    .expect("append turn")
                    .expect("chat exists")
            })
            .collect()
    }

    #[test]
    fn sequences_are_never_reused_after_truncation() {
        let path = temp_db_path("sequence_reuse");
        let db = ChatDatabase::new(&path).expect("db init");
        let chat = db.create_chat(Some("Sequence test")).expect("create chat");

        let turns = seed(&db, &chat.id, 6);
        assert_eq!(
            turns.iter().map(|t| t.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5, 6]
        );

        let removed = db.truncate_after(&chat.id, 3, false).expect("truncate");
        assert_eq!(removed, 3);

        let next = db
            .append_turn(&chat.id, TurnRole::Assistant, "after rewind")
            .expect("append")
            .expect("chat exists");
        assert_eq!(next.sequence, 7);

        let sequences: Vec<i64> = db
            .list_turns(&chat.id)
            .expect("list turns")
            .iter()
            .map(|t| t.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3, 7]);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn append_to_missing_chat_returns_none() {
        let path = temp_db_path("missing_chat");
        let db = ChatDatabase::new(&path).expect("db init");
        assert!(db
            .append_turn("nope", TurnRole::User, "hi")
            .expect("append")
            .is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn commit_summary_is_all_or_nothing() {
        let path = temp_db_path("commit_summary");
        let db = ChatDatabase::new(&path).expect("db init");
        let chat = db.create_chat(None).expect("create chat");
        let turns = seed(&db, &chat.id, 4);

        let mut batch: Vec<String> = turns[..2].iter().map(|t| t.id.clone()).collect();
        assert!(db
            .commit_summary(&chat.id, "first two folded", &batch)
            .expect("commit"));

        let memory = db.get_memory(&chat.id).expect("memory").expect("exists");
        assert_eq!(memory.summary_text, "first two folded");
        assert_eq!(memory.summarized_turn_count, 2);
        assert_eq!(memory.unsummarized_count, 2);

        // Second attempt includes an already-summarized turn and must not apply.
        batch.push(turns[2].id.clone());
        assert!(!db
            .commit_summary(&chat.id, "should not land", &batch)
            .expect("commit"));
        let memory = db.get_memory(&chat.id).expect("memory").expect("exists");
        assert_eq!(memory.summary_text, "first two folded");
        assert!(!db.get_turn(&turns[2].id).expect("get").expect("exists").summarized);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn summarized_turn_content_cannot_be_replaced() {
        let path = temp_db_path("immutable_content");
        let db = ChatDatabase::new(&path).expect("db init");
        let chat = db.create_chat(None).expect("create chat");
        let turns = seed(&db, &chat.id, 2);

        assert!(db
            .mark_summarized(&chat.id, &[turns[0].id.clone()])
            .expect("mark"));
        assert!(!db
            .replace_turn_content(&turns[0].id, "rewritten")
            .expect("replace"));
        assert!(db
            .replace_turn_content(&turns[1].id, "rewritten")
            .expect("replace"));

        let first = db.get_turn(&turns[0].id).expect("get").expect("exists");
        assert_eq!(first.content, "message 1");
        let unsummarized = db.list_unsummarized(&chat.id).expect("list");
        assert_eq!(unsummarized.len(), 1);
        assert_eq!(unsummarized[0].content, "rewritten");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn chat_lifecycle_and_reference_audit() {
        let path = temp_db_path("chat_lifecycle");
        let db = ChatDatabase::new(&path).expect("db init");
        let chat = db.create_chat(Some("  Manual questions ")).expect("create chat");
        assert_eq!(chat.title, "Manual questions");

        let renamed = db
            .rename_chat(&chat.id, "Renamed")
            .expect("rename")
            .expect("exists");
        assert_eq!(renamed.title, "Renamed");
        assert!(db.rename_chat("missing", "x").expect("rename").is_none());

        let turns = seed(&db, &chat.id, 2);
        db.record_turn_references(
            &turns[1].id,
            &[("doc-a".to_string(), 0.9), ("doc-b".to_string(), 0.7)],
        )
        .expect("record refs");
        let refs = db.list_turn_references(&turns[1].id).expect("list refs");
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].source_id, "doc-a");

        db.truncate_after(&chat.id, 1, false).expect("truncate");
        assert!(db.list_turn_references(&turns[1].id).expect("list").is_empty());

        assert_eq!(db.list_chats(10).expect("list chats").len(), 1);
        assert!(db.delete_chat(&chat.id).expect("delete"));
        assert!(db.get_chat(&chat.id).expect("get").is_none());
        assert!(db.get_memory(&chat.id).expect("memory").is_none());
        assert!(!db.delete_chat(&chat.id).expect("delete again"));

        let _ = std::fs::remove_file(&path);
    }
}
