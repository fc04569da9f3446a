use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Durable record of already-notified messages, so repeated scheduled runs
/// stay idempotent even when server-side flags are lost.
#[derive(Clone)]
pub struct SeenStore {
    conn: Arc<Mutex<Connection>>,
}

/// One row in the store: a message we have notified about.
#[derive(Debug, Clone)]
pub struct NotifiedMessage {
    /// `mailbox:uidvalidity:uid` — see [`SeenStore::make_id`].
    pub id: String,
    pub message_id: Option<String>,
    pub subject: String,
    /// Comma-joined matched terms, kept for debugging.
    pub matched_terms: String,
}

impl SeenStore {
    /// Open or create the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // WAL mode for cheap concurrent reads; the PRAGMA returns the
        // resulting mode, so use query_row.
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;

        info!("Seen-state store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS notified_messages (
                id TEXT PRIMARY KEY,
                message_id TEXT,
                subject TEXT NOT NULL,
                matched_terms TEXT NOT NULL,
                notified_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_notified_at
                ON notified_messages(notified_at);
            ",
        )
        .context("Failed to run seen-state migrations")?;
        Ok(())
    }

    /// Unique key for a message. UIDs are only stable within one
    /// UIDVALIDITY epoch of one mailbox, so all three go into the key.
    pub fn make_id(mailbox: &str, uid_validity: u32, uid: u32) -> String {
        format!("{}:{}:{}", mailbox, uid_validity, uid)
    }

    pub async fn is_notified(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM notified_messages WHERE id = ?1",
                rusqlite::params![id],
                |row| row.get(0),
            )
            .context("Failed to query seen-state")?;
        Ok(count > 0)
    }

    pub async fn record(&self, entry: &NotifiedMessage) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO notified_messages (id, message_id, subject, matched_terms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO NOTHING",
            rusqlite::params![
                entry.id,
                entry.message_id,
                entry.subject,
                entry.matched_terms,
            ],
        )
        .context("Failed to record notified message")?;
        Ok(())
    }

    /// Delete rows older than `days`. Returns the number pruned.
    pub async fn prune_older_than(&self, days: u32) -> Result<usize> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "DELETE FROM notified_messages WHERE notified_at < datetime('now', ?1)",
                rusqlite::params![format!("-{} days", days)],
            )
            .context("Failed to prune seen-state")?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> NotifiedMessage {
        NotifiedMessage {
            id: id.to_string(),
            message_id: Some("<m1@example.com>".to_string()),
            subject: "Moma available now".to_string(),
            matched_terms: "Moma".to_string(),
        }
    }

    #[test]
    fn id_combines_mailbox_epoch_and_uid() {
        assert_eq!(SeenStore::make_id("INBOX", 99, 7), "INBOX:99:7");
    }

    #[tokio::test]
    async fn record_then_is_notified() {
        let store = SeenStore::open_in_memory().unwrap();
        let id = SeenStore::make_id("INBOX", 1, 42);

        assert!(!store.is_notified(&id).await.unwrap());
        store.record(&entry(&id)).await.unwrap();
        assert!(store.is_notified(&id).await.unwrap());
    }

    #[tokio::test]
    async fn record_is_idempotent() {
        let store = SeenStore::open_in_memory().unwrap();
        let id = SeenStore::make_id("INBOX", 1, 42);

        store.record(&entry(&id)).await.unwrap();
        store.record(&entry(&id)).await.unwrap();
        assert!(store.is_notified(&id).await.unwrap());
    }

    #[tokio::test]
    async fn uidvalidity_change_invalidates_old_uids() {
        let store = SeenStore::open_in_memory().unwrap();
        store
            .record(&entry(&SeenStore::make_id("INBOX", 1, 42)))
            .await
            .unwrap();

        // Same UID under a new epoch is a different message.
        let fresh = SeenStore::make_id("INBOX", 2, 42);
        assert!(!store.is_notified(&fresh).await.unwrap());
    }

    #[tokio::test]
    async fn prune_keeps_recent_rows() {
        let store = SeenStore::open_in_memory().unwrap();
        store
            .record(&entry(&SeenStore::make_id("INBOX", 1, 1)))
            .await
            .unwrap();

        let pruned = store.prune_older_than(30).await.unwrap();
        assert_eq!(pruned, 0);
        assert!(store
            .is_notified(&SeenStore::make_id("INBOX", 1, 1))
            .await
            .unwrap());
    }
}
