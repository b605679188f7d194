//! Tailing event subscriber.
//!
//! Opens a cursor at the current maximum event id and forwards newer rows
//! on an unbuffered channel. Transient store errors re-open the tail with
//! exponential back-off. Close is cooperative: a flag checked between
//! yields, safe to flip more than once.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const BACKOFF_START: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(15);
const BATCH_LIMIT: i64 = 64;

/// A row from the event table.
#[derive(Clone, Debug)]
pub struct Event {
    pub id: i64,
    pub channel: String,
    pub data: Value,
}

/// Handle to a running tail.
pub struct Listener {
    stream: mpsc::Receiver<Event>,
    closed: Arc<AtomicBool>,
}

impl Listener {
    /// Receive the next event; `None` once the tail has shut down.
    pub async fn next(&mut self) -> Option<Event> {
        self.stream.recv().await
    }

    /// Request shutdown. Idempotent; the tail exits at its next yield.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Start tailing the given channels from the current maximum id.
///
/// # Errors
/// Returns an error if the initial cursor position cannot be read.
pub async fn subscribe_listener(pool: PgPool, channels: Vec<String>) -> Result<Listener> {
    let cursor = max_id(&pool).await?;
    let closed = Arc::new(AtomicBool::new(false));
    // Unbuffered handoff: the tail only advances as fast as the consumer.
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(tail(pool, channels, cursor, tx, Arc::clone(&closed)));

    Ok(Listener {
        stream: rx,
        closed,
    })
}

async fn max_id(pool: &PgPool) -> Result<i64> {
    let row = sqlx::query("SELECT COALESCE(MAX(id), 0) AS id FROM events")
        .fetch_one(pool)
        .await
        .context("failed to read event cursor")?;
    Ok(row.get("id"))
}

async fn tail(
    pool: PgPool,
    channels: Vec<String>,
    mut cursor: i64,
    tx: mpsc::Sender<Event>,
    closed: Arc<AtomicBool>,
) {
    let mut backoff = BACKOFF_START;

    loop {
        if closed.load(Ordering::SeqCst) {
            return;
        }

        let batch = sqlx::query(
            r"
            SELECT id, channel, data::text AS data
            FROM events
            WHERE id > $1 AND channel = ANY($2)
            ORDER BY id
            LIMIT $3
            ",
        )
        .bind(cursor)
        .bind(&channels)
        .bind(BATCH_LIMIT)
        .fetch_all(&pool)
        .await;

        let rows = match batch {
            Ok(rows) => {
                backoff = BACKOFF_START;
                rows
            }
            Err(err) => {
                warn!("event listener error, reopening tail: {err}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_MAX);
                continue;
            }
        };

        let idle = rows.is_empty();
        for row in rows {
            if closed.load(Ordering::SeqCst) {
                return;
            }

            let id: i64 = row.get("id");
            let data: String = row.get("data");
            let data = serde_json::from_str(&data).unwrap_or(Value::Null);
            cursor = id;

            let event = Event {
                id,
                channel: row.get("channel"),
                data,
            };
            if tx.send(event).await.is_err() {
                // Receiver dropped; nothing left to notify.
                return;
            }
        }

        if idle {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Event, Listener};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn close_is_idempotent_and_drop_closes() {
        let (tx, rx) = mpsc::channel::<Event>(1);
        let closed = Arc::new(AtomicBool::new(false));
        let listener = Listener {
            stream: rx,
            closed: Arc::clone(&closed),
        };

        listener.close();
        listener.close();
        assert!(closed.load(Ordering::SeqCst));

        drop(listener);
        assert!(closed.load(Ordering::SeqCst));
        drop(tx);
    }

    #[tokio::test]
    async fn next_returns_none_after_sender_drops() {
        let (tx, rx) = mpsc::channel::<Event>(1);
        let mut listener = Listener {
            stream: rx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        drop(tx);
        assert!(listener.next().await.is_none());
    }
}
