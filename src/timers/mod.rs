//! Cancellable one-shot timers.
//!
//! Each timer is a task racing three signals:
//! - its deadline
//! - its own cancellation token
//! - the subsystem-wide shutdown token
//!
//! The registry entry decides who wins. A timer fires only if it removes its
//! own entry first, so a message is emitted at most once and never after a
//! successful [`Timers::rem`].

use crate::types::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Receives a fired timer's id and message.
pub type Emitter = Arc<dyn Fn(&str, Value) + Send + Sync>;

/// A scheduled timer as reported by [`Timers::pending`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTimer {
    pub id: String,
    pub at: DateTime<Utc>,
    pub message: Value,
}

#[derive(Debug)]
struct TimerEntry {
    generation: u64,
    at: DateTime<Utc>,
    message: Value,
    cancel: CancellationToken,
}

/// Timer registry for one owner (a crew).
pub struct Timers {
    entries: Arc<Mutex<HashMap<String, TimerEntry>>>,
    emitter: Emitter,
    shutdown: CancellationToken,
    generation: AtomicU64,
    max_timers: usize,
}

impl Timers {
    /// Cancelling `shutdown` also halts these timers. [`Timers::shutdown`]
    /// and drop affect only this registry.
    pub fn new(emitter: Emitter, shutdown: &CancellationToken, max_timers: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            emitter,
            shutdown: shutdown.child_token(),
            generation: AtomicU64::new(0),
            max_timers,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TimerEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Schedule `message` to be emitted after `delay`.
    ///
    /// Must be called within a tokio runtime.
    pub fn add(&self, id: impl Into<String>, message: Value, delay: Duration) -> Result<()> {
        let id = id.into();
        if self.shutdown.is_cancelled() {
            return Err(Error::cancelled("timers are shut down"));
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        let at = Utc::now()
            + chrono::Duration::from_std(delay)
                .map_err(|e| Error::validation(format!("timer delay: {}", e)))?;

        {
            let mut entries = self.lock();
            if entries.contains_key(&id) {
                return Err(Error::exists(format!("timer {}", id)));
            }
            if entries.len() >= self.max_timers {
                return Err(Error::validation(format!(
                    "too many timers ({} max)",
                    self.max_timers
                )));
            }
            entries.insert(
                id.clone(),
                TimerEntry {
                    generation,
                    at,
                    message,
                    cancel: cancel.clone(),
                },
            );
        }

        tracing::debug!(timer = %id, ?delay, "timer added");

        let entries = self.entries.clone();
        let emitter = self.emitter.clone();
        tokio::spawn(async move {
            let fired = tokio::select! {
                _ = tokio::time::sleep(delay) => true,
                _ = cancel.cancelled() => false,
            };

            let entry = {
                let mut entries = entries.lock().unwrap_or_else(|e| e.into_inner());
                match entries.get(&id) {
                    Some(entry) if entry.generation == generation => entries.remove(&id),
                    _ => None,
                }
            };

            match entry {
                Some(entry) if fired => {
                    tracing::debug!(timer = %id, "timer fired");
                    emitter(&id, entry.message);
                }
                Some(_) => tracing::debug!(timer = %id, "timer halted"),
                None => tracing::debug!(timer = %id, "timer already removed"),
            }
        });

        Ok(())
    }

    /// Cancel a pending timer.
    pub fn rem(&self, id: &str) -> Result<()> {
        let entry = self
            .lock()
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("timer {}", id)))?;
        entry.cancel.cancel();
        tracing::debug!(timer = %id, "timer removed");
        Ok(())
    }

    /// Snapshot of scheduled timers, soonest first.
    pub fn pending(&self) -> Vec<PendingTimer> {
        let mut acc: Vec<PendingTimer> = self
            .lock()
            .iter()
            .map(|(id, e)| PendingTimer {
                id: id.clone(),
                at: e.at,
                message: e.message.clone(),
            })
            .collect();
        acc.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.id.cmp(&b.id)));
        acc
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Halt every pending timer without emitting. Later `add`s fail.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.lock().clear();
        tracing::debug!("timers shut down");
    }
}

impl fmt::Debug for Timers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timers")
            .field("pending", &self.len())
            .field("max_timers", &self.max_timers)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn collecting() -> (Emitter, mpsc::UnboundedReceiver<(String, Value)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let emitter: Emitter = Arc::new(move |id: &str, message: Value| {
            let _ = tx.send((id.to_string(), message));
        });
        (emitter, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let (emitter, mut rx) = collecting();
        let timers = Timers::new(emitter, &CancellationToken::new(), 16);
        timers.add("t1", json!({"ding": 1}), Duration::from_millis(100)).unwrap();
        assert_eq!(timers.len(), 1);

        let (id, message) = rx.recv().await.unwrap();
        assert_eq!(id, "t1");
        assert_eq!(message, json!({"ding": 1}));
        assert!(timers.is_empty());
        assert!(matches!(timers.rem("t1"), Err(Error::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rem_before_fire_suppresses_emit() {
        let (emitter, mut rx) = collecting();
        let timers = Timers::new(emitter, &CancellationToken::new(), 16);
        timers.add("t1", json!({"ding": 1}), Duration::from_millis(100)).unwrap();
        timers.rem("t1").unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_id_rejected() {
        let (emitter, _rx) = collecting();
        let timers = Timers::new(emitter, &CancellationToken::new(), 16);
        timers.add("t1", json!(1), Duration::from_secs(1)).unwrap();
        let err = timers.add("t1", json!(2), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::Exists(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_readd_after_rem_fires_new_message_only() {
        let (emitter, mut rx) = collecting();
        let timers = Timers::new(emitter, &CancellationToken::new(), 16);
        timers.add("t1", json!("old"), Duration::from_millis(100)).unwrap();
        timers.rem("t1").unwrap();
        timers.add("t1", json!("new"), Duration::from_millis(200)).unwrap();

        let (_, message) = rx.recv().await.unwrap();
        assert_eq!(message, json!("new"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_halts_everything() {
        let (emitter, mut rx) = collecting();
        let shutdown = CancellationToken::new();
        let timers = Timers::new(emitter, &shutdown, 16);
        timers.add("a", json!(1), Duration::from_millis(50)).unwrap();
        timers.add("b", json!(2), Duration::from_millis(60)).unwrap();

        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        assert!(timers.is_empty());
        assert!(matches!(
            timers.add("c", json!(3), Duration::from_millis(10)),
            Err(Error::Cancelled(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_timers() {
        let (emitter, _rx) = collecting();
        let timers = Timers::new(emitter, &CancellationToken::new(), 1);
        timers.add("a", json!(1), Duration::from_secs(1)).unwrap();
        assert!(matches!(
            timers.add("b", json!(2), Duration::from_secs(1)),
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_sorted_by_deadline() {
        let (emitter, _rx) = collecting();
        let timers = Timers::new(emitter, &CancellationToken::new(), 16);
        timers.add("late", json!(1), Duration::from_secs(10)).unwrap();
        timers.add("soon", json!(2), Duration::from_secs(1)).unwrap();
        let ids: Vec<String> = timers.pending().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["soon", "late"]);
    }
}
