//! Delayed delivery queue keyed by `(table, key, change type)`.
//!
//! Each pending pair owns one timer task. Pushing another event for the same
//! pair aborts the old timer and re-arms a fresh one, so bursts collapse into
//! a single delivery and no timer outlives its entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use noteum_core::TableName;

use crate::event::{ChangeEvent, ChangeType};

/// Debounce queue key. Events without a table share the `None` slot.
pub type DebounceKey = (Option<TableName>, String, ChangeType);

/// Receiver of debounced events.
pub type DebounceSink = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

struct Pending {
    event: ChangeEvent,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct DebounceState {
    pending: HashMap<DebounceKey, Pending>,
    next_generation: u64,
    coalesced: u64,
    closed: bool,
}

/// Delayed queue collapsing repeated events per `(table, key, type)`.
#[derive(Clone)]
pub struct Debouncer {
    window: Duration,
    state: Arc<Mutex<DebounceState>>,
    sink: DebounceSink,
}

impl Debouncer {
    pub fn new(window: Duration, sink: DebounceSink) -> Self {
        Self {
            window,
            state: Arc::new(Mutex::new(DebounceState::default())),
            sink,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Queue an event. With a zero window, or outside a tokio runtime, the
    /// event is delivered immediately.
    pub fn push(&self, event: ChangeEvent) {
        let runtime = tokio::runtime::Handle::try_current();
        let runtime = match runtime {
            Ok(handle) if !self.window.is_zero() => handle,
            _ => {
                (self.sink)(event);
                return;
            }
        };

        let key: DebounceKey = (event.table, event.key.clone(), event.change_type);
        let Ok(mut state) = self.state.lock() else {
            tracing::warn!(key = %key.1, "Debounce state poisoned, delivering immediately");
            (self.sink)(event);
            return;
        };
        if state.closed {
            return;
        }

        state.next_generation += 1;
        let generation = state.next_generation;

        let event = match state.pending.remove(&key) {
            Some(previous) => {
                if let Some(timer) = previous.timer {
                    timer.abort();
                }
                state.coalesced += 1;
                previous.event.coalesce(event)
            }
            None => event,
        };

        let timer = runtime.spawn(Self::fire_after(
            self.window,
            Arc::clone(&self.state),
            Arc::clone(&self.sink),
            key.clone(),
            generation,
        ));
        state.pending.insert(
            key,
            Pending {
                event,
                generation,
                timer: Some(timer),
            },
        );
    }

    async fn fire_after(
        window: Duration,
        state: Arc<Mutex<DebounceState>>,
        sink: DebounceSink,
        key: DebounceKey,
        generation: u64,
    ) {
        tokio::time::sleep(window).await;
        let due = {
            let Ok(mut state) = state.lock() else {
                return;
            };
            match state.pending.get(&key) {
                Some(p) if p.generation == generation => state.pending.remove(&key),
                _ => None,
            }
        };
        if let Some(pending) = due {
            sink(pending.event);
        }
    }

    /// Deliver every pending event now, oldest first.
    pub fn flush(&self) -> usize {
        let mut due: Vec<ChangeEvent> = match self.state.lock() {
            Ok(mut state) => state
                .pending
                .drain()
                .map(|(_, mut p)| {
                    if let Some(timer) = p.timer.take() {
                        timer.abort();
                    }
                    p.event
                })
                .collect(),
            Err(_) => return 0,
        };
        due.sort_by_key(|e| e.timestamp);
        let count = due.len();
        for event in due {
            (self.sink)(event);
        }
        count
    }

    /// Drop every pending event and refuse new ones.
    pub fn shutdown(&self) -> usize {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };
        state.closed = true;
        let dropped = state.pending.len();
        for (_, mut pending) in state.pending.drain() {
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
        }
        dropped
    }

    pub fn pending(&self) -> usize {
        self.state.lock().map(|s| s.pending.len()).unwrap_or(0)
    }

    /// Events merged into an already pending one since creation.
    pub fn coalesced(&self) -> u64 {
        self.state.lock().map(|s| s.coalesced).unwrap_or(0)
    }
}

impl std::fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("window", &self.window)
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noteum_core::RecordValue;

    fn collecting() -> (DebounceSink, Arc<Mutex<Vec<ChangeEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: DebounceSink = Arc::new(move |event: ChangeEvent| {
            sink_seen.lock().expect("lock should succeed").push(event);
        });
        (sink, seen)
    }

    fn update(key: &str, old: &str, new: &str) -> ChangeEvent {
        ChangeEvent::upsert(key, Some(old.into()), new.into(), "test")
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_one_delivery() {
        let (sink, seen) = collecting();
        let debouncer = Debouncer::new(Duration::from_millis(100), sink);

        debouncer.push(update("theme", "a", "b"));
        debouncer.push(update("theme", "b", "c"));
        debouncer.push(update("theme", "c", "d"));
        assert_eq!(debouncer.pending(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;

        let seen = seen.lock().expect("lock should succeed");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].old_value, Some(RecordValue::from("a")));
        assert_eq!(seen[0].new_value, Some(RecordValue::from("d")));
        assert_eq!(debouncer.coalesced(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_pairs_are_independent() {
        let (sink, seen) = collecting();
        let debouncer = Debouncer::new(Duration::from_millis(100), sink);

        debouncer.push(update("a", "1", "2"));
        debouncer.push(update("b", "1", "2"));
        debouncer.push(ChangeEvent::removed("a", None, "test"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(seen.lock().expect("lock should succeed").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_in_different_tables_is_not_merged() {
        let (sink, seen) = collecting();
        let debouncer = Debouncer::new(Duration::from_millis(100), sink);

        debouncer.push(update("theme", "a", "b").with_table(TableName::Preferences));
        debouncer.push(update("theme", "x", "y").with_table(TableName::Settings));
        debouncer.push(update("theme", "b", "c").with_table(TableName::Preferences));
        assert_eq!(debouncer.pending(), 2);

        tokio::time::sleep(Duration::from_millis(150)).await;

        let seen = seen.lock().expect("lock should succeed");
        assert_eq!(seen.len(), 2);
        let settings = seen
            .iter()
            .find(|e| e.table == Some(TableName::Settings))
            .expect("settings event should be delivered");
        assert_eq!(settings.new_value, Some(RecordValue::from("y")));
        let preferences = seen
            .iter()
            .find(|e| e.table == Some(TableName::Preferences))
            .expect("preferences event should be delivered");
        assert_eq!(preferences.old_value, Some(RecordValue::from("a")));
        assert_eq!(preferences.new_value, Some(RecordValue::from("c")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_rearms_timer() {
        let (sink, seen) = collecting();
        let debouncer = Debouncer::new(Duration::from_millis(100), sink);

        debouncer.push(update("k", "1", "2"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        debouncer.push(update("k", "2", "3"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(seen.lock().expect("lock should succeed").is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(seen.lock().expect("lock should succeed").len(), 1);
    }

    #[tokio::test]
    async fn test_zero_window_delivers_immediately() {
        let (sink, seen) = collecting();
        let debouncer = Debouncer::new(Duration::ZERO, sink);
        debouncer.push(update("k", "1", "2"));
        assert_eq!(seen.lock().expect("lock should succeed").len(), 1);
        assert_eq!(debouncer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_and_shutdown() {
        let (sink, seen) = collecting();
        let debouncer = Debouncer::new(Duration::from_secs(10), sink);

        debouncer.push(update("a", "1", "2"));
        debouncer.push(update("b", "1", "2"));
        assert_eq!(debouncer.flush(), 2);
        assert_eq!(seen.lock().expect("lock should succeed").len(), 2);

        debouncer.push(update("c", "1", "2"));
        assert_eq!(debouncer.shutdown(), 1);
        debouncer.push(update("d", "1", "2"));
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(seen.lock().expect("lock should succeed").len(), 2);
    }
}
