//! Observer registry and fan-out.
//!
//! Producers call [`ChangeNotifier::notify`]; events pass through the
//! [`Debouncer`] and are then delivered to every matching subscriber in
//! descending priority order. A failing observer is logged and skipped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use noteum_core::{EventConfig, EventError, Timestamp};
use regex::Regex;
use serde::Serialize;

use crate::debounce::{DebounceSink, Debouncer};
use crate::event::{ChangeEvent, ChangeType};

// ============================================================================
// OBSERVERS AND OPTIONS
// ============================================================================

/// Receiver of change events.
pub trait ChangeObserver: Send + Sync {
    fn on_change(&self, event: &ChangeEvent) -> Result<(), String>;
}

impl<F> ChangeObserver for F
where
    F: Fn(&ChangeEvent) -> Result<(), String> + Send + Sync,
{
    fn on_change(&self, event: &ChangeEvent) -> Result<(), String> {
        self(event)
    }
}

/// Delivery priority; higher priorities are notified first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// Key filter for a subscription.
#[derive(Debug, Clone)]
pub enum KeyPattern {
    Contains(String),
    Regex(Regex),
}

impl KeyPattern {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Contains(needle) => key.contains(needle.as_str()),
            KeyPattern::Regex(re) => re.is_match(key),
        }
    }
}

/// Subscription filters and flags.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    pub key_pattern: Option<KeyPattern>,
    pub source: Option<String>,
    /// Empty means every change type.
    pub change_types: Vec<ChangeType>,
    pub once: bool,
    pub priority: Priority,
}

impl SubscriptionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_containing(mut self, needle: impl Into<String>) -> Self {
        self.key_pattern = Some(KeyPattern::Contains(needle.into()));
        self
    }

    pub fn with_key_regex(mut self, pattern: &str) -> Result<Self, EventError> {
        let re = Regex::new(pattern).map_err(|e| EventError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.key_pattern = Some(KeyPattern::Regex(re));
        Ok(self)
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_change_types(mut self, types: &[ChangeType]) -> Self {
        self.change_types = types.to_vec();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    fn accepts(&self, event: &ChangeEvent) -> bool {
        if let Some(source) = &self.source {
            if source != &event.source {
                return false;
            }
        }
        if !self.change_types.is_empty() && !self.change_types.contains(&event.change_type) {
            return false;
        }
        match &self.key_pattern {
            Some(pattern) => pattern.matches(&event.key),
            None => true,
        }
    }
}

/// Handle returned by [`ChangeNotifier::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Registration {
    id: SubscriptionId,
    observer: Arc<dyn ChangeObserver>,
    options: SubscriptionOptions,
}

/// One delivered event in the notifier history.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub event: ChangeEvent,
    pub delivered_to: usize,
    pub dispatched_at: Timestamp,
}

/// Counters exposed by [`ChangeNotifier::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotifierStats {
    pub listeners: usize,
    pub events_received: u64,
    pub events_dispatched: u64,
    pub deliveries: u64,
    pub observer_failures: u64,
    pub coalesced: u64,
    pub pending: usize,
    pub history_len: usize,
    pub destroyed: bool,
}

// ============================================================================
// NOTIFIER
// ============================================================================

struct NotifierInner {
    config: EventConfig,
    registrations: RwLock<Vec<Registration>>,
    history: RwLock<VecDeque<HistoryEntry>>,
    next_id: AtomicU64,
    destroyed: AtomicBool,
    received: AtomicU64,
    dispatched: AtomicU64,
    deliveries: AtomicU64,
    failures: AtomicU64,
    debouncer: Debouncer,
}

/// Cloneable handle to the observer registry.
#[derive(Clone)]
pub struct ChangeNotifier {
    inner: Arc<NotifierInner>,
}

impl ChangeNotifier {
    pub fn new(config: EventConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<NotifierInner>| {
            let weak = weak.clone();
            let sink: DebounceSink = Arc::new(move |event: ChangeEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch(event);
                }
            });
            NotifierInner {
                debouncer: Debouncer::new(config.debounce(), sink),
                config,
                registrations: RwLock::new(Vec::new()),
                history: RwLock::new(VecDeque::new()),
                next_id: AtomicU64::new(1),
                destroyed: AtomicBool::new(false),
                received: AtomicU64::new(0),
                dispatched: AtomicU64::new(0),
                deliveries: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }
        });
        Self { inner }
    }

    /// Register an observer.
    pub fn subscribe(
        &self,
        observer: Arc<dyn ChangeObserver>,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionId, EventError> {
        self.ensure_alive()?;
        let mut registrations = self
            .inner
            .registrations
            .write()
            .map_err(|_| EventError::Destroyed)?;
        if registrations.len() >= self.inner.config.max_listeners {
            return Err(EventError::ListenerLimit {
                limit: self.inner.config.max_listeners,
            });
        }
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        registrations.push(Registration {
            id,
            observer,
            options,
        });
        // Stable sort keeps registration order within a priority.
        registrations.sort_by(|a, b| b.options.priority.cmp(&a.options.priority));
        tracing::debug!(subscription = id.0, total = registrations.len(), "Observer subscribed");
        Ok(id)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Ok(mut registrations) = self.inner.registrations.write() else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        before != registrations.len()
    }

    /// Submit an event for (debounced) delivery.
    pub fn notify(&self, event: ChangeEvent) {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return;
        }
        self.inner.received.fetch_add(1, Ordering::Relaxed);
        self.inner.debouncer.push(event);
    }

    /// Deliver all debounced events immediately.
    pub fn flush(&self) -> usize {
        self.inner.debouncer.flush()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.registrations.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Most recent history entries, oldest first.
    pub fn history(&self, limit: Option<usize>) -> Vec<HistoryEntry> {
        let Ok(history) = self.inner.history.read() else {
            return Vec::new();
        };
        let skip = limit.map(|l| history.len().saturating_sub(l)).unwrap_or(0);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn clear_history(&self) {
        if let Ok(mut history) = self.inner.history.write() {
            history.clear();
        }
    }

    pub fn stats(&self) -> NotifierStats {
        NotifierStats {
            listeners: self.listener_count(),
            events_received: self.inner.received.load(Ordering::Relaxed),
            events_dispatched: self.inner.dispatched.load(Ordering::Relaxed),
            deliveries: self.inner.deliveries.load(Ordering::Relaxed),
            observer_failures: self.inner.failures.load(Ordering::Relaxed),
            coalesced: self.inner.debouncer.coalesced(),
            pending: self.inner.debouncer.pending(),
            history_len: self.inner.history.read().map(|h| h.len()).unwrap_or(0),
            destroyed: self.inner.destroyed.load(Ordering::Acquire),
        }
    }

    /// Drop all subscribers, pending events and history. Later calls to
    /// `subscribe` fail and `notify` becomes a no-op.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = self.inner.debouncer.shutdown();
        if let Ok(mut registrations) = self.inner.registrations.write() {
            registrations.clear();
        }
        self.clear_history();
        tracing::debug!(dropped_pending = dropped, "Change notifier destroyed");
    }

    fn ensure_alive(&self) -> Result<(), EventError> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            Err(EventError::Destroyed)
        } else {
            Ok(())
        }
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(EventConfig::default())
    }
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("stats", &self.stats())
            .finish()
    }
}

impl NotifierInner {
    fn dispatch(&self, event: ChangeEvent) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }

        // Observers run without the registry lock held so they may subscribe.
        let targets: Vec<(SubscriptionId, Arc<dyn ChangeObserver>, bool)> =
            match self.registrations.read() {
                Ok(registrations) => registrations
                    .iter()
                    .filter(|r| r.options.accepts(&event))
                    .map(|r| (r.id, Arc::clone(&r.observer), r.options.once))
                    .collect(),
                Err(_) => return,
            };

        let mut delivered = Vec::with_capacity(targets.len());
        let mut spent = Vec::new();
        for (id, observer, once) in &targets {
            match observer.on_change(&event) {
                Ok(()) => delivered.push(*id),
                Err(reason) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        key = %event.key,
                        change = %event.change_type,
                        error = %reason,
                        "Change observer failed"
                    );
                }
            }
            if *once {
                spent.push(*id);
            }
        }

        if !spent.is_empty() {
            if let Ok(mut registrations) = self.registrations.write() {
                registrations.retain(|r| !spent.contains(&r.id));
            }
        }

        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.deliveries
            .fetch_add(delivered.len() as u64, Ordering::Relaxed);

        if let Ok(mut history) = self.history.write() {
            history.push_back(HistoryEntry {
                event,
                delivered_to: delivered.len(),
                dispatched_at: noteum_core::now(),
            });
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }
    }
}
