//! Noteum Events - Change Notification
//!
//! Mutations in the Record Store, Cache Engine and Token Vault are published
//! as [`ChangeEvent`]s. The [`ChangeNotifier`] collapses bursts per
//! `(table, key, type)` with a [`Debouncer`] and fans the survivors out to
//! subscribed observers.
//!
//! ```text
//! producer ── notify ──▶ Debouncer ──(window)──▶ dispatch ──▶ observers
//!                     (table, key, type)                      by priority
//! ```

mod debounce;
mod event;
mod notifier;

pub use debounce::{DebounceKey, DebounceSink, Debouncer};
pub use event::{ChangeEvent, ChangeType};
pub use notifier::{
    ChangeNotifier, ChangeObserver, HistoryEntry, KeyPattern, NotifierStats, Priority,
    SubscriptionId, SubscriptionOptions,
};
