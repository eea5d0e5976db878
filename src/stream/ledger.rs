//! Subscription ledger: subscribed event types and where to resume them.
//!
//! The ledger is the only input to resubscription after a reconnect. Each
//! method holds the lock for the map mutation alone; nothing here awaits.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::stream::proto::{Event, EventType};

/// Event type to next offset to request from the server.
#[derive(Debug, Default)]
pub struct SubscriptionLedger {
    entries: Mutex<HashMap<EventType, u64>>,
}

impl SubscriptionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records accepted subscriptions starting at `offset`.
    ///
    /// An explicit subscribe restarts the topic, so an existing entry is
    /// overwritten.
    pub fn subscribe(&self, event_types: &[EventType], offset: u64) {
        let mut entries = self.entries();
        for event_type in event_types {
            entries.insert(*event_type, offset);
        }
    }

    /// Drops entries for accepted unsubscriptions.
    pub fn unsubscribe(&self, event_types: &[EventType]) {
        let mut entries = self.entries();
        for event_type in event_types {
            entries.remove(event_type);
        }
    }

    /// Advances subscribed entries past the observed events.
    ///
    /// An event at offset `N` moves its entry to `N + 1` unless the entry is
    /// already further along. Unsubscribed event types are ignored. Returns
    /// the number of entries moved.
    pub fn advance(&self, events: &[Event]) -> usize {
        let mut entries = self.entries();
        let mut advanced = 0;
        for event in events {
            if let Some(current) = entries.get_mut(&event.event_type) {
                let next = event.offset.saturating_add(1);
                if next > *current {
                    *current = next;
                    advanced += 1;
                }
            }
        }
        advanced
    }

    pub fn offset(&self, event_type: EventType) -> Option<u64> {
        self.entries().get(&event_type).copied()
    }

    pub fn contains(&self, event_type: EventType) -> bool {
        self.entries().contains_key(&event_type)
    }

    /// Copy of the current entries, ordered by event type.
    pub fn snapshot(&self) -> BTreeMap<EventType, u64> {
        self.entries()
            .iter()
            .map(|(event_type, offset)| (*event_type, *offset))
            .collect()
    }

    /// Entries grouped by offset, for one batch request per group.
    pub fn grouped_by_offset(&self) -> BTreeMap<u64, Vec<EventType>> {
        let mut groups: BTreeMap<u64, Vec<EventType>> = BTreeMap::new();
        for (event_type, offset) in self.snapshot() {
            groups.entry(offset).or_default().push(event_type);
        }
        groups
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<EventType, u64>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
