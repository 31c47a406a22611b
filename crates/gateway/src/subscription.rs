//! Bidirectional symbol ↔ subscriber index.
//!
//! `by_symbol` and `by_subscriber` mirror each other: a subscriber appears under a symbol exactly
//! when that symbol appears under the subscriber. Empty sets are never stored, so a missing key
//! always means zero interest. Both maps are private; the operations below are the only way to
//! change them.

use crate::client::ClientId;
use std::collections::{HashMap, HashSet};

/// Result of [`SubscriptionRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    /// The symbol had no subscribers before this call.
    pub first_subscriber_for_symbol: bool,
}

/// Result of [`SubscriptionRegistry::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOutcome {
    /// The symbol has no subscribers left after this call.
    pub last_subscriber_for_symbol: bool,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    by_symbol: HashMap<String, HashSet<ClientId>>,
    by_subscriber: HashMap<ClientId, HashSet<String>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `subscriber` wants `symbol`. Idempotent.
    pub fn add(&mut self, subscriber: ClientId, symbol: &str) -> AddOutcome {
        let first = !self.by_symbol.contains_key(symbol);
        self.by_symbol
            .entry(symbol.to_string())
            .or_default()
            .insert(subscriber);
        self.by_subscriber
            .entry(subscriber)
            .or_default()
            .insert(symbol.to_string());
        AddOutcome {
            first_subscriber_for_symbol: first,
        }
    }

    /// Drop one (subscriber, symbol) pair. A no-op returning `false` if the pair is absent.
    pub fn remove(&mut self, subscriber: ClientId, symbol: &str) -> RemoveOutcome {
        let removed = match self.by_subscriber.get_mut(&subscriber) {
            Some(symbols) => {
                let removed = symbols.remove(symbol);
                if symbols.is_empty() {
                    self.by_subscriber.remove(&subscriber);
                }
                removed
            }
            None => false,
        };

        RemoveOutcome {
            last_subscriber_for_symbol: removed && self.detach(symbol, subscriber),
        }
    }

    /// Drop every symbol held by `subscriber`, reporting for each whether it was the last holder.
    ///
    /// Results are sorted by symbol.
    pub fn remove_all(&mut self, subscriber: ClientId) -> Vec<(String, bool)> {
        let Some(symbols) = self.by_subscriber.remove(&subscriber) else {
            return Vec::new();
        };

        let mut symbols: Vec<String> = symbols.into_iter().collect();
        symbols.sort();
        symbols
            .into_iter()
            .map(|symbol| {
                let last = self.detach(&symbol, subscriber);
                (symbol, last)
            })
            .collect()
    }

    /// Subscribers currently interested in `symbol`.
    pub fn subscribers_of<'a>(&'a self, symbol: &str) -> impl Iterator<Item = &'a ClientId> + 'a {
        self.by_symbol.get(symbol).into_iter().flatten()
    }

    /// Every symbol with at least one subscriber, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.by_symbol.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn symbol_count(&self) -> usize {
        self.by_symbol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty()
    }

    /// Remove `subscriber` from `symbol`'s set; true if that emptied (and dropped) the set.
    fn detach(&mut self, symbol: &str, subscriber: ClientId) -> bool {
        let Some(subscribers) = self.by_symbol.get_mut(symbol) else {
            return false;
        };
        subscribers.remove(&subscriber);
        if subscribers.is_empty() {
            self.by_symbol.remove(symbol);
            true
        } else {
            false
        }
    }
}
