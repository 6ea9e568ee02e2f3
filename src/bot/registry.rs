// src/bot/registry.rs - Concurrent store of expiring, keyed payloads

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;

use crate::types::EntryKey;

/// An entry handed back by [`TimedActionRegistry::sweep`] or a bulk removal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedEntry<T> {
    pub key: EntryKey,
    pub payload: T,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Slot<T> {
    payload: T,
    expires_at: DateTime<Utc>,
}

/// Concurrent store of `key -> expiring payload` entries.
///
/// Used for scheduled punishment reversals, pending message deletions and
/// fuzzy-match sessions. Several entries may share a key; callers that need
/// one entry per key use [`replace`](Self::replace).
///
/// Every operation on a key runs under that key's shard lock, so an entry is
/// handed out exactly once: whichever of `sweep`, `remove_where` or
/// `pop_first` reaches it first claims it and the others see nothing.
#[derive(Debug)]
pub struct TimedActionRegistry<T> {
    name: &'static str,
    entries: DashMap<EntryKey, Vec<Slot<T>>>,
}

impl<T> TimedActionRegistry<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: DashMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Insert one entry alongside any existing entries for the key
    pub fn add(&self, key: EntryKey, payload: T, expires_at: DateTime<Utc>) {
        self.entries
            .entry(key)
            .or_default()
            .push(Slot { payload, expires_at });
    }

    /// Drop every entry for the key and insert this one, as a single step.
    /// Returns how many entries were replaced.
    pub fn replace(&self, key: EntryKey, payload: T, expires_at: DateTime<Utc>) -> usize {
        self.entries
            .insert(key, vec![Slot { payload, expires_at }])
            .map_or(0, |old| old.len())
    }

    /// Insert only if the key currently has no entry
    pub fn add_if_absent(&self, key: EntryKey, payload: T, expires_at: DateTime<Utc>) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_empty() {
                    return false;
                }
                occupied.get_mut().push(Slot { payload, expires_at });
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(vec![Slot { payload, expires_at }]);
                true
            }
        }
    }

    /// Remove and return every entry with `expires_at <= now`, oldest first.
    ///
    /// Entries inserted while the sweep is running are either picked up by
    /// this sweep or left for the next one, never both.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<TimedEntry<T>> {
        let mut expired = Vec::new();

        self.entries.retain(|key, slots| {
            if slots.iter().any(|s| s.expires_at <= now) {
                let (due, keep): (Vec<_>, Vec<_>) = std::mem::take(slots)
                    .into_iter()
                    .partition(|s| s.expires_at <= now);
                *slots = keep;
                expired.extend(due.into_iter().map(|s| TimedEntry {
                    key: *key,
                    payload: s.payload,
                    expires_at: s.expires_at,
                }));
            }
            !slots.is_empty()
        });

        expired.sort_by_key(|e| e.expires_at);
        if !expired.is_empty() {
            debug!("Registry '{}' swept {} expired entries", self.name, expired.len());
        }
        expired
    }

    /// Remove the key's entries whose payload matches. Returns the number removed.
    pub fn remove_where<F>(&self, key: &EntryKey, mut predicate: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let mut removed = 0;
        if let Some(mut slots) = self.entries.get_mut(key) {
            let before = slots.len();
            slots.retain(|s| !predicate(&s.payload));
            removed = before - slots.len();
        }
        self.entries.remove_if(key, |_, slots| slots.is_empty());
        removed
    }

    /// Remove every entry whose key matches, returning them
    pub fn remove_keys_where<F>(&self, mut predicate: F) -> Vec<TimedEntry<T>>
    where
        F: FnMut(&EntryKey) -> bool,
    {
        let mut removed = Vec::new();
        self.entries.retain(|key, slots| {
            if !predicate(key) {
                return true;
            }
            removed.extend(std::mem::take(slots).into_iter().map(|s| TimedEntry {
                key: *key,
                payload: s.payload,
                expires_at: s.expires_at,
            }));
            false
        });
        removed
    }

    /// Take the oldest-inserted entry for the key, regardless of expiry
    pub fn pop_first(&self, key: &EntryKey) -> Option<T> {
        let popped = self.entries.get_mut(key).and_then(|mut slots| {
            if slots.is_empty() {
                None
            } else {
                Some(slots.remove(0).payload)
            }
        });
        self.entries.remove_if(key, |_, slots| slots.is_empty());
        popped
    }

    pub fn contains_key(&self, key: &EntryKey) -> bool {
        self.entries.get(key).is_some_and(|slots| !slots.is_empty())
    }

    /// Earliest expiry among the key's entries
    pub fn next_expiry(&self, key: &EntryKey) -> Option<DateTime<Utc>> {
        self.entries
            .get(key)
            .and_then(|slots| slots.iter().map(|s| s.expires_at).min())
    }

    /// Total number of entries across all keys
    pub fn len(&self) -> usize {
        self.entries.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> TimedActionRegistry<T> {
    /// Copy of every live entry, for snapshots and diagnostics
    pub fn entries(&self) -> Vec<TimedEntry<T>> {
        let mut all = Vec::new();
        for item in self.entries.iter() {
            let key = *item.key();
            all.extend(item.value().iter().map(|s| TimedEntry {
                key,
                payload: s.payload.clone(),
                expires_at: s.expires_at,
            }));
        }
        all.sort_by_key(|e| e.expires_at);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PunishmentType;
    use chrono::Duration;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    fn key(user: u64) -> EntryKey {
        EntryKey::punishment(1, user, PunishmentType::VoiceMute)
    }

    #[test]
    fn test_sweep_returns_only_expired() {
        let registry = TimedActionRegistry::new("test");
        registry.add(key(1), "a", at(10));
        registry.add(key(2), "b", at(20));
        registry.add(key(3), "c", at(30));

        let swept = registry.sweep(at(20));
        let payloads: Vec<_> = swept.iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec!["a", "b"]);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains_key(&key(3)));
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let registry = TimedActionRegistry::new("test");
        registry.add(key(1), 1u32, at(0));
        registry.add(key(2), 2u32, at(5));

        assert_eq!(registry.sweep(at(10)).len(), 2);
        assert!(registry.sweep(at(10)).is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_multiple_entries_share_a_key() {
        let registry = TimedActionRegistry::new("test");
        registry.add(key(1), 100u64, at(1));
        registry.add(key(1), 101u64, at(50));
        registry.add(key(1), 102u64, at(2));

        let swept = registry.sweep(at(10));
        assert_eq!(swept.iter().map(|e| e.payload).collect::<Vec<_>>(), vec![100, 102]);
        assert_eq!(registry.next_expiry(&key(1)), Some(at(50)));
    }

    #[test]
    fn test_replace_keeps_single_entry() {
        let registry = TimedActionRegistry::new("test");
        registry.add(key(1), "old-1", at(10));
        registry.add(key(1), "old-2", at(20));

        assert_eq!(registry.replace(key(1), "new", at(100)), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.sweep(at(50)).is_empty());
        assert_eq!(registry.sweep(at(100))[0].payload, "new");
    }

    #[test]
    fn test_add_if_absent() {
        let registry = TimedActionRegistry::new("test");
        assert!(registry.add_if_absent(key(1), "first", at(10)));
        assert!(!registry.add_if_absent(key(1), "second", at(5)));
        assert_eq!(registry.pop_first(&key(1)), Some("first"));
        assert!(registry.add_if_absent(key(1), "third", at(5)));
    }

    #[test]
    fn test_remove_where_and_missing_key() {
        let registry = TimedActionRegistry::new("test");
        registry.add(key(1), 1, at(10));
        registry.add(key(1), 2, at(10));

        assert_eq!(registry.remove_where(&key(1), |p| *p == 2), 1);
        assert_eq!(registry.remove_where(&key(1), |_| true), 1);
        assert!(!registry.contains_key(&key(1)));

        // Cancelling something that is not there is a no-op
        assert_eq!(registry.remove_where(&key(9), |_| true), 0);
    }

    #[test]
    fn test_pop_first_is_one_shot() {
        let registry = TimedActionRegistry::new("test");
        registry.add(key(1), "session", at(30));

        assert_eq!(registry.pop_first(&key(1)), Some("session"));
        assert_eq!(registry.pop_first(&key(1)), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_keys_where() {
        let registry = TimedActionRegistry::new("test");
        registry.add(EntryKey::punishment(1, 5, PunishmentType::VoiceMute), 1, at(10));
        registry.add(EntryKey::punishment(1, 5, PunishmentType::Deafen), 2, at(10));
        registry.add(EntryKey::punishment(1, 6, PunishmentType::Deafen), 3, at(10));

        let removed = registry.remove_keys_where(|k| k.guild_id == 1 && k.entity_id == 5);
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_adds_and_sweeps_deliver_each_entry_once() {
        let registry = Arc::new(TimedActionRegistry::new("test"));
        let now = at(0);

        let adders: Vec<_> = (0..4u64)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..500u64 {
                        let id = t * 1000 + i;
                        registry.add(key(id % 37), id, now - Duration::seconds(1));
                    }
                })
            })
            .collect();

        let sweeper = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..200 {
                    seen.extend(registry.sweep(now).into_iter().map(|e| e.payload));
                }
                seen
            })
        };

        for adder in adders {
            adder.join().unwrap();
        }
        let mut delivered = sweeper.join().unwrap();
        delivered.extend(registry.sweep(now).into_iter().map(|e| e.payload));

        let unique: HashSet<_> = delivered.iter().copied().collect();
        assert_eq!(delivered.len(), 2000);
        assert_eq!(unique.len(), 2000);
    }

    #[test]
    fn test_cancel_racing_sweep_claims_once() {
        let registry = Arc::new(TimedActionRegistry::new("test"));
        for user in 0..1000u64 {
            registry.add(key(user), user, at(0));
        }

        let canceller = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                let mut cancelled = 0;
                for user in 0..1000u64 {
                    cancelled += registry.remove_where(&key(user), |_| true);
                }
                cancelled
            })
        };
        let swept = registry.sweep(at(1)).len();
        let cancelled = canceller.join().unwrap();

        assert_eq!(swept + cancelled, 1000);
    }
}
