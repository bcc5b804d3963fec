//! Durable key-value collections backing games, users, the matchmaking
//! queue, match history, agent ratings, and cross-instance events
//! (spec §4.10). Everything in this module is a thin typed wrapper around
//! `sled` trees: collections never share a tree, so a prefix scan over one
//! collection never touches another's keys.

use crate::error::CoreError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sled::{IVec, Tree};
use std::time::Duration;

/// A single named collection. Values are `serde_json`-encoded; keys are the
/// caller's choice of byte representation (usually a UUID's bytes, or a
/// `session_id:move_number` composite for ordered scans).
#[derive(Clone)]
pub struct Collection {
    tree: Tree,
}

impl Collection {
    pub fn get<T: DeserializeOwned>(&self, key: impl AsRef<[u8]>) -> Result<Option<T>, CoreError> {
        match self.tree.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put<T: Serialize>(&self, key: impl AsRef<[u8]>, value: &T) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec(value)?;
        self.tree.insert(key, bytes)?;
        Ok(())
    }

    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<(), CoreError> {
        self.tree.remove(key)?;
        Ok(())
    }

    /// Compare-and-swap update: reads the current value, applies `update`,
    /// and writes it back only if nobody else has written to `key` in the
    /// meantime. Returns `Ok(None)` and does not retry on contention — the
    /// caller (typically a move-commit) is expected to re-read and retry
    /// itself, surfacing a `CoreError::Conflict` to its own caller if it
    /// gives up.
    pub fn compare_and_swap<T, F>(&self, key: impl AsRef<[u8]>, update: F) -> Result<Option<T>, CoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> Result<T, CoreError>,
    {
        let key = key.as_ref();
        let old_bytes = self.tree.get(key)?;
        let old_value = match &old_bytes {
            Some(b) => Some(serde_json::from_slice::<T>(b)?),
            None => None,
        };
        let new_value = update(old_value)?;
        let new_bytes = serde_json::to_vec(&new_value)?;
        let cas_result = self.tree.compare_and_swap(key, old_bytes, Some(new_bytes))?;
        match cas_result {
            Ok(()) => Ok(Some(new_value)),
            Err(_) => Ok(None),
        }
    }

    /// Lists every value under `prefix`, in key order.
    pub fn scan_prefix<T: DeserializeOwned>(&self, prefix: impl AsRef<[u8]>) -> Result<Vec<T>, CoreError> {
        let mut out = Vec::new();
        for entry in self.tree.scan_prefix(prefix) {
            let (_, bytes) = entry?;
            out.push(serde_json::from_slice(&bytes)?);
        }
        Ok(out)
    }

    pub fn contains(&self, key: impl AsRef<[u8]>) -> Result<bool, CoreError> {
        Ok(self.tree.contains_key(key)?)
    }

    /// Attempts to acquire a short-lived lock by inserting `holder` under
    /// `key` only if the key is absent or its existing value has expired.
    /// Used by the matchmaker to serialize ticks across instances sharing
    /// one database.
    pub fn try_acquire_lock(&self, key: impl AsRef<[u8]>, holder: &str, lease: Duration, now_ms: u64) -> Result<bool, CoreError> {
        let key = key.as_ref();
        #[derive(Serialize, serde::Deserialize)]
        struct Lease {
            holder: String,
            expires_at_ms: u64,
        }
        let new_lease = Lease { holder: holder.to_string(), expires_at_ms: now_ms + lease.as_millis() as u64 };
        let new_bytes = serde_json::to_vec(&new_lease)?;

        loop {
            let current: Option<IVec> = self.tree.get(key)?;
            let acquirable = match &current {
                None => true,
                Some(bytes) => match serde_json::from_slice::<Lease>(bytes) {
                    Ok(existing) => existing.expires_at_ms <= now_ms,
                    Err(_) => true,
                },
            };
            if !acquirable {
                return Ok(false);
            }
            match self.tree.compare_and_swap(key, current, Some(new_bytes.clone()))? {
                Ok(()) => return Ok(true),
                Err(_) => continue,
            }
        }
    }
}

/// Opens (or creates) the on-disk database at `data_dir` and exposes each
/// named collection as a typed [`Collection`] handle.
pub struct Store {
    db: sled::Db,
}

impl Store {
    pub fn open(data_dir: &str) -> Result<Self, CoreError> {
        let db = sled::open(data_dir).map_err(|e| CoreError::fatal(format!("failed to open store at {data_dir}: {e}")))?;
        Ok(Self { db })
    }

    fn collection(&self, name: &str) -> Result<Collection, CoreError> {
        Ok(Collection { tree: self.db.open_tree(name)? })
    }

    pub fn games(&self) -> Result<Collection, CoreError> {
        self.collection("games")
    }

    pub fn moves(&self) -> Result<Collection, CoreError> {
        self.collection("moves")
    }

    pub fn users(&self) -> Result<Collection, CoreError> {
        self.collection("users")
    }

    pub fn queue_entries(&self) -> Result<Collection, CoreError> {
        self.collection("queue_entries")
    }

    pub fn match_history(&self) -> Result<Collection, CoreError> {
        self.collection("match_history")
    }

    pub fn agent_ratings(&self) -> Result<Collection, CoreError> {
        self.collection("agent_ratings")
    }

    pub fn ws_events(&self) -> Result<Collection, CoreError> {
        self.collection("ws_events")
    }

    pub fn locks(&self) -> Result<Collection, CoreError> {
        self.collection("locks")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Counter {
        value: i32,
    }

    fn temp_store() -> Store {
        let dir = std::env::temp_dir().join(format!("chesscore_store_test_{}", uuid::Uuid::new_v4()));
        Store::open(dir.to_str().unwrap()).unwrap()
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = temp_store();
        let games = store.games().unwrap();
        games.put("k1", &Counter { value: 5 }).unwrap();
        let loaded: Option<Counter> = games.get("k1").unwrap();
        assert_eq!(loaded, Some(Counter { value: 5 }));
    }

    #[test]
    fn compare_and_swap_fails_on_concurrent_write() {
        let store = temp_store();
        let games = store.games().unwrap();
        games.put("k2", &Counter { value: 1 }).unwrap();

        let result: Option<Counter> = games
            .compare_and_swap("k2", |existing: Option<Counter>| {
                // Simulate a racing writer landing between our read and our write.
                games.put("k2", &Counter { value: 999 }).unwrap();
                Ok(Counter { value: existing.unwrap().value + 1 })
            })
            .unwrap();
        assert_eq!(result, None);
        let final_value: Option<Counter> = games.get("k2").unwrap();
        assert_eq!(final_value, Some(Counter { value: 999 }));
    }

    #[test]
    fn scan_prefix_returns_matching_keys_only() {
        let store = temp_store();
        let moves = store.moves().unwrap();
        moves.put("session-a:0001", &Counter { value: 1 }).unwrap();
        moves.put("session-a:0002", &Counter { value: 2 }).unwrap();
        moves.put("session-b:0001", &Counter { value: 3 }).unwrap();
        let results: Vec<Counter> = moves.scan_prefix("session-a:").unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn lock_cannot_be_reacquired_before_lease_expires() {
        let store = temp_store();
        let locks = store.locks().unwrap();
        assert!(locks.try_acquire_lock("matchmaker", "instance-1", Duration::from_secs(5), 1_000).unwrap());
        assert!(!locks.try_acquire_lock("matchmaker", "instance-2", Duration::from_secs(5), 2_000).unwrap());
        assert!(locks.try_acquire_lock("matchmaker", "instance-2", Duration::from_secs(5), 7_000).unwrap());
    }
}
