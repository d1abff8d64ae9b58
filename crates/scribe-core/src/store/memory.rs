use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};

use crate::{errors::Error, store::KeyValueStore, Result};

#[derive(Clone, Debug)]
enum Value {
    Str(String),
    List(Vec<String>),
    Set(BTreeSet<String>),
    Sorted(BTreeMap<String, i64>),
}

#[derive(Clone, Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// In-process store with lazy expiry on the tokio clock.
///
/// Used for single-instance deployments and tests. Expiry follows `tokio::time`,
/// so a paused test clock drives TTLs deterministically.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn wrong_type(key: &str) -> Error {
        Error::Store(format!("WRONGTYPE operation against key {key}"))
    }
}

fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if map.get(key).map(|e| !e.is_live(now)).unwrap_or(false) {
        map.remove(key);
    }
    map.get_mut(key)
}

/// Live list at `key`, created empty when missing.
fn list_entry<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Result<&'a mut Vec<String>> {
    if live(map, key).is_none() {
        map.insert(
            key.to_string(),
            Entry {
                value: Value::List(Vec::new()),
                expires_at: None,
            },
        );
    }
    match map.get_mut(key).map(|e| &mut e.value) {
        Some(Value::List(items)) => Ok(items),
        _ => Err(MemoryStore::wrong_type(key)),
    }
}

/// Live sorted set at `key`, created empty when missing.
fn sorted_entry<'a>(
    map: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut BTreeMap<String, i64>> {
    if live(map, key).is_none() {
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Sorted(BTreeMap::new()),
                expires_at: None,
            },
        );
    }
    match map.get_mut(key).map(|e| &mut e.value) {
        Some(Value::Sorted(members)) => Ok(members),
        _ => Err(MemoryStore::wrong_type(key)),
    }
}

/// Members ordered by score, then by name.
fn by_score(members: &BTreeMap<String, i64>) -> Vec<(i64, String)> {
    let mut out: Vec<(i64, String)> = members.iter().map(|(m, s)| (*s, m.clone())).collect();
    out.sort();
    out
}

fn pop_upto(members: &mut BTreeMap<String, i64>, max: i64) -> Vec<String> {
    let due: Vec<String> = by_score(members)
        .into_iter()
        .take_while(|(score, _)| *score <= max)
        .map(|(_, m)| m)
        .collect();
    for m in &due {
        members.remove(m);
    }
    due
}

/// Drop empty collections so `exists`-style checks match Redis.
fn drop_if_empty(map: &mut HashMap<String, Entry>, key: &str) {
    let empty = match map.get(key).map(|e| &e.value) {
        Some(Value::List(items)) => items.is_empty(),
        Some(Value::Sorted(members)) => members.is_empty(),
        _ => false,
    };
    if empty {
        map.remove(key);
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut map = self.entries.lock().await;
        match live(&mut map, key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut map = self.entries.lock().await;
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut map = self.entries.lock().await;
        if live(&mut map, key).is_some() {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut map = self.entries.lock().await;
        let existed = live(&mut map, key).is_some();
        map.remove(key);
        Ok(existed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut map = self.entries.lock().await;
        match live(&mut map, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut map = self.entries.lock().await;
        Ok(live(&mut map, key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn incr(&self, key: &str) -> Result<u64> {
        let mut map = self.entries.lock().await;
        let current = match live(&mut map, key).map(|e| &e.value) {
            None => 0,
            Some(Value::Str(s)) => s
                .parse::<u64>()
                .map_err(|_| Error::Store(format!("value at {key} is not an integer")))?,
            Some(_) => return Err(Self::wrong_type(key)),
        };
        let next = current + 1;
        let expires_at = map.get(key).and_then(|e| e.expires_at);
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<usize> {
        let mut map = self.entries.lock().await;
        let items = list_entry(&mut map, key)?;
        items.push(value.to_string());
        Ok(items.len())
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let mut map = self.entries.lock().await;
        match live(&mut map, key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::List(items)) => Ok(items.len()),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn take_list(&self, key: &str) -> Result<Vec<String>> {
        let mut map = self.entries.lock().await;
        match live(&mut map, key).map(|e| &e.value) {
            None => return Ok(Vec::new()),
            Some(Value::List(_)) => {}
            Some(_) => return Err(Self::wrong_type(key)),
        }
        match map.remove(key).map(|e| e.value) {
            Some(Value::List(items)) => Ok(items),
            _ => Ok(Vec::new()),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut map = self.entries.lock().await;
        if live(&mut map, key).is_none() {
            map.insert(
                key.to_string(),
                Entry {
                    value: Value::Set(BTreeSet::new()),
                    expires_at: None,
                },
            );
        }
        match map.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Set(members)) => Ok(members.insert(member.to_string())),
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut map = self.entries.lock().await;
        match live(&mut map, key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(members)) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut map = self.entries.lock().await;
        sorted_entry(&mut map, key)?.insert(member.to_string(), score);
        Ok(())
    }

    async fn zrescore(&self, key: &str, member: &str, score: i64) -> Result<bool> {
        let mut map = self.entries.lock().await;
        match live(&mut map, key).map(|e| &mut e.value) {
            None => Ok(false),
            Some(Value::Sorted(members)) => match members.get_mut(member) {
                Some(s) => {
                    *s = score;
                    Ok(true)
                }
                None => Ok(false),
            },
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut map = self.entries.lock().await;
        let removed = match live(&mut map, key).map(|e| &mut e.value) {
            None => false,
            Some(Value::Sorted(members)) => members.remove(member).is_some(),
            Some(_) => return Err(Self::wrong_type(key)),
        };
        drop_if_empty(&mut map, key);
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let mut map = self.entries.lock().await;
        match live(&mut map, key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::Sorted(members)) => Ok(members.len()),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn zmin(&self, key: &str) -> Result<Option<i64>> {
        let mut map = self.entries.lock().await;
        match live(&mut map, key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Sorted(members)) => Ok(members.values().min().copied()),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn zpop_upto(&self, key: &str, max: i64) -> Result<Vec<String>> {
        let mut map = self.entries.lock().await;
        let due = match live(&mut map, key).map(|e| &mut e.value) {
            None => Vec::new(),
            Some(Value::Sorted(members)) => pop_upto(members, max),
            Some(_) => return Err(Self::wrong_type(key)),
        };
        drop_if_empty(&mut map, key);
        Ok(due)
    }

    async fn zpop_min(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let mut map = self.entries.lock().await;
        let popped = match live(&mut map, key).map(|e| &mut e.value) {
            None => Vec::new(),
            Some(Value::Sorted(members)) => {
                let lowest: Vec<String> = by_score(members)
                    .into_iter()
                    .take(count)
                    .map(|(_, m)| m)
                    .collect();
                for m in &lowest {
                    members.remove(m);
                }
                lowest
            }
            Some(_) => return Err(Self::wrong_type(key)),
        };
        drop_if_empty(&mut map, key);
        Ok(popped)
    }

    async fn move_due(&self, from: &str, to: &str, max: i64) -> Result<Vec<String>> {
        let mut map = self.entries.lock().await;
        let due = match live(&mut map, from).map(|e| &mut e.value) {
            None => return Ok(Vec::new()),
            Some(Value::Sorted(members)) => pop_upto(members, max),
            Some(_) => return Err(Self::wrong_type(from)),
        };
        drop_if_empty(&mut map, from);
        if !due.is_empty() {
            list_entry(&mut map, to)?.extend(due.iter().cloned());
        }
        Ok(due)
    }

    async fn move_head(&self, from: &str, to: &str, score: i64) -> Result<Option<String>> {
        let mut map = self.entries.lock().await;
        // Type-check the destination before popping so a failure loses nothing.
        sorted_entry(&mut map, to)?;
        let head = match live(&mut map, from).map(|e| &mut e.value) {
            None => None,
            Some(Value::List(items)) if items.is_empty() => None,
            Some(Value::List(items)) => Some(items.remove(0)),
            Some(_) => return Err(Self::wrong_type(from)),
        };
        drop_if_empty(&mut map, from);
        match head {
            Some(id) => {
                sorted_entry(&mut map, to)?.insert(id.clone(), score);
                Ok(Some(id))
            }
            None => {
                drop_if_empty(&mut map, to);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_nx_only_succeeds_once_until_expiry() {
        let store = MemoryStore::new();
        let ttl = Some(Duration::from_secs(3));
        assert!(store.set_nx("lock", "1", ttl).await.unwrap());
        assert!(!store.set_nx("lock", "1", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.set_nx("lock", "2", ttl).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test(start_paused = true)]
    async fn expire_refreshes_list_ttl() {
        let store = MemoryStore::new();
        store.rpush("l", "a").await.unwrap();
        store.expire("l", Duration::from_secs(2)).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        store.rpush("l", "b").await.unwrap();
        store.expire("l", Duration::from_secs(2)).await.unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;

        assert_eq!(store.llen("l").await.unwrap(), 2);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.llen("l").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn take_list_drains_atomically() {
        let store = MemoryStore::new();
        store.rpush("l", "a").await.unwrap();
        store.rpush("l", "b").await.unwrap();
        assert_eq!(store.take_list("l").await.unwrap(), vec!["a", "b"]);
        assert!(store.take_list("l").await.unwrap().is_empty());
        assert_eq!(store.llen("l").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn wrong_type_is_an_error() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert!(store.rpush("k", "x").await.is_err());
        assert!(store.sadd("k", "x").await.is_err());
    }

    #[tokio::test]
    async fn sets_report_new_members() {
        let store = MemoryStore::new();
        assert!(store.sadd("s", "f").await.unwrap());
        assert!(!store.sadd("s", "f").await.unwrap());
        assert!(store.sadd("s", "n").await.unwrap());
        assert_eq!(store.smembers("s").await.unwrap(), vec!["f", "n"]);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_reports_remaining_lifetime() {
        let store = MemoryStore::new();
        store.set("k", "v", Some(Duration::from_secs(10))).await.unwrap();
        store.set("forever", "v", None).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(store.ttl("k").await.unwrap(), Some(Duration::from_secs(6)));
        assert_eq!(store.ttl("forever").await.unwrap(), None);
        assert_eq!(store.ttl("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_counts_from_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("n").await.unwrap(), 1);
        assert_eq!(store.incr("n").await.unwrap(), 2);
        store.set("s", "abc", None).await.unwrap();
        assert!(store.incr("s").await.is_err());
    }

    #[tokio::test]
    async fn sorted_sets_pop_lowest_scores_first() {
        let store = MemoryStore::new();
        store.zadd("z", "c", 30).await.unwrap();
        store.zadd("z", "a", 10).await.unwrap();
        store.zadd("z", "b", 20).await.unwrap();
        assert_eq!(store.zmin("z").await.unwrap(), Some(10));

        assert!(store.zrescore("z", "a", 40).await.unwrap());
        assert!(!store.zrescore("z", "missing", 1).await.unwrap());
        assert_eq!(store.zpop_upto("z", 25).await.unwrap(), vec!["b"]);
        assert_eq!(store.zpop_min("z", 1).await.unwrap(), vec!["c"]);
        assert!(store.zrem("z", "a").await.unwrap());
        assert_eq!(store.zcard("z").await.unwrap(), 0);
        assert_eq!(store.zmin("z").await.unwrap(), None);
    }

    #[tokio::test]
    async fn move_primitives_hand_members_between_keys() {
        let store = MemoryStore::new();
        store.zadd("delayed", "late", 500).await.unwrap();
        store.zadd("delayed", "due", 100).await.unwrap();
        store.rpush("wait", "first").await.unwrap();

        assert_eq!(store.move_due("delayed", "wait", 200).await.unwrap(), vec!["due"]);
        assert_eq!(store.llen("wait").await.unwrap(), 2);
        assert_eq!(store.zcard("delayed").await.unwrap(), 1);

        let head = store.move_head("wait", "active", 900).await.unwrap();
        assert_eq!(head.as_deref(), Some("first"));
        assert_eq!(store.zmin("active").await.unwrap(), Some(900));
        assert_eq!(
            store.move_head("wait", "active", 900).await.unwrap().as_deref(),
            Some("due")
        );
        assert!(store.move_head("wait", "active", 900).await.unwrap().is_none());
        assert_eq!(store.zcard("active").await.unwrap(), 2);
    }
}
