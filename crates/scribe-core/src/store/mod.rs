//! Shared key-value store port.
//!
//! Every piece of cross-handler state (album buffers, flush locks, busy records,
//! cached results, save ledgers, job queues) lives behind this trait. Each method
//! is a single atomic operation. Only the two `move` primitives touch more than one
//! key; callers never assume any other multi-key transaction.

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    domain::{TaskId, UserId},
    Result,
};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStore;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Overwrite a string value, optionally with an expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Create-if-absent, optionally with an expiry. `true` means the caller created the key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    async fn del(&self, key: &str) -> Result<bool>;

    /// Refresh the expiry of an existing key. `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remaining lifetime of a key. `None` when the key is missing or never expires.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Increment a counter, creating it at zero first.
    async fn incr(&self, key: &str) -> Result<u64>;

    /// Append to a list, returning the new length.
    async fn rpush(&self, key: &str, value: &str) -> Result<usize>;

    async fn llen(&self, key: &str) -> Result<usize>;

    /// Read a whole list and delete it in one step.
    async fn take_list(&self, key: &str) -> Result<Vec<String>>;

    /// Add a set member. `true` if it was not present before.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Add a sorted-set member or move it to a new score.
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()>;

    /// Re-score a member only if it is still present.
    async fn zrescore(&self, key: &str, member: &str, score: i64) -> Result<bool>;

    /// `true` if the member was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    async fn zcard(&self, key: &str) -> Result<usize>;

    /// Lowest score in the set.
    async fn zmin(&self, key: &str) -> Result<Option<i64>>;

    /// Remove and return members scored at or below `max`, lowest first.
    async fn zpop_upto(&self, key: &str, max: i64) -> Result<Vec<String>>;

    /// Remove and return the `count` lowest-scored members.
    async fn zpop_min(&self, key: &str, count: usize) -> Result<Vec<String>>;

    /// Move every member of sorted set `from` scored at or below `max` to the
    /// tail of list `to`, lowest first, in one step.
    async fn move_due(&self, from: &str, to: &str, max: i64) -> Result<Vec<String>>;

    /// Pop the head of list `from` and add it to sorted set `to` at `score`,
    /// in one step.
    async fn move_head(&self, from: &str, to: &str, score: i64) -> Result<Option<String>>;
}

/// Key layout shared by every component.
pub mod keys {
    use super::*;

    pub fn busy(user_id: UserId) -> String {
        format!("u:{}:task", user_id.0)
    }

    pub fn media_group(group_id: &str) -> String {
        format!("mgroup:{group_id}")
    }

    pub fn media_group_last_update(group_id: &str) -> String {
        format!("mgroup:{group_id}:last")
    }

    pub fn media_group_timer(group_id: &str) -> String {
        format!("mgroup:{group_id}:timer")
    }

    pub fn result(task_id: &TaskId) -> String {
        format!("task:{}:result", task_id.0)
    }

    pub fn saved(user_id: UserId, task_id: &TaskId) -> String {
        format!("task:{}:saved:{}", task_id.0, user_id.0)
    }

    pub fn saving(user_id: UserId, task_id: &TaskId, tag: &str) -> String {
        format!("task:{}:saving:{}:{tag}", task_id.0, user_id.0)
    }

    /// Per-kind queue keys: `queue:{kind}:{part}`.
    pub fn queue(kind: &str, part: &str) -> String {
        format!("queue:{kind}:{part}")
    }

    pub fn queue_job(kind: &str, job_id: &str) -> String {
        format!("queue:{kind}:job:{job_id}")
    }

    pub fn queue_lease(kind: &str, job_id: &str) -> String {
        format!("queue:{kind}:lease:{job_id}")
    }
}
