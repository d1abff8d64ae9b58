//! Redis-backed store for multi-instance deployments.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, Script};

use crate::{errors::Error, store::KeyValueStore, Result};

const MOVE_DUE: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('RPUSH', KEYS[2], id)
end
return due
";

const MOVE_HEAD: &str = r"
local id = redis.call('LPOP', KEYS[1])
if id then
  redis.call('ZADD', KEYS[2], ARGV[1], id)
end
return id
";

const RESCORE: &str = r"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
  return 1
end
return 0
";

#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    scripts: Arc<Scripts>,
}

struct Scripts {
    move_due: Script,
    move_head: Script,
    rescore: Script,
}

impl RedisStore {
    /// Connect to Redis (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(Self::map_err)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(Self::map_err)?;
        let scripts = Arc::new(Scripts {
            move_due: Script::new(MOVE_DUE),
            move_head: Script::new(MOVE_HEAD),
            rescore: Script::new(RESCORE),
        });
        Ok(Self { conn, scripts })
    }

    fn map_err(e: redis::RedisError) -> Error {
        Error::Store(format!("redis error: {e}"))
    }

    fn millis(ttl: Duration) -> u64 {
        (ttl.as_millis() as u64).max(1)
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(Self::map_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(Self::millis(ttl));
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(Self::map_err)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(Self::millis(ttl));
        }
        let reply = cmd
            .arg("NX")
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let n = redis::cmd("DEL")
            .arg(key)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(n > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let n = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(Self::millis(ttl))
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(n == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn.clone();
        let ms = redis::cmd("PTTL")
            .arg(key)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(Self::map_err)?;
        // -2: missing, -1: no expiry.
        Ok((ms >= 0).then(|| Duration::from_millis(ms as u64)))
    }

    async fn incr(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        redis::cmd("INCR")
            .arg(key)
            .query_async::<_, u64>(&mut conn)
            .await
            .map_err(Self::map_err)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async::<_, usize>(&mut conn)
            .await
            .map_err(Self::map_err)
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        redis::cmd("LLEN")
            .arg(key)
            .query_async::<_, usize>(&mut conn)
            .await
            .map_err(Self::map_err)
    }

    async fn take_list(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let (items,): (Vec<String>,) = redis::pipe()
            .atomic()
            .cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .cmd("DEL")
            .arg(key)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(items)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let n = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(n == 1)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut members = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async::<_, Vec<String>>(&mut conn)
            .await
            .map_err(Self::map_err)?;
        members.sort();
        Ok(members)
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(Self::map_err)
    }

    async fn zrescore(&self, key: &str, member: &str, score: i64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let n = self
            .scripts
            .rescore
            .key(key)
            .arg(member)
            .arg(score)
            .invoke_async::<_, i64>(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(n == 1)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let n = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(n == 1)
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        redis::cmd("ZCARD")
            .arg(key)
            .query_async::<_, usize>(&mut conn)
            .await
            .map_err(Self::map_err)
    }

    async fn zmin(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let head = redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async::<_, Vec<(String, f64)>>(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(head.first().map(|(_, score)| *score as i64))
    }

    async fn zpop_upto(&self, key: &str, max: i64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let (due,): (Vec<String>,) = redis::pipe()
            .atomic()
            .cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max)
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(due)
    }

    async fn zpop_min(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let popped = redis::cmd("ZPOPMIN")
            .arg(key)
            .arg(count)
            .query_async::<_, Vec<(String, f64)>>(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(popped.into_iter().map(|(member, _)| member).collect())
    }

    async fn move_due(&self, from: &str, to: &str, max: i64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        self.scripts
            .move_due
            .key(from)
            .key(to)
            .arg(max)
            .invoke_async::<_, Vec<String>>(&mut conn)
            .await
            .map_err(Self::map_err)
    }

    async fn move_head(&self, from: &str, to: &str, score: i64) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.scripts
            .move_head
            .key(from)
            .key(to)
            .arg(score)
            .invoke_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(Self::map_err)
    }
}
