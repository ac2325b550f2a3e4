//! redis state backend for `tollgate` (companion crate).
//!
//! Bring your own connection (typically a [`redis::aio::ConnectionManager`]). Each bucket is a
//! hash at `<prefix>:<identity>`; every write runs as one Lua script so the revision compare, the
//! field update, the revision bump and the expiry refresh are atomic on the server.

use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager};
use std::sync::Arc;
use std::time::Duration;
use tollgate::{BucketState, Snapshot, StateBackend, StoreError};

const FIELDS: [&str; 5] = ["capacity", "refill_period_nanos", "available", "last_refill_nanos", "revision"];

// ARGV[1] is the expected revision, or "" for an unconditional write. Values travel as decimal
// strings and are stored verbatim so no u64 passes through a Lua number.
const SET_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'revision') or '0'
if ARGV[1] ~= '' and ARGV[1] ~= current then
  return 0
end
redis.call('HSET', KEYS[1],
  'capacity', ARGV[2],
  'refill_period_nanos', ARGV[3],
  'available', ARGV[4],
  'last_refill_nanos', ARGV[5])
redis.call('HINCRBY', KEYS[1], 'revision', 1)
redis.call('PEXPIRE', KEYS[1], ARGV[6])
return 1
"#;

/// Bucket state stored in redis hashes.
#[derive(Clone)]
pub struct RedisStateBackend<C = ConnectionManager> {
    prefix: String,
    connection: C,
    script: Arc<redis::Script>,
}

impl<C> std::fmt::Debug for RedisStateBackend<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStateBackend")
            .field("prefix", &self.prefix)
            .field("connection", &"<redis connection>")
            .finish()
    }
}

impl<C> RedisStateBackend<C>
where
    C: ConnectionLike + Clone + Send + Sync,
{
    /// Create a backend over an existing connection; keys will be `prefix:<identity>`.
    ///
    /// # Errors
    /// Returns `Err` if the prefix is empty or contains control characters.
    pub fn new(prefix: impl Into<String>, connection: C) -> Result<Self, String> {
        let p: String = prefix.into();
        let p = p.trim().trim_end_matches(':').to_string();
        if p.is_empty() {
            return Err("prefix cannot be empty".to_string());
        }
        if p.chars().any(|c| c.is_control()) {
            return Err("prefix cannot contain control characters".to_string());
        }
        Ok(Self { prefix: p, connection, script: Arc::new(redis::Script::new(SET_SCRIPT)) })
    }

    /// Key under which `identity` is stored.
    pub fn key_for(&self, identity: &str) -> String {
        format!("{}:{}", self.prefix, identity)
    }
}

fn parse_field(name: &str, raw: Option<String>) -> Result<u64, StoreError> {
    let raw = raw.ok_or_else(|| StoreError::Corrupt(format!("field `{name}` is missing")))?;
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("field `{name}` is not an integer: {raw:?}")))
}

fn decode(values: Vec<Option<String>>) -> Result<Option<Snapshot>, StoreError> {
    if values.iter().all(Option::is_none) {
        return Ok(None);
    }
    if values.len() != FIELDS.len() {
        return Err(StoreError::Serialization(format!(
            "expected {} fields, got {}",
            FIELDS.len(),
            values.len()
        )));
    }
    let mut parsed = [0u64; 5];
    for ((slot, name), raw) in parsed.iter_mut().zip(FIELDS).zip(values) {
        *slot = parse_field(name, raw)?;
    }
    let [capacity, period, available, last_refill, revision] = parsed;
    Ok(Some(Snapshot {
        state: BucketState {
            capacity,
            refill_period: Duration::from_nanos(period),
            available,
            last_refill,
        },
        revision,
    }))
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl<C> StateBackend for RedisStateBackend<C>
where
    C: ConnectionLike + Clone + Send + Sync,
{
    async fn get(&self, identity: &str) -> Result<Option<Snapshot>, StoreError> {
        let mut conn = self.connection.clone();
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.key_for(identity))
            .arg(&FIELDS[..])
            .query_async(&mut conn)
            .await
            .map_err(StoreError::unavailable)?;
        decode(values)
    }

    async fn set(
        &self,
        identity: &str,
        state: &BucketState,
        ttl: Duration,
        expected: Option<u64>,
    ) -> Result<bool, StoreError> {
        let period = u64::try_from(state.refill_period.as_nanos()).map_err(|_| {
            StoreError::Serialization("refill period does not fit in u64 nanoseconds".into())
        })?;
        let key = self.key_for(identity);
        let expected_arg = expected.map(|rev| rev.to_string()).unwrap_or_default();

        let mut conn = self.connection.clone();
        let mut invocation = self.script.prepare_invoke();
        invocation
            .key(&key)
            .arg(expected_arg)
            .arg(state.capacity)
            .arg(period)
            .arg(state.available)
            .arg(state.last_refill)
            .arg(ttl_millis(ttl));
        let applied: i64 =
            invocation.invoke_async(&mut conn).await.map_err(StoreError::unavailable)?;

        if applied == 0 {
            tracing::debug!(target: "tollgate::redis", key = %key, "conditional write lost the race");
        }
        Ok(applied == 1)
    }
}
