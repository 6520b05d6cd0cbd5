use super::IdempotencyStore;
use crate::error::{DispatchError, DispatchResult};
use crate::idempotency::{IdempotencyRecord, Outcome, RecordState, Reservation, Settlement};
use crate::key_generator::IdempotencyKey;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const KEY_PREFIX: &str = "calendar-dispatch:";

// Returns the existing hash, or an empty array when the reservation was made.
const RESERVE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return redis.call('HGETALL', KEYS[1])
end
redis.call('HSET', KEYS[1], 'state', 'reserved', 'owner', ARGV[4], 'created_at', ARGV[1], 'expires_at', ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return {}
"#;

// 1 = renewed, 0 = not a live reservation of this owner
const RENEW_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'reserved' then
  return 0
end
if redis.call('HGET', KEYS[1], 'owner') ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'expires_at', ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return 1
"#;

// 0 = missing, 1 = already terminal, 2 = applied, 3 = owned by another job
const SETTLE_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
  return 0
end
if redis.call('HGET', KEYS[1], 'owner') ~= ARGV[3] then
  return 3
end
if state ~= 'reserved' then
  return 1
end
redis.call('HSET', KEYS[1], 'state', ARGV[1], 'outcome', ARGV[2])
return 2
"#;

/// Store backed by Redis hashes. Atomicity comes from running each
/// check-and-set as a Lua script; expiry is delegated to Redis key TTLs.
pub struct RedisStore {
    connection: MultiplexedConnection,
    reserve: Script,
    renew: Script,
    settle: Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> DispatchResult<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| DispatchError::Store(format!("Failed to create Redis client: {}", e)))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| DispatchError::Store(format!("Failed to connect to Redis: {}", e)))?;

        tracing::info!("Connected to Redis for idempotency records");

        Ok(Self {
            connection,
            reserve: Script::new(RESERVE_SCRIPT),
            renew: Script::new(RENEW_SCRIPT),
            settle: Script::new(SETTLE_SCRIPT),
        })
    }

    fn redis_key(key: &IdempotencyKey) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }
}

#[async_trait]
impl IdempotencyStore for RedisStore {
    async fn reserve(
        &self,
        key: &IdempotencyKey,
        owner: Uuid,
        ttl: Duration,
    ) -> DispatchResult<Reservation> {
        let record = IdempotencyRecord::reserved(key.clone(), owner, ttl);
        let mut conn = self.connection.clone();

        let fields: Vec<String> = self
            .reserve
            .key(Self::redis_key(key))
            .arg(epoch_millis(record.created_at))
            .arg(epoch_millis(record.expires_at))
            .arg(ttl_millis(ttl))
            .arg(owner.to_string())
            .invoke_async(&mut conn)
            .await?;

        if fields.is_empty() {
            return Ok(Reservation::Acquired);
        }
        match record_from_fields(key, fields)? {
            Some(existing) => Ok(Reservation::AlreadyReserved(existing)),
            None => Err(DispatchError::Store(format!(
                "Reservation for '{}' returned an empty record",
                key
            ))),
        }
    }

    async fn renew(&self, key: &IdempotencyKey, owner: Uuid, ttl: Duration) -> DispatchResult<bool> {
        let now = SystemTime::now();
        let expires_at = now.checked_add(ttl).unwrap_or(now);
        let mut conn = self.connection.clone();

        let renewed: i64 = self
            .renew
            .key(Self::redis_key(key))
            .arg(owner.to_string())
            .arg(epoch_millis(expires_at))
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        Ok(renewed == 1)
    }

    async fn settle(
        &self,
        key: &IdempotencyKey,
        owner: Uuid,
        outcome: Outcome,
    ) -> DispatchResult<Settlement> {
        let state = outcome.state();
        let encoded = serde_json::to_string(&outcome)?;
        let mut conn = self.connection.clone();

        let code: i64 = self
            .settle
            .key(Self::redis_key(key))
            .arg(state.as_str())
            .arg(encoded)
            .arg(owner.to_string())
            .invoke_async(&mut conn)
            .await?;

        match code {
            0 => Ok(Settlement::Missing),
            1 => Ok(Settlement::AlreadyTerminal),
            2 => Ok(Settlement::Applied),
            3 => Ok(Settlement::Superseded),
            other => Err(DispatchError::Store(format!(
                "Unexpected settle result {} for '{}'",
                other, key
            ))),
        }
    }

    async fn lookup(&self, key: &IdempotencyKey) -> DispatchResult<Option<IdempotencyRecord>> {
        let mut conn = self.connection.clone();
        let fields: Vec<String> = redis::cmd("HGETALL")
            .arg(Self::redis_key(key))
            .query_async(&mut conn)
            .await?;

        record_from_fields(key, fields)
    }

    async fn sweep_expired(&self) -> DispatchResult<usize> {
        // Redis evicts expired keys itself.
        Ok(0)
    }

    async fn ping(&self) -> DispatchResult<()> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

fn epoch_millis(time: SystemTime) -> u64 {
    let millis = time.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
    u64::try_from(millis).unwrap_or(u64::MAX)
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn from_epoch_millis(value: &str) -> DispatchResult<SystemTime> {
    let millis: u64 = value
        .parse()
        .map_err(|_| DispatchError::Store(format!("Invalid timestamp '{}'", value)))?;
    Ok(UNIX_EPOCH + Duration::from_millis(millis))
}

/// Rebuild a record from a flat `HGETALL` reply.
fn record_from_fields(
    key: &IdempotencyKey,
    fields: Vec<String>,
) -> DispatchResult<Option<IdempotencyRecord>> {
    if fields.is_empty() {
        return Ok(None);
    }

    let mut pairs = HashMap::new();
    let mut iter = fields.into_iter();
    while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
        pairs.insert(field, value);
    }

    let field = |name: &str| {
        pairs
            .get(name)
            .ok_or_else(|| DispatchError::Store(format!("Record '{}' lacks field '{}'", key, name)))
    };

    let state = RecordState::parse(field("state")?)
        .ok_or_else(|| DispatchError::Store(format!("Record '{}' has an unknown state", key)))?;

    let owner = match pairs.get("owner") {
        Some(id) => Some(Uuid::parse_str(id).map_err(|_| {
            DispatchError::Store(format!("Record '{}' has an invalid owner", key))
        })?),
        None => None,
    };

    let mut record = IdempotencyRecord {
        key: key.clone(),
        state: RecordState::Reserved,
        owner,
        result: None,
        error: None,
        created_at: from_epoch_millis(field("created_at")?)?,
        expires_at: from_epoch_millis(field("expires_at")?)?,
    };

    if state.is_terminal() {
        let outcome: Outcome = serde_json::from_str(field("outcome")?)?;
        if outcome.state() != state {
            return Err(DispatchError::Store(format!(
                "Record '{}' state does not match its outcome",
                key
            )));
        }
        record.settle(outcome);
    }

    Ok(Some(record))
}
