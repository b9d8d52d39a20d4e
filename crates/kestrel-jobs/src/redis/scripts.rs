//! Lua scripts run by [`RedisJobStore`](super::RedisJobStore).
//!
//! Each store operation is one script, so it executes atomically on the
//! server. Guarded scripts reply with a status string: `ok`, `not_found`,
//! `state:<state>`, `owner`, or `conflict`.

use redis::Script;

/// Checks that `KEYS[1]` exists, is leased, and is held by `ARGV[1]`.
const LEASE_GUARD: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 'not_found'
end
local state = redis.call('HGET', KEYS[1], 'state')
if state ~= 'leased' then
  return 'state:' .. state
end
if redis.call('HGET', KEYS[1], 'lease_owner') ~= ARGV[1] then
  return 'owner'
end
";

/// KEYS: job, pending set. ARGV: id, not_before ms, field/value pairs...
const ENQUEUE: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV, 3))
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
";

/// KEYS: leased set, pending sets in scan order.
/// ARGV: now ms, lease expiry ms, owner, job key prefix.
///
/// Ties on `not_before` fall back to member order, and job ids sort in
/// submission order.
const LEASE: &str = r"
local now = tonumber(ARGV[1])
for i = 2, #KEYS do
  local ids = redis.call('ZRANGEBYSCORE', KEYS[i], '-inf', now, 'LIMIT', 0, 1)
  if #ids > 0 then
    local id = ids[1]
    local job_key = ARGV[4] .. id
    redis.call('ZREM', KEYS[i], id)
    redis.call('HSET', job_key, 'state', 'leased', 'lease_owner', ARGV[3], 'lease_expiry', ARGV[2])
    redis.call('HINCRBY', job_key, 'attempts', 1)
    redis.call('ZADD', KEYS[1], ARGV[2], id)
    return redis.call('HGETALL', job_key)
  end
end
return {}
";

/// KEYS: job, leased set, done set. ARGV: owner, retention ms, id.
const ACK: &str = r"
redis.call('HSET', KEYS[1], 'state', 'done', 'retention_until', ARGV[2])
redis.call('HDEL', KEYS[1], 'lease_owner', 'lease_expiry')
redis.call('ZREM', KEYS[2], ARGV[3])
redis.call('ZADD', KEYS[3], ARGV[2], ARGV[3])
return 'ok'
";

/// KEYS: job, leased set, pending set, dead set.
/// ARGV: owner, expected retry_count, id, `requeue` | `dead`, retry_count,
/// not_before or retention ms, last error.
const FAIL: &str = r"
if redis.call('HGET', KEYS[1], 'retry_count') ~= ARGV[2] then
  return 'conflict'
end
redis.call('ZREM', KEYS[2], ARGV[3])
redis.call('HDEL', KEYS[1], 'lease_owner', 'lease_expiry')
if ARGV[4] == 'requeue' then
  redis.call('HSET', KEYS[1], 'state', 'pending', 'retry_count', ARGV[5], 'not_before', ARGV[6], 'last_error', ARGV[7])
  redis.call('ZADD', KEYS[3], ARGV[6], ARGV[3])
else
  redis.call('HSET', KEYS[1], 'state', 'dead_lettered', 'retry_count', ARGV[5], 'retention_until', ARGV[6], 'last_error', ARGV[7])
  redis.call('ZADD', KEYS[4], ARGV[6], ARGV[3])
end
return 'ok'
";

/// KEYS: job, leased set. ARGV: owner, now ms, id.
const ABANDON: &str = r"
redis.call('HSET', KEYS[1], 'lease_expiry', ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
return 'ok'
";

/// KEYS: leased set. ARGV: now ms, job key prefix, pending key prefix.
const RECLAIM: &str = r"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
local reclaimed = {}
for _, id in ipairs(ids) do
  local job_key = ARGV[2] .. id
  redis.call('ZREM', KEYS[1], id)
  if redis.call('HGET', job_key, 'state') == 'leased' then
    local priority = redis.call('HGET', job_key, 'priority')
    local not_before = redis.call('HGET', job_key, 'not_before')
    redis.call('HSET', job_key, 'state', 'pending')
    redis.call('HDEL', job_key, 'lease_owner', 'lease_expiry')
    redis.call('ZADD', ARGV[3] .. priority, not_before, id)
    table.insert(reclaimed, id)
  end
end
return reclaimed
";

/// KEYS: retention sets. ARGV: now ms, job key prefix.
const PURGE: &str = r"
local purged = 0
for i = 1, #KEYS do
  local ids = redis.call('ZRANGEBYSCORE', KEYS[i], '-inf', ARGV[1])
  for _, id in ipairs(ids) do
    redis.call('DEL', ARGV[2] .. id)
    redis.call('ZREM', KEYS[i], id)
    purged = purged + 1
  end
end
return purged
";

/// Compiled scripts, loaded lazily by `EVALSHA`.
pub(crate) struct Scripts {
    pub enqueue: Script,
    pub lease: Script,
    pub ack: Script,
    pub fail: Script,
    pub abandon: Script,
    pub reclaim: Script,
    pub purge: Script,
}

impl Scripts {
    pub fn new() -> Self {
        let guarded = |body: &str| Script::new(&format!("{LEASE_GUARD}{body}"));

        Self {
            enqueue: Script::new(ENQUEUE),
            lease: Script::new(LEASE),
            ack: guarded(ACK),
            fail: guarded(FAIL),
            abandon: guarded(ABANDON),
            reclaim: Script::new(RECLAIM),
            purge: Script::new(PURGE),
        }
    }
}
