//! Lua scripts for owner-token operations.
//!
//! Each script runs atomically on the Redis server so a check and the
//! write that depends on it can never interleave with another client.

/// Delete a key only if it holds the caller's token.
///
/// Arguments:
/// - KEYS[1]: Lock key (e.g., `lock:mq:call:manager:{id}`)
/// - ARGV[1]: Owner token
///
/// Returns:
/// - 1: Deleted
/// - 0: Absent or held by another token
pub const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Extend a key's TTL only if it holds the caller's token.
///
/// Arguments:
/// - KEYS[1]: Lock key
/// - ARGV[1]: Owner token
/// - ARGV[2]: New TTL in milliseconds
///
/// Returns:
/// - 1: Extended
/// - 0: Absent or held by another token
pub const COMPARE_AND_EXPIRE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Take a key for an owner if free, or renew it if already owned.
///
/// Arguments:
/// - KEYS[1]: Claim key (e.g., `call:userLock:{userId}`)
/// - ARGV[1]: Owner (e.g., the call id)
/// - ARGV[2]: TTL in milliseconds
///
/// Returns:
/// - 1: Held by the owner after the call
/// - 0: Held by someone else
pub const CLAIM: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return 1
end
if current == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

/// Release a claim if held by the owner.
///
/// Arguments:
/// - KEYS[1]: Claim key
/// - ARGV[1]: Owner
///
/// Returns:
/// - 1: Key absent afterwards (released now or already gone)
/// - 0: Held by someone else
pub const RELEASE_CLAIM: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then
    return 1
end
if current == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
"#;
