//! Redis side of the pipeline: the atomic reservation script, the
//! request-status hash, and the compensation primitives. Anything that
//! touches more than one key runs as a Lua script or an atomic pipeline.

use anyhow::{bail, Context, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;

use crate::models::RequestStatus;

pub fn stock_key(product_id: i64) -> String {
    format!("stock:{product_id}")
}

pub fn user_lock_key(product_id: i64, user_id: i64) -> String {
    format!("purchase_lock:{product_id}:{user_id}")
}

pub fn request_status_key(request_id: &str) -> String {
    format!("request_status:{request_id}")
}

pub fn idem_key(product_id: i64, user_id: i64, token: &str) -> String {
    format!("idem:{product_id}:{user_id}:{token}")
}

pub fn compensation_key(request_id: &str) -> String {
    format!("stock_compensated:{request_id}")
}

/// The reservation step. Idempotency lookup, one-per-user lock, stock
/// check-and-decrement, pending status hash, and the outbox XADD all execute
/// in one script: splitting any pair of them opens a race between concurrent
/// buyers.
const RESERVE_LUA: &str = r#"
local stockKey = KEYS[1]
local userLockKey = KEYS[2]
local requestStateKey = KEYS[3]
local idemKey = KEYS[4]
local streamKey = KEYS[5]

local quantity = tonumber(ARGV[1])
local requestID = ARGV[2]
local userID = ARGV[3]
local productID = ARGV[4]
local amount = ARGV[5]
local requestTTL = tonumber(ARGV[6])
local userLockTTL = tonumber(ARGV[7])
local idemTTL = tonumber(ARGV[8])

local existingReq = redis.call('GET', idemKey)
if existingReq then
  return 'IDEMPOTENT:' .. existingReq
end

if redis.call('EXISTS', userLockKey) == 1 then
  return 'DUPLICATE'
end

local current = tonumber(redis.call('GET', stockKey) or '0')
if current < quantity then
  return 'OUT_OF_STOCK'
end

redis.call('DECRBY', stockKey, quantity)
redis.call('SET', userLockKey, requestID, 'EX', userLockTTL)
redis.call('SET', idemKey, requestID, 'EX', idemTTL)
redis.call('HSET', requestStateKey,
  'request_id', requestID,
  'status', 'pending',
  'order_no', '',
  'reason', '',
  'user_id', userID,
  'product_id', productID,
  'quantity', quantity,
  'amount', amount
)
redis.call('EXPIRE', requestStateKey, requestTTL)
redis.call('XADD', streamKey, '*',
  'request_id', requestID,
  'product_id', productID,
  'user_id', userID,
  'quantity', quantity,
  'amount', amount
)
return 'OK'
"#;

/// SETNX marker keyed by request id makes restoration single-shot: replays
/// see the marker and leave the counter alone.
const COMPENSATE_LUA: &str = r#"
local lockKey = KEYS[1]
local stockKey = KEYS[2]
local quantity = tonumber(ARGV[1])
local ttlSec = tonumber(ARGV[2])

if redis.call('SETNX', lockKey, '1') == 1 then
  redis.call('EXPIRE', lockKey, ttlSec)
  redis.call('INCRBY', stockKey, quantity)
  return 1
end
return 0
"#;

/// Delete the user lock only while it still holds this request id, so a
/// later request's lock is never released by an older failure.
const RELEASE_LOCK_LUA: &str = r#"
local lockKey = KEYS[1]
local requestID = ARGV[1]
if redis.call('GET', lockKey) == requestID then
  return redis.call('DEL', lockKey)
end
return 0
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Stock decremented, locks written, event appended to the outbox.
    Reserved,
    /// The idempotency token already maps to an earlier request id.
    Idempotent(String),
    /// The user already holds the purchase slot for this product.
    Duplicate,
    OutOfStock,
}

impl ReserveOutcome {
    fn parse(raw: &str) -> Result<Self> {
        if let Some(prior) = raw.strip_prefix("IDEMPOTENT:") {
            return Ok(ReserveOutcome::Idempotent(prior.to_string()));
        }
        match raw {
            "OK" => Ok(ReserveOutcome::Reserved),
            "DUPLICATE" => Ok(ReserveOutcome::Duplicate),
            "OUT_OF_STOCK" => Ok(ReserveOutcome::OutOfStock),
            other => bail!("unexpected reserve script result {other:?}"),
        }
    }
}

pub struct ReserveParams<'a> {
    pub request_id: &'a str,
    pub product_id: i64,
    pub user_id: i64,
    pub quantity: i32,
    pub amount: i64,
    pub idem_token: &'a str,
    pub status_ttl_secs: i64,
    pub user_lock_ttl_secs: i64,
}

pub async fn reserve(
    kv: &mut ConnectionManager,
    stream: &str,
    p: &ReserveParams<'_>,
) -> Result<ReserveOutcome> {
    let raw: String = Script::new(RESERVE_LUA)
        .key(stock_key(p.product_id))
        .key(user_lock_key(p.product_id, p.user_id))
        .key(request_status_key(p.request_id))
        .key(idem_key(p.product_id, p.user_id, p.idem_token))
        .key(stream)
        .arg(p.quantity)
        .arg(p.request_id)
        .arg(p.user_id)
        .arg(p.product_id)
        .arg(p.amount)
        .arg(p.status_ttl_secs)
        .arg(p.user_lock_ttl_secs)
        .arg(p.status_ttl_secs)
        .invoke_async(kv)
        .await
        .context("reserve script")?;
    ReserveOutcome::parse(&raw)
}

#[derive(Debug, Clone)]
pub struct RequestState {
    pub request_id: String,
    pub status: RequestStatus,
    pub order_no: String,
    pub reason: String,
}

/// Hot-path read of the request status hash. `None` means the key is absent
/// and the caller should fall back to the database.
pub async fn get_request_state(
    kv: &mut ConnectionManager,
    request_id: &str,
) -> Result<Option<RequestState>> {
    let map: HashMap<String, String> = kv.hgetall(request_status_key(request_id)).await?;
    if map.is_empty() {
        return Ok(None);
    }
    Ok(Some(RequestState {
        request_id: request_id.to_string(),
        status: RequestStatus::parse(map.get("status").map(String::as_str).unwrap_or_default()),
        order_no: map.get("order_no").cloned().unwrap_or_default(),
        reason: map.get("reason").cloned().unwrap_or_default(),
    }))
}

/// Overwrite the status hash and refresh its TTL in one atomic pipeline.
pub async fn put_request_state(
    kv: &mut ConnectionManager,
    request_id: &str,
    status: RequestStatus,
    order_no: &str,
    reason: &str,
    ttl_secs: i64,
) -> Result<()> {
    let key = request_status_key(request_id);
    let mut pipe = redis::pipe();
    pipe.atomic()
        .hset_multiple(
            &key,
            &[
                ("request_id", request_id),
                ("status", status.as_str()),
                ("order_no", order_no),
                ("reason", reason),
            ],
        )
        .ignore();
    if ttl_secs > 0 {
        pipe.expire(&key, ttl_secs).ignore();
    }
    let _: () = pipe.query_async(kv).await?;
    Ok(())
}

/// Outlives any sale the marker could belong to.
const COMPENSATION_TTL_SECS: i64 = 7 * 24 * 3600;

/// Restore stock for a failed request, at most once per request id.
/// Returns whether this call was the one that applied the restoration.
pub async fn compensate_stock_once(
    kv: &mut ConnectionManager,
    request_id: &str,
    product_id: i64,
    quantity: i64,
) -> Result<bool> {
    let applied: i64 = Script::new(COMPENSATE_LUA)
        .key(compensation_key(request_id))
        .key(stock_key(product_id))
        .arg(quantity)
        .arg(COMPENSATION_TTL_SECS)
        .invoke_async(kv)
        .await
        .context("compensate script")?;
    Ok(applied == 1)
}

/// Claim the single-shot marker without touching the stock counter, for
/// requests that never reserved anything. A later restoration attempt for
/// the same request id finds the marker and stays a no-op.
pub async fn claim_compensation_marker(
    kv: &mut ConnectionManager,
    request_id: &str,
) -> Result<bool> {
    let claimed: Option<String> = redis::cmd("SET")
        .arg(compensation_key(request_id))
        .arg("1")
        .arg("NX")
        .arg("EX")
        .arg(COMPENSATION_TTL_SECS)
        .query_async(kv)
        .await?;
    Ok(claimed.is_some())
}

pub async fn release_user_lock_if_match(
    kv: &mut ConnectionManager,
    product_id: i64,
    user_id: i64,
    request_id: &str,
) -> Result<()> {
    let _: i64 = Script::new(RELEASE_LOCK_LUA)
        .key(user_lock_key(product_id, user_id))
        .arg(request_id)
        .invoke_async(kv)
        .await
        .context("release lock script")?;
    Ok(())
}

/// Preheat: copy the database stock value into the live counter.
pub async fn set_stock(
    kv: &mut ConnectionManager,
    product_id: i64,
    stock: i64,
    ttl_secs: u64,
) -> Result<()> {
    let _: () = kv.set_ex(stock_key(product_id), stock, ttl_secs).await?;
    Ok(())
}

/// A missing counter reads as zero, matching a sold-out or never-preheated
/// product.
pub async fn get_stock(kv: &mut ConnectionManager, product_id: i64) -> Result<i64> {
    let value: Option<i64> = kv.get(stock_key(product_id)).await?;
    Ok(value.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_scheme_is_stable() {
        assert_eq!(stock_key(7), "stock:7");
        assert_eq!(user_lock_key(7, 42), "purchase_lock:7:42");
        assert_eq!(request_status_key("abc"), "request_status:abc");
        assert_eq!(idem_key(7, 42, "k1"), "idem:7:42:k1");
        assert_eq!(compensation_key("abc"), "stock_compensated:abc");
    }

    #[test]
    fn reserve_outcomes_parse() {
        assert_eq!(
            ReserveOutcome::parse("OK").unwrap(),
            ReserveOutcome::Reserved
        );
        assert_eq!(
            ReserveOutcome::parse("DUPLICATE").unwrap(),
            ReserveOutcome::Duplicate
        );
        assert_eq!(
            ReserveOutcome::parse("OUT_OF_STOCK").unwrap(),
            ReserveOutcome::OutOfStock
        );
        assert_eq!(
            ReserveOutcome::parse("IDEMPOTENT:prior-id").unwrap(),
            ReserveOutcome::Idempotent("prior-id".to_string())
        );
    }

    #[test]
    fn unexpected_script_result_is_an_error() {
        assert!(ReserveOutcome::parse("WAT").is_err());
    }
}
