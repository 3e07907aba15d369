//! Sliding-window rate limiting for the buy route, backed by a Redis sorted
//! set per user. The limiter fails open: a Redis fault must not turn into a
//! total denial of the sale.

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use redis::Script;
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::warn;
use uuid::Uuid;

use crate::api::{reject, AppState};

const MAX_BODY_BYTES: usize = 64 * 1024;

/// Prune the window, count, and admit in one script; returns -1 when the
/// caller is over the limit.
const RATE_LIMIT_LUA: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local windowStart = tonumber(ARGV[2])
local windowSec = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '0', windowStart)

local count = redis.call('ZCARD', key)

if count < tonumber(ARGV[5]) then
  redis.call('ZADD', key, now, member)
  redis.call('EXPIRE', key, windowSec)
  return count + 1
else
  return -1
end
"#;

pub async fn buy_rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    // The limiter key comes from the body, which downstream extractors also
    // need; buffer it and hand the handler a rebuilt request.
    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return reject(StatusCode::BAD_REQUEST, "unreadable request body").into_response();
        }
    };

    let key = match extract_user_id(&bytes) {
        Some(user_id) if user_id > 0 => format!("rate_limit:flash_sale:user:{user_id}"),
        _ => format!("rate_limit:flash_sale:ip:{}", client_ip(&parts)),
    };
    let req = Request::from_parts(parts, Body::from(bytes));

    let now = Utc::now().timestamp();
    let window_secs = state.buy_rate_window.as_secs() as i64;
    let member = format!("{now}-{}", Uuid::new_v4());

    let mut kv = state.kv.clone();
    let admitted: redis::RedisResult<i64> = Script::new(RATE_LIMIT_LUA)
        .key(&key)
        .arg(now)
        .arg(now - window_secs)
        .arg(window_secs)
        .arg(member)
        .arg(state.buy_rate_limit)
        .invoke_async(&mut kv)
        .await;

    match admitted {
        Ok(n) if n < 0 => {
            reject(StatusCode::TOO_MANY_REQUESTS, "too many requests, slow down").into_response()
        }
        Ok(_) => next.run(req).await,
        Err(e) => {
            warn!("rate limiter unavailable, admitting request: {e}");
            next.run(req).await
        }
    }
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    #[serde(default)]
    user_id: i64,
}

fn extract_user_id(body: &[u8]) -> Option<i64> {
    serde_json::from_slice::<RateLimitBody>(body)
        .ok()
        .map(|b| b.user_id)
}

fn client_ip(parts: &Parts) -> String {
    if let Some(forwarded) = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_is_read_from_the_body() {
        assert_eq!(
            extract_user_id(br#"{"product_id": 7, "user_id": 42, "quantity": 1}"#),
            Some(42)
        );
    }

    #[test]
    fn missing_user_id_defaults_to_zero() {
        assert_eq!(extract_user_id(br#"{"product_id": 7}"#), Some(0));
    }

    #[test]
    fn malformed_body_yields_none() {
        assert_eq!(extract_user_id(b"not json"), None);
    }
}
