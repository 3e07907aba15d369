//! HTTP surface. Responses use the `{code, data?, msg?}` envelope with
//! `code = 0` on success; the buy endpoint replies `pending` as soon as the
//! reservation script commits, and clients poll the result endpoint for the
//! terminal state.

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::{middleware, Router};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use redis::aio::ConnectionManager;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, warn};
use uuid::Uuid;

use crate::kv;
use crate::kv::{RequestState, ReserveOutcome, ReserveParams};
use crate::models::{NewOrderRequest, NewProduct, OrderRequest, Product, RequestStatus};
use crate::ratelimit;
use crate::schema::{order_requests, products};

type DbPool = Pool<AsyncPgConnection>;

type ApiResponse = (StatusCode, Json<Value>);

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub kv: ConnectionManager,
    pub order_event_stream: String,
    pub request_status_ttl: Duration,
    pub stock_ttl: Duration,
    pub preload_admin_token: String,
    pub buy_rate_limit: i64,
    pub buy_rate_window: Duration,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/api/products", get(list_products).post(create_product))
        .route("/api/flash_sale/preload/:product_id", post(preload_stock))
        .route("/api/flash_sale/stock/:product_id", get(read_stock))
        .route(
            "/api/flash_sale/buy",
            post(buy).layer(middleware::from_fn_with_state(
                state.clone(),
                ratelimit::buy_rate_limit,
            )),
        )
        .route("/api/flash_sale/result/:request_id", get(read_result))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

fn ok(data: Value) -> ApiResponse {
    (StatusCode::OK, Json(json!({ "code": 0, "data": data })))
}

fn ok_msg(msg: &str) -> ApiResponse {
    (StatusCode::OK, Json(json!({ "code": 0, "msg": msg })))
}

pub fn reject(status: StatusCode, msg: impl Into<String>) -> ApiResponse {
    (
        status,
        Json(json!({ "code": status.as_u16(), "msg": msg.into() })),
    )
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> ApiResponse {
    error!("{context}: {e}");
    reject(StatusCode::INTERNAL_SERVER_ERROR, format!("{context} failed"))
}

async fn ping() -> Json<Value> {
    Json(json!({ "msg": "pong" }))
}

async fn list_products(State(state): State<AppState>) -> ApiResponse {
    let mut conn = match state.pool.get().await {
        Ok(conn) => conn,
        Err(e) => return internal_error("database checkout", e),
    };
    match products::table
        .order(products::id.asc())
        .load::<Product>(&mut conn)
        .await
    {
        Ok(list) => ok(json!(list)),
        Err(e) => internal_error("product listing", e),
    }
}

#[derive(Debug, Deserialize)]
struct CreateProductRequest {
    name: String,
    stock: i64,
    sale_price: i64,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

async fn create_product(
    State(state): State<AppState>,
    payload: Result<Json<CreateProductRequest>, JsonRejection>,
) -> ApiResponse {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(e) => return reject(StatusCode::BAD_REQUEST, e.body_text()),
    };
    if req.name.trim().is_empty() {
        return reject(StatusCode::BAD_REQUEST, "name is required");
    }
    if req.stock < 1 {
        return reject(StatusCode::BAD_REQUEST, "stock must be >= 1");
    }
    if req.sale_price < 1 {
        return reject(StatusCode::BAD_REQUEST, "sale_price must be >= 1");
    }
    if req.end_time <= req.start_time {
        return reject(StatusCode::BAD_REQUEST, "end_time must be after start_time");
    }

    let mut conn = match state.pool.get().await {
        Ok(conn) => conn,
        Err(e) => return internal_error("database checkout", e),
    };
    let row = NewProduct {
        name: req.name,
        stock: req.stock,
        sale_price: req.sale_price,
        start_time: req.start_time,
        end_time: req.end_time,
    };
    match diesel::insert_into(products::table)
        .values(&row)
        .get_result::<Product>(&mut conn)
        .await
    {
        Ok(product) => ok(json!(product)),
        Err(e) => internal_error("product creation", e),
    }
}

/// Copies the database stock into the live Redis counter. Guarded by the
/// admin token so the counter cannot be reset mid-sale by arbitrary callers.
async fn preload_stock(
    State(state): State<AppState>,
    Path(product_id): Path<i64>,
    headers: HeaderMap,
) -> ApiResponse {
    let token = headers
        .get("X-Admin-Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if token != state.preload_admin_token {
        return reject(StatusCode::UNAUTHORIZED, "invalid admin token");
    }
    if product_id < 1 {
        return reject(StatusCode::BAD_REQUEST, "invalid product id");
    }

    let mut conn = match state.pool.get().await {
        Ok(conn) => conn,
        Err(e) => return internal_error("database checkout", e),
    };
    let product: Option<Product> = match products::table
        .find(product_id)
        .first(&mut conn)
        .await
        .optional()
    {
        Ok(product) => product,
        Err(e) => return internal_error("product lookup", e),
    };
    let Some(product) = product else {
        return reject(StatusCode::NOT_FOUND, "product not found");
    };

    let mut kv = state.kv.clone();
    match kv::set_stock(&mut kv, product_id, product.stock, state.stock_ttl.as_secs()).await {
        Ok(()) => ok_msg("stock preloaded"),
        Err(e) => internal_error("stock preload", e),
    }
}

async fn read_stock(State(state): State<AppState>, Path(product_id): Path<i64>) -> ApiResponse {
    if product_id < 1 {
        return reject(StatusCode::BAD_REQUEST, "invalid product id");
    }
    let mut kv = state.kv.clone();
    match kv::get_stock(&mut kv, product_id).await {
        Ok(stock) => ok(json!({ "stock": stock })),
        Err(e) => internal_error("stock read", e),
    }
}

#[derive(Debug, Deserialize)]
struct BuyRequest {
    product_id: i64,
    user_id: i64,
    #[serde(default)]
    quantity: Option<i32>,
}

/// The buy entry point: validate, reserve atomically in Redis, record the
/// pending request row, and reply `pending`; the relay and consumer carry
/// the request to its terminal state.
async fn buy(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<BuyRequest>, JsonRejection>,
) -> ApiResponse {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(e) => return reject(StatusCode::BAD_REQUEST, e.body_text()),
    };
    if req.product_id < 1 {
        return reject(StatusCode::BAD_REQUEST, "product_id must be >= 1");
    }
    if req.user_id < 1 {
        return reject(StatusCode::BAD_REQUEST, "user_id must be >= 1");
    }
    let quantity = req.quantity.unwrap_or(1);
    if quantity != 1 {
        return reject(StatusCode::BAD_REQUEST, "only one unit per purchase");
    }

    let mut conn = match state.pool.get().await {
        Ok(conn) => conn,
        Err(e) => return internal_error("database checkout", e),
    };
    let product: Option<Product> = match products::table
        .find(req.product_id)
        .first(&mut conn)
        .await
        .optional()
    {
        Ok(product) => product,
        Err(e) => return internal_error("product lookup", e),
    };
    let Some(product) = product else {
        return reject(StatusCode::NOT_FOUND, "product not found");
    };

    let now = Utc::now();
    if !sale_window_open(now, product.start_time, product.end_time) {
        return reject(StatusCode::BAD_REQUEST, "outside the sale window");
    }

    let request_id = Uuid::new_v4().to_string();
    let idem_token = headers
        .get("X-Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("auto-{request_id}"));
    let amount = product.sale_price * i64::from(quantity);
    let status_ttl_secs = state.request_status_ttl.as_secs() as i64;

    let mut kv = state.kv.clone();
    let outcome = kv::reserve(
        &mut kv,
        &state.order_event_stream,
        &ReserveParams {
            request_id: &request_id,
            product_id: req.product_id,
            user_id: req.user_id,
            quantity,
            amount,
            idem_token: &idem_token,
            status_ttl_secs,
            user_lock_ttl_secs: user_lock_ttl_secs(now, product.end_time),
        },
    )
    .await;

    match outcome {
        Ok(ReserveOutcome::OutOfStock) => reject(StatusCode::BAD_REQUEST, "out of stock"),
        Ok(ReserveOutcome::Duplicate) => reject(
            StatusCode::BAD_REQUEST,
            "already purchased, one unit per user",
        ),
        Ok(ReserveOutcome::Idempotent(prior_id)) => {
            // A retried client token resolves to its original request; report
            // wherever that request has gotten to.
            match load_request_state(&state, &prior_id).await {
                Ok(Some(request_state)) => respond_with_state(&request_state),
                Ok(None) => ok(json!({ "request_id": prior_id, "status": "pending" })),
                Err(e) => internal_error("request state lookup", e),
            }
        }
        Ok(ReserveOutcome::Reserved) => {
            let row = NewOrderRequest {
                request_id: request_id.clone(),
                user_id: req.user_id,
                product_id: req.product_id,
                quantity,
                amount,
                status: RequestStatus::Pending.as_str().to_string(),
                order_no: String::new(),
                error_msg: String::new(),
            };
            // The consumer may have synthesized a row for this id already if
            // the relayed event outran this write; that conflict is benign.
            let inserted = diesel::insert_into(order_requests::table)
                .values(&row)
                .on_conflict(order_requests::request_id)
                .do_nothing()
                .execute(&mut conn)
                .await;
            match inserted {
                Ok(_) => ok(json!({ "request_id": request_id, "status": "pending" })),
                Err(e) => {
                    // The reservation already consumed stock; undo it before
                    // surfacing the failure, or the unit is lost for good.
                    error!(request_id = %request_id, "pending request row write: {e}");
                    rollback_reservation(&state, &request_id, req.product_id, req.user_id, quantity)
                        .await;
                    reject(StatusCode::INTERNAL_SERVER_ERROR, "order intake failed")
                }
            }
        }
        Err(e) => internal_error("reservation", e),
    }
}

async fn read_result(State(state): State<AppState>, Path(request_id): Path<String>) -> ApiResponse {
    if request_id.trim().is_empty() {
        return reject(StatusCode::BAD_REQUEST, "request_id is required");
    }
    match load_request_state(&state, &request_id).await {
        Ok(Some(request_state)) => respond_with_state(&request_state),
        Ok(None) => reject(StatusCode::NOT_FOUND, "unknown request_id"),
        Err(e) => internal_error("request state lookup", e),
    }
}

/// Redis first, database as system of record on a miss; a hit from the
/// database is written back to Redis for later polls.
async fn load_request_state(state: &AppState, request_id: &str) -> Result<Option<RequestState>> {
    let mut kv = state.kv.clone();
    if let Some(cached) = kv::get_request_state(&mut kv, request_id).await? {
        return Ok(Some(cached));
    }

    let mut conn = state.pool.get().await?;
    let row: Option<OrderRequest> = order_requests::table
        .filter(order_requests::request_id.eq(request_id))
        .first(&mut conn)
        .await
        .optional()?;
    let Some(row) = row else {
        return Ok(None);
    };

    let request_state = RequestState {
        request_id: row.request_id,
        status: RequestStatus::parse(&row.status),
        order_no: row.order_no,
        reason: row.error_msg,
    };
    let ttl_secs = state.request_status_ttl.as_secs() as i64;
    if let Err(e) = kv::put_request_state(
        &mut kv,
        &request_state.request_id,
        request_state.status,
        &request_state.order_no,
        &request_state.reason,
        ttl_secs,
    )
    .await
    {
        warn!(request_id = %request_state.request_id, "request state write-back: {e:#}");
    }
    Ok(Some(request_state))
}

fn respond_with_state(request_state: &RequestState) -> ApiResponse {
    match request_state.status {
        RequestStatus::Pending => ok(json!({
            "status": "pending",
            "request_id": request_state.request_id,
        })),
        RequestStatus::Success => ok(json!({
            "status": "created",
            "order_no": request_state.order_no,
            "request_id": request_state.request_id,
        })),
        RequestStatus::Failed => ok(json!({
            "status": "failed",
            "request_id": request_state.request_id,
            "reason": request_state.reason,
        })),
    }
}

/// Best-effort undo of a reservation whose pending row could not be written.
/// Each step is idempotent, and the consumer repeats them when the relayed
/// event arrives with no matching row.
async fn rollback_reservation(
    state: &AppState,
    request_id: &str,
    product_id: i64,
    user_id: i64,
    quantity: i32,
) {
    let mut kv = state.kv.clone();
    match kv::compensate_stock_once(&mut kv, request_id, product_id, i64::from(quantity)).await {
        Ok(true) => warn!(request_id = %request_id, "reservation rolled back, stock restored"),
        Ok(false) => {}
        Err(e) => error!(request_id = %request_id, "reservation rollback: {e:#}"),
    }
    if let Err(e) = kv::release_user_lock_if_match(&mut kv, product_id, user_id, request_id).await {
        error!(request_id = %request_id, "user lock release: {e:#}");
    }
    let ttl_secs = state.request_status_ttl.as_secs() as i64;
    if let Err(e) = kv::put_request_state(
        &mut kv,
        request_id,
        RequestStatus::Failed,
        "",
        "order_intake_failed",
        ttl_secs,
    )
    .await
    {
        warn!(request_id = %request_id, "request state write: {e:#}");
    }
}

fn sale_window_open(now: DateTime<Utc>, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    now >= start && now <= end
}

/// The lock must outlive the sale window with an hour of margin; a window
/// already at its tail still gets a full day so the lock cannot lapse while
/// its request is in flight.
fn user_lock_ttl_secs(now: DateTime<Utc>, end_time: DateTime<Utc>) -> i64 {
    let ttl = (end_time - now).num_seconds() + 3_600;
    if ttl < 3_600 {
        86_400
    } else {
        ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn sale_window_includes_its_bounds() {
        let (start, end) = (at(100), at(200));
        assert!(sale_window_open(at(100), start, end));
        assert!(sale_window_open(at(150), start, end));
        assert!(sale_window_open(at(200), start, end));
        assert!(!sale_window_open(at(99), start, end));
        assert!(!sale_window_open(at(201), start, end));
    }

    #[test]
    fn lock_ttl_covers_the_window_plus_margin() {
        let now = at(1_000);
        assert_eq!(user_lock_ttl_secs(now, at(1_000 + 7_200)), 7_200 + 3_600);
    }

    #[test]
    fn lock_ttl_floors_to_a_day_near_the_window_tail() {
        let now = at(1_000);
        assert_eq!(user_lock_ttl_secs(now, at(900)), 86_400);
        // Exactly at the window end the margin alone clears the floor.
        assert_eq!(user_lock_ttl_secs(now, at(1_000)), 3_600);
    }

    #[test]
    fn rejection_envelope_carries_the_status_code() {
        let (status, Json(body)) = reject(StatusCode::NOT_FOUND, "product not found");
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 404);
        assert_eq!(body["msg"], "product not found");
    }

    #[test]
    fn terminal_states_render_their_wire_words() {
        let created = RequestState {
            request_id: "r1".to_string(),
            status: RequestStatus::Success,
            order_no: "SKr1".to_string(),
            reason: String::new(),
        };
        let (_, Json(body)) = respond_with_state(&created);
        assert_eq!(body["data"]["status"], "created");
        assert_eq!(body["data"]["order_no"], "SKr1");

        let failed = RequestState {
            request_id: "r2".to_string(),
            status: RequestStatus::Failed,
            order_no: String::new(),
            reason: "duplicate_purchase".to_string(),
        };
        let (_, Json(body)) = respond_with_state(&failed);
        assert_eq!(body["data"]["status"], "failed");
        assert_eq!(body["data"]["reason"], "duplicate_purchase");
    }
}
