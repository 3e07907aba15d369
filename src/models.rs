use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

/// A flash-sale product. `stock` is the initial inventory loaded from the
/// database; live decrements happen against the Redis counter after preload.
#[derive(Debug, Clone, Queryable, Serialize)]
#[diesel(table_name = crate::schema::products)]
pub struct Product {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub stock: i64,
    pub sale_price: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::products)]
pub struct NewProduct {
    pub name: String,
    pub stock: i64,
    pub sale_price: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// A durable order. `request_id` is the idempotency anchor; the
/// `(user_id, product_id)` unique constraint enforces one purchase per user
/// at the database level.
#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::orders)]
pub struct Order {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub order_no: String,
    pub request_id: String,
    pub user_id: i64,
    pub product_id: i64,
    pub quantity: i32,
    pub amount: i64,
    pub status: i32,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub order_no: String,
    pub request_id: String,
    pub user_id: i64,
    pub product_id: i64,
    pub quantity: i32,
    pub amount: i64,
    pub status: i32,
}

/// Tracks one buy attempt through the async pipeline. The row is the system
/// of record for request state; the Redis hash is a hot-read cache of it.
#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::order_requests)]
pub struct OrderRequest {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub request_id: String,
    pub user_id: i64,
    pub product_id: i64,
    pub quantity: i32,
    pub amount: i64,
    pub status: String,
    pub order_no: String,
    pub error_msg: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::order_requests)]
pub struct NewOrderRequest {
    pub request_id: String,
    pub user_id: i64,
    pub product_id: i64,
    pub quantity: i32,
    pub amount: i64,
    pub status: String,
    pub order_no: String,
    pub error_msg: String,
}

/// Request lifecycle: `pending` is the only non-terminal state, and the two
/// terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Success,
    Failed,
}

impl RequestStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Success => "success",
            RequestStatus::Failed => "failed",
        }
    }

    /// Unknown values read as `pending` so a half-written hash never reports
    /// a terminal state it has not reached.
    pub fn parse(s: &str) -> Self {
        match s {
            "success" => RequestStatus::Success,
            "failed" => RequestStatus::Failed,
            _ => RequestStatus::Pending,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Success | RequestStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Success,
            RequestStatus::Failed,
        ] {
            assert_eq!(RequestStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn unknown_status_reads_as_pending() {
        assert_eq!(RequestStatus::parse(""), RequestStatus::Pending);
        assert_eq!(RequestStatus::parse("created"), RequestStatus::Pending);
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(RequestStatus::Success.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
    }
}
