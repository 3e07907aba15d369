use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Order-creation event carried from the reservation script to the durable
/// log. Published to Kafka keyed by `request_id` so one request is never
/// processed concurrently by two consumers in the same group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderMessage {
    pub request_id: String,
    pub product_id: i64,
    pub user_id: i64,
    pub quantity: i32,
    pub amount: i64,
}

impl OrderMessage {
    /// Minimal field validation so the consumer never acts on a dirty payload.
    pub fn validate(&self) -> Result<()> {
        if self.request_id.is_empty() {
            bail!("request_id is required");
        }
        if self.product_id <= 0 {
            bail!("product_id is required");
        }
        if self.user_id <= 0 {
            bail!("user_id is required");
        }
        if self.quantity <= 0 {
            bail!("quantity must be > 0");
        }
        if self.amount <= 0 {
            bail!("amount must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> OrderMessage {
        OrderMessage {
            request_id: "req-1".to_string(),
            product_id: 7,
            user_id: 42,
            quantity: 1,
            amount: 1999,
        }
    }

    #[test]
    fn complete_message_is_valid() {
        assert!(message().validate().is_ok());
    }

    #[test]
    fn each_missing_field_is_rejected() {
        let mut m = message();
        m.request_id.clear();
        assert!(m.validate().is_err());

        let mut m = message();
        m.product_id = 0;
        assert!(m.validate().is_err());

        let mut m = message();
        m.user_id = 0;
        assert!(m.validate().is_err());

        let mut m = message();
        m.quantity = 0;
        assert!(m.validate().is_err());

        let mut m = message();
        m.amount = 0;
        assert!(m.validate().is_err());
    }

    #[test]
    fn wire_field_names_are_stable() {
        let value = serde_json::to_value(message()).unwrap();
        let obj = value.as_object().unwrap();
        for field in ["request_id", "product_id", "user_id", "quantity", "amount"] {
            assert!(obj.contains_key(field), "missing wire field {field}");
        }
    }
}
