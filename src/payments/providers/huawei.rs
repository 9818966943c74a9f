//! Huawei IAP adapter
//!
//! Callbacks carry `{ "content": "<json string>", "sign": "..." }`; the
//! signature covers the raw `content` string exactly as delivered.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{ensure_app_id, json_i64, json_str, require_i64, require_str, send_json};
use crate::payments::error::ProviderError;
use crate::payments::provider::PaymentProvider;
use crate::payments::signature::SignatureScheme;
use crate::payments::types::{
    from_unix_millis, AckOutcome, EventOutcome, ProviderAck, ProviderCredentials, ProviderName,
    RawCallback, RefundOutcome, RemoteStatus, VerifiedEvent,
};

const QUERY_PATH: &str = "/order/v2/query";
const RESPONSE_OK: &str = "0";
const RESPONSE_ORDER_NOT_EXIST: &str = "5";

const PURCHASE_PAID: i64 = 0;
const PURCHASE_FAILED: i64 = 1;

pub struct HuaweiAdapter {
    credentials: ProviderCredentials,
    scheme: Arc<dyn SignatureScheme>,
    http: reqwest::Client,
}

impl HuaweiAdapter {
    pub fn new(
        credentials: ProviderCredentials,
        scheme: Arc<dyn SignatureScheme>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            credentials,
            scheme,
            http,
        }
    }

    fn refund_event(&self, content: &Value) -> Result<VerifiedEvent, ProviderError> {
        let succeeded = match json_i64(content, "refundStatus") {
            Some(0) => true,
            Some(_) => false,
            None => return Err(ProviderError::MalformedPayload("missing refundStatus".to_string())),
        };

        Ok(VerifiedEvent {
            provider: ProviderName::Huawei,
            order_ref: require_str(content, "developerPayload")?,
            provider_txn_id: json_str(content, "orderId"),
            settled_amount: Some(require_i64(content, "refundAmount")?),
            outcome: EventOutcome::Refund(RefundOutcome {
                refund_ref: require_str(content, "refundRequestNo")?,
                provider_refund_id: json_str(content, "refundId"),
                succeeded,
            }),
            event_time: json_i64(content, "refundTime").and_then(from_unix_millis),
        })
    }

    fn purchase_event(&self, content: &Value) -> Result<VerifiedEvent, ProviderError> {
        let (outcome, settled_amount) = match json_i64(content, "purchaseState") {
            Some(PURCHASE_PAID) => (EventOutcome::Paid, Some(require_i64(content, "price")?)),
            Some(PURCHASE_FAILED) => (EventOutcome::PaymentFailed { reason: None }, None),
            Some(other) => {
                return Err(ProviderError::IgnoredEvent(format!("purchaseState {}", other)));
            }
            None => return Err(ProviderError::MalformedPayload("missing purchaseState".to_string())),
        };

        Ok(VerifiedEvent {
            provider: ProviderName::Huawei,
            order_ref: require_str(content, "developerPayload")?,
            provider_txn_id: json_str(content, "orderId"),
            settled_amount,
            outcome,
            event_time: json_i64(content, "purchaseTime").and_then(from_unix_millis),
        })
    }
}

#[async_trait]
impl PaymentProvider for HuaweiAdapter {
    fn name(&self) -> ProviderName {
        ProviderName::Huawei
    }

    fn app_id(&self) -> &str {
        &self.credentials.app_id
    }

    fn verify(&self, callback: &RawCallback) -> Result<VerifiedEvent, ProviderError> {
        let body: Value = serde_json::from_slice(&callback.body)?;
        let content_raw = require_str(&body, "content")?;
        let signature = json_str(&body, "sign")
            .ok_or_else(|| ProviderError::InvalidSignature("missing sign".to_string()))?;

        self.scheme.verify(content_raw.as_bytes(), &signature)?;

        let content: Value = serde_json::from_str(&content_raw)?;
        ensure_app_id(&self.credentials.app_id, json_str(&content, "applicationId").as_deref())?;

        if content.get("refundRequestNo").is_some() {
            self.refund_event(&content)
        } else {
            self.purchase_event(&content)
        }
    }

    async fn query(&self, order_ref: &str) -> Result<RemoteStatus, ProviderError> {
        let payload = json!({
            "applicationId": self.credentials.app_id,
            "developerPayload": order_ref,
        })
        .to_string();
        let sign = self.scheme.sign(payload.as_bytes())?;

        let url = format!("{}{}", self.credentials.base_url.trim_end_matches('/'), QUERY_PATH);
        let request = self
            .http
            .post(url)
            .timeout(self.credentials.query_timeout())
            .json(&json!({ "content": payload, "sign": sign }));

        let (_, body) = send_json(ProviderName::Huawei, "order/v2/query", request).await?;

        match json_str(&body, "responseCode").as_deref() {
            Some(RESPONSE_OK) => {}
            Some(RESPONSE_ORDER_NOT_EXIST) => return Err(ProviderError::NotFound(order_ref.to_string())),
            _ => {
                return Err(ProviderError::ProviderUnavailable(format!(
                    "huawei query failed: {}",
                    json_str(&body, "responseMessage").unwrap_or_default()
                )));
            }
        }

        let data = body
            .get("purchaseTokenData")
            .ok_or_else(|| ProviderError::MalformedPayload("missing purchaseTokenData".to_string()))?;
        // purchaseTokenData may be nested JSON text
        let data: Value = match data {
            Value::String(raw) => serde_json::from_str(raw)?,
            other => other.clone(),
        };

        match json_i64(&data, "purchaseState") {
            Some(PURCHASE_PAID) => Ok(RemoteStatus::Paid {
                provider_txn_id: json_str(&data, "orderId"),
                settled_amount: require_i64(&data, "price")?,
                paid_at: json_i64(&data, "purchaseTime").and_then(from_unix_millis),
            }),
            Some(PURCHASE_FAILED) => Ok(RemoteStatus::Failed {
                reason: "purchase cancelled".to_string(),
            }),
            _ => Ok(RemoteStatus::Pending),
        }
    }

    fn acknowledge(&self, _callback: &RawCallback, outcome: &AckOutcome) -> ProviderAck {
        match outcome {
            AckOutcome::Accepted => {
                ProviderAck::json(200, json!({ "errorCode": "0", "errorMsg": "success" }))
            }
            other => ProviderAck::json(
                other.http_status(),
                json!({ "errorCode": "1", "errorMsg": other.reason() }),
            ),
        }
    }
}
