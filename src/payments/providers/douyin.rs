//! Douyin (ByteDance mini-program) payment adapter
//!
//! Callbacks are JSON with the business payload as a JSON string in `msg`.
//! `msg_signature` covers the lexically sorted `[token, timestamp, nonce, msg]`;
//! the signed timestamp must be within a few minutes of the local clock.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{ensure_app_id, ensure_fresh, json_i64, json_str, require_i64, require_str, send_json};
use crate::payments::error::ProviderError;
use crate::payments::provider::PaymentProvider;
use crate::payments::signature::{canonical_query, SignatureScheme};
use crate::payments::types::{
    from_unix_secs, AckOutcome, EventOutcome, ProviderAck, ProviderCredentials, ProviderName,
    RawCallback, RefundOutcome, RemoteStatus, VerifiedEvent,
};

const QUERY_PATH: &str = "/api/apps/ecpay/v1/query_order";
/// `err_no` returned when the merchant order is unknown
const ERR_ORDER_NOT_EXIST: i64 = 2008;

pub struct DouyinAdapter {
    credentials: ProviderCredentials,
    notify_token: String,
    scheme: Arc<dyn SignatureScheme>,
    http: reqwest::Client,
}

impl DouyinAdapter {
    pub fn new(
        credentials: ProviderCredentials,
        scheme: Arc<dyn SignatureScheme>,
        http: reqwest::Client,
    ) -> Result<Self, ProviderError> {
        let notify_token = credentials
            .notify_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProviderError::Configuration("douyin notify_token is required".to_string()))?;

        Ok(Self {
            credentials,
            notify_token,
            scheme,
            http,
        })
    }

    fn signed_message(&self, timestamp: &str, nonce: &str, msg: &str) -> String {
        let mut parts = [self.notify_token.as_str(), timestamp, nonce, msg];
        parts.sort_unstable();
        parts.concat()
    }

    fn payment_event(&self, msg: &Value) -> Result<VerifiedEvent, ProviderError> {
        ensure_app_id(&self.credentials.app_id, json_str(msg, "appid").as_deref())?;
        let order_ref = require_str(msg, "cp_orderno")?;
        let event_time = json_i64(msg, "paid_at").and_then(from_unix_secs);

        let status = require_str(msg, "status")?;
        let (outcome, settled_amount) = match status.as_str() {
            "SUCCESS" => (EventOutcome::Paid, Some(require_i64(msg, "total_amount")?)),
            "FAIL" | "TIMEOUT" => (
                EventOutcome::PaymentFailed {
                    reason: Some(status.clone()),
                },
                None,
            ),
            other => return Err(ProviderError::IgnoredEvent(format!("payment status {}", other))),
        };

        Ok(VerifiedEvent {
            provider: ProviderName::Douyin,
            order_ref,
            provider_txn_id: json_str(msg, "order_id"),
            settled_amount,
            outcome,
            event_time,
        })
    }

    fn refund_event(&self, msg: &Value) -> Result<VerifiedEvent, ProviderError> {
        if let Some(appid) = json_str(msg, "appid") {
            ensure_app_id(&self.credentials.app_id, Some(&appid))?;
        }
        let status = require_str(msg, "status")?;
        let succeeded = match status.as_str() {
            "SUCCESS" => true,
            "FAIL" => false,
            other => return Err(ProviderError::IgnoredEvent(format!("refund status {}", other))),
        };

        Ok(VerifiedEvent {
            provider: ProviderName::Douyin,
            order_ref: require_str(msg, "cp_orderno")?,
            provider_txn_id: None,
            settled_amount: Some(require_i64(msg, "refund_amount")?),
            outcome: EventOutcome::Refund(RefundOutcome {
                refund_ref: require_str(msg, "cp_refundno")?,
                provider_refund_id: json_str(msg, "refund_no"),
                succeeded,
            }),
            event_time: json_i64(msg, "refunded_at").and_then(from_unix_secs),
        })
    }
}

#[async_trait]
impl PaymentProvider for DouyinAdapter {
    fn name(&self) -> ProviderName {
        ProviderName::Douyin
    }

    fn app_id(&self) -> &str {
        &self.credentials.app_id
    }

    fn verify(&self, callback: &RawCallback) -> Result<VerifiedEvent, ProviderError> {
        let body: Value = serde_json::from_slice(&callback.body)?;

        let timestamp = require_str(&body, "timestamp")?;
        let nonce = require_str(&body, "nonce")?;
        let msg_raw = require_str(&body, "msg")?;
        let signature = json_str(&body, "msg_signature")
            .ok_or_else(|| ProviderError::InvalidSignature("missing msg_signature".to_string()))?;

        let message = self.signed_message(&timestamp, &nonce, &msg_raw);
        self.scheme.verify(message.as_bytes(), &signature)?;
        ensure_fresh(&timestamp)?;

        let msg: Value = serde_json::from_str(&msg_raw)?;
        match json_str(&body, "type").as_deref() {
            Some("payment") => self.payment_event(&msg),
            Some("refund") => self.refund_event(&msg),
            Some(other) => Err(ProviderError::IgnoredEvent(format!("callback type {}", other))),
            None => Err(ProviderError::MalformedPayload("missing callback type".to_string())),
        }
    }

    async fn query(&self, order_ref: &str) -> Result<RemoteStatus, ProviderError> {
        let mut params = BTreeMap::new();
        params.insert("app_id".to_string(), self.credentials.app_id.clone());
        params.insert("out_order_no".to_string(), order_ref.to_string());
        let sign = self.scheme.sign(canonical_query(&params, &[]).as_bytes())?;

        let url = format!("{}{}", self.credentials.base_url.trim_end_matches('/'), QUERY_PATH);
        let request = self
            .http
            .post(url)
            .timeout(self.credentials.query_timeout())
            .json(&json!({
                "app_id": self.credentials.app_id,
                "out_order_no": order_ref,
                "sign": sign,
            }));

        let (_, body) = send_json(ProviderName::Douyin, "query_order", request).await?;

        match json_i64(&body, "err_no") {
            Some(0) => {}
            Some(ERR_ORDER_NOT_EXIST) => return Err(ProviderError::NotFound(order_ref.to_string())),
            _ => {
                return Err(ProviderError::ProviderUnavailable(format!(
                    "douyin query failed: {}",
                    json_str(&body, "err_tips").unwrap_or_default()
                )));
            }
        }

        let info = body
            .get("payment_info")
            .ok_or_else(|| ProviderError::MalformedPayload("missing payment_info".to_string()))?;
        match require_str(info, "order_status")?.as_str() {
            "SUCCESS" => Ok(RemoteStatus::Paid {
                provider_txn_id: json_str(&body, "order_id"),
                settled_amount: require_i64(info, "total_fee")?,
                paid_at: json_i64(info, "pay_time").and_then(from_unix_secs),
            }),
            "PROCESSING" => Ok(RemoteStatus::Pending),
            status @ ("FAIL" | "TIMEOUT") => Ok(RemoteStatus::Failed {
                reason: status.to_string(),
            }),
            other => Err(ProviderError::MalformedPayload(format!("unknown order_status {}", other))),
        }
    }

    fn acknowledge(&self, _callback: &RawCallback, outcome: &AckOutcome) -> ProviderAck {
        match outcome {
            AckOutcome::Accepted => ProviderAck::json(200, json!({ "err_no": 0, "err_tips": "success" })),
            other => ProviderAck::json(
                other.http_status(),
                json!({ "err_no": 1, "err_tips": other.reason() }),
            ),
        }
    }
}
