//! Kuaishou mini-program payment adapter
//!
//! The `kwaisign` header signs the raw body. Business data sits under `data`,
//! `biz_type` selects payment vs refund.

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

const SIGN_HEADER: &str = "kwaisign";
const QUERY_PATH: &str = "/openapi/mp/developer/epay/query_order";
const RESULT_OK: i64 = 1;
const RESULT_ORDER_NOT_EXIST: i64 = 15;

pub struct KuaishouAdapter {
    credentials: ProviderCredentials,
    scheme: Arc<dyn SignatureScheme>,
    http: reqwest::Client,
}

impl KuaishouAdapter {
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
}

#[async_trait]
impl PaymentProvider for KuaishouAdapter {
    fn name(&self) -> ProviderName {
        ProviderName::Kuaishou
    }

    fn app_id(&self) -> &str {
        &self.credentials.app_id
    }

    fn verify(&self, callback: &RawCallback) -> Result<VerifiedEvent, ProviderError> {
        let signature = callback
            .header(SIGN_HEADER)
            .ok_or_else(|| ProviderError::InvalidSignature("missing kwaisign header".to_string()))?;
        self.scheme.verify(&callback.body, signature)?;

        let body: Value = serde_json::from_slice(&callback.body)?;
        ensure_app_id(&self.credentials.app_id, json_str(&body, "app_id").as_deref())?;

        let data = body
            .get("data")
            .ok_or_else(|| ProviderError::MalformedPayload("missing data".to_string()))?;
        let event_time = json_i64(&body, "timestamp").and_then(from_unix_millis);
        let status = require_str(data, "status")?;

        match json_str(&body, "biz_type").as_deref() {
            Some("PAYMENT") => {
                let (outcome, settled_amount) = match status.as_str() {
                    "SUCCESS" => (EventOutcome::Paid, Some(require_i64(data, "order_amount")?)),
                    "FAILED" => (
                        EventOutcome::PaymentFailed {
                            reason: Some(status.clone()),
                        },
                        None,
                    ),
                    other => {
                        return Err(ProviderError::IgnoredEvent(format!("payment status {}", other)));
                    }
                };
                Ok(VerifiedEvent {
                    provider: ProviderName::Kuaishou,
                    order_ref: require_str(data, "out_order_no")?,
                    provider_txn_id: json_str(data, "ks_order_no"),
                    settled_amount,
                    outcome,
                    event_time,
                })
            }
            Some("REFUND") => {
                let succeeded = match status.as_str() {
                    "SUCCESS" => true,
                    "FAILED" => false,
                    other => {
                        return Err(ProviderError::IgnoredEvent(format!("refund status {}", other)));
                    }
                };
                Ok(VerifiedEvent {
                    provider: ProviderName::Kuaishou,
                    order_ref: require_str(data, "out_order_no")?,
                    provider_txn_id: None,
                    settled_amount: Some(require_i64(data, "refund_amount")?),
                    outcome: EventOutcome::Refund(RefundOutcome {
                        refund_ref: require_str(data, "out_refund_no")?,
                        provider_refund_id: json_str(data, "ks_refund_no"),
                        succeeded,
                    }),
                    event_time,
                })
            }
            Some(other) => Err(ProviderError::IgnoredEvent(format!("biz_type {}", other))),
            None => Err(ProviderError::MalformedPayload("missing biz_type".to_string())),
        }
    }

    async fn query(&self, order_ref: &str) -> Result<RemoteStatus, ProviderError> {
        let payload = json!({ "out_order_no": order_ref }).to_string();
        let sign = self.scheme.sign(payload.as_bytes())?;

        let url = format!("{}{}", self.credentials.base_url.trim_end_matches('/'), QUERY_PATH);
        let request = self
            .http
            .post(url)
            .query(&[("app_id", self.credentials.app_id.as_str())])
            .timeout(self.credentials.query_timeout())
            .header("Content-Type", "application/json")
            .header(SIGN_HEADER, sign)
            .body(payload);

        let (_, body) = send_json(ProviderName::Kuaishou, "epay/query_order", request).await?;

        match json_i64(&body, "result") {
            Some(RESULT_OK) => {}
            Some(RESULT_ORDER_NOT_EXIST) => return Err(ProviderError::NotFound(order_ref.to_string())),
            _ => {
                return Err(ProviderError::ProviderUnavailable(format!(
                    "kuaishou query failed: {}",
                    json_str(&body, "error_msg").unwrap_or_default()
                )));
            }
        }

        let info = body
            .get("payment_info")
            .ok_or_else(|| ProviderError::MalformedPayload("missing payment_info".to_string()))?;
        match require_str(info, "pay_status")?.as_str() {
            "SUCCESS" => Ok(RemoteStatus::Paid {
                provider_txn_id: json_str(info, "ks_order_no"),
                settled_amount: require_i64(info, "total_amount")?,
                paid_at: json_i64(info, "pay_time").and_then(from_unix_millis),
            }),
            "PROCESSING" => Ok(RemoteStatus::Pending),
            "FAILED" => Ok(RemoteStatus::Failed {
                reason: "FAILED".to_string(),
            }),
            other => Err(ProviderError::MalformedPayload(format!("unknown pay_status {}", other))),
        }
    }

    fn acknowledge(&self, callback: &RawCallback, outcome: &AckOutcome) -> ProviderAck {
        let message_id = serde_json::from_slice::<Value>(&callback.body)
            .ok()
            .and_then(|body| json_str(&body, "message_id"))
            .unwrap_or_default();
        match outcome {
            AckOutcome::Accepted => {
                ProviderAck::json(200, json!({ "result": 1, "message_id": message_id }))
            }
            other => ProviderAck::json(
                other.http_status(),
                json!({ "result": 0, "message_id": message_id, "error_msg": other.reason() }),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::signature::{HmacSha256Scheme, SignatureEncoding};
    use http::{HeaderMap, HeaderValue};

    fn adapter() -> (KuaishouAdapter, Arc<dyn SignatureScheme>) {
        let scheme: Arc<dyn SignatureScheme> =
            Arc::new(HmacSha256Scheme::new("ks-secret", SignatureEncoding::Hex));
        let credentials = ProviderCredentials {
            provider: ProviderName::Kuaishou,
            app_id: "ks671".to_string(),
            merchant_id: None,
            base_url: "http://127.0.0.1:9".to_string(),
            signing_secret: "ks-secret".to_string(),
            notify_token: None,
            api_v3_key: None,
            query_timeout_ms: 1_000,
        };
        (
            KuaishouAdapter::new(credentials, scheme.clone(), reqwest::Client::new()),
            scheme,
        )
    }

    fn callback(scheme: &dyn SignatureScheme, body: Value) -> RawCallback {
        let body = body.to_string();
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGN_HEADER,
            HeaderValue::from_str(&scheme.sign(body.as_bytes()).unwrap()).unwrap(),
        );
        RawCallback::new(headers, body.into_bytes())
    }

    #[test]
    fn test_verify_payment_and_ack_echoes_message_id() {
        let (adapter, scheme) = adapter();
        let callback = callback(
            scheme.as_ref(),
            json!({
                "app_id": "ks671",
                "message_id": "m-42",
                "biz_type": "PAYMENT",
                "timestamp": 1709280000000i64,
                "data": {
                    "out_order_no": "OUT123",
                    "ks_order_no": "KS001",
                    "order_amount": 1000,
                    "status": "SUCCESS"
                }
            }),
        );

        let event = adapter.verify(&callback).unwrap();
        assert_eq!(event.order_ref, "OUT123");
        assert_eq!(event.settled_amount, Some(1000));

        let ack = adapter.acknowledge(&callback, &AckOutcome::Accepted);
        let body: Value = serde_json::from_str(&ack.body).unwrap();
        assert_eq!(body["result"], 1);
        assert_eq!(body["message_id"], "m-42");
    }

    #[test]
    fn test_verify_rejects_tampered_body() {
        let (adapter, scheme) = adapter();
        let mut callback = callback(
            scheme.as_ref(),
            json!({"app_id": "ks671", "biz_type": "PAYMENT", "data": {"status": "SUCCESS"}}),
        );
        callback.body.extend_from_slice(b" ");
        assert!(matches!(
            adapter.verify(&callback),
            Err(ProviderError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_processing_status_is_ignored() {
        let (adapter, scheme) = adapter();
        let callback = callback(
            scheme.as_ref(),
            json!({
                "app_id": "ks671",
                "biz_type": "PAYMENT",
                "data": {"out_order_no": "OUT1", "status": "PROCESSING"}
            }),
        );
        assert!(matches!(
            adapter.verify(&callback),
            Err(ProviderError::IgnoredEvent(_))
        ));
    }
}
