//! Alipay adapter
//!
//! Callbacks arrive as a signed `application/x-www-form-urlencoded` POST.
//! The signed string is every non-empty parameter except `sign`/`sign_type`,
//! sorted by key and joined as `k=v&...`. Amounts are decimal yuan.

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use super::{ensure_app_id, send_json};
use crate::payments::error::ProviderError;
use crate::payments::provider::PaymentProvider;
use crate::payments::signature::{canonical_query, SignatureScheme};
use crate::payments::types::{
    parse_cst_time, parse_major_amount, AckOutcome, EventOutcome, ProviderAck,
    ProviderCredentials, ProviderName, RawCallback, RefundOutcome, RemoteStatus, VerifiedEvent,
};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const QUERY_METHOD: &str = "alipay.trade.query";
const CODE_SUCCESS: &str = "10000";
const SUB_CODE_TRADE_NOT_EXIST: &str = "ACQ.TRADE_NOT_EXIST";

pub struct AlipayAdapter {
    credentials: ProviderCredentials,
    scheme: Arc<dyn SignatureScheme>,
    http: reqwest::Client,
}

impl AlipayAdapter {
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

    fn parse_form(body: &[u8]) -> BTreeMap<String, String> {
        url::form_urlencoded::parse(body)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    fn map_trade_status(
        status: &str,
        trade_no: Option<String>,
        total_amount: Option<&str>,
        paid_at: Option<&str>,
    ) -> Result<RemoteStatus, ProviderError> {
        match status {
            "TRADE_SUCCESS" | "TRADE_FINISHED" => {
                let amount = total_amount.ok_or_else(|| {
                    ProviderError::MalformedPayload("missing total_amount".to_string())
                })?;
                Ok(RemoteStatus::Paid {
                    provider_txn_id: trade_no,
                    settled_amount: parse_major_amount(amount)?,
                    paid_at: paid_at.and_then(|t| parse_cst_time(t, TIME_FORMAT)),
                })
            }
            "TRADE_CLOSED" => Ok(RemoteStatus::Failed {
                reason: "TRADE_CLOSED".to_string(),
            }),
            "WAIT_BUYER_PAY" => Ok(RemoteStatus::Pending),
            other => Err(ProviderError::MalformedPayload(format!(
                "unknown trade_status {}",
                other
            ))),
        }
    }
}

#[async_trait]
impl PaymentProvider for AlipayAdapter {
    fn name(&self) -> ProviderName {
        ProviderName::Alipay
    }

    fn app_id(&self) -> &str {
        &self.credentials.app_id
    }

    fn verify(&self, callback: &RawCallback) -> Result<VerifiedEvent, ProviderError> {
        let params = Self::parse_form(&callback.body);

        let signature = params
            .get("sign")
            .ok_or_else(|| ProviderError::InvalidSignature("missing sign".to_string()))?;
        let message = canonical_query(&params, &["sign", "sign_type"]);
        self.scheme.verify(message.as_bytes(), signature)?;

        ensure_app_id(&self.credentials.app_id, params.get("app_id").map(String::as_str))?;

        let order_ref = params
            .get("out_trade_no")
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| ProviderError::MalformedPayload("missing out_trade_no".to_string()))?;
        let trade_no = params.get("trade_no").cloned();

        // Refund notifications reuse the trade notification shape and add out_biz_no/refund_fee
        if let (Some(refund_ref), Some(refund_fee)) = (params.get("out_biz_no"), params.get("refund_fee")) {
            return Ok(VerifiedEvent {
                provider: ProviderName::Alipay,
                order_ref,
                provider_txn_id: trade_no.clone(),
                settled_amount: Some(parse_major_amount(refund_fee)?),
                outcome: EventOutcome::Refund(RefundOutcome {
                    refund_ref: refund_ref.clone(),
                    provider_refund_id: trade_no,
                    succeeded: true,
                }),
                event_time: params
                    .get("gmt_refund")
                    .and_then(|t| parse_cst_time(t, "%Y-%m-%d %H:%M:%S%.f")
                        .or_else(|| parse_cst_time(t, TIME_FORMAT))),
            });
        }

        let status = params
            .get("trade_status")
            .ok_or_else(|| ProviderError::MalformedPayload("missing trade_status".to_string()))?;

        match Self::map_trade_status(
            status,
            trade_no.clone(),
            params.get("total_amount").map(String::as_str),
            params.get("gmt_payment").map(String::as_str),
        )? {
            RemoteStatus::Paid {
                provider_txn_id,
                settled_amount,
                paid_at,
            } => Ok(VerifiedEvent {
                provider: ProviderName::Alipay,
                order_ref,
                provider_txn_id,
                settled_amount: Some(settled_amount),
                outcome: EventOutcome::Paid,
                event_time: paid_at,
            }),
            RemoteStatus::Failed { reason } => Ok(VerifiedEvent {
                provider: ProviderName::Alipay,
                order_ref,
                provider_txn_id: trade_no,
                settled_amount: None,
                outcome: EventOutcome::PaymentFailed {
                    reason: Some(reason),
                },
                event_time: params
                    .get("gmt_close")
                    .and_then(|t| parse_cst_time(t, TIME_FORMAT)),
            }),
            RemoteStatus::Pending => Err(ProviderError::IgnoredEvent(format!(
                "non-terminal trade_status {}",
                status
            ))),
        }
    }

    async fn query(&self, order_ref: &str) -> Result<RemoteStatus, ProviderError> {
        let timestamp = FixedOffset::east_opt(8 * 3600)
            .map(|tz| Utc::now().with_timezone(&tz).format(TIME_FORMAT).to_string())
            .unwrap_or_default();

        let mut params = BTreeMap::new();
        params.insert("app_id".to_string(), self.credentials.app_id.clone());
        params.insert("method".to_string(), QUERY_METHOD.to_string());
        params.insert("charset".to_string(), "utf-8".to_string());
        params.insert("sign_type".to_string(), self.scheme.name().to_string());
        params.insert("timestamp".to_string(), timestamp);
        params.insert("version".to_string(), "1.0".to_string());
        params.insert(
            "biz_content".to_string(),
            json!({ "out_trade_no": order_ref }).to_string(),
        );
        let signature = self.scheme.sign(canonical_query(&params, &[]).as_bytes())?;
        params.insert("sign".to_string(), signature);

        let request = self
            .http
            .post(&self.credentials.base_url)
            .timeout(self.credentials.query_timeout())
            .form(&params);
        let (_, body) = send_json(ProviderName::Alipay, QUERY_METHOD, request).await?;

        let response = body
            .get("alipay_trade_query_response")
            .ok_or_else(|| ProviderError::MalformedPayload("missing query response node".to_string()))?;
        let code = response.get("code").and_then(Value::as_str).unwrap_or_default();

        if code != CODE_SUCCESS {
            let sub_code = response.get("sub_code").and_then(Value::as_str).unwrap_or_default();
            if sub_code == SUB_CODE_TRADE_NOT_EXIST {
                return Err(ProviderError::NotFound(order_ref.to_string()));
            }
            return Err(ProviderError::ProviderUnavailable(format!(
                "alipay query failed: code={} sub_code={}",
                code, sub_code
            )));
        }

        let status = response
            .get("trade_status")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::MalformedPayload("missing trade_status".to_string()))?;
        debug!(order_ref = %order_ref, trade_status = %status, "Alipay query answered");

        Self::map_trade_status(
            status,
            response.get("trade_no").and_then(Value::as_str).map(str::to_owned),
            response.get("total_amount").and_then(Value::as_str),
            response.get("send_pay_date").and_then(Value::as_str),
        )
    }

    fn acknowledge(&self, _callback: &RawCallback, outcome: &AckOutcome) -> ProviderAck {
        match outcome {
            AckOutcome::Accepted => ProviderAck::text(200, "success"),
            _ => ProviderAck::text(outcome.http_status(), "failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::signature::{HmacSha256Scheme, SignatureEncoding};
    use http::HeaderMap;

    fn adapter() -> (AlipayAdapter, Arc<dyn SignatureScheme>) {
        let scheme: Arc<dyn SignatureScheme> =
            Arc::new(HmacSha256Scheme::new("alipay-secret", SignatureEncoding::Base64));
        let credentials = ProviderCredentials {
            provider: ProviderName::Alipay,
            app_id: "2021000000000001".to_string(),
            merchant_id: None,
            base_url: "http://127.0.0.1:9/gateway.do".to_string(),
            signing_secret: "alipay-secret".to_string(),
            notify_token: None,
            api_v3_key: None,
            query_timeout_ms: 1_000,
        };
        (
            AlipayAdapter::new(credentials, scheme.clone(), reqwest::Client::new()),
            scheme,
        )
    }

    fn signed_form(scheme: &dyn SignatureScheme, fields: &[(&str, &str)]) -> Vec<u8> {
        let params: BTreeMap<String, String> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let sign = scheme
            .sign(canonical_query(&params, &["sign", "sign_type"]).as_bytes())
            .unwrap();
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &params {
            serializer.append_pair(k, v);
        }
        serializer.append_pair("sign", &sign);
        serializer.append_pair("sign_type", "HMAC-SHA256");
        serializer.finish().into_bytes()
    }

    #[test]
    fn test_verify_trade_success() {
        let (adapter, scheme) = adapter();
        let body = signed_form(
            scheme.as_ref(),
            &[
                ("app_id", "2021000000000001"),
                ("out_trade_no", "OUT123"),
                ("trade_no", "2024030122001"),
                ("trade_status", "TRADE_SUCCESS"),
                ("total_amount", "10.00"),
                ("gmt_payment", "2024-03-01 12:00:00"),
            ],
        );

        let event = adapter.verify(&RawCallback::new(HeaderMap::new(), body)).unwrap();
        assert_eq!(event.order_ref, "OUT123");
        assert_eq!(event.settled_amount, Some(1000));
        assert_eq!(event.outcome, EventOutcome::Paid);
        assert_eq!(event.provider_txn_id.as_deref(), Some("2024030122001"));
        assert!(event.event_time.is_some());
    }

    #[test]
    fn test_verify_rejects_tampered_amount() {
        let (adapter, scheme) = adapter();
        let body = signed_form(
            scheme.as_ref(),
            &[
                ("app_id", "2021000000000001"),
                ("out_trade_no", "OUT123"),
                ("trade_status", "TRADE_SUCCESS"),
                ("total_amount", "10.00"),
            ],
        );
        let tampered = String::from_utf8(body)
            .unwrap()
            .replace("total_amount=10.00", "total_amount=0.01");

        let result = adapter.verify(&RawCallback::new(HeaderMap::new(), tampered.into_bytes()));
        assert!(matches!(result, Err(ProviderError::InvalidSignature(_))));
    }

    #[test]
    fn test_verify_refund_notification() {
        let (adapter, scheme) = adapter();
        let body = signed_form(
            scheme.as_ref(),
            &[
                ("app_id", "2021000000000001"),
                ("out_trade_no", "OUT123"),
                ("trade_no", "2024030122001"),
                ("trade_status", "TRADE_CLOSED"),
                ("out_biz_no", "RF-1"),
                ("refund_fee", "4.00"),
            ],
        );

        let event = adapter.verify(&RawCallback::new(HeaderMap::new(), body)).unwrap();
        assert_eq!(event.settled_amount, Some(400));
        match event.outcome {
            EventOutcome::Refund(refund) => {
                assert_eq!(refund.refund_ref, "RF-1");
                assert!(refund.succeeded);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_wait_buyer_pay_is_ignored() {
        let (adapter, scheme) = adapter();
        let body = signed_form(
            scheme.as_ref(),
            &[
                ("app_id", "2021000000000001"),
                ("out_trade_no", "OUT123"),
                ("trade_status", "WAIT_BUYER_PAY"),
            ],
        );
        let result = adapter.verify(&RawCallback::new(HeaderMap::new(), body));
        assert!(matches!(result, Err(ProviderError::IgnoredEvent(_))));
    }

    #[test]
    fn test_acknowledge_bodies() {
        let (adapter, _) = adapter();
        let callback = RawCallback::new(HeaderMap::new(), Vec::new());
        assert_eq!(
            adapter.acknowledge(&callback, &AckOutcome::Accepted),
            ProviderAck::text(200, "success")
        );
        let retry = adapter.acknowledge(
            &callback,
            &AckOutcome::RetryLater {
                reason: "db down".to_string(),
            },
        );
        assert_eq!(retry.status, 500);
        assert_eq!(retry.body, "failure");
    }
}
