//! WeChat Pay adapter
//!
//! Two callback transports are accepted:
//! - APIv3: JSON envelope whose `resource` is AES-256-GCM encrypted with the
//!   merchant APIv3 key; authenticity is the `Wechatpay-Signature` header over
//!   `timestamp\nnonce\nbody\n`.
//! - v2: flat `<xml>` document carrying its own `sign` field.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{ensure_app_id, ensure_fresh, send_json};
use crate::payments::error::ProviderError;
use crate::payments::provider::PaymentProvider;
use crate::payments::signature::{canonical_query, SignatureScheme};
use crate::payments::types::{
    parse_cst_time, parse_rfc3339, AckOutcome, EventOutcome, ProviderAck, ProviderCredentials,
    ProviderName, RawCallback, RefundOutcome, RemoteStatus, VerifiedEvent,
};

const HEADER_TIMESTAMP: &str = "wechatpay-timestamp";
const HEADER_NONCE: &str = "wechatpay-nonce";
const HEADER_SIGNATURE: &str = "wechatpay-signature";
const NONCE_LEN: usize = 12;
const V2_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Debug, Deserialize)]
struct NotificationEnvelope {
    event_type: String,
    resource: EncryptedResource,
}

#[derive(Debug, Deserialize)]
struct EncryptedResource {
    algorithm: String,
    ciphertext: String,
    #[serde(default)]
    associated_data: Option<String>,
    nonce: String,
}

#[derive(Debug, Deserialize)]
struct TransactionAmount {
    total: i64,
}

#[derive(Debug, Deserialize)]
struct TransactionResource {
    #[serde(default)]
    appid: Option<String>,
    #[serde(default)]
    mchid: Option<String>,
    out_trade_no: String,
    #[serde(default)]
    transaction_id: Option<String>,
    trade_state: String,
    #[serde(default)]
    amount: Option<TransactionAmount>,
    #[serde(default)]
    success_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundAmount {
    refund: i64,
}

#[derive(Debug, Deserialize)]
struct RefundResource {
    #[serde(default)]
    mchid: Option<String>,
    out_trade_no: String,
    out_refund_no: String,
    #[serde(default)]
    refund_id: Option<String>,
    #[serde(default)]
    transaction_id: Option<String>,
    refund_status: String,
    amount: RefundAmount,
    #[serde(default)]
    success_time: Option<String>,
}

pub struct WechatAdapter {
    credentials: ProviderCredentials,
    merchant_id: String,
    cipher: Aes256Gcm,
    scheme: Arc<dyn SignatureScheme>,
    http: reqwest::Client,
}

impl WechatAdapter {
    pub fn new(
        credentials: ProviderCredentials,
        scheme: Arc<dyn SignatureScheme>,
        http: reqwest::Client,
    ) -> Result<Self, ProviderError> {
        let merchant_id = credentials
            .merchant_id
            .clone()
            .ok_or_else(|| ProviderError::Configuration("wechat merchant_id is required".to_string()))?;
        let key = credentials
            .api_v3_key
            .as_deref()
            .ok_or_else(|| ProviderError::Configuration("wechat api_v3_key is required".to_string()))?;
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|_| ProviderError::Configuration("wechat api_v3_key must be 32 bytes".to_string()))?;

        Ok(Self {
            credentials,
            merchant_id,
            cipher,
            scheme,
            http,
        })
    }

    fn is_xml(callback: &RawCallback) -> bool {
        callback.content_type().contains("xml")
            || callback.body.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'<')
    }

    fn ensure_merchant(&self, mchid: Option<&str>) -> Result<(), ProviderError> {
        match mchid {
            Some(mchid) if mchid != self.merchant_id => Err(ProviderError::InvalidSignature(format!(
                "callback addressed to merchant {}",
                mchid
            ))),
            _ => Ok(()),
        }
    }

    fn decrypt_resource(&self, resource: &EncryptedResource) -> Result<Vec<u8>, ProviderError> {
        if resource.algorithm != "AEAD_AES_256_GCM" {
            return Err(ProviderError::MalformedPayload(format!(
                "unsupported algorithm {}",
                resource.algorithm
            )));
        }
        if resource.nonce.len() != NONCE_LEN {
            return Err(ProviderError::MalformedPayload("nonce must be 12 bytes".to_string()));
        }

        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(&resource.ciphertext)
            .map_err(|_| ProviderError::MalformedPayload("ciphertext is not base64".to_string()))?;
        let aad = resource.associated_data.as_deref().unwrap_or("");

        self.cipher
            .decrypt(
                Nonce::from_slice(resource.nonce.as_bytes()),
                Payload {
                    msg: &ciphertext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| ProviderError::InvalidSignature("envelope decryption failed".to_string()))
    }

    fn verify_v3(&self, callback: &RawCallback) -> Result<VerifiedEvent, ProviderError> {
        let missing = |h: &str| ProviderError::InvalidSignature(format!("missing header {}", h));
        let timestamp = callback.header(HEADER_TIMESTAMP).ok_or_else(|| missing(HEADER_TIMESTAMP))?;
        let nonce = callback.header(HEADER_NONCE).ok_or_else(|| missing(HEADER_NONCE))?;
        let signature = callback.header(HEADER_SIGNATURE).ok_or_else(|| missing(HEADER_SIGNATURE))?;
        let body = callback.body_str()?;

        let message = format!("{}\n{}\n{}\n", timestamp, nonce, body);
        self.scheme.verify(message.as_bytes(), signature)?;
        ensure_fresh(timestamp)?;

        let envelope: NotificationEnvelope = serde_json::from_str(body)?;
        let plaintext = self.decrypt_resource(&envelope.resource)?;

        match envelope.event_type.as_str() {
            "TRANSACTION.SUCCESS" => {
                let resource: TransactionResource = serde_json::from_slice(&plaintext)?;
                self.transaction_event(resource)
            }
            "REFUND.SUCCESS" | "REFUND.ABNORMAL" | "REFUND.CLOSED" => {
                let resource: RefundResource = serde_json::from_slice(&plaintext)?;
                self.ensure_merchant(resource.mchid.as_deref())?;
                Ok(VerifiedEvent {
                    provider: ProviderName::Wechat,
                    order_ref: resource.out_trade_no,
                    provider_txn_id: resource.transaction_id,
                    settled_amount: Some(resource.amount.refund),
                    outcome: EventOutcome::Refund(RefundOutcome {
                        refund_ref: resource.out_refund_no,
                        provider_refund_id: resource.refund_id,
                        succeeded: resource.refund_status == "SUCCESS",
                    }),
                    event_time: resource.success_time.as_deref().and_then(parse_rfc3339),
                })
            }
            other => Err(ProviderError::IgnoredEvent(format!("event_type {}", other))),
        }
    }

    fn transaction_event(&self, resource: TransactionResource) -> Result<VerifiedEvent, ProviderError> {
        self.ensure_merchant(resource.mchid.as_deref())?;
        if let Some(appid) = resource.appid.as_deref() {
            ensure_app_id(&self.credentials.app_id, Some(appid))?;
        }

        let outcome = match resource.trade_state.as_str() {
            "SUCCESS" => EventOutcome::Paid,
            "CLOSED" | "REVOKED" | "PAYERROR" => EventOutcome::PaymentFailed {
                reason: Some(resource.trade_state.clone()),
            },
            other => {
                return Err(ProviderError::IgnoredEvent(format!("trade_state {}", other)));
            }
        };
        let settled_amount = match outcome {
            EventOutcome::Paid => Some(
                resource
                    .amount
                    .as_ref()
                    .map(|a| a.total)
                    .ok_or_else(|| ProviderError::MalformedPayload("missing amount".to_string()))?,
            ),
            _ => None,
        };

        Ok(VerifiedEvent {
            provider: ProviderName::Wechat,
            order_ref: resource.out_trade_no,
            provider_txn_id: resource.transaction_id,
            settled_amount,
            outcome,
            event_time: resource.success_time.as_deref().and_then(parse_rfc3339),
        })
    }

    fn verify_v2(&self, callback: &RawCallback) -> Result<VerifiedEvent, ProviderError> {
        let fields = parse_flat_xml(callback.body_str()?)?;

        if fields.contains_key("req_info") {
            return Err(ProviderError::IgnoredEvent(
                "v2 refund notifications are not handled; refunds settle through APIv3".to_string(),
            ));
        }
        if fields.get("return_code").map(String::as_str) != Some("SUCCESS") {
            return Err(ProviderError::IgnoredEvent(format!(
                "return_code {}",
                fields.get("return_code").map(String::as_str).unwrap_or("<missing>")
            )));
        }

        let signature = fields
            .get("sign")
            .ok_or_else(|| ProviderError::InvalidSignature("missing sign".to_string()))?;
        let message = canonical_query(&fields, &["sign"]);
        self.scheme.verify(message.as_bytes(), signature)?;

        ensure_app_id(&self.credentials.app_id, fields.get("appid").map(String::as_str))?;
        self.ensure_merchant(fields.get("mch_id").map(String::as_str))?;

        let order_ref = fields
            .get("out_trade_no")
            .cloned()
            .ok_or_else(|| ProviderError::MalformedPayload("missing out_trade_no".to_string()))?;
        let event_time = fields
            .get("time_end")
            .and_then(|t| parse_cst_time(t, V2_TIME_FORMAT));

        if fields.get("result_code").map(String::as_str) == Some("SUCCESS") {
            let total_fee = fields
                .get("total_fee")
                .and_then(|v| v.parse::<i64>().ok())
                .ok_or_else(|| ProviderError::MalformedPayload("missing total_fee".to_string()))?;
            Ok(VerifiedEvent {
                provider: ProviderName::Wechat,
                order_ref,
                provider_txn_id: fields.get("transaction_id").cloned(),
                settled_amount: Some(total_fee),
                outcome: EventOutcome::Paid,
                event_time,
            })
        } else {
            Ok(VerifiedEvent {
                provider: ProviderName::Wechat,
                order_ref,
                provider_txn_id: fields.get("transaction_id").cloned(),
                settled_amount: None,
                outcome: EventOutcome::PaymentFailed {
                    reason: fields.get("err_code").cloned(),
                },
                event_time,
            })
        }
    }

    /// `order_ref` is percent-encoded as a single path segment.
    fn query_url(&self, order_ref: &str) -> Result<url::Url, ProviderError> {
        let mut url = url::Url::parse(&self.credentials.base_url)
            .map_err(|e| ProviderError::Configuration(format!("invalid wechat base_url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| ProviderError::Configuration("wechat base_url cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(["v3", "pay", "transactions", "out-trade-no", order_ref]);
        url.query_pairs_mut().clear().append_pair("mchid", &self.merchant_id);
        Ok(url)
    }

    fn authorization(&self, method: &str, path: &str, body: &str) -> Result<String, ProviderError> {
        let nonce = Uuid::new_v4().simple().to_string();
        let timestamp = Utc::now().timestamp();
        let message = format!("{}\n{}\n{}\n{}\n{}\n", method, path, timestamp, nonce, body);
        let signature = self.scheme.sign(message.as_bytes())?;
        Ok(format!(
            "WECHATPAY2-SHA256-RSA2048 mchid=\"{}\",nonce_str=\"{}\",timestamp=\"{}\",signature=\"{}\"",
            self.merchant_id, nonce, timestamp, signature
        ))
    }
}

/// Parses `<xml><k>v</k>...</xml>` (text or CDATA values) into a map.
fn parse_flat_xml(body: &str) -> Result<BTreeMap<String, String>, ProviderError> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut fields = BTreeMap::new();
    let mut depth = 0usize;
    let mut current: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                depth += 1;
                if depth == 2 {
                    let key = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                    // A repeated element replaces the earlier one
                    fields.remove(&key);
                    current = Some(key);
                }
            }
            Ok(Event::End(_)) => {
                if depth == 2 {
                    current = None;
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Text(text)) => {
                if let Some(key) = &current {
                    let value = text
                        .unescape()
                        .map_err(|e| ProviderError::MalformedPayload(format!("invalid xml text: {}", e)))?;
                    fields.entry(key.clone()).or_insert_with(String::new).push_str(&value);
                }
            }
            Ok(Event::CData(data)) => {
                if let Some(key) = &current {
                    // Split sections (`]]]]><![CDATA[>`) arrive as consecutive events
                    let value = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    fields.entry(key.clone()).or_insert_with(String::new).push_str(&value);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(ProviderError::MalformedPayload(format!("invalid xml: {}", e)));
            }
        }
    }

    if fields.is_empty() {
        return Err(ProviderError::MalformedPayload("empty xml document".to_string()));
    }
    Ok(fields)
}

/// Wraps text in CDATA, splitting any `]]>` so it cannot close the section.
fn cdata(text: &str) -> String {
    format!("<![CDATA[{}]]>", text.replace("]]>", "]]]]><![CDATA[>"))
}

fn xml_ack(code: &str, message: &str) -> String {
    format!(
        "<xml><return_code>{}</return_code><return_msg>{}</return_msg></xml>",
        cdata(code),
        cdata(message)
    )
}

#[async_trait]
impl PaymentProvider for WechatAdapter {
    fn name(&self) -> ProviderName {
        ProviderName::Wechat
    }

    fn app_id(&self) -> &str {
        &self.credentials.app_id
    }

    fn verify(&self, callback: &RawCallback) -> Result<VerifiedEvent, ProviderError> {
        if Self::is_xml(callback) {
            self.verify_v2(callback)
        } else {
            self.verify_v3(callback)
        }
    }

    async fn query(&self, order_ref: &str) -> Result<RemoteStatus, ProviderError> {
        let url = self.query_url(order_ref)?;
        // The signature covers the path and query exactly as sent
        let signed_path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        let request = self
            .http
            .get(url.clone())
            .timeout(self.credentials.query_timeout())
            .header("Accept", "application/json")
            .header("Authorization", self.authorization("GET", &signed_path, "")?);

        let (status, body) = send_json(ProviderName::Wechat, "transactions/out-trade-no", request).await?;

        if status == reqwest::StatusCode::NOT_FOUND
            || body.get("code").and_then(Value::as_str) == Some("ORDER_NOT_EXIST")
        {
            return Err(ProviderError::NotFound(order_ref.to_string()));
        }
        if !status.is_success() {
            return Err(ProviderError::ProviderUnavailable(format!(
                "wechat query returned {}: {}",
                status,
                body.get("message").and_then(Value::as_str).unwrap_or_default()
            )));
        }

        let resource: TransactionResource = serde_json::from_value(body)?;
        match resource.trade_state.as_str() {
            // REFUND means the payment itself settled before being refunded
            "SUCCESS" | "REFUND" => Ok(RemoteStatus::Paid {
                provider_txn_id: resource.transaction_id,
                settled_amount: resource
                    .amount
                    .map(|a| a.total)
                    .ok_or_else(|| ProviderError::MalformedPayload("missing amount".to_string()))?,
                paid_at: resource.success_time.as_deref().and_then(parse_rfc3339),
            }),
            "NOTPAY" | "USERPAYING" => Ok(RemoteStatus::Pending),
            "CLOSED" | "REVOKED" | "PAYERROR" => Ok(RemoteStatus::Failed {
                reason: resource.trade_state,
            }),
            other => Err(ProviderError::MalformedPayload(format!("unknown trade_state {}", other))),
        }
    }

    fn acknowledge(&self, callback: &RawCallback, outcome: &AckOutcome) -> ProviderAck {
        let status = outcome.http_status();
        let success = matches!(outcome, AckOutcome::Accepted);

        if Self::is_xml(callback) {
            if success {
                ProviderAck::xml(status, xml_ack("SUCCESS", "OK"))
            } else {
                ProviderAck::xml(status, xml_ack("FAIL", outcome.reason()))
            }
        } else if success {
            ProviderAck::json(status, json!({ "code": "SUCCESS", "message": "OK" }))
        } else {
            ProviderAck::json(status, json!({ "code": "FAIL", "message": outcome.reason() }))
        }
    }
}
