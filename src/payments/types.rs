//! Normalized payment types shared by every provider adapter
//!
//! Everything past the adapter boundary operates on [`VerifiedEvent`] and
//! [`RemoteStatus`] only; raw provider payloads never leave `payments::providers`.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use http::HeaderMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::ProviderError;

// ============================================================================
// Provider Names
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    Alipay,
    Wechat,
    Douyin,
    Huawei,
    Kuaishou,
}

impl ProviderName {
    pub const ALL: [ProviderName; 5] = [
        ProviderName::Alipay,
        ProviderName::Wechat,
        ProviderName::Douyin,
        ProviderName::Huawei,
        ProviderName::Kuaishou,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Alipay => "alipay",
            ProviderName::Wechat => "wechat",
            ProviderName::Douyin => "douyin",
            ProviderName::Huawei => "huawei",
            ProviderName::Kuaishou => "kuaishou",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "alipay" => Ok(ProviderName::Alipay),
            "wechat" | "wechatpay" | "weixin" => Ok(ProviderName::Wechat),
            "douyin" | "bytedance" => Ok(ProviderName::Douyin),
            "huawei" => Ok(ProviderName::Huawei),
            "kuaishou" => Ok(ProviderName::Kuaishou),
            other => Err(ProviderError::UnknownProvider(other.to_string())),
        }
    }
}

// ============================================================================
// Verified Events
// ============================================================================

/// Which order flow an event belongs to. Part of the dedup lock key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Payment,
    Refund,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Payment => "payment",
            EventKind::Refund => "refund",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundOutcome {
    /// Merchant-side refund reference, the key of the refund row
    pub refund_ref: String,
    pub provider_refund_id: Option<String>,
    pub succeeded: bool,
}

/// Terminal outcome carried by a verified notification, decoded once per provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Paid,
    PaymentFailed { reason: Option<String> },
    Refund(RefundOutcome),
}

impl EventOutcome {
    pub fn kind(&self) -> EventKind {
        match self {
            EventOutcome::Paid | EventOutcome::PaymentFailed { .. } => EventKind::Payment,
            EventOutcome::Refund(_) => EventKind::Refund,
        }
    }
}

/// Authenticated, normalized provider notification or query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedEvent {
    pub provider: ProviderName,
    pub order_ref: String,
    pub provider_txn_id: Option<String>,
    /// Minor units. Settled payment amount, or the refunded amount for refund events.
    pub settled_amount: Option<i64>,
    pub outcome: EventOutcome,
    pub event_time: Option<DateTime<Utc>>,
}

impl VerifiedEvent {
    pub fn kind(&self) -> EventKind {
        self.outcome.kind()
    }
}

// ============================================================================
// Remote Status (active polling)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Paid {
        provider_txn_id: Option<String>,
        settled_amount: i64,
        paid_at: Option<DateTime<Utc>>,
    },
    Failed {
        reason: String,
    },
    Pending,
}

impl RemoteStatus {
    /// Synthesizes the event the reconciliation sweep feeds into the transition engine.
    /// `Pending` has nothing to apply.
    pub fn into_event(self, provider: ProviderName, order_ref: &str) -> Option<VerifiedEvent> {
        match self {
            RemoteStatus::Paid {
                provider_txn_id,
                settled_amount,
                paid_at,
            } => Some(VerifiedEvent {
                provider,
                order_ref: order_ref.to_string(),
                provider_txn_id,
                settled_amount: Some(settled_amount),
                outcome: EventOutcome::Paid,
                event_time: paid_at,
            }),
            RemoteStatus::Failed { reason } => Some(VerifiedEvent {
                provider,
                order_ref: order_ref.to_string(),
                provider_txn_id: None,
                settled_amount: None,
                outcome: EventOutcome::PaymentFailed {
                    reason: Some(reason),
                },
                event_time: None,
            }),
            RemoteStatus::Pending => None,
        }
    }
}

// ============================================================================
// Raw callbacks and acknowledgements
// ============================================================================

/// Inbound webhook exactly as received
#[derive(Debug, Clone)]
pub struct RawCallback {
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RawCallback {
    pub fn new(headers: HeaderMap, body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or("")
    }

    pub fn body_str(&self) -> Result<&str, ProviderError> {
        std::str::from_utf8(&self.body)
            .map_err(|e| ProviderError::MalformedPayload(format!("body is not utf-8: {}", e)))
    }
}

/// How the gateway wants the provider to treat its delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Processed or safely ignorable, stop retrying
    Accepted,
    /// Authenticity or parse failure
    Rejected { reason: String },
    /// Transient failure on our side, retry the delivery
    RetryLater { reason: String },
}

/// Provider-specific HTTP acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderAck {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl ProviderAck {
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
        }
    }

    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    pub fn xml(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "application/xml",
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl AckOutcome {
    /// HTTP status used for this outcome. Non-2xx makes the provider redeliver.
    pub fn http_status(&self) -> u16 {
        match self {
            AckOutcome::Accepted => 200,
            AckOutcome::Rejected { .. } => 400,
            AckOutcome::RetryLater { .. } => 500,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            AckOutcome::Accepted => "OK",
            AckOutcome::Rejected { reason } | AckOutcome::RetryLater { reason } => reason,
        }
    }
}

// ============================================================================
// Credentials
// ============================================================================

fn default_query_timeout_ms() -> u64 {
    5_000
}

/// One provider credential set, keyed by `(provider, app_id)` in the registry
#[derive(Clone, Deserialize)]
pub struct ProviderCredentials {
    pub provider: ProviderName,
    pub app_id: String,
    #[serde(default)]
    pub merchant_id: Option<String>,
    pub base_url: String,
    pub signing_secret: String,
    /// Douyin callback token
    #[serde(default)]
    pub notify_token: Option<String>,
    /// WeChat APIv3 envelope key (32 bytes)
    #[serde(default)]
    pub api_v3_key: Option<String>,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

impl fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("provider", &self.provider)
            .field("app_id", &self.app_id)
            .field("merchant_id", &self.merchant_id)
            .field("base_url", &self.base_url)
            .field("signing_secret", &"[REDACTED]")
            .field("notify_token", &self.notify_token.as_ref().map(|_| "[REDACTED]"))
            .field("api_v3_key", &self.api_v3_key.as_ref().map(|_| "[REDACTED]"))
            .field("query_timeout_ms", &self.query_timeout_ms)
            .finish()
    }
}

impl ProviderCredentials {
    pub fn validate(&self) -> Result<(), ProviderError> {
        let missing = |field: &str| {
            ProviderError::Configuration(format!(
                "{} credentials for app {:?} are missing {}",
                self.provider, self.app_id, field
            ))
        };

        if self.app_id.trim().is_empty() {
            return Err(missing("app_id"));
        }
        if self.base_url.trim().is_empty() {
            return Err(missing("base_url"));
        }
        if self.signing_secret.is_empty() {
            return Err(missing("signing_secret"));
        }

        match self.provider {
            ProviderName::Wechat => {
                if self.merchant_id.as_deref().map_or(true, str::is_empty) {
                    return Err(missing("merchant_id"));
                }
                match self.api_v3_key.as_deref() {
                    Some(key) if key.len() == 32 => {}
                    Some(_) => {
                        return Err(ProviderError::Configuration(format!(
                            "wechat api_v3_key for app {:?} must be 32 bytes",
                            self.app_id
                        )))
                    }
                    None => return Err(missing("api_v3_key")),
                }
            }
            ProviderName::Douyin => {
                if self.notify_token.as_deref().map_or(true, str::is_empty) {
                    return Err(missing("notify_token"));
                }
            }
            ProviderName::Alipay | ProviderName::Huawei | ProviderName::Kuaishou => {}
        }

        Ok(())
    }

    pub fn query_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.query_timeout_ms)
    }
}

// ============================================================================
// Amount and time helpers
// ============================================================================

/// Parses a decimal major-unit amount ("10.01") into minor units (1001).
/// Negative and out-of-range amounts are malformed.
pub fn parse_major_amount(raw: &str) -> Result<i64, ProviderError> {
    let value = Decimal::from_str(raw.trim())
        .map_err(|e| ProviderError::MalformedPayload(format!("invalid amount {:?}: {}", raw, e)))?;
    if value.is_sign_negative() && !value.is_zero() {
        return Err(ProviderError::MalformedPayload(format!("amount {:?} is negative", raw)));
    }
    let minor = value
        .checked_mul(Decimal::ONE_HUNDRED)
        .ok_or_else(|| ProviderError::MalformedPayload(format!("amount {:?} out of range", raw)))?;
    if minor.fract() != Decimal::ZERO {
        return Err(ProviderError::MalformedPayload(format!(
            "amount {:?} has sub-cent precision",
            raw
        )));
    }
    minor
        .to_i64()
        .ok_or_else(|| ProviderError::MalformedPayload(format!("amount {:?} out of range", raw)))
}

/// Parses a wall-clock timestamp in China Standard Time (UTC+8).
pub fn parse_cst_time(raw: &str, format: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), format).ok()?;
    let offset = FixedOffset::east_opt(8 * 3600)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn from_unix_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

pub fn from_unix_secs(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_provider_name_round_trip() {
        for provider in ProviderName::ALL {
            assert_eq!(provider.as_str().parse::<ProviderName>().unwrap(), provider);
        }
        assert_eq!("WeChatPay".parse::<ProviderName>().unwrap(), ProviderName::Wechat);
        assert!(matches!(
            "paypal".parse::<ProviderName>(),
            Err(ProviderError::UnknownProvider(_))
        ));
    }

    #[test]
    fn test_parse_major_amount() {
        assert_eq!(parse_major_amount("10.00").unwrap(), 1000);
        assert_eq!(parse_major_amount("0.01").unwrap(), 1);
        assert_eq!(parse_major_amount("12").unwrap(), 1200);
        assert!(parse_major_amount("1.005").is_err());
        assert!(parse_major_amount("abc").is_err());
        assert!(parse_major_amount("-5.00").is_err());
        assert_eq!(parse_major_amount("-0.00").unwrap(), 0);
        // Overflows the decimal itself once scaled to cents
        assert!(matches!(
            parse_major_amount("79228162514264337593543950335"),
            Err(ProviderError::MalformedPayload(_))
        ));
        // Fits a decimal but not an i64 of cents
        assert!(parse_major_amount("92233720368547758.08").is_err());
    }

    #[test]
    fn test_parse_cst_time() {
        let dt = parse_cst_time("2024-03-01 08:30:00", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(dt.hour(), 0);
        assert_eq!(dt.minute(), 30);
        assert!(parse_cst_time("not a time", "%Y-%m-%d %H:%M:%S").is_none());
    }

    #[test]
    fn test_remote_status_into_event() {
        let paid = RemoteStatus::Paid {
            provider_txn_id: Some("T1".to_string()),
            settled_amount: 1000,
            paid_at: None,
        };
        let event = paid.into_event(ProviderName::Alipay, "OUT456").unwrap();
        assert_eq!(event.outcome, EventOutcome::Paid);
        assert_eq!(event.settled_amount, Some(1000));
        assert_eq!(event.kind(), EventKind::Payment);

        assert!(RemoteStatus::Pending
            .into_event(ProviderName::Alipay, "OUT456")
            .is_none());
    }

    #[test]
    fn test_wechat_credentials_require_v3_key() {
        let creds = ProviderCredentials {
            provider: ProviderName::Wechat,
            app_id: "wx123".to_string(),
            merchant_id: Some("1900000001".to_string()),
            base_url: "https://api.mch.weixin.qq.com".to_string(),
            signing_secret: "secret".to_string(),
            notify_token: None,
            api_v3_key: Some("short".to_string()),
            query_timeout_ms: 5_000,
        };
        assert!(matches!(
            creds.validate(),
            Err(ProviderError::Configuration(_))
        ));
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = ProviderCredentials {
            provider: ProviderName::Alipay,
            app_id: "2021000000".to_string(),
            merchant_id: None,
            base_url: "https://openapi.alipay.com/gateway.do".to_string(),
            signing_secret: "super-secret".to_string(),
            notify_token: None,
            api_v3_key: None,
            query_timeout_ms: 5_000,
        };
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
