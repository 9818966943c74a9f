//! Concrete provider adapters

pub mod alipay;
pub mod douyin;
pub mod huawei;
pub mod kuaishou;
pub mod wechat;

pub use alipay::AlipayAdapter;
pub use douyin::DouyinAdapter;
pub use huawei::HuaweiAdapter;
pub use kuaishou::KuaishouAdapter;
pub use wechat::WechatAdapter;

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

use super::error::ProviderError;
use super::provider::PaymentProvider;
use super::signature::{HmacSha256Scheme, SignatureEncoding, SignatureScheme};
use super::types::{ProviderCredentials, ProviderName};
use crate::middleware::logging::log_external_call;

/// Builds the adapter for a credential set with the default HMAC scheme.
pub fn build_provider(
    credentials: ProviderCredentials,
    http: reqwest::Client,
) -> Result<Arc<dyn PaymentProvider>, ProviderError> {
    let encoding = match credentials.provider {
        ProviderName::Alipay | ProviderName::Wechat | ProviderName::Huawei => {
            SignatureEncoding::Base64
        }
        ProviderName::Douyin | ProviderName::Kuaishou => SignatureEncoding::Hex,
    };
    let scheme: Arc<dyn SignatureScheme> = Arc::new(HmacSha256Scheme::new(
        credentials.signing_secret.clone().into_bytes(),
        encoding,
    ));
    build_provider_with_scheme(credentials, scheme, http)
}

pub fn build_provider_with_scheme(
    credentials: ProviderCredentials,
    scheme: Arc<dyn SignatureScheme>,
    http: reqwest::Client,
) -> Result<Arc<dyn PaymentProvider>, ProviderError> {
    let provider: Arc<dyn PaymentProvider> = match credentials.provider {
        ProviderName::Alipay => Arc::new(AlipayAdapter::new(credentials, scheme, http)),
        ProviderName::Wechat => Arc::new(WechatAdapter::new(credentials, scheme, http)?),
        ProviderName::Douyin => Arc::new(DouyinAdapter::new(credentials, scheme, http)?),
        ProviderName::Huawei => Arc::new(HuaweiAdapter::new(credentials, scheme, http)),
        ProviderName::Kuaishou => Arc::new(KuaishouAdapter::new(credentials, scheme, http)),
    };
    Ok(provider)
}

/// Sends a provider API request and decodes its JSON body, keeping the HTTP status.
/// 5xx responses are reported as `ProviderUnavailable`.
pub(crate) async fn send_json(
    provider: ProviderName,
    endpoint: &str,
    request: reqwest::RequestBuilder,
) -> Result<(reqwest::StatusCode, Value), ProviderError> {
    log_external_call(provider.as_str(), endpoint, async {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_server_error() {
            return Err(ProviderError::ProviderUnavailable(format!(
                "{} returned {}",
                endpoint, status
            )));
        }

        let value = if body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body)?
        };
        Ok((status, value))
    })
    .await
}

/// String field that providers sometimes send as a number.
pub(crate) fn json_str(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Integer field that providers sometimes send as a string.
pub(crate) fn json_i64(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn require_str(value: &Value, key: &str) -> Result<String, ProviderError> {
    json_str(value, key)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProviderError::MalformedPayload(format!("missing field {}", key)))
}

pub(crate) fn require_i64(value: &Value, key: &str) -> Result<i64, ProviderError> {
    json_i64(value, key)
        .ok_or_else(|| ProviderError::MalformedPayload(format!("missing or invalid field {}", key)))
}

/// Signed deliveries further than this from our clock are treated as replays
pub(crate) const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Checks a signed unix-seconds timestamp against the local clock.
pub(crate) fn ensure_fresh(timestamp: &str) -> Result<(), ProviderError> {
    let sent_at: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| ProviderError::InvalidSignature("invalid callback timestamp".to_string()))?;
    if (Utc::now().timestamp() - sent_at).abs() > MAX_CLOCK_SKEW_SECS {
        return Err(ProviderError::InvalidSignature("stale callback timestamp".to_string()));
    }
    Ok(())
}

/// Rejects deliveries addressed to a different application.
pub(crate) fn ensure_app_id(expected: &str, actual: Option<&str>) -> Result<(), ProviderError> {
    match actual {
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => Err(ProviderError::InvalidSignature(format!(
            "callback addressed to app {} instead of {}",
            actual, expected
        ))),
        None => Err(ProviderError::MalformedPayload("missing app id".to_string())),
    }
}
