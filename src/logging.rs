//! Logging and tracing configuration for the payment gateway
//!
//! Provides structured logging with JSON formatting in production and
//! human-readable output in development. Raw provider callbacks carry
//! signatures and tokens, so they go through [`redact_sensitive_data`]
//! before being logged.

use regex::Regex;
use std::env;
use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Environment types for logging configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    /// Detect environment from ENV variable
    pub fn from_env() -> Self {
        Self::parse(
            &env::var("ENVIRONMENT")
                .or_else(|_| env::var("ENV"))
                .unwrap_or_else(|_| "development".to_string()),
        )
    }

    pub fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "staging" | "stage" => Self::Staging,
            _ => Self::Development,
        }
    }

    /// Get default log level for environment
    pub fn default_log_level(&self) -> Level {
        match self {
            Self::Development => Level::DEBUG,
            Self::Staging => Level::INFO,
            Self::Production => Level::INFO,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Initialize the tracing subscriber with appropriate formatting
///
/// # Environment Variables
/// - `ENVIRONMENT` or `ENV`: "production", "staging" or "development"
/// - `RUST_LOG`: overrides the default filter
/// - `LOG_FORMAT`: force "json" or "pretty"
pub fn init_tracing() {
    let environment = Environment::from_env();

    let use_json = env::var("LOG_FORMAT")
        .map(|f| f.to_lowercase() == "json")
        .unwrap_or_else(|_| environment.is_production());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{}={},tower_http=debug,axum=info,sqlx=warn,hyper=warn,reqwest=warn,tokio_cron_scheduler=warn",
            env!("CARGO_PKG_NAME").replace('-', "_"),
            environment.default_log_level()
        ))
    });

    if use_json {
        let json_layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_level(true)
            .with_file(false)
            .with_line_number(false)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(json_layer).init();
    } else {
        let pretty_layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(pretty_layer).init();
    }

    tracing::info!(
        environment = ?environment,
        format = if use_json { "json" } else { "pretty" },
        "Tracing initialized"
    );
}

/// Mask the middle of a reference (order ref, txn id) for request spans.
/// Shows first 4 and last 4 characters.
pub fn mask_reference(reference: &str) -> String {
    let chars: Vec<char> = reference.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

const SENSITIVE_KEYS: &[&str] = &[
    "sign",
    "signature",
    "msg_signature",
    "paySign",
    "signing_secret",
    "api_v3_key",
    "notify_token",
    "secret",
    "password",
    "token",
    "authorization",
];

fn redaction_patterns() -> &'static [(Regex, String)] {
    static PATTERNS: OnceLock<Vec<(Regex, String)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let mut patterns = Vec::new();
        for key in SENSITIVE_KEYS {
            // "key": "value"
            if let Ok(re) = Regex::new(&format!(r#""{}"\s*:\s*"[^"]*""#, key)) {
                patterns.push((re, format!(r#""{}": "[REDACTED]""#, key)));
            }
            // key=value in form bodies
            if let Ok(re) = Regex::new(&format!(r"(^|[&?]){}=[^&]*", key)) {
                patterns.push((re, format!("${{1}}{}=[REDACTED]", key)));
            }
            // <key>value</key>, including CDATA
            if let Ok(re) = Regex::new(&format!(r"<{0}>.*?</{0}>", key)) {
                patterns.push((re, format!("<{0}>[REDACTED]</{0}>", key)));
            }
        }
        patterns
    })
}

/// Redact signatures, keys and tokens from JSON, form-encoded or XML text
pub fn redact_sensitive_data(text: &str) -> String {
    let mut result = text.to_string();
    for (re, replacement) in redaction_patterns() {
        result = re.replace_all(&result, replacement.as_str()).into_owned();
    }
    result
}

/// Log an order state transition with consistent structure
///
/// ```no_run
/// # use paygate::log_transition;
/// log_transition!(
///     order_ref = "OUT123",
///     from = "PENDING",
///     to = "PAID",
///     source = "webhook",
/// );
/// ```
#[macro_export]
macro_rules! log_transition {
    ($($key:tt = $value:expr),* $(,)?) => {
        tracing::info!(
            event_type = "order_transition",
            $($key = tracing::field::display(&$value)),*
        );
    };
}
