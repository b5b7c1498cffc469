use std::time::Duration;
use thiserror::Error;

/// Upstream REST/WS failure, classified by response inspection rather than by
/// transport type. The classification drives retry behavior and the
/// invalid-symbol blocklist.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid symbol {symbol}: {message}")]
    InvalidSymbol { symbol: String, message: String },

    #[error("rate limited: {message}")]
    RateLimit { message: String },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("parameter error: {message}")]
    Parameter { message: String },

    #[error("api error: {message}")]
    Other { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiErrorKind {
    InvalidSymbol,
    RateLimit,
    Network,
    Server,
    Parameter,
    Other,
}

impl ApiError {
    /// Classify a non-2xx REST response from its status code and body.
    ///
    /// The exchange reports logical errors as `{"code":-NNNN,"msg":"..."}`
    /// with HTTP 400, so the payload code is inspected before the status.
    pub fn from_response(symbol: &str, status: u16, body: &str) -> Self {
        let payload: Option<serde_json::Value> = serde_json::from_str(body).ok();
        let code = payload
            .as_ref()
            .and_then(|v| v.get("code").and_then(|c| c.as_i64()));
        let message = payload
            .as_ref()
            .and_then(|v| v.get("msg").and_then(|m| m.as_str()))
            .map(|s| s.to_string())
            .unwrap_or_else(|| truncate(body, 200));

        match code {
            Some(-1121) | Some(-1122) => ApiError::InvalidSymbol {
                symbol: symbol.to_string(),
                message,
            },
            Some(-1003) | Some(-1015) => ApiError::RateLimit { message },
            Some(c) if (-1199..=-1100).contains(&c) => ApiError::Parameter { message },
            _ if status == 429 || status == 418 => ApiError::RateLimit { message },
            _ if (500..600).contains(&status) => ApiError::Server { status, message },
            _ if status == 400 && message.to_lowercase().contains("invalid symbol") => {
                ApiError::InvalidSymbol {
                    symbol: symbol.to_string(),
                    message,
                }
            }
            _ => ApiError::Other { message },
        }
    }

    pub fn from_transport(err: reqwest_middleware::Error) -> Self {
        ApiError::Network {
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> ApiErrorKind {
        match self {
            ApiError::InvalidSymbol { .. } => ApiErrorKind::InvalidSymbol,
            ApiError::RateLimit { .. } => ApiErrorKind::RateLimit,
            ApiError::Network { .. } => ApiErrorKind::Network,
            ApiError::Server { .. } => ApiErrorKind::Server,
            ApiError::Parameter { .. } => ApiErrorKind::Parameter,
            ApiError::Other { .. } => ApiErrorKind::Other,
        }
    }

    /// Retry delays for this error class. Empty means not retriable.
    pub fn retry_schedule(&self) -> &'static [Duration] {
        const RATE_LIMIT: [Duration; 3] = [
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(15),
        ];
        const NETWORK: [Duration; 3] = [
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(8),
        ];
        const SERVER: [Duration; 3] = [
            Duration::from_secs(3),
            Duration::from_secs(6),
            Duration::from_secs(9),
        ];
        const OTHER: [Duration; 3] = [
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(3),
        ];

        match self.kind() {
            ApiErrorKind::InvalidSymbol | ApiErrorKind::Parameter => &[],
            ApiErrorKind::RateLimit => &RATE_LIMIT,
            ApiErrorKind::Network => &NETWORK,
            ApiErrorKind::Server => &SERVER,
            ApiErrorKind::Other => &OTHER,
        }
    }
}

/// Outcome of the 24h-stats dual write when at least one side failed.
///
/// Both writes run concurrently; neither failure implies anything about the
/// other, so the error names exactly which table(s) went wrong.
#[derive(Debug)]
pub struct DualWriteError {
    pub current: Option<String>,
    pub history: Option<String>,
}

impl std::error::Error for DualWriteError {}

impl std::fmt::Display for DualWriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if let Some(e) = &self.current {
            parts.push(format!("current table write failed: {}", e));
        }
        if let Some(e) = &self.history {
            parts.push(format!("history table write failed: {}", e));
        }
        write!(f, "24h stats dual write: {}", parts.join("; "))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_invalid_symbol_payload() {
        let err =
            ApiError::from_response("FAKEUSDT", 400, r#"{"code":-1121,"msg":"Invalid symbol."}"#);
        assert_eq!(err.kind(), ApiErrorKind::InvalidSymbol);
        assert!(err.retry_schedule().is_empty());
    }

    #[test]
    fn classifies_rate_limit_from_status_and_code() {
        let by_code =
            ApiError::from_response("BTCUSDT", 400, r#"{"code":-1003,"msg":"Too many requests."}"#);
        assert_eq!(by_code.kind(), ApiErrorKind::RateLimit);

        let by_status = ApiError::from_response("BTCUSDT", 429, "slow down");
        assert_eq!(by_status.kind(), ApiErrorKind::RateLimit);
        assert_eq!(by_status.retry_schedule()[0], Duration::from_secs(5));
    }

    #[test]
    fn classifies_server_and_parameter_errors() {
        let server = ApiError::from_response("BTCUSDT", 502, "bad gateway");
        assert_eq!(server.kind(), ApiErrorKind::Server);

        let param = ApiError::from_response(
            "BTCUSDT",
            400,
            r#"{"code":-1102,"msg":"Mandatory parameter missing."}"#,
        );
        assert_eq!(param.kind(), ApiErrorKind::Parameter);
        assert!(param.retry_schedule().is_empty());
    }

    #[test]
    fn dual_write_error_names_failed_tables() {
        let err = DualWriteError {
            current: None,
            history: Some("disk full".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("history"));
        assert!(!msg.contains("current table"));
    }
}
