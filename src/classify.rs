//! Failure classification for the two downstream services.
//!
//! Both clients surface a [`ClientError`]; the classifier decides whether the
//! engine may retry, what the user-facing message is, and whether the service
//! told us how long to wait. First matching rule wins.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("timeout after {ms} ms ({label})")]
    Timeout { label: &'static str, ms: u64 },

    #[error("http {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid json where json was required: {0}")]
    BadJson(String),

    /// An error reported inside an otherwise-successful response body
    /// (GraphQL `errors` / `userErrors`, generator refusals).
    #[error("api error: {0}")]
    Api(String),
}

impl ClientError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                label: "http request",
                ms: 0,
            }
        } else if let Some(status) = err.status() {
            Self::Http {
                status: status.as_u16(),
                message: err.to_string(),
                retry_after: None,
            }
        } else {
            // DNS failures, connection resets, TLS problems.
            Self::Network(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub transient: bool,
    pub user_message: String,
    pub retry_after: Option<Duration>,
}

impl Classification {
    fn permanent(user_message: impl Into<String>) -> Self {
        Self {
            transient: false,
            user_message: user_message.into(),
            retry_after: None,
        }
    }

    fn transient(user_message: impl Into<String>) -> Self {
        Self {
            transient: true,
            user_message: user_message.into(),
            retry_after: None,
        }
    }
}

fn mentions_too_long(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("context length")
        || m.contains("too long")
        || (m.contains("max") && m.contains("tokens"))
}

fn mentions_throttle(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("throttl") || m.contains("rate limit") || m.contains("too many requests")
}

/// Classify a client error. First match wins.
pub fn classify(err: &ClientError) -> Classification {
    match err {
        ClientError::Http {
            status,
            message,
            retry_after,
        } => match *status {
            401 | 403 => Classification::permanent("authentication failed"),
            429 => Classification {
                transient: true,
                user_message: "rate limited".to_string(),
                retry_after: *retry_after,
            },
            400 if mentions_too_long(message) => Classification::permanent("input too long"),
            400..=499 => Classification::permanent(format!("request rejected ({status}): {message}")),
            500..=599 => Classification::transient(format!("upstream error ({status})")),
            _ => Classification::transient(format!("unexpected status {status}")),
        },
        ClientError::Timeout { label, ms } => {
            Classification::transient(format!("timed out after {ms} ms ({label})"))
        }
        ClientError::Network(message) => Classification::transient(format!("network error: {message}")),
        // A non-parsable body where JSON was required gets one more chance.
        ClientError::BadJson(message) => {
            Classification::transient(format!("invalid response: {message}"))
        }
        ClientError::Api(message) => {
            if mentions_throttle(message) {
                Classification::transient("rate limited")
            } else {
                Classification::permanent(message.clone())
            }
        }
    }
}

/// Truncate an error message for storage on an item or job row.
pub fn truncate_error(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        message.to_string()
    } else {
        message.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16, message: &str) -> ClientError {
        ClientError::Http {
            status,
            message: message.to_string(),
            retry_after: None,
        }
    }

    #[test]
    fn auth_failures_are_permanent() {
        for status in [401, 403] {
            let c = classify(&http(status, "nope"));
            assert!(!c.transient);
            assert_eq!(c.user_message, "authentication failed");
        }
    }

    #[test]
    fn rate_limit_is_transient_with_retry_after() {
        let c = classify(&ClientError::Http {
            status: 429,
            message: "slow down".to_string(),
            retry_after: Some(Duration::from_secs(7)),
        });
        assert!(c.transient);
        assert_eq!(c.user_message, "rate limited");
        assert_eq!(c.retry_after, Some(Duration::from_secs(7)));
    }

    #[test]
    fn oversized_input_is_permanent() {
        let c = classify(&http(400, "This model's maximum context length is 8192 tokens"));
        assert!(!c.transient);
        assert_eq!(c.user_message, "input too long");

        let c = classify(&http(400, "prompt is too long"));
        assert_eq!(c.user_message, "input too long");
    }

    #[test]
    fn other_4xx_is_permanent_5xx_is_transient() {
        assert!(!classify(&http(422, "invalid field")).transient);
        assert!(classify(&http(500, "boom")).transient);
        assert!(classify(&http(503, "unavailable")).transient);
    }

    #[test]
    fn timeouts_and_network_errors_are_transient() {
        assert!(
            classify(&ClientError::Timeout {
                label: "generator",
                ms: 60_000
            })
            .transient
        );
        assert!(classify(&ClientError::Network("connection reset".to_string())).transient);
    }

    #[test]
    fn bad_json_is_transient() {
        assert!(classify(&ClientError::BadJson("expected value".to_string())).transient);
    }

    #[test]
    fn graphql_throttle_on_200_is_transient() {
        let c = classify(&ClientError::Api("Throttled: exceeded cost".to_string()));
        assert!(c.transient);
        assert_eq!(c.user_message, "rate limited");

        let c = classify(&ClientError::Api("too many requests from this client".to_string()));
        assert!(c.transient);
    }

    #[test]
    fn graphql_user_error_is_permanent() {
        let c = classify(&ClientError::Api("Invalid id".to_string()));
        assert!(!c.transient);
        assert_eq!(c.user_message, "Invalid id");
    }

    #[test]
    fn truncation_respects_char_count() {
        let long = "x".repeat(1200);
        assert_eq!(truncate_error(&long, 900).chars().count(), 900);
        assert_eq!(truncate_error("short", 900), "short");
    }
}
