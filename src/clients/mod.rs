//! Clients for the two downstream services: the text-completion generator and
//! the store admin GraphQL API. Both route every call through the shared
//! retry machinery in `crate::retry` and classify failures via
//! `crate::classify`.

pub mod generator;
pub mod gid;
pub mod language;
pub mod storeapi;

use std::time::Duration;

pub use generator::{GeneratedFields, GenerationHints, GeneratorClient, TargetPayload};
pub use storeapi::{FieldToggles, ImageTarget, LiveSeo, StoreApiClient};

/// `Retry-After` as a whole-seconds value; date-form headers are ignored.
pub(crate) fn retry_after_from_headers(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Hard-truncate a field to `max` characters (not bytes).
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

    #[test]
    fn retry_after_parses_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(
            retry_after_from_headers(&headers),
            Some(Duration::from_secs(12))
        );
    }

    #[test]
    fn retry_after_ignores_dates() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"),
        );
        assert_eq!(retry_after_from_headers(&headers), None);
    }

    #[test]
    fn truncation_counts_characters() {
        assert_eq!(truncate_chars("çğışöü-extra", 6), "çğışöü");
        assert_eq!(truncate_chars("ok", 6), "ok");
    }
}
