//! HTTP status and transport failures mapped onto `StateError`.

use chrono::Utc;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::time::Duration;

use crate::errors::StateError;

pub(crate) fn client(timeout: Duration) -> Result<reqwest::Client, StateError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("tether/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| StateError::unavailable("http", format!("failed to build client: {}", e)))
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Wait hint from `retry-after`, or from an epoch `x-ratelimit-reset`.
pub(crate) fn retry_after(headers: &HeaderMap, now_epoch: i64) -> Option<Duration> {
    if let Some(secs) = header_u64(headers, "retry-after") {
        return Some(Duration::from_secs(secs));
    }
    header_u64(headers, "x-ratelimit-reset").map(|reset| {
        let now = u64::try_from(now_epoch).unwrap_or(0);
        Duration::from_secs(reset.saturating_sub(now))
    })
}

/// Classify a non-success response.
pub(crate) fn status_error(
    provider: &str,
    resource: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> StateError {
    let exhausted = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0");

    if status == StatusCode::TOO_MANY_REQUESTS || (status == StatusCode::FORBIDDEN && exhausted) {
        return StateError::RateLimited {
            provider: provider.to_string(),
            retry_after: retry_after(headers, Utc::now().timestamp()),
        };
    }
    match status {
        StatusCode::NOT_FOUND => StateError::NotFound {
            kind: "issue",
            id: resource.to_string(),
        },
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            StateError::ConcurrentModification {
                resource: resource.to_string(),
                expected: "observed version".to_string(),
                found: format!("HTTP {}", status.as_u16()),
            }
        }
        _ => {
            let snippet: String = body.chars().take(200).collect();
            StateError::unavailable(
                provider,
                format!("{} returned HTTP {}: {}", resource, status.as_u16(), snippet),
            )
        }
    }
}

pub(crate) fn transport_error(provider: &str, resource: &str, err: reqwest::Error) -> StateError {
    let kind = if err.is_timeout() {
        "timed out"
    } else if err.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    StateError::unavailable(provider, format!("{} {}: {}", resource, kind, err))
}
