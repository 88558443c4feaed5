use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use tracing::warn;

/// Body marker of the 429 variant that demands a fixed cool-down.
pub(super) const LOCKOUT_MARKER: &[u8] = b"Too many failed attempts";
pub(super) const RESET_REQUESTS_HEADER: &str = "x-ratelimit-reset-requests";

const MIN_RESET_WAIT_SECS: i64 = 1;
const MAX_RESET_WAIT_SECS: i64 = 3600;
/// Values below this are read as "seconds remaining" rather than a timestamp.
const SECONDS_REMAINING_LIMIT: i64 = 3600;

/// How a reset header value was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetUnit {
    EpochMillis,
    SecondsRemaining,
    EpochSeconds,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitSignal {
    FailedAttemptsLockout,
    HeaderBasedReset {
        raw: i64,
        unit: ResetUnit,
        wait: Duration,
    },
    Generic429,
    ServerError(StatusCode),
    TransportError,
    Success,
    ClientError(StatusCode),
}

fn header_value_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Interpret a `x-ratelimit-reset-requests` value as a wait from `now_secs`.
///
/// Providers disagree on the unit, so the value is sorted by magnitude:
/// larger than now-in-millis means an epoch timestamp in milliseconds,
/// below one hour means seconds remaining, anything else an epoch
/// timestamp in seconds. The wait is clamped to `[1s, 3600s]`.
pub(super) fn interpret_reset(raw: i64, now_secs: i64) -> (ResetUnit, Duration) {
    let (unit, secs) = if raw > now_secs.saturating_mul(1000) {
        (ResetUnit::EpochMillis, raw / 1000 - now_secs)
    } else if raw < SECONDS_REMAINING_LIMIT {
        (ResetUnit::SecondsRemaining, raw)
    } else {
        (ResetUnit::EpochSeconds, raw - now_secs)
    };
    let secs = secs.clamp(MIN_RESET_WAIT_SECS, MAX_RESET_WAIT_SECS);
    (unit, Duration::from_secs(secs as u64))
}

/// Classify one upstream response.
///
/// `body` must be provided for 429s, since the lockout variant is only
/// recognisable by its body. Transport failures never reach this function;
/// they map straight to [`RateLimitSignal::TransportError`].
pub(super) fn classify_upstream_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: Option<&[u8]>,
    now_secs: i64,
) -> RateLimitSignal {
    if status == StatusCode::TOO_MANY_REQUESTS {
        if body.is_some_and(|b| contains_bytes(b, LOCKOUT_MARKER)) {
            return RateLimitSignal::FailedAttemptsLockout;
        }
        if let Some(raw) = header_value_str(headers, RESET_REQUESTS_HEADER) {
            match raw.trim().parse::<i64>() {
                Ok(value) => {
                    let (unit, wait) = interpret_reset(value, now_secs);
                    return RateLimitSignal::HeaderBasedReset {
                        raw: value,
                        unit,
                        wait,
                    };
                }
                Err(_) => {
                    warn!(value = %raw, "invalid rate limit header value");
                }
            }
        }
        return RateLimitSignal::Generic429;
    }

    if status.is_server_error() || status.as_u16() >= 600 {
        return RateLimitSignal::ServerError(status);
    }
    if status.is_client_error() {
        return RateLimitSignal::ClientError(status);
    }
    RateLimitSignal::Success
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    const NOW: i64 = 1_700_000_000;

    fn headers_with_reset(v: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(RESET_REQUESTS_HEADER, v.parse().unwrap());
        h
    }

    #[test]
    fn lockout_body_wins_over_reset_header() {
        let signal = classify_upstream_response(
            StatusCode::TOO_MANY_REQUESTS,
            &headers_with_reset("30"),
            Some(br#"{"error":"Too many failed attempts, wait 30s"}"#),
            NOW,
        );
        assert_eq!(signal, RateLimitSignal::FailedAttemptsLockout);
    }

    #[test]
    fn small_reset_value_is_seconds_remaining() {
        let signal = classify_upstream_response(
            StatusCode::TOO_MANY_REQUESTS,
            &headers_with_reset("30"),
            Some(b"{}"),
            NOW,
        );
        assert_eq!(
            signal,
            RateLimitSignal::HeaderBasedReset {
                raw: 30,
                unit: ResetUnit::SecondsRemaining,
                wait: Duration::from_secs(30),
            }
        );
    }

    #[test]
    fn reset_value_units_are_inferred_by_magnitude() {
        assert_eq!(
            interpret_reset((NOW + 42) * 1000, NOW),
            (ResetUnit::EpochMillis, Duration::from_secs(42))
        );
        assert_eq!(
            interpret_reset(NOW + 90, NOW),
            (ResetUnit::EpochSeconds, Duration::from_secs(90))
        );
        assert_eq!(
            interpret_reset(0, NOW),
            (ResetUnit::SecondsRemaining, Duration::from_secs(1))
        );
    }

    #[test]
    fn reset_wait_is_clamped() {
        // A timestamp in the past still waits at least one second.
        assert_eq!(interpret_reset(NOW - 500, NOW).1, Duration::from_secs(1));
        assert_eq!(
            interpret_reset(NOW + 10 * 3600, NOW).1,
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn unparsable_or_missing_header_is_generic() {
        for headers in [headers_with_reset("6m0s"), HeaderMap::new()] {
            let signal = classify_upstream_response(
                StatusCode::TOO_MANY_REQUESTS,
                &headers,
                Some(b"slow down"),
                NOW,
            );
            assert_eq!(signal, RateLimitSignal::Generic429);
        }
    }

    #[test]
    fn non_429_statuses() {
        let h = HeaderMap::new();
        assert_eq!(
            classify_upstream_response(StatusCode::BAD_GATEWAY, &h, None, NOW),
            RateLimitSignal::ServerError(StatusCode::BAD_GATEWAY)
        );
        assert_eq!(
            classify_upstream_response(StatusCode::BAD_REQUEST, &h, None, NOW),
            RateLimitSignal::ClientError(StatusCode::BAD_REQUEST)
        );
        assert_eq!(
            classify_upstream_response(StatusCode::OK, &h, None, NOW),
            RateLimitSignal::Success
        );
        assert_eq!(
            classify_upstream_response(StatusCode::FOUND, &h, None, NOW),
            RateLimitSignal::Success
        );
    }
}
