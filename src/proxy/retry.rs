use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tracing::{debug, error, warn};

use crate::config::RetryConfig;

use super::classify::{RateLimitSignal, classify_upstream_response};
use super::upstream::UpstreamResponse;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub lockout_wait: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Seconds to a `Duration`, saturating instead of panicking on overflow.
fn saturating_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: saturating_secs(cfg.base_delay_secs),
            lockout_wait: Duration::from_secs(cfg.lockout_wait_secs),
            max_jitter: saturating_secs(cfg.jitter_secs),
        }
    }
}

impl RetryPolicy {
    /// `base × 2^attempt + U(0, max_jitter)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = 2f64.powi(attempt.min(30) as i32);
        let jitter = if self.max_jitter.is_zero() {
            0.0
        } else {
            rand::thread_rng().gen_range(0.0..self.max_jitter.as_secs_f64())
        };
        saturating_secs(self.base_delay.as_secs_f64() * exp + jitter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    Lockout,
    RateLimitReset,
    RateLimitBackoff,
    ServerError(u16),
    Transport,
}

impl WaitReason {
    fn as_str(&self) -> &'static str {
        match self {
            WaitReason::Lockout => "failed_attempts_lockout",
            WaitReason::RateLimitReset => "rate_limit_reset_header",
            WaitReason::RateLimitBackoff => "rate_limit_backoff",
            WaitReason::ServerError(_) => "server_error",
            WaitReason::Transport => "transport_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledWait {
    /// Zero-based index of the attempt that triggered the wait.
    pub attempt: u32,
    pub reason: WaitReason,
    pub delay: Duration,
}

/// What happened across the attempt loop of one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryReport {
    pub attempts: u32,
    pub waits: Vec<ScheduledWait>,
    pub exhausted: bool,
}

impl RetryReport {
    /// One `#attempt:reason:delay` entry per wait, for the request log.
    pub fn summary(&self) -> String {
        self.waits
            .iter()
            .map(|w| format!("#{}:{}:{:.1}s", w.attempt, w.reason.as_str(), w.delay.as_secs_f64()))
            .collect::<Vec<_>>()
            .join(",")
    }
}

pub struct RetryOutcome<E> {
    pub result: Result<UpstreamResponse, E>,
    pub report: RetryReport,
}

fn unix_now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Drive `send` until it yields a non-retryable response or attempts run out.
///
/// Makes up to `max_retries + 1` attempts. Exhausted rate-limit/server-error
/// retries return the last genuine response; exhausted transport retries
/// return the last error. Dropping the returned future cancels any pending
/// sleep or in-flight attempt.
pub async fn send_with_retry<F, Fut, E>(policy: &RetryPolicy, mut send: F) -> RetryOutcome<E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<UpstreamResponse, E>>,
    E: From<reqwest::Error> + Display,
{
    let mut report = RetryReport::default();
    let mut attempt: u32 = 0;

    loop {
        report.attempts = attempt + 1;
        let last = attempt >= policy.max_retries;

        let outcome = match send().await {
            Ok(resp) if resp.status() == axum::http::StatusCode::TOO_MANY_REQUESTS => {
                // Lockout detection needs the body.
                resp.into_buffered().await.map_err(E::from)
            }
            other => other,
        };

        let (resp, signal) = match outcome {
            Ok(resp) => {
                let signal = classify_upstream_response(
                    resp.status(),
                    resp.headers(),
                    resp.buffered_body().map(|b| b.as_ref()),
                    unix_now_secs(),
                );
                (Ok(resp), signal)
            }
            Err(e) => (Err(e), RateLimitSignal::TransportError),
        };

        let (reason, delay) = match &signal {
            RateLimitSignal::Success | RateLimitSignal::ClientError(_) => {
                return RetryOutcome {
                    result: resp,
                    report,
                };
            }
            RateLimitSignal::FailedAttemptsLockout => (WaitReason::Lockout, policy.lockout_wait),
            RateLimitSignal::HeaderBasedReset { raw, unit, wait } => {
                debug!(raw, unit = ?unit, wait_secs = wait.as_secs(), "interpreted rate limit reset header");
                (WaitReason::RateLimitReset, *wait)
            }
            RateLimitSignal::Generic429 => {
                (WaitReason::RateLimitBackoff, policy.backoff(attempt))
            }
            RateLimitSignal::ServerError(status) => {
                (WaitReason::ServerError(status.as_u16()), policy.backoff(attempt))
            }
            RateLimitSignal::TransportError => (WaitReason::Transport, policy.backoff(attempt)),
        };

        if last {
            report.exhausted = true;
            match &resp {
                Ok(r) => error!(
                    reason = reason.as_str(),
                    status = r.status().as_u16(),
                    attempts = report.attempts,
                    "max retries exceeded, returning last upstream response"
                ),
                Err(e) => error!(
                    reason = reason.as_str(),
                    attempts = report.attempts,
                    error = %e,
                    "max retries exceeded for request error"
                ),
            }
            return RetryOutcome {
                result: resp,
                report,
            };
        }

        if let Err(e) = &resp {
            warn!(
                reason = reason.as_str(),
                error = %e,
                delay_secs = delay.as_secs_f64(),
                retry = attempt + 1,
                max_retries = policy.max_retries,
                "retry scheduled"
            );
        } else {
            warn!(
                reason = reason.as_str(),
                delay_secs = delay.as_secs_f64(),
                retry = attempt + 1,
                max_retries = policy.max_retries,
                "retry scheduled"
            );
        }
        report.waits.push(ScheduledWait {
            attempt,
            reason,
            delay,
        });
        // Release the connection of the discarded attempt before sleeping.
        drop(resp);
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
