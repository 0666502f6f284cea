use std::{future::Future, time::Duration};

use anyhow::Context;
use tokio::time::Instant;

/// Result of one readiness attempt.
#[derive(Debug)]
pub(crate) enum Attempt {
    Ready,
    /// Not ready yet; the reason is kept for the timeout report.
    Pending(String),
    /// Stop polling; waiting longer cannot help.
    Abort(String),
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    Ready {
        attempts: u32,
    },
    Aborted(String),
    TimedOut {
        attempts: u32,
        last_error: Option<String>,
    },
}

/// Repeats `attempt` every `interval` until it succeeds, aborts, or `timeout`
/// elapses. Each attempt receives the remaining budget so it can bound itself.
pub(crate) async fn poll_with_deadline<F, Fut>(
    interval: Duration,
    timeout: Duration,
    mut attempt: F,
) -> PollOutcome
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Attempt>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts: u32 = 0;
    let mut last_error = None;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return PollOutcome::TimedOut {
                attempts,
                last_error,
            };
        }

        attempts = attempts.saturating_add(1);
        match attempt(remaining).await {
            Attempt::Ready => return PollOutcome::Ready { attempts },
            Attempt::Abort(reason) => return PollOutcome::Aborted(reason),
            Attempt::Pending(reason) => last_error = Some(reason),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return PollOutcome::TimedOut {
                attempts,
                last_error,
            };
        }
        tokio::time::sleep(interval.min(remaining)).await;
    }
}

/// HTTP health check against the server's local address.
#[derive(Debug, Clone)]
pub(crate) struct HealthProbe {
    client: reqwest::Client,
    url: String,
    per_request: Duration,
}

impl HealthProbe {
    /// `addr` is a `host:port` pair, IPv6 hosts bracketed.
    pub(crate) fn new(addr: &str, path: &str, per_request: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(per_request)
            .build()
            .context("build health probe client")?;
        Ok(Self {
            client,
            url: format!("http://{addr}{path}"),
            per_request,
        })
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    /// One request, bounded by the smaller of the per-request timeout and `budget`.
    pub(crate) async fn check(&self, budget: Duration) -> Result<(), String> {
        let limit = budget.min(self.per_request);
        match tokio::time::timeout(limit, self.client.get(&self.url).send()).await {
            Err(_) => Err(format!("no response within {}ms", limit.as_millis())),
            Ok(Err(e)) => Err(e.to_string()),
            Ok(Ok(resp)) if resp.status() == reqwest::StatusCode::OK => Ok(()),
            Ok(Ok(resp)) => Err(format!("unhealthy response: HTTP {}", resp.status())),
        }
    }
}
