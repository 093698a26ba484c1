//! Fan-out/fan-in driver shared by dependency and readiness checks.
//!
//! Every check runs in its own task with its own deadline and retries at a
//! fixed interval until it reaches a terminal verdict. All tasks report onto
//! one channel; the caller waits until every check has reported.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Result of a single attempt of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    Success,
    /// The target does not exist at all. Terminal, never retried.
    Missing,
    /// Not satisfied yet; try again after the retry interval.
    Retry(String),
}

/// Terminal result of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum Verdict {
    Success,
    Missing,
    Failed(String),
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Missing => write!(f, "missing"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

pub type AttemptFuture = Pin<Box<dyn Future<Output = Attempt> + Send>>;

/// One named check and the closure that performs a single attempt.
pub struct ProbeCheck {
    pub name: String,
    pub timeout: Duration,
    attempt: Arc<dyn Fn() -> AttemptFuture + Send + Sync>,
}

impl ProbeCheck {
    pub fn new<F>(name: impl Into<String>, timeout: Duration, attempt: F) -> Self
    where
        F: Fn() -> AttemptFuture + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            timeout,
            attempt: Arc::new(attempt),
        }
    }
}

impl fmt::Debug for ProbeCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeCheck")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Verdicts of a completed probe run, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub results: Vec<(String, Verdict)>,
}

impl ProbeReport {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|(_, v)| *v == Verdict::Success)
    }

    /// `None` when everything succeeded, otherwise one line naming every
    /// check that did not.
    pub fn explain(&self) -> Option<String> {
        let failed: Vec<String> = self
            .results
            .iter()
            .filter(|(_, v)| *v != Verdict::Success)
            .map(|(name, v)| format!("{name} ({v})"))
            .collect();
        if failed.is_empty() {
            None
        } else {
            Some(format!(
                "{} of {} checks unresolved: {}",
                failed.len(),
                self.results.len(),
                failed.join(", ")
            ))
        }
    }
}

async fn drive(check: &ProbeCheck, retry_interval: Duration) -> Verdict {
    let deadline = Instant::now() + check.timeout;
    let mut last_reason = String::from("no attempt completed");

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, (check.attempt)()).await {
            Ok(Attempt::Success) => return Verdict::Success,
            Ok(Attempt::Missing) => return Verdict::Missing,
            Ok(Attempt::Retry(reason)) => {
                trace!("{}: not yet satisfied: {reason}", check.name);
                last_reason = reason;
            }
            Err(_) => break,
        }

        let next = Instant::now() + retry_interval;
        if next >= deadline {
            tokio::time::sleep_until(deadline).await;
            break;
        }
        tokio::time::sleep_until(next).await;
    }

    Verdict::Failed(format!(
        "timed out after {:?}: {last_reason}",
        check.timeout
    ))
}

/// Run every check concurrently and wait for all of them to finish.
pub async fn run_checks(checks: Vec<ProbeCheck>, retry_interval: Duration) -> ProbeReport {
    if checks.is_empty() {
        return ProbeReport::default();
    }

    let names: Vec<String> = checks.iter().map(|c| c.name.clone()).collect();
    let (tx, mut rx) = mpsc::channel::<(usize, Verdict)>(checks.len());

    for (slot, check) in checks.into_iter().enumerate() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let verdict = drive(&check, retry_interval).await;
            // The receiver only goes away if the caller was cancelled.
            let _ = tx.send((slot, verdict)).await;
        });
    }
    drop(tx);

    let mut pending: BTreeSet<usize> = (0..names.len()).collect();
    let mut verdicts: Vec<Option<Verdict>> = vec![None; names.len()];
    while !pending.is_empty() {
        let Some((slot, verdict)) = rx.recv().await else {
            break;
        };
        if pending.remove(&slot) {
            debug!("check {} finished: {verdict}", names[slot]);
            verdicts[slot] = Some(verdict);
        }
    }

    let results = names
        .into_iter()
        .zip(verdicts)
        .map(|(name, verdict)| {
            let verdict =
                verdict.unwrap_or_else(|| Verdict::Failed("check task ended early".to_owned()));
            (name, verdict)
        })
        .collect();
    ProbeReport { results }
}
