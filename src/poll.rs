//! Condition polling against eventually-consistent control planes.
//!
//! A predicate reports a [`Readiness`] observation: `Ready`, or `NotReady`
//! with a reason. Failing to observe at all is an `Err`, which is retried
//! through the poll's query [`RetryPolicy`] and only surfaces once that policy
//! gives up. The two are never confused: "not ready yet" keeps the poll going,
//! a query that keeps failing ends it.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::retry::{retry, RetryPolicy};

/// Outcome of a single readiness observation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// The condition holds
    Ready,
    /// The condition was observed and does not hold yet
    NotReady(String),
}

impl Readiness {
    /// Build a not-ready observation
    pub fn not_ready(reason: impl Into<String>) -> Self {
        Readiness::NotReady(reason.into())
    }

    /// Whether the condition holds
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }

    /// Combine observations; ready only if every one is ready
    pub fn all(observations: impl IntoIterator<Item = Readiness>) -> Readiness {
        let reasons: Vec<String> = observations
            .into_iter()
            .filter_map(|r| match r {
                Readiness::Ready => None,
                Readiness::NotReady(reason) => Some(reason),
            })
            .collect();
        if reasons.is_empty() {
            Readiness::Ready
        } else {
            Readiness::NotReady(reasons.join("; "))
        }
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Ready => write!(f, "ready"),
            Readiness::NotReady(reason) => write!(f, "not ready: {}", reason),
        }
    }
}

/// Timing for a poll.
#[derive(Clone, Debug)]
pub struct PollSpec {
    /// Total budget
    pub timeout: Duration,
    /// Delay after the first not-ready observation
    pub initial_interval: Duration,
    /// Ceiling for the delay between observations
    pub max_interval: Duration,
    /// Growth factor for the delay
    pub multiplier: f64,
    /// Policy applied to each individual observation
    pub query_retry: RetryPolicy,
}

impl PollSpec {
    /// Exponential backoff from 1s capped at 30s
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            query_retry: RetryPolicy::with_max_attempts(5).max_delay(Duration::from_secs(30)),
        }
    }

    /// Set the interval ceiling
    pub fn max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }

    /// Poll at a fixed interval
    pub fn fixed_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self.max_interval = interval;
        self.multiplier = 1.0;
        self
    }

    /// Replace the per-observation retry policy
    pub fn query_retry(mut self, policy: RetryPolicy) -> Self {
        self.query_retry = policy;
        self
    }

    fn next_interval(&self, interval: Duration) -> Duration {
        Duration::from_secs_f64(
            (interval.as_secs_f64() * self.multiplier).min(self.max_interval.as_secs_f64()),
        )
    }
}

/// Poll `predicate` until it reports [`Readiness::Ready`].
///
/// Fails with [`Error::PollTimeout`] once `spec.timeout` has elapsed without a
/// ready observation, with [`Error::Cancelled`] on cancellation, or with the
/// predicate's own error when its query policy gives up.
pub async fn poll_until_ready<F, Fut>(
    spec: &PollSpec,
    description: &str,
    cancel: &CancellationToken,
    mut predicate: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Readiness>>,
{
    info!(
        "Waiting up to {:.2} minutes for {}",
        spec.timeout.as_secs_f64() / 60.0,
        description
    );

    let deadline = Instant::now() + spec.timeout;
    let mut interval = spec.initial_interval;
    let mut last_reason = String::from("no observation completed");
    let mut iteration = 0u32;

    let timed_out = |last_reason: String| Error::PollTimeout {
        description: description.to_string(),
        timeout: spec.timeout,
        last_reason,
    };

    loop {
        iteration += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let observation = tokio::time::timeout(
            remaining,
            retry(&spec.query_retry, description, cancel, &mut predicate),
        )
        .await;

        match observation {
            Err(_) => return Err(timed_out(last_reason)),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(Readiness::Ready)) => {
                info!(iteration = iteration, "{} is ready", description);
                return Ok(());
            }
            Ok(Ok(Readiness::NotReady(reason))) => {
                debug!(iteration = iteration, reason = %reason, "Waiting for {}", description);
                last_reason = reason;
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timed_out(last_reason));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled(description)),
            _ = tokio::time::sleep(interval.min(remaining)) => {}
        }

        interval = spec.next_interval(interval);
    }
}

/// Count-based readiness: ready once at least `wanted` items satisfy `is_ready`.
///
/// Fewer matching items than wanted, including an empty list returned before
/// the control plane has created anything, is `NotReady`.
pub fn count_readiness<T>(
    items: &[T],
    wanted: usize,
    is_ready: impl Fn(&T) -> bool,
    noun: &str,
) -> Readiness {
    let ready = items.iter().filter(|item| is_ready(item)).count();
    if ready >= wanted {
        Readiness::Ready
    } else {
        Readiness::not_ready(format!(
            "expected {} {}, but found {} (of {} observed)",
            wanted,
            noun,
            ready,
            items.len()
        ))
    }
}

/// Phase-based readiness.
///
/// `expected` is ready, a phase in `fatal` aborts with [`Error::InvalidState`],
/// and anything else (including an absent phase) is not ready.
pub fn phase_readiness(
    resource: &str,
    observed: Option<&str>,
    expected: &str,
    fatal: &[&str],
) -> Result<Readiness> {
    match observed {
        Some(phase) if phase == expected => Ok(Readiness::Ready),
        Some(phase) if fatal.contains(&phase) => Err(Error::invalid_state(resource, phase)),
        Some(phase) => Ok(Readiness::not_ready(format!(
            "{} is {}, waiting for {}",
            resource, phase, expected
        ))),
        None => Ok(Readiness::not_ready(format!(
            "{} has no phase yet, waiting for {}",
            resource, expected
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn spec(timeout: Duration, interval: Duration) -> PollSpec {
        PollSpec::new(timeout)
            .fixed_interval(interval)
            .query_retry(
                RetryPolicy::with_max_attempts(3)
                    .constant(Duration::from_millis(10))
                    .without_jitter(),
            )
    }

    struct Machine {
        phase: &'static str,
    }

    fn running(m: &Machine) -> bool {
        m.phase == "Running"
    }

    // ==========================================================================
    // Story: Count-based readiness only counts the terminal success phase
    // ==========================================================================

    #[test]
    fn when_one_machine_is_still_provisioning_two_wanted_is_not_ready() {
        let machines = [
            Machine { phase: "Running" },
            Machine {
                phase: "Provisioning",
            },
        ];
        let readiness = count_readiness(&machines, 2, running, "running machines");
        assert!(!readiness.is_ready());
        assert!(readiness.to_string().contains("found 1"));
    }

    #[test]
    fn when_both_machines_are_running_two_wanted_is_ready() {
        let machines = [Machine { phase: "Running" }, Machine { phase: "Running" }];
        assert_eq!(
            count_readiness(&machines, 2, running, "running machines"),
            Readiness::Ready
        );
    }

    #[test]
    fn when_failed_machines_exist_they_are_not_counted() {
        let machines = [Machine { phase: "Failed" }, Machine { phase: "Running" }];
        assert!(!count_readiness(&machines, 2, running, "running machines").is_ready());
    }

    #[test]
    fn when_nothing_is_listed_yet_it_is_not_ready_rather_than_an_error() {
        let machines: [Machine; 0] = [];
        assert!(!count_readiness(&machines, 1, running, "running machines").is_ready());
    }

    #[tokio::test]
    async fn count_based_wait_succeeds_on_the_first_fully_running_observation() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        poll_until_ready(
            &spec(Duration::from_secs(5), Duration::from_millis(1)),
            "machines",
            &cancel,
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    let machines = [Machine { phase: "Running" }, Machine { phase: "Running" }];
                    Ok(count_readiness(&machines, 2, running, "running machines"))
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // ==========================================================================
    // Story: Phase readiness
    // ==========================================================================

    #[test]
    fn when_phase_is_absent_or_unknown_it_is_not_ready() {
        assert!(!phase_readiness("vm", None, "Succeeded", &["Failed"])
            .unwrap()
            .is_ready());
        assert!(!phase_readiness("vm", Some("Migrating"), "Succeeded", &["Failed"])
            .unwrap()
            .is_ready());
    }

    #[test]
    fn when_phase_is_fatal_it_is_an_invalid_state_error() {
        let err = phase_readiness("VM k8s-bootstrap", Some("Failed"), "Succeeded", &["Failed"])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(err.to_string().contains("k8s-bootstrap"));
    }

    #[test]
    fn when_phase_matches_it_is_ready() {
        assert_eq!(
            phase_readiness("pod", Some("Succeeded"), "Succeeded", &[]).unwrap(),
            Readiness::Ready
        );
    }

    // ==========================================================================
    // Story: Undercount is "not ready", not an error
    // ==========================================================================

    #[tokio::test]
    async fn when_undercount_for_k_iterations_poll_succeeds_on_iteration_k_plus_one() {
        let cancel = CancellationToken::new();
        let k = 4u32;
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = poll_until_ready(
            &spec(Duration::from_secs(30), Duration::from_millis(1)),
            "windows agents",
            &cancel,
            || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    let ready = if n <= k { 1 } else { 2 };
                    let machines: Vec<Machine> = (0..ready)
                        .map(|_| Machine { phase: "Running" })
                        .collect();
                    Ok(count_readiness(&machines, 2, running, "running machines"))
                }
            },
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), k + 1);
    }

    // ==========================================================================
    // Story: Timeout is honoured, not early and not late
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn when_never_ready_poll_times_out_after_the_budget() {
        let cancel = CancellationToken::new();
        let timeout = Duration::from_secs(60);
        let interval = Duration::from_secs(7);
        let start = Instant::now();

        let result = poll_until_ready(&spec(timeout, interval), "cni", &cancel, || async {
            Ok(Readiness::not_ready("flannel not running"))
        })
        .await;

        let elapsed = start.elapsed();
        assert!(elapsed >= timeout, "timed out early: {:?}", elapsed);
        assert!(elapsed <= timeout + interval, "timed out late: {:?}", elapsed);
        match result {
            Err(Error::PollTimeout { last_reason, .. }) => {
                assert_eq!(last_reason, "flannel not running")
            }
            other => panic!("expected PollTimeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exponential_intervals_are_capped() {
        let cancel = CancellationToken::new();
        let spec = PollSpec::new(Duration::from_secs(100))
            .max_interval(Duration::from_secs(10))
            .query_retry(RetryPolicy::with_max_attempts(1));
        let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));
        let s = stamps.clone();
        let start = Instant::now();

        let _ = poll_until_ready(&spec, "x", &cancel, || {
            let s = s.clone();
            async move {
                s.lock().unwrap().push(start.elapsed());
                Ok(Readiness::not_ready("no"))
            }
        })
        .await;

        let stamps = stamps.lock().unwrap();
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] <= Duration::from_secs(10));
        }
        // 1, 2, 4, 8, then capped at 10
        assert_eq!(stamps[1] - stamps[0], Duration::from_secs(1));
        assert_eq!(stamps[5] - stamps[4], Duration::from_secs(10));
    }

    // ==========================================================================
    // Story: Query failures are retried, then surface
    // ==========================================================================

    #[tokio::test]
    async fn when_query_fails_transiently_poll_keeps_going() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = poll_until_ready(
            &spec(Duration::from_secs(10), Duration::from_millis(1)),
            "pods",
            &cancel,
            || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::control_plane("list_pods", "connection reset"))
                    } else {
                        Ok(Readiness::Ready)
                    }
                }
            },
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn when_query_keeps_failing_the_error_surfaces_not_a_timeout() {
        let cancel = CancellationToken::new();

        let result = poll_until_ready(
            &spec(Duration::from_secs(10), Duration::from_millis(1)),
            "pods",
            &cancel,
            || async { Err::<Readiness, _>(Error::control_plane("list_pods", "forbidden")) },
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(err.kind(), ErrorKind::ControlPlane);
    }

    #[tokio::test]
    async fn when_cancelled_poll_stops_with_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = poll_until_ready(
            &spec(Duration::from_secs(10), Duration::from_millis(1)),
            "pods",
            &cancel,
            || async { Ok(Readiness::not_ready("pending")) },
        )
        .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn all_combines_reasons() {
        let r = Readiness::all([
            Readiness::Ready,
            Readiness::not_ready("node a"),
            Readiness::not_ready("node b"),
        ]);
        assert_eq!(r, Readiness::not_ready("node a; node b"));
        assert!(Readiness::all(Vec::new()).is_ready());
    }
}
