//! Workload readiness polling.
//!
//! A [`WorkloadSource`] produces one coherent snapshot of workload health per
//! tick; [`wait_until_ready`] drives it on a fixed cadence until every
//! observed workload is healthy, the deadline passes, or something fails
//! terminally. Ticks are strictly sequential; a snapshot is never fetched
//! while another fetch is in flight.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::errors::{KubenestError, KubenestResult};

/// Cadence of the aggregate all-workloads wait.
pub const WORKLOAD_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Cadence of the pod-level wait.
pub const POD_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Health of one workload at one polling tick.
///
/// `failed` marks a terminal state (a workload that will never become
/// healthy on its own); it implies `!healthy`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadObservation {
    pub namespace: String,
    pub name: String,
    pub healthy: bool,
    pub failed: bool,
    pub message: String,
}

impl WorkloadObservation {
    pub fn new(namespace: &str, name: &str, healthy: bool, message: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            healthy,
            failed: false,
            message: message.to_string(),
        }
    }

    /// Sort/display key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    fn ok_marker(&self) -> &'static str {
        if self.healthy { "🟩" } else { "🟥" }
    }

    /// One-line rendering for incremental status output.
    pub fn long_line(&self) -> String {
        format!(
            "{} {:<20} {:<54} {}",
            self.ok_marker(),
            self.namespace,
            self.name,
            self.message
        )
    }
}

/// Produces a fresh snapshot of workload health.
#[async_trait]
pub trait WorkloadSource: Send + Sync {
    async fn observe(&self) -> KubenestResult<Vec<WorkloadObservation>>;
}

/// Split a sorted snapshot into ready and unready workloads.
pub fn partition(
    observations: &[WorkloadObservation],
) -> (Vec<WorkloadObservation>, Vec<WorkloadObservation>) {
    let (ready, unready): (Vec<_>, Vec<_>) =
        observations.iter().cloned().partition(|o| o.healthy);
    (ready, unready)
}

/// Progress callback, invoked once per tick with deterministically sorted
/// ready/unready partitions.
pub type ProgressFn<'a> =
    dyn FnMut(bool, usize, &[WorkloadObservation], &[WorkloadObservation]) + Send + 'a;

/// Poll `source` until all observed workloads are healthy.
///
/// Readiness requires a non-empty snapshot with no unhealthy workload; an
/// empty snapshot is never ready (right after cluster start no workload
/// exists yet, which must not read as converged). A terminal-failed
/// observation aborts immediately, as does a fetch error — both take
/// priority over the deadline. `timeout` of zero returns at once without
/// fetching; interpreting zero as "don't block" is the caller's contract.
pub async fn wait_until_ready(
    source: &dyn WorkloadSource,
    interval: Duration,
    timeout: Duration,
    on_progress: &mut ProgressFn<'_>,
) -> KubenestResult<()> {
    if timeout.is_zero() {
        return Ok(());
    }
    let deadline = Instant::now() + timeout;

    loop {
        let mut observations = source.observe().await?;
        observations.sort_by_key(|o| o.key());

        let failed: Vec<&WorkloadObservation> =
            observations.iter().filter(|o| o.failed).collect();
        if !failed.is_empty() {
            let detail = failed
                .iter()
                .map(|o| o.key())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(KubenestError::WorkloadFailed {
                failed: failed.len(),
                detail,
            });
        }

        let (ready, unready) = partition(&observations);
        let all_ready = !observations.is_empty() && unready.is_empty();
        on_progress(all_ready, observations.len(), &ready, &unready);

        if all_ready {
            return Ok(());
        }
        if Instant::now() + interval > deadline {
            return Err(KubenestError::Timeout {
                what: "workloads to settle".into(),
                seconds: timeout.as_secs(),
            });
        }
        tokio::time::sleep(interval).await;
    }
}

/// Aggregate all-workloads wait (2s cadence).
pub async fn wait_for_workloads(
    source: &dyn WorkloadSource,
    timeout: Duration,
    on_progress: &mut ProgressFn<'_>,
) -> KubenestResult<()> {
    wait_until_ready(source, WORKLOAD_POLL_INTERVAL, timeout, on_progress).await
}

/// Pod-level wait (1s cadence); stopped pods abort it.
pub async fn wait_for_pods(
    source: &dyn WorkloadSource,
    timeout: Duration,
    on_progress: &mut ProgressFn<'_>,
) -> KubenestResult<()> {
    wait_until_ready(source, POD_POLL_INTERVAL, timeout, on_progress).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a scripted sequence of snapshots; the last entry repeats.
    struct ScriptedSource {
        ticks: Mutex<VecDeque<KubenestResult<Vec<WorkloadObservation>>>>,
        fetches: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(ticks: Vec<KubenestResult<Vec<WorkloadObservation>>>) -> Self {
            Self {
                ticks: Mutex::new(ticks.into()),
                fetches: AtomicUsize::new(0),
            }
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WorkloadSource for ScriptedSource {
        async fn observe(&self) -> KubenestResult<Vec<WorkloadObservation>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let mut ticks = self.ticks.lock().unwrap();
            let tick = ticks.pop_front().expect("script exhausted");
            if ticks.is_empty() {
                if let Ok(snapshot) = &tick {
                    ticks.push_back(Ok(snapshot.clone()));
                }
            }
            tick
        }
    }

    fn obs(ns: &str, name: &str, healthy: bool) -> WorkloadObservation {
        WorkloadObservation::new(ns, name, healthy, "msg")
    }

    fn failed_obs(ns: &str, name: &str) -> WorkloadObservation {
        WorkloadObservation {
            failed: true,
            ..WorkloadObservation::new(ns, name, false, "stopped")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn all_healthy_converges_in_one_tick() {
        for n in 1..4 {
            let snapshot: Vec<_> = (0..n).map(|i| obs("kube-system", &format!("w{i}"), true)).collect();
            let source = ScriptedSource::new(vec![Ok(snapshot)]);
            let mut seen = Vec::new();
            wait_for_workloads(&source, Duration::from_secs(30), &mut |ok, total, _, unready| {
                seen.push((ok, total, unready.len()));
            })
            .await
            .expect("converged");
            assert_eq!(seen, vec![(true, n, 0)]);
            assert_eq!(source.fetch_count(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_snapshot_is_never_ready() {
        let source = ScriptedSource::new(vec![Ok(vec![])]);
        let mut ticks = 0usize;
        let err = wait_for_workloads(&source, Duration::from_secs(5), &mut |ok, total, _, _| {
            assert!(!ok);
            assert_eq!(total, 0);
            ticks += 1;
        })
        .await
        .unwrap_err();
        assert!(matches!(err, KubenestError::Timeout { .. }));
        assert!(ticks > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_skips_the_fetch() {
        let source = ScriptedSource::new(vec![Ok(vec![obs("a", "x", true)])]);
        wait_for_workloads(&source, Duration::ZERO, &mut |_, _, _, _| {
            panic!("no tick expected");
        })
        .await
        .expect("immediate return");
        assert_eq!(source.fetch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn converges_on_second_tick() {
        let source = ScriptedSource::new(vec![
            Ok(vec![obs("a", "x", false)]),
            Ok(vec![obs("a", "x", true)]),
        ]);
        let mut seen = Vec::new();
        wait_for_workloads(&source, Duration::from_secs(30), &mut |ok, _, _, _| {
            seen.push(ok);
        })
        .await
        .expect("converged");
        assert_eq!(seen, vec![false, true]);
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failure_aborts_before_a_second_tick() {
        let source = ScriptedSource::new(vec![
            Ok(vec![failed_obs("a", "x")]),
            Ok(vec![obs("a", "x", true)]),
        ]);
        let err = wait_for_pods(&source, Duration::from_secs(30), &mut |_, _, _, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, KubenestError::WorkloadFailed { failed: 1, .. }));
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_error_wins_over_timeout() {
        let source = ScriptedSource::new(vec![Err(KubenestError::Kube("handle invalid".into()))]);
        let err = wait_for_workloads(&source, Duration::from_secs(1), &mut |_, _, _, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, KubenestError::Kube(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn partitions_are_sorted_deterministically() {
        let source = ScriptedSource::new(vec![Ok(vec![
            obs("zeta", "b", true),
            obs("alpha", "z", false),
            obs("alpha", "a", true),
        ])]);
        let mut keys: Vec<Vec<String>> = Vec::new();
        let _ = wait_for_workloads(&source, Duration::from_secs(2), &mut |_, _, ready, unready| {
            keys.push(
                ready
                    .iter()
                    .chain(unready.iter())
                    .map(|o| o.key())
                    .collect(),
            );
        })
        .await;
        assert_eq!(keys[0], vec!["alpha/a", "zeta/b", "alpha/z"]);
    }
}
