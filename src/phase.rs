//! Phase orchestration: N parallel transfers folded into one aggregate.

use std::future::Future;
use std::time::Duration;

use futures::future::try_join_all;
use log::debug;
use tokio_util::sync::CancellationToken;

use crate::errors::MeasureError;
use crate::stats;
use crate::transfer::TransferResult;

/// Totals for one finished phase.
///
/// The phase duration is the slowest task's elapsed time: the parallel
/// streams share the access link, so the transfer is over when the last
/// stream finishes. This underestimates achievable throughput when
/// tasks finish staggered; the formula is kept for compatibility with
/// the reference measurement.
#[derive(Debug, Clone, Copy)]
pub struct PhaseAggregate {
    pub total_bytes: u64,
    pub max_elapsed_ms: f64,
    pub mbps: f64,
}

/// Run `count` transfers concurrently and fold their results.
///
/// All task futures are created before any is awaited; each runs under
/// its own timeout and its own child cancellation token, and invokes
/// `step` exactly once when it completes, success or failure. The join
/// is eager-cancel-on-first-failure: the first error resolves it,
/// drops the in-flight siblings and fails the phase. Results of
/// already-completed siblings are discarded, never averaged into a
/// partial success.
pub async fn run<F, Fut, S>(
    count: u32,
    timeout: Duration,
    cancel: &CancellationToken,
    step: S,
    task: F,
) -> Result<PhaseAggregate, MeasureError>
where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = Result<TransferResult, MeasureError>>,
    S: Fn(),
{
    let step = &step;
    let tasks: Vec<_> = (0..count)
        .map(|index| {
            let fut = task(cancel.child_token());
            async move {
                let result = match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(MeasureError::timeout(format!(
                        "transfer {} exceeded {} ms",
                        index,
                        timeout.as_millis()
                    ))),
                };
                step();
                result
            }
        })
        .collect();

    let results = try_join_all(tasks).await?;

    let total_bytes = results.iter().map(|r| r.bytes).sum();
    let max_elapsed_ms =
        results.iter().map(|r| r.elapsed_ms).fold(0.0, f64::max);
    let mbps = stats::throughput_mbps(total_bytes, max_elapsed_ms);

    debug!(
        "phase complete: {} bytes in {:.1} ms ({:.2} Mbps)",
        total_bytes, max_elapsed_ms, mbps
    );

    Ok(PhaseAggregate { total_bytes, max_elapsed_ms, mbps })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_aggregates_totals_and_slowest_duration() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let aggregate = run(
            2,
            Duration::from_secs(1),
            &cancel,
            || {},
            |_token| {
                let index = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok(if index == 0 {
                        TransferResult { bytes: 1_000_000, elapsed_ms: 100.0 }
                    } else {
                        TransferResult { bytes: 500_000, elapsed_ms: 250.0 }
                    })
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(aggregate.total_bytes, 1_500_000);
        assert_eq!(aggregate.max_elapsed_ms, 250.0);
        let expected = stats::throughput_mbps(1_500_000, 250.0);
        assert!((aggregate.mbps - expected).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_each_task_steps_once_on_success() {
        let cancel = CancellationToken::new();
        let steps = AtomicU32::new(0);

        run(
            4,
            Duration::from_secs(1),
            &cancel,
            || {
                steps.fetch_add(1, Ordering::SeqCst);
            },
            |_token| async {
                Ok(TransferResult { bytes: 1, elapsed_ms: 1.0 })
            },
        )
        .await
        .unwrap();

        assert_eq!(steps.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_first_failure_fails_phase_and_drops_siblings() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let steps = AtomicU32::new(0);

        let err = run(
            4,
            Duration::from_secs(5),
            &cancel,
            || {
                steps.fetch_add(1, Ordering::SeqCst);
            },
            |_token| {
                let index = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if index == 1 {
                        Err(MeasureError::timeout("transfer 1 gave up"))
                    } else {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(TransferResult { bytes: 1, elapsed_ms: 1.0 })
                    }
                }
            },
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Timeout);
        // Only the failed task completed; the dropped siblings never
        // stepped.
        assert_eq!(steps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_per_task_timeout_maps_to_timeout_error() {
        let cancel = CancellationToken::new();

        let err = run(
            1,
            Duration::from_millis(20),
            &cancel,
            || {},
            |_token| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(TransferResult { bytes: 1, elapsed_ms: 1.0 })
            },
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_zero_duration_aggregate_is_not_finite() {
        let cancel = CancellationToken::new();

        let aggregate = run(
            1,
            Duration::from_secs(1),
            &cancel,
            || {},
            |_token| async {
                Ok(TransferResult { bytes: 10, elapsed_ms: 0.0 })
            },
        )
        .await
        .unwrap();

        // The session records this as unmeasured instead of displaying
        // infinity.
        assert!(!aggregate.mbps.is_finite());
    }
}
