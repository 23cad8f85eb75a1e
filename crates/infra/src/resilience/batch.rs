//! Batch processing with per-unit retry and a resweep of failed units.

use core::fmt::{Debug, Display};
use std::future::Future;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use super::retry::{self, RetriesExhausted, RetrySettings};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Retry budget applied to every unit, in every sweep.
    pub unit_retry: RetrySettings,
    /// Extra passes over units that failed the previous pass.
    pub resweeps: u32,
    /// Units in flight at once (1 = sequential).
    pub concurrency: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            unit_retry: RetrySettings::default(),
            resweeps: 1,
            concurrency: 1,
        }
    }
}

/// Units that still failed after the last sweep.
#[derive(Debug, Error)]
#[error("{} unit(s) still failing after {sweeps} sweep(s): {failed_units:?}", .failed_units.len())]
pub struct BatchFailure<U, E> {
    /// Failing unit ids, in input order.
    pub failed_units: Vec<U>,
    /// Last failure per unit, aligned with `failed_units`.
    pub errors: Vec<RetriesExhausted<E>>,
    pub sweeps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport<U> {
    /// Units that succeeded, in completion order across sweeps.
    pub succeeded: Vec<U>,
    /// Subset of `succeeded` that needed a resweep.
    pub recovered: Vec<U>,
    pub sweeps: u32,
}

/// Runs a unit operation over a collection of units.
///
/// Each unit is retried on its own budget; a unit exhausting its retries does
/// not stop the others. Units still failing are collected and swept again
/// (`resweeps` times). Whatever fails the last sweep becomes a [`BatchFailure`].
///
/// Successful units are final: the unit operation is expected to persist its
/// own result, so a later failure of another unit never rolls it back.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchProcessor {
    settings: BatchSettings,
}

impl BatchProcessor {
    pub fn new(settings: BatchSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    pub async fn run<U, T, E, Op, Fut>(
        &self,
        units: Vec<U>,
        operation: Op,
    ) -> Result<BatchReport<U>, BatchFailure<U, E>>
    where
        U: Clone + Debug,
        E: Display,
        Op: Fn(U) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let total = units.len();
        let mut succeeded = Vec::with_capacity(total);
        let mut recovered = Vec::new();

        let (ok, mut failed) = self.sweep(units, &operation, 0).await;
        succeeded.extend(ok);

        let mut sweeps = 1;
        while !failed.is_empty() && sweeps <= self.settings.resweeps {
            warn!(
                sweep = sweeps,
                failed = failed.len(),
                "resweeping failed units"
            );
            let retry_units: Vec<U> = failed.into_iter().map(|(unit, _)| unit).collect();
            let (ok, still_failed) = self.sweep(retry_units, &operation, sweeps).await;
            recovered.extend(ok.iter().cloned());
            succeeded.extend(ok);
            failed = still_failed;
            sweeps += 1;
        }

        if failed.is_empty() {
            info!(
                units = total,
                recovered = recovered.len(),
                sweeps,
                "batch completed"
            );
            return Ok(BatchReport {
                succeeded,
                recovered,
                sweeps,
            });
        }

        error!(
            units = total,
            failed = failed.len(),
            sweeps,
            "batch finished with failed units"
        );
        let (failed_units, errors) = failed.into_iter().unzip();
        Err(BatchFailure {
            failed_units,
            errors,
            sweeps,
        })
    }

    async fn sweep<U, T, E, Op, Fut>(
        &self,
        units: Vec<U>,
        operation: &Op,
        sweep: u32,
    ) -> (Vec<U>, Vec<(U, RetriesExhausted<E>)>)
    where
        U: Clone + Debug,
        E: Display,
        Op: Fn(U) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let unit_retry = self.settings.unit_retry;
        let concurrency = self.settings.concurrency.max(1);

        let results: Vec<(U, Result<T, RetriesExhausted<E>>)> = stream::iter(units)
            .map(|unit| async move {
                let result = retry::execute(
                    unit_retry,
                    |attempt, delay, error: &E| {
                        warn!(
                            unit = ?unit,
                            sweep,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "unit failed; retrying"
                        );
                    },
                    || operation(unit.clone()),
                )
                .await;
                (unit, result)
            })
            .buffered(concurrency)
            .collect()
            .await;

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (unit, result) in results {
            match result {
                Ok(_) => succeeded.push(unit),
                Err(exhausted) => {
                    warn!(
                        unit = ?unit,
                        sweep,
                        attempts = exhausted.attempts,
                        error = %exhausted.last_error,
                        "unit exhausted its retries"
                    );
                    failed.push((unit, exhausted));
                }
            }
        }
        (succeeded, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    fn fast(max_retries: u32, resweeps: u32, concurrency: usize) -> BatchSettings {
        BatchSettings {
            unit_retry: RetrySettings::new(max_retries, Duration::from_millis(10), 2.0),
            resweeps,
            concurrency,
        }
    }

    /// Fails each unit a scripted number of times, then succeeds.
    struct Script {
        remaining_failures: Mutex<HashMap<u32, u32>>,
        calls: Mutex<Vec<u32>>,
    }

    impl Script {
        fn new(failures: &[(u32, u32)]) -> Self {
            Self {
                remaining_failures: Mutex::new(failures.iter().copied().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        async fn call(&self, unit: u32) -> Result<u32, String> {
            self.calls.lock().unwrap().push(unit);
            let mut remaining = self.remaining_failures.lock().unwrap();
            match remaining.get_mut(&unit) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    Err(format!("unit {unit} failed"))
                }
                _ => Ok(unit),
            }
        }

        fn calls_for(&self, unit: u32) -> usize {
            self.calls.lock().unwrap().iter().filter(|u| **u == unit).count()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn all_units_succeed_in_one_sweep() {
        let script = Script::new(&[]);
        let processor = BatchProcessor::new(fast(2, 1, 1));

        let report = processor.run(vec![2, 3, 4], |u| script.call(u)).await.unwrap();

        assert_eq!(report.succeeded, vec![2, 3, 4]);
        assert!(report.recovered.is_empty());
        assert_eq!(report.sweeps, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unit_failing_past_its_budget_is_recovered_by_the_resweep() {
        // Budget is 2 retries (3 calls); unit 3 fails 4 times, so sweep one
        // exhausts it and sweep two succeeds on its second call.
        let script = Script::new(&[(3, 4)]);
        let processor = BatchProcessor::new(fast(2, 1, 1));

        let report = processor.run(vec![2, 3, 4], |u| script.call(u)).await.unwrap();

        assert_eq!(report.recovered, vec![3]);
        assert_eq!(report.sweeps, 2);
        assert_eq!(script.calls_for(2), 1);
        assert_eq!(script.calls_for(3), 5);
        assert_eq!(script.calls_for(4), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanently_failing_unit_surfaces_in_batch_failure() {
        let script = Script::new(&[(5, u32::MAX)]);
        let processor = BatchProcessor::new(fast(1, 1, 1));

        let failure = processor
            .run(vec![2, 3, 4, 5, 6], |u| script.call(u))
            .await
            .unwrap_err();

        assert_eq!(failure.failed_units, vec![5]);
        assert_eq!(failure.errors.len(), 1);
        assert_eq!(failure.sweeps, 2);
        // Other units were processed exactly once and stay done.
        for unit in [2, 3, 4, 6] {
            assert_eq!(script.calls_for(unit), 1);
        }
        assert_eq!(script.calls_for(5), 4);
        assert_eq!(failure.to_string(), "1 unit(s) still failing after 2 sweep(s): [5]");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_resweeps_fail_on_the_first_sweep() {
        let script = Script::new(&[(1, 2)]);
        let processor = BatchProcessor::new(fast(1, 0, 1));

        let failure = processor.run(vec![1], |u| script.call(u)).await.unwrap_err();

        assert_eq!(failure.failed_units, vec![1]);
        assert_eq!(failure.sweeps, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_sweeps_preserve_input_order_in_the_failure() {
        let script = Script::new(&[(7, u32::MAX), (3, u32::MAX)]);
        let processor = BatchProcessor::new(fast(0, 1, 4));

        let failure = processor
            .run((1..=8).collect(), |u| script.call(u))
            .await
            .unwrap_err();

        assert_eq!(failure.failed_units, vec![3, 7]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_batch_is_a_no_op() {
        let processor = BatchProcessor::default();
        let report = processor
            .run(Vec::<u32>::new(), |u| async move { Ok::<_, String>(u) })
            .await
            .unwrap();

        assert!(report.succeeded.is_empty());
        assert_eq!(report.sweeps, 1);
    }
}
