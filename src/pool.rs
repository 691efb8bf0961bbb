//! Bounded worker pool with index-addressed result slots.
//!
//! Used by both the map and reduce stages. Jobs are dispatched in index
//! order with at most `workers` in flight; each result is written into the
//! slot of its job index exactly once, so output order matches input order
//! whatever order the jobs finish in.
//!
//! Once the cancellation token fires no further job is dispatched and the
//! in-flight tasks are aborted. Their slots stay `None`; nothing that
//! finishes after cancellation is observed can reach the caller.

use std::future::Future;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `work` over `jobs`, calling `on_complete` in completion order.
    ///
    /// Returns one slot per job. A slot is `None` only when its job never
    /// ran or was abandoned because of cancellation, or panicked.
    pub async fn run<J, T, F, Fut, C>(
        &self,
        jobs: Vec<J>,
        cancel: &CancellationToken,
        work: F,
        mut on_complete: C,
    ) -> Vec<Option<T>>
    where
        J: Send + 'static,
        T: Send + 'static,
        F: Fn(usize, J) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        C: FnMut(usize, &T),
    {
        let total = jobs.len();
        let mut slots: Vec<Option<T>> = (0..total).map(|_| None).collect();
        let mut pending = jobs.into_iter().enumerate();
        let mut in_flight: JoinSet<(usize, T)> = JoinSet::new();

        loop {
            while in_flight.len() < self.workers && !cancel.is_cancelled() {
                let Some((index, job)) = pending.next() else {
                    break;
                };
                let fut = work(index, job);
                in_flight.spawn(async move { (index, fut.await) });
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    in_flight.shutdown().await;
                    break;
                }
                joined = in_flight.join_next() => {
                    match joined {
                        Some(Ok((index, result))) => {
                            // Cancellation may have fired while this task finished.
                            if cancel.is_cancelled() {
                                in_flight.shutdown().await;
                                break;
                            }
                            on_complete(index, &result);
                            slots[index] = Some(result);
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "worker task failed");
                        }
                        None => break,
                    }
                }
            }
        }

        slots
    }
}
