//! Map stage: one summary per chunk.
//!
//! Chunks are summarised concurrently on the worker pool. A chunk whose call
//! fails after retries becomes a failed [`ChunkSummary`] carrying placeholder
//! text, and the stage carries on. The stage itself fails only when every
//! chunk failed, or when the service rejects the run outright (bad
//! credentials), in which case the remaining calls are cancelled.

use tokio_util::sync::CancellationToken;

use crate::completion::CompletionClient;
use crate::error::{CompletionError, PipelineError};
use crate::models::{Chunk, ChunkSummary, Stage};
use crate::pool::WorkerPool;
use crate::progress::ProgressEmitter;
use crate::prompts::{self, PromptContext};

/// Result of the map stage.
#[derive(Debug)]
pub struct MapOutcome {
    /// Index-aligned with the input chunks, one entry each, unless the run
    /// was cancelled; then only the chunks that completed, in index order.
    pub summaries: Vec<ChunkSummary>,
    pub failed: usize,
    pub cancelled: bool,
}

impl MapOutcome {
    pub fn succeeded(&self) -> usize {
        self.summaries.len() - self.failed
    }
}

pub struct MapStage {
    client: CompletionClient,
    pool: WorkerPool,
    max_output_tokens: u32,
}

impl MapStage {
    pub fn new(client: CompletionClient, pool: WorkerPool, max_output_tokens: u32) -> Self {
        Self {
            client,
            pool,
            max_output_tokens,
        }
    }

    pub async fn map(
        &self,
        ctx: &PromptContext,
        chunks: &[Chunk],
        progress: &ProgressEmitter<'_>,
        cancel: &CancellationToken,
    ) -> Result<MapOutcome, PipelineError> {
        let total = chunks.len();
        tracing::info!(chunks = total, workers = self.pool.workers(), "map stage starting");
        progress.emit(
            Stage::Mapping,
            0,
            total,
            Some(format!(
                "analysing {} chunk(s) with {} worker(s)",
                total,
                self.pool.workers()
            )),
        );

        let requests: Vec<_> = chunks
            .iter()
            .map(|chunk| prompts::map_request(ctx, chunk, total, self.max_output_tokens))
            .collect();

        // Child token: a run-fatal error stops this stage without touching
        // the caller's token.
        let stage_cancel = cancel.child_token();
        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut last_error = String::new();
        let mut fatal: Option<CompletionError> = None;

        let slots = self
            .pool
            .run(
                requests,
                &stage_cancel,
                |_, request| {
                    let client = self.client.clone();
                    let token = stage_cancel.clone();
                    async move { client.complete(&request, &token).await }
                },
                |index, result| {
                    // Calls aborted by the caller's token are not failures.
                    if matches!(result, Err(CompletionError::Cancelled)) && cancel.is_cancelled() {
                        return;
                    }
                    completed += 1;
                    let message = match result {
                        Ok(_) => format!("chunk {}/{} done", index + 1, total),
                        Err(e) => {
                            failed += 1;
                            last_error = e.to_string();
                            tracing::warn!(chunk = index + 1, total, error = %e, "map call failed");
                            if e.is_run_fatal() && fatal.is_none() {
                                fatal = Some(e.clone());
                                stage_cancel.cancel();
                            }
                            format!("chunk {}/{} failed, continuing: {}", index + 1, total, e)
                        }
                    };
                    progress.emit(Stage::Mapping, completed, total, Some(message));
                },
            )
            .await;

        if let Some(e) = fatal {
            return Err(PipelineError::Fatal(e));
        }

        let cancelled = cancel.is_cancelled();
        let mut summaries = Vec::with_capacity(total);
        for (index, slot) in slots.into_iter().enumerate() {
            match slot {
                Some(Ok(text)) => summaries.push(ChunkSummary::ok(index, text)),
                Some(Err(CompletionError::Cancelled)) | None if cancelled => {}
                Some(Err(e)) => summaries.push(ChunkSummary::failed(index, e.to_string())),
                None => {
                    // Only a panicked worker leaves a slot empty without cancellation.
                    failed += 1;
                    last_error = "worker task failed".to_string();
                    summaries.push(ChunkSummary::failed(index, "worker task failed"));
                }
            }
        }

        if !cancelled && total > 0 && failed == total {
            return Err(PipelineError::TotalFailure {
                stage: Stage::Mapping,
                failed,
                last_error,
            });
        }

        tracing::info!(
            completed = summaries.len(),
            failed,
            cancelled,
            "map stage finished"
        );
        Ok(MapOutcome {
            summaries,
            failed,
            cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::testing::{client, ScriptedService};
    use crate::models::SourceFile;
    use crate::progress::RecordingProgress;
    use std::time::Duration;

    fn ctx() -> PromptContext {
        PromptContext {
            repository: "demo".into(),
            listing: String::new(),
        }
    }

    fn chunks(n: usize) -> Vec<Chunk> {
        (0..n)
            .map(|i| Chunk {
                index: i,
                files: vec![SourceFile::new(format!("f{i}.rs"), format!("// file {i}"))],
                tokens: 4,
                truncated: false,
            })
            .collect()
    }

    /// Chunk number (1-based) a map request refers to.
    fn chunk_no(req: &crate::completion::CompletionRequest) -> usize {
        let user = &req.messages[1].content;
        let start = user.find("This is chunk ").unwrap() + "This is chunk ".len();
        user[start..].split(' ').next().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn summaries_align_with_chunks_under_shuffled_latency() {
        let svc = ScriptedService::new(|_, req| {
            let n = chunk_no(req);
            let delay = Duration::from_millis(((n * 37) % 11) as u64 * 3);
            (delay, Ok(format!("summary {n}")))
        });
        let stage = MapStage::new(client(svc, 0), WorkerPool::new(4), 128);
        let sink = RecordingProgress::new();
        let emitter = ProgressEmitter::new(&sink);

        let out = stage
            .map(&ctx(), &chunks(12), &emitter, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.summaries.len(), 12);
        for (i, s) in out.summaries.iter().enumerate() {
            assert_eq!(s.index, i);
            assert_eq!(s.text, format!("summary {}", i + 1));
        }
        let completed: Vec<usize> = sink.events().iter().map(|e| e.completed).collect();
        assert!(completed.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*completed.last().unwrap(), 12);
    }

    #[tokio::test]
    async fn partial_failure_is_recorded_and_stage_continues() {
        let svc = ScriptedService::new(|_, req| match chunk_no(req) {
            2 | 4 => (
                Duration::ZERO,
                Err(CompletionError::Service {
                    status: 500,
                    message: "boom".into(),
                    retryable: true,
                }),
            ),
            n => (Duration::ZERO, Ok(format!("summary {n}"))),
        });
        let stage = MapStage::new(client(svc, 1), WorkerPool::new(2), 128);
        let sink = RecordingProgress::new();
        let emitter = ProgressEmitter::new(&sink);

        let out = stage
            .map(&ctx(), &chunks(5), &emitter, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.failed, 2);
        assert_eq!(out.succeeded(), 3);
        assert!(out.summaries[1].failed && out.summaries[3].failed);
        assert!(out.summaries[1].text.contains("unavailable"));
        let failures = sink
            .events()
            .iter()
            .filter(|e| e.message.as_deref().is_some_and(|m| m.contains("failed, continuing")))
            .count();
        assert_eq!(failures, 2);
    }

    #[tokio::test]
    async fn every_chunk_failing_is_total_failure() {
        let svc = ScriptedService::new(|_, _| {
            (Duration::ZERO, Err(CompletionError::RateLimited("429".into())))
        });
        let stage = MapStage::new(client(svc, 0), WorkerPool::new(3), 128);
        let sink = RecordingProgress::new();

        let err = stage
            .map(&ctx(), &chunks(3), &ProgressEmitter::new(&sink), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::TotalFailure {
                stage: Stage::Mapping,
                failed: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn authentication_failure_aborts_the_stage() {
        let svc = ScriptedService::new(|n, _| {
            if n == 0 {
                (Duration::ZERO, Err(CompletionError::Authentication("401".into())))
            } else {
                (Duration::from_secs(30), Ok("late".into()))
            }
        });
        let stage = MapStage::new(client(svc.clone(), 3), WorkerPool::new(1), 128);
        let sink = RecordingProgress::new();
        let cancel = CancellationToken::new();

        let err = stage
            .map(&ctx(), &chunks(6), &ProgressEmitter::new(&sink), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Fatal(CompletionError::Authentication(_))));
        assert_eq!(svc.calls(), 1);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn cancellation_drops_unfinished_chunks_without_failing_them() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let svc = ScriptedService::new(move |n, _| {
            if n == 1 {
                trigger.cancel();
                (Duration::from_secs(30), Ok("late".into()))
            } else {
                (Duration::ZERO, Ok(format!("summary {n}")))
            }
        });
        let stage = MapStage::new(client(svc, 0), WorkerPool::new(1), 128);

        let out = stage
            .map(&ctx(), &chunks(4), &ProgressEmitter::new(&RecordingProgress::new()), &cancel)
            .await
            .unwrap();

        assert!(out.cancelled);
        assert_eq!(out.failed, 0);
        assert_eq!(out.summaries.len(), 1);
        assert_eq!(out.summaries[0].text, "summary 0");
    }

    #[tokio::test]
    async fn service_reported_cancellation_counts_as_failure() {
        let svc = ScriptedService::new(|_, req| match chunk_no(req) {
            2 => (Duration::ZERO, Err(CompletionError::Cancelled)),
            n => (Duration::ZERO, Ok(format!("summary {n}"))),
        });
        let stage = MapStage::new(client(svc, 0), WorkerPool::new(2), 128);

        let out = stage
            .map(
                &ctx(),
                &chunks(3),
                &ProgressEmitter::new(&RecordingProgress::new()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!out.cancelled);
        assert_eq!(out.failed, 1);
        assert_eq!(out.summaries.len(), 3);
        assert!(out.summaries[1].failed);
    }
}
