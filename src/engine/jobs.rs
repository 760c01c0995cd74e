use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

use super::coordinator::{EnsembleCoordinator, EnsembleError};
use crate::broker::ResultSink;
use crate::config::ConfigStore;
use crate::types::InferenceRequest;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("ensemble job queue is full")]
    QueueFull,

    #[error("ensemble job queue is closed")]
    Closed,
}

/// Outcome counters for background ensemble jobs.
#[derive(Debug, Default)]
pub struct PipelineStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    aggregated: AtomicU64,
    transport_exhausted: AtomicU64,
    insufficient_input: AtomicU64,
    strategy_errors: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub aggregated: u64,
    pub transport_exhausted: u64,
    pub insufficient_input: u64,
    pub strategy_errors: u64,
    pub published: u64,
    pub publish_failures: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            aggregated: self.aggregated.load(Ordering::Relaxed),
            transport_exhausted: self.transport_exhausted.load(Ordering::Relaxed),
            insufficient_input: self.insufficient_input.load(Ordering::Relaxed),
            strategy_errors: self.strategy_errors.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// An accepted request and its slot. The slot is released when the job
/// finishes, not when the runner dequeues it.
struct Job {
    request: InferenceRequest,
    slot: OwnedSemaphorePermit,
}

/// Submission side of the background job queue, cloned into request handlers.
///
/// `capacity` bounds queued and running jobs together, so a stalled backend
/// turns into `QueueFull` at the front door.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    slots: Arc<Semaphore>,
    capacity: usize,
    stats: Arc<PipelineStats>,
}

impl JobQueue {
    /// Hand a request to the runner without waiting for it to be processed.
    pub fn submit(&self, request: InferenceRequest) -> Result<(), SubmitError> {
        let slot = match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(slot) => slot,
            Err(TryAcquireError::NoPermits) => {
                PipelineStats::bump(&self.stats.rejected);
                warn!("Job queue full, rejecting {}", request.request_id);
                return Err(SubmitError::QueueFull);
            }
            Err(TryAcquireError::Closed) => {
                PipelineStats::bump(&self.stats.rejected);
                return Err(SubmitError::Closed);
            }
        };

        match self.tx.try_send(Job { request, slot }) {
            Ok(()) => {
                PipelineStats::bump(&self.stats.accepted);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                PipelineStats::bump(&self.stats.rejected);
                warn!("Job queue full, rejecting {}", job.request.request_id);
                Err(SubmitError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                PipelineStats::bump(&self.stats.rejected);
                Err(SubmitError::Closed)
            }
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Accepted jobs that have not finished yet, queued or running.
    pub fn pending(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }
}

struct JobContext {
    coordinator: Arc<EnsembleCoordinator>,
    config: Arc<ConfigStore>,
    sink: Option<Arc<dyn ResultSink>>,
    stats: Arc<PipelineStats>,
}

/// Receiving side: spawns one task per job and owns them until they finish,
/// so a job outlives the HTTP request that submitted it.
pub struct JobRunner {
    rx: mpsc::Receiver<Job>,
    context: Arc<JobContext>,
}

pub fn job_queue(
    capacity: usize,
    coordinator: Arc<EnsembleCoordinator>,
    config: Arc<ConfigStore>,
    sink: Option<Arc<dyn ResultSink>>,
) -> (JobQueue, JobRunner) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let stats = Arc::new(PipelineStats::default());
    let queue = JobQueue {
        tx,
        slots: Arc::new(Semaphore::new(capacity)),
        capacity,
        stats: Arc::clone(&stats),
    };
    let runner = JobRunner {
        rx,
        context: Arc::new(JobContext {
            coordinator,
            config,
            sink,
            stats,
        }),
    };
    (queue, runner)
}

impl JobRunner {
    /// Run until every `JobQueue` handle is dropped, then wait for in-flight
    /// jobs to finish.
    pub async fn run(mut self) {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                next = self.rx.recv() => match next {
                    Some(Job { request, slot }) => {
                        let span = info_span!("ensemble_job", request_id = %request.request_id);
                        let context = Arc::clone(&self.context);
                        tasks.spawn(
                            async move {
                                process(context, request).await;
                                drop(slot);
                            }
                            .instrument(span),
                        );
                    }
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Ensemble job aborted: {}", e);
                    }
                }
            }
        }

        let remaining = tasks.len();
        if remaining > 0 {
            info!("Job queue closed, waiting for {} in-flight jobs", remaining);
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Ensemble job aborted: {}", e);
            }
        }
    }
}

async fn process(context: Arc<JobContext>, request: InferenceRequest) {
    let stats = &context.stats;
    let ensemble = context.config.snapshot().await;

    let result = match context.coordinator.aggregate(&request, &ensemble).await {
        Ok(result) => result,
        Err(e @ EnsembleError::TransportExhausted { .. }) => {
            PipelineStats::bump(&stats.transport_exhausted);
            error!("No backend answered for {}: {}", request.request_id, e);
            return;
        }
        Err(e) if e.is_insufficient_input() => {
            PipelineStats::bump(&stats.insufficient_input);
            warn!("Not enough predictions for {}: {}", request.request_id, e);
            return;
        }
        Err(e) => {
            PipelineStats::bump(&stats.strategy_errors);
            error!("Aggregation failed for {}: {}", request.request_id, e);
            return;
        }
    };

    PipelineStats::bump(&stats.aggregated);
    info!("Aggregated {}", result);

    if let Some(sink) = &context.sink {
        match sink.publish(&result).await {
            Ok(()) => PipelineStats::bump(&stats.published),
            Err(e) => {
                PipelineStats::bump(&stats.publish_failures);
                error!("Failed to publish result for {}: {}", result.request_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::StrategyConfig;
    use crate::backend::{BackendClient, ForwardedHeaders, MockBackendClient, TensorShape};
    use axum::body::Bytes;
    use crate::broker::PublishError;
    use crate::config::EnsembleConfig;
    use crate::types::{AggregatedResult, BackendEndpoint, BackendFailure, BackendResult, ClassScore};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct RecordingSink {
        results: Mutex<Vec<AggregatedResult>>,
    }

    #[async_trait]
    impl ResultSink for RecordingSink {
        async fn publish(&self, result: &AggregatedResult) -> Result<(), PublishError> {
            self.results.lock().unwrap().push(result.clone());
            Ok(())
        }
    }

    /// Backend that never answers.
    struct StalledBackend;

    #[async_trait]
    impl BackendClient for StalledBackend {
        async fn infer(&self, _: &BackendEndpoint, _: Bytes, _: &ForwardedHeaders) -> BackendResult {
            std::future::pending().await
        }
    }

    fn store() -> Arc<ConfigStore> {
        let endpoints = vec![
            BackendEndpoint::new("http://a:5012/inference"),
            BackendEndpoint::new("http://b:5012/inference"),
        ];
        Arc::new(ConfigStore::new(EnsembleConfig::new(endpoints, StrategyConfig::default())).unwrap())
    }

    fn coordinator(client: MockBackendClient) -> Arc<EnsembleCoordinator> {
        Arc::new(EnsembleCoordinator::new(Arc::new(client), TensorShape::default()))
    }

    #[tokio::test]
    async fn test_accepted_job_is_aggregated_and_published() {
        let mut client = MockBackendClient::new();
        client
            .expect_infer()
            .returning(|_, _, _| BackendResult::Success(vec![ClassScore::new("cat", 0.6)]));
        let sink = Arc::new(RecordingSink::default());

        let (queue, runner) = job_queue(8, coordinator(client), store(), Some(sink.clone() as Arc<dyn ResultSink>));
        let stats = queue.stats();
        queue.submit(InferenceRequest::new("job-1", vec![0u8; 4])).unwrap();
        drop(queue);
        runner.run().await;

        let published = sink.results.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].request_id, "job-1");
        assert_eq!(published[0].prediction, vec![ClassScore::new("cat", 0.6)]);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.accepted, 1);
        assert_eq!(snapshot.aggregated, 1);
        assert_eq!(snapshot.published, 1);
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_published() {
        let mut client = MockBackendClient::new();
        client
            .expect_infer()
            .returning(|_, _, _| BackendResult::Failure(BackendFailure::Timeout));
        let sink = Arc::new(RecordingSink::default());

        let (queue, runner) = job_queue(8, coordinator(client), store(), Some(sink.clone() as Arc<dyn ResultSink>));
        let stats = queue.stats();
        queue.submit(InferenceRequest::new("job-2", vec![0u8; 4])).unwrap();
        drop(queue);
        runner.run().await;

        assert!(sink.results.lock().unwrap().is_empty());
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.transport_exhausted, 1);
        assert_eq!(snapshot.aggregated, 0);
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let (queue, runner) = job_queue(1, coordinator(MockBackendClient::new()), store(), None);

        assert_ok!(queue.submit(InferenceRequest::new("first", Vec::<u8>::new())));
        assert_eq!(queue.pending(), 1);
        let full = assert_err!(queue.submit(InferenceRequest::new("second", Vec::<u8>::new())));
        assert_eq!(full, SubmitError::QueueFull);

        drop(runner);
        let closed = assert_err!(queue.submit(InferenceRequest::new("third", Vec::<u8>::new())));
        assert_eq!(closed, SubmitError::Closed);
        assert_eq!(queue.stats().snapshot().rejected, 2);
    }

    #[tokio::test]
    async fn test_stalled_jobs_hold_their_slots() {
        let coordinator = Arc::new(EnsembleCoordinator::new(Arc::new(StalledBackend), TensorShape::default()));
        let (queue, runner) = job_queue(2, coordinator, store(), None);
        tokio::spawn(runner.run());

        assert_ok!(queue.submit(InferenceRequest::new("slow-1", vec![0u8; 4])));
        assert_ok!(queue.submit(InferenceRequest::new("slow-2", vec![0u8; 4])));
        // let the runner dequeue both and start waiting on the backend
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(queue.pending(), 2);
        for i in 0..50 {
            let err = assert_err!(queue.submit(InferenceRequest::new(format!("more-{}", i), vec![0u8; 4])));
            assert_eq!(err, SubmitError::QueueFull);
        }

        let snapshot = queue.stats().snapshot();
        assert_eq!(snapshot.accepted, 2);
        assert_eq!(snapshot.rejected, 50);
        assert_eq!(snapshot.aggregated, 0);
    }

    #[tokio::test]
    async fn test_finished_job_frees_its_slot() {
        let mut client = MockBackendClient::new();
        client
            .expect_infer()
            .returning(|_, _, _| BackendResult::Success(vec![ClassScore::new("cat", 0.6)]));
        let (queue, runner) = job_queue(1, coordinator(client), store(), None);
        tokio::spawn(runner.run());

        assert_ok!(queue.submit(InferenceRequest::new("quick-1", vec![0u8; 4])));
        while queue.stats().snapshot().aggregated < 1 {
            tokio::task::yield_now().await;
        }

        assert_eq!(queue.pending(), 0);
        assert_ok!(queue.submit(InferenceRequest::new("quick-2", vec![0u8; 4])));
    }
}
