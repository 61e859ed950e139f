//! Query submission and the background worker.
//!
//! `submit` stores the upload, marks the task pending and queues it. One
//! worker drains the queue in order and runs each job on the blocking pool:
//! hash the image, reuse or compute its embedding, search the gallery, rank,
//! persist, mark done. Anything that goes wrong, panics included, ends as an
//! error status on that task alone.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use glance_core::config::{QualityConfig, QueryConfig};
use glance_core::types::{QualityStats, RankedResult};
use glance_gallery::GallerySearcher;
use glance_storage::{HistoryRecord, RecordStore};
use glance_vision::ImageEmbedding;

use crate::cache::{content_digest, Embedding, TypedCache};
use crate::error::QueryError;
use crate::kv::KvStore;
use crate::task::{TaskState, TaskStatus, TaskTracker};

/// An uploaded query.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub image: Vec<u8>,
    pub filename: String,
    /// Requested result count; clamped to `1..=max_top_k`.
    pub top_k: Option<usize>,
}

/// Collaborators the orchestrator runs against.
#[derive(Clone)]
pub struct QueryServices {
    pub embedder: Arc<dyn ImageEmbedding>,
    pub searcher: Arc<GallerySearcher>,
    pub records: Arc<dyn RecordStore>,
    pub kv: Arc<dyn KvStore>,
}

/// Result of waiting on a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The task reached a terminal state within the wait.
    Finished(TaskState),
    /// The wait ran out; the task keeps running and can be polled by id.
    Detached(i64),
}

/// Completion signal for one submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    pub request_id: i64,
    done: oneshot::Receiver<TaskState>,
}

impl TaskHandle {
    /// Wait up to `timeout` for the task to finish. On timeout the wait is
    /// handed to a background task that logs the final state.
    pub async fn wait(mut self, timeout: Duration) -> WaitOutcome {
        let request_id = self.request_id;
        match tokio::time::timeout(timeout, &mut self.done).await {
            Ok(Ok(state)) => WaitOutcome::Finished(state),
            Ok(Err(_)) => {
                warn!(request_id, "Worker dropped task without reporting");
                WaitOutcome::Detached(request_id)
            }
            Err(_) => {
                let done = self.done;
                tokio::spawn(async move {
                    match done.await {
                        Ok(state) => debug!(request_id, state = %state, "Detached task finished"),
                        Err(_) => warn!(request_id, "Detached task lost"),
                    }
                });
                WaitOutcome::Detached(request_id)
            }
        }
    }
}

struct Job {
    request_id: i64,
    image: Vec<u8>,
    top_k: usize,
    done: oneshot::Sender<TaskState>,
}

struct Pipeline {
    services: QueryServices,
    tasks: TaskTracker,
    embeddings: TypedCache<Embedding>,
    quality: QualityConfig,
}

/// Accepts queries and processes them on a single background worker.
///
/// Must be created inside a Tokio runtime.
pub struct QueryOrchestrator {
    pipeline: Arc<Pipeline>,
    config: QueryConfig,
    queue: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<()>,
}

impl QueryOrchestrator {
    pub fn new(services: QueryServices, config: QueryConfig, quality: QualityConfig) -> Self {
        let tasks = TaskTracker::new(
            services.kv.clone(),
            &config.cache_prefix,
            Duration::from_secs(config.task_ttl_secs),
            config.max_error_chars,
        );
        let embeddings = TypedCache::new(
            services.kv.clone(),
            config.cache_prefix.clone(),
            "embed",
            Some(Duration::from_secs(config.embed_cache_ttl_secs)),
        );
        let pipeline = Arc::new(Pipeline {
            services,
            tasks,
            embeddings,
            quality,
        });

        let (queue, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(worker_loop(pipeline.clone(), rx));
        info!(
            default_top_k = config.default_top_k,
            max_top_k = config.max_top_k,
            "Query worker started"
        );

        Self {
            pipeline,
            config,
            queue,
            worker,
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Effective result count for a request.
    pub fn clamp_top_k(&self, requested: Option<usize>) -> usize {
        let max = self.config.max_top_k.max(1);
        requested
            .unwrap_or(self.config.default_top_k)
            .clamp(1, max)
    }

    /// Persist the upload, mark it pending and queue it. Returns as soon as
    /// the job is queued.
    pub fn submit(&self, request: SearchRequest) -> Result<TaskHandle, QueryError> {
        if request.image.is_empty() {
            return Err(QueryError::InvalidRequest("empty image".to_string()));
        }
        let top_k = self.clamp_top_k(request.top_k);
        let request_id = self
            .pipeline
            .services
            .records
            .create_record(&request.image, &request.filename)?;
        if let Err(e) = self.pipeline.tasks.mark_pending(request_id) {
            if let Err(cleanup) = self.pipeline.services.records.delete_record(request_id) {
                warn!(request_id, error = %cleanup, "Failed to remove unqueued record");
            }
            return Err(e);
        }

        let (tx, rx) = oneshot::channel();
        let job = Job {
            request_id,
            image: request.image,
            top_k,
            done: tx,
        };
        if self.queue.send(job).is_err() {
            self.pipeline.fail(request_id, &QueryError::WorkerStopped.to_string());
            return Err(QueryError::WorkerStopped);
        }
        debug!(request_id, top_k, filename = %request.filename, "Query queued");
        Ok(TaskHandle {
            request_id,
            done: rx,
        })
    }

    /// Submit and wait up to `sync_wait_ms` for the result.
    pub async fn submit_and_wait(&self, request: SearchRequest) -> Result<WaitOutcome, QueryError> {
        let handle = self.submit(request)?;
        let request_id = handle.request_id;
        if self.config.sync_wait_ms == 0 {
            return Ok(WaitOutcome::Detached(request_id));
        }
        Ok(handle
            .wait(Duration::from_millis(self.config.sync_wait_ms))
            .await)
    }

    /// Current state of a task. Unknown or expired ids read as done.
    pub fn status(&self, request_id: i64) -> Result<TaskStatus, QueryError> {
        self.pipeline.tasks.status(request_id)
    }

    pub fn record(&self, request_id: i64) -> Result<Option<HistoryRecord>, QueryError> {
        Ok(self.pipeline.services.records.get_record(request_id)?)
    }

    /// Stored results of a task, best first, with their score summary.
    pub fn results(
        &self,
        request_id: i64,
        limit: usize,
    ) -> Result<(Vec<RankedResult>, QualityStats), QueryError> {
        let items = self
            .pipeline
            .services
            .records
            .list_items(request_id, limit)?;
        let stats = QualityStats::from_scores(items.iter().map(|r| r.score), &self.pipeline.quality);
        Ok((items, stats))
    }

    /// Stop accepting work and wait for queued jobs to drain.
    pub async fn shutdown(self) {
        let Self { queue, worker, .. } = self;
        drop(queue);
        if let Err(e) = worker.await {
            error!(error = %e, "Query worker ended abnormally");
        }
    }
}

async fn worker_loop(pipeline: Arc<Pipeline>, mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        let Job {
            request_id,
            image,
            top_k,
            done,
        } = job;

        let started = Instant::now();
        let runner = pipeline.clone();
        let outcome = tokio::task::spawn_blocking(move || runner.process(request_id, &image, top_k)).await;

        let state = match outcome {
            Ok(Ok(count)) => match pipeline.tasks.mark_done(request_id) {
                Ok(()) => {
                    info!(
                        request_id,
                        results = count,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Query finished"
                    );
                    TaskState::Done
                }
                Err(e) => {
                    warn!(request_id, error = %e, "Failed to mark task done");
                    pipeline.fail(request_id, &format!("Failed to record completion: {e}"))
                }
            },
            Ok(Err(e)) => {
                warn!(request_id, error = %e, "Query failed");
                pipeline.fail(request_id, &e.to_string())
            }
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    QueryError::Panicked(panic_message(join_error.into_panic())).to_string()
                } else {
                    join_error.to_string()
                };
                error!(request_id, error = %message, "Query worker job aborted");
                pipeline.fail(request_id, &message)
            }
        };
        let _ = done.send(state);
    }
    debug!("Query worker stopped");
}

impl Pipeline {
    /// Run one job to completion, returning the number of stored results.
    fn process(&self, request_id: i64, image: &[u8], top_k: usize) -> Result<usize, QueryError> {
        let embedding = self.embedding_for(image)?;
        let results = self.services.searcher.search(&embedding, top_k);
        let ranked = RankedResult::rank_all(&results, &self.quality);
        self.services
            .records
            .attach_results(request_id, &embedding, &ranked)?;
        Ok(ranked.len())
    }

    /// Cached embedding for these exact bytes when its length still matches
    /// the live gallery, else a freshly computed one.
    fn embedding_for(&self, image: &[u8]) -> Result<Vec<f32>, QueryError> {
        let digest = content_digest(image);
        let expected = self
            .services
            .searcher
            .dimension()
            .unwrap_or_else(|| self.services.embedder.dimension());

        match self.embeddings.get(&digest) {
            Ok(Some(Embedding(cached))) if cached.len() == expected => {
                debug!(digest = %digest, "Embedding cache hit");
                return Ok(cached);
            }
            Ok(Some(Embedding(stale))) => {
                debug!(digest = %digest, cached = stale.len(), expected, "Stale cached embedding");
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Embedding cache read failed"),
        }

        let embedding = self.services.embedder.embed_image(image)?;
        if let Err(e) = self.embeddings.set(&digest, &Embedding(embedding.clone())) {
            warn!(error = %e, "Embedding cache write failed");
        }
        Ok(embedding)
    }

    /// Record a failure and return the resulting state.
    fn fail(&self, request_id: i64, message: &str) -> TaskState {
        if let Err(e) = self.tasks.mark_error(request_id, message) {
            warn!(request_id, error = %e, "Failed to record task error");
        }
        TaskState::Error
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
