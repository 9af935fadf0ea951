//! Bulk instance operations
//!
//! The batch processor partitions its input into fixed-size chunks and runs
//! chunks under a semaphore that caps in-flight work. Items are independent:
//! one bad item never fails its siblings, and a chunk that overruns the
//! configured timeout reports a timeout error for each of its remaining
//! items only. Results carry the original input index so callers can map
//! outcomes back to their requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::engine::{ApprovalEngine, EngineError, Verdict};
use crate::workflow::{EntityContext, EntityRef, InstanceStatus, WorkflowInstance};

/// Batch execution limits
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Items per chunk
    pub chunk_size: usize,

    /// Maximum chunks in flight at once
    pub max_concurrency: usize,

    /// Per-chunk deadline; items not finished when it expires are
    /// reported as timed out
    pub chunk_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 25,
            max_concurrency: 8,
            chunk_timeout: Duration::from_secs(30),
        }
    }
}

impl BatchConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }
}

/// Why one batch item failed
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// The item's chunk hit its deadline before this item ran to completion
    #[error("chunk timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// One failed item, addressed by its index in the input
#[derive(Debug)]
pub struct BatchItemError {
    pub index: usize,
    pub error: BatchError,
}

/// Aggregate outcome of a batch call
///
/// Successes and failures are disjoint over the input indices.
#[derive(Debug)]
pub struct BatchReport<T> {
    pub succeeded: Vec<(usize, T)>,
    pub errors: Vec<BatchItemError>,
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> BatchReport<T> {
    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    fn merge(&mut self, other: BatchReport<T>) {
        self.succeeded.extend(other.succeeded);
        self.errors.extend(other.errors);
    }

    fn sort(&mut self) {
        self.succeeded.sort_by_key(|(index, _)| *index);
        self.errors.sort_by_key(|e| e.index);
    }
}

/// Input to [`BatchProcessor::create_instances_batch`]
#[derive(Debug, Clone)]
pub struct CreateInstanceRequest {
    pub workflow_id: Uuid,
    pub entity: EntityRef,
    pub context: EntityContext,
    pub initiator_id: String,
}

/// What an [`InstanceUpdate`] does to its instance
#[derive(Debug, Clone)]
pub enum UpdateAction {
    Decide {
        verdict: Verdict,
        comments: Option<String>,
    },
    Cancel,
}

/// Input to [`BatchProcessor::update_instances_batch`]
#[derive(Debug, Clone)]
pub struct InstanceUpdate {
    pub instance_id: Uuid,
    pub actor_id: String,
    pub action: UpdateAction,
}

/// Executes bulk operations against an [`ApprovalEngine`]
pub struct BatchProcessor {
    engine: Arc<ApprovalEngine>,
    config: BatchConfig,
    semaphore: Arc<Semaphore>,
}

impl BatchProcessor {
    pub fn new(engine: Arc<ApprovalEngine>) -> Self {
        Self::with_config(engine, BatchConfig::default())
    }

    pub fn with_config(engine: Arc<ApprovalEngine>, config: BatchConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
        Self {
            engine,
            config,
            semaphore,
        }
    }

    /// Create many instances; partial failure is per item
    #[instrument(skip_all, fields(requests = requests.len()))]
    pub async fn create_instances_batch(
        &self,
        requests: Vec<CreateInstanceRequest>,
    ) -> BatchReport<WorkflowInstance> {
        self.run_chunked(requests, |engine, index, request| async move {
            let created = engine
                .create_instance(
                    request.workflow_id,
                    request.entity,
                    request.context,
                    &request.initiator_id,
                )
                .await;
            (index, created.map_err(BatchError::from))
        })
        .await
    }

    /// Apply many updates (decisions or cancellations); partial failure is
    /// per item
    #[instrument(skip_all, fields(updates = updates.len()))]
    pub async fn update_instances_batch(
        &self,
        updates: Vec<InstanceUpdate>,
    ) -> BatchReport<WorkflowInstance> {
        self.run_chunked(updates, |engine, index, update| async move {
            let result = match update.action {
                UpdateAction::Decide { verdict, comments } => {
                    engine
                        .submit_decision(update.instance_id, &update.actor_id, verdict, comments)
                        .await
                }
                UpdateAction::Cancel => {
                    engine
                        .cancel_instance(update.instance_id, &update.actor_id)
                        .await
                }
            };
            (index, result.map_err(BatchError::from))
        })
        .await
    }

    /// Parallel point-reads of instance status, served through the cache
    ///
    /// Reads are independent and lock-free, so they fan out per id rather
    /// than per chunk; the semaphore still caps the fan-out.
    #[instrument(skip_all, fields(ids = instance_ids.len()))]
    pub async fn get_statuses_batch(
        &self,
        instance_ids: Vec<Uuid>,
    ) -> HashMap<Uuid, Result<InstanceStatus, BatchError>> {
        let reads = instance_ids.into_iter().map(|id| {
            let engine = self.engine.clone();
            let semaphore = self.semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await;
                (id, engine.get_instance_status(id).await.map_err(BatchError::from))
            }
        });

        futures::future::join_all(reads).await.into_iter().collect()
    }

    /// Chunk the items, run chunks under the semaphore, deadline each chunk
    async fn run_chunked<I, T, F, Fut>(&self, items: Vec<I>, op: F) -> BatchReport<T>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(Arc<ApprovalEngine>, usize, I) -> Fut + Clone + Send + 'static,
        Fut: std::future::Future<Output = (usize, Result<T, BatchError>)> + Send + 'static,
    {
        let mut report = BatchReport::default();
        if items.is_empty() {
            return report;
        }

        let chunk_size = self.config.chunk_size.max(1);
        let timeout = self.config.chunk_timeout;

        let mut tasks = JoinSet::new();
        let mut chunk = Vec::with_capacity(chunk_size);
        let mut next_index = 0usize;
        let mut items = items.into_iter().peekable();

        while let Some(item) = items.next() {
            chunk.push((next_index, item));
            next_index += 1;

            if chunk.len() == chunk_size || items.peek().is_none() {
                let batch: Vec<(usize, I)> = std::mem::take(&mut chunk);
                let engine = self.engine.clone();
                let semaphore = self.semaphore.clone();
                let op = op.clone();

                tasks.spawn(async move {
                    // Closing the semaphore is not part of this type's
                    // lifecycle, so acquisition cannot fail
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return BatchReport::default(),
                    };

                    let mut chunk_report = BatchReport::default();
                    let deadline = tokio::time::Instant::now() + timeout;

                    for (index, item) in batch {
                        // Once the deadline has passed, no further item is
                        // started; each remaining index reports a timeout.
                        if tokio::time::Instant::now() >= deadline {
                            chunk_report.errors.push(BatchItemError {
                                index,
                                error: BatchError::Timeout(timeout),
                            });
                            continue;
                        }

                        let work = op(engine.clone(), index, item);
                        match tokio::time::timeout_at(deadline, work).await {
                            Ok((index, Ok(value))) => {
                                chunk_report.succeeded.push((index, value));
                            }
                            Ok((index, Err(error))) => {
                                chunk_report.errors.push(BatchItemError { index, error });
                            }
                            Err(_) => {
                                warn!(from_index = index, "chunk deadline hit, remaining items timed out");
                                chunk_report.errors.push(BatchItemError {
                                    index,
                                    error: BatchError::Timeout(timeout),
                                });
                            }
                        }
                    }

                    chunk_report
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(chunk_report) => report.merge(chunk_report),
                Err(e) => warn!(error = %e, "batch chunk task panicked"),
            }
        }

        report.sort();
        debug!(
            succeeded = report.success_count(),
            failed = report.error_count(),
            "batch finished"
        );
        report
    }
}
