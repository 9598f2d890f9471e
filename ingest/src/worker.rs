//! This module provides the worker pool driving pending heights through the block pipeline.

use std::num::NonZeroUsize;
use std::sync::Arc;

use futures::future::{self, Future, FutureExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::progress::{Emitter, ProgressEvent};
use crate::source::{self, Source};
use crate::store::{self, Store};
use crate::{Height, Txid};

/// A `processing_transactions` heartbeat is emitted every this many transactions.
pub const HEARTBEAT_INTERVAL: usize = 100;
/// An additional debug heartbeat is emitted every this many transactions.
pub const DEBUG_HEARTBEAT_INTERVAL: usize = 1_000;

/// Failure of the pipeline of a single height.
///
/// It is terminal for that height for the current run, but never for the run itself.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("failed to get hash for block {height}: {source}")]
    Hash { height: Height, source: source::Error },
    #[error("failed to mark block {height} processing: {source}")]
    MarkProcessing { height: Height, source: store::Error },
    #[error("failed to get block {height} with transactions: {source}")]
    Fetch { height: Height, source: source::Error },
    #[error("failed to insert block {height}: {source}")]
    InsertBlock { height: Height, source: store::Error },
    #[error("failed to insert transaction {txid} of block {height}: {source}")]
    InsertTransaction { height: Height, txid: Txid, source: store::Error },
    #[error("failed to mark block {height} completed: {source}")]
    MarkCompleted { height: Height, source: store::Error },
}

impl UnitError {
    /// The height whose pipeline failed.
    pub fn height(&self) -> Height {
        match *self {
            UnitError::Hash { height, .. }
            | UnitError::MarkProcessing { height, .. }
            | UnitError::Fetch { height, .. }
            | UnitError::InsertBlock { height, .. }
            | UnitError::InsertTransaction { height, .. }
            | UnitError::MarkCompleted { height, .. } => height,
        }
    }

    /// Whether this failure is recorded as a `failed` status.
    ///
    /// Status writes themselves failing leave the status row as is, which is never `completed` at this point.
    fn is_recorded(&self) -> bool {
        !matches!(self, UnitError::MarkProcessing { .. } | UnitError::MarkCompleted { .. })
    }
}

/// The per-height pipeline, shared by every worker of a pool.
pub(crate) struct Pipeline<S, T> {
    source: Arc<S>,
    store: Arc<T>,
    events: Emitter,
}

impl<S, T> Clone for Pipeline<S, T> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            store: Arc::clone(&self.store),
            events: self.events.clone(),
        }
    }
}

impl<S: Source, T: Store> Pipeline<S, T> {
    pub(crate) fn new(source: Arc<S>, store: Arc<T>, events: Emitter) -> Self {
        Self { source, store, events }
    }

    /// Fetch and persist the block at `height`, returning its transaction count.
    ///
    /// Once started, it always runs to a terminal outcome: there is no cancellation point in here.
    async fn run(&self, height: Height) -> Result<usize, UnitError> {
        self.events.emit(ProgressEvent::processing(height)).await;

        let hash = match self.source.hash_at(height).await {
            Ok(hash) => hash,
            Err(source) => return Err(self.fail(UnitError::Hash { height, source }).await),
        };

        self.store
            .mark_processing(height, &hash)
            .await
            .map_err(|source| UnitError::MarkProcessing { height, source })?;

        let (block, transactions) = match self.source.fetch_block(&hash).await {
            Ok(fetched) => fetched,
            Err(source) => return Err(self.fail(UnitError::Fetch { height, source }).await),
        };

        if let Err(source) = self.store.insert_block(&block).await {
            return Err(self.fail(UnitError::InsertBlock { height, source }).await);
        }

        let total = transactions.len();

        for (i, transaction) in transactions.iter().enumerate() {
            if let Err(source) = self.store.insert_transaction(transaction).await {
                let txid = transaction.txid.clone();
                return Err(self.fail(UnitError::InsertTransaction { height, txid, source }).await);
            }

            let count = i + 1;

            if count % HEARTBEAT_INTERVAL == 0 || count == total {
                let message = format!("Block {height}: processed {count}/{total} transactions");
                self.events.emit(ProgressEvent::transactions(height, count, message)).await;
            }

            if count % DEBUG_HEARTBEAT_INTERVAL == 0 {
                let message = format!("Processed {count}/{total} transactions for block {height}");
                tracing::debug!("{message}");
                self.events.emit(ProgressEvent::transactions(height, count, message)).await;
            }
        }

        self.store
            .mark_completed(height)
            .await
            .map_err(|source| UnitError::MarkCompleted { height, source })?;

        Ok(total)
    }

    /// Try to record `err` as the `failed` status of its height, ignoring any failure to do so.
    async fn fail(&self, err: UnitError) -> UnitError {
        let height = err.height();

        if err.is_recorded() {
            if let Err(status_err) = self.store.mark_failed(height, &err.to_string()).await {
                tracing::warn!("Could not record failed status of block {height}: {status_err}");
            }
        }

        err
    }

    /// Run the pipeline of `height` and report its terminal outcome.
    async fn process(&self, height: Height) {
        let event = match self.run(height).await {
            Ok(tx_count) => ProgressEvent::completed(height, tx_count),
            Err(err) => {
                tracing::warn!("Block {height} failed: {err}");

                ProgressEvent::failed(height, err)
            }
        };

        self.events.emit(event).await;
    }
}

/// The shared work queue all workers of a pool pull heights from.
type Queue = Arc<Mutex<mpsc::Receiver<Height>>>;

/// A fixed-size pool of workers sharing one work queue.
///
/// Workers stop on their own once the queue is closed and drained, or as soon as cancellation is observed while
/// waiting for the next height.
#[derive(Debug)]
pub(crate) struct Pool {
    workers: Vec<Worker>,
}

impl Pool {
    /// Start `size` workers pulling heights from `queue`.
    pub(crate) fn start<S: Source, T: Store>(
        size: NonZeroUsize,
        queue: mpsc::Receiver<Height>,
        pipeline: Pipeline<S, T>,
        cancel: CancellationToken,
    ) -> Self {
        let queue = Arc::new(Mutex::new(queue));

        let workers = (0..size.get())
            .map(|id| Worker::new(id, Arc::clone(&queue), pipeline.clone(), cancel.clone()))
            .collect();

        Self { workers }
    }

    /// Wait for every worker to terminate.
    pub(crate) async fn join(self) {
        let results = future::join_all(self.workers.into_iter().inspect(|worker| {
            tracing::debug!("Waiting for worker {}...", worker.id);
        }))
        .await;

        for err in results.into_iter().filter_map(Result::err) {
            tracing::error!("Worker task failed: {err}");
        }
    }
}

enum Pull {
    Height(Height),
    Exhausted,
    Cancelled,
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: tokio::task::JoinHandle<()>,
}

impl Worker {
    fn new<S: Source, T: Store>(id: usize, queue: Queue, pipeline: Pipeline<S, T>, cancel: CancellationToken) -> Worker {
        tracing::debug!("Starting worker {id}...");

        Worker {
            id,
            handle: tokio::spawn(async move {
                loop {
                    let next = {
                        let mut queue = queue.lock().await;

                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => Pull::Cancelled,
                            height = queue.recv() => height.map_or(Pull::Exhausted, Pull::Height),
                        }
                    };

                    match next {
                        Pull::Height(height) => {
                            tracing::debug!("Executing block {height} on worker {id}...");

                            pipeline.process(height).await;
                        }
                        Pull::Exhausted => {
                            tracing::debug!("All heights exhausted, shutting down worker {id}.");
                            break;
                        }
                        Pull::Cancelled => {
                            tracing::debug!("Cancellation requested, shutting down worker {id}.");
                            break;
                        }
                    }
                }
            }),
        }
    }
}

impl Future for Worker {
    type Output = Result<(), tokio::task::JoinError>;

    #[inline]
    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        self.handle.poll_unpin(cx)
    }
}
