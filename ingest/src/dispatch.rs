//! Run orchestration: pending heights resolution, worker pool lifecycle and event stream closure.

use std::sync::Arc;
use std::time::Duration;

use futures::future::OptionFuture;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::progress::{self, Emitter, EventStream, ProgressEvent};
use crate::source::{self, Source};
use crate::store::{self, Store};
use crate::worker::{Pipeline, Pool};
use crate::{resolver, Height};

/// Run-level failure.
///
/// Failures of single heights are never reported here but through the event stream.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to get processed blocks: {0}")]
    Setup(#[source] store::Error),
    #[error("failed to get best block height: {0}")]
    Tip(#[source] source::Error),
    #[error("range starts at {from}, above the chain tip {tip}")]
    BeyondTip { from: Height, tip: Height },
    #[error("failed to persist processed blocks: {0}")]
    Flush(#[source] store::Error),
    #[error("run cancelled")]
    Cancelled,
}

/// Block range processor.
///
/// A `Dispatcher` processes the pending heights of its configured range once: it resolves them against the store,
/// feeds them to a pool of workers, flushes the store and closes its [`EventStream`] after every worker has returned.
///
/// The event stream is bounded: it must be consumed concurrently with [`Dispatcher::run()`], otherwise workers end up
/// waiting for room in the stream.
///
/// # Example
/// ```no_run
/// # tokio_test::block_on(async {
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use ingest::{config::Config, dispatch::Dispatcher, source::{RpcConfig, RpcSource}, store::{LocalStore, Store}};
/// # use tokio_util::sync::CancellationToken;
/// let source = RpcSource::new(RpcConfig::new("localhost:8332", "user", "pass")?)?;
/// let store = Arc::new(LocalStore::open("ledger.json").await?);
/// let config = Config::new(840_000, 840_100, 10)?
///     .with_tip_clamp(true)
///     .with_flush_interval(Duration::from_secs(30));
///
/// let mut dispatcher = Dispatcher::new(config, Arc::new(source), Arc::clone(&store));
/// let mut events = dispatcher.events().unwrap();
///
/// let run = tokio::spawn(dispatcher.run(CancellationToken::new()));
///
/// while let Some(event) = events.recv().await {
///     println!("{:?} {}", event.height, event.kind);
/// }
///
/// run.await??;
///
/// // already flushed by the run, this only covers writes made since
/// store.flush().await?;
/// # Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
/// # });
/// ```
pub struct Dispatcher<S, T> {
    config: Config,
    source: Arc<S>,
    store: Arc<T>,
    emitter: Emitter,
    events: Option<EventStream>,
}

impl<S: Source, T: Store> Dispatcher<S, T> {
    pub fn new(config: Config, source: Arc<S>, store: Arc<T>) -> Self {
        let (emitter, events) = progress::channel(config.event_capacity());

        Self {
            config,
            source,
            store,
            emitter,
            events: Some(events),
        }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Take the read-only event stream of this run.
    ///
    /// It can only be taken once: `None` is returned afterwards.
    #[inline]
    pub fn events(&mut self) -> Option<EventStream> {
        self.events.take()
    }

    /// Process every pending height of the configured range.
    ///
    /// Cancelling `cancel` stops dispatching and lets workers return once their current height reaches a terminal
    /// outcome, then [`Error::Cancelled`] is returned.
    ///
    /// Whatever the outcome once workers have started, the store is flushed before the event stream is closed.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error> {
        let Self {
            config,
            source,
            store,
            emitter,
            events,
        } = self;

        // an untaken stream must not hold workers back once full
        drop(events);

        let range = if config.clamp_to_tip() {
            let tip = source.best_height().await.map_err(Error::Tip)?;
            let from = *config.range().start();

            config.clamped_range(tip).ok_or(Error::BeyondTip { from, tip })?
        } else {
            config.range()
        };

        let pending = resolver::pending_heights(&*store, range.clone()).await.map_err(Error::Setup)?;

        if pending.is_empty() {
            tracing::info!("All blocks already processed from height {} to {}", range.start(), range.end());

            emitter.emit(ProgressEvent::all_already_processed()).await;

            return Ok(());
        }

        tracing::info!(
            "Processing {} pending blocks from height {} to {} with {} workers",
            pending.len(),
            range.start(),
            range.end(),
            config.pool_size()
        );

        // room for every pending height, pushing never waits for workers
        let (queue, receiver) = mpsc::channel(pending.len());

        let pipeline = Pipeline::new(source, Arc::clone(&store), emitter.clone());
        let pool = Pool::start(config.pool_size(), receiver, pipeline, cancel.clone());

        let done = CancellationToken::new();
        let flusher = config
            .flush_interval()
            .map(|period| tokio::spawn(flush_every(Arc::clone(&store), period, done.clone())));

        let mut cancelled = false;

        for height in pending {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("Cancellation requested, stop dispatching at block {height}");
                    cancelled = true;
                    break;
                }
                res = queue.send(height) => {
                    if res.is_err() {
                        tracing::warn!("Every worker is gone, stop dispatching at block {height}");
                        break;
                    }
                }
            }
        }

        // closing the queue lets workers drain it and shut down
        drop(queue);
        pool.join().await;

        done.cancel();
        if let Some(Err(err)) = OptionFuture::from(flusher).await {
            tracing::error!("Flushing task failed: {err}");
        }

        let flushed = store.flush().await;

        // last emitter alive, this closes the event stream
        drop(emitter);

        flushed.map_err(Error::Flush)?;

        if cancelled || cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        Ok(())
    }
}

/// Flush `store` every `period` until `done` is cancelled.
async fn flush_every<T: Store>(store: Arc<T>, period: Duration, done: CancellationToken) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = done.cancelled() => break,
            _ = interval.tick() => {
                if let Err(err) = store.flush().await {
                    tracing::warn!("Could not flush processed blocks: {err}");
                }
            }
        }
    }
}
