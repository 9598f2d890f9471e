//! Event stream consumers.
//!
//! An [`Observer`] is driven by [`observe()`], a single cooperative loop receiving events with a timeout: every event
//! updates the observer, every timeout lets it refresh from its cached state, and the stream closure ends the loop.

use std::collections::VecDeque;
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

use tokio::time::Instant;

use crate::progress::{EventKind, EventStream, ProgressEvent};
use crate::Height;

/// Default idle refresh interval.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

const MAX_RECENT_ERRORS: usize = 5;

/// A progress event consumer.
pub trait Observer {
    /// Called for every received event.
    fn on_event(&mut self, event: &ProgressEvent);

    /// Called when no event has been received for a whole tick.
    fn on_idle(&mut self) {}

    /// Called once, when the stream is closed and drained.
    fn on_close(&mut self) {}
}

/// Feed `observer` with `stream` until it is closed, calling [`Observer::on_idle()`] every `tick` without event.
pub async fn observe<O: Observer + ?Sized>(mut stream: EventStream, observer: &mut O, tick: Duration) {
    loop {
        match tokio::time::timeout(tick, stream.recv()).await {
            Ok(Some(event)) => observer.on_event(&event),
            Ok(None) => {
                observer.on_close();
                break;
            }
            Err(_) => observer.on_idle(),
        }
    }
}

/// Aggregated progress of a run.
#[derive(Debug, Clone)]
pub struct Summary {
    total_blocks: u64,
    processed_blocks: u64,
    failed_blocks: u64,
    total_txs: u64,
    current_height: Option<Height>,
    current_block_txs: usize,
    recent_errors: VecDeque<String>,
    already_processed: bool,
    closed: bool,
    started_at: Instant,
}

impl Summary {
    pub fn new(range: RangeInclusive<Height>) -> Self {
        Self {
            total_blocks: range.end().saturating_sub(*range.start()).saturating_add(1),
            processed_blocks: 0,
            failed_blocks: 0,
            total_txs: 0,
            current_height: None,
            current_block_txs: 0,
            recent_errors: VecDeque::with_capacity(MAX_RECENT_ERRORS),
            already_processed: false,
            closed: false,
            started_at: Instant::now(),
        }
    }

    #[inline]
    pub fn processed_blocks(&self) -> u64 {
        self.processed_blocks
    }

    #[inline]
    pub fn failed_blocks(&self) -> u64 {
        self.failed_blocks
    }

    #[inline]
    pub fn total_txs(&self) -> u64 {
        self.total_txs
    }

    #[inline]
    pub fn current_height(&self) -> Option<Height> {
        self.current_height
    }

    /// The last few failures, oldest first.
    pub fn recent_errors(&self) -> impl Iterator<Item = &str> {
        self.recent_errors.iter().map(String::as_str)
    }

    #[inline]
    pub fn already_processed(&self) -> bool {
        self.already_processed
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Percentage of the range completed during this run.
    pub fn progress(&self) -> f64 {
        self.processed_blocks as f64 / self.total_blocks as f64 * 100.0
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Estimated remaining time, extrapolated from the average time per completed block.
    pub fn eta(&self) -> Option<Duration> {
        if self.processed_blocks == 0 {
            return None;
        }

        let remaining = self.total_blocks.saturating_sub(self.processed_blocks);

        Some(self.elapsed().mul_f64(remaining as f64 / self.processed_blocks as f64))
    }
}

impl Observer for Summary {
    fn on_event(&mut self, event: &ProgressEvent) {
        match event.kind {
            EventKind::Completed => {
                let tx_count = event.tx_count.unwrap_or_default();

                self.processed_blocks += 1;
                self.total_txs += tx_count as u64;
                self.current_height = event.height;
                self.current_block_txs = tx_count;
            }
            EventKind::Failed => {
                self.failed_blocks += 1;

                if self.recent_errors.len() == MAX_RECENT_ERRORS {
                    self.recent_errors.pop_front();
                }

                let error = event.error.as_deref().unwrap_or("unknown error");
                self.recent_errors.push_back(match event.height {
                    Some(height) => format!("Block {height}: {error}"),
                    None => error.to_owned(),
                });
            }
            EventKind::AllAlreadyProcessed => self.already_processed = true,
            EventKind::Processing | EventKind::ProcessingTransactions => {}
        }
    }

    fn on_close(&mut self) {
        self.closed = true;
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.already_processed {
            return f.write_str("All blocks already processed");
        }

        write!(
            f,
            "Processed: {}/{} blocks ({:.1}%) | Transactions: {} total, {} in last block | Failed: {} blocks | Elapsed: {}s",
            self.processed_blocks,
            self.total_blocks,
            self.progress(),
            self.total_txs,
            self.current_block_txs,
            self.failed_blocks,
            self.elapsed().as_secs(),
        )?;

        if let Some(eta) = self.eta() {
            write!(f, " | ETA: {}s", eta.as_secs())?;
        }

        Ok(())
    }
}

/// An observer reporting progress through `tracing`.
#[derive(Debug, Clone)]
pub struct LogObserver {
    summary: Summary,
}

impl LogObserver {
    pub fn new(range: RangeInclusive<Height>) -> Self {
        Self {
            summary: Summary::new(range),
        }
    }

    #[inline]
    pub fn summary(&self) -> &Summary {
        &self.summary
    }
}

impl Observer for LogObserver {
    fn on_event(&mut self, event: &ProgressEvent) {
        self.summary.on_event(event);

        let height = event.height.unwrap_or_default();

        match event.kind {
            EventKind::Processing => {
                tracing::trace!("{}", event.debug_message.as_deref().unwrap_or_default());
            }
            EventKind::ProcessingTransactions => {
                tracing::debug!("{}", event.debug_message.as_deref().unwrap_or_default());
            }
            EventKind::Completed => {
                tracing::info!("Processed block {height} ({} txs) - {}", event.tx_count.unwrap_or_default(), self.summary);
            }
            EventKind::Failed => {
                tracing::warn!("Error processing block {height}: {}", event.error.as_deref().unwrap_or("unknown error"));
            }
            EventKind::AllAlreadyProcessed => tracing::info!("All blocks already processed"),
        }
    }

    fn on_idle(&mut self) {
        tracing::trace!("{}", self.summary);
    }

    fn on_close(&mut self) {
        self.summary.on_close();

        tracing::info!("Processing completed! {}", self.summary);
    }
}
