//! Progress events flowing from the workers to a single observer.

use std::fmt;

use tokio::sync::mpsc;

use crate::Height;

/// What a [`ProgressEvent`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A worker started the pipeline of a height.
    Processing,
    /// Transactions heartbeat, carrying the running transaction count.
    ProcessingTransactions,
    /// A height went through the whole pipeline.
    Completed,
    /// A height failed for this run.
    Failed,
    /// Nothing was pending in the requested range, this is the only event of the run.
    AllAlreadyProcessed,
}

impl EventKind {
    /// Whether this event ends the pipeline of a height.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, EventKind::Completed | EventKind::Failed)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Processing => "processing",
            EventKind::ProcessingTransactions => "processing_transactions",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::AllAlreadyProcessed => "all_already_processed",
        })
    }
}

/// An ephemeral progress notification, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// The height this event is about, `None` for run-level events.
    pub height: Option<Height>,
    pub tx_count: Option<usize>,
    pub kind: EventKind,
    /// Human-readable failure, set on [`EventKind::Failed`] only.
    pub error: Option<String>,
    pub debug_message: Option<String>,
}

impl ProgressEvent {
    fn new(height: Option<Height>, kind: EventKind) -> Self {
        Self {
            height,
            tx_count: None,
            kind,
            error: None,
            debug_message: None,
        }
    }

    pub fn processing(height: Height) -> Self {
        Self {
            debug_message: Some(format!("Starting to process block {height}")),
            ..Self::new(Some(height), EventKind::Processing)
        }
    }

    pub fn transactions(height: Height, tx_count: usize, debug_message: String) -> Self {
        Self {
            tx_count: Some(tx_count),
            debug_message: Some(debug_message),
            ..Self::new(Some(height), EventKind::ProcessingTransactions)
        }
    }

    pub fn completed(height: Height, tx_count: usize) -> Self {
        Self {
            tx_count: Some(tx_count),
            debug_message: Some(format!("Completed block {height} with {tx_count} transactions")),
            ..Self::new(Some(height), EventKind::Completed)
        }
    }

    pub fn failed(height: Height, error: impl fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(Some(height), EventKind::Failed)
        }
    }

    pub fn all_already_processed() -> Self {
        Self::new(None, EventKind::AllAlreadyProcessed)
    }
}

/// Create a bounded event stream, returning its producing and consuming halves.
pub(crate) fn channel(capacity: usize) -> (Emitter, EventStream) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));

    (Emitter { sender }, EventStream { receiver })
}

/// The producing half of the event stream, cloned for every producer.
///
/// The stream is closed once the last `Emitter` is dropped.
#[derive(Debug, Clone)]
pub(crate) struct Emitter {
    sender: mpsc::Sender<ProgressEvent>,
}

impl Emitter {
    /// Send an event, waiting for room in the stream if the observer lags behind.
    pub(crate) async fn emit(&self, event: ProgressEvent) {
        if let Err(mpsc::error::SendError(event)) = self.sender.send(event).await {
            tracing::trace!("Event stream dropped by its observer, discarding {} event", event.kind);
        }
    }
}

/// The read-only consuming half of the event stream.
///
/// Once [`EventStream::recv()`] returns `None`, the run is over and no more event will ever be received.
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::Receiver<ProgressEvent>,
}

impl EventStream {
    /// Receive the next event, or `None` once the stream is closed and drained.
    #[inline]
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.recv().await
    }

    /// Whether the stream has been closed by its producers.
    ///
    /// Buffered events can still be received from a closed stream.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.receiver.is_closed()
    }

    /// Receive every remaining event until the stream is closed.
    pub async fn drain(mut self) -> Vec<ProgressEvent> {
        let mut events = vec![];

        while let Some(event) = self.recv().await {
            events.push(event);
        }

        events
    }
}
