//! A resumable concurrent block range ingester.
//!
//! A crate providing features dedicated to:
//! - resolving the heights of a block range still pending from a previous run,
//! - fanning them out to a bounded pool of asynchronous workers,
//! - fetching blocks with their transactions from a [`Source`](source::Source) (e.g. a Bitcoin Core node),
//! - persisting them into a [`Store`](store::Store) with insert-or-ignore semantics,
//! - reporting progress through a bounded _multi-producer single-consumer_ event stream.
//!
//! As a **strong hypothesis**, we can assume that:
//! - a height is the unit of work: it either reaches `completed` in the status ledger or is processed again by the
//!   next run, whatever its previous state (`failed`, or `processing` left behind by an interrupted run);
//! - record writes are idempotent, so a block aborted halfway can be written again from scratch.
//!
//! There is no retry within a run. A height failing at any step of its pipeline is reported once through the event
//! stream and left to the next run, while the run itself carries on with the other heights.
//!
//! Here is the naive representation of a run:
//!
//! ```text
//!     caller L Dispatcher::run()
//!              L pending heights (range minus completed ones)
//!              L work queue (capacity = pending heights)
//!                L worker 1 .. worker N
//!                  L hash_at -> mark_processing -> fetch_block -> insert_block -> insert_transaction* -> mark_completed
//!              L flush store (after the last worker, optionally every flush interval)
//!              L event stream (capacity = 2 * N) -> observer
//! ```
//!
//! Resolving pending heights from a store:
//! ```
//! # tokio_test::block_on(async {
//! use ingest::{resolver, store::{LocalStore, Store}};
//!
//! let store = LocalStore::in_memory();
//! store.mark_processing(101, "00ab").await?;
//! store.mark_completed(101).await?;
//!
//! assert_eq!(resolver::pending_heights(&store, 100..=102).await?, [100, 102]);
//! # Ok::<_, ingest::store::Error>(())
//! # }).unwrap();
//! ```

mod model;
pub use model::*;

pub mod config;
pub mod dispatch;
pub mod observer;
pub mod progress;
pub mod resolver;
pub mod source;
pub mod store;
pub mod telemetry;
pub mod worker;
