//! Per-relation bulk-insert operator.
//!
//! A single-writer batching pipeline: callers submit row batches through a
//! bounded inbox and block on a single-shot acknowledgement; a dedicated
//! run task buffers submissions and flushes them as one multi-row INSERT
//! on either a 500 ms tick or a size threshold. Backpressure is visible
//! to callers as an immediate error instead of unbounded memory growth.
//!
//! Only the run task touches the buffer; everything else interacts
//! through the inbox, the per-submission ack channel, and the `closed`
//! flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::catalog::Column;
use crate::connection::Connection;
use crate::error::{ConnectionError, InsertError};
use crate::metrics::IngestMetrics;
use crate::statement;

/// Dual-trigger flush interval.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(500);
/// Default inbox and buffer capacity.
pub const DEFAULT_BUF_SIZE: usize = 5000;
/// The driver's positional-parameter ceiling for one statement.
pub const MAX_PARAM_LIMIT: usize = 65535;
/// Per-flush execution timeout.
pub const FLUSH_EXEC_TIMEOUT: Duration = Duration::from_secs(10);
/// How long `close` waits for the run task to drain.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// One caller's batch of rows plus its ack channel.
struct Submission {
    rows: Vec<crate::row::Row>,
    ack: oneshot::Sender<Result<(), InsertError>>,
}

/// Everything a flush task needs, shared with the run task.
struct FlushContext {
    conn: Arc<dyn Connection>,
    prefix: String,
    table: String,
    ncols: usize,
    metrics: Arc<IngestMetrics>,
}

/// Single-writer batching operator for one relation.
pub struct BulkInsertOperator {
    table: String,
    tx: mpsc::Sender<Submission>,
    closed: Arc<AtomicBool>,
    max_rows: usize,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<IngestMetrics>,
}

impl BulkInsertOperator {
    /// Derives the INSERT prefix and row budget for `columns`, allocates
    /// the bounded inbox, and starts the run task.
    ///
    /// `columns` must be the filtered column set; the row budget is
    /// `65535 / ncols`.
    ///
    /// # Panics
    ///
    /// Panics when `columns` is empty; the dispatcher never installs a
    /// handler for a relation with no insertable columns.
    #[must_use]
    pub fn spawn(
        table: impl Into<String>,
        columns: &[Column],
        conn: Arc<dyn Connection>,
        buf_size: usize,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        let table = table.into();
        let ncols = columns.len();
        assert!(ncols > 0, "operator needs at least one insertable column");

        let (tx, rx) = mpsc::channel(buf_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let closed = Arc::new(AtomicBool::new(false));

        let ctx = FlushContext {
            conn,
            prefix: statement::insert_prefix(&table, columns),
            table: table.clone(),
            ncols,
            metrics: Arc::clone(&metrics),
        };
        let handle = tokio::spawn(run(
            rx,
            shutdown_rx,
            ctx,
            buf_size,
            MAX_PARAM_LIMIT / ncols,
            Arc::clone(&closed),
        ));

        Self {
            table,
            tx,
            closed,
            max_rows: MAX_PARAM_LIMIT / ncols,
            shutdown_tx,
            task: Mutex::new(Some(handle)),
            metrics,
        }
    }

    /// Largest single submission the operator accepts.
    #[must_use]
    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    /// Whether the operator has entered shutdown.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Submits a batch of rows and waits for its acknowledgement.
    ///
    /// Never blocks on a full inbox: backpressure comes back immediately
    /// so the caller owns the retry policy. A caller that gives up simply
    /// drops the future; the eventual ack then lands on a dead channel
    /// and is discarded.
    ///
    /// # Errors
    ///
    /// [`InsertError::Closed`] after shutdown, [`InsertError::TooLarge`]
    /// for a batch over the row budget, [`InsertError::Backpressure`]
    /// when the inbox is full, or the shared flush error for the batch.
    pub async fn insert(&self, rows: Vec<crate::row::Row>) -> Result<(), InsertError> {
        if self.closed.load(Ordering::Acquire) {
            self.metrics.record_insert_error();
            return Err(InsertError::Closed);
        }
        if rows.len() > self.max_rows {
            self.metrics.record_insert_error();
            return Err(InsertError::TooLarge {
                rows: rows.len(),
                max_rows: self.max_rows,
            });
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        match self.tx.try_send(Submission { rows, ack: ack_tx }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.record_backpressure();
                self.metrics.record_insert_error();
                return Err(InsertError::Backpressure);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.record_insert_error();
                return Err(InsertError::Closed);
            }
        }

        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.metrics.record_insert_error();
                Err(err)
            }
            // Run task gone without acking; only happens on abort.
            Err(_) => {
                self.metrics.record_insert_error();
                Err(InsertError::Closed)
            }
        }
    }

    /// Cooperative shutdown: rejects new submissions, fails buffered ones,
    /// drains the inbox, and joins the run task under a bounded window.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(CLOSE_TIMEOUT, handle).await.is_err() {
                warn!(table = %self.table, "run task did not drain within the close window");
            }
        }
    }
}

impl std::fmt::Debug for BulkInsertOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkInsertOperator")
            .field("table", &self.table)
            .field("max_rows", &self.max_rows)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Run loop: the only task that touches `buffer` and `row_count`.
async fn run(
    mut rx: mpsc::Receiver<Submission>,
    mut shutdown: watch::Receiver<bool>,
    ctx: FlushContext,
    buf_size: usize,
    max_rows: usize,
    closed: Arc<AtomicBool>,
) {
    let mut tick = tokio::time::interval(FLUSH_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tick.tick().await; // swallow the immediate first tick

    let mut buffer: Vec<Submission> = Vec::with_capacity(buf_size);
    let mut row_count = 0usize;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tick.tick() => {
                if !buffer.is_empty() {
                    ctx.metrics.record_flush_by_timeout();
                    flush(&ctx, &mut buffer, &mut row_count, buf_size);
                }
            }
            submission = rx.recv() => {
                let Some(submission) = submission else {
                    // Every sender dropped without an explicit close.
                    flush(&ctx, &mut buffer, &mut row_count, buf_size);
                    return;
                };
                // Flush early rather than let an append cross the
                // parameter budget.
                if row_count + submission.rows.len() > max_rows && !buffer.is_empty() {
                    ctx.metrics.record_flush_by_size();
                    flush(&ctx, &mut buffer, &mut row_count, buf_size);
                }
                row_count += submission.rows.len();
                buffer.push(submission);
                if row_count >= max_rows || buffer.len() >= buf_size {
                    ctx.metrics.record_flush_by_size();
                    flush(&ctx, &mut buffer, &mut row_count, buf_size);
                }
            }
        }
    }

    // Closing: reject future inserts, fail everything still queued.
    closed.store(true, Ordering::Release);
    rx.close();
    for submission in buffer.drain(..) {
        let _ = submission.ack.send(Err(InsertError::Closed));
    }
    while let Some(submission) = rx.recv().await {
        let _ = submission.ack.send(Err(InsertError::Closed));
    }
    debug!(table = %ctx.table, "bulk insert operator drained");
}

/// Snapshots and resets the buffer, then executes the batched INSERT on a
/// detached task so the run loop keeps absorbing submissions while the
/// database call is in flight. The single result fans out to every
/// submission in the snapshot.
fn flush(
    ctx: &FlushContext,
    buffer: &mut Vec<Submission>,
    row_count: &mut usize,
    buf_size: usize,
) {
    if buffer.is_empty() {
        return;
    }
    let items = std::mem::replace(buffer, Vec::with_capacity(buf_size));
    *row_count = 0;

    let mut batches = Vec::with_capacity(items.len());
    let mut acks = Vec::with_capacity(items.len());
    for submission in items {
        batches.push(submission.rows);
        acks.push(submission.ack);
    }

    let (sql, args) = statement::build_insert_statement(&ctx.prefix, batches, ctx.ncols);
    if args.is_empty() {
        // Nothing to write; every submission was empty.
        for ack in acks {
            let _ = ack.send(Ok(()));
        }
        return;
    }

    let conn = Arc::clone(&ctx.conn);
    let metrics = Arc::clone(&ctx.metrics);
    let table = ctx.table.clone();
    tokio::spawn(async move {
        metrics.flush_started();

        let result = match tokio::time::timeout(FLUSH_EXEC_TIMEOUT, conn.execute(&sql, &args))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ConnectionError::Timeout(FLUSH_EXEC_TIMEOUT)),
        };

        match &result {
            Ok(()) => metrics.record_flush_success(),
            Err(err) => {
                metrics.record_flush_error();
                warn!(table = %table, error = %err, n_args = args.len(), "bulk insert flush failed");
            }
        }

        let shared = result.map_err(InsertError::Flush);
        let n_items = acks.len();
        for ack in acks {
            let _ = ack.send(shared.clone());
        }
        metrics.flush_finished();
        debug!(table = %table, n_items, "bulk insert flush done");
    });
}
