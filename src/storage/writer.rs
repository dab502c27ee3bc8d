//! # Background Page Writer
//!
//! This module implements the write pipeline that lets a store push page
//! I/O off the commit path: pages are queued as they are mutated, a single
//! consumer thread writes them to the store's sink, and `flush` turns the
//! pipeline into a durability barrier at commit time.
//!
//! ## Design Overview
//!
//! ```text
//! store thread ──┐
//! evict handler ─┼──► bounded FIFO queue ──► consumer thread ──► sink
//!                │                                 │
//!                └──────────── flush ◄── sync ─────┘
//! ```
//!
//! ## How It Works
//!
//! 1. `queue_write` appends a `(page, txn_id)` pair; it blocks only when
//!    the queue is at its high-water mark
//! 2. The consumer pops pairs in FIFO order and writes each page at its
//!    own offset (seek then write; id order is irrelevant)
//! 3. `flush` enqueues a sync marker and waits until the consumer has
//!    processed it, making everything queued before the call durable
//! 4. `shutdown` consumes the writer: it drains the queue, syncs, joins
//!    the consumer, and releases the sink
//!
//! ## Duplicate Queue Entries
//!
//! The same page may be queued several times (on each mutation and again
//! at commit). The consumer holds the page by reference and reads its
//! current bytes at dequeue time, so the last write for a given id that
//! reaches the sink defines the on-disk bytes. Callers must not mutate a
//! page after queueing it without re-queueing.
//!
//! ## Transaction Ids
//!
//! The writer records the submitted transaction id on each page it writes
//! but never interprets it; placement depends only on the page id. Eviction
//! hand-offs therefore pass the sentinel id 0, and append-only commits may
//! pass any id.
//!
//! ## Error Handling
//!
//! A failed write or sync latches into the shared state. The consumer
//! discards subsequent work, and the next `flush` (or `shutdown`) returns
//! the latched error. The writer does not retry; the owning store keeps
//! its uncommitted pages, so the caller can restart the pipeline and
//! commit again.
//!
//! ## Ordering Guarantees
//!
//! Pairs submitted by one thread are written in submission order; across
//! threads, in queue-insertion order. After `flush` returns, every write
//! queued before the call is durable.
//!
//! ## Thread Safety
//!
//! `queue_write` and `flush` are safe from any thread. Internal
//! synchronization uses `parking_lot::Mutex` and `Condvar`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use eyre::{bail, eyre, Result, WrapErr};
use parking_lot::{Condvar, Mutex};

use crate::config::WRITER_QUEUE_HIGH_WATER;

use super::backend::PageSink;
use super::page::Page;

/// Counters for monitoring the write pipeline.
#[derive(Debug, Default)]
pub struct WriterStats {
    /// Pages written to the sink.
    pub pages_written: AtomicU64,
    /// Sync barriers completed.
    pub flushes: AtomicU64,
    /// Writes dropped after a failure latched.
    pub discarded_writes: AtomicU64,
    /// Largest queue depth observed at enqueue time.
    pub peak_queue_len: AtomicU64,
}

impl WriterStats {
    fn record_queue_depth(&self, depth: usize) {
        let mut current_max = self.peak_queue_len.load(Ordering::Relaxed);
        while (depth as u64) > current_max {
            match self.peak_queue_len.compare_exchange_weak(
                current_max,
                depth as u64,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current_max = x,
            }
        }
    }
}

enum Command {
    Write { page: Arc<Page>, txn_id: u64 },
    Sync,
}

struct WriterState {
    queue: VecDeque<Command>,
    flush_tickets: u64,
    flushes_done: u64,
    shutdown: bool,
    error: Option<String>,
}

struct WriterShared {
    state: Mutex<WriterState>,
    work_ready: Condvar,
    space_available: Condvar,
    flush_done: Condvar,
    stats: WriterStats,
}

/// Single-consumer write pipeline owning one output sink.
///
/// The sink lives on the consumer thread and is released when the writer
/// shuts down. Dropping the writer without calling [`shutdown`] performs a
/// best-effort drain.
///
/// [`shutdown`]: BackgroundPageWriter::shutdown
pub struct BackgroundPageWriter {
    shared: Arc<WriterShared>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundPageWriter {
    /// Spawns the consumer thread over `sink`.
    pub fn start(sink: Box<dyn PageSink>) -> Result<Self> {
        let shared = Arc::new(WriterShared {
            state: Mutex::new(WriterState {
                queue: VecDeque::with_capacity(WRITER_QUEUE_HIGH_WATER),
                flush_tickets: 0,
                flushes_done: 0,
                shutdown: false,
                error: None,
            }),
            work_ready: Condvar::new(),
            space_available: Condvar::new(),
            flush_done: Condvar::new(),
            stats: WriterStats::default(),
        });

        let consumer_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("quarrydb-page-writer".to_string())
            .spawn(move || Self::run(consumer_shared, sink))
            .wrap_err("failed to spawn background page writer thread")?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Enqueues `page` to be written with `txn_id` recorded on it.
    ///
    /// The writer does not interpret the transaction id; 0 is the
    /// documented sentinel for eviction hand-offs. Blocks while the queue
    /// is at its high-water mark. After a failure has latched the pair is
    /// dropped; the failure surfaces at the next `flush`.
    pub fn queue_write(&self, page: Arc<Page>, txn_id: u64) {
        let mut state = self.shared.state.lock();

        while state.queue.len() >= WRITER_QUEUE_HIGH_WATER && state.error.is_none() {
            self.shared.space_available.wait(&mut state);
        }

        if state.error.is_some() {
            self.shared.stats.discarded_writes.fetch_add(1, Ordering::Relaxed);
            return;
        }

        state.queue.push_back(Command::Write { page, txn_id });
        self.shared.stats.record_queue_depth(state.queue.len());
        drop(state);

        self.shared.work_ready.notify_one();
    }

    /// Durability barrier: blocks until every pair queued before this call
    /// has been written and the sink synced. Surfaces any latched error.
    pub fn flush(&self) -> Result<()> {
        let ticket = {
            let mut state = self.shared.state.lock();
            if let Some(msg) = &state.error {
                bail!("background page writer failed: {}", msg);
            }
            state.queue.push_back(Command::Sync);
            state.flush_tickets += 1;
            state.flush_tickets
        };
        self.shared.work_ready.notify_one();

        let mut state = self.shared.state.lock();
        while state.flushes_done < ticket && state.error.is_none() {
            self.shared.flush_done.wait(&mut state);
        }

        if let Some(msg) = &state.error {
            bail!("background page writer failed: {}", msg);
        }
        Ok(())
    }

    /// Signals end-of-input, drains the queue, syncs, joins the consumer,
    /// and releases the sink. Consuming `self` makes enqueue-after-shutdown
    /// unrepresentable.
    pub fn shutdown(mut self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            state.queue.push_back(Command::Sync);
            state.flush_tickets += 1;
            state.shutdown = true;
        }
        self.shared.work_ready.notify_all();

        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| eyre!("background page writer thread panicked"))?;
        }

        let state = self.shared.state.lock();
        if let Some(msg) = &state.error {
            bail!("background page writer failed: {}", msg);
        }
        Ok(())
    }

    pub fn stats(&self) -> &WriterStats {
        &self.shared.stats
    }

    fn run(shared: Arc<WriterShared>, mut sink: Box<dyn PageSink>) {
        loop {
            let command = {
                let mut state = shared.state.lock();
                loop {
                    if let Some(command) = state.queue.pop_front() {
                        break command;
                    }
                    if state.shutdown {
                        return;
                    }
                    shared.work_ready.wait(&mut state);
                }
            };
            shared.space_available.notify_all();

            match command {
                Command::Write { page, txn_id } => {
                    if shared.state.lock().error.is_some() {
                        shared.stats.discarded_writes.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    match page.write(sink.as_mut(), txn_id) {
                        Ok(()) => {
                            shared.stats.pages_written.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => Self::latch_failure(&shared, err),
                    }
                }
                Command::Sync => {
                    if shared.state.lock().error.is_none() {
                        match sink.sync() {
                            Ok(()) => {
                                shared.stats.flushes.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(err) => Self::latch_failure(&shared, err),
                        }
                    }
                    let mut state = shared.state.lock();
                    state.flushes_done += 1;
                    drop(state);
                    shared.flush_done.notify_all();
                }
            }
        }
    }

    fn latch_failure(shared: &WriterShared, err: eyre::Report) {
        let mut state = shared.state.lock();
        if state.error.is_none() {
            state.error = Some(format!("{err:#}"));
        }
        drop(state);
        shared.flush_done.notify_all();
        shared.space_available.notify_all();
    }
}

impl Drop for BackgroundPageWriter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            {
                let mut state = self.shared.state.lock();
                state.shutdown = true;
            }
            self.shared.work_ready.notify_all();
            let _ = handle.join();
        }
    }
}
