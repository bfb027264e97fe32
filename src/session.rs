//! Stream sessions: background tasks that drain a byte source into sinks.
//!
//! A session repeatedly asks its source how much new data is available and
//! forwards every non-empty read, unmodified, to all of its sinks. The two
//! source shapes are explicit variants rather than runtime type checks: a
//! finite source (a captured still frame) reports exhaustion and the
//! session closes itself; a live source (the frame ring) never does, and
//! runs until stopped.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::buffer::{FrameIndexedBuffer, ReadCursor};
use crate::writer::ByteSink;

/// Per-read ceiling for finite sources, so one oversized still frame does
/// not turn into a single giant sink append.
const MAX_FINITE_READ_BYTES: usize = 2_500_000;

/// One-shot source over an in-memory byte blob.
pub struct FiniteSource {
    bytes: Vec<u8>,
    position: usize,
}

impl FiniteSource {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, position: 0 }
    }
}

/// Source over the live frame ring. Owns its cursor; multiple live sources
/// may read the same ring at independent paces without interfering.
pub struct LiveSource {
    buffer: Arc<FrameIndexedBuffer>,
    cursor: ReadCursor,
    bulk_read_threshold: u64,
}

impl LiveSource {
    /// The cursor is computed by the caller (see
    /// [`crate::buffer::compute_start_cursor`]) and handed in explicitly,
    /// so each session's starting point is its own, not shared state.
    pub fn new(buffer: Arc<FrameIndexedBuffer>, cursor: ReadCursor, bulk_read_threshold: u64) -> Self {
        Self {
            buffer,
            cursor,
            bulk_read_threshold,
        }
    }
}

/// Tagged source variant; session behavior is selected by match, and the
/// live arm never closes or truncates the ring it reads.
pub enum ByteSource {
    Finite(FiniteSource),
    Live(LiveSource),
}

impl ByteSource {
    /// Read whatever is newly available. An empty return means "no new
    /// data right now" for a live source and, eventually, exhaustion for a
    /// finite one.
    fn read_since(&mut self) -> Result<Vec<u8>> {
        match self {
            ByteSource::Finite(src) => {
                let remaining = src.bytes.len() - src.position;
                let take = remaining.min(MAX_FINITE_READ_BYTES);
                let out = src.bytes[src.position..src.position + take].to_vec();
                src.position += take;
                Ok(out)
            }
            ByteSource::Live(src) => read_live(src),
        }
    }
}

/// One poll against the ring. Metadata reads and position arithmetic all
/// happen under the buffer lock; for large reads the lock is released
/// before slicing so the producer is not blocked behind the copy.
///
/// A failed lock or missing metadata is treated as "no new data": logged
/// and retried on the next poll rather than tearing the session down.
fn read_live(src: &mut LiveSource) -> Result<Vec<u8>> {
    let view = match src.buffer.locked_view() {
        Ok(view) => view,
        Err(err) => {
            log::warn!("frame ring unavailable, treating as empty poll: {err}");
            return Ok(Vec::new());
        }
    };

    let Some(newest) = view.newest_frame().copied() else {
        return Ok(Vec::new());
    };
    let start_frame = match src.cursor.last_frame_index {
        Some(index) => match view.find_frame(index) {
            Some(frame) => Some(*frame),
            None => {
                // The remembered frame was overwritten between polls. The
                // bytes in between are gone; resume at the oldest frame
                // the ring still holds.
                log::warn!(
                    "cursor frame {} evicted; resuming at oldest retained frame",
                    index
                );
                view.oldest_frame().copied()
            }
        },
        None => view.oldest_frame().copied(),
    };
    let Some(start_frame) = start_frame else {
        return Ok(Vec::new());
    };

    let start = start_frame.position;
    let end = newest.position;
    src.cursor.last_frame_index = Some(newest.index);
    if end <= start {
        return Ok(Vec::new());
    }

    if end - start < src.bulk_read_threshold {
        match view.read_range(start, end) {
            Ok(bytes) => Ok(bytes),
            Err(err) => {
                log::warn!("ring range read failed, treating as empty poll: {err}");
                Ok(Vec::new())
            }
        }
    } else {
        let (snapshot_start, snapshot) = view.snapshot();
        drop(view);
        let from = (start - snapshot_start) as usize;
        let to = (end - snapshot_start) as usize;
        Ok(snapshot[from..to].to_vec())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    /// Close the sinks and end the session once the source reads empty.
    /// Used for finite sources; the live ring never reports exhaustion.
    pub stop_when_empty: bool,
    /// Sleep between polls that found no data.
    pub idle_interval: Duration,
    /// Sleep between polls that found data, to pace a producer that
    /// writes at a known, modest rate.
    pub busy_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            stop_when_empty: false,
            idle_interval: Duration::from_millis(500),
            busy_interval: Duration::from_millis(200),
        }
    }
}

/// A running session. `stop()` is advisory: it is observed at the next
/// loop boundary, after which every sink receives exactly one final
/// append. Callers that need completion wait on `join()` or poll
/// `is_active()`.
pub struct StreamSession {
    name: String,
    stop: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl StreamSession {
    pub fn spawn(
        name: &str,
        mut source: ByteSource,
        mut sinks: Vec<Box<dyn ByteSink>>,
        options: SessionOptions,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicBool::new(true));
        let thread_stop = stop.clone();
        let thread_active = active.clone();
        let thread_name = name.to_string();
        let join = std::thread::spawn(move || {
            match run_session(&thread_name, &mut source, &mut sinks, &options, &thread_stop) {
                Ok(total) => {
                    log::debug!("session {}: processed {} bytes", thread_name, total);
                }
                Err(err) => {
                    // Contained: log, close what we can so no sink is left
                    // with a dangling file or upload session, and end the
                    // thread without touching sibling sessions.
                    log::error!("session {}: {:#}", thread_name, err);
                    for sink in sinks.iter_mut() {
                        if let Err(close_err) = sink.append(&[], true) {
                            log::debug!(
                                "session {}: close after failure: {:#}",
                                thread_name,
                                close_err
                            );
                        }
                    }
                }
            }
            thread_active.store(false, Ordering::SeqCst);
        });
        Self {
            name: name.to_string(),
            stop,
            active,
            join: Some(join),
        }
    }

    /// Request the session to end. Idempotent; a second call is a no-op
    /// and cannot produce a second final delivery.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// True while the session thread is still delivering to its sinks.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the session thread to finish.
    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("session {} thread panicked", self.name);
            }
        }
    }
}

fn run_session(
    name: &str,
    source: &mut ByteSource,
    sinks: &mut [Box<dyn ByteSink>],
    options: &SessionOptions,
    stop: &AtomicBool,
) -> Result<u64> {
    let mut total = 0u64;
    loop {
        let bytes = source.read_since()?;
        total += bytes.len() as u64;

        // Computed once per iteration so every sink sees the same signal,
        // and the loop always performs the appends for its final pass.
        let stopping =
            stop.load(Ordering::SeqCst) || (options.stop_when_empty && bytes.is_empty());
        for sink in sinks.iter_mut() {
            sink.append(&bytes, stopping)?;
        }
        if !bytes.is_empty() {
            log::trace!("session {}: read {} bytes", name, bytes.len());
        }
        if stopping {
            return Ok(total);
        }
        std::thread::sleep(if bytes.is_empty() {
            options.idle_interval
        } else {
            options.busy_interval
        });
    }
}
