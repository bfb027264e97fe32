//! Durable chunked uploader for the remote store.
//!
//! `ChunkedRemoteWriter` is a [`ByteSink`]: the session side hands it the
//! raw byte stream and it accumulates, slices fixed-size chunks, optionally
//! encrypts them, and fans completed chunks out to a small pool of uploader
//! workers. Each worker drives the remote resumable-session protocol for
//! the logical files assigned to it.
//!
//! Ordering invariant: remote appends are offset-based, so one logical
//! file's chunks must arrive in sequence. The writer therefore assigns a
//! whole logical file to a single worker's queue; workers only ever run in
//! parallel across *different* logical files (which exist when the writer
//! is configured to split its output into numbered files).

use anyhow::{anyhow, Result};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::remote::crypto::{FileEncryptor, RecipientPublicKey};
use crate::remote::{RemoteStore, RemoteStoreError};
use crate::writer::{ByteSink, Durability};

/// One bounded slice of a logical file, immutable once handed to a worker.
#[derive(Debug)]
pub struct Chunk {
    /// Sequence within the logical file, starting at 0. Chunks reach the
    /// remote session in exactly this order, with no gaps or repeats.
    pub sequence: u64,
    pub bytes: Vec<u8>,
    /// Marks the last chunk of its logical file.
    pub is_final: bool,
}

/// Bookkeeping for one open remote session. Created when a file's first
/// chunk starts the session, discarded when the final chunk commits it.
struct UploadSession {
    remote_session_id: String,
    committed_offset: u64,
    destination_path: String,
}

#[derive(Clone, Debug)]
pub struct RemoteWriterConfig {
    /// Fixed chunk size in bytes.
    pub chunk_size: usize,
    /// Number of uploader workers.
    pub workers: usize,
    /// When set, close the current logical file after this many chunks and
    /// continue into a new numbered file (`video0.h264`, `video1.h264`, …).
    pub max_file_chunks: Option<u64>,
    /// Attempts per remote call before the failure is surfaced.
    pub retry_attempts: u32,
    /// Sleep between attempts.
    pub retry_backoff: Duration,
}

impl Default for RemoteWriterConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4 * 1024 * 1024,
            workers: 2,
            max_file_chunks: None,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

struct UploadJob {
    path: String,
    chunk: Chunk,
}

struct Worker {
    tx: Sender<UploadJob>,
    join: JoinHandle<()>,
}

/// Durable sink that delivers the byte stream to the remote store in
/// fixed-size chunks. `append(_, is_final = true)` drains and joins the
/// worker pool before returning, so a caller that has seen the final
/// append return has seen the uploads settle.
pub struct ChunkedRemoteWriter {
    destination_path: String,
    config: RemoteWriterConfig,
    recipient: Option<RecipientPublicKey>,
    pool: Vec<u8>,
    workers: Vec<Worker>,
    /// Worker owning the logical file currently being produced.
    current_worker: usize,
    file_index: u64,
    sequence: u64,
    encryptor: Option<FileEncryptor>,
    closed: bool,
}

impl ChunkedRemoteWriter {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        destination_path: &str,
        recipient: Option<RecipientPublicKey>,
        config: RemoteWriterConfig,
    ) -> Result<Self> {
        if config.chunk_size == 0 {
            return Err(anyhow!("remote chunk size must be > 0"));
        }
        if config.workers == 0 {
            return Err(anyhow!("remote writer needs at least one worker"));
        }
        if config.retry_attempts == 0 {
            return Err(anyhow!("remote retry attempts must be > 0"));
        }

        let mut workers = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            let (tx, rx) = mpsc::channel::<UploadJob>();
            let worker_store = store.clone();
            let attempts = config.retry_attempts;
            let backoff = config.retry_backoff;
            let join = std::thread::spawn(move || {
                run_worker(worker_id, worker_store, attempts, backoff, rx);
            });
            workers.push(Worker { tx, join });
        }

        Ok(Self {
            destination_path: destination_path.to_string(),
            config,
            recipient,
            pool: Vec::new(),
            workers,
            current_worker: 0,
            file_index: 0,
            sequence: 0,
            encryptor: None,
            closed: false,
        })
    }

    fn current_file_path(&self) -> String {
        if self.config.max_file_chunks.is_none() {
            return self.destination_path.clone();
        }
        numbered_path(&self.destination_path, self.file_index)
    }

    /// Hand one plaintext chunk to the current file's worker. Handles file
    /// start (fresh encryption envelope, worker assignment) and file end
    /// (rollover into the next numbered file).
    fn dispatch_chunk(&mut self, plaintext: Vec<u8>, stream_final: bool) -> Result<()> {
        if self.sequence == 0 {
            self.current_worker = (self.file_index as usize) % self.workers.len();
            if let Some(recipient) = &self.recipient {
                self.encryptor = Some(FileEncryptor::new(recipient)?);
            }
        }

        let bytes = match &self.encryptor {
            Some(encryptor) => {
                let mut sealed = if self.sequence == 0 {
                    encryptor.key_header()
                } else {
                    Vec::new()
                };
                sealed.extend(encryptor.seal_record(self.sequence, &plaintext)?);
                sealed
            }
            None => plaintext,
        };

        let file_full = self
            .config
            .max_file_chunks
            .is_some_and(|max| self.sequence + 1 >= max);
        let file_final = stream_final || file_full;

        let job = UploadJob {
            path: self.current_file_path(),
            chunk: Chunk {
                sequence: self.sequence,
                bytes,
                is_final: file_final,
            },
        };
        self.workers[self.current_worker]
            .tx
            .send(job)
            .map_err(|_| anyhow!("uploader worker {} is gone", self.current_worker))?;

        if file_final {
            self.file_index += 1;
            self.sequence = 0;
            self.encryptor = None;
        } else {
            self.sequence += 1;
        }
        Ok(())
    }

    /// Drop the work queues and wait for the workers to drain.
    fn shut_down_workers(&mut self) {
        for worker in self.workers.drain(..) {
            drop(worker.tx);
            if worker.join.join().is_err() {
                log::error!("uploader worker thread panicked");
            }
        }
    }
}

impl ByteSink for ChunkedRemoteWriter {
    fn append(&mut self, bytes: &[u8], is_final: bool) -> Result<()> {
        if self.closed {
            return Err(anyhow!(
                "remote writer for {} already closed",
                self.destination_path
            ));
        }
        self.pool.extend_from_slice(bytes);

        while self.pool.len() >= self.config.chunk_size {
            let rest = self.pool.split_off(self.config.chunk_size);
            let chunk = std::mem::replace(&mut self.pool, rest);
            self.dispatch_chunk(chunk, false)?;
        }

        if is_final {
            let remainder = std::mem::take(&mut self.pool);
            self.dispatch_chunk(remainder, true)?;
            self.closed = true;
            self.shut_down_workers();
        }
        Ok(())
    }

    fn durability(&self) -> Durability {
        Durability::Durable
    }
}

impl Drop for ChunkedRemoteWriter {
    fn drop(&mut self) {
        if !self.closed && !self.workers.is_empty() {
            log::warn!(
                "remote writer for {} dropped without a final append",
                self.destination_path
            );
        }
        self.shut_down_workers();
    }
}

/// Insert the file counter before the extension: `a/video.h264` with index
/// 1 becomes `a/video1.h264`.
fn numbered_path(path: &str, index: u64) -> String {
    match path.rfind('.') {
        Some(dot) if !path[dot + 1..].contains('/') => {
            format!("{}{}{}", &path[..dot], index, &path[dot..])
        }
        _ => format!("{}{}", path, index),
    }
}

fn run_worker(
    worker_id: usize,
    store: Arc<dyn RemoteStore>,
    retry_attempts: u32,
    retry_backoff: Duration,
    rx: Receiver<UploadJob>,
) {
    let mut session: Option<UploadSession> = None;
    // After retries are exhausted for a file, the rest of its queue is
    // skipped so one bad file cannot wedge the worker.
    let mut failed_path: Option<String> = None;

    while let Ok(job) = rx.recv() {
        if failed_path.as_deref() == Some(job.path.as_str()) {
            if job.chunk.is_final {
                failed_path = None;
            }
            continue;
        }

        match handle_chunk(
            store.as_ref(),
            retry_attempts,
            retry_backoff,
            &mut session,
            &job,
        ) {
            Ok(()) => {
                if job.chunk.is_final {
                    log::debug!("uploader {}: committed {}", worker_id, job.path);
                }
            }
            Err(err) => {
                log::error!(
                    "uploader {}: giving up on {} at chunk {}: {:#}",
                    worker_id,
                    job.path,
                    job.chunk.sequence,
                    err
                );
                session = None;
                if !job.chunk.is_final {
                    failed_path = Some(job.path.clone());
                }
            }
        }
    }
}

fn handle_chunk(
    store: &dyn RemoteStore,
    retry_attempts: u32,
    retry_backoff: Duration,
    session: &mut Option<UploadSession>,
    job: &UploadJob,
) -> Result<()> {
    let chunk = &job.chunk;
    match session.take() {
        None => {
            if chunk.sequence != 0 {
                return Err(anyhow!(
                    "chunk {} for {} arrived without an open session",
                    chunk.sequence,
                    job.path
                ));
            }
            if chunk.is_final {
                // First and last chunk: the whole file fits in one call.
                with_retries(retry_attempts, retry_backoff, "upload_whole", || {
                    store.upload_whole(&chunk.bytes, &job.path)
                })?;
            } else {
                let session_id =
                    with_retries(retry_attempts, retry_backoff, "start_session", || {
                        store.start_session(&chunk.bytes)
                    })?;
                *session = Some(UploadSession {
                    remote_session_id: session_id,
                    committed_offset: chunk.bytes.len() as u64,
                    destination_path: job.path.clone(),
                });
            }
        }
        Some(mut open) => {
            if open.destination_path != job.path {
                return Err(anyhow!(
                    "chunk for {} arrived while session for {} is open",
                    job.path,
                    open.destination_path
                ));
            }
            if chunk.is_final {
                with_retries(retry_attempts, retry_backoff, "finish_session", || {
                    store.finish_session(
                        &open.remote_session_id,
                        &chunk.bytes,
                        open.committed_offset,
                        &job.path,
                    )
                })?;
            } else {
                with_retries(retry_attempts, retry_backoff, "append_to_session", || {
                    store.append_to_session(
                        &open.remote_session_id,
                        &chunk.bytes,
                        open.committed_offset,
                    )
                })?;
                open.committed_offset += chunk.bytes.len() as u64;
                *session = Some(open);
            }
        }
    }
    Ok(())
}

fn with_retries<T>(
    attempts: u32,
    backoff: Duration,
    operation: &'static str,
    call: impl Fn() -> Result<T, RemoteStoreError>,
) -> Result<T> {
    let mut attempt = 1u32;
    loop {
        match call() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < attempts => {
                log::warn!(
                    "remote {} failed (attempt {}/{}), retrying: {}",
                    operation,
                    attempt,
                    attempts,
                    err
                );
                attempt += 1;
                std::thread::sleep(backoff);
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::crypto::{generate_keypair, FileDecryptor};
    use crate::remote::MemoryRemoteStore;
    use std::io::Cursor;

    fn test_config(chunk_size: usize) -> RemoteWriterConfig {
        RemoteWriterConfig {
            chunk_size,
            workers: 2,
            max_file_chunks: None,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(1),
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn single_file_arrives_intact() {
        let store = Arc::new(MemoryRemoteStore::new());
        let data = payload(10_500);
        let mut writer =
            ChunkedRemoteWriter::new(store.clone(), "cam/video.h264", None, test_config(4_000))
                .unwrap();
        for piece in data.chunks(1_000) {
            writer.append(piece, false).unwrap();
        }
        writer.append(&[], true).unwrap();

        assert_eq!(store.file("cam/video.h264").unwrap(), data);
        assert_eq!(store.open_session_count(), 0);
    }

    #[test]
    fn chunk_count_is_input_length_over_chunk_size() {
        let chunk_size = 4_000usize;
        for len in [1usize, 3_999, 4_000, 4_001, 10_500] {
            let store = Arc::new(MemoryRemoteStore::new());
            let mut writer =
                ChunkedRemoteWriter::new(store.clone(), "cam/clip.bin", None, test_config(chunk_size))
                    .unwrap();
            writer.append(&payload(len), false).unwrap();
            writer.append(&[], true).unwrap();

            let expected = len.div_ceil(chunk_size) as u32;
            assert_eq!(
                store.nonempty_payload_count(),
                expected,
                "input length {}",
                len
            );
        }
    }

    #[test]
    fn empty_stream_still_produces_a_file() {
        let store = Arc::new(MemoryRemoteStore::new());
        let mut writer =
            ChunkedRemoteWriter::new(store.clone(), "cam/trigger.jpg", None, test_config(4_000))
                .unwrap();
        writer.append(&[], true).unwrap();
        assert_eq!(store.file("cam/trigger.jpg").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn small_file_uses_single_shot_upload() {
        let store = Arc::new(MemoryRemoteStore::new());
        let mut writer =
            ChunkedRemoteWriter::new(store.clone(), "cam/trigger.jpg", None, test_config(1 << 20))
                .unwrap();
        writer.append(b"jpeg bytes", true).unwrap();
        assert_eq!(store.file("cam/trigger.jpg").unwrap(), b"jpeg bytes");
        assert_eq!(store.open_session_count(), 0);
    }

    #[test]
    fn file_splitting_produces_numbered_files_partitioning_the_stream() {
        let store = Arc::new(MemoryRemoteStore::new());
        let mut config = test_config(1_000);
        config.max_file_chunks = Some(2);
        let data = payload(4_500);
        let mut writer =
            ChunkedRemoteWriter::new(store.clone(), "cam/video.h264", None, config).unwrap();
        writer.append(&data, false).unwrap();
        writer.append(&[], true).unwrap();

        assert_eq!(
            store.file_paths(),
            vec!["cam/video0.h264", "cam/video1.h264", "cam/video2.h264"]
        );
        let mut combined = Vec::new();
        for path in store.file_paths() {
            combined.extend(store.file(&path).unwrap());
        }
        assert_eq!(combined, data);
    }

    #[test]
    fn transient_failures_are_retried() {
        let store = Arc::new(MemoryRemoteStore::new());
        store.inject_failures(2);
        let mut writer =
            ChunkedRemoteWriter::new(store.clone(), "cam/video.h264", None, test_config(100))
                .unwrap();
        writer.append(&payload(350), false).unwrap();
        writer.append(&[], true).unwrap();
        assert_eq!(store.file("cam/video.h264").unwrap(), payload(350));
    }

    #[test]
    fn retry_exhaustion_drops_the_file_without_wedging_the_writer() {
        let store = Arc::new(MemoryRemoteStore::new());
        store.inject_failures(50);
        let mut writer =
            ChunkedRemoteWriter::new(store.clone(), "cam/video.h264", None, test_config(100))
                .unwrap();
        writer.append(&payload(350), false).unwrap();
        writer.append(&[], true).unwrap();
        assert!(store.file("cam/video.h264").is_none());
    }

    #[test]
    fn encrypted_stream_round_trips_through_the_store() {
        let (public, secret) = generate_keypair();
        let store = Arc::new(MemoryRemoteStore::new());
        let data = payload(50_000);
        let mut writer = ChunkedRemoteWriter::new(
            store.clone(),
            "cam/video.h264",
            Some(public),
            test_config(8_000),
        )
        .unwrap();
        for piece in data.chunks(3_000) {
            writer.append(piece, false).unwrap();
        }
        writer.append(&[], true).unwrap();

        let sealed = store.file("cam/video.h264").unwrap();
        assert_ne!(sealed, data);
        let mut plain = Vec::new();
        FileDecryptor::decrypt_stream(&secret, &mut Cursor::new(sealed), &mut plain).unwrap();
        assert_eq!(plain, data);
    }

    #[test]
    fn encrypted_split_files_decrypt_independently() {
        let (public, secret) = generate_keypair();
        let store = Arc::new(MemoryRemoteStore::new());
        let mut config = test_config(1_000);
        config.max_file_chunks = Some(3);
        let data = payload(5_000);
        let mut writer =
            ChunkedRemoteWriter::new(store.clone(), "cam/video.h264", Some(public), config)
                .unwrap();
        writer.append(&data, false).unwrap();
        writer.append(&[], true).unwrap();

        let mut combined = Vec::new();
        for path in store.file_paths() {
            let sealed = store.file(&path).unwrap();
            FileDecryptor::decrypt_stream(&secret, &mut Cursor::new(sealed), &mut combined)
                .unwrap();
        }
        assert_eq!(combined, data);
    }

    #[test]
    fn numbered_path_inserts_before_extension() {
        assert_eq!(numbered_path("a/video.h264", 0), "a/video0.h264");
        assert_eq!(numbered_path("a/video.h264", 12), "a/video12.h264");
        assert_eq!(numbered_path("a/raw", 3), "a/raw3");
        assert_eq!(numbered_path("a.b/raw", 3), "a.b/raw3");
    }

    #[test]
    fn append_after_close_is_rejected() {
        let store = Arc::new(MemoryRemoteStore::new());
        let mut writer =
            ChunkedRemoteWriter::new(store, "cam/video.h264", None, test_config(100)).unwrap();
        writer.append(b"x", true).unwrap();
        assert!(writer.append(b"y", false).is_err());
    }
}
