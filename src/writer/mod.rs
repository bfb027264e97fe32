//! Byte sinks: the destination side of the delivery pipeline.
//!
//! A sink receives the raw byte stream a session reads out of its source.
//! Durable sinks must see every byte, in order, exactly once, and then a
//! single final append; transient sinks are best-effort and carry no
//! delivery guarantee (they exist for live viewing).

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Durability {
    /// Every byte, in order, exactly once, then finalize.
    Durable,
    /// Best effort, latest wins. Exempt from delivery guarantees.
    Transient,
}

/// Destination abstraction fed by a [`crate::session::StreamSession`].
///
/// `append` is called with every non-empty read, unmodified, and exactly
/// once with `is_final = true` (possibly with empty bytes) when the stream
/// ends. After the final append the sink must not be used again.
pub trait ByteSink: Send {
    fn append(&mut self, bytes: &[u8], is_final: bool) -> Result<()>;

    fn durability(&self) -> Durability {
        Durability::Durable
    }
}

/// Durable sink that appends to a file on the local filesystem.
///
/// Parent directories are created on demand. Construction fails if the
/// path cannot be opened for appending; that failure is surfaced once, at
/// session start, so sibling destinations can still proceed.
pub struct DiskSink {
    path: PathBuf,
    file: Option<File>,
}

impl DiskSink {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create recording directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open recording file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }
}

impl ByteSink for DiskSink {
    fn append(&mut self, bytes: &[u8], is_final: bool) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(anyhow::anyhow!(
                "disk sink {} already finalized",
                self.path.display()
            ));
        };
        if !bytes.is_empty() {
            file.write_all(bytes)
                .with_context(|| format!("write to {}", self.path.display()))?;
        }
        if is_final {
            file.flush()
                .with_context(|| format!("flush {}", self.path.display()))?;
            self.file = None;
            log::debug!("closed recording file {}", self.path.display());
        }
        Ok(())
    }
}

/// Shared cell holding the most recent payload written through a
/// [`LatestSink`]. Viewers read it at their own pace; stale data is
/// overwritten without ever blocking the writer on a slow reader.
#[derive(Clone, Default)]
pub struct LatestCell {
    slot: Arc<Mutex<Option<Vec<u8>>>>,
}

impl LatestCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Option<Vec<u8>> {
        self.slot.lock().ok().and_then(|mut slot| slot.take())
    }

    pub fn peek(&self) -> Option<Vec<u8>> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }
}

/// Transient sink for live viewing: keeps only the latest payload.
pub struct LatestSink {
    cell: LatestCell,
}

impl LatestSink {
    pub fn new(cell: LatestCell) -> Self {
        Self { cell }
    }
}

impl ByteSink for LatestSink {
    fn append(&mut self, bytes: &[u8], _is_final: bool) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if let Ok(mut slot) = self.cell.slot.lock() {
            *slot = Some(bytes.to_vec());
        }
        Ok(())
    }

    fn durability(&self) -> Durability {
        Durability::Transient
    }
}
