//! Frame-indexed circular buffer.
//!
//! This module holds the one resource in the pipeline that is mutated by a
//! party outside its control: the capture producer appends encoded video
//! into a fixed-capacity byte ring, tagging byte positions with frame
//! metadata. Everything a reader does with that metadata happens under the
//! buffer's shared lock, because a concurrent append can evict the very
//! bytes a position points at.
//!
//! Positions are absolute stream offsets that grow for the lifetime of the
//! buffer. Wrap-around does not renumber them; it makes old ones
//! unreadable. The retained window is `[head, tail)`, and a range read
//! outside that window fails instead of returning overwritten bytes.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Metadata for one encoded frame as observed by the producer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRecord {
    /// Monotonic, producer-assigned index. Never reused.
    pub index: u64,
    /// Absolute stream offset where the frame's bytes begin.
    pub position: u64,
    /// Capture timestamp in microseconds since the epoch.
    pub timestamp_micros: u64,
    /// True if a decoder can start from this frame without earlier context.
    pub is_sync_point: bool,
}

/// Read position owned by exactly one live session. Never regresses.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReadCursor {
    pub last_frame_index: Option<u64>,
}

struct RingInner {
    data: Vec<u8>,
    capacity: usize,
    /// Absolute offset of the oldest retained byte.
    head: u64,
    /// Absolute offset one past the newest byte (total bytes ever written).
    tail: u64,
    frames: VecDeque<FrameRecord>,
    next_index: u64,
}

/// Fixed-capacity byte ring with frame metadata and a shared lock.
///
/// The producer appends through [`FrameIndexedBuffer::append_frame`];
/// readers take a [`BufferView`] and must hold it for the entire duration
/// of any metadata read or position arithmetic. The view is a mutex guard,
/// so holding it blocks the producer; release it before slow work.
pub struct FrameIndexedBuffer {
    inner: Mutex<RingInner>,
}

impl FrameIndexedBuffer {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(anyhow!("frame buffer capacity must be > 0"));
        }
        Ok(Self {
            inner: Mutex::new(RingInner {
                data: vec![0u8; capacity],
                capacity,
                head: 0,
                tail: 0,
                frames: VecDeque::new(),
                next_index: 0,
            }),
        })
    }

    /// Producer-side append. Writes one frame's bytes and records its
    /// metadata, evicting the oldest bytes and any frame records whose data
    /// is no longer fully retained. Returns the assigned frame index.
    pub fn append_frame(
        &self,
        bytes: &[u8],
        timestamp_micros: u64,
        is_sync_point: bool,
    ) -> Result<u64> {
        let mut inner = self.lock()?;
        if bytes.len() > inner.capacity {
            return Err(anyhow!(
                "frame of {} bytes exceeds ring capacity {}",
                bytes.len(),
                inner.capacity
            ));
        }

        let index = inner.next_index;
        inner.next_index += 1;
        let position = inner.tail;
        inner.frames.push_back(FrameRecord {
            index,
            position,
            timestamp_micros,
            is_sync_point,
        });

        inner.write_bytes(bytes);
        inner.evict_stale_frames();
        Ok(index)
    }

    /// Locked view for readers. All metadata reads and range reads for one
    /// poll must happen through a single view.
    pub fn locked_view(&self) -> Result<BufferView<'_>> {
        Ok(BufferView { guard: self.lock()? })
    }

    fn lock(&self) -> Result<MutexGuard<'_, RingInner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("frame buffer lock poisoned"))
    }
}

impl RingInner {
    fn write_bytes(&mut self, bytes: &[u8]) {
        let start = (self.tail % self.capacity as u64) as usize;
        let first = bytes.len().min(self.capacity - start);
        self.data[start..start + first].copy_from_slice(&bytes[..first]);
        if first < bytes.len() {
            self.data[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        }
        self.tail += bytes.len() as u64;
        if self.tail - self.head > self.capacity as u64 {
            self.head = self.tail - self.capacity as u64;
        }
    }

    fn evict_stale_frames(&mut self) {
        while let Some(front) = self.frames.front() {
            if front.position < self.head {
                self.frames.pop_front();
            } else {
                break;
            }
        }
    }

    fn copy_range(&self, start: u64, end: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity((end - start) as usize);
        let from = (start % self.capacity as u64) as usize;
        let len = (end - start) as usize;
        let first = len.min(self.capacity - from);
        out.extend_from_slice(&self.data[from..from + first]);
        if first < len {
            out.extend_from_slice(&self.data[..len - first]);
        }
        out
    }
}

/// A mutex-guarded read view over the ring.
pub struct BufferView<'a> {
    guard: MutexGuard<'a, RingInner>,
}

impl BufferView<'_> {
    /// Frames in order, oldest first.
    pub fn frames(&self) -> impl Iterator<Item = &FrameRecord> {
        self.guard.frames.iter()
    }

    pub fn oldest_frame(&self) -> Option<&FrameRecord> {
        self.guard.frames.front()
    }

    pub fn newest_frame(&self) -> Option<&FrameRecord> {
        self.guard.frames.back()
    }

    pub fn find_frame(&self, index: u64) -> Option<&FrameRecord> {
        self.guard.frames.iter().find(|f| f.index == index)
    }

    /// Retained byte window as `(head, tail)` absolute offsets.
    pub fn retained(&self) -> (u64, u64) {
        (self.guard.head, self.guard.tail)
    }

    /// Copy `[start, end)` out of the ring. Fails if any part of the range
    /// has been overwritten since the offsets were observed.
    pub fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        if start > end {
            return Err(anyhow!("invalid range: start {} past end {}", start, end));
        }
        if start < self.guard.head || end > self.guard.tail {
            return Err(anyhow!(
                "range [{}, {}) outside retained window [{}, {})",
                start,
                end,
                self.guard.head,
                self.guard.tail
            ));
        }
        Ok(self.guard.copy_range(start, end))
    }

    /// Bulk copy of the whole retained window, returned with its starting
    /// offset. Used instead of a targeted range read when the estimated
    /// read is large: one memcpy under the lock, slicing after release.
    pub fn snapshot(&self) -> (u64, Vec<u8>) {
        let bytes = self.guard.copy_range(self.guard.head, self.guard.tail);
        (self.guard.head, bytes)
    }
}

/// Select the starting cursor for a recording that should include pre-roll
/// video from before the trigger.
///
/// Scans oldest to newest and picks the last sync-point frame whose
/// timestamp is at or before `start_time_micros`; if no sync point
/// qualifies, the oldest available frame is used so the recording starts
/// with whatever history the ring still holds.
pub fn compute_start_cursor(view: &BufferView<'_>, start_time_micros: u64) -> ReadCursor {
    let mut chosen: Option<&FrameRecord> = None;
    for frame in view.frames() {
        if frame.is_sync_point && frame.timestamp_micros <= start_time_micros {
            chosen = Some(frame);
        }
    }
    let chosen = chosen.or_else(|| view.oldest_frame());
    ReadCursor {
        last_frame_index: chosen.map(|f| f.index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with_frames(capacity: usize, frames: &[(&[u8], u64, bool)]) -> FrameIndexedBuffer {
        let buf = FrameIndexedBuffer::new(capacity).unwrap();
        for (bytes, ts, sync) in frames {
            buf.append_frame(bytes, *ts, *sync).unwrap();
        }
        buf
    }

    #[test]
    fn append_assigns_monotonic_indices_and_positions() {
        let buf = FrameIndexedBuffer::new(64).unwrap();
        let a = buf.append_frame(b"aaaa", 1, true).unwrap();
        let b = buf.append_frame(b"bbbb", 2, false).unwrap();
        assert_eq!((a, b), (0, 1));

        let view = buf.locked_view().unwrap();
        let frames: Vec<_> = view.frames().copied().collect();
        assert_eq!(frames[0].position, 0);
        assert_eq!(frames[1].position, 4);
        assert_eq!(view.retained(), (0, 8));
    }

    #[test]
    fn wrap_evicts_oldest_frames() {
        let buf = buffer_with_frames(
            10,
            &[(b"aaaa", 1, true), (b"bbbb", 2, false), (b"cccc", 3, false)],
        );
        let view = buf.locked_view().unwrap();
        // 12 bytes through a 10-byte ring: frame 0's data is gone.
        assert_eq!(view.oldest_frame().unwrap().index, 1);
        assert_eq!(view.retained(), (2, 12));
        assert!(view.read_range(0, 4).is_err());
        assert_eq!(view.read_range(4, 12).unwrap(), b"bbbbcccc");
    }

    #[test]
    fn snapshot_matches_range_read() {
        let buf = buffer_with_frames(8, &[(b"abcd", 1, true), (b"efgh", 2, false), (b"ij", 3, false)]);
        let view = buf.locked_view().unwrap();
        let (head, bytes) = view.snapshot();
        let (h, t) = view.retained();
        assert_eq!(head, h);
        assert_eq!(bytes, view.read_range(h, t).unwrap());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let buf = FrameIndexedBuffer::new(4).unwrap();
        assert!(buf.append_frame(b"too big", 1, true).is_err());
    }

    #[test]
    fn start_cursor_picks_last_sync_point_at_or_before_start_time() {
        // Frames 0..=5 stamped T-2 ..= T+3 with T = 10.
        let buf = FrameIndexedBuffer::new(1024).unwrap();
        for i in 0..6u64 {
            buf.append_frame(b"xx", 8 + i, true).unwrap();
        }
        let view = buf.locked_view().unwrap();
        assert_eq!(compute_start_cursor(&view, 10).last_frame_index, Some(2));
        assert_eq!(compute_start_cursor(&view, 8).last_frame_index, Some(0));
    }

    #[test]
    fn start_cursor_falls_back_to_oldest_frame() {
        let buf = buffer_with_frames(64, &[(b"aa", 100, false), (b"bb", 101, true)]);
        let view = buf.locked_view().unwrap();
        // No sync point at or before t=50: start from the oldest frame.
        assert_eq!(compute_start_cursor(&view, 50).last_frame_index, Some(0));
    }

    #[test]
    fn start_cursor_on_empty_buffer_is_unset() {
        let buf = FrameIndexedBuffer::new(16).unwrap();
        let view = buf.locked_view().unwrap();
        assert_eq!(compute_start_cursor(&view, 0).last_frame_index, None);
    }
}
