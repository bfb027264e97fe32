//! Motion/trigger boundary.
//!
//! The pipeline consumes a boolean trigger signal plus the still frame that
//! caused it; image analysis itself is an external collaborator's job.
//! `rearm` is called after the warm-up that follows enabling monitoring,
//! so a detector can re-establish its baseline before being trusted.

use anyhow::Result;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One polled observation from the detector.
#[derive(Clone, Debug, Default)]
pub struct TriggerSample {
    pub motion: bool,
    /// JPEG bytes of the frame that fired the trigger, when available.
    pub still: Option<Vec<u8>>,
}

pub trait TriggerSource: Send {
    fn poll(&mut self) -> Result<TriggerSample>;

    /// Reset the detector's baseline. Called when monitoring is (re)armed.
    fn rearm(&mut self) {}
}

/// Scripted trigger: plays back a fixed sequence of samples, then stays
/// quiet. The daemon uses an empty script when no detector is wired up.
#[derive(Default)]
pub struct StubTrigger {
    script: VecDeque<TriggerSample>,
}

impl StubTrigger {
    /// A trigger that never fires.
    pub fn quiet() -> Self {
        Self::default()
    }

    pub fn scripted(samples: Vec<TriggerSample>) -> Self {
        Self {
            script: samples.into(),
        }
    }
}

impl TriggerSource for StubTrigger {
    fn poll(&mut self) -> Result<TriggerSample> {
        Ok(self.script.pop_front().unwrap_or_default())
    }
}

/// Trigger whose state is flipped externally through a shared handle.
/// Used by tests to simulate motion starting and stopping on cue.
pub struct SharedTrigger {
    motion: Arc<AtomicBool>,
    still: Arc<Mutex<Vec<u8>>>,
    rearm_count: Arc<AtomicUsize>,
}

#[derive(Clone)]
pub struct SharedTriggerHandle {
    motion: Arc<AtomicBool>,
    rearm_count: Arc<AtomicUsize>,
}

impl SharedTrigger {
    pub fn new(still: Vec<u8>) -> (Self, SharedTriggerHandle) {
        let motion = Arc::new(AtomicBool::new(false));
        let still = Arc::new(Mutex::new(still));
        let rearm_count = Arc::new(AtomicUsize::new(0));
        let handle = SharedTriggerHandle {
            motion: motion.clone(),
            rearm_count: rearm_count.clone(),
        };
        (
            Self {
                motion,
                still,
                rearm_count,
            },
            handle,
        )
    }
}

impl SharedTriggerHandle {
    pub fn set_motion(&self, motion: bool) {
        self.motion.store(motion, Ordering::SeqCst);
    }

    pub fn rearm_count(&self) -> usize {
        self.rearm_count.load(Ordering::SeqCst)
    }
}

impl TriggerSource for SharedTrigger {
    fn poll(&mut self) -> Result<TriggerSample> {
        let motion = self.motion.load(Ordering::SeqCst);
        let still = if motion {
            self.still.lock().ok().map(|bytes| bytes.clone())
        } else {
            None
        };
        Ok(TriggerSample { motion, still })
    }

    fn rearm(&mut self) {
        self.rearm_count.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_trigger_plays_back_then_goes_quiet() {
        let mut trigger = StubTrigger::scripted(vec![TriggerSample {
            motion: true,
            still: Some(vec![1, 2, 3]),
        }]);
        let first = trigger.poll().unwrap();
        assert!(first.motion);
        assert_eq!(first.still.unwrap(), vec![1, 2, 3]);
        assert!(!trigger.poll().unwrap().motion);
    }

    #[test]
    fn shared_trigger_follows_its_handle() {
        let (mut trigger, handle) = SharedTrigger::new(b"jpeg".to_vec());
        assert!(!trigger.poll().unwrap().motion);
        handle.set_motion(true);
        let sample = trigger.poll().unwrap();
        assert!(sample.motion);
        assert_eq!(sample.still.unwrap(), b"jpeg");
        trigger.rearm();
        assert_eq!(handle.rearm_count(), 1);
    }
}
