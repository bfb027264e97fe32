//! End-to-end pipeline tests: synthetic capture -> orchestrator ->
//! disk + in-memory remote store.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use vigil::config::{IntervalSettings, RemoteSettings};
use vigil::orchestrator::OrchestratorConfig;
use vigil::{
    Destination, FrameIndexedBuffer, MemoryRemoteStore, MonitorControl, RecordingOrchestrator,
    SharedTrigger, SharedTriggerHandle, SyntheticCamera, SyntheticCameraConfig,
};

const DAY_FMT: &str = "%Y-%m-%d";
// Millisecond resolution so windows opened in the same second get
// distinct directories.
const TIME_FMT: &str = "%H.%M.%S%.3f";

struct Harness {
    control: MonitorControl,
    trigger: SharedTriggerHandle,
    store: Arc<MemoryRemoteStore>,
    recordings: tempfile::TempDir,
    camera: SyntheticCamera,
    handle: vigil::OrchestratorHandle,
}

fn start_harness(quiet: Duration, max_event: Duration) -> Harness {
    let buffer = Arc::new(FrameIndexedBuffer::new(1 << 20).unwrap());
    let camera = SyntheticCamera::start(
        buffer.clone(),
        SyntheticCameraConfig {
            fps: 100,
            frame_bytes: 256,
            sync_interval: 5,
        },
    )
    .unwrap();

    let recordings = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryRemoteStore::new());
    let remote_settings = RemoteSettings {
        url: "stub://recordings".to_string(),
        token: String::new(),
        chunk_size: 1024,
        workers: 2,
        max_file_chunks: None,
        retry_attempts: 3,
        retry_backoff: Duration::from_millis(1),
        timeout: Duration::from_secs(1),
        public_key_path: None,
    };

    let (trigger, trigger_handle) = SharedTrigger::new(b"\xff\xd8 trigger frame \xff\xd9".to_vec());
    let control = MonitorControl::new(true);

    let orchestrator = RecordingOrchestrator::new(
        OrchestratorConfig {
            camera_name: "porch".to_string(),
            day_format: DAY_FMT.to_string(),
            time_format: TIME_FMT.to_string(),
            container: "h264".to_string(),
            preroll: Duration::from_secs(1),
            quiet_period: quiet,
            max_event_duration: max_event,
            warmup: Duration::from_millis(30),
            intervals: IntervalSettings {
                tick: Duration::from_millis(10),
                motion_poll: Duration::from_millis(20),
                idle_read: Duration::from_millis(10),
                busy_read: Duration::from_millis(5),
            },
            bulk_read_threshold: 1 << 20,
        },
        buffer,
        Box::new(camera.still_capture()),
        Box::new(trigger),
        vec![
            Destination::Disk {
                root: recordings.path().to_path_buf(),
            },
            Destination::Remote {
                store: store.clone(),
                settings: remote_settings,
                recipient: None,
            },
        ],
        control.clone(),
    )
    .unwrap();

    Harness {
        control,
        trigger: trigger_handle,
        store,
        recordings,
        camera,
        handle: orchestrator.spawn(),
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn recording_dirs(root: &Path) -> Vec<std::path::PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(days) = std::fs::read_dir(root) {
        for day in days.flatten() {
            if let Ok(times) = std::fs::read_dir(day.path()) {
                for time in times.flatten() {
                    dirs.push(time.path());
                }
            }
        }
    }
    dirs.sort();
    dirs
}

#[test]
fn triggers_within_the_quiet_period_share_one_window() {
    let harness = start_harness(Duration::from_millis(250), Duration::from_secs(10));

    // First burst of motion.
    harness.trigger.set_motion(true);
    assert!(wait_until(Duration::from_secs(5), || {
        !recording_dirs(harness.recordings.path()).is_empty()
    }));
    std::thread::sleep(Duration::from_millis(50));
    harness.trigger.set_motion(false);

    // Second burst well inside the quiet period: extends the window
    // instead of opening a second one.
    std::thread::sleep(Duration::from_millis(80));
    harness.trigger.set_motion(true);
    std::thread::sleep(Duration::from_millis(50));
    harness.trigger.set_motion(false);

    // Window closes once the store has committed the video artifact.
    assert!(wait_until(Duration::from_secs(5), || {
        harness
            .store
            .file_paths()
            .iter()
            .any(|path| path.ends_with("video.h264"))
    }));

    harness.control.set_monitoring(false);
    std::thread::sleep(Duration::from_millis(100));

    let dirs = recording_dirs(harness.recordings.path());
    assert_eq!(dirs.len(), 1, "expected one recording, got {:?}", dirs);

    let video_uploads: Vec<_> = harness
        .store
        .file_paths()
        .into_iter()
        .filter(|path| path.ends_with("video.h264"))
        .collect();
    assert_eq!(video_uploads.len(), 1);

    harness.handle.stop().unwrap();
    harness.camera.stop();
}

#[test]
fn both_destinations_receive_identical_artifacts() {
    let harness = start_harness(Duration::from_millis(150), Duration::from_secs(10));

    harness.trigger.set_motion(true);
    std::thread::sleep(Duration::from_millis(120));
    harness.trigger.set_motion(false);

    assert!(wait_until(Duration::from_secs(5), || {
        harness
            .store
            .file_paths()
            .iter()
            .any(|path| path.ends_with("video.h264"))
    }));
    harness.control.set_monitoring(false);
    std::thread::sleep(Duration::from_millis(100));

    let dirs = recording_dirs(harness.recordings.path());
    assert_eq!(dirs.len(), 1);
    let dir = &dirs[0];

    let disk_video = std::fs::read(dir.join("video.h264")).unwrap();
    let disk_still = std::fs::read(dir.join("trigger.jpg")).unwrap();
    assert!(!disk_video.is_empty());
    assert!(disk_still.starts_with(&[0xFF, 0xD8]));

    // The video session fans one byte stream out to both sinks, so the
    // remote copy is byte-identical to the local one.
    let remote_video_path = harness
        .store
        .file_paths()
        .into_iter()
        .find(|path| path.ends_with("video.h264"))
        .unwrap();
    assert!(remote_video_path.starts_with("porch/"));
    assert_eq!(harness.store.file(&remote_video_path).unwrap(), disk_video);

    let remote_still_path = harness
        .store
        .file_paths()
        .into_iter()
        .find(|path| path.ends_with("trigger.jpg"))
        .unwrap();
    assert_eq!(harness.store.file(&remote_still_path).unwrap(), disk_still);

    harness.handle.stop().unwrap();
    harness.camera.stop();
}

#[test]
fn continuous_motion_is_cut_off_at_the_event_deadline() {
    let harness = start_harness(Duration::from_secs(10), Duration::from_millis(300));

    // Motion never stops; only the max-event deadline can close the
    // window. The store only commits files when sessions finalize, so a
    // committed video proves the cutoff fired.
    harness.trigger.set_motion(true);
    assert!(wait_until(Duration::from_secs(5), || {
        harness
            .store
            .file_paths()
            .iter()
            .any(|path| path.ends_with("video.h264"))
    }));

    harness.control.set_monitoring(false);
    harness.handle.stop().unwrap();
    harness.camera.stop();

    assert!(!recording_dirs(harness.recordings.path()).is_empty());
}
