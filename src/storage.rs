//! Recording storage layout and maintenance.
//!
//! Recordings are kept in a directory tree keyed by the trigger timestamp:
//!
//! ```text
//! <recordings_root>/
//!    2024-05-01/           one directory per day
//!       10.15.30/          one directory per triggered recording
//!          trigger.jpg     the still frame that opened the window
//!          video.h264      the saved video, including pre-roll
//! ```
//!
//! Day and time directory names are produced by the configured formats, and
//! only directories that parse back under those formats are treated as
//! recordings; anything else in the tree is left alone.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, NaiveDate, NaiveTime};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Formatted day/time directory names for one recording.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordingKey {
    pub day: String,
    pub time: String,
}

impl RecordingKey {
    pub fn from_timestamp(when: DateTime<Local>, day_format: &str, time_format: &str) -> Self {
        Self {
            day: when.format(day_format).to_string(),
            time: when.format(time_format).to_string(),
        }
    }

    /// Local path of one artifact inside this recording's directory.
    pub fn artifact_path(&self, root: &Path, artifact: &str) -> PathBuf {
        root.join(&self.day).join(&self.time).join(artifact)
    }

    /// Remote destination path: `<camera>/<day>/<time>/<artifact>`.
    pub fn remote_artifact_path(&self, camera_name: &str, artifact: &str) -> String {
        format!("{}/{}/{}/{}", camera_name, self.day, self.time, artifact)
    }
}

/// All recordings of one day, newest time first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DayRecordings {
    pub day: String,
    pub times: Vec<String>,
}

/// List recordings grouped by day, newest day first.
pub fn all_recordings(
    root: &Path,
    day_format: &str,
    time_format: &str,
) -> Result<Vec<DayRecordings>> {
    let mut days = matching_directories(root, |name| {
        NaiveDate::parse_from_str(name, day_format).ok().map(|_| ())
    })?;
    days.sort_by(|a, b| {
        parse_day(a, day_format).cmp(&parse_day(b, day_format)).reverse()
    });

    let mut out = Vec::with_capacity(days.len());
    for day in days {
        let mut times = matching_directories(&root.join(&day), |name| {
            NaiveTime::parse_from_str(name, time_format).ok().map(|_| ())
        })?;
        times.sort_by(|a, b| {
            NaiveTime::parse_from_str(a, time_format)
                .ok()
                .cmp(&NaiveTime::parse_from_str(b, time_format).ok())
                .reverse()
        });
        out.push(DayRecordings { day, times });
    }
    Ok(out)
}

/// Delete one recording (`time` given) or a whole day's tree.
pub fn delete_recording(root: &Path, day: &str, time: Option<&str>) -> Result<()> {
    let mut path = root.join(day);
    if let Some(time) = time {
        path = path.join(time);
    }
    if !path.exists() {
        return Err(anyhow!("recording {} does not exist", path.display()));
    }
    std::fs::remove_dir_all(&path)
        .with_context(|| format!("delete recording {}", path.display()))?;
    Ok(())
}

/// Delete day directories whose date falls strictly before the retention
/// window ending at `now`. Returns the number of days removed.
pub fn enforce_retention(
    root: &Path,
    retention: Duration,
    day_format: &str,
    now: DateTime<Local>,
) -> Result<u32> {
    let cutoff = (now - chrono::Duration::from_std(retention)?).date_naive();
    let days = matching_directories(root, |name| {
        NaiveDate::parse_from_str(name, day_format).ok().map(|_| ())
    })?;

    let mut removed = 0u32;
    for day in days {
        let Some(date) = parse_day(&day, day_format) else {
            continue;
        };
        if date < cutoff {
            std::fs::remove_dir_all(root.join(&day))
                .with_context(|| format!("delete expired recording day {}", day))?;
            log::info!("retention: removed recording day {}", day);
            removed += 1;
        }
    }
    Ok(removed)
}

fn parse_day(name: &str, day_format: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(name, day_format).ok()
}

fn matching_directories(
    path: &Path,
    matches: impl Fn(&str) -> Option<()>,
) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(path)
        .with_context(|| format!("read recordings directory {}", path.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if matches(name).is_some() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const DAY_FMT: &str = "%Y-%m-%d";
    const TIME_FMT: &str = "%H.%M.%S";

    fn make_recording(root: &Path, day: &str, time: &str) {
        std::fs::create_dir_all(root.join(day).join(time)).unwrap();
    }

    #[test]
    fn key_formats_paths_for_disk_and_remote() {
        let when = Local.with_ymd_and_hms(2024, 5, 1, 10, 15, 30).unwrap();
        let key = RecordingKey::from_timestamp(when, DAY_FMT, TIME_FMT);
        assert_eq!(key.day, "2024-05-01");
        assert_eq!(key.time, "10.15.30");
        assert_eq!(
            key.artifact_path(Path::new("recordings"), "video.h264"),
            Path::new("recordings/2024-05-01/10.15.30/video.h264")
        );
        assert_eq!(
            key.remote_artifact_path("porch", "trigger.jpg"),
            "porch/2024-05-01/10.15.30/trigger.jpg"
        );
    }

    #[test]
    fn listing_skips_foreign_directories_and_sorts_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        make_recording(dir.path(), "2024-05-01", "10.15.30");
        make_recording(dir.path(), "2024-05-01", "18.00.00");
        make_recording(dir.path(), "2024-05-02", "07.30.00");
        std::fs::create_dir_all(dir.path().join("not-a-day/extra")).unwrap();

        let listed = all_recordings(dir.path(), DAY_FMT, TIME_FMT).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].day, "2024-05-02");
        assert_eq!(listed[1].day, "2024-05-01");
        assert_eq!(listed[1].times, vec!["18.00.00", "10.15.30"]);
    }

    #[test]
    fn delete_removes_one_recording_or_a_day() {
        let dir = tempfile::tempdir().unwrap();
        make_recording(dir.path(), "2024-05-01", "10.15.30");
        make_recording(dir.path(), "2024-05-01", "18.00.00");

        delete_recording(dir.path(), "2024-05-01", Some("10.15.30")).unwrap();
        assert!(dir.path().join("2024-05-01/18.00.00").exists());

        delete_recording(dir.path(), "2024-05-01", None).unwrap();
        assert!(!dir.path().join("2024-05-01").exists());
        assert!(delete_recording(dir.path(), "2024-05-01", None).is_err());
    }

    #[test]
    fn retention_removes_only_expired_days() {
        let dir = tempfile::tempdir().unwrap();
        make_recording(dir.path(), "2024-04-20", "10.00.00");
        make_recording(dir.path(), "2024-05-01", "10.00.00");
        std::fs::create_dir_all(dir.path().join("keep-me")).unwrap();

        let now = Local.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap();
        let removed =
            enforce_retention(dir.path(), Duration::from_secs(86_400 * 3), DAY_FMT, now).unwrap();
        assert_eq!(removed, 1);
        assert!(!dir.path().join("2024-04-20").exists());
        assert!(dir.path().join("2024-05-01").exists());
        assert!(dir.path().join("keep-me").exists());
    }
}
