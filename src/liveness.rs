//! Liveness signal for an external supervisor.
//!
//! The poll loop stamps a heartbeat file after every successful cycle; the
//! `--healthcheck` mode of the binary reads it back and exits non-zero once the
//! stamp is older than the threshold, so the supervisor can restart us.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_THRESHOLD_MINUTES: i64 = 30;

/// Has a poll succeeded within `threshold` of `now`? Never succeeded means not alive.
pub fn is_alive(last_success: Option<DateTime<Utc>>, now: DateTime<Utc>, threshold: Duration) -> bool {
    match last_success {
        Some(ts) => now - ts <= threshold,
        None => false,
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatFile {
    path: PathBuf,
}

impl HeartbeatFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        HeartbeatFile { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the stamp via write-then-rename so readers never see a torn file.
    pub fn record(&self, at: DateTime<Utc>) -> io::Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, at.to_rfc3339_opts(SecondsFormat::Secs, true))?;
        fs::rename(&tmp, &self.path)
    }

    /// `Ok(None)` when no poll has ever been recorded.
    pub fn read(&self) -> Result<Option<DateTime<Utc>>, String> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("failed to read {}: {}", self.path.display(), e)),
        };
        DateTime::parse_from_rfc3339(text.trim())
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| format!("{} does not hold a timestamp: {}", self.path.display(), e))
    }
}

/// Evaluate the heartbeat. `Ok` carries a healthy message, `Err` the reason to restart.
pub fn check(heartbeat: &HeartbeatFile, now: DateTime<Utc>, threshold: Duration) -> Result<String, String> {
    let last = heartbeat.read()?;
    if is_alive(last, now, threshold) {
        let age = last.map(|ts| now - ts).unwrap_or_else(Duration::zero);
        Ok(format!(
            "last successful poll {}s ago (threshold {}m) -> healthy",
            age.num_seconds(),
            threshold.num_minutes()
        ))
    } else {
        match last {
            Some(ts) => Err(format!(
                "last successful poll at {} is older than {}m -> unhealthy",
                ts.to_rfc3339_opts(SecondsFormat::Secs, true),
                threshold.num_minutes()
            )),
            None => Err(format!(
                "no successful poll recorded in {} -> unhealthy",
                heartbeat.path().display()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn threshold() -> Duration {
        Duration::minutes(DEFAULT_THRESHOLD_MINUTES)
    }

    #[test]
    fn predicate_respects_threshold() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        assert!(is_alive(Some(now - Duration::minutes(5)), now, threshold()));
        assert!(is_alive(Some(now - Duration::minutes(30)), now, threshold()));
        assert!(!is_alive(Some(now - Duration::minutes(31)), now, threshold()));
        assert!(!is_alive(None, now, threshold()));
        // clock skew: a stamp slightly in the future still counts
        assert!(is_alive(Some(now + Duration::seconds(10)), now, threshold()));
    }

    #[test]
    fn heartbeat_round_trip_and_check() {
        let dir = tempfile::tempdir().unwrap();
        let hb = HeartbeatFile::new(dir.path().join("alive"));
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

        assert_eq!(hb.read().unwrap(), None);
        assert!(check(&hb, now, threshold()).is_err());

        hb.record(now - Duration::minutes(10)).unwrap();
        assert_eq!(hb.read().unwrap(), Some(now - Duration::minutes(10)));
        assert!(check(&hb, now, threshold()).is_ok());

        let later = now + Duration::hours(1);
        let err = check(&hb, later, threshold()).unwrap_err();
        assert!(err.contains("unhealthy"));
    }

    #[test]
    fn garbage_heartbeat_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alive");
        fs::write(&path, "not a time").unwrap();
        assert!(HeartbeatFile::new(path).read().is_err());
    }
}
