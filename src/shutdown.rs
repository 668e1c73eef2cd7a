//! Cooperative shutdown on SIGINT/SIGTERM.
//!
//! The first signal only records the instant it arrived; the poll loop checks
//! it between phases. A second signal exits immediately. That is safe because
//! every store write is a single transaction which PostgreSQL rolls back when
//! the connection drops.

use log::{info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(250);
const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested_at: Arc<OnceLock<Instant>>,
}

impl Shutdown {
    /// Spawn a watcher thread for SIGINT/SIGTERM and return a handle observing it.
    pub fn from_signals() -> Result<Self, String> {
        let mut signals =
            Signals::new([SIGINT, SIGTERM]).map_err(|e| format!("installing signal handlers failed: {}", e))?;
        let shutdown = Shutdown::manual();
        let observed = shutdown.clone();

        thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    if observed.is_requested() {
                        warn!("Signal {} received again; exiting immediately", signal);
                        std::process::exit(FORCED_EXIT_CODE);
                    }
                    info!("Signal {} received; finishing the current cycle", signal);
                    observed.trigger();
                }
            })
            .map_err(|e| format!("spawning signal watcher failed: {}", e))?;

        Ok(shutdown)
    }

    /// A handle that is only triggered explicitly.
    pub fn manual() -> Self {
        Shutdown::default()
    }

    /// Request shutdown. Later calls keep the first instant.
    pub fn trigger(&self) {
        let _ = self.requested_at.set(Instant::now());
    }

    pub fn is_requested(&self) -> bool {
        self.requested_at.get().is_some()
    }

    /// Time since shutdown was first requested.
    pub fn elapsed(&self) -> Option<Duration> {
        self.requested_at.get().map(Instant::elapsed)
    }

    /// True once shutdown has been pending for longer than `grace`.
    pub fn grace_exceeded(&self, grace: Duration) -> bool {
        self.elapsed().is_some_and(|waited| waited > grace)
    }

    /// Sleep up to `total`, waking early on shutdown. Returns true when interrupted.
    pub fn sleep(&self, total: Duration) -> bool {
        let mut remaining = total;
        while !remaining.is_zero() {
            if self.is_requested() {
                return true;
            }
            let slice = remaining.min(SLEEP_SLICE);
            thread::sleep(slice);
            remaining -= slice;
        }
        self.is_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_trigger_keeps_first_instant() {
        let shutdown = Shutdown::manual();
        assert!(!shutdown.is_requested());
        assert_eq!(shutdown.elapsed(), None);

        let clone = shutdown.clone();
        clone.trigger();
        assert!(shutdown.is_requested());
        let first = shutdown.requested_at.get().copied();
        thread::sleep(Duration::from_millis(5));
        clone.trigger();
        assert_eq!(shutdown.requested_at.get().copied(), first);
    }

    #[test]
    fn grace_is_measured_from_first_request() {
        let shutdown = Shutdown::manual();
        assert!(!shutdown.grace_exceeded(Duration::ZERO));
        shutdown.trigger();
        thread::sleep(Duration::from_millis(20));
        assert!(shutdown.grace_exceeded(Duration::from_millis(10)));
        assert!(!shutdown.grace_exceeded(Duration::from_secs(60)));
    }

    #[test]
    fn sleep_wakes_up_on_trigger() {
        let shutdown = Shutdown::manual();
        let remote = shutdown.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            remote.trigger();
        });

        let started = Instant::now();
        assert!(shutdown.sleep(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn uninterrupted_sleep_returns_false() {
        assert!(!Shutdown::manual().sleep(Duration::from_millis(10)));
    }

    #[test]
    fn delivered_signal_requests_shutdown() {
        let shutdown = Shutdown::from_signals().unwrap();
        signal_hook::low_level::raise(SIGTERM).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !shutdown.is_requested() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(shutdown.is_requested());
    }
}
