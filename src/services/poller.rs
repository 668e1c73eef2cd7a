use crate::client::{MeasurementSource, SensorOutcome};
use crate::db::models::NewMeasurement;
use crate::db::store::Store;
use crate::error::{ErrorKind, IngestError};
use crate::liveness::{self, HeartbeatFile};
use crate::services::ingest::{commit_batch, CommitSummary};
use crate::services::normalize::normalize;
use crate::services::rooms::{self, RoomFileWatch};
use crate::shutdown::Shutdown;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PollPhase {
    Idle,
    Polling,
    Succeeded,
    Failed,
}

/// Scheduler state. Owned by the loop and mutated only through its methods.
#[derive(Debug)]
pub struct PollState {
    phase: PollPhase,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<(DateTime<Utc>, ErrorKind)>,
    consecutive_failures: u32,
    last_rain: HashMap<String, f64>,
}

impl Default for PollState {
    fn default() -> Self {
        Self::new()
    }
}

impl PollState {
    pub fn new() -> Self {
        PollState {
            phase: PollPhase::Idle,
            last_success: None,
            last_failure: None,
            consecutive_failures: 0,
            last_rain: HashMap::new(),
        }
    }

    pub fn phase(&self) -> PollPhase {
        self.phase
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success
    }

    pub fn last_failure(&self) -> Option<(DateTime<Utc>, ErrorKind)> {
        self.last_failure
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_rain(&self, sensor_id: &str) -> Option<f64> {
        self.last_rain.get(sensor_id).copied()
    }

    pub fn seed_rain_totals(&mut self, totals: HashMap<String, f64>) {
        self.last_rain.extend(totals);
    }

    pub fn is_alive(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        liveness::is_alive(self.last_success, now, threshold)
    }

    /// Enter `Polling`. Refuses while a cycle is already in flight.
    fn begin(&mut self) -> bool {
        if self.phase == PollPhase::Polling {
            return false;
        }
        self.phase = PollPhase::Polling;
        true
    }

    fn succeed(&mut self, at: DateTime<Utc>, stored: &[NewMeasurement]) {
        for row in stored {
            if let Some(r) = row.r {
                self.last_rain.insert(row.sensor_id.clone(), r);
            }
        }
        self.phase = PollPhase::Succeeded;
        self.last_success = Some(at);
        self.consecutive_failures = 0;
    }

    fn fail(&mut self, at: DateTime<Utc>, kind: ErrorKind) {
        self.phase = PollPhase::Failed;
        self.last_failure = Some((at, kind));
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    fn settle(&mut self) {
        self.phase = PollPhase::Idle;
    }
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub requested: usize,
    pub with_data: usize,
    pub discarded: usize,
    pub sensor_errors: Vec<IngestError>,
    /// Request batches that failed while others in the same cycle succeeded.
    pub failed_batches: Vec<IngestError>,
    pub committed: CommitSummary,
    /// Shutdown grace ran out before the commit; nothing was written.
    pub aborted: bool,
}

impl CycleReport {
    pub fn rejected_sensors(&self) -> Vec<&str> {
        self.sensor_errors.iter().filter_map(IngestError::sensor_id).collect()
    }
}

/// Run one poll cycle: fetch everything, normalize, then commit in one transaction.
///
/// Per-sensor problems end up in the report; only a cycle where no request
/// batch was answered, or the commit failed, returns an error.
pub fn poll_once<S, C>(
    store: &mut S,
    source: &C,
    sensor_ids: &[String],
    state: &mut PollState,
    shutdown: &Shutdown,
    grace: Duration,
) -> Result<CycleReport, IngestError>
where
    S: Store + ?Sized,
    C: MeasurementSource + ?Sized,
{
    if !state.begin() {
        warn!("Poll cycle already in flight; skipping tick");
        return Ok(CycleReport::default());
    }
    let result = run_cycle(store, source, sensor_ids, state, shutdown, grace);
    match &result {
        Ok(report) if report.aborted => state.settle(),
        Ok(_) => {}
        Err(e) => state.fail(Utc::now(), e.kind()),
    }
    result
}

fn run_cycle<S, C>(
    store: &mut S,
    source: &C,
    sensor_ids: &[String],
    state: &mut PollState,
    shutdown: &Shutdown,
    grace: Duration,
) -> Result<CycleReport, IngestError>
where
    S: Store + ?Sized,
    C: MeasurementSource + ?Sized,
{
    let mut report = CycleReport {
        requested: sensor_ids.len(),
        ..CycleReport::default()
    };

    // 1) Network: every request completes before the store is touched
    let mut outcomes = Vec::with_capacity(sensor_ids.len());
    let mut answered = 0usize;
    for batch in sensor_ids.chunks(source.max_ids_per_request().max(1)) {
        if shutdown.grace_exceeded(grace) {
            warn!(
                "Shutdown grace period ({}s) exceeded; skipping the remaining requests of the in-flight cycle",
                grace.as_secs()
            );
            report.aborted = true;
            return Ok(report);
        }
        match source.fetch_batch(batch) {
            Ok(batch_outcomes) => {
                answered += 1;
                outcomes.extend(batch_outcomes);
            }
            Err(e) => {
                warn!(
                    "Request for {} sensor(s) failed [{}]: {}",
                    batch.len(),
                    e.kind(),
                    e
                );
                report.failed_batches.push(e);
            }
        }
    }
    if answered == 0 && !report.failed_batches.is_empty() {
        return Err(report.failed_batches.remove(0));
    }

    // 2) Normalize; failures stay scoped to their sensor
    let mut readings = Vec::with_capacity(outcomes.len());
    for (sensor_id, outcome) in outcomes {
        match outcome {
            SensorOutcome::Payload(payload) => {
                report.with_data += 1;
                match normalize(&sensor_id, &payload, state.last_rain(&sensor_id)) {
                    Ok(Some(row)) => readings.push(row),
                    Ok(None) => report.discarded += 1,
                    Err(e) => {
                        warn!("Sensor {}: skipping reading [{}]: {}", sensor_id, e.kind(), e);
                        report.sensor_errors.push(e);
                    }
                }
            }
            SensorOutcome::NoData => debug!("Sensor {}: no data in response", sensor_id),
            SensorOutcome::Failed(e) => {
                warn!("Sensor {}: skipping payload [{}]: {}", sensor_id, e.kind(), e);
                report.sensor_errors.push(e);
            }
        }
    }

    // 3) Commit, unless a shutdown has been waiting longer than the grace period
    if shutdown.grace_exceeded(grace) {
        warn!(
            "Shutdown grace period ({}s) exceeded; discarding {} reading(s) of the in-flight cycle",
            grace.as_secs(),
            readings.len()
        );
        report.aborted = true;
        return Ok(report);
    }

    report.committed = commit_batch(store, readings.clone())?;
    state.succeed(Utc::now(), &readings);

    info!(
        "Poll cycle complete: {} requested, {} with data, {} stored, {} discarded, {} sensor error(s), {} failed request(s)",
        report.requested,
        report.with_data,
        report.committed.unique,
        report.discarded,
        report.sensor_errors.len(),
        report.failed_batches.len()
    );
    if !report.sensor_errors.is_empty() {
        debug!("Rejected payloads from: {}", report.rejected_sensors().join(", "));
    }
    Ok(report)
}

/// Time until the next tick given how long the last cycle took, plus how many
/// ticks were missed. Missed ticks are dropped rather than run back to back.
pub fn next_wait(elapsed: Duration, interval: Duration) -> (Duration, u32) {
    if interval.is_zero() {
        return (Duration::ZERO, 0);
    }
    if elapsed < interval {
        return (interval - elapsed, 0);
    }
    let interval_ns = interval.as_nanos();
    let elapsed_ns = elapsed.as_nanos();
    let skipped = (elapsed_ns / interval_ns).min(u32::MAX as u128) as u32;
    let into_tick = elapsed_ns % interval_ns;
    let wait_ns = interval_ns - into_tick;
    (Duration::from_nanos(wait_ns.min(u64::MAX as u128) as u64), skipped)
}

/// Random extra delay while failures persist, so restarted fleets do not hit
/// the upstream in lockstep. Up to a tenth of the interval.
pub fn failure_stagger<R: Rng + ?Sized>(rng: &mut R, consecutive_failures: u32, interval: Duration) -> Duration {
    if consecutive_failures == 0 {
        return Duration::ZERO;
    }
    let max_ms = (interval.as_millis() / 10).min(u64::MAX as u128) as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rng.random_range(0..=max_ms))
}

pub struct LoopSettings {
    pub interval: Duration,
    pub shutdown_grace: Duration,
    pub liveness_threshold: chrono::Duration,
    pub heartbeat: Option<HeartbeatFile>,
    pub room_watch: Option<RoomFileWatch>,
}

pub fn run_loop<S, C>(
    store: &mut S,
    source: &C,
    sensor_ids: &[String],
    state: &mut PollState,
    mut settings: LoopSettings,
    shutdown: &Shutdown,
) -> Result<(), String>
where
    S: Store + ?Sized,
    C: MeasurementSource + ?Sized,
{
    let mut rng = rand::rng();
    let mut stale_reported = false;

    loop {
        if shutdown.is_requested() {
            info!("Shutdown requested; leaving poll loop");
            return Ok(());
        }
        let tick_start = Instant::now();

        // Room mapping reload shares the connection, so it runs between cycles.
        if let Some(watch) = settings.room_watch.as_mut()
            && watch.poll_changed()
        {
            info!("Room association file {} changed; re-syncing", watch.path().display());
            if let Err(e) = rooms::reconcile(store, watch.path()) {
                error!(
                    "Room association reload failed [{}]; previous associations stay in place: {}",
                    e.kind(),
                    e
                );
            }
        }

        match poll_once(store, source, sensor_ids, state, shutdown, settings.shutdown_grace) {
            Ok(report) => {
                if !report.aborted
                    && let (Some(hb), Some(at)) = (settings.heartbeat.as_ref(), state.last_success())
                    && let Err(e) = hb.record(at)
                {
                    warn!("Failed to update liveness file {}: {}", hb.path().display(), e);
                }
            }
            Err(e) if e.kind().is_cycle_level() => warn!(
                "Poll cycle failed [{}] ({} in a row): {}",
                e.kind(),
                state.consecutive_failures(),
                e
            ),
            Err(e) => error!("Poll cycle failed [{}]: {}", e.kind(), e),
        }
        state.settle();

        let alive = state.is_alive(Utc::now(), settings.liveness_threshold);
        if !alive && state.consecutive_failures() > 0 && !stale_reported {
            error!(
                "No successful poll within {} minute(s); liveness check now reports unhealthy",
                settings.liveness_threshold.num_minutes()
            );
            stale_reported = true;
        } else if alive {
            stale_reported = false;
        }

        let (wait, skipped) = next_wait(tick_start.elapsed(), settings.interval);
        if skipped > 0 {
            warn!(
                "Poll cycle took longer than the {}s interval; skipping {} tick(s)",
                settings.interval.as_secs(),
                skipped
            );
        }
        let wait = wait + failure_stagger(&mut rng, state.consecutive_failures(), settings.interval);
        if shutdown.sleep(wait) {
            info!("Shutdown requested; leaving poll loop");
            return Ok(());
        }
    }
}
