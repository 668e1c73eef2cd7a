use crate::db::models::NewMeasurement;
use crate::db::store::Store;
use crate::error::IngestError;
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitSummary {
    pub received: usize,
    pub unique: usize,
    pub written: usize,
}

/// Persist one poll cycle's readings as a single atomic unit.
///
/// Duplicate `(sensor_id, time)` keys inside the batch collapse to the last
/// occurrence before the store sees them, then the store applies
/// insert-or-replace. On error nothing from this batch is visible and the
/// same readings can be committed again later.
pub fn commit_batch<S: Store + ?Sized>(
    store: &mut S,
    readings: Vec<NewMeasurement>,
) -> Result<CommitSummary, IngestError> {
    let received = readings.len();
    if received == 0 {
        return Ok(CommitSummary::default());
    }

    let mut by_key: BTreeMap<(String, DateTime<Utc>), NewMeasurement> = BTreeMap::new();
    for row in readings {
        by_key.insert(row.key(), row);
    }
    let rows: Vec<NewMeasurement> = by_key.into_values().collect();
    if rows.len() < received {
        debug!(
            "Collapsed {} duplicate reading(s) within the batch",
            received - rows.len()
        );
    }

    let written = store.upsert_measurements(&rows)?;
    Ok(CommitSummary {
        received,
        unique: rows.len(),
        written,
    })
}
