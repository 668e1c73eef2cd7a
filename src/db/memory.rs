//! In-memory [`Store`] for tests, with fault injection mid-write.

use crate::db::models::{Measurement, NewMeasurement, NewRoomAssoc};
use crate::db::store::Store;
use crate::error::IngestError;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
pub struct MemoryStore {
    pub measurements: BTreeMap<(String, DateTime<Utc>), Measurement>,
    pub room_assocs: Vec<NewRoomAssoc>,
    /// When set, the next write fails after this many rows were staged.
    pub fail_after_rows: Option<usize>,
    pub upsert_calls: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows_for(&self, sensor_id: &str) -> Vec<&Measurement> {
        self.measurements
            .values()
            .filter(|m| m.sensor_id == sensor_id)
            .collect()
    }

    fn check_fault(&mut self, staged: usize) -> Result<(), IngestError> {
        match self.fail_after_rows {
            Some(limit) if staged >= limit => {
                self.fail_after_rows = None;
                Err(IngestError::StorageFailure(format!(
                    "injected fault after {} row(s)",
                    staged
                )))
            }
            _ => Ok(()),
        }
    }
}

impl Store for MemoryStore {
    fn upsert_measurements(&mut self, rows: &[NewMeasurement]) -> Result<usize, IngestError> {
        self.upsert_calls += 1;
        // stage on a copy, publish only when every row made it
        let mut staged = self.measurements.clone();
        for (i, row) in rows.iter().enumerate() {
            self.check_fault(i)?;
            staged.insert(row.key(), Measurement::from(row.clone()));
        }
        self.measurements = staged;
        Ok(rows.len())
    }

    fn replace_room_assocs(&mut self, rows: &[NewRoomAssoc]) -> Result<usize, IngestError> {
        let mut staged = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            self.check_fault(i)?;
            staged.push(row.clone());
        }
        self.room_assocs = staged;
        Ok(rows.len())
    }

    fn latest_rain_totals(&mut self, sensor_ids: &[String]) -> Result<HashMap<String, f64>, IngestError> {
        let mut out = HashMap::new();
        // BTreeMap iterates in (sensor, time) order, so later values win
        for m in self.measurements.values() {
            if let Some(r) = m.r
                && sensor_ids.contains(&m.sensor_id)
            {
                out.insert(m.sensor_id.clone(), r);
            }
        }
        Ok(out)
    }
}
