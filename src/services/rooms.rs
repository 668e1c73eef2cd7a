//! Sensor → room mapping sync from a YAML file.
//!
//! Expected structure:
//!
//! ```yaml
//! associations:
//!   - sensor_id: 0123456789AB
//!     room_id: living-room
//!     start_date: 2024-01-01T00:00:00Z   # optional, RFC 3339 or YYYY-MM-DD
//!     end_date: 2025-06-01               # optional, exclusive
//! ```
//!
//! The file is authoritative: every sync replaces the stored set. Numeric-looking
//! sensor IDs should be quoted, YAML would otherwise read them as numbers.

use crate::db::models::NewRoomAssoc;
use crate::db::store::Store;
use crate::error::IngestError;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use log::{info, warn};
use serde_yaml::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Read and validate the association file. A missing file yields an empty set.
pub fn load_associations(path: &Path) -> Result<Vec<NewRoomAssoc>, IngestError> {
    if !path.exists() {
        warn!(
            "Room association file {} not found; no room associations will be stored",
            path.display()
        );
        return Ok(Vec::new());
    }

    info!("Loading room associations from {}", path.display());
    let text = fs::read_to_string(path)
        .map_err(|e| IngestError::ConfigurationError(format!("failed to read {}: {}", path.display(), e)))?;
    parse_associations(&text)
        .map_err(|e| IngestError::ConfigurationError(format!("{}: {}", path.display(), e)))
}

pub fn parse_associations(text: &str) -> Result<Vec<NewRoomAssoc>, String> {
    let doc: Value = serde_yaml::from_str(text).map_err(|e| format!("invalid YAML: {}", e))?;

    let list = match &doc {
        Value::Null => return Ok(Vec::new()),
        Value::Mapping(map) => match map.get("associations") {
            Some(Value::Sequence(items)) => items,
            Some(_) | None => {
                return Err("config must contain a top-level `associations` list".to_string());
            }
        },
        _ => return Err("config must be a mapping with an `associations` list".to_string()),
    };

    list.iter()
        .enumerate()
        .map(|(i, entry)| parse_entry(i, entry))
        .collect()
}

fn parse_entry(index: usize, entry: &Value) -> Result<NewRoomAssoc, String> {
    let Value::Mapping(map) = entry else {
        return Err(format!("association #{} is not a mapping", index));
    };

    let sensor_id = map.get("sensor_id").and_then(scalar_string);
    let room_id = map.get("room_id").and_then(scalar_string);
    let (Some(sensor_id), Some(room_id)) = (sensor_id, room_id) else {
        return Err(format!("association #{} missing sensor_id or room_id", index));
    };

    let start_date = parse_bound(index, "start_date", map.get("start_date"))?;
    let end_date = parse_bound(index, "end_date", map.get("end_date"))?;
    if let (Some(s), Some(e)) = (start_date, end_date)
        && e <= s
    {
        return Err(format!(
            "association #{} ({} -> {}) has end_date {} not after start_date {}",
            index, sensor_id, room_id, e, s
        ));
    }

    Ok(NewRoomAssoc {
        sensor_id,
        room_id,
        start_date,
        end_date,
    })
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_bound(index: usize, field: &str, v: Option<&Value>) -> Result<Option<DateTime<Utc>>, String> {
    let raw = match v {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s.trim(),
        Some(other) => return Err(format!("association #{} {} is not a timestamp: {:?}", index, field, other)),
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Some(dt.with_timezone(&Utc)));
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(Some(d.and_time(NaiveTime::MIN).and_utc()));
    }
    Err(format!(
        "association #{} {} must be RFC 3339 or YYYY-MM-DD, got {:?}",
        index, field, raw
    ))
}

/// Pairs of entries that claim the same sensor at a common instant.
pub fn find_overlaps(rows: &[NewRoomAssoc]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    for (i, a) in rows.iter().enumerate() {
        for (j, b) in rows.iter().enumerate().skip(i + 1) {
            if a.overlaps(b) {
                out.push((i, j));
            }
        }
    }
    out
}

/// Load the file and atomically replace the stored association set.
pub fn reconcile<S: Store + ?Sized>(store: &mut S, path: &Path) -> Result<usize, IngestError> {
    let rows = load_associations(path)?;

    // Stored as declared; which room wins for an overlapping instant is up to the query.
    for (i, j) in find_overlaps(&rows) {
        warn!(
            "Room associations #{} ({}) and #{} ({}) overlap for sensor {}",
            i, rows[i].room_id, j, rows[j].room_id, rows[i].sensor_id
        );
    }

    let stored = store.replace_room_assocs(&rows)?;
    info!("Room association sync complete ({} association(s))", stored);
    Ok(stored)
}

/// Detects modifications of the association file between poll ticks.
#[derive(Debug)]
pub struct RoomFileWatch {
    path: PathBuf,
    last_seen: Option<SystemTime>,
}

impl RoomFileWatch {
    /// Snapshot the current state; call right after the startup sync.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last_seen = modified_at(&path);
        RoomFileWatch { path, last_seen }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once per observed change (modified, created or removed).
    pub fn poll_changed(&mut self) -> bool {
        let current = modified_at(&self.path);
        if current != self.last_seen {
            self.last_seen = current;
            true
        } else {
            false
        }
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
