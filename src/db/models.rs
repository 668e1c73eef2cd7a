//! Diesel model structs for the time-series and room mapping tables.
//!
//! `measurements` is keyed by `(sensor_id, time)`; the writer relies on that key
//! for its insert-or-replace semantics.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema;

/// Canonical reading: one timestamped observation from one sensor, ready to store.
///
/// `r` is the cumulative rainfall total reported by the gauge, never a per-interval delta.
#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::measurements)]
pub struct NewMeasurement {
    pub time: DateTime<Utc>,
    pub sensor_id: String,
    pub t1: Option<f64>,
    pub t2: Option<f64>,
    pub h: Option<f64>,
    pub r: Option<f64>,
    pub rf: Option<i64>,
    pub rr: Option<f64>,
}

impl NewMeasurement {
    pub fn new(time: DateTime<Utc>, sensor_id: impl Into<String>) -> Self {
        NewMeasurement {
            time,
            sensor_id: sensor_id.into(),
            t1: None,
            t2: None,
            h: None,
            r: None,
            rf: None,
            rr: None,
        }
    }

    /// True when no measurable field is populated.
    pub fn is_empty(&self) -> bool {
        self.t1.is_none()
            && self.t2.is_none()
            && self.h.is_none()
            && self.r.is_none()
            && self.rf.is_none()
            && self.rr.is_none()
    }

    pub fn key(&self) -> (String, DateTime<Utc>) {
        (self.sensor_id.clone(), self.time)
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::measurements)]
pub struct Measurement {
    pub time: DateTime<Utc>,
    pub sensor_id: String,
    pub t1: Option<f64>,
    pub t2: Option<f64>,
    pub h: Option<f64>,
    pub r: Option<f64>,
    pub rf: Option<i64>,
    pub rr: Option<f64>,
}

impl From<NewMeasurement> for Measurement {
    fn from(m: NewMeasurement) -> Self {
        Measurement {
            time: m.time,
            sensor_id: m.sensor_id,
            t1: m.t1,
            t2: m.t2,
            h: m.h,
            r: m.r,
            rf: m.rf,
            rr: m.rr,
        }
    }
}

/// Temporal binding of a sensor to a logical room; `None` bounds are open.
#[derive(Debug, Clone, PartialEq, Eq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::room_assoc)]
pub struct NewRoomAssoc {
    pub sensor_id: String,
    pub room_id: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl NewRoomAssoc {
    /// Whether two associations of the same sensor claim a common instant.
    pub fn overlaps(&self, other: &NewRoomAssoc) -> bool {
        if self.sensor_id != other.sensor_id {
            return false;
        }
        let starts_before_other_ends = match (self.start_date, other.end_date) {
            (Some(s), Some(e)) => s < e,
            _ => true,
        };
        let other_starts_before_self_ends = match (other.start_date, self.end_date) {
            (Some(s), Some(e)) => s < e,
            _ => true,
        };
        starts_before_other_ends && other_starts_before_self_ends
    }
}
