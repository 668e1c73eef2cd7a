use crate::db::models::NewMeasurement;
use crate::error::IngestError;
use crate::models::mobile_alerts::{fields, DevicePayload};
use crate::utils::excerpt;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::{Map, Value};

const RAIN_EPSILON_MM: f64 = 1e-6;

/// Capability set observed in a raw measurement object.
///
/// Classification is by key presence: a key that is present but unparsable
/// still selects the shape, its value simply ends up absent.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadShape {
    Thermo {
        t1: Option<f64>,
        t2: Option<f64>,
    },
    ThermoHygro {
        t1: Option<f64>,
        t2: Option<f64>,
        h: Option<f64>,
    },
    /// Gauges may report temperature and humidity as well.
    Rain {
        t1: Option<f64>,
        t2: Option<f64>,
        h: Option<f64>,
        r: Option<f64>,
        rf: Option<i64>,
        rr: Option<f64>,
    },
}

impl PayloadShape {
    pub fn classify(sensor_id: &str, m: &Map<String, Value>) -> Self {
        let is_rain = [fields::RAIN_TOTAL, fields::RAIN_FLIPS, fields::RAIN_PER_FLIP]
            .iter()
            .any(|k| m.contains_key(*k));

        if is_rain {
            PayloadShape::Rain {
                t1: float_field(sensor_id, m, fields::T1),
                t2: float_field(sensor_id, m, fields::T2),
                h: float_field(sensor_id, m, fields::HUMIDITY),
                r: float_field(sensor_id, m, fields::RAIN_TOTAL),
                rf: int_field(sensor_id, m, fields::RAIN_FLIPS),
                rr: float_field(sensor_id, m, fields::RAIN_PER_FLIP),
            }
        } else if m.contains_key(fields::HUMIDITY) {
            PayloadShape::ThermoHygro {
                t1: float_field(sensor_id, m, fields::T1),
                t2: float_field(sensor_id, m, fields::T2),
                h: float_field(sensor_id, m, fields::HUMIDITY),
            }
        } else {
            PayloadShape::Thermo {
                t1: float_field(sensor_id, m, fields::T1),
                t2: float_field(sensor_id, m, fields::T2),
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PayloadShape::Thermo { .. } => "thermo",
            PayloadShape::ThermoHygro { .. } => "thermo-hygro",
            PayloadShape::Rain { .. } => "rain",
        }
    }

    fn apply(self, row: &mut NewMeasurement) {
        match self {
            PayloadShape::Thermo { t1, t2 } => {
                row.t1 = t1;
                row.t2 = t2;
            }
            PayloadShape::ThermoHygro { t1, t2, h } => {
                row.t1 = t1;
                row.t2 = t2;
                row.h = h;
            }
            PayloadShape::Rain { t1, t2, h, r, rf, rr } => {
                row.t1 = t1;
                row.t2 = t2;
                row.h = h;
                row.r = r;
                row.rf = rf;
                row.rr = rr;
            }
        }
    }
}

/// Turn one device payload into at most one canonical reading.
///
/// `Ok(None)` means nothing storable: no measurement object, or every
/// measurable field absent. A bad `ts` rejects the whole reading.
/// `last_rain_mm` is only used to flag counter regressions; `r` is always
/// stored as reported.
pub fn normalize(
    sensor_id: &str,
    payload: &DevicePayload,
    last_rain_mm: Option<f64>,
) -> Result<Option<NewMeasurement>, IngestError> {
    let Some(m) = payload.measurement.as_ref() else {
        debug!(
            "Sensor {}: no measurement object (last seen {:?})",
            sensor_id, payload.lastseen
        );
        return Ok(None);
    };

    let time = parse_timestamp(sensor_id, m)?;
    let shape = PayloadShape::classify(sensor_id, m);
    let shape_name = shape.name();

    let mut row = NewMeasurement::new(time, sensor_id);
    shape.apply(&mut row);

    if row.is_empty() {
        debug!(
            "Sensor {}: {} payload at {} carries no usable values; discarding",
            sensor_id, shape_name, time
        );
        return Ok(None);
    }

    if let (Some(prev), Some(current)) = (last_rain_mm, row.r)
        && current + RAIN_EPSILON_MM < prev
    {
        warn!(
            "Sensor {}: cumulative rain dropped from {} to {} mm (counter reset or replaced sensor?); storing as reported",
            sensor_id, prev, current
        );
    }

    let low_battery = payload.lowbattery.unwrap_or(false)
        || m.get(fields::LOW_BATTERY).and_then(Value::as_bool).unwrap_or(false);
    if low_battery {
        warn!("Sensor {}: reports low battery", sensor_id);
    }

    Ok(Some(row))
}

fn parse_timestamp(sensor_id: &str, m: &Map<String, Value>) -> Result<DateTime<Utc>, IngestError> {
    let invalid = |raw: String| IngestError::InvalidTimestamp {
        sensor_id: sensor_id.to_string(),
        raw,
    };

    let raw = m
        .get(fields::TIMESTAMP)
        .ok_or_else(|| invalid("<missing>".to_string()))?;
    let secs = match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && f.is_finite()).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };

    secs.filter(|s| *s > 0)
        .and_then(|s| DateTime::from_timestamp(s, 0))
        .ok_or_else(|| invalid(excerpt(&raw.to_string(), 64)))
}

fn float_field(sensor_id: &str, m: &Map<String, Value>, key: &str) -> Option<f64> {
    let raw = m.get(key)?;
    let parsed = match raw {
        Value::Null => return None,
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed.filter(|v| v.is_finite()) {
        Some(v) => Some(v),
        None => {
            warn!(
                "Sensor {}: field `{}` is not a number ({}); treating as absent",
                sensor_id,
                key,
                excerpt(&raw.to_string(), 64)
            );
            None
        }
    }
}

fn int_field(sensor_id: &str, m: &Map<String, Value>, key: &str) -> Option<i64> {
    let raw = m.get(key)?;
    let parsed = match raw {
        Value::Null => return None,
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && f.is_finite()).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    if parsed.is_none() {
        warn!(
            "Sensor {}: field `{}` is not an integer ({}); treating as absent",
            sensor_id,
            key,
            excerpt(&raw.to_string(), 64)
        );
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::TimeZone;
    use serde_json::json;

    fn payload(measurement: Value) -> DevicePayload {
        DevicePayload {
            deviceid: "0123456789AB".into(),
            lastseen: None,
            lowbattery: Some(false),
            measurement: measurement.as_object().cloned(),
        }
    }

    #[test]
    fn temperature_only_payload() {
        let p = payload(json!({"idx": 1, "ts": 1748779200, "c": 1748779230, "lb": false, "t1": 21.5, "t2": null}));
        let row = normalize("0123456789AB", &p, None).unwrap().expect("reading");

        assert_eq!(row.time, Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
        assert_eq!(row.sensor_id, "0123456789AB");
        assert_eq!(row.t1, Some(21.5));
        assert_eq!(row.t2, None);
        assert_eq!((row.h, row.r, row.rf, row.rr), (None, None, None, None));
    }

    #[test]
    fn humidity_payload_uses_thermo_hygro_shape() {
        let m = json!({"ts": 1748779200, "t1": 19.8, "h": 57});
        let shape = PayloadShape::classify("C0FFEE56789A", m.as_object().unwrap());
        assert_eq!(
            shape,
            PayloadShape::ThermoHygro {
                t1: Some(19.8),
                t2: None,
                h: Some(57.0)
            }
        );

        let row = normalize("C0FFEE56789A", &payload(m), None).unwrap().unwrap();
        assert_eq!(row.h, Some(57.0));
        assert_eq!(row.r, None);
    }

    #[test]
    fn rain_payload_keeps_cumulative_values() {
        let p = payload(json!({"ts": 1748778900, "t1": 12.1, "r": 183.6, "rf": 708, "rr": 0.2594, "rb": []}));
        // lower than last known total: still stored unmodified
        let row = normalize("0812345678AB", &p, Some(190.0)).unwrap().unwrap();
        assert_eq!(row.t1, Some(12.1));
        assert_eq!(row.r, Some(183.6));
        assert_eq!(row.rf, Some(708));
        assert_eq!(row.rr, Some(0.2594));
        assert_eq!(row.h, None);
    }

    #[test]
    fn rain_gauge_with_climate_sensor_keeps_every_field() {
        let p = payload(json!({"ts": 1748779200, "t1": 12.1, "t2": 11.0, "h": 80, "r": 183.6}));
        let row = normalize("0812345678AB", &p, None).unwrap().unwrap();
        assert_eq!(row.t1, Some(12.1));
        assert_eq!(row.t2, Some(11.0));
        assert_eq!(row.h, Some(80.0));
        assert_eq!(row.r, Some(183.6));
        assert_eq!((row.rf, row.rr), (None, None));
    }

    #[test]
    fn unparsable_field_is_dropped_not_the_reading() {
        let p = payload(json!({"ts": 1748779200, "t1": "21.0", "t2": "n/a", "h": {"x": 1}}));
        let row = normalize("0123456789AB", &p, None).unwrap().unwrap();
        assert_eq!(row.t1, Some(21.0));
        assert_eq!(row.t2, None);
        assert_eq!(row.h, None);
    }

    #[test]
    fn all_fields_unparsable_discards_reading() {
        let p = payload(json!({"ts": 1748779200, "t1": "err", "t2": [], "unknown": 3}));
        assert_eq!(normalize("0123456789AB", &p, None).unwrap(), None);

        let p = payload(json!({"ts": 1748779200, "idx": 5}));
        assert_eq!(normalize("0123456789AB", &p, None).unwrap(), None);
    }

    #[test]
    fn bad_timestamps_are_rejected() {
        for ts in [json!("yesterday"), json!(0), json!(-5), json!(1.5), json!(null)] {
            let p = payload(json!({"ts": ts, "t1": 20.0}));
            let err = normalize("0123456789AB", &p, None).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidTimestamp);
        }
        let p = payload(json!({"t1": 20.0}));
        let err = normalize("0123456789AB", &p, None).unwrap_err();
        assert!(err.to_string().contains("<missing>"));
    }

    #[test]
    fn string_timestamp_is_accepted() {
        let p = payload(json!({"ts": "1748779200", "t1": 20.0}));
        let row = normalize("0123456789AB", &p, None).unwrap().unwrap();
        assert_eq!(row.time.timestamp(), 1_748_779_200);
    }

    #[test]
    fn missing_measurement_yields_nothing() {
        let p = DevicePayload {
            deviceid: "0123456789AB".into(),
            lastseen: Some(1748779200),
            lowbattery: None,
            measurement: None,
        };
        assert_eq!(normalize("0123456789AB", &p, None).unwrap(), None);
    }
}
