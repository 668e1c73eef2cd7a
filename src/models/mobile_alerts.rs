//! Wire types for the Mobile Alerts `lastmeasurement` endpoint.
//!
//! The provider owns this contract and adds fields over time, so only the
//! envelope is typed strictly. The measurement object stays a raw JSON map and
//! is interpreted by the normalizer.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Top-level response body. `devices` is kept raw so one broken entry does not
/// poison the rest of the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastMeasurementResponse {
    pub success: bool,
    #[serde(default)]
    pub devices: Option<Vec<Value>>,
    #[serde(default)]
    pub errorcode: Option<Value>,
    #[serde(default)]
    pub errormessage: Option<String>,
}

/// One entry of `devices`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicePayload {
    pub deviceid: String,
    #[serde(default, deserialize_with = "lenient")]
    pub lastseen: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub lowbattery: Option<bool>,
    #[serde(default)]
    pub measurement: Option<Map<String, Value>>,
}

/// Informational field: a value of an unexpected type reads as absent instead
/// of rejecting the device entry.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.and_then(|v| serde_json::from_value(v).ok()))
}

/// Measurement keys the normalizer understands. Everything else is ignored.
pub mod fields {
    pub const TIMESTAMP: &str = "ts";
    pub const T1: &str = "t1";
    pub const T2: &str = "t2";
    pub const HUMIDITY: &str = "h";
    pub const RAIN_TOTAL: &str = "r";
    pub const RAIN_FLIPS: &str = "rf";
    pub const RAIN_PER_FLIP: &str = "rr";
    pub const LOW_BATTERY: &str = "lb";
}
