//! Blocking HTTP client for the Mobile Alerts public sensor API.
//!
//! - One POST per batch of device IDs (`deviceids=<id>,<id>,...`).
//! - Global request timeout, no internal retries; the poll loop owns retry policy.
//! - The upstream does not document a hard cap on IDs per request that we rely
//!   on, so the batch size is configurable (`SENSOR_API_MAX_IDS_PER_REQUEST`,
//!   default [`DEFAULT_MAX_IDS_PER_REQUEST`]) and callers split larger sets.

use std::collections::HashMap;
use std::time::Duration;

use http::StatusCode;
use log::{debug, warn};
use serde_json::Value;

use crate::error::IngestError;
use crate::models::mobile_alerts::{DevicePayload, LastMeasurementResponse};
use crate::utils::excerpt;

pub const DEFAULT_API_URL: &str = "https://www.data199.com/api/pv1/device/lastmeasurement";
pub const DEFAULT_MAX_IDS_PER_REQUEST: usize = 100;
const ERROR_EXCERPT_CHARS: usize = 200;

/// Result of one requested sensor ID within a batch.
#[derive(Debug)]
pub enum SensorOutcome {
    Payload(DevicePayload),
    /// The API did not return the device, or returned it without a measurement.
    NoData,
    Failed(IngestError),
}

/// Anything that can answer a batch of sensor IDs. Implemented by the HTTP
/// client and by test doubles.
pub trait MeasurementSource {
    fn max_ids_per_request(&self) -> usize;

    /// Outcomes are returned in the order of `sensor_ids`, one per ID.
    fn fetch_batch(&self, sensor_ids: &[String]) -> Result<Vec<(String, SensorOutcome)>, IngestError>;
}

pub struct SensorApiClient {
    agent: ureq::Agent,
    url: String,
    token: Option<String>,
    max_ids_per_request: usize,
}

impl SensorApiClient {
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration, max_ids_per_request: usize) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();

        SensorApiClient {
            agent,
            url: url.into(),
            token,
            max_ids_per_request: max_ids_per_request.max(1),
        }
    }

    fn post_form(&self, device_ids: &str) -> Result<(StatusCode, String), IngestError> {
        let mut req = self
            .agent
            .post(&self.url)
            .header("Accept", "application/json")
            .header("User-Agent", concat!("sensor-ingest/", env!("CARGO_PKG_VERSION")));
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }

        let mut resp = match req.send_form([("deviceids", device_ids)]) {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(status)) => {
                return Err(IngestError::UpstreamError {
                    status,
                    message: String::from("<no body>"),
                });
            }
            Err(e) => return Err(IngestError::NetworkFailure(e.to_string())),
        };

        let status = resp.status();
        let body = resp
            .body_mut()
            .read_to_string()
            .map_err(|e| IngestError::NetworkFailure(format!("reading response body failed: {}", e)))?;
        Ok((status, body))
    }
}

impl MeasurementSource for SensorApiClient {
    fn max_ids_per_request(&self) -> usize {
        self.max_ids_per_request
    }

    fn fetch_batch(&self, sensor_ids: &[String]) -> Result<Vec<(String, SensorOutcome)>, IngestError> {
        if sensor_ids.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Requesting last measurement for {} sensor(s)", sensor_ids.len());

        let (status, body) = self.post_form(&sensor_ids.join(","))?;
        if !status.is_success() {
            return Err(IngestError::UpstreamError {
                status: status.as_u16(),
                message: excerpt(&body, ERROR_EXCERPT_CHARS),
            });
        }
        parse_response(&body, sensor_ids)
    }
}

/// Decode a response body and map each requested ID to its outcome.
///
/// Envelope problems fail the whole batch; a broken device entry only fails
/// that device.
pub fn parse_response(body: &str, requested: &[String]) -> Result<Vec<(String, SensorOutcome)>, IngestError> {
    let de = &mut serde_json::Deserializer::from_str(body);
    let envelope: LastMeasurementResponse =
        serde_path_to_error::deserialize(de).map_err(|e| IngestError::MalformedPayload {
            sensor_id: None,
            detail: format!(
                "{} at `{}` (body: {})",
                e.inner(),
                e.path(),
                excerpt(body, ERROR_EXCERPT_CHARS)
            ),
        })?;

    if !envelope.success {
        let code = envelope
            .errorcode
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        let message = envelope.errormessage.as_deref().unwrap_or("no error message");
        return Err(IngestError::UpstreamError {
            status: StatusCode::OK.as_u16(),
            message: format!("api reported failure (errorcode {}): {}", code, message),
        });
    }

    let devices = envelope.devices.ok_or_else(|| IngestError::MalformedPayload {
        sensor_id: None,
        detail: "successful response without `devices`".to_string(),
    })?;

    // Matching is case-insensitive: the API echoes IDs in its own casing.
    let mut by_id: HashMap<String, SensorOutcome> = HashMap::new();
    for (index, raw) in devices.into_iter().enumerate() {
        let Some(device_id) = raw.get("deviceid").and_then(Value::as_str).map(str::to_string) else {
            warn!(
                "Skipping device entry #{} without a deviceid: {}",
                index,
                excerpt(&raw.to_string(), ERROR_EXCERPT_CHARS)
            );
            continue;
        };
        let key = device_id.to_ascii_uppercase();

        let raw_text = raw.to_string();
        let outcome = match serde_path_to_error::deserialize::<_, DevicePayload>(raw) {
            Ok(payload) if payload.measurement.is_none() => SensorOutcome::NoData,
            Ok(payload) => SensorOutcome::Payload(payload),
            Err(e) => SensorOutcome::Failed(IngestError::MalformedPayload {
                sensor_id: Some(device_id),
                detail: format!(
                    "{} at `{}` (entry: {})",
                    e.inner(),
                    e.path(),
                    excerpt(&raw_text, ERROR_EXCERPT_CHARS)
                ),
            }),
        };
        by_id.insert(key, outcome);
    }

    let mut out = Vec::with_capacity(requested.len());
    for id in requested {
        let outcome = by_id.remove(&id.to_ascii_uppercase()).unwrap_or(SensorOutcome::NoData);
        out.push((id.clone(), outcome));
    }
    if !by_id.is_empty() {
        debug!("Ignoring {} device(s) that were not requested", by_id.len());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn load_fixture() -> String {
        std::fs::read_to_string("tests/data/lastmeasurement.json").expect("fixture present")
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn maps_fixture_to_requested_ids() {
        let body = load_fixture();
        let requested = ids(&[
            "0123456789AB",
            "c0ffee56789a",
            "0812345678AB",
            "MISSING00000",
            "BROKEN000000",
            "0A1B2C3D4E5F",
        ]);
        let out = parse_response(&body, &requested).expect("fixture parses");

        assert_eq!(out.len(), requested.len());
        assert_eq!(out[0].0, "0123456789AB");
        match &out[0].1 {
            SensorOutcome::Payload(p) => {
                assert_eq!(p.deviceid, "0123456789AB");
                assert!(p.measurement.as_ref().is_some_and(|m| m.contains_key("t1")));
            }
            other => panic!("expected payload, got {:?}", other),
        }
        // requested in lower case, answered in upper case
        assert!(matches!(out[1].1, SensorOutcome::Payload(_)));
        assert!(matches!(out[2].1, SensorOutcome::Payload(_)));
        assert!(matches!(out[3].1, SensorOutcome::NoData));
        match &out[4].1 {
            SensorOutcome::Failed(e) => {
                assert_eq!(e.kind(), ErrorKind::MalformedPayload);
                assert_eq!(e.sensor_id(), Some("BROKEN000000"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        // informational fields of an unexpected type do not cost the measurement
        match &out[5].1 {
            SensorOutcome::Payload(p) => {
                assert_eq!(p.lastseen, None);
                assert_eq!(p.lowbattery, None);
                assert!(p.measurement.is_some());
            }
            other => panic!("expected payload, got {:?}", other),
        }
    }

    #[test]
    fn unsuccessful_envelope_is_upstream_error() {
        let body = r#"{"success": false, "errorcode": 3, "errormessage": "too many requests"}"#;
        let err = parse_response(body, &ids(&["0123456789AB"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamError);
        assert!(err.to_string().contains("too many requests"));
    }

    #[test]
    fn garbage_body_is_malformed_payload() {
        let err = parse_response("<html>502 Bad Gateway</html>", &ids(&["0123456789AB"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedPayload);
        assert_eq!(err.sensor_id(), None);

        let err = parse_response(r#"{"success": "yes"}"#, &ids(&["0123456789AB"])).unwrap_err();
        assert!(err.to_string().contains("success"), "path in message: {}", err);
    }

    #[test]
    fn device_without_measurement_is_no_data() {
        let body = r#"{"success": true, "devices": [{"deviceid": "0123456789AB", "lastseen": 1748779200}]}"#;
        let out = parse_response(body, &ids(&["0123456789AB"])).unwrap();
        assert!(matches!(out[0].1, SensorOutcome::NoData));
    }

    #[test]
    fn unreachable_endpoint_is_network_failure() {
        // port 9 (discard) on localhost is closed on any sane test host
        let client = SensorApiClient::new(
            "http://127.0.0.1:9/api/pv1/device/lastmeasurement",
            None,
            Duration::from_secs(2),
            DEFAULT_MAX_IDS_PER_REQUEST,
        );
        let err = client.fetch_batch(&ids(&["0123456789AB"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkFailure);
    }

    #[test]
    fn batch_size_is_at_least_one() {
        let client = SensorApiClient::new(DEFAULT_API_URL, None, Duration::from_secs(1), 0);
        assert_eq!(client.max_ids_per_request(), 1);
    }
}
