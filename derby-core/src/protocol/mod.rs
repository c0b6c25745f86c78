//! Timing controller wire contract.
//!
//! The controller exposes a WebSocket status stream and a small REST API.
//! This module holds the JSON message types, the endpoint paths and the
//! address handling shared by both. No I/O happens here.
//!
//! # Example
//!
//! ```rust
//! use derby_core::protocol::{self, StatusMessage};
//!
//! assert_eq!(protocol::status_url("192.168.1.50:8000"), "ws://192.168.1.50:8000/ws/status");
//! assert_eq!(protocol::command_base_url("wss://track.local"), "https://track.local");
//!
//! let json = r#"{"type":"hardware_status","data":{"is_gate_down":false,
//!     "servo_angle":90,"sensors":[{"lane":1,"is_blocked":true}],"timestamp_ms":1000}}"#;
//! match StatusMessage::parse(json).unwrap() {
//!     StatusMessage::HardwareStatus(status) => assert!(status.sensors[0].is_blocked),
//!     _ => unreachable!(),
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::heat::HeatId;

pub const STATUS_PATH: &str = "/ws/status";
pub const HEALTH_PATH: &str = "/health";
pub const GATE_PATH: &str = "/gate";
pub const SERVO_TEST_PATH: &str = "/servo/test";
pub const SERVO_CALIBRATION_PATH: &str = "/servo/calibration";
pub const RUN_HEAT_PATH: &str = "/race/run";

/// One start-line sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorState {
    /// Lane number, 1-indexed
    pub lane: usize,
    pub is_blocked: bool,
}

/// Snapshot pushed on the status stream, roughly 20 times a second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareStatus {
    pub is_gate_down: bool,
    pub servo_angle: f64,
    #[serde(default)]
    pub sensors: Vec<SensorState>,
    /// Controller clock, milliseconds
    pub timestamp_ms: u64,
}

impl HardwareStatus {
    /// Whether a car is staged on the given 1-indexed lane.
    pub fn is_lane_blocked(&self, lane: usize) -> bool {
        self.sensors.iter().any(|s| s.lane == lane && s.is_blocked)
    }
}

/// Envelope of every message on the status stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StatusMessage {
    HardwareStatus(HardwareStatus),
    /// Pushed when a heat finishes
    RaceResult(HeatResult),
    /// Anything else the controller may add later
    #[serde(other)]
    Unknown,
}

impl StatusMessage {
    pub fn parse(text: &str) -> Result<StatusMessage, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Body of `POST /race/run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeatSetup {
    pub heat_id: String,
    /// 1-indexed lane numbers with a car in them
    pub occupied_lanes: Vec<usize>,
}

impl HeatSetup {
    pub fn new(heat_id: HeatId, occupied_lanes: Vec<usize>) -> Self {
        HeatSetup {
            heat_id: heat_wire_id(heat_id),
            occupied_lanes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneResult {
    pub lane_number: usize,
    #[serde(default)]
    pub finish_time_ms: Option<f64>,
    #[serde(default)]
    pub place: Option<u32>,
    #[serde(default)]
    pub is_dnf: bool,
}

impl LaneResult {
    /// Finish time in seconds, milliseconds rounded first.
    /// `None` for a DNF or when the controller has no time.
    pub fn seconds(&self) -> Option<f64> {
        if self.is_dnf {
            return None;
        }
        self.finish_time_ms
            .filter(|ms| ms.is_finite())
            .map(|ms| ms.round() / 1000.0)
    }
}

/// Response of `POST /race/run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatResult {
    pub heat_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lane_results: Vec<LaneResult>,
    #[serde(default)]
    pub is_complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatePosition {
    pub is_down: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServoTestRequest {
    pub angle: f64,
}

/// Servo angles for the two gate positions, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServoCalibration {
    /// Gate holding the cars
    pub up_angle: f64,
    /// Gate released
    pub down_angle: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub num_tracks: usize,
    pub is_gate_down: bool,
    #[serde(default)]
    pub current_heat_id: Option<String>,
}

/// Heat id as the controller sees it.
pub fn heat_wire_id(heat_id: HeatId) -> String {
    format!("heat-{}", heat_id)
}

/// Split a configured address into its scheme (if any) and the rest.
fn split_scheme(address: &str) -> (Option<&str>, &str) {
    let address = address.trim().trim_end_matches('/');
    for scheme in ["ws", "wss", "http", "https"] {
        if let Some(rest) = address
            .strip_prefix(scheme)
            .and_then(|r| r.strip_prefix("://"))
        {
            return (Some(scheme), rest);
        }
    }
    (None, address)
}

/// WebSocket URL of the status stream.
///
/// `ws://` and `wss://` are kept, `http://` becomes `ws://`, `https://`
/// becomes `wss://` and a bare host gets `ws://`.
pub fn status_url(address: &str) -> String {
    let (scheme, rest) = split_scheme(address);
    let scheme = match scheme {
        Some("wss") | Some("https") => "wss",
        _ => "ws",
    };
    format!("{}://{}{}", scheme, rest, STATUS_PATH)
}

/// Base URL for REST commands, same mapping in the other direction.
pub fn command_base_url(address: &str) -> String {
    let (scheme, rest) = split_scheme(address);
    let scheme = match scheme {
        Some("wss") | Some("https") => "https",
        _ => "http",
    };
    format!("{}://{}", scheme, rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_url_normalization() {
        assert_eq!(status_url("ws://pi:8000"), "ws://pi:8000/ws/status");
        assert_eq!(status_url("wss://pi"), "wss://pi/ws/status");
        assert_eq!(status_url("http://10.0.0.2:8000"), "ws://10.0.0.2:8000/ws/status");
        assert_eq!(status_url("https://track.example"), "wss://track.example/ws/status");
        assert_eq!(status_url("pi.local:8000/"), "ws://pi.local:8000/ws/status");
    }

    #[test]
    fn test_command_base_url() {
        assert_eq!(command_base_url("http://pi:8000/"), "http://pi:8000");
        assert_eq!(command_base_url("ws://pi:8000"), "http://pi:8000");
        assert_eq!(command_base_url("https://pi"), "https://pi");
        assert_eq!(command_base_url(" pi.local "), "http://pi.local");
    }

    #[test]
    fn test_lane_result_seconds() {
        let mut r = LaneResult {
            lane_number: 1,
            finish_time_ms: Some(2845.4),
            place: Some(1),
            is_dnf: false,
        };
        assert_eq!(r.seconds(), Some(2.845));
        r.finish_time_ms = Some(2845.5);
        assert_eq!(r.seconds(), Some(2.846));
        r.is_dnf = true;
        assert_eq!(r.seconds(), None);
        r.is_dnf = false;
        r.finish_time_ms = None;
        assert_eq!(r.seconds(), None);
    }

    #[test]
    fn test_status_message_types() {
        let msg = StatusMessage::parse(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(msg, StatusMessage::Unknown);

        let status = HardwareStatus {
            is_gate_down: true,
            servo_angle: 0.0,
            sensors: vec![SensorState {
                lane: 2,
                is_blocked: true,
            }],
            timestamp_ms: 42,
        };
        let json = serde_json::to_string(&StatusMessage::HardwareStatus(status.clone())).unwrap();
        assert!(json.starts_with(r#"{"type":"hardware_status","data":"#));
        assert!(status.is_lane_blocked(2));
        assert!(!status.is_lane_blocked(1));

        assert!(StatusMessage::parse("not json").is_err());
    }

    #[test]
    fn test_heat_setup_wire_shape() {
        let setup = HeatSetup::new(-2, vec![1, 3]);
        assert_eq!(
            serde_json::to_value(&setup).unwrap(),
            serde_json::json!({"heat_id": "heat--2", "occupied_lanes": [1, 3]})
        );
    }

    #[test]
    fn test_heat_result_defaults() {
        let result: HeatResult = serde_json::from_str(
            r#"{"heat_id":"heat-1","started_at":"2024-05-01T10:00:00Z",
                "lane_results":[{"lane_number":2,"finish_time_ms":null,"is_dnf":true}]}"#,
        )
        .unwrap();
        assert!(!result.is_complete);
        assert_eq!(result.lane_results[0].place, None);
        assert_eq!(result.lane_results[0].seconds(), None);
    }
}
