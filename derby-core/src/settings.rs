//! Persisted race settings.

use serde::{Deserialize, Serialize};

use crate::error::RaceError;
use crate::protocol::ServoCalibration;
use crate::schedule::HeatAlgorithm;

pub const DEFAULT_LANE_COUNT: usize = 4;
pub const DEFAULT_GATE_UP_ANGLE: f64 = 90.0;
pub const DEFAULT_GATE_DOWN_ANGLE: f64 = 0.0;

/// What the public results screen shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresentationKind {
    Speed,
    Beauty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presentation {
    #[serde(rename = "type")]
    pub kind: PresentationKind,
    #[serde(default)]
    pub division: Option<String>,
    #[serde(default)]
    pub is_visible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceSettings {
    pub lane_count: usize,
    /// Servo angle with the gate holding the cars
    pub gate_up_angle: f64,
    /// Servo angle with the gate released
    pub gate_down_angle: f64,
    /// Timing controller, host[:port] with optional scheme
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller_address: Option<String>,
    pub heat_algorithm: HeatAlgorithm,
    pub divisions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presentation: Option<Presentation>,
}

impl Default for RaceSettings {
    fn default() -> Self {
        RaceSettings {
            lane_count: DEFAULT_LANE_COUNT,
            gate_up_angle: DEFAULT_GATE_UP_ANGLE,
            gate_down_angle: DEFAULT_GATE_DOWN_ANGLE,
            controller_address: None,
            heat_algorithm: HeatAlgorithm::default(),
            divisions: Vec::new(),
            presentation: None,
        }
    }
}

/// Operator changes to the settings. Missing fields stay as they are.
///
/// The calibration and the controller address have their own endpoints
/// because changing them also talks to the hardware.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SettingsUpdate {
    pub lane_count: Option<usize>,
    pub heat_algorithm: Option<HeatAlgorithm>,
    pub divisions: Option<Vec<String>>,
    pub presentation: Option<Presentation>,
}

impl RaceSettings {
    /// Apply an update, or nothing at all if any field is invalid.
    pub fn apply(&mut self, update: SettingsUpdate) -> Result<(), RaceError> {
        if update.lane_count == Some(0) {
            return Err(RaceError::InvalidLaneCount(0));
        }
        if let Some(lane_count) = update.lane_count {
            self.lane_count = lane_count;
        }
        if let Some(heat_algorithm) = update.heat_algorithm {
            self.heat_algorithm = heat_algorithm;
        }
        if let Some(divisions) = update.divisions {
            self.divisions = divisions
                .into_iter()
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .collect();
        }
        if let Some(presentation) = update.presentation {
            self.presentation = Some(presentation);
        }
        Ok(())
    }

    pub fn calibration(&self) -> ServoCalibration {
        ServoCalibration {
            up_angle: self.gate_up_angle,
            down_angle: self.gate_down_angle,
        }
    }

    pub fn set_calibration(&mut self, calibration: ServoCalibration) {
        self.gate_up_angle = calibration.up_angle;
        self.gate_down_angle = calibration.down_angle;
    }

    /// Configured controller address, ignoring blank strings.
    pub fn controller_address(&self) -> Option<&str> {
        self.controller_address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }

    /// Take the results off the public screen. Returns whether it was showing.
    pub fn hide_presentation(&mut self) -> bool {
        match self.presentation.as_mut() {
            Some(p) if p.is_visible => {
                p.is_visible = false;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let settings: RaceSettings = serde_json::from_str(r#"{"lane_count": 6}"#).unwrap();
        assert_eq!(settings.lane_count, 6);
        assert_eq!(settings.gate_up_angle, DEFAULT_GATE_UP_ANGLE);
        assert_eq!(settings.heat_algorithm, HeatAlgorithm::Rotation);
        assert_eq!(settings.controller_address(), None);
    }

    #[test]
    fn test_blank_address_is_unset() {
        let settings = RaceSettings {
            controller_address: Some("   ".to_string()),
            ..Default::default()
        };
        assert_eq!(settings.controller_address(), None);
    }

    #[test]
    fn test_hide_presentation() {
        let mut settings: RaceSettings = serde_json::from_str(
            r#"{"presentation": {"type": "speed", "division": "Wolves", "is_visible": true}}"#,
        )
        .unwrap();
        assert!(settings.hide_presentation());
        assert!(!settings.hide_presentation());
        let p = settings.presentation.unwrap();
        assert_eq!(p.kind, PresentationKind::Speed);
        assert!(!p.is_visible);

        assert!(!RaceSettings::default().hide_presentation());
    }

    #[test]
    fn test_apply_partial_update() {
        let mut settings = RaceSettings::default();
        let update: SettingsUpdate = serde_json::from_str(
            r#"{"heat_algorithm": "chaos", "divisions": [" Wolves ", "", "Bears"]}"#,
        )
        .unwrap();
        settings.apply(update).unwrap();
        assert_eq!(settings.heat_algorithm, HeatAlgorithm::Chaos);
        assert_eq!(settings.divisions, vec!["Wolves", "Bears"]);
        assert_eq!(settings.lane_count, DEFAULT_LANE_COUNT);

        let before = settings.clone();
        let bad = SettingsUpdate {
            lane_count: Some(0),
            heat_algorithm: Some(HeatAlgorithm::Rotation),
            ..Default::default()
        };
        assert_eq!(settings.apply(bad), Err(RaceError::InvalidLaneCount(0)));
        assert_eq!(settings, before);
    }
}
