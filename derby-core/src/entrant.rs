//! Entrants and their permanent run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RaceError;
use crate::heat::HeatId;

/// Entrant (car) number, unique within an event.
pub type EntrantId = u32;

/// Check-in status of an entrant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntrantStatus {
    /// Registration form started but not submitted
    Started,
    /// Waiting for inspection
    Review,
    /// Checked in for speed and beauty
    Registered,
    /// Checked in, competing for beauty only (still runs heats)
    RegisteredBeauty,
    Disqualified,
    /// Runs for fun, times never count
    Courtesy,
}

impl Default for EntrantStatus {
    fn default() -> Self {
        EntrantStatus::Started
    }
}

impl EntrantStatus {
    /// Whether check-in is finished for this entrant, one way or another.
    pub fn is_checked_in(&self) -> bool {
        matches!(
            self,
            EntrantStatus::Registered
                | EntrantStatus::RegisteredBeauty
                | EntrantStatus::Courtesy
                | EntrantStatus::Disqualified
        )
    }

    /// Whether this entrant gets scheduled into heats.
    pub fn is_race_eligible(&self) -> bool {
        matches!(
            self,
            EntrantStatus::Registered | EntrantStatus::RegisteredBeauty | EntrantStatus::Courtesy
        )
    }
}

impl std::fmt::Display for EntrantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntrantStatus::Started => write!(f, "STARTED"),
            EntrantStatus::Review => write!(f, "REVIEW"),
            EntrantStatus::Registered => write!(f, "REGISTERED"),
            EntrantStatus::RegisteredBeauty => write!(f, "REGISTERED_BEAUTY"),
            EntrantStatus::Disqualified => write!(f, "DISQUALIFIED"),
            EntrantStatus::Courtesy => write!(f, "COURTESY"),
        }
    }
}

/// The heat a run came from.
///
/// Scheduled heat ids start over at 1 with every new schedule, so they are
/// qualified by the schedule number. Manual heat ids never repeat and carry
/// no schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunSource {
    pub heat_id: HeatId,
    pub schedule_id: Option<u32>,
}

impl RunSource {
    pub fn scheduled(schedule_id: u32, heat_id: HeatId) -> Self {
        RunSource {
            heat_id,
            schedule_id: Some(schedule_id),
        }
    }

    pub fn manual(heat_id: HeatId) -> Self {
        RunSource {
            heat_id,
            schedule_id: None,
        }
    }
}

/// One timed run down one lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Finish time in seconds
    pub time: f64,
    /// Lane number, 1-indexed
    pub lane: usize,
    pub timestamp: DateTime<Utc>,
    pub is_included: bool,
    /// Heat that produced this run; missing on runs imported from elsewhere
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heat_id: Option<HeatId>,
    /// Schedule `heat_id` belonged to, missing for manual heats
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<u32>,
}

impl Run {
    pub fn source(&self) -> Option<RunSource> {
        self.heat_id.map(|heat_id| RunSource {
            heat_id,
            schedule_id: self.schedule_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entrant {
    pub id: EntrantId,
    pub owner_name: String,
    pub entry_name: String,
    #[serde(default)]
    pub division: String,
    #[serde(default)]
    pub status: EntrantStatus,
    #[serde(default)]
    pub runs: Vec<Run>,
    /// Mean of the included run times, kept in step with `runs`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_time: Option<f64>,
}

/// A registration as submitted at the desk.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewEntrant {
    pub owner_name: String,
    pub entry_name: String,
    #[serde(default)]
    pub division: String,
}

/// Corrections to an entrant's details. Missing fields stay as they are.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EntrantUpdate {
    pub owner_name: Option<String>,
    pub entry_name: Option<String>,
    pub division: Option<String>,
}

fn required(value: &str, field: &'static str) -> Result<String, RaceError> {
    match value.trim() {
        "" => Err(RaceError::BlankField(field)),
        trimmed => Ok(trimmed.to_string()),
    }
}

/// Add an entrant with the next free number, in `Started` status.
pub fn register_entrant(entrants: &mut Vec<Entrant>, new: NewEntrant) -> Result<&Entrant, RaceError> {
    let owner_name = required(&new.owner_name, "owner_name")?;
    let entry_name = required(&new.entry_name, "entry_name")?;
    let id = entrants.iter().map(|e| e.id).max().unwrap_or(0) + 1;
    entrants.push(Entrant::new(id, &owner_name, &entry_name, new.division.trim()));
    let last = entrants.len() - 1;
    Ok(&entrants[last])
}

impl Entrant {
    /// Apply corrections, or nothing at all if a name would end up blank.
    pub fn apply(&mut self, update: EntrantUpdate) -> Result<(), RaceError> {
        let owner_name = update
            .owner_name
            .map(|v| required(&v, "owner_name"))
            .transpose()?;
        let entry_name = update
            .entry_name
            .map(|v| required(&v, "entry_name"))
            .transpose()?;
        if let Some(owner_name) = owner_name {
            self.owner_name = owner_name;
        }
        if let Some(entry_name) = entry_name {
            self.entry_name = entry_name;
        }
        if let Some(division) = update.division {
            self.division = division.trim().to_string();
        }
        Ok(())
    }

    pub fn new(id: EntrantId, owner_name: &str, entry_name: &str, division: &str) -> Self {
        Entrant {
            id,
            owner_name: owner_name.to_string(),
            entry_name: entry_name.to_string(),
            division: division.to_string(),
            status: EntrantStatus::Started,
            runs: Vec::new(),
            average_time: None,
        }
    }

    pub fn with_status(mut self, status: EntrantStatus) -> Self {
        self.status = status;
        self
    }

    /// Append a run and refresh the average.
    ///
    /// Courtesy entrants get the run recorded with `is_included = false`, so
    /// it never reaches the average.
    pub fn record_run(
        &mut self,
        time: f64,
        lane: usize,
        source: Option<RunSource>,
        timestamp: DateTime<Utc>,
    ) -> &Run {
        let is_included = self.status != EntrantStatus::Courtesy;
        self.runs.push(Run {
            time,
            lane,
            timestamp,
            is_included,
            heat_id: source.map(|s| s.heat_id),
            schedule_id: source.and_then(|s| s.schedule_id),
        });
        self.recompute_average();
        let last = self.runs.len() - 1;
        &self.runs[last]
    }

    /// Drop every run that came from `source`. Returns how many were removed.
    pub fn remove_runs_from(&mut self, source: RunSource) -> usize {
        let before = self.runs.len();
        self.runs.retain(|r| r.source() != Some(source));
        let removed = before - self.runs.len();
        if removed > 0 {
            self.recompute_average();
        }
        removed
    }

    /// Include or exclude a run from the average.
    pub fn set_run_included(&mut self, index: usize, is_included: bool) -> Result<(), RaceError> {
        let run = self.runs.get_mut(index).ok_or(RaceError::RunNotFound {
            entrant_id: self.id,
            index,
        })?;
        run.is_included = is_included;
        self.recompute_average();
        Ok(())
    }

    pub fn recompute_average(&mut self) {
        let (sum, count) = self
            .runs
            .iter()
            .filter(|r| r.is_included)
            .fold((0.0, 0usize), |(sum, count), r| (sum + r.time, count + 1));
        self.average_time = if count > 0 {
            Some(sum / count as f64)
        } else {
            None
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Option<f64>, b: f64) -> bool {
        a.map(|a| (a - b).abs() < 1e-9).unwrap_or(false)
    }

    #[test]
    fn test_average_recomputation() {
        let now = Utc::now();
        let mut e = Entrant::new(7, "Sam", "Blue Flash", "Wolves").with_status(EntrantStatus::Registered);
        assert_eq!(e.average_time, None);

        e.record_run(8.512, 1, Some(RunSource::scheduled(1, 1)), now);
        assert!(close(e.average_time, 8.512));

        e.record_run(8.0, 2, Some(RunSource::scheduled(1, 2)), now);
        assert!(close(e.average_time, 8.256));

        e.set_run_included(0, false).unwrap();
        assert!(close(e.average_time, 8.0));

        e.set_run_included(1, false).unwrap();
        assert_eq!(e.average_time, None);
    }

    #[test]
    fn test_courtesy_runs_excluded() {
        let now = Utc::now();
        let mut e = Entrant::new(3, "Ana", "Rocket", "Bears").with_status(EntrantStatus::Courtesy);
        let run = e.record_run(9.1, 1, Some(RunSource::manual(-4)), now);
        assert!(!run.is_included);
        assert_eq!(e.runs.len(), 1);
        assert_eq!(e.average_time, None);
    }

    #[test]
    fn test_remove_runs_from_source() {
        let now = Utc::now();
        let mut e = Entrant::new(1, "Lee", "Zoom", "Tigers").with_status(EntrantStatus::Registered);
        e.record_run(3.0, 1, Some(RunSource::scheduled(1, 1)), now);
        e.record_run(4.0, 2, Some(RunSource::scheduled(1, 2)), now);
        e.record_run(5.0, 3, None, now);
        e.record_run(6.0, 4, Some(RunSource::scheduled(2, 2)), now);

        assert_eq!(e.remove_runs_from(RunSource::scheduled(1, 2)), 1);
        assert_eq!(e.runs.len(), 3);
        assert!(close(e.average_time, 14.0 / 3.0));
        assert_eq!(e.remove_runs_from(RunSource::scheduled(1, 2)), 0);
        assert_eq!(e.remove_runs_from(RunSource::manual(2)), 0);
        assert_eq!(e.runs[2].source(), Some(RunSource::scheduled(2, 2)));
    }

    #[test]
    fn test_set_run_included_unknown_index() {
        let mut e = Entrant::new(1, "Lee", "Zoom", "Tigers");
        assert_eq!(
            e.set_run_included(0, true),
            Err(RaceError::RunNotFound {
                entrant_id: 1,
                index: 0
            })
        );
    }

    #[test]
    fn test_status_classes() {
        assert!(!EntrantStatus::Review.is_checked_in());
        assert!(EntrantStatus::Disqualified.is_checked_in());
        assert!(!EntrantStatus::Disqualified.is_race_eligible());
        assert!(EntrantStatus::Courtesy.is_race_eligible());
        assert_eq!(
            serde_json::to_string(&EntrantStatus::RegisteredBeauty).unwrap(),
            "\"REGISTERED_BEAUTY\""
        );
    }

    #[test]
    fn test_register_takes_next_number() {
        let mut entrants = vec![Entrant::new(4, "Lee", "Zoom", "Tigers")];
        let new = NewEntrant {
            owner_name: " Kit ".to_string(),
            entry_name: "Dart".to_string(),
            division: "Wolves".to_string(),
        };
        let added = register_entrant(&mut entrants, new.clone()).unwrap();
        assert_eq!(added.id, 5);
        assert_eq!(added.owner_name, "Kit");
        assert_eq!(added.status, EntrantStatus::Started);

        let mut empty = Vec::new();
        assert_eq!(register_entrant(&mut empty, new).unwrap().id, 1);

        let blank = NewEntrant {
            owner_name: "Kit".to_string(),
            entry_name: "  ".to_string(),
            division: String::new(),
        };
        assert_eq!(
            register_entrant(&mut empty, blank),
            Err(RaceError::BlankField("entry_name"))
        );
        assert_eq!(empty.len(), 1);
    }

    #[test]
    fn test_update_is_all_or_nothing() {
        let mut e = Entrant::new(1, "Lee", "Zoom", "Tigers");
        let update: EntrantUpdate = serde_json::from_str(r#"{"division": "Bears"}"#).unwrap();
        e.apply(update).unwrap();
        assert_eq!(e.division, "Bears");
        assert_eq!(e.entry_name, "Zoom");

        let bad = EntrantUpdate {
            entry_name: Some("Comet".to_string()),
            owner_name: Some(String::new()),
            division: None,
        };
        assert_eq!(e.apply(bad), Err(RaceError::BlankField("owner_name")));
        assert_eq!(e.entry_name, "Zoom");
    }
}
