//! Lane coverage checks on an entrant's runs.
//!
//! A finished entrant should have exactly one included run on every lane.
//! These checks only feed warnings; nothing is refused because of them.

use serde::{Deserialize, Serialize};

use crate::entrant::Entrant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaneIssueKind {
    Missing,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneIssue {
    #[serde(rename = "type")]
    pub kind: LaneIssueKind,
    /// Lane number, 1-indexed
    pub lane: usize,
    /// Included runs on the lane: 0 when missing, 2 or more when duplicated
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneValidation {
    pub is_valid: bool,
    pub missing_lanes: Vec<usize>,
    pub duplicate_lanes: Vec<usize>,
    pub issues: Vec<LaneIssue>,
}

/// Count included runs per lane and report lanes with none or more than one.
/// Runs on lanes outside `1..=lane_count` are ignored.
pub fn validate_entrant_lanes(entrant: &Entrant, lane_count: usize) -> LaneValidation {
    let mut counts = vec![0usize; lane_count];
    for run in entrant.runs.iter().filter(|r| r.is_included) {
        if (1..=lane_count).contains(&run.lane) {
            counts[run.lane - 1] += 1;
        }
    }

    let mut missing_lanes = Vec::new();
    let mut duplicate_lanes = Vec::new();
    let mut issues = Vec::new();
    for (i, &count) in counts.iter().enumerate() {
        let lane = i + 1;
        let kind = match count {
            0 => LaneIssueKind::Missing,
            1 => continue,
            _ => LaneIssueKind::Duplicate,
        };
        match kind {
            LaneIssueKind::Missing => missing_lanes.push(lane),
            LaneIssueKind::Duplicate => duplicate_lanes.push(lane),
        }
        issues.push(LaneIssue { kind, lane, count });
    }

    LaneValidation {
        is_valid: issues.is_empty(),
        missing_lanes,
        duplicate_lanes,
        issues,
    }
}

impl std::fmt::Display for LaneValidation {
    /// `Missing lanes: 2, 3 · Duplicate lane: 1 (2x)`, empty when valid.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if !self.missing_lanes.is_empty() {
            let lanes: Vec<String> = self.missing_lanes.iter().map(|l| l.to_string()).collect();
            parts.push(format!(
                "Missing {}: {}",
                plural("lane", lanes.len()),
                lanes.join(", ")
            ));
        }
        if !self.duplicate_lanes.is_empty() {
            let lanes: Vec<String> = self
                .issues
                .iter()
                .filter(|i| i.kind == LaneIssueKind::Duplicate)
                .map(|i| format!("{} ({}x)", i.lane, i.count))
                .collect();
            parts.push(format!(
                "Duplicate {}: {}",
                plural("lane", lanes.len()),
                lanes.join(", ")
            ));
        }
        write!(f, "{}", parts.join(" · "))
    }
}

fn plural(word: &str, n: usize) -> String {
    if n > 1 {
        format!("{}s", word)
    } else {
        word.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entrant::{EntrantStatus, RunSource};
    use chrono::Utc;

    fn entrant_with_lanes(lanes: &[usize]) -> Entrant {
        let now = Utc::now();
        let mut e = Entrant::new(1, "Kim", "Bolt", "Wolves").with_status(EntrantStatus::Registered);
        for (i, &lane) in lanes.iter().enumerate() {
            e.record_run(3.0, lane, Some(RunSource::scheduled(1, i as i64 + 1)), now);
        }
        e
    }

    #[test]
    fn test_full_coverage_is_valid() {
        let v = validate_entrant_lanes(&entrant_with_lanes(&[1, 2, 3, 4]), 4);
        assert!(v.is_valid);
        assert!(v.issues.is_empty());
        assert_eq!(v.to_string(), "");
    }

    #[test]
    fn test_missing_and_duplicate() {
        let v = validate_entrant_lanes(&entrant_with_lanes(&[1, 1, 4, 7]), 4);
        assert!(!v.is_valid);
        assert_eq!(v.missing_lanes, vec![2, 3]);
        assert_eq!(v.duplicate_lanes, vec![1]);
        assert_eq!(
            v.issues[0],
            LaneIssue {
                kind: LaneIssueKind::Duplicate,
                lane: 1,
                count: 2
            }
        );
        assert_eq!(v.to_string(), "Missing lanes: 2, 3 · Duplicate lane: 1 (2x)");
    }

    #[test]
    fn test_excluded_runs_do_not_count() {
        let mut e = entrant_with_lanes(&[1, 2, 2]);
        e.set_run_included(2, false).unwrap();
        let v = validate_entrant_lanes(&e, 2);
        assert!(v.is_valid);

        e.set_run_included(1, false).unwrap();
        assert_eq!(validate_entrant_lanes(&e, 2).to_string(), "Missing lane: 2");
    }
}
