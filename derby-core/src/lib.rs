//! # Derby Core
//!
//! Platform-independent heat scheduling and race control for lane racing
//! events (pinewood derby style: cars released together down parallel
//! lanes by a gate, finish times taken by a timing controller).
//!
//! This crate holds the data model and every decision the race makes, with
//! **zero I/O dependencies**. Persistence, the controller connection and the
//! operator API live in `derby-server`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  derby-core (pure, no tokio/async deps)                     │
//! │  ├── schedule/    (rotation and chaos heat generation)      │
//! │  ├── race         (race aggregate, lifecycle)               │
//! │  ├── control      (heat phases, result folding)             │
//! │  ├── validation   (lane coverage warnings)                  │
//! │  ├── standings    (speed ranking)                           │
//! │  ├── connection   (link state machine, staleness)           │
//! │  └── protocol/    (timing controller wire contract)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                 ┌────────────┴────────────┐
//!                 │  derby-server           │
//!                 │  (store, link, REST)    │
//!                 └─────────────────────────┘
//! ```
//!
//! ## Key Modules
//!
//! - [`schedule`] - Heat scheduler, every entrant once on every lane
//! - [`race`] - Race state and the Registration/Racing/Complete lifecycle
//! - [`control`] - Per-heat phases and folding lane times into entrants
//! - [`connection`] - Connection state machine with staleness detection
//! - [`protocol`] - Controller message types and address handling
//!
//! ## Example: Scheduling and recording a heat
//!
//! ```rust
//! use chrono::Utc;
//! use derby_core::{control, Entrant, EntrantStatus, HeatAlgorithm, Race};
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//!
//! let mut entrants: Vec<Entrant> = (1..=5)
//!     .map(|id| Entrant::new(id, "Owner", "Car", "Wolves").with_status(EntrantStatus::Registered))
//!     .collect();
//! let mut race = Race::new();
//! let mut rng = StdRng::seed_from_u64(7);
//!
//! let count = control::schedule_heats(&mut race, &entrants, &[], 4, HeatAlgorithm::Rotation, &mut rng)
//!     .unwrap();
//! assert_eq!(count, 5);
//!
//! let heat_id = race.current_heat_id.unwrap();
//! let lane = race.heat(heat_id).unwrap().occupied_lanes()[0] - 1;
//! control::record_lane_time(&mut race, &mut entrants, heat_id, lane, 2.91, Utc::now()).unwrap();
//! ```

pub mod connection;
pub mod control;
pub mod entrant;
pub mod error;
pub mod heat;
pub mod protocol;
pub mod race;
pub mod schedule;
pub mod settings;
pub mod standings;
pub mod validation;

// Re-export commonly used types
pub use connection::{ConnectionManager, ConnectionState};
pub use control::{HeatControl, HeatPhase, LaneRecord};
pub use entrant::{Entrant, EntrantId, EntrantStatus, EntrantUpdate, NewEntrant, Run, RunSource};
pub use error::RaceError;
pub use heat::{Heat, HeatId, Lane};
pub use protocol::{HardwareStatus, HeatResult, LaneResult, ServoCalibration};
pub use race::{Race, RaceState};
pub use schedule::HeatAlgorithm;
pub use settings::{Presentation, PresentationKind, RaceSettings, SettingsUpdate};
pub use standings::{speed_standings, Standing};
pub use validation::{validate_entrant_lanes, LaneIssue, LaneIssueKind, LaneValidation};
