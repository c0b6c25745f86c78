//! Race control: the operations an operator runs during an event.
//!
//! [`RaceControl`] owns the store and the heat phase and drives the timing
//! controller. Every method takes `&mut self`; the web layer keeps it behind
//! a mutex so there is exactly one writer. A snapshot of the race is
//! published on a `watch` channel after every save so readers never wait for
//! a heat to finish.
//!
//! Hardware trouble never fails an operation. A heat the controller could
//! not time simply keeps its lanes open for manual entry, and the reason is
//! published as a [`ControlEvent`].

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use derby_core::{
    control::{self, LaneRecord},
    entrant::register_entrant,
    protocol::LaneResult,
    speed_standings, validate_entrant_lanes, Entrant, EntrantId, EntrantStatus, EntrantUpdate,
    HeatControl, HeatId, HeatPhase, LaneValidation, NewEntrant, Race, RaceError, RaceSettings,
    RaceState, SettingsUpdate, Standing,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinError;

use crate::hardware::{RunHeatOutcome, TimingController};
use crate::storage::{RaceStore, StorageError};

pub const DEFAULT_COUNTDOWN: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum ControlError {
    #[error(transparent)]
    Race(#[from] RaceError),
    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("Heat task failed: {0}")]
    Task(#[from] JoinError),
}

impl ControlError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ControlError::Race(
                RaceError::HeatNotFound(_)
                | RaceError::EntrantNotFound(_)
                | RaceError::RunNotFound { .. },
            ) => StatusCode::NOT_FOUND,
            ControlError::Race(
                RaceError::LaneOutOfRange { .. }
                | RaceError::EmptyLane { .. }
                | RaceError::InvalidTime(_)
                | RaceError::InvalidLaneCount(_)
                | RaceError::BlankField(_),
            ) => StatusCode::BAD_REQUEST,
            ControlError::Race(_) => StatusCode::CONFLICT,
            ControlError::Storage(_) | ControlError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Tell axum how to convert `ControlError` into a response.
impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        if matches!(self, ControlError::Storage(_) | ControlError::Task(_)) {
            log::error!("{}", self);
        }
        (self.status_code(), self.to_string()).into_response()
    }
}

/// Published for operator screens, mostly about hardware trouble.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEvent {
    GateRaiseFailed { error: String },
    CountdownStarted { heat_id: HeatId, countdown_end_epoch_ms: i64 },
    HeatCancelled { heat_id: HeatId },
    HardwareUnavailable { heat_id: HeatId, error: String },
    HeatFinished { heat_id: HeatId, awaiting_manual: Vec<usize> },
}

/// What the timing controller made of a heat.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HardwareOutcome {
    Timed,
    Cancelled,
    Unavailable { error: String },
    /// Nobody in the heat, nothing to run
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatReport {
    pub heat_id: HeatId,
    pub hardware: HardwareOutcome,
    pub recorded: Vec<LaneRecord>,
    /// Occupied lanes (0-indexed) still waiting for a time
    pub awaiting_manual: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NextHeat {
    pub current_heat_id: HeatId,
    /// The finished heat was the last one in the schedule
    pub was_last: bool,
}

/// Race control shared between request handlers, one writer at a time.
pub type SharedControl<S, C> = Arc<Mutex<RaceControl<S, C>>>;

pub struct RaceControl<S: RaceStore, C: TimingController> {
    store: S,
    controller: Arc<C>,
    heat: HeatControl,
    countdown: Duration,
    events: broadcast::Sender<ControlEvent>,
    race_tx: watch::Sender<Race>,
}

impl<S: RaceStore, C: TimingController + 'static> RaceControl<S, C> {
    pub fn new(store: S, controller: Arc<C>, countdown: Duration) -> Result<Self, ControlError> {
        let race = store.race()?;
        let (events, _) = broadcast::channel(32);
        let (race_tx, _) = watch::channel(race);
        Ok(RaceControl {
            store,
            controller,
            heat: HeatControl::new(),
            countdown,
            events,
            race_tx,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    /// Lets readers subscribe later without taking the control lock.
    pub fn event_sender(&self) -> broadcast::Sender<ControlEvent> {
        self.events.clone()
    }

    pub fn subscribe_race(&self) -> watch::Receiver<Race> {
        self.race_tx.subscribe()
    }

    pub fn heat_phase(&self) -> HeatPhase {
        self.heat.phase()
    }

    pub fn race(&self) -> Result<Race, ControlError> {
        Ok(self.store.race()?)
    }

    pub fn entrants(&self) -> Result<Vec<Entrant>, ControlError> {
        Ok(self.store.entrants()?)
    }

    pub fn settings(&self) -> Result<RaceSettings, ControlError> {
        Ok(self.store.settings()?)
    }

    pub fn update_settings(
        &mut self,
        update: impl FnOnce(&mut RaceSettings),
    ) -> Result<RaceSettings, ControlError> {
        let mut settings = self.store.settings()?;
        update(&mut settings);
        self.store.save_settings(&settings)?;
        Ok(settings)
    }

    /// Apply operator changes to lane count, algorithm, divisions or the
    /// public screen. Heats already generated keep their lanes.
    pub fn apply_settings(&mut self, update: SettingsUpdate) -> Result<RaceSettings, ControlError> {
        let mut settings = self.store.settings()?;
        settings.apply(update)?;
        self.store.save_settings(&settings)?;
        log::info!(
            "Settings: {} lanes, {}, divisions {:?}",
            settings.lane_count,
            settings.heat_algorithm.display_name(),
            settings.divisions
        );
        Ok(settings)
    }

    fn save_race(&mut self, race: &Race) -> Result<(), ControlError> {
        self.store.save_race(race)?;
        self.race_tx.send_replace(race.clone());
        Ok(())
    }

    fn emit(&self, event: ControlEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Advance the race one step (Registration -> Racing -> Complete).
    pub fn set_race_state(&mut self, target: RaceState) -> Result<Race, ControlError> {
        let mut race = self.store.race()?;
        let entrants = self.store.entrants()?;
        race.advance_to(target, &entrants)?;
        self.save_race(&race)?;
        log::info!("Race is now {}", race.state);

        if target == RaceState::Complete {
            let mut settings = self.store.settings()?;
            if settings.hide_presentation() {
                self.store.save_settings(&settings)?;
            }
        }
        Ok(race)
    }

    /// Set any state, skipping all checks.
    pub fn override_race_state(&mut self, target: RaceState) -> Result<Race, ControlError> {
        let mut race = self.store.race()?;
        log::warn!("Race state overridden from {} to {}", race.state, target);
        race.override_state(target);
        self.save_race(&race)?;
        Ok(race)
    }

    /// Replace the schedule with a fresh one for the eligible entrants,
    /// optionally only those in `divisions`.
    pub fn generate_heats(&mut self, divisions: &[String]) -> Result<Race, ControlError> {
        let mut race = self.store.race()?;
        let entrants = self.store.entrants()?;
        let settings = self.store.settings()?;
        let count = control::schedule_heats(
            &mut race,
            &entrants,
            divisions,
            settings.lane_count,
            settings.heat_algorithm,
            &mut rand::thread_rng(),
        )?;
        self.heat.reset();
        self.save_race(&race)?;
        log::info!(
            "Generated {} heats on {} lanes with {}",
            count,
            settings.lane_count,
            settings.heat_algorithm.display_name()
        );
        Ok(race)
    }

    /// Jump to another scheduled heat.
    pub fn select_heat(&mut self, heat_id: HeatId) -> Result<Race, ControlError> {
        let mut race = self.store.race()?;
        if !race.heats.iter().any(|h| h.id == heat_id) {
            return Err(RaceError::HeatNotFound(heat_id).into());
        }
        race.current_heat_id = Some(heat_id);
        self.heat.reset();
        self.save_race(&race)?;
        Ok(race)
    }

    /// Idle -> Ready. Raises the gate in the background.
    pub fn ready_heat(&mut self) -> Result<HeatId, ControlError> {
        let race = self.store.race()?;
        let heat_id = race.current_heat().ok_or(RaceError::NoCurrentHeat)?.id;
        self.heat.ready()?;
        log::info!("Heat {} ready, raising gate", heat_id);

        let controller = self.controller.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = controller.set_gate(false).await {
                log::warn!("Failed to raise gate: {}", e);
                let _ = events.send(ControlEvent::GateRaiseFailed {
                    error: e.to_string(),
                });
            }
        });
        Ok(heat_id)
    }

    /// Ready -> Racing. Clears the heat, counts down, runs it on the
    /// controller and folds whatever times come back.
    pub async fn drop_gate(&mut self) -> Result<HeatReport, ControlError> {
        let mut race = self.store.race()?;
        let mut entrants = self.store.entrants()?;
        let heat_id = race.current_heat().ok_or(RaceError::NoCurrentHeat)?.id;

        self.heat.start(heat_id)?;
        control::clear_heat_results(&mut race, &mut entrants, heat_id)?;

        let countdown_end = Utc::now().timestamp_millis() + self.countdown.as_millis() as i64;
        race.countdown_end_epoch_ms = Some(countdown_end);
        self.store.save_entrants(&entrants)?;
        self.save_race(&race)?;
        self.emit(ControlEvent::CountdownStarted {
            heat_id,
            countdown_end_epoch_ms: countdown_end,
        });

        tokio::time::sleep(self.countdown).await;
        race.countdown_end_epoch_ms = None;

        self.run_on_controller(race, entrants, heat_id).await
    }

    /// Ask the controller to run a heat that is already in `race`, fold the
    /// results and save.
    async fn run_on_controller(
        &mut self,
        mut race: Race,
        mut entrants: Vec<Entrant>,
        heat_id: HeatId,
    ) -> Result<HeatReport, ControlError> {
        let occupied = race.heat(heat_id)?.occupied_lanes();

        let (hardware, results) = if occupied.is_empty() {
            (HardwareOutcome::Skipped, Vec::new())
        } else {
            match self.controller.run_heat(heat_id, occupied).await {
                Ok(RunHeatOutcome::Finished(result)) => (HardwareOutcome::Timed, result.lane_results),
                Ok(RunHeatOutcome::Cancelled) => {
                    self.emit(ControlEvent::HeatCancelled { heat_id });
                    (HardwareOutcome::Cancelled, Vec::new())
                }
                Err(e) => {
                    log::warn!("Heat {} not timed by hardware: {}", heat_id, e);
                    self.emit(ControlEvent::HardwareUnavailable {
                        heat_id,
                        error: e.to_string(),
                    });
                    (
                        HardwareOutcome::Unavailable {
                            error: e.to_string(),
                        },
                        Vec::new(),
                    )
                }
            }
        };

        let recorded = self.fold_results(&mut race, &mut entrants, heat_id, &results)?;
        self.store.save_entrants(&entrants)?;
        self.save_race(&race)?;

        let awaiting_manual = pending_lanes(&race, heat_id)?;
        self.emit(ControlEvent::HeatFinished {
            heat_id,
            awaiting_manual: awaiting_manual.clone(),
        });
        Ok(HeatReport {
            heat_id,
            hardware,
            recorded,
            awaiting_manual,
        })
    }

    fn fold_results(
        &self,
        race: &mut Race,
        entrants: &mut [Entrant],
        heat_id: HeatId,
        results: &[LaneResult],
    ) -> Result<Vec<LaneRecord>, ControlError> {
        let recorded = control::apply_lane_results(race, entrants, heat_id, results, Utc::now())?;
        for record in recorded.iter().filter(|r| r.is_included.is_none()) {
            log::warn!(
                "Entrant {} in heat {} no longer exists, time kept on the heat only",
                record.entrant_id,
                heat_id
            );
        }
        Ok(recorded)
    }

    /// Store a time for one lane, typed by the operator or from any other source.
    pub fn record_lane_time(
        &mut self,
        heat_id: HeatId,
        lane_index: usize,
        time: f64,
    ) -> Result<LaneRecord, ControlError> {
        let mut race = self.store.race()?;
        let mut entrants = self.store.entrants()?;
        let record =
            control::record_lane_time(&mut race, &mut entrants, heat_id, lane_index, time, Utc::now())?;
        self.store.save_entrants(&entrants)?;
        self.save_race(&race)?;
        log::info!(
            "Heat {} lane {}: entrant {} in {:.3}s",
            heat_id,
            lane_index + 1,
            record.entrant_id,
            time
        );
        Ok(record)
    }

    /// Move on once the current heat has all its times.
    pub fn next_heat(&mut self) -> Result<NextHeat, ControlError> {
        let mut race = self.store.race()?;
        let next = control::advance_heat(&mut race)?;
        self.heat.reset();
        race.countdown_end_epoch_ms = None;
        self.save_race(&race)?;

        let current_heat_id = race.current_heat_id.ok_or(RaceError::NoCurrentHeat)?;
        if next.is_none() {
            log::info!("Last heat {} finished", current_heat_id);
        }
        Ok(NextHeat {
            current_heat_id,
            was_last: next.is_none(),
        })
    }

    /// Throw away the current heat's times so it can be run again.
    pub fn rerun_heat(&mut self) -> Result<HeatId, ControlError> {
        let mut race = self.store.race()?;
        let mut entrants = self.store.entrants()?;
        let heat_id = race.current_heat().ok_or(RaceError::NoCurrentHeat)?.id;
        let removed = control::clear_heat_results(&mut race, &mut entrants, heat_id)?;
        race.countdown_end_epoch_ms = None;
        self.heat.reset();
        self.store.save_entrants(&entrants)?;
        self.save_race(&race)?;
        log::info!("Heat {} cleared for a re-run, {} runs removed", heat_id, removed);
        Ok(heat_id)
    }

    /// Run an ad-hoc heat outside the schedule. `lane_entrants[i]` races on
    /// lane `i`; unknown entrant ids leave the lane empty.
    pub async fn run_manual_heat(
        &mut self,
        lane_entrants: &[Option<EntrantId>],
    ) -> Result<HeatReport, ControlError> {
        let mut race = self.store.race()?;
        let entrants = self.store.entrants()?;
        let settings = self.store.settings()?;
        let heat_id =
            control::push_manual_heat(&mut race, &entrants, lane_entrants, settings.lane_count);
        log::info!("Manual heat {} created", heat_id);

        if let Err(e) = self.controller.set_gate(false).await {
            log::warn!("Failed to raise gate: {}", e);
            self.emit(ControlEvent::GateRaiseFailed {
                error: e.to_string(),
            });
        }
        self.run_on_controller(race, entrants, heat_id).await
    }

    pub fn entrant(&self, entrant_id: EntrantId) -> Result<Entrant, ControlError> {
        self.store
            .entrants()?
            .into_iter()
            .find(|e| e.id == entrant_id)
            .ok_or_else(|| RaceError::EntrantNotFound(entrant_id).into())
    }

    pub fn register_entrant(&mut self, new: NewEntrant) -> Result<Entrant, ControlError> {
        let mut entrants = self.store.entrants()?;
        let entrant = register_entrant(&mut entrants, new)?.clone();
        self.store.save_entrants(&entrants)?;
        log::info!(
            "Registered entrant {} '{}' ({})",
            entrant.id,
            entrant.entry_name,
            entrant.owner_name
        );
        Ok(entrant)
    }

    pub fn update_entrant_details(
        &mut self,
        entrant_id: EntrantId,
        update: EntrantUpdate,
    ) -> Result<Entrant, ControlError> {
        self.update_entrant(entrant_id, |e| e.apply(update))
    }

    pub fn set_entrant_status(
        &mut self,
        entrant_id: EntrantId,
        status: EntrantStatus,
    ) -> Result<Entrant, ControlError> {
        self.update_entrant(entrant_id, |e| {
            e.status = status;
            Ok(())
        })
    }

    /// Count a run toward the average or leave it out.
    pub fn set_run_included(
        &mut self,
        entrant_id: EntrantId,
        index: usize,
        is_included: bool,
    ) -> Result<Entrant, ControlError> {
        self.update_entrant(entrant_id, |e| e.set_run_included(index, is_included))
    }

    fn update_entrant(
        &mut self,
        entrant_id: EntrantId,
        update: impl FnOnce(&mut Entrant) -> Result<(), RaceError>,
    ) -> Result<Entrant, ControlError> {
        let mut entrants = self.store.entrants()?;
        let entrant = entrants
            .iter_mut()
            .find(|e| e.id == entrant_id)
            .ok_or(RaceError::EntrantNotFound(entrant_id))?;
        update(entrant)?;
        let updated = entrant.clone();
        self.store.save_entrants(&entrants)?;
        Ok(updated)
    }

    pub fn standings(&self, divisions: &[String]) -> Result<Vec<Standing>, ControlError> {
        Ok(speed_standings(&self.store.entrants()?, divisions))
    }

    pub fn validation(&self, entrant_id: EntrantId) -> Result<LaneValidation, ControlError> {
        let entrants = self.store.entrants()?;
        let settings = self.store.settings()?;
        let entrant = entrants
            .iter()
            .find(|e| e.id == entrant_id)
            .ok_or(RaceError::EntrantNotFound(entrant_id))?;
        Ok(validate_entrant_lanes(entrant, settings.lane_count))
    }
}

impl<S: RaceStore + 'static, C: TimingController + 'static> RaceControl<S, C> {
    /// [`drop_gate`](Self::drop_gate) on a task of its own, holding the lock
    /// for the whole heat. The heat is run and saved even when the caller
    /// stops waiting halfway through the countdown.
    pub async fn drop_gate_detached(control: SharedControl<S, C>) -> Result<HeatReport, ControlError> {
        tokio::spawn(async move { control.lock().await.drop_gate().await }).await?
    }

    /// [`run_manual_heat`](Self::run_manual_heat) on a task of its own.
    pub async fn run_manual_heat_detached(
        control: SharedControl<S, C>,
        lane_entrants: Vec<Option<EntrantId>>,
    ) -> Result<HeatReport, ControlError> {
        tokio::spawn(async move { control.lock().await.run_manual_heat(&lane_entrants).await })
            .await?
    }
}

fn pending_lanes(race: &Race, heat_id: HeatId) -> Result<Vec<usize>, RaceError> {
    Ok(race
        .heat(heat_id)?
        .lanes
        .iter()
        .enumerate()
        .filter(|(_, lane)| lane.is_pending())
        .map(|(i, _)| i)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::HardwareError;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use derby_core::protocol::HeatResult;
    use derby_core::settings::{Presentation, PresentationKind};
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum Behaviour {
        /// Every lane finishes, lane n in 3.000 + n/100 s
        AllFinish,
        Conflict,
        Unreachable,
    }

    struct FakeController {
        behaviour: Mutex<Behaviour>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeController {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(FakeController {
                behaviour: Mutex::new(behaviour),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn set(&self, behaviour: Behaviour) {
            *self.behaviour.lock().unwrap() = behaviour;
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TimingController for FakeController {
        async fn set_gate(&self, is_down: bool) -> Result<(), HardwareError> {
            self.calls.lock().unwrap().push(format!("gate {}", is_down));
            match *self.behaviour.lock().unwrap() {
                Behaviour::Unreachable => Err(HardwareError::NotConfigured),
                _ => Ok(()),
            }
        }

        async fn run_heat(
            &self,
            heat_id: HeatId,
            occupied_lanes: Vec<usize>,
        ) -> Result<RunHeatOutcome, HardwareError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("run {} {:?}", heat_id, occupied_lanes));
            let behaviour = *self.behaviour.lock().unwrap();
            match behaviour {
                Behaviour::AllFinish => Ok(RunHeatOutcome::Finished(HeatResult {
                    heat_id: format!("heat-{}", heat_id),
                    started_at: Utc::now(),
                    finished_at: Some(Utc::now()),
                    lane_results: occupied_lanes
                        .iter()
                        .map(|&lane| LaneResult {
                            lane_number: lane,
                            finish_time_ms: Some(3000.0 + lane as f64 * 10.0),
                            place: None,
                            is_dnf: false,
                        })
                        .collect(),
                    is_complete: true,
                })),
                Behaviour::Conflict => Ok(RunHeatOutcome::Cancelled),
                Behaviour::Unreachable => Err(HardwareError::NotConfigured),
            }
        }
    }

    fn store(entrant_count: u32) -> MemoryStore {
        let mut store = MemoryStore::default();
        store.entrants = (1..=entrant_count)
            .map(|id| {
                Entrant::new(id, "Owner", "Car", "Wolves").with_status(EntrantStatus::Registered)
            })
            .collect();
        store.settings.lane_count = 4;
        store
    }

    fn race_control(
        entrant_count: u32,
        behaviour: Behaviour,
    ) -> (RaceControl<MemoryStore, FakeController>, Arc<FakeController>) {
        let controller = FakeController::new(behaviour);
        let control =
            RaceControl::new(store(entrant_count), controller.clone(), DEFAULT_COUNTDOWN).unwrap();
        (control, controller)
    }

    fn total_runs(control: &RaceControl<MemoryStore, FakeController>) -> usize {
        control.entrants().unwrap().iter().map(|e| e.runs.len()).sum()
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_heat_flow() {
        let (mut control, controller) = race_control(5, Behaviour::AllFinish);
        control.set_race_state(RaceState::Racing).unwrap();
        let race = control.generate_heats(&[]).unwrap();
        assert_eq!(race.heats.len(), 5);
        assert_eq!(race.current_heat_id, Some(1));

        let heat_id = control.ready_heat().unwrap();
        assert_eq!(control.heat_phase(), HeatPhase::Ready);
        let report = control.drop_gate().await.unwrap();
        assert_eq!(report.heat_id, heat_id);
        assert_eq!(report.hardware, HardwareOutcome::Timed);
        assert!(report.awaiting_manual.is_empty());
        assert_eq!(control.heat_phase(), HeatPhase::Racing { heat_id });

        let race = control.race().unwrap();
        let heat = race.heat(heat_id).unwrap();
        assert!(heat.is_finished());
        assert_eq!(report.recorded.len(), heat.occupied_lanes().len());
        assert_eq!(race.countdown_end_epoch_ms, None);
        assert_eq!(*control.subscribe_race().borrow(), race);

        let next = control.next_heat().unwrap();
        assert_eq!(next.current_heat_id, 2);
        assert!(!next.was_last);
        assert_eq!(control.heat_phase(), HeatPhase::Idle);

        let calls = controller.calls();
        assert!(calls.iter().any(|c| c.starts_with("run 1 ")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_controller_falls_back_to_manual() {
        let (mut control, _controller) = race_control(4, Behaviour::Unreachable);
        control.generate_heats(&[]).unwrap();
        let mut events = control.subscribe_events();

        control.ready_heat().unwrap();
        let report = control.drop_gate().await.unwrap();
        assert!(matches!(report.hardware, HardwareOutcome::Unavailable { .. }));
        assert!(report.recorded.is_empty());
        assert_eq!(report.awaiting_manual.len(), 4);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen
            .iter()
            .any(|e| matches!(e, ControlEvent::HardwareUnavailable { heat_id: 1, .. })));

        assert!(matches!(
            control.next_heat(),
            Err(ControlError::Race(RaceError::HeatPending { heat_id: 1, lane_index: 0 }))
        ));

        for lane in report.awaiting_manual {
            control.record_lane_time(1, lane, 3.2).unwrap();
        }
        assert_eq!(control.next_heat().unwrap().current_heat_id, 2);
        assert_eq!(total_runs(&control), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_leaves_lanes_open() {
        let (mut control, _controller) = race_control(3, Behaviour::Conflict);
        control.generate_heats(&[]).unwrap();
        control.ready_heat().unwrap();
        let report = control.drop_gate().await.unwrap();
        assert_eq!(report.hardware, HardwareOutcome::Cancelled);
        assert!(!report.awaiting_manual.is_empty());
        assert_eq!(total_runs(&control), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_twice_does_not_double_count() {
        let (mut control, _controller) = race_control(4, Behaviour::AllFinish);
        control.generate_heats(&[]).unwrap();

        control.ready_heat().unwrap();
        control.drop_gate().await.unwrap();
        let after_first = total_runs(&control);
        assert_eq!(after_first, 4);

        control.rerun_heat().unwrap();
        assert_eq!(total_runs(&control), 0);
        assert_eq!(control.race().unwrap().current_heat_id, Some(1));

        control.ready_heat().unwrap();
        control.drop_gate().await.unwrap();
        assert_eq!(total_runs(&control), after_first);
        for entrant in control.entrants().unwrap() {
            assert!(entrant.runs.iter().all(|r| r.heat_id == Some(1)));
        }
    }

    fn division_runs(control: &RaceControl<MemoryStore, FakeController>, division: &str) -> usize {
        control
            .entrants()
            .unwrap()
            .iter()
            .filter(|e| e.division == division)
            .map(|e| e.runs.len())
            .sum()
    }

    #[tokio::test(start_paused = true)]
    async fn test_regenerated_schedule_keeps_earlier_runs() {
        let mut store = store(0);
        store.entrants = (1..=6)
            .map(|id| {
                let division = if id <= 3 { "Wolves" } else { "Bears" };
                Entrant::new(id, "Owner", "Car", division).with_status(EntrantStatus::Registered)
            })
            .collect();
        let mut control =
            RaceControl::new(store, FakeController::new(Behaviour::AllFinish), DEFAULT_COUNTDOWN)
                .unwrap();

        control.generate_heats(&["Wolves".to_string()]).unwrap();
        control.ready_heat().unwrap();
        control.drop_gate().await.unwrap();
        let wolves = control.entrants().unwrap();
        let wolves_runs = division_runs(&control, "Wolves");
        assert!(wolves_runs > 0);

        // Heat 1 again, but of the Bears schedule
        control.generate_heats(&["Bears".to_string()]).unwrap();
        control.ready_heat().unwrap();
        let report = control.drop_gate().await.unwrap();
        assert_eq!(report.heat_id, 1);
        assert!(division_runs(&control, "Bears") > 0);
        assert_eq!(division_runs(&control, "Wolves"), wolves_runs);

        control.rerun_heat().unwrap();
        assert_eq!(division_runs(&control, "Bears"), 0);
        let after = control.entrants().unwrap();
        for (before, after) in wolves.iter().zip(after.iter()).filter(|(e, _)| e.division == "Wolves") {
            assert_eq!(before.runs, after.runs);
            assert_eq!(before.average_time, after.average_time);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heat_finishes_when_caller_gives_up() {
        let (mut control, controller) = race_control(4, Behaviour::AllFinish);
        control.generate_heats(&[]).unwrap();
        control.ready_heat().unwrap();
        let shared: SharedControl<_, _> = Arc::new(tokio::sync::Mutex::new(control));

        let gave_up = tokio::time::timeout(
            Duration::from_secs(1),
            RaceControl::drop_gate_detached(shared.clone()),
        )
        .await;
        assert!(gave_up.is_err());

        tokio::time::sleep(Duration::from_secs(5)).await;
        let control = shared.lock().await;
        let race = control.race().unwrap();
        assert_eq!(race.countdown_end_epoch_ms, None);
        assert!(race.heat(1).unwrap().is_finished());
        assert_eq!(total_runs(&control), 4);
        assert!(controller.calls().iter().any(|c| c.starts_with("run 1 ")));
    }

    #[tokio::test]
    async fn test_detached_manual_heat() {
        let (control, _controller) = race_control(2, Behaviour::AllFinish);
        let shared = Arc::new(tokio::sync::Mutex::new(control));
        let report = RaceControl::run_manual_heat_detached(shared.clone(), vec![None, Some(2)])
            .await
            .unwrap();
        assert_eq!(report.heat_id, -1);
        assert_eq!(report.recorded[0].time, 3.02);
        assert_eq!(total_runs(&*shared.lock().await), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_needs_ready() {
        let (mut control, controller) = race_control(4, Behaviour::AllFinish);
        control.generate_heats(&[]).unwrap();
        assert!(matches!(
            control.drop_gate().await,
            Err(ControlError::Race(RaceError::WrongPhase { phase: "idle", .. }))
        ));
        assert!(controller.calls().is_empty());
    }

    #[tokio::test]
    async fn test_ready_without_heats() {
        let (mut control, _controller) = race_control(4, Behaviour::AllFinish);
        assert!(matches!(
            control.ready_heat(),
            Err(ControlError::Race(RaceError::NoCurrentHeat))
        ));
        assert_eq!(control.heat_phase(), HeatPhase::Idle);
    }

    #[tokio::test]
    async fn test_gate_raise_failure_is_published() {
        let (mut control, controller) = race_control(2, Behaviour::AllFinish);
        control.generate_heats(&[]).unwrap();
        controller.set(Behaviour::Unreachable);
        let mut events = control.subscribe_events();

        control.ready_heat().unwrap();
        let event = events.recv().await.unwrap();
        assert!(matches!(event, ControlEvent::GateRaiseFailed { .. }));
        assert_eq!(control.heat_phase(), HeatPhase::Ready);
    }

    #[tokio::test]
    async fn test_manual_heats() {
        let (mut control, controller) = race_control(3, Behaviour::AllFinish);

        let report = control.run_manual_heat(&[Some(2), None, Some(42)]).await.unwrap();
        assert_eq!(report.heat_id, -1);
        assert_eq!(report.recorded.len(), 1);
        assert_eq!(report.recorded[0].entrant_id, 2);
        assert_eq!(report.recorded[0].time, 3.01);

        let report = control.run_manual_heat(&[None, Some(1)]).await.unwrap();
        assert_eq!(report.heat_id, -2);

        let race = control.race().unwrap();
        assert_eq!(race.manual_runs.len(), 2);
        assert!(race.heats.is_empty());
        assert_eq!(
            controller.calls(),
            vec!["gate false", "run -1 [1]", "gate false", "run -2 [2]"]
        );

        let report = control.run_manual_heat(&[None, None]).await.unwrap();
        assert_eq!(report.hardware, HardwareOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_complete_hides_presentation() {
        let (mut control, _controller) = race_control(1, Behaviour::AllFinish);
        control
            .update_settings(|s| {
                s.presentation = Some(Presentation {
                    kind: PresentationKind::Speed,
                    division: None,
                    is_visible: true,
                })
            })
            .unwrap();
        control.set_race_state(RaceState::Racing).unwrap();
        control.set_race_state(RaceState::Complete).unwrap();
        let settings = control.settings().unwrap();
        assert!(!settings.presentation.unwrap().is_visible);
    }

    #[tokio::test]
    async fn test_racing_guard_and_override() {
        let (mut control, _controller) = race_control(2, Behaviour::AllFinish);
        control.set_entrant_status(2, EntrantStatus::Review).unwrap();
        assert!(matches!(
            control.set_race_state(RaceState::Racing),
            Err(ControlError::Race(RaceError::EntrantNotCheckedIn { entrant_id: 2, .. }))
        ));
        assert_eq!(control.race().unwrap().state, RaceState::Registration);

        let race = control.override_race_state(RaceState::Complete).unwrap();
        assert_eq!(race.state, RaceState::Complete);
    }

    #[tokio::test]
    async fn test_run_inclusion_and_standings() {
        let (mut control, _controller) = race_control(2, Behaviour::AllFinish);
        control.generate_heats(&[]).unwrap();
        control.record_lane_time(1, 0, 3.0).unwrap();
        control.record_lane_time(1, 1, 3.5).unwrap();

        let standings = control.standings(&[]).unwrap();
        assert_eq!(standings.len(), 2);
        assert_eq!(standings[0].average_time, 3.0);

        let fastest = standings[0].entrant_id;
        let entrant = control.set_run_included(fastest, 0, false).unwrap();
        assert_eq!(entrant.average_time, None);
        assert_eq!(control.standings(&[]).unwrap().len(), 1);

        let validation = control.validation(fastest).unwrap();
        assert_eq!(validation.missing_lanes, vec![1, 2, 3, 4]);
        assert!(matches!(
            control.validation(99),
            Err(ControlError::Race(RaceError::EntrantNotFound(99)))
        ));
        assert!(matches!(
            control.set_run_included(fastest, 5, true),
            Err(ControlError::Race(RaceError::RunNotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_registration_and_settings() {
        let (mut control, _controller) = race_control(2, Behaviour::AllFinish);
        let entrant = control
            .register_entrant(NewEntrant {
                owner_name: "Kit".to_string(),
                entry_name: "Dart".to_string(),
                division: "Bears".to_string(),
            })
            .unwrap();
        assert_eq!(entrant.id, 3);
        assert_eq!(entrants_in(&control, "Bears"), vec![3]);

        let update = EntrantUpdate {
            division: Some("Wolves".to_string()),
            ..Default::default()
        };
        assert_eq!(control.update_entrant_details(3, update).unwrap().division, "Wolves");
        assert_eq!(control.entrant(3).unwrap().division, "Wolves");
        assert!(matches!(
            control.entrant(9),
            Err(ControlError::Race(RaceError::EntrantNotFound(9)))
        ));

        let settings = control
            .apply_settings(SettingsUpdate {
                lane_count: Some(2),
                heat_algorithm: Some(derby_core::HeatAlgorithm::Chaos),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(settings.lane_count, 2);
        assert_eq!(control.settings().unwrap().heat_algorithm, derby_core::HeatAlgorithm::Chaos);

        let err = control
            .apply_settings(SettingsUpdate {
                lane_count: Some(0),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(control.settings().unwrap().lane_count, 2);

        control.set_entrant_status(3, EntrantStatus::Registered).unwrap();
        let race = control.generate_heats(&[]).unwrap();
        assert!(race.heats.iter().all(|h| h.lanes.len() == 2));
    }

    fn entrants_in(control: &RaceControl<MemoryStore, FakeController>, division: &str) -> Vec<EntrantId> {
        control
            .entrants()
            .unwrap()
            .iter()
            .filter(|e| e.division == division)
            .map(|e| e.id)
            .collect()
    }

    #[test]
    fn test_error_status_codes() {
        let not_found: ControlError = RaceError::HeatNotFound(3).into();
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);
        let bad: ControlError = RaceError::InvalidTime(-1.0).into();
        assert_eq!(bad.status_code(), StatusCode::BAD_REQUEST);
        let refused: ControlError = RaceError::NoCurrentHeat.into();
        assert_eq!(refused.status_code(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_select_heat() {
        let (mut control, _controller) = race_control(4, Behaviour::AllFinish);
        control.generate_heats(&[]).unwrap();
        assert_eq!(control.select_heat(3).unwrap().current_heat_id, Some(3));
        assert!(matches!(
            control.select_heat(-1),
            Err(ControlError::Race(RaceError::HeatNotFound(-1)))
        ));
    }
}
