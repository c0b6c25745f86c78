use axum::{
    debug_handler,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderValue},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    net::TcpListener,
    sync::{broadcast, watch, Mutex},
};
use tokio_graceful_shutdown::SubsystemHandle;

use derby_core::{
    protocol::{HardwareStatus, ServoCalibration},
    ConnectionState, EntrantId, EntrantStatus, EntrantUpdate, HeatId, NewEntrant, Race, RaceState,
    SettingsUpdate,
};
use derby_server::{
    control::{self, ControlEvent, RaceControl},
    hardware::{HardwareLink, TimingController},
    storage::JsonFileStore,
};

const RACE_URI: &str = "/api/race";
const RACE_STATE_URI: &str = "/api/race/state";
const RACE_STATE_OVERRIDE_URI: &str = "/api/race/state/override";
const RACE_EVENTS_URI: &str = "/api/race/events";
const GENERATE_HEATS_URI: &str = "/api/race/heats/generate";
const CURRENT_HEAT_URI: &str = "/api/race/heat/current";
const HEAT_PHASE_URI: &str = "/api/race/heat/phase";
const HEAT_READY_URI: &str = "/api/race/heat/ready";
const HEAT_DROP_URI: &str = "/api/race/heat/drop";
const HEAT_NEXT_URI: &str = "/api/race/heat/next";
const HEAT_RERUN_URI: &str = "/api/race/heat/rerun";
const LANE_TIME_URI: &str = "/api/race/heats/{heat_id}/lanes/{lane_index}/time";
const MANUAL_HEAT_URI: &str = "/api/race/manual";
const STANDINGS_URI: &str = "/api/standings";
const SETTINGS_URI: &str = "/api/settings";
// Entrants
const ENTRANTS_URI: &str = "/api/entrants";
const ENTRANT_URI: &str = "/api/entrants/{entrant_id}";
const ENTRANT_VALIDATION_URI: &str = "/api/entrants/{entrant_id}/validation";
const ENTRANT_STATUS_URI: &str = "/api/entrants/{entrant_id}/status";
const ENTRANT_RUN_URI: &str = "/api/entrants/{entrant_id}/runs/{index}";
// Timing controller
const HARDWARE_STATUS_URI: &str = "/api/hardware/status";
const HARDWARE_WS_URI: &str = "/api/hardware/ws";
const HARDWARE_CONNECT_URI: &str = "/api/hardware/connect";
const HARDWARE_DISCONNECT_URI: &str = "/api/hardware/disconnect";
const GATE_URI: &str = "/api/hardware/gate";
const SERVO_TEST_URI: &str = "/api/hardware/servo/test";
const CALIBRATION_URI: &str = "/api/hardware/calibration";
const ADDRESS_URI: &str = "/api/hardware/address";

#[derive(Error, Debug)]
pub enum WebError {
    #[error("Socket operation failed")]
    Io(#[from] io::Error),
}

/// Single writer: every race operation goes through this lock.
type SharedControl = control::SharedControl<JsonFileStore, HardwareLink>;

#[derive(Clone)]
pub struct Web {
    port: u16,
    control: SharedControl,
    link: HardwareLink,
    /// Latest saved race, readable while a heat holds the lock
    race_rx: watch::Receiver<Race>,
    events_tx: broadcast::Sender<ControlEvent>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Web {
    pub fn new(
        port: u16,
        control: RaceControl<JsonFileStore, HardwareLink>,
        link: HardwareLink,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let race_rx = control.subscribe_race();
        let events_tx = control.event_sender();

        Web {
            port,
            control: Arc::new(Mutex::new(control)),
            link,
            race_rx,
            events_tx,
            shutdown_tx,
        }
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), WebError> {
        let port = self.port;
        let listener =
            TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port))
                .await
                .map_err(WebError::Io)?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let shutdown_tx = self.shutdown_tx.clone(); // Clone as self used in with_state() below

        let app = Router::new()
            .route(RACE_URI, get(get_race))
            .route(RACE_STATE_URI, post(set_race_state))
            .route(RACE_STATE_OVERRIDE_URI, post(override_race_state))
            .route(RACE_EVENTS_URI, get(race_events_handler))
            .route(GENERATE_HEATS_URI, post(generate_heats))
            .route(CURRENT_HEAT_URI, put(select_heat))
            .route(HEAT_PHASE_URI, get(get_heat_phase))
            .route(HEAT_READY_URI, post(ready_heat))
            .route(HEAT_DROP_URI, post(drop_gate))
            .route(HEAT_NEXT_URI, post(next_heat))
            .route(HEAT_RERUN_URI, post(rerun_heat))
            .route(LANE_TIME_URI, post(record_lane_time))
            .route(MANUAL_HEAT_URI, post(run_manual_heat))
            .route(STANDINGS_URI, get(get_standings))
            .route(SETTINGS_URI, get(get_settings).put(update_settings))
            // Entrants
            .route(ENTRANTS_URI, get(get_entrants).post(register_entrant))
            .route(ENTRANT_URI, get(get_entrant).patch(update_entrant))
            .route(ENTRANT_VALIDATION_URI, get(get_validation))
            .route(ENTRANT_STATUS_URI, put(set_entrant_status))
            .route(ENTRANT_RUN_URI, put(set_run_included))
            // Timing controller
            .route(HARDWARE_STATUS_URI, get(get_hardware_status))
            .route(HARDWARE_WS_URI, get(hardware_ws_handler))
            .route(HARDWARE_CONNECT_URI, post(connect_hardware))
            .route(HARDWARE_DISCONNECT_URI, post(disconnect_hardware))
            .route(GATE_URI, post(set_gate))
            .route(SERVO_TEST_URI, post(test_servo))
            .route(CALIBRATION_URI, get(get_calibration).put(set_calibration))
            .route(ADDRESS_URI, put(set_address))
            .layer(middleware::from_fn(no_cache_middleware))
            .with_state(self);

        log::info!("Starting HTTP web server on port {}", port);

        tokio::select! { biased;
            _ = subsys.on_shutdown_requested() => {
                let _ = shutdown_tx.send(());
            },
            r = axum::serve(listener, app)
                    .with_graceful_shutdown(
                        async move {
                            _ = shutdown_rx.recv().await;
                        }
                    ) => {
                return r.map_err(WebError::Io);
            }
        }
        Ok(())
    }
}

/// Race data changes every heat; browsers must not cache it.
async fn no_cache_middleware(request: axum::extract::Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    response
}

fn json_or_error<T: Serialize, E: IntoResponse>(result: Result<T, E>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(e) => e.into_response(),
    }
}

#[debug_handler]
async fn get_race(State(state): State<Web>) -> Response {
    let race = state.race_rx.borrow().clone();
    Json(race).into_response()
}

#[derive(Deserialize)]
struct RaceStateRequest {
    state: RaceState,
}

#[debug_handler]
async fn set_race_state(
    State(state): State<Web>,
    Json(request): Json<RaceStateRequest>,
) -> Response {
    let mut control = state.control.lock().await;
    json_or_error(control.set_race_state(request.state))
}

#[debug_handler]
async fn override_race_state(
    State(state): State<Web>,
    Json(request): Json<RaceStateRequest>,
) -> Response {
    let mut control = state.control.lock().await;
    json_or_error(control.override_race_state(request.state))
}

#[derive(Deserialize, Default)]
struct GenerateRequest {
    #[serde(default)]
    divisions: Vec<String>,
}

#[debug_handler]
async fn generate_heats(
    State(state): State<Web>,
    request: Option<Json<GenerateRequest>>,
) -> Response {
    let Json(request) = request.unwrap_or_default();
    let mut control = state.control.lock().await;
    json_or_error(control.generate_heats(&request.divisions))
}

#[derive(Deserialize)]
struct SelectHeatRequest {
    heat_id: HeatId,
}

#[debug_handler]
async fn select_heat(
    State(state): State<Web>,
    Json(request): Json<SelectHeatRequest>,
) -> Response {
    let mut control = state.control.lock().await;
    json_or_error(control.select_heat(request.heat_id))
}

#[debug_handler]
async fn get_heat_phase(State(state): State<Web>) -> Response {
    let control = state.control.lock().await;
    Json(control.heat_phase()).into_response()
}

#[derive(Serialize)]
struct HeatIdResponse {
    heat_id: HeatId,
}

#[debug_handler]
async fn ready_heat(State(state): State<Web>) -> Response {
    let mut control = state.control.lock().await;
    json_or_error(control.ready_heat().map(|heat_id| HeatIdResponse { heat_id }))
}

/// The heat runs on its own task under the control lock, so a second drop
/// or a manual time waits until it has been folded in, and a closed request
/// does not stop it.
#[debug_handler]
async fn drop_gate(State(state): State<Web>) -> Response {
    json_or_error(RaceControl::drop_gate_detached(state.control.clone()).await)
}

#[debug_handler]
async fn next_heat(State(state): State<Web>) -> Response {
    let mut control = state.control.lock().await;
    json_or_error(control.next_heat())
}

#[debug_handler]
async fn rerun_heat(State(state): State<Web>) -> Response {
    let mut control = state.control.lock().await;
    json_or_error(control.rerun_heat().map(|heat_id| HeatIdResponse { heat_id }))
}

#[derive(Deserialize)]
struct LaneParam {
    heat_id: HeatId,
    lane_index: usize,
}

#[derive(Deserialize)]
struct LaneTimeRequest {
    time: f64,
}

#[debug_handler]
async fn record_lane_time(
    State(state): State<Web>,
    Path(params): Path<LaneParam>,
    Json(request): Json<LaneTimeRequest>,
) -> Response {
    let mut control = state.control.lock().await;
    json_or_error(control.record_lane_time(params.heat_id, params.lane_index, request.time))
}

#[derive(Deserialize)]
struct ManualHeatRequest {
    /// Entrant per lane, `null` for an empty lane
    lanes: Vec<Option<EntrantId>>,
}

#[debug_handler]
async fn run_manual_heat(
    State(state): State<Web>,
    Json(request): Json<ManualHeatRequest>,
) -> Response {
    json_or_error(RaceControl::run_manual_heat_detached(state.control.clone(), request.lanes).await)
}

#[derive(Deserialize)]
struct StandingsQuery {
    division: Option<String>,
}

#[debug_handler]
async fn get_standings(
    State(state): State<Web>,
    Query(query): Query<StandingsQuery>,
) -> Response {
    let divisions: Vec<String> = query.division.into_iter().collect();
    let control = state.control.lock().await;
    json_or_error(control.standings(&divisions))
}

#[debug_handler]
async fn get_settings(State(state): State<Web>) -> Response {
    let control = state.control.lock().await;
    json_or_error(control.settings())
}

#[debug_handler]
async fn update_settings(
    State(state): State<Web>,
    Json(update): Json<SettingsUpdate>,
) -> Response {
    let mut control = state.control.lock().await;
    json_or_error(control.apply_settings(update))
}

#[debug_handler]
async fn get_entrants(State(state): State<Web>) -> Response {
    let control = state.control.lock().await;
    json_or_error(control.entrants())
}

#[debug_handler]
async fn register_entrant(
    State(state): State<Web>,
    Json(new): Json<NewEntrant>,
) -> Response {
    let mut control = state.control.lock().await;
    json_or_error(control.register_entrant(new))
}

#[derive(Deserialize)]
struct EntrantIdParam {
    entrant_id: EntrantId,
}

#[debug_handler]
async fn get_entrant(State(state): State<Web>, Path(params): Path<EntrantIdParam>) -> Response {
    let control = state.control.lock().await;
    json_or_error(control.entrant(params.entrant_id))
}

#[debug_handler]
async fn update_entrant(
    State(state): State<Web>,
    Path(params): Path<EntrantIdParam>,
    Json(update): Json<EntrantUpdate>,
) -> Response {
    let mut control = state.control.lock().await;
    json_or_error(control.update_entrant_details(params.entrant_id, update))
}

#[derive(Deserialize)]
struct EntrantRunParam {
    entrant_id: EntrantId,
    index: usize,
}

#[debug_handler]
async fn get_validation(
    State(state): State<Web>,
    Path(params): Path<EntrantIdParam>,
) -> Response {
    let control = state.control.lock().await;
    json_or_error(control.validation(params.entrant_id))
}

#[derive(Deserialize)]
struct EntrantStatusRequest {
    status: EntrantStatus,
}

#[debug_handler]
async fn set_entrant_status(
    State(state): State<Web>,
    Path(params): Path<EntrantIdParam>,
    Json(request): Json<EntrantStatusRequest>,
) -> Response {
    let mut control = state.control.lock().await;
    json_or_error(control.set_entrant_status(params.entrant_id, request.status))
}

#[derive(Deserialize)]
struct RunIncludedRequest {
    is_included: bool,
}

#[debug_handler]
async fn set_run_included(
    State(state): State<Web>,
    Path(params): Path<EntrantRunParam>,
    Json(request): Json<RunIncludedRequest>,
) -> Response {
    let mut control = state.control.lock().await;
    json_or_error(control.set_run_included(params.entrant_id, params.index, request.is_included))
}

#[derive(Serialize)]
struct HardwareStatusResponse {
    connection: ConnectionState,
    status: Option<HardwareStatus>,
}

#[debug_handler]
async fn get_hardware_status(State(state): State<Web>) -> Response {
    Json(HardwareStatusResponse {
        connection: state.link.connection_state(),
        status: state.link.status().map(|s| (*s).clone()),
    })
    .into_response()
}

#[debug_handler]
async fn connect_hardware(State(state): State<Web>) -> Response {
    json_or_error(state.link.connect().await)
}

#[debug_handler]
async fn disconnect_hardware(State(state): State<Web>) -> Response {
    json_or_error(state.link.disconnect().await)
}

#[derive(Deserialize)]
struct GateRequest {
    is_down: bool,
}

#[debug_handler]
async fn set_gate(State(state): State<Web>, Json(request): Json<GateRequest>) -> Response {
    json_or_error(state.link.set_gate(request.is_down).await)
}

#[derive(Deserialize)]
struct ServoTestRequest {
    angle: f64,
}

#[debug_handler]
async fn test_servo(State(state): State<Web>, Json(request): Json<ServoTestRequest>) -> Response {
    json_or_error(state.link.test_servo(request.angle).await)
}

/// The stored calibration; the controller is only told on PUT.
#[debug_handler]
async fn get_calibration(State(state): State<Web>) -> Response {
    let control = state.control.lock().await;
    json_or_error(control.settings().map(|s| s.calibration()))
}

#[derive(Serialize)]
struct CalibrationResponse {
    calibration: ServoCalibration,
    /// Whether the controller accepted it; the settings are saved either way
    is_applied: bool,
}

#[debug_handler]
async fn set_calibration(
    State(state): State<Web>,
    Json(calibration): Json<ServoCalibration>,
) -> Response {
    let saved = {
        let mut control = state.control.lock().await;
        control.update_settings(|s| s.set_calibration(calibration))
    };
    if let Err(e) = saved {
        return e.into_response();
    }
    let is_applied = match state.link.set_calibration(calibration).await {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Calibration saved but not applied: {}", e);
            false
        }
    };
    Json(CalibrationResponse {
        calibration,
        is_applied,
    })
    .into_response()
}

#[derive(Deserialize)]
struct AddressRequest {
    address: Option<String>,
}

#[debug_handler]
async fn set_address(State(state): State<Web>, Json(request): Json<AddressRequest>) -> Response {
    let saved = {
        let mut control = state.control.lock().await;
        control.update_settings(|s| s.controller_address = request.address)
    };
    let settings = match saved {
        Ok(settings) => settings,
        Err(e) => return e.into_response(),
    };
    let address = settings.controller_address().map(str::to_string);
    log::info!("Timing controller address set to {:?}", address);
    json_or_error(state.link.set_address(address).await)
}

#[debug_handler]
async fn hardware_ws_handler(State(state): State<Web>, ws: WebSocketUpgrade) -> Response {
    debug!("Hardware status stream requested");
    let status_rx = state.link.subscribe_status();
    let shutdown_rx = state.shutdown_tx.subscribe();
    ws.on_upgrade(move |socket| status_stream(socket, status_rx, shutdown_rx))
}

/// Relays every status snapshot; `null` while the controller is not connected.
async fn status_stream(
    mut socket: WebSocket,
    mut status_rx: watch::Receiver<Option<Arc<HardwareStatus>>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let snapshot = status_rx.borrow_and_update().clone();
        let message = match serde_json::to_string(&snapshot.as_deref()) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("Cannot encode status: {}", e);
                break;
            }
        };
        if let Err(e) = socket.send(Message::Text(message.into())).await {
            debug!("Status websocket closed: {}", e);
            break;
        }
        trace!("Sent hardware status");

        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Shutdown of status websocket");
                break;
            },
            r = status_rx.changed() => {
                if r.is_err() {
                    debug!("Hardware link closed");
                    break;
                }
            }
        }
    }
}

#[debug_handler]
async fn race_events_handler(State(state): State<Web>, ws: WebSocketUpgrade) -> Response {
    let events_rx = state.events_tx.subscribe();
    let shutdown_rx = state.shutdown_tx.subscribe();
    ws.on_upgrade(move |socket| event_stream(socket, events_rx, shutdown_rx))
}

async fn event_stream(
    mut socket: WebSocket,
    mut events_rx: broadcast::Receiver<ControlEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Shutdown of event websocket");
                break;
            },
            r = events_rx.recv() => {
                match r {
                    Ok(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                log::warn!("Cannot encode event: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = socket.send(Message::Text(json.into())).await {
                            debug!("Event websocket closed: {}", e);
                            break;
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Event websocket lagged, skipped {} events", n);
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}
