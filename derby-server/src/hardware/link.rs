//! The hardware link actor.
//!
//! One task owns the controller address, the connection state machine and
//! the status stream. Callers hold a [`HardwareLink`] handle and talk to the
//! actor over a command channel; the latest status and the connection state
//! are published on `watch` channels.
//!
//! ```text
//!   HardwareLink ──commands──► LinkActor ──spawn──► stream task (generation N)
//!        ▲                      │   ▲                     │
//!        └──── watch: status ───┘   └──── LinkEvent ──────┘
//! ```
//!
//! Each connection attempt runs in its own task tagged with a generation
//! number. Events from older generations are dropped, so a stream that was
//! torn down can never flip the state back to connected.
//!
//! The watchdog checks the stream every 500 ms. Silence for more than 2 s
//! while connected tears the stream down and schedules one reconnect after
//! the fixed 3 s backoff. Reconnecting continues as long as an address is
//! set and the link was not disconnected.

use async_trait::async_trait;
use derby_core::connection::{ConnectionManager, ConnectionState, STALE_CHECK_INTERVAL_MS};
use derby_core::protocol::{self, HardwareStatus, ServoCalibration, StatusMessage};
use derby_core::HeatId;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_graceful_shutdown::SubsystemHandle;
use tokio_tungstenite::tungstenite::Message;

use super::{ControllerClient, HardwareError, RunHeatOutcome, TimingController};

/// Text frames from the status stream.
pub type StatusStream = BoxStream<'static, Result<String, HardwareError>>;

/// Opens the status stream. The WebSocket implementation is
/// [`WebSocketSource`]; tests plug in scripted sources.
#[async_trait]
pub trait StatusSource: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<StatusStream, HardwareError>;
}

/// Longest wait for the status stream handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct WebSocketSource {
    connect_timeout: Duration,
}

impl WebSocketSource {
    pub fn new(connect_timeout: Duration) -> Self {
        WebSocketSource { connect_timeout }
    }
}

impl Default for WebSocketSource {
    fn default() -> Self {
        WebSocketSource::new(CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl StatusSource for WebSocketSource {
    async fn connect(&self, url: &str) -> Result<StatusStream, HardwareError> {
        let (ws, _) = tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| HardwareError::ConnectTimeout(self.connect_timeout))??;
        let stream = ws
            .take_while(|frame| {
                let open = !matches!(frame, Ok(Message::Close(_)));
                async move { open }
            })
            .filter_map(|frame| async move {
                match frame {
                    Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                    Ok(_) => None,
                    Err(e) => Some(Err(HardwareError::from(e))),
                }
            });
        Ok(stream.boxed())
    }
}

type Reply<T> = oneshot::Sender<Result<T, HardwareError>>;

enum LinkCommand {
    SetAddress(Option<String>, oneshot::Sender<()>),
    Connect(oneshot::Sender<()>),
    Disconnect(oneshot::Sender<()>),
    Shutdown,
    SetGate(bool, Reply<()>),
    TestServo(f64, Reply<()>),
    GetCalibration(Reply<ServoCalibration>),
    SetCalibration(ServoCalibration, Reply<()>),
    RunHeat(HeatId, Vec<usize>, Reply<RunHeatOutcome>),
}

enum LinkEvent {
    Connected(u64),
    Message(u64, String),
    Failed(u64, HardwareError),
    Closed(u64),
}

impl LinkEvent {
    fn generation(&self) -> u64 {
        match self {
            LinkEvent::Connected(g)
            | LinkEvent::Message(g, _)
            | LinkEvent::Failed(g, _)
            | LinkEvent::Closed(g) => *g,
        }
    }
}

/// Handle onto the link actor. Cheap to clone.
#[derive(Clone)]
pub struct HardwareLink {
    commands: mpsc::Sender<LinkCommand>,
    status: watch::Receiver<Option<Arc<HardwareStatus>>>,
    state: watch::Receiver<ConnectionState>,
}

impl HardwareLink {
    /// Create the handle and the actor that serves it. Run the actor with
    /// [`LinkActor::run`] (as a subsystem) or [`LinkActor::run_until`].
    pub fn new<S: StatusSource>(source: S, address: Option<String>) -> (HardwareLink, LinkActor<S>) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (status_tx, status_rx) = watch::channel(None);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let address = normalize_address(address);
        let actor = LinkActor {
            source: Arc::new(source),
            client: address.as_deref().map(ControllerClient::new),
            address,
            paused: false,
            conn: ConnectionManager::new(),
            generation: 0,
            stream_task: None,
            reconnect_at: None,
            epoch: Instant::now(),
            command_rx,
            event_tx,
            event_rx,
            status_tx,
            state_tx,
        };
        let link = HardwareLink {
            commands: command_tx,
            status: status_rx,
            state: state_rx,
        };
        (link, actor)
    }

    /// Latest status, `None` while not connected.
    pub fn status(&self) -> Option<Arc<HardwareStatus>> {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Option<Arc<HardwareStatus>>> {
        self.status.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    async fn send(&self, command: LinkCommand) -> Result<(), HardwareError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HardwareError::LinkClosed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> LinkCommand,
    ) -> Result<T, HardwareError> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx)).await?;
        rx.await.map_err(|_| HardwareError::LinkClosed)?
    }

    async fn acknowledged(
        &self,
        command: impl FnOnce(oneshot::Sender<()>) -> LinkCommand,
    ) -> Result<(), HardwareError> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx)).await?;
        rx.await.map_err(|_| HardwareError::LinkClosed)
    }

    /// Point the link at another controller, or at none.
    pub async fn set_address(&self, address: Option<String>) -> Result<(), HardwareError> {
        self.acknowledged(|tx| LinkCommand::SetAddress(address, tx))
            .await
    }

    /// Resume after [`disconnect`](Self::disconnect) and connect right away.
    pub async fn connect(&self) -> Result<(), HardwareError> {
        self.acknowledged(LinkCommand::Connect).await
    }

    /// Close the stream and stop reconnecting. Commands keep working.
    pub async fn disconnect(&self) -> Result<(), HardwareError> {
        self.acknowledged(LinkCommand::Disconnect).await
    }

    pub async fn shutdown(&self) -> Result<(), HardwareError> {
        self.send(LinkCommand::Shutdown).await
    }

    pub async fn test_servo(&self, angle: f64) -> Result<(), HardwareError> {
        self.request(|tx| LinkCommand::TestServo(angle, tx)).await
    }

    pub async fn calibration(&self) -> Result<ServoCalibration, HardwareError> {
        self.request(LinkCommand::GetCalibration).await
    }

    pub async fn set_calibration(&self, calibration: ServoCalibration) -> Result<(), HardwareError> {
        self.request(|tx| LinkCommand::SetCalibration(calibration, tx))
            .await
    }
}

#[async_trait]
impl TimingController for HardwareLink {
    async fn set_gate(&self, is_down: bool) -> Result<(), HardwareError> {
        self.request(|tx| LinkCommand::SetGate(is_down, tx)).await
    }

    async fn run_heat(
        &self,
        heat_id: HeatId,
        occupied_lanes: Vec<usize>,
    ) -> Result<RunHeatOutcome, HardwareError> {
        self.request(|tx| LinkCommand::RunHeat(heat_id, occupied_lanes, tx))
            .await
    }
}

fn normalize_address(address: Option<String>) -> Option<String> {
    address
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
}

pub struct LinkActor<S: StatusSource> {
    source: Arc<S>,
    address: Option<String>,
    client: Option<ControllerClient>,
    /// Set by an explicit disconnect; no attempts until connect()
    paused: bool,
    conn: ConnectionManager,
    generation: u64,
    stream_task: Option<JoinHandle<()>>,
    reconnect_at: Option<Instant>,
    epoch: Instant,
    command_rx: mpsc::Receiver<LinkCommand>,
    event_tx: mpsc::Sender<LinkEvent>,
    event_rx: mpsc::Receiver<LinkEvent>,
    status_tx: watch::Sender<Option<Arc<HardwareStatus>>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl<S: StatusSource> LinkActor<S> {
    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), HardwareError> {
        self.run_until(subsys.on_shutdown_requested()).await;
        Ok(())
    }

    /// Serve commands until `shutdown` resolves, a shutdown command arrives
    /// or every handle is gone.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        log::info!("Hardware link starting");

        let mut watchdog = interval(Duration::from_millis(STALE_CHECK_INTERVAL_MS));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.connect();

        loop {
            let reconnect_at = self.reconnect_at;
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Hardware link: shutdown requested");
                    break;
                },
                command = self.command_rx.recv() => {
                    match command {
                        Some(LinkCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                },
                Some(event) = self.event_rx.recv() => {
                    self.handle_event(event);
                },
                _ = watchdog.tick() => {
                    self.check_stale();
                },
                _ = sleep_until(reconnect_at) => {
                    self.reconnect_at = None;
                    self.connect();
                },
            }
        }

        self.abort_stream();
        self.conn.shutdown();
        self.publish();
        log::info!("Hardware link finished");
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.conn.state());
    }

    fn clear_status(&self) {
        self.status_tx.send_replace(None);
    }

    fn connect(&mut self) {
        if self.paused {
            return;
        }
        let Some(address) = self.address.clone() else {
            return;
        };
        self.abort_stream();
        self.reconnect_at = None;
        self.conn.start_connecting();
        self.publish();

        let url = protocol::status_url(&address);
        log::info!("Connecting to timing controller status stream at {}", url);
        let source = self.source.clone();
        let events = self.event_tx.clone();
        let generation = self.generation;
        self.stream_task = Some(tokio::spawn(async move {
            stream_status(source, url, generation, events).await
        }));
    }

    /// Stop the current stream task and forget its generation.
    fn abort_stream(&mut self) {
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
        self.generation += 1;
    }

    fn schedule_reconnect(&mut self) {
        if self.paused || self.address.is_none() || self.reconnect_at.is_some() {
            return;
        }
        let delay = Duration::from_millis(self.conn.backoff_ms());
        match self.conn.failure_count() {
            0 => log::info!("Reconnecting to timing controller in {:?}", delay),
            failures => log::info!(
                "Reconnecting to timing controller in {:?} ({} failed attempts)",
                delay,
                failures
            ),
        }
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn check_stale(&mut self) {
        let now = self.now_ms();
        if !self.conn.is_stale(now) {
            return;
        }
        log::warn!(
            "No status from timing controller for {} ms, reconnecting",
            self.conn.time_since_data_ms(now).unwrap_or_default()
        );
        self.abort_stream();
        self.conn.dropped();
        self.clear_status();
        self.publish();
        self.schedule_reconnect();
    }

    fn handle_event(&mut self, event: LinkEvent) {
        if event.generation() != self.generation {
            return;
        }
        let now = self.now_ms();
        match event {
            LinkEvent::Connected(_) => {
                log::info!("Timing controller status stream connected");
                self.conn.connected(now);
                self.publish();
            }
            LinkEvent::Message(_, text) => {
                self.conn.data_received(now);
                match StatusMessage::parse(&text) {
                    Ok(StatusMessage::HardwareStatus(status)) => {
                        self.status_tx.send_replace(Some(Arc::new(status)));
                    }
                    Ok(StatusMessage::RaceResult(result)) => {
                        log::debug!("Controller finished {}", result.heat_id);
                    }
                    Ok(StatusMessage::Unknown) => {}
                    Err(e) => log::debug!("Ignoring status message '{}': {}", text, e),
                }
            }
            LinkEvent::Failed(_, e) => {
                log::warn!("Timing controller status stream failed: {}", e);
                self.stream_task = None;
                self.conn.error();
                self.clear_status();
                self.publish();
                self.schedule_reconnect();
            }
            LinkEvent::Closed(_) => {
                log::warn!("Timing controller closed the status stream");
                self.stream_task = None;
                self.conn.dropped();
                self.clear_status();
                self.publish();
                self.schedule_reconnect();
            }
        }
    }

    fn handle_command(&mut self, command: LinkCommand) {
        match command {
            LinkCommand::SetAddress(address, ack) => {
                let address = normalize_address(address);
                if address != self.address {
                    log::info!("Timing controller address set to {:?}", address);
                    self.abort_stream();
                    self.reconnect_at = None;
                    self.conn.reset();
                    self.clear_status();
                    self.client = address.as_deref().map(ControllerClient::new);
                    self.address = address;
                    self.publish();
                    self.connect();
                }
                let _ = ack.send(());
            }
            LinkCommand::Connect(ack) => {
                self.paused = false;
                if !self.conn.is_connected() {
                    self.connect();
                }
                let _ = ack.send(());
            }
            LinkCommand::Disconnect(ack) => {
                log::info!("Hardware link disconnected by operator");
                self.paused = true;
                self.abort_stream();
                self.reconnect_at = None;
                self.conn.reset();
                self.clear_status();
                self.publish();
                let _ = ack.send(());
            }
            LinkCommand::Shutdown => {}
            LinkCommand::SetGate(is_down, reply) => {
                self.dispatch(reply, move |c| async move { c.set_gate(is_down).await });
            }
            LinkCommand::TestServo(angle, reply) => {
                self.dispatch(reply, move |c| async move { c.test_servo(angle).await });
            }
            LinkCommand::GetCalibration(reply) => {
                self.dispatch(reply, |c| async move { c.calibration().await });
            }
            LinkCommand::SetCalibration(calibration, reply) => {
                self.dispatch(reply, move |c| async move {
                    c.set_calibration(calibration).await
                });
            }
            LinkCommand::RunHeat(heat_id, lanes, reply) => {
                self.dispatch(reply, move |c| async move { c.run_heat(heat_id, lanes).await });
            }
        }
    }

    /// Run a REST command in its own task so a long heat never blocks the
    /// status stream.
    fn dispatch<T, F, Fut>(&self, reply: Reply<T>, call: F)
    where
        T: Send + 'static,
        F: FnOnce(ControllerClient) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, HardwareError>> + Send + 'static,
    {
        match self.client.clone() {
            None => {
                let _ = reply.send(Err(HardwareError::NotConfigured));
            }
            Some(client) => {
                tokio::spawn(async move {
                    if reply.send(call(client).await).is_err() {
                        log::warn!("Timing controller answered after the caller went away");
                    }
                });
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn stream_status<S: StatusSource>(
    source: Arc<S>,
    url: String,
    generation: u64,
    events: mpsc::Sender<LinkEvent>,
) {
    let mut stream = match source.connect(&url).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = events.send(LinkEvent::Failed(generation, e)).await;
            return;
        }
    };
    if events.send(LinkEvent::Connected(generation)).await.is_err() {
        return;
    }
    while let Some(frame) = stream.next().await {
        let event = match frame {
            Ok(text) => LinkEvent::Message(generation, text),
            Err(e) => {
                let _ = events.send(LinkEvent::Failed(generation, e)).await;
                return;
            }
        };
        if events.send(event).await.is_err() {
            return;
        }
    }
    let _ = events.send(LinkEvent::Closed(generation)).await;
}
