use clap::Parser;
use log::info;
use miette::{IntoDiagnostic, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

use derby_server::{
    control::RaceControl,
    hardware::{HardwareLink, WebSocketSource},
    storage::{JsonFileStore, RaceStore},
    Cli, VERSION,
};

mod web;

use web::Web;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .format_timestamp_millis()
        .init();

    info!("derby-server {} starting", VERSION);

    let mut store = JsonFileStore::open(args.data_dir()).into_diagnostic()?;
    info!("Race data in {}", store.base_dir().display());

    let mut settings = store.settings().into_diagnostic()?;
    if let Some(address) = &args.controller {
        settings.controller_address = Some(address.clone());
        store.save_settings(&settings).into_diagnostic()?;
    }
    let address = settings.controller_address().map(str::to_string);
    match &address {
        Some(address) => info!("Timing controller at {}", address),
        None => info!("No timing controller configured, times are entered by hand"),
    }

    let (link, actor) = HardwareLink::new(WebSocketSource::default(), address);
    let control =
        RaceControl::new(store, Arc::new(link.clone()), args.countdown()).into_diagnostic()?;
    let web = Web::new(args.port, control, link);

    Toplevel::new(|s| async move {
        s.start(SubsystemBuilder::new("HardwareLink", |subsys| actor.run(subsys)));
        s.start(SubsystemBuilder::new("Webserver", |subsys| web.run(subsys)));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_millis(5000))
    .await
    .map_err(Into::into)
}
