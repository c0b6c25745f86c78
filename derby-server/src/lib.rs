//! # Derby Server
//!
//! Race control server for a gravity car track with an electronic start
//! gate and finish-line timer.
//!
//! This crate wires the pure race logic in [`derby_core`] to the outside
//! world:
//! - Persists entrants, race and settings as JSON documents
//! - Keeps a live link to the timing controller (status stream + commands)
//! - Runs heats: gate, countdown, timing, result folding
//! - Exposes an operator REST API (the `web` module in `main.rs`)
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      derby-server                        │
//! │  ┌──────────────┐   ┌──────────────────────────────────┐ │
//! │  │ REST API     │   │ WS /api/hardware/ws              │ │
//! │  │ (axum)       │   │ (status relay)                   │ │
//! │  └──────┬───────┘   └───────────────▲──────────────────┘ │
//! │         ▼                           │ watch              │
//! │  ┌──────────────────────┐   ┌───────┴──────────────────┐ │
//! │  │ RaceControl (Mutex)  │──►│ HardwareLink ─► LinkActor│ │
//! │  │  - heat phase        │   │  - stream + watchdog     │ │
//! │  │  - RaceStore         │   │  - reconnect timer       │ │
//! │  └──────────────────────┘   │  - ControllerClient REST │ │
//! │                             └──────────────────────────┘ │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## REST API
//!
//! | Endpoint | Description |
//! |----------|-------------|
//! | `GET /api/race` | Race state, heats and manual runs |
//! | `POST /api/race/state` | Advance registration → racing → complete |
//! | `POST /api/race/heats/generate` | Build the heat schedule |
//! | `POST /api/race/heat/ready` | Raise the gate for the current heat |
//! | `POST /api/race/heat/drop` | Count down, run and time the heat |
//! | `POST /api/race/heat/next` | Move on once every lane has a time |
//! | `POST /api/entrants` | Register an entrant |
//! | `PUT /api/settings` | Lane count, heat algorithm, divisions |
//! | `GET /api/hardware/ws` | WebSocket relay of controller status |
//!
//! See `web.rs` for the full list.
//!
//! ## Example: Starting the Server
//!
//! ```rust,no_run
//! use clap::Parser;
//! use derby_server::Cli;
//!
//! let args = Cli::parse_from(["derby-server", "-p", "8080", "--controller", "pi.local:8000"]);
//! assert_eq!(args.port, 8080);
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

pub mod config;
pub mod control;
pub mod hardware;
pub mod storage;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Port for webserver
    #[arg(short, long, default_value_t = 3000)]
    pub port: u16,

    /// Directory holding entrants.json, race.json and settings.json
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,

    /// Timing controller address, e.g. `pi.local:8000` or `http://10.0.0.5:8000`.
    /// Stored in the settings, replacing what was there.
    #[arg(short, long)]
    pub controller: Option<String>,

    /// Seconds between dropping the gate and running the heat
    #[arg(long, default_value_t = 3)]
    pub countdown: u64,
}

impl Cli {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(config::default_data_dir)
    }

    pub fn countdown(&self) -> Duration {
        Duration::from_secs(self.countdown)
    }
}
