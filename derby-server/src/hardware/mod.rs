//! Timing controller access.
//!
//! The controller (start gate servo plus finish-line sensors) is reached two
//! ways: a WebSocket status stream, owned by the [`link::LinkActor`], and
//! plain REST commands issued through [`client::ControllerClient`].
//! Everything else in the server talks to [`link::HardwareLink`], a cheap
//! cloneable handle onto the actor.

use async_trait::async_trait;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use derby_core::protocol::HeatResult;
use derby_core::HeatId;
use thiserror::Error;

pub mod client;
pub mod link;

pub use client::ControllerClient;
pub use link::{HardwareLink, LinkActor, StatusSource, WebSocketSource};

#[derive(Error, Debug)]
pub enum HardwareError {
    #[error("No timing controller address configured")]
    NotConfigured,
    #[error("Timing controller unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Timing controller answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Unexpected response from timing controller: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("Status stream failed: {0}")]
    Stream(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("No answer from status stream within {0:?}")]
    ConnectTimeout(std::time::Duration),
    #[error("Hardware link has shut down")]
    LinkClosed,
}

impl HardwareError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            HardwareError::NotConfigured | HardwareError::LinkClosed => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for HardwareError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

/// How a `run_heat` request ended when the controller answered.
#[derive(Debug, Clone, PartialEq)]
pub enum RunHeatOutcome {
    Finished(HeatResult),
    /// Controller refused with 409, usually a false start it cancelled
    Cancelled,
}

/// The commands race control needs from the timing controller.
#[async_trait]
pub trait TimingController: Send + Sync {
    async fn set_gate(&self, is_down: bool) -> Result<(), HardwareError>;

    /// Drop the gate and time the given 1-indexed lanes.
    async fn run_heat(
        &self,
        heat_id: HeatId,
        occupied_lanes: Vec<usize>,
    ) -> Result<RunHeatOutcome, HardwareError>;
}
