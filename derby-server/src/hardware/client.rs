//! REST commands to the timing controller.

use derby_core::protocol::{
    self, GatePosition, HealthResponse, HeatResult, HeatSetup, ServoCalibration,
    ServoTestRequest,
};
use derby_core::HeatId;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use super::{HardwareError, RunHeatOutcome};

/// Gate, servo and calibration calls answer right away.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// A heat takes a few seconds plus however long the controller waits for
/// stragglers before calling DNF.
const RUN_HEAT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ControllerClient {
    http: reqwest::Client,
    base_url: String,
}

impl ControllerClient {
    pub fn new(address: &str) -> Self {
        ControllerClient {
            http: reqwest::Client::new(),
            base_url: protocol::command_base_url(address),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, HardwareError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(HardwareError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, HardwareError> {
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<reqwest::Response, HardwareError> {
        log::debug!("POST {}{}", self.base_url, path);
        let response = self
            .http
            .post(self.url(path))
            .timeout(timeout)
            .json(body)
            .send()
            .await?;
        Ok(response)
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, HardwareError> {
        log::debug!("GET {}{}", self.base_url, path);
        let response = self
            .http
            .get(self.url(path))
            .timeout(COMMAND_TIMEOUT)
            .send()
            .await?;
        Self::check(response).await
    }

    pub async fn health(&self) -> Result<HealthResponse, HardwareError> {
        let response = self.get(protocol::HEALTH_PATH).await?;
        Self::decode(response).await
    }

    pub async fn set_gate(&self, is_down: bool) -> Result<(), HardwareError> {
        let response = self
            .post(protocol::GATE_PATH, &GatePosition { is_down }, COMMAND_TIMEOUT)
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn test_servo(&self, angle: f64) -> Result<(), HardwareError> {
        let response = self
            .post(
                protocol::SERVO_TEST_PATH,
                &ServoTestRequest { angle },
                COMMAND_TIMEOUT,
            )
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn calibration(&self) -> Result<ServoCalibration, HardwareError> {
        let response = self.get(protocol::SERVO_CALIBRATION_PATH).await?;
        Self::decode(response).await
    }

    pub async fn set_calibration(&self, calibration: ServoCalibration) -> Result<(), HardwareError> {
        let response = self
            .post(protocol::SERVO_CALIBRATION_PATH, &calibration, COMMAND_TIMEOUT)
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Run one heat. A 409 answer is [`RunHeatOutcome::Cancelled`], not an error.
    pub async fn run_heat(
        &self,
        heat_id: HeatId,
        occupied_lanes: Vec<usize>,
    ) -> Result<RunHeatOutcome, HardwareError> {
        let setup = HeatSetup::new(heat_id, occupied_lanes);
        let response = self
            .post(protocol::RUN_HEAT_PATH, &setup, RUN_HEAT_TIMEOUT)
            .await?;
        if response.status() == StatusCode::CONFLICT {
            log::warn!("Heat {} cancelled by the timing controller", heat_id);
            return Ok(RunHeatOutcome::Cancelled);
        }
        let response = Self::check(response).await?;
        let result: HeatResult = Self::decode(response).await?;
        Ok(RunHeatOutcome::Finished(result))
    }
}
