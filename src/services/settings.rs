//! NTP clock and stepper motor settings
//!
//! Configuration is validated locally with the same limits the device
//! enforces, so an invalid form never reaches the network.

use crate::{
    device_client::{ApiReply, DeviceApi, NtpConfig, NtpTime, StepperConfig, StepperStatus},
    error::{DeviceError, Result},
};
use log::{debug, info};
use serde_valid::Validate;

pub struct SettingsService;

impl SettingsService {
    pub async fn ntp_config<T: DeviceApi>(api: &T) -> Result<NtpConfig> {
        api.ntp_config().await
    }

    pub async fn ntp_time<T: DeviceApi>(api: &T) -> Result<NtpTime> {
        api.ntp_time().await
    }

    /// Validate and store the NTP configuration
    ///
    /// # Arguments
    /// * `api` - Device API
    /// * `config` - Non-empty server, interval of at least one minute
    pub async fn save_ntp_config<T: DeviceApi>(api: &T, config: NtpConfig) -> Result<ApiReply> {
        info!("save ntp config: {config:?}");

        Self::validate_ntp_config(&config)?;

        api.set_ntp_config(config)
            .await?
            .ensure_ok("failed to save")
    }

    pub fn validate_ntp_config(config: &NtpConfig) -> Result<()> {
        if config.server.trim().is_empty() {
            return Err(DeviceError::validation("NTP server must not be empty"));
        }
        config.validate()?;

        Ok(())
    }

    pub async fn stepper_config<T: DeviceApi>(api: &T) -> Result<StepperConfig> {
        api.stepper_config().await
    }

    pub async fn stepper_status<T: DeviceApi>(api: &T) -> Result<StepperStatus> {
        api.stepper_status().await
    }

    /// Validate and store the stepper motor configuration
    ///
    /// # Arguments
    /// * `api` - Device API
    /// * `config` - Speed 1-15 RPM, 200-8000 steps per revolution and four
    ///   distinct GPIO pins between 0 and 39
    pub async fn save_stepper_config<T: DeviceApi>(
        api: &T,
        config: StepperConfig,
    ) -> Result<ApiReply> {
        info!("save stepper config: {config:?}");

        Self::validate_stepper_config(&config)?;

        api.set_stepper_config(config)
            .await?
            .ensure_ok("failed to save")
    }

    pub fn validate_stepper_config(config: &StepperConfig) -> Result<()> {
        config.validate()?;

        let pins = config.pins();
        for (i, pin) in pins.iter().enumerate() {
            if pins[i + 1..].contains(pin) {
                return Err(DeviceError::validation(format!(
                    "GPIO {pin} is assigned to more than one motor pin"
                )));
            }
        }

        Ok(())
    }

    pub async fn move_degrees<T: DeviceApi>(api: &T, degrees: i32) -> Result<ApiReply> {
        debug!("move stepper by {degrees} degrees");
        api.stepper_move(degrees)
            .await?
            .ensure_ok("failed to move motor")
    }

    pub async fn move_steps<T: DeviceApi>(api: &T, steps: i32) -> Result<ApiReply> {
        debug!("move stepper by {steps} steps");
        api.stepper_step(steps)
            .await?
            .ensure_ok("failed to move motor")
    }

    pub async fn stop<T: DeviceApi>(api: &T) -> Result<ApiReply> {
        api.stepper_stop().await?.ensure_ok("failed to stop motor")
    }

    pub async fn reset_position<T: DeviceApi>(api: &T) -> Result<ApiReply> {
        api.stepper_reset()
            .await?
            .ensure_ok("failed to reset position")
    }
}
