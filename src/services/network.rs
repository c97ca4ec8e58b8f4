//! WiFi station service
//!
//! Reads the link status of the device and switches it to another network.

use crate::{
    device_client::{DeviceApi, WifiCredentials, WifiStatus},
    error::{DeviceError, Result},
    services::Confirm,
};
use log::info;

/// Outcome of a connect request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The device accepted the credentials and is rebooting
    Rebooting { message: String },
    /// The user declined the confirmation, nothing was sent
    Cancelled,
}

pub struct NetworkService;

impl NetworkService {
    /// Get the current WiFi link status
    pub async fn status<T: DeviceApi>(api: &T) -> Result<WifiStatus> {
        api.wifi_status().await
    }

    pub fn confirm_prompt(ssid: &str) -> String {
        format!("Connect to network \"{ssid}\"? The device will reboot.")
    }

    /// Connect the device to another network
    ///
    /// # Arguments
    /// * `api` - Device API
    /// * `confirm` - Confirmation gate, the device reboots on success
    /// * `ssid` - Network name, must not be empty
    /// * `password` - Network password, may be empty for open networks
    ///
    /// # Returns
    /// `ConnectOutcome::Rebooting` with the device message, or
    /// `ConnectOutcome::Cancelled` if the user declined
    pub async fn connect<T, C>(
        api: &T,
        confirm: &C,
        ssid: &str,
        password: &str,
    ) -> Result<ConnectOutcome>
    where
        T: DeviceApi,
        C: Confirm + ?Sized,
    {
        if ssid.trim().is_empty() {
            return Err(DeviceError::validation("please enter the network name"));
        }

        if !confirm.confirm(&Self::confirm_prompt(ssid)) {
            info!("connect to {ssid:?} cancelled");
            return Ok(ConnectOutcome::Cancelled);
        }

        let reply = api
            .wifi_connect(WifiCredentials {
                ssid: ssid.to_string(),
                password: password.to_string(),
            })
            .await?
            .ensure_ok("failed to connect")?;

        info!("device accepted credentials for {ssid:?}");

        Ok(ConnectOutcome::Rebooting {
            message: reply
                .message
                .unwrap_or_else(|| "Connecting... the device will reboot.".to_string()),
        })
    }
}
