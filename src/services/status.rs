//! Device health overview

use crate::{
    device_client::{DeviceApi, DeviceStatus},
    error::Result,
    timer::Delay,
};
use log::{debug, error};
use std::time::Duration;

impl DeviceStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

pub struct StatusService;

impl StatusService {
    pub async fn snapshot<T: DeviceApi>(api: &T) -> Result<DeviceStatus> {
        api.status().await
    }

    /// Poll the status endpoint periodically
    ///
    /// A failed round is logged and polling continues with the next one.
    /// `rounds == None` polls until the future is dropped.
    ///
    /// # Returns
    /// The number of rounds that delivered a status
    pub async fn watch<T, D, F>(
        api: &T,
        delay: &D,
        interval: Duration,
        rounds: Option<u32>,
        mut on_status: F,
    ) -> u32
    where
        T: DeviceApi,
        D: Delay,
        F: FnMut(&DeviceStatus),
    {
        let mut round = 0u32;
        let mut delivered = 0u32;

        loop {
            round += 1;

            match api.status().await {
                Ok(status) => {
                    debug!("status round {round}: {}", status.status);
                    delivered += 1;
                    on_status(&status);
                }
                Err(e) => error!("failed to get device status: {e}"),
            }

            if rounds.is_some_and(|r| round >= r) {
                return delivered;
            }

            delay.sleep(interval).await;
        }
    }
}
