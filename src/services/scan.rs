//! WiFi scan driver
//!
//! The device answers a scan request with 202 while the radio is still busy,
//! so the scan has to be polled until the network list materializes.

use crate::{
    common::StateObserver,
    config::ScanConfig,
    device_client::{DeviceApi, ScanResult},
    services::InFlight,
    timer::Delay,
};
use log::{debug, info, warn};
use serde::Serialize;
use std::{
    sync::{Mutex, PoisonError, atomic::AtomicBool},
    time::Duration,
};

/// Retry budget and waits of the scan poller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanPolicy {
    /// Requests in total, shared by the pending and the error path
    pub max_attempts: u32,
    pub pending_delay: Duration,
    pub error_delay: Duration,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            pending_delay: Duration::from_millis(2000),
            error_delay: Duration::from_millis(1000),
        }
    }
}

impl From<&ScanConfig> for ScanPolicy {
    fn from(config: &ScanConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            pending_delay: config.pending_delay,
            error_delay: config.error_delay,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScanState {
    #[default]
    Idle,
    InProgress {
        attempt: u32,
        max_attempts: u32,
    },
    Succeeded {
        results: Vec<ScanResult>,
    },
    Failed {
        attempts_exhausted: bool,
        message: String,
    },
}

impl ScanState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanState::Succeeded { .. } | ScanState::Failed { .. })
    }
}

/// Sort strongest networks first, keeping the device order among equals
pub fn sort_by_signal(results: &mut [ScanResult]) {
    results.sort_by(|a, b| b.rssi.cmp(&a.rssi));
}

pub struct ScanPoller<A, D> {
    api: A,
    delay: D,
    policy: ScanPolicy,
    state: Mutex<ScanState>,
    observer: Option<StateObserver<ScanState>>,
    in_flight: AtomicBool,
}

impl<A, D> ScanPoller<A, D>
where
    A: DeviceApi,
    D: Delay,
{
    pub fn new(api: A, delay: D, policy: ScanPolicy) -> Self {
        Self {
            api,
            delay,
            policy,
            state: Mutex::new(ScanState::Idle),
            observer: None,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Register a hook that is called after every state transition
    pub fn on_state_change(mut self, observer: impl Fn(&ScanState) + Send + Sync + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn policy(&self) -> &ScanPolicy {
        &self.policy
    }

    pub fn state(&self) -> ScanState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Poll the scan endpoint until it yields a network list or the attempt
    /// budget is spent
    pub async fn scan(&self) -> ScanState {
        let Some(_in_flight) = InFlight::acquire(&self.in_flight) else {
            warn!("wifi scan already in progress, ignoring request");
            return ScanState::Failed {
                attempts_exhausted: false,
                message: "scan already in progress".to_string(),
            };
        };

        let max_attempts = self.policy.max_attempts;
        let mut pending_rounds = 0u32;
        let mut error_rounds = 0u32;

        for attempt in 1..=max_attempts {
            self.transition(ScanState::InProgress {
                attempt,
                max_attempts,
            });

            let wait = match self.api.wifi_scan().await {
                Ok(reply) if reply.is_pending() => {
                    pending_rounds += 1;
                    debug!("wifi scan pending (attempt {attempt}/{max_attempts})");
                    self.policy.pending_delay
                }
                Ok(reply) => {
                    let mut results = reply.networks.unwrap_or_default();
                    sort_by_signal(&mut results);
                    info!("wifi scan found {} networks", results.len());

                    let state = ScanState::Succeeded { results };
                    self.transition(state.clone());
                    return state;
                }
                Err(e) => {
                    error_rounds += 1;
                    warn!("wifi scan attempt {attempt}/{max_attempts} failed: {e}");
                    self.policy.error_delay
                }
            };

            if attempt < max_attempts {
                self.delay.sleep(wait).await;
            }
        }

        warn!(
            "wifi scan gave up after {max_attempts} attempts ({pending_rounds} pending, {error_rounds} failed)"
        );

        let state = ScanState::Failed {
            attempts_exhausted: true,
            message: format!("scan did not complete after {max_attempts} attempts"),
        };
        self.transition(state.clone());
        state
    }

    fn transition(&self, next: ScanState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next.clone();

        if let Some(observer) = &self.observer {
            observer(&next);
        }
    }
}
