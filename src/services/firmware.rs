//! Firmware upload driver
//!
//! Sends one image per invocation and reports byte-level progress while the
//! body is streamed. The device reboots after a successful update.

use crate::{
    common::{StateObserver, format_bytes},
    device_client::{DeviceApi, TransferProgress},
    error::{DeviceError, ErrorKind, Result},
    services::{Confirm, InFlight},
};
use anyhow::Context;
use log::{error, info, warn};
use serde::Serialize;
use std::{
    path::Path,
    sync::{Mutex, PoisonError, atomic::AtomicBool},
};
use tokio::sync::mpsc;

/// First byte of every ESP32 application image
pub const ESP32_IMAGE_MAGIC: u8 = 0xE9;

pub const CONFIRM_PROMPT: &str = "Update the firmware? The device will reboot after the update.";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UploadState {
    #[default]
    Idle,
    Uploading {
        bytes_sent: u64,
        bytes_total: u64,
    },
    Succeeded,
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Succeeded | UploadState::Failed { .. })
    }

    /// Human readable progress text
    pub fn status_line(&self) -> String {
        match self {
            UploadState::Idle => "Ready".to_string(),
            UploadState::Uploading {
                bytes_sent,
                bytes_total,
            } => format!(
                "Uploading... {} / {}",
                format_bytes(*bytes_sent),
                format_bytes(*bytes_total)
            ),
            UploadState::Succeeded => {
                "Firmware updated successfully. The device is rebooting.".to_string()
            }
            UploadState::Failed { message, .. } => format!("Upload failed: {message}"),
        }
    }
}

/// A firmware image read from disk
#[derive(Clone, Debug)]
pub struct FirmwareImage {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl FirmwareImage {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("invalid firmware path: {}", path.display()))?
            .to_string();
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read firmware file: {}", path.display()))?;

        Ok(Self { file_name, bytes })
    }
}

/// Check file name and image header before anything is sent
pub fn validate_firmware(file_name: &str, bytes: &[u8]) -> Result<()> {
    if !file_name.ends_with(".bin") {
        return Err(DeviceError::validation(
            "please select a .bin firmware file",
        ));
    }

    match bytes.first() {
        None => Err(DeviceError::validation("firmware file is empty")),
        Some(&ESP32_IMAGE_MAGIC) => Ok(()),
        Some(_) => Err(DeviceError::validation("invalid ESP32 firmware file")),
    }
}

pub struct FirmwareUploader<A, C> {
    api: A,
    confirm: C,
    state: Mutex<UploadState>,
    observer: Option<StateObserver<UploadState>>,
    in_flight: AtomicBool,
}

impl<A, C> FirmwareUploader<A, C>
where
    A: DeviceApi,
    C: Confirm,
{
    pub fn new(api: A, confirm: C) -> Self {
        Self {
            api,
            confirm,
            state: Mutex::new(UploadState::Idle),
            observer: None,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Register a hook that is called after every state transition
    pub fn on_state_change(
        mut self,
        observer: impl Fn(&UploadState) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn state(&self) -> UploadState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate, confirm and upload one firmware image
    ///
    /// Exactly one request is issued per call. A failed upload has to be
    /// started again by the caller.
    pub async fn upload(&self, bytes: Vec<u8>, file_name: &str) -> UploadState {
        let Some(_in_flight) = InFlight::acquire(&self.in_flight) else {
            warn!("firmware upload already in progress, ignoring request");
            return UploadState::Failed {
                kind: ErrorKind::Busy,
                message: "firmware upload already in progress".to_string(),
            };
        };

        if let Err(e) = validate_firmware(file_name, &bytes) {
            warn!("rejected firmware {file_name}: {e}");
            return self.finish(UploadState::Failed {
                kind: e.kind(),
                message: e.to_string(),
            });
        }

        if !self.confirm.confirm(CONFIRM_PROMPT) {
            info!("firmware update cancelled");
            return self.finish(UploadState::Idle);
        }

        let bytes_total = bytes.len() as u64;
        info!("uploading firmware {file_name} ({})", format_bytes(bytes_total));
        self.transition(UploadState::Uploading {
            bytes_sent: 0,
            bytes_total,
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let upload = self.api.upload_firmware(file_name.to_string(), bytes, tx);
        tokio::pin!(upload);

        let mut bytes_sent = 0;
        let result = loop {
            tokio::select! {
                biased;
                Some(progress) = rx.recv() => self.record_progress(progress, &mut bytes_sent),
                result = &mut upload => break result,
            }
        };
        while let Ok(progress) = rx.try_recv() {
            self.record_progress(progress, &mut bytes_sent);
        }

        let state = match result {
            Ok(()) => {
                info!("firmware upload finished, device is rebooting");
                UploadState::Succeeded
            }
            Err(DeviceError::Transport(e)) => {
                error!("firmware upload failed: {e}");
                UploadState::Failed {
                    kind: ErrorKind::Transport,
                    message: "connection error".to_string(),
                }
            }
            Err(e) => {
                error!("firmware upload failed: {e}");
                UploadState::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                }
            }
        };

        self.finish(state)
    }

    fn record_progress(&self, progress: TransferProgress, bytes_sent: &mut u64) {
        // ticks never move backwards or past the total
        *bytes_sent = progress.loaded.min(progress.total).max(*bytes_sent);

        self.transition(UploadState::Uploading {
            bytes_sent: *bytes_sent,
            bytes_total: progress.total,
        });
    }

    fn finish(&self, state: UploadState) -> UploadState {
        self.transition(state.clone());
        state
    }

    fn transition(&self, next: UploadState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next.clone();

        if let Some(observer) = &self.observer {
            observer(&next);
        }
    }
}
