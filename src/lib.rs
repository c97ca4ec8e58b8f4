pub mod common;
pub mod config;
pub mod device_client;
pub mod error;
pub mod http_client;
pub mod services;
pub mod timer;

pub use device_client::{DeviceApi, HttpDeviceClient};
pub use error::{DeviceError, ErrorKind, Result};
pub use services::{
    Confirm,
    firmware::{FirmwareUploader, UploadState},
    scan::{ScanPoller, ScanPolicy, ScanState},
};
