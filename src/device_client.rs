use crate::{
    common::SignalQuality,
    config::{DeviceConfig, UploadConfig},
    error::{DeviceError, Result},
    http_client::{build_url, device_http_client, error_message, handle_http_response},
};
use futures_util::StreamExt;
use log::{debug, info};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use reqwest::{
    Body, Client, RequestBuilder, StatusCode,
    multipart::{Form, Part},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_valid::Validate;
use std::fmt::Debug;
use tokio::sync::mpsc::UnboundedSender;
use trait_variant::make;

/// One network reported by a WiFi scan
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ScanResult {
    pub ssid: String,
    pub rssi: i32,
    pub channel: u32,
    /// ESP32 auth mode, zero is an open network
    pub encryption: u8,
}

impl ScanResult {
    pub fn is_open(&self) -> bool {
        self.encryption == 0
    }

    pub fn signal_quality(&self) -> SignalQuality {
        SignalQuality::from_rssi(self.rssi)
    }
}

/// Body of `/api/wifi/scan` together with the HTTP status it arrived with
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ScanReply {
    #[serde(skip)]
    pub http_status: u16,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub networks: Option<Vec<ScanResult>>,
}

impl ScanReply {
    /// The device is still scanning and the request has to be repeated
    pub fn is_pending(&self) -> bool {
        self.http_status == StatusCode::ACCEPTED.as_u16() || self.status.as_deref() == Some("scanning")
    }
}

/// Generic `{status, message, error}` reply of the device's command endpoints
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ApiReply {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ApiReply {
    pub fn is_ok(&self) -> bool {
        self.status.as_deref() == Some("ok")
    }

    /// Turn a reply without `status: "ok"` into a server error
    pub fn ensure_ok(self, fallback: &str) -> Result<Self> {
        if self.is_ok() {
            return Ok(self);
        }

        Err(DeviceError::Server {
            status: StatusCode::OK.as_u16(),
            message: self
                .error
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| fallback.to_string()),
        })
    }
}

/// One upload progress tick
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferProgress {
    pub loaded: u64,
    pub total: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct WifiStatus {
    pub connected: bool,
    pub ssid: String,
    pub rssi: i32,
    pub ip: String,
    pub mac: String,
    pub gateway: String,
    pub subnet: String,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DeviceStatus {
    pub status: String,
    pub uptime: Uptime,
    pub memory: Memory,
    pub wifi: LinkStatus,
    pub spiffs: StorageUsage,
    pub cpu: CpuInfo,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Uptime {
    pub milliseconds: u64,
    pub formatted: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Memory {
    pub heap: HeapUsage,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HeapUsage {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub usage_percent: f64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LinkStatus {
    pub connected: bool,
    pub ssid: String,
    pub rssi: i32,
    pub ip: String,
    pub mac: String,
    pub signal_strength: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StorageUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub usage_percent: f64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct CpuInfo {
    pub chip_model: String,
    pub frequency_mhz: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Validate)]
#[serde(default)]
pub struct NtpConfig {
    pub enabled: bool,
    #[validate(min_length = 1)]
    pub server: String,
    /// Offset from UTC in seconds
    pub offset: i64,
    /// Sync interval in milliseconds
    #[validate(minimum = 60000)]
    pub interval: u64,
}

impl Default for NtpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server: "pool.ntp.org".to_string(),
            offset: -10800,
            interval: 3_600_000,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct NtpTime {
    pub time: String,
    pub enabled: bool,
    pub synced: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Validate)]
#[serde(default)]
pub struct StepperConfig {
    pub enabled: bool,
    /// Speed in RPM
    #[validate(minimum = 1)]
    #[validate(maximum = 15)]
    pub speed: i32,
    #[validate(minimum = 200)]
    #[validate(maximum = 8000)]
    pub steps_per_rev: i32,
    #[validate(minimum = 0)]
    #[validate(maximum = 39)]
    pub pin1: i32,
    #[validate(minimum = 0)]
    #[validate(maximum = 39)]
    pub pin2: i32,
    #[validate(minimum = 0)]
    #[validate(maximum = 39)]
    pub pin3: i32,
    #[validate(minimum = 0)]
    #[validate(maximum = 39)]
    pub pin4: i32,
}

impl StepperConfig {
    pub fn pins(&self) -> [i32; 4] {
        [self.pin1, self.pin2, self.pin3, self.pin4]
    }
}

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            speed: 10,
            steps_per_rev: 2048,
            pin1: 25,
            pin2: 26,
            pin3: 27,
            pin4: 14,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct StepperStatus {
    pub enabled: bool,
    pub moving: bool,
    pub position: i64,
}

#[derive(Debug, Serialize)]
struct MoveRequest {
    degrees: i32,
}

#[derive(Debug, Serialize)]
struct StepRequest {
    steps: i32,
}

/// Device REST API as seen by the drivers and services
#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait DeviceApi {
    async fn wifi_scan(&self) -> Result<ScanReply>;
    async fn upload_firmware(
        &self,
        file_name: String,
        firmware: Vec<u8>,
        progress: UnboundedSender<TransferProgress>,
    ) -> Result<()>;
    async fn status(&self) -> Result<DeviceStatus>;
    async fn wifi_status(&self) -> Result<WifiStatus>;
    async fn wifi_connect(&self, credentials: WifiCredentials) -> Result<ApiReply>;
    async fn ntp_config(&self) -> Result<NtpConfig>;
    async fn set_ntp_config(&self, config: NtpConfig) -> Result<ApiReply>;
    async fn ntp_time(&self) -> Result<NtpTime>;
    async fn stepper_config(&self) -> Result<StepperConfig>;
    async fn set_stepper_config(&self, config: StepperConfig) -> Result<ApiReply>;
    async fn stepper_status(&self) -> Result<StepperStatus>;
    async fn stepper_move(&self, degrees: i32) -> Result<ApiReply>;
    async fn stepper_step(&self, steps: i32) -> Result<ApiReply>;
    async fn stepper_stop(&self) -> Result<ApiReply>;
    async fn stepper_reset(&self) -> Result<ApiReply>;
}

/// `DeviceApi` over HTTP with Basic authentication
#[derive(Clone)]
pub struct HttpDeviceClient {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    upload: UploadConfig,
}

impl HttpDeviceClient {
    // API endpoint constants
    const WIFI_SCAN_ENDPOINT: &str = "/api/wifi/scan";
    const WIFI_STATUS_ENDPOINT: &str = "/api/wifi/status";
    const WIFI_CONNECT_ENDPOINT: &str = "/api/wifi/connect";
    const FIRMWARE_UPLOAD_ENDPOINT: &str = "/api/firmware/upload";
    const STATUS_ENDPOINT: &str = "/api/status";
    const NTP_CONFIG_ENDPOINT: &str = "/api/ntp/config";
    const NTP_TIME_ENDPOINT: &str = "/api/ntp/time";
    const STEPPER_CONFIG_ENDPOINT: &str = "/api/stepper/config";
    const STEPPER_STATUS_ENDPOINT: &str = "/api/stepper/status";
    const STEPPER_MOVE_ENDPOINT: &str = "/api/stepper/move";
    const STEPPER_STEP_ENDPOINT: &str = "/api/stepper/step";
    const STEPPER_STOP_ENDPOINT: &str = "/api/stepper/stop";
    const STEPPER_RESET_ENDPOINT: &str = "/api/stepper/reset";

    /// Multipart field name the firmware expects the image under
    pub const FIRMWARE_FIELD: &str = "firmware";

    pub fn new(device: &DeviceConfig, upload: &UploadConfig) -> anyhow::Result<Self> {
        Ok(HttpDeviceClient {
            client: device_http_client(device)?,
            base_url: device.base_url.clone(),
            username: device.username.clone(),
            password: device.password.clone(),
            upload: upload.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        build_url(&self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.username, Some(&self.password))
    }

    /// GET request returning a JSON document
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        debug!("GET {url}");

        let res = self.authorized(self.client.get(&url)).send().await?;
        let body = handle_http_response(res, &format!("GET {path} failed")).await?;

        Ok(serde_json::from_str(&body)?)
    }

    /// POST request to a command endpoint (empty body)
    async fn post(&self, path: &str) -> Result<ApiReply> {
        let url = self.url(path);
        info!("POST {url}");

        let res = self.authorized(self.client.post(&url)).send().await?;
        let body = handle_http_response(res, &format!("POST {path} failed")).await?;

        Ok(serde_json::from_str(&body)?)
    }

    /// POST request to a command endpoint with JSON body
    async fn post_json(&self, path: &str, body: impl Debug + Serialize) -> Result<ApiReply> {
        let url = self.url(path);
        info!("POST {url} with body: {body:?}");

        let res = self
            .authorized(self.client.post(&url))
            .json(&body)
            .send()
            .await?;
        let body = handle_http_response(res, &format!("POST {path} failed")).await?;

        Ok(serde_json::from_str(&body)?)
    }
}

impl DeviceApi for HttpDeviceClient {
    async fn wifi_scan(&self) -> Result<ScanReply> {
        let url = self.url(Self::WIFI_SCAN_ENDPOINT);
        debug!("GET {url}");

        let res = self.authorized(self.client.get(&url)).send().await?;
        let status = res.status();
        let body = handle_http_response(res, "wifi scan failed").await?;

        // 202 bodies are informational only
        let mut reply: ScanReply = if status == StatusCode::ACCEPTED {
            serde_json::from_str(&body).unwrap_or_default()
        } else {
            serde_json::from_str(&body)?
        };
        reply.http_status = status.as_u16();

        Ok(reply)
    }

    async fn upload_firmware(
        &self,
        file_name: String,
        firmware: Vec<u8>,
        progress: UnboundedSender<TransferProgress>,
    ) -> Result<()> {
        let url = self.url(Self::FIRMWARE_UPLOAD_ENDPOINT);
        let total = firmware.len() as u64;
        info!("POST {url} with {file_name} ({total} bytes)");

        let chunks: Vec<Vec<u8>> = firmware
            .chunks(self.upload.chunk_size)
            .map(<[u8]>::to_vec)
            .collect();
        let mut loaded = 0u64;
        let stream = futures_util::stream::iter(chunks).map(move |chunk| {
            loaded += chunk.len() as u64;
            // the receiver is gone once the caller stops listening
            let _ = progress.send(TransferProgress { loaded, total });
            Ok::<_, std::io::Error>(chunk)
        });

        let part = Part::stream_with_length(Body::wrap_stream(stream), total)
            .file_name(file_name)
            .mime_str("application/octet-stream")?;
        let form = Form::new().part(Self::FIRMWARE_FIELD, part);

        let res = self
            .authorized(self.client.post(&url))
            .timeout(self.upload.timeout)
            .multipart(form)
            .send()
            .await?;

        let status = res.status();
        if status == StatusCode::OK {
            return Ok(());
        }

        let body = res.text().await.unwrap_or_default();
        Err(DeviceError::Server {
            status: status.as_u16(),
            message: error_message(&body, "firmware update failed"),
        })
    }

    async fn status(&self) -> Result<DeviceStatus> {
        self.get(Self::STATUS_ENDPOINT).await
    }

    async fn wifi_status(&self) -> Result<WifiStatus> {
        self.get(Self::WIFI_STATUS_ENDPOINT).await
    }

    async fn wifi_connect(&self, credentials: WifiCredentials) -> Result<ApiReply> {
        // keep the password out of the log
        let url = self.url(Self::WIFI_CONNECT_ENDPOINT);
        info!("POST {url} for network {:?}", credentials.ssid);

        let res = self
            .authorized(self.client.post(&url))
            .json(&credentials)
            .send()
            .await?;
        let body = handle_http_response(res, "failed to connect").await?;

        Ok(serde_json::from_str(&body)?)
    }

    async fn ntp_config(&self) -> Result<NtpConfig> {
        self.get(Self::NTP_CONFIG_ENDPOINT).await
    }

    async fn set_ntp_config(&self, config: NtpConfig) -> Result<ApiReply> {
        self.post_json(Self::NTP_CONFIG_ENDPOINT, config).await
    }

    async fn ntp_time(&self) -> Result<NtpTime> {
        self.get(Self::NTP_TIME_ENDPOINT).await
    }

    async fn stepper_config(&self) -> Result<StepperConfig> {
        self.get(Self::STEPPER_CONFIG_ENDPOINT).await
    }

    async fn set_stepper_config(&self, config: StepperConfig) -> Result<ApiReply> {
        self.post_json(Self::STEPPER_CONFIG_ENDPOINT, config).await
    }

    async fn stepper_status(&self) -> Result<StepperStatus> {
        self.get(Self::STEPPER_STATUS_ENDPOINT).await
    }

    async fn stepper_move(&self, degrees: i32) -> Result<ApiReply> {
        self.post_json(Self::STEPPER_MOVE_ENDPOINT, MoveRequest { degrees })
            .await
    }

    async fn stepper_step(&self, steps: i32) -> Result<ApiReply> {
        self.post_json(Self::STEPPER_STEP_ENDPOINT, StepRequest { steps })
            .await
    }

    async fn stepper_stop(&self) -> Result<ApiReply> {
        self.post(Self::STEPPER_STOP_ENDPOINT).await
    }

    async fn stepper_reset(&self) -> Result<ApiReply> {
        self.post(Self::STEPPER_RESET_ENDPOINT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod scan_reply {
        use super::*;

        #[test]
        fn accepted_status_is_pending() {
            let reply = ScanReply {
                http_status: 202,
                ..Default::default()
            };
            assert!(reply.is_pending());
        }

        #[test]
        fn scanning_body_is_pending_regardless_of_status() {
            let mut reply: ScanReply =
                serde_json::from_str(r#"{"status":"scanning","message":"Scan in progress"}"#)
                    .unwrap();
            reply.http_status = 200;
            assert!(reply.is_pending());
        }

        #[test]
        fn empty_network_list_is_not_pending() {
            let mut reply: ScanReply = serde_json::from_str(r#"{"networks":[]}"#).unwrap();
            reply.http_status = 200;
            assert!(!reply.is_pending());
            assert_eq!(reply.networks, Some(vec![]));
        }

        #[test]
        fn parses_networks_with_quotes_in_ssid() {
            let reply: ScanReply = serde_json::from_str(
                r#"{"networks":[{"ssid":"Joe's \"Guest\"","rssi":-61,"channel":6,"encryption":3}]}"#,
            )
            .unwrap();
            let networks = reply.networks.unwrap();
            assert_eq!(networks[0].ssid, "Joe's \"Guest\"");
            assert!(!networks[0].is_open());
            assert_eq!(networks[0].signal_quality(), SignalQuality::Fair);
        }
    }

    mod api_reply {
        use super::*;

        #[test]
        fn ok_status_passes() {
            let reply: ApiReply =
                serde_json::from_str(r#"{"status":"ok","message":"Configuration saved"}"#).unwrap();
            assert!(reply.ensure_ok("failed to save").is_ok());
        }

        #[test]
        fn error_field_becomes_message() {
            let reply: ApiReply = serde_json::from_str(r#"{"error":"Invalid JSON"}"#).unwrap();
            let err = reply.ensure_ok("failed to save").unwrap_err();
            assert_eq!(err.to_string(), "Invalid JSON");
        }

        #[test]
        fn missing_error_uses_fallback() {
            let err = ApiReply::default().ensure_ok("failed to save").unwrap_err();
            assert_eq!(err.to_string(), "failed to save");
        }
    }

    mod defaults {
        use super::*;

        #[test]
        fn ntp_config_fills_missing_fields() {
            let config: NtpConfig = serde_json::from_str(r#"{"server":"time.google.com"}"#).unwrap();
            assert_eq!(config.server, "time.google.com");
            assert_eq!(config.offset, -10800);
            assert_eq!(config.interval, 3_600_000);
            assert!(config.enabled);
        }

        #[test]
        fn stepper_config_fills_missing_fields() {
            let config: StepperConfig = serde_json::from_str(r#"{"speed":5}"#).unwrap();
            assert_eq!(config.speed, 5);
            assert_eq!(config.steps_per_rev, 2048);
            assert_eq!(config.pins(), [25, 26, 27, 14]);
        }

        #[test]
        fn device_status_tolerates_partial_documents() {
            let status: DeviceStatus = serde_json::from_str(
                r#"{"status":"healthy","memory":{"heap":{"total":327680,"free":200000}}}"#,
            )
            .unwrap();
            assert_eq!(status.status, "healthy");
            assert_eq!(status.memory.heap.total, 327680);
            assert_eq!(status.cpu, CpuInfo::default());
        }
    }

    mod constants {
        use super::*;

        #[test]
        fn api_endpoints_are_correctly_defined() {
            assert_eq!(HttpDeviceClient::WIFI_SCAN_ENDPOINT, "/api/wifi/scan");
            assert_eq!(
                HttpDeviceClient::FIRMWARE_UPLOAD_ENDPOINT,
                "/api/firmware/upload"
            );
            assert_eq!(HttpDeviceClient::STATUS_ENDPOINT, "/api/status");
            assert_eq!(HttpDeviceClient::NTP_CONFIG_ENDPOINT, "/api/ntp/config");
            assert_eq!(
                HttpDeviceClient::STEPPER_RESET_ENDPOINT,
                "/api/stepper/reset"
            );
            assert_eq!(HttpDeviceClient::FIRMWARE_FIELD, "firmware");
        }
    }
}
