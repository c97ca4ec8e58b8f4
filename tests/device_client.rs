use dispenser_console::{
    config::{DeviceConfig, UploadConfig},
    device_client::{
        DeviceApi, HttpDeviceClient, NtpConfig, StepperConfig, TransferProgress, WifiCredentials,
    },
    error::{DeviceError, ErrorKind},
    services::{
        firmware::{ESP32_IMAGE_MAGIC, FirmwareUploader, UploadState},
        scan::{ScanPoller, ScanPolicy, ScanState},
        settings::SettingsService,
    },
    timer::TokioDelay,
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

// "admin:admin"
const BASIC_ADMIN: &str = "Basic YWRtaW46YWRtaW4=";

#[derive(Clone, Debug)]
struct RecordedRequest {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl RecordedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

struct MockDevice {
    base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    handle: JoinHandle<()>,
}

impl MockDevice {
    fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn client(&self) -> HttpDeviceClient {
        HttpDeviceClient::new(
            &DeviceConfig {
                base_url: self.base_url.clone(),
                username: "admin".to_string(),
                password: "admin".to_string(),
                request_timeout: Duration::from_secs(5),
            },
            &UploadConfig {
                timeout: Duration::from_secs(5),
                chunk_size: 64,
            },
        )
        .expect("failed to create device client")
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Read one request from the connection, `None` once the client hung up
async fn read_request<R>(reader: &mut BufReader<R>) -> Option<RecordedRequest>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await.ok()? == 0 {
        return None;
    }
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.ok()?;
        if line.trim().is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_lowercase(), value.trim().to_string()));
    }

    let header = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    };

    let mut body = Vec::new();
    if let Some(len) = header("content-length") {
        body.resize(len.parse().ok()?, 0);
        reader.read_exact(&mut body).await.ok()?;
    } else if header("transfer-encoding").is_some_and(|v| v.contains("chunked")) {
        loop {
            let mut size = String::new();
            reader.read_line(&mut size).await.ok()?;
            let size = usize::from_str_radix(size.trim().split(';').next()?, 16).ok()?;
            if size == 0 {
                let mut trailer = String::new();
                reader.read_line(&mut trailer).await.ok()?;
                break;
            }
            let mut chunk = vec![0; size];
            reader.read_exact(&mut chunk).await.ok()?;
            body.extend_from_slice(&chunk);
            let mut crlf = [0; 2];
            reader.read_exact(&mut crlf).await.ok()?;
        }
    }

    Some(RecordedRequest {
        method,
        path,
        headers,
        body,
    })
}

/// Start a device that answers requests in order with the given status and
/// body, repeating the last answer once the list is used up
async fn start_mock_device(responses: Vec<(u16, &'static str)>) -> MockDevice {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind mock device");
    let addr = listener.local_addr().expect("failed to get local address");
    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = requests.clone();
    let responses = Arc::new(Mutex::new((responses, 0usize)));

    let (ready_tx, ready_rx) = oneshot::channel();

    let handle = tokio::spawn(async move {
        let _ = ready_tx.send(());

        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let recorded = recorded.clone();
            let responses = responses.clone();

            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut reader = BufReader::new(read);

                while let Some(request) = read_request(&mut reader).await {
                    recorded.lock().unwrap().push(request);

                    let (status, body) = {
                        let mut guard = responses.lock().unwrap();
                        let (list, next) = &mut *guard;
                        let answer = list[(*next).min(list.len() - 1)];
                        *next += 1;
                        answer
                    };

                    let response = format!(
                        "HTTP/1.1 {status} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
                        body.len()
                    );
                    if write.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    ready_rx.await.expect("mock device failed to start");

    MockDevice {
        base_url: format!("http://{addr}"),
        requests,
        handle,
    }
}

fn firmware_image(len: usize) -> Vec<u8> {
    let mut bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    bytes[0] = ESP32_IMAGE_MAGIC;
    bytes
}

fn fast_policy() -> ScanPolicy {
    ScanPolicy {
        max_attempts: 5,
        pending_delay: Duration::from_millis(20),
        error_delay: Duration::from_millis(10),
    }
}

mod wifi_scan {
    use super::*;

    #[tokio::test]
    async fn accepted_reply_is_pending_and_authenticated() {
        let device = start_mock_device(vec![(
            202,
            r#"{"status":"scanning","message":"Scan in progress"}"#,
        )])
        .await;

        let reply = device.client().wifi_scan().await.expect("scan request failed");

        assert!(reply.is_pending());
        assert_eq!(reply.http_status, 202);

        let requests = device.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "GET");
        assert_eq!(requests[0].path, "/api/wifi/scan");
        assert_eq!(requests[0].header("authorization"), Some(BASIC_ADMIN));
    }

    #[tokio::test]
    async fn server_error_is_reported_with_device_message() {
        let device = start_mock_device(vec![(500, r#"{"error":"Scan failed"}"#)]).await;

        let err = device.client().wifi_scan().await.unwrap_err();

        assert!(matches!(
            err,
            DeviceError::Server { status: 500, ref message } if message == "Scan failed"
        ));
    }

    #[tokio::test]
    async fn poller_retries_until_networks_arrive() {
        let device = start_mock_device(vec![
            (202, r#"{"status":"scanning"}"#),
            (200, "not json"),
            (
                200,
                r#"{"networks":[{"ssid":"Weak","rssi":-80,"channel":1,"encryption":3},{"ssid":"Cafe","rssi":-45,"channel":6,"encryption":0}]}"#,
            ),
        ])
        .await;

        let poller = ScanPoller::new(device.client(), TokioDelay, fast_policy());
        let state = poller.scan().await;

        let ScanState::Succeeded { results } = state else {
            panic!("scan should succeed, got {state:?}");
        };
        assert_eq!(results[0].ssid, "Cafe");
        assert!(results[0].is_open());
        assert_eq!(results[1].ssid, "Weak");
        assert_eq!(device.requests().len(), 3);
    }

    #[tokio::test]
    async fn poller_gives_up_after_five_requests() {
        let device = start_mock_device(vec![(202, r#"{"status":"scanning"}"#)]).await;

        let poller = ScanPoller::new(device.client(), TokioDelay, fast_policy());

        assert!(matches!(
            poller.scan().await,
            ScanState::Failed {
                attempts_exhausted: true,
                ..
            }
        ));
        assert_eq!(device.requests().len(), 5);
    }

    #[tokio::test]
    async fn empty_result_is_final() {
        let device = start_mock_device(vec![(200, r#"{"networks":[]}"#)]).await;

        let poller = ScanPoller::new(device.client(), TokioDelay, fast_policy());

        assert_eq!(
            poller.scan().await,
            ScanState::Succeeded { results: vec![] }
        );
        assert_eq!(device.requests().len(), 1);
    }
}

mod firmware_upload {
    use super::*;

    #[tokio::test]
    async fn sends_multipart_firmware_part_and_reports_progress() {
        let device =
            start_mock_device(vec![(200, r#"{"status":"ok","message":"Update successful"}"#)])
                .await;
        let image = firmware_image(1000);
        let (tx, mut rx) = mpsc::unbounded_channel();

        device
            .client()
            .upload_firmware("app.bin".to_string(), image.clone(), tx)
            .await
            .expect("upload failed");

        let mut ticks = Vec::new();
        while let Ok(tick) = rx.try_recv() {
            ticks.push(tick);
        }
        assert!(!ticks.is_empty());
        assert!(ticks.windows(2).all(|w| w[0].loaded <= w[1].loaded));
        assert_eq!(
            ticks.last(),
            Some(&TransferProgress {
                loaded: 1000,
                total: 1000
            })
        );

        let requests = device.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/api/firmware/upload");
        assert_eq!(request.header("authorization"), Some(BASIC_ADMIN));
        assert!(
            request
                .header("content-type")
                .is_some_and(|v| v.starts_with("multipart/form-data"))
        );

        let body = request.body_text();
        assert!(body.contains(r#"name="firmware""#));
        assert!(body.contains(r#"filename="app.bin""#));
        assert!(body.contains("application/octet-stream"));
        assert!(
            request
                .body
                .windows(image.len())
                .any(|window| window == image.as_slice())
        );
    }

    #[tokio::test]
    async fn rejected_image_surfaces_device_error() {
        let device =
            start_mock_device(vec![(400, r#"{"error":"Invalid ESP32 firmware file"}"#)]).await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = device
            .client()
            .upload_firmware("app.bin".to_string(), firmware_image(128), tx)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Server);
        assert_eq!(err.to_string(), "Invalid ESP32 firmware file");
    }

    #[tokio::test]
    async fn unparsable_error_body_uses_fallback() {
        let device = start_mock_device(vec![(500, "<html>oops</html>")]).await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = device
            .client()
            .upload_firmware("app.bin".to_string(), firmware_image(128), tx)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "firmware update failed");
    }

    #[tokio::test]
    async fn uploader_finishes_after_the_last_tick() {
        let device = start_mock_device(vec![(200, r#"{"status":"ok"}"#)]).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let uploader = FirmwareUploader::new(device.client(), |_: &str| true)
            .on_state_change(move |state| sink.lock().unwrap().push(state.clone()));

        let state = uploader.upload(firmware_image(640), "app.bin").await;

        assert_eq!(state, UploadState::Succeeded);
        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen[seen.len() - 2],
            UploadState::Uploading {
                bytes_sent: 640,
                bytes_total: 640
            }
        );
        assert_eq!(seen.last(), Some(&UploadState::Succeeded));
    }

    #[tokio::test]
    async fn unreachable_device_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpDeviceClient::new(
            &DeviceConfig {
                base_url: format!("http://{addr}"),
                username: "admin".to_string(),
                password: "admin".to_string(),
                request_timeout: Duration::from_secs(2),
            },
            &UploadConfig {
                timeout: Duration::from_secs(2),
                chunk_size: 64,
            },
        )
        .unwrap();
        let uploader = FirmwareUploader::new(client, |_: &str| true);

        assert_eq!(
            uploader.upload(firmware_image(64), "app.bin").await,
            UploadState::Failed {
                kind: ErrorKind::Transport,
                message: "connection error".to_string(),
            }
        );
    }
}

mod settings {
    use super::*;

    #[tokio::test]
    async fn reads_ntp_config_with_defaults() {
        let device = start_mock_device(vec![(200, r#"{"server":"a.st1.ntp.br"}"#)]).await;

        let config = device.client().ntp_config().await.unwrap();

        assert_eq!(
            config,
            NtpConfig {
                server: "a.st1.ntp.br".to_string(),
                ..Default::default()
            }
        );
        assert_eq!(device.requests()[0].path, "/api/ntp/config");
    }

    #[tokio::test]
    async fn saves_stepper_config_as_json() {
        let device = start_mock_device(vec![(200, r#"{"status":"ok"}"#)]).await;
        let config = StepperConfig {
            speed: 12,
            ..Default::default()
        };

        SettingsService::save_stepper_config(&device.client(), config.clone())
            .await
            .unwrap();

        let requests = device.requests();
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].path, "/api/stepper/config");
        assert_eq!(
            requests[0].header("content-type"),
            Some("application/json")
        );
        let sent: StepperConfig = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(sent, config);
    }

    #[tokio::test]
    async fn move_posts_degrees() {
        let device = start_mock_device(vec![(200, r#"{"status":"ok","message":"Moving"}"#)]).await;

        let reply = SettingsService::move_degrees(&device.client(), -90)
            .await
            .unwrap();

        assert_eq!(reply.message.as_deref(), Some("Moving"));
        let body: serde_json::Value = serde_json::from_slice(&device.requests()[0].body).unwrap();
        assert_eq!(body, serde_json::json!({ "degrees": -90 }));
    }

    #[tokio::test]
    async fn device_error_on_stop_is_returned() {
        let device = start_mock_device(vec![(500, r#"{"error":"Motor fault"}"#)]).await;

        let err = SettingsService::stop(&device.client()).await.unwrap_err();

        assert_eq!(err.to_string(), "Motor fault");
        assert_eq!(device.requests()[0].path, "/api/stepper/stop");
    }

    #[tokio::test]
    async fn wifi_connect_posts_credentials() {
        let device = start_mock_device(vec![(200, r#"{"status":"ok"}"#)]).await;

        let reply = device
            .client()
            .wifi_connect(WifiCredentials {
                ssid: "Home \"2G\"".to_string(),
                password: "secret".to_string(),
            })
            .await
            .unwrap();

        assert!(reply.is_ok());
        let body: serde_json::Value = serde_json::from_slice(&device.requests()[0].body).unwrap();
        assert_eq!(
            body,
            serde_json::json!({ "ssid": "Home \"2G\"", "password": "secret" })
        );
    }
}
