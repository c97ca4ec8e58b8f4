use crate::{
    config::DeviceConfig,
    error::{DeviceError, Result},
};
use anyhow::Context;
use reqwest::{Client, Response};
use serde::Deserialize;

/// Create the HTTP client used for all device requests
///
/// The request timeout from the configuration applies to every request unless
/// a request overrides it (firmware uploads do).
///
/// # Examples
/// ```no_run
/// use dispenser_console::{config::AppConfig, http_client::device_http_client};
///
/// let client = device_http_client(&AppConfig::get().device)
///     .expect("failed to create client");
/// ```
pub fn device_http_client(config: &DeviceConfig) -> anyhow::Result<Client> {
    Client::builder()
        .timeout(config.request_timeout)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to create device HTTP client")
}

/// Join the device base URL and an API path
///
/// Both a trailing slash on the base and any number of leading slashes on the
/// path are normalized to a single separator.
pub fn build_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// Extract the `error` field of a JSON error body, or fall back to `fallback`
pub fn error_message(body: &str, fallback: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// Handle HTTP response by checking status and extracting body
///
/// # Arguments
/// * `res` - The HTTP response to handle
/// * `fallback` - Message used when an error response carries no `error` field
///
/// # Returns
/// * `Ok(String)` - The response body if the status is successful
/// * `Err(DeviceError::Server)` - If the status is not successful
/// * `Err(DeviceError::Transport)` - If reading the body fails
pub async fn handle_http_response(res: Response, fallback: &str) -> Result<String> {
    let status = res.status();
    let body = res.text().await?;

    if !status.is_success() {
        return Err(DeviceError::Server {
            status: status.as_u16(),
            message: error_message(&body, fallback),
        });
    }

    Ok(body)
}
