use anyhow::{Context, Result};
use std::{env, str::FromStr, sync::OnceLock, time::Duration};

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Device connection configuration
    pub device: DeviceConfig,

    /// WiFi scan retry policy
    pub scan: ScanConfig,

    /// Firmware upload configuration
    pub upload: UploadConfig,
}

#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub request_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct ScanConfig {
    pub max_attempts: u32,
    pub pending_delay: Duration,
    pub error_delay: Duration,
}

#[derive(Clone, Debug)]
pub struct UploadConfig {
    pub timeout: Duration,
    pub chunk_size: usize,
}

impl AppConfig {
    /// Get or load the application configuration
    ///
    /// Returns a reference to the cached configuration. On first call, it loads
    /// and validates all configuration from environment variables. Subsequent
    /// calls return the cached instance.
    ///
    /// # Panics
    /// Panics if configuration loading fails. Use [`AppConfig::load`] to handle
    /// the error instead.
    pub fn get() -> &'static Self {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        APP_CONFIG.get_or_init(|| Self::load().expect("failed to load application configuration"))
    }

    /// Load all configuration from environment variables
    pub fn load() -> Result<Self> {
        let device = DeviceConfig::load()?;
        let scan = ScanConfig::load()?;
        let upload = UploadConfig::load()?;

        Ok(Self {
            device,
            scan,
            upload,
        })
    }
}

impl DeviceConfig {
    fn load() -> Result<Self> {
        let base_url = env::var("DEVICE_URL").unwrap_or_else(|_| "http://192.168.4.1".to_string());
        anyhow::ensure!(
            base_url.starts_with("http://") || base_url.starts_with("https://"),
            "failed to parse DEVICE_URL: expected http:// or https:// scheme, got {base_url}"
        );

        let username = env::var("DEVICE_USER").unwrap_or_else(|_| "admin".to_string());
        let password = env::var("DEVICE_PASSWORD").unwrap_or_else(|_| "admin".to_string());
        let request_timeout = Duration::from_secs(parse_var("REQUEST_TIMEOUT_SECS", 10)?);

        Ok(Self {
            base_url,
            username,
            password,
            request_timeout,
        })
    }
}

impl ScanConfig {
    fn load() -> Result<Self> {
        let max_attempts = parse_var("SCAN_MAX_ATTEMPTS", 5)?;
        anyhow::ensure!(max_attempts > 0, "SCAN_MAX_ATTEMPTS must be at least 1");

        Ok(Self {
            max_attempts,
            pending_delay: Duration::from_millis(parse_var("SCAN_PENDING_DELAY_MS", 2000)?),
            error_delay: Duration::from_millis(parse_var("SCAN_ERROR_DELAY_MS", 1000)?),
        })
    }
}

impl UploadConfig {
    fn load() -> Result<Self> {
        let chunk_size = parse_var("UPLOAD_CHUNK_SIZE", 4096)?;
        anyhow::ensure!(chunk_size > 0, "UPLOAD_CHUNK_SIZE must be at least 1");

        Ok(Self {
            timeout: Duration::from_secs(parse_var("UPLOAD_TIMEOUT_SECS", 300)?),
            chunk_size,
        })
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("failed to parse {name}: invalid format")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_var_falls_back_to_default_when_unset() {
        let value: u64 = parse_var("DISPENSER_TEST_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn defaults_match_device_panel() {
        let config = AppConfig::load().expect("defaults should load");

        assert_eq!(config.scan.max_attempts, 5);
        assert_eq!(config.scan.pending_delay, Duration::from_millis(2000));
        assert_eq!(config.scan.error_delay, Duration::from_millis(1000));
        assert_eq!(config.upload.chunk_size, 4096);
        assert!(config.device.base_url.starts_with("http"));
    }
}
