use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use dialoguer::theme::ColorfulTheme;
use dispenser_console::{
    common::format_bytes,
    config::AppConfig,
    device_client::{ApiReply, DeviceStatus, HttpDeviceClient},
    services::{
        Confirm,
        firmware::{FirmwareImage, FirmwareUploader, UploadState},
        network::{ConnectOutcome, NetworkService},
        scan::{ScanPoller, ScanPolicy, ScanState},
        settings::SettingsService,
        status::StatusService,
    },
    timer::TokioDelay,
};
use env_logger::{Builder, Env, Target};
use log::{error, info};
use std::{io::Write, path::PathBuf, time::Duration};

/// Command line client for the dispenser controller.
///
/// The device is addressed through DEVICE_URL (default http://192.168.4.1)
/// with the Basic credentials in DEVICE_USER and DEVICE_PASSWORD.
#[derive(Parser, Debug)]
#[command(name = "dispenser-console", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Scan for WiFi networks in range of the device.
    Scan,
    /// Upload a firmware image (.bin); the device reboots afterwards.
    Upload {
        file: PathBuf,
        /// Skip the confirmation prompt.
        #[arg(long, short)]
        yes: bool,
    },
    /// Show device status.
    Status {
        /// Keep polling every N seconds.
        #[arg(long, value_name = "SECS")]
        watch: Option<u64>,
        /// Stop watching after N rounds.
        #[arg(long, requires = "watch")]
        rounds: Option<u32>,
    },
    /// WiFi station status and connection.
    Wifi {
        #[command(subcommand)]
        cmd: WifiCmd,
    },
    /// NTP clock configuration.
    Ntp {
        #[command(subcommand)]
        cmd: NtpCmd,
    },
    /// Stepper motor configuration and control.
    Stepper {
        #[command(subcommand)]
        cmd: StepperCmd,
    },
}

#[derive(Subcommand, Debug)]
enum WifiCmd {
    /// Show the current link.
    Status,
    /// Connect the device to a network; the device reboots afterwards.
    Connect {
        ssid: String,
        #[arg(long, default_value = "")]
        password: String,
        /// Skip the confirmation prompt.
        #[arg(long, short)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum NtpCmd {
    /// Show the stored configuration.
    Show,
    /// Show the device clock.
    Time,
    /// Change the configuration; omitted values are kept.
    Set {
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        server: Option<String>,
        /// Offset from UTC in seconds.
        #[arg(long, allow_negative_numbers = true)]
        offset: Option<i64>,
        /// Sync interval in milliseconds (at least 60000).
        #[arg(long)]
        interval: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum StepperCmd {
    /// Show the stored configuration.
    Config,
    /// Show motor state and position.
    Status,
    /// Change the configuration; omitted values are kept.
    Set {
        #[arg(long)]
        enabled: Option<bool>,
        /// Speed in RPM (1-15).
        #[arg(long)]
        speed: Option<i32>,
        /// Steps per revolution (200-8000).
        #[arg(long)]
        steps_per_rev: Option<i32>,
        /// The four coil GPIO pins.
        #[arg(long, num_args = 4, value_names = ["PIN1", "PIN2", "PIN3", "PIN4"])]
        pins: Option<Vec<i32>>,
    },
    /// Rotate by the given angle.
    Move {
        #[arg(allow_negative_numbers = true)]
        degrees: i32,
    },
    /// Rotate by the given number of steps.
    Step {
        #[arg(allow_negative_numbers = true)]
        steps: i32,
    },
    /// Stop the motor.
    Stop,
    /// Set the current position to zero.
    Reset,
}

/// Terminal confirmation
struct Prompt {
    assume_yes: bool,
}

impl Confirm for Prompt {
    fn confirm(&self, prompt: &str) -> bool {
        if self.assume_yes {
            return true;
        }

        dialoguer::Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .default(false)
            .interact()
            .unwrap_or_else(|e| {
                error!("failed to read confirmation: {e}");
                false
            })
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    initialize();

    let config = AppConfig::get();
    let client = HttpDeviceClient::new(&config.device, &config.upload)
        .context("failed to create device client")?;
    info!("device: {}", client.base_url());

    match cli.cmd {
        Cmd::Scan => scan(client, ScanPolicy::from(&config.scan)).await,
        Cmd::Upload { file, yes } => upload(client, file, yes).await,
        Cmd::Status { watch, rounds } => status(&client, watch, rounds).await,
        Cmd::Wifi { cmd } => wifi(&client, cmd).await,
        Cmd::Ntp { cmd } => ntp(&client, cmd).await,
        Cmd::Stepper { cmd } => stepper(&client, cmd).await,
    }
}

fn initialize() {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("module version: {}", env!("CARGO_PKG_VERSION"));
}

async fn scan(client: HttpDeviceClient, policy: ScanPolicy) -> Result<()> {
    let poller = ScanPoller::new(client, TokioDelay, policy).on_state_change(|state| {
        if let ScanState::InProgress {
            attempt,
            max_attempts,
        } = state
        {
            info!("scanning ({attempt}/{max_attempts})");
        }
    });

    match poller.scan().await {
        ScanState::Succeeded { results } if results.is_empty() => {
            println!("no networks found");
        }
        ScanState::Succeeded { results } => {
            for network in results {
                println!(
                    "{:<32} {:>4} dBm  ch {:>2}  {:<9}  {}",
                    network.ssid,
                    network.rssi,
                    network.channel,
                    network.signal_quality().to_string(),
                    if network.is_open() { "open" } else { "secured" }
                );
            }
        }
        ScanState::Failed { message, .. } => bail!("wifi scan failed: {message}"),
        state => bail!("wifi scan stopped in state {state:?}"),
    }

    Ok(())
}

async fn upload(client: HttpDeviceClient, file: PathBuf, yes: bool) -> Result<()> {
    let image = FirmwareImage::from_path(&file)?;

    let uploader =
        FirmwareUploader::new(client, Prompt { assume_yes: yes }).on_state_change(|state| {
            if let UploadState::Uploading { .. } = state {
                print!("\r{}", state.status_line());
                let _ = std::io::stdout().flush();
            }
        });

    match uploader.upload(image.bytes, &image.file_name).await {
        UploadState::Idle => println!("update cancelled"),
        UploadState::Succeeded => println!("\n{}", UploadState::Succeeded.status_line()),
        UploadState::Failed { message, .. } => {
            println!();
            bail!("{message}")
        }
        state => bail!("upload stopped in state {state:?}"),
    }

    Ok(())
}

async fn status(client: &HttpDeviceClient, watch: Option<u64>, rounds: Option<u32>) -> Result<()> {
    match watch {
        Some(secs) => {
            StatusService::watch(
                client,
                &TokioDelay,
                Duration::from_secs(secs),
                rounds,
                print_status,
            )
            .await;
        }
        None => print_status(&StatusService::snapshot(client).await?),
    }

    Ok(())
}

fn print_status(status: &DeviceStatus) {
    let heap = &status.memory.heap;
    let storage = &status.spiffs;

    println!(
        "status:  {}",
        if status.is_healthy() { "healthy" } else { status.status.as_str() }
    );
    println!("uptime:  {}", status.uptime.formatted);
    println!(
        "cpu:     {} @ {} MHz",
        status.cpu.chip_model, status.cpu.frequency_mhz
    );
    println!(
        "heap:    {} / {} ({:.1}%)",
        format_bytes(heap.used),
        format_bytes(heap.total),
        heap.usage_percent
    );
    println!(
        "storage: {} / {} ({:.1}%)",
        format_bytes(storage.used_bytes),
        format_bytes(storage.total_bytes),
        storage.usage_percent
    );
    if status.wifi.connected {
        println!(
            "wifi:    {} ({} dBm, {}) {}",
            status.wifi.ssid, status.wifi.rssi, status.wifi.signal_strength, status.wifi.ip
        );
    } else {
        println!("wifi:    disconnected");
    }
}

fn print_reply(reply: ApiReply) {
    println!("{}", reply.message.unwrap_or_else(|| "ok".to_string()));
}

async fn wifi(client: &HttpDeviceClient, cmd: WifiCmd) -> Result<()> {
    match cmd {
        WifiCmd::Status => {
            let status = NetworkService::status(client).await?;
            if status.connected {
                println!("connected to {} ({} dBm)", status.ssid, status.rssi);
                println!("ip {} gateway {} subnet {}", status.ip, status.gateway, status.subnet);
                println!("mac {}", status.mac);
            } else {
                println!("not connected");
            }
        }
        WifiCmd::Connect { ssid, password, yes } => {
            let prompt = Prompt { assume_yes: yes };
            match NetworkService::connect(client, &prompt, &ssid, &password).await? {
                ConnectOutcome::Rebooting { message } => println!("{message}"),
                ConnectOutcome::Cancelled => println!("connect cancelled"),
            }
        }
    }

    Ok(())
}

async fn ntp(client: &HttpDeviceClient, cmd: NtpCmd) -> Result<()> {
    match cmd {
        NtpCmd::Show => {
            let config = SettingsService::ntp_config(client).await?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        NtpCmd::Time => {
            let time = SettingsService::ntp_time(client).await?;
            println!(
                "{} ({})",
                time.time,
                if time.synced { "synced" } else { "not synced" }
            );
        }
        NtpCmd::Set {
            enabled,
            server,
            offset,
            interval,
        } => {
            let mut config = SettingsService::ntp_config(client).await?;
            if let Some(enabled) = enabled {
                config.enabled = enabled;
            }
            if let Some(server) = server {
                config.server = server;
            }
            if let Some(offset) = offset {
                config.offset = offset;
            }
            if let Some(interval) = interval {
                config.interval = interval;
            }
            print_reply(SettingsService::save_ntp_config(client, config).await?);
        }
    }

    Ok(())
}

async fn stepper(client: &HttpDeviceClient, cmd: StepperCmd) -> Result<()> {
    match cmd {
        StepperCmd::Config => {
            let config = SettingsService::stepper_config(client).await?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        StepperCmd::Status => {
            let status = SettingsService::stepper_status(client).await?;
            println!(
                "{}, {}, position {}",
                if status.enabled { "enabled" } else { "disabled" },
                if status.moving { "moving" } else { "stopped" },
                status.position
            );
        }
        StepperCmd::Set {
            enabled,
            speed,
            steps_per_rev,
            pins,
        } => {
            let mut config = SettingsService::stepper_config(client).await?;
            if let Some(enabled) = enabled {
                config.enabled = enabled;
            }
            if let Some(speed) = speed {
                config.speed = speed;
            }
            if let Some(steps_per_rev) = steps_per_rev {
                config.steps_per_rev = steps_per_rev;
            }
            if let Some([pin1, pin2, pin3, pin4]) = pins.as_deref() {
                config.pin1 = *pin1;
                config.pin2 = *pin2;
                config.pin3 = *pin3;
                config.pin4 = *pin4;
            }
            print_reply(SettingsService::save_stepper_config(client, config).await?);
        }
        StepperCmd::Move { degrees } => {
            print_reply(SettingsService::move_degrees(client, degrees).await?)
        }
        StepperCmd::Step { steps } => print_reply(SettingsService::move_steps(client, steps).await?),
        StepperCmd::Stop => print_reply(SettingsService::stop(client).await?),
        StepperCmd::Reset => print_reply(SettingsService::reset_position(client).await?),
    }

    Ok(())
}
