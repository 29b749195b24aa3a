//! usb-analyzer
//!
//! Command-line shell around the session core: lists the device
//! directory, fires vendor control transfers at a claimed device, and
//! tails its interrupt stream. All device state lives on the session
//! control thread; this binary only sends commands and renders events.

mod config;

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use config::AnalyzerConfig;
use session::{
    EndpointId, LibusbBackend, SessionBridge, SessionCommand, SessionEvent, SessionInfo,
    create_session_bridge, spawn_session_worker,
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "usb-analyzer")]
#[command(author, version, about = "Vendor-class USB device analyzer")]
#[command(long_about = "
Inspect and exercise vendor-class USB devices: enumerate what is
attached, claim a device, fire vendor control transfers at it, and tail
its interrupt endpoint.

EXAMPLES:
    # List attached devices
    usb-analyzer list

    # No-data vendor request 0x01 with wValue 0x00ff
    usb-analyzer send --device 1234:5678 01 --value 00ff

    # Write two bytes through vendor request 0x02
    usb-analyzer write --device 1234:5678 02 4142

    # Read up to 2024 bytes through vendor request 0x03
    usb-analyzer read --device 1234:5678 03

    # Stream interrupt data from endpoint 0x83 until Ctrl+C
    usb-analyzer watch --device 1234:5678

CONFIGURATION:
    ~/.config/usb-analyzer/config.toml (see `usb-analyzer save-config`),
    overridable with --config.
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the devices currently visible to the analyzer
    List,

    /// Send a no-data vendor control transfer
    Send {
        /// Device as a VID:PID hex pair, e.g. 1234:5678
        #[arg(short, long, value_name = "VID:PID")]
        device: Option<String>,
        /// Vendor request code, hex
        request: String,
        /// Setup packet wValue, hex
        #[arg(short, long, default_value = "0")]
        value: String,
    },

    /// Send a vendor control transfer with an out data stage
    Write {
        #[arg(short, long, value_name = "VID:PID")]
        device: Option<String>,
        /// Vendor request code, hex
        request: String,
        /// Payload as hex bytes, e.g. 4142
        payload: String,
    },

    /// Send a vendor control transfer with an in data stage
    Read {
        #[arg(short, long, value_name = "VID:PID")]
        device: Option<String>,
        /// Vendor request code, hex
        request: String,
        /// Maximum bytes to read
        #[arg(long)]
        capacity: Option<usize>,
    },

    /// Connect and print interrupt stream data until Ctrl+C
    Watch {
        #[arg(short, long, value_name = "VID:PID")]
        device: Option<String>,
        /// Interrupt in endpoint address, hex
        #[arg(long)]
        endpoint: Option<String>,
        /// Per-read buffer size
        #[arg(long)]
        buffer_size: Option<usize>,
    },

    /// Write the default configuration to the default location and exit
    SaveConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if matches!(args.command, Command::SaveConfig) {
        let config = AnalyzerConfig::default();
        let path = AnalyzerConfig::default_path();
        config.save(&path).context("failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        AnalyzerConfig::load(Some(path.clone())).context("failed to load configuration")?
    } else {
        AnalyzerConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    setup_logging(log_level)?;

    info!("usb-analyzer v{}", env!("CARGO_PKG_VERSION"));

    let shell = Shell::start(&config)?;

    let result = match args.command {
        Command::List => cmd_list(&shell).await,
        Command::Send {
            device,
            request,
            value,
        } => cmd_send(&shell, &config, device.as_deref(), &request, &value).await,
        Command::Write {
            device,
            request,
            payload,
        } => cmd_write(&shell, &config, device.as_deref(), &request, &payload).await,
        Command::Read {
            device,
            request,
            capacity,
        } => cmd_read(&shell, &config, device.as_deref(), &request, capacity).await,
        Command::Watch {
            device,
            endpoint,
            buffer_size,
        } => {
            cmd_watch(
                &shell,
                &config,
                device.as_deref(),
                endpoint.as_deref(),
                buffer_size,
            )
            .await
        }
        Command::SaveConfig => unreachable!(),
    };

    if let Err(e) = shell.shutdown().await {
        warn!("shutdown: {e:#}");
    }

    result
}

fn setup_logging(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .with_context(|| format!("invalid log filter '{default_level}'"))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    Ok(())
}

/// The running analyzer: an async handle to the session control thread.
struct Shell {
    bridge: SessionBridge,
    worker: std::thread::JoinHandle<session::Result<()>>,
}

impl Shell {
    fn start(config: &AnalyzerConfig) -> Result<Self> {
        let backend = LibusbBackend::new()
            .map_err(|e| anyhow!("failed to initialize the USB platform: {e}"))?;
        let (bridge, worker_half) = create_session_bridge();
        let worker = spawn_session_worker(backend, worker_half, config.transfer_timeout());
        Ok(Self { bridge, worker })
    }

    async fn refresh(&self) -> Result<session::DeviceDirectory> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.bridge
            .send_command(SessionCommand::RefreshDirectory { response: tx })
            .await?;
        rx.await
            .context("control thread dropped the request")?
            .map_err(|e| anyhow!("device enumeration failed: {e}"))
    }

    /// Open the device. Any session already open is torn down first;
    /// the core itself refuses to connect while open.
    async fn connect(&self, vendor_id: u16, product_id: u16) -> Result<SessionInfo> {
        self.disconnect().await?;

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.bridge
            .send_command(SessionCommand::Connect {
                vendor_id,
                product_id,
                response: tx,
            })
            .await?;
        let info = rx
            .await
            .context("control thread dropped the request")?
            .map_err(|e| anyhow!("connect {vendor_id:04x}:{product_id:04x} failed: {e}"))?;

        info!(key = %info.key, "session open");
        Ok(info)
    }

    async fn disconnect(&self) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.bridge
            .send_command(SessionCommand::Disconnect { response: tx })
            .await?;
        rx.await.context("control thread dropped the request")?;
        Ok(())
    }

    async fn shutdown(self) -> Result<()> {
        self.bridge.send_command(SessionCommand::Shutdown).await?;
        match self.worker.join() {
            Ok(result) => result.map_err(|e| anyhow!("control thread error: {e}")),
            Err(_) => bail!("control thread panicked"),
        }
    }
}

async fn cmd_list(shell: &Shell) -> Result<()> {
    let directory = shell.refresh().await?;

    if directory.is_empty() {
        println!("No devices found.");
        return Ok(());
    }

    println!(
        "{:<3} {:<29} {:<28} {:<20} {:<7} {}",
        "#", "ID", "NAME", "MANUFACTURER", "DRIVER", "KEY"
    );
    for (index, entry) in directory.entries().iter().enumerate() {
        println!(
            "{index:<3} {:<29} {:<28} {:<20} {:<7} {}",
            entry.id_label(),
            entry.name,
            entry.manufacturer.as_deref().unwrap_or("-"),
            entry.driver_class,
            entry.key
        );
    }
    Ok(())
}

async fn cmd_send(
    shell: &Shell,
    config: &AnalyzerConfig,
    device: Option<&str>,
    request: &str,
    value: &str,
) -> Result<()> {
    let (vendor_id, product_id) = resolve_device(device, config)?;
    let request = parse_hex_u8(request)?;
    let value = parse_hex_u16(value)?;

    shell.connect(vendor_id, product_id).await?;

    let (tx, rx) = tokio::sync::oneshot::channel();
    shell
        .bridge
        .send_command(SessionCommand::SendNoData {
            request,
            value,
            response: tx,
        })
        .await?;
    let outcome = rx.await.context("control thread dropped the request")?;

    match outcome {
        Ok(true) => println!("Request {request:#04x} accepted."),
        Ok(false) => println!("Request {request:#04x} stalled by the device."),
        Err(e) => warn!("transfer failed: {e}"),
    }

    shell.disconnect().await
}

async fn cmd_write(
    shell: &Shell,
    config: &AnalyzerConfig,
    device: Option<&str>,
    request: &str,
    payload: &str,
) -> Result<()> {
    let (vendor_id, product_id) = resolve_device(device, config)?;
    let request = parse_hex_u8(request)?;
    let payload = Bytes::from(parse_hex_payload(payload)?);
    let len = payload.len();

    shell.connect(vendor_id, product_id).await?;

    let (tx, rx) = tokio::sync::oneshot::channel();
    shell
        .bridge
        .send_command(SessionCommand::SendWrite {
            request,
            payload,
            response: tx,
        })
        .await?;
    let outcome = rx.await.context("control thread dropped the request")?;

    match outcome {
        Ok(true) => println!("Wrote {len} bytes through request {request:#04x}."),
        Ok(false) => println!("Request {request:#04x} stalled by the device."),
        Err(e) => warn!("transfer failed: {e}"),
    }

    shell.disconnect().await
}

async fn cmd_read(
    shell: &Shell,
    config: &AnalyzerConfig,
    device: Option<&str>,
    request: &str,
    capacity: Option<usize>,
) -> Result<()> {
    let (vendor_id, product_id) = resolve_device(device, config)?;
    let request = parse_hex_u8(request)?;
    let capacity = capacity.unwrap_or(config.stream.read_capacity);

    shell.connect(vendor_id, product_id).await?;

    let (tx, rx) = tokio::sync::oneshot::channel();
    shell
        .bridge
        .send_command(SessionCommand::SendRead {
            request,
            capacity,
            response: tx,
        })
        .await?;
    let outcome = rx.await.context("control thread dropped the request")?;

    match outcome {
        Ok(data) => {
            println!("Read {} bytes:", data.len());
            print!("{}", hex_dump(&data));
        }
        Err(e) => warn!("transfer failed: {e}"),
    }

    shell.disconnect().await
}

async fn cmd_watch(
    shell: &Shell,
    config: &AnalyzerConfig,
    device: Option<&str>,
    endpoint: Option<&str>,
    buffer_size: Option<usize>,
) -> Result<()> {
    let (vendor_id, product_id) = resolve_device(device, config)?;
    let endpoint = match endpoint {
        Some(s) => EndpointId(parse_hex_u8(s)?),
        None => EndpointId(config.stream.endpoint),
    };
    let buffer_size = buffer_size.unwrap_or(config.stream.buffer_size);

    let info = shell.connect(vendor_id, product_id).await?;

    let (tx, rx) = tokio::sync::oneshot::channel();
    shell
        .bridge
        .send_command(SessionCommand::StartStream {
            endpoint,
            buffer_size,
            response: tx,
        })
        .await?;
    rx.await
        .context("control thread dropped the request")?
        .map_err(|e| anyhow!("failed to start stream on {endpoint}: {e}"))?;

    println!("Streaming {endpoint}, press Ctrl+C to stop.");

    let mut removed = false;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            event = shell.bridge.recv_event() => match event? {
                SessionEvent::StreamData { endpoint, data } => {
                    println!("{endpoint} {:>4} bytes", data.len());
                    print!("{}", hex_dump(&data));
                }
                SessionEvent::DeviceRemoved(key) if key == info.key => {
                    warn!(%key, "device removed, stopping");
                    removed = true;
                    break;
                }
                SessionEvent::DeviceRemoved(key) => {
                    info!(%key, "another device removed");
                }
                SessionEvent::DirectoryChanged(directory) => {
                    info!("directory changed: {} devices", directory.len());
                }
                SessionEvent::PlatformError(message) => {
                    warn!("platform error: {message}");
                }
            }
        }
    }

    // Removal already tore the session down on the control thread.
    if !removed {
        let (tx, rx) = tokio::sync::oneshot::channel();
        shell
            .bridge
            .send_command(SessionCommand::StopStream { response: tx })
            .await?;
        if let Err(e) = rx.await.context("control thread dropped the request")? {
            warn!("stop stream: {e}");
        }
        shell.disconnect().await?;
    }

    Ok(())
}

/// Pick the device id pair: command line first, then the configured
/// default.
fn resolve_device(arg: Option<&str>, config: &AnalyzerConfig) -> Result<(u16, u16)> {
    match arg.or(config.session.default_device.as_deref()) {
        Some(s) => parse_device_ids(s),
        None => bail!(
            "no device given; pass --device VID:PID or set session.default_device in the config"
        ),
    }
}

/// Parse the `VID:PID` hex pair the original device picker used.
fn parse_device_ids(s: &str) -> Result<(u16, u16)> {
    let (vid, pid) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("expected a VID:PID hex pair, e.g. 1234:5678"))?;
    Ok((parse_hex_u16(vid)?, parse_hex_u16(pid)?))
}

fn parse_hex_u16(s: &str) -> Result<u16> {
    let digits = s.trim().trim_start_matches("0x");
    u16::from_str_radix(digits, 16).with_context(|| format!("invalid hex value '{s}'"))
}

fn parse_hex_u8(s: &str) -> Result<u8> {
    let digits = s.trim().trim_start_matches("0x");
    u8::from_str_radix(digits, 16).with_context(|| format!("invalid hex value '{s}'"))
}

fn parse_hex_payload(s: &str) -> Result<Vec<u8>> {
    let digits: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        bail!("payload hex must have an even number of digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex byte '{}'", &digits[i..i + 2]))
        })
        .collect()
}

/// Render bytes as a classic offset / hex / ascii dump.
fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in data.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| {
                if (0x20..0x7f).contains(&b) {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();
        out.push_str(&format!("{:08x}  {:<47}  {}\n", row * 16, hex.join(" "), ascii));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_device_ids_accepts_the_hex_pair() {
        assert_eq!(parse_device_ids("1234:5678").unwrap(), (0x1234, 0x5678));
        assert_eq!(parse_device_ids("0x04f9:0x0042").unwrap(), (0x04f9, 0x0042));
        assert!(parse_device_ids("12345678").is_err());
        assert!(parse_device_ids("zzzz:0042").is_err());
    }

    #[test]
    fn parse_hex_payload_round_trips_bytes() {
        assert_eq!(parse_hex_payload("4142").unwrap(), b"AB");
        assert_eq!(parse_hex_payload("41 42").unwrap(), b"AB");
        assert!(parse_hex_payload("414").is_err());
        assert!(parse_hex_payload("4g").is_err());
    }

    #[test]
    fn resolve_device_falls_back_to_config() {
        let mut config = AnalyzerConfig::default();
        assert!(resolve_device(None, &config).is_err());

        config.session.default_device = Some("1234:5678".to_string());
        assert_eq!(resolve_device(None, &config).unwrap(), (0x1234, 0x5678));
        assert_eq!(
            resolve_device(Some("04f9:0042"), &config).unwrap(),
            (0x04f9, 0x0042)
        );
    }

    #[test]
    fn hex_dump_lines_up_short_rows() {
        let dump = hex_dump(b"AB");
        assert!(dump.starts_with("00000000  41 42"));
        assert!(dump.trim_end().ends_with("AB"));
    }
}
