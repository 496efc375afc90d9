//! adblink -- talk to Android devices over the ADB wire protocol.
//!
//! Usage:
//!   adblink key show                        # Show the key this host presents
//!   adblink pair 192.168.1.20:37123 482913  # Trust this host's key
//!   adblink connect 192.168.1.20:5555 -s "shell:getprop ro.product.model"
//!   adblink usb --serial R58M123ABC -s "shell:uptime"
//!   adblink devices                         # List USB devices with ADB enabled

use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use adblink_client::{
    expand_tilde, parse_host_port, AdbConfig, AdbStream, ConnectionManager, UsbChannel,
};
use adblink_crypto::{FileKeyProvider, KeyPairProvider};
use adblink_protocol::Service;

#[derive(Parser)]
#[command(name = "adblink", about = "ADB client over TCP, TLS and USB")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.adblink/config.toml")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or rotate the host key pair
    Key {
        #[command(subcommand)]
        action: Option<KeyAction>,
    },
    /// Pair with a device using the code shown in wireless debugging
    Pair {
        /// Pairing address, host:port
        addr: String,
        /// Six-digit pairing code
        code: String,
    },
    /// Connect over TCP and open a service
    Connect {
        /// Device address, host[:port]
        addr: String,
        /// Service destination to open
        #[arg(short, long, default_value = "shell:")]
        service: String,
    },
    /// Connect over USB and open a service
    Usb {
        /// Serial of the device to use; first ADB device otherwise
        #[arg(long)]
        serial: Option<String>,
        /// Service destination to open
        #[arg(short, long, default_value = "shell:")]
        service: String,
    },
    /// List USB devices exposing an ADB interface
    Devices,
}

#[derive(Subcommand)]
enum KeyAction {
    /// Show key name, fingerprint and Android public key
    Show,
    /// Replace the key pair; devices must pair again
    Rotate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config_path = expand_tilde(&cli.config);
    let cfg = AdbConfig::load_or_default(&config_path)?;
    let keys: Arc<dyn KeyPairProvider> =
        Arc::new(FileKeyProvider::new(&expand_tilde(&cfg.keys.dir)));

    match cli.command {
        Commands::Key { action } => match action {
            Some(KeyAction::Show) | None => show_key(keys.as_ref())?,
            Some(KeyAction::Rotate) => {
                keys.rotate()?;
                show_key(keys.as_ref())?;
            }
        },
        Commands::Pair { addr, code } => {
            let (host, port) = parse_host_port(&addr)
                .ok_or_else(|| anyhow::anyhow!("invalid address: {addr}"))?;
            let manager = manager(&cfg, keys);
            let peer = manager.pair(&host, port, &code).await?;
            match peer.device_serial() {
                Some(serial) => println!("Paired with {serial}"),
                None => println!("Paired ({})", peer.text()),
            }
        }
        Commands::Connect { addr, service } => {
            let (host, port) = parse_host_port(&addr)
                .ok_or_else(|| anyhow::anyhow!("invalid address: {addr}"))?;
            let manager = manager(&cfg, keys);
            let conn = manager.connect_tcp(&host, port).await?;
            let banner = conn.banner().await?;
            tracing::info!(
                system_type = %banner.system_type,
                model = banner
                    .properties
                    .get("ro.product.model")
                    .map(String::as_str)
                    .unwrap_or("unknown"),
                "connected"
            );
            let stream = manager.open(&Service::from(service.as_str()).destination()).await?;
            pipe_to_stdout(&stream).await?;
            manager.disconnect().await;
        }
        Commands::Usb { serial, service } => {
            let manager = manager(&cfg, keys);
            manager.connect_usb(serial.as_deref()).await?;
            let stream = manager.open(&Service::from(service.as_str()).destination()).await?;
            pipe_to_stdout(&stream).await?;
            manager.disconnect().await;
        }
        Commands::Devices => {
            let devices = UsbChannel::list()?;
            if devices.is_empty() {
                eprintln!("No USB devices with ADB enabled");
            }
            for d in devices {
                println!(
                    "{}\t{:04x}:{:04x}\t{}",
                    d.serial.as_deref().unwrap_or("(no serial)"),
                    d.vendor_id,
                    d.product_id,
                    d.product.as_deref().unwrap_or("")
                );
            }
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "adblink=info,adblink_client=info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn manager(cfg: &AdbConfig, keys: Arc<dyn KeyPairProvider>) -> ConnectionManager {
    ConnectionManager::new(
        keys,
        cfg.connection.options(),
        &cfg.pairing.device_name,
    )
}

fn show_key(keys: &dyn KeyPairProvider) -> anyhow::Result<()> {
    let key = keys.current()?;
    println!("Key name:    {}", key.key_name());
    println!("Fingerprint: {}", key.fingerprint()?);
    println!(
        "Public key:  {}",
        String::from_utf8_lossy(&key.android_public_key()?).trim_end_matches('\0')
    );
    Ok(())
}

/// Copy everything the device writes on `stream` to stdout until it closes.
async fn pipe_to_stdout(stream: &AdbStream) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stdout.write_all(&buf[..n]).await?;
        stdout.flush().await?;
    }
    stream.close().await?;
    Ok(())
}
