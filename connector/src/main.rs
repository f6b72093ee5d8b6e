//! `connector-cli` — exercises the connector library end to end for manual
//! operator testing: a thin clap front end over `Connector`'s six
//! operations, with no gRPC surface of its own.

use std::collections::HashMap;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use connector::exec::ShellExecutor;
use connector::model::{ConnectionDescriptor, MultiPathType, VolumeIdentifier, VolumeMode};
use connector::rootfs::RootFs;
use connector::vendor::UpadminAdapter;
use connector::{Connector, ConnectorConfig};

#[derive(Parser, Debug)]
#[command(name = "connector-cli")]
#[command(about = "Node-side volume-attachment engine for external block/file arrays")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Lock directory override
    #[arg(long)]
    lock_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach a volume described by a flat key=value connection descriptor.
    Attach {
        /// Repeated key=value pairs, e.g. tgtLunWWN=6abc... tgtWWNs=2100aa
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
    /// Detach a previously attached volume by identifier.
    Detach {
        #[arg(long)]
        id: String,
    },
    /// Resize an attached volume to the requested byte count.
    Resize {
        #[arg(long)]
        id: String,
        #[arg(long)]
        bytes: u64,
        /// If given, also grow the filesystem mounted at this path.
        #[arg(long)]
        mount_path: Option<String>,
    },
    /// Sweep residual device-mapper/by-id entries for an identifier.
    ClearResidual {
        #[arg(long)]
        id: String,
        #[arg(long, default_value = "filesystem")]
        volume_mode: String,
        #[arg(long, default_value = "dm")]
        multipath_type: String,
    },
}

fn parse_field(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = ConnectorConfig::default();
    if let Some(dir) = args.lock_dir {
        config.lock_dir = dir;
    }

    let exec = Arc::new(ShellExecutor);
    let vendor = Arc::new(UpadminAdapter::with_sysfs(
        exec.clone(),
        Arc::new(connector::sysfs::SysfsProbe::default()),
        false,
        config.exec_command_timeout(),
    ));
    let connector = Connector::new(config, exec, vendor, RootFs::real()).await?;

    match args.command {
        Command::Attach { fields } => {
            let map: HashMap<String, String> = fields.into_iter().collect();
            let descriptor = ConnectionDescriptor::from_map(&map)?;
            match connector.attach(&descriptor).await {
                Ok(device) => {
                    info!(device = %device.path(), "attach succeeded");
                    println!("{}", device.path());
                }
                Err(e) => {
                    error!(error = %e, "attach failed");
                    return Err(e.into());
                }
            }
        }
        Command::Detach { id } => {
            connector.detach(&VolumeIdentifier::new(id)).await?;
            info!("detach succeeded");
        }
        Command::Resize { id, bytes, mount_path } => {
            connector
                .resize(&VolumeIdentifier::new(id), bytes, mount_path.as_deref())
                .await?;
            info!("resize succeeded");
        }
        Command::ClearResidual {
            id,
            volume_mode,
            multipath_type,
        } => {
            let mode = match volume_mode.as_str() {
                "block" => VolumeMode::Block,
                _ => VolumeMode::Filesystem,
            };
            let mp_type: MultiPathType = multipath_type.parse()?;
            connector.clear_residual(&VolumeIdentifier::new(id), mode, mp_type).await?;
            info!("residual sweep complete");
        }
    }

    Ok(())
}
