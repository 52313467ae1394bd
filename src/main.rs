//! mdraid - Software RAID arrays over image files
//!
//! Usage:
//!   mdraid examine <img>...                  - Show superblocks
//!   mdraid create --level 1 -n 2 <img>...    - Create an array and resync it
//!   mdraid assemble <img>...                 - Assemble, recover and report
//!   mdraid config                            - Print the effective configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use mdraid::{
    array::{ArrayGeometry, ArrayHandle, ArrayRegistry, ArrayState, DiskSpec, MemberState, StopMode},
    config::Config,
    device::{BlockDevice, DeviceId, DeviceTable, FileDevice},
    personality::Level,
    resync::{RecoveryFlags, ResyncPhase},
    superblock::{MetadataFormat, MAX_SECTOR},
};
use tracing::{error, info, warn, Level as LogLevel};
use tracing_subscriber::FmtSubscriber;

/// Major number used for image-backed devices
const IMAGE_MAJOR: u32 = 7;

#[derive(Parser)]
#[command(name = "mdraid")]
#[command(author = "mdraid Contributors")]
#[command(version = "0.3.0")]
#[command(about = "Software RAID arrays over image files")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/mdraid/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the superblock found on each image
    Examine {
        /// Member images
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Create a new array on the given images
    Create {
        /// RAID level
        #[arg(short, long, default_value = "1")]
        level: Level,

        /// Number of active members
        #[arg(short = 'n', long)]
        raid_devices: u32,

        /// Superblock format (0.90, 1.0, 1.1, 1.2)
        #[arg(short, long)]
        metadata: Option<MetadataFormat>,

        /// Chunk size in KiB, for levels that stripe
        #[arg(long)]
        chunk: Option<u32>,

        /// Array name recorded in v1 superblocks
        #[arg(long)]
        name: Option<String>,

        /// Skip the initial resync
        #[arg(long)]
        assume_clean: bool,

        /// Member images; extra ones become spares
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },

    /// Assemble an array from its members
    Assemble {
        /// Member images
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Hot-add an image as a spare after starting
        #[arg(long)]
        add: Vec<PathBuf>,

        /// Mark a member faulty after starting
        #[arg(long)]
        fail: Vec<PathBuf>,

        /// Start read-only; no resync or recovery runs
        #[arg(long)]
        readonly: bool,

        /// Print array details as JSON when done
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config,
}

fn main() {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        LogLevel::DEBUG
    } else {
        LogLevel::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {}", e);
    }

    let config_path = expand_tilde(&cli.config);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load_or_default(config_path)
        .with_context(|| format!("loading configuration from {:?}", config_path))?;

    match command {
        Commands::Examine { images, json } => cmd_examine(&images, json),

        Commands::Create {
            level,
            raid_devices,
            metadata,
            chunk,
            name,
            assume_clean,
            images,
        } => {
            let mut geometry = ArrayGeometry::new(level, raid_devices);
            geometry.format = metadata;
            geometry.clean = assume_clean;
            if let Some(name) = name {
                geometry.name = name;
            }
            if level.requires_chunk() {
                let kib = chunk.unwrap_or(config.metadata.chunk_kib);
                geometry.chunk_sectors = kib * 2;
            }
            block_on(cmd_create(&config, geometry, &images))
        }

        Commands::Assemble {
            images,
            add,
            fail,
            readonly,
            json,
        } => block_on(cmd_assemble(&config, &images, &add, &fail, readonly, json)),

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn block_on<F: std::future::Future<Output = anyhow::Result<()>>>(future: F) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("starting runtime")?;
    runtime.block_on(future)
}

/// Open images and register them; ids follow argument order
fn register_images(table: &Arc<DeviceTable>, images: &[PathBuf], first: u32) -> anyhow::Result<Vec<DeviceId>> {
    let mut ids = Vec::with_capacity(images.len());
    for (index, path) in images.iter().enumerate() {
        let id = DeviceId::new(IMAGE_MAJOR, first + index as u32);
        let device = FileDevice::open(path, id).with_context(|| format!("opening {:?}", path))?;
        table.register(Arc::new(device))?;
        ids.push(id);
    }
    Ok(ids)
}

fn cmd_examine(images: &[PathBuf], json: bool) -> anyhow::Result<()> {
    let mut reports = Vec::new();
    for (index, path) in images.iter().enumerate() {
        let device = FileDevice::open(path, DeviceId::new(IMAGE_MAJOR, index as u32))
            .with_context(|| format!("opening {:?}", path))?;
        let Some((format, sb)) = MetadataFormat::detect(&device) else {
            if json {
                reports.push(serde_json::json!({ "device": device.name(), "superblock": null }));
            } else {
                println!("{}: no md superblock detected", device.name());
            }
            continue;
        };

        let level = sb.level().map(|l| l.to_string()).unwrap_or_else(|| sb.level_raw().to_string());
        let checkpoint = (sb.recovery_cp() != MAX_SECTOR).then(|| sb.recovery_cp());
        if json {
            reports.push(serde_json::json!({
                "device": device.name(),
                "metadata": format.to_string(),
                "uuid": sb.uuid(),
                "name": sb.name(),
                "level": level,
                "raid_disks": sb.raid_disks(),
                "dev_sectors": sb.dev_sectors(),
                "events": sb.events(),
                "clean": sb.is_clean(),
                "resync_checkpoint": checkpoint,
                "this_desc": sb.this_desc(),
            }));
            continue;
        }

        println!("{}:", device.name());
        println!("          Version : {}", format);
        println!("       Array UUID : {}", sb.uuid());
        println!("             Name : {}", sb.name());
        println!("       Raid Level : {}", level);
        println!("     Raid Devices : {}", sb.raid_disks());
        println!("  Used Dev Size : {} ({} KiB)", sb.dev_sectors(), sb.dev_sectors() / 2);
        println!("           Events : {}", sb.events());
        println!("            State : {}", if sb.is_clean() { "clean" } else { "active" });
        if let Some(cp) = checkpoint {
            println!("  Resync Position : {} sectors", cp);
        }
        println!("     Device Index : {}", sb.this_desc());
        for (desc, role) in sb.roles() {
            println!("        Slot {:4} : {:?}", desc, role);
        }
        println!();
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }
    Ok(())
}

async fn cmd_create(config: &Config, geometry: ArrayGeometry, images: &[PathBuf]) -> anyhow::Result<()> {
    if (images.len() as u32) < geometry.raid_disks {
        bail!("{} raid devices requested but only {} images given", geometry.raid_disks, images.len());
    }
    let table = DeviceTable::new();
    let ids = register_images(&table, images, 0)?;
    let registry = ArrayRegistry::new(Arc::clone(&table), config);
    let array = registry.open(0);

    info!("Creating {} array on {} devices", geometry.level, images.len());
    let raid_disks = geometry.raid_disks;
    array.create(geometry).await?;
    for (slot, id) in ids.iter().enumerate() {
        let mut spec = DiskSpec::new(*id);
        if (slot as u32) < raid_disks {
            spec = spec.slot(slot as u32);
        }
        array.add_device(spec).await?;
    }
    array.run().await?;

    settle(&registry, &array).await;
    print!("{}", registry.mdstat());
    array.stop(StopMode::Full).await?;
    Ok(())
}

async fn cmd_assemble(
    config: &Config,
    images: &[PathBuf],
    add: &[PathBuf],
    fail: &[PathBuf],
    readonly: bool,
    json: bool,
) -> anyhow::Result<()> {
    let table = DeviceTable::new();
    let ids = register_images(&table, images, 0)?;
    let spares = register_images(&table, add, ids.len() as u32)?;
    let registry = ArrayRegistry::new(Arc::clone(&table), config);
    let array = registry.open(0);

    for id in &ids {
        array.add_device(DiskSpec::new(*id)).await?;
    }
    array.run().await?;
    if readonly {
        array.stop(StopMode::ReadOnly).await?;
    }

    for path in fail {
        let Some(index) = images.iter().position(|p| p == path) else {
            bail!("{:?} is not a member given to assemble", path);
        };
        array.set_faulty(ids[index]).await?;
    }
    for id in &spares {
        array.add_device(DiskSpec::new(*id)).await?;
    }

    settle(&registry, &array).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&array.info())?);
    } else {
        print!("{}", registry.mdstat());
    }
    array.stop(StopMode::Full).await?;
    Ok(())
}

/// Run the supervisor until the array has nothing left to do
async fn settle(registry: &Arc<ArrayRegistry>, array: &ArrayHandle) {
    let supervisor = registry.supervisor();
    let stopper = supervisor.handle();
    let task = tokio::spawn(supervisor.start());

    let mut last_report = None;
    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if array.state() != ArrayState::Running {
            break;
        }
        let info = array.info();
        if array.recovery_flags().contains(RecoveryFlags::RUNNING) {
            let position = info.sync_position.unwrap_or(0);
            let permille = position.saturating_mul(1000) / info.dev_sectors.max(1);
            if last_report != Some(permille / 100) {
                last_report = Some(permille / 100);
                info!("{}: {}.{}% done", array.name(), permille / 10, permille % 10);
            }
            continue;
        }
        if info.sync_phase == ResyncPhase::Error {
            warn!("{}: resync failed, giving up", array.name());
            break;
        }
        let spare_waiting = info.degraded > 0 && info.disks.iter().any(|d| d.state == MemberState::Spare);
        let pending = info.resync_checkpoint.is_some()
            || spare_waiting
            || info.disks.iter().any(|d| d.state == MemberState::Recovering);
        if !pending {
            break;
        }
    }

    stopper.stop().await;
    if let Err(e) = task.await {
        error!("Recovery supervisor panicked: {}", e);
    }
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
