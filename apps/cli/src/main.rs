use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use dfu_core::error::DfuError;
use dfu_core::protocol::{
    ImageBuilder, ImageLayout, SECTION_PREFIX_SIZE, SectionKind, SigningMode, UpgradeHeader,
    Version, WILDCARD_MINOR, variant_tag, variant_to_string,
};
use dfu_core::session::{DfuSession, SessionConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "DFU upgrade image ingestion tool", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ingest an upgrade image into the partition directory
    Ingest {
        /// Path to the upgrade image
        image: Option<PathBuf>,

        #[command(flatten)]
        store: StoreArgs,

        /// Device variant the image must target
        #[arg(long)]
        variant: Option<String>,

        /// Running application version (major.minor)
        #[arg(long, value_parser = parse_version)]
        running_version: Option<Version>,

        /// Running PS-config version
        #[arg(long)]
        running_config: Option<u16>,

        /// Delivery fragment size in bytes
        #[arg(long)]
        fragment: Option<usize>,

        /// Erase and start over even if a checkpoint exists
        #[arg(long)]
        force_erase: bool,

        /// Do not mirror header bytes into the checkpoint
        #[arg(long)]
        no_header_mirror: bool,
    },
    /// Show the persisted upgrade checkpoint
    Status {
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Forget the upgrade in progress
    Abandon {
        #[command(flatten)]
        store: StoreArgs,
    },
    /// List the sections of an image
    Inspect {
        image: PathBuf,
    },
    /// Build an image with a bench signature from partition files
    Pack {
        /// Output image path
        #[arg(short, long)]
        out: PathBuf,

        #[arg(long, default_value = "")]
        variant: String,

        /// Version carried by the image (major.minor)
        #[arg(long, value_parser = parse_version)]
        version: Version,

        /// Compatible running version, repeatable; `N.*` matches any minor
        #[arg(long = "compatible", value_parser = parse_version, required = true)]
        compatible: Vec<Version>,

        #[arg(long, default_value_t = 0)]
        ps_config: u16,

        /// Compatible PS-config version, repeatable
        #[arg(long = "ps-compatible")]
        ps_compatible: Vec<u16>,

        /// rsa1024 or rsa2048
        #[arg(long, default_value = "rsa1024", value_parser = parse_signing_mode)]
        signing: SigningMode,

        /// Partition content as NUMBER=PATH, repeatable
        #[arg(long = "partition", value_parser = parse_partition)]
        partitions: Vec<(u16, PathBuf)>,
    },
    /// Write a session configuration file with default values
    InitConfig {
        path: PathBuf,
    },
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// Session configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding partition files
    #[arg(long)]
    partition_dir: Option<String>,

    /// Checkpoint file
    #[arg(long)]
    checkpoint: Option<String>,
}

impl StoreArgs {
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load_from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => SessionConfig::default(),
        };
        if let Some(dir) = &self.partition_dir {
            config.partition_dir = dir.clone();
        }
        if let Some(path) = &self.checkpoint {
            config.checkpoint_path = path.clone();
        }
        Ok(config)
    }
}

fn parse_version(s: &str) -> Result<Version, String> {
    let (major, minor) = s
        .split_once('.')
        .ok_or_else(|| format!("expected MAJOR.MINOR, got '{}'", s))?;
    let major = major.parse().map_err(|e| format!("bad major: {}", e))?;
    let minor = if minor == "*" {
        WILDCARD_MINOR
    } else {
        minor.parse().map_err(|e| format!("bad minor: {}", e))?
    };
    Ok(Version::new(major, minor))
}

fn parse_signing_mode(s: &str) -> Result<SigningMode, String> {
    match s.to_ascii_lowercase().as_str() {
        "rsa1024" => Ok(SigningMode::Rsa1024),
        "rsa2048" => Ok(SigningMode::Rsa2048),
        other => Err(format!("unknown signing mode '{}'", other)),
    }
}

fn parse_partition(s: &str) -> Result<(u16, PathBuf), String> {
    let (number, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NUMBER=PATH, got '{}'", s))?;
    let number = number
        .parse()
        .map_err(|e| format!("bad partition number: {}", e))?;
    Ok((number, PathBuf::from(path)))
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(cli.command) {
        match e.downcast_ref::<DfuError>() {
            Some(dfu) => error!(
                code = %format!("0x{:02X}", dfu.code()),
                class = %dfu.class(),
                "Error: {:#}",
                e
            ),
            None => error!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Ingest {
            image,
            store,
            variant,
            running_version,
            running_config,
            fragment,
            force_erase,
            no_header_mirror,
        } => {
            let mut config = store.session_config()?;
            if let Some(image) = image {
                config.image_path = Some(image.to_string_lossy().into_owned());
            }
            if let Some(variant) = variant {
                config.engine.device_variant = variant;
            }
            if let Some(version) = running_version {
                config.engine.running_version = version;
            }
            if let Some(ps) = running_config {
                config.engine.running_config_version = ps;
            }
            if let Some(fragment) = fragment {
                config.fragment_size = fragment;
            }
            config.engine.force_erase |= force_erase;
            if no_header_mirror {
                config.engine.store_headers = false;
            }

            info!("Starting DFU ingest...");
            let checkpoint = DfuSession::new(config).run()?;
            println!(
                "Image verified: version {}, last partition {}",
                checkpoint
                    .version_in_progress
                    .map_or_else(|| "?".to_string(), |v| v.to_string()),
                checkpoint.last_closed_partition.saturating_sub(1)
            );
        }
        Commands::Status { store } => {
            let status = DfuSession::new(store.session_config()?).status()?;
            let cp = &status.checkpoint;
            println!("Resume point:     {}", cp.resume_point);
            println!("Partitions state: {}", cp.partitions_state);
            println!("Last closed:      {}", cp.last_closed_partition);
            if let Some(version) = cp.version_in_progress {
                println!("Version:          {}", version);
            }
            if let Some(ps) = cp.config_version_in_progress {
                println!("PS config:        {}", ps);
            }
            match status.resume_offset {
                Some(offset) => println!(
                    "Resume offset:    {} (completed {:?})",
                    offset, status.completed
                ),
                None => println!("Resume offset:    image start"),
            }
            println!("Resumable:        {}", cp.can_resume());
        }
        Commands::Abandon { store } => {
            DfuSession::new(store.session_config()?).abandon()?;
            println!("Upgrade abandoned");
        }
        Commands::Inspect { image } => {
            let data = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            let layout = ImageLayout::scan(&data)?;
            if let Some(header) = &layout.header {
                println!(
                    "Variant {} version {} signing {}",
                    header.variant_str(),
                    header.version,
                    SigningMode::from_byte(header.signing_mode)
                        .map_or_else(|_| format!("0x{:02X}", header.signing_mode), |m| m.to_string())
                );
                let compatible: Vec<String> =
                    header.compatible_versions.iter().map(|v| v.to_string()).collect();
                println!("  compatible versions: {}", compatible.join(", "));
                println!(
                    "  ps config {} compatible {:?}",
                    header.ps_config_version, header.compatible_ps_configs
                );
            }
            for section in &layout.sections {
                let name = section
                    .kind
                    .map_or_else(|| variant_to_string(&section.id), |k| k.to_string());
                match (&section.kind, &section.partition) {
                    (Some(SectionKind::PartitionData), Some(sub)) => println!(
                        "{:>8}  {:<8} {:>8} bytes  partition {} sqif {} first word 0x{:08X}",
                        section.offset, name, section.length, sub.partition, sub.sqif, sub.first_word
                    ),
                    _ => println!("{:>8}  {:<8} {:>8} bytes", section.offset, name, section.length),
                }
            }
            let end = layout
                .sections
                .last()
                .map_or(0, |s| s.offset + SECTION_PREFIX_SIZE + s.length as usize);
            if end != data.len() {
                bail!("Image is {} bytes but sections end at {}", data.len(), end);
            }
        }
        Commands::Pack {
            out,
            variant,
            version,
            compatible,
            ps_config,
            ps_compatible,
            signing,
            partitions,
        } => {
            if partitions.is_empty() {
                return Err(anyhow!("At least one --partition is required"));
            }
            let header = UpgradeHeader {
                variant: variant_tag(&variant),
                version,
                compatible_versions: compatible,
                ps_config_version: ps_config,
                compatible_ps_configs: ps_compatible,
                signing_mode: signing.to_byte(),
            };
            let mut builder = ImageBuilder::new(header);
            for (number, path) in partitions {
                let content = std::fs::read(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                builder = builder.partition(number, content);
            }
            let image = builder.build();
            std::fs::write(&out, &image)?;
            println!("Wrote {} ({} bytes)", out.display(), image.len());
        }
        Commands::InitConfig { path } => {
            SessionConfig::default().save_to_file(&path)?;
            println!("Wrote {}", path.display());
        }
    }

    Ok(())
}
