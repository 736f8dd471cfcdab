use anyhow::Result;
use clap::{Parser, Subcommand};
use dfu_core::protocol::{ImageBuilder, SigningMode, UpgradeHeader, Version, variant_tag};
use std::path::PathBuf;
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run the CLI
    Run {
        /// Arguments passed to the CLI
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Write a small demo image for manual testing
    DemoImage {
        #[arg(default_value = "target/demo.bin")]
        out: PathBuf,
    },
}

fn demo_image() -> Vec<u8> {
    let header = UpgradeHeader {
        variant: variant_tag("DEMO"),
        version: Version::new(1, 1),
        compatible_versions: vec![Version::new(1, 0)],
        ps_config_version: 1,
        compatible_ps_configs: vec![],
        signing_mode: SigningMode::Rsa1024.to_byte(),
    };
    ImageBuilder::new(header)
        .partition(1, (0..4096u32).map(|i| i as u8).collect::<Vec<_>>())
        .partition(2, vec![0xA5; 1024])
        .build()
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            let status = Command::new("cargo").arg("build").status()?;
            if !status.success() {
                anyhow::bail!("Build failed");
            }
        }
        Commands::Run { args } => {
            println!("Running CLI...");
            let status = Command::new("cargo")
                .arg("run")
                .arg("-p")
                .arg("dfu-cli")
                .arg("--")
                .args(args)
                .status()?;
            if !status.success() {
                anyhow::bail!("Run failed");
            }
        }
        Commands::DemoImage { out } => {
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let image = demo_image();
            std::fs::write(out, &image)?;
            println!(
                "Wrote {} ({} bytes); ingest with: dfu ingest {} --variant DEMO --running-version 1.0 --running-config 1",
                out.display(),
                image.len(),
                out.display()
            );
        }
    }

    Ok(())
}
