use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fwup_core::ContainerBuilder;
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
        /// Arguments passed to `fwup`
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Pack module bodies into a firmware image for bench testing
    Pack {
        /// Output image
        #[arg(short, long)]
        output: PathBuf,

        /// OTP encryption version tag
        #[arg(long, default_value_t = 0)]
        otp: u8,

        /// Modules as NAME:VERSION:PATH, in image order
        #[arg(required = true)]
        modules: Vec<String>,
    },
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
                .arg("fwup-cli")
                .arg("--")
                .args(args)
                .status()?;
            if !status.success() {
                anyhow::bail!("Run failed");
            }
        }
        Commands::Pack {
            output,
            otp,
            modules,
        } => {
            let mut builder = ContainerBuilder::new().otp_encrypt_version(*otp);
            for spec in modules {
                let mut parts = spec.splitn(3, ':');
                let (Some(name), Some(version), Some(path)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    anyhow::bail!("Expected NAME:VERSION:PATH, got {}", spec);
                };
                let body =
                    std::fs::read(path).with_context(|| format!("Failed to read {}", path))?;
                println!("Adding {} {} ({} bytes)", name, version, body.len());
                builder = builder.module(name, version, body);
            }
            builder
                .write_to(output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Wrote {}", output.display());
        }
    }

    Ok(())
}
