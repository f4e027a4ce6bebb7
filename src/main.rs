#![cfg(feature = "cli")]
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use tracing::{error, info, warn, Level};

use cdmroute::config::Config;
use cdmroute::drm::DrmType;
use cdmroute::key::{parse_kid, ContentKey};
use cdmroute::registry::Registry;
use cdmroute::selection::{SelectionContext, SelectionRules};
use cdmroute::vault::{KeyVaults, StoreReport};

#[derive(Parser)]
#[command(name = "cdmroute", version, about = "cdmroute CLI")]
struct Cli {
    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    /// Configuration file.
    #[arg(short = 'c', long = "config", default_value = "cdmroute.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show which CDM a service would use, and the fallback sequence.
    Resolve {
        service: String,
        #[arg(short = 'p', long = "profile")]
        profile: Option<String>,
        /// Maximum video height of the content.
        #[arg(short = 'q', long = "quality")]
        quality: Option<u32>,
        /// `widevine` or `playready`.
        #[arg(long = "drm")]
        drm: Option<String>,
    },
    /// Key vault maintenance.
    Kv {
        #[command(subcommand)]
        command: KvCommands,
    },
}

#[derive(Subcommand)]
enum KvCommands {
    /// Look up a key in the vaults, in order.
    Get { service: String, kid: String },
    /// Add `KID:KEY` pairs to every push-enabled vault.
    Add {
        service: String,
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Copy every key of one vault into the others.
    Copy { from: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            let code = e
                .downcast_ref::<cdmroute::Error>()
                .map_or(1, cdmroute::Error::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli.config)?;
    match cli.command {
        Commands::Resolve {
            service,
            profile,
            quality,
            drm,
        } => run_resolve(&config, service, profile, quality, drm.as_deref()),
        Commands::Kv { command } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to create runtime")?;
            let vaults = KeyVaults::from_configs(&config.key_vaults)?;
            if vaults.is_empty() {
                warn!("No key vaults configured");
            }
            runtime.block_on(run_kv(&vaults, command))
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::from_path(path)
        .map_err(anyhow::Error::from)
        .with_context(|| format!("Failed to load {}", path.display()))
}

fn run_resolve(
    config: &Config,
    service: String,
    profile: Option<String>,
    quality: Option<u32>,
    drm: Option<&str>,
) -> anyhow::Result<()> {
    let rules = SelectionRules::from_mapping(&config.cdm)?;
    let registry = Registry::from_config(config, &rules)?;

    let mut ctx = SelectionContext::new(service);
    if let Some(profile) = profile {
        ctx = ctx.profile(profile);
    }
    if let Some(quality) = quality {
        ctx = ctx.quality(quality);
    }
    if let Some(drm) = drm {
        ctx = ctx.drm(drm.parse::<DrmType>()?);
    }

    let resolution = rules.resolve(&ctx)?;
    info!("[+] Selected {} ({:?})", resolution.descriptor, resolution.level);
    info!(" + Rule path: {}", resolution.trail.join(" -> "));

    if let Some(descriptor) = registry.get(&resolution.descriptor) {
        info!(" + Kind: {}", descriptor.kind());
        match descriptor.drm_type() {
            Ok(drm_type) => info!(" + DRM: {}", ctx.drm_type.unwrap_or(drm_type)),
            Err(e) => warn!(" + DRM: unknown ({})", e),
        }
    }
    Ok(())
}

async fn run_kv(vaults: &KeyVaults, command: KvCommands) -> anyhow::Result<()> {
    match command {
        KvCommands::Get { service, kid } => {
            let kid = parse_kid(&kid)?;
            match vaults.lookup(&service, &kid).await {
                Some(entry) => info!(
                    "[{}] {}:{}",
                    entry.source_vault,
                    entry.key.kid_hex(),
                    entry.key.key_hex()
                ),
                None => anyhow::bail!("Key {} not found in any vault", kid.as_simple()),
            }
        }
        KvCommands::Add { service, keys } => {
            let keys = keys
                .iter()
                .map(|pair| parse_pair(pair))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let report = vaults.store_all(&service, &keys, None).await;
            log_report(&report);
        }
        KvCommands::Copy { from } => {
            let report = vaults.copy_from(&from).await?;
            log_report(&report);
        }
    }
    Ok(())
}

fn parse_pair(pair: &str) -> anyhow::Result<ContentKey> {
    let (kid, key) = pair
        .split_once(':')
        .with_context(|| format!("Expected KID:KEY, got '{}'", pair))?;
    Ok(ContentKey::from_hex(kid, key, None)?)
}

fn log_report(report: &StoreReport) {
    info!(
        "Inserted {}, already present {}, failed {}, rejected {}",
        report.inserted.len(),
        report.existing.len(),
        report.failed.len(),
        report.rejected.len()
    );
    for (vault, reason) in &report.failed {
        error!(" - {}: {}", vault, reason);
    }
}
