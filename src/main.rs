use anyhow::{Context, Result};
use clap::Parser;
use quark::{
    auth::{ChainedLookup, CredentialLookup, DockerKeychain},
    cli::{Cli, Commands},
    config::Config,
    platform::SupportedPlatforms,
    reference::ImageReference,
    registry::Registry,
    sync::Synchronizer,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging to stderr
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Sync {
            source,
            destination,
            platform,
        } => {
            let source = parse(&source)?;
            let destination = parse(&destination)?;
            let credentials = credentials(&config);

            let mut synchronizer =
                Synchronizer::connect(&source, &destination, credentials, &config).await?;
            if let Some(platforms) = platform {
                synchronizer = synchronizer.with_platforms(SupportedPlatforms::new(platforms));
            }

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, cancelling sync");
                    on_interrupt.cancel();
                }
            });

            let result = synchronizer
                .sync_image(&source, &destination, &cancel)
                .await
                .context("Sync failed")?;
            info!("Synced {} as {}", source, result.pinned());

            // Print only the digest to stdout
            println!("{}", result.digest);
        }
        Commands::Exists { image } => {
            let reference = parse(&image)?;
            let client = config.connect(reference.domain(), credentials(&config)).await?;
            let exists = client.exists(&reference).await?;
            println!("{}", exists);
        }
        Commands::Digest { image } => {
            let reference = parse(&image)?;
            let client = config.connect(reference.domain(), credentials(&config)).await?;
            let digest = client.get_digest(&reference).await?;
            println!("{}", digest);
        }
        Commands::Tags { repository } => {
            let reference = parse(&repository)?;
            let client = config.connect(reference.domain(), credentials(&config)).await?;
            for tag in client.list_tags(&reference.name()).await? {
                println!("{}", tag);
            }
        }
        Commands::Version => {
            println!("quark {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn parse(raw: &str) -> Result<ImageReference> {
    ImageReference::parse(raw).with_context(|| format!("Invalid image reference '{}'", raw))
}

/// Config file credentials first, then the Docker keychain.
fn credentials(config: &Config) -> Arc<dyn CredentialLookup> {
    Arc::new(ChainedLookup::new(vec![
        Box::new(config.clone()),
        Box::new(DockerKeychain::from_environment()),
    ]))
}
