use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use certctl::{Config, Controller, FileSecretStore, IssuerRegistry};
use clap::{Parser, Subcommand};
use eyre::WrapErr as _;
use tokio_util::sync::CancellationToken;

/// Issues, renews and distributes TLS certificates using ACME DNS-01 challenges.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the controller until interrupted.
    Run {
        /// Path to the TOML configuration file.
        #[arg(short, long, default_value = "certctl.toml")]
        config: PathBuf,
    },

    /// Validate the configuration and exit.
    Check {
        /// Path to the TOML configuration file.
        #[arg(short, long, default_value = "certctl.toml")]
        config: PathBuf,

        /// Also ask each DNS provider whether its API token is accepted.
        #[arg(long)]
        verify_dns: bool,
    },
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    match Cli::parse().command {
        Command::Run { config } => run(&config).await,
        Command::Check { config, verify_dns } => check(&config, verify_dns).await,
    }
}

async fn run(path: &Path) -> eyre::Result<()> {
    let config = Config::from_path(path)?;
    let issuers = IssuerRegistry::from_config(&config)?;

    tokio::fs::create_dir_all(&config.secrets.root)
        .await
        .wrap_err_with(|| format!("cannot create {}", config.secrets.root.display()))?;
    let store = Arc::new(FileSecretStore::new(&config.secrets.root));

    let controller = Controller::new(config.controller.clone(), issuers, store);

    for spec in &config.certificates {
        let id = controller
            .submit(spec.clone())
            .wrap_err_with(|| format!("cannot submit certificate {}", spec.secret_name))?;
        log::info!("{id}: {} for {:?}", spec.secret_name, spec.namespaces);
    }

    let shutdown = CancellationToken::new();

    tokio::spawn({
        let shutdown = shutdown.clone();

        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    log::info!("interrupted");
                    shutdown.cancel();
                }
                Err(err) => log::error!("cannot listen for Ctrl-C: {err}"),
            }
        }
    });

    controller.run(shutdown).await;

    Ok(())
}

async fn check(path: &Path, verify_dns: bool) -> eyre::Result<()> {
    let config = Config::from_path(path)?;

    println!(
        "{}: {} issuer(s), {} certificate(s)",
        path.display(),
        config.issuers.len(),
        config.certificates.len()
    );

    if !verify_dns {
        return Ok(());
    }

    let issuers = IssuerRegistry::from_config(&config)?;
    let mut refused = Vec::new();

    for issuer in issuers.iter() {
        let provider = issuer.solver().provider();

        match provider.verify_token().await {
            Ok(true) => println!("{}: {} token accepted", issuer.name(), provider.name()),
            Ok(false) => {
                println!("{}: {} token refused", issuer.name(), provider.name());
                refused.push(issuer.name().to_owned());
            }
            Err(err) => {
                println!("{}: cannot verify {} token: {err}", issuer.name(), provider.name());
                refused.push(issuer.name().to_owned());
            }
        }
    }

    if !refused.is_empty() {
        eyre::bail!("DNS credentials not usable for {}", refused.join(", "));
    }

    Ok(())
}
