//! canaryd — the canary release daemon.
//!
//! # Usage
//!
//! ```text
//! canaryd serve --config /etc/canary/canaryd.toml
//! canaryd check-config --config /etc/canary/canaryd.toml
//! canaryd rollout --config /etc/canary/canaryd.toml --service account --tag v2
//! ```

use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use canary_state::{RolloutOutcome, RolloutRequest};
use canaryd::CanaryConfig;

#[derive(Parser)]
#[command(name = "canaryd", about = "Canary release controller daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Recover interrupted rollouts, then serve the REST API.
    Serve {
        #[arg(long, default_value = "/etc/canary/canaryd.toml")]
        config: PathBuf,
    },

    /// Validate a configuration file and exit.
    CheckConfig {
        #[arg(long, default_value = "/etc/canary/canaryd.toml")]
        config: PathBuf,
    },

    /// Run one rollout to completion without the API and promote on success.
    Rollout {
        #[arg(long, default_value = "/etc/canary/canaryd.toml")]
        config: PathBuf,

        #[arg(long)]
        service: String,

        /// Version tag to roll out.
        #[arg(long)]
        tag: String,

        /// Canary traffic percentage.
        #[arg(long, default_value = "10")]
        weight: u8,

        /// Replace the stable group directly, skipping evaluation.
        #[arg(long)]
        no_canary: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve { config } => serve(CanaryConfig::from_file(&config)?).await,
        Command::CheckConfig { config } => {
            let config = CanaryConfig::from_file(&config)?;
            println!(
                "ok: {} service(s), {} probe rounds per window",
                config.services.len(),
                config.evaluation.required_checks()
            );
            Ok(())
        }
        Command::Rollout {
            config,
            service,
            tag,
            weight,
            no_canary,
        } => {
            let request = RolloutRequest::new(&service, &tag, weight)
                .with_canary(!no_canary)
                .with_promote(true);
            rollout(CanaryConfig::from_file(&config)?, request).await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("info,canaryd=debug,canary_controller=debug")
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn serve(config: CanaryConfig) -> anyhow::Result<()> {
    info!("canary daemon starting");

    let store = canaryd::open_store(&config)?;
    let controller = canaryd::build_controller(&config, store)?;

    // Nothing may serve requests while an interrupted rollout is unresolved.
    for record in controller.recover().await? {
        warn!(
            service = %record.service,
            rollout = %record.id,
            outcome = ?record.outcome,
            reason = record.reason.as_deref().unwrap_or(""),
            "recovered interrupted rollout"
        );
    }

    let router = canary_api::build_router(controller);
    let addr = config.listen_addr()?;
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    info!("canary daemon stopped");
    Ok(())
}

async fn rollout(config: CanaryConfig, request: RolloutRequest) -> anyhow::Result<()> {
    let store = canaryd::open_store(&config)?;
    let controller = canaryd::build_controller(&config, store)?;
    controller.recover().await?;

    let record = tokio::select! {
        result = controller.run(request) => result?,
        _ = tokio::signal::ctrl_c() => {
            bail!("interrupted; the next `canaryd serve` or `canaryd rollout` recovers the service")
        }
    };

    println!("{}", serde_json::to_string_pretty(&record)?);
    match record.outcome {
        Some(RolloutOutcome::Promoted) => Ok(()),
        outcome => bail!(
            "rollout {} ended {}: {}",
            record.id,
            outcome.map(|o| o.to_string()).unwrap_or_default(),
            record.reason.as_deref().unwrap_or("no reason recorded")
        ),
    }
}
