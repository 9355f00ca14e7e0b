use anyhow::Result;
use cinerec::{init_tracing, AppState, Config, InteractionEvent};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Out-of-process feature worker: consumes the interaction topic and applies
/// each event to the owning user's feature document. Run the server with
/// inline feature updates disabled when this worker is deployed.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    std::env::set_var("RUST_LOG", &args.log_level);
    init_tracing().await;

    let config = if std::path::Path::new(&args.config).exists() {
        Config::from_file(&args.config)?
    } else {
        info!("config file not found, using default configuration");
        Config::default()
    };

    if !config.kafka.enabled {
        anyhow::bail!("feature worker requires kafka to be enabled");
    }

    let state = AppState::new(config).await?;
    run_feature_worker(state).await
}

async fn run_feature_worker(state: AppState) -> Result<()> {
    info!("starting feature worker");

    let consumer = state
        .consumer
        .clone()
        .ok_or_else(|| anyhow::anyhow!("kafka consumer not configured"))?;

    let (tx, mut rx) = mpsc::channel::<InteractionEvent>(1000);
    tokio::spawn(async move {
        if let Err(e) = consumer.consume_interaction_events(tx).await {
            error!("interaction consumer stopped: {}", e);
        }
    });

    while let Some(event) = rx.recv().await {
        match state.features.apply_and_persist(&event).await {
            Ok(_) => {
                info!(
                    "applied {} event {} for user {}",
                    event.event_type.as_str(),
                    event.request_id,
                    event.user_id
                );
                let engine = state.engine.clone();
                let user_id = event.user_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine.warm(&user_id).await {
                        error!("recommendation refresh failed for {}: {}", user_id, e);
                    }
                });
            }
            Err(e) => error!(
                "failed to apply event {} for user {}: {}",
                event.request_id, event.user_id, e
            ),
        }
    }

    Ok(())
}
