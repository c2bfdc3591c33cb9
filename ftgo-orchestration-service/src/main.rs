use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ftgo_orchestration_service::checkout::purge_expired_checkouts;
use ftgo_orchestration_service::config::Config;
use ftgo_orchestration_service::dispatch::Dispatcher;
use ftgo_orchestration_service::events::{KafkaSink, NotificationSink, Notifier, TracingSink};
use ftgo_orchestration_service::store::PgStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations.
    Migrate,
    /// Expire lapsed rider offers, re-broadcast their sub-orders and purge
    /// stale checkouts on a fixed interval.
    Sweep {
        /// Run a single pass and exit.
        #[arg(long)]
        once: bool,
    },
}

struct Sweeper {
    store: Arc<PgStore>,
    dispatcher: Dispatcher<PgStore>,
}

impl Sweeper {
    fn run(&self) {
        match self.dispatcher.redispatch_expired() {
            Ok(count) if count > 0 => info!(count, "sub-orders re-broadcast"),
            Ok(_) => {}
            Err(err) => tracing::error!(error = %err, "offer sweep failed"),
        }
        if let Err(err) = purge_expired_checkouts(self.store.as_ref()) {
            tracing::error!(error = %err, "checkout purge failed");
        }
    }
}

fn notifier(config: &Config) -> anyhow::Result<Notifier> {
    let sink: Arc<dyn NotificationSink> = match &config.kafka_url {
        Some(kafka_url) => Arc::new(
            KafkaSink::connect(kafka_url.clone(), config.notification_topic.clone())
                .map_err(|err| anyhow::anyhow!("Cannot connect to Kafka: {}", err))?,
        ),
        None => {
            info!("KAFKA_URL not set, notifications are only logged");
            Arc::new(TracingSink)
        }
    };
    Ok(Notifier::new(sink))
}

async fn sweep(config: Config, once: bool) -> anyhow::Result<()> {
    let store = Arc::new(PgStore::new(config.database_url.clone()));
    let notifier = notifier(&config)?;
    let sweeper = Arc::new(Sweeper {
        dispatcher: Dispatcher::new(store.clone(), notifier, config.settings.clone()),
        store,
    });

    if once {
        return tokio::task::spawn_blocking(move || sweeper.run())
            .await
            .context("Sweep task panicked");
    }

    info!(interval = ?config.sweep_interval, "sweeping");
    let mut interval = tokio::time::interval(config.sweep_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let sweeper = sweeper.clone();
                tokio::task::spawn_blocking(move || sweeper.run())
                    .await
                    .context("Sweep task panicked")?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    match cli.command {
        Commands::Migrate => {
            let store = PgStore::new(config.database_url);
            let applied = tokio::task::spawn_blocking(move || store.run_migrations())
                .await
                .context("Migration task panicked")??;
            info!(?applied, "migrations applied");
            Ok(())
        }
        Commands::Sweep { once } => sweep(config, once).await,
    }
}
