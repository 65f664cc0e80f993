use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tracing::{error, info};

use salon_engine::config::ServerConfig;
use salon_engine::engine::{Engine, InMemoryStore};
use salon_engine::loyalty::InMemoryLedger;
use salon_engine::notify::{LogDispatcher, NotifyHub, run_notification_worker};
use salon_engine::stash::StashDirectory;
use salon_engine::wire::{self, Gateway, Seed};
use salon_engine::{observability, reaper};

const REAP_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries responses
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let config = ServerConfig::from_env()?;
    observability::init(config.metrics_port);

    let seed = match &config.seed_path {
        Some(path) => Seed::load(path)?,
        None => Seed::default(),
    };
    let store = Arc::new(InMemoryStore::new());
    let seeded = seed.apply(store.as_ref()).await?;

    let notify = Arc::new(NotifyHub::new());
    tokio::spawn(run_notification_worker(
        notify.subscribe(),
        Arc::new(LogDispatcher),
    ));

    let stash_ttl = config.engine.stash_ttl;
    let engine = Arc::new(Engine::new(
        store,
        Arc::new(InMemoryLedger::new()),
        notify,
        config.engine.clone(),
    ));

    let stashes = Arc::new(StashDirectory::new(config.data_dir.join("stash"))?);
    tokio::spawn(reaper::run_stash_reaper(stashes.clone(), stash_ttl, REAP_PERIOD));

    info!("salon-engine ready");
    info!("  data_dir: {}", config.data_dir.display());
    info!(
        "  catalog: {} services, {} combos; {seeded} seeded events",
        seed.catalog.services.len(),
        seed.catalog.combos.len()
    );
    info!(
        "  hours: {}-{} every {} min",
        salon_engine::model::format_time(config.engine.hours.open),
        salon_engine::model::format_time(config.engine.hours.close),
        config.engine.hours.cadence
    );

    let gateway = Gateway::new(engine, seed.catalog, stashes);
    let serve = wire::process_lines(
        &gateway,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    );

    tokio::select! {
        result = serve => {
            if let Err(e) = result {
                error!("gateway error: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    info!("salon-engine stopped");
    Ok(())
}
