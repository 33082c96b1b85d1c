use std::sync::Arc;

use livewatch::config::AppConfig;
use livewatch::database::{MaintenanceScheduler, Store};
use livewatch::logging;
use livewatch::monitor::{StatusConfirmer, StatusMonitor};
use livewatch::notification::{Dispatcher, TelegramSink};
use livewatch::sites::SiteAdapter;
use livewatch::utils::client_rotator::ClientRotator;
use livewatch::utils::http_client::install_rustls_provider;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    let (logging_config, _log_guard) = logging::init_logging(&config.log_dir)?;
    install_rustls_provider();

    let store = Store::open(&config.database_url).await?;
    tracing::info!(database = %config.database_url, "Database ready");

    let mut dispatcher = Dispatcher::new(store.clone(), config.notifications.batch_size);
    if config.telegram.is_usable() {
        dispatcher.register_sink(Arc::new(TelegramSink::new(config.telegram.clone())?));
    } else {
        tracing::warn!("Telegram delivery disabled; queued notifications will fail");
    }
    dispatcher.recover().await?;

    let rotator = Arc::new(ClientRotator::from_addresses(
        &config.http_settings(),
        &config.http.source_addresses,
    )?);

    let cancel = CancellationToken::new();
    logging_config.start_retention_cleanup(cancel.clone());

    let confirmer = StatusConfirmer::new(
        store.clone(),
        config.confirmation_policy(),
        config.fanout_policy(),
    );
    let mut monitor = StatusMonitor::new(store.clone(), confirmer, cancel.clone());

    for site in &config.sites {
        let adapter = Arc::new(SiteAdapter::from_config(site, rotator.clone())?);
        monitor.add_site(adapter, &site.poll_settings()).await?;
    }
    monitor.start_confirmation_sweep(config.sweep_period());
    monitor.start_dispatcher(Arc::new(dispatcher), config.dispatch_period());
    monitor.start_maintenance(Arc::new(MaintenanceScheduler::new(
        store,
        config.maintenance_config(),
    )));

    tracing::info!(sites = config.sites.len(), "livewatch started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    monitor.shutdown().await;

    Ok(())
}
