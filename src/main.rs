use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use slotgrid::catalog::Catalog;
use slotgrid::config::Config;
use slotgrid::engine::Scheduler;
use slotgrid::notify::NotifyHub;
use slotgrid::store::{DurableStore, MemoryStore, ScheduleStore};
use slotgrid::wire::{self, SlotgridHandler};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Arc::new(Config::from_env()?);
    slotgrid::observability::init(config.metrics_port)?;

    let tls_acceptor = slotgrid::tls::load_tls_acceptor(&config)?;
    let catalog = match &config.catalog_path {
        Some(path) => Catalog::load(path)?,
        None => Catalog::builtin(),
    };

    let notify = Arc::new(NotifyHub::new());
    let store: Arc<dyn ScheduleStore> = match config.wal_path() {
        Some(wal_path) => {
            if let Some(dir) = &config.data_dir {
                std::fs::create_dir_all(dir)?;
            }
            let durable = Arc::new(DurableStore::open(&wal_path, notify)?);
            tokio::spawn(slotgrid::compactor::run_compactor(
                durable.clone(),
                config.compact_threshold,
                slotgrid::compactor::CHECK_INTERVAL,
            ));
            durable as Arc<dyn ScheduleStore>
        }
        None => Arc::new(MemoryStore::new(notify)),
    };

    let scheduler = Arc::new(Scheduler::new(store, config.grid).with_max_attempts(config.max_attempts));
    let handler = Arc::new(SlotgridHandler::new(scheduler, Arc::new(catalog.clone()), config.clone()));
    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("slotgrid listening on {addr}");
    info!("  lab: {} ({} weeks)", config.lab_id, config.weeks);
    info!(
        "  grid: {} slots of {} min from {}",
        config.grid.slot_count(),
        config.grid.slot_minutes,
        slotgrid::grid::format_hhmm(config.grid.day_start)
    );
    info!("  catalog: {} entries", catalog.len());
    info!(
        "  store: {}",
        config.wal_path().map_or("memory".to_string(), |p| p.display().to_string())
    );
    info!("  max_connections: {max_connections}");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!(
        "  metrics: {}",
        config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("no SIGTERM handler ({e}), waiting for ctrl-c only");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(slotgrid::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(slotgrid::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(slotgrid::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let handler = handler.clone();
                let password = config.password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, handler, password, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(slotgrid::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("slotgrid stopped");
    Ok(())
}
