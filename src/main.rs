use std::{net::SocketAddr, sync::Arc};

use tokio::{
    signal,
    sync::{mpsc, watch},
};
use tracing::{error, info};

use deposit_api as api;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(&cfg.log_level, cfg.log_json);
    api::handlers::health::init_start_time();

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    // Init events
    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(api::events::EventSender::new(event_tx));
    let event_loop = tokio::spawn(api::events::process_events(event_rx));

    let state = Arc::new(api::AppState::new(
        db_arc.clone(),
        cfg.clone(),
        event_sender,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = if cfg.sweep_enabled {
        Some(api::services::sweep::spawn_scheduler(
            state.services.sweep.clone(),
            cfg.sweep_interval(),
            cfg.sweep_run_on_start,
            shutdown_rx.clone(),
        ))
    } else {
        info!("Scheduled sweep disabled");
        None
    };

    let app = api::handlers::router(state.clone());

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port).parse()?;
    info!("deposit-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the scheduler and cancel any sweep in flight
    let _ = shutdown_tx.send(true);
    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            error!("Sweep scheduler ended abnormally: {}", e);
        }
    }

    // Dropping the last senders lets the event loop drain and exit
    drop(state);
    drop(shutdown_rx);
    if let Err(e) = event_loop.await {
        error!("Event loop ended abnormally: {}", e);
    }

    if let Ok(pool) = Arc::try_unwrap(db_arc) {
        api::db::close_pool(pool).await?;
    }
    info!("deposit-api stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
