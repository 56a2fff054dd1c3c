use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use festdesk::clock::SystemClock;
use festdesk::config::{Cli, Config};
use festdesk::dispatch::{Dispatcher, EventQueue};
use festdesk::gateway::telegram::parse_update;
use festdesk::gateway::{MessagingGateway, TelegramGateway};
use festdesk::health::HealthChecker;
use festdesk::mail::Mailer;
use festdesk::state::{AppState, Services};
use festdesk::{db, routes, scheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse CLI args and load config
    let cli = Cli::parse();
    let data_dir = Config::data_dir(&cli);
    std::fs::create_dir_all(&data_dir)?;
    tracing::info!("Data directory: {}", data_dir.display());

    let config = Config::load(&cli)?;
    config.validate()?;
    let config = Arc::new(config);

    // Initialize database
    let pool = db::create_pool(config.db_path())?;
    db::run_migrations(&pool)?;

    let telegram = Arc::new(TelegramGateway::new(
        &config.telegram.bot_token,
        &config.telegram.api_base,
    )?);
    match telegram.probe().await {
        Ok(me) => tracing::info!(bot = %me, "Connected to Telegram"),
        Err(e) => tracing::warn!(error = %e, "Telegram probe failed, polling anyway"),
    }

    let mailer = Mailer::from_config(&config.smtp)?;
    if mailer.is_none() {
        tracing::info!("SMTP not configured, ticket e-mail notices disabled");
    }

    let services = Arc::new(Services::new(
        config.clone(),
        pool,
        telegram.clone(),
        mailer,
        Arc::new(SystemClock),
    ));
    let health = Arc::new(HealthChecker::new(services.clone()));
    let jobs = scheduler::start_jobs(&config, services.clone(), health.clone(), data_dir.clone());
    tracing::info!(jobs = jobs.len(), "Background jobs started");

    let shutdown = CancellationToken::new();

    // Monitoring endpoints
    let state = AppState {
        services: services.clone(),
        health,
        data_dir: data_dir.clone(),
        started_at: Utc::now(),
    };
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_stop = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, routes::router(state))
            .with_graceful_shutdown(async move { server_stop.cancelled().await })
            .await
    });

    // Inbound events
    let events = Arc::new(EventQueue::new(Arc::new(Dispatcher::new(services.clone()))));
    let poller = tokio::spawn(poll_updates(
        telegram.clone(),
        events.clone(),
        config.telegram.poll_timeout_secs,
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    shutdown.cancel();
    if let Err(e) = poller.await {
        tracing::warn!(error = %e, "Polling task ended abnormally");
    }
    match server.await {
        Ok(Err(e)) => tracing::warn!(error = %e, "HTTP server error"),
        Err(e) => tracing::warn!(error = %e, "HTTP server task ended abnormally"),
        Ok(Ok(())) => {}
    }

    // Let handlers already running finish before storage goes away
    events.drain().await;

    jobs.shutdown().await;

    let backups = Config::backups_path(&data_dir);
    if let Err(e) =
        scheduler::run_backup(services.clone(), backups, config.schedule.backup_keep).await
    {
        tracing::error!(error = %e, "Final backup failed");
    }

    drop(events);
    drop(services);
    telegram.close().await;
    tracing::info!("Stopped");

    Ok(())
}

/// Long-poll the Bot API and queue each event on its chat's flow
async fn poll_updates(
    telegram: Arc<TelegramGateway>,
    events: Arc<EventQueue>,
    timeout_secs: u64,
    shutdown: CancellationToken,
) {
    let mut offset = None;
    loop {
        let updates = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = telegram.get_updates(offset, timeout_secs) => result,
        };

        match updates {
            Ok(updates) => {
                for update in updates {
                    offset = Some(update.update_id + 1);
                    let Some(event) = parse_update(update) else {
                        continue;
                    };
                    events.push(event);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "getUpdates failed, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
            }
        }
    }
    tracing::info!("Polling stopped");
}
