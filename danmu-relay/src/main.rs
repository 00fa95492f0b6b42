use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use danmu::{SourceRegistry, WsSource, WsSourceConfig};
use relay_core::{
    MemoryCounterStore, MemoryStats, RateLimiter, RedisCounterStore, RedisStats, Router,
    StatsSink,
};

use danmu_relay::config::AppConfig;
use danmu_relay::delivery::{TelegramConfig, TelegramDelivery};
use danmu_relay::scheduler::Scheduler;
use danmu_relay::store::DestinationStore;

#[derive(Parser, Debug)]
#[command(name = "danmu-relay", about = "Relays live-stream danmaku into chat channels")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = AppConfig::load(&args.config).await?;

    // Keep the file-appender guard alive for the lifetime of the process.
    let _log_guard = init_tracing(&config);

    let mut sources = SourceRegistry::new();
    for source in &config.sources {
        sources.register(Arc::new(WsSource::new(
            &source.id,
            WsSourceConfig {
                endpoint: source.endpoint.clone(),
                auth_token: source.auth_token.clone(),
            },
        )));
        info!("Configured source {} at {}", source.id, source.endpoint);
    }

    let limiter = Arc::new(build_limiter(&config).await);
    let stats = build_stats(&config).await;
    let delivery = Arc::new(TelegramDelivery::new(TelegramConfig {
        bot_token: config.bot_token.clone(),
        api_base: config.api_base.clone(),
    }));

    let router = Arc::new(Router::new(
        Arc::new(sources),
        delivery,
        limiter,
        stats,
        config.router_config(),
    ));

    // Re-establish every stored subscription.
    let store = DestinationStore::load(config.data_dir.join("destinations.json")).await?;
    for (destination, entry) in store.all() {
        if let Err(e) = router
            .subscribe(destination, &entry.source, entry.room_id, entry.rule())
            .await
        {
            error!("Failed to restore subscription of destination {destination}: {e}");
        }
    }
    info!("Restored {} destinations", store.all().len());

    let scheduler = Scheduler::new(router.clone());
    if let Some(expression) = &config.reconnect_cron {
        scheduler.schedule_batch_reconnect(expression)?;
    }
    for (destination, entry) in store.all() {
        for schedule in &entry.schedules {
            if let Err(e) =
                scheduler.schedule_destination_action(destination, &schedule.cron, &schedule.action)
            {
                warn!("Skipping schedule for destination {destination}: {e}");
            }
        }
    }

    info!("danmu-relay is running");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    scheduler.shutdown().await;
    router.shutdown().await;
    Ok(())
}

/// Pick the rate limiter backend: shared Redis counters when configured,
/// per-instance counters otherwise.
async fn build_limiter(config: &AppConfig) -> RateLimiter {
    let limits = config.limiter_config();
    if let Some(url) = config.rate_limit.redis_url.as_deref().filter(|_| limits.enabled) {
        match redis_connection(url).await {
            Ok(conn) => {
                info!("Rate limiter using shared counter store at {url}");
                return RateLimiter::new(Box::new(RedisCounterStore::new(conn, "relay:")), limits);
            }
            Err(e) => {
                error!("Counter store at {url} unreachable, using in-process counters: {e}");
            }
        }
    } else if limits.enabled {
        warn!("Rate limiting uses in-process counters; limits are per-instance only");
    }
    RateLimiter::new(Box::new(MemoryCounterStore::new()), limits)
}

/// Pick the statistics backend, if statistics are enabled at all.
async fn build_stats(config: &AppConfig) -> Option<Arc<dyn StatsSink>> {
    if !config.statistics.enabled {
        return None;
    }
    if let Some(url) = config.statistics.redis_url.as_deref() {
        match redis_connection(url).await {
            Ok(conn) => {
                info!("Statistics using shared store at {url}");
                return Some(Arc::new(RedisStats::new(conn, "relay:stats:")));
            }
            Err(e) => {
                error!("Statistics store at {url} unreachable, using in-process counters: {e}");
            }
        }
    }
    Some(Arc::new(MemoryStats::new()))
}

async fn redis_connection(url: &str) -> anyhow::Result<redis::aio::ConnectionManager> {
    let url = if url.starts_with("redis://") || url.starts_with("rediss://") {
        url.to_string()
    } else {
        format!("redis://{url}")
    };
    let client = redis::Client::open(url)?;
    Ok(redis::aio::ConnectionManager::new(client).await?)
}

fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "danmu_relay=info,relay_core=info,danmu=info".into());

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer());

    if let Some(logs_dir) = &config.logs_dir {
        let appender = tracing_appender::rolling::daily(logs_dir, "danmu-relay.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false),
            )
            .init();
        Some(guard)
    } else {
        registry.init();
        None
    }
}
