use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use teamslot::engine::{EngineConfig, ResolverOptions};
use teamslot::limits::{MAX_SLOT_DURATION_MS, MIN_SLOT_DURATION_MS};
use teamslot::model::{DayWindow, LocalRange, MINUTE_MS, TimeZoneSpec};
use teamslot::provider::{CalendarBackend, Credentials, GoogleCalendar, InMemoryCalendar};
use teamslot::tenant::TenantManager;
use teamslot::wire;

type BoxError = Box<dyn std::error::Error>;

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Like `env_or`, but a value that is present and malformed stops startup.
fn env_strict<T>(name: &str, default: &str) -> Result<T, BoxError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse().map_err(|e| format!("{name}={raw:?}: {e}").into())
}

/// Slot length in ms, or `None` when outside the accepted range.
fn slot_duration_ms(minutes: i64) -> Option<i64> {
    minutes
        .checked_mul(MINUTE_MS)
        .filter(|ms| (MIN_SLOT_DURATION_MS..=MAX_SLOT_DURATION_MS).contains(ms))
}

fn engine_config_from_env() -> Result<EngineConfig, BoxError> {
    let time_zone: TimeZoneSpec = env_strict("TEAMSLOT_TIME_ZONE", "Asia/Tokyo")?;

    let slot_minutes: i64 = env_strict("TEAMSLOT_SLOT_MINUTES", "60")?;
    let slot_duration_ms = slot_duration_ms(slot_minutes)
        .ok_or_else(|| format!("TEAMSLOT_SLOT_MINUTES={slot_minutes} out of range"))?;

    let exclusions = std::env::var("TEAMSLOT_EXCLUDE")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<LocalRange>().map_err(|e| format!("TEAMSLOT_EXCLUDE: {e}")))
        .collect::<Result<Vec<_>, _>>()?;

    let default_window: LocalRange = env_strict("TEAMSLOT_DEFAULT_WINDOW", "10:00-18:00")?;
    let provider_timeout_ms: u64 = env_strict("TEAMSLOT_PROVIDER_TIMEOUT_MS", "5000")?;

    Ok(EngineConfig {
        time_zone,
        resolver: ResolverOptions {
            slot_duration_ms,
            exclusions,
        },
        default_window: DayWindow::open(default_window.start, default_window.end),
        provider_timeout: Duration::from_millis(provider_timeout_ms),
    })
}

fn calendar_from_env(credentials: Arc<Credentials>) -> Result<Arc<dyn CalendarBackend>, BoxError> {
    let provider = std::env::var("TEAMSLOT_PROVIDER").unwrap_or_else(|_| "memory".into());
    match provider.as_str() {
        "memory" => Ok(Arc::new(InMemoryCalendar::new())),
        "google" => {
            let mut google = GoogleCalendar::new(credentials);
            if let Ok(base) = std::env::var("TEAMSLOT_GOOGLE_API_BASE") {
                google = google.with_base_url(base);
            }
            Ok(Arc::new(google))
        }
        other => Err(format!("TEAMSLOT_PROVIDER={other:?}: expected memory or google").into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("TEAMSLOT_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    teamslot::observability::init(metrics_port)?;

    let port = std::env::var("TEAMSLOT_PORT").unwrap_or_else(|_| "5433".into());
    let bind = std::env::var("TEAMSLOT_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("TEAMSLOT_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let password = std::env::var("TEAMSLOT_PASSWORD").unwrap_or_else(|_| "teamslot".into());
    let max_connections: usize = env_or("TEAMSLOT_MAX_CONNECTIONS", 256);
    let compact_threshold: u64 = env_or("TEAMSLOT_COMPACT_THRESHOLD", 1000);

    let tls_cert = std::env::var("TEAMSLOT_TLS_CERT").ok();
    let tls_key = std::env::var("TEAMSLOT_TLS_KEY").ok();
    let tls_acceptor = teamslot::tls::load_tls_acceptor(tls_cert.as_deref(), tls_key.as_deref())?;

    let engine_config = engine_config_from_env()?;
    let credentials = Arc::new(Credentials::new());
    let calendar = calendar_from_env(credentials.clone())?;

    std::fs::create_dir_all(&data_dir)?;

    let shutdown_token = CancellationToken::new();
    info!(
        time_zone = %engine_config.time_zone,
        slot_minutes = engine_config.resolver.slot_duration_ms / MINUTE_MS,
        exclusions = engine_config.resolver.exclusions.len(),
        "engine configured"
    );
    let tenant_manager = Arc::new(TenantManager::new(
        PathBuf::from(&data_dir),
        compact_threshold,
        calendar,
        credentials,
        engine_config,
        shutdown_token.clone(),
    ));
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("teamslot listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  max_connections: {max_connections}");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
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
                        metrics::counter!(teamslot::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(teamslot::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(teamslot::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let tm = tenant_manager.clone();
                let pw = password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, tm, pw, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(teamslot::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // In-flight slot queries give up on their calendar lookups; background tasks stop.
    shutdown_token.cancel();

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
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
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("teamslot stopped");
    Ok(())
}
