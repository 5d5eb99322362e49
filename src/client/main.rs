use anyhow::Context;
use clap::Parser;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use crate::client::Args;
use crate::client::config::{self, Config, CoreConfig};
use crate::client::core_client::CoreClient;
use crate::client::http::server;
use crate::client::prettylog::{log_cache_ready, log_startup_banner, log_status};
use crate::proxy::StatusCache;
use crate::utils;

pub async fn run_proxy() {
    let args = Args::parse();

    if let Err(e) = utils::init_tracing() {
        eprintln!("Failed to initialize logging: {}", e);
        return;
    }

    let config = match resolve_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("Invalid configuration: {:#}", e);
            return;
        }
    };
    log_startup_banner(&config);

    let client = match CoreClient::connect(&config.core).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::error!("Failed to connect to core {}: {}", config.core.addr, e);
            return;
        }
    };

    let cache = StatusCache::new(client.clone(), config.cache.clone());
    if let Err(e) = cache.start().await {
        // keep serving whatever was loaded, stale entries refetch on demand
        tracing::error!("Failed to load session status: {}", e);
    }
    log_cache_ready(&cache);

    // Start HTTP server if port is specified
    if let Some(http_port) = config.http.port {
        let bind = config.http.bind.clone();
        let http_cache = cache.clone();
        tokio::spawn(async move {
            if let Err(e) = server::start(&bind, http_port, http_cache).await {
                tracing::error!("HTTP server error: {}", e);
            }
        });
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Ctrl-C received, shutting down");
    };
    let watch_interval = Duration::from_secs(args.watch_interval.max(1));
    run_event_loop(&cache, || client.is_connected(), watch_interval, shutdown).await;
    cache.stop();
}

/// Refresh and print the cache every `watch_interval` until `shutdown`
/// resolves or the core connection drops
async fn run_event_loop(
    cache: &StatusCache,
    connected: impl Fn() -> bool,
    watch_interval: Duration,
    shutdown: impl Future<Output = ()>,
) {
    let mut watch_ticker = interval(watch_interval);
    watch_ticker.tick().await;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = watch_ticker.tick() => {
                if !connected() {
                    tracing::error!("core connection lost, shutting down");
                    break;
                }
                // a slow refresh must not hold up shutdown
                tokio::select! {
                    result = cache.query(None, None) => {
                        if let Err(e) = result {
                            tracing::warn!("status refresh failed: {}", e);
                        }
                    }
                    _ = &mut shutdown => break,
                }
                log_status(cache);
            }

            _ = &mut shutdown => break,
        }
    }
}

/// Config file values overridden by command line flags
pub fn resolve_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => config::load(path).with_context(|| format!("failed to load {}", path))?,
        None => {
            let addr = args
                .core
                .clone()
                .context("either --config or --core is required")?;
            Config {
                core: CoreConfig::new(addr),
                cache: Default::default(),
                http: Default::default(),
            }
        }
    };

    if let Some(addr) = &args.core {
        config.core.addr = addr.clone();
    }
    if let Some(cache_time_ms) = args.cache_time_ms {
        config.cache.cache_time_ms = cache_time_ms;
    }
    if let Some(chunk_size) = args.chunk_size {
        config.cache.chunk_size = chunk_size;
    }
    if args.full_fetch {
        config.cache.diff_only = false;
    }
    if let Some(port) = args.http_port {
        config.http.port = Some(port);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_without_config_file() {
        let args = Args::parse_from([
            "proxy",
            "--core",
            "127.0.0.1:7070",
            "--cache-time-ms",
            "400",
            "--full-fetch",
            "--http-port",
            "8088",
        ]);
        let config = resolve_config(&args).unwrap();

        assert_eq!(config.core.addr, "127.0.0.1:7070");
        assert_eq!(config.cache.cache_time_ms, 400);
        assert_eq!(config.cache.chunk_size, 30);
        assert!(!config.cache.diff_only);
        assert_eq!(config.http.port, Some(8088));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_slow_refresh() {
        use crate::proxy::{CacheConfig, StatusDict};
        use crate::rpc::memory::InMemoryCore;
        use serde_json::json;
        use tokio::sync::oneshot;

        let core = Arc::new(InMemoryCore::with_sessions([(
            "t1".to_string(),
            StatusDict::from([("name".to_string(), json!("t1 name"))]),
        )]));
        let cache = StatusCache::new(core.clone(), CacheConfig::default());
        cache.start().await.unwrap();
        core.clear_calls();
        core.hold();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let loop_cache = cache.clone();
        let watch = tokio::spawn(async move {
            let shutdown = async {
                let _ = stop_rx.await;
            };
            run_event_loop(&loop_cache, || true, Duration::from_secs(30), shutdown).await;
        });

        // first tick fires a refresh the held core never answers
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(core.status_calls(), 1);

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), watch)
            .await
            .expect("watch loop ignored shutdown")
            .unwrap();
        cache.stop();
    }

    #[test]
    fn test_core_address_required() {
        let args = Args::parse_from(["proxy"]);
        let err = resolve_config(&args).unwrap_err();
        assert!(err.to_string().contains("--core"));
    }
}
