// ============================================================================
// Log Output Functions
// ============================================================================

use crate::client::config::Config;
use crate::proxy::StatusCache;
use serde_json::Value;
use tokio::time::Instant;

/// Fields shown per session in the status table
const SUMMARY_FIELDS: [&str; 3] = ["name", "state", "progress"];

pub fn log_startup_banner(config: &Config) {
    println!("====================================");
    println!("  Session Status Proxy Starting");
    println!("====================================");
    println!("Core address: {}", config.core.addr);
    println!("Cache window: {}ms", config.cache.cache_time_ms);
    println!("Chunk size: {}", config.cache.chunk_size);
    println!("Diff requests: {}", if config.cache.diff_only { "on" } else { "off" });
    match config.http.port {
        Some(port) => println!("HTTP status: http://{}:{}/status", config.http.bind, port),
        None => println!("HTTP status: disabled"),
    }
    println!("------------------------------------");
}

pub fn log_cache_ready(cache: &StatusCache) {
    println!("Cached sessions: {}", cache.len());
    println!("====================================");
    println!("Ready to serve status queries");
}

pub fn log_status(cache: &StatusCache) {
    println!("\n╔══════════════════════════════════════════════════════════════════════╗");
    println!("║                          CACHED SESSIONS                             ║");
    println!("╚══════════════════════════════════════════════════════════════════════╝");

    let ids = cache.ids();
    if ids.is_empty() {
        println!("   └─ No sessions");
        return;
    }

    let window = cache.config().cache_time();
    let now = Instant::now();
    println!("👥 Sessions: {} total", ids.len());
    for (idx, id) in ids.iter().enumerate() {
        let Some(entry) = cache.entry(id) else {
            continue;
        };
        let is_last = idx == ids.len() - 1;
        let prefix = if is_last { "└─" } else { "├─" };
        let continuation = if is_last { " " } else { "│" };

        let freshness = match entry.refreshed_at() {
            None => "⏳ Loading".to_string(),
            Some(at) => {
                let age = now.saturating_duration_since(at);
                if age <= window {
                    format!("🟢 Fresh ({}ms ago)", age.as_millis())
                } else {
                    format!("⚪ Stale ({}s ago)", age.as_secs())
                }
            }
        };
        println!("   {} {} {} ({} fields)", prefix, id, freshness, entry.len());

        for field in SUMMARY_FIELDS {
            if let Some(value) = entry.get(field) {
                println!("   {}    ├─ {}: {}", continuation, field, display_value(value));
            }
        }
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
