use clap::Parser;

pub mod config;
pub mod core_client;
pub mod errors;
pub mod http;
pub mod main;
mod prettylog;

pub use core_client::CoreClient;
pub use errors::RpcError;

/// Session status proxy
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file (TOML)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Core address (e.g., 127.0.0.1:7070), overrides the config file
    #[arg(short = 's', long)]
    pub core: Option<String>,

    /// Cache window in milliseconds
    #[arg(long)]
    pub cache_time_ms: Option<u64>,

    /// Session ids per batched status request
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Always request full status instead of changed fields only
    #[arg(long)]
    pub full_fetch: bool,

    /// HTTP status server port (disabled if not specified)
    #[arg(long)]
    pub http_port: Option<u16>,

    /// Seconds between status table printouts
    #[arg(long, default_value = "30")]
    pub watch_interval: u64,
}
