pub mod codec;
pub mod network;
pub mod rpc;
pub mod proxy;
pub mod client;
pub mod utils;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
