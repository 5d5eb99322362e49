pub mod models;
mod handlers;
pub mod server;

// Re-export commonly used types
pub use models::*;
pub use handlers::AppState;
