use crate::proxy::cache::{Inner, StatusCache};
use crate::rpc::CoreEvent;
use std::sync::Weak;
use tokio::sync::mpsc;

/// Apply core events to the cache in the order they were received
///
/// Holds the cache weakly so a dropped cache ends the loop instead of being
/// kept alive by its own subscription.
pub(super) async fn run(weak: Weak<Inner>, mut events: mpsc::UnboundedReceiver<CoreEvent>) {
    while let Some(event) = events.recv().await {
        let Some(cache) = StatusCache::upgrade(&weak) else {
            break;
        };
        cache.handle_event(event);
    }
    tracing::debug!("status cache event loop finished");
}
