use tracing::{error, info};

use crate::store::SqliteStore;

pub async fn heartbeat() {
    info!("Heartbeat: price mirror is alive");
}

/// Keep only the newest `keep` mappings. Failures are logged; the next run retries.
pub async fn prune_mappings(store: &SqliteStore, keep: usize) {
    match store.prune_mappings(keep).await {
        Ok(0) => {}
        Ok(n) => info!("Pruned {} old mapping(s), {} kept", n, keep),
        Err(e) => error!("Mapping prune failed: {:#}", e),
    }
}
