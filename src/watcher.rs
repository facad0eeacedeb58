//! Owner-change listener feeding cache eviction.
//!
//! One task per bus holds a `NameOwnerChanged` stream. When the stream
//! cannot be opened or ends, the task retries with exponential backoff and
//! drops everything cached for that bus, since notifications may have been
//! missed in between.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::IntrospectionCache;
use crate::dbus::{BusConnector, OwnerChange};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct OwnerWatcher {
    tasks: Vec<JoinHandle<()>>,
}

impl OwnerWatcher {
    /// Start one listener per configured bus.
    pub fn spawn(connector: Arc<dyn BusConnector>, cache: Arc<IntrospectionCache>) -> Self {
        let tasks = connector
            .list_buses()
            .into_iter()
            .map(|bus| {
                let connector = connector.clone();
                let cache = cache.clone();
                tokio::spawn(watch_bus(connector, cache, bus.id))
            })
            .collect();
        Self { tasks }
    }

    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for OwnerWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn apply(cache: &IntrospectionCache, change: OwnerChange) {
    debug!(
        "{} bus: {} changed owner ({:?} -> {:?})",
        change.bus, change.name, change.old_owner, change.new_owner
    );
    cache.invalidate(&change.bus, &change.name).await;
    if let Some(old) = change.old_owner.as_deref() {
        if old != change.name {
            cache.invalidate(&change.bus, old).await;
        }
    }
}

async fn watch_bus(connector: Arc<dyn BusConnector>, cache: Arc<IntrospectionCache>, bus: String) {
    let mut backoff = INITIAL_BACKOFF;
    let mut connected_before = false;

    loop {
        match connector.owner_changes(&bus).await {
            Ok(mut changes) => {
                if connected_before {
                    cache.invalidate_bus(&bus).await;
                }
                info!("Watching owner changes on {} bus", bus);
                connected_before = true;
                backoff = INITIAL_BACKOFF;

                while let Some(change) = changes.recv().await {
                    apply(&cache, change).await;
                }
                warn!("Owner change stream for {} bus ended", bus);
            }
            Err(e) => {
                warn!(
                    "Cannot watch owner changes on {} bus: {} (retrying in {:?})",
                    bus, e, backoff
                );
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}
