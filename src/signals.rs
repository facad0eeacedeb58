//! Signal subscriptions with buffered delivery.
//!
//! Each subscription owns a bounded ring buffer filled by a background task
//! reading the connector's signal stream. Clients poll and drain it; when it
//! is full the oldest event is dropped.

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::dbus::{BusConnector, SignalMatch};
use crate::error::{Error, Result};
use crate::model::{SignalEvent, SignalSubscription};

#[derive(Debug, Default)]
struct Buffer {
    events: VecDeque<SignalEvent>,
    dropped: u64,
    active: bool,
}

struct Subscription {
    info: SignalSubscription,
    buffer: Arc<Mutex<Buffer>>,
    pump: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn lock(buffer: &Mutex<Buffer>) -> MutexGuard<'_, Buffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SignalHub {
    connector: Arc<dyn BusConnector>,
    buffer_size: usize,
    next_id: AtomicU64,
    subscriptions: RwLock<HashMap<u64, Subscription>>,
}

impl SignalHub {
    pub fn new(connector: Arc<dyn BusConnector>, buffer_size: usize) -> Self {
        Self {
            connector,
            buffer_size: buffer_size.max(1),
            next_id: AtomicU64::new(1),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn subscribe(&self, bus: &str, rule: SignalMatch) -> Result<SignalSubscription> {
        let events = self.connector.subscribe_signal(bus, &rule).await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let buffer = Arc::new(Mutex::new(Buffer {
            active: true,
            ..Buffer::default()
        }));
        let pump = tokio::spawn(pump(id, events, buffer.clone(), self.buffer_size));

        let info = SignalSubscription {
            id,
            bus_type: bus.to_string(),
            service: rule.service,
            object_path: rule.path,
            interface: rule.interface,
            signal: rule.signal,
            active: true,
            created_at: Utc::now(),
        };
        info!(
            "Subscription {} for {}.{} on {} ({} bus)",
            id, info.interface, info.signal, info.service, bus
        );

        self.subscriptions.write().await.insert(
            id,
            Subscription {
                info: info.clone(),
                buffer,
                pump,
            },
        );
        Ok(info)
    }

    /// All subscriptions, oldest first.
    pub async fn list(&self) -> Vec<SignalSubscription> {
        let subscriptions = self.subscriptions.read().await;
        let mut list: Vec<SignalSubscription> = subscriptions
            .values()
            .map(|s| SignalSubscription {
                active: lock(&s.buffer).active,
                ..s.info.clone()
            })
            .collect();
        list.sort_by_key(|s| s.id);
        list
    }

    /// Take every buffered event of a subscription.
    pub async fn drain(&self, id: u64) -> Result<Vec<SignalEvent>> {
        let subscriptions = self.subscriptions.read().await;
        let subscription = subscriptions
            .get(&id)
            .ok_or(Error::SubscriptionNotFound(id))?;
        let mut buffer = lock(&subscription.buffer);
        if buffer.dropped > 0 {
            debug!("Subscription {} dropped {} events since last drain", id, buffer.dropped);
            buffer.dropped = 0;
        }
        Ok(buffer.events.drain(..).collect())
    }

    pub async fn unsubscribe(&self, id: u64) -> Result<()> {
        self.subscriptions
            .write()
            .await
            .remove(&id)
            .map(|_| info!("Subscription {} removed", id))
            .ok_or(Error::SubscriptionNotFound(id))
    }
}

async fn pump(
    id: u64,
    mut events: mpsc::Receiver<SignalEvent>,
    buffer: Arc<Mutex<Buffer>>,
    capacity: usize,
) {
    while let Some(event) = events.recv().await {
        let mut buffer = lock(&buffer);
        if buffer.events.len() == capacity {
            buffer.events.pop_front();
            buffer.dropped += 1;
        }
        buffer.events.push_back(event);
    }
    lock(&buffer).active = false;
    debug!("Signal stream of subscription {} closed", id);
}
