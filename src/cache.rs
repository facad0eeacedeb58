//! Introspection cache.
//!
//! Results are cached per (bus, service, object path) for a fixed TTL and
//! evicted for a whole service when its owner changes. Every key has its own
//! async mutex, so concurrent misses on one key wait for a single fetch while
//! other keys proceed independently.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::dbus::{introspect, BusConnector};
use crate::error::{Error, Result};
use crate::model::{IntrospectionResult, ParsedIntrospection};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    bus: String,
    service: String,
    path: String,
}

struct Entry {
    result: IntrospectionResult,
    fetched_at: Instant,
}

type Slot = Arc<Mutex<Option<Entry>>>;

pub struct IntrospectionCache {
    connector: Arc<dyn BusConnector>,
    ttl: Duration,
    slots: RwLock<HashMap<CacheKey, Slot>>,
}

impl IntrospectionCache {
    pub fn new(connector: Arc<dyn BusConnector>, ttl: Duration) -> Self {
        Self {
            connector,
            ttl,
            slots: RwLock::new(HashMap::new()),
        }
    }

    async fn slot(&self, key: &CacheKey) -> Slot {
        if let Some(slot) = self.slots.read().await.get(key) {
            return slot.clone();
        }
        let mut slots = self.slots.write().await;
        if !slots.contains_key(key) {
            self.sweep(&mut slots);
        }
        slots.entry(key.clone()).or_default().clone()
    }

    /// Drop slots nobody is using whose entry is missing or expired.
    fn sweep(&self, slots: &mut HashMap<CacheKey, Slot>) {
        let before = slots.len();
        slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(entry) => entry
                    .as_ref()
                    .is_some_and(|e| e.fetched_at.elapsed() < self.ttl),
                Err(_) => true,
            }
        });
        let swept = before - slots.len();
        if swept > 0 {
            debug!("Swept {} stale introspection slots", swept);
        }
    }

    /// Remove a slot that ended up holding nothing, unless it was replaced.
    async fn release(&self, key: &CacheKey, slot: &Slot) {
        let mut slots = self.slots.write().await;
        if slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(key);
        }
    }

    /// Introspection of one object, from cache when fresh.
    ///
    /// A fresh fetch whose XML fails to parse is returned with `parsed_data`
    /// absent and is not cached; a previous valid entry stays in place.
    pub async fn get(&self, bus: &str, service: &str, path: &str) -> Result<IntrospectionResult> {
        self.lookup(bus, service, path).await.map(|(result, _)| result)
    }

    /// Parsed introspection of one object.
    ///
    /// Falls back to the last valid entry when a refetch does not parse;
    /// `InternalParseError` when there is none.
    pub async fn parsed(&self, bus: &str, service: &str, path: &str) -> Result<ParsedIntrospection> {
        let (result, previous) = self.lookup(bus, service, path).await?;
        if let Some(parsed) = result.parsed_data {
            return Ok(parsed);
        }
        previous.ok_or_else(|| {
            Error::InternalParseError(format!("introspection of {} {} did not parse", service, path))
        })
    }

    /// Returns the result plus the previous valid parse when the fresh one failed.
    async fn lookup(
        &self,
        bus: &str,
        service: &str,
        path: &str,
    ) -> Result<(IntrospectionResult, Option<ParsedIntrospection>)> {
        let key = CacheKey {
            bus: bus.to_string(),
            service: service.to_string(),
            path: path.to_string(),
        };
        let slot = self.slot(&key).await;
        let outcome = self.fill(&key, &slot).await;
        if slot.lock().await.is_none() {
            self.release(&key, &slot).await;
        }
        outcome
    }

    async fn fill(
        &self,
        key: &CacheKey,
        slot: &Slot,
    ) -> Result<(IntrospectionResult, Option<ParsedIntrospection>)> {
        let CacheKey { bus, service, path } = key;
        let mut entry = slot.lock().await;

        if let Some(cached) = entry.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok((cached.result.clone(), None));
            }
        }

        let xml = match self.connector.introspect(bus, service, path).await {
            Ok(xml) => xml,
            Err(err) => {
                if matches!(err, Error::ServiceNotFound(_)) {
                    *entry = None;
                }
                return Err(err);
            }
        };

        let parsed = match introspect::parse(&xml, path) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("Unparsable introspection from {} {} on {} bus: {}", service, path, bus, e);
                None
            }
        };

        let result = IntrospectionResult {
            service: service.to_string(),
            object_path: path.to_string(),
            xml,
            parsed_data: parsed,
            timestamp: Utc::now(),
        };

        if result.parsed_data.is_none() {
            let previous = entry.as_ref().and_then(|e| e.result.parsed_data.clone());
            return Ok((result, previous));
        }

        debug!("Cached introspection of {} {} on {} bus", service, path, bus);
        *entry = Some(Entry {
            result: result.clone(),
            fetched_at: Instant::now(),
        });
        Ok((result, None))
    }

    /// Drop every cached object of a service.
    pub async fn invalidate(&self, bus: &str, service: &str) {
        let mut slots = self.slots.write().await;
        let before = slots.len();
        slots.retain(|key, _| !(key.bus == bus && key.service == service));
        let removed = before - slots.len();
        if removed > 0 {
            debug!("Evicted {} cached objects of {} on {} bus", removed, service, bus);
        }
    }

    /// Drop everything cached for a bus.
    pub async fn invalidate_bus(&self, bus: &str) {
        self.slots.write().await.retain(|key, _| key.bus != bus);
    }

    /// Number of keys currently tracked.
    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
