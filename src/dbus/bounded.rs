//! Per-bus concurrency limit and call timeout around any [`BusConnector`].

use async_trait::async_trait;
use serde_json::Value as Json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::warn;

use super::{BusConnector, MethodCall, OwnerChange, PropertyRef, SignalMatch, TypeSpec};
use crate::config::DbusConfig;
use crate::error::{Error, Result};
use crate::model::{BusDescriptor, MethodCallResult, PropertyValue, SignalEvent};

/// Wraps a connector so every round-trip waits for a per-bus permit and
/// the whole wait plus call is cut off after `call_timeout`.
///
/// Buses have separate permit pools, so a stalled bus never holds up
/// another one. Streams are set up under the same limits but their
/// delivery is not bounded.
pub struct BoundedConnector {
    inner: Arc<dyn BusConnector>,
    permits: HashMap<String, Semaphore>,
    call_timeout: Duration,
}

impl BoundedConnector {
    pub fn new(inner: Arc<dyn BusConnector>, config: &DbusConfig) -> Self {
        Self::with_limits(inner, config.max_in_flight, config.call_timeout())
    }

    pub fn with_limits(
        inner: Arc<dyn BusConnector>,
        max_in_flight: usize,
        call_timeout: Duration,
    ) -> Self {
        let permits = inner
            .list_buses()
            .into_iter()
            .map(|bus| (bus.id, Semaphore::new(max_in_flight.max(1))))
            .collect();
        Self {
            inner,
            permits,
            call_timeout,
        }
    }

    async fn bounded<F, R>(&self, bus: &str, call: F) -> Result<R>
    where
        F: Future<Output = Result<R>>,
    {
        // Unknown ids go straight through so the inner connector reports them.
        let Some(permits) = self.permits.get(bus) else {
            return call.await;
        };

        let guarded = async {
            let _permit = permits
                .acquire()
                .await
                .map_err(|_| Error::BusUnavailable("connector is shutting down".into()))?;
            call.await
        };

        match tokio::time::timeout(self.call_timeout, guarded).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Call on {} bus exceeded {:?}", bus, self.call_timeout);
                Err(Error::Timeout(self.call_timeout))
            }
        }
    }
}

#[async_trait]
impl BusConnector for BoundedConnector {
    fn list_buses(&self) -> Vec<BusDescriptor> {
        self.inner.list_buses()
    }

    async fn list_services(&self, bus: &str) -> Result<Vec<String>> {
        self.bounded(bus, self.inner.list_services(bus)).await
    }

    async fn get_service_owner(&self, bus: &str, service: &str) -> Result<Option<String>> {
        self.bounded(bus, self.inner.get_service_owner(bus, service))
            .await
    }

    async fn introspect(&self, bus: &str, service: &str, path: &str) -> Result<String> {
        self.bounded(bus, self.inner.introspect(bus, service, path))
            .await
    }

    async fn call_method(&self, bus: &str, call: &MethodCall) -> Result<MethodCallResult> {
        self.bounded(bus, self.inner.call_method(bus, call)).await
    }

    async fn get_property(&self, bus: &str, property: &PropertyRef) -> Result<PropertyValue> {
        self.bounded(bus, self.inner.get_property(bus, property))
            .await
    }

    async fn set_property(
        &self,
        bus: &str,
        property: &PropertyRef,
        value: &Json,
        type_spec: Option<&TypeSpec>,
    ) -> Result<()> {
        self.bounded(bus, self.inner.set_property(bus, property, value, type_spec))
            .await
    }

    async fn owner_changes(&self, bus: &str) -> Result<mpsc::Receiver<OwnerChange>> {
        self.inner.owner_changes(bus).await
    }

    async fn subscribe_signal(
        &self,
        bus: &str,
        rule: &SignalMatch,
    ) -> Result<mpsc::Receiver<SignalEvent>> {
        self.bounded(bus, self.inner.subscribe_signal(bus, rule))
            .await
    }
}
