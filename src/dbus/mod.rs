//! D-Bus access layer.
//!
//! Everything that talks to a message bus goes through the [`BusConnector`]
//! trait. The server owns one connector handle and injects it into the
//! introspection cache, the dispatcher and the owner watcher.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐     ┌──────────────┐     ┌────────────────┐     ┌─────────┐
//! │  REST API  │────>│  Dispatcher  │────>│ BusConnector   │────>│  D-Bus  │
//! │  (axum)    │     │              │<───>│ (ZbusConnector │     │ daemon  │
//! └────────────┘     └──────┬───────┘     │  / MemoryBus)  │     └─────────┘
//!                           │             └───────▲────────┘
//!                    ┌──────▼────────────┐        │ NameOwnerChanged
//!                    │IntrospectionCache │<───────┘ (OwnerWatcher)
//!                    └───────────────────┘
//! ```
//!
//! # Implementations
//!
//! - [`ZbusConnector`]: real system/session/custom buses via zbus
//! - [`MemoryBus`]: an in-process bus with scripted services, used by the
//!   test suite and for exercising the API without a bus daemon
//!
//! [`BoundedConnector`] wraps either one with the per-bus in-flight limit
//! and the call timeout.

mod bounded;
mod connector;
pub mod introspect;
pub mod marshal;
mod memory;
pub mod signature;

pub use bounded::BoundedConnector;
pub use connector::ZbusConnector;
pub use memory::{MemoryBus, MemoryMethod, MemoryService, MethodFault};
pub use signature::TypeSpec;

use async_trait::async_trait;
use serde_json::Value as Json;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::model::{BusDescriptor, MethodCallResult, PropertyValue, SignalEvent};

/// Standard interface for introspection.
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

/// Standard interface for property access.
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Object path used when a request does not name one.
pub const ROOT_PATH: &str = "/";

/// A method invocation on a remote object.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub service: String,
    pub path: String,
    pub interface: String,
    pub method: String,
    pub args: Vec<Json>,
    /// Input signature; inferred from the JSON arguments when absent.
    pub signature: Option<Vec<TypeSpec>>,
}

/// Addresses one property of one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyRef {
    pub service: String,
    pub path: String,
    pub interface: String,
    pub property: String,
}

/// Which signals a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalMatch {
    pub service: String,
    pub path: String,
    pub interface: String,
    pub signal: String,
}

/// A `NameOwnerChanged` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerChange {
    pub bus: String,
    pub name: String,
    pub old_owner: Option<String>,
    pub new_owner: Option<String>,
}

/// Access to the configured message buses.
///
/// Bus identifiers are the configured [`BusDescriptor::id`] values. Every
/// operation fails with `UnknownBus` for an unconfigured id and with
/// `BusUnavailable` when no connection can be established.
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Configured buses, in configuration order.
    fn list_buses(&self) -> Vec<BusDescriptor>;

    /// Names currently registered on the bus, sorted.
    async fn list_services(&self, bus: &str) -> Result<Vec<String>>;

    /// Unique connection name owning `service`, `None` when unowned.
    async fn get_service_owner(&self, bus: &str, service: &str) -> Result<Option<String>>;

    /// Raw introspection XML of one object.
    async fn introspect(&self, bus: &str, service: &str, path: &str) -> Result<String>;

    /// Invoke a method.
    ///
    /// Failures reported by the peer or the transport after the call was
    /// dispatched are returned as `success = false`, not as `Err`.
    async fn call_method(&self, bus: &str, call: &MethodCall) -> Result<MethodCallResult>;

    async fn get_property(&self, bus: &str, property: &PropertyRef) -> Result<PropertyValue>;

    /// Write a property. `type_spec` is the declared property type if known.
    async fn set_property(
        &self,
        bus: &str,
        property: &PropertyRef,
        value: &Json,
        type_spec: Option<&TypeSpec>,
    ) -> Result<()>;

    /// Stream of `NameOwnerChanged` notifications for the bus.
    async fn owner_changes(&self, bus: &str) -> Result<mpsc::Receiver<OwnerChange>>;

    /// Stream of signals matching `rule`.
    async fn subscribe_signal(
        &self,
        bus: &str,
        rule: &SignalMatch,
    ) -> Result<mpsc::Receiver<SignalEvent>>;
}
