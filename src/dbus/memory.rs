//! In-process [`BusConnector`] with scripted services.
//!
//! Services are registered with their introspection XML, properties and
//! method handlers. Arguments and property values go through the same
//! marshaling as on a real bus, so type errors surface the same way.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::marshal;
use super::{BusConnector, MethodCall, OwnerChange, PropertyRef, SignalMatch, TypeSpec};
use crate::error::{classify_dbus_error, Error, Result};
use crate::model::{BusDescriptor, MethodCallResult, PropertyAccess, PropertyValue, SignalEvent};

const CHANNEL_SIZE: usize = 64;

/// Error returned by a scripted method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodFault {
    pub name: String,
    pub message: String,
}

impl MethodFault {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

type Handler = dyn Fn(&[Json]) -> std::result::Result<Vec<Json>, MethodFault> + Send + Sync;

/// A scripted method: input signature plus a handler over JSON arguments.
#[derive(Clone)]
pub struct MemoryMethod {
    signature: Vec<TypeSpec>,
    handler: Arc<Handler>,
}

impl MemoryMethod {
    pub fn new<F>(signature: &str, handler: F) -> Result<Self>
    where
        F: Fn(&[Json]) -> std::result::Result<Vec<Json>, MethodFault> + Send + Sync + 'static,
    {
        let signature = TypeSpec::parse_list(signature)
            .map_err(|e| Error::InvalidParameter(format!("signature '{}': {}", signature, e)))?;
        Ok(Self {
            signature,
            handler: Arc::new(handler),
        })
    }
}

impl fmt::Debug for MemoryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMethod")
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct MemoryProperty {
    type_spec: TypeSpec,
    access: PropertyAccess,
    value: Json,
}

/// Member key: (object path, interface, member).
type MemberKey = (String, String, String);

fn member_key(path: &str, interface: &str, member: &str) -> MemberKey {
    (path.to_string(), interface.to_string(), member.to_string())
}

/// A scripted service: objects, properties and methods.
#[derive(Debug, Clone, Default)]
pub struct MemoryService {
    objects: BTreeMap<String, String>,
    properties: HashMap<MemberKey, MemoryProperty>,
    methods: HashMap<MemberKey, MemoryMethod>,
}

impl MemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object with its introspection XML.
    pub fn object(mut self, path: &str, xml: &str) -> Self {
        self.objects.insert(path.to_string(), xml.to_string());
        self
    }

    pub fn property(
        mut self,
        path: &str,
        interface: &str,
        name: &str,
        type_spec: TypeSpec,
        access: PropertyAccess,
        value: Json,
    ) -> Self {
        self.properties.insert(
            member_key(path, interface, name),
            MemoryProperty {
                type_spec,
                access,
                value,
            },
        );
        self
    }

    pub fn method(mut self, path: &str, interface: &str, name: &str, method: MemoryMethod) -> Self {
        self.methods.insert(member_key(path, interface, name), method);
        self
    }
}

#[derive(Debug)]
struct Registered {
    owner: String,
    service: MemoryService,
}

struct Subscriber {
    bus: String,
    rule: SignalMatch,
    tx: mpsc::Sender<SignalEvent>,
}

#[derive(Default)]
struct BusState {
    /// (bus, well-known name) -> service
    services: HashMap<(String, String), Registered>,
    owner_listeners: Vec<(String, mpsc::Sender<OwnerChange>)>,
    subscribers: Vec<Subscriber>,
    unavailable: Vec<String>,
    /// Per-bus delay before method calls and property access reply
    delays: HashMap<String, Duration>,
}

/// In-memory message bus.
pub struct MemoryBus {
    buses: Vec<BusDescriptor>,
    state: Mutex<BusState>,
    next_connection: AtomicU64,
    introspect_calls: AtomicUsize,
    introspect_delay_ms: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unknown_service(service: &str) -> Error {
    classify_dbus_error(
        "org.freedesktop.DBus.Error.ServiceUnknown",
        &format!("The name {} was not provided by any .service files", service),
    )
    .unwrap_or_else(|| Error::ServiceNotFound(service.to_string()))
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(vec![BusDescriptor::system(), BusDescriptor::session()])
    }
}

impl MemoryBus {
    pub fn new(buses: Vec<BusDescriptor>) -> Self {
        Self {
            buses,
            state: Mutex::new(BusState::default()),
            next_connection: AtomicU64::new(1),
            introspect_calls: AtomicUsize::new(0),
            introspect_delay_ms: AtomicU64::new(0),
        }
    }

    /// Number of `Introspect` calls served so far.
    pub fn introspect_calls(&self) -> usize {
        self.introspect_calls.load(Ordering::SeqCst)
    }

    /// Delay every `Introspect` reply.
    pub fn set_introspect_delay(&self, delay: Duration) {
        self.introspect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay method calls and property access on one bus.
    pub fn set_call_delay(&self, bus: &str, delay: Duration) {
        lock(&self.state).delays.insert(bus.to_string(), delay);
    }

    async fn stall(&self, bus: &str) {
        let delay = lock(&self.state).delays.get(bus).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Make every operation on `bus` fail with `BusUnavailable`.
    pub fn set_available(&self, bus: &str, available: bool) {
        let mut state = lock(&self.state);
        state.unavailable.retain(|b| b != bus);
        if !available {
            state.unavailable.push(bus.to_string());
        }
    }

    /// Register (or replace) a service; returns its new unique name.
    pub fn add_service(&self, bus: &str, name: &str, service: MemoryService) -> String {
        let owner = format!(
            ":1.{}",
            self.next_connection.fetch_add(1, Ordering::SeqCst)
        );
        let mut state = lock(&self.state);
        let previous = state.services.insert(
            (bus.to_string(), name.to_string()),
            Registered {
                owner: owner.clone(),
                service,
            },
        );
        Self::notify_owner(
            &mut state,
            OwnerChange {
                bus: bus.to_string(),
                name: name.to_string(),
                old_owner: previous.map(|p| p.owner),
                new_owner: Some(owner.clone()),
            },
        );
        owner
    }

    /// Drop a service from the bus. Returns false if it was not registered.
    pub fn remove_service(&self, bus: &str, name: &str) -> bool {
        let mut state = lock(&self.state);
        let Some(previous) = state.services.remove(&(bus.to_string(), name.to_string())) else {
            return false;
        };
        Self::notify_owner(
            &mut state,
            OwnerChange {
                bus: bus.to_string(),
                name: name.to_string(),
                old_owner: Some(previous.owner),
                new_owner: None,
            },
        );
        true
    }

    /// Current value of a property, bypassing access checks.
    pub fn property_value(&self, bus: &str, property: &PropertyRef) -> Option<Json> {
        let state = lock(&self.state);
        let registered = state
            .services
            .get(&(bus.to_string(), property.service.clone()))?;
        registered
            .service
            .properties
            .get(&member_key(&property.path, &property.interface, &property.property))
            .map(|p| p.value.clone())
    }

    /// Emit a signal from a registered service. Returns the number of
    /// subscribers it was delivered to.
    pub fn emit_signal(
        &self,
        bus: &str,
        service: &str,
        path: &str,
        interface: &str,
        signal: &str,
        args: Vec<Json>,
    ) -> usize {
        let mut state = lock(&self.state);
        let sender = state
            .services
            .get(&(bus.to_string(), service.to_string()))
            .map(|r| r.owner.clone());

        state.subscribers.retain(|s| !s.tx.is_closed());
        let mut delivered = 0;
        for subscriber in &state.subscribers {
            let rule = &subscriber.rule;
            let matches = subscriber.bus == bus
                && rule.service == service
                && rule.path == path
                && rule.interface == interface
                && rule.signal == signal;
            if !matches {
                continue;
            }
            let event = SignalEvent {
                interface: interface.to_string(),
                signal: signal.to_string(),
                sender: sender.clone(),
                object_path: Some(path.to_string()),
                args: args.clone(),
                timestamp: Utc::now(),
            };
            if subscriber.tx.try_send(event).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn notify_owner(state: &mut BusState, change: OwnerChange) {
        debug!(
            "{} bus: {} owner {:?} -> {:?}",
            change.bus, change.name, change.old_owner, change.new_owner
        );
        state.owner_listeners.retain(|(bus, tx)| {
            if *bus != change.bus {
                return !tx.is_closed();
            }
            !matches!(
                tx.try_send(change.clone()),
                Err(mpsc::error::TrySendError::Closed(_))
            )
        });
    }

    fn check_bus(&self, bus: &str) -> Result<()> {
        if !self.buses.iter().any(|b| b.id == bus) {
            return Err(Error::UnknownBus(bus.to_string()));
        }
        if lock(&self.state).unavailable.iter().any(|b| b == bus) {
            return Err(Error::BusUnavailable(format!("{} bus is not connected", bus)));
        }
        Ok(())
    }

    fn with_service<T>(
        &self,
        bus: &str,
        service: &str,
        f: impl FnOnce(&mut Registered) -> Result<T>,
    ) -> Result<T> {
        let mut state = lock(&self.state);
        let key = (bus.to_string(), service.to_string());
        if let Some(registered) = state.services.get_mut(&key) {
            return f(registered);
        }
        // Unique names address the connection directly.
        state
            .services
            .iter_mut()
            .find(|((b, _), r)| b == bus && r.owner == service)
            .map(|(_, r)| r)
            .ok_or_else(|| unknown_service(service))
            .and_then(f)
    }
}

#[async_trait]
impl BusConnector for MemoryBus {
    fn list_buses(&self) -> Vec<BusDescriptor> {
        self.buses.clone()
    }

    async fn list_services(&self, bus: &str) -> Result<Vec<String>> {
        self.check_bus(bus)?;
        let state = lock(&self.state);
        let mut names: Vec<String> = state
            .services
            .keys()
            .filter(|(b, _)| b == bus)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn get_service_owner(&self, bus: &str, service: &str) -> Result<Option<String>> {
        self.check_bus(bus)?;
        match self.with_service(bus, service, |r| Ok(r.owner.clone())) {
            Ok(owner) => Ok(Some(owner)),
            Err(Error::ServiceNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn introspect(&self, bus: &str, service: &str, path: &str) -> Result<String> {
        self.check_bus(bus)?;
        self.introspect_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.introspect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        self.with_service(bus, service, |registered| {
            registered.service.objects.get(path).cloned().ok_or_else(|| {
                Error::ServiceNotFound(format!(
                    "org.freedesktop.DBus.Error.UnknownObject: no object at {}",
                    path
                ))
            })
        })
    }

    async fn call_method(&self, bus: &str, call: &MethodCall) -> Result<MethodCallResult> {
        self.check_bus(bus)?;
        self.stall(bus).await;
        let values = marshal::to_values(&call.args, call.signature.as_deref())?;
        let args: Vec<Json> = values.iter().map(marshal::to_json).collect();

        let method = self.with_service(bus, &call.service, |registered| {
            Ok(registered
                .service
                .methods
                .get(&member_key(&call.path, &call.interface, &call.method))
                .cloned())
        });

        let method = match method {
            Ok(Some(method)) => method,
            Ok(None) => {
                return Ok(MethodCallResult::failed(
                    Some("org.freedesktop.DBus.Error.UnknownMethod".into()),
                    format!(
                        "No such method '{}' in interface '{}' at object path '{}'",
                        call.method, call.interface, call.path
                    ),
                ))
            }
            Err(_) => {
                return Ok(MethodCallResult::failed(
                    Some("org.freedesktop.DBus.Error.ServiceUnknown".into()),
                    format!(
                        "The name {} was not provided by any .service files",
                        call.service
                    ),
                ))
            }
        };

        // The peer sees arguments typed by its own signature.
        let typed = match marshal::to_values(&args, Some(&method.signature)) {
            Ok(values) => values.iter().map(marshal::to_json).collect::<Vec<_>>(),
            Err(e) => {
                return Ok(MethodCallResult::failed(
                    Some("org.freedesktop.DBus.Error.InvalidArgs".into()),
                    e.to_string(),
                ))
            }
        };

        Ok(match (method.handler)(&typed) {
            Ok(values) => MethodCallResult::succeeded(values),
            Err(fault) => MethodCallResult::failed(Some(fault.name), fault.message),
        })
    }

    async fn get_property(&self, bus: &str, property: &PropertyRef) -> Result<PropertyValue> {
        self.check_bus(bus)?;
        self.stall(bus).await;
        self.with_service(bus, &property.service, |registered| {
            let key = member_key(&property.path, &property.interface, &property.property);
            let prop = registered
                .service
                .properties
                .get(&key)
                .ok_or_else(|| Error::PropertyNotFound(property.property.clone()))?;
            if !prop.access.readable() {
                return Err(Error::AccessDenied(format!(
                    "property {} is write-only",
                    property.property
                )));
            }
            Ok(PropertyValue {
                name: property.property.clone(),
                type_signature: prop.type_spec.to_string(),
                value: prop.value.clone(),
                timestamp: Utc::now(),
            })
        })
    }

    async fn set_property(
        &self,
        bus: &str,
        property: &PropertyRef,
        value: &Json,
        type_spec: Option<&TypeSpec>,
    ) -> Result<()> {
        self.check_bus(bus)?;
        self.stall(bus).await;
        self.with_service(bus, &property.service, |registered| {
            let key = member_key(&property.path, &property.interface, &property.property);
            let prop = registered
                .service
                .properties
                .get_mut(&key)
                .ok_or_else(|| Error::PropertyNotFound(property.property.clone()))?;
            if !prop.access.writable() {
                return Err(Error::PropertyNotWritable(property.property.clone()));
            }

            let spec = type_spec.unwrap_or(&prop.type_spec);
            if *spec != prop.type_spec {
                return Err(Error::InvalidParameter(format!(
                    "property {} has type '{}', got '{}'",
                    property.property, prop.type_spec, spec
                )));
            }
            let marshaled = marshal::to_value(value, spec)?;
            prop.value = marshal::to_json(&marshaled);
            Ok(())
        })
    }

    async fn owner_changes(&self, bus: &str) -> Result<mpsc::Receiver<OwnerChange>> {
        self.check_bus(bus)?;
        let (tx, rx) = mpsc::channel(CHANNEL_SIZE);
        lock(&self.state)
            .owner_listeners
            .push((bus.to_string(), tx));
        Ok(rx)
    }

    async fn subscribe_signal(
        &self,
        bus: &str,
        rule: &SignalMatch,
    ) -> Result<mpsc::Receiver<SignalEvent>> {
        self.check_bus(bus)?;
        let (tx, rx) = mpsc::channel(CHANNEL_SIZE);
        lock(&self.state).subscribers.push(Subscriber {
            bus: bus.to_string(),
            rule: rule.clone(),
            tx,
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const XML: &str = r#"<node>
  <interface name="org.example.Counter">
    <method name="Add">
      <arg name="a" type="i" direction="in"/>
      <arg name="b" type="i" direction="in"/>
      <arg name="sum" type="i" direction="out"/>
    </method>
    <property name="Label" type="s" access="readwrite"/>
    <property name="Total" type="u" access="read"/>
  </interface>
</node>"#;

    fn bus() -> MemoryBus {
        let bus = MemoryBus::default();
        let add = MemoryMethod::new("ii", |args| {
            let a = args[0].as_i64().unwrap_or_default();
            let b = args[1].as_i64().unwrap_or_default();
            Ok(vec![json!(a + b)])
        })
        .unwrap();
        let service = MemoryService::new()
            .object("/", XML)
            .method("/", "org.example.Counter", "Add", add)
            .property(
                "/",
                "org.example.Counter",
                "Label",
                TypeSpec::String,
                PropertyAccess::ReadWrite,
                json!("start"),
            )
            .property(
                "/",
                "org.example.Counter",
                "Total",
                TypeSpec::UInt32,
                PropertyAccess::Read,
                json!(3),
            );
        bus.add_service("session", "org.example.Counter", service);
        bus
    }

    fn prop(name: &str) -> PropertyRef {
        PropertyRef {
            service: "org.example.Counter".into(),
            path: "/".into(),
            interface: "org.example.Counter".into(),
            property: name.into(),
        }
    }

    fn call(service: &str, method: &str, args: Vec<Json>) -> MethodCall {
        MethodCall {
            service: service.into(),
            path: "/".into(),
            interface: "org.example.Counter".into(),
            method: method.into(),
            args,
            signature: None,
        }
    }

    #[tokio::test]
    async fn test_services_and_owner() {
        let bus = bus();
        assert_eq!(
            bus.list_services("session").await.unwrap(),
            vec!["org.example.Counter"]
        );
        assert!(bus.list_services("system").await.unwrap().is_empty());

        let owner = bus
            .get_service_owner("session", "org.example.Counter")
            .await
            .unwrap()
            .unwrap();
        assert!(owner.starts_with(":1."));
        assert_eq!(
            bus.get_service_owner("session", &owner).await.unwrap(),
            Some(owner.clone())
        );
        assert_eq!(
            bus.get_service_owner("session", "org.example.Gone").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_unknown_and_unavailable_bus() {
        let bus = bus();
        assert_eq!(
            bus.list_services("nope").await.unwrap_err(),
            Error::UnknownBus("nope".into())
        );
        bus.set_available("session", false);
        assert!(matches!(
            bus.list_services("session").await,
            Err(Error::BusUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_introspect_counts_calls() {
        let bus = bus();
        let xml = bus
            .introspect("session", "org.example.Counter", "/")
            .await
            .unwrap();
        assert!(xml.contains("org.example.Counter"));
        assert!(matches!(
            bus.introspect("session", "org.example.Counter", "/missing").await,
            Err(Error::ServiceNotFound(_))
        ));
        assert_eq!(bus.introspect_calls(), 2);
    }

    #[tokio::test]
    async fn test_call_method() {
        let bus = bus();
        let result = bus
            .call_method("session", &call("org.example.Counter", "Add", vec![json!(2), json!(3)]))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.return_values, Some(vec![json!(5)]));

        let missing = bus
            .call_method("session", &call("org.example.Gone", "Add", vec![]))
            .await
            .unwrap();
        assert!(!missing.success);
        assert_eq!(
            missing.error_name.as_deref(),
            Some("org.freedesktop.DBus.Error.ServiceUnknown")
        );

        let wrong_args = bus
            .call_method("session", &call("org.example.Counter", "Add", vec![json!("x")]))
            .await
            .unwrap();
        assert!(!wrong_args.success);
    }

    #[tokio::test]
    async fn test_properties() {
        let bus = bus();
        bus.set_property("session", &prop("Label"), &json!("next"), None)
            .await
            .unwrap();
        let value = bus.get_property("session", &prop("Label")).await.unwrap();
        assert_eq!(value.value, json!("next"));
        assert_eq!(value.type_signature, "s");

        let err = bus
            .set_property("session", &prop("Total"), &json!(9), None)
            .await
            .unwrap_err();
        assert_eq!(err, Error::PropertyNotWritable("Total".into()));
        assert_eq!(bus.property_value("session", &prop("Total")), Some(json!(3)));

        assert!(matches!(
            bus.get_property("session", &prop("Nope")).await,
            Err(Error::PropertyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_owner_changes_and_signals() {
        let bus = bus();
        let mut changes = bus.owner_changes("session").await.unwrap();
        assert!(bus.remove_service("session", "org.example.Counter"));
        let change = changes.recv().await.unwrap();
        assert_eq!(change.name, "org.example.Counter");
        assert!(change.old_owner.is_some());
        assert!(change.new_owner.is_none());
        assert!(!bus.remove_service("session", "org.example.Counter"));

        bus.add_service("session", "org.example.Counter", MemoryService::new());
        let _ = changes.recv().await.unwrap();

        let rule = SignalMatch {
            service: "org.example.Counter".into(),
            path: "/".into(),
            interface: "org.example.Counter".into(),
            signal: "Changed".into(),
        };
        let mut events = bus.subscribe_signal("session", &rule).await.unwrap();
        assert_eq!(
            bus.emit_signal("session", "org.example.Counter", "/", "org.example.Counter", "Changed", vec![json!(1)]),
            1
        );
        assert_eq!(
            bus.emit_signal("session", "org.example.Counter", "/", "org.example.Counter", "Other", vec![]),
            0
        );
        let event = events.recv().await.unwrap();
        assert_eq!(event.signal, "Changed");
        assert_eq!(event.args, vec![json!(1)]);
    }
}
