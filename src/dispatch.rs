//! Maps API operations onto the cache, the connector and the signal hub.
//!
//! Every operation validates its inputs before touching a bus, and errors
//! from buses flagged `sanitize_errors` lose their transport detail here.

use futures_util::future::join_all;
use serde_json::Value as Json;
use std::sync::Arc;
use tracing::debug;

use crate::cache::IntrospectionCache;
use crate::dbus::{BusConnector, MethodCall, PropertyRef, SignalMatch, TypeSpec, ROOT_PATH};
use crate::error::{Error, Result};
use crate::model::{
    BusDescriptor, BusInfo, InterfaceDescriptor, IntrospectionResult, MethodCallResult,
    MethodDescriptor, ParsedIntrospection, PropertyDescriptor, PropertyValue, ServiceInfo,
    SignalDescriptor, SignalEvent, SignalSubscription,
};
use crate::signals::SignalHub;
use crate::validate;

/// One object of one service on one bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectAddress {
    pub bus: String,
    pub service: String,
    pub path: String,
}

impl ObjectAddress {
    pub fn new(bus: impl Into<String>, service: impl Into<String>, path: Option<String>) -> Self {
        Self {
            bus: bus.into(),
            service: service.into(),
            path: path.unwrap_or_else(|| ROOT_PATH.to_string()),
        }
    }
}

fn parse_signature(signature: &str) -> Result<Vec<TypeSpec>> {
    TypeSpec::parse_list(signature)
        .map_err(|e| Error::InvalidParameter(format!("signature '{}': {}", signature, e)))
}

fn parse_single(signature: &str) -> Result<TypeSpec> {
    TypeSpec::parse(signature)
        .map_err(|e| Error::InvalidParameter(format!("signature '{}': {}", signature, e)))
}

pub struct Dispatcher {
    connector: Arc<dyn BusConnector>,
    cache: Arc<IntrospectionCache>,
    signals: SignalHub,
    buses: Vec<BusDescriptor>,
}

impl Dispatcher {
    pub fn new(
        connector: Arc<dyn BusConnector>,
        cache: Arc<IntrospectionCache>,
        signals: SignalHub,
    ) -> Self {
        let buses = connector.list_buses();
        Self {
            connector,
            cache,
            signals,
            buses,
        }
    }

    fn bus(&self, id: &str) -> Result<&BusDescriptor> {
        self.buses
            .iter()
            .find(|b| b.id == id)
            .ok_or_else(|| Error::UnknownBus(id.to_string()))
    }

    /// Validate an address and resolve its bus.
    fn target(&self, address: &ObjectAddress) -> Result<&BusDescriptor> {
        let bus = self.bus(&address.bus)?;
        validate::bus_name(&address.service)?;
        validate::object_path(&address.path)?;
        Ok(bus)
    }

    fn scrub<T>(bus: &BusDescriptor, result: Result<T>) -> Result<T> {
        if bus.sanitize_errors {
            result.map_err(Error::sanitized)
        } else {
            result
        }
    }

    /// Introspection used to refine a call or a write.
    ///
    /// Objects that cannot be introspected leave the request as given, but a
    /// bus that is down or too slow fails the request here.
    async fn declared(&self, address: &ObjectAddress) -> Result<Option<ParsedIntrospection>> {
        match self
            .cache
            .parsed(&address.bus, &address.service, &address.path)
            .await
        {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e @ (Error::Timeout(_) | Error::BusUnavailable(_) | Error::UnknownBus(_))) => Err(e),
            Err(e) => {
                debug!("Introspection of {} {} unavailable: {}", address.service, address.path, e);
                Ok(None)
            }
        }
    }

    async fn interface(&self, address: &ObjectAddress, interface: &str) -> Result<InterfaceDescriptor> {
        validate::interface_name(interface)?;
        let parsed = self
            .cache
            .parsed(&address.bus, &address.service, &address.path)
            .await?;
        parsed
            .interface(interface)
            .cloned()
            .ok_or_else(|| {
                Error::InterfaceNotFound(format!(
                    "{} on {} {}",
                    interface, address.service, address.path
                ))
            })
    }

    pub fn list_buses(&self) -> Vec<BusInfo> {
        self.buses.iter().map(BusDescriptor::info).collect()
    }

    pub fn bus_info(&self, bus: &str) -> Result<BusInfo> {
        self.bus(bus).map(BusDescriptor::info)
    }

    pub async fn list_services(&self, bus: &str) -> Result<Vec<String>> {
        let descriptor = self.bus(bus)?;
        Self::scrub(descriptor, self.connector.list_services(bus).await)
    }

    pub async fn service_info(&self, address: &ObjectAddress) -> Result<ServiceInfo> {
        let bus = self.target(address)?;
        let result = async {
            let owner = self
                .connector
                .get_service_owner(&address.bus, &address.service)
                .await?;
            // Introspecting an unowned name may activate it.
            let parsed = self
                .cache
                .parsed(&address.bus, &address.service, &address.path)
                .await?;
            Ok::<_, Error>(ServiceInfo {
                name: address.service.clone(),
                owner,
                object_path: address.path.clone(),
                interfaces: parsed.interfaces.into_iter().map(|i| i.name).collect(),
                nodes: parsed.nodes,
            })
        }
        .await;
        Self::scrub(bus, result)
    }

    pub async fn introspect(&self, address: &ObjectAddress) -> Result<IntrospectionResult> {
        let bus = self.target(address)?;
        Self::scrub(
            bus,
            self.cache
                .get(&address.bus, &address.service, &address.path)
                .await,
        )
    }

    pub async fn list_interfaces(&self, address: &ObjectAddress) -> Result<Vec<String>> {
        let bus = self.target(address)?;
        let result = self
            .cache
            .parsed(&address.bus, &address.service, &address.path)
            .await
            .map(|parsed| parsed.interfaces.into_iter().map(|i| i.name).collect());
        Self::scrub(bus, result)
    }

    pub async fn interface_info(
        &self,
        address: &ObjectAddress,
        interface: &str,
    ) -> Result<InterfaceDescriptor> {
        let bus = self.target(address)?;
        Self::scrub(bus, self.interface(address, interface).await)
    }

    pub async fn list_methods(
        &self,
        address: &ObjectAddress,
        interface: &str,
    ) -> Result<Vec<MethodDescriptor>> {
        self.interface_info(address, interface)
            .await
            .map(|iface| iface.methods)
    }

    pub async fn list_signals(
        &self,
        address: &ObjectAddress,
        interface: &str,
    ) -> Result<Vec<SignalDescriptor>> {
        self.interface_info(address, interface)
            .await
            .map(|iface| iface.signals)
    }

    /// Invoke a method.
    ///
    /// The input signature is, in order of preference: `signature`, the
    /// introspected one, or inferred from the JSON arguments.
    pub async fn call_method(
        &self,
        address: &ObjectAddress,
        interface: &str,
        method: &str,
        args: Vec<Json>,
        signature: Option<&str>,
    ) -> Result<MethodCallResult> {
        let bus = self.target(address)?;
        validate::interface_name(interface)?;
        validate::member_name(method)?;

        let signature = match signature {
            Some(signature) => Some(parse_signature(signature)?),
            None => Self::scrub(bus, self.declared(address).await)?.and_then(|parsed| {
                parsed
                    .interface(interface)
                    .and_then(|iface| iface.method(method))
                    .map(MethodDescriptor::input_signature)
            }),
        };

        let call = MethodCall {
            service: address.service.clone(),
            path: address.path.clone(),
            interface: interface.to_string(),
            method: method.to_string(),
            args,
            signature,
        };
        debug!(
            "Calling {}.{} on {} {} ({} bus)",
            interface, method, address.service, address.path, address.bus
        );

        let mut result = Self::scrub(bus, self.connector.call_method(&address.bus, &call).await)?;
        if bus.sanitize_errors && !result.success {
            result.error = Some(
                result
                    .error_name
                    .clone()
                    .unwrap_or_else(|| "remote call failed".to_string()),
            );
        }
        Ok(result)
    }

    /// Interface properties with their current values.
    ///
    /// Values are fetched concurrently; a property whose value cannot be
    /// read is listed without one.
    pub async fn list_properties(
        &self,
        address: &ObjectAddress,
        interface: &str,
    ) -> Result<Vec<PropertyDescriptor>> {
        let iface = self.interface_info(address, interface).await?;

        let reads = iface.properties.iter().map(|prop| async move {
            if !prop.access.readable() {
                return None;
            }
            let property = PropertyRef {
                service: address.service.clone(),
                path: address.path.clone(),
                interface: interface.to_string(),
                property: prop.name.clone(),
            };
            match self.connector.get_property(&address.bus, &property).await {
                Ok(value) => Some(value.value),
                Err(e) => {
                    debug!("Reading {}.{} failed: {}", interface, prop.name, e);
                    None
                }
            }
        });
        let values = join_all(reads).await;

        Ok(iface
            .properties
            .into_iter()
            .zip(values)
            .map(|(prop, value)| PropertyDescriptor { value, ..prop })
            .collect())
    }

    pub async fn get_property(
        &self,
        address: &ObjectAddress,
        interface: &str,
        property: &str,
    ) -> Result<PropertyValue> {
        let bus = self.target(address)?;
        validate::interface_name(interface)?;
        validate::member_name(property)?;

        let property = PropertyRef {
            service: address.service.clone(),
            path: address.path.clone(),
            interface: interface.to_string(),
            property: property.to_string(),
        };
        Self::scrub(
            bus,
            self.connector.get_property(&address.bus, &property).await,
        )
    }

    /// Write a property and return its value as read back from the service.
    ///
    /// Properties introspected as read-only are refused before anything is
    /// sent. Write-only properties echo the written value.
    pub async fn set_property(
        &self,
        address: &ObjectAddress,
        interface: &str,
        property: &str,
        value: Json,
        signature: Option<&str>,
    ) -> Result<PropertyValue> {
        let bus = self.target(address)?;
        validate::interface_name(interface)?;
        validate::member_name(property)?;

        let explicit = signature.map(parse_single).transpose()?;
        let declared = Self::scrub(bus, self.declared(address).await)?
            .and_then(|parsed| parsed.interface(interface)?.property(property).cloned());

        if let Some(declared) = &declared {
            if !declared.access.writable() {
                return Err(Error::PropertyNotWritable(format!("{}.{}", interface, property)));
            }
        }
        let type_spec = explicit.or_else(|| declared.as_ref().map(|d| d.type_spec.clone()));

        let target = PropertyRef {
            service: address.service.clone(),
            path: address.path.clone(),
            interface: interface.to_string(),
            property: property.to_string(),
        };
        let result = async {
            self.connector
                .set_property(&address.bus, &target, &value, type_spec.as_ref())
                .await?;

            let readable = declared.as_ref().map_or(true, |d| d.access.readable());
            if readable {
                return self.connector.get_property(&address.bus, &target).await;
            }
            Ok::<_, Error>(PropertyValue {
                name: property.to_string(),
                type_signature: type_spec.map(|t| t.to_string()).unwrap_or_default(),
                value: value.clone(),
                timestamp: chrono::Utc::now(),
            })
        }
        .await;
        Self::scrub(bus, result)
    }

    pub async fn subscribe(
        &self,
        address: &ObjectAddress,
        interface: &str,
        signal: &str,
    ) -> Result<SignalSubscription> {
        let bus = self.target(address)?;
        validate::interface_name(interface)?;
        validate::member_name(signal)?;

        let rule = SignalMatch {
            service: address.service.clone(),
            path: address.path.clone(),
            interface: interface.to_string(),
            signal: signal.to_string(),
        };
        Self::scrub(bus, self.signals.subscribe(&address.bus, rule).await)
    }

    pub async fn list_subscriptions(&self) -> Vec<SignalSubscription> {
        self.signals.list().await
    }

    pub async fn drain_subscription(&self, id: u64) -> Result<Vec<SignalEvent>> {
        self.signals.drain(id).await
    }

    pub async fn unsubscribe(&self, id: u64) -> Result<()> {
        self.signals.unsubscribe(id).await
    }
}
